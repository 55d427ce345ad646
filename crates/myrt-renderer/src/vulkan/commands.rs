//! Single-use command buffers for load-time GPU work.
//!
//! Acceleration structure builds are recorded into short-lived command buffers
//! which are submitted and waited on before the caller continues. There is no
//! fence tracking across frames: the queue is drained after every submission.

use ash::vk;

use super::{Result, VulkanContext, VulkanError};

/// Command pool manager for one-shot submissions on the context's queue.
pub struct CommandManager {
    transient_pool: vk::CommandPool,
    queue: vk::Queue,
    queue_family: u32,
    device: ash::Device,
}

impl CommandManager {
    /// Create a new command manager.
    pub unsafe fn new(ctx: &VulkanContext) -> Result<Self> {
        let queue_family = ctx.queue_families.compute
            .ok_or(VulkanError::Unsupported("compute queue family"))?;

        // Create transient pool for one-shot commands
        let transient_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let transient_pool = ctx.device.create_command_pool(&transient_info, None)
            .map_err(|e| VulkanError::vk("create_command_pool", e))?;

        Ok(Self {
            transient_pool,
            queue: ctx.queue,
            queue_family,
            device: ctx.device.clone(),
        })
    }

    /// Queue family the pool allocates from.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Begin a single-use command buffer.
    pub unsafe fn begin_single_time(&self) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.transient_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let cmd = self.device.allocate_command_buffers(&alloc_info)
            .map_err(|e| VulkanError::vk("allocate_command_buffers", e))?[0];

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        if let Err(e) = self.device.begin_command_buffer(cmd, &begin_info) {
            self.device.free_command_buffers(self.transient_pool, &[cmd]);
            return Err(VulkanError::vk("begin_command_buffer", e));
        }

        Ok(cmd)
    }

    /// End and submit a single-use command buffer, blocking until the queue is idle.
    ///
    /// The command buffer is freed whether or not the submission succeeds.
    pub unsafe fn end_single_time(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let result = self.submit_and_wait(cmd);
        self.device.free_command_buffers(self.transient_pool, &[cmd]);
        result
    }

    unsafe fn submit_and_wait(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.device.end_command_buffer(cmd)
            .map_err(|e| VulkanError::vk("end_command_buffer", e))?;

        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(&command_buffers);

        self.device.queue_submit(self.queue, &[submit_info], vk::Fence::null())
            .map_err(|e| VulkanError::vk("queue_submit", e))?;

        self.device.queue_wait_idle(self.queue)
            .map_err(|e| VulkanError::vk("queue_wait_idle", e))
    }

    /// Record a global memory barrier.
    pub unsafe fn memory_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_stage: vk::PipelineStageFlags,
        dst_access: vk::AccessFlags,
    ) {
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access);

        self.device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
    }

    /// Copy the first `size` bytes of one buffer into another.
    pub unsafe fn copy_buffer(&self, cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, size: vk::DeviceSize) {
        let region = vk::BufferCopy::default()
            .src_offset(0)
            .dst_offset(0)
            .size(size);

        self.device.cmd_copy_buffer(cmd, src, dst, &[region]);
    }

    /// Destroy the command pool.
    pub unsafe fn destroy(&mut self) {
        self.device.destroy_command_pool(self.transient_pool, None);
        self.transient_pool = vk::CommandPool::null();
    }
}
