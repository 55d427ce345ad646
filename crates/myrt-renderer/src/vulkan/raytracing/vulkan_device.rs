//! [`AccelDevice`] implementation on top of `ash`.

use ash::vk;

use super::device::{AccelDevice, BuildSizes, MemoryBarrier};
use crate::vulkan::{Buffer, BufferDesc, CommandManager, MemoryManager, RayTracingProperties, Result, VulkanContext, VulkanError};

/// Forwards builder operations to the Vulkan context, allocator and command pool.
pub struct VulkanAccelDevice<'a> {
    ctx: &'a VulkanContext,
    memory: &'a MemoryManager,
    commands: &'a CommandManager,
}

impl<'a> VulkanAccelDevice<'a> {
    /// # Safety
    /// `memory` and `commands` must have been created from `ctx`, and every
    /// geometry or instance address handed to the builders must point at live
    /// device memory of the same device until the build call returns.
    pub unsafe fn new(ctx: &'a VulkanContext, memory: &'a MemoryManager, commands: &'a CommandManager) -> Self {
        Self { ctx, memory, commands }
    }

    pub fn context(&self) -> &VulkanContext {
        self.ctx
    }
}

impl AccelDevice for VulkanAccelDevice<'_> {
    fn properties(&self) -> RayTracingProperties {
        self.ctx.rt_properties
    }

    fn build_sizes(
        &self,
        build_info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        max_primitive_counts: &[u32],
    ) -> BuildSizes {
        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.ctx.accel_struct_loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                build_info,
                max_primitive_counts,
                &mut size_info,
            );
        }
        size_info.into()
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<Buffer> {
        unsafe { self.memory.create_buffer(desc) }
    }

    fn destroy_buffer(&self, buffer: Buffer) {
        unsafe { self.memory.destroy_buffer(buffer) }
    }

    fn write_buffer(&self, buffer: &Buffer, data: &[u8]) -> Result<()> {
        // The builders only write staging and SBT buffers before the device reads them.
        unsafe { buffer.write_bytes(data) }
    }

    fn create_acceleration_structure(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        buffer: &Buffer,
        size: vk::DeviceSize,
    ) -> Result<vk::AccelerationStructureKHR> {
        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.handle)
            .offset(0)
            .size(size)
            .ty(ty);

        unsafe { self.ctx.accel_struct_loader.create_acceleration_structure(&create_info, None) }
            .map_err(|e| VulkanError::vk("create_acceleration_structure", e))
    }

    fn acceleration_structure_address(&self, handle: vk::AccelerationStructureKHR) -> vk::DeviceAddress {
        let addr_info = vk::AccelerationStructureDeviceAddressInfoKHR::default()
            .acceleration_structure(handle);
        unsafe { self.ctx.accel_struct_loader.get_acceleration_structure_device_address(&addr_info) }
    }

    fn destroy_acceleration_structure(&self, handle: vk::AccelerationStructureKHR) {
        unsafe { self.ctx.accel_struct_loader.destroy_acceleration_structure(handle, None) }
    }

    fn create_compaction_query_pool(&self, count: u32) -> Result<vk::QueryPool> {
        let create_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR)
            .query_count(count);

        unsafe { self.ctx.device.create_query_pool(&create_info, None) }
            .map_err(|e| VulkanError::vk("create_query_pool", e))
    }

    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        unsafe { self.ctx.device.destroy_query_pool(pool, None) }
    }

    fn compacted_sizes(&self, pool: vk::QueryPool, first: u32, count: u32) -> Result<Vec<vk::DeviceSize>> {
        let mut sizes = vec![0 as vk::DeviceSize; count as usize];
        unsafe {
            self.ctx.device.get_query_pool_results(
                pool,
                first,
                &mut sizes,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )
        }
        .map_err(VulkanError::CompactedSizeQuery)?;
        Ok(sizes)
    }

    fn shader_group_handles(&self, pipeline: vk::Pipeline, group_count: u32, data_size: usize) -> Result<Vec<u8>> {
        unsafe {
            self.ctx.rt_pipeline_loader.get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                group_count,
                data_size,
            )
        }
        .map_err(|e| VulkanError::vk("get_ray_tracing_shader_group_handles", e))
    }

    fn begin_commands(&self) -> Result<vk::CommandBuffer> {
        unsafe { self.commands.begin_single_time() }
    }

    fn submit_and_wait(&self, cmd: vk::CommandBuffer) -> Result<()> {
        unsafe { self.commands.end_single_time(cmd) }
    }

    fn cmd_build_acceleration_structure(
        &self,
        cmd: vk::CommandBuffer,
        build_info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        ranges: &[vk::AccelerationStructureBuildRangeInfoKHR],
    ) {
        unsafe {
            self.ctx.accel_struct_loader.cmd_build_acceleration_structures(
                cmd,
                std::slice::from_ref(build_info),
                &[ranges],
            );
        }
    }

    fn cmd_memory_barrier(&self, cmd: vk::CommandBuffer, barrier: MemoryBarrier) {
        unsafe {
            self.commands.memory_barrier(
                cmd,
                barrier.src_stage,
                barrier.src_access,
                barrier.dst_stage,
                barrier.dst_access,
            );
        }
    }

    fn cmd_reset_query_pool(&self, cmd: vk::CommandBuffer, pool: vk::QueryPool, first: u32, count: u32) {
        unsafe { self.ctx.device.cmd_reset_query_pool(cmd, pool, first, count) }
    }

    fn cmd_write_compacted_size(
        &self,
        cmd: vk::CommandBuffer,
        structure: vk::AccelerationStructureKHR,
        pool: vk::QueryPool,
        query: u32,
    ) {
        unsafe {
            self.ctx.accel_struct_loader.cmd_write_acceleration_structures_properties(
                cmd,
                &[structure],
                vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                pool,
                query,
            );
        }
    }

    fn cmd_copy_compact(&self, cmd: vk::CommandBuffer, src: vk::AccelerationStructureKHR, dst: vk::AccelerationStructureKHR) {
        let copy_info = vk::CopyAccelerationStructureInfoKHR::default()
            .src(src)
            .dst(dst)
            .mode(vk::CopyAccelerationStructureModeKHR::COMPACT);

        unsafe { self.ctx.accel_struct_loader.cmd_copy_acceleration_structure(cmd, &copy_info) }
    }

    fn cmd_copy_buffer(&self, cmd: vk::CommandBuffer, src: &Buffer, dst: &Buffer, size: vk::DeviceSize) {
        unsafe { self.commands.copy_buffer(cmd, src.handle, dst.handle, size) }
    }

    fn cmd_trace_rays(
        &self,
        cmd: vk::CommandBuffer,
        regions: &[vk::StridedDeviceAddressRegionKHR; 4],
        extent: [u32; 3],
    ) {
        unsafe {
            self.ctx.rt_pipeline_loader.cmd_trace_rays(
                cmd,
                &regions[0],
                &regions[1],
                &regions[2],
                &regions[3],
                extent[0],
                extent[1],
                extent[2],
            );
        }
    }
}
