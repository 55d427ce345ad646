//! Device operations needed by the acceleration structure and SBT builders.
//!
//! The builders never call `ash` directly. They drive an [`AccelDevice`], which
//! the Vulkan backend implements in [`super::vulkan_device`]. Commands are
//! recorded into single-use command buffers that `submit_and_wait` drains
//! synchronously.

use ash::vk;

use crate::vulkan::{Buffer, BufferDesc, RayTracingProperties, Result};

/// Size requirements reported for one structure build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSizes {
    pub acceleration_structure_size: vk::DeviceSize,
    pub build_scratch_size: vk::DeviceSize,
    pub update_scratch_size: vk::DeviceSize,
}

impl From<vk::AccelerationStructureBuildSizesInfoKHR<'_>> for BuildSizes {
    fn from(info: vk::AccelerationStructureBuildSizesInfoKHR<'_>) -> Self {
        Self {
            acceleration_structure_size: info.acceleration_structure_size,
            build_scratch_size: info.build_scratch_size,
            update_scratch_size: info.update_scratch_size,
        }
    }
}

/// A global execution and memory dependency recorded between two commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBarrier {
    pub src_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub dst_access: vk::AccessFlags,
}

impl MemoryBarrier {
    /// A finished build's scratch writes must land before the next build touches the same scratch.
    pub const SCRATCH_REUSE: Self = Self {
        src_stage: vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
        src_access: vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
        dst_stage: vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
        dst_access: vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
    };

    /// The instance upload must be visible before a top-level build reads it.
    pub const INSTANCE_UPLOAD: Self = Self {
        src_stage: vk::PipelineStageFlags::TRANSFER,
        src_access: vk::AccessFlags::TRANSFER_WRITE,
        dst_stage: vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
        dst_access: vk::AccessFlags::from_raw(
            vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR.as_raw()
                | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR.as_raw(),
        ),
    };
}

/// Device operations used by the ray tracing builders.
///
/// Creation calls fail with a [`crate::vulkan::VulkanError`]; `cmd_*` calls
/// only record into a command buffer obtained from `begin_commands` and
/// cannot fail. A command buffer that was begun must be handed to
/// `submit_and_wait`, which blocks until the queue is idle and releases it.
pub trait AccelDevice {
    /// Ray tracing constants of the physical device.
    fn properties(&self) -> RayTracingProperties;

    /// Structure and scratch sizes for a build over the given geometry.
    fn build_sizes(
        &self,
        build_info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        max_primitive_counts: &[u32],
    ) -> BuildSizes;

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<Buffer>;
    fn destroy_buffer(&self, buffer: Buffer);

    /// Copy bytes into the start of a host-visible buffer.
    fn write_buffer(&self, buffer: &Buffer, data: &[u8]) -> Result<()>;

    /// Create a structure object over `size` bytes at the start of `buffer`.
    fn create_acceleration_structure(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        buffer: &Buffer,
        size: vk::DeviceSize,
    ) -> Result<vk::AccelerationStructureKHR>;
    fn acceleration_structure_address(&self, handle: vk::AccelerationStructureKHR) -> vk::DeviceAddress;
    fn destroy_acceleration_structure(&self, handle: vk::AccelerationStructureKHR);

    /// Query pool with one compacted-size slot per structure.
    fn create_compaction_query_pool(&self, count: u32) -> Result<vk::QueryPool>;
    fn destroy_query_pool(&self, pool: vk::QueryPool);

    /// Blocking read of compacted sizes written by `cmd_write_compacted_size`.
    fn compacted_sizes(&self, pool: vk::QueryPool, first: u32, count: u32) -> Result<Vec<vk::DeviceSize>>;

    /// Raw shader group handles of a ray tracing pipeline, in group order.
    fn shader_group_handles(&self, pipeline: vk::Pipeline, group_count: u32, data_size: usize) -> Result<Vec<u8>>;

    fn begin_commands(&self) -> Result<vk::CommandBuffer>;
    fn submit_and_wait(&self, cmd: vk::CommandBuffer) -> Result<()>;

    fn cmd_build_acceleration_structure(
        &self,
        cmd: vk::CommandBuffer,
        build_info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        ranges: &[vk::AccelerationStructureBuildRangeInfoKHR],
    );
    fn cmd_memory_barrier(&self, cmd: vk::CommandBuffer, barrier: MemoryBarrier);
    fn cmd_reset_query_pool(&self, cmd: vk::CommandBuffer, pool: vk::QueryPool, first: u32, count: u32);
    fn cmd_write_compacted_size(
        &self,
        cmd: vk::CommandBuffer,
        structure: vk::AccelerationStructureKHR,
        pool: vk::QueryPool,
        query: u32,
    );
    fn cmd_copy_compact(&self, cmd: vk::CommandBuffer, src: vk::AccelerationStructureKHR, dst: vk::AccelerationStructureKHR);
    fn cmd_copy_buffer(&self, cmd: vk::CommandBuffer, src: &Buffer, dst: &Buffer, size: vk::DeviceSize);
    fn cmd_trace_rays(
        &self,
        cmd: vk::CommandBuffer,
        regions: &[vk::StridedDeviceAddressRegionKHR; 4],
        extent: [u32; 3],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scratch_barrier_orders_build_write_before_build_read() {
        let b = MemoryBarrier::SCRATCH_REUSE;
        assert_eq!(b.src_stage, vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR);
        assert_eq!(b.dst_stage, vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR);
        assert_eq!(b.src_access, vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR);
        assert_eq!(b.dst_access, vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR);
    }

    #[test]
    fn test_instance_upload_barrier_covers_build_access() {
        let b = MemoryBarrier::INSTANCE_UPLOAD;
        assert_eq!(b.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert!(b.dst_access.contains(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR));
        assert!(b.dst_access.contains(vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR));
    }

    #[test]
    fn test_build_sizes_from_vk() {
        let info = vk::AccelerationStructureBuildSizesInfoKHR::default()
            .acceleration_structure_size(4096)
            .build_scratch_size(1024)
            .update_scratch_size(512);
        let sizes = BuildSizes::from(info);
        assert_eq!(sizes.acceleration_structure_size, 4096);
        assert_eq!(sizes.build_scratch_size, 1024);
        assert_eq!(sizes.update_scratch_size, 512);
    }
}
