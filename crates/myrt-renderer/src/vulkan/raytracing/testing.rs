//! In-memory [`AccelDevice`] that records every call, for builder unit tests.

use ash::vk;
use ash::vk::Handle;
use std::cell::RefCell;
use std::collections::HashMap;

use super::device::{AccelDevice, BuildSizes, MemoryBarrier};
use crate::vulkan::{Buffer, BufferDesc, RayTracingProperties, Result, VulkanError};

const BUFFER_ADDRESS_BASE: vk::DeviceAddress = 0x1_0000_0000;
const BUFFER_ADDRESS_STEP: vk::DeviceAddress = 0x10_0000;

/// Structure size the device reports for a bottom-level build over `primitives` triangles.
pub fn blas_size(primitives: u32) -> vk::DeviceSize {
    align256(4096 + 64 * primitives as u64)
}

/// Scratch size the device reports for a bottom-level build over `primitives` triangles.
pub fn blas_scratch_size(primitives: u32) -> vk::DeviceSize {
    align256(2048 + 32 * primitives as u64)
}

/// Structure size the device reports for a top-level build over `instances` instances.
pub fn tlas_size(instances: u32) -> vk::DeviceSize {
    align256(1024 + 128 * instances as u64)
}

pub fn tlas_scratch_size(instances: u32) -> vk::DeviceSize {
    align256(1024 + 64 * instances as u64)
}

pub fn tlas_update_scratch_size(instances: u32) -> vk::DeviceSize {
    align256(512 + 16 * instances as u64)
}

/// Compacted size reported for a structure of `size` bytes.
pub fn compacted_size(size: vk::DeviceSize) -> vk::DeviceSize {
    align256(size / 2)
}

fn align256(value: u64) -> u64 {
    (value + 255) & !255
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    CreateBuffer { buffer: u64, size: vk::DeviceSize, usage: vk::BufferUsageFlags, name: String },
    DestroyBuffer(u64),
    WriteBuffer { buffer: u64, len: usize },
    CreateStructure { structure: u64, ty: vk::AccelerationStructureTypeKHR, size: vk::DeviceSize, buffer: u64 },
    DestroyStructure(u64),
    CreateQueryPool { pool: u64, count: u32 },
    DestroyQueryPool(u64),
    ReadCompactedSizes { first: u32, count: u32 },
    Begin(u64),
    Submit(u64),
    Build {
        ty: vk::AccelerationStructureTypeKHR,
        mode: vk::BuildAccelerationStructureModeKHR,
        flags: vk::BuildAccelerationStructureFlagsKHR,
        src: u64,
        dst: u64,
        scratch: vk::DeviceAddress,
        geometry_count: u32,
        primitive_count: u32,
    },
    Barrier(MemoryBarrier),
    ResetQueries { first: u32, count: u32 },
    WriteCompactedSize { structure: u64, query: u32 },
    CopyCompact { src: u64, dst: u64 },
    CopyBuffer { src: u64, dst: u64, size: vk::DeviceSize },
    TraceRays { regions: [(vk::DeviceAddress, vk::DeviceSize, vk::DeviceSize); 4], extent: [u32; 3] },
}

#[derive(Default)]
struct State {
    next_id: u64,
    events: Vec<Event>,
    live_buffers: HashMap<u64, vk::DeviceAddress>,
    contents: HashMap<u64, Vec<u8>>,
    live_structures: HashMap<u64, (vk::DeviceSize, vk::DeviceAddress)>,
    structures_created: usize,
    fail_structure_at: Option<usize>,
    fail_compacted_query: bool,
    submits: usize,
    fail_submit_at: Option<usize>,
}

/// Records device calls and hands out fake handles and addresses.
pub struct RecordingDevice {
    props: RayTracingProperties,
    state: RefCell<State>,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::with_properties(RayTracingProperties::default())
    }

    pub fn with_properties(props: RayTracingProperties) -> Self {
        Self {
            props,
            state: RefCell::new(State {
                next_id: 1,
                ..State::default()
            }),
        }
    }

    fn next_id(&self) -> u64 {
        let mut state = self.state.borrow_mut();
        let id = state.next_id;
        state.next_id += 1;
        id
    }

    fn record(&self, event: Event) {
        self.state.borrow_mut().events.push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.borrow().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.borrow_mut().events.clear();
    }

    pub fn live_buffers(&self) -> usize {
        self.state.borrow().live_buffers.len()
    }

    pub fn live_structures(&self) -> usize {
        self.state.borrow().live_structures.len()
    }

    /// Bytes last written to a buffer.
    pub fn contents(&self, buffer: &Buffer) -> Vec<u8> {
        self.written(buffer.handle.as_raw())
    }

    /// Bytes last written to the buffer with raw handle `id`, even after it was destroyed.
    pub fn written(&self, id: u64) -> Vec<u8> {
        self.state.borrow().contents.get(&id).cloned().unwrap_or_default()
    }

    /// Fail the `n`th (zero based) structure creation from now on.
    pub fn fail_structure_creation_at(&self, n: usize) {
        let mut state = self.state.borrow_mut();
        state.fail_structure_at = Some(state.structures_created + n);
    }

    /// Fail the `n`th (zero based) submission from now on.
    pub fn fail_submit_at(&self, n: usize) {
        let mut state = self.state.borrow_mut();
        state.fail_submit_at = Some(state.submits + n);
    }

    pub fn fail_compacted_query(&self) {
        self.state.borrow_mut().fail_compacted_query = true;
    }

    pub fn count(&self, matches: impl Fn(&Event) -> bool) -> usize {
        self.state.borrow().events.iter().filter(|e| matches(e)).count()
    }

    /// Handle blob where every byte of group `g` is `0xA0 + g`.
    pub fn handle_blob(&self, group_count: u32) -> Vec<u8> {
        let handle_size = self.props.shader_group_handle_size as usize;
        (0..group_count)
            .flat_map(|g| std::iter::repeat(0xA0u8.wrapping_add(g as u8)).take(handle_size))
            .collect()
    }
}

impl AccelDevice for RecordingDevice {
    fn properties(&self) -> RayTracingProperties {
        self.props
    }

    fn build_sizes(
        &self,
        build_info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        max_primitive_counts: &[u32],
    ) -> BuildSizes {
        let primitives: u32 = max_primitive_counts.iter().sum();
        if build_info.ty == vk::AccelerationStructureTypeKHR::TOP_LEVEL {
            BuildSizes {
                acceleration_structure_size: tlas_size(primitives),
                build_scratch_size: tlas_scratch_size(primitives),
                update_scratch_size: tlas_update_scratch_size(primitives),
            }
        } else {
            BuildSizes {
                acceleration_structure_size: blas_size(primitives),
                build_scratch_size: blas_scratch_size(primitives),
                update_scratch_size: blas_scratch_size(primitives) / 2,
            }
        }
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<Buffer> {
        let id = self.next_id();
        let address = BUFFER_ADDRESS_BASE + id * BUFFER_ADDRESS_STEP;
        assert_eq!(address % desc.alignment, 0);
        assert!(desc.size > 0, "zero sized buffer {}", desc.name);

        self.state.borrow_mut().live_buffers.insert(id, address);
        self.record(Event::CreateBuffer {
            buffer: id,
            size: desc.size,
            usage: desc.usage,
            name: desc.name.to_string(),
        });

        Ok(Buffer {
            handle: vk::Buffer::from_raw(id),
            allocation: None,
            size: desc.size,
            usage: desc.usage,
            device_address: desc.usage
                .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
                .then_some(address),
        })
    }

    fn destroy_buffer(&self, buffer: Buffer) {
        let id = buffer.handle.as_raw();
        let removed = self.state.borrow_mut().live_buffers.remove(&id);
        assert!(removed.is_some(), "buffer {} destroyed twice", id);
        self.record(Event::DestroyBuffer(id));
    }

    fn write_buffer(&self, buffer: &Buffer, data: &[u8]) -> Result<()> {
        let id = buffer.handle.as_raw();
        if data.len() as vk::DeviceSize > buffer.size {
            return Err(VulkanError::BufferOverflow { size: buffer.size, len: data.len() });
        }
        self.state.borrow_mut().contents.insert(id, data.to_vec());
        self.record(Event::WriteBuffer { buffer: id, len: data.len() });
        Ok(())
    }

    fn create_acceleration_structure(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        buffer: &Buffer,
        size: vk::DeviceSize,
    ) -> Result<vk::AccelerationStructureKHR> {
        {
            let mut state = self.state.borrow_mut();
            let index = state.structures_created;
            state.structures_created += 1;
            if state.fail_structure_at == Some(index) {
                return Err(VulkanError::vk("create_acceleration_structure", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
            }
        }

        assert!(size <= buffer.size);
        let id = self.next_id();
        let address = buffer.device_address.expect("structure buffer without device address");
        self.state.borrow_mut().live_structures.insert(id, (size, address));
        self.record(Event::CreateStructure {
            structure: id,
            ty,
            size,
            buffer: buffer.handle.as_raw(),
        });
        Ok(vk::AccelerationStructureKHR::from_raw(id))
    }

    fn acceleration_structure_address(&self, handle: vk::AccelerationStructureKHR) -> vk::DeviceAddress {
        self.state.borrow().live_structures[&handle.as_raw()].1
    }

    fn destroy_acceleration_structure(&self, handle: vk::AccelerationStructureKHR) {
        let id = handle.as_raw();
        let removed = self.state.borrow_mut().live_structures.remove(&id);
        assert!(removed.is_some(), "structure {} destroyed twice", id);
        self.record(Event::DestroyStructure(id));
    }

    fn create_compaction_query_pool(&self, count: u32) -> Result<vk::QueryPool> {
        let id = self.next_id();
        self.record(Event::CreateQueryPool { pool: id, count });
        Ok(vk::QueryPool::from_raw(id))
    }

    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        self.record(Event::DestroyQueryPool(pool.as_raw()));
    }

    fn compacted_sizes(&self, _pool: vk::QueryPool, first: u32, count: u32) -> Result<Vec<vk::DeviceSize>> {
        self.record(Event::ReadCompactedSizes { first, count });
        if self.state.borrow().fail_compacted_query {
            return Err(VulkanError::CompactedSizeQuery(vk::Result::ERROR_DEVICE_LOST));
        }

        // Answer from the structures the queries were written for.
        let state = self.state.borrow();
        let mut written: Vec<(u32, u64)> = state.events.iter()
            .filter_map(|e| match e {
                Event::WriteCompactedSize { structure, query } => Some((*query, *structure)),
                _ => None,
            })
            .collect();
        written.sort();

        Ok((first..first + count)
            .map(|query| {
                let structure = written.iter().rev()
                    .find(|(q, _)| *q == query)
                    .map(|(_, s)| *s)
                    .expect("compacted size read before it was written");
                compacted_size(state.live_structures[&structure].0)
            })
            .collect())
    }

    fn shader_group_handles(&self, _pipeline: vk::Pipeline, group_count: u32, data_size: usize) -> Result<Vec<u8>> {
        let blob = self.handle_blob(group_count);
        assert_eq!(blob.len(), data_size);
        Ok(blob)
    }

    fn begin_commands(&self) -> Result<vk::CommandBuffer> {
        let id = self.next_id();
        self.record(Event::Begin(id));
        Ok(vk::CommandBuffer::from_raw(id))
    }

    fn submit_and_wait(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let fail = {
            let mut state = self.state.borrow_mut();
            let index = state.submits;
            state.submits += 1;
            state.fail_submit_at == Some(index)
        };
        if fail {
            return Err(VulkanError::vk("queue_submit", vk::Result::ERROR_DEVICE_LOST));
        }
        self.record(Event::Submit(cmd.as_raw()));
        Ok(())
    }

    fn cmd_build_acceleration_structure(
        &self,
        _cmd: vk::CommandBuffer,
        build_info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        ranges: &[vk::AccelerationStructureBuildRangeInfoKHR],
    ) {
        assert_eq!(build_info.geometry_count as usize, ranges.len());
        self.record(Event::Build {
            ty: build_info.ty,
            mode: build_info.mode,
            flags: build_info.flags,
            src: build_info.src_acceleration_structure.as_raw(),
            dst: build_info.dst_acceleration_structure.as_raw(),
            scratch: unsafe { build_info.scratch_data.device_address },
            geometry_count: build_info.geometry_count,
            primitive_count: ranges.iter().map(|r| r.primitive_count).sum(),
        });
    }

    fn cmd_memory_barrier(&self, _cmd: vk::CommandBuffer, barrier: MemoryBarrier) {
        self.record(Event::Barrier(barrier));
    }

    fn cmd_reset_query_pool(&self, _cmd: vk::CommandBuffer, _pool: vk::QueryPool, first: u32, count: u32) {
        self.record(Event::ResetQueries { first, count });
    }

    fn cmd_write_compacted_size(
        &self,
        _cmd: vk::CommandBuffer,
        structure: vk::AccelerationStructureKHR,
        _pool: vk::QueryPool,
        query: u32,
    ) {
        self.record(Event::WriteCompactedSize { structure: structure.as_raw(), query });
    }

    fn cmd_copy_compact(&self, _cmd: vk::CommandBuffer, src: vk::AccelerationStructureKHR, dst: vk::AccelerationStructureKHR) {
        self.record(Event::CopyCompact { src: src.as_raw(), dst: dst.as_raw() });
    }

    fn cmd_copy_buffer(&self, _cmd: vk::CommandBuffer, src: &Buffer, dst: &Buffer, size: vk::DeviceSize) {
        self.record(Event::CopyBuffer { src: src.handle.as_raw(), dst: dst.handle.as_raw(), size });
    }

    fn cmd_trace_rays(
        &self,
        _cmd: vk::CommandBuffer,
        regions: &[vk::StridedDeviceAddressRegionKHR; 4],
        extent: [u32; 3],
    ) {
        self.record(Event::TraceRays {
            regions: regions.map(|r| (r.device_address, r.stride, r.size)),
            extent,
        });
    }
}
