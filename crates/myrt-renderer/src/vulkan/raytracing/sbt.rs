//! Shader Binding Table (SBT) layout and upload.
//!
//! The table holds four regions, raygen, miss, hit and callable, in that
//! order. Every region starts on the pipeline's base alignment and every
//! record inside a region is padded to the handle alignment. The raygen region
//! holds exactly one record and its size equals its stride, which is what the
//! dispatch call expects.
//!
//! Handles must be queried in pipeline group order: raygen, then all miss
//! groups, then all hit groups, then all callable groups. A mismatch makes the
//! dispatch run the wrong shaders without any error.

use ash::vk;
use gpu_allocator::MemoryLocation;

use super::device::AccelDevice;
use crate::vulkan::{Buffer, BufferDesc, RayTracingProperties, Result, VulkanError};

/// Round `value` up to a multiple of `alignment`, which must be a power of two.
///
/// The result must be representable: `value <= u64::MAX - alignment + 1`.
/// Use [`checked_align_up`] for values that may come closer to `u64::MAX`.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    match value & (alignment - 1) {
        0 => value,
        rem => value - rem + alignment,
    }
}

/// [`align_up`] that returns `None` instead of overflowing, or when
/// `alignment` is not a power of two.
pub fn checked_align_up(value: u64, alignment: u64) -> Option<u64> {
    if !alignment.is_power_of_two() {
        return None;
    }
    match value & (alignment - 1) {
        0 => Some(value),
        rem => (value - rem).checked_add(alignment),
    }
}

/// Number of shader groups of each class in a ray tracing pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupCounts {
    pub raygen: u32,
    pub miss: u32,
    pub hit: u32,
    pub callable: u32,
}

impl GroupCounts {
    /// One raygen group plus the given miss, hit and callable groups.
    pub fn new(miss: u32, hit: u32, callable: u32) -> Self {
        Self {
            raygen: 1,
            miss,
            hit,
            callable,
        }
    }

    pub fn total(&self) -> u32 {
        self.raygen + self.miss + self.hit + self.callable
    }
}

/// Placement of one region inside the table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SbtRegionLayout {
    /// Byte offset of the region from the start of the table.
    pub offset: vk::DeviceSize,
    pub stride: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub count: u32,
}

impl SbtRegionLayout {
    fn device_region(&self, base: vk::DeviceAddress) -> vk::StridedDeviceAddressRegionKHR {
        vk::StridedDeviceAddressRegionKHR::default()
            .device_address(base + self.offset)
            .stride(self.stride)
            .size(self.size)
    }
}

/// Region layout computed from device constants and group counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    pub handle_size: u32,
    pub handle_size_aligned: vk::DeviceSize,
    pub raygen: SbtRegionLayout,
    pub miss: SbtRegionLayout,
    pub hit: SbtRegionLayout,
    pub callable: SbtRegionLayout,
    pub total_size: vk::DeviceSize,
}

fn check_power_of_two(name: &'static str, value: u32) -> Result<()> {
    if value.is_power_of_two() {
        Ok(())
    } else {
        Err(VulkanError::InvalidAlignment { name, value })
    }
}

impl SbtLayout {
    pub fn new(props: &RayTracingProperties, counts: GroupCounts) -> Result<Self> {
        if props.shader_group_handle_size == 0 {
            return Err(VulkanError::InvalidAlignment {
                name: "shader_group_handle_size",
                value: 0,
            });
        }
        check_power_of_two("shader_group_handle_alignment", props.shader_group_handle_alignment)?;
        check_power_of_two("shader_group_base_alignment", props.shader_group_base_alignment)?;
        if counts.raygen != 1 {
            return Err(VulkanError::InvalidGroupCounts("exactly one raygen group is dispatched"));
        }

        let base_alignment = props.shader_group_base_alignment as vk::DeviceSize;
        let handle_size_aligned = align_up(
            props.shader_group_handle_size as vk::DeviceSize,
            props.shader_group_handle_alignment as vk::DeviceSize,
        );

        let raygen_size = align_up(handle_size_aligned, base_alignment);
        let raygen = SbtRegionLayout {
            offset: 0,
            stride: raygen_size,
            size: raygen_size,
            count: 1,
        };

        let region = |offset: vk::DeviceSize, count: u32| {
            if count == 0 {
                return SbtRegionLayout { offset, ..SbtRegionLayout::default() };
            }
            SbtRegionLayout {
                offset,
                stride: handle_size_aligned,
                size: align_up(count as vk::DeviceSize * handle_size_aligned, base_alignment),
                count,
            }
        };

        let miss = region(raygen.offset + raygen.size, counts.miss);
        let hit = region(miss.offset + miss.size, counts.hit);
        let callable = region(hit.offset + hit.size, counts.callable);

        Ok(Self {
            handle_size: props.shader_group_handle_size,
            handle_size_aligned,
            raygen,
            miss,
            hit,
            callable,
            total_size: raygen.size + miss.size + hit.size + callable.size,
        })
    }

    /// Regions in dispatch order: raygen, miss, hit, callable.
    pub fn regions(&self) -> [SbtRegionLayout; 4] {
        [self.raygen, self.miss, self.hit, self.callable]
    }

    pub fn group_count(&self) -> u32 {
        self.regions().iter().map(|r| r.count).sum()
    }

    /// Lay out `handle_data` into the bytes of the table.
    pub fn fill(&self, handle_data: &[u8]) -> Result<Vec<u8>> {
        let handle_size = self.handle_size as usize;
        let expected = self.group_count() as usize * handle_size;
        if handle_data.len() < expected {
            return Err(VulkanError::HandleDataTooShort {
                expected,
                actual: handle_data.len(),
            });
        }

        let mut table = vec![0u8; self.total_size as usize];
        let mut handles = handle_data.chunks_exact(handle_size);
        for region in self.regions() {
            for slot in 0..region.count as u64 {
                // Length was checked above.
                let Some(handle) = handles.next() else { break };
                let start = (region.offset + slot * region.stride) as usize;
                table[start..start + handle_size].copy_from_slice(handle);
            }
        }
        Ok(table)
    }

    pub fn to_device_regions(&self, base: vk::DeviceAddress) -> [vk::StridedDeviceAddressRegionKHR; 4] {
        self.regions().map(|r| r.device_region(base))
    }
}

/// A filled shader binding table and the regions handed to the dispatch call.
pub struct ShaderBindingTable {
    pub buffer: Buffer,
    pub layout: SbtLayout,
    regions: [vk::StridedDeviceAddressRegionKHR; 4],
}

impl ShaderBindingTable {
    /// Query the group handles of `pipeline` and build its table.
    pub fn from_pipeline<D: AccelDevice + ?Sized>(
        device: &D,
        pipeline: vk::Pipeline,
        counts: GroupCounts,
    ) -> Result<Self> {
        let props = device.properties();
        // Validate before asking the device for handles.
        SbtLayout::new(&props, counts)?;

        let data_size = counts.total() as usize * props.shader_group_handle_size as usize;
        let handles = device.shader_group_handles(pipeline, counts.total(), data_size)?;
        Self::layout_and_fill(device, &handles, &props, counts)
    }

    /// Lay out `handle_data` and upload it into a new host-visible buffer.
    pub fn layout_and_fill<D: AccelDevice + ?Sized>(
        device: &D,
        handle_data: &[u8],
        props: &RayTracingProperties,
        counts: GroupCounts,
    ) -> Result<Self> {
        let layout = SbtLayout::new(props, counts)?;
        let table = layout.fill(handle_data)?;

        let buffer = device.create_buffer(
            &BufferDesc::new(
                layout.total_size,
                vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                MemoryLocation::CpuToGpu,
                "shader_binding_table",
            )
            .with_alignment(props.shader_group_base_alignment as vk::DeviceSize),
        )?;

        let base = match buffer.address("shader binding table")
            .and_then(|base| device.write_buffer(&buffer, &table).map(|_| base))
        {
            Ok(base) => base,
            Err(e) => {
                device.destroy_buffer(buffer);
                return Err(e);
            }
        };

        tracing::debug!(
            "SBT: {} groups, {} bytes (raygen {}, miss {}, hit {}, callable {})",
            layout.group_count(),
            layout.total_size,
            layout.raygen.size,
            layout.miss.size,
            layout.hit.size,
            layout.callable.size,
        );

        Ok(Self {
            buffer,
            regions: layout.to_device_regions(base),
            layout,
        })
    }

    pub fn raygen_region(&self) -> vk::StridedDeviceAddressRegionKHR {
        self.regions[0]
    }

    pub fn miss_region(&self) -> vk::StridedDeviceAddressRegionKHR {
        self.regions[1]
    }

    pub fn hit_region(&self) -> vk::StridedDeviceAddressRegionKHR {
        self.regions[2]
    }

    pub fn callable_region(&self) -> vk::StridedDeviceAddressRegionKHR {
        self.regions[3]
    }

    pub fn regions(&self) -> &[vk::StridedDeviceAddressRegionKHR; 4] {
        &self.regions
    }

    /// Record a trace rays command over a `width` x `height` x `depth` grid.
    pub fn trace_rays<D: AccelDevice + ?Sized>(
        &self,
        device: &D,
        cmd: vk::CommandBuffer,
        width: u32,
        height: u32,
        depth: u32,
    ) {
        device.cmd_trace_rays(cmd, &self.regions, [width, height, depth]);
    }

    pub fn destroy<D: AccelDevice + ?Sized>(self, device: &D) {
        device.destroy_buffer(self.buffer);
    }
}
