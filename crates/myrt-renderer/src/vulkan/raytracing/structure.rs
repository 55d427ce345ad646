//! Acceleration structure objects and their backing buffers.

use ash::vk;
use gpu_allocator::MemoryLocation;

use super::device::AccelDevice;
use crate::vulkan::{Buffer, BufferDesc, Result};

/// A built acceleration structure together with the buffer that stores it.
///
/// The handle is only valid while `buffer` is alive. There is no `Drop` impl:
/// structures are torn down explicitly with [`AccelerationStructure::destroy`],
/// which frees the structure object before its buffer.
#[derive(Debug)]
pub struct AccelerationStructure {
    pub handle: vk::AccelerationStructureKHR,
    pub buffer: Buffer,
    pub device_address: vk::DeviceAddress,
    pub ty: vk::AccelerationStructureTypeKHR,
    /// Size in bytes of the structure inside `buffer`.
    pub size: vk::DeviceSize,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    /// Triangles for a bottom-level structure, instances for a top-level one.
    pub primitive_count: u32,
}

impl AccelerationStructure {
    /// Allocate a buffer of exactly `size` bytes and create a structure object over it.
    pub fn create<D: AccelDevice + ?Sized>(
        device: &D,
        ty: vk::AccelerationStructureTypeKHR,
        size: vk::DeviceSize,
        flags: vk::BuildAccelerationStructureFlagsKHR,
        primitive_count: u32,
        name: &str,
    ) -> Result<Self> {
        let buffer = device.create_buffer(&BufferDesc::new(
            size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR |
            vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            name,
        ))?;

        let handle = match device.create_acceleration_structure(ty, &buffer, size) {
            Ok(handle) => handle,
            Err(e) => {
                device.destroy_buffer(buffer);
                return Err(e);
            }
        };

        let device_address = device.acceleration_structure_address(handle);

        Ok(Self {
            handle,
            buffer,
            device_address,
            ty,
            size,
            flags,
            primitive_count,
        })
    }

    pub fn is_top_level(&self) -> bool {
        self.ty == vk::AccelerationStructureTypeKHR::TOP_LEVEL
    }

    pub fn allows_update(&self) -> bool {
        self.flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE)
    }

    /// Destroy the structure object, then the buffer backing it.
    pub fn destroy<D: AccelDevice + ?Sized>(self, device: &D) {
        device.destroy_acceleration_structure(self.handle);
        device.destroy_buffer(self.buffer);
    }
}

/// Destroy every structure in `structures`, in order.
pub(crate) fn destroy_all<D: AccelDevice + ?Sized>(device: &D, structures: Vec<AccelerationStructure>) {
    for structure in structures {
        structure.destroy(device);
    }
}
