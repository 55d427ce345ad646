//! GPU memory management using gpu-allocator.

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc, Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::sync::Arc;

use super::{Result, VulkanContext, VulkanError};

/// GPU buffer with associated memory.
pub struct Buffer {
    pub handle: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub device_address: Option<vk::DeviceAddress>,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .field("device_address", &self.device_address)
            .finish()
    }
}

impl Buffer {
    /// Pointer to the persistently mapped memory, if the buffer is host visible.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation.as_ref().and_then(|a| a.mapped_ptr()).map(|p| p.as_ptr() as *mut u8)
    }

    /// Device address of the buffer, or an error naming the buffer's role.
    pub fn address(&self, what: &'static str) -> Result<vk::DeviceAddress> {
        self.device_address.ok_or(VulkanError::MissingDeviceAddress(what))
    }

    /// Copy bytes into the start of a host-visible buffer.
    ///
    /// # Safety
    /// The device must not be reading the buffer while it is written.
    pub unsafe fn write_bytes(&self, data: &[u8]) -> Result<()> {
        if data.len() as vk::DeviceSize > self.size {
            return Err(VulkanError::BufferOverflow { size: self.size, len: data.len() });
        }
        let ptr = self.mapped_ptr().ok_or(VulkanError::NotHostVisible("buffer"))?;
        std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
        Ok(())
    }
}

/// Parameters for [`MemoryManager::create_buffer`].
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc<'a> {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    /// Minimum alignment of the allocation on top of the driver's requirement.
    pub alignment: vk::DeviceSize,
    pub name: &'a str,
}

impl<'a> BufferDesc<'a> {
    pub fn new(size: vk::DeviceSize, usage: vk::BufferUsageFlags, location: MemoryLocation, name: &'a str) -> Self {
        Self {
            size,
            usage,
            location,
            alignment: 1,
            name,
        }
    }

    pub fn with_alignment(mut self, alignment: vk::DeviceSize) -> Self {
        self.alignment = alignment.max(1);
        self
    }
}

/// Memory manager wrapping gpu-allocator.
pub struct MemoryManager {
    allocator: Arc<Mutex<Allocator>>,
    device: ash::Device,
}

impl MemoryManager {
    /// Create a new memory manager.
    pub unsafe fn new(ctx: &VulkanContext) -> Result<Self> {
        let mut debug_settings = gpu_allocator::AllocatorDebugSettings::default();
        debug_settings.log_memory_information = cfg!(debug_assertions);
        debug_settings.log_leaks_on_shutdown = true;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: ctx.instance.clone(),
            device: ctx.device.clone(),
            physical_device: ctx.physical_device,
            debug_settings,
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })?;

        Ok(Self {
            allocator: Arc::new(Mutex::new(allocator)),
            device: ctx.device.clone(),
        })
    }

    /// Create a buffer with the specified usage, memory location and alignment.
    pub unsafe fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<Buffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = self.device.create_buffer(&buffer_info, None)
            .map_err(|e| VulkanError::vk("create_buffer", e))?;

        let mut requirements = self.device.get_buffer_memory_requirements(handle);
        requirements.alignment = requirements.alignment.max(desc.alignment);

        let allocation = match self.allocator.lock().allocate(&AllocationCreateDesc {
            name: desc.name,
            requirements,
            location: desc.location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                self.device.destroy_buffer(handle, None);
                return Err(e.into());
            }
        };

        if let Err(e) = self.device.bind_buffer_memory(handle, allocation.memory(), allocation.offset()) {
            self.device.destroy_buffer(handle, None);
            if let Err(free_err) = self.allocator.lock().free(allocation) {
                tracing::warn!("failed to free allocation of unbound buffer: {}", free_err);
            }
            return Err(VulkanError::vk("bind_buffer_memory", e));
        }

        // Get device address if usage includes it
        let device_address = if desc.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            let addr_info = vk::BufferDeviceAddressInfo::default().buffer(handle);
            Some(self.device.get_buffer_device_address(&addr_info))
        } else {
            None
        };

        tracing::trace!(name = desc.name, size = desc.size, "created buffer");

        Ok(Buffer {
            handle,
            allocation: Some(allocation),
            size: desc.size,
            usage: desc.usage,
            device_address,
        })
    }

    /// Destroy a buffer.
    pub unsafe fn destroy_buffer(&self, buffer: Buffer) {
        self.device.destroy_buffer(buffer.handle, None);
        if let Some(allocation) = buffer.allocation {
            if let Err(e) = self.allocator.lock().free(allocation) {
                tracing::warn!("failed to free buffer allocation: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn unbacked_buffer(usage: vk::BufferUsageFlags, device_address: Option<vk::DeviceAddress>) -> Buffer {
        Buffer {
            handle: vk::Buffer::from_raw(7),
            allocation: None,
            size: 256,
            usage,
            device_address,
        }
    }

    #[test]
    fn test_buffer_desc_default_alignment() {
        let desc = BufferDesc::new(64, vk::BufferUsageFlags::STORAGE_BUFFER, MemoryLocation::GpuOnly, "scratch");
        assert_eq!(desc.alignment, 1);
        assert_eq!(desc.size, 64);
    }

    #[test]
    fn test_buffer_desc_with_alignment_never_zero() {
        let desc = BufferDesc::new(64, vk::BufferUsageFlags::STORAGE_BUFFER, MemoryLocation::GpuOnly, "scratch")
            .with_alignment(0);
        assert_eq!(desc.alignment, 1);
        let desc = desc.with_alignment(128);
        assert_eq!(desc.alignment, 128);
    }

    #[test]
    fn test_buffer_address_missing() {
        let buffer = unbacked_buffer(vk::BufferUsageFlags::TRANSFER_SRC, None);
        assert_eq!(
            buffer.address("staging buffer"),
            Err(VulkanError::MissingDeviceAddress("staging buffer"))
        );
    }

    #[test]
    fn test_buffer_address_present() {
        let buffer = unbacked_buffer(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS, Some(0x1000));
        assert_eq!(buffer.address("scratch"), Ok(0x1000));
    }

    #[test]
    fn test_unmapped_buffer_write_fails() {
        let buffer = unbacked_buffer(vk::BufferUsageFlags::TRANSFER_SRC, None);
        assert!(buffer.mapped_ptr().is_none());
        let result = unsafe { buffer.write_bytes(&[1, 2, 3]) };
        assert_eq!(result, Err(VulkanError::NotHostVisible("buffer")));
    }

    #[test]
    fn test_oversized_write_rejected() {
        let buffer = unbacked_buffer(vk::BufferUsageFlags::TRANSFER_SRC, None);
        let result = unsafe { buffer.write_bytes(&[0u8; 257]) };
        assert_eq!(result, Err(VulkanError::BufferOverflow { size: 256, len: 257 }));

        // A write that fits gets as far as the mapping check.
        let result = unsafe { buffer.write_bytes(&[0u8; 256]) };
        assert_eq!(result, Err(VulkanError::NotHostVisible("buffer")));
    }
}
