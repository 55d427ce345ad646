//! Scratch memory shared by consecutive structure builds.
//!
//! Builds recorded into the same command buffer reuse one scratch region. A
//! build gets the region through a [`ScratchLease`]; releasing the lease records
//! the AS-write to AS-read barrier, so the next build cannot start touching the
//! scratch memory while the previous one still uses it. Leasing borrows the
//! buffer mutably, which keeps leases strictly sequential.

use ash::vk;
use gpu_allocator::MemoryLocation;

use super::device::{AccelDevice, MemoryBarrier};
use crate::vulkan::{Buffer, BufferDesc, Result};

pub struct ScratchBuffer {
    buffer: Buffer,
    address: vk::DeviceAddress,
}

impl ScratchBuffer {
    /// Allocate `size` bytes aligned to the device's minimum scratch offset alignment.
    pub fn new<D: AccelDevice + ?Sized>(device: &D, size: vk::DeviceSize, name: &str) -> Result<Self> {
        let alignment = device.properties().min_scratch_offset_alignment as vk::DeviceSize;
        let buffer = device.create_buffer(
            &BufferDesc::new(
                size.max(1),
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                MemoryLocation::GpuOnly,
                name,
            )
            .with_alignment(alignment),
        )?;

        let address = match buffer.address("scratch buffer") {
            Ok(address) => address,
            Err(e) => {
                device.destroy_buffer(buffer);
                return Err(e);
            }
        };

        Ok(Self { buffer, address })
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.buffer.size
    }

    pub fn address(&self) -> vk::DeviceAddress {
        self.address
    }

    /// Hand the scratch region to one build recorded into `cmd`.
    pub fn lease<'a, D: AccelDevice + ?Sized>(&'a mut self, device: &'a D, cmd: vk::CommandBuffer) -> ScratchLease<'a, D> {
        ScratchLease {
            device,
            cmd,
            scratch: self,
        }
    }

    pub fn destroy<D: AccelDevice + ?Sized>(self, device: &D) {
        device.destroy_buffer(self.buffer);
    }
}

/// Exclusive use of the scratch buffer for one build.
pub struct ScratchLease<'a, D: AccelDevice + ?Sized> {
    device: &'a D,
    cmd: vk::CommandBuffer,
    scratch: &'a mut ScratchBuffer,
}

impl<D: AccelDevice + ?Sized> ScratchLease<'_, D> {
    pub fn address(&self) -> vk::DeviceAddress {
        self.scratch.address
    }

    pub fn data(&self) -> vk::DeviceOrHostAddressKHR {
        vk::DeviceOrHostAddressKHR { device_address: self.scratch.address }
    }

    /// End the lease. Same as dropping it.
    pub fn release(self) {}
}

impl<D: AccelDevice + ?Sized> Drop for ScratchLease<'_, D> {
    fn drop(&mut self) {
        self.device.cmd_memory_barrier(self.cmd, MemoryBarrier::SCRATCH_REUSE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vulkan::raytracing::testing::{Event, RecordingDevice};
    use crate::vulkan::RayTracingProperties;
    use ash::vk::Handle;

    #[test]
    fn test_scratch_respects_offset_alignment() {
        let device = RecordingDevice::with_properties(RayTracingProperties {
            min_scratch_offset_alignment: 256,
            ..RayTracingProperties::default()
        });
        let scratch = ScratchBuffer::new(&device, 1000, "scratch").unwrap();

        assert_eq!(scratch.address() % 256, 0);
        assert_eq!(scratch.size(), 1000);
        scratch.destroy(&device);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn test_release_records_scratch_barrier() {
        let device = RecordingDevice::new();
        let mut scratch = ScratchBuffer::new(&device, 4096, "scratch").unwrap();
        let cmd = vk::CommandBuffer::from_raw(7);
        device.clear_events();

        let lease = scratch.lease(&device, cmd);
        assert_ne!(lease.address(), 0);
        assert!(device.events().is_empty());
        lease.release();

        assert_eq!(device.events(), vec![Event::Barrier(MemoryBarrier::SCRATCH_REUSE)]);
        scratch.destroy(&device);
    }

    #[test]
    fn test_dropped_lease_also_records_barrier() {
        let device = RecordingDevice::new();
        let mut scratch = ScratchBuffer::new(&device, 4096, "scratch").unwrap();
        let cmd = vk::CommandBuffer::from_raw(7);
        device.clear_events();

        for _ in 0..3 {
            let _lease = scratch.lease(&device, cmd);
        }

        assert_eq!(device.count(|e| matches!(e, Event::Barrier(_))), 3);
        scratch.destroy(&device);
    }
}
