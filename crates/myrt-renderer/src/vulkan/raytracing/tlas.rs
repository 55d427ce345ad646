//! Top-level acceleration structure builds.
//!
//! Every call uploads the full instance list through a staging buffer and
//! builds over it. [`update_top_level`] runs the same upload against an
//! existing structure: a refit with the device's update mode when the
//! structure allows it and the instance count is unchanged, a full build
//! otherwise. No per-instance diffing is done.

use ash::vk;
use gpu_allocator::MemoryLocation;

use super::device::{AccelDevice, MemoryBarrier};
use super::instance::{InstancePlacement, RtInstance};
use super::scratch::ScratchBuffer;
use super::structure::AccelerationStructure;
use crate::vulkan::{Buffer, BufferDesc, Result, VulkanError};

/// Instance records must start on a 16 byte boundary.
const INSTANCE_BUFFER_ALIGNMENT: vk::DeviceSize = 16;

/// Instance records staged on the host and copied into a device-local buffer.
pub struct InstanceUpload {
    staging: Buffer,
    instances: Buffer,
    address: vk::DeviceAddress,
    count: u32,
}

impl InstanceUpload {
    pub fn new<D: AccelDevice + ?Sized>(device: &D, records: &[RtInstance]) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(records);
        let size = bytes.len() as vk::DeviceSize;

        let staging = device.create_buffer(&BufferDesc::new(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            "tlas_instances_staging",
        ))?;
        if let Err(e) = device.write_buffer(&staging, bytes) {
            device.destroy_buffer(staging);
            return Err(e);
        }

        let instances = match device.create_buffer(
            &BufferDesc::new(
                size,
                vk::BufferUsageFlags::TRANSFER_DST |
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR |
                vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                MemoryLocation::GpuOnly,
                "tlas_instances",
            )
            .with_alignment(INSTANCE_BUFFER_ALIGNMENT),
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                device.destroy_buffer(staging);
                return Err(e);
            }
        };

        let address = match instances.address("instance buffer") {
            Ok(address) => address,
            Err(e) => {
                device.destroy_buffer(instances);
                device.destroy_buffer(staging);
                return Err(e);
            }
        };

        Ok(Self {
            staging,
            instances,
            address,
            count: records.len() as u32,
        })
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn address(&self) -> vk::DeviceAddress {
        self.address
    }

    /// Record the staging copy and the barrier that makes it visible to the build.
    pub fn record<D: AccelDevice + ?Sized>(&self, device: &D, cmd: vk::CommandBuffer) {
        device.cmd_copy_buffer(cmd, &self.staging, &self.instances, self.staging.size);
        device.cmd_memory_barrier(cmd, MemoryBarrier::INSTANCE_UPLOAD);
    }

    pub fn geometry(&self) -> vk::AccelerationStructureGeometryKHR<'static> {
        let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR { device_address: self.address });

        vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
    }

    pub fn destroy<D: AccelDevice + ?Sized>(self, device: &D) {
        device.destroy_buffer(self.instances);
        device.destroy_buffer(self.staging);
    }
}

fn pack_instances<D: AccelDevice + ?Sized>(device: &D, instances: &[InstancePlacement]) -> Result<Vec<RtInstance>> {
    if instances.is_empty() {
        return Err(VulkanError::EmptyInstances);
    }
    if instances.len() as u64 > device.properties().max_instance_count {
        return Err(VulkanError::Unsupported("instance count exceeds the device limit"));
    }

    instances.iter().enumerate()
        .map(|(index, placement)| placement.to_rt_instance(index))
        .collect()
}

/// Build a new top-level structure over `instances`.
pub fn build_top_level<D: AccelDevice + ?Sized>(
    device: &D,
    instances: &[InstancePlacement],
    flags: vk::BuildAccelerationStructureFlagsKHR,
) -> Result<AccelerationStructure> {
    let records = pack_instances(device, instances)?;
    let upload = InstanceUpload::new(device, &records)?;

    let result = build_with_upload(device, &upload, flags);
    upload.destroy(device);

    let structure = result?;
    tracing::debug!(
        "Built TLAS over {} instances, {} bytes",
        structure.primitive_count,
        structure.size,
    );
    Ok(structure)
}

fn build_with_upload<D: AccelDevice + ?Sized>(
    device: &D,
    upload: &InstanceUpload,
    flags: vk::BuildAccelerationStructureFlagsKHR,
) -> Result<AccelerationStructure> {
    let geometries = [upload.geometry()];
    let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
        .flags(flags)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(&geometries);
    let sizes = device.build_sizes(&build_info, &[upload.count()]);

    let structure = AccelerationStructure::create(
        device,
        vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        sizes.acceleration_structure_size,
        flags,
        upload.count(),
        "tlas",
    )?;

    let build_info = build_info.dst_acceleration_structure(structure.handle);
    if let Err(e) = submit_build(device, upload, build_info, sizes.build_scratch_size) {
        structure.destroy(device);
        return Err(e);
    }
    Ok(structure)
}

/// Rebuild `tlas` from a new instance list.
///
/// A structure built with `ALLOW_UPDATE` over the same number of instances is
/// refit with the device's update mode. Anything else gets a full build, into
/// the existing storage when the result fits and into a replacement structure
/// otherwise. If a replacement build fails, `tlas` keeps the old structure.
pub fn update_top_level<D: AccelDevice + ?Sized>(
    device: &D,
    tlas: &mut AccelerationStructure,
    instances: &[InstancePlacement],
) -> Result<()> {
    if !tlas.is_top_level() {
        return Err(VulkanError::UpdateMismatch("structure is not top-level"));
    }

    let records = pack_instances(device, instances)?;
    let upload = InstanceUpload::new(device, &records)?;

    let result = if tlas.allows_update() && upload.count() == tlas.primitive_count {
        refit(device, tlas, &upload)
    } else {
        rebuild(device, tlas, &upload)
    };
    upload.destroy(device);
    result
}

fn refit<D: AccelDevice + ?Sized>(device: &D, tlas: &AccelerationStructure, upload: &InstanceUpload) -> Result<()> {
    let geometries = [upload.geometry()];
    let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
        .flags(tlas.flags)
        .mode(vk::BuildAccelerationStructureModeKHR::UPDATE)
        .src_acceleration_structure(tlas.handle)
        .dst_acceleration_structure(tlas.handle)
        .geometries(&geometries);
    let sizes = device.build_sizes(&build_info, &[upload.count()]);

    submit_build(device, upload, build_info, sizes.update_scratch_size)?;
    tracing::debug!("Refit TLAS over {} instances", upload.count());
    Ok(())
}

fn rebuild<D: AccelDevice + ?Sized>(device: &D, tlas: &mut AccelerationStructure, upload: &InstanceUpload) -> Result<()> {
    let geometries = [upload.geometry()];
    let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
        .flags(tlas.flags)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(&geometries);
    let sizes = device.build_sizes(&build_info, &[upload.count()]);

    if sizes.acceleration_structure_size <= tlas.size {
        let build_info = build_info.dst_acceleration_structure(tlas.handle);
        submit_build(device, upload, build_info, sizes.build_scratch_size)?;
        tlas.primitive_count = upload.count();
        tracing::debug!("Rebuilt TLAS in place over {} instances", upload.count());
        return Ok(());
    }

    let replacement = build_with_upload(device, upload, tlas.flags)?;
    let previous = std::mem::replace(tlas, replacement);
    previous.destroy(device);
    tracing::debug!(
        "Rebuilt TLAS over {} instances into a new {} byte structure",
        tlas.primitive_count,
        tlas.size,
    );
    Ok(())
}

/// Record upload, barrier and build into one command buffer and wait for it.
fn submit_build<D: AccelDevice + ?Sized>(
    device: &D,
    upload: &InstanceUpload,
    build_info: vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
    scratch_size: vk::DeviceSize,
) -> Result<()> {
    let mut scratch = ScratchBuffer::new(device, scratch_size, "tlas_scratch")?;

    let result = device.begin_commands().and_then(|cmd| {
        upload.record(device, cmd);

        let lease = scratch.lease(device, cmd);
        let range = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(upload.count())
            .primitive_offset(0)
            .first_vertex(0)
            .transform_offset(0);
        device.cmd_build_acceleration_structure(cmd, &build_info.scratch_data(lease.data()), &[range]);
        lease.release();

        device.submit_and_wait(cmd)
    });

    scratch.destroy(device);
    result
}
