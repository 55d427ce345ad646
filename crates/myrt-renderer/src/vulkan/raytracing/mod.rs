//! Ray tracing via the Vulkan KHR acceleration structure and pipeline extensions.
//!
//! Meshes become [`BlasInput`]s through the geometry adapter, the bottom-level
//! builder turns them into [`AccelerationStructure`]s, and the top-level
//! builder places those into a scene structure. [`ShaderBindingTable`] lays out
//! shader group handles for dispatch. [`AccelerationStructureManager`] owns the
//! structures and tears them down.
//!
//! All device work goes through [`AccelDevice`]. Builds are synchronous: every
//! command buffer is submitted and waited on before the builder moves on.

pub mod blas;
pub mod device;
pub mod geometry;
pub mod instance;
pub mod manager;
pub mod sbt;
pub mod scratch;
pub mod structure;
pub mod tlas;
pub mod transform;
pub mod vulkan_device;

#[cfg(test)]
pub(crate) mod testing;

pub use blas::{build_bottom_level, build_bottom_level_with_stats, partition_by_budget, BlasBuildStats};
pub use device::{AccelDevice, BuildSizes, MemoryBarrier};
pub use geometry::{geometry_from_mesh, BlasGeometry, BlasInput, GeometryDescriptor, TriangleMesh};
pub use instance::{InstancePlacement, RtInstance};
pub use manager::{AccelerationStructureManager, BlasHandle, TlasInstance};
pub use sbt::{align_up, checked_align_up, GroupCounts, SbtLayout, SbtRegionLayout, ShaderBindingTable};
pub use scratch::{ScratchBuffer, ScratchLease};
pub use structure::AccelerationStructure;
pub use tlas::{build_top_level, update_top_level, InstanceUpload};
pub use transform::{from_instance_transform, to_instance_transform, Mat4};
pub use vulkan_device::VulkanAccelDevice;
