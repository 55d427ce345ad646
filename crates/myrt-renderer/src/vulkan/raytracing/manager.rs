//! Ownership of the scene's acceleration structures.

use ash::vk;
use std::collections::HashMap;

use super::blas::build_bottom_level_with_stats;
use super::device::AccelDevice;
use super::geometry::BlasInput;
use super::instance::InstancePlacement;
use super::structure::AccelerationStructure;
use super::tlas::{build_top_level, update_top_level};
use super::transform::Mat4;
use crate::vulkan::{rt_config, Result, RtConfig, VulkanError};

/// Handle to a bottom-level acceleration structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlasHandle(pub usize);

/// A top-level instance that refers to a managed bottom-level structure.
///
/// The `blas_address` of `placement` is ignored; it is resolved from `blas`
/// when the top-level structure is built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TlasInstance {
    pub blas: BlasHandle,
    pub placement: InstancePlacement,
}

impl TlasInstance {
    pub fn new(blas: BlasHandle, transform: Mat4) -> Self {
        Self {
            blas,
            placement: InstancePlacement::new(0).with_transform(transform),
        }
    }

    pub fn with_custom_index(mut self, custom_index: u32) -> Self {
        self.placement = self.placement.with_custom_index(custom_index);
        self
    }

    pub fn with_mask(mut self, mask: u8) -> Self {
        self.placement = self.placement.with_mask(mask);
        self
    }

    pub fn with_sbt_offset(mut self, offset: u32, flags: vk::GeometryInstanceFlagsKHR) -> Self {
        self.placement = self.placement.with_sbt_offset(offset, flags);
        self
    }
}

/// Owns every bottom-level structure and the single top-level structure.
///
/// Structures are only released by [`destroy`](Self::destroy) or
/// [`destroy_blas`](Self::destroy_blas); dropping the manager with live
/// structures logs a leak instead of freeing device objects behind the
/// caller's back.
pub struct AccelerationStructureManager<D: AccelDevice> {
    device: D,
    config: RtConfig,
    blas_map: HashMap<BlasHandle, AccelerationStructure>,
    tlas: Option<AccelerationStructure>,
    next_blas_id: usize,
}

impl<D: AccelDevice> AccelerationStructureManager<D> {
    pub fn new(device: D, config: RtConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            device,
            config,
            blas_map: HashMap::new(),
            tlas: None,
            next_blas_id: 0,
        })
    }

    /// Create a manager using the global ray tracing configuration.
    pub fn with_global_config(device: D) -> Result<Self> {
        Self::new(device, rt_config())
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn config(&self) -> &RtConfig {
        &self.config
    }

    /// Build one structure per request with the configured default flags.
    pub fn build_blas(&mut self, requests: &[BlasInput]) -> Result<Vec<BlasHandle>> {
        let flags = self.config.blas_build_flags();
        self.build_blas_with_flags(requests, flags)
    }

    /// Build one structure per request, adding `flags` to each request's own flags.
    pub fn build_blas_with_flags(
        &mut self,
        requests: &[BlasInput],
        flags: vk::BuildAccelerationStructureFlagsKHR,
    ) -> Result<Vec<BlasHandle>> {
        let (structures, stats) = build_bottom_level_with_stats(&self.device, &self.config, requests, flags)?;
        if stats.compacted && stats.built_size > 0 {
            tracing::debug!(
                "BLAS compaction kept {:.1}% of {} bytes",
                stats.final_size as f64 * 100.0 / stats.built_size as f64,
                stats.built_size,
            );
        }

        Ok(structures.into_iter()
            .map(|structure| {
                let handle = BlasHandle(self.next_blas_id);
                self.next_blas_id += 1;
                self.blas_map.insert(handle, structure);
                handle
            })
            .collect())
    }

    pub fn get_blas(&self, handle: BlasHandle) -> Option<&AccelerationStructure> {
        self.blas_map.get(&handle)
    }

    pub fn blas_address(&self, handle: BlasHandle) -> Result<vk::DeviceAddress> {
        self.get_blas(handle)
            .map(|blas| blas.device_address)
            .ok_or(VulkanError::UnknownStructure(handle.0))
    }

    pub fn blas_count(&self) -> usize {
        self.blas_map.len()
    }

    /// Destroy one bottom-level structure.
    ///
    /// The current top-level structure must not reference it anymore.
    pub fn destroy_blas(&mut self, handle: BlasHandle) -> Result<()> {
        let blas = self.blas_map.remove(&handle).ok_or(VulkanError::UnknownStructure(handle.0))?;
        blas.destroy(&self.device);
        Ok(())
    }

    fn resolve(&self, instances: &[TlasInstance]) -> Result<Vec<InstancePlacement>> {
        instances.iter()
            .map(|instance| {
                Ok(InstancePlacement {
                    blas_address: self.blas_address(instance.blas)?,
                    ..instance.placement
                })
            })
            .collect()
    }

    /// Build the top-level structure, replacing the previous one.
    pub fn build_tlas(&mut self, instances: &[TlasInstance]) -> Result<()> {
        let placements = self.resolve(instances)?;
        let tlas = build_top_level(&self.device, &placements, self.config.tlas_build_flags())?;

        if let Some(previous) = self.tlas.replace(tlas) {
            previous.destroy(&self.device);
        }
        Ok(())
    }

    /// Rebuild the current top-level structure from new placements.
    ///
    /// Refits in place when the instance count is unchanged and the structure
    /// allows updates; otherwise the structure is rebuilt, possibly into a new
    /// one with a different device address.
    pub fn update_tlas(&mut self, instances: &[TlasInstance]) -> Result<()> {
        let placements = self.resolve(instances)?;
        let tlas = self.tlas.as_mut()
            .ok_or(VulkanError::UpdateMismatch("no top-level structure has been built"))?;
        update_top_level(&self.device, tlas, &placements)
    }

    pub fn tlas(&self) -> Option<&AccelerationStructure> {
        self.tlas.as_ref()
    }

    pub fn tlas_address(&self) -> Option<vk::DeviceAddress> {
        self.tlas.as_ref().map(|tlas| tlas.device_address)
    }

    /// Destroy every structure, the top-level one first. Safe to call repeatedly.
    pub fn destroy(&mut self) {
        if let Some(tlas) = self.tlas.take() {
            tlas.destroy(&self.device);
        }

        let mut handles: Vec<BlasHandle> = self.blas_map.keys().copied().collect();
        handles.sort();
        for handle in handles {
            if let Some(blas) = self.blas_map.remove(&handle) {
                blas.destroy(&self.device);
            }
        }
    }
}

impl<D: AccelDevice> Drop for AccelerationStructureManager<D> {
    fn drop(&mut self) {
        let live = self.blas_map.len() + self.tlas.is_some() as usize;
        if live > 0 {
            tracing::warn!("AccelerationStructureManager dropped with {} live structures", live);
        }
    }
}
