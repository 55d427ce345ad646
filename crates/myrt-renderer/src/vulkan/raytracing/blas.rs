//! Bottom-level acceleration structure builds.
//!
//! A call to [`build_bottom_level`] goes through three stages, each producing
//! new values instead of patching shared state:
//!
//! 1. size every request (`SizedBlas`), find the largest scratch requirement,
//! 2. build sub-batches whose summed structure size stays under the configured
//!    budget, one command buffer each, all sharing one scratch buffer,
//! 3. when the requests ask for compaction, read back the compacted sizes of a
//!    finished sub-batch and copy each structure into a right-sized one.
//!
//! Any failure tears down everything the call created and returns the error.

use ash::vk;
use std::ops::Range;

use super::device::{AccelDevice, BuildSizes};
use super::geometry::BlasInput;
use super::scratch::ScratchBuffer;
use super::structure::{destroy_all, AccelerationStructure};
use crate::vulkan::{Result, RtConfig, VulkanError};

/// Summary of one bottom-level build call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlasBuildStats {
    pub structures: usize,
    pub sub_batches: usize,
    pub scratch_size: vk::DeviceSize,
    /// Summed structure size reported before compaction.
    pub built_size: vk::DeviceSize,
    /// Summed size of the returned structures.
    pub final_size: vk::DeviceSize,
    pub compacted: bool,
}

/// A request together with its effective flags and the sizes the device reported.
struct SizedBlas<'a> {
    input: &'a BlasInput,
    flags: vk::BuildAccelerationStructureFlagsKHR,
    sizes: BuildSizes,
    primitive_count: u32,
}

/// Split requests into consecutive runs whose summed size stays within `budget`.
///
/// A run is closed before the request that would push it over the budget. A
/// single request larger than the budget gets a run of its own.
pub fn partition_by_budget(sizes: &[vk::DeviceSize], budget: vk::DeviceSize) -> Vec<Range<usize>> {
    let mut batches = Vec::new();
    let mut start = 0;
    let mut running: vk::DeviceSize = 0;

    for (i, &size) in sizes.iter().enumerate() {
        if i > start && running.saturating_add(size) > budget {
            batches.push(start..i);
            start = i;
            running = 0;
        }
        running = running.saturating_add(size);
    }

    if start < sizes.len() {
        batches.push(start..sizes.len());
    }
    batches
}

/// Build one bottom-level structure per request, in request order.
///
/// `flags` are added to every request's own flags. Either all requests allow
/// compaction or none do.
pub fn build_bottom_level<D: AccelDevice + ?Sized>(
    device: &D,
    config: &RtConfig,
    requests: &[BlasInput],
    flags: vk::BuildAccelerationStructureFlagsKHR,
) -> Result<Vec<AccelerationStructure>> {
    build_bottom_level_with_stats(device, config, requests, flags).map(|(structures, _)| structures)
}

pub fn build_bottom_level_with_stats<D: AccelDevice + ?Sized>(
    device: &D,
    config: &RtConfig,
    requests: &[BlasInput],
    flags: vk::BuildAccelerationStructureFlagsKHR,
) -> Result<(Vec<AccelerationStructure>, BlasBuildStats)> {
    if requests.is_empty() {
        return Ok((Vec::new(), BlasBuildStats::default()));
    }
    config.validate()?;

    let compact = check_compaction(requests, flags)?;
    let sized = size_requests(device, requests, flags)?;

    let scratch_size = sized.iter().map(|s| s.sizes.build_scratch_size).max().unwrap_or(0);
    let structure_sizes: Vec<vk::DeviceSize> = sized.iter().map(|s| s.sizes.acceleration_structure_size).collect();
    let batches = partition_by_budget(&structure_sizes, config.blas_batch_budget);

    let mut stats = BlasBuildStats {
        structures: requests.len(),
        sub_batches: batches.len(),
        scratch_size,
        built_size: structure_sizes.iter().sum(),
        final_size: 0,
        compacted: compact,
    };

    tracing::debug!(
        "Building {} BLAS in {} sub-batch(es), scratch {} bytes, compaction {}",
        requests.len(),
        batches.len(),
        scratch_size,
        if compact { "on" } else { "off" },
    );

    let mut scratch = ScratchBuffer::new(device, scratch_size, "blas_scratch")?;

    let query_pool = if compact {
        match device.create_compaction_query_pool(requests.len() as u32) {
            Ok(pool) => Some(pool),
            Err(e) => {
                scratch.destroy(device);
                return Err(e);
            }
        }
    } else {
        None
    };

    let mut finished = Vec::with_capacity(requests.len());
    let outcome = run_sub_batches(device, &sized, &batches, &mut scratch, query_pool, &mut finished);

    scratch.destroy(device);
    if let Some(pool) = query_pool {
        device.destroy_query_pool(pool);
    }

    if let Err(e) = outcome {
        tracing::error!("BLAS build failed after {} of {} structures: {}", finished.len(), requests.len(), e);
        destroy_all(device, finished);
        return Err(e);
    }

    stats.final_size = finished.iter().map(|s| s.size).sum();
    if compact {
        tracing::info!(
            "Built {} BLAS, compacted {} -> {} bytes",
            stats.structures,
            stats.built_size,
            stats.final_size,
        );
    } else {
        tracing::info!("Built {} BLAS, {} bytes", stats.structures, stats.final_size);
    }

    Ok((finished, stats))
}

fn check_compaction(requests: &[BlasInput], flags: vk::BuildAccelerationStructureFlagsKHR) -> Result<bool> {
    let compacting = requests.iter()
        .filter(|r| (r.flags | flags).contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION))
        .count();

    match compacting {
        0 => Ok(false),
        n if n == requests.len() => Ok(true),
        n => Err(VulkanError::MixedCompaction { compacting: n, total: requests.len() }),
    }
}

fn size_requests<'a, D: AccelDevice + ?Sized>(
    device: &D,
    requests: &'a [BlasInput],
    flags: vk::BuildAccelerationStructureFlagsKHR,
) -> Result<Vec<SizedBlas<'a>>> {
    requests.iter().enumerate()
        .map(|(index, input)| {
            if input.geometries.is_empty() {
                return Err(VulkanError::EmptyGeometry { request: index });
            }

            let flags = input.flags | flags;
            let geometries = input.vk_geometries();
            let primitive_counts = input.primitive_counts();
            let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
                .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
                .flags(flags)
                .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                .geometries(&geometries);

            Ok(SizedBlas {
                input,
                flags,
                sizes: device.build_sizes(&build_info, &primitive_counts),
                primitive_count: primitive_counts.iter().sum(),
            })
        })
        .collect()
}

fn run_sub_batches<D: AccelDevice + ?Sized>(
    device: &D,
    sized: &[SizedBlas<'_>],
    batches: &[Range<usize>],
    scratch: &mut ScratchBuffer,
    query_pool: Option<vk::QueryPool>,
    finished: &mut Vec<AccelerationStructure>,
) -> Result<()> {
    for (batch_index, range) in batches.iter().enumerate() {
        tracing::debug!(
            "BLAS sub-batch {}/{}: requests {}..{}",
            batch_index + 1,
            batches.len(),
            range.start,
            range.end,
        );

        let built = build_sub_batch(device, &sized[range.clone()], range.start, scratch, query_pool)?;

        let structures = match query_pool {
            Some(pool) => compact_sub_batch(device, pool, range.start as u32, built)?,
            None => built,
        };
        finished.extend(structures);
    }
    Ok(())
}

/// Build one sub-batch in a single command buffer.
///
/// `first` is the global index of the first member, which is also its query slot.
fn build_sub_batch<D: AccelDevice + ?Sized>(
    device: &D,
    members: &[SizedBlas<'_>],
    first: usize,
    scratch: &mut ScratchBuffer,
    query_pool: Option<vk::QueryPool>,
) -> Result<Vec<AccelerationStructure>> {
    let mut built = Vec::with_capacity(members.len());
    for member in members {
        match AccelerationStructure::create(
            device,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            member.sizes.acceleration_structure_size,
            member.flags,
            member.primitive_count,
            "blas",
        ) {
            Ok(structure) => built.push(structure),
            Err(e) => {
                destroy_all(device, built);
                return Err(e);
            }
        }
    }

    let cmd = match device.begin_commands() {
        Ok(cmd) => cmd,
        Err(e) => {
            destroy_all(device, built);
            return Err(e);
        }
    };

    if let Some(pool) = query_pool {
        device.cmd_reset_query_pool(cmd, pool, first as u32, members.len() as u32);
    }

    for (offset, (member, structure)) in members.iter().zip(&built).enumerate() {
        let geometries = member.input.vk_geometries();
        let ranges = member.input.ranges();
        let lease = scratch.lease(device, cmd);

        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(member.flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .dst_acceleration_structure(structure.handle)
            .geometries(&geometries)
            .scratch_data(lease.data());

        device.cmd_build_acceleration_structure(cmd, &build_info, &ranges);
        lease.release();

        if let Some(pool) = query_pool {
            device.cmd_write_compacted_size(cmd, structure.handle, pool, (first + offset) as u32);
        }
    }

    if let Err(e) = device.submit_and_wait(cmd) {
        destroy_all(device, built);
        return Err(e);
    }
    Ok(built)
}

/// Copy every structure of a finished sub-batch into a buffer of its compacted size.
fn compact_sub_batch<D: AccelDevice + ?Sized>(
    device: &D,
    pool: vk::QueryPool,
    first_query: u32,
    built: Vec<AccelerationStructure>,
) -> Result<Vec<AccelerationStructure>> {
    let sizes = match device.compacted_sizes(pool, first_query, built.len() as u32) {
        Ok(sizes) if sizes.iter().all(|&size| size > 0) => sizes,
        Ok(_) => {
            destroy_all(device, built);
            return Err(VulkanError::CompactedSizeQuery(vk::Result::NOT_READY));
        }
        Err(e) => {
            destroy_all(device, built);
            return Err(e);
        }
    };

    let mut compacted = Vec::with_capacity(built.len());
    for (original, &size) in built.iter().zip(&sizes) {
        match AccelerationStructure::create(
            device,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            size,
            original.flags,
            original.primitive_count,
            "blas_compacted",
        ) {
            Ok(structure) => compacted.push(structure),
            Err(e) => {
                destroy_all(device, compacted);
                destroy_all(device, built);
                return Err(e);
            }
        }
    }

    let submitted = device.begin_commands().and_then(|cmd| {
        for (original, target) in built.iter().zip(&compacted) {
            device.cmd_copy_compact(cmd, original.handle, target.handle);
        }
        device.submit_and_wait(cmd)
    });

    if let Err(e) = submitted {
        destroy_all(device, compacted);
        destroy_all(device, built);
        return Err(e);
    }

    tracing::debug!(
        "Compacted {} BLAS: {} -> {} bytes",
        built.len(),
        built.iter().map(|s| s.size).sum::<vk::DeviceSize>(),
        sizes.iter().sum::<vk::DeviceSize>(),
    );

    destroy_all(device, built);
    Ok(compacted)
}
