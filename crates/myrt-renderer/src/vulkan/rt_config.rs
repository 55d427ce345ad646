//! Ray tracing build configuration.
//!
//! Holds the batching budget and default build flags used by the acceleration
//! structure builders. Values come from the application, or from environment
//! variables via [`RtConfig::from_env`], and are validated before use.

use ash::vk;
use parking_lot::RwLock;

use super::{Result, VulkanError};

/// Default ceiling on the summed structure size of one bottom-level sub-batch.
pub const DEFAULT_BLAS_BATCH_BUDGET: vk::DeviceSize = 256 * 1024 * 1024;

/// Ray tracing build settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtConfig {
    /// Cumulative structure size after which a new bottom-level sub-batch starts.
    pub blas_batch_budget: vk::DeviceSize,
    /// Flags applied to every bottom-level request.
    pub blas_flags: vk::BuildAccelerationStructureFlagsKHR,
    /// Flags applied to top-level builds.
    pub tlas_flags: vk::BuildAccelerationStructureFlagsKHR,
    /// Request compaction for bottom-level builds.
    pub compact_blas: bool,
    /// Build top-level structures so they can be refit in place.
    pub tlas_allow_update: bool,
    /// Enable the Khronos validation layer when creating a context.
    pub enable_validation: bool,
}

impl RtConfig {
    pub const DEFAULT: Self = Self {
        blas_batch_budget: DEFAULT_BLAS_BATCH_BUDGET,
        blas_flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
        tlas_flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
        compact_blas: true,
        tlas_allow_update: true,
        enable_validation: cfg!(debug_assertions),
    };

    /// Build flags for bottom-level requests, including compaction when enabled.
    pub fn blas_build_flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        if self.compact_blas {
            self.blas_flags | vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION
        } else {
            self.blas_flags
        }
    }

    /// Build flags for top-level structures.
    pub fn tlas_build_flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        if self.tlas_allow_update {
            self.tlas_flags | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE
        } else {
            self.tlas_flags
        }
    }

    /// Reject settings the builders cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.blas_batch_budget == 0 {
            return Err(VulkanError::InvalidConfig("blas batch budget must be non-zero"));
        }

        let fast_both = vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
            | vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD;
        if self.blas_flags.contains(fast_both) || self.tlas_flags.contains(fast_both) {
            return Err(VulkanError::InvalidConfig("PREFER_FAST_TRACE and PREFER_FAST_BUILD are exclusive"));
        }

        Ok(())
    }

    /// Read overrides from the process environment.
    ///
    /// * `MYRT_BLAS_BATCH_BUDGET_MB` - sub-batch budget in MiB
    /// * `MYRT_BLAS_COMPACT` - `0`/`1` to disable or enable compaction
    /// * `MYRT_TLAS_UPDATE` - `0`/`1` to allow in-place top-level updates
    /// * `MYRT_VALIDATION` - `0`/`1` to toggle the validation layer
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a key lookup on top of the defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::DEFAULT;

        if let Some(value) = lookup("MYRT_BLAS_BATCH_BUDGET_MB") {
            let mb: vk::DeviceSize = value.trim().parse()
                .map_err(|_| VulkanError::InvalidConfig("MYRT_BLAS_BATCH_BUDGET_MB is not a number"))?;
            config.blas_batch_budget = mb
                .checked_mul(1024 * 1024)
                .ok_or(VulkanError::InvalidConfig("MYRT_BLAS_BATCH_BUDGET_MB is too large"))?;
        }

        if let Some(value) = lookup("MYRT_BLAS_COMPACT") {
            config.compact_blas = parse_switch(&value)
                .ok_or(VulkanError::InvalidConfig("MYRT_BLAS_COMPACT must be 0 or 1"))?;
        }

        if let Some(value) = lookup("MYRT_TLAS_UPDATE") {
            config.tlas_allow_update = parse_switch(&value)
                .ok_or(VulkanError::InvalidConfig("MYRT_TLAS_UPDATE must be 0 or 1"))?;
        }

        if let Some(value) = lookup("MYRT_VALIDATION") {
            config.enable_validation = parse_switch(&value)
                .ok_or(VulkanError::InvalidConfig("MYRT_VALIDATION must be 0 or 1"))?;
        }

        config.validate()?;
        Ok(config)
    }
}

impl Default for RtConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

fn parse_switch(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "true" | "on" => Some(true),
        "0" | "false" | "off" => Some(false),
        _ => None,
    }
}

/// Global ray tracing configuration.
static RT_CONFIG: RwLock<RtConfig> = parking_lot::const_rwlock(RtConfig::DEFAULT);

/// Initialize the global ray tracing configuration.
pub fn init_rt_config(config: RtConfig) -> Result<()> {
    config.validate()?;
    *RT_CONFIG.write() = config;

    tracing::info!(
        "Ray tracing config: BLAS batch budget={} MiB, compaction={}, validation={}",
        config.blas_batch_budget / (1024 * 1024),
        if config.compact_blas { "enabled" } else { "disabled" },
        if config.enable_validation { "enabled" } else { "disabled" },
    );
    Ok(())
}

/// Modify the global ray tracing configuration in place.
pub fn update_rt_config<F>(update: F) -> Result<()>
where
    F: FnOnce(&mut RtConfig),
{
    let mut guard = RT_CONFIG.write();
    let mut config = *guard;
    update(&mut config);
    config.validate()?;
    *guard = config;
    Ok(())
}

/// Get the current ray tracing configuration.
pub fn rt_config() -> RtConfig {
    *RT_CONFIG.read()
}
