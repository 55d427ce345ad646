//! Vulkan 1.3 backend for hardware ray tracing.
//!
//! Provides the device context, memory and command plumbing that the
//! acceleration structure builders and shader binding table sit on.

pub mod context;
pub mod error;
pub mod memory;
pub mod commands;
pub mod raytracing;
pub mod rt_config;

pub use context::{QueueFamilyIndices, RayTracingProperties, VulkanContext};
pub use error::{Result, VulkanError};
pub use memory::{Buffer, BufferDesc, MemoryManager};
pub use commands::CommandManager;
pub use rt_config::{RtConfig, init_rt_config, update_rt_config, rt_config};

use ash::vk;
use std::ffi::CStr;

/// Minimum Vulkan version: buffer device address is core from 1.2, synchronization2 from 1.3.
pub const REQUIRED_VK_VERSION: u32 = vk::make_api_version(0, 1, 3, 0);

/// Application name for Vulkan instance.
pub const APP_NAME: &CStr = c"MyRT";

/// Engine name for Vulkan instance.
pub const ENGINE_NAME: &CStr = c"MyRT Engine";

/// Engine version.
pub const ENGINE_VERSION: u32 = vk::make_api_version(0, 1, 0, 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_version_is_1_3() {
        assert_eq!(vk::api_version_major(REQUIRED_VK_VERSION), 1);
        assert_eq!(vk::api_version_minor(REQUIRED_VK_VERSION), 3);
    }
}
