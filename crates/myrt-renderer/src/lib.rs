#![allow(clippy::too_many_arguments, clippy::missing_safety_doc)]
// Vulkan ray tracing core: acceleration structures and shader binding tables

// Vulkan backend
pub mod vulkan;

pub use vulkan::raytracing;
