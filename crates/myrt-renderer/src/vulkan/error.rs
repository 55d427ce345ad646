//! Error type shared by the Vulkan backend and the ray tracing core.

use ash::vk;
use std::error::Error;
use std::fmt::{Display, Error as FmtError, Formatter};

/// Result alias used throughout the backend.
pub type Result<T> = std::result::Result<T, VulkanError>;

/// Errors produced while creating Vulkan objects or building ray tracing resources.
///
/// Device failures are fatal for the operation that hit them; nothing in this crate retries.
/// The remaining variants are caller mistakes that are reachable from input composition and
/// are therefore reported instead of asserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VulkanError {
    /// A Vulkan call returned an error code.
    Vk {
        operation: &'static str,
        result: vk::Result,
    },

    /// The memory allocator rejected an allocation.
    Allocation(String),

    /// A required feature or extension is not available on the device.
    Unsupported(&'static str),

    /// Reading back compacted structure sizes failed.
    CompactedSizeQuery(vk::Result),

    /// Some, but not all, requests of a bottom-level batch asked for compaction.
    MixedCompaction { compacting: usize, total: usize },

    /// A bottom-level request contained no geometry.
    EmptyGeometry { request: usize },

    /// A top-level build was given no instances.
    EmptyInstances,

    /// An instance field does not fit its packed 24-bit slot.
    InstanceFieldOverflow {
        instance: usize,
        field: &'static str,
        value: u32,
    },

    /// A top-level update was requested against an incompatible structure.
    UpdateMismatch(&'static str),

    /// A layout constant was zero or not a power of two.
    InvalidAlignment { name: &'static str, value: u32 },

    /// The shader group counts cannot be laid out.
    InvalidGroupCounts(&'static str),

    /// The shader group handle blob is smaller than the group counts require.
    HandleDataTooShort { expected: usize, actual: usize },

    /// A configuration value is out of range.
    InvalidConfig(&'static str),

    /// A buffer that must be addressable by the device has no device address.
    MissingDeviceAddress(&'static str),

    /// A buffer that must be host visible is not mapped.
    NotHostVisible(&'static str),

    /// More bytes were written than the buffer holds.
    BufferOverflow { size: vk::DeviceSize, len: usize },

    /// A bottom-level handle that the manager does not own.
    UnknownStructure(usize),
}

impl VulkanError {
    /// Wrap a failed `vk::Result` with the name of the operation that produced it.
    pub fn vk(operation: &'static str, result: vk::Result) -> Self {
        Self::Vk { operation, result }
    }

    /// Whether this error reports a caller mistake rather than a device failure.
    pub fn is_usage_error(&self) -> bool {
        !matches!(
            self,
            Self::Vk { .. } | Self::Allocation(_) | Self::Unsupported(_) | Self::CompactedSizeQuery(_)
        )
    }
}

impl Error for VulkanError {}

impl Display for VulkanError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::result::Result<(), FmtError> {
        match self {
            Self::Vk { operation, result } => write!(f, "{} failed: {:?}", operation, result),
            Self::Allocation(msg) => write!(f, "allocating device memory failed: {}", msg),
            Self::Unsupported(what) => write!(f, "not supported by the device: {}", what),
            Self::CompactedSizeQuery(result) => {
                write!(f, "reading compacted structure sizes failed: {:?}", result)
            }
            Self::MixedCompaction { compacting, total } => write!(
                f,
                "{} of {} bottom-level requests allow compaction; a batch must be all or nothing",
                compacting, total,
            ),
            Self::EmptyGeometry { request } => {
                write!(f, "bottom-level request {} has no geometry", request)
            }
            Self::EmptyInstances => write!(f, "a top-level build needs at least one instance"),
            Self::InstanceFieldOverflow {
                instance,
                field,
                value,
            } => write!(
                f,
                "instance {}: {} value {:#x} does not fit in 24 bits",
                instance, field, value,
            ),
            Self::UpdateMismatch(reason) => write!(f, "cannot update top-level structure: {}", reason),
            Self::InvalidAlignment { name, value } => write!(
                f,
                "{} must be a non-zero power of two, got {}",
                name, value,
            ),
            Self::InvalidGroupCounts(reason) => write!(f, "invalid shader group counts: {}", reason),
            Self::HandleDataTooShort { expected, actual } => write!(
                f,
                "shader group handle data is {} bytes, expected at least {}",
                actual, expected,
            ),
            Self::InvalidConfig(reason) => write!(f, "invalid ray tracing config: {}", reason),
            Self::MissingDeviceAddress(what) => write!(f, "{} has no device address", what),
            Self::NotHostVisible(what) => write!(f, "{} is not host visible", what),
            Self::BufferOverflow { size, len } => {
                write!(f, "writing {} bytes into a {} byte buffer", len, size)
            }
            Self::UnknownStructure(id) => write!(f, "no bottom-level structure with handle {}", id),
        }
    }
}

impl From<gpu_allocator::AllocationError> for VulkanError {
    fn from(err: gpu_allocator::AllocationError) -> Self {
        Self::Allocation(err.to_string())
    }
}
