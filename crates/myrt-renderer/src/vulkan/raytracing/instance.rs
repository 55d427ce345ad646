//! Top-level instance records.

use ash::vk;
use bytemuck::{Pod, Zeroable};

use super::transform::{to_instance_transform, InstanceTransform, Mat4, IDENTITY};
use crate::vulkan::{Result, VulkanError};

/// Largest value of the packed 24-bit instance fields.
pub const MAX_INSTANCE_FIELD: u32 = 0x00FF_FFFF;

/// Instance record as read by the device during a top-level build.
///
/// Layout matches `VkAccelerationStructureInstanceKHR`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct RtInstance {
    pub transform: InstanceTransform,
    pub instance_custom_index_and_mask: u32,
    pub instance_shader_binding_table_record_offset_and_flags: u32,
    pub acceleration_structure_reference: u64,
}

const _: () = assert!(std::mem::size_of::<RtInstance>() == 64);

impl RtInstance {
    pub fn custom_index(&self) -> u32 {
        self.instance_custom_index_and_mask & MAX_INSTANCE_FIELD
    }

    pub fn mask(&self) -> u8 {
        (self.instance_custom_index_and_mask >> 24) as u8
    }

    pub fn sbt_record_offset(&self) -> u32 {
        self.instance_shader_binding_table_record_offset_and_flags & MAX_INSTANCE_FIELD
    }

    pub fn flags(&self) -> vk::GeometryInstanceFlagsKHR {
        vk::GeometryInstanceFlagsKHR::from_raw(self.instance_shader_binding_table_record_offset_and_flags >> 24)
    }
}

/// Where one bottom-level structure appears in the scene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstancePlacement {
    /// Column-major application transform.
    pub transform: Mat4,
    pub custom_index: u32,
    pub mask: u8,
    pub sbt_record_offset: u32,
    pub flags: vk::GeometryInstanceFlagsKHR,
    pub blas_address: vk::DeviceAddress,
}

impl InstancePlacement {
    /// Visible to every ray, two-sided, identity transform.
    pub fn new(blas_address: vk::DeviceAddress) -> Self {
        Self {
            transform: IDENTITY,
            custom_index: 0,
            mask: 0xFF,
            sbt_record_offset: 0,
            flags: vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
            blas_address,
        }
    }

    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_custom_index(mut self, custom_index: u32) -> Self {
        self.custom_index = custom_index;
        self
    }

    pub fn with_mask(mut self, mask: u8) -> Self {
        self.mask = mask;
        self
    }

    pub fn with_sbt_offset(mut self, offset: u32, flags: vk::GeometryInstanceFlagsKHR) -> Self {
        self.sbt_record_offset = offset;
        self.flags = flags;
        self
    }

    /// Pack into the device record. `index` is only used for error reporting.
    pub fn to_rt_instance(&self, index: usize) -> Result<RtInstance> {
        let check = |field: &'static str, value: u32| {
            if value > MAX_INSTANCE_FIELD {
                Err(VulkanError::InstanceFieldOverflow { instance: index, field, value })
            } else {
                Ok(value)
            }
        };
        let custom_index = check("custom index", self.custom_index)?;
        let sbt_offset = check("sbt record offset", self.sbt_record_offset)?;

        Ok(RtInstance {
            transform: to_instance_transform(&self.transform),
            instance_custom_index_and_mask: ((self.mask as u32) << 24) | custom_index,
            instance_shader_binding_table_record_offset_and_flags: ((self.flags.as_raw() & 0xFF) << 24) | sbt_offset,
            acceleration_structure_reference: self.blas_address,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vulkan::raytracing::transform::translation;

    #[test]
    fn test_record_is_64_bytes_and_packed() {
        assert_eq!(std::mem::size_of::<RtInstance>(), 64);
        assert_eq!(std::mem::align_of::<RtInstance>(), 8);

        let instance = InstancePlacement::new(0xABCD_0000).to_rt_instance(0).unwrap();
        let bytes = bytemuck::bytes_of(&instance);
        assert_eq!(&bytes[56..64], &0xABCD_0000u64.to_ne_bytes());
    }

    #[test]
    fn test_default_placement_is_visible_and_two_sided() {
        let instance = InstancePlacement::new(0x1000).to_rt_instance(0).unwrap();
        assert_eq!(instance.mask(), 0xFF);
        assert_eq!(instance.custom_index(), 0);
        assert_eq!(instance.flags(), vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE);
        assert_eq!(instance.acceleration_structure_reference, 0x1000);
    }

    #[test]
    fn test_fields_pack_into_upper_and_lower_bits() {
        let instance = InstancePlacement::new(0x2000)
            .with_custom_index(0x12_3456)
            .with_mask(0x0F)
            .with_sbt_offset(3, vk::GeometryInstanceFlagsKHR::FORCE_OPAQUE)
            .to_rt_instance(0)
            .unwrap();

        assert_eq!(instance.instance_custom_index_and_mask, 0x0F12_3456);
        assert_eq!(instance.custom_index(), 0x12_3456);
        assert_eq!(instance.mask(), 0x0F);
        assert_eq!(instance.sbt_record_offset(), 3);
        assert_eq!(instance.flags(), vk::GeometryInstanceFlagsKHR::FORCE_OPAQUE);
    }

    #[test]
    fn test_transform_is_converted_to_row_major() {
        let instance = InstancePlacement::new(0x3000)
            .with_transform(translation(1.0, 2.0, 3.0))
            .to_rt_instance(0)
            .unwrap();
        assert_eq!(instance.transform[0], [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(instance.transform[1], [0.0, 1.0, 0.0, 2.0]);
        assert_eq!(instance.transform[2], [0.0, 0.0, 1.0, 3.0]);
    }

    #[test]
    fn test_oversized_fields_rejected() {
        let result = InstancePlacement::new(0x4000).with_custom_index(1 << 24).to_rt_instance(5);
        assert_eq!(
            result.unwrap_err(),
            VulkanError::InstanceFieldOverflow { instance: 5, field: "custom index", value: 1 << 24 }
        );

        let result = InstancePlacement::new(0x4000)
            .with_sbt_offset(MAX_INSTANCE_FIELD + 1, vk::GeometryInstanceFlagsKHR::empty())
            .to_rt_instance(2);
        assert!(matches!(result, Err(VulkanError::InstanceFieldOverflow { instance: 2, .. })));

        assert!(InstancePlacement::new(0x4000).with_custom_index(MAX_INSTANCE_FIELD).to_rt_instance(0).is_ok());
    }
}
