//! Triangle geometry descriptors for bottom-level builds.
//!
//! Meshes come from the scene store as device addresses and counts. Only the
//! position attribute is visible to the builder: it must be the first field of
//! the vertex record, or the mesh must report its byte offset through
//! [`TriangleMesh::position_offset`]. A layout where position is not first and
//! no offset is given produces undefined geometry; this is not detected.

use ash::vk;

/// A mesh stored in device memory with 32-bit indices.
pub trait TriangleMesh {
    fn vertex_address(&self) -> vk::DeviceAddress;
    fn vertex_stride(&self) -> vk::DeviceSize;
    fn vertex_count(&self) -> u32;
    fn index_address(&self) -> vk::DeviceAddress;
    fn index_count(&self) -> u32;

    /// Byte offset of the `vec3` position inside one vertex.
    fn position_offset(&self) -> vk::DeviceSize {
        0
    }

    fn is_opaque(&self) -> bool {
        true
    }
}

/// Triangle geometry as seen by the structure builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryDescriptor {
    pub vertex_address: vk::DeviceAddress,
    pub vertex_stride: vk::DeviceSize,
    pub vertex_count: u32,
    pub index_address: vk::DeviceAddress,
    pub index_count: u32,
    pub position_offset: vk::DeviceSize,
    pub opaque: bool,
}

impl GeometryDescriptor {
    pub fn primitive_count(&self) -> u32 {
        self.index_count / 3
    }

    pub fn to_vk(&self) -> vk::AccelerationStructureGeometryKHR<'static> {
        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
            .vertex_format(vk::Format::R32G32B32_SFLOAT)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: self.vertex_address + self.position_offset,
            })
            .vertex_stride(self.vertex_stride)
            .max_vertex(self.vertex_count.saturating_sub(1))
            .index_type(vk::IndexType::UINT32)
            .index_data(vk::DeviceOrHostAddressConstKHR { device_address: self.index_address });

        let flags = if self.opaque {
            vk::GeometryFlagsKHR::OPAQUE
        } else {
            vk::GeometryFlagsKHR::empty()
        };

        vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
            .flags(flags)
    }

    /// Build range covering every triangle, starting at the first vertex.
    pub fn build_range(&self) -> vk::AccelerationStructureBuildRangeInfoKHR {
        vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(self.primitive_count())
            .primitive_offset(0)
            .first_vertex(0)
            .transform_offset(0)
    }
}

/// One geometry with its build range.
#[derive(Debug, Clone, Copy)]
pub struct BlasGeometry {
    pub descriptor: GeometryDescriptor,
    pub range: vk::AccelerationStructureBuildRangeInfoKHR,
}

impl From<GeometryDescriptor> for BlasGeometry {
    fn from(descriptor: GeometryDescriptor) -> Self {
        Self {
            descriptor,
            range: descriptor.build_range(),
        }
    }
}

pub fn geometry_from_mesh<M: TriangleMesh + ?Sized>(mesh: &M) -> BlasGeometry {
    GeometryDescriptor {
        vertex_address: mesh.vertex_address(),
        vertex_stride: mesh.vertex_stride(),
        vertex_count: mesh.vertex_count(),
        index_address: mesh.index_address(),
        index_count: mesh.index_count(),
        position_offset: mesh.position_offset(),
        opaque: mesh.is_opaque(),
    }
    .into()
}

/// Geometry for one output bottom-level structure, plus its build flags.
#[derive(Debug, Clone)]
pub struct BlasInput {
    pub geometries: Vec<BlasGeometry>,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
}

impl BlasInput {
    pub fn new(flags: vk::BuildAccelerationStructureFlagsKHR) -> Self {
        Self {
            geometries: Vec::new(),
            flags,
        }
    }

    pub fn from_mesh<M: TriangleMesh + ?Sized>(mesh: &M, flags: vk::BuildAccelerationStructureFlagsKHR) -> Self {
        let mut input = Self::new(flags);
        input.push(geometry_from_mesh(mesh));
        input
    }

    /// Aggregate several meshes that share one transform into a single structure.
    pub fn from_meshes<'m, M, I>(meshes: I, flags: vk::BuildAccelerationStructureFlagsKHR) -> Self
    where
        M: TriangleMesh + ?Sized + 'm,
        I: IntoIterator<Item = &'m M>,
    {
        Self {
            geometries: meshes.into_iter().map(|mesh| geometry_from_mesh(mesh)).collect(),
            flags,
        }
    }

    pub fn push(&mut self, geometry: BlasGeometry) {
        self.geometries.push(geometry);
    }

    pub fn allows_compaction(&self) -> bool {
        self.flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION)
    }

    pub fn primitive_counts(&self) -> Vec<u32> {
        self.geometries.iter().map(|g| g.range.primitive_count).collect()
    }

    pub(crate) fn vk_geometries(&self) -> Vec<vk::AccelerationStructureGeometryKHR<'static>> {
        self.geometries.iter().map(|g| g.descriptor.to_vk()).collect()
    }

    pub(crate) fn ranges(&self) -> Vec<vk::AccelerationStructureBuildRangeInfoKHR> {
        self.geometries.iter().map(|g| g.range).collect()
    }
}
