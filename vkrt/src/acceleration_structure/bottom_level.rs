use super::{
    AccelerationStructure, AccelerationStructureType, BuildAccelerationStructureFlags,
    GeometryDescriptor, Mesh,
};
use crate::{device::Device, Validated, VulkanError};
use std::{ops::Deref, sync::Arc};

/// An acceleration structure over the triangles of one [`Mesh`].
#[derive(Debug)]
pub struct BottomLevelAccelerationStructure {
    inner: AccelerationStructure,
    geometry: GeometryDescriptor,
}

impl BottomLevelAccelerationStructure {
    /// Builds a bottom-level acceleration structure over `mesh` and waits for the build to
    /// finish.
    pub fn new(
        device: Arc<dyn Device>,
        mesh: &Mesh,
        flags: BuildAccelerationStructureFlags,
    ) -> Result<Self, Validated<VulkanError>> {
        let geometry = GeometryDescriptor::from_mesh(mesh);
        let inner = AccelerationStructure::build(
            &device,
            AccelerationStructureType::BottomLevel,
            &geometry.to_vk(),
            geometry.build_range(),
            flags,
        )?;

        Ok(BottomLevelAccelerationStructure { inner, geometry })
    }

    /// Returns the geometry the structure was built from.
    #[inline]
    pub fn geometry(&self) -> &GeometryDescriptor {
        &self.geometry
    }
}

impl Deref for BottomLevelAccelerationStructure {
    type Target = AccelerationStructure;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
