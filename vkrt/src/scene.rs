//! The geometry a ray tracing pipeline traces against.
//!
//! A [`Scene`] owns a list of meshes, one bottom-level acceleration structure per mesh, and one
//! top-level acceleration structure instancing all of them. The structures are built when the
//! scene is created, bottom-level first, and are released when it is dropped.

pub use crate::acceleration_structure::{Mesh, Vertex};
use crate::{
    acceleration_structure::{
        BottomLevelAccelerationStructure, BuildAccelerationStructureFlags,
        TopLevelAccelerationStructure,
    },
    device::{Device, DeviceOwned},
    NonExhaustive, Validated, VulkanError,
};
use std::sync::Arc;

/// Parameters to create a new [`Scene`].
#[derive(Debug)]
pub struct SceneCreateInfo {
    /// The meshes of the scene. Mesh `i` becomes the instance with custom index `i`.
    ///
    /// The default value is empty.
    pub meshes: Vec<Mesh>,

    /// The flags every acceleration structure of the scene is built with.
    ///
    /// The default value is `PREFER_FAST_TRACE`.
    pub build_flags: BuildAccelerationStructureFlags,

    pub _ne: NonExhaustive,
}

impl Default for SceneCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            meshes: Vec::new(),
            build_flags: BuildAccelerationStructureFlags::PREFER_FAST_TRACE,
            _ne: NonExhaustive(()),
        }
    }
}

impl SceneCreateInfo {
    /// Returns a `SceneCreateInfo` with the specified `meshes`.
    #[inline]
    pub fn meshes(meshes: Vec<Mesh>) -> Self {
        Self {
            meshes,
            ..Default::default()
        }
    }
}

/// A set of meshes and the acceleration structures built over them.
#[derive(Debug)]
pub struct Scene {
    device: Arc<dyn Device>,
    // Declared before `bottom_level` so that it is dropped first.
    top_level: TopLevelAccelerationStructure,
    bottom_level: Vec<BottomLevelAccelerationStructure>,
    meshes: Vec<Mesh>,
}

impl Scene {
    /// Builds the acceleration structures for `create_info.meshes`.
    ///
    /// Every bottom-level build completes before the top-level build starts. If any build fails,
    /// the structures built so far are released and the error is returned.
    pub fn new(
        device: Arc<dyn Device>,
        create_info: SceneCreateInfo,
    ) -> Result<Scene, Validated<VulkanError>> {
        let SceneCreateInfo {
            meshes,
            build_flags,
            _ne: _,
        } = create_info;

        if meshes.is_empty() {
            log::warn!("building a scene without meshes, rays will never hit anything");
        }

        let bottom_level = meshes
            .iter()
            .enumerate()
            .map(|(index, mesh)| {
                BottomLevelAccelerationStructure::new(device.clone(), mesh, build_flags)
                    .map_err(|err| match err {
                        Validated::ValidationError(err) => err
                            .add_context(format!("create_info.meshes[{index}]"))
                            .into(),
                        err => err,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let top_level =
            TopLevelAccelerationStructure::new(device.clone(), &bottom_level, build_flags)?;

        let triangle_count: u64 = bottom_level
            .iter()
            .map(|blas| u64::from(blas.primitive_count()))
            .sum();
        log::info!(
            "scene built: {} meshes, {triangle_count} triangles, top level at {:#x}",
            bottom_level.len(),
            top_level.device_address(),
        );

        Ok(Scene {
            device,
            top_level,
            bottom_level,
            meshes,
        })
    }

    /// Returns the meshes of the scene.
    #[inline]
    pub fn meshes(&self) -> &[Mesh] {
        &self.meshes
    }

    /// Returns the bottom-level acceleration structures, in mesh order.
    #[inline]
    pub fn bottom_level(&self) -> &[BottomLevelAccelerationStructure] {
        &self.bottom_level
    }

    /// Returns the top-level acceleration structure.
    #[inline]
    pub fn top_level(&self) -> &TopLevelAccelerationStructure {
        &self.top_level
    }
}

unsafe impl DeviceOwned for Scene {
    #[inline]
    fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }
}
