use glam::Affine3A;
use trellis_gpu::InstanceFlags;

use crate::{Accessor, AccessorError};

/// Host-side description of a scene, as produced by an asset loader.
///
/// All cross-references are plain indices: primitives point at accessors,
/// accessors point at buffers, instances point at primitives. The engine
/// never stores references into this struct, so callers are free to keep
/// mutating it between frames (e.g. for animation).
#[derive(Clone, Debug, Default)]
pub struct Scene {
    pub buffers: Vec<Vec<u8>>,
    pub accessors: Vec<Accessor>,
    pub primitives: Vec<ScenePrimitive>,
    pub instances: Vec<SceneInstance>,
}

impl Scene {
    pub fn accessor(&self, id: u32) -> Result<Accessor, AccessorError> {
        self.accessors
            .get(id as usize)
            .copied()
            .ok_or(AccessorError::UnknownAccessor(id))
    }
}

/// One renderable primitive of a mesh; attribute fields are accessor ids.
///
/// Position is the only mandatory attribute. `normal_mapped` says whether
/// the primitive's material carries a normal texture, which decides
/// whether missing tangents get synthesized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScenePrimitive {
    pub mesh: u32,
    pub positions: u32,
    pub normals: Option<u32>,
    pub tangents: Option<u32>,
    pub uvs_0: Option<u32>,
    pub uvs_1: Option<u32>,
    pub colors: Option<u32>,
    pub indices: Option<u32>,
    pub normal_mapped: bool,
}

impl ScenePrimitive {
    pub fn new(mesh: u32, positions: u32) -> Self {
        Self {
            mesh,
            positions,
            normals: None,
            tangents: None,
            uvs_0: None,
            uvs_1: None,
            colors: None,
            indices: None,
            normal_mapped: false,
        }
    }

    /// Structural identity of this primitive's geometry.
    ///
    /// Two primitives with equal keys reference byte-for-byte the same
    /// vertex and index data and so can share device resources.
    pub fn key(&self) -> GeometryKey {
        GeometryKey {
            mesh: self.mesh,
            indices: self.indices,
            positions: self.positions,
            normals: self.normals,
            tangents: self.tangents,
            uvs_0: self.uvs_0,
            uvs_1: self.uvs_1,
            colors: self.colors,
        }
    }
}

/// Identity of a primitive's geometry: the owning mesh plus the full set
/// of accessor ids it reads from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GeometryKey {
    pub mesh: u32,
    pub indices: Option<u32>,
    pub positions: u32,
    pub normals: Option<u32>,
    pub tangents: Option<u32>,
    pub uvs_0: Option<u32>,
    pub uvs_1: Option<u32>,
    pub colors: Option<u32>,
}

/// One node instantiating a primitive somewhere in the world.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SceneInstance {
    /// Index into [`Scene::primitives`].
    pub primitive: u32,
    pub transform: Affine3A,
    pub visible: bool,

    /// Application-defined value (usually a material id) surfaced to
    /// shaders through the instance descriptor; truncated to 24 bits.
    pub custom_index: u32,

    pub double_sided: bool,
    pub opaque: bool,
}

impl SceneInstance {
    pub fn new(primitive: u32, transform: Affine3A) -> Self {
        Self {
            primitive,
            transform,
            visible: true,
            custom_index: 0,
            double_sided: false,
            opaque: true,
        }
    }

    pub fn flags(&self) -> InstanceFlags {
        let mut flags = InstanceFlags::empty();

        if self.double_sided {
            flags |= InstanceFlags::CULL_DISABLE;
        }

        if self.opaque {
            flags |= InstanceFlags::FORCE_OPAQUE;
        }

        flags
    }
}
