use bytemuck::{Pod, Zeroable};
use glam::Affine3A;

use crate::{BuildFlags, InstanceFlags};

/// Raw device address of a buffer, or of the structure stored in one.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct DeviceAddress(pub u64);

/// Size requirements reported by the device for one structure.
///
/// Known only after a size query; `result_size` is the conservative
/// upper bound the build writes into, not the compacted size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BuildSizes {
    pub result_size: u64,
    pub scratch_size: u64,
    pub update_scratch_size: u64,
}

/// Geometry fed into one structure build.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GeometryDesc {
    /// Triangle list of a bottom structure; vertices are tightly packed
    /// `[f32; 3]` unless `position_stride` says otherwise, indices are
    /// always `u32`.
    Triangles {
        positions: DeviceAddress,
        position_stride: u64,
        vertex_count: u32,
        indices: DeviceAddress,
        triangle_count: u32,
    },

    /// Instance-descriptor array of a top structure.
    Instances {
        instances: DeviceAddress,
        instance_count: u32,
    },
}

impl GeometryDesc {
    /// Number of primitives (triangles or instances) this geometry builds
    /// over.
    pub fn primitive_count(&self) -> u32 {
        match self {
            GeometryDesc::Triangles { triangle_count, .. } => *triangle_count,
            GeometryDesc::Instances { instance_count, .. } => *instance_count,
        }
    }
}

/// Whether a recorded build creates the structure or refits it in place.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildMode {
    /// Full build from scratch.
    Build,

    /// In-place refit of an already-built structure; preserves topology,
    /// re-reads positions and transforms.
    Refit,
}

/// One structure-build command, as handed to the device.
#[derive(Debug)]
pub struct StructureBuild<'a, B> {
    pub geometry: GeometryDesc,
    pub mode: BuildMode,
    pub flags: BuildFlags,
    pub dst: &'a B,
    pub scratch: &'a B,
}

/// One entry of the top structure's instance array, in the exact 64-byte
/// layout the device consumes.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct TlasInstance {
    /// Row-major 3x4 world transform.
    pub transform: [f32; 12],

    /// Custom index in the low 24 bits, visibility mask in the high 8.
    pub custom_index_and_mask: u32,

    /// Shader-binding-table offset in the low 24 bits, [`InstanceFlags`]
    /// in the high 8.
    pub sbt_offset_and_flags: u32,

    /// Address of the bottom structure this instance refers to.
    pub blas_address: u64,
}

impl TlasInstance {
    /// Visibility mask carried by every descriptor; instances culled by
    /// the scene never make it into the array, so the mask stays fully
    /// open.
    pub const VISIBLE_MASK: u32 = 0xff;

    pub fn new(
        transform: Affine3A,
        custom_index: u32,
        flags: InstanceFlags,
        blas_address: DeviceAddress,
    ) -> Self {
        let m = transform.matrix3;
        let t = transform.translation;

        Self {
            transform: [
                m.x_axis.x, m.y_axis.x, m.z_axis.x, t.x, //
                m.x_axis.y, m.y_axis.y, m.z_axis.y, t.y, //
                m.x_axis.z, m.y_axis.z, m.z_axis.z, t.z,
            ],
            custom_index_and_mask: (custom_index & 0x00ff_ffff)
                | (Self::VISIBLE_MASK << 24),
            sbt_offset_and_flags: u32::from(flags.bits()) << 24,
            blas_address: blas_address.0,
        }
    }
}
