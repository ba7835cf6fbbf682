use std::fmt;
use std::mem;

use bytemuck::cast_slice;
use derivative::Derivative;
use glam::{Vec2, Vec3, Vec4};
use trellis_gpu::{
    self as gpu, BufferUsages, Device, GeometryDesc, GeometryUploader,
};

use crate::{
    create_tangents, AccessorError, PrimitiveId, Primitives, Scene,
    ScenePrimitive,
};

/// Builds and owns the per-primitive device resources: one buffer per
/// present vertex attribute plus one for indices.
///
/// Slots line up with [`PrimitiveId`]s, so uploading after the registry
/// has grown only touches the newly interned primitives.
#[derive(Debug, Derivative)]
#[derivative(Default(bound = ""))]
pub struct Geometries<D>
where
    D: Device,
{
    slots: Vec<GeometrySlot<D::Buffer>>,
}

impl<D> Geometries<D>
where
    D: Device,
{
    /// Creates device resources for every primitive interned since the
    /// previous call, recording the uploads into `rec`.
    ///
    /// A primitive with malformed data is flagged invalid and skipped;
    /// running out of device memory aborts the whole load.
    pub fn upload(
        &mut self,
        device: &D,
        rec: &mut D::Recording,
        uploader: &impl GeometryUploader<D>,
        scene: &Scene,
        primitives: &Primitives,
    ) -> gpu::Result<()> {
        for (id, unique) in primitives.iter().skip(self.slots.len()) {
            let Some(primitive) =
                scene.primitives.get(unique.source() as usize)
            else {
                log::warn!(
                    "Skipping primitive {}; its scene primitive is gone",
                    id.get(),
                );

                self.slots.push(GeometrySlot::Invalid);
                continue;
            };

            let slot = match extract(scene, primitive) {
                Ok(host) => {
                    log::debug!(
                        "Uploading primitive {}; vertices={}, triangles={}",
                        id.get(),
                        host.positions.len(),
                        host.triangle_count,
                    );

                    GeometrySlot::Ready(
                        upload_streams(device, rec, uploader, id, host)?,
                    )
                }

                Err(err) => {
                    log::warn!("Skipping primitive {}; {}", id.get(), err);

                    GeometrySlot::Invalid
                }
            };

            self.slots.push(slot);
        }

        Ok(())
    }

    /// Re-extracts and re-uploads the deforming streams (positions,
    /// normals, synthesized tangents) of an already-uploaded primitive
    /// into its existing buffers.
    ///
    /// Returns `false` without recording anything when the primitive is
    /// invalid or its re-extracted data no longer matches the uploaded
    /// shape.
    pub fn reupload_deformed(
        &self,
        device: &D,
        rec: &mut D::Recording,
        scene: &Scene,
        primitives: &Primitives,
        id: PrimitiveId,
    ) -> bool {
        let Some(geometry) = self.get(id) else {
            return false;
        };

        let Some(primitive) =
            scene.primitives.get(primitives[id].source() as usize)
        else {
            log::warn!(
                "Skipping refit of primitive {}; its scene primitive is gone",
                id.get(),
            );

            return false;
        };

        let host = match extract(scene, primitive) {
            Ok(host) => host,

            Err(err) => {
                log::warn!(
                    "Skipping refit of primitive {}; {}",
                    id.get(),
                    err,
                );

                return false;
            }
        };

        if host.positions.len() as u32 != geometry.vertex_count
            || host.triangle_count != geometry.triangle_count
        {
            log::warn!(
                "Skipping refit of primitive {}; \
                 its vertex or index data changed shape",
                id.get(),
            );

            return false;
        }

        device.upload(rec, cast_slice(&host.positions), &geometry.positions, 0);

        if let (Some(buffer), Some(normals)) =
            (&geometry.normals, &host.normals)
        {
            device.upload(rec, cast_slice(normals), buffer, 0);
        }

        if geometry.synthesized_tangents {
            if let (Some(buffer), Some(tangents)) =
                (&geometry.tangents, &host.tangents)
            {
                device.upload(rec, cast_slice(tangents), buffer, 0);
            }
        }

        true
    }

    /// Resources of the given primitive; `None` if it was flagged
    /// invalid or hasn't been uploaded yet.
    pub fn get(&self, id: PrimitiveId) -> Option<&Geometry<D::Buffer>> {
        match self.slots.get(id.get() as usize)? {
            GeometrySlot::Ready(geometry) => Some(geometry),
            GeometrySlot::Invalid => None,
        }
    }

    pub fn is_invalid(&self, id: PrimitiveId) -> bool {
        matches!(
            self.slots.get(id.get() as usize),
            Some(GeometrySlot::Invalid)
        )
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn invalid_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, GeometrySlot::Invalid))
            .count()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

#[derive(Debug)]
enum GeometrySlot<B> {
    Ready(Geometry<B>),
    Invalid,
}

/// Device resources of one unique primitive.
///
/// Optional buffers are either fully absent or fully populated; their
/// addresses stay valid until the whole geometry is dropped.
#[derive(Debug)]
pub struct Geometry<B> {
    positions: B,
    normals: Option<B>,
    tangents: Option<B>,
    uvs_0: Option<B>,
    uvs_1: Option<B>,
    colors: Option<B>,
    indices: Option<B>,
    vertex_count: u32,
    triangle_count: u32,
    synthesized_tangents: bool,
}

impl<B> Geometry<B> {
    pub fn positions(&self) -> &B {
        &self.positions
    }

    pub fn normals(&self) -> Option<&B> {
        self.normals.as_ref()
    }

    pub fn tangents(&self) -> Option<&B> {
        self.tangents.as_ref()
    }

    pub fn uvs_0(&self) -> Option<&B> {
        self.uvs_0.as_ref()
    }

    pub fn uvs_1(&self) -> Option<&B> {
        self.uvs_1.as_ref()
    }

    pub fn colors(&self) -> Option<&B> {
        self.colors.as_ref()
    }

    pub fn indices(&self) -> Option<&B> {
        self.indices.as_ref()
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn triangle_count(&self) -> u32 {
        self.triangle_count
    }

    pub fn has_synthesized_tangents(&self) -> bool {
        self.synthesized_tangents
    }

    /// Triangle-geometry description for building this primitive's
    /// bottom structure; `None` when there is nothing to build.
    pub fn triangle_desc<D>(&self, device: &D) -> Option<GeometryDesc>
    where
        D: Device<Buffer = B>,
    {
        let indices = self.indices.as_ref()?;

        Some(GeometryDesc::Triangles {
            positions: device.address(&self.positions),
            position_stride: mem::size_of::<Vec3>() as u64,
            vertex_count: self.vertex_count,
            indices: device.address(indices),
            triangle_count: self.triangle_count,
        })
    }
}

fn upload_streams<D>(
    device: &D,
    rec: &mut D::Recording,
    uploader: &impl GeometryUploader<D>,
    id: PrimitiveId,
    host: HostGeometry,
) -> gpu::Result<Geometry<D::Buffer>>
where
    D: Device,
{
    let mut upload = |stream: &str, data: &[u8]| {
        uploader.upload_bytes(
            device,
            rec,
            &format!("trellis_prim_{}_{}", id.get(), stream),
            data,
            BufferUsages::GEOMETRY_INPUT,
        )
    };

    Ok(Geometry {
        positions: upload("positions", cast_slice(&host.positions))?,

        normals: host
            .normals
            .as_deref()
            .map(|data| upload("normals", cast_slice(data)))
            .transpose()?,

        tangents: host
            .tangents
            .as_deref()
            .map(|data| upload("tangents", cast_slice(data)))
            .transpose()?,

        uvs_0: host
            .uvs_0
            .as_deref()
            .map(|data| upload("uvs_0", cast_slice(data)))
            .transpose()?,

        uvs_1: host
            .uvs_1
            .as_deref()
            .map(|data| upload("uvs_1", cast_slice(data)))
            .transpose()?,

        colors: host
            .colors
            .as_deref()
            .map(|data| upload("colors", cast_slice(data)))
            .transpose()?,

        indices: host
            .indices
            .as_deref()
            .map(|data| upload("indices", cast_slice(data)))
            .transpose()?,

        vertex_count: host.positions.len() as u32,
        triangle_count: host.triangle_count,
        synthesized_tangents: host.synthesized_tangents,
    })
}

/// Attribute and index streams extracted to host memory, ready for
/// upload.
struct HostGeometry {
    positions: Vec<Vec3>,
    normals: Option<Vec<Vec3>>,
    tangents: Option<Vec<Vec4>>,
    uvs_0: Option<Vec<Vec2>>,
    uvs_1: Option<Vec<Vec2>>,
    colors: Option<Vec<u32>>,
    indices: Option<Vec<u32>>,
    triangle_count: u32,
    synthesized_tangents: bool,
}

fn extract(
    scene: &Scene,
    primitive: &ScenePrimitive,
) -> Result<HostGeometry, ExtractError> {
    let positions =
        scene.accessor(primitive.positions)?.read_vec3s(&scene.buffers)?;

    if positions.is_empty() {
        return Err(ExtractError::NoVertices);
    }

    let vertex_count = positions.len() as u32;

    let normals = primitive
        .normals
        .map(|id| -> Result<_, ExtractError> {
            let normals = scene.accessor(id)?.read_vec3s(&scene.buffers)?;

            check_len("normal", normals.len(), vertex_count)?;

            Ok(normals)
        })
        .transpose()?;

    let uvs_0 = primitive
        .uvs_0
        .map(|id| -> Result<_, ExtractError> {
            let uvs = scene.accessor(id)?.read_vec2s(&scene.buffers)?;

            check_len("uv0", uvs.len(), vertex_count)?;

            Ok(uvs)
        })
        .transpose()?;

    let uvs_1 = primitive
        .uvs_1
        .map(|id| -> Result<_, ExtractError> {
            let uvs = scene.accessor(id)?.read_vec2s(&scene.buffers)?;

            check_len("uv1", uvs.len(), vertex_count)?;

            Ok(uvs)
        })
        .transpose()?;

    let colors = primitive
        .colors
        .map(|id| -> Result<_, ExtractError> {
            let colors = scene.accessor(id)?.read_colors(&scene.buffers)?;

            check_len("color", colors.len(), vertex_count)?;

            Ok(colors.into_iter().map(pack_unorm4x8).collect::<Vec<_>>())
        })
        .transpose()?;

    let mut tangents = primitive
        .tangents
        .map(|id| -> Result<_, ExtractError> {
            let tangents = scene.accessor(id)?.read_vec4s(&scene.buffers)?;

            check_len("tangent", tangents.len(), vertex_count)?;

            Ok(tangents)
        })
        .transpose()?;

    // An explicitly empty index stream means zero triangles; only a
    // primitive with no index accessor at all gets sequential indices.
    let indices = match primitive.indices {
        Some(id) => {
            let indices =
                scene.accessor(id)?.read_indices(&scene.buffers)?;

            if let Some(&index) =
                indices.iter().find(|&&index| index >= vertex_count)
            {
                return Err(ExtractError::IndexOutOfRange {
                    index,
                    vertex_count,
                });
            }

            let triangles = indices.len() / 3;

            (triangles > 0).then(|| indices[0..triangles * 3].to_vec())
        }

        None => {
            let triangles = vertex_count / 3;

            (triangles > 0).then(|| (0..triangles * 3).collect())
        }
    };

    let triangle_count =
        indices.as_ref().map_or(0, |indices| indices.len() as u32 / 3);

    let mut synthesized_tangents = false;

    if primitive.normal_mapped && tangents.is_none() {
        tangents = Some(create_tangents(
            &positions,
            normals.as_deref(),
            uvs_0.as_deref(),
            indices.as_deref().unwrap_or(&[]),
        ));

        synthesized_tangents = true;
    }

    Ok(HostGeometry {
        positions,
        normals,
        tangents,
        uvs_0,
        uvs_1,
        colors,
        indices,
        triangle_count,
        synthesized_tangents,
    })
}

fn check_len(
    stream: &'static str,
    found: usize,
    vertex_count: u32,
) -> Result<(), ExtractError> {
    if found as u32 == vertex_count {
        Ok(())
    } else {
        Err(ExtractError::CountMismatch {
            stream,
            expected: vertex_count,
            found,
        })
    }
}

/// 8-bit unorm RGBA packing, lowest byte first.
fn pack_unorm4x8(color: Vec4) -> u32 {
    let color =
        (color.clamp(Vec4::ZERO, Vec4::ONE) * 255.0).round().as_uvec4();

    color.x | (color.y << 8) | (color.z << 16) | (color.w << 24)
}

enum ExtractError {
    Accessor(AccessorError),
    NoVertices,
    CountMismatch {
        stream: &'static str,
        expected: u32,
        found: usize,
    },
    IndexOutOfRange {
        index: u32,
        vertex_count: u32,
    },
}

impl From<AccessorError> for ExtractError {
    fn from(err: AccessorError) -> Self {
        Self::Accessor(err)
    }
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractError::Accessor(err) => write!(f, "{}", err),
            ExtractError::NoVertices => {
                write!(f, "its position stream is empty")
            }
            ExtractError::CountMismatch {
                stream,
                expected,
                found,
            } => {
                write!(
                    f,
                    "its {} stream has {} elements instead of {}",
                    stream, found, expected,
                )
            }
            ExtractError::IndexOutOfRange {
                index,
                vertex_count,
            } => {
                write!(
                    f,
                    "index {} points past its {} vertices",
                    index, vertex_count,
                )
            }
        }
    }
}
