use std::mem;

use bytemuck::cast_slice;
use derivative::Derivative;

use crate::gpu;
use crate::{Blases, Geometries, PrimitiveId, Primitives, Scene};

/// Flags every top structure is built with; updatable so that per-frame
/// transform changes refit instead of rebuilding.
const FLAGS: gpu::BuildFlags = gpu::BuildFlags::PREFER_FAST_TRACE
    .union(gpu::BuildFlags::ALLOW_UPDATE);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TlasState {
    /// No structure exists yet.
    #[default]
    Absent,

    /// Freshly built from the current visible set.
    Built,

    /// Refit in place since the last fresh build.
    Updated,
}

/// Builds and owns the scene-wide top structure: the instance-descriptor
/// buffer, the result buffer and the scratch both kinds of build share.
///
/// The host keeps its own copy of the descriptor array; an update diffs
/// the fresh descriptors against it and uploads only the runs that
/// moved, falling back to a full rebuild when the set of surviving
/// instances itself changed.
#[derive(Debug, Derivative)]
#[derivative(Default(bound = ""))]
pub struct Tlas<D>
where
    D: gpu::Device,
{
    state: TlasState,
    instances: Vec<gpu::TlasInstance>,
    signature: Vec<(u32, PrimitiveId)>,
    instance_buffer: Option<D::Buffer>,
    result: Option<D::Buffer>,
    scratch: Option<D::Buffer>,
    scratch_size: u64,
    sizes: gpu::BuildSizes,
}

impl<D> Tlas<D>
where
    D: gpu::Device,
{
    /// Builds the top structure afresh over every surviving instance,
    /// replacing any previous one.
    ///
    /// Bottom structures must be built and their submissions completed
    /// first; likewise any submission still reading the previous top
    /// structure must have completed, since its buffers are freed here.
    pub fn build(
        &mut self,
        device: &D,
        rec: &mut D::Recording,
        scene: &Scene,
        primitives: &Primitives,
        geometries: &Geometries<D>,
        blases: &mut Blases<D>,
    ) -> gpu::Result<()> {
        blases.settle();

        let (instances, signature) =
            Self::collect(device, scene, primitives, geometries, blases);

        self.build_fresh(device, rec, instances, signature)
    }

    /// Refreshes the top structure after transforms or bottom structures
    /// changed, refitting in place when the set of surviving instances
    /// is the one the structure was built over and rebuilding otherwise.
    ///
    /// The refit is recorded even when no descriptor moved: refit bottom
    /// structures change the bounds behind the existing addresses, and
    /// the top structure has to re-read them either way.
    pub fn update(
        &mut self,
        device: &D,
        rec: &mut D::Recording,
        scene: &Scene,
        primitives: &Primitives,
        geometries: &Geometries<D>,
        blases: &mut Blases<D>,
    ) -> gpu::Result<()> {
        blases.settle();

        let (instances, signature) =
            Self::collect(device, scene, primitives, geometries, blases);

        if self.state == TlasState::Absent || signature != self.signature {
            log::debug!(
                "Visible set changed; building the top structure afresh",
            );

            return self.build_fresh(device, rec, instances, signature);
        }

        let mut ranges = 0;
        let mut index = 0;

        while index < instances.len() {
            if instances[index] == self.instances[index] {
                index += 1;
                continue;
            }

            let start = index;

            while index < instances.len()
                && instances[index] != self.instances[index]
            {
                index += 1;
            }

            let Some(buffer) = &self.instance_buffer else {
                unreachable!();
            };

            device.upload(
                rec,
                cast_slice(&instances[start..index]),
                buffer,
                (start * mem::size_of::<gpu::TlasInstance>()) as u64,
            );

            ranges += 1;
        }

        if ranges > 0 {
            // The refit reads what the uploads wrote
            device.record_barrier(rec);
        }

        log::debug!(
            "Updating top structure; instances = {}, changed ranges = {}",
            instances.len(),
            ranges,
        );

        let geometry = gpu::GeometryDesc::Instances {
            instances: self
                .instance_buffer
                .as_ref()
                .map(|buffer| device.address(buffer))
                .unwrap_or_default(),
            instance_count: instances.len() as u32,
        };

        self.grow_scratch(device, self.sizes.update_scratch_size)?;

        let Some(scratch) = &self.scratch else {
            unreachable!();
        };

        let Some(result) = &self.result else {
            unreachable!();
        };

        device.record_structure_build(
            rec,
            &gpu::StructureBuild {
                geometry,
                mode: gpu::BuildMode::Refit,
                flags: FLAGS,
                dst: result,
                scratch,
            },
        );

        device.record_barrier(rec);

        self.instances = instances;
        self.state = TlasState::Updated;

        Ok(())
    }

    /// Packs a descriptor for every surviving instance: visible, valid
    /// geometry, at least one triangle. Returns the descriptors plus the
    /// survivors' identity, which is what decides rebuild-vs-refit.
    fn collect(
        device: &D,
        scene: &Scene,
        primitives: &Primitives,
        geometries: &Geometries<D>,
        blases: &Blases<D>,
    ) -> (Vec<gpu::TlasInstance>, Vec<(u32, PrimitiveId)>) {
        let mut instances = Vec::new();
        let mut signature = Vec::new();

        for (index, instance) in scene.instances.iter().enumerate() {
            if !instance.visible {
                continue;
            }

            let Some(primitive) =
                scene.primitives.get(instance.primitive as usize)
            else {
                log::warn!(
                    "Skipping instance {}; it references primitive {} \
                     which isn't part of the scene",
                    index,
                    instance.primitive,
                );

                continue;
            };

            let Some(id) = primitives.lookup(&primitive.key()) else {
                log::warn!(
                    "Skipping instance {}; its geometry hasn't been \
                     uploaded",
                    index,
                );

                continue;
            };

            let Some(geometry) = geometries.get(id) else {
                log::debug!(
                    "Skipping instance {}; primitive {} has no device \
                     geometry",
                    index,
                    id.get(),
                );

                continue;
            };

            if geometry.triangle_count() == 0 {
                log::debug!(
                    "Skipping instance {}; primitive {} has no triangles",
                    index,
                    id.get(),
                );

                continue;
            }

            let Some(address) = blases.built_address(device, id) else {
                panic!(
                    "instance {} references primitive {} which has no \
                     bottom structure; declare and build the bottom \
                     structures first",
                    index,
                    id.get(),
                );
            };

            instances.push(gpu::TlasInstance::new(
                instance.transform,
                instance.custom_index,
                instance.flags(),
                address,
            ));

            signature.push((index as u32, id));
        }

        (instances, signature)
    }

    fn build_fresh(
        &mut self,
        device: &D,
        rec: &mut D::Recording,
        instances: Vec<gpu::TlasInstance>,
        signature: Vec<(u32, PrimitiveId)>,
    ) -> gpu::Result<()> {
        log::info!(
            "Building top structure; instances = {}",
            instances.len(),
        );

        let instance_buffer = if instances.is_empty() {
            None
        } else {
            Some(device.allocate_buffer(
                (instances.len() * mem::size_of::<gpu::TlasInstance>())
                    as u64,
                gpu::BufferUsages::INSTANCE_INPUT | gpu::BufferUsages::UPLOAD,
                "trellis_tlas_instances",
            )?)
        };

        let geometry = gpu::GeometryDesc::Instances {
            instances: instance_buffer
                .as_ref()
                .map(|buffer| device.address(buffer))
                .unwrap_or_default(),
            instance_count: instances.len() as u32,
        };

        let sizes = device.structure_build_sizes(&geometry, FLAGS);

        let result = device.allocate_buffer(
            sizes.result_size,
            gpu::BufferUsages::STRUCTURE,
            "trellis_tlas",
        )?;

        self.grow_scratch(device, sizes.scratch_size)?;

        // Allocations are done; nothing past this point can fail, so the
        // recording and the committed fields stay consistent
        if let Some(buffer) = &instance_buffer {
            device.upload(rec, cast_slice(&instances), buffer, 0);

            // The build reads what the upload wrote
            device.record_barrier(rec);
        }

        let Some(scratch) = &self.scratch else {
            unreachable!();
        };

        device.record_structure_build(
            rec,
            &gpu::StructureBuild {
                geometry,
                mode: gpu::BuildMode::Build,
                flags: FLAGS,
                dst: &result,
                scratch,
            },
        );

        device.record_barrier(rec);

        self.instance_buffer = instance_buffer;
        self.result = Some(result);
        self.sizes = sizes;
        self.instances = instances;
        self.signature = signature;
        self.state = TlasState::Built;

        Ok(())
    }

    fn grow_scratch(&mut self, device: &D, size: u64) -> gpu::Result<()> {
        if self.scratch.is_some() && size <= self.scratch_size {
            return Ok(());
        }

        let size = size.max(self.scratch_size);

        self.scratch = Some(device.allocate_buffer(
            size,
            gpu::BufferUsages::SCRATCH,
            "trellis_tlas_scratch",
        )?);

        self.scratch_size = size;

        Ok(())
    }

    pub fn state(&self) -> TlasState {
        self.state
    }

    /// The structure buffer, once one has been built.
    pub fn buffer(&self) -> Option<&D::Buffer> {
        self.result.as_ref()
    }

    /// Host copy of the device-side descriptor array.
    pub fn instances(&self) -> &[gpu::TlasInstance] {
        &self.instances
    }

    pub fn clear(&mut self) {
        self.state = TlasState::Absent;
        self.instances = Vec::new();
        self.signature = Vec::new();
        self.instance_buffer = None;
        self.result = None;
        self.scratch = None;
        self.scratch_size = 0;
        self.sizes = gpu::BuildSizes::default();
    }
}
