//! Turns parsed scenes into the two-level structure hardware ray tracing
//! consumes: unique primitives are interned and uploaded once, bottom
//! structures are built incrementally under a per-submission byte budget
//! and compacted to their device-reported size, and a top structure over
//! the visible instances is rebuilt or refit each frame.
//!
//! The pipeline records into caller-owned command recordings and never
//! submits by itself, so the caller keeps full control over submission
//! and fencing; see [`Engine`] for the call protocol.

mod accessor;
mod blas;
mod compactor;
mod geometries;
mod primitives;
mod scene;
mod tangents;
mod tlas;
mod utils;

pub use trellis_gpu as gpu;

pub use self::accessor::*;
pub use self::blas::*;
pub use self::compactor::*;
pub use self::geometries::*;
pub use self::primitives::*;
pub use self::scene::*;
pub use self::tangents::*;
pub use self::tlas::*;
pub use self::utils::*;

use crate::gpu::{Device, DirectUploader, GeometryUploader};

/// The whole pipeline behind one handle.
///
/// Scene loading: [`Self::upload_geometry`], [`Self::declare_blases`],
/// then [`Self::build_blases_step`] in a submit-and-wait loop until it
/// returns `false`; optionally [`Self::compact_blases`] (submit, wait)
/// followed by [`Self::destroy_non_compacted_blases`]; finally
/// [`Self::build_tlas`]. Per animated frame: [`Self::refit_blases`] for
/// deforming meshes, then [`Self::update_tlas`].
///
/// Dropping the engine frees every device resource it created; a scene
/// reload goes through [`Self::reset`] instead.
#[derive(Debug)]
pub struct Engine<D, U = DirectUploader>
where
    D: Device,
    U: GeometryUploader<D>,
{
    device: D,
    uploader: U,
    primitives: Primitives,
    geometries: Geometries<D>,
    blases: Blases<D>,
    compactor: Compactor<D>,
    tlas: Tlas<D>,
}

impl<D> Engine<D>
where
    D: Device,
{
    pub fn new(device: D) -> Self {
        Self::with_uploader(device, DirectUploader)
    }
}

impl<D, U> Engine<D, U>
where
    D: Device,
    U: GeometryUploader<D>,
{
    /// Swaps the upload path, e.g. for backends that stage through a
    /// transfer queue or register buffers with a bindless table.
    pub fn with_uploader(device: D, uploader: U) -> Self {
        log::info!("Initializing");

        Self {
            device,
            uploader,
            primitives: Primitives::default(),
            geometries: Geometries::default(),
            blases: Blases::default(),
            compactor: Compactor::default(),
            tlas: Tlas::default(),
        }
    }

    /// Interns the scene's primitives and uploads device resources for
    /// every one not seen before; primitives sharing their geometry
    /// share the uploaded buffers.
    pub fn upload_geometry(
        &mut self,
        rec: &mut D::Recording,
        scene: &Scene,
    ) -> gpu::Result<()> {
        let before = self.geometries.len();

        let (result, _tt) = utils::measure(|| {
            self.primitives.intern_scene(scene);

            self.geometries.upload(
                &self.device,
                rec,
                &self.uploader,
                scene,
                &self.primitives,
            )
        });

        if self.geometries.len() > before {
            // Builds recorded after this read what the uploads wrote
            self.device.record_barrier(rec);
        }

        #[cfg(feature = "metrics")]
        log::info!(
            "Uploaded geometry; primitives = {}, tt = {}",
            self.primitives.len(),
            humantime::format_duration(_tt),
        );

        result
    }

    /// Declares a bottom structure for every buildable primitive that
    /// has none yet; returns how many were declared. The flags are fixed
    /// for each structure's lifetime.
    pub fn declare_blases(&mut self, flags: gpu::BuildFlags) -> usize {
        self.blases.declare(
            &self.device,
            &self.geometries,
            &self.primitives,
            flags,
        )
    }

    /// Records builds for the next budget's worth of declared
    /// structures; returns `true` while more remain, in which case
    /// submit, wait and call again.
    pub fn build_blases_step(
        &mut self,
        rec: &mut D::Recording,
        budget: BuildBudget,
    ) -> gpu::Result<bool> {
        let (result, _tt) = utils::measure(|| {
            self.blases.build_step(&self.device, rec, budget)
        });

        #[cfg(feature = "metrics")]
        log::info!(
            "Built bottom structures; tt = {}",
            humantime::format_duration(_tt),
        );

        result
    }

    /// Re-uploads the deforming vertex data of the given primitives and
    /// refits their structures in place.
    pub fn refit_blases(
        &mut self,
        rec: &mut D::Recording,
        scene: &Scene,
        ids: &[PrimitiveId],
    ) -> gpu::Result<()> {
        self.blases.refit(
            &self.device,
            rec,
            &self.geometries,
            scene,
            &self.primitives,
            ids,
        )
    }

    /// Shrinks every compactable built structure to its device-reported
    /// size; returns how many copies were recorded. Submit, wait, then
    /// call [`Self::destroy_non_compacted_blases`].
    pub fn compact_blases(
        &mut self,
        rec: &mut D::Recording,
    ) -> gpu::Result<usize> {
        let (result, _tt) = utils::measure(|| {
            self.compactor.compact(&self.device, rec, &mut self.blases)
        });

        #[cfg(feature = "metrics")]
        log::info!(
            "Compacted bottom structures; tt = {}",
            humantime::format_duration(_tt),
        );

        result
    }

    /// Frees the pre-compaction buffers once the compacting submission
    /// has completed; returns how many were freed.
    pub fn destroy_non_compacted_blases(&mut self) -> usize {
        self.compactor.destroy_non_compacted(&mut self.blases)
    }

    /// Builds the top structure over the scene's visible instances,
    /// replacing any previous one.
    pub fn build_tlas(
        &mut self,
        rec: &mut D::Recording,
        scene: &Scene,
    ) -> gpu::Result<()> {
        let (result, _tt) = utils::measure(|| {
            self.tlas.build(
                &self.device,
                rec,
                scene,
                &self.primitives,
                &self.geometries,
                &mut self.blases,
            )
        });

        #[cfg(feature = "metrics")]
        log::info!(
            "Built top structure; tt = {}",
            humantime::format_duration(_tt),
        );

        result
    }

    /// Refreshes the top structure after per-frame changes, refitting in
    /// place when the visible set is unchanged and rebuilding otherwise.
    pub fn update_tlas(
        &mut self,
        rec: &mut D::Recording,
        scene: &Scene,
    ) -> gpu::Result<()> {
        self.tlas.update(
            &self.device,
            rec,
            scene,
            &self.primitives,
            &self.geometries,
            &mut self.blases,
        )
    }

    /// The top structure's buffer, once one has been built.
    pub fn tlas(&self) -> Option<&D::Buffer> {
        self.tlas.buffer()
    }

    /// A bottom structure's buffer, e.g. for debug visualization.
    pub fn blas(&self, id: PrimitiveId) -> Option<&D::Buffer> {
        self.blases.buffer(id)
    }

    /// Host copy of the descriptor array the top structure was built
    /// over.
    pub fn tlas_instances(&self) -> &[gpu::TlasInstance] {
        self.tlas.instances()
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn primitives(&self) -> &Primitives {
        &self.primitives
    }

    pub fn compaction_stats(&self) -> CompactionStats {
        self.compactor.stats()
    }

    /// Tears down all scene-derived state for a reload, freeing every
    /// buffer; the device must be idle.
    pub fn reset(&mut self) {
        log::info!("Resetting");

        self.primitives.clear();
        self.geometries.clear();
        self.blases.clear();
        self.compactor.clear();
        self.tlas.clear();
    }
}

#[cfg(test)]
mod tests {
    use glam::{Affine3A, Vec3};

    use super::*;
    use crate::gpu::{BuildFlags, MockDevice};

    /// One primitive per entry; an entry of zero triangles becomes a
    /// valid primitive with too few vertices to form a triangle.
    fn tri_scene(triangle_counts: &[u32]) -> Scene {
        let mut scene = Scene::default();

        for (mesh, &triangles) in triangle_counts.iter().enumerate() {
            let vertices = if triangles == 0 { 2 } else { triangles * 3 };

            scene.buffers.push(
                bytemuck::cast_slice(&vec![Vec3::ONE; vertices as usize])
                    .to_vec(),
            );

            scene.accessors.push(Accessor::packed(
                (scene.buffers.len() - 1) as u32,
                vertices,
                Format::F32x3,
            ));

            scene.primitives.push(ScenePrimitive::new(
                mesh as u32,
                (scene.accessors.len() - 1) as u32,
            ));
        }

        scene
    }

    fn instance(primitive: u32, custom_index: u32) -> SceneInstance {
        let mut instance =
            SceneInstance::new(primitive, Affine3A::IDENTITY);

        instance.custom_index = custom_index;
        instance
    }

    #[test]
    fn full_load_produces_the_expected_structures() {
        let device = MockDevice::new();
        let mut scene = tri_scene(&[10, 0, 50]);

        // A fourth scene primitive sharing the first one's geometry
        let dup = scene.primitives[0];

        scene.primitives.push(dup);

        // Two of the five instances reference the degenerate primitive
        for (primitive, custom_index) in
            [(0, 0), (1, 1), (1, 2), (2, 3), (3, 4)]
        {
            scene.instances.push(instance(primitive, custom_index));
        }

        let mut engine = Engine::new(device.clone());
        let mut rec = device.begin_recording();

        engine.upload_geometry(&mut rec, &scene).unwrap();

        // Four scene primitives, three unique geometries
        assert_eq!(3, engine.primitives().len());

        assert_eq!(
            2,
            engine.declare_blases(
                BuildFlags::PREFER_FAST_TRACE
                    | BuildFlags::ALLOW_COMPACTION,
            ),
        );

        assert!(!engine
            .build_blases_step(&mut rec, BuildBudget::UNLIMITED)
            .unwrap());

        device.submit(rec);

        let mut rec = device.begin_recording();

        assert_eq!(2, engine.compact_blases(&mut rec).unwrap());

        device.submit(rec);

        assert_eq!(2, engine.destroy_non_compacted_blases());
        assert!(engine.compaction_stats().saved() > 0);

        let mut rec = device.begin_recording();

        engine.build_tlas(&mut rec, &scene).unwrap();
        device.submit(rec);

        assert!(engine.tlas().is_some());
        assert_eq!(3, engine.tlas_instances().len());

        // The duplicate primitive's instance rides on the shared
        // structure
        assert_eq!(
            engine.tlas_instances()[0].blas_address,
            engine.tlas_instances()[2].blas_address,
        );

        assert!(engine.blas(PrimitiveId::new(0)).is_some());
        assert!(engine.blas(PrimitiveId::new(1)).is_none());
        assert!(engine.blas(PrimitiveId::new(2)).is_some());

        assert_eq!(
            MockDevice::compacted_size(10),
            engine.blas(PrimitiveId::new(0)).unwrap().size(),
        );
    }

    #[test]
    fn budgeted_builds_make_progress_and_terminate() {
        let device = MockDevice::new();
        let mut scene = tri_scene(&[10, 10, 10]);

        for primitive in 0..3 {
            scene.instances.push(instance(primitive, primitive));
        }

        let mut engine = Engine::new(device.clone());
        let mut rec = device.begin_recording();

        engine.upload_geometry(&mut rec, &scene).unwrap();
        engine.declare_blases(BuildFlags::PREFER_FAST_TRACE);
        device.submit(rec);

        // Budget below any single structure: one build per submission
        let budget = BuildBudget::new(100);
        let mut steps = 0;

        loop {
            let mut rec = device.begin_recording();
            let more = engine.build_blases_step(&mut rec, budget).unwrap();

            device.submit(rec);
            steps += 1;

            if !more {
                break;
            }
        }

        assert_eq!(3, steps);

        let mut rec = device.begin_recording();

        engine.build_tlas(&mut rec, &scene).unwrap();
        device.submit(rec);

        assert_eq!(3, engine.tlas_instances().len());
    }

    #[test]
    fn skinned_frames_refit_and_update_in_one_submission() {
        let device = MockDevice::new();
        let mut scene = tri_scene(&[10]);

        scene.instances.push(instance(0, 0));

        let mut engine = Engine::new(device.clone());
        let mut rec = device.begin_recording();

        engine.upload_geometry(&mut rec, &scene).unwrap();

        engine.declare_blases(
            BuildFlags::PREFER_FAST_BUILD | BuildFlags::ALLOW_UPDATE,
        );

        engine
            .build_blases_step(&mut rec, BuildBudget::UNLIMITED)
            .unwrap();

        device.submit(rec);

        let mut rec = device.begin_recording();

        engine.build_tlas(&mut rec, &scene).unwrap();
        device.submit(rec);

        // One animated frame: the mesh deforms, the instance moves
        scene.buffers[0] =
            bytemuck::cast_slice(&vec![Vec3::splat(2.0); 30]).to_vec();
        scene.instances[0].transform =
            Affine3A::from_translation(Vec3::new(5.0, 0.0, 0.0));

        let buffers_before = device.live_buffers().len();
        let mut rec = device.begin_recording();

        engine
            .refit_blases(&mut rec, &scene, &[PrimitiveId::new(0)])
            .unwrap();

        engine.update_tlas(&mut rec, &scene).unwrap();
        device.submit(rec);

        // Everything happened in place
        assert_eq!(buffers_before, device.live_buffers().len());
        assert_eq!(5.0, engine.tlas_instances()[0].transform[3]);
    }

    #[test]
    fn reset_frees_every_device_buffer() {
        let device = MockDevice::new();
        let mut scene = tri_scene(&[10]);

        scene.instances.push(instance(0, 0));

        let mut engine = Engine::new(device.clone());
        let mut rec = device.begin_recording();

        engine.upload_geometry(&mut rec, &scene).unwrap();

        engine.declare_blases(
            BuildFlags::PREFER_FAST_TRACE | BuildFlags::ALLOW_COMPACTION,
        );

        engine
            .build_blases_step(&mut rec, BuildBudget::DEFAULT)
            .unwrap();

        device.submit(rec);

        let mut rec = device.begin_recording();

        engine.compact_blases(&mut rec).unwrap();
        device.submit(rec);
        engine.destroy_non_compacted_blases();

        let mut rec = device.begin_recording();

        engine.build_tlas(&mut rec, &scene).unwrap();
        device.submit(rec);

        assert!(!device.live_buffers().is_empty());

        engine.reset();

        assert!(device.live_buffers().is_empty());
        assert!(engine.tlas().is_none());
        assert!(engine.primitives().is_empty());

        // The engine is reusable after a reset
        let mut rec = device.begin_recording();

        engine.upload_geometry(&mut rec, &scene).unwrap();

        assert_eq!(
            1,
            engine.declare_blases(BuildFlags::PREFER_FAST_TRACE),
        );

        engine
            .build_blases_step(&mut rec, BuildBudget::DEFAULT)
            .unwrap();

        device.submit(rec);

        let mut rec = device.begin_recording();

        engine.build_tlas(&mut rec, &scene).unwrap();
        device.submit(rec);

        assert_eq!(1, engine.tlas_instances().len());
    }

    #[test]
    fn appended_primitives_load_incrementally() {
        let device = MockDevice::new();
        let mut scene = tri_scene(&[10]);

        scene.instances.push(instance(0, 0));

        let mut engine = Engine::new(device.clone());
        let mut rec = device.begin_recording();

        engine.upload_geometry(&mut rec, &scene).unwrap();
        engine.declare_blases(BuildFlags::PREFER_FAST_TRACE);

        engine
            .build_blases_step(&mut rec, BuildBudget::DEFAULT)
            .unwrap();

        device.submit(rec);

        let mut rec = device.begin_recording();

        engine.build_tlas(&mut rec, &scene).unwrap();
        device.submit(rec);

        // The scene grows a primitive and an instance of it
        let mut scene = tri_scene(&[10, 20]);

        scene.instances.push(instance(0, 0));
        scene.instances.push(instance(1, 1));

        let mut rec = device.begin_recording();

        engine.upload_geometry(&mut rec, &scene).unwrap();

        // Only the new primitive gets declared
        assert_eq!(2, engine.primitives().len());
        assert_eq!(
            1,
            engine.declare_blases(BuildFlags::PREFER_FAST_TRACE),
        );

        assert!(!engine
            .build_blases_step(&mut rec, BuildBudget::DEFAULT)
            .unwrap());

        device.submit(rec);

        let mut rec = device.begin_recording();

        engine.update_tlas(&mut rec, &scene).unwrap();
        device.submit(rec);

        assert_eq!(2, engine.tlas_instances().len());
    }
}
