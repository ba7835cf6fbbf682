use derivative::Derivative;
use fxhash::FxHashMap;

use crate::gpu;
use crate::{Geometries, PrimitiveId, Primitives, Scene};

/// Byte-size target for one build-step call.
///
/// The budget caps how many result buffers one submission creates, not
/// any single structure: a structure whose own size exceeds the budget
/// is still built, alone in its batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BuildBudget(u64);

impl BuildBudget {
    pub const DEFAULT: Self = Self(512_000_000);
    pub const UNLIMITED: Self = Self(u64::MAX);

    pub fn new(bytes: u64) -> Self {
        Self(bytes)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl Default for BuildBudget {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BlasState {
    /// Sizes are known, nothing has been recorded.
    Declared,

    /// A build command has been recorded; becomes `Built` once the next
    /// entry point confirms the submission has fenced.
    Building,

    Built,

    /// Compacted size is known, the compacting copy isn't recorded yet.
    CompactionQueried,

    Compacted,
}

/// Bottom-level structure of one unique primitive.
#[derive(Debug)]
pub struct Blas<B> {
    pub(crate) primitive: PrimitiveId,
    pub(crate) geometry: gpu::GeometryDesc,
    pub(crate) state: BlasState,
    pub(crate) flags: gpu::BuildFlags,
    pub(crate) sizes: gpu::BuildSizes,
    pub(crate) buffer: Option<B>,
    pub(crate) query: Option<QuerySlot>,
    pub(crate) compacted_size: Option<u64>,
}

impl<B> Blas<B> {
    pub fn primitive(&self) -> PrimitiveId {
        self.primitive
    }

    pub fn state(&self) -> BlasState {
        self.state
    }

    pub fn flags(&self) -> gpu::BuildFlags {
        self.flags
    }

    pub fn sizes(&self) -> gpu::BuildSizes {
        self.sizes
    }

    pub fn buffer(&self) -> Option<&B> {
        self.buffer.as_ref()
    }

    pub fn compacted_size(&self) -> Option<u64> {
        self.compacted_size
    }
}

/// Compacted-size query slot: which batch's pool and which slot in it.
#[derive(Clone, Copy, Debug)]
pub(crate) struct QuerySlot {
    pub(crate) batch: u32,
    pub(crate) slot: u32,
}

/// One query pool per build-step batch; dropped once every structure it
/// covers has been compacted.
#[derive(Debug)]
pub(crate) struct QueryBatch<P> {
    pub(crate) pool: P,
    pub(crate) slots: u32,
    pub(crate) pending: u32,
}

/// Builds and owns the bottom-level structures, their shared scratch
/// buffer and the compacted-size query batches.
#[derive(Debug, Derivative)]
#[derivative(Default(bound = ""))]
pub struct Blases<D>
where
    D: gpu::Device,
{
    items: Vec<Blas<D::Buffer>>,
    index: FxHashMap<PrimitiveId, usize>,
    scratch: Option<D::Buffer>,
    scratch_size: u64,
    batches: FxHashMap<u32, QueryBatch<D::QueryPool>>,
    next_batch: u32,
}

impl<D> Blases<D>
where
    D: gpu::Device,
{
    /// Declares a structure for every resource-valid primitive that has
    /// a non-zero triangle count and no structure yet; returns how many
    /// were declared.
    ///
    /// Declaring only queries sizes; nothing is recorded. The flags are
    /// fixed for the structure's whole lifetime.
    pub fn declare(
        &mut self,
        device: &D,
        geometries: &Geometries<D>,
        primitives: &Primitives,
        flags: gpu::BuildFlags,
    ) -> usize {
        let mut declared = 0;

        for (id, _) in primitives.iter() {
            if self.index.contains_key(&id) {
                continue;
            }

            let Some(geometry) = geometries.get(id) else {
                continue;
            };

            let Some(desc) = geometry.triangle_desc(device) else {
                continue;
            };

            let sizes = device.structure_build_sizes(&desc, flags);

            log::debug!(
                "Declaring structure for primitive {}; \
                 triangles={}, result={} B, scratch={} B",
                id.get(),
                desc.primitive_count(),
                sizes.result_size,
                sizes.scratch_size,
            );

            self.index.insert(id, self.items.len());

            self.items.push(Blas {
                primitive: id,
                geometry: desc,
                state: BlasState::Declared,
                flags,
                sizes,
                buffer: None,
                query: None,
                compacted_size: None,
            });

            declared += 1;
        }

        declared
    }

    /// Records builds for the next budget's worth of declared
    /// structures.
    ///
    /// Returns `true` while declared structures remain, in which case
    /// the caller must submit the recording, wait for it to complete and
    /// call again; the call relies on any previous build submission
    /// having completed the same way.
    pub fn build_step(
        &mut self,
        device: &D,
        rec: &mut D::Recording,
        budget: BuildBudget,
    ) -> gpu::Result<bool> {
        self.settle();

        // Batch selection: declared structures in creation order, until
        // the next one would overflow the budget. The first one is taken
        // unconditionally so that progress is guaranteed.
        let mut selected = Vec::new();
        let mut batch_size = 0u64;

        for (index, blas) in self.items.iter().enumerate() {
            if blas.state != BlasState::Declared {
                continue;
            }

            let size = blas.sizes.result_size;

            if selected.is_empty()
                || batch_size.saturating_add(size) <= budget.get()
            {
                batch_size += size;
                selected.push(index);
            } else {
                break;
            }
        }

        if selected.is_empty() {
            return Ok(false);
        }

        let max_scratch = selected
            .iter()
            .map(|&index| self.items[index].sizes.scratch_size)
            .max()
            .unwrap_or(0);

        log::debug!(
            "Building {} structures; results={} B, scratch={} B",
            selected.len(),
            batch_size,
            max_scratch,
        );

        // All allocations happen before any command is recorded, so a
        // failure here leaves the recording untouched and every
        // structure still `Declared`.
        for &index in &selected {
            let blas = &mut self.items[index];

            blas.buffer = Some(device.allocate_buffer(
                blas.sizes.result_size,
                gpu::BufferUsages::STRUCTURE,
                &format!("trellis_blas_{}", blas.primitive.get()),
            )?);
        }

        let compacting: Vec<usize> = selected
            .iter()
            .copied()
            .filter(|&index| {
                self.items[index]
                    .flags
                    .contains(gpu::BuildFlags::ALLOW_COMPACTION)
            })
            .collect();

        if !compacting.is_empty() {
            let pool =
                device.create_size_query_pool(compacting.len() as u32)?;

            let batch = self.next_batch;

            self.next_batch += 1;

            self.batches.insert(
                batch,
                QueryBatch {
                    pool,
                    slots: compacting.len() as u32,
                    pending: compacting.len() as u32,
                },
            );

            for (slot, &index) in compacting.iter().enumerate() {
                self.items[index].query = Some(QuerySlot {
                    batch,
                    slot: slot as u32,
                });
            }
        }

        self.grow_scratch(device, max_scratch)?;

        let Some(scratch) = &self.scratch else {
            unreachable!();
        };

        for &index in &selected {
            let blas = &self.items[index];

            let Some(dst) = &blas.buffer else {
                unreachable!();
            };

            device.record_structure_build(
                rec,
                &gpu::StructureBuild {
                    geometry: blas.geometry,
                    mode: gpu::BuildMode::Build,
                    flags: blas.flags,
                    dst,
                    scratch,
                },
            );

            // Consecutive builds reuse the scratch buffer, and the size
            // query reads the structure the build just wrote.
            device.record_barrier(rec);

            if let Some(query) = blas.query {
                device.record_size_query(
                    rec,
                    &self.batches[&query.batch].pool,
                    query.slot,
                    dst,
                );
            }
        }

        for &index in &selected {
            self.items[index].state = BlasState::Building;
        }

        Ok(self.items.iter().any(|blas| blas.state == BlasState::Declared))
    }

    /// Re-uploads the deforming vertex streams of the given primitives
    /// and records update-mode builds refreshing their structures in
    /// place.
    ///
    /// Panics if a structure exists but isn't updatable or built;
    /// primitives without a structure are skipped, they have nothing to
    /// refit. Relies on the previous submission having completed, like
    /// [`Self::build_step`].
    pub fn refit(
        &mut self,
        device: &D,
        rec: &mut D::Recording,
        geometries: &Geometries<D>,
        scene: &Scene,
        primitives: &Primitives,
        ids: &[PrimitiveId],
    ) -> gpu::Result<()> {
        self.settle();

        let mut batch = Vec::new();

        for &id in ids {
            let Some(&index) = self.index.get(&id) else {
                log::debug!(
                    "Skipping refit of primitive {}; it has no structure",
                    id.get(),
                );

                continue;
            };

            let blas = &self.items[index];

            assert!(
                blas.flags.contains(gpu::BuildFlags::ALLOW_UPDATE),
                "refitting primitive {} requires its structure to have \
                 been declared with ALLOW_UPDATE",
                id.get(),
            );

            assert!(
                matches!(
                    blas.state,
                    BlasState::Built | BlasState::Compacted
                ),
                "refitting primitive {} requires its structure to have \
                 been built and the build submission to have completed",
                id.get(),
            );

            batch.push(index);
        }

        batch.retain(|&index| {
            geometries.reupload_deformed(
                device,
                rec,
                scene,
                primitives,
                self.items[index].primitive,
            )
        });

        if batch.is_empty() {
            return Ok(());
        }

        let max_scratch = batch
            .iter()
            .map(|&index| self.items[index].sizes.update_scratch_size)
            .max()
            .unwrap_or(0);

        log::debug!(
            "Refitting {} structures; scratch={} B",
            batch.len(),
            max_scratch,
        );

        self.grow_scratch(device, max_scratch)?;

        // The builds read what the uploads above wrote
        device.record_barrier(rec);

        let Some(scratch) = &self.scratch else {
            unreachable!();
        };

        for &index in &batch {
            let blas = &self.items[index];

            let Some(dst) = &blas.buffer else {
                unreachable!();
            };

            device.record_structure_build(
                rec,
                &gpu::StructureBuild {
                    geometry: blas.geometry,
                    mode: gpu::BuildMode::Refit,
                    flags: blas.flags,
                    dst,
                    scratch,
                },
            );

            device.record_barrier(rec);
        }

        Ok(())
    }

    /// Promotes `Building` structures to `Built`.
    ///
    /// Every entry point whose contract says "the previous submission
    /// has completed" calls this first.
    pub(crate) fn settle(&mut self) {
        for blas in &mut self.items {
            if blas.state == BlasState::Building {
                blas.state = BlasState::Built;
            }
        }
    }

    fn grow_scratch(&mut self, device: &D, size: u64) -> gpu::Result<()> {
        if self.scratch.is_some() && size <= self.scratch_size {
            return Ok(());
        }

        let size = size.max(self.scratch_size);

        log::debug!("Growing shared scratch buffer; size={} B", size);

        self.scratch = Some(device.allocate_buffer(
            size,
            gpu::BufferUsages::SCRATCH,
            "trellis_blas_scratch",
        )?);

        self.scratch_size = size;

        Ok(())
    }

    /// Device address of the given primitive's structure, for use in
    /// instance descriptors.
    ///
    /// `None` means the primitive has no structure (it was excluded as
    /// invalid or zero-triangle); a structure that exists but hasn't
    /// been built yet is an ordering violation and panics.
    pub(crate) fn built_address(
        &self,
        device: &D,
        id: PrimitiveId,
    ) -> Option<gpu::DeviceAddress> {
        let blas = &self.items[*self.index.get(&id)?];

        assert!(
            blas.state >= BlasState::Built,
            "instance references primitive {} whose bottom structure \
             hasn't been built; finish the build_step loop before \
             building the top structure",
            id.get(),
        );

        blas.buffer.as_ref().map(|buffer| device.address(buffer))
    }

    pub fn get(&self, id: PrimitiveId) -> Option<&Blas<D::Buffer>> {
        Some(&self.items[*self.index.get(&id)?])
    }

    pub fn buffer(&self, id: PrimitiveId) -> Option<&D::Buffer> {
        self.get(id)?.buffer.as_ref()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Blas<D::Buffer>> + '_ {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.index.clear();
        self.scratch = None;
        self.scratch_size = 0;
        self.batches.clear();
    }

    pub(crate) fn item_mut(&mut self, index: usize) -> &mut Blas<D::Buffer> {
        &mut self.items[index]
    }

    pub(crate) fn read_batch(
        &self,
        device: &D,
        batch: u32,
    ) -> gpu::Result<Vec<u64>> {
        let batch = &self.batches[&batch];

        device.read_size_queries(&batch.pool, batch.slots)
    }

    pub(crate) fn dec_pending(&mut self, batch: u32) {
        if let Some(batch) = self.batches.get_mut(&batch) {
            batch.pending = batch.pending.saturating_sub(1);
        }
    }

    pub(crate) fn drop_drained_batches(&mut self) -> usize {
        let before = self.batches.len();

        self.batches.retain(|_, batch| batch.pending > 0);

        before - self.batches.len()
    }
}
