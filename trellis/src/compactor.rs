use derivative::Derivative;
use fxhash::FxHashMap;

use crate::gpu;
use crate::{Blases, BlasState};

/// Running byte totals across every compaction since the last reset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub original_size: u64,
    pub compacted_size: u64,
}

impl CompactionStats {
    /// Bytes reclaimed so far.
    pub fn saved(&self) -> u64 {
        self.original_size - self.compacted_size
    }

    /// Fraction of the original allocation reclaimed, `0.0 ..= 1.0`.
    pub fn saved_ratio(&self) -> f32 {
        if self.original_size == 0 {
            0.0
        } else {
            self.saved() as f32 / self.original_size as f32
        }
    }
}

/// Shrinks built structures to their device-reported size.
///
/// Compacting replaces a structure's buffer with a tight one and records
/// a copy into it; the oversized original must stay alive until that
/// copy has executed, so it moves onto a retired list that
/// [`Self::destroy_non_compacted`] frees once the caller has waited for
/// the submission.
#[derive(Debug, Derivative)]
#[derivative(Default(bound = ""))]
pub struct Compactor<D>
where
    D: gpu::Device,
{
    retired: Vec<D::Buffer>,
    stats: CompactionStats,
}

impl<D> Compactor<D>
where
    D: gpu::Device,
{
    /// Reads the compacted sizes of every structure that asked for
    /// compaction during its build and records the copies into tight
    /// buffers; returns how many structures were compacted.
    ///
    /// Relies on the build submissions having completed; calling earlier
    /// fails with [`gpu::Error::QueryUnavailable`] before anything is
    /// touched, so the caller can wait and simply call again. The same
    /// goes for allocation failures: structures compacted so far keep
    /// their new buffers, the rest stay queriable and a later call picks
    /// them up.
    pub fn compact(
        &mut self,
        device: &D,
        rec: &mut D::Recording,
        blases: &mut Blases<D>,
    ) -> gpu::Result<usize> {
        blases.settle();

        // Built structures that wrote a size query, plus leftovers of a
        // previous call that failed after resolving theirs
        let mut candidates = Vec::new();
        let mut batches = Vec::new();

        for (index, blas) in blases.iter().enumerate() {
            match blas.state {
                BlasState::Built => {
                    let Some(query) = blas.query else {
                        continue;
                    };

                    candidates.push(index);

                    if !batches.contains(&query.batch) {
                        batches.push(query.batch);
                    }
                }
                BlasState::CompactionQueried => candidates.push(index),
                _ => (),
            }
        }

        if candidates.is_empty() {
            return Ok(0);
        }

        // Resolve every query batch up front; an unavailable one aborts
        // the whole call while all structures are still untouched
        let mut sizes = FxHashMap::default();

        for batch in batches {
            sizes.insert(batch, blases.read_batch(device, batch)?);
        }

        let mut compacted = 0;

        for &index in &candidates {
            let blas = blases.item_mut(index);

            if blas.state == BlasState::Built {
                let Some(query) = blas.query else {
                    unreachable!();
                };

                let size = sizes[&query.batch][query.slot as usize];

                log::debug!(
                    "Compacting structure of primitive {}; {} B -> {} B",
                    blas.primitive.get(),
                    blas.sizes.result_size,
                    size,
                );

                blas.compacted_size = Some(size);
                blas.state = BlasState::CompactionQueried;
            }

            let Some(size) = blas.compacted_size else {
                unreachable!();
            };

            let buffer = device.allocate_buffer(
                size,
                gpu::BufferUsages::STRUCTURE,
                &format!("trellis_blas_{}_compact", blas.primitive.get()),
            )?;

            let Some(src) = blas.buffer.take() else {
                unreachable!();
            };

            device.record_compact_copy(rec, &src, &buffer);

            blas.buffer = Some(buffer);
            blas.state = BlasState::Compacted;

            let original = blas.sizes.result_size;
            let query = blas.query.take();

            self.retired.push(src);
            self.stats.original_size += original;
            self.stats.compacted_size += size;

            if let Some(query) = query {
                blases.dec_pending(query.batch);
            }

            compacted += 1;
        }

        log::info!(
            "Compacted {} structures; {} B -> {} B ({} B saved, {:.1}% smaller)",
            compacted,
            self.stats.original_size,
            self.stats.compacted_size,
            self.stats.saved(),
            self.stats.saved_ratio() * 100.0,
        );

        Ok(compacted)
    }

    /// Frees the retired pre-compaction buffers and drops the query
    /// batches they drained.
    ///
    /// Must wait until the compacting submission has completed; the
    /// in-flight copies read from these buffers. Returns how many were
    /// freed.
    pub fn destroy_non_compacted(&mut self, blases: &mut Blases<D>) -> usize {
        let freed = self.retired.len();

        self.retired.clear();
        blases.drop_drained_batches();

        if freed > 0 {
            log::debug!("Freed {} pre-compaction buffers", freed);
        }

        freed
    }

    pub fn stats(&self) -> CompactionStats {
        self.stats
    }

    /// Drops the retired buffers and forgets the statistics; the device
    /// must be idle.
    pub fn clear(&mut self) {
        self.retired.clear();
        self.stats = CompactionStats::default();
    }
}
