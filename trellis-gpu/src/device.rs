use std::fmt::Debug;

use crate::{
    BufferUsages, BuildFlags, BuildSizes, DeviceAddress, GeometryDesc,
    Result, StructureBuild,
};

/// Capability contract between the pipeline and the GPU backend.
///
/// Implementations wrap a concrete API; the pipeline itself never talks
/// to the device directly and never learns which backend it runs on.
///
/// Buffers are owning handles: dropping one releases the underlying
/// allocation. Recordings are created and submitted by the caller; the
/// pipeline only appends commands to them, so the caller keeps full
/// control over submission and fencing.
pub trait Device
where
    Self: Debug,
{
    /// Owning handle of a device allocation; freed on drop.
    type Buffer: Debug;

    /// Command stream under construction.
    type Recording: Debug;

    /// Batch of compacted-size query slots.
    type QueryPool: Debug;

    fn allocate_buffer(
        &self,
        size: u64,
        usage: BufferUsages,
        label: &str,
    ) -> Result<Self::Buffer>;

    /// Records a host-to-device copy of `data` into `dst` at `offset`.
    fn upload(
        &self,
        rec: &mut Self::Recording,
        data: &[u8],
        dst: &Self::Buffer,
        offset: u64,
    );

    fn address(&self, buffer: &Self::Buffer) -> DeviceAddress;

    /// Returns size requirements for building `geometry` with `flags`.
    fn structure_build_sizes(
        &self,
        geometry: &GeometryDesc,
        flags: BuildFlags,
    ) -> BuildSizes;

    fn record_structure_build(
        &self,
        rec: &mut Self::Recording,
        build: &StructureBuild<'_, Self::Buffer>,
    );

    /// Records a copy of the structure in `src` into `dst`, shrinking it
    /// to its true size.
    fn record_compact_copy(
        &self,
        rec: &mut Self::Recording,
        src: &Self::Buffer,
        dst: &Self::Buffer,
    );

    /// Records an execution barrier ordering all commands recorded before
    /// it against all commands recorded after it.
    fn record_barrier(&self, rec: &mut Self::Recording);

    fn create_size_query_pool(&self, capacity: u32) -> Result<Self::QueryPool>;

    /// Records a write of `structure`'s compacted size into `slot`.
    fn record_size_query(
        &self,
        rec: &mut Self::Recording,
        pool: &Self::QueryPool,
        slot: u32,
        structure: &Self::Buffer,
    );

    /// Reads the first `count` slots of `pool`.
    ///
    /// Valid only once the submission that recorded the writes has
    /// completed; an implementation may either block until then or return
    /// [`Error::QueryUnavailable`].
    ///
    /// [`Error::QueryUnavailable`]: crate::Error::QueryUnavailable
    fn read_size_queries(
        &self,
        pool: &Self::QueryPool,
        count: u32,
    ) -> Result<Vec<u64>>;
}

/// Upload capability the resource builder depends on.
///
/// Substituting it changes how geometry reaches the device (staging
/// policy, bindless registration and so on) without touching the
/// builder.
pub trait GeometryUploader<D>
where
    D: Device,
{
    /// Allocates a buffer and records the upload of `data` into it.
    fn upload_bytes(
        &self,
        device: &D,
        rec: &mut D::Recording,
        label: &str,
        data: &[u8],
        usage: BufferUsages,
    ) -> Result<D::Buffer>;
}

/// Default uploader: one allocation plus one direct upload per stream.
#[derive(Clone, Copy, Debug, Default)]
pub struct DirectUploader;

impl<D> GeometryUploader<D> for DirectUploader
where
    D: Device,
{
    fn upload_bytes(
        &self,
        device: &D,
        rec: &mut D::Recording,
        label: &str,
        data: &[u8],
        usage: BufferUsages,
    ) -> Result<D::Buffer> {
        let buffer = device.allocate_buffer(
            data.len() as u64,
            usage | BufferUsages::UPLOAD,
            label,
        )?;

        device.upload(rec, data, &buffer, 0);

        Ok(buffer)
    }
}
