//! Fake device for unit tests (no GPU required).
//!
//! `MockDevice` implements [`Device`] on top of byte-backed host memory
//! and keeps a single chronological ledger of allocations, executed
//! commands and frees, so tests can assert lifetime and ordering rules
//! that a real device would only reveal as crashes.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::{
    BufferUsages, BuildFlags, BuildMode, BuildSizes, Device, DeviceAddress,
    Error, GeometryDesc, Result, StructureBuild,
};

/// Command recorded into a [`MockRecording`]; becomes
/// [`MockEvent::Executed`] when the recording is submitted.
#[derive(Clone, Debug, PartialEq)]
pub enum MockCommand {
    Upload { dst: u32, offset: u64, data: Vec<u8> },
    Build { dst: u32, scratch: u32, mode: BuildMode, geometry: GeometryDesc },
    CompactCopy { src: u32, dst: u32 },
    Barrier,
    SizeQuery { pool: u32, slot: u32, structure: u32 },
}

/// Entry of the device-wide ledger, in observed order.
#[derive(Clone, Debug, PartialEq)]
pub enum MockEvent {
    Allocated { buffer: u32, size: u64, label: String },
    Executed(MockCommand),
    Freed { buffer: u32 },
}

struct MockBufferState {
    size: u64,
    usage: BufferUsages,
    data: Vec<u8>,
    live: bool,
}

#[derive(Default)]
struct MockState {
    next_buffer: u32,
    next_pool: u32,
    fail_allocations: u32,
    buffers: HashMap<u32, MockBufferState>,
    pools: HashMap<u32, Vec<Option<u64>>>,
    structures: HashMap<u32, GeometryDesc>,
    events: Vec<MockEvent>,
}

impl MockState {
    fn buffer(&self, id: u32) -> &MockBufferState {
        let buffer = self
            .buffers
            .get(&id)
            .unwrap_or_else(|| panic!("unknown buffer {}", id));

        assert!(buffer.live, "buffer {} used after free", id);

        buffer
    }
}

/// Owning handle of a mock allocation; freeing is observable through the
/// ledger.
pub struct MockBuffer {
    id: u32,
    size: u64,
    state: Arc<Mutex<MockState>>,
}

impl MockBuffer {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the buffer's current device-side bytes.
    pub fn contents(&self) -> Vec<u8> {
        let state = self.state.lock().unwrap();

        state.buffer(self.id).data.clone()
    }
}

impl fmt::Debug for MockBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MockBuffer #{} ({} B)", self.id, self.size)
    }
}

impl Drop for MockBuffer {
    fn drop(&mut self) {
        // The device's own panics (e.g. use-after-free during `submit`)
        // poison the state mutex while buffers are still alive; tolerate
        // that here so unwinding reaches `#[should_panic]` instead of
        // double-panicking.
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(buffer) = state.buffers.get_mut(&self.id) {
            buffer.live = false;
            buffer.data = Vec::new();
        }

        state.events.push(MockEvent::Freed { buffer: self.id });
    }
}

/// Command stream under construction; nothing takes effect until
/// [`MockDevice::submit`].
#[derive(Debug, Default)]
pub struct MockRecording {
    commands: Vec<MockCommand>,
}

impl MockRecording {
    pub fn commands(&self) -> &[MockCommand] {
        &self.commands
    }
}

#[derive(Debug)]
pub struct MockQueryPool {
    id: u32,
    capacity: u32,
}

/// Fake device; cloning shares the underlying state, so a test can keep
/// a handle while the pipeline owns another.
#[derive(Clone, Default)]
pub struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MockDevice")
    }
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_recording(&self) -> MockRecording {
        MockRecording::default()
    }

    /// Executes a recording: materializes uploads, marks structures
    /// built, resolves size-query slots and appends everything to the
    /// ledger.
    ///
    /// Panics on anything a real device would turn into undefined
    /// behavior: freed or undersized buffers, refits of never-built
    /// structures, out-of-bounds uploads.
    pub fn submit(&self, rec: MockRecording) {
        let mut state = self.state.lock().unwrap();

        for command in rec.commands {
            self.execute(&mut state, &command);
            state.events.push(MockEvent::Executed(command));
        }
    }

    fn execute(&self, state: &mut MockState, command: &MockCommand) {
        match command {
            MockCommand::Upload { dst, offset, data } => {
                let buffer = state.buffer(*dst);

                assert!(
                    buffer.usage.contains(BufferUsages::UPLOAD),
                    "buffer {} is not an upload target",
                    dst,
                );
                assert!(
                    offset + data.len() as u64 <= buffer.size,
                    "upload past the end of buffer {}: {}..{} > {}",
                    dst,
                    offset,
                    offset + data.len() as u64,
                    buffer.size,
                );

                let offset = *offset as usize;
                let data = data.clone();

                state.buffers.get_mut(dst).unwrap().data
                    [offset..offset + data.len()]
                    .copy_from_slice(&data);
            }

            MockCommand::Build { dst, scratch, mode, geometry } => {
                let count = geometry.primitive_count();

                let needed_scratch = match mode {
                    BuildMode::Build => Self::scratch_size(count),
                    BuildMode::Refit => Self::update_scratch_size(count),
                };

                let scratch_state = state.buffer(*scratch);

                assert!(
                    scratch_state.usage.contains(BufferUsages::SCRATCH),
                    "buffer {} is not scratch memory",
                    scratch,
                );
                assert!(
                    scratch_state.size >= needed_scratch,
                    "scratch buffer too small: {} < {}",
                    scratch_state.size,
                    needed_scratch,
                );

                let dst_size = state.buffer(*dst).size;

                match mode {
                    BuildMode::Build => {
                        assert!(
                            dst_size >= Self::result_size(count),
                            "structure buffer too small: {} < {}",
                            dst_size,
                            Self::result_size(count),
                        );
                    }
                    BuildMode::Refit => {
                        assert!(
                            state.structures.contains_key(dst),
                            "refit of structure {} that was never built",
                            dst,
                        );
                    }
                }

                state.structures.insert(*dst, *geometry);
            }

            MockCommand::CompactCopy { src, dst } => {
                let geometry = *state
                    .structures
                    .get(src)
                    .unwrap_or_else(|| {
                        panic!("compacting structure {} that was never built", src)
                    });

                state.buffer(*src);

                let dst_size = state.buffer(*dst).size;
                let compacted = Self::compacted_size(geometry.primitive_count());

                assert!(
                    dst_size >= compacted,
                    "compacted buffer too small: {} < {}",
                    dst_size,
                    compacted,
                );

                state.structures.insert(*dst, geometry);
            }

            MockCommand::Barrier => (),

            MockCommand::SizeQuery { pool, slot, structure } => {
                state.buffer(*structure);

                let geometry = *state
                    .structures
                    .get(structure)
                    .unwrap_or_else(|| {
                        panic!(
                            "size query of structure {} that was never built",
                            structure,
                        )
                    });

                let compacted = Self::compacted_size(geometry.primitive_count());

                state.pools.get_mut(pool).unwrap()[*slot as usize] =
                    Some(compacted);
            }
        }
    }

    /// Makes the next `count` allocations fail, for error-path tests.
    pub fn fail_allocations(&self, count: u32) {
        self.state.lock().unwrap().fail_allocations += count;
    }

    /// Returns a copy of the ledger.
    pub fn events(&self) -> Vec<MockEvent> {
        self.state.lock().unwrap().events.clone()
    }

    /// Ids of all buffers that are still allocated.
    pub fn live_buffers(&self) -> Vec<u32> {
        let state = self.state.lock().unwrap();

        let mut ids: Vec<_> = state
            .buffers
            .iter()
            .filter(|(_, buffer)| buffer.live)
            .map(|(id, _)| *id)
            .collect();

        ids.sort();
        ids
    }

    // The size model is an affine function of the primitive count, so
    // tests can pick budgets with byte precision.

    pub fn result_size(count: u32) -> u64 {
        256 + 64 * u64::from(count)
    }

    pub fn scratch_size(count: u32) -> u64 {
        128 + 32 * u64::from(count)
    }

    pub fn update_scratch_size(count: u32) -> u64 {
        64 + 16 * u64::from(count)
    }

    pub fn compacted_size(count: u32) -> u64 {
        160 + 36 * u64::from(count)
    }
}

impl Device for MockDevice {
    type Buffer = MockBuffer;
    type Recording = MockRecording;
    type QueryPool = MockQueryPool;

    fn allocate_buffer(
        &self,
        size: u64,
        usage: BufferUsages,
        label: &str,
    ) -> Result<MockBuffer> {
        assert!(size > 0, "zero-size allocation for `{}`", label);

        let mut state = self.state.lock().unwrap();

        if state.fail_allocations > 0 {
            state.fail_allocations -= 1;

            return Err(Error::AllocationFailed {
                size,
                label: label.to_owned(),
            });
        }

        let id = state.next_buffer;

        state.next_buffer += 1;

        state.buffers.insert(
            id,
            MockBufferState {
                size,
                usage,
                data: vec![0; size as usize],
                live: true,
            },
        );

        state.events.push(MockEvent::Allocated {
            buffer: id,
            size,
            label: label.to_owned(),
        });

        Ok(MockBuffer {
            id,
            size,
            state: Arc::clone(&self.state),
        })
    }

    fn upload(
        &self,
        rec: &mut MockRecording,
        data: &[u8],
        dst: &MockBuffer,
        offset: u64,
    ) {
        rec.commands.push(MockCommand::Upload {
            dst: dst.id,
            offset,
            data: data.to_vec(),
        });
    }

    fn address(&self, buffer: &MockBuffer) -> DeviceAddress {
        DeviceAddress(0x1000_0000 + u64::from(buffer.id) * 0x10_0000)
    }

    fn structure_build_sizes(
        &self,
        geometry: &GeometryDesc,
        _flags: BuildFlags,
    ) -> BuildSizes {
        let count = geometry.primitive_count();

        BuildSizes {
            result_size: Self::result_size(count),
            scratch_size: Self::scratch_size(count),
            update_scratch_size: Self::update_scratch_size(count),
        }
    }

    fn record_structure_build(
        &self,
        rec: &mut MockRecording,
        build: &StructureBuild<'_, MockBuffer>,
    ) {
        rec.commands.push(MockCommand::Build {
            dst: build.dst.id,
            scratch: build.scratch.id,
            mode: build.mode,
            geometry: build.geometry,
        });
    }

    fn record_compact_copy(
        &self,
        rec: &mut MockRecording,
        src: &MockBuffer,
        dst: &MockBuffer,
    ) {
        rec.commands.push(MockCommand::CompactCopy {
            src: src.id,
            dst: dst.id,
        });
    }

    fn record_barrier(&self, rec: &mut MockRecording) {
        rec.commands.push(MockCommand::Barrier);
    }

    fn create_size_query_pool(&self, capacity: u32) -> Result<MockQueryPool> {
        assert!(capacity > 0, "zero-capacity query pool");

        let mut state = self.state.lock().unwrap();
        let id = state.next_pool;

        state.next_pool += 1;
        state.pools.insert(id, vec![None; capacity as usize]);

        Ok(MockQueryPool { id, capacity })
    }

    fn record_size_query(
        &self,
        rec: &mut MockRecording,
        pool: &MockQueryPool,
        slot: u32,
        structure: &MockBuffer,
    ) {
        assert!(
            slot < pool.capacity,
            "query slot {} out of range (capacity = {})",
            slot,
            pool.capacity,
        );

        rec.commands.push(MockCommand::SizeQuery {
            pool: pool.id,
            slot,
            structure: structure.id,
        });
    }

    fn read_size_queries(
        &self,
        pool: &MockQueryPool,
        count: u32,
    ) -> Result<Vec<u64>> {
        let state = self.state.lock().unwrap();
        let slots = &state.pools[&pool.id];

        assert!(
            count as usize <= slots.len(),
            "reading {} slots from a pool of {}",
            count,
            slots.len(),
        );

        slots[..count as usize]
            .iter()
            .copied()
            .map(|slot| slot.ok_or(Error::QueryUnavailable))
            .collect()
    }
}
