use crate::builder::chunk::Chunk;
use crate::builder::clipper::Clipper;
use crate::endpoints::Endpoints;
use crate::hierarchy::Hierarchy;
use crate::key::{ChunkKey, Dxyz, Key, Xyz, MAX_DEPTH};
use crate::metadata::Metadata;
use crate::pool::Pool;
use crate::schema::Layout;
use crate::spatial::direction;
use crate::voxel::Voxel;
use log::error;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// How many unreferenced chunks the cache may retain before purging.
pub const CACHE_SIZE: u64 = 64;

/// Cache activity counters shared with the progress monitor. Written and
/// read counts are latched (reset on read); alive is the current resident
/// count.
#[derive(Debug, Default)]
pub struct CacheStats {
    written: AtomicU64,
    read: AtomicU64,
    alive: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheInfo {
    pub written: u64,
    pub read: u64,
    pub alive: u64,
}

impl CacheStats {
    pub fn latch(&self) -> CacheInfo {
        CacheInfo {
            written: self.written.swap(0, Ordering::Relaxed),
            read: self.read.swap(0, Ordering::Relaxed),
            alive: self.alive.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
struct RefState {
    refs: u64,
    chunk: Option<Arc<Chunk>>,
}

/// One cache slot: a reference count plus the optionally-resident chunk,
/// guarded by the slot's own lock so concurrent materializers serialize.
#[derive(Debug, Default)]
pub struct RefChunk {
    state: Mutex<RefState>,
}

impl RefChunk {
    fn lock(&self) -> MutexGuard<'_, RefState> {
        self.state.lock().expect("chunk slot lock poisoned")
    }
}

type Slice = Mutex<HashMap<Xyz, Arc<RefChunk>>>;

struct Shared {
    endpoints: Endpoints,
    metadata: Arc<Metadata>,
    layout: Arc<Layout>,
    hierarchy: Arc<Hierarchy>,
    stats: Arc<CacheStats>,
    slices: Vec<Slice>,
}

impl Shared {
    fn slice(&self, depth: usize) -> MutexGuard<'_, HashMap<Xyz, Arc<RefChunk>>> {
        self.slices[depth].lock().expect("cache slice lock poisoned")
    }
}

/// The process-wide owner of live chunks: depth-partitioned slot maps with
/// reference counting, on-demand load of evicted chunks, and background
/// serialization once nothing references a chunk.
pub struct ChunkCache {
    shared: Arc<Shared>,
    pool: Pool,
}

impl ChunkCache {
    pub fn new(
        endpoints: Endpoints,
        metadata: Arc<Metadata>,
        hierarchy: Arc<Hierarchy>,
        stats: Arc<CacheStats>,
        clip_threads: usize,
    ) -> io::Result<ChunkCache> {
        let layout = Arc::new(Layout::new(&metadata.schema.absolute())?);
        let mut slices = Vec::with_capacity(MAX_DEPTH);
        slices.resize_with(MAX_DEPTH, Slice::default);
        Ok(ChunkCache {
            shared: Arc::new(Shared {
                endpoints,
                metadata,
                layout,
                hierarchy,
                stats,
                slices,
            }),
            pool: Pool::new(clip_threads),
        })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.shared.endpoints
    }

    pub fn metadata(&self) -> &Arc<Metadata> {
        &self.shared.metadata
    }

    pub fn layout(&self) -> &Arc<Layout> {
        &self.shared.layout
    }

    pub fn hierarchy(&self) -> &Arc<Hierarchy> {
        &self.shared.hierarchy
    }

    /// Route one voxel to its resting chunk, descending whenever the target
    /// chunk declines the point (its overflow for that octant has already
    /// split into a child).
    pub fn insert(
        &self,
        voxel: &mut Voxel,
        key: &mut Key,
        chunk_key: ChunkKey,
        clipper: &mut Clipper,
    ) {
        let mut ck = chunk_key;
        loop {
            let chunk = match clipper.get(&ck) {
                Some(chunk) => chunk,
                None => self.add_ref(ck, clipper),
            };
            if chunk.insert(self, clipper, voxel, key) {
                return;
            }
            assert!(
                (ck.depth() as usize) + 1 < MAX_DEPTH,
                "chunk descent exceeded max depth"
            );
            key.step(voxel.point);
            ck = *chunk.child_at(direction(ck.bounds().mid(), voxel.point));
        }
    }

    /// Take a new reference for this clipper, materializing (and possibly
    /// re-loading) the chunk if it is not resident.
    fn add_ref(&self, ck: ChunkKey, clipper: &mut Clipper) -> Arc<Chunk> {
        let depth = ck.depth() as usize;
        let entry = {
            let mut slice = self.shared.slice(depth);
            Arc::clone(slice.entry(ck.position()).or_default())
        };

        let mut state = entry.lock();
        if let Some(chunk) = &state.chunk {
            let chunk = Arc::clone(chunk);
            state.refs += 1;
            clipper.set(&ck, Arc::clone(&chunk));
            return chunk;
        }

        self.shared.stats.alive.fetch_add(1, Ordering::Relaxed);
        let chunk = Arc::new(Chunk::new(
            Arc::clone(&self.shared.metadata),
            Arc::clone(&self.shared.layout),
            ck,
            &self.shared.hierarchy,
        ));
        state.chunk = Some(Arc::clone(&chunk));
        state.refs += 1;
        // The clipper must know the chunk before any load re-insertion, or
        // the load path would come straight back here.
        clipper.set(&ck, Arc::clone(&chunk));

        // A hierarchy entry means this chunk's points are already on disk,
        // evicted earlier in this run or persisted by a previous one.
        // Reclaim them through the normal insertion path before new arrivals
        // land.
        let dxyz = ck.dxyz();
        if let Some(np) = self.shared.hierarchy.get(dxyz) {
            self.shared.stats.read.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = chunk.load(self, clipper, &self.shared.endpoints, np) {
                panic!("failed to load chunk {dxyz}: {e}");
            }
        }
        chunk
    }

    /// Drop one reference taken through `add_ref`. At zero the chunk is
    /// queued for background serialization.
    pub fn release(&self, depth: usize, xyz: Xyz) {
        let entry = {
            let slice = self.shared.slice(depth);
            slice
                .get(&xyz)
                .cloned()
                .unwrap_or_else(|| panic!("release of untracked chunk at depth {depth}"))
        };

        let mut state = entry.lock();
        assert!(state.refs > 0, "negative chunk reference count");
        state.refs -= 1;
        if state.refs == 0 && state.chunk.is_some() {
            drop(state);
            let shared = Arc::clone(&self.shared);
            let dxyz = Dxyz::new(depth as u32, xyz.x, xyz.y, xyz.z);
            self.pool
                .add(move || serialize_entry(&shared, &entry, dxyz));
        }
    }

    /// Called by clippers after each clip batch.
    pub fn clipped(&self) {
        self.maybe_purge(CACHE_SIZE);
    }

    /// Enforce the unreferenced-resident bound by queueing serialization for
    /// the excess, deepest slices first.
    fn maybe_purge(&self, max: u64) {
        let mut candidates = Vec::new();
        for depth in (0..MAX_DEPTH).rev() {
            let slice = self.shared.slice(depth);
            for (xyz, entry) in slice.iter() {
                let state = entry.lock();
                if state.refs == 0 && state.chunk.is_some() {
                    candidates.push((depth, *xyz, Arc::clone(entry)));
                }
            }
        }
        if candidates.len() as u64 <= max {
            return;
        }
        let excess = candidates.len() - max as usize;
        for (depth, xyz, entry) in candidates.into_iter().take(excess) {
            let shared = Arc::clone(&self.shared);
            let dxyz = Dxyz::new(depth as u32, xyz.x, xyz.y, xyz.z);
            self.pool
                .add(move || serialize_entry(&shared, &entry, dxyz));
        }
    }

    /// Drain the background pool and flush every remaining unreferenced
    /// chunk. On return every slot is either erased or reset with its point
    /// count recorded in the hierarchy.
    pub fn join(&self) {
        self.pool.join();

        for depth in 0..MAX_DEPTH {
            let entries: Vec<(Xyz, Arc<RefChunk>)> = {
                let slice = self.shared.slice(depth);
                slice.iter().map(|(k, v)| (*k, Arc::clone(v))).collect()
            };
            for (xyz, entry) in entries {
                let state = entry.lock();
                assert!(
                    state.refs == 0,
                    "chunk at depth {depth} still referenced at join"
                );
                if state.chunk.is_some() {
                    drop(state);
                    let shared = Arc::clone(&self.shared);
                    let dxyz = Dxyz::new(depth as u32, xyz.x, xyz.y, xyz.z);
                    self.pool
                        .add(move || serialize_entry(&shared, &entry, dxyz));
                }
            }
        }
        self.pool.join();

        for depth in 0..MAX_DEPTH {
            let mut slice = self.shared.slice(depth);
            let stats = &self.shared.stats;
            slice.retain(|_, entry| {
                let state = entry.lock();
                let erasable = state.refs == 0 && state.chunk.is_none();
                if erasable {
                    stats.alive.fetch_sub(1, Ordering::Relaxed);
                }
                !erasable
            });
        }
    }
}

/// Serialize one unreferenced chunk: write its points, record the count in
/// the hierarchy, and drop the resident state. Skips quietly if the slot was
/// re-referenced or already flushed in the meantime.
fn serialize_entry(shared: &Arc<Shared>, entry: &Arc<RefChunk>, dxyz: Dxyz) {
    let mut state = entry.lock();
    if state.refs > 0 {
        return;
    }
    let Some(chunk) = state.chunk.take() else {
        return;
    };

    match chunk.save(&shared.endpoints) {
        Ok(np) => {
            shared.hierarchy.set(dxyz, np);
            shared.stats.written.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            // Storage failures here have already exhausted their retries.
            error!("failed to serialize chunk {dxyz}: {e}");
            panic!("failed to serialize chunk {dxyz}: {e}");
        }
    }
    drop(state);
    drop(chunk);
    maybe_erase(shared, dxyz);
}

/// Erase a dead slot (no references, nothing resident).
fn maybe_erase(shared: &Arc<Shared>, dxyz: Dxyz) {
    let mut slice = shared.slice(dxyz.d as usize);
    if let Some(entry) = slice.get(&dxyz.xyz()) {
        let state = entry.lock();
        if state.refs == 0 && state.chunk.is_none() {
            drop(state);
            slice.remove(&dxyz.xyz());
            shared.stats.alive.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
