use crate::builder::cache::ChunkCache;
use crate::builder::chunk::Chunk;
use crate::key::{ChunkKey, Xyz, MAX_DEPTH};
use std::collections::HashMap;
use std::sync::Arc;

/// A worker's two-generation working set of referenced chunks.
///
/// Lookups hit a one-slot `fast` cache, then the current generation
/// (`slow`), then the previous one (`aged`, promoted back without taking a
/// new reference). `clip()` releases whatever sat untouched in `aged` for a
/// whole generation and rotates, giving the cache a deterministic moment to
/// serialize and bounding the live set to the workers' recent traffic.
pub struct Clipper<'a> {
    cache: &'a ChunkCache,
    fast: Vec<Option<(Xyz, Arc<Chunk>)>>,
    slow: Vec<HashMap<Xyz, Arc<Chunk>>>,
    aged: Vec<HashMap<Xyz, Arc<Chunk>>>,
}

impl<'a> Clipper<'a> {
    pub fn new(cache: &'a ChunkCache) -> Self {
        let mut fast = Vec::with_capacity(MAX_DEPTH);
        fast.resize_with(MAX_DEPTH, || None);
        let mut slow = Vec::with_capacity(MAX_DEPTH);
        slow.resize_with(MAX_DEPTH, HashMap::new);
        let mut aged = Vec::with_capacity(MAX_DEPTH);
        aged.resize_with(MAX_DEPTH, HashMap::new);
        Self {
            cache,
            fast,
            slow,
            aged,
        }
    }

    /// The chunk for `ck` if this worker already holds a reference to it.
    pub fn get(&mut self, ck: &ChunkKey) -> Option<Arc<Chunk>> {
        let d = ck.depth() as usize;
        let xyz = ck.position();

        if let Some((fast_xyz, chunk)) = &self.fast[d] {
            if *fast_xyz == xyz {
                return Some(Arc::clone(chunk));
            }
        }
        if let Some(chunk) = self.slow[d].get(&xyz) {
            let chunk = Arc::clone(chunk);
            self.fast[d] = Some((xyz, Arc::clone(&chunk)));
            return Some(chunk);
        }
        // Still referenced from the previous generation: promote it back,
        // no new reference needed.
        if let Some(chunk) = self.aged[d].remove(&xyz) {
            self.slow[d].insert(xyz, Arc::clone(&chunk));
            self.fast[d] = Some((xyz, Arc::clone(&chunk)));
            return Some(chunk);
        }
        None
    }

    /// Record a chunk the cache just referenced on our behalf.
    pub fn set(&mut self, ck: &ChunkKey, chunk: Arc<Chunk>) {
        let d = ck.depth() as usize;
        let xyz = ck.position();
        self.fast[d] = Some((xyz, Arc::clone(&chunk)));
        self.slow[d].insert(xyz, chunk);
    }

    /// Release the previous generation and rotate.
    pub fn clip(&mut self) {
        for d in 0..MAX_DEPTH {
            for (xyz, chunk) in std::mem::take(&mut self.aged[d]) {
                drop(chunk);
                self.cache.release(d, xyz);
            }
            self.aged[d] = std::mem::take(&mut self.slow[d]);
            self.fast[d] = None;
        }
        self.cache.clipped();
    }
}

impl Drop for Clipper<'_> {
    fn drop(&mut self) {
        // Both generations hold exactly one reference per chunk.
        for d in 0..MAX_DEPTH {
            for (xyz, chunk) in std::mem::take(&mut self.aged[d]) {
                drop(chunk);
                self.cache.release(d, xyz);
            }
            for (xyz, chunk) in std::mem::take(&mut self.slow[d]) {
                drop(chunk);
                self.cache.release(d, xyz);
            }
            self.fast[d] = None;
        }
    }
}
