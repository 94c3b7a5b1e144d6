use crate::builder::cache::ChunkCache;
use crate::builder::clipper::Clipper;
use crate::codec;
use crate::endpoints::Endpoints;
use crate::hierarchy::Hierarchy;
use crate::key::{ChunkKey, Key};
use crate::metadata::Metadata;
use crate::schema::Layout;
use crate::spatial::{direction, DIR_END};
use crate::voxel::{MemBlock, PointTable, Slot, Voxel};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

const GRID_POINTS_PER_PAGE: usize = 4096;
const OVERFLOW_POINTS_PER_PAGE: usize = 256;

/// One grid column: at most one voxel per integer z. The decoded point is
/// kept beside its arena slot so distance comparisons never touch the arena.
#[derive(Debug)]
struct GridCell {
    point: crate::spatial::Point,
    slot: Slot,
}

#[derive(Debug, Default)]
struct VoxelTube {
    map: Mutex<BTreeMap<u64, GridCell>>,
}

/// Holding area for points awaiting descent into one child octant.
#[derive(Debug)]
struct Overflow {
    block: MemBlock,
    list: Vec<OverflowEntry>,
}

#[derive(Debug)]
struct OverflowEntry {
    key: Key,
    point: crate::spatial::Point,
    slot: Slot,
}

impl Overflow {
    fn new(point_size: usize) -> Self {
        Self {
            block: MemBlock::new(point_size, OVERFLOW_POINTS_PER_PAGE),
            list: Vec::new(),
        }
    }

    fn insert(&mut self, voxel: &Voxel, key: &Key) {
        let slot = self.block.push(&voxel.data);
        self.list.push(OverflowEntry {
            key: *key,
            point: voxel.point,
            slot,
        });
    }

    fn size(&self) -> u64 {
        self.block.size()
    }
}

#[derive(Debug)]
struct OverflowState {
    buckets: [Option<Overflow>; DIR_END],
    count: u64,
}

/// One octree node's in-memory working set: a fixed-span voxel grid backed
/// by a bump arena, plus eight optional overflow buckets. Shared across
/// worker threads; all mutation happens under the short per-structure locks.
#[derive(Debug)]
pub struct Chunk {
    metadata: Arc<Metadata>,
    layout: Arc<Layout>,
    span: u64,
    chunk_key: ChunkKey,
    child_keys: [ChunkKey; DIR_END],
    grid: Vec<VoxelTube>,
    grid_block: Mutex<MemBlock>,
    overflow: Mutex<OverflowState>,
}

impl Chunk {
    pub fn new(
        metadata: Arc<Metadata>,
        layout: Arc<Layout>,
        chunk_key: ChunkKey,
        hierarchy: &Hierarchy,
    ) -> Chunk {
        let span = metadata.span;
        let point_size = layout.point_size;
        let child_keys = std::array::from_fn(|dir| chunk_key.get_step(dir));

        // An octant whose child already has persisted points gets no
        // overflow bucket: new arrivals must stream through that child.
        let buckets = std::array::from_fn(|dir: usize| {
            let child: &ChunkKey = &child_keys[dir];
            if hierarchy.get(child.dxyz()).is_none() {
                Some(Overflow::new(point_size))
            } else {
                None
            }
        });

        let mut grid = Vec::with_capacity((span * span) as usize);
        grid.resize_with((span * span) as usize, VoxelTube::default);

        Chunk {
            metadata,
            layout,
            span,
            chunk_key,
            child_keys,
            grid,
            grid_block: Mutex::new(MemBlock::new(point_size, GRID_POINTS_PER_PAGE)),
            overflow: Mutex::new(OverflowState {
                buckets,
                count: 0,
            }),
        }
    }

    pub fn chunk_key(&self) -> &ChunkKey {
        &self.chunk_key
    }

    pub fn child_at(&self, dir: usize) -> &ChunkKey {
        &self.child_keys[dir]
    }

    fn lock_grid_block(&self) -> MutexGuard<'_, MemBlock> {
        self.grid_block.lock().expect("chunk arena lock poisoned")
    }

    /// Place `voxel` into this chunk. Returns true iff a new point was
    /// installed here (in the grid or an overflow bucket); false tells the
    /// cache to descend one level and try again.
    ///
    /// A grid cell keeps whichever candidate is closer to the chunk mid;
    /// on a swap the displaced point keeps propagating in `voxel`.
    pub fn insert(
        &self,
        cache: &ChunkCache,
        clipper: &mut Clipper,
        voxel: &mut Voxel,
        key: &mut Key,
    ) -> bool {
        let pos = key.position();
        let i = ((pos.y % self.span) * self.span + (pos.x % self.span)) as usize;
        let mut tube = self.grid[i].map.lock().expect("voxel tube lock poisoned");

        match tube.entry(pos.z) {
            Entry::Vacant(cell) => {
                let slot = self.lock_grid_block().push(&voxel.data);
                cell.insert(GridCell {
                    point: voxel.point,
                    slot,
                });
                return true;
            }
            Entry::Occupied(mut cell) => {
                let cell = cell.get_mut();
                let mid = self.chunk_key.bounds().mid();
                // Strict less-than: at equal distance the incumbent stays.
                if voxel.point.distance_squared(mid) < cell.point.distance_squared(mid) {
                    self.lock_grid_block().swap(cell.slot, &mut voxel.data);
                    std::mem::swap(&mut cell.point, &mut voxel.point);
                }
            }
        }
        drop(tube);

        self.insert_overflow(cache, clipper, voxel, key)
    }

    fn insert_overflow(
        &self,
        cache: &ChunkCache,
        clipper: &mut Clipper,
        voxel: &mut Voxel,
        key: &mut Key,
    ) -> bool {
        // No overflow in the levels shared between subsets.
        if self.chunk_key.depth() < self.metadata.shared_depth() {
            return false;
        }

        let dir = direction(self.chunk_key.bounds().mid(), voxel.point);

        let mut state = self.overflow.lock().expect("overflow lock poisoned");
        let Some(bucket) = state.buckets[dir].as_mut() else {
            return false;
        };
        bucket.insert(voxel, key);
        state.count += 1;

        if state.count >= self.metadata.min_node_size {
            self.maybe_overflow(cache, clipper, &mut state);
        }
        true
    }

    fn maybe_overflow(
        &self,
        cache: &ChunkCache,
        clipper: &mut Clipper,
        state: &mut OverflowState,
    ) {
        let grid_size = self.lock_grid_block().size();
        if grid_size + state.count < self.metadata.max_node_size {
            return;
        }

        // Largest bucket wins; ties go to the lowest index.
        let mut selected = 0;
        let mut selected_size = 0;
        for (dir, bucket) in state.buckets.iter().enumerate() {
            if let Some(bucket) = bucket {
                if bucket.size() > selected_size {
                    selected = dir;
                    selected_size = bucket.size();
                }
            }
        }

        // Splitting off a bucket below the minimum node size would just
        // produce an uneconomically small child.
        if selected_size < self.metadata.min_node_size {
            return;
        }

        self.do_overflow(cache, clipper, state, selected);
    }

    fn do_overflow(
        &self,
        cache: &ChunkCache,
        clipper: &mut Clipper,
        state: &mut OverflowState,
        dir: usize,
    ) {
        let bucket = state.buckets[dir].take().expect("overflow bucket present");
        state.count -= bucket.size();

        let child = self.child_keys[dir];
        for entry in &bucket.list {
            let mut voxel = Voxel {
                point: entry.point,
                data: bucket.block.get(entry.slot).to_vec(),
            };
            let mut key = entry.key;
            key.step(voxel.point);
            cache.insert(&mut voxel, &mut key, child, clipper);
        }
    }

    fn filename(&self) -> String {
        format!(
            "{}{}{}",
            self.chunk_key,
            self.metadata.postfix_at_depth(self.chunk_key.depth()),
            self.metadata.data_type.extension()
        )
    }

    /// Serialize every resident point (grid arena first, then present
    /// buckets) through the configured codec. Returns the written count.
    pub fn save(&self, endpoints: &Endpoints) -> io::Result<u64> {
        // Overflow before arena, the same order the insert path uses.
        let state = self.overflow.lock().expect("overflow lock poisoned");
        let grid_block = self.lock_grid_block();

        let mut np = grid_block.size();
        for bucket in state.buckets.iter().flatten() {
            np += bucket.size();
        }

        let mut table = PointTable::with_capacity(self.layout.point_size, np as usize);
        table.extend_from_block(&grid_block);
        for bucket in state.buckets.iter().flatten() {
            table.extend_from_block(&bucket.block);
        }

        let bytes = codec::encode(
            self.metadata.data_type,
            &self.layout.schema,
            &table,
            self.chunk_key.bounds(),
        )?;
        endpoints.data.put(&self.filename(), &bytes)?;
        Ok(np)
    }

    /// Re-materialize an evicted chunk: decode exactly `np` points and route
    /// each through the normal insertion path, so the loaded state obeys the
    /// same invariants as fresh data.
    pub fn load(
        &self,
        cache: &ChunkCache,
        clipper: &mut Clipper,
        endpoints: &Endpoints,
        np: u64,
    ) -> io::Result<()> {
        let bytes = endpoints.data.get(&self.filename())?;
        let table = codec::decode(self.metadata.data_type, &self.layout.schema, &bytes)?;
        if table.len() != np {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "chunk {} holds {} points, hierarchy says {np}",
                    self.chunk_key,
                    table.len()
                ),
            ));
        }

        let grid_depth = self.metadata.start_depth() + self.chunk_key.depth();
        for record in table.iter() {
            let mut voxel = Voxel::from_record(&self.layout, record);
            let mut key = Key::new(self.metadata.bounds);
            key.init(voxel.point, grid_depth);
            cache.insert(&mut voxel, &mut key, self.chunk_key, clipper);
        }
        Ok(())
    }
}
