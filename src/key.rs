use crate::spatial::{direction, Bounds, Point};
use std::fmt;
use std::str::FromStr;

/// Maximum chunk depth the cache will ever address.
pub const MAX_DEPTH: usize = 64;

/// Integer cell coordinates at some depth.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Xyz {
    pub x: u64,
    pub y: u64,
    pub z: u64,
}

impl Xyz {
    pub fn new(x: u64, y: u64, z: u64) -> Self {
        Self { x, y, z }
    }

    fn step(&mut self, dir: usize) {
        self.x = (self.x << 1) | (dir as u64 & 1);
        self.y = (self.y << 1) | ((dir as u64 >> 1) & 1);
        self.z = (self.z << 1) | ((dir as u64 >> 2) & 1);
    }
}

/// Stable chunk identity: depth plus integer coordinates. This is the name
/// chunks are stored under (`d-x-y-z`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dxyz {
    pub d: u32,
    pub x: u64,
    pub y: u64,
    pub z: u64,
}

impl Dxyz {
    pub fn new(d: u32, x: u64, y: u64, z: u64) -> Self {
        Self { d, x, y, z }
    }

    pub fn xyz(&self) -> Xyz {
        Xyz::new(self.x, self.y, self.z)
    }

    /// Ancestor identity at a shallower depth.
    pub fn ancestor_at(&self, depth: u32) -> Dxyz {
        assert!(depth <= self.d);
        let shift = self.d - depth;
        Dxyz::new(depth, self.x >> shift, self.y >> shift, self.z >> shift)
    }
}

impl fmt::Display for Dxyz {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}-{}", self.d, self.x, self.y, self.z)
    }
}

impl FromStr for Dxyz {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut it = s.split('-');
        let mut next = |name: &str| {
            it.next()
                .ok_or_else(|| format!("missing {name} in node key {s:?}"))
        };
        let d = next("depth")?
            .parse::<u32>()
            .map_err(|e| format!("bad depth in node key {s:?}: {e}"))?;
        let mut parse = |name: &str| -> Result<u64, String> {
            next(name)?
                .parse::<u64>()
                .map_err(|e| format!("bad {name} in node key {s:?}: {e}"))
        };
        let x = parse("x")?;
        let y = parse("y")?;
        let z = parse("z")?;
        if it.next().is_some() {
            return Err(format!("trailing data in node key {s:?}"));
        }
        Ok(Dxyz::new(d, x, y, z))
    }
}

/// Grid-resolution octree descent key.
///
/// A fresh key covers the whole root bounds as a single cell at depth zero.
/// Descending `start_depth` levels reaches the root chunk's grid resolution;
/// each chunk level below adds one more step. At grid depth `g` the position
/// lies in `[0, 2^g)` per axis.
#[derive(Clone, Copy, Debug)]
pub struct Key {
    root: Bounds,
    bounds: Bounds,
    depth: u32,
    position: Xyz,
}

impl Key {
    pub fn new(root: Bounds) -> Self {
        Self {
            root,
            bounds: root,
            depth: 0,
            position: Xyz::default(),
        }
    }

    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn position(&self) -> Xyz {
        self.position
    }

    /// Restart at the root and descend to `grid_depth` toward `point`.
    pub fn init(&mut self, point: Point, grid_depth: u32) {
        self.bounds = self.root;
        self.depth = 0;
        self.position = Xyz::default();
        while self.depth < grid_depth {
            self.step(point);
        }
    }

    /// Descend one level toward `point`.
    pub fn step(&mut self, point: Point) {
        let dir = direction(self.bounds.mid(), point);
        self.bounds = self.bounds.octant(dir);
        self.position.step(dir);
        self.depth += 1;
    }
}

/// Identity of one chunk cell: bounds, 0-based chunk depth, and integer
/// position in `[0, 2^depth)` per axis.
#[derive(Clone, Copy, Debug)]
pub struct ChunkKey {
    bounds: Bounds,
    depth: u32,
    position: Xyz,
}

impl ChunkKey {
    /// The root chunk key.
    pub fn root(bounds: Bounds) -> Self {
        Self {
            bounds,
            depth: 0,
            position: Xyz::default(),
        }
    }

    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn position(&self) -> Xyz {
        self.position
    }

    /// The child chunk key in octant `dir`.
    pub fn get_step(&self, dir: usize) -> ChunkKey {
        let mut position = self.position;
        position.step(dir);
        ChunkKey {
            bounds: self.bounds.octant(dir),
            depth: self.depth + 1,
            position,
        }
    }

    /// Descend from the root to the chunk at `depth` containing `point`.
    pub fn init(root: Bounds, point: Point, depth: u32) -> ChunkKey {
        let mut ck = ChunkKey::root(root);
        while ck.depth < depth {
            ck = ck.get_step(direction(ck.bounds.mid(), point));
        }
        ck
    }

    pub fn dxyz(&self) -> Dxyz {
        Dxyz::new(self.depth, self.position.x, self.position.y, self.position.z)
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.dxyz().fmt(f)
    }
}
