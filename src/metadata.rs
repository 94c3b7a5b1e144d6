use crate::codec::DataType;
use crate::schema::Schema;
use crate::spatial::Bounds;
use serde::{Deserialize, Serialize};
use std::io;

/// One tile of a partitioned build: `id` in `1..=of`, `of` a power of four.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subset {
    pub id: u32,
    pub of: u32,
}

impl Subset {
    pub fn validate(&self) -> io::Result<()> {
        let ok = self.of >= 4
            && self.of.is_power_of_two()
            && self.of.trailing_zeros() % 2 == 0
            && self.id >= 1
            && self.id <= self.of;
        if ok {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "invalid subset {}/{}: id must be in 1..=of and of a power of four",
                    self.id, self.of
                ),
            ))
        }
    }

    /// Chunk depth at which subsets own disjoint subtrees.
    pub fn shared_depth(&self) -> u32 {
        self.of.trailing_zeros() / 2
    }

    /// This subset's tile of the cubic root bounds: a `sqrt(of) x sqrt(of)`
    /// split in x/y with the full z extent.
    pub fn bounds(&self, root: &Bounds) -> Bounds {
        let n = 1u32 << self.shared_depth();
        let tile = root.width() / n as f64;
        let id0 = self.id - 1;
        let col = (id0 % n) as f64;
        let row = (id0 / n) as f64;
        let mut b = *root;
        b.min.x = root.min.x + col * tile;
        b.max.x = root.min.x + (col + 1.0) * tile;
        b.min.y = root.min.y + row * tile;
        b.max.y = root.min.y + (row + 1.0) * tile;
        b
    }

    pub fn postfix(&self) -> String {
        format!("-{}", self.id)
    }
}

/// Worker split: `work` threads ingest sources, `clip` threads serialize
/// evicted chunks in the background.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Threads {
    pub work: usize,
    pub clip: usize,
}

/// Serialization is more expensive than tree work, so most of a flat thread
/// count goes to the clip pool.
pub const WORK_TO_CLIP_RATIO: f64 = 0.33;

impl Threads {
    pub fn from_total(total: usize) -> Threads {
        let total = total.max(2);
        let work = ((total as f64 * WORK_TO_CLIP_RATIO).ceil() as usize).max(1);
        Threads {
            work,
            clip: (total - work).max(1),
        }
    }

    pub fn total(&self) -> usize {
        self.work + self.clip
    }
}

/// Everything fixed about a dataset once building starts.
#[derive(Clone, Debug)]
pub struct Metadata {
    /// Cubic root bounds of the octree.
    pub bounds: Bounds,
    /// Tight bounds of the actual input; inserts are clipped to this.
    pub bounds_conforming: Bounds,
    pub schema: Schema,
    pub srs: Option<String>,
    pub span: u64,
    pub data_type: DataType,
    pub subset: Option<Subset>,
    pub min_node_size: u64,
    pub max_node_size: u64,
    /// Depth stride of the saved hierarchy; 0 until chosen at save time.
    pub hierarchy_step: u32,
}

impl Metadata {
    /// Octree levels spanned by one chunk's grid.
    pub fn start_depth(&self) -> u32 {
        debug_assert!(self.span.is_power_of_two());
        self.span.trailing_zeros()
    }

    pub fn shared_depth(&self) -> u32 {
        self.subset.map(|s| s.shared_depth()).unwrap_or(0)
    }

    /// Postfix applied to dataset-level filenames (`ept-2.json`).
    pub fn postfix(&self) -> String {
        self.subset.map(|s| s.postfix()).unwrap_or_default()
    }

    /// Postfix applied to a chunk file at `depth`. At and beyond the shared
    /// depth subsets own disjoint subtrees, so those names are already
    /// canonical and the merge can leave them in place.
    pub fn postfix_at_depth(&self, depth: u32) -> String {
        match self.subset {
            Some(s) if depth < s.shared_depth() => s.postfix(),
            _ => String::new(),
        }
    }
}

/// The public dataset descriptor, `ept.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EptInfo {
    pub bounds: Bounds,
    pub bounds_conforming: Bounds,
    pub schema: Schema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srs: Option<String>,
    pub span: u64,
    pub start_depth: u32,
    pub points: u64,
    pub data_type: DataType,
}

/// Internal build descriptor, `ept-build.json`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EptBuild {
    pub min_node_size: u64,
    pub max_node_size: u64,
    pub hierarchy_step: u32,
    pub shared_depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subset: Option<Subset>,
    pub data_type: DataType,
}

impl Metadata {
    pub fn to_ept_info(&self, points: u64) -> EptInfo {
        EptInfo {
            bounds: self.bounds,
            bounds_conforming: self.bounds_conforming,
            schema: self.schema.clone(),
            srs: self.srs.clone(),
            span: self.span,
            start_depth: self.start_depth(),
            points,
            data_type: self.data_type,
        }
    }

    pub fn to_ept_build(&self) -> EptBuild {
        EptBuild {
            min_node_size: self.min_node_size,
            max_node_size: self.max_node_size,
            hierarchy_step: self.hierarchy_step,
            shared_depth: self.shared_depth(),
            subset: self.subset,
            data_type: self.data_type,
        }
    }

    pub fn from_files(info: EptInfo, build: EptBuild) -> Metadata {
        Metadata {
            bounds: info.bounds,
            bounds_conforming: info.bounds_conforming,
            schema: info.schema,
            srs: info.srs,
            span: info.span,
            data_type: info.data_type,
            subset: build.subset,
            min_node_size: build.min_node_size,
            max_node_size: build.max_node_size,
            hierarchy_step: build.hierarchy_step,
        }
    }
}
