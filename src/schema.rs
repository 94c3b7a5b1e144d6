use crate::spatial::Point;
use glam::DVec3;
use serde::{Deserialize, Serialize};
use std::io;

pub const DIM_X: &str = "X";
pub const DIM_Y: &str = "Y";
pub const DIM_Z: &str = "Z";
pub const DIM_ORIGIN_ID: &str = "OriginId";
pub const DIM_POINT_ID: &str = "PointId";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimType {
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
}

impl DimType {
    pub fn size(self) -> usize {
        match self {
            DimType::Int8 | DimType::Uint8 => 1,
            DimType::Int16 | DimType::Uint16 => 2,
            DimType::Int32 | DimType::Uint32 | DimType::Float32 => 4,
            DimType::Int64 | DimType::Uint64 | DimType::Float64 => 8,
        }
    }

    /// Encode a real-valued sample into `out` (integer types round).
    pub fn write_f64(self, out: &mut [u8], v: f64) {
        match self {
            DimType::Int8 => out[0] = (v.round() as i8).to_le_bytes()[0],
            DimType::Int16 => out[..2].copy_from_slice(&(v.round() as i16).to_le_bytes()),
            DimType::Int32 => out[..4].copy_from_slice(&(v.round() as i32).to_le_bytes()),
            DimType::Int64 => out[..8].copy_from_slice(&(v.round() as i64).to_le_bytes()),
            DimType::Uint8 => out[0] = (v.round().max(0.0) as u8).to_le_bytes()[0],
            DimType::Uint16 => {
                out[..2].copy_from_slice(&(v.round().max(0.0) as u16).to_le_bytes())
            }
            DimType::Uint32 => {
                out[..4].copy_from_slice(&(v.round().max(0.0) as u32).to_le_bytes())
            }
            DimType::Uint64 => {
                out[..8].copy_from_slice(&(v.round().max(0.0) as u64).to_le_bytes())
            }
            DimType::Float32 => out[..4].copy_from_slice(&(v as f32).to_le_bytes()),
            DimType::Float64 => out[..8].copy_from_slice(&v.to_le_bytes()),
        }
    }

    pub fn read_f64(self, data: &[u8]) -> f64 {
        match self {
            DimType::Int8 => i8::from_le_bytes([data[0]]) as f64,
            DimType::Int16 => i16::from_le_bytes([data[0], data[1]]) as f64,
            DimType::Int32 => i32::from_le_bytes(data[..4].try_into().unwrap()) as f64,
            DimType::Int64 => i64::from_le_bytes(data[..8].try_into().unwrap()) as f64,
            DimType::Uint8 => data[0] as f64,
            DimType::Uint16 => u16::from_le_bytes([data[0], data[1]]) as f64,
            DimType::Uint32 => u32::from_le_bytes(data[..4].try_into().unwrap()) as f64,
            DimType::Uint64 => u64::from_le_bytes(data[..8].try_into().unwrap()) as f64,
            DimType::Float32 => f32::from_le_bytes(data[..4].try_into().unwrap()) as f64,
            DimType::Float64 => f64::from_le_bytes(data[..8].try_into().unwrap()),
        }
    }

    pub fn write_u64(self, out: &mut [u8], v: u64) {
        match self {
            DimType::Uint64 => out[..8].copy_from_slice(&v.to_le_bytes()),
            DimType::Uint32 => out[..4].copy_from_slice(&(v as u32).to_le_bytes()),
            _ => self.write_f64(out, v as f64),
        }
    }

    pub fn read_u64(self, data: &[u8]) -> u64 {
        match self {
            DimType::Uint64 => u64::from_le_bytes(data[..8].try_into().unwrap()),
            DimType::Uint32 => u32::from_le_bytes(data[..4].try_into().unwrap()) as u64,
            _ => self.read_f64(data) as u64,
        }
    }
}

/// Running statistics for one dimension, as stored in `ept.json`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DimensionStats {
    pub minimum: f64,
    pub maximum: f64,
    pub mean: f64,
    pub count: u64,
}

impl DimensionStats {
    pub fn merge(a: &DimensionStats, b: &DimensionStats) -> DimensionStats {
        let count = a.count + b.count;
        let mean = if count == 0 {
            0.0
        } else {
            (a.mean * a.count as f64 + b.mean * b.count as f64) / count as f64
        };
        DimensionStats {
            minimum: a.minimum.min(b.minimum),
            maximum: a.maximum.max(b.maximum),
            mean,
            count,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    #[serde(rename = "type")]
    pub dtype: DimType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<DimensionStats>,
}

impl Dimension {
    pub fn new(name: &str, dtype: DimType) -> Self {
        Self {
            name: name.to_string(),
            dtype,
            scale: None,
            offset: None,
            stats: None,
        }
    }
}

/// Per-axis quantization applied when X/Y/Z are promoted to integers.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScaleOffset {
    pub scale: [f64; 3],
    pub offset: [f64; 3],
}

impl ScaleOffset {
    /// Snap a real point onto the integer lattice; returns the lattice
    /// coordinates and the quantized real position.
    pub fn clip(&self, p: Point) -> ([i64; 3], Point) {
        let ints = [
            ((p.x - self.offset[0]) / self.scale[0]).round() as i64,
            ((p.y - self.offset[1]) / self.scale[1]).round() as i64,
            ((p.z - self.offset[2]) / self.scale[2]).round() as i64,
        ];
        (ints, self.expand(ints))
    }

    pub fn expand(&self, ints: [i64; 3]) -> Point {
        DVec3::new(
            ints[0] as f64 * self.scale[0] + self.offset[0],
            ints[1] as f64 * self.scale[1] + self.offset[1],
            ints[2] as f64 * self.scale[2] + self.offset[2],
        )
    }
}

/// Ordered list of dimensions describing one point record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    pub dims: Vec<Dimension>,
}

impl Schema {
    pub fn new(dims: Vec<Dimension>) -> Self {
        Self { dims }
    }

    /// Minimal positional schema.
    pub fn xyz() -> Self {
        Schema::new(vec![
            Dimension::new(DIM_X, DimType::Float64),
            Dimension::new(DIM_Y, DimType::Float64),
            Dimension::new(DIM_Z, DimType::Float64),
        ])
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.dims.iter().position(|d| d.name == name)
    }

    pub fn point_size(&self) -> usize {
        self.dims.iter().map(|d| d.dtype.size()).sum()
    }

    pub fn has_stats(&self) -> bool {
        !self.dims.is_empty() && self.dims.iter().all(|d| d.stats.is_some())
    }

    pub fn clear_stats(&self) -> Schema {
        let mut out = self.clone();
        for d in &mut out.dims {
            d.stats = None;
        }
        out
    }

    pub fn scale_offset(&self) -> Option<ScaleOffset> {
        let axis = |name: &str| -> Option<(f64, f64)> {
            let d = &self.dims[self.index_of(name)?];
            if d.scale.is_none() && d.offset.is_none() {
                return None;
            }
            Some((d.scale.unwrap_or(1.0), d.offset.unwrap_or(0.0)))
        };
        let x = axis(DIM_X)?;
        let y = axis(DIM_Y).unwrap_or(x);
        let z = axis(DIM_Z).unwrap_or(x);
        Some(ScaleOffset {
            scale: [x.0, y.0, z.0],
            offset: [x.1, y.1, z.1],
        })
    }

    pub fn set_scale_offset(&mut self, so: ScaleOffset) {
        for (i, name) in [DIM_X, DIM_Y, DIM_Z].iter().enumerate() {
            if let Some(idx) = self.index_of(name) {
                self.dims[idx].scale = Some(so.scale[i]);
                self.dims[idx].offset = Some(so.offset[i]);
            }
        }
    }

    /// The storage schema: X/Y/Z promoted to `int64` when quantized (else
    /// `float64`), with `OriginId` and `PointId` appended when absent.
    pub fn absolute(&self) -> Schema {
        let quantized = self.scale_offset().is_some();
        let mut dims: Vec<Dimension> = self
            .dims
            .iter()
            .map(|d| {
                let mut d = d.clone();
                if d.name == DIM_X || d.name == DIM_Y || d.name == DIM_Z {
                    d.dtype = if quantized {
                        DimType::Int64
                    } else {
                        DimType::Float64
                    };
                }
                d
            })
            .collect();
        if self.index_of(DIM_ORIGIN_ID).is_none() {
            dims.push(Dimension::new(DIM_ORIGIN_ID, DimType::Uint64));
        }
        if self.index_of(DIM_POINT_ID).is_none() {
            dims.push(Dimension::new(DIM_POINT_ID, DimType::Uint64));
        }
        Schema::new(dims)
    }

    /// Union of two schemas by dimension name, merging stats when both sides
    /// carry them (or dropping stats entirely when `fold_stats` is false).
    pub fn combine(&self, other: &Schema, fold_stats: bool) -> Schema {
        let mut out = self.clone();
        for d in &other.dims {
            match out.index_of(&d.name) {
                Some(i) => {
                    let dst = &mut out.dims[i];
                    dst.stats = if !fold_stats {
                        None
                    } else {
                        match (&dst.stats, &d.stats) {
                            (Some(a), Some(b)) => Some(DimensionStats::merge(a, b)),
                            _ => None,
                        }
                    };
                    if dst.scale.is_none() {
                        dst.scale = d.scale;
                    }
                    if dst.offset.is_none() {
                        dst.offset = d.offset;
                    }
                }
                None => out.dims.push(Dimension {
                    stats: if fold_stats { d.stats } else { None },
                    ..d.clone()
                }),
            }
        }
        out
    }
}

/// Byte layout of one record under a schema, with the positional and id
/// dimensions resolved up front.
#[derive(Clone, Debug)]
pub struct Layout {
    pub schema: Schema,
    pub offsets: Vec<usize>,
    pub point_size: usize,
    x: usize,
    y: usize,
    z: usize,
    origin: usize,
    point_id: usize,
    scale_offset: Option<ScaleOffset>,
}

impl Layout {
    pub fn new(schema: &Schema) -> io::Result<Layout> {
        let mut offsets = Vec::with_capacity(schema.dims.len());
        let mut at = 0usize;
        for d in &schema.dims {
            offsets.push(at);
            at += d.dtype.size();
        }
        let find = |name: &str| {
            schema.index_of(name).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("schema is missing required dimension {name}"),
                )
            })
        };
        Ok(Layout {
            offsets,
            point_size: at,
            x: find(DIM_X)?,
            y: find(DIM_Y)?,
            z: find(DIM_Z)?,
            origin: find(DIM_ORIGIN_ID)?,
            point_id: find(DIM_POINT_ID)?,
            scale_offset: schema.scale_offset(),
            schema: schema.clone(),
        })
    }

    fn field(&self, data: &[u8], i: usize) -> f64 {
        self.schema.dims[i].dtype.read_f64(&data[self.offsets[i]..])
    }

    fn field_mut<'a>(&self, data: &'a mut [u8], i: usize) -> (&'a mut [u8], DimType) {
        (&mut data[self.offsets[i]..], self.schema.dims[i].dtype)
    }

    /// Decode the real-space position of a record.
    pub fn point(&self, data: &[u8]) -> Point {
        let raw = DVec3::new(
            self.field(data, self.x),
            self.field(data, self.y),
            self.field(data, self.z),
        );
        match &self.scale_offset {
            Some(so) => so.expand([raw.x as i64, raw.y as i64, raw.z as i64]),
            None => raw,
        }
    }

    /// Encode a position, quantizing when a scale/offset is set; returns the
    /// stored (possibly snapped) real-space point.
    pub fn set_point(&self, data: &mut [u8], p: Point) -> Point {
        let (values, stored) = match &self.scale_offset {
            Some(so) => {
                let (ints, snapped) = so.clip(p);
                ([ints[0] as f64, ints[1] as f64, ints[2] as f64], snapped)
            }
            None => ([p.x, p.y, p.z], p),
        };
        for (i, v) in [self.x, self.y, self.z].into_iter().zip(values) {
            let (slot, dtype) = self.field_mut(data, i);
            dtype.write_f64(slot, v);
        }
        stored
    }

    pub fn set_origin_id(&self, data: &mut [u8], origin: u64) {
        let (slot, dtype) = self.field_mut(data, self.origin);
        dtype.write_u64(slot, origin);
    }

    pub fn origin_id(&self, data: &[u8]) -> u64 {
        self.schema.dims[self.origin]
            .dtype
            .read_u64(&data[self.offsets[self.origin]..])
    }

    pub fn set_point_id(&self, data: &mut [u8], id: u64) {
        let (slot, dtype) = self.field_mut(data, self.point_id);
        dtype.write_u64(slot, id);
    }

    pub fn point_id(&self, data: &[u8]) -> u64 {
        self.schema.dims[self.point_id]
            .dtype
            .read_u64(&data[self.offsets[self.point_id]..])
    }

    /// Write an arbitrary dimension by schema index.
    pub fn set_field(&self, data: &mut [u8], i: usize, v: f64) {
        let (slot, dtype) = self.field_mut(data, i);
        dtype.write_f64(slot, v);
    }
}
