use glam::DVec3;
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type Point = DVec3;

/// Octant direction within a cube: bit 0 = +x, bit 1 = +y, bit 2 = +z.
pub type Dir = usize;

pub const DIR_END: usize = 8;

/// Octant of `point` relative to `mid`.
pub fn direction(mid: Point, point: Point) -> Dir {
    (usize::from(point.x >= mid.x))
        | (usize::from(point.y >= mid.y) << 1)
        | (usize::from(point.z >= mid.z) << 2)
}

/// Axis-aligned box. The root of an octree is cubic by construction; cells
/// derived from it by octant subdivision stay cubic.
///
/// Containment is half-open (`min <= p < max`) so subdivision partitions a
/// parent cell exactly. Conforming-bounds clipping uses the inclusive
/// variant instead, since a tight bounding box places real points on its max
/// face.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bounds {
    pub min: Point,
    pub max: Point,
}

impl Bounds {
    pub fn new(min: Point, max: Point) -> Self {
        Self { min, max }
    }

    pub fn mid(&self) -> Point {
        (self.min + self.max) * 0.5
    }

    pub fn width(&self) -> f64 {
        self.max.x - self.min.x
    }

    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.min.x
            && p.x < self.max.x
            && p.y >= self.min.y
            && p.y < self.max.y
            && p.z >= self.min.z
            && p.z < self.max.z
    }

    pub fn contains_inclusive(&self, p: Point) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }

    pub fn overlaps(&self, other: &Bounds) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    /// The octant cell in direction `dir`.
    pub fn octant(&self, dir: Dir) -> Bounds {
        let mid = self.mid();
        let mut b = *self;
        if dir & 1 != 0 {
            b.min.x = mid.x;
        } else {
            b.max.x = mid.x;
        }
        if dir & 2 != 0 {
            b.min.y = mid.y;
        } else {
            b.max.y = mid.y;
        }
        if dir & 4 != 0 {
            b.min.z = mid.z;
        } else {
            b.max.z = mid.z;
        }
        b
    }

    pub fn intersection(&self, other: &Bounds) -> Bounds {
        Bounds {
            min: self.min.max(other.min),
            max: self.max.min(other.max),
        }
    }

    pub fn grow(&mut self, p: Point) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Smallest cube centered on `conforming` that contains it, padded so
    /// points on the conforming max face stay strictly inside.
    pub fn cubeify(conforming: &Bounds) -> Bounds {
        let mid = conforming.mid();
        let extent = conforming.max - conforming.min;
        let half = extent.max_element().max(f64::MIN_POSITIVE) * 0.5;
        let radius = half * (1.0 + 1e-9) + 1e-9;
        Bounds {
            min: mid - DVec3::splat(radius),
            max: mid + DVec3::splat(radius),
        }
    }

    /// A box that can only shrink under `grow` until the first point lands.
    pub fn everted() -> Bounds {
        Bounds {
            min: DVec3::splat(f64::MAX),
            max: DVec3::splat(f64::MIN),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.min.x <= self.max.x && self.min.y <= self.max.y && self.min.z <= self.max.z
    }
}

// Stored in metadata files as the flat [minx, miny, minz, maxx, maxy, maxz]
// array viewers expect.
impl Serialize for Bounds {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(6))?;
        for v in [
            self.min.x, self.min.y, self.min.z, self.max.x, self.max.y, self.max.z,
        ] {
            seq.serialize_element(&v)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Bounds {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BoundsVisitor;

        impl<'de> Visitor<'de> for BoundsVisitor {
            type Value = Bounds;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an array of six numbers")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Bounds, A::Error> {
                let mut v = [0.0f64; 6];
                for (i, slot) in v.iter_mut().enumerate() {
                    *slot = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(i, &self))?;
                }
                Ok(Bounds {
                    min: DVec3::new(v[0], v[1], v[2]),
                    max: DVec3::new(v[3], v[4], v[5]),
                })
            }
        }

        deserializer.deserialize_seq(BoundsVisitor)
    }
}
