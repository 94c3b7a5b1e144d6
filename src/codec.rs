use crate::schema::Schema;
use crate::spatial::Bounds;
use crate::voxel::PointTable;
use crc32fast::Hasher;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Write};

const CHUNK_MAGIC: &[u8; 4] = b"CMLC";
const CHUNK_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 8 + 4 + 4;

/// Byte-level encoding of persisted chunks, selected by the `data_type`
/// metadata tag.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[default]
    Binary,
    Gzip,
}

impl DataType {
    pub fn extension(self) -> &'static str {
        match self {
            DataType::Binary => ".bin",
            DataType::Gzip => ".bin.gz",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Binary => "binary",
            DataType::Gzip => "gzip",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binary" => Ok(DataType::Binary),
            "gzip" => Ok(DataType::Gzip),
            other => Err(format!("unknown data type {other:?}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodecError {
    BadMagic,
    UnsupportedVersion { actual: u32 },
    ChecksumMismatch,
    TruncatedRecord,
    PointSizeMismatch { expected: usize, actual: usize },
    PointCountMismatch { expected: u64, actual: u64 },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => write!(f, "chunk record magic mismatch"),
            Self::UnsupportedVersion { actual } => {
                write!(f, "unsupported chunk record version {actual}")
            }
            Self::ChecksumMismatch => write!(f, "chunk record checksum mismatch"),
            Self::TruncatedRecord => write!(f, "truncated chunk record"),
            Self::PointSizeMismatch { expected, actual } => write!(
                f,
                "chunk point size mismatch: expected {expected}, got {actual}"
            ),
            Self::PointCountMismatch { expected, actual } => write!(
                f,
                "chunk point count mismatch: expected {expected}, got {actual}"
            ),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<CodecError> for io::Error {
    fn from(error: CodecError) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, error)
    }
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

fn frame(schema: &Schema, table: &PointTable) -> Vec<u8> {
    let point_size = schema.point_size() as u32;
    let body = table.bytes();
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(CHUNK_MAGIC);
    out.extend_from_slice(&CHUNK_VERSION.to_le_bytes());
    out.extend_from_slice(&table.len().to_le_bytes());
    out.extend_from_slice(&point_size.to_le_bytes());
    out.extend_from_slice(&crc32(body).to_le_bytes());
    out.extend_from_slice(body);
    out
}

fn unframe(schema: &Schema, bytes: &[u8]) -> Result<PointTable, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::TruncatedRecord);
    }
    if &bytes[0..4] != CHUNK_MAGIC {
        return Err(CodecError::BadMagic);
    }
    let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    if version != CHUNK_VERSION {
        return Err(CodecError::UnsupportedVersion { actual: version });
    }
    let count = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
    let point_size = u32::from_le_bytes(bytes[16..20].try_into().unwrap()) as usize;
    let checksum = u32::from_le_bytes(bytes[20..24].try_into().unwrap());

    let expected = schema.point_size();
    if point_size != expected {
        return Err(CodecError::PointSizeMismatch {
            expected,
            actual: point_size,
        });
    }

    let body = &bytes[HEADER_LEN..];
    if crc32(body) != checksum {
        return Err(CodecError::ChecksumMismatch);
    }
    if body.len() % point_size != 0 {
        return Err(CodecError::TruncatedRecord);
    }
    let actual = (body.len() / point_size) as u64;
    if actual != count {
        return Err(CodecError::PointCountMismatch {
            expected: count,
            actual,
        });
    }
    Ok(PointTable::from_bytes(point_size, body.to_vec()))
}

/// Serialize a point table. `bounds` is part of the contract for codecs that
/// delta-encode against the cell; the built-in codecs do not need it.
pub fn encode(
    data_type: DataType,
    schema: &Schema,
    table: &PointTable,
    _bounds: &Bounds,
) -> io::Result<Vec<u8>> {
    let framed = frame(schema, table);
    match data_type {
        DataType::Binary => Ok(framed),
        DataType::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&framed)?;
            encoder.finish()
        }
    }
}

pub fn decode(data_type: DataType, schema: &Schema, bytes: &[u8]) -> io::Result<PointTable> {
    let framed = match data_type {
        DataType::Binary => bytes.to_vec(),
        DataType::Gzip => {
            let mut decoder = GzDecoder::new(bytes);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            out
        }
    };
    Ok(unframe(schema, &framed)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DimType, Dimension, Schema};
    use glam::DVec3;

    fn schema() -> Schema {
        Schema::new(vec![
            Dimension::new("X", DimType::Float64),
            Dimension::new("Y", DimType::Float64),
        ])
    }

    fn table() -> PointTable {
        let mut t = PointTable::with_capacity(16, 2);
        t.push(&[1u8; 16]);
        t.push(&[2u8; 16]);
        t
    }

    fn bounds() -> Bounds {
        Bounds::new(DVec3::ZERO, DVec3::ONE)
    }

    #[test]
    fn binary_round_trip() {
        let encoded = encode(DataType::Binary, &schema(), &table(), &bounds()).unwrap();
        let decoded = decode(DataType::Binary, &schema(), &encoded).unwrap();
        assert_eq!(decoded, table());
    }

    #[test]
    fn gzip_round_trip() {
        let encoded = encode(DataType::Gzip, &schema(), &table(), &bounds()).unwrap();
        assert_ne!(encoded[0..2], CHUNK_MAGIC[0..2]);
        let decoded = decode(DataType::Gzip, &schema(), &encoded).unwrap();
        assert_eq!(decoded, table());
    }

    #[test]
    fn decode_rejects_corruption() {
        let mut encoded = encode(DataType::Binary, &schema(), &table(), &bounds()).unwrap();

        let mut bad_magic = encoded.clone();
        bad_magic[0] = b'X';
        assert!(decode(DataType::Binary, &schema(), &bad_magic).is_err());

        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        let err = decode(DataType::Binary, &schema(), &encoded).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn decode_rejects_wrong_point_size() {
        let encoded = encode(DataType::Binary, &schema(), &table(), &bounds()).unwrap();
        let narrow = Schema::new(vec![Dimension::new("X", DimType::Float64)]);
        assert!(decode(DataType::Binary, &narrow, &encoded).is_err());
    }
}
