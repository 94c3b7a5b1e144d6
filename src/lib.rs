//! Out-of-core point cloud indexing.
//!
//! `cumulus` ingests unordered point cloud sources and produces a
//! hierarchical, spatially sorted, chunked octree on disk suitable for
//! streaming random access. The builder inserts points from many sources in
//! parallel through a shared chunk cache; chunks overflow and lazily split
//! into children as they fill, and are serialized in the background once no
//! worker references them.

pub mod builder;
pub mod codec;
pub mod config;
pub mod endpoints;
pub mod hierarchy;
pub mod info;
pub mod key;
pub mod manifest;
pub mod metadata;
pub mod pipeline;
pub mod pool;
pub mod schema;
pub mod spatial;
pub mod voxel;
