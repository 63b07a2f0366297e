//! Data models for the source platform's resources.
//!
//! These mirror the JSON shapes returned by the compute, storage and build
//! REST services closely enough to deserialize them with `serde`; fields the
//! pipeline never reads are left out.

pub mod bucket;
pub mod image;
pub mod network;
pub mod object;
pub mod vm;
