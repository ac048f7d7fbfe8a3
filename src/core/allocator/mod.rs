//! Free-space management for the container file
//!
//! Every byte of the file belongs to exactly one extent. Entry payloads,
//! the signing block, the central directory and the end record are `Used`;
//! holes left by removed or replaced entries are `Free` and get reused by
//! later allocations before the file grows.

pub mod extent;

pub use extent::{Extent, ExtentMap, ExtentState, Placement, Relocation};
