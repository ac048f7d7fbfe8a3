//! Container core
//!
//! - [`allocator`] - extent map of the container file
//! - [`zip`] - byte-exact ZIP records and the signing block
//! - [`entry`] - entry arena and name index
//! - [`zfile`] - the container engine
//! - [`extension`] - hooks run during an update
//! - [`sign`] - v1 and v2 signing extensions

pub mod allocator;
pub mod compression;
pub mod entry;
pub mod error;
pub mod extension;
pub mod io;
pub mod options;
pub mod reader;
pub mod sign;
pub mod zfile;
pub mod zip;

pub use error::{Result, ZFileError};
pub use zfile::{ZFile, ZFileStats};
