//! Disk layer for KeelDB.
//!
//! The disk manager owns a single data file divided into fixed-size page
//! slots. It hands out page ids, reuses deallocated ids, and moves whole
//! page images between frames and the file. The buffer pool is its only
//! client; nothing above the pool touches the disk directly.

mod error;
mod manager;

pub use error::{DiskError, DiskResult};
pub use manager::DiskManager;
