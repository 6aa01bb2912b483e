//! Core types for KeelDB.

mod ids;

pub use ids::{Lsn, PageId};
