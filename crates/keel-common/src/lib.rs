//! # keel-common
//!
//! Common types and constants for KeelDB.
//!
//! This crate provides the foundational types shared across the KeelDB
//! storage engine:
//!
//! - **Types**: Core identifiers (`PageId`, `Lsn`)
//! - **Constants**: Page geometry and buffer pool defaults
//!
//! ## Example
//!
//! ```rust
//! use keel_common::types::PageId;
//! use keel_common::constants::PAGE_SIZE;
//!
//! let page_id = PageId::new(42);
//! assert!(page_id.is_valid());
//! assert_eq!(PAGE_SIZE, 4096);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod constants;
pub mod types;

// Re-export commonly used items at the crate root
pub use constants::*;
pub use types::{Lsn, PageId};
