//! # keel-storage
//!
//! Storage engine core for KeelDB.
//!
//! This crate implements the two tightly-coupled subsystems at the heart
//! of the engine:
//!
//! - A **buffer pool** that caches fixed-size disk pages in memory, pins
//!   them against eviction while in use, and writes dirty pages back on
//!   eviction or explicit flush (CLOCK replacement).
//! - A **linear-probing hash index** whose header and data pages live
//!   entirely inside the buffer pool, so every index operation flows
//!   through fetch/pin/unpin.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Buffer pool: frames, CLOCK replacer, page table
pub mod buffer;

/// Disk manager: paged file I/O and page id allocation
pub mod disk;

/// Linear-probing hash index over buffer-pool pages
pub mod index;
