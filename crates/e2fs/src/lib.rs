#![forbid(unsafe_code)]
//! e2fs public API facade.
//!
//! Re-exports the engine from `e2fs-core` through a stable external
//! interface. This is the crate that downstream consumers (the CLI and
//! anything embedding the engine) depend on.

pub use e2fs_core::*;
