//! `websift` crate (library surface).
//!
//! The `websift` binary is the main entrypoint. This module re-exports the core types and the
//! local backends so embedders can depend on one crate.

pub use websift_core as core;
pub use websift_local as local;
