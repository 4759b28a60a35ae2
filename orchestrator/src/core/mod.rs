//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects and threads. They operate on
//! in-memory data structures and return deterministic outputs suitable for
//! tests.

pub mod builder;
pub mod command;
pub mod filter;
pub mod invariants;
pub mod path;
pub mod types;
