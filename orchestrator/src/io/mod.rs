//! I/O helpers: run configuration and the declarative test tree store.

pub mod config;
pub mod tree_store;
