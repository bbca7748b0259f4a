//! Storage backends
//!
//! ## Available Implementations
//!
//! - `fs` - one JSON document per session in a directory
//! - `sqlite` - SQLite with optional FTS5 search (requires `sqlite` feature)
//! - `memory` - in-memory storage for testing

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub mod fs;
pub mod memory;
