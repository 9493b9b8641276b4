//! Infrastructure layer for dagflow.
//!
//! Contains implementations of the ports defined in `dagflow-core`: SQLite
//! repositories and the SQLite lease lock, the HTTP node handler, and the
//! TOML configuration loader.

pub mod config;
pub mod sqlite;
pub mod workflow;
