//! Infrastructure layer for Folio.
//!
//! Contains implementations of the repository traits defined in `folio-core`
//! (SQLite storage) and the configuration loader.

pub mod config;
pub mod sqlite;
