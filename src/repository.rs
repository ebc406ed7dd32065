//! Persistence of the catalog (`_collections` / `_fields`) over a SQLite pool

pub mod interface;
pub mod sqlite;
