pub mod catalog;
pub mod config;
pub mod data_types;
pub mod engine;
pub mod error;
pub mod identifier;
pub mod query;
pub mod records;
pub mod repository;
pub mod schema;
pub mod sql_value;
pub mod validation;

pub use engine::Engine;
pub use error::{Error, Result};

#[cfg(test)]
pub(crate) mod testutils;
