//! Data layer module
//!
//! Handles all persistence behind the [`Adapter`] contract:
//! - Users, linked accounts, sessions and verification tokens
//! - SQLite adapter (durable)
//! - Memory adapter (volatile)

mod adapter;
mod database;
mod memory;
mod models;

pub use adapter::{Adapter, AdapterResult, BoundedAdapter, UnimplementedAdapter, bounded};
pub use database::SqliteAdapter;
pub use memory::MemoryAdapter;
pub use models::*;

#[cfg(test)]
mod database_test;
