//! Storage backends for keepsake-memory

mod durable;
mod sqlite;
pub mod vector;

pub use durable::{heading, render, truncate_chars, DurableStorage};
pub use sqlite::SqliteStorage;
pub use vector::{VectorHit, VectorStorage};
