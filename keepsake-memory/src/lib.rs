//! # Keepsake Memory
//!
//! A tiered memory subsystem for coding-assistant sessions.
//!
//! ## Architecture
//!
//! - **Content Store** - items in two tiers: a durable tier of markdown files
//!   meant to be version-controlled, and a disposable ephemeral tier that
//!   lives only in the index (SQLite metadata + LanceDB vectors)
//! - **Extraction Pipeline** - reads the unseen part of a session transcript
//!   after each turn and stores a few summarized observations
//! - **Promotion Engine** - moves ephemeral items that proved important into
//!   the durable tier
//! - **Retrieval Budgeter** - injects relevant items into each prompt under a
//!   fixed character budget
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use keepsake_memory::{Config, MemoryStore, StoreRequest, ContentType, PromotionEngine};
//!
//! let store = Arc::new(MemoryStore::new(Config::load(None)?).await?);
//!
//! let item = store
//!     .store(StoreRequest::new(ContentType::Decision, "Use WAL mode").with_importance(0.9))
//!     .await?;
//!
//! let outcome = PromotionEngine::new(store.clone()).promote(&item.id).await?;
//! println!("written to {}", outcome.path.display());
//! ```

pub mod config;
pub mod embedding;
pub mod error;
pub mod extraction;
pub mod memory;
pub mod promotion;
pub mod retrieval;
pub mod scoring;
pub mod secrets;
pub mod storage;
pub mod transcript;
pub mod watermark;

pub use config::Config;
pub use error::{Error, Result};
pub use extraction::{ExtractionJob, ExtractionPipeline, ExtractionQueue};
pub use memory::{
    ContentItem, ContentType, ListFilter, Lookup, MemoryStore, ProjectContext, Scope,
    SemanticQuery, SortBy, StoreRequest, Tier,
};
pub use promotion::PromotionEngine;
pub use retrieval::RetrievalBudgeter;
pub use scoring::Scorer;
pub use watermark::WatermarkTracker;
