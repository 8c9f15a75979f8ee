//! # doppel core library
//!
//! A persistent behavioral model of one person: a bounded, searchable
//! memory and a personality vector that evolves slowly from interactions.
//!
//! A [`DigitalTwin`] handle owns everything for one twin:
//!
//! - **Memory store**: records with a fixed-size embedding, a type
//!   (short-term, long-term, episodic, semantic) and an importance. At
//!   capacity the least valuable record is evicted; recently retrieved
//!   records are protected.
//! - **Relevance ranker**: cosine similarity × importance × a per-type
//!   recency half-life, with a small bounded trait bias.
//! - **Trait state**: the current trait vector and its append-only history.
//! - **Evolution controller**: turns proposals into bounded, atomic trait
//!   updates and decides which candidate memories are stored.
//! - **Update extractor**: a permissive decoder for model-written analysis.
//! - **Reflection scheduler**: once per period, distils the window into a
//!   single high-importance semantic memory.
//!
//! Embedding, completion and prompt rendering are collaborators behind
//! traits ([`EmbeddingProvider`], [`CompletionProvider`],
//! [`PromptRenderer`]); HTTP adapters live in `doppel-llm`.
//!
//! ## Quick start
//!
//! ```no_run
//! use chrono::Utc;
//! use doppel_core::{BasicPromptRenderer, DigitalTwin, HashingEmbeddingProvider, TwinConfig};
//! # use doppel_core::{CompletionParams, CompletionProvider};
//! # use doppel_core::error::CompletionError;
//! # struct Echo;
//! # impl CompletionProvider for Echo {
//! #     async fn complete(&self, p: &str, _: &CompletionParams) -> Result<String, CompletionError> { Ok(p.into()) }
//! #     fn name(&self) -> &str { "echo" }
//! # }
//! # async fn run() -> doppel_core::error::Result<()> {
//! let twin = DigitalTwin::new(
//!     TwinConfig::default(),
//!     HashingEmbeddingProvider::default(),
//!     Echo,
//!     BasicPromptRenderer,
//!     Utc::now(),
//! )?;
//! let outcome = twin.interact("I finally ran my first marathon!", None, Utc::now()).await?;
//! println!("stored {}", outcome.raw_memory.content);
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod collab;
pub mod config;
pub mod decay;
pub mod embedding;
pub mod error;
pub mod eviction;
pub mod evolution;
pub mod extract;
pub mod logging;
pub mod memory;
pub mod persistence;
pub mod personality;
pub mod reflection;
pub mod retrieval;
pub mod twin;
pub mod types;

pub use collab::{BasicPromptRenderer, CompletionParams, CompletionProvider, PromptRenderer};
pub use config::TwinConfig;
pub use embedding::{CachedEmbedder, EmbeddingProvider, HashingEmbeddingProvider};
pub use error::{Result, TwinError};
pub use evolution::{EvolutionController, EvolutionProposal, TraitDelta};
pub use extract::UpdateExtractor;
pub use memory::{MemoryDraft, MemoryRecord, MemoryStore};
pub use personality::{TraitHistoryEntry, TraitState, TraitVector};
pub use reflection::{ReflectionOutcome, ReflectionScheduler};
pub use retrieval::{MemoryQuery, RelevanceRanker, ScoredMemory};
pub use twin::{DigitalTwin, InteractionOutcome, ReplyOutcome, TraitUpdate};
pub use types::*;
