//! # doppel-llm: model adapters for doppel
//!
//! Concrete collaborators for [`doppel_core::DigitalTwin`]:
//!   - [`LlmClient`]: text completion over **Ollama** (`/api/generate`) or any
//!     **OpenAI-compatible** API (`/v1/chat/completions`).
//!   - [`HttpEmbedder`]: embeddings from the same backends.
//!   - [`TemplatePromptRenderer`]: prompts rendered from versioned TOML
//!     templates, with compiled-in defaults.
//!
//! Retries live here, not in the core. Every request carries the configured
//! timeout; a client with provider `"none"` fails every call with
//! [`LlmError::Unavailable`], which the twin reports without crashing.
//!
//! ```text
//! DigitalTwin ──render──▶ TemplatePromptRenderer ──▶ prompt text
//!      │
//!      ├──complete──▶ LlmClient ──HTTP──▶ Ollama / OpenAI-compatible
//!      └──embed─────▶ HttpEmbedder ──HTTP──▶ same backend, embedding model
//! ```

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod embedding;
pub mod error;
pub mod prompt;

pub use client::{LlmClient, LlmProvider};
pub use embedding::HttpEmbedder;
pub use error::LlmError;
pub use prompt::{PromptEngine, PromptId, TemplatePromptRenderer};
