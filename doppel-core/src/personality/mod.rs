//! Personality: the trait vector and its history log.
//!
//! [`TraitState`] is the only owner of the current [`TraitVector`]. Changes
//! arrive as validated plans from the
//! [`EvolutionController`](crate::evolution::EvolutionController).

pub mod state;
pub mod traits;

pub use state::{TraitHistoryEntry, TraitState};
pub use traits::TraitVector;
