//! Memory records and the bounded store that owns them.

pub mod affinity;
pub mod record;
pub mod store;

pub use affinity::{AffinityIndex, AffinityRow};
pub use record::{MemoryDraft, MemoryRecord};
pub use store::{InsertOutcome, InsertPlan, MemoryStore, TouchPlan};
