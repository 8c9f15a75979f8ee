//! Core type definitions shared by every doppel subsystem.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Wall-clock instant used for every timestamp in the system.
pub type Timestamp = DateTime<Utc>;

// ---------------------------------------------------------------------------
// Identity Types
// ---------------------------------------------------------------------------

/// Identifier of one digital-twin instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TwinId(pub Uuid);

impl TwinId {
    /// Create a new random twin ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TwinId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TwinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique, stable identifier for a memory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemoryId(pub Uuid);

impl MemoryId {
    /// Create a new random memory ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MemoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Memory Type
// ---------------------------------------------------------------------------

/// Closed set of memory kinds. The kind selects the decay half-life used at
/// retrieval time, so it is a first-class field rather than a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// Raw, fast-fading events.
    ShortTerm,
    /// Durable facts about the twin's life.
    LongTerm,
    /// Specific remembered episodes.
    Episodic,
    /// Distilled knowledge and conclusions.
    Semantic,
}

impl MemoryType {
    /// All memory types, in declaration order.
    pub const ALL: [Self; 4] = [
        Self::ShortTerm,
        Self::LongTerm,
        Self::Episodic,
        Self::Semantic,
    ];

    /// Stable snake_case name, as stored and as used in config keys.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ShortTerm => "short_term",
            Self::LongTerm => "long_term",
            Self::Episodic => "episodic",
            Self::Semantic => "semantic",
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryType {
    type Err = String;

    /// Lenient parse: case, spaces, dashes and a trailing "memory" are ignored,
    /// so `"Long-Term"`, `"long term memory"` and `"long_term"` all match.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let norm: String = s
            .trim()
            .to_ascii_lowercase()
            .replace(['-', ' '], "_");
        let norm = norm.trim_end_matches("_memory").trim_end_matches("memory");
        match norm.trim_matches('_') {
            "short_term" | "shortterm" | "short" => Ok(Self::ShortTerm),
            "long_term" | "longterm" | "long" => Ok(Self::LongTerm),
            "episodic" | "episode" | "event" => Ok(Self::Episodic),
            "semantic" | "knowledge" | "fact" => Ok(Self::Semantic),
            other => Err(format!("unknown memory type: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Memory Embedding Vector
// ---------------------------------------------------------------------------

/// A dense vector embedding for semantic similarity search.
/// Typically 384 dimensions (all-MiniLM-L6-v2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding(pub Vec<f32>);

impl Embedding {
    /// Cosine similarity between two embeddings.
    /// Returns 0.0 if either vector is zero-length or dimensions differ.
    #[must_use]
    pub fn cosine_similarity(&self, other: &Self) -> f32 {
        if self.0.len() != other.0.len() || self.0.is_empty() {
            return 0.0;
        }
        let (mut dot, mut norm_a, mut norm_b) = (0.0_f32, 0.0_f32, 0.0_f32);
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }
        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom < f32::EPSILON {
            0.0
        } else {
            (dot / denom).clamp(-1.0, 1.0)
        }
    }

    /// Dimensionality of the embedding.
    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.0.len()
    }

    /// Whether every component is finite.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|x| x.is_finite())
    }
}

/// Hours elapsed from `earlier` to `later`, never negative.
#[must_use]
pub fn hours_between(earlier: Timestamp, later: Timestamp) -> f64 {
    let ms = (later - earlier).num_milliseconds().max(0);
    ms as f64 / 3_600_000.0
}
