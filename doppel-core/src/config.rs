//! Configuration for a digital-twin instance.
//!
//! Maps directly to `doppel.toml`. Every field has a serde default, so an
//! empty file is a valid configuration; [`TwinConfig::validate`] rejects
//! settings that would break an invariant.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TwinError};
use crate::types::MemoryType;

/// Upper bound on the trait-bias retrieval boost (+15%).
pub const TRAIT_BOOST_CEILING: f32 = 0.15;

/// Longest reflection period or history retention accepted, in days.
/// Keeps every `now ± days` computation inside chrono's representable range.
pub const MAX_PERIOD_DAYS: u32 = 36_500;

/// Top-level configuration, loadable from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TwinConfig {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,
    /// Memory store capacity and eviction.
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Relevance ranking.
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// Trait set and evolution bounds.
    #[serde(default)]
    pub personality: PersonalityConfig,
    /// Analysis-output extraction and memory admission.
    #[serde(default)]
    pub extraction: ExtractionConfig,
    /// Periodic reflection.
    #[serde(default)]
    pub reflection: ReflectionConfig,
    /// LLM / embedding backend settings (consumed by adapters).
    #[serde(default)]
    pub llm: LlmConfig,
    /// Persistence settings.
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl TwinConfig {
    /// Load configuration from a TOML string and validate it.
    ///
    /// # Errors
    /// Returns `TwinError::Config` if the TOML is invalid or fails validation.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str).map_err(|e| TwinError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Check cross-field invariants.
    ///
    /// # Errors
    /// Returns `TwinError::Config` describing the first violated rule.
    pub fn validate(&self) -> Result<()> {
        let err = |msg: String| Err(TwinError::Config(msg));

        if self.memory.max_memories == 0 {
            return err("memory.max_memories must be at least 1".into());
        }
        if self.memory.embedding_dimensions == 0 {
            return err("memory.embedding_dimensions must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.memory.default_importance)
            || !(0.0..=1.0).contains(&self.memory.raw_event_importance)
        {
            return err("memory importances must lie in [0, 1]".into());
        }
        if !positive(self.memory.eviction_half_life_hours) {
            return err("memory.eviction_half_life_hours must be positive".into());
        }

        if self.personality.traits.is_empty() {
            return err("personality.traits must name at least one trait".into());
        }
        let mut seen = HashSet::new();
        for name in &self.personality.traits {
            if name.trim().is_empty() {
                return err("personality.traits contains an empty name".into());
            }
            if !seen.insert(name.as_str()) {
                return err(format!("personality.traits lists '{name}' twice"));
            }
        }
        for (name, value) in &self.personality.initial {
            if !seen.contains(name.as_str()) {
                return err(format!("personality.initial names unknown trait '{name}'"));
            }
            if !(0.0..=1.0).contains(value) {
                return err(format!("personality.initial.{name} = {value} outside [0, 1]"));
            }
        }
        if !positive(self.personality.max_step) || self.personality.max_step > 1.0 {
            return err("personality.max_step must lie in (0, 1]".into());
        }
        if !non_negative(self.personality.learning_rate) {
            return err("personality.learning_rate must be finite and not negative".into());
        }
        if self.personality.history_retention_days > MAX_PERIOD_DAYS {
            return err(format!(
                "personality.history_retention_days must not exceed {MAX_PERIOD_DAYS}"
            ));
        }
        if !(0.0..1.0).contains(&self.personality.momentum) {
            return err("personality.momentum must lie in [0, 1)".into());
        }

        if !(0.0..=1.0).contains(&self.extraction.default_confidence) {
            return err("extraction.default_confidence must lie in [0, 1]".into());
        }
        if !(0.0..=1.0).contains(&self.extraction.min_admission_importance) {
            return err("extraction.min_admission_importance must lie in [0, 1]".into());
        }
        if !(0.0..=1.0).contains(&self.extraction.duplicate_similarity) {
            return err("extraction.duplicate_similarity must lie in [0, 1]".into());
        }

        if !self.retrieval.min_relevance.is_finite() {
            return err("retrieval.min_relevance must be finite".into());
        }
        if !non_negative(self.retrieval.importance_weight) {
            return err("retrieval.importance_weight must be finite and not negative".into());
        }
        if !non_negative(self.retrieval.trait_bias_weight) {
            return err("retrieval.trait_bias_weight must be finite and not negative".into());
        }
        if !(0.0..=TRAIT_BOOST_CEILING).contains(&self.retrieval.max_trait_boost) {
            return err(format!(
                "retrieval.max_trait_boost must lie in [0, {TRAIT_BOOST_CEILING}]"
            ));
        }
        for (t, h) in self.retrieval.half_lives() {
            if let Some(h) = h {
                if !positive(h) {
                    return err(format!("retrieval half-life for {t} must be positive"));
                }
            }
        }

        if self.reflection.period_days == 0 || self.reflection.period_days > MAX_PERIOD_DAYS {
            return err(format!("reflection.period_days must lie in [1, {MAX_PERIOD_DAYS}]"));
        }
        if !(0.0..=1.0).contains(&self.reflection.importance) {
            return err("reflection.importance must lie in [0, 1]".into());
        }
        Ok(())
    }
}

// NaN fails every comparison, so these are written to reject it.
fn positive<T: Into<f64>>(x: T) -> bool {
    let x = x.into();
    x.is_finite() && x > 0.0
}

fn non_negative<T: Into<f64>>(x: T) -> bool {
    let x = x.into();
    x.is_finite() && x >= 0.0
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Display name of the twin.
    #[serde(default = "default_name")]
    pub name: String,
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format: "text" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Memory store capacity and eviction behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Hard ceiling on stored records.
    #[serde(default = "default_1000")]
    pub max_memories: usize,
    /// Fixed embedding dimensionality for the store.
    #[serde(default = "default_384")]
    pub embedding_dimensions: usize,
    /// Importance assigned when a draft does not carry one.
    #[serde(default = "default_0_5")]
    pub default_importance: f32,
    /// Records retrieved within this many minutes are protected from eviction.
    #[serde(default = "default_30_u64")]
    pub protection_window_minutes: u64,
    /// Half-life of the recency term in the eviction score.
    #[serde(default = "default_168")]
    pub eviction_half_life_hours: f64,
    /// Importance of the raw interaction event written for every interaction.
    #[serde(default = "default_0_7")]
    pub raw_event_importance: f32,
    /// Memory type of the raw interaction event.
    #[serde(default = "default_short_term")]
    pub raw_event_type: MemoryType,
    /// Maximum characters per chunk when importing documents.
    #[serde(default = "default_1000")]
    pub import_chunk_chars: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_memories: 1000,
            embedding_dimensions: 384,
            default_importance: 0.5,
            protection_window_minutes: 30,
            eviction_half_life_hours: 168.0,
            raw_event_importance: 0.7,
            raw_event_type: MemoryType::ShortTerm,
            import_chunk_chars: 1000,
        }
    }
}

/// Relevance ranking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Default number of memories returned per query.
    #[serde(default = "default_5_usize")]
    pub top_k: usize,
    /// Default minimum final score.
    #[serde(default)]
    pub min_relevance: f64,
    /// Multiplier applied to importance in `(1 + importance * weight)`.
    #[serde(default = "default_0_5")]
    pub importance_weight: f32,
    /// Per-type recency half-lives.
    #[serde(default)]
    pub half_life_hours: HalfLives,
    /// Whether current trait values bias retrieval.
    #[serde(default = "default_true")]
    pub trait_bias_enabled: bool,
    /// Scale of the trait-bias boost before capping.
    #[serde(default = "default_0_15")]
    pub trait_bias_weight: f32,
    /// Cap on the trait-bias boost (never above +15%).
    #[serde(default = "default_0_15")]
    pub max_trait_boost: f32,
    /// Number of query embeddings kept in the LRU cache.
    #[serde(default = "default_256")]
    pub query_cache_size: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_relevance: 0.0,
            importance_weight: 0.5,
            half_life_hours: HalfLives::default(),
            trait_bias_enabled: true,
            trait_bias_weight: 0.15,
            max_trait_boost: 0.15,
            query_cache_size: 256,
        }
    }
}

impl RetrievalConfig {
    /// Half-life in hours for a memory type; `None` means undecaying.
    #[must_use]
    pub fn half_life(&self, memory_type: MemoryType) -> Option<f64> {
        match memory_type {
            MemoryType::ShortTerm => self.half_life_hours.short_term,
            MemoryType::LongTerm => self.half_life_hours.long_term,
            MemoryType::Episodic => self.half_life_hours.episodic,
            MemoryType::Semantic => self.half_life_hours.semantic,
        }
    }

    fn half_lives(&self) -> impl Iterator<Item = (MemoryType, Option<f64>)> + '_ {
        MemoryType::ALL.into_iter().map(|t| (t, self.half_life(t)))
    }
}

/// Recency half-lives per memory type. An absent value disables decay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HalfLives {
    /// Short-term half-life (hours).
    #[serde(default = "default_short_term_half_life")]
    pub short_term: Option<f64>,
    /// Episodic half-life (hours).
    #[serde(default = "default_episodic_half_life")]
    pub episodic: Option<f64>,
    /// Long-term half-life (hours).
    #[serde(default = "default_long_term_half_life")]
    pub long_term: Option<f64>,
    /// Semantic half-life (hours).
    #[serde(default)]
    pub semantic: Option<f64>,
}

impl Default for HalfLives {
    fn default() -> Self {
        Self {
            short_term: default_short_term_half_life(),
            episodic: default_episodic_half_life(),
            long_term: default_long_term_half_life(),
            semantic: None,
        }
    }
}

/// Trait set and evolution bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonalityConfig {
    /// Closed, ordered set of trait names.
    #[serde(default = "default_traits")]
    pub traits: Vec<String>,
    /// Initial values; missing traits start at 0.5.
    #[serde(default)]
    pub initial: BTreeMap<String, f32>,
    /// Scale applied to `delta * confidence`.
    #[serde(default = "default_0_5")]
    pub learning_rate: f32,
    /// Largest change a single proposal may cause per trait.
    #[serde(default = "default_0_05")]
    pub max_step: f32,
    /// Fraction of the previous change carried into the next one.
    #[serde(default)]
    pub momentum: f32,
    /// History entries older than this are pruned (latest is always kept).
    #[serde(default = "default_365")]
    pub history_retention_days: u32,
}

impl Default for PersonalityConfig {
    fn default() -> Self {
        Self {
            traits: default_traits(),
            initial: BTreeMap::new(),
            learning_rate: 0.5,
            max_step: 0.05,
            momentum: 0.0,
            history_retention_days: 365,
        }
    }
}

/// Update-extractor and admission settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Confidence assumed when a delta line omits one.
    #[serde(default = "default_0_5")]
    pub default_confidence: f32,
    /// Maximum candidate memories taken from one analysis.
    #[serde(default = "default_16")]
    pub max_candidates: usize,
    /// Deadline for the analysis completion call.
    #[serde(default = "default_30000")]
    pub analysis_timeout_ms: u64,
    /// Candidates below this importance are not admitted.
    #[serde(default)]
    pub min_admission_importance: f32,
    /// Candidates at least this similar to a stored record are duplicates.
    #[serde(default = "default_0_97")]
    pub duplicate_similarity: f32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            default_confidence: 0.5,
            max_candidates: 16,
            analysis_timeout_ms: 30_000,
            min_admission_importance: 0.0,
            duplicate_similarity: 0.97,
        }
    }
}

/// Periodic reflection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionConfig {
    /// Reflection period length in days.
    #[serde(default = "default_7")]
    pub period_days: u32,
    /// Maximum memories sampled into one reflection.
    #[serde(default = "default_50")]
    pub sample_size: usize,
    /// Importance of the admitted reflection memory.
    #[serde(default = "default_0_9")]
    pub importance: f32,
    /// Seed for memory sampling; random when absent.
    #[serde(default)]
    pub sample_seed: Option<u64>,
    /// Deadline for the reflection completion call.
    #[serde(default = "default_60000")]
    pub timeout_ms: u64,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            period_days: 7,
            sample_size: 50,
            importance: 0.9,
            sample_seed: None,
            timeout_ms: 60_000,
        }
    }
}

/// LLM and embedding backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider: "ollama", "openai", "none".
    #[serde(default = "default_ollama")]
    pub provider: String,
    /// Base URL for the API.
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
    /// Completion model.
    #[serde(default = "default_model")]
    pub model: String,
    /// Embedding model.
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    /// Environment variable holding the API key, if any.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Sampling temperature.
    #[serde(default = "default_0_7")]
    pub temperature: f32,
    /// Maximum tokens per completion.
    #[serde(default = "default_1000_u32")]
    pub max_tokens: u32,
    /// Hard timeout for any HTTP call in milliseconds.
    #[serde(default = "default_30000")]
    pub request_timeout_ms: u64,
    /// Retries performed by the HTTP adapter (never by the core).
    #[serde(default)]
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_ollama(),
            base_url: default_ollama_url(),
            model: default_model(),
            embedding_model: default_embedding_model(),
            api_key_env: None,
            temperature: 0.7,
            max_tokens: 1000,
            request_timeout_ms: 30_000,
            max_retries: 0,
        }
    }
}

/// Persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Whether the twin writes through to SQLite.
    #[serde(default)]
    pub enabled: bool,
    /// Database file path.
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Use WAL mode for concurrent reads.
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_db_path(),
            wal_mode: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Serde default helpers
// ---------------------------------------------------------------------------

fn default_true() -> bool { true }
fn default_name() -> String { "Digital Twin".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "text".to_string() }
fn default_ollama() -> String { "ollama".to_string() }
fn default_ollama_url() -> String { "http://localhost:11434".to_string() }
fn default_model() -> String { "llama3.1:8b".to_string() }
fn default_embedding_model() -> String { "all-minilm".to_string() }
fn default_db_path() -> String { "doppel.db".to_string() }
fn default_short_term() -> MemoryType { MemoryType::ShortTerm }
fn default_traits() -> Vec<String> {
    ["openness", "conscientiousness", "extraversion", "agreeableness", "neuroticism"]
        .into_iter()
        .map(String::from)
        .collect()
}
#[allow(clippy::unnecessary_wraps)]
fn default_short_term_half_life() -> Option<f64> { Some(6.0) }
#[allow(clippy::unnecessary_wraps)]
fn default_episodic_half_life() -> Option<f64> { Some(72.0) }
#[allow(clippy::unnecessary_wraps)]
fn default_long_term_half_life() -> Option<f64> { Some(2016.0) }
fn default_0_05() -> f32 { 0.05 }
fn default_0_15() -> f32 { 0.15 }
fn default_0_5() -> f32 { 0.5 }
fn default_0_7() -> f32 { 0.7 }
fn default_0_9() -> f32 { 0.9 }
fn default_0_97() -> f32 { 0.97 }
fn default_168() -> f64 { 168.0 }
fn default_5_usize() -> usize { 5 }
fn default_7() -> u32 { 7 }
fn default_16() -> usize { 16 }
fn default_30_u64() -> u64 { 30 }
fn default_50() -> usize { 50 }
fn default_256() -> usize { 256 }
fn default_365() -> u32 { 365 }
fn default_384() -> usize { 384 }
fn default_1000() -> usize { 1000 }
fn default_1000_u32() -> u32 { 1000 }
fn default_30000() -> u64 { 30_000 }
fn default_60000() -> u64 { 60_000 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_is_valid_default() {
        let config = TwinConfig::from_toml("").expect("empty config");
        assert_eq!(config.memory.max_memories, 1000);
        assert_eq!(config.personality.traits.len(), 5);
        assert!((config.personality.max_step - 0.05).abs() < f32::EPSILON);
        assert_eq!(config.retrieval.half_life(MemoryType::Semantic), None);
        assert_eq!(config.retrieval.half_life(MemoryType::ShortTerm), Some(6.0));
    }

    #[test]
    fn overrides_parse() {
        let config = TwinConfig::from_toml(
            r#"
            [memory]
            max_memories = 3
            raw_event_type = "episodic"

            [personality]
            traits = ["openness", "curiosity"]
            initial = { openness = 0.7 }
            learning_rate = 1.0

            [retrieval.half_life_hours]
            short_term = 1.0
            "#,
        )
        .expect("parse");
        assert_eq!(config.memory.max_memories, 3);
        assert_eq!(config.memory.raw_event_type, MemoryType::Episodic);
        assert_eq!(config.personality.traits, vec!["openness", "curiosity"]);
        assert_eq!(config.retrieval.half_life(MemoryType::ShortTerm), Some(1.0));
        assert_eq!(config.retrieval.half_life(MemoryType::Episodic), Some(72.0));
    }

    #[test]
    fn zero_capacity_rejected() {
        let err = TwinConfig::from_toml("[memory]\nmax_memories = 0").expect_err("invalid");
        assert!(matches!(err, TwinError::Config(_)));
    }

    #[test]
    fn duplicate_traits_rejected() {
        let err = TwinConfig::from_toml("[personality]\ntraits = [\"a\", \"a\"]").expect_err("invalid");
        assert!(err.to_string().contains("twice"));
    }

    #[test]
    fn initial_for_unknown_trait_rejected() {
        let toml = "[personality]\ntraits = [\"openness\"]\ninitial = { curiosity = 0.5 }";
        assert!(TwinConfig::from_toml(toml).is_err());
    }

    #[test]
    fn nan_floats_rejected() {
        for toml in [
            "[personality]\nmax_step = nan",
            "[personality]\nlearning_rate = nan",
            "[memory]\neviction_half_life_hours = nan",
            "[retrieval]\nimportance_weight = nan",
            "[retrieval]\ntrait_bias_weight = nan",
            "[retrieval]\nmax_trait_boost = nan",
            "[retrieval]\nmin_relevance = nan",
            "[retrieval.half_life_hours]\nepisodic = nan",
            "[extraction]\nduplicate_similarity = nan",
        ] {
            let err = TwinConfig::from_toml(toml).expect_err(toml);
            assert!(matches!(err, TwinError::Config(_)), "{toml}");
        }
    }

    #[test]
    fn infinite_weights_rejected() {
        assert!(TwinConfig::from_toml("[retrieval]\ntrait_bias_weight = inf").is_err());
        assert!(TwinConfig::from_toml("[memory]\neviction_half_life_hours = inf").is_err());
        assert!(TwinConfig::from_toml("[personality]\nlearning_rate = inf").is_err());
    }

    #[test]
    fn oversized_day_counts_rejected() {
        assert!(TwinConfig::from_toml("[reflection]\nperiod_days = 4000000000").is_err());
        assert!(
            TwinConfig::from_toml("[personality]\nhistory_retention_days = 4000000000").is_err()
        );
        assert!(TwinConfig::from_toml(&format!("[reflection]\nperiod_days = {MAX_PERIOD_DAYS}")).is_ok());
    }

    #[test]
    fn trait_boost_cannot_exceed_ceiling() {
        assert!(TwinConfig::from_toml("[retrieval]\nmax_trait_boost = 0.5").is_err());
    }
}
