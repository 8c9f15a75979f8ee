//! Text-completion and prompt-rendering collaborators.
//!
//! The core never talks to a model directly. It renders a prompt through a
//! [`PromptRenderer`], hands the string to a [`CompletionProvider`], and parses
//! whatever comes back. Retries and backoff belong to the provider or its
//! caller; the core calls `complete` exactly once per step.

use std::fmt::Write as _;
use std::future::Future;

use crate::config::LlmConfig;
use crate::error::CompletionError;
use crate::memory::MemoryRecord;
use crate::personality::{TraitHistoryEntry, TraitVector};
use crate::reflection::ReflectionContext;
use crate::retrieval::ScoredMemory;

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// Sampling parameters for one completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionParams {
    /// Sampling temperature.
    pub temperature: f32,
    /// Upper bound on generated tokens.
    pub max_tokens: u32,
    /// Stop sequences.
    pub stop: Vec<String>,
}

impl CompletionParams {
    /// Parameters taken from the `[llm]` section.
    #[must_use]
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            stop: Vec::new(),
        }
    }

    /// Same parameters at a different temperature.
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

impl Default for CompletionParams {
    fn default() -> Self {
        Self::from_config(&LlmConfig::default())
    }
}

/// Generate text from a prompt.
pub trait CompletionProvider: Send + Sync {
    /// Complete `prompt`. Implementations may retry internally; the core
    /// does not.
    fn complete(
        &self,
        prompt: &str,
        params: &CompletionParams,
    ) -> impl Future<Output = Result<String, CompletionError>> + Send;

    /// Backend name for logs.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Prompt contexts
// ---------------------------------------------------------------------------

/// Input to the memory-update (interaction analysis) prompt.
#[derive(Debug, Clone, Copy)]
pub struct MemoryUpdateContext<'a> {
    /// Display name of the twin.
    pub twin_name: &'a str,
    /// The interaction transcript being analysed.
    pub interaction: &'a str,
    /// Current trait values.
    pub traits: &'a TraitVector,
    /// Recent knowledge, newest first.
    pub knowledge: &'a [MemoryRecord],
}

/// Input to the reflection prompt.
#[derive(Debug, Clone, Copy)]
pub struct ReflectionPromptContext<'a> {
    /// Display name of the twin.
    pub twin_name: &'a str,
    /// Window, sampled memories and trait history.
    pub reflection: &'a ReflectionContext,
    /// Current trait values.
    pub traits: &'a TraitVector,
}

/// Input to the reply-simulation prompt.
#[derive(Debug, Clone, Copy)]
pub struct ReplyContext<'a> {
    /// Display name of the twin.
    pub twin_name: &'a str,
    /// Incoming message.
    pub message: &'a str,
    /// Current trait values.
    pub traits: &'a TraitVector,
    /// Memories retrieved for the message, best first.
    pub memories: &'a [ScoredMemory],
}

/// Produces complete prompt strings. The core treats the output as opaque.
pub trait PromptRenderer: Send + Sync {
    /// Prompt asking for `PERSONALITY_UPDATES` / `KNOWLEDGE_UPDATES` /
    /// `MEMORY_FORMATION` sections about one interaction.
    fn render_memory_update(&self, ctx: &MemoryUpdateContext<'_>) -> String;

    /// Prompt asking for a synthesis of one reflection window.
    fn render_reflection(&self, ctx: &ReflectionPromptContext<'_>) -> String;

    /// Prompt asking the model to answer as the twin.
    fn render_reply(&self, ctx: &ReplyContext<'_>) -> String;
}

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

/// One `- name: 0.62` line per trait.
#[must_use]
pub fn format_traits(traits: &TraitVector) -> String {
    let mut out = String::new();
    for (name, value) in traits.iter() {
        let _ = writeln!(out, "- {name}: {value:.2}");
    }
    out.trim_end().to_string()
}

/// One bullet per memory, tagged with its type. `"(none)"` when empty.
#[must_use]
pub fn format_memories<'a>(memories: impl IntoIterator<Item = &'a MemoryRecord>) -> String {
    let mut out = String::new();
    for m in memories {
        let _ = writeln!(
            out,
            "- [{}] {} ({})",
            m.memory_type,
            m.content.trim(),
            m.created_at.format("%Y-%m-%d")
        );
    }
    if out.is_empty() {
        return "(none)".to_string();
    }
    out.trim_end().to_string()
}

/// One line per history entry: date, cause, then the values.
#[must_use]
pub fn format_history(history: &[TraitHistoryEntry]) -> String {
    if history.is_empty() {
        return "(no changes)".to_string();
    }
    let mut out = String::new();
    for entry in history {
        let values: Vec<String> = entry
            .snapshot
            .iter()
            .map(|(k, v)| format!("{k}={v:.2}"))
            .collect();
        let _ = writeln!(
            out,
            "- {} [{}] {}",
            entry.timestamp.format("%Y-%m-%d %H:%M"),
            entry.cause,
            values.join(", ")
        );
    }
    out.trim_end().to_string()
}

// ---------------------------------------------------------------------------
// Built-in renderer
// ---------------------------------------------------------------------------

/// Plain renderer with fixed wording. `doppel-llm` ships a template-driven
/// one.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicPromptRenderer;

impl PromptRenderer for BasicPromptRenderer {
    fn render_memory_update(&self, ctx: &MemoryUpdateContext<'_>) -> String {
        format!(
            "Analyze this interaction with {name} and say how it should change \
             their personality, knowledge and memories.\n\n\
             Interaction:\n{interaction}\n\n\
             Current personality:\n{traits}\n\n\
             Current knowledge:\n{knowledge}\n\n\
             Respond using exactly these sections:\n\
             PERSONALITY_UPDATES:\n- <trait>: <delta between -1 and 1> (confidence: <0 to 1>)\n\n\
             KNOWLEDGE_UPDATES:\n- <fact learned>\n\n\
             MEMORY_FORMATION:\n- [<memory type>] <what to remember> (importance: <0 to 1>)",
            name = ctx.twin_name,
            interaction = ctx.interaction.trim(),
            traits = format_traits(ctx.traits),
            knowledge = format_memories(ctx.knowledge),
        )
    }

    fn render_reflection(&self, ctx: &ReflectionPromptContext<'_>) -> String {
        let r = ctx.reflection;
        format!(
            "Reflection period: {from} to {to}\n\n\
             Personality evolution:\n{history}\n\n\
             Current personality:\n{traits}\n\n\
             Key memories ({shown} of {total}):\n{memories}\n\n\
             Analyze this period for {name}:\n\
             1. How has the personality evolved?\n\
             2. What patterns emerge in the interactions?\n\
             3. What core values have been reinforced or changed?\n\
             4. What new knowledge has been acquired?\n\
             5. How has the communication style developed?\n\n\
             Format your response as:\n\
             PERSONALITY_INSIGHTS:\n- ...\n\n\
             INTERACTION_PATTERNS:\n- ...\n\n\
             CORE_VALUES:\n- ...\n\n\
             KNOWLEDGE_GROWTH:\n- ...\n\n\
             COMMUNICATION_EVOLUTION:\n- ...",
            from = r.from.format("%Y-%m-%d"),
            to = r.to.format("%Y-%m-%d"),
            history = format_history(&r.history),
            traits = format_traits(ctx.traits),
            shown = r.memories.len(),
            total = r.memories_in_window,
            memories = format_memories(&r.memories),
            name = ctx.twin_name,
        )
    }

    fn render_reply(&self, ctx: &ReplyContext<'_>) -> String {
        format!(
            "You are {name}. Your personality:\n{traits}\n\n\
             Relevant memories:\n{memories}\n\n\
             Message:\n{message}\n\n\
             Reply as {name} would, in your own voice.",
            name = ctx.twin_name,
            traits = format_traits(ctx.traits),
            memories = format_memories(ctx.memories.iter().map(|m| &m.record)),
            message = ctx.message.trim(),
        )
    }
}
