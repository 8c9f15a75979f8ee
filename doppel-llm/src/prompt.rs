//! Prompt templates for the twin's three model calls.
//!
//! Each prompt is a versioned artifact: compiled-in defaults live here as
//! constants, and a directory of TOML files can override any of them
//! (`prompts/v1/` ships the same text). Placeholders are `{name}`.

use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;
use std::path::Path;
use std::str::FromStr;

use doppel_core::collab::{
    MemoryUpdateContext, PromptRenderer, ReflectionPromptContext, ReplyContext, format_history,
    format_memories, format_traits,
};
use doppel_core::reflection::TraitTrendReport;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::LlmError;

/// Interaction analysis. The answer is parsed by the core's update extractor.
pub const MEMORY_UPDATE: &str = r"You are maintaining the memory and personality model of {twin_name}.
Analyze the interaction below and decide how it should change {twin_name}'s personality, knowledge and memories.

Interaction:
{interaction}

Current personality (0 = low, 1 = high):
{current_personality}

Current knowledge:
{current_knowledge}

Only propose personality changes the interaction actually supports. Small deltas are normal.
Respond using exactly these sections, one bullet per item, and leave a section empty if nothing applies:

PERSONALITY_UPDATES:
- <trait>: <delta between -1 and 1> (confidence: <0 to 1>)

KNOWLEDGE_UPDATES:
- <fact learned about {twin_name} or their world>

MEMORY_FORMATION:
- [<short_term|long_term|episodic|semantic>] <what to remember> (importance: <0 to 1>)";

/// Periodic reflection over one window of memories and trait history.
pub const REFLECTION: &str = r"You are the reflective inner voice of {twin_name}.
Reflection period: {period_start} to {period_end}

Personality evolution during the period:
{trait_history}

Net trait movement:
{trait_trend}

Current personality:
{current_personality}

Key memories ({memory_count} of {memory_total} from the period):
{memories}

Analyze this period:
1. How has the personality evolved?
2. What patterns emerge in the interactions?
3. What core values have been reinforced or changed?
4. What new knowledge has been acquired?
5. How has the communication style developed?

Format your response as:
PERSONALITY_INSIGHTS:
- ...

INTERACTION_PATTERNS:
- ...

CORE_VALUES:
- ...

KNOWLEDGE_GROWTH:
- ...

COMMUNICATION_EVOLUTION:
- ...";

/// Answer a message in the twin's voice.
pub const REPLY_SIMULATION: &str = r"You are {twin_name}. Stay in character and answer in the first person.

Your personality (0 = low, 1 = high):
{current_personality}

Things you remember that may be relevant:
{memories}

RULES:
- Let the personality shape tone and word choice; never list the trait values.
- Use memories only where they fit naturally. If none fit, do not invent any.
- Keep the reply conversational and reasonably short.

Message:
{message}

Reply as {twin_name}:";

/// Replace `{key}` placeholders with values in a single pass.
///
/// Unknown placeholders are left untouched. Substituted values are never
/// re-scanned, so a value containing `{memories}` stays literal.
#[must_use]
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let key = after
            .find('}')
            .map(|close| &after[..close])
            .filter(|k| !k.is_empty() && k.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
        match key.and_then(|k| vars.iter().find(|(name, _)| *name == k).map(|(_, v)| (k, *v))) {
            Some((k, value)) => {
                out.push_str(value);
                rest = &after[k.len() + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// `- openness: 0.50 -> 0.55 (+0.05)` per trait. `"(no changes)"` when empty.
#[must_use]
pub fn format_trend(report: &TraitTrendReport) -> String {
    if report.traits.is_empty() {
        return "(no changes)".to_string();
    }
    let mut out = String::new();
    for (name, trend) in &report.traits {
        let _ = writeln!(
            out,
            "- {name}: {:.2} -> {:.2} ({:+.2})",
            trend.start,
            trend.end,
            trend.change()
        );
    }
    out.trim_end().to_string()
}

// ---------------------------------------------------------------------------
// PromptEngine: versioned TOML template loader
// ---------------------------------------------------------------------------

/// Identifies a prompt template by purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptId {
    /// Interaction analysis.
    MemoryUpdate,
    /// Periodic reflection.
    Reflection,
    /// Reply in the twin's voice.
    ReplySimulation,
}

impl PromptId {
    /// All prompt IDs.
    #[must_use]
    pub fn all() -> &'static [Self] {
        &[Self::MemoryUpdate, Self::Reflection, Self::ReplySimulation]
    }

    /// TOML filename for this prompt.
    #[must_use]
    pub fn filename(self) -> &'static str {
        match self {
            Self::MemoryUpdate => "memory_update.toml",
            Self::Reflection => "reflection.toml",
            Self::ReplySimulation => "reply_simulation.toml",
        }
    }

    /// Compiled-in template text.
    #[must_use]
    pub fn builtin(self) -> &'static str {
        match self {
            Self::MemoryUpdate => MEMORY_UPDATE,
            Self::Reflection => REFLECTION,
            Self::ReplySimulation => REPLY_SIMULATION,
        }
    }

    /// Placeholders an override must keep.
    #[must_use]
    pub fn required_vars(self) -> &'static [&'static str] {
        match self {
            Self::MemoryUpdate => &["interaction", "current_personality"],
            Self::Reflection => &["period_start", "period_end", "memories"],
            Self::ReplySimulation => &["message", "current_personality"],
        }
    }
}

impl fmt::Display for PromptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MemoryUpdate => "memory_update",
            Self::Reflection => "reflection",
            Self::ReplySimulation => "reply_simulation",
        };
        write!(f, "{name}")
    }
}

impl FromStr for PromptId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory_update" => Ok(Self::MemoryUpdate),
            "reflection" => Ok(Self::Reflection),
            "reply_simulation" => Ok(Self::ReplySimulation),
            _ => Err(format!("unknown prompt id: '{s}'")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TomlPromptFile {
    prompt: TomlPromptData,
}

#[derive(Debug, Clone, Deserialize)]
struct TomlPromptData {
    version: String,
    #[serde(default)]
    description: String,
    template: String,
}

/// A loaded, ready-to-render prompt template.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplate {
    /// Version string (`"builtin"` for compiled-in text).
    pub version: String,
    /// Free-form note from the TOML file.
    pub description: String,
    /// Template text with `{key}` placeholders.
    pub template: String,
}

/// Holds one template per [`PromptId`].
#[derive(Debug, Clone)]
pub struct PromptEngine {
    templates: HashMap<PromptId, PromptTemplate>,
}

impl PromptEngine {
    /// Engine with the compiled-in templates only.
    #[must_use]
    pub fn builtin() -> Self {
        let templates = PromptId::all()
            .iter()
            .map(|id| {
                (*id, PromptTemplate {
                    version: "builtin".into(),
                    description: String::new(),
                    template: id.builtin().into(),
                })
            })
            .collect();
        Self { templates }
    }

    /// Built-in templates overridden by whichever TOML files `dir` holds.
    ///
    /// Files are matched by [`PromptId::filename`]; others are ignored.
    ///
    /// # Errors
    ///
    /// [`LlmError::ConfigError`] if `dir` is not a directory, a file cannot
    /// be read or parsed, or an override drops a required placeholder.
    pub fn from_directory(dir: impl AsRef<Path>) -> Result<Self, LlmError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(LlmError::ConfigError(format!(
                "prompt directory not found: {}",
                dir.display()
            )));
        }

        let mut engine = Self::builtin();
        for id in PromptId::all() {
            let path = dir.join(id.filename());
            if !path.exists() {
                debug!(prompt = %id, "no override, using built-in template");
                continue;
            }
            let content = std::fs::read_to_string(&path)
                .map_err(|e| LlmError::ConfigError(format!("failed to read {}: {e}", path.display())))?;
            let parsed: TomlPromptFile = toml::from_str(&content)
                .map_err(|e| LlmError::ConfigError(format!("failed to parse {}: {e}", path.display())))?;

            let data = parsed.prompt;
            if let Some(missing) = id
                .required_vars()
                .iter()
                .find(|var| !data.template.contains(&format!("{{{var}}}")))
            {
                return Err(LlmError::ConfigError(format!(
                    "{} is missing the {{{missing}}} placeholder",
                    path.display()
                )));
            }
            engine.templates.insert(*id, PromptTemplate {
                version: data.version,
                description: data.description,
                template: data.template,
            });
        }

        info!(dir = %dir.display(), "prompt templates loaded");
        Ok(engine)
    }

    /// Loaded template for `id`.
    #[must_use]
    pub fn get(&self, id: PromptId) -> Option<&PromptTemplate> {
        self.templates.get(&id)
    }

    /// Render `id`, falling back to the compiled-in text if it is missing.
    #[must_use]
    pub fn render(&self, id: PromptId, vars: &[(&str, &str)]) -> String {
        let template = self.get(id).map_or(id.builtin(), |t| t.template.as_str());
        render_template(template, vars)
    }

    /// Number of loaded templates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Whether no templates are loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::builtin()
    }
}

// ---------------------------------------------------------------------------
// Renderer
// ---------------------------------------------------------------------------

/// [`PromptRenderer`] backed by a [`PromptEngine`] that can be swapped at
/// runtime.
#[derive(Debug, Default)]
pub struct TemplatePromptRenderer {
    engine: RwLock<PromptEngine>,
}

impl TemplatePromptRenderer {
    /// Renderer over `engine`.
    #[must_use]
    pub fn new(engine: PromptEngine) -> Self {
        Self {
            engine: RwLock::new(engine),
        }
    }

    /// Renderer over the compiled-in templates.
    #[must_use]
    pub fn builtin() -> Self {
        Self::new(PromptEngine::builtin())
    }

    /// Renderer over a template directory.
    ///
    /// # Errors
    ///
    /// See [`PromptEngine::from_directory`].
    pub fn from_directory(dir: impl AsRef<Path>) -> Result<Self, LlmError> {
        Ok(Self::new(PromptEngine::from_directory(dir)?))
    }

    /// Reload templates from `dir`. On failure the current templates stay.
    ///
    /// # Errors
    ///
    /// See [`PromptEngine::from_directory`].
    pub fn reload(&self, dir: impl AsRef<Path>) -> Result<(), LlmError> {
        match PromptEngine::from_directory(dir) {
            Ok(engine) => {
                *self.engine.write() = engine;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "prompt reload failed, keeping current templates");
                Err(e)
            }
        }
    }

    /// Version of the template currently used for `id`.
    #[must_use]
    pub fn version(&self, id: PromptId) -> String {
        self.engine
            .read()
            .get(id)
            .map_or_else(|| "builtin".to_string(), |t| t.version.clone())
    }
}

impl PromptRenderer for TemplatePromptRenderer {
    fn render_memory_update(&self, ctx: &MemoryUpdateContext<'_>) -> String {
        let personality = format_traits(ctx.traits);
        let knowledge = format_memories(ctx.knowledge);
        self.engine.read().render(PromptId::MemoryUpdate, &[
            ("twin_name", ctx.twin_name),
            ("interaction", ctx.interaction.trim()),
            ("current_personality", personality.as_str()),
            ("current_knowledge", knowledge.as_str()),
        ])
    }

    fn render_reflection(&self, ctx: &ReflectionPromptContext<'_>) -> String {
        let r = ctx.reflection;
        let start = r.from.format("%Y-%m-%d").to_string();
        let end = r.to.format("%Y-%m-%d").to_string();
        let history = format_history(&r.history);
        let trend = format_trend(&r.trend);
        let personality = format_traits(ctx.traits);
        let count = r.memories.len().to_string();
        let total = r.memories_in_window.to_string();
        let memories = format_memories(&r.memories);
        self.engine.read().render(PromptId::Reflection, &[
            ("twin_name", ctx.twin_name),
            ("period_start", start.as_str()),
            ("period_end", end.as_str()),
            ("trait_history", history.as_str()),
            ("trait_trend", trend.as_str()),
            ("current_personality", personality.as_str()),
            ("memory_count", count.as_str()),
            ("memory_total", total.as_str()),
            ("memories", memories.as_str()),
        ])
    }

    fn render_reply(&self, ctx: &ReplyContext<'_>) -> String {
        let personality = format_traits(ctx.traits);
        let memories = format_memories(ctx.memories.iter().map(|m| &m.record));
        self.engine.read().render(PromptId::ReplySimulation, &[
            ("twin_name", ctx.twin_name),
            ("current_personality", personality.as_str()),
            ("memories", memories.as_str()),
            ("message", ctx.message.trim()),
        ])
    }
}
