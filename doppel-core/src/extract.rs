//! Update extractor: a permissive decoder for free-text analysis output.
//!
//! The analysis is produced by a language model and follows the section
//! markers below only loosely:
//!
//! ```text
//! PERSONALITY_UPDATES:
//! - openness: +0.2 (confidence: 0.8)
//! - extraversion -0.1, confidence 70%
//!
//! KNOWLEDGE_UPDATES:
//! - Enjoys hiking in the Alps
//!
//! MEMORY_FORMATION:
//! - [episodic] Went hiking last Saturday (importance: 0.8)
//! ```
//!
//! Headers may carry markdown decoration (`## Personality Updates:`),
//! items may use `-`, `*`, `•` or `1.` bullets, and anything that does not
//! parse is skipped. Extraction never fails: the worst case is an empty
//! proposal. Trait names are *not* checked here; that is the controller's
//! job, and an unknown name rejects the whole proposal there.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::debug;

use crate::config::ExtractionConfig;
use crate::evolution::{EvolutionProposal, TraitDelta};
use crate::memory::MemoryDraft;
use crate::types::MemoryType;

/// Section holding trait deltas.
pub const PERSONALITY_UPDATES: &str = "personality_updates";
/// Section holding semantic facts.
pub const KNOWLEDGE_UPDATES: &str = "knowledge_updates";
/// Section holding episodic memories.
pub const MEMORY_FORMATION: &str = "memory_formation";

/// Sections a reflection is asked to produce.
pub const REFLECTION_SECTIONS: [&str; 5] = [
    "personality_insights",
    "interaction_patterns",
    "core_values",
    "knowledge_growth",
    "communication_evolution",
];

/// Metadata `source` value of extracted memories.
pub const ANALYSIS_SOURCE: &str = "interaction_analysis";

// `name: +0.2`, `name = -5%`, `name +0.1`, `name increased by 0.1`
static DELTA_LINE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?P<name>[a-z][a-z _\-]*?)\s*(?:[:=]|\b(?:increase[sd]?|decrease[sd]?|up|down)\b(?:\s+by)?)?\s*(?P<delta>[+\-−]?\s*\d*\.?\d+)\s*(?P<pct>%)?",
    )
    .ok()
});

static DIRECTION_DOWN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:decrease[sd]?|down)\b").ok());

static CONFIDENCE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)\bconf(?:idence)?\b\s*[:=]?\s*(?P<value>\d*\.?\d+)\s*(?P<pct>%)?").ok()
});

static IMPORTANCE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)[(\[,;]?\s*\bimportance\b\s*[:=]?\s*(?P<value>\d*\.?\d+)\s*(?P<pct>%)?\s*[)\]]?").ok()
});

static TYPE_TAG: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\s*[\[(](?P<tag>[a-zA-Z _\-]+)[\])]\s*[:\-]?\s*").ok());

static BULLET: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(?:[-*•+]|\d+[.)])\s+").ok());

fn captures<'t>(re: &LazyLock<Option<Regex>>, text: &'t str) -> Option<Captures<'t>> {
    re.as_ref()?.captures(text)
}

// ---------------------------------------------------------------------------
// Section decoding
// ---------------------------------------------------------------------------

/// Split text into named sections of items.
///
/// Keys are normalised (`"## Core Values:"` → `"core_values"`). Lines before
/// the first header are ignored. Placeholder items such as `none` are dropped.
///
/// Inside a known section, a plain `Openness:` line is a sub-label rather
/// than a new section; only known names, `#` headers and all-caps headers
/// switch. Under PERSONALITY_UPDATES the label names the trait for bare
/// items that follow it (`- +0.1` becomes `openness: +0.1`).
#[must_use]
pub fn parse_sections(text: &str) -> BTreeMap<String, Vec<String>> {
    let mut sections: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut current: Option<String> = None;
    let mut label: Option<String> = None;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        let item = if let Some(m) = BULLET.as_ref().and_then(|re| re.find(line)) {
            Some(line[m.end()..].trim())
        } else if let Some((name, rest)) = header(line) {
            let in_known = current.as_deref().is_some_and(is_known_section);
            if in_known && rest.is_empty() && !is_known_section(&name) && !is_section_marker(line) {
                label = Some(name.replace('_', " "));
                continue;
            }
            sections.entry(name.clone()).or_default();
            current = Some(name);
            label = None;
            (!rest.is_empty()).then_some(rest)
        } else {
            Some(line)
        };

        if let (Some(section), Some(item)) = (&current, item) {
            if !is_placeholder(item) {
                let item = match &label {
                    Some(label) if section == PERSONALITY_UPDATES && !item.starts_with(char::is_alphabetic) => {
                        format!("{label}: {item}")
                    }
                    _ => item.to_string(),
                };
                sections.entry(section.clone()).or_default().push(item);
            }
        }
    }
    sections
}

fn is_section_marker(line: &str) -> bool {
    let head = line.split_once(':').map_or(line, |(head, _)| head);
    line.starts_with('#') || !head.chars().any(char::is_lowercase)
}

fn header(line: &str) -> Option<(String, &str)> {
    let stripped = line.trim_matches(|c: char| c == '#' || c == '*' || c.is_whitespace());
    match stripped.split_once(':') {
        Some((head, rest)) => {
            let name = normalise_key(head);
            let rest = rest.trim_matches(|c: char| c == '*' || c.is_whitespace());
            if name.is_empty() {
                None
            } else if rest.is_empty() || is_known_section(&name) {
                Some((name, rest))
            } else {
                None
            }
        }
        None => {
            let name = normalise_key(stripped);
            is_known_section(&name).then_some((name, ""))
        }
    }
}

fn normalise_key(s: &str) -> String {
    s.trim_matches(|c: char| c == '#' || c == '*' || c.is_whitespace())
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '-' || c == '_')
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

fn is_known_section(name: &str) -> bool {
    [PERSONALITY_UPDATES, KNOWLEDGE_UPDATES, MEMORY_FORMATION].contains(&name)
        || REFLECTION_SECTIONS.contains(&name)
}

fn is_placeholder(item: &str) -> bool {
    let t = item.trim_matches(|c: char| c == '[' || c == ']' || c == '.' || c.is_whitespace());
    t.is_empty() || ["none", "n/a", "na", "nothing", "no changes", "no updates"].contains(&t.to_lowercase().as_str())
}

// ---------------------------------------------------------------------------
// Line decoders
// ---------------------------------------------------------------------------

fn parse_number(value: &str, percent: bool) -> Option<f32> {
    let cleaned: String = value
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == '−' { '-' } else { c })
        .collect();
    let n: f32 = cleaned.parse().ok()?;
    let n = if percent { n / 100.0 } else { n };
    n.is_finite().then_some(n)
}

/// Decode one trait-delta line; `None` if it is not one.
#[must_use]
pub fn parse_delta_line(line: &str, default_confidence: f32) -> Option<TraitDelta> {
    let caps = captures(&DELTA_LINE, line)?;
    let name = normalise_key(caps.name("name")?.as_str());
    if name.is_empty() {
        return None;
    }
    let mut delta = parse_number(caps.name("delta")?.as_str(), caps.name("pct").is_some())?;
    if captures(&DIRECTION_DOWN, &line[..caps.get(0)?.end()]).is_some() && delta > 0.0 {
        delta = -delta;
    }

    let tail = &line[caps.get(0)?.end()..];
    let confidence = captures(&CONFIDENCE, tail)
        .and_then(|c| parse_number(c.name("value")?.as_str(), c.name("pct").is_some()))
        .unwrap_or(default_confidence);

    Some(TraitDelta {
        name,
        delta,
        confidence,
    })
}

/// Decode one memory-candidate line into a draft with `default_type`,
/// honouring an optional leading `[type]` tag and trailing importance.
#[must_use]
pub fn parse_memory_line(line: &str, default_type: MemoryType) -> Option<MemoryDraft> {
    let mut text = line.trim().to_string();
    let mut memory_type = default_type;

    if let Some(caps) = captures(&TYPE_TAG, &text) {
        if let Some(parsed) = caps.name("tag").and_then(|t| t.as_str().parse::<MemoryType>().ok()) {
            memory_type = parsed;
            let end = caps.get(0).map_or(0, |m| m.end());
            text = text[end..].to_string();
        }
    }

    let mut importance = None;
    if let Some(caps) = captures(&IMPORTANCE, &text) {
        importance = caps
            .name("value")
            .and_then(|v| parse_number(v.as_str(), caps.name("pct").is_some()));
        if let Some(whole) = caps.get(0) {
            text.replace_range(whole.range(), "");
        }
    }

    let content = text.trim().trim_end_matches([',', ';']).trim().trim_matches('"').to_string();
    if content.is_empty() {
        return None;
    }
    let mut draft = MemoryDraft::new(content).with_type(memory_type);
    draft.importance = importance;
    Some(draft)
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

/// Counters describing one extraction, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractionStats {
    /// Recognised sections present in the text.
    pub sections: usize,
    /// Lines in known sections that could not be decoded.
    pub skipped: usize,
    /// Candidates dropped by the `max_candidates` limit.
    pub truncated: usize,
}

/// Turns analysis text into an [`EvolutionProposal`].
#[derive(Debug, Clone)]
pub struct UpdateExtractor {
    config: ExtractionConfig,
}

impl UpdateExtractor {
    /// Create an extractor.
    #[must_use]
    pub fn new(config: ExtractionConfig) -> Self {
        Self { config }
    }

    /// Extract a proposal. Never fails.
    #[must_use]
    pub fn extract(&self, analysis: &str) -> EvolutionProposal {
        self.extract_with_stats(analysis).0
    }

    /// Extract a proposal together with decoding statistics.
    #[must_use]
    pub fn extract_with_stats(&self, analysis: &str) -> (EvolutionProposal, ExtractionStats) {
        let sections = parse_sections(analysis);
        let mut stats = ExtractionStats::default();
        let mut proposal = EvolutionProposal::new();

        if let Some(lines) = sections.get(PERSONALITY_UPDATES) {
            stats.sections += 1;
            for line in lines {
                match parse_delta_line(line, self.config.default_confidence) {
                    Some(delta) => proposal.trait_deltas.push(delta),
                    None => stats.skipped += 1,
                }
            }
        }

        for (section, memory_type) in [
            (KNOWLEDGE_UPDATES, MemoryType::Semantic),
            (MEMORY_FORMATION, MemoryType::Episodic),
        ] {
            let Some(lines) = sections.get(section) else {
                continue;
            };
            stats.sections += 1;
            for line in lines {
                match parse_memory_line(line, memory_type) {
                    Some(draft) => proposal
                        .memories
                        .push(draft.with_meta("source", ANALYSIS_SOURCE).with_meta("section", section)),
                    None => stats.skipped += 1,
                }
            }
        }

        if proposal.memories.len() > self.config.max_candidates {
            stats.truncated = proposal.memories.len() - self.config.max_candidates;
            proposal.memories.truncate(self.config.max_candidates);
        }

        if stats.sections == 0 && !analysis.trim().is_empty() {
            debug!(len = analysis.len(), "analysis contained no recognised sections");
        }
        debug!(
            deltas = proposal.trait_deltas.len(),
            memories = proposal.memories.len(),
            skipped = stats.skipped,
            truncated = stats.truncated,
            "extracted proposal"
        );
        (proposal, stats)
    }
}

/// Named insight lists parsed from a reflection.
#[must_use]
pub fn reflection_insights(text: &str) -> BTreeMap<String, Vec<String>> {
    let mut sections = parse_sections(text);
    sections.retain(|k, _| REFLECTION_SECTIONS.contains(&k.as_str()));
    sections
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> UpdateExtractor {
        UpdateExtractor::new(ExtractionConfig::default())
    }

    #[test]
    fn well_formed_analysis() {
        let text = "PERSONALITY_UPDATES:\n\
                    - openness: +0.2 (confidence: 0.8)\n\
                    - extraversion: -0.1\n\
                    \n\
                    KNOWLEDGE_UPDATES:\n\
                    - Enjoys hiking in the Alps\n\
                    \n\
                    MEMORY_FORMATION:\n\
                    - Went hiking last Saturday (importance: 0.8)\n";
        let (p, stats) = extractor().extract_with_stats(text);
        assert_eq!(stats.sections, 3);
        assert_eq!(stats.skipped, 0);

        assert_eq!(p.trait_deltas.len(), 2);
        assert_eq!(p.trait_deltas[0].name, "openness");
        assert!((p.trait_deltas[0].delta - 0.2).abs() < 1e-6);
        assert!((p.trait_deltas[0].confidence - 0.8).abs() < 1e-6);
        assert!((p.trait_deltas[1].delta + 0.1).abs() < 1e-6);
        assert!((p.trait_deltas[1].confidence - 0.5).abs() < 1e-6);

        assert_eq!(p.memories.len(), 2);
        assert_eq!(p.memories[0].memory_type, Some(MemoryType::Semantic));
        assert_eq!(p.memories[1].memory_type, Some(MemoryType::Episodic));
        assert_eq!(p.memories[1].content, "Went hiking last Saturday");
        assert_eq!(p.memories[1].importance, Some(0.8));
        assert_eq!(p.memories[1].metadata.get("source").map(String::as_str), Some(ANALYSIS_SOURCE));
    }

    #[test]
    fn markdown_and_loose_forms() {
        let text = "## Personality Updates:\n\
                    * Agreeableness increased by 0.05, confidence 90%\n\
                    1. neuroticism decreased 0.1\n\
                    **Memory Formation:**\n\
                    • [semantic] Prefers tea over coffee\n";
        let p = extractor().extract(text);
        assert_eq!(p.trait_deltas.len(), 2);
        assert_eq!(p.trait_deltas[0].name, "agreeableness");
        assert!((p.trait_deltas[0].confidence - 0.9).abs() < 1e-6);
        assert!((p.trait_deltas[1].delta + 0.1).abs() < 1e-6);
        assert_eq!(p.memories[0].memory_type, Some(MemoryType::Semantic));
        assert_eq!(p.memories[0].content, "Prefers tea over coffee");
    }

    #[test]
    fn garbage_degrades_to_empty() {
        for text in ["", "I could not analyse this.", "PERSONALITY_UPDATES:\n- ???\n- none", "\u{0}\u{1}::::"] {
            let p = extractor().extract(text);
            assert!(p.trait_deltas.is_empty(), "{text:?}");
            assert!(p.memories.is_empty(), "{text:?}");
        }
    }

    #[test]
    fn out_of_range_values_are_kept_for_validation() {
        let p = extractor().extract("PERSONALITY_UPDATES:\n- openness: +2.5\n- curiosity: 0.1");
        assert!((p.trait_deltas[0].delta - 2.5).abs() < 1e-6);
        assert_eq!(p.trait_deltas[1].name, "curiosity");
    }

    #[test]
    fn candidates_are_capped() {
        let config = ExtractionConfig {
            max_candidates: 2,
            ..ExtractionConfig::default()
        };
        let text = "KNOWLEDGE_UPDATES:\n- a\n- b\n- c\n";
        let (p, stats) = UpdateExtractor::new(config).extract_with_stats(text);
        assert_eq!(p.memories.len(), 2);
        assert_eq!(stats.truncated, 1);
    }

    #[test]
    fn trait_sub_label_names_following_items() {
        let text = "PERSONALITY_UPDATES:\n\
                    Openness:\n\
                    - +0.1 (confidence 0.8)\n\
                    Emotional Stability:\n\
                    - -0.05\n\
                    - extraversion: +0.2\n";
        let sections = parse_sections(text);
        assert_eq!(sections.len(), 1);
        assert_eq!(
            sections[PERSONALITY_UPDATES],
            vec!["openness: +0.1 (confidence 0.8)", "emotional stability: -0.05", "extraversion: +0.2"]
        );

        let p = extractor().extract(text);
        assert_eq!(p.trait_deltas.len(), 3);
        assert_eq!(p.trait_deltas[0].name, "openness");
        assert!((p.trait_deltas[0].delta - 0.1).abs() < 1e-6);
        assert!((p.trait_deltas[0].confidence - 0.8).abs() < 1e-6);
        assert_eq!(p.trait_deltas[1].name, "emotional_stability");
        assert!((p.trait_deltas[1].delta + 0.05).abs() < 1e-6);
        assert_eq!(p.trait_deltas[2].name, "extraversion");
    }

    #[test]
    fn sub_label_does_not_leave_known_section() {
        let text = "KNOWLEDGE_UPDATES:\nHobbies:\n- Plays the cello\nNOTES:\n- not a memory\n";
        let sections = parse_sections(text);
        assert_eq!(sections[KNOWLEDGE_UPDATES], vec!["Plays the cello"]);
        assert_eq!(sections["notes"], vec!["not a memory"]);
        assert_eq!(extractor().extract(text).memories.len(), 1);
    }

    #[test]
    fn static_patterns_compile() {
        for re in [&DELTA_LINE, &DIRECTION_DOWN, &CONFIDENCE, &IMPORTANCE, &TYPE_TAG, &BULLET] {
            assert!(re.is_some());
        }
    }

    #[test]
    fn reflection_sections_parse() {
        let text = "PERSONALITY_INSIGHTS:\n- more open to new ideas\n\nCORE_VALUES:\n- honesty\n- curiosity\nOTHER:\n- ignored";
        let insights = reflection_insights(text);
        assert_eq!(insights["personality_insights"], vec!["more open to new ideas"]);
        assert_eq!(insights["core_values"].len(), 2);
        assert!(!insights.contains_key("other"));
    }
}
