//! The trait vector: a closed set of named scalars in [0, 1].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::PersonalityConfig;

/// Value a trait starts at when the configuration gives none.
pub const NEUTRAL_TRAIT_VALUE: f32 = 0.5;

/// Mapping from every configured trait name to its value.
///
/// The key set is fixed at construction and every value is clamped to
/// [0, 1] on write, so both invariants hold for the whole lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraitVector(BTreeMap<String, f32>);

impl TraitVector {
    /// Build the initial vector for a configuration.
    #[must_use]
    pub fn from_config(config: &PersonalityConfig) -> Self {
        Self(
            config
                .traits
                .iter()
                .map(|name| {
                    let v = config.initial.get(name).copied().unwrap_or(NEUTRAL_TRAIT_VALUE);
                    (name.clone(), clamp_unit(v))
                })
                .collect(),
        )
    }

    /// Build a vector from explicit values (clamped).
    #[must_use]
    pub fn from_values(values: impl IntoIterator<Item = (String, f32)>) -> Self {
        Self(values.into_iter().map(|(k, v)| (k, clamp_unit(v))).collect())
    }

    /// Value of one trait.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<f32> {
        self.0.get(name).copied()
    }

    /// Whether `name` belongs to the trait set.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Overwrite an existing trait. Unknown names are ignored so the key set
    /// never grows.
    pub(crate) fn set(&mut self, name: &str, value: f32) {
        if let Some(slot) = self.0.get_mut(name) {
            *slot = clamp_unit(value);
        }
    }

    /// Iterate `(name, value)` in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Trait names in name order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// The highest-valued trait (first by name on ties).
    #[must_use]
    pub fn dominant(&self) -> Option<(&str, f32)> {
        self.iter()
            .fold(None, |best: Option<(&str, f32)>, (k, v)| match best {
                Some((_, bv)) if bv >= v => best,
                _ => Some((k, v)),
            })
    }

    /// Number of traits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the trait set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Values as a plain map.
    #[must_use]
    pub fn as_map(&self) -> &BTreeMap<String, f32> {
        &self.0
    }
}

fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() { NEUTRAL_TRAIT_VALUE } else { v.clamp(0.0, 1.0) }
}

impl std::fmt::Display for TraitVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (name, value) in self.iter() {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{name}: {value:.2}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_to_neutral() {
        let mut config = PersonalityConfig::default();
        config.initial.insert("openness".into(), 0.7);
        let v = TraitVector::from_config(&config);
        assert_eq!(v.len(), 5);
        assert_eq!(v.get("openness"), Some(0.7));
        assert_eq!(v.get("neuroticism"), Some(NEUTRAL_TRAIT_VALUE));
    }

    #[test]
    fn set_clamps_and_never_adds_keys() {
        let mut v = TraitVector::from_config(&PersonalityConfig::default());
        v.set("openness", 3.0);
        v.set("curiosity", 0.2);
        assert_eq!(v.get("openness"), Some(1.0));
        assert!(!v.contains("curiosity"));
        v.set("openness", f32::NAN);
        assert_eq!(v.get("openness"), Some(NEUTRAL_TRAIT_VALUE));
    }

    #[test]
    fn dominant_prefers_highest() {
        let v = TraitVector::from_values([("a".to_string(), 0.2), ("b".to_string(), 0.9)]);
        assert_eq!(v.dominant(), Some(("b", 0.9)));
    }

    #[test]
    fn display_lists_all_traits() {
        let v = TraitVector::from_values([("openness".to_string(), 0.75)]);
        assert_eq!(v.to_string(), "openness: 0.75");
    }
}
