//! Colocation interference scoring
//!
//! An interference domain maps `(key, stage load)` to a capacity multiplier:
//! `1.0` means no effect, below `1.0` degraded, above `1.0` improved. The
//! scoring function is pure; identical inputs always produce identical
//! multipliers, which keeps runs replayable.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Opaque identity grouping colocated flows for scoring
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterferenceKey(pub String);

impl InterferenceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl std::fmt::Display for InterferenceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scoring function applied to a host's capacity before each flow resolution
pub trait InterferenceDomain {
    /// Multiplier for one participant under the given stage load.
    ///
    /// `load` is total requested rate divided by the stage's raw capacity and
    /// may exceed `1.0` under oversubscription. A `None` key always yields
    /// `1.0`.
    fn apply(&self, key: Option<&InterferenceKey>, load: f64) -> f64;
}

/// Domain that never degrades or improves anything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInterference;

impl InterferenceDomain for NoInterference {
    fn apply(&self, _key: Option<&InterferenceKey>, _load: f64) -> f64 {
        1.0
    }
}

/// One scored colocation group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterferenceGroup {
    pub key: InterferenceKey,
    /// Stage load at or above which the score kicks in
    pub min_load: f64,
    /// Capacity multiplier for members once the load threshold is reached
    pub score: f64,
}

/// Static lookup-table domain.
///
/// A participant whose group's load threshold has been reached gets the
/// group's score; everything else gets `1.0`.
#[derive(Debug, Clone, Default)]
pub struct InterferenceModel {
    groups: HashMap<InterferenceKey, InterferenceGroup>,
}

impl InterferenceModel {
    pub fn new(groups: Vec<InterferenceGroup>) -> Self {
        InterferenceModel {
            groups: groups.into_iter().map(|g| (g.key.clone(), g)).collect(),
        }
    }
}

impl InterferenceDomain for InterferenceModel {
    fn apply(&self, key: Option<&InterferenceKey>, load: f64) -> f64 {
        let Some(key) = key else {
            return 1.0;
        };
        match self.groups.get(key) {
            Some(group) if load >= group.min_load => group.score,
            _ => 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noisy_neighbors() -> InterferenceModel {
        InterferenceModel::new(vec![
            InterferenceGroup {
                key: InterferenceKey::new("membound"),
                min_load: 0.8,
                score: 0.75,
            },
            InterferenceGroup {
                key: InterferenceKey::new("cachefriendly"),
                min_load: 0.5,
                score: 1.1,
            },
        ])
    }

    #[test]
    fn test_no_key_is_unaffected() {
        let model = noisy_neighbors();
        assert_eq!(model.apply(None, 2.0), 1.0);
    }

    #[test]
    fn test_score_applies_at_threshold() {
        let model = noisy_neighbors();
        let key = InterferenceKey::new("membound");

        assert_eq!(model.apply(Some(&key), 0.5), 1.0);
        assert_eq!(model.apply(Some(&key), 0.8), 0.75);
        assert_eq!(model.apply(Some(&key), 1.5), 0.75);
    }

    #[test]
    fn test_scores_can_improve() {
        let model = noisy_neighbors();
        let key = InterferenceKey::new("cachefriendly");

        assert_eq!(model.apply(Some(&key), 0.6), 1.1);
    }

    #[test]
    fn test_unknown_key_is_unaffected() {
        let model = noisy_neighbors();
        let key = InterferenceKey::new("unlisted");

        assert_eq!(model.apply(Some(&key), 1.0), 1.0);
    }

    #[test]
    fn test_identical_inputs_identical_outputs() {
        let model = noisy_neighbors();
        let key = InterferenceKey::new("membound");

        let first = model.apply(Some(&key), 0.9);
        let second = model.apply(Some(&key), 0.9);
        assert_eq!(first, second);
    }
}
