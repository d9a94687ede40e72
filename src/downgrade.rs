// Auto-downgrade: a pure function of (model, budget_percent, config).
// Grounded on config/routing.rs's ProviderConfig::model_mapping shape,
// repurposed from provider-scoped model renaming to a global
// expensive-to-cheaper downgrade table.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct DowngradeConfig {
    pub enabled: bool,
    pub threshold_percent: f64,
    pub mapping: HashMap<String, String>,
}

impl Default for DowngradeConfig {
    fn default() -> Self {
        let mut mapping = HashMap::new();
        // Anthropic
        mapping.insert("claude-3-opus-20240229".to_string(), "claude-3-5-sonnet-20241022".to_string());
        mapping.insert("claude-opus-4-20250514".to_string(), "claude-sonnet-4-20250514".to_string());
        mapping.insert("claude-3-5-sonnet-20241022".to_string(), "claude-3-5-haiku-20241022".to_string());
        mapping.insert("claude-sonnet-4-20250514".to_string(), "claude-haiku-4-20250514".to_string());
        mapping.insert("claude-3-sonnet-20240229".to_string(), "claude-3-haiku-20240307".to_string());
        // OpenAI
        mapping.insert("o1".to_string(), "o1-mini".to_string());
        mapping.insert("gpt-4o".to_string(), "gpt-4o-mini".to_string());
        // Google
        mapping.insert("gemini-1.5-pro".to_string(), "gemini-1.5-flash".to_string());

        Self { enabled: true, threshold_percent: 80.0, mapping }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DowngradeDecision {
    pub downgraded: bool,
    pub original_model: String,
    pub new_model: String,
    pub reason: String,
}

/// Pure: same inputs always produce the same decision (property-tested
/// referential transparency).
pub fn check_downgrade(model: &str, budget_percent: f64, config: &DowngradeConfig) -> DowngradeDecision {
    if !config.enabled {
        return DowngradeDecision {
            downgraded: false,
            original_model: model.to_string(),
            new_model: model.to_string(),
            reason: "downgrade disabled".to_string(),
        };
    }

    if budget_percent < config.threshold_percent {
        return DowngradeDecision {
            downgraded: false,
            original_model: model.to_string(),
            new_model: model.to_string(),
            reason: format!(
                "budget utilization {budget_percent:.1}% below threshold {:.1}%",
                config.threshold_percent
            ),
        };
    }

    match config.mapping.get(model) {
        Some(cheaper) => DowngradeDecision {
            downgraded: true,
            original_model: model.to_string(),
            new_model: cheaper.clone(),
            reason: format!(
                "budget utilization {budget_percent:.1}% at/above threshold {:.1}%",
                config.threshold_percent
            ),
        },
        None => DowngradeDecision {
            downgraded: false,
            original_model: model.to_string(),
            new_model: model.to_string(),
            reason: "no mapping available".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downgrades_when_over_threshold_and_mapped() {
        let config = DowngradeConfig::default();
        let decision = check_downgrade("claude-3-opus-20240229", 85.0, &config);
        assert!(decision.downgraded);
        assert_eq!(decision.new_model, "claude-3-5-sonnet-20241022");
    }

    #[test]
    fn no_downgrade_below_threshold() {
        let config = DowngradeConfig::default();
        let decision = check_downgrade("claude-3-opus-20240229", 50.0, &config);
        assert!(!decision.downgraded);
    }

    #[test]
    fn unmapped_model_passes_through_with_reason() {
        let config = DowngradeConfig::default();
        let decision = check_downgrade("some-unknown-model", 99.0, &config);
        assert!(!decision.downgraded);
        assert_eq!(decision.reason, "no mapping available");
    }

    #[test]
    fn disabled_never_downgrades() {
        let mut config = DowngradeConfig::default();
        config.enabled = false;
        let decision = check_downgrade("claude-3-opus-20240229", 100.0, &config);
        assert!(!decision.downgraded);
    }

    #[test]
    fn referentially_transparent() {
        let config = DowngradeConfig::default();
        let a = check_downgrade("claude-3-opus-20240229", 85.0, &config);
        let b = check_downgrade("claude-3-opus-20240229", 85.0, &config);
        assert_eq!(a, b);
    }

    #[test]
    fn idempotent_on_the_already_downgraded_model() {
        // Downgrading the *result* of a downgrade should not cascade
        // further within a single decision - check_downgrade only ever
        // looks at the model passed in, it doesn't chase the mapping
        // transitively.
        let config = DowngradeConfig::default();
        let first = check_downgrade("claude-3-5-sonnet-20241022", 85.0, &config);
        assert_eq!(first.new_model, "claude-3-5-haiku-20241022");
        let second = check_downgrade(&first.new_model, 85.0, &config);
        assert!(!second.downgraded, "haiku has no further downgrade mapping");
    }
}
