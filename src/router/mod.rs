// Router: aliases and suffixes resolve first, then explicit overrides,
// then the configured mode (passthrough/complexity/cascade) picks the
// model. Cascade is an explicit state machine that escalates through an
// ordered model list on an uncertainty/refusal/transport-error trigger.
//
// Grounded on other_examples/.../claw-router/src/router.rs's
// Dispatch/Escalate dual-mode RouterState and `is_sufficient()` heuristic
// (inverted here into `should_escalate`), and on config/routing.rs's
// model_mapping shape for the override table.

pub mod classifier;

use classifier::{classify, Complexity};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterMode {
    Passthrough,
    Complexity,
    Cascade,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub mode: RouterMode,
    /// Aliases resolved before anything else: rp:best, rp:fast, rp:cheap,
    /// rp:balanced, relayplane:auto, rp:auto.
    pub aliases: HashMap<String, String>,
    /// Complexity-mode tier -> model.
    pub complexity_tiers: HashMap<Complexity, String>,
    /// Cascade-mode ordered model list, cheapest/fastest first.
    pub cascade_models: Vec<String>,
    pub max_escalations: u32,
    /// Explicit per-model overrides, applied before complexity/cascade.
    pub overrides: HashMap<String, String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        let mut aliases = HashMap::new();
        aliases.insert("rp:best".to_string(), "claude-opus-4-20250514".to_string());
        aliases.insert("rp:fast".to_string(), "claude-haiku-4-20250514".to_string());
        aliases.insert("rp:cheap".to_string(), "claude-3-5-haiku-20241022".to_string());
        aliases.insert("rp:balanced".to_string(), "claude-sonnet-4-20250514".to_string());
        aliases.insert("relayplane:auto".to_string(), "claude-sonnet-4-20250514".to_string());
        aliases.insert("rp:auto".to_string(), "claude-sonnet-4-20250514".to_string());

        let mut complexity_tiers = HashMap::new();
        complexity_tiers.insert(Complexity::Simple, "claude-3-5-haiku-20241022".to_string());
        complexity_tiers.insert(Complexity::Moderate, "claude-3-5-sonnet-20241022".to_string());
        complexity_tiers.insert(Complexity::Complex, "claude-opus-4-20250514".to_string());

        Self {
            mode: RouterMode::Passthrough,
            aliases,
            complexity_tiers,
            cascade_models: vec![
                "claude-3-5-haiku-20241022".to_string(),
                "claude-3-5-sonnet-20241022".to_string(),
                "claude-opus-4-20250514".to_string(),
            ],
            max_escalations: 2,
            overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingSuffix {
    Cost,
    Fast,
    Quality,
}

/// Strips a `:cost`/`:fast`/`:quality` suffix off a model name, returning
/// the base name and the preference hint if one was present.
pub fn strip_routing_suffix(model: &str) -> (&str, Option<RoutingSuffix>) {
    for (suffix, hint) in [
        (":cost", RoutingSuffix::Cost),
        (":fast", RoutingSuffix::Fast),
        (":quality", RoutingSuffix::Quality),
    ] {
        if let Some(base) = model.strip_suffix(suffix) {
            return (base, Some(hint));
        }
    }
    (model, None)
}

#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub model: String,
    pub reason: String,
    pub suffix_hint: Option<RoutingSuffix>,
}

/// Resolves aliases, suffixes, overrides, and the configured mode (for
/// passthrough/complexity only - cascade needs the cascade state machine
/// below since it spans multiple forwarding attempts).
pub fn resolve_initial_route(model: &str, config: &RouterConfig, envelope: &crate::envelope::Envelope) -> RouteDecision {
    let (stripped, suffix_hint) = strip_routing_suffix(model);

    if let Some(alias_target) = config.aliases.get(stripped) {
        return RouteDecision {
            model: alias_target.clone(),
            reason: format!("alias '{stripped}' resolved"),
            suffix_hint,
        };
    }

    if let Some(overridden) = config.overrides.get(stripped) {
        return RouteDecision {
            model: overridden.clone(),
            reason: format!("explicit override for '{stripped}'"),
            suffix_hint,
        };
    }

    match config.mode {
        RouterMode::Passthrough => RouteDecision {
            model: stripped.to_string(),
            reason: "passthrough".to_string(),
            suffix_hint,
        },
        RouterMode::Complexity => {
            let tier = classify(envelope);
            let model = config
                .complexity_tiers
                .get(&tier)
                .cloned()
                .unwrap_or_else(|| stripped.to_string());
            RouteDecision { model, reason: format!("complexity tier {tier:?}"), suffix_hint }
        }
        RouterMode::Cascade => {
            let model = config.cascade_models.first().cloned().unwrap_or_else(|| stripped.to_string());
            RouteDecision { model, reason: "cascade start (tier 0)".to_string(), suffix_hint }
        }
    }
}

/// Cascade's explicit state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CascadeState {
    Initial,
    Forwarding(usize),
    Escalating(usize),
    Done,
    Exhausted,
}

pub struct CascadeMachine<'a> {
    models: &'a [String],
    max_escalations: u32,
    escalations_used: u32,
    state: CascadeState,
}

impl<'a> CascadeMachine<'a> {
    pub fn new(models: &'a [String], max_escalations: u32) -> Self {
        Self { models, max_escalations, escalations_used: 0, state: CascadeState::Initial }
    }

    pub fn current_model(&self) -> Option<&str> {
        match self.state {
            CascadeState::Initial => self.models.first().map(String::as_str),
            CascadeState::Forwarding(idx) | CascadeState::Escalating(idx) => {
                self.models.get(idx).map(String::as_str)
            }
            CascadeState::Done | CascadeState::Exhausted => None,
        }
    }

    pub fn state(&self) -> &CascadeState {
        &self.state
    }

    /// Call once forwarding to `current_model()` begins.
    pub fn begin_forwarding(&mut self) {
        let idx = match self.state {
            CascadeState::Initial => 0,
            CascadeState::Escalating(idx) => idx,
            ref other => panic!("begin_forwarding called from unexpected state {other:?}"),
        };
        self.state = CascadeState::Forwarding(idx);
    }

    /// The response was sufficient (or this is the last available tier):
    /// the cascade completes here.
    pub fn complete(&mut self) {
        self.state = CascadeState::Done;
    }

    /// Attempts to escalate to the next tier. Returns false (transitions
    /// to Exhausted) if max_escalations or the end of the model list has
    /// been reached.
    pub fn try_escalate(&mut self) -> bool {
        let idx = match self.state {
            CascadeState::Forwarding(idx) => idx,
            ref other => panic!("try_escalate called from unexpected state {other:?}"),
        };
        if self.escalations_used >= self.max_escalations || idx + 1 >= self.models.len() {
            self.state = CascadeState::Exhausted;
            return false;
        }
        self.escalations_used += 1;
        self.state = CascadeState::Escalating(idx + 1);
        true
    }

    pub fn escalations_used(&self) -> u32 {
        self.escalations_used
    }
}

const UNCERTAINTY_PHRASES: &[&str] = &[
    "i don't know",
    "i'm not sure",
    "i am not sure",
    "i cannot determine",
    "unclear to me",
];

const REFUSAL_PHRASES: &[&str] = &[
    "i cannot",
    "i can't help",
    "i'm not able to",
    "i am not able to",
    "as an ai",
    "i don't have enough information",
];

/// Pure function of the response body (or a transport error): does this
/// response warrant escalating to the next cascade tier?
pub fn should_escalate(response_text: Option<&str>, transport_error: bool) -> bool {
    if transport_error {
        return true;
    }
    let Some(text) = response_text else { return false };
    if text.trim().len() < 20 {
        return true;
    }
    let lower = text.to_ascii_lowercase();
    UNCERTAINTY_PHRASES.iter().any(|p| lower.contains(p)) || REFUSAL_PHRASES.iter().any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_suffix_recognizes_all_three() {
        assert_eq!(strip_routing_suffix("gpt-4o:cost"), ("gpt-4o", Some(RoutingSuffix::Cost)));
        assert_eq!(strip_routing_suffix("gpt-4o:fast"), ("gpt-4o", Some(RoutingSuffix::Fast)));
        assert_eq!(strip_routing_suffix("gpt-4o:quality"), ("gpt-4o", Some(RoutingSuffix::Quality)));
        assert_eq!(strip_routing_suffix("gpt-4o"), ("gpt-4o", None));
    }

    #[test]
    fn alias_resolves_before_mode() {
        let config = RouterConfig { mode: RouterMode::Passthrough, ..RouterConfig::default() };
        let env = test_envelope();
        let decision = resolve_initial_route("rp:fast", &config, &env);
        assert_eq!(decision.model, "claude-haiku-4-20250514");
    }

    #[test]
    fn override_applies_before_complexity() {
        let mut config = RouterConfig { mode: RouterMode::Complexity, ..RouterConfig::default() };
        config.overrides.insert("claude-3-5-sonnet-20241022".to_string(), "pinned-model".to_string());
        let env = test_envelope();
        let decision = resolve_initial_route("claude-3-5-sonnet-20241022", &config, &env);
        assert_eq!(decision.model, "pinned-model");
    }

    #[test]
    fn cascade_escalates_on_transport_error_up_to_max() {
        let models = vec!["tier0".to_string(), "tier1".to_string(), "tier2".to_string()];
        let mut cascade = CascadeMachine::new(&models, 2);
        cascade.begin_forwarding();
        assert_eq!(cascade.current_model(), Some("tier0"));
        assert!(should_escalate(None, true));
        assert!(cascade.try_escalate());
        cascade.begin_forwarding();
        assert_eq!(cascade.current_model(), Some("tier1"));
        assert!(cascade.try_escalate());
        cascade.begin_forwarding();
        assert_eq!(cascade.current_model(), Some("tier2"));
        assert!(!cascade.try_escalate(), "max_escalations reached");
        assert_eq!(cascade.state(), &CascadeState::Exhausted);
    }

    #[test]
    fn cascade_completes_on_sufficient_response() {
        let models = vec!["tier0".to_string(), "tier1".to_string()];
        let mut cascade = CascadeMachine::new(&models, 2);
        cascade.begin_forwarding();
        assert!(!should_escalate(Some("Here is a complete, confident answer to your question."), false));
        cascade.complete();
        assert_eq!(cascade.state(), &CascadeState::Done);
    }

    #[test]
    fn should_escalate_detects_refusal_phrases() {
        assert!(should_escalate(Some("I cannot help with that request."), false));
    }

    fn test_envelope() -> crate::envelope::Envelope {
        let body = serde_json::json!({"model": "x", "messages": [{"role": "user", "content": "hi"}]});
        crate::envelope::parse_request(serde_json::to_vec(&body).unwrap().as_slice(), crate::envelope::ProviderFamily::Anthropic).unwrap()
    }
}
