// Provider cooldown tracker: per-provider allowedFails failures within
// windowSeconds trigger a cooldownSeconds quarantine. Grounded on
// provider_health.rs's AccountHealth/is_in_cooldown shape, simplified from
// its exponential-backoff model to the fixed-window contract here.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct CooldownConfig {
    pub allowed_fails: u32,
    pub window_seconds: u64,
    pub cooldown_seconds: u64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self { allowed_fails: 3, window_seconds: 60, cooldown_seconds: 30 }
    }
}

#[derive(Debug, Default)]
struct ProviderRecord {
    /// Timestamps of failures still inside the rolling window.
    failures: Vec<Instant>,
    cooled_until: Option<Instant>,
}

/// Tracks per-provider failure history and cooldown state behind a single
/// mutex, matching the shared-resource policy's "cooldown map single
/// mutex" discipline.
pub struct CooldownTracker {
    config: CooldownConfig,
    providers: Mutex<HashMap<String, ProviderRecord>>,
}

impl CooldownTracker {
    pub fn new(config: CooldownConfig) -> Self {
        Self { config, providers: Mutex::new(HashMap::new()) }
    }

    /// Whether `provider` is currently cooled down (quarantined).
    pub fn is_cooled(&self, provider: &str) -> bool {
        let providers = self.providers.lock().unwrap();
        match providers.get(provider) {
            Some(record) => match record.cooled_until {
                Some(until) => Instant::now() < until,
                None => false,
            },
            None => false,
        }
    }

    /// Record a failure for `provider`. If the rolling window now holds
    /// `allowed_fails` or more failures, enters cooldown for
    /// `cooldown_seconds`, satisfying `cooled_until_ms >= last failure +
    /// cooldown duration` since both are derived from the same instant.
    pub fn record_failure(&self, provider: &str) {
        let now = Instant::now();
        let window = Duration::from_secs(self.config.window_seconds);
        let mut providers = self.providers.lock().unwrap();
        let record = providers.entry(provider.to_string()).or_default();

        record.failures.retain(|&t| now.duration_since(t) <= window);
        record.failures.push(now);

        if record.failures.len() as u32 >= self.config.allowed_fails {
            record.cooled_until = Some(now + Duration::from_secs(self.config.cooldown_seconds));
        }
    }

    /// A successful response clears the failure counter for `provider`.
    pub fn record_success(&self, provider: &str) {
        let mut providers = self.providers.lock().unwrap();
        if let Some(record) = providers.get_mut(provider) {
            record.failures.clear();
            record.cooled_until = None;
        }
    }

    /// Given a list of candidate providers for a model, filter out the
    /// cooled ones. Returns an empty vec if all are cooled, which the
    /// router/orchestrator turns into a 503.
    pub fn filter_available<'a>(&self, candidates: &'a [String]) -> Vec<&'a String> {
        candidates.iter().filter(|p| !self.is_cooled(p)).collect()
    }
}
