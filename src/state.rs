//! Shared dependency bundle handed to every request handler. The ancestor
//! proxy wired its subsystems as module-level singletons reached through a
//! handful of `Arc<Mutex<_>>` globals threaded via axum's `State`; here
//! they're collected into one explicit `Deps` struct built once at startup,
//! so every collaborator a handler can reach is visible at its call site
//! instead of hidden behind a `use` of a global.

use crate::alerts::AlertManager;
use crate::anomaly::AnomalyDetector;
use crate::auth::AuthResolver;
use crate::budget::BudgetManager;
use crate::cache::ResponseCache;
use crate::config::Config;
use crate::cooldown::CooldownTracker;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct Deps(Arc<Inner>);

pub struct Inner {
    pub config: Config,
    pub cache: ResponseCache,
    pub budget: BudgetManager,
    pub anomaly: AnomalyDetector,
    pub alerts: AlertManager,
    pub cooldown: CooldownTracker,
    pub auth: AuthResolver,
    pub http: reqwest::Client,
    pub started_at: Instant,
    /// Flipped by `POST /control/disable` and `/control/enable`; checked by
    /// the orchestrator before doing any pipeline work.
    pub enabled: AtomicBool,
}

impl Deps {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.log_dir)?;
        let budget_log = config.log_dir.join("budget.jsonl");
        let alerts_log = config.log_dir.join("alerts.jsonl");

        let env_overrides = env_var_overrides();
        let credentials = config.load_credentials().unwrap_or_else(|e| {
            tracing::warn!("failed to load credentials file, continuing without it: {e}");
            crate::config::Credentials::default()
        });

        let inner = Inner {
            cache: ResponseCache::new(config.cache.clone()),
            budget: BudgetManager::new(config.budget.clone(), budget_log),
            anomaly: AnomalyDetector::new(config.anomaly.clone()),
            alerts: AlertManager::new(config.alerts.clone(), Some(alerts_log)),
            cooldown: CooldownTracker::new(config.cooldown.clone()),
            auth: AuthResolver::with_credentials(env_overrides, credentials),
            // No default User-Agent: the orchestrator forwards the caller's
            // own User-Agent instead, since Anthropic validates it for
            // Claude Max/OAuth credentials. HTTP/1.1 is forced to avoid
            // HTTP/2 connection-reset issues seen against some providers.
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .pool_max_idle_per_host(10)
                .http1_only()
                .build()?,
            started_at: Instant::now(),
            enabled: AtomicBool::new(true),
            config,
        };
        Ok(Self(Arc::new(inner)))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, value: bool) {
        self.0.enabled.store(value, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.0.started_at.elapsed().as_secs()
    }
}

impl std::ops::Deref for Deps {
    type Target = Inner;
    fn deref(&self) -> &Inner {
        &self.0
    }
}

/// `RELAYPLANE_AUTH_OVERRIDE_<MODEL_PREFIX>=ENV_VAR_NAME` lets an operator
/// redirect a model prefix to a nonstandard credential env var without a
/// config file edit - same override knob `AuthResolver` itself documents.
fn env_var_overrides() -> HashMap<String, String> {
    let mut overrides = HashMap::new();
    let prefix = "RELAYPLANE_AUTH_OVERRIDE_";
    for (key, value) in std::env::vars() {
        if let Some(model_prefix) = key.strip_prefix(prefix) {
            overrides.insert(model_prefix.to_ascii_lowercase(), value);
        }
    }
    overrides
}
