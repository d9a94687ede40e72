// Alert manager: three fire operations (threshold/anomaly/breach), each
// deduplicated by a type-specific key within a cooldown window, each
// persisted durably (or to an in-memory ring when the durable store is
// unavailable) and each followed by a best-effort async webhook POST that
// never affects the caller's return value.
//
// Grounded on provider_health.rs's fallback-event audit trail (ring-trim
// + warn!/info! severity split) and storage/mod.rs's append-only JSONL
// write pattern for the durable side.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
    Threshold,
    Anomaly,
    Breach,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp_ms: i64,
    pub data: serde_json::Value,
    pub delivered: bool,
}

#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub cooldown_seconds: u64,
    pub max_history: usize,
    pub webhook_url: Option<String>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self { cooldown_seconds: 300, max_history: 500, webhook_url: None }
    }
}

static ALERT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_alert_id() -> String {
    let n = ALERT_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("alert_{}_{n:08x}", std::process::id())
}

pub struct AlertManager {
    config: AlertConfig,
    last_fired: Mutex<HashMap<String, Instant>>,
    history: Mutex<VecDeque<Alert>>,
    http_client: reqwest::Client,
    durable_path: Option<std::path::PathBuf>,
}

impl AlertManager {
    pub fn new(config: AlertConfig, durable_path: Option<std::path::PathBuf>) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client with a fixed timeout always builds");
        Self {
            config,
            last_fired: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            http_client,
            durable_path,
        }
    }

    pub fn fire_threshold(&self, percent: u32, data: serde_json::Value) -> Option<Alert> {
        let key = format!("threshold:{percent}");
        let severity = if percent >= 95 { AlertSeverity::Critical } else { AlertSeverity::Warning };
        self.fire(&key, AlertType::Threshold, severity, format!("budget threshold {percent}% crossed"), data)
    }

    pub fn fire_anomaly(&self, anomaly_type: &str, severity: AlertSeverity, data: serde_json::Value) -> Option<Alert> {
        let key = format!("anomaly:{anomaly_type}");
        self.fire(&key, AlertType::Anomaly, severity, format!("anomaly detected: {anomaly_type}"), data)
    }

    pub fn fire_breach(&self, breach_type: &str, data: serde_json::Value) -> Option<Alert> {
        let key = format!("breach:{breach_type}");
        self.fire(&key, AlertType::Breach, AlertSeverity::Critical, format!("budget breach: {breach_type}"), data)
    }

    fn fire(
        &self,
        dedup_key: &str,
        alert_type: AlertType,
        severity: AlertSeverity,
        message: String,
        data: serde_json::Value,
    ) -> Option<Alert> {
        let now = Instant::now();
        {
            let mut last_fired = self.last_fired.lock().unwrap();
            if let Some(&fired_at) = last_fired.get(dedup_key) {
                if now.duration_since(fired_at) < Duration::from_secs(self.config.cooldown_seconds) {
                    return None;
                }
            }
            last_fired.insert(dedup_key.to_string(), now);
        }

        let alert = Alert {
            id: generate_alert_id(),
            alert_type,
            severity,
            message,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            data,
            delivered: false,
        };

        self.persist(&alert);
        self.dispatch_webhook(alert.clone());

        Some(alert)
    }

    fn persist(&self, alert: &Alert) {
        let mut wrote_durable = false;
        if let Some(path) = &self.durable_path {
            if let Ok(line) = serde_json::to_string(alert) {
                use std::io::Write;
                match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                    Ok(mut file) => {
                        if writeln!(file, "{line}").is_ok() {
                            wrote_durable = true;
                        }
                    }
                    Err(e) => tracing::warn!("alert durable store unreachable, degrading to memory-only: {e}"),
                }
            }
        }
        if !wrote_durable {
            let mut history = self.history.lock().unwrap();
            history.push_back(alert.clone());
            while history.len() > self.config.max_history {
                history.pop_front();
            }
        }
    }

    /// Fire-and-forget webhook delivery. `delivered` on the persisted
    /// copy is best-effort only: nothing awaits this, and a failure here
    /// never bubbles back to the caller that triggered the fire.
    fn dispatch_webhook(&self, alert: Alert) {
        let Some(url) = self.config.webhook_url.clone() else { return };
        let client = self.http_client.clone();
        tokio::spawn(async move {
            let body = serde_json::json!({"source": "relayplane", "alert": alert});
            if let Err(e) = client.post(&url).json(&body).send().await {
                tracing::warn!("alert webhook delivery failed (non-fatal): {e}");
            }
        });
    }

    /// Most recent `limit` alerts, newest first. Reads the durable JSONL
    /// log when one is configured and readable, falling back to the
    /// in-memory ring (used when the durable store degraded, or wasn't
    /// configured at all).
    pub fn recent(&self, limit: usize) -> Vec<Alert> {
        if let Some(path) = &self.durable_path {
            if let Ok(contents) = std::fs::read_to_string(path) {
                let mut alerts: Vec<Alert> = contents
                    .lines()
                    .rev()
                    .filter_map(|line| serde_json::from_str(line).ok())
                    .take(limit)
                    .collect();
                if !alerts.is_empty() || contents.is_empty() {
                    return std::mem::take(&mut alerts);
                }
            }
        }
        let history = self.history.lock().unwrap();
        history.iter().rev().take(limit).cloned().collect()
    }
}
