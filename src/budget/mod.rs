// Budget manager: two simultaneous rolling windows (daily, hourly, both
// UTC), a sub-5ms fast path (`check_budget`) that touches only memory and
// config, and a slow path (`record_spend`) that updates the in-memory
// cache synchronously and write-behinds the durable append-only log.
//
// Grounded on pricing.rs (cost math feeding spend records) and
// storage/mod.rs's append-only JSONL write pattern (open-append-flush per
// event, log-and-continue on write failure rather than crashing).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreachType {
    None,
    Daily,
    Hourly,
    PerRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreachAction {
    Block,
    Warn,
    Downgrade,
    Alert,
}

#[derive(Debug, Clone)]
pub struct BudgetConfig {
    pub daily_limit_usd: f64,
    pub hourly_limit_usd: f64,
    /// Ceiling on a single request's estimated cost, consulted by
    /// `check_budget` before the daily/hourly windows whenever a caller
    /// supplies `estimated_cost`. `None` means no per-request cap.
    pub per_request_limit_usd: Option<f64>,
    /// Ascending percentages, e.g. [50, 80, 95].
    pub thresholds: Vec<u32>,
    pub on_breach: BreachAction,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_limit_usd: 50.0,
            hourly_limit_usd: 10.0,
            per_request_limit_usd: None,
            thresholds: vec![50, 80, 95],
            on_breach: BreachAction::Block,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpendRecord {
    pub amount_usd: f64,
    pub model: String,
    pub daily_window: String,
    pub hourly_window: String,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone)]
pub struct BudgetCheckResult {
    pub allowed: bool,
    pub breached: bool,
    pub breach_type: BreachType,
    pub action: Option<BreachAction>,
    pub current_daily_spend: f64,
    pub current_hourly_spend: f64,
    pub thresholds_crossed: Vec<u32>,
}

struct BudgetState {
    daily_window: String,
    hourly_window: String,
    daily_spend: f64,
    hourly_spend: f64,
    fired_thresholds: HashSet<u32>,
}

pub fn daily_window_key(now: chrono::DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

pub fn hourly_window_key(now: chrono::DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H").to_string()
}

/// Dual-window spend tracker with a write-behind durable log.
pub struct BudgetManager {
    config: BudgetConfig,
    state: Mutex<BudgetState>,
    durable_log_path: PathBuf,
    /// Queued spend records awaiting the periodic flush; drained by
    /// `flush_durable` (timer-driven) and synchronously on shutdown.
    pending: Mutex<Vec<SpendRecord>>,
}

impl BudgetManager {
    /// Builds a manager with empty in-memory windows. Call
    /// `resync_from_durable_log` once at startup if the durable log
    /// already has entries for the current windows (process restart).
    pub fn new(config: BudgetConfig, durable_log_path: PathBuf) -> Self {
        let now = Utc::now();
        let manager = Self {
            config,
            state: Mutex::new(BudgetState {
                daily_window: daily_window_key(now),
                hourly_window: hourly_window_key(now),
                daily_spend: 0.0,
                hourly_spend: 0.0,
                fired_thresholds: HashSet::new(),
            }),
            durable_log_path,
            pending: Mutex::new(Vec::new()),
        };
        manager.resync_from_durable_log();
        manager
    }

    /// Reads the durable log and recomputes the in-memory sums for the
    /// current daily/hourly windows. This is the only place budget state
    /// does file IO outside the periodic flush - it runs at startup and
    /// whenever `ensure_windows_current` detects a window rollover, never
    /// on the request-handling fast path for a window that hasn't rolled.
    fn resync_from_durable_log(&self) {
        let Ok(contents) = std::fs::read_to_string(&self.durable_log_path) else {
            return;
        };
        let mut state = self.state.lock().unwrap();
        let mut daily_sum = 0.0;
        let mut hourly_sum = 0.0;
        for line in contents.lines() {
            let Ok(record) = serde_json::from_str::<SpendRecord>(line) else { continue };
            if record.daily_window == state.daily_window {
                daily_sum += record.amount_usd;
            }
            if record.hourly_window == state.hourly_window {
                hourly_sum += record.amount_usd;
            }
        }
        state.daily_spend = daily_sum;
        state.hourly_spend = hourly_sum;
    }

    /// Checks whether the current wall-clock daily/hourly window differs
    /// from the cached one and, if so, rolls over: resets the counter for
    /// whichever window(s) changed and clears fired-thresholds on a daily
    /// rollover. Called at the top of both check_budget and record_spend.
    fn ensure_windows_current(&self, now: chrono::DateTime<Utc>) {
        let (daily_key, hourly_key) = (daily_window_key(now), hourly_window_key(now));
        let rolled_daily;
        let rolled_hourly;
        {
            let mut state = self.state.lock().unwrap();
            rolled_daily = state.daily_window != daily_key;
            rolled_hourly = state.hourly_window != hourly_key;
            if rolled_daily {
                state.daily_window = daily_key;
                state.daily_spend = 0.0;
                state.fired_thresholds.clear();
            }
            if rolled_hourly {
                state.hourly_window = hourly_key;
                state.hourly_spend = 0.0;
            }
        }
        if rolled_daily || rolled_hourly {
            self.resync_from_durable_log();
        }
    }

    /// Fast path. Memory + config only once the (rare) window rollover
    /// above has settled; no durable IO, no network.
    pub fn check_budget(&self, estimated_cost: Option<f64>) -> BudgetCheckResult {
        self.ensure_windows_current(Utc::now());
        let state = self.state.lock().unwrap();

        let projected_daily = state.daily_spend + estimated_cost.unwrap_or(0.0);
        let projected_hourly = state.hourly_spend + estimated_cost.unwrap_or(0.0);

        let per_request_breach = matches!(
            (estimated_cost, self.config.per_request_limit_usd),
            (Some(est), Some(limit)) if est >= limit
        );

        let breach_type = if per_request_breach {
            BreachType::PerRequest
        } else if projected_daily >= self.config.daily_limit_usd {
            BreachType::Daily
        } else if projected_hourly >= self.config.hourly_limit_usd {
            BreachType::Hourly
        } else {
            BreachType::None
        };

        let breached = breach_type != BreachType::None;
        let action = if breached { Some(self.config.on_breach) } else { None };
        let allowed = !(breached && self.config.on_breach == BreachAction::Block);

        let daily_pct = if self.config.daily_limit_usd > 0.0 {
            (state.daily_spend / self.config.daily_limit_usd) * 100.0
        } else {
            0.0
        };
        let thresholds_crossed: Vec<u32> = self
            .config
            .thresholds
            .iter()
            .copied()
            .filter(|&t| daily_pct >= t as f64 && !state.fired_thresholds.contains(&t))
            .collect();

        BudgetCheckResult {
            allowed,
            breached,
            breach_type,
            action,
            current_daily_spend: state.daily_spend,
            current_hourly_spend: state.hourly_spend,
            thresholds_crossed,
        }
    }

    /// Caller marks a threshold fired after successfully alerting on it,
    /// to suppress re-emission for the rest of the current daily window.
    pub fn mark_threshold_fired(&self, threshold: u32) {
        let mut state = self.state.lock().unwrap();
        state.fired_thresholds.insert(threshold);
    }

    /// The current daily-window budget utilization, 0-100+. Used by the
    /// auto-downgrade stage.
    pub fn daily_utilization_percent(&self) -> f64 {
        self.ensure_windows_current(Utc::now());
        let state = self.state.lock().unwrap();
        if self.config.daily_limit_usd > 0.0 {
            (state.daily_spend / self.config.daily_limit_usd) * 100.0
        } else {
            0.0
        }
    }

    /// Slow path: updates the in-memory cache synchronously (so the next
    /// check_budget call observes it immediately, on this process) and
    /// queues the record for the durable write-behind flush.
    pub fn record_spend(&self, amount_usd: f64, model: &str) {
        let now = Utc::now();
        self.ensure_windows_current(now);
        let record = {
            let mut state = self.state.lock().unwrap();
            state.daily_spend += amount_usd;
            state.hourly_spend += amount_usd;
            SpendRecord {
                amount_usd,
                model: model.to_string(),
                daily_window: state.daily_window.clone(),
                hourly_window: state.hourly_window.clone(),
                timestamp_ms: now.timestamp_millis(),
            }
        };
        self.pending.lock().unwrap().push(record);
    }

    /// Flushes all queued spend records to the durable append-only log.
    /// Called on a ~1s timer and synchronously on shutdown. A failure
    /// here degrades to memory-only operation for this batch; it never
    /// panics and never blocks a request.
    pub fn flush_durable(&self) {
        let batch = {
            let mut pending = self.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        if batch.is_empty() {
            return;
        }
        let file = OpenOptions::new().create(true).append(true).open(&self.durable_log_path);
        match file {
            Ok(mut file) => {
                for record in &batch {
                    if let Ok(line) = serde_json::to_string(record) {
                        let _ = writeln!(file, "{line}");
                    }
                }
                let _ = file.flush();
            }
            Err(e) => {
                tracing::warn!("budget durable log unreachable, continuing memory-only: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile_like::temp_log_path;

    mod tempfile_like {
        use std::path::PathBuf;
        use std::sync::atomic::{AtomicU64, Ordering};

        static COUNTER: AtomicU64 = AtomicU64::new(0);

        pub fn temp_log_path() -> PathBuf {
            let n = COUNTER.fetch_add(1, Ordering::Relaxed);
            std::env::temp_dir().join(format!("relayplane-budget-test-{}-{n}.jsonl", std::process::id()))
        }
    }

    #[test]
    fn allows_spend_under_limit() {
        let manager = BudgetManager::new(BudgetConfig::default(), temp_log_path());
        let result = manager.check_budget(Some(1.0));
        assert!(result.allowed);
        assert!(!result.breached);
    }

    #[test]
    fn blocks_when_estimated_cost_breaches_daily_limit() {
        let config = BudgetConfig { daily_limit_usd: 5.0, ..BudgetConfig::default() };
        let manager = BudgetManager::new(config, temp_log_path());
        let result = manager.check_budget(Some(10.0));
        assert!(!result.allowed);
        assert_eq!(result.breach_type, BreachType::Daily);
    }

    #[test]
    fn blocks_when_recorded_spend_exactly_hits_daily_limit() {
        let config = BudgetConfig { daily_limit_usd: 1.0, ..BudgetConfig::default() };
        let manager = BudgetManager::new(config, temp_log_path());
        manager.record_spend(1.00, "claude-3-5-sonnet-20241022");
        let result = manager.check_budget(None);
        assert!(!result.allowed, "spend exactly at the daily limit must block, not just spend over it");
        assert_eq!(result.breach_type, BreachType::Daily);
    }

    #[test]
    fn per_request_limit_breaches_before_daily_check() {
        let config = BudgetConfig {
            daily_limit_usd: 100.0,
            per_request_limit_usd: Some(2.0),
            ..BudgetConfig::default()
        };
        let manager = BudgetManager::new(config, temp_log_path());
        let result = manager.check_budget(Some(5.0));
        assert!(!result.allowed);
        assert_eq!(result.breach_type, BreachType::PerRequest);
    }

    #[test]
    fn no_per_request_limit_configured_falls_through_to_window_checks() {
        let manager = BudgetManager::new(BudgetConfig::default(), temp_log_path());
        let result = manager.check_budget(Some(1_000_000.0));
        assert_eq!(result.breach_type, BreachType::Daily);
    }

    #[test]
    fn warn_action_does_not_block() {
        let config = BudgetConfig {
            daily_limit_usd: 5.0,
            on_breach: BreachAction::Warn,
            ..BudgetConfig::default()
        };
        let manager = BudgetManager::new(config, temp_log_path());
        let result = manager.check_budget(Some(10.0));
        assert!(result.allowed, "warn action must not set allowed=false");
        assert!(result.breached);
    }

    #[test]
    fn record_spend_is_observed_by_next_check_budget() {
        let manager = BudgetManager::new(BudgetConfig::default(), temp_log_path());
        manager.record_spend(1.5, "claude-3-5-sonnet-20241022");
        let result = manager.check_budget(None);
        assert!((result.current_daily_spend - 1.5).abs() < 1e-9);
        assert!((result.current_hourly_spend - 1.5).abs() < 1e-9);
    }

    #[test]
    fn monotonicity_across_repeated_spends() {
        let manager = BudgetManager::new(BudgetConfig::default(), temp_log_path());
        let mut prev = 0.0;
        for _ in 0..5 {
            manager.record_spend(0.3, "gpt-4o");
            let result = manager.check_budget(None);
            assert!(result.current_daily_spend >= prev);
            prev = result.current_daily_spend;
        }
    }

    #[test]
    fn thresholds_crossed_once_per_window() {
        let config = BudgetConfig {
            daily_limit_usd: 10.0,
            thresholds: vec![50],
            ..BudgetConfig::default()
        };
        let manager = BudgetManager::new(config, temp_log_path());
        manager.record_spend(6.0, "gpt-4o");
        let result = manager.check_budget(None);
        assert_eq!(result.thresholds_crossed, vec![50]);
        manager.mark_threshold_fired(50);
        let result2 = manager.check_budget(None);
        assert!(result2.thresholds_crossed.is_empty(), "threshold should not re-fire this window");
    }

    #[test]
    fn flush_durable_writes_and_drains_pending() {
        let path = temp_log_path();
        let manager = BudgetManager::new(BudgetConfig::default(), path.clone());
        manager.record_spend(2.0, "claude-3-5-sonnet-20241022");
        manager.flush_durable();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        let _ = std::fs::remove_file(&path);
    }
}
