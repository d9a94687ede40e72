// Anomaly detector: a bounded 100-entry trace ring plus four independent
// detectors (token explosion, velocity spike, repetition/agent-loop, cost
// acceleration), all run over a rolling time window on every
// `record_and_analyze` call. The ring mutates only there.
//
// Grounded on provider_health.rs's MAX_FALLBACK_EVENTS ring-trim idiom
// (push then drain the overflow from the front) for the trace ring, and
// on pricing.rs's cost math for the token-explosion check.

use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

const TRACE_RING_CAPACITY: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub timestamp_ms: i64,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    TokenExplosion,
    VelocitySpike,
    Repetition,
    CostAcceleration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyFinding {
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub message: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct AnomalyConfig {
    pub window_seconds: i64,
    pub token_explosion_usd: f64,
    pub velocity_count_threshold: usize,
    pub velocity_rate_multiplier: f64,
    pub repetition_threshold: usize,
    pub cost_accel_min_entries: usize,
    pub cost_accel_multiplier: f64,
    pub cost_accel_min_second_half_usd: f64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            window_seconds: 300,
            token_explosion_usd: 5.0,
            velocity_count_threshold: 40,
            velocity_rate_multiplier: 10.0,
            repetition_threshold: 20,
            cost_accel_min_entries: 10,
            cost_accel_multiplier: 2.0,
            cost_accel_min_second_half_usd: 1.0,
        }
    }
}

pub struct AnomalyDetector {
    config: AnomalyConfig,
    ring: Mutex<VecDeque<TraceEntry>>,
    /// (model, rounded token bucket) pairs already emitted for the
    /// repetition detector, so the agent-loop alert fires once, not on
    /// every subsequent call past the threshold.
    repetition_emitted: Mutex<HashSet<(String, u32)>>,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig) -> Self {
        Self {
            config,
            ring: Mutex::new(VecDeque::with_capacity(TRACE_RING_CAPACITY)),
            repetition_emitted: Mutex::new(HashSet::new()),
        }
    }

    /// Pushes `entry` onto the ring (trimming to 100), then runs all four
    /// detectors over the current window. The ring only changes here.
    pub fn record_and_analyze(&self, entry: TraceEntry) -> Vec<AnomalyFinding> {
        let window_entries = {
            let mut ring = self.ring.lock().unwrap();
            ring.push_back(entry.clone());
            while ring.len() > TRACE_RING_CAPACITY {
                ring.pop_front();
            }
            let cutoff = entry.timestamp_ms - self.config.window_seconds * 1000;
            ring.iter().filter(|e| e.timestamp_ms >= cutoff).cloned().collect::<Vec<_>>()
        };

        let mut findings = Vec::new();
        findings.extend(self.check_token_explosion(&entry));
        findings.extend(self.check_velocity_spike(&window_entries));
        findings.extend(self.check_repetition(&window_entries));
        findings.extend(self.check_cost_acceleration(&window_entries));
        findings
    }

    fn check_token_explosion(&self, entry: &TraceEntry) -> Option<AnomalyFinding> {
        if entry.cost_usd > self.config.token_explosion_usd {
            Some(AnomalyFinding {
                kind: AnomalyKind::TokenExplosion,
                severity: Severity::Critical,
                message: format!(
                    "single request cost ${:.2} exceeded ${:.2}",
                    entry.cost_usd, self.config.token_explosion_usd
                ),
                data: serde_json::json!({"model": entry.model, "cost_usd": entry.cost_usd}),
            })
        } else {
            None
        }
    }

    fn check_velocity_spike(&self, window: &[TraceEntry]) -> Option<AnomalyFinding> {
        let count = window.len();
        if count < self.config.velocity_count_threshold {
            return None;
        }

        // Baseline: average count per minute-bucket over up to 60 buckets
        // spanning the window, excluding the most recent partial minute.
        let mut buckets: std::collections::HashMap<i64, usize> = std::collections::HashMap::new();
        for e in window {
            let bucket = e.timestamp_ms / 60_000;
            *buckets.entry(bucket).or_insert(0) += 1;
        }
        let bucket_count = buckets.len().min(60).max(1);
        let baseline = buckets.values().sum::<usize>() as f64 / bucket_count as f64;
        let current_bucket = window.last().map(|e| e.timestamp_ms / 60_000);
        let current_rate = current_bucket.and_then(|b| buckets.get(&b)).copied().unwrap_or(0) as f64;

        let rate_spike = baseline > 0.0 && current_rate > baseline * self.config.velocity_rate_multiplier;

        Some(AnomalyFinding {
            kind: AnomalyKind::VelocitySpike,
            severity: Severity::Warning,
            message: if rate_spike {
                format!("request rate {current_rate:.0}/min is over {}x baseline {baseline:.1}/min", self.config.velocity_rate_multiplier)
            } else {
                format!("{count} requests within the anomaly window (threshold {})", self.config.velocity_count_threshold)
            },
            data: serde_json::json!({"count": count, "baseline_per_min": baseline, "rate_spike": rate_spike}),
        })
    }

    fn check_repetition(&self, window: &[TraceEntry]) -> Vec<AnomalyFinding> {
        let mut buckets: std::collections::HashMap<(String, u32), usize> = std::collections::HashMap::new();
        for e in window {
            let total = e.tokens_in + e.tokens_out;
            let rounded = ((total as f64 / 100.0).round() * 100.0) as u32;
            *buckets.entry((e.model.clone(), rounded)).or_insert(0) += 1;
        }

        let mut findings = Vec::new();
        let mut emitted = self.repetition_emitted.lock().unwrap();
        for (key, count) in buckets {
            if count >= self.config.repetition_threshold && !emitted.contains(&key) {
                emitted.insert(key.clone());
                findings.push(AnomalyFinding {
                    kind: AnomalyKind::Repetition,
                    severity: Severity::Critical,
                    message: format!(
                        "{} calls to {} with ~{} total tokens - possible agent loop",
                        count, key.0, key.1
                    ),
                    data: serde_json::json!({"model": key.0, "token_bucket": key.1, "count": count}),
                });
            }
        }
        findings
    }

    fn check_cost_acceleration(&self, window: &[TraceEntry]) -> Option<AnomalyFinding> {
        if window.len() < self.config.cost_accel_min_entries {
            return None;
        }
        let mid = window.len() / 2;
        let (first_half, second_half) = window.split_at(mid);

        let rate = |half: &[TraceEntry]| -> (f64, f64) {
            let cost: f64 = half.iter().map(|e| e.cost_usd).sum();
            let duration_ms = match (half.first(), half.last()) {
                (Some(f), Some(l)) => (l.timestamp_ms - f.timestamp_ms).max(1) as f64,
                _ => 1.0,
            };
            (cost, cost / (duration_ms / 1000.0))
        };

        let (first_cost, first_rate) = rate(first_half);
        let (second_cost, second_rate) = rate(second_half);
        let _ = first_cost;

        if second_rate > first_rate * self.config.cost_accel_multiplier
            && second_cost > self.config.cost_accel_min_second_half_usd
        {
            Some(AnomalyFinding {
                kind: AnomalyKind::CostAcceleration,
                severity: Severity::Warning,
                message: format!(
                    "spend rate accelerated from ${first_rate:.4}/s to ${second_rate:.4}/s"
                ),
                data: serde_json::json!({"first_rate_per_s": first_rate, "second_rate_per_s": second_rate, "second_half_cost_usd": second_cost}),
            })
        } else {
            None
        }
    }

    /// Number of entries currently held in the ring, for tests/telemetry.
    pub fn ring_len(&self) -> usize {
        self.ring.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ts: i64, model: &str, tokens_in: u32, tokens_out: u32, cost: f64) -> TraceEntry {
        TraceEntry { timestamp_ms: ts, model: model.to_string(), tokens_in, tokens_out, cost_usd: cost }
    }

    #[test]
    fn ring_never_exceeds_capacity() {
        let detector = AnomalyDetector::new(AnomalyConfig::default());
        for i in 0..150 {
            detector.record_and_analyze(entry(i * 1000, "claude-3-5-sonnet-20241022", 10, 10, 0.01));
        }
        assert_eq!(detector.ring_len(), TRACE_RING_CAPACITY);
    }

    #[test]
    fn token_explosion_fires_above_threshold() {
        let detector = AnomalyDetector::new(AnomalyConfig::default());
        let findings = detector.record_and_analyze(entry(0, "claude-3-opus-20240229", 100, 100, 6.0));
        assert!(findings.iter().any(|f| f.kind == AnomalyKind::TokenExplosion));
    }

    #[test]
    fn no_token_explosion_below_threshold() {
        let detector = AnomalyDetector::new(AnomalyConfig::default());
        let findings = detector.record_and_analyze(entry(0, "claude-3-5-haiku-20241022", 100, 100, 0.02));
        assert!(!findings.iter().any(|f| f.kind == AnomalyKind::TokenExplosion));
    }

    #[test]
    fn repetition_fires_at_threshold_and_only_once() {
        let config = AnomalyConfig { repetition_threshold: 20, ..AnomalyConfig::default() };
        let detector = AnomalyDetector::new(config);
        let mut last_findings = Vec::new();
        for i in 0..20 {
            last_findings = detector.record_and_analyze(entry(i * 100, "claude-3-5-sonnet-20241022", 500, 500, 0.01));
        }
        assert!(last_findings.iter().any(|f| f.kind == AnomalyKind::Repetition), "should fire on the 20th call");

        // A 21st identical call must not re-fire it.
        let findings_21 = detector.record_and_analyze(entry(2100, "claude-3-5-sonnet-20241022", 500, 500, 0.01));
        assert!(!findings_21.iter().any(|f| f.kind == AnomalyKind::Repetition), "must emit once, not every call");
    }

    #[test]
    fn cost_acceleration_needs_minimum_entries() {
        let detector = AnomalyDetector::new(AnomalyConfig::default());
        for i in 0..5 {
            let findings = detector.record_and_analyze(entry(i * 1000, "gpt-4o", 10, 10, 10.0));
            assert!(!findings.iter().any(|f| f.kind == AnomalyKind::CostAcceleration));
        }
    }

    #[test]
    fn cost_acceleration_fires_when_second_half_much_pricier() {
        let config = AnomalyConfig { cost_accel_min_entries: 10, ..AnomalyConfig::default() };
        let detector = AnomalyDetector::new(config);
        let mut findings = Vec::new();
        // First half: cheap, spread over 10s. Second half: much pricier, same cadence.
        for i in 0..5 {
            findings = detector.record_and_analyze(entry(i * 2000, "gpt-4o", 10, 10, 0.01));
        }
        for i in 5..10 {
            findings = detector.record_and_analyze(entry(i as i64 * 2000, "gpt-4o", 10, 10, 2.0));
        }
        assert!(findings.iter().any(|f| f.kind == AnomalyKind::CostAcceleration));
    }

    #[test]
    fn detectors_are_independent_and_aggregate() {
        let detector = AnomalyDetector::new(AnomalyConfig::default());
        // A single very expensive call should only trigger token explosion,
        // not spuriously trigger the others.
        let findings = detector.record_and_analyze(entry(0, "claude-3-opus-20240229", 100, 100, 50.0));
        assert_eq!(findings.iter().filter(|f| f.kind == AnomalyKind::TokenExplosion).count(), 1);
        assert!(!findings.iter().any(|f| f.kind == AnomalyKind::VelocitySpike));
    }
}
