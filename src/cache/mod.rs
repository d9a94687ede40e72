// Response cache: two keying modes (Exact, Aggressive) over three storage
// tiers (bounded in-memory LRU, on-disk gzip files, a durable index
// mapping key -> metadata). Lookup is memory -> index+disk -> promote to
// memory; insert writes all three tiers; eviction is memory-only (disk
// rows simply age out via the index, matching "disk file existence iff a
// non-expired index row exists").
//
// Grounded on other_examples/.../llm-response_cache.rs for the
// Mutex<HashMap> + TTL + LRU-by-last-accessed pattern (extended here from
// entry-count eviction to byte-budget eviction), and on
// provider_health.rs's atomic tmp-then-rename persistence for the index.

use crate::envelope::{sha256_hex_of_canonical, Envelope};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    Exact,
    Aggressive,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub mode: CacheMode,
    /// Exact mode only: bypass the cache when temperature > 0, since the
    /// response isn't deterministic. Aggressive mode ignores this
    /// entirely - it only ever bypasses when the cache is disabled.
    pub only_when_deterministic: bool,
    pub memory_budget_bytes: u64,
    pub exact_ttl_seconds: i64,
    pub aggressive_ttl_seconds: i64,
    pub task_type_ttl_overrides: HashMap<String, i64>,
    pub disk_dir: PathBuf,
    pub index_path: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: CacheMode::Exact,
            only_when_deterministic: true,
            memory_budget_bytes: 100 * 1024 * 1024,
            exact_ttl_seconds: 3600,
            aggressive_ttl_seconds: 1800,
            task_type_ttl_overrides: HashMap::new(),
            disk_dir: PathBuf::from("cache/responses"),
            index_path: PathBuf::from("cache/index.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntryMeta {
    pub model: String,
    pub task_type: String,
    pub cost_usd: f64,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
    pub hit_count: u64,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskTypeStat {
    pub hits: u64,
    pub entries: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelStat {
    pub hits: u64,
    pub entries: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub bypasses: u64,
    pub saved_cost_usd: f64,
    pub per_model_hits: HashMap<String, ModelStat>,
    pub per_task_type: HashMap<String, TaskTypeStat>,
}

struct MemEntry {
    bytes: Vec<u8>,
    meta: CacheEntryMeta,
    last_accessed: Instant,
}

pub struct CachedResponse {
    pub bytes: Vec<u8>,
    pub meta: CacheEntryMeta,
}

pub struct ResponseCache {
    config: CacheConfig,
    memory: Mutex<HashMap<String, MemEntry>>,
    memory_bytes: Mutex<u64>,
    index: Mutex<HashMap<String, CacheEntryMeta>>,
    stats: Mutex<CacheStats>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        let _ = std::fs::create_dir_all(&config.disk_dir);
        let index = load_index(&config.index_path);
        let cache = Self {
            config,
            memory: Mutex::new(HashMap::new()),
            memory_bytes: Mutex::new(0),
            index: Mutex::new(index),
            stats: Mutex::new(CacheStats::default()),
        };
        cache.prune_expired();
        cache
    }

    fn ttl_for(&self, task_type: &str) -> i64 {
        self.config
            .task_type_ttl_overrides
            .get(task_type)
            .copied()
            .unwrap_or(match self.config.mode {
                CacheMode::Exact => self.config.exact_ttl_seconds,
                CacheMode::Aggressive => self.config.aggressive_ttl_seconds,
            })
    }

    /// Whether this request should skip the cache entirely.
    pub fn should_bypass(&self, envelope: &Envelope) -> bool {
        if !self.config.enabled {
            return true;
        }
        match self.config.mode {
            // Aggressive mode ignores the determinism check; it never
            // bypasses on temperature, only on the cache being disabled.
            CacheMode::Aggressive => false,
            CacheMode::Exact => {
                self.config.only_when_deterministic && envelope.temperature.unwrap_or(0.0) > 0.0
            }
        }
    }

    /// Deterministic, total cache key for `envelope` under the
    /// configured mode.
    pub fn cache_key(&self, envelope: &Envelope) -> String {
        match self.config.mode {
            CacheMode::Exact => {
                let subset = serde_json::json!({
                    "max_tokens": envelope.max_tokens,
                    "messages": envelope.messages,
                    "model": envelope.model,
                    "stop_sequences": envelope.stop_sequences,
                    "system": envelope.system,
                    "temperature": envelope.temperature,
                    "tool_choice": envelope.tool_choice,
                    "tools": envelope.tools,
                    "top_k": envelope.top_k,
                    "top_p": envelope.top_p,
                });
                sha256_hex_of_canonical(&subset)
            }
            CacheMode::Aggressive => {
                let subset = serde_json::json!({
                    "model": envelope.model,
                    "system": envelope.system,
                    "tools": envelope.tools,
                    "last_user_message": envelope.last_user_message_text(),
                });
                sha256_hex_of_canonical(&subset)
            }
        }
    }

    /// memory -> index+disk -> promote to memory on disk hit.
    pub fn lookup(&self, key: &str) -> Option<CachedResponse> {
        if let Some(hit) = self.lookup_memory(key) {
            self.record_hit(&hit.meta);
            return Some(hit);
        }

        let meta = {
            let index = self.index.lock().unwrap();
            index.get(key).cloned()
        }?;

        let now = chrono::Utc::now().timestamp_millis();
        if meta.expires_at_ms <= now {
            self.evict_expired(key);
            self.record_miss();
            return None;
        }

        let path = self.disk_path(key);
        let Ok(compressed) = std::fs::read(&path) else {
            // Index row exists but disk file is gone - treat as miss and
            // drop the stale row rather than surfacing an error.
            self.evict_expired(key);
            self.record_miss();
            return None;
        };
        let Ok(bytes) = gunzip(&compressed) else {
            self.record_miss();
            return None;
        };

        let mut meta = meta;
        meta.hit_count += 1;
        {
            let mut index = self.index.lock().unwrap();
            index.insert(key.to_string(), meta.clone());
        }
        self.persist_index();
        self.promote_to_memory(key, bytes.clone(), meta.clone());
        self.record_hit(&meta);

        Some(CachedResponse { bytes, meta })
    }

    fn lookup_memory(&self, key: &str) -> Option<CachedResponse> {
        let mut memory = self.memory.lock().unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        let expired = memory.get(key).map(|e| e.meta.expires_at_ms <= now).unwrap_or(false);
        if expired {
            if let Some(entry) = memory.remove(key) {
                *self.memory_bytes.lock().unwrap() -= entry.bytes.len() as u64;
            }
            return None;
        }
        let entry = memory.get_mut(key)?;
        entry.last_accessed = Instant::now();
        entry.meta.hit_count += 1;
        Some(CachedResponse { bytes: entry.bytes.clone(), meta: entry.meta.clone() })
    }

    /// Writes to all three tiers: memory, disk (gzip), durable index.
    pub fn insert(&self, key: &str, bytes: Vec<u8>, model: &str, task_type: &str, cost_usd: f64) {
        let now = chrono::Utc::now().timestamp_millis();
        let ttl_ms = self.ttl_for(task_type) * 1000;
        let meta = CacheEntryMeta {
            model: model.to_string(),
            task_type: task_type.to_string(),
            cost_usd,
            created_at_ms: now,
            expires_at_ms: now + ttl_ms,
            hit_count: 0,
            size_bytes: bytes.len() as u64,
        };

        if let Ok(compressed) = gzip(&bytes) {
            let _ = std::fs::write(self.disk_path(key), compressed);
        }

        {
            let mut index = self.index.lock().unwrap();
            index.insert(key.to_string(), meta.clone());
        }
        self.persist_index();

        self.promote_to_memory(key, bytes, meta.clone());

        let mut stats = self.stats.lock().unwrap();
        stats.per_task_type.entry(task_type.to_string()).or_default().entries += 1;
        stats.per_model_hits.entry(model.to_string()).or_default().entries += 1;
    }

    fn promote_to_memory(&self, key: &str, bytes: Vec<u8>, meta: CacheEntryMeta) {
        let size = bytes.len() as u64;
        let mut memory = self.memory.lock().unwrap();
        let mut memory_bytes = self.memory_bytes.lock().unwrap();

        if let Some(old) = memory.remove(key) {
            *memory_bytes -= old.bytes.len() as u64;
        }

        while *memory_bytes + size > self.config.memory_budget_bytes && !memory.is_empty() {
            if let Some(lru_key) = memory
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| k.clone())
            {
                if let Some(evicted) = memory.remove(&lru_key) {
                    *memory_bytes -= evicted.bytes.len() as u64;
                }
            } else {
                break;
            }
        }

        if size <= self.config.memory_budget_bytes {
            memory.insert(key.to_string(), MemEntry { bytes, meta, last_accessed: Instant::now() });
            *memory_bytes += size;
        }
    }

    fn evict_expired(&self, key: &str) {
        self.index.lock().unwrap().remove(key);
        self.persist_index();
        let _ = std::fs::remove_file(self.disk_path(key));
        if let Some(entry) = self.memory.lock().unwrap().remove(key) {
            *self.memory_bytes.lock().unwrap() -= entry.bytes.len() as u64;
        }
    }

    /// Explicit cleanup pass: drop every index row (and its disk file)
    /// that has expired. Runs at startup and can be invoked on demand.
    pub fn prune_expired(&self) {
        let now = chrono::Utc::now().timestamp_millis();
        let expired_keys: Vec<String> = {
            let index = self.index.lock().unwrap();
            index.iter().filter(|(_, m)| m.expires_at_ms <= now).map(|(k, _)| k.clone()).collect()
        };
        for key in expired_keys {
            self.evict_expired(&key);
        }
    }

    fn record_hit(&self, meta: &CacheEntryMeta) {
        let mut stats = self.stats.lock().unwrap();
        stats.hits += 1;
        stats.saved_cost_usd += meta.cost_usd;
        stats.per_model_hits.entry(meta.model.clone()).or_default().hits += 1;
        stats.per_task_type.entry(meta.task_type.clone()).or_default().hits += 1;
    }

    fn record_miss(&self) {
        self.stats.lock().unwrap().misses += 1;
    }

    pub fn record_bypass(&self) {
        self.stats.lock().unwrap().bypasses += 1;
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.lock().unwrap().clone()
    }

    pub fn memory_bytes_used(&self) -> u64 {
        *self.memory_bytes.lock().unwrap()
    }

    fn disk_path(&self, key: &str) -> PathBuf {
        self.config.disk_dir.join(format!("{key}.gz"))
    }

    fn persist_index(&self) {
        let index = self.index.lock().unwrap();
        if let Ok(json) = serde_json::to_string(&*index) {
            let tmp_path = self.config.index_path.with_extension("tmp");
            if std::fs::write(&tmp_path, json).is_ok() {
                let _ = std::fs::rename(&tmp_path, &self.config.index_path);
            }
        }
    }
}

fn load_index(path: &PathBuf) -> HashMap<String, CacheEntryMeta> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

fn gunzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = flate2::read::GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
