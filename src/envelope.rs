// Normalized request envelope shared by every pipeline stage.
//
// Incoming Anthropic- and OpenAI-shaped bodies are parsed into this single
// tagged-union-ish representation; unrecognized/passthrough fields are kept
// in `raw` so the forwarding stage can round-trip anything the typed
// fields don't model. Cache-key canonicalization always runs over the
// typed subset below, never over `raw`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFamily {
    Anthropic,
    OpenAi,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    /// Kept as raw JSON since content can be a string or a content-block array.
    pub content: Value,
}

/// A normalized chat request. Constructed by `parse_request`, threaded
/// through every pipeline stage via `PipelineContext`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub request_id: String,
    pub family: ProviderFamily,
    pub model: String,
    pub messages: Vec<Message>,
    pub system: Option<Value>,
    pub tools: Option<Value>,
    pub tool_choice: Option<Value>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<f64>,
    pub max_tokens: Option<u64>,
    pub stop_sequences: Option<Value>,
    pub stream: bool,
    /// Everything else in the original body, preserved for passthrough.
    pub raw: Value,
}

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Monotonic, process-local, ULID-like request id: millis-since-epoch
/// concatenated with a per-process counter, so ids are strictly increasing
/// even when two requests land in the same millisecond.
pub fn generate_request_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let seq = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("req_{millis:013x}{seq:06x}")
}

#[derive(Debug)]
pub enum EnvelopeError {
    InvalidJson(String),
    MissingField(String),
    WrongType(String),
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeError::InvalidJson(e) => write!(f, "request body is not valid JSON: {e}"),
            EnvelopeError::MissingField(field) => write!(f, "missing required field '{field}'"),
            EnvelopeError::WrongType(field) => write!(f, "field '{field}' has the wrong type"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

/// Parse an Anthropic `/v1/messages` or OpenAI `/v1/chat/completions` body
/// into a normalized envelope. `family` is determined by which route the
/// request arrived on, not sniffed from the body.
pub fn parse_request(body: &[u8], family: ProviderFamily) -> Result<Envelope, EnvelopeError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| EnvelopeError::InvalidJson(e.to_string()))?;

    let obj = value.as_object().cloned().unwrap_or_default();

    let model = obj
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| EnvelopeError::MissingField("model".to_string()))?
        .to_string();

    let raw_messages = obj
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| EnvelopeError::MissingField("messages".to_string()))?;

    let mut messages = Vec::with_capacity(raw_messages.len());
    for m in raw_messages {
        let role = m
            .get("role")
            .and_then(Value::as_str)
            .ok_or_else(|| EnvelopeError::WrongType("messages[].role".to_string()))?
            .to_string();
        let content = m.get("content").cloned().unwrap_or(Value::Null);
        messages.push(Message { role, content });
    }

    let system = match family {
        ProviderFamily::Anthropic => obj.get("system").cloned(),
        ProviderFamily::OpenAi => None,
    };

    let stream = obj.get("stream").and_then(Value::as_bool).unwrap_or(false);

    Ok(Envelope {
        request_id: generate_request_id(),
        family,
        model,
        messages,
        system,
        tools: obj.get("tools").cloned(),
        tool_choice: obj.get("tool_choice").cloned(),
        temperature: obj.get("temperature").and_then(Value::as_f64),
        top_p: obj.get("top_p").and_then(Value::as_f64),
        top_k: obj.get("top_k").and_then(Value::as_f64),
        max_tokens: obj
            .get("max_tokens")
            .or_else(|| obj.get("max_completion_tokens"))
            .and_then(Value::as_u64),
        stop_sequences: obj.get("stop_sequences").or_else(|| obj.get("stop")).cloned(),
        stream,
        raw: value,
    })
}

impl Envelope {
    /// The text of the last user message, used by the classifier and by
    /// aggressive cache keying. Never looks at the system prompt.
    pub fn last_user_message_text(&self) -> String {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| content_to_text(&m.content))
            .unwrap_or_default()
    }

    /// Total rough token-length proxy across all messages (char count / 4),
    /// used only for classification heuristics, never for billing.
    pub fn approx_total_length(&self) -> usize {
        self.messages.iter().map(|m| content_to_text(&m.content).len()).sum()
    }

    pub fn has_tools(&self) -> bool {
        matches!(&self.tools, Some(Value::Array(a)) if !a.is_empty())
    }

    /// Re-point this envelope at a different model, e.g. after a downgrade
    /// or route decision. Mutates both the typed field and `raw` so the
    /// forwarded body matches.
    pub fn set_model(&mut self, model: impl Into<String>) {
        let model = model.into();
        if let Some(obj) = self.raw.as_object_mut() {
            obj.insert("model".to_string(), Value::String(model.clone()));
        }
        self.model = model;
    }
}

fn content_to_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}

/// SHA-256 hex digest of a canonical JSON value: keys sorted at every
/// object level, whitespace-free. Used by both cache keying modes.
pub fn sha256_hex_of_canonical(value: &Value) -> String {
    let canonical = canonicalize(value);
    let bytes = serde_json::to_vec(&canonical).expect("canonical value always serializes");
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(out, "{b:02x}").expect("writing to a String never fails");
    }
    out
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for k in keys {
                sorted.insert(k.clone(), canonicalize(&map[k]));
            }
            Value::Object(sorted)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
