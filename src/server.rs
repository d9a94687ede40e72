//! HTTP surface: ingress routes that feed the orchestrator, plus read-only
//! telemetry views and runtime control endpoints. Grounded on
//! proxy/server.rs's axum `Router::new().route(...)` wiring style, cut
//! down to this proxy's fixed route table (no per-client dynamic routing).

use crate::auth::incoming_auth_from_headers;
use crate::envelope::ProviderFamily;
use crate::orchestrator;
use crate::state::Deps;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;

pub fn build_router(deps: Deps) -> Router {
    Router::new()
        .route("/v1/messages", post(anthropic_ingress))
        .route("/v1/chat/completions", post(openai_ingress))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/runs", get(runs))
        .route("/v1/telemetry/stats", get(stats))
        .route("/v1/telemetry/runs", get(runs))
        .route("/v1/telemetry/savings", get(savings))
        .route("/v1/telemetry/health", get(health))
        .route("/control/status", get(control_status))
        .route("/control/enable", post(control_enable))
        .route("/control/disable", post(control_disable))
        .route("/control/config", get(control_config))
        .route("/v1/mesh/stats", get(mesh_stats))
        .route("/v1/mesh/sync", post(mesh_sync))
        .with_state(deps)
}

/// Stashes the incoming credential onto the envelope's `raw` blob under a
/// key the orchestrator reads back before forwarding; envelopes don't
/// retain headers, so this is the one place headers cross into the body.
fn stamp_auth(mut body: serde_json::Value, headers: &HeaderMap) -> Vec<u8> {
    let incoming = incoming_auth_from_headers(headers);
    let stamped = match incoming {
        crate::auth::IncomingAuth::ApiKey(v) => json!({"kind": "api_key", "value": v}),
        crate::auth::IncomingAuth::OAuthToken(v) => json!({"kind": "oauth", "value": v}),
        crate::auth::IncomingAuth::Missing => json!({"kind": "missing", "value": ""}),
    };
    if let Some(obj) = body.as_object_mut() {
        obj.insert("__relayplane_auth".to_string(), stamped);
    }
    serde_json::to_vec(&body).unwrap_or_default()
}

async fn anthropic_ingress(State(deps): State<Deps>, headers: HeaderMap, body: Bytes) -> Response {
    let value: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return crate::error::ProxyError::input(e.to_string()).into_response(),
    };
    let stamped = stamp_auth(value, &headers);
    orchestrator::handle(deps, ProviderFamily::Anthropic, headers, Bytes::from(stamped)).await
}

async fn openai_ingress(State(deps): State<Deps>, headers: HeaderMap, body: Bytes) -> Response {
    let value: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return crate::error::ProxyError::input(e.to_string()).into_response(),
    };
    let stamped = stamp_auth(value, &headers);
    orchestrator::handle(deps, ProviderFamily::OpenAi, headers, Bytes::from(stamped)).await
}

async fn health(State(deps): State<Deps>) -> Response {
    Json(json!({
        "status": "ok",
        "uptimeSeconds": deps.uptime_seconds(),
        "enabled": deps.is_enabled(),
        "version": crate::config::VERSION,
    }))
    .into_response()
}

async fn stats(State(deps): State<Deps>) -> Response {
    let cache_stats = deps.cache.stats();
    Json(json!({
        "cache": {
            "hits": cache_stats.hits,
            "misses": cache_stats.misses,
            "bypasses": cache_stats.bypasses,
            "savedCostUsd": cache_stats.saved_cost_usd,
            "perModelHits": cache_stats.per_model_hits,
            "perTaskType": cache_stats.per_task_type,
            "memoryBytesUsed": deps.cache.memory_bytes_used(),
        },
        "budget": {
            "dailyUtilizationPercent": deps.budget.daily_utilization_percent(),
        },
    }))
    .into_response()
}

#[derive(Deserialize)]
struct RunsQuery {
    limit: Option<usize>,
}

async fn runs(State(deps): State<Deps>, Query(query): Query<RunsQuery>) -> Response {
    let limit = query.limit.unwrap_or(50).min(500);
    let recent = deps.alerts.recent(limit);
    Json(json!({ "alerts": recent, "ringSize": deps.anomaly.ring_len() })).into_response()
}

async fn savings(State(deps): State<Deps>) -> Response {
    let cache_stats = deps.cache.stats();
    Json(json!({ "savedCostUsd": cache_stats.saved_cost_usd, "cacheHits": cache_stats.hits })).into_response()
}

async fn control_status(State(deps): State<Deps>) -> Response {
    Json(json!({ "enabled": deps.is_enabled(), "uptimeSeconds": deps.uptime_seconds() })).into_response()
}

async fn control_enable(State(deps): State<Deps>) -> Response {
    deps.set_enabled(true);
    Json(json!({ "enabled": true })).into_response()
}

async fn control_disable(State(deps): State<Deps>) -> Response {
    deps.set_enabled(false);
    Json(json!({ "enabled": false })).into_response()
}

async fn control_config(State(deps): State<Deps>) -> Response {
    Json(json!({
        "bindAddr": deps.config.bind_addr.to_string(),
        "routerMode": crate::config::router_mode_name(&deps.config.router.mode),
        "cacheEnabled": deps.config.cache.enabled,
        "cacheMode": match deps.config.cache.mode {
            crate::cache::CacheMode::Exact => "exact",
            crate::cache::CacheMode::Aggressive => "aggressive",
        },
        "dailyLimitUsd": deps.config.budget.daily_limit_usd,
        "hourlyLimitUsd": deps.config.budget.hourly_limit_usd,
        "downgradeEnabled": deps.config.downgrade.enabled,
    }))
    .into_response()
}

/// Mesh multi-node sync is explicitly out of scope for this single-process
/// component; these two endpoints exist so a client built against the
/// mesh API doesn't hard-fail against a single-node deployment.
async fn mesh_stats() -> Response {
    Json(json!({ "peers": 0 })).into_response()
}

async fn mesh_sync() -> Response {
    axum::http::StatusCode::NO_CONTENT.into_response()
}

/// Router-level tests drive the real axum app with `tower::oneshot`
/// instead of calling handlers directly, so routing, extraction, and the
/// orchestrator's error-to-response mapping are all exercised together.
/// Every scenario here is chosen to resolve (cache hit, budget block,
/// all-providers-cooled) without an upstream call, since these tests run
/// with no network access.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::envelope::{parse_request, ProviderFamily};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use std::sync::atomic::{AtomicU64, Ordering};
    use tower::ServiceExt;

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_dir(label: &str) -> std::path::PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("relayplane-server-test-{label}-{}-{n}", std::process::id()))
    }

    fn test_config(label: &str) -> Config {
        let mut config = Config::default();
        let dir = temp_dir(label);
        config.log_dir = dir.join("logs");
        config.cache.disk_dir = dir.join("cache/responses");
        config.cache.index_path = dir.join("cache/index.db");
        config
    }

    fn anthropic_request_body() -> serde_json::Value {
        serde_json::json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [{"role": "user", "content": "hi there"}],
            "max_tokens": 100,
        })
    }

    fn post_messages(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/messages")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let deps = Deps::new(test_config("health")).unwrap();
        let app = build_router(deps);
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn exact_mode_cache_hit_never_reaches_upstream() {
        let config = test_config("cache-hit");
        let deps = Deps::new(config).unwrap();

        let body = anthropic_request_body();
        let envelope = parse_request(
            serde_json::to_vec(&body).unwrap().as_slice(),
            ProviderFamily::Anthropic,
        )
        .unwrap();
        let key = deps.cache.cache_key(&envelope);
        let cached_response = serde_json::json!({
            "id": "msg_cached",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-5-sonnet-20241022",
            "content": [{"type": "text", "text": "served from cache"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 5, "output_tokens": 3},
        });
        deps.cache.insert(
            &key,
            serde_json::to_vec(&cached_response).unwrap(),
            "claude-3-5-sonnet-20241022",
            "default",
            0.001,
        );

        let app = build_router(deps);
        let resp = app.oneshot(post_messages(body)).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("x-relayplane-cache").unwrap(), "hit");
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["content"][0]["text"], "served from cache");
    }

    #[tokio::test]
    async fn aggressive_mode_cache_key_ignores_conversation_history() {
        let mut config = test_config("cache-aggressive");
        config.cache.mode = crate::cache::CacheMode::Aggressive;
        let deps = Deps::new(config).unwrap();

        let short_history = serde_json::json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [{"role": "user", "content": "what's the weather like"}],
        });
        let long_history = serde_json::json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [
                {"role": "user", "content": "earlier unrelated question"},
                {"role": "assistant", "content": "earlier unrelated answer"},
                {"role": "user", "content": "what's the weather like"},
            ],
        });

        let short_envelope = parse_request(
            serde_json::to_vec(&short_history).unwrap().as_slice(),
            ProviderFamily::Anthropic,
        )
        .unwrap();
        let long_envelope = parse_request(
            serde_json::to_vec(&long_history).unwrap().as_slice(),
            ProviderFamily::Anthropic,
        )
        .unwrap();

        // Same model + same last user message => same aggressive key, even
        // though total conversation history differs.
        assert_eq!(deps.cache.cache_key(&short_envelope), deps.cache.cache_key(&long_envelope));

        let key = deps.cache.cache_key(&short_envelope);
        let cached_response = serde_json::json!({
            "id": "msg_cached",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-5-sonnet-20241022",
            "content": [{"type": "text", "text": "sunny today"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 5, "output_tokens": 3},
        });
        deps.cache.insert(
            &key,
            serde_json::to_vec(&cached_response).unwrap(),
            "claude-3-5-sonnet-20241022",
            "default",
            0.001,
        );

        let app = build_router(deps);
        let resp = app.oneshot(post_messages(long_history)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("x-relayplane-cache").unwrap(), "hit");
    }

    #[tokio::test]
    async fn budget_breach_blocks_before_any_upstream_call() {
        let mut config = test_config("budget-block");
        config.budget.daily_limit_usd = 1.0;
        let deps = Deps::new(config).unwrap();
        deps.budget.record_spend(5.0, "claude-3-5-sonnet-20241022");

        let app = build_router(deps);
        let resp = app.oneshot(post_messages(anthropic_request_body())).await.unwrap();

        assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["error"]["kind"], "policy");
    }

    #[tokio::test]
    async fn all_providers_cooled_returns_503_before_any_upstream_call() {
        let config = test_config("all-cooled");
        let deps = Deps::new(config).unwrap();
        for _ in 0..deps.config.cooldown.allowed_fails {
            deps.cooldown.record_failure("anthropic");
        }

        let app = build_router(deps);
        let resp = app.oneshot(post_messages(anthropic_request_body())).await.unwrap();

        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["error"]["kind"], "policy");
    }

    #[tokio::test]
    async fn malformed_body_is_a_400_input_error() {
        let deps = Deps::new(test_config("malformed")).unwrap();
        let app = build_router(deps);
        let req = Request::builder()
            .method("POST")
            .uri("/v1/messages")
            .header("content-type", "application/json")
            .body(Body::from("{ not json"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["error"]["kind"], "input");
    }

    #[tokio::test]
    async fn unrecognized_model_is_a_400_with_suggestions() {
        let deps = Deps::new(test_config("unrecognized-model")).unwrap();
        let app = build_router(deps);
        let body = serde_json::json!({
            "model": "claud-3-5-sonnet-20241022",
            "messages": [{"role": "user", "content": "hi"}],
        });
        let resp = app.oneshot(post_messages(body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["error"]["kind"], "input");
        assert!(json["error"]["suggestions"]
            .as_array()
            .unwrap()
            .iter()
            .any(|s| s == "claude-3-5-sonnet-20241022"));
    }

    #[tokio::test]
    async fn control_disable_then_enable_round_trips_status() {
        let deps = Deps::new(test_config("control")).unwrap();
        let app = build_router(deps);

        let resp = app
            .clone()
            .oneshot(Request::builder().method("POST").uri("/control/disable").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["enabled"], false);

        let resp = app
            .oneshot(Request::builder().uri("/control/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["enabled"], false);
    }
}
