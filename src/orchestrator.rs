//! The pipeline orchestrator: ingress -> cache -> budget -> anomaly ->
//! downgrade -> classify/route -> cooldown filter -> auth -> forward ->
//! cascade escalation -> response post-process. Every stage is a pure
//! function or a narrow method call on one `Deps` collaborator; this module
//! only sequences them and is the one place that's allowed to know the
//! full stage order.
//!
//! Grounded on proxy/state.rs's `SharedState`-threaded-through-handlers
//! shape and proxy/mod.rs's dispatch-then-forward flow, generalized from a
//! single-upstream passthrough into the full policy cascade this spec
//! describes. A panic inside any stage is caught here with
//! `AssertUnwindSafe` + `catch_unwind` so one bad request can't take the
//! process down or leave shared state half-updated.

use crate::auth::IncomingAuth;
use crate::downgrade::check_downgrade;
use crate::envelope::{parse_request, Envelope, ProviderFamily};
use crate::error::ProxyError;
use crate::provider::{candidate_providers, provider_for_model, WireFormat};
use crate::router::{resolve_initial_route, CascadeMachine, RouterMode};
use crate::state::Deps;
use crate::translation::{build_upstream_body, translate_response_body};
use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use std::panic::AssertUnwindSafe;

const BYPASS_HEADER: &str = "x-relayplane-bypass";

pub async fn handle(deps: Deps, family: ProviderFamily, headers: HeaderMap, body: Bytes) -> Response {
    let fut = AssertUnwindSafe(run(deps, family, headers, body));
    match futures::FutureExt::catch_unwind(fut).await {
        Ok(result) => result.unwrap_or_else(IntoResponse::into_response),
        Err(_) => ProxyError::internal("panic in request pipeline".to_string()).into_response(),
    }
}

async fn run(deps: Deps, family: ProviderFamily, headers: HeaderMap, body: Bytes) -> Result<Response, ProxyError> {
    let mut envelope = parse_request(&body, family)
        .map_err(|e| ProxyError::input(e.to_string()))?;
    let requested_model = envelope.model.clone();
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let bypass = headers
        .get(BYPASS_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if bypass || !deps.is_enabled() {
        let resp = forward_once(&deps, &envelope, user_agent.as_deref()).await?;
        return Ok(finish_response(resp, &requested_model, &requested_model, "bypass", false, None, 0, &deps.config.router.mode));
    }

    let route = resolve_initial_route(&requested_model, &deps.config.router, &envelope);
    envelope.set_model(route.model.clone());

    if deps.config.router.mode != RouterMode::Cascade && !crate::provider::is_recognized_model(&envelope.model) {
        let suggestions = crate::error::suggest_models(&envelope.model, crate::provider::known_model_names())
            .into_iter()
            .map(str::to_string)
            .collect();
        return Err(ProxyError::input_with_suggestions(
            format!("unrecognized model '{}'", envelope.model),
            suggestions,
        ));
    }

    if envelope.stream {
        // Streaming responses are forwarded as opaque bytes; cache/anomaly
        // post-processing need a complete body and are skipped for them.
        let resolved_model = envelope.model.clone();
        let resp = forward_once(&deps, &envelope, user_agent.as_deref()).await?;
        return Ok(finish_response(resp, &requested_model, &resolved_model, "miss", false, None, 0, &deps.config.router.mode));
    }

    let cache_bypass = deps.cache.should_bypass(&envelope);
    let cache_key = deps.cache.cache_key(&envelope);
    if cache_bypass {
        deps.cache.record_bypass();
    } else if let Some(cached) = deps.cache.lookup(&cache_key) {
        let body: Value = serde_json::from_slice(&cached.bytes).unwrap_or(Value::Null);
        let out = translate_response_body(&body, provider_for_model(&envelope.model).format, family);
        let resp = (StatusCode::OK, axum::Json(out)).into_response();
        return Ok(finish_response(resp, &requested_model, &envelope.model, "hit", false, None, 0, &deps.config.router.mode));
    }

    let budget_check = deps.budget.check_budget(Some(estimate_request_cost(&envelope)));
    if !budget_check.allowed {
        deps.alerts.fire_breach(
            "budget_blocked",
            serde_json::json!({"dailySpend": budget_check.current_daily_spend, "hourlySpend": budget_check.current_hourly_spend}),
        );
        return Err(ProxyError::budget_blocked("daily or hourly budget limit reached".to_string()));
    }
    for threshold in &budget_check.thresholds_crossed {
        deps.budget.mark_threshold_fired(*threshold);
        deps.alerts.fire_threshold(
            *threshold,
            serde_json::json!({"dailySpend": budget_check.current_daily_spend}),
        );
    }

    let budget_percent = deps.budget.daily_utilization_percent();
    let downgrade = check_downgrade(&envelope.model, budget_percent, &deps.config.downgrade);
    if downgrade.downgraded {
        envelope.set_model(downgrade.new_model.clone());
    }

    let (status, resp_value, resp_bytes, escalations) = if deps.config.router.mode == RouterMode::Cascade {
        run_cascade(&deps, &mut envelope, user_agent.as_deref()).await?
    } else {
        let providers = candidate_providers(&envelope.model);
        if deps.cooldown.filter_available(&providers).is_empty() {
            return Err(ProxyError::all_cooled(format!(
                "all providers for '{}' are cooling down",
                envelope.model
            )));
        }
        let single = forward_and_decode(&deps, &envelope, user_agent.as_deref()).await?;
        (single.0, single.1, single.2, 0)
    };

    let resolved_model = envelope.model.clone();
    let cost = estimate_cost(&resolved_model, &resp_value);
    deps.budget.record_spend(cost, &resolved_model);

    let task_type = resp_value
        .get("task_type")
        .and_then(Value::as_str)
        .unwrap_or("default")
        .to_string();
    if !cache_bypass && status.is_success() {
        deps.cache.insert(&cache_key, resp_bytes.clone(), &resolved_model, &task_type, cost);
    }

    let findings = deps.anomaly.record_and_analyze(crate::anomaly::TraceEntry {
        timestamp_ms: chrono::Utc::now().timestamp_millis(),
        model: resolved_model.clone(),
        tokens_in: estimate_tokens_in(&resp_value),
        tokens_out: estimate_tokens_out(&resp_value),
        cost_usd: cost,
    });
    for finding in findings {
        deps.alerts.fire_anomaly(
            anomaly_kind_name(&finding.kind),
            alert_severity_from_anomaly(finding.severity),
            finding.data.clone(),
        );
    }

    let out = translate_response_body(&resp_value, provider_for_model(&resolved_model).format, family);
    let resp = (status, axum::Json(out)).into_response();
    Ok(finish_response(
        resp,
        &requested_model,
        &resolved_model,
        if cache_bypass { "bypass" } else { "miss" },
        downgrade.downgraded,
        downgrade.downgraded.then(|| downgrade.reason.clone()),
        escalations,
        &deps.config.router.mode,
    ))
}

async fn run_cascade(deps: &Deps, envelope: &mut Envelope, user_agent: Option<&str>) -> Result<(StatusCode, Value, Vec<u8>, u32), ProxyError> {
    let models = deps.config.router.cascade_models.clone();
    let mut cascade = CascadeMachine::new(&models, deps.config.router.max_escalations);
    cascade.begin_forwarding();

    loop {
        let model = cascade.current_model().unwrap_or(&envelope.model).to_string();
        envelope.set_model(model.clone());

        let providers = candidate_providers(&model);
        if deps.cooldown.filter_available(&providers).is_empty() {
            return Err(ProxyError::all_cooled(format!("all providers for '{model}' are cooling down")));
        }

        match forward_and_decode(deps, envelope, user_agent).await {
            Ok((status, value, bytes)) => {
                let text = extract_response_text(&value);
                if crate::router::should_escalate(Some(&text), false) && cascade.try_escalate() {
                    cascade.begin_forwarding();
                    continue;
                }
                cascade.complete();
                return Ok((status, value, bytes, cascade.escalations_used()));
            }
            Err(e) => {
                for provider in &providers {
                    deps.cooldown.record_failure(provider);
                }
                if crate::router::should_escalate(None, true) && cascade.try_escalate() {
                    cascade.begin_forwarding();
                    continue;
                }
                return Err(e);
            }
        }
    }
}

async fn forward_and_decode(deps: &Deps, envelope: &Envelope, user_agent: Option<&str>) -> Result<(StatusCode, Value, Vec<u8>), ProxyError> {
    let resp = forward_once(deps, envelope, user_agent).await?;
    let (parts, body) = resp.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| ProxyError::internal(format!("reading upstream response body: {e}")))?;
    let value: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);

    let providers = candidate_providers(&envelope.model);
    if parts.status.is_success() {
        for provider in &providers {
            deps.cooldown.record_success(provider);
        }
    } else if parts.status.is_server_error() {
        for provider in &providers {
            deps.cooldown.record_failure(provider);
        }
    }

    Ok((parts.status, value, bytes.to_vec()))
}

/// A single upstream call: resolve auth, build the wire body, POST, return
/// the raw upstream response unmodified for the caller to decode or stream.
async fn forward_once(deps: &Deps, envelope: &Envelope, user_agent: Option<&str>) -> Result<Response, ProxyError> {
    let incoming = incoming_auth_for(envelope);
    let provider = provider_for_model(&envelope.model);
    let resolved_auth = deps.auth.resolve(&incoming, &envelope.model)?;

    let upstream_body = build_upstream_body(envelope, provider.format);

    let mut request = deps
        .http
        .post(provider.base_url)
        .header("content-type", "application/json")
        .header(&resolved_auth.header_name, &resolved_auth.header_value);
    if provider.format == WireFormat::Anthropic {
        request = request.header("anthropic-version", "2023-06-01");
    }
    if let Some(ua) = user_agent {
        request = request.header("user-agent", ua);
    }

    let upstream_resp = request
        .json(&upstream_body)
        .send()
        .await
        .map_err(|e| ProxyError::upstream(None, format!("upstream request failed: {e}")))?;

    let status = StatusCode::from_u16(upstream_resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let bytes = upstream_resp
        .bytes()
        .await
        .map_err(|e| ProxyError::upstream(Some(status), format!("reading upstream body: {e}")))?;

    Ok((status, bytes).into_response())
}

/// Auth is resolved from the envelope's own family headers captured at
/// parse time; since `Envelope` doesn't retain headers, callers upstream of
/// this module stash the incoming credential on `raw` under a private key
/// before the envelope reaches here. See `server.rs` for where that's set.
fn incoming_auth_for(envelope: &Envelope) -> IncomingAuth {
    match envelope.raw.get("__relayplane_auth") {
        Some(Value::Object(map)) => {
            let kind = map.get("kind").and_then(Value::as_str).unwrap_or("");
            let value = map.get("value").and_then(Value::as_str).unwrap_or("").to_string();
            match kind {
                "api_key" => IncomingAuth::ApiKey(value),
                "oauth" => IncomingAuth::OAuthToken(value),
                _ => IncomingAuth::Missing,
            }
        }
        _ => IncomingAuth::Missing,
    }
}

fn extract_response_text(value: &Value) -> String {
    if let Some(blocks) = value.get("content").and_then(Value::as_array) {
        return blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("");
    }
    value
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

fn estimate_tokens_in(value: &Value) -> u32 {
    value
        .pointer("/usage/input_tokens")
        .or_else(|| value.pointer("/usage/prompt_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32
}

fn estimate_tokens_out(value: &Value) -> u32 {
    value
        .pointer("/usage/output_tokens")
        .or_else(|| value.pointer("/usage/completion_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32
}

/// Pre-flight cost estimate for the budget manager's optional per-request
/// check, computed before anything has been forwarded: input tokens from a
/// char/4 proxy over the envelope, output tokens capped at the request's own
/// `max_tokens` (or a conservative default when the caller didn't set one).
/// Superseded by the real `usage`-derived cost once a response comes back.
fn estimate_request_cost(envelope: &Envelope) -> f64 {
    let input_tokens = (envelope.approx_total_length() / 4) as u32;
    let output_tokens = envelope.max_tokens.unwrap_or(4096) as u32;
    crate::pricing::calculate_cost(&envelope.model, input_tokens, output_tokens, 0, 0)
}

fn estimate_cost(model: &str, value: &Value) -> f64 {
    let input = estimate_tokens_in(value);
    let output = estimate_tokens_out(value);
    let cache_creation = value
        .pointer("/usage/cache_creation_input_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    let cache_read = value
        .pointer("/usage/cache_read_input_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    crate::pricing::calculate_cost(model, input, output, cache_creation, cache_read)
}

fn anomaly_kind_name(kind: &crate::anomaly::AnomalyKind) -> &'static str {
    match kind {
        crate::anomaly::AnomalyKind::TokenExplosion => "token_explosion",
        crate::anomaly::AnomalyKind::VelocitySpike => "velocity_spike",
        crate::anomaly::AnomalyKind::Repetition => "repetition",
        crate::anomaly::AnomalyKind::CostAcceleration => "cost_acceleration",
    }
}

fn alert_severity_from_anomaly(severity: crate::anomaly::Severity) -> crate::alerts::AlertSeverity {
    match severity {
        crate::anomaly::Severity::Info => crate::alerts::AlertSeverity::Info,
        crate::anomaly::Severity::Warning => crate::alerts::AlertSeverity::Warning,
        crate::anomaly::Severity::Critical => crate::alerts::AlertSeverity::Critical,
    }
}

fn finish_response(
    mut resp: Response,
    original_model: &str,
    routed_model: &str,
    cache_status: &str,
    downgraded: bool,
    downgrade_reason: Option<String>,
    escalations: u32,
    mode: &RouterMode,
) -> Response {
    let headers = resp.headers_mut();
    insert_header(headers, "x-relayplane-original-model", original_model);
    insert_header(headers, "x-relayplane-routed-model", routed_model);
    insert_header(headers, "x-relayplane-cache", cache_status);
    insert_header(headers, "x-relayplane-escalations", &escalations.to_string());
    insert_header(headers, "x-relayplane-mode", crate::config::router_mode_name(mode));
    if downgraded {
        insert_header(headers, "x-relayplane-downgraded", "true");
        if let Some(reason) = downgrade_reason {
            insert_header(headers, "x-relayplane-downgrade-reason", &reason);
        }
    }
    resp
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(v) = HeaderValue::from_str(value) {
        headers.insert(name, v);
    }
}
