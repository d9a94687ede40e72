// Crate-wide error taxonomy, generalized from the old three-variant
// proxy::error::ProxyError into the five kinds the routing pipeline needs:
// Input, Auth, Policy, Upstream, Internal.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;

/// Errors surfaced to the HTTP boundary. Every pipeline stage returns one
/// of these (or a raw anyhow::Error for ambient plumbing that gets mapped
/// to Internal at the handler boundary).
#[derive(Debug)]
pub enum ProxyError {
    /// Malformed or invalid request body/fields. Maps to 400.
    Input { message: String, suggestions: Vec<String> },
    /// Credential mismatch or missing credential. Maps to 401.
    Auth(String),
    /// Budget block or all-providers-cooled. Maps to 402-style or 503.
    Policy { message: String, kind: PolicyKind },
    /// Upstream provider returned an error or timed out.
    Upstream { status: Option<StatusCode>, message: String },
    /// Anything else - sanitized before leaving the process.
    Internal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    BudgetBlocked,
    AllProvidersCooled,
}

impl ProxyError {
    pub fn input(message: impl Into<String>) -> Self {
        ProxyError::Input { message: message.into(), suggestions: Vec::new() }
    }

    pub fn input_with_suggestions(message: impl Into<String>, suggestions: Vec<String>) -> Self {
        ProxyError::Input { message: message.into(), suggestions }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        ProxyError::Auth(message.into())
    }

    pub fn budget_blocked(message: impl Into<String>) -> Self {
        ProxyError::Policy { message: message.into(), kind: PolicyKind::BudgetBlocked }
    }

    pub fn all_cooled(message: impl Into<String>) -> Self {
        ProxyError::Policy { message: message.into(), kind: PolicyKind::AllProvidersCooled }
    }

    pub fn upstream(status: Option<StatusCode>, message: impl Into<String>) -> Self {
        ProxyError::Upstream { status, message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ProxyError::Internal(message.into())
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    kind: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    suggestions: Vec<&'a str>,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, kind, message, suggestions) = match &self {
            ProxyError::Input { message, suggestions } => (
                StatusCode::BAD_REQUEST,
                "input",
                message.clone(),
                suggestions.iter().map(String::as_str).collect::<Vec<_>>(),
            ),
            ProxyError::Auth(message) => {
                (StatusCode::UNAUTHORIZED, "auth", message.clone(), Vec::new())
            }
            ProxyError::Policy { message, kind } => {
                let status = match kind {
                    PolicyKind::BudgetBlocked => StatusCode::PAYMENT_REQUIRED,
                    PolicyKind::AllProvidersCooled => StatusCode::SERVICE_UNAVAILABLE,
                };
                (status, "policy", message.clone(), Vec::new())
            }
            ProxyError::Upstream { status, message } => (
                status.unwrap_or(StatusCode::BAD_GATEWAY),
                "upstream",
                message.clone(),
                Vec::new(),
            ),
            ProxyError::Internal(message) => {
                tracing::error!("internal error: {message}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "an internal error occurred".to_string(),
                    Vec::new(),
                )
            }
        };

        let body = ErrorBody { error: ErrorDetail { kind, message: &message, suggestions } };
        (status, Json(json!(body))).into_response()
    }
}

impl From<anyhow::Error> for ProxyError {
    fn from(err: anyhow::Error) -> Self {
        ProxyError::Internal(err.to_string())
    }
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyError::Input { message, .. } => write!(f, "input error: {message}"),
            ProxyError::Auth(message) => write!(f, "auth error: {message}"),
            ProxyError::Policy { message, .. } => write!(f, "policy error: {message}"),
            ProxyError::Upstream { message, .. } => write!(f, "upstream error: {message}"),
            ProxyError::Internal(message) => write!(f, "internal error: {message}"),
        }
    }
}

impl std::error::Error for ProxyError {}

/// Levenshtein distance, used to suggest known model names on Input errors.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (n, m) = (a.len(), b.len());
    let mut row: Vec<usize> = (0..=m).collect();

    for i in 1..=n {
        let mut prev = row[0];
        row[0] = i;
        for j in 1..=m {
            let tmp = row[j];
            row[j] = if a[i - 1] == b[j - 1] {
                prev
            } else {
                1 + prev.min(row[j]).min(row[j - 1])
            };
            prev = tmp;
        }
    }
    row[m]
}

/// Suggest known model names within edit distance 4 of the given name.
pub fn suggest_models<'a>(unknown: &str, known: &[&'a str]) -> Vec<&'a str> {
    let mut scored: Vec<(usize, &str)> = known
        .iter()
        .map(|&name| (levenshtein(unknown, name), name))
        .filter(|(dist, _)| *dist <= 4)
        .collect();
    scored.sort_by_key(|(dist, _)| *dist);
    scored.into_iter().map(|(_, name)| name).take(3).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levenshtein_identical() {
        assert_eq!(levenshtein("abc", "abc"), 0);
    }

    #[test]
    fn levenshtein_typo() {
        assert_eq!(levenshtein("claude-3-5-sonet", "claude-3-5-sonnet"), 1);
    }

    #[test]
    fn suggest_models_filters_by_distance() {
        let known = ["claude-3-5-sonnet-20241022", "gpt-4o", "gemini-1.5-pro"];
        let suggestions = suggest_models("claude-3-5-sonet-20241022", &known);
        assert_eq!(suggestions, vec!["claude-3-5-sonnet-20241022"]);
    }

    #[test]
    fn suggest_models_empty_when_nothing_close() {
        let known = ["claude-3-5-sonnet-20241022"];
        let suggestions = suggest_models("totally-unrelated-string-here", &known);
        assert!(suggestions.is_empty());
    }
}
