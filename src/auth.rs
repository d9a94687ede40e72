// Auth resolver - the exact decision table from the component design:
//
//   API key (provider-native)        -> any model            : pass through
//   OAuth/"Max" token -> OAuth-supporting model                : pass through as Authorization Bearer
//   OAuth/"Max" token -> non-OAuth model                        : use configured env API key, 401 if absent
//
// Grounded on config/routing.rs's AuthMethod/ProviderAuth::resolve_key/
// build_header, generalized from per-provider config to the two-shape
// incoming-auth contract the routing spec requires.

use crate::config::Credentials;
use crate::error::ProxyError;
use std::collections::HashMap;

/// The shape of the credential the client presented.
#[derive(Debug, Clone)]
pub enum IncomingAuth {
    /// A provider-native API key (x-api-key or Authorization: Bearer sk-...).
    ApiKey(String),
    /// An OAuth access token, i.e. a "Max"/subscription-style token.
    OAuthToken(String),
    /// No credential was presented at all.
    Missing,
}

/// A resolved set of headers to attach to the forwarded request. Never
/// includes the original provider API key in anything that flows back to
/// the client.
#[derive(Debug, Clone)]
pub struct ResolvedAuth {
    pub header_name: String,
    pub header_value: String,
}

/// Maps model name prefixes to the environment variable holding that
/// family's API key, per the recognized env vars in the external
/// interfaces section.
pub fn env_var_for_model(model: &str) -> &'static str {
    let m = model.to_ascii_lowercase();
    if m.starts_with("claude") {
        "ANTHROPIC_API_KEY"
    } else if m.starts_with("gpt") || m.starts_with("o1") || m.starts_with("o3") {
        "OPENAI_API_KEY"
    } else if m.starts_with("gemini") {
        "GEMINI_API_KEY"
    } else if m.starts_with("grok") {
        "XAI_API_KEY"
    } else if m.starts_with("deepseek") {
        "DEEPSEEK_API_KEY"
    } else if m.starts_with("llama") || m.starts_with("mixtral") {
        "GROQ_API_KEY"
    } else if m.starts_with("kimi") || m.starts_with("moonshot") {
        "MOONSHOT_API_KEY"
    } else if m.contains('/') {
        // "vendor/model" shaped names (OpenRouter-style aggregator ids).
        "OPENROUTER_API_KEY"
    } else {
        "ANTHROPIC_API_KEY"
    }
}

/// Which models accept an OAuth/subscription ("Max") token directly.
/// The Max plan's OAuth grant only covers Anthropic's Sonnet/Opus tier;
/// Haiku is excluded even though it's a first-party Claude model, so a
/// Haiku request presenting an OAuth token must fall back to an
/// explicit API key instead of forwarding the token as-is.
pub fn model_supports_oauth(model: &str) -> bool {
    let m = model.to_ascii_lowercase();
    m.starts_with("claude") && !m.contains("haiku")
}

pub struct AuthResolver {
    /// Overrides for env_var_for_model, keyed by lowercase model prefix.
    /// Populated from provider config at startup; falls back to the
    /// built-in table above when a model has no override.
    env_overrides: HashMap<String, String>,
    /// File-based fallback for the env vars in `env_var_for_model`, read
    /// once at startup from `credentials.json`, for deployments that'd
    /// rather not set per-provider env vars directly.
    credentials: Credentials,
}

impl AuthResolver {
    pub fn new(env_overrides: HashMap<String, String>) -> Self {
        Self { env_overrides, credentials: Credentials::default() }
    }

    pub fn with_credentials(env_overrides: HashMap<String, String>, credentials: Credentials) -> Self {
        Self { env_overrides, credentials }
    }

    fn env_var_for(&self, model: &str) -> String {
        let lower = model.to_ascii_lowercase();
        for (prefix, env_var) in &self.env_overrides {
            if lower.starts_with(prefix.as_str()) {
                return env_var.clone();
            }
        }
        env_var_for_model(model).to_string()
    }

    /// Resolve the header to forward for this (incoming auth, target model)
    /// pair, per the exact 4-case contract:
    ///
    /// 1. API key -> any model: pass the client's key through unchanged.
    /// 2. OAuth token -> OAuth-capable model: pass the token through as
    ///    `Authorization: Bearer {token}`.
    /// 3. OAuth token -> non-OAuth model: look up the configured env key
    ///    for that model's family; 401 if it isn't set.
    /// 4. Missing credential: 401.
    pub fn resolve(&self, incoming: &IncomingAuth, target_model: &str) -> Result<ResolvedAuth, ProxyError> {
        match incoming {
            IncomingAuth::ApiKey(key) => Ok(ResolvedAuth {
                header_name: "x-api-key".to_string(),
                header_value: key.clone(),
            }),
            IncomingAuth::OAuthToken(token) => {
                if model_supports_oauth(target_model) {
                    Ok(ResolvedAuth {
                        header_name: "authorization".to_string(),
                        header_value: format!("Bearer {token}"),
                    })
                } else {
                    let env_var = self.env_var_for(target_model);
                    let from_env = std::env::var(&env_var).ok().filter(|k| !k.is_empty());
                    let from_file = self.credentials.lookup(&env_var).map(str::to_string);
                    match from_env.or(from_file) {
                        Some(key) => Ok(ResolvedAuth {
                            header_name: "x-api-key".to_string(),
                            header_value: key,
                        }),
                        None => Err(ProxyError::auth(format!(
                            "model '{target_model}' does not accept OAuth/Max credentials and no \
                             API key is configured via {env_var}; set {env_var} or route this \
                             model through an OAuth-supporting alias"
                        ))),
                    }
                }
            }
            IncomingAuth::Missing => Err(ProxyError::auth(
                "no credential presented: set an API key or authenticate via OAuth".to_string(),
            )),
        }
    }
}

/// Anthropic's "Max"/subscription OAuth tokens are shaped
/// `sk-ant-oat...` and travel in the same `x-api-key` header slot as a
/// provider-native key, so the header name alone doesn't disambiguate -
/// the value's shape does.
fn looks_like_oauth_token(value: &str) -> bool {
    value.starts_with("sk-ant-oat") || value.contains("-oat-")
}

/// Extract the incoming auth shape from request headers, checking
/// `x-api-key` first (provider-native, unless shaped like an OAuth
/// token), then `Authorization: Bearer` (always treated as OAuth).
pub fn incoming_auth_from_headers(headers: &axum::http::HeaderMap) -> IncomingAuth {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return if looks_like_oauth_token(key) {
            IncomingAuth::OAuthToken(key.to_string())
        } else {
            IncomingAuth::ApiKey(key.to_string())
        };
    }
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return IncomingAuth::OAuthToken(token.to_string());
        }
    }
    IncomingAuth::Missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue};

    fn resolver() -> AuthResolver {
        AuthResolver::new(HashMap::new())
    }

    #[test]
    fn api_key_passes_through_for_any_model() {
        let incoming = IncomingAuth::ApiKey("sk-ant-real-key".to_string());
        let resolved = resolver().resolve(&incoming, "gpt-4o").unwrap();
        assert_eq!(resolved.header_value, "sk-ant-real-key");
    }

    #[test]
    fn oauth_token_passes_through_for_oauth_capable_model() {
        let incoming = IncomingAuth::OAuthToken("oauth-max-token".to_string());
        let resolved = resolver()
            .resolve(&incoming, "claude-3-5-sonnet-20241022")
            .unwrap();
        assert_eq!(resolved.header_name, "authorization");
        assert_eq!(resolved.header_value, "Bearer oauth-max-token");
    }

    #[test]
    fn oauth_token_falls_back_to_env_key_for_non_oauth_model() {
        std::env::set_var("OPENAI_API_KEY", "sk-from-env");
        let incoming = IncomingAuth::OAuthToken("oauth-max-token".to_string());
        let resolved = resolver().resolve(&incoming, "gpt-4o").unwrap();
        assert_eq!(resolved.header_name, "x-api-key");
        assert_eq!(resolved.header_value, "sk-from-env");
        std::env::remove_var("OPENAI_API_KEY");
    }

    #[test]
    fn oauth_token_falls_back_to_credentials_file_when_env_var_unset() {
        std::env::remove_var("OPENAI_API_KEY");
        let mut creds = Credentials::default();
        creds.api_keys.insert("OPENAI_API_KEY".to_string(), "sk-from-file".to_string());
        let resolver = AuthResolver::with_credentials(HashMap::new(), creds);
        let incoming = IncomingAuth::OAuthToken("oauth-max-token".to_string());
        let resolved = resolver.resolve(&incoming, "gpt-4o").unwrap();
        assert_eq!(resolved.header_value, "sk-from-file");
    }

    #[test]
    fn env_var_takes_precedence_over_credentials_file() {
        std::env::set_var("OPENAI_API_KEY", "sk-from-env");
        let mut creds = Credentials::default();
        creds.api_keys.insert("OPENAI_API_KEY".to_string(), "sk-from-file".to_string());
        let resolver = AuthResolver::with_credentials(HashMap::new(), creds);
        let incoming = IncomingAuth::OAuthToken("oauth-max-token".to_string());
        let resolved = resolver.resolve(&incoming, "gpt-4o").unwrap();
        assert_eq!(resolved.header_value, "sk-from-env");
        std::env::remove_var("OPENAI_API_KEY");
    }

    #[test]
    fn oauth_token_401s_for_non_oauth_model_without_env_key() {
        std::env::remove_var("OPENAI_API_KEY");
        let incoming = IncomingAuth::OAuthToken("oauth-max-token".to_string());
        let err = resolver().resolve(&incoming, "gpt-4o").unwrap_err();
        assert!(matches!(err, ProxyError::Auth(_)));
    }

    #[test]
    fn missing_credential_is_401() {
        let err = resolver().resolve(&IncomingAuth::Missing, "claude-3-5-sonnet-20241022").unwrap_err();
        assert!(matches!(err, ProxyError::Auth(_)));
    }

    #[test]
    fn extracts_api_key_header_first() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-ant-1"));
        headers.insert("authorization", HeaderValue::from_static("Bearer oauth-1"));
        match incoming_auth_from_headers(&headers) {
            IncomingAuth::ApiKey(k) => assert_eq!(k, "sk-ant-1"),
            other => panic!("expected ApiKey, got {other:?}"),
        }
    }

    #[test]
    fn oauth_shaped_x_api_key_is_recognized_as_oauth() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-ant-oat-01-abc123"));
        match incoming_auth_from_headers(&headers) {
            IncomingAuth::OAuthToken(t) => assert_eq!(t, "sk-ant-oat-01-abc123"),
            other => panic!("expected OAuthToken, got {other:?}"),
        }
    }

    /// Scenario 6: an OAuth ("Max") token presented via `x-api-key`,
    /// targeting `claude-haiku-4-5` - a Claude model but not one the Max
    /// OAuth grant covers - with the env key set, must forward the env
    /// key rather than the OAuth token; without it, 401.
    #[test]
    fn oauth_x_api_key_targeting_haiku_uses_env_key_not_oauth_token() {
        std::env::set_var("ANTHROPIC_API_KEY", "sk-ant-env-key");
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-ant-oat-01-abc123"));
        let incoming = incoming_auth_from_headers(&headers);
        assert!(matches!(incoming, IncomingAuth::OAuthToken(_)));
        let resolved = resolver().resolve(&incoming, "claude-haiku-4-5").unwrap();
        assert_eq!(resolved.header_name, "x-api-key");
        assert_eq!(resolved.header_value, "sk-ant-env-key");
        std::env::remove_var("ANTHROPIC_API_KEY");
    }

    #[test]
    fn oauth_x_api_key_targeting_haiku_401s_without_env_key() {
        std::env::remove_var("ANTHROPIC_API_KEY");
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-ant-oat-01-abc123"));
        let incoming = incoming_auth_from_headers(&headers);
        let err = resolver().resolve(&incoming, "claude-haiku-4-5").unwrap_err();
        assert!(matches!(err, ProxyError::Auth(_)));
    }

    #[test]
    fn oauth_token_passes_through_for_sonnet_but_not_haiku() {
        assert!(model_supports_oauth("claude-sonnet-4-6"));
        assert!(model_supports_oauth("claude-opus-4-6"));
        assert!(!model_supports_oauth("claude-haiku-4-5"));
    }
}
