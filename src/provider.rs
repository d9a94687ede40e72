// Static provider registry: model-prefix -> upstream base URL + wire format.
// Grounded on config/routing.rs's ProviderConfig (base_url + ApiFormat), cut
// down from its fully user-configurable client/provider table to the fixed
// set the routing pipeline needs to pick an upstream for a resolved model.

use crate::envelope::ProviderFamily;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Anthropic,
    OpenAi,
}

#[derive(Debug, Clone, Copy)]
pub struct Provider {
    pub name: &'static str,
    pub base_url: &'static str,
    pub format: WireFormat,
}

const ANTHROPIC: Provider = Provider {
    name: "anthropic",
    base_url: "https://api.anthropic.com/v1/messages",
    format: WireFormat::Anthropic,
};
const OPENAI: Provider = Provider {
    name: "openai",
    base_url: "https://api.openai.com/v1/chat/completions",
    format: WireFormat::OpenAi,
};
const GOOGLE: Provider = Provider {
    name: "google",
    base_url: "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions",
    format: WireFormat::OpenAi,
};
const XAI: Provider = Provider {
    name: "xai",
    base_url: "https://api.x.ai/v1/chat/completions",
    format: WireFormat::OpenAi,
};
const DEEPSEEK: Provider = Provider {
    name: "deepseek",
    base_url: "https://api.deepseek.com/v1/chat/completions",
    format: WireFormat::OpenAi,
};
const GROQ: Provider = Provider {
    name: "groq",
    base_url: "https://api.groq.com/openai/v1/chat/completions",
    format: WireFormat::OpenAi,
};
const MOONSHOT: Provider = Provider {
    name: "moonshot",
    base_url: "https://api.moonshot.cn/v1/chat/completions",
    format: WireFormat::OpenAi,
};
const OPENROUTER: Provider = Provider {
    name: "openrouter",
    base_url: "https://openrouter.ai/api/v1/chat/completions",
    format: WireFormat::OpenAi,
};

/// Which upstream provider serves a given model name, by prefix, mirroring
/// `auth::env_var_for_model`'s family split (the two must stay in sync -
/// the provider determines where a request goes, the env var determines
/// what credential authenticates it).
pub fn provider_for_model(model: &str) -> Provider {
    let m = model.to_ascii_lowercase();
    if m.starts_with("claude") {
        ANTHROPIC
    } else if m.starts_with("gpt") || m.starts_with("o1") || m.starts_with("o3") {
        OPENAI
    } else if m.starts_with("gemini") {
        GOOGLE
    } else if m.starts_with("grok") {
        XAI
    } else if m.starts_with("deepseek") {
        DEEPSEEK
    } else if m.starts_with("llama") || m.starts_with("mixtral") {
        GROQ
    } else if m.starts_with("kimi") || m.starts_with("moonshot") {
        MOONSHOT
    } else if m.contains('/') {
        OPENROUTER
    } else {
        ANTHROPIC
    }
}

/// Whether `model` matches one of the recognized family prefixes above,
/// as opposed to falling through to the Anthropic default because its
/// shape doesn't match anything known. Used by the model-name-resolution
/// stage to decide whether an unrecognized name warrants a 400 with
/// suggestions rather than being silently forwarded.
pub fn is_recognized_model(model: &str) -> bool {
    let m = model.to_ascii_lowercase();
    m.starts_with("claude")
        || m.starts_with("gpt")
        || m.starts_with("o1")
        || m.starts_with("o3")
        || m.starts_with("gemini")
        || m.starts_with("grok")
        || m.starts_with("deepseek")
        || m.starts_with("llama")
        || m.starts_with("mixtral")
        || m.starts_with("kimi")
        || m.starts_with("moonshot")
        || m.contains('/')
}

/// A small corpus of canonical, currently-shipping model ids per family,
/// used only to generate Levenshtein-based suggestions for an
/// unrecognized model name - not an allowlist (any name matching a known
/// prefix is accepted regardless of whether it's in this list).
pub fn known_model_names() -> &'static [&'static str] {
    &[
        "claude-opus-4-20250514",
        "claude-sonnet-4-20250514",
        "claude-haiku-4-20250514",
        "claude-3-5-sonnet-20241022",
        "claude-3-5-haiku-20241022",
        "claude-3-opus-20240229",
        "gpt-4o",
        "gpt-4o-mini",
        "o1",
        "o1-mini",
        "o3",
        "gemini-1.5-pro",
        "gemini-1.5-flash",
        "grok-2",
        "deepseek-chat",
        "llama-3.1-70b",
        "mixtral-8x7b",
        "kimi-k1",
        "moonshot-v1",
    ]
}

/// The candidate provider names for cooldown/routing purposes. Today each
/// model maps to exactly one provider (no multi-backend fanout per model),
/// so this is a single-element list, but the cooldown filter is written
/// against a list so "all providers for a requested model are cooled ->
/// 503" holds without assuming cardinality 1.
pub fn candidate_providers(model: &str) -> Vec<String> {
    vec![provider_for_model(model).name.to_string()]
}

impl From<WireFormat> for ProviderFamily {
    fn from(f: WireFormat) -> Self {
        match f {
            WireFormat::Anthropic => ProviderFamily::Anthropic,
            WireFormat::OpenAi => ProviderFamily::OpenAi,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_models_route_to_anthropic() {
        assert_eq!(provider_for_model("claude-sonnet-4-20250514").name, "anthropic");
    }

    #[test]
    fn gpt_models_route_to_openai() {
        assert_eq!(provider_for_model("gpt-4o").name, "openai");
    }

    #[test]
    fn vendor_slash_model_routes_to_openrouter() {
        assert_eq!(provider_for_model("mistralai/mixtral-8x7b").name, "openrouter");
    }

    #[test]
    fn unknown_bare_name_falls_back_to_anthropic() {
        assert_eq!(provider_for_model("some-custom-model").name, "anthropic");
    }

    #[test]
    fn recognized_model_prefixes_are_flagged_as_such() {
        assert!(is_recognized_model("claude-3-5-sonnet-20241022"));
        assert!(is_recognized_model("gpt-4o"));
        assert!(is_recognized_model("mistralai/mixtral-8x7b"));
        assert!(!is_recognized_model("claud-3-5-sonnet-20241022"));
        assert!(!is_recognized_model("totally-unrelated-string"));
    }
}
