//! Credentials live in a sibling file to the main config, never mixed in:
//! `~/.relayplane/credentials.json` next to `config.json`. Keeping them
//! separate means a config dump or a support bundle can include the
//! former without leaking the latter.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    /// model-name-prefix env var name -> API key, mirrors what
    /// `auth::env_var_for_model` would otherwise read from the process
    /// environment, for deployments that prefer a credentials file.
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
}

#[derive(Debug)]
pub enum CredentialsError {
    Read(std::io::Error),
    Parse(serde_json::Error),
}

impl std::fmt::Display for CredentialsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialsError::Read(e) => write!(f, "could not read credentials file: {e}"),
            CredentialsError::Parse(e) => write!(f, "credentials file is not valid JSON: {e}"),
        }
    }
}

impl std::error::Error for CredentialsError {}

impl Credentials {
    pub fn load(path: &Path) -> Result<Self, CredentialsError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).map_err(CredentialsError::Parse),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(CredentialsError::Read(e)),
        }
    }

    pub fn lookup(&self, env_var_name: &str) -> Option<&str> {
        self.api_keys.get(env_var_name).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_empty_credentials() {
        let creds = Credentials::load(Path::new("/nonexistent/relayplane/credentials.json")).unwrap();
        assert!(creds.api_keys.is_empty());
    }

    #[test]
    fn lookup_finds_configured_key() {
        let mut creds = Credentials::default();
        creds.api_keys.insert("OPENAI_API_KEY".to_string(), "sk-test".to_string());
        assert_eq!(creds.lookup("OPENAI_API_KEY"), Some("sk-test"));
        assert_eq!(creds.lookup("GEMINI_API_KEY"), None);
    }
}
