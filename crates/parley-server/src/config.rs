use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Secrets that ship in examples and must never guard a real deployment.
const PLACEHOLDER_SECRETS: &[&str] = &["dev-secret-change-me", "change-me", "secret"];

const DEFAULT_AI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_AI_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("PARLEY_JWT_SECRET must be set")]
    MissingSecret,

    #[error("PARLEY_JWT_SECRET is a placeholder value; set a real secret")]
    PlaceholderSecret,

    #[error("{name} is not valid: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub ai: AiConfig,
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub context_limit: u32,
    pub system_prompt: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let jwt_secret = var("PARLEY_JWT_SECRET").ok_or(ConfigError::MissingSecret)?;
        if PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            return Err(ConfigError::PlaceholderSecret);
        }

        let host = var("PARLEY_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port = var("PARLEY_PORT").unwrap_or_else(|| "3000".into());
        let addr_text = format!("{}:{}", host, port);
        let addr = addr_text.parse().map_err(|_| ConfigError::Invalid {
            name: "PARLEY_HOST/PARLEY_PORT",
            value: addr_text.clone(),
        })?;

        let context_limit = match var("PARLEY_AI_CONTEXT_LIMIT") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                name: "PARLEY_AI_CONTEXT_LIMIT",
                value: raw.clone(),
            })?,
            None => parley_gateway::assistant::DEFAULT_CONTEXT_LIMIT,
        };

        Ok(Self {
            addr,
            db_path: PathBuf::from(var("PARLEY_DB_PATH").unwrap_or_else(|| "parley.db".into())),
            jwt_secret,
            ai: AiConfig {
                api_key: var("PARLEY_AI_API_KEY"),
                base_url: var("PARLEY_AI_BASE_URL").unwrap_or_else(|| DEFAULT_AI_BASE_URL.into()),
                model: var("PARLEY_AI_MODEL").unwrap_or_else(|| DEFAULT_AI_MODEL.into()),
                context_limit,
                system_prompt: var("PARLEY_AI_SYSTEM_PROMPT"),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn secret_is_required_and_not_a_placeholder() {
        assert_eq!(load(&[]).unwrap_err(), ConfigError::MissingSecret);
        assert_eq!(
            load(&[("PARLEY_JWT_SECRET", "dev-secret-change-me")]).unwrap_err(),
            ConfigError::PlaceholderSecret
        );
    }

    #[test]
    fn defaults_apply() {
        let config = load(&[("PARLEY_JWT_SECRET", "s3cr3t-value")]).unwrap();
        assert_eq!(config.addr.port(), 3000);
        assert_eq!(config.db_path, PathBuf::from("parley.db"));
        assert_eq!(config.ai.model, DEFAULT_AI_MODEL);
        assert_eq!(config.ai.context_limit, 20);
        assert!(config.ai.api_key.is_none());
    }

    #[test]
    fn bad_numbers_are_reported() {
        let err = load(&[
            ("PARLEY_JWT_SECRET", "s3cr3t-value"),
            ("PARLEY_AI_CONTEXT_LIMIT", "lots"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "PARLEY_AI_CONTEXT_LIMIT", .. }));
    }
}
