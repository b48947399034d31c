//! Server configuration from environment variables

use crate::access::is_valid_name;
use crate::runtime::Timeouts;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid AGENTGATE_API_KEYS entry '{0}': expected token=user[:role|role]")]
    MalformedKey(String),
    #[error("invalid user id '{0}' in AGENTGATE_API_KEYS")]
    InvalidUser(String),
    #[error("invalid role '{0}' in AGENTGATE_API_KEYS")]
    InvalidRole(String),
}

/// A credential to seed at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeySeed {
    pub token: String,
    pub user_id: String,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: String,
    pub api_keys: Vec<ApiKeySeed>,
    pub reasoner_url: Option<String>,
    pub tool_url: Option<String>,
    pub timeouts: Timeouts,
    /// Maximum cached answers; 0 disables caching
    pub cache_capacity: usize,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let db_path = var("AGENTGATE_DB_PATH").unwrap_or_else(|| {
            let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
            format!("{home}/.agentgate/agentgate.db")
        });
        let number = |key: &str, default: u64| {
            var(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };

        Ok(Self {
            port: var("AGENTGATE_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(8000),
            db_path,
            api_keys: parse_api_keys(&var("AGENTGATE_API_KEYS").unwrap_or_default())?,
            reasoner_url: var("AGENTGATE_REASONER_URL").filter(|u| !u.is_empty()),
            tool_url: var("AGENTGATE_TOOL_URL").filter(|u| !u.is_empty()),
            timeouts: Timeouts {
                reasoner: Duration::from_secs(number("AGENTGATE_REASONER_TIMEOUT_SECS", 120).max(1)),
                tool: Duration::from_secs(number("AGENTGATE_TOOL_TIMEOUT_SECS", 60).max(1)),
            },
            cache_capacity: usize::try_from(number("AGENTGATE_CACHE_CAPACITY", 1024))
                .unwrap_or(usize::MAX),
        })
    }
}

/// Parse `token=user[:role|role]` entries separated by `;`
pub fn parse_api_keys(value: &str) -> Result<Vec<ApiKeySeed>, ConfigError> {
    value
        .split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (token, rest) = entry
                .split_once('=')
                .filter(|(token, rest)| !token.is_empty() && !rest.is_empty())
                .ok_or_else(|| ConfigError::MalformedKey(entry.to_string()))?;
            // "::" is the namespace separator, never a user/role split
            if rest.contains("::") {
                return Err(ConfigError::InvalidUser(rest.to_string()));
            }
            let (user_id, roles) = rest.split_once(':').unwrap_or((rest, ""));
            if !is_valid_name(user_id) {
                return Err(ConfigError::InvalidUser(user_id.to_string()));
            }
            let roles = roles
                .split('|')
                .filter(|r| !r.is_empty())
                .map(|role| {
                    if is_valid_name(role) {
                        Ok(role.to_string())
                    } else {
                        Err(ConfigError::InvalidRole(role.to_string()))
                    }
                })
                .collect::<Result<_, _>>()?;
            Ok(ApiKeySeed {
                token: token.to_string(),
                user_id: user_id.to_string(),
                roles,
            })
        })
        .collect()
}
