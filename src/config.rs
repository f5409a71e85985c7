use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Переменная окружения с путём к JSON конфигу.
pub const CONFIG_ENV: &str = "P2PCALL_CONFIG";

pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

/// Один ICE сервер.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String,
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Какие локальные треки предлагает новый endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct LocalMedia {
    pub audio: bool,
    pub video: bool,
}

impl Default for LocalMedia {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Backoff для merge-записей в запись звонка.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    #[serde(alias = "maxAttempts")]
    pub max_attempts: u32,
    #[serde(alias = "initialBackoffMs")]
    pub initial_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 50,
        }
    }
}

impl RetryPolicy {
    /// Задержка перед повтором номер `attempt` (с 1), каждый раз вдвое больше.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(factor))
    }
}

/// Конфигурация участника звонка.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CallConfig {
    #[serde(alias = "iceServers")]
    pub ice_servers: Vec<ServerConfig>,
    #[serde(alias = "localMedia")]
    pub local_media: LocalMedia,
    pub retry: RetryPolicy,
    #[serde(alias = "gracePeriodSecs")]
    pub grace_period_secs: u64,
    #[serde(alias = "logFilter")]
    pub log_filter: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            local_media: LocalMedia::default(),
            retry: RetryPolicy::default(),
            grace_period_secs: 10,
            log_filter: "info".into(),
        }
    }
}

fn default_ice_servers() -> Vec<ServerConfig> {
    DEFAULT_STUN_SERVERS
        .iter()
        .enumerate()
        .map(|(i, url)| ServerConfig {
            id: format!("default-stun-{}", i + 1),
            r#type: "stun".into(),
            url: (*url).into(),
            username: None,
            credential: None,
        })
        .collect()
}

impl CallConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Читает файл из `P2PCALL_CONFIG`, без переменной берутся значения по умолчанию.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for server in &self.ice_servers {
            if server.url.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    reason: format!("ICE server {} has an empty url", server.id),
                });
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::Invalid {
                    reason: format!("TURN server {} requires username and credential", server.id),
                });
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                reason: "retry.max_attempts must be at least 1".into(),
            });
        }
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}
