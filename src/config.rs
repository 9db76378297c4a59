// Runtime configuration for the call core.
// Every field has a default, so an empty JSON object is a valid config.

use crate::codec::DEFAULT_MAX_DECOMPRESSED;
use crate::error::ConfigError;
use crate::peer::types::ServerConfig;
use crate::utils::add_ice_url_scheme;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Environment variable pointing at a JSON config file.
pub const CONFIG_ENV: &str = "CALLMESH_CONFIG";

static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
});

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub ice_servers: Vec<ServerConfig>,
    pub ice_candidate_pool_size: u8,
    /// How long a disconnected link may try to recover before it is dropped.
    pub grace_period_secs: u64,
    /// Unanswered outbound calls are hung up after this long. 0 disables.
    pub ring_timeout_secs: u64,
    /// Upper bound for a decompressed signal payload.
    pub max_payload_bytes: u64,
    pub command_buffer: usize,
    /// Default `env_logger` filter when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            ice_candidate_pool_size: 10,
            grace_period_secs: 10,
            ring_timeout_secs: 45,
            max_payload_bytes: DEFAULT_MAX_DECOMPRESSED,
            command_buffer: 32,
            log_filter: "info".into(),
        }
    }
}

impl CallConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Loads the file named by `CALLMESH_CONFIG`, or defaults when unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_payload_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "max_payload_bytes",
                reason: "must be positive",
            });
        }
        for server in &self.ice_servers {
            if server.url.trim().is_empty() {
                return Err(ConfigError::InvalidIceServer {
                    id: server.id.clone(),
                    reason: "url cannot be empty",
                });
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::InvalidIceServer {
                    id: server.id.clone(),
                    reason: "TURN servers require username and credential",
                });
            }
        }
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn ring_timeout(&self) -> Option<Duration> {
        (self.ring_timeout_secs > 0).then(|| Duration::from_secs(self.ring_timeout_secs))
    }

    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers
            .iter()
            .map(|config| RTCIceServer {
                urls: vec![add_ice_url_scheme(config)],
                username: config.username.clone().unwrap_or_default(),
                credential: config.credential.clone().unwrap_or_default(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gives_defaults() {
        let config = CallConfig::from_json("{}").unwrap();
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.grace_period(), Duration::from_secs(10));
        assert_eq!(config.ring_timeout(), Some(Duration::from_secs(45)));
        assert_eq!(config.max_payload_bytes, 256 * 1024);
    }

    #[test]
    fn zero_ring_timeout_disables_it() {
        let config = CallConfig::from_json(r#"{"ring_timeout_secs": 0}"#).unwrap();
        assert_eq!(config.ring_timeout(), None);
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let err = CallConfig::from_json(
            r#"{"ice_servers": [{"id": "relay", "type": "turn", "url": "relay.example.org:3478",
                "username": null, "credential": null}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidIceServer { ref id, .. } if id == "relay"));
    }

    #[test]
    fn empty_url_is_rejected() {
        let err = CallConfig::from_json(
            r#"{"ice_servers": [{"id": "x", "type": "stun", "url": " ",
                "username": null, "credential": null}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidIceServer { .. }));
    }

    #[test]
    fn payload_limit_must_be_positive() {
        let err = CallConfig::from_json(r#"{"max_payload_bytes": 0}"#).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "max_payload_bytes",
                ..
            }
        ));
        assert!(CallConfig::from_json(&format!(r#"{{"max_payload_bytes": {}}}"#, u64::MAX)).is_ok());
    }

    #[test]
    fn rtc_servers_get_schemes_and_credentials() {
        let config = CallConfig::from_json(
            r#"{"ice_servers": [{"id": "relay", "type": "turn", "url": "relay.example.org:3478",
                "username": "u", "credential": "p"}]}"#,
        )
        .unwrap();
        let servers = config.rtc_ice_servers();
        assert_eq!(servers[0].urls, vec!["turn:relay.example.org:3478".to_string()]);
        assert_eq!(servers[0].username, "u");
        assert_eq!(servers[0].credential, "p");
    }
}
