//! Process configuration, read from `TRICHTER_*` environment variables.
//!
//! | Variable                       | Default          |
//! |--------------------------------|------------------|
//! | `TRICHTER_HTTP_ADDR`           | `0.0.0.0:3000`   |
//! | `TRICHTER_WS_ADDR`             | `0.0.0.0:3001` (empty disables) |
//! | `TRICHTER_SOFT_LISTENER_LIMIT` | `50`             |
//! | `TRICHTER_HARD_LISTENER_LIMIT` | `10000` (`0` or `none` disables) |
//! | `TRICHTER_KEEPALIVE_SECS`      | `15` (`0` disables) |
//! | `TRICHTER_INGEST_USER`         | unset            |
//! | `TRICHTER_INGEST_PASSWORD`     | unset            |
//! | `TRICHTER_SESSIONS`            | empty            |
//!
//! Sessions are `token=id:username:Display Name:role` entries separated by
//! `;`. Without both ingest variables every device upload is refused.

use std::time::Duration;

use thiserror::Error;
use trichter_live::{BusConfig, IngestCredentials, Role, StaticSessions, StreamConfig, Viewer};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var}: invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("TRICHTER_SESSIONS entry {entry:?}: {reason}")]
    Session { entry: String, reason: String },
    #[error("{0} is set without its counterpart")]
    Incomplete(&'static str),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http_addr: String,
    /// WebSocket fan-out address; `None` serves SSE only
    pub ws_addr: Option<String>,
    pub bus: BusConfig,
    pub stream: StreamConfig,
    pub ingest: Option<IngestCredentials>,
    pub sessions: StaticSessions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:3000".into(),
            ws_addr: Some("0.0.0.0:3001".into()),
            bus: BusConfig::default(),
            stream: StreamConfig::default(),
            ingest: None,
            sessions: StaticSessions::new(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("TRICHTER_HTTP_ADDR") {
            config.http_addr = addr;
        }
        if let Some(addr) = lookup("TRICHTER_WS_ADDR") {
            let addr = addr.trim();
            config.ws_addr = (!addr.is_empty()).then(|| addr.to_string());
        }
        if let Some(raw) = lookup("TRICHTER_SOFT_LISTENER_LIMIT") {
            config.bus.soft_listener_limit = parse_number("TRICHTER_SOFT_LISTENER_LIMIT", &raw)?;
        }
        if let Some(raw) = lookup("TRICHTER_HARD_LISTENER_LIMIT") {
            config.bus.hard_listener_limit = if raw.trim().eq_ignore_ascii_case("none") {
                None
            } else {
                match parse_number("TRICHTER_HARD_LISTENER_LIMIT", &raw)? {
                    0 => None,
                    n => Some(n),
                }
            };
        }
        if let Some(raw) = lookup("TRICHTER_KEEPALIVE_SECS") {
            config.stream.keepalive = match parse_number("TRICHTER_KEEPALIVE_SECS", &raw)? {
                0 => None,
                secs => Some(Duration::from_secs(secs as u64)),
            };
        }

        config.ingest = match (lookup("TRICHTER_INGEST_USER"), lookup("TRICHTER_INGEST_PASSWORD")) {
            (Some(user), Some(password)) => Some(IngestCredentials::new(user, password)),
            (Some(_), None) => return Err(ConfigError::Incomplete("TRICHTER_INGEST_USER")),
            (None, Some(_)) => return Err(ConfigError::Incomplete("TRICHTER_INGEST_PASSWORD")),
            (None, None) => None,
        };

        if let Some(raw) = lookup("TRICHTER_SESSIONS") {
            config.sessions = parse_sessions(&raw)?;
        }

        Ok(config)
    }
}

fn parse_number(var: &'static str, raw: &str) -> Result<usize, ConfigError> {
    raw.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
        var,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

/// Parse `token=id:username:Display Name:role;...`.
pub fn parse_sessions(raw: &str) -> Result<StaticSessions, ConfigError> {
    let mut sessions = StaticSessions::new();
    for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let invalid = |reason: &str| ConfigError::Session {
            entry: entry.to_string(),
            reason: reason.to_string(),
        };

        let (token, rest) = entry
            .split_once('=')
            .ok_or_else(|| invalid("expected token=..."))?;
        let (rest, role) = rest
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing role"))?;
        let role = Role::parse(role).ok_or_else(|| invalid("role must be user or admin"))?;

        let mut parts = rest.splitn(3, ':');
        let (Some(id), Some(username), Some(name)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid("expected id:username:Display Name:role"));
        };
        if token.trim().is_empty() || id.trim().is_empty() {
            return Err(invalid("token and id must not be empty"));
        }

        sessions.insert(
            token.trim(),
            Viewer::new(id.trim(), name.trim(), username.trim(), role),
        );
    }
    Ok(sessions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use trichter_live::SessionLookup;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.http_addr, "0.0.0.0:3000");
        assert_eq!(config.ws_addr.as_deref(), Some("0.0.0.0:3001"));
        assert_eq!(config.bus, BusConfig::default());
        assert_eq!(config.stream.keepalive, Some(Duration::from_secs(15)));
        assert!(config.ingest.is_none());
        assert!(config.sessions.is_empty());
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("TRICHTER_HTTP_ADDR", "127.0.0.1:8080"),
            ("TRICHTER_WS_ADDR", ""),
            ("TRICHTER_SOFT_LISTENER_LIMIT", "200"),
            ("TRICHTER_HARD_LISTENER_LIMIT", "none"),
            ("TRICHTER_KEEPALIVE_SECS", "0"),
            ("TRICHTER_INGEST_USER", "device"),
            ("TRICHTER_INGEST_PASSWORD", "s3cret"),
        ]))
        .unwrap();

        assert_eq!(config.http_addr, "127.0.0.1:8080");
        assert_eq!(config.ws_addr, None);
        assert_eq!(config.bus.soft_listener_limit, 200);
        assert_eq!(config.bus.hard_listener_limit, None);
        assert_eq!(config.stream.keepalive, None);
        assert!(config.ingest.unwrap().verify("device", "s3cret"));
    }

    #[test]
    fn test_hard_limit_zero_disables() {
        let config =
            ServerConfig::from_lookup(lookup(&[("TRICHTER_HARD_LISTENER_LIMIT", "0")])).unwrap();
        assert_eq!(config.bus.hard_listener_limit, None);
    }

    #[test]
    fn test_invalid_number() {
        let err = ServerConfig::from_lookup(lookup(&[("TRICHTER_KEEPALIVE_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                var: "TRICHTER_KEEPALIVE_SECS",
                ..
            }
        ));
    }

    #[test]
    fn test_ingest_needs_both_halves() {
        let err = ServerConfig::from_lookup(lookup(&[("TRICHTER_INGEST_USER", "device")]))
            .unwrap_err();
        assert_eq!(err, ConfigError::Incomplete("TRICHTER_INGEST_USER"));
    }

    #[test]
    fn test_parse_sessions() {
        let sessions =
            parse_sessions("tok-a=u1:alice:Alice Liddell:admin; tok-b=u2:bob:Bob:user;").unwrap();
        assert_eq!(sessions.len(), 2);

        let alice = sessions.viewer("tok-a").unwrap();
        assert_eq!(alice.name, "Alice Liddell");
        assert_eq!(alice.username, "alice");
        assert!(alice.is_admin());
        assert_eq!(sessions.viewer("tok-b").unwrap().role, Role::User);
    }

    #[test]
    fn test_parse_sessions_rejects_bad_entries() {
        assert!(matches!(
            parse_sessions("tok-a=u1:alice:Alice:root"),
            Err(ConfigError::Session { .. })
        ));
        assert!(matches!(
            parse_sessions("u1:alice:Alice:user"),
            Err(ConfigError::Session { .. })
        ));
        assert!(matches!(
            parse_sessions("tok=u1:user"),
            Err(ConfigError::Session { .. })
        ));
    }
}
