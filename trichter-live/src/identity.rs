//! Identity collaborators: viewer sessions and the measuring device's
//! ingest credential.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use trichter_core::Owner;

/// Privilege level of a signed-in viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Role::User),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// A signed-in viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewer {
    pub id: String,
    pub name: String,
    pub username: String,
    pub role: Role,
}

impl Viewer {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        username: impl Into<String>,
        role: Role,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            username: username.into(),
            role,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn as_owner(&self) -> Owner {
        Owner::new(self.id.clone(), self.name.clone(), self.username.clone())
    }
}

/// Resolves a session token to the viewer it belongs to.
pub trait SessionLookup: Send + Sync {
    fn viewer(&self, token: &str) -> Option<Viewer>;
}

/// Fixed token table.
#[derive(Debug, Clone, Default)]
pub struct StaticSessions {
    sessions: HashMap<String, Viewer>,
}

impl StaticSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(mut self, token: impl Into<String>, viewer: Viewer) -> Self {
        self.insert(token, viewer);
        self
    }

    pub fn insert(&mut self, token: impl Into<String>, viewer: Viewer) {
        self.sessions.insert(token.into(), viewer);
    }

    pub fn viewers(&self) -> impl Iterator<Item = &Viewer> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl SessionLookup for StaticSessions {
    fn viewer(&self, token: &str) -> Option<Viewer> {
        self.sessions.get(token).cloned()
    }
}

/// HTTP basic credential of the measuring device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestCredentials {
    username: String,
    password: String,
}

impl IngestCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Check an `Authorization` header value (`Basic <base64>`).
    pub fn verify_header(&self, header: &str) -> bool {
        let Some(encoded) = header
            .strip_prefix("Basic ")
            .or_else(|| header.strip_prefix("basic "))
        else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(pair) = String::from_utf8(decoded) else {
            return false;
        };
        match pair.split_once(':') {
            Some((user, pass)) => self.verify(user, pass),
            None => false,
        }
    }

    pub fn verify(&self, username: &str, password: &str) -> bool {
        constant_time_eq(self.username.as_bytes(), username.as_bytes())
            & constant_time_eq(self.password.as_bytes(), password.as_bytes())
    }

    /// `Authorization` header value for these credentials.
    pub fn header_value(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!("Basic {}", STANDARD.encode(raw))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
