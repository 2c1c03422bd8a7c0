use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Opaque host identifier (hostname or IP). The registry never resolves it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Host(pub String);

impl Host {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Host {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Host {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Credential bundle forwarded verbatim to the session backend. Which
/// authentication path it resolves to (Kerberos vs direct SSH) is the
/// backend's business.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Credential {
    pub ssh_user: String,
    pub principal: Option<String>,
    pub kinit_password: Option<String>,
    pub ssh_password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Connected,
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub host: Host,
    pub state: SessionState,
    pub connected_at_unix: i64,
}

impl Session {
    pub fn connecting(host: Host, now_unix: i64) -> Self {
        Self {
            host,
            state: SessionState::Connecting,
            connected_at_unix: now_unix,
        }
    }

    pub fn connected(host: Host, now_unix: i64) -> Self {
        Self {
            host,
            state: SessionState::Connected,
            connected_at_unix: now_unix,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, SessionState::Connected)
    }
}

/// Authoritative in-memory store of connected hosts. At most one session per
/// host; `upsert` is the only mutator and reads return point-in-time clones.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<Host, Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, session: Session) {
        let mut guard = self.inner.write().await;
        guard.insert(session.host.clone(), session);
    }

    pub async fn remove(&self, host: &Host) -> Option<Session> {
        let mut guard = self.inner.write().await;
        guard.remove(host)
    }

    pub async fn get(&self, host: &Host) -> Option<Session> {
        let guard = self.inner.read().await;
        guard.get(host).cloned()
    }

    pub async fn contains(&self, host: &Host) -> bool {
        let guard = self.inner.read().await;
        guard.contains_key(host)
    }

    pub async fn list(&self) -> Vec<Host> {
        let guard = self.inner.read().await;
        guard.keys().cloned().collect()
    }

    pub async fn sessions(&self) -> Vec<Session> {
        let guard = self.inner.read().await;
        guard.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        let guard = self.inner.read().await;
        guard.len()
    }
}
