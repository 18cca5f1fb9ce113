//! Server-side sessions.
//!
//! Sessions are owned by a [`SessionStore`]; everything else holds a session
//! id and goes through [`SessionGateway`], which bounds every store call with
//! a timeout and fails closed: a store that errors or stalls makes the
//! request unauthenticated.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::error::LabError;

/// Default session lifetime without activity (8 hours).
pub const SESSION_TTL_SECS: u64 = 8 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Administrator,
    Instructor,
    Student,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Administrator => "administrator",
            Self::Instructor => "instructor",
            Self::Student => "student",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "administrator" | "admin" => Ok(Self::Administrator),
            "instructor" => Ok(Self::Instructor),
            "student" => Ok(Self::Student),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// An authenticated session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub role: Role,
    /// Secret backing this session's CSRF tokens, created on first issuance.
    pub csrf_secret: Option<Vec<u8>>,
    pub online: bool,
    pub created_at: Instant,
    pub last_active: Instant,
    pub expires_at: Instant,
}

impl Session {
    pub fn new(user_id: impl Into<String>, role: Role, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            id: new_session_id(),
            user_id: user_id.into(),
            role,
            csrf_secret: None,
            online: false,
            created_at: now,
            last_active: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn refresh(&mut self, now: Instant, ttl: Duration) {
        self.last_active = now;
        self.expires_at = now + ttl;
    }
}

/// 256-bit random, URL-safe session id.
fn new_session_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session store unavailable: {0}")]
    Unavailable(String),
}

/// Shared session storage.
///
/// Every method is a single atomic operation on one record; the TTL refresh
/// happens inside the same critical section as the read or write.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetch a live session and slide its expiry. Expired records are evicted
    /// and reported as absent.
    async fn load(&self, id: &str) -> Result<Option<Session>, StoreError>;

    /// Whether a live session exists. Does not slide the expiry.
    async fn exists(&self, id: &str) -> Result<bool, StoreError>;

    /// Insert or replace a session, sliding its expiry.
    async fn save(&self, session: Session) -> Result<(), StoreError>;

    /// Remove a session. Returns whether it existed.
    async fn invalidate(&self, id: &str) -> Result<bool, StoreError>;

    /// Store `candidate` as the CSRF secret unless one is already present and
    /// return the secret now in effect. `None` if the session does not exist.
    async fn ensure_csrf_secret(
        &self,
        id: &str,
        candidate: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, StoreError>;

    /// Set the online marker. Returns whether the session exists.
    async fn set_online(&self, id: &str, online: bool) -> Result<bool, StoreError>;

    /// Drop every expired record; returns how many were removed.
    async fn purge_expired(&self) -> Result<usize, StoreError>;
}

/// In-process session store.
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    ttl: Duration,
}

impl MemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        let expired = match sessions.get_mut(id) {
            None => return Ok(None),
            Some(session) if session.is_expired(now) => true,
            Some(session) => {
                session.refresh(now, self.ttl);
                return Ok(Some(session.clone()));
            }
        };
        if expired {
            sessions.remove(id);
            debug!(session = %redact(id), "Evicted expired session on load");
        }
        Ok(None)
    }

    async fn exists(&self, id: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let sessions = self.sessions.read().await;
        Ok(sessions.get(id).is_some_and(|s| !s.is_expired(now)))
    }

    async fn save(&self, mut session: Session) -> Result<(), StoreError> {
        session.refresh(Instant::now(), self.ttl);
        self.sessions.write().await.insert(session.id.clone(), session);
        Ok(())
    }

    async fn invalidate(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.sessions.write().await.remove(id).is_some())
    }

    async fn ensure_csrf_secret(
        &self,
        id: &str,
        candidate: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(id) {
            Some(session) if !session.is_expired(now) => {
                let secret = session.csrf_secret.get_or_insert(candidate);
                Ok(Some(secret.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn set_online(&self, id: &str, online: bool) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(id) {
            Some(session) if !session.is_expired(now) => {
                session.online = online;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(now));
        Ok(before - sessions.len())
    }
}

/// Timeout-bounded, fail-closed access to the session store.
#[derive(Clone)]
pub struct SessionGateway {
    store: Arc<dyn SessionStore>,
    ttl: Duration,
    timeout: Duration,
}

impl SessionGateway {
    pub fn new(store: Arc<dyn SessionStore>, ttl: Duration, timeout: Duration) -> Self {
        Self { store, ttl, timeout }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn call<T, F>(&self, operation: &str, fut: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Unavailable(format!(
                "{operation} timed out after {:?}",
                self.timeout
            ))),
        }
    }

    /// Resolve a session id to a live session, refreshing its expiry.
    pub async fn authenticate(&self, id: &str) -> Result<Session, LabError> {
        match self.call("load", self.store.load(id)).await {
            Ok(Some(session)) => Ok(session),
            Ok(None) => Err(LabError::Unauthenticated),
            Err(err) => {
                error!(error = %err, "Session store failure, rejecting request");
                Err(LabError::Unauthenticated)
            }
        }
    }

    /// Check that a session is still live without touching it. Used by
    /// long-lived channels, which must not keep a session alive on their own.
    pub async fn verify(&self, id: &str) -> Result<(), LabError> {
        match self.call("exists", self.store.exists(id)).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(LabError::Unauthenticated),
            Err(err) => {
                error!(error = %err, "Session store failure, closing channel");
                Err(LabError::Unauthenticated)
            }
        }
    }

    /// Start a session for an already authenticated user.
    pub async fn create(&self, user_id: &str, role: Role) -> Result<Session, LabError> {
        let session = Session::new(user_id, role, self.ttl);
        self.call("save", self.store.save(session.clone()))
            .await
            .map_err(|e| LabError::Unavailable(e.to_string()))?;
        info!(user = %user_id, %role, "Session created");
        Ok(session)
    }

    pub async fn invalidate(&self, id: &str) -> Result<bool, LabError> {
        let existed = self
            .call("invalidate", self.store.invalidate(id))
            .await
            .map_err(|e| LabError::Unavailable(e.to_string()))?;
        if existed {
            info!(session = %redact(id), "Session invalidated");
        }
        Ok(existed)
    }

    /// Returns the CSRF secret in effect; unauthenticated if the session is gone.
    pub async fn ensure_csrf_secret(&self, id: &str, candidate: Vec<u8>) -> Result<Vec<u8>, LabError> {
        match self
            .call("ensure_csrf_secret", self.store.ensure_csrf_secret(id, candidate))
            .await
        {
            Ok(Some(secret)) => Ok(secret),
            Ok(None) => Err(LabError::Unauthenticated),
            Err(err) => {
                error!(error = %err, "Session store failure while issuing CSRF secret");
                Err(LabError::Unauthenticated)
            }
        }
    }

    pub async fn set_online(&self, id: &str, online: bool) -> Result<bool, LabError> {
        self.call("set_online", self.store.set_online(id, online))
            .await
            .map_err(|e| LabError::Unavailable(e.to_string()))
    }

    pub async fn purge_expired(&self) -> Result<usize, LabError> {
        self.call("purge_expired", self.store.purge_expired())
            .await
            .map_err(|e| LabError::Unavailable(e.to_string()))
    }
}

/// Short prefix of a session id, safe for logs.
pub fn redact(id: &str) -> &str {
    let end = id.char_indices().nth(6).map(|(i, _)| i).unwrap_or(id.len());
    &id[..end]
}
