// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable conversation memory: a write-through cache over the sessions
//! table, with TTL enforcement and a periodic expiry sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::state::epoch_ms;
use crate::storage::{Storage, StorageResult};

/// Shortest TTL a session may carry.
pub const MIN_TTL: Duration = Duration::from_secs(300);
/// Longest TTL a session may carry.
pub const MAX_TTL: Duration = Duration::from_secs(86_400);

/// Who authored a context entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// One entry in a session's conversation context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: Role,
    pub content: String,
    pub at_ms: u64,
}

impl ContextMessage {
    pub fn now(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into(), at_ms: epoch_ms() }
    }
}

/// A continuing conversation owned by one credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub credential_id: String,
    pub tool_id: String,
    pub context: Vec<ContextMessage>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub active: bool,
    pub created_at_ms: u64,
    pub last_activity_ms: u64,
    pub expires_at_ms: u64,
}

fn visible(session: &Session, owner: &str, now_ms: u64) -> bool {
    session.active && session.credential_id == owner && session.expires_at_ms > now_ms
}

/// Clamp a requested TTL into the allowed band.
pub fn clamp_ttl(ttl: Duration) -> Duration {
    ttl.clamp(MIN_TTL, MAX_TTL)
}

/// Write-through session store.
pub struct SessionStore {
    storage: Arc<Storage>,
    cache: RwLock<HashMap<String, Session>>,
    context_cap: usize,
    default_ttl: Duration,
}

impl SessionStore {
    pub fn new(storage: Arc<Storage>, context_cap: usize, default_ttl: Duration) -> Self {
        Self { storage, cache: RwLock::new(HashMap::new()), context_cap, default_ttl }
    }

    /// Create and persist a new session.
    pub async fn create(
        &self,
        credential_id: &str,
        tool_id: &str,
        initial_context: Vec<ContextMessage>,
        metadata: serde_json::Map<String, serde_json::Value>,
        ttl: Option<Duration>,
    ) -> StorageResult<Session> {
        let now = epoch_ms();
        let ttl = clamp_ttl(ttl.unwrap_or(self.default_ttl));
        let session = Session {
            id: format!("sess-{}", uuid::Uuid::new_v4()),
            credential_id: credential_id.to_owned(),
            tool_id: tool_id.to_owned(),
            context: initial_context,
            metadata,
            active: true,
            created_at_ms: now,
            last_activity_ms: now,
            expires_at_ms: now + ttl.as_millis() as u64,
        };
        self.storage.insert_session(&session).await?;
        self.cache.write().await.insert(session.id.clone(), session.clone());
        debug!(session_id = %session.id, ttl_secs = ttl.as_secs(), "session created");
        Ok(session)
    }

    /// Fetch a session visible to the given owner, or `None`.
    pub async fn get(&self, id: &str, owner: &str) -> StorageResult<Option<Session>> {
        let now = epoch_ms();
        match self.fetch(id).await? {
            Some(session) if visible(&session, owner, now) => Ok(Some(session)),
            _ => Ok(None),
        }
    }

    /// Append a (user, assistant) exchange, trimming the head past the cap.
    ///
    /// Per-session appends arrive serialized; the dispatcher holds the
    /// instance's execute lock across the call.
    pub async fn append_exchange(
        &self,
        id: &str,
        owner: &str,
        user_text: &str,
        assistant_text: &str,
    ) -> StorageResult<bool> {
        let now = epoch_ms();
        let Some(mut session) = self.fetch(id).await? else {
            return Ok(false);
        };
        if !visible(&session, owner, now) {
            return Ok(false);
        }

        session.context.push(ContextMessage::now(Role::User, user_text));
        session.context.push(ContextMessage::now(Role::Assistant, assistant_text));
        let overflow = session.context.len().saturating_sub(self.context_cap);
        if overflow > 0 {
            session.context.drain(..overflow);
        }
        session.last_activity_ms = now;

        self.storage.update_session(&session).await?;
        self.cache.write().await.insert(session.id.clone(), session);
        Ok(true)
    }

    /// Merge metadata and optionally extend the TTL.
    pub async fn update(
        &self,
        id: &str,
        owner: &str,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
        extend_ttl: Option<Duration>,
    ) -> StorageResult<Option<Session>> {
        let now = epoch_ms();
        let Some(mut session) = self.fetch(id).await? else {
            return Ok(None);
        };
        if !visible(&session, owner, now) {
            return Ok(None);
        }

        if let Some(patch) = metadata {
            for (key, value) in patch {
                session.metadata.insert(key, value);
            }
        }
        if let Some(ttl) = extend_ttl {
            session.expires_at_ms = now + clamp_ttl(ttl).as_millis() as u64;
        }
        session.last_activity_ms = now;

        self.storage.update_session(&session).await?;
        self.cache.write().await.insert(session.id.clone(), session.clone());
        Ok(Some(session))
    }

    /// Soft-delete: flips the active flag and purges the cache entry.
    pub async fn delete(&self, id: &str, owner: &str) -> StorageResult<bool> {
        let now = epoch_ms();
        let Some(mut session) = self.fetch(id).await? else {
            return Ok(false);
        };
        if !visible(&session, owner, now) {
            return Ok(false);
        }

        session.active = false;
        self.storage.update_session(&session).await?;
        self.cache.write().await.remove(id);
        debug!(session_id = %id, "session deleted");
        Ok(true)
    }

    /// Mark expired rows inactive and purge their cache entries.
    pub async fn sweep(&self) -> StorageResult<usize> {
        let now = epoch_ms();
        let expired = self.storage.sweep_expired_sessions(now).await?;
        if !expired.is_empty() {
            let mut cache = self.cache.write().await;
            for id in &expired {
                cache.remove(id);
            }
            info!(count = expired.len(), "swept expired sessions");
        }
        Ok(expired.len())
    }

    /// Run the periodic sweep until shutdown.
    pub fn spawn_sweeper(
        store: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.cancelled() => {
                        debug!("session sweeper shutting down");
                        return;
                    }
                }
                if let Err(e) = store.sweep().await {
                    warn!(err = %e, "session sweep failed");
                }
            }
        })
    }

    /// Cache read-through: cached copy or a durable load that fills the cache.
    async fn fetch(&self, id: &str) -> StorageResult<Option<Session>> {
        if let Some(session) = self.cache.read().await.get(id) {
            return Ok(Some(session.clone()));
        }
        match self.storage.get_session(id).await? {
            Some(session) => {
                self.cache.write().await.insert(id.to_owned(), session.clone());
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
