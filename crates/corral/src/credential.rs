// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bearer-credential validation: a read-through TTL cache over the
//! credentials table, constant-time verifier comparison, and a background
//! last-used writer so admission never blocks on the durable store.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::state::epoch_ms;
use crate::storage::{Storage, StorageResult};

/// A tenant identity. The verifier is a sha256 digest of the issued secret;
/// the secret itself is never stored.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    pub owner_id: String,
    pub secret_sha256: String,
    pub name: String,
    pub permissions: Vec<String>,
    pub hourly_ceiling: Option<u32>,
    pub active: bool,
    pub expires_at_ms: Option<u64>,
    pub last_used_ms: Option<u64>,
    pub created_at_ms: u64,
}

impl Credential {
    /// Build a credential record for a freshly issued secret.
    pub fn issue(
        owner_id: &str,
        name: &str,
        secret: &str,
        hourly_ceiling: Option<u32>,
        expires_at_ms: Option<u64>,
    ) -> Self {
        Self {
            id: format!("cred-{}", uuid::Uuid::new_v4()),
            owner_id: owner_id.to_owned(),
            secret_sha256: hash_secret(secret),
            name: name.to_owned(),
            permissions: Vec::new(),
            hourly_ceiling,
            active: true,
            expires_at_ms,
            last_used_ms: None,
            created_at_ms: epoch_ms(),
        }
    }

    fn live(&self, now_ms: u64) -> bool {
        self.active && self.expires_at_ms.map(|at| at > now_ms).unwrap_or(true)
    }
}

/// Hex-encoded sha256 of a presented secret.
pub fn hash_secret(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Constant-time string comparison to prevent timing side-channel attacks.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

struct CachedCredential {
    credential: Credential,
    cached_at: Instant,
}

/// Read-through credential cache over durable rows.
pub struct CredentialStore {
    storage: Arc<Storage>,
    cache: RwLock<HashMap<String, CachedCredential>>,
    ttl: Duration,
    touch_tx: mpsc::UnboundedSender<String>,
    touch_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl CredentialStore {
    pub fn new(storage: Arc<Storage>, ttl: Duration) -> Self {
        let (touch_tx, touch_rx) = mpsc::unbounded_channel();
        Self {
            storage,
            cache: RwLock::new(HashMap::new()),
            ttl,
            touch_tx,
            touch_rx: Mutex::new(Some(touch_rx)),
        }
    }

    /// Validate a presented bearer secret against the active rows.
    ///
    /// The digest of the secret is the cache key; on miss every active,
    /// unexpired verifier is compared constant-time.
    pub async fn validate(&self, secret: &str) -> StorageResult<Option<Credential>> {
        let now = epoch_ms();
        let digest = hash_secret(secret);

        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&digest) {
                if entry.cached_at.elapsed() < self.ttl {
                    if entry.credential.live(now) {
                        return Ok(Some(entry.credential.clone()));
                    }
                    return Ok(None);
                }
            }
        }

        let rows = self.storage.load_active_credentials(now).await?;
        let mut matched = None;
        for row in rows {
            if constant_time_eq(&digest, &row.secret_sha256) {
                matched = Some(row);
                break;
            }
        }

        match matched {
            Some(credential) => {
                self.cache.write().await.insert(
                    digest,
                    CachedCredential { credential: credential.clone(), cached_at: Instant::now() },
                );
                Ok(Some(credential))
            }
            None => Ok(None),
        }
    }

    /// Queue a last-used update; the background writer persists it.
    pub fn record_use(&self, credential_id: &str) {
        if self.touch_tx.send(credential_id.to_owned()).is_err() {
            warn!("credential touch writer is gone");
        }
    }

    /// Purge cache entries for a mutated row.
    pub async fn invalidate(&self, credential_id: &str) {
        self.cache.write().await.retain(|_, entry| entry.credential.id != credential_id);
    }

    pub async fn invalidate_all(&self) {
        self.cache.write().await.clear();
    }

    /// Run the batched last-used writer until shutdown.
    pub fn spawn_touch_writer(
        store: Arc<Self>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut rx = match store.touch_rx.lock().await.take() {
                Some(rx) => rx,
                None => {
                    warn!("credential touch writer already running");
                    return;
                }
            };
            loop {
                let first = tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("credential touch writer shutting down");
                        return;
                    }
                    id = rx.recv() => match id {
                        Some(id) => id,
                        None => return,
                    },
                };

                // Coalesce whatever else is already queued.
                let mut ids = HashSet::new();
                ids.insert(first);
                while let Ok(id) = rx.try_recv() {
                    ids.insert(id);
                }

                let now = epoch_ms();
                for id in ids {
                    if let Err(e) = store.storage.touch_credential_last_used(&id, now).await {
                        warn!(credential_id = %id, err = %e, "failed to record credential use");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "credential_tests.rs"]
mod tests;
