// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Request records: the externally-addressable handle for one submission.
//!
//! Records are written once on submit and move monotonically through
//! queued → running → {completed, failed}. Terminal records stay pollable
//! for the retention window, then the GC loop drops them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::state::epoch_ms;
use crate::usage::Usage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Queued,
    Running,
    Completed,
    Failed,
}

/// One submission's record, pollable by its id.
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub id: String,
    pub tool_id: String,
    pub session_id: Option<String>,
    pub prompt: String,
    pub credential_id: String,
    pub state: RequestState,
    pub submitted_at_ms: u64,
    pub completed_at_ms: Option<u64>,
    pub failed_at_ms: Option<u64>,
    pub reply: Option<String>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub usage: Option<Usage>,
    pub latency_ms: Option<u64>,
    #[serde(skip)]
    terminal_at: Option<Instant>,
}

impl RequestRecord {
    pub fn new(
        id: String,
        tool_id: String,
        session_id: Option<String>,
        prompt: String,
        credential_id: String,
    ) -> Self {
        Self {
            id,
            tool_id,
            session_id,
            prompt,
            credential_id,
            state: RequestState::Queued,
            submitted_at_ms: epoch_ms(),
            completed_at_ms: None,
            failed_at_ms: None,
            reply: None,
            error_kind: None,
            error_message: None,
            usage: None,
            latency_ms: None,
            terminal_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, RequestState::Completed | RequestState::Failed)
    }
}

/// In-memory registry of request records with retention GC.
pub struct RequestRegistry {
    records: RwLock<HashMap<String, RequestRecord>>,
    retention: Duration,
}

impl RequestRegistry {
    pub fn new(retention: Duration) -> Arc<Self> {
        Arc::new(Self { records: RwLock::new(HashMap::new()), retention })
    }

    pub fn new_request_id() -> String {
        format!("req-{}", uuid::Uuid::new_v4())
    }

    pub async fn insert(&self, record: RequestRecord) {
        self.records.write().await.insert(record.id.clone(), record);
    }

    pub async fn get(&self, id: &str) -> Option<RequestRecord> {
        self.records.read().await.get(id).cloned()
    }

    /// Fetch a record visible to the given credential.
    pub async fn get_owned(&self, id: &str, credential_id: &str) -> Option<RequestRecord> {
        self.records
            .read()
            .await
            .get(id)
            .filter(|record| record.credential_id == credential_id)
            .cloned()
    }

    pub async fn is_queued(&self, id: &str) -> bool {
        self.records
            .read()
            .await
            .get(id)
            .map(|record| record.state == RequestState::Queued)
            .unwrap_or(false)
    }

    /// Queued → running. Returns false if the record moved on already.
    pub async fn mark_running(&self, id: &str) -> bool {
        let mut records = self.records.write().await;
        match records.get_mut(id) {
            Some(record) if record.state == RequestState::Queued => {
                record.state = RequestState::Running;
                true
            }
            _ => false,
        }
    }

    pub async fn complete(&self, id: &str, reply: &str, usage: Usage, latency_ms: u64) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(id) {
            record.state = RequestState::Completed;
            record.completed_at_ms = Some(epoch_ms());
            record.reply = Some(reply.to_owned());
            record.usage = Some(usage);
            record.latency_ms = Some(latency_ms);
            record.terminal_at = Some(Instant::now());
        }
    }

    pub async fn fail(&self, id: &str, kind: &str, message: &str) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(id) {
            record.state = RequestState::Failed;
            record.failed_at_ms = Some(epoch_ms());
            record.error_kind = Some(kind.to_owned());
            record.error_message = Some(message.to_owned());
            record.terminal_at = Some(Instant::now());
        }
    }

    /// Cancel a queued record. Returns true when the cancel took effect.
    pub async fn cancel(&self, id: &str) -> bool {
        let mut records = self.records.write().await;
        match records.get_mut(id) {
            Some(record) if record.state == RequestState::Queued => {
                record.state = RequestState::Failed;
                record.failed_at_ms = Some(epoch_ms());
                record.error_kind = Some("CANCELLED".to_owned());
                record.error_message = Some("cancelled by client".to_owned());
                record.terminal_at = Some(Instant::now());
                true
            }
            _ => false,
        }
    }

    /// Drop terminal records past the retention window.
    pub async fn gc(&self) -> usize {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| {
            record
                .terminal_at
                .map(|at| at.elapsed() < self.retention)
                .unwrap_or(true)
        });
        before - records.len()
    }

    pub fn spawn_gc(
        registry: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.cancelled() => {
                        debug!("request gc shutting down");
                        return;
                    }
                }
                let dropped = registry.gc().await;
                if dropped > 0 {
                    debug!(dropped, "expired request records dropped");
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "request_tests.rs"]
mod tests;
