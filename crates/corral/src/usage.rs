// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Append-only usage accounting.
//!
//! One row per admitted submission, funneled through a channel writer so the
//! admission path never waits on the durable store. Token counts are
//! estimated from text length since the CLI emits plain text, not usage
//! metadata.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::state::epoch_ms;
use crate::storage::Storage;

/// Token counters reported on completed submissions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn from_exchange(prompt: &str, reply: &str) -> Self {
        let input_tokens = estimate_tokens(prompt);
        let output_tokens = estimate_tokens(reply);
        Self { input_tokens, output_tokens, total_tokens: input_tokens + output_tokens }
    }
}

/// Rough token estimate: ~4 characters per token, minimum 1 for any
/// non-blank text.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.trim().is_empty() {
        return 0;
    }
    let chars = text.chars().count() as u64;
    chars.div_ceil(4).max(1)
}

/// One usage-log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEntry {
    pub request_id: String,
    pub credential_id: String,
    pub endpoint: String,
    pub status: u16,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub remote_addr: Option<String>,
    pub client: Option<String>,
    pub at_ms: u64,
}

impl UsageEntry {
    pub fn new(request_id: &str, credential_id: &str, endpoint: &str, status: u16) -> Self {
        Self {
            request_id: request_id.to_owned(),
            credential_id: credential_id.to_owned(),
            endpoint: endpoint.to_owned(),
            status,
            input_tokens: 0,
            output_tokens: 0,
            latency_ms: 0,
            error: None,
            remote_addr: None,
            client: None,
            at_ms: epoch_ms(),
        }
    }
}

/// Channel-fed append-only writer for the usage log.
pub struct UsageLogger {
    tx: mpsc::UnboundedSender<UsageEntry>,
}

impl UsageLogger {
    /// Start the logger and its writer task.
    pub fn spawn(
        storage: Arc<Storage>,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<UsageEntry>();
        let handle = tokio::spawn(async move {
            loop {
                let entry = tokio::select! {
                    _ = shutdown.cancelled() => {
                        // Flush whatever is still queued before exiting.
                        while let Ok(entry) = rx.try_recv() {
                            if let Err(e) = storage.insert_usage(&entry).await {
                                warn!(err = %e, "failed to flush usage row");
                            }
                        }
                        debug!("usage writer shutting down");
                        return;
                    }
                    entry = rx.recv() => match entry {
                        Some(entry) => entry,
                        None => return,
                    },
                };
                if let Err(e) = storage.insert_usage(&entry).await {
                    warn!(request_id = %entry.request_id, err = %e, "failed to write usage row");
                }
            }
        });
        (Arc::new(Self { tx }), handle)
    }

    /// Queue one row. Never blocks.
    pub fn record(&self, entry: UsageEntry) {
        if self.tx.send(entry).is_err() {
            warn!("usage writer is gone");
        }
    }
}

#[cfg(test)]
#[path = "usage_tests.rs"]
mod tests;
