// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! A live CLI worker serving one prompt at a time.
//!
//! Callers sharing an instance are serialized through its execute lock, so
//! same-session submissions observe each other's appended context. The
//! instance publishes lifecycle transitions on the pool's event channel and
//! never destroys itself; the pool is the single owner of destruction.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::adapter::{CliAdapter, CliError};
use crate::session::{ContextMessage, Role};

/// Lifecycle transitions published to the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceEvent {
    /// The idle timer fired with no execute in flight.
    IdleExpired { id: String },
    /// The message cap was reached by the just-finished call.
    MessageCapReached { id: String },
    /// A CLI timeout tainted the instance; it must not be reused.
    Tainted { id: String },
}

/// Why an execute call was refused or failed.
#[derive(Debug)]
pub enum ExecuteError {
    DestroyScheduled,
    Cli(CliError),
}

impl std::fmt::Display for ExecuteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DestroyScheduled => write!(f, "instance is scheduled for destruction"),
            Self::Cli(e) => write!(f, "{e}"),
        }
    }
}

/// A successful execute: the reply plus the updated message count.
#[derive(Debug, Clone)]
pub struct ExecuteReply {
    pub text: String,
    pub message_count: u32,
    pub duration: Duration,
}

/// Tunables an instance is born with.
#[derive(Debug, Clone)]
pub struct InstanceLimits {
    pub message_cap: u32,
    pub idle_timeout: Duration,
    pub history_pairs: usize,
}

/// A stateful wrapper around one CLI worker.
pub struct Instance {
    id: String,
    session_key: String,
    adapter: CliAdapter,
    limits: InstanceLimits,
    exec_lock: tokio::sync::Mutex<()>,
    busy: AtomicBool,
    marked: AtomicBool,
    message_count: AtomicU32,
    created_at: Instant,
    last_used: parking_lot::Mutex<Instant>,
    idle_cancel: parking_lot::Mutex<CancellationToken>,
    history: tokio::sync::Mutex<Vec<ContextMessage>>,
    events: mpsc::Sender<InstanceEvent>,
    weak_self: Weak<Instance>,
}

impl Instance {
    pub fn new(
        id: String,
        session_key: String,
        adapter: CliAdapter,
        limits: InstanceLimits,
        seed_context: Vec<ContextMessage>,
        events: mpsc::Sender<InstanceEvent>,
    ) -> Arc<Self> {
        let instance = Arc::new_cyclic(|weak| Self {
            id,
            session_key,
            adapter,
            limits,
            exec_lock: tokio::sync::Mutex::new(()),
            busy: AtomicBool::new(false),
            marked: AtomicBool::new(false),
            message_count: AtomicU32::new(0),
            created_at: Instant::now(),
            last_used: parking_lot::Mutex::new(Instant::now()),
            idle_cancel: parking_lot::Mutex::new(CancellationToken::new()),
            history: tokio::sync::Mutex::new(seed_context),
            events,
            weak_self: weak.clone(),
        });
        instance.arm_idle_timer();
        instance
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn marked(&self) -> bool {
        self.marked.load(Ordering::SeqCst)
    }

    pub fn message_count(&self) -> u32 {
        self.message_count.load(Ordering::SeqCst)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    /// Run one prompt. Concurrent callers are serialized; a marked instance
    /// refuses outright.
    pub async fn execute(&self, prompt: &str) -> Result<ExecuteReply, ExecuteError> {
        if self.marked() {
            return Err(ExecuteError::DestroyScheduled);
        }
        let _guard = self.exec_lock.lock().await;
        if self.marked() {
            return Err(ExecuteError::DestroyScheduled);
        }

        self.busy.store(true, Ordering::SeqCst);
        self.cancel_idle_timer();

        let composed = {
            let history = self.history.lock().await;
            compose_prompt(&history, prompt, self.limits.history_pairs)
        };
        let result = self.adapter.execute(&composed).await;

        // Busy clears unconditionally, whatever the adapter said.
        self.busy.store(false, Ordering::SeqCst);
        *self.last_used.lock() = Instant::now();

        match result {
            Ok(reply) => {
                {
                    let mut history = self.history.lock().await;
                    history.push(ContextMessage::now(Role::User, prompt));
                    history.push(ContextMessage::now(Role::Assistant, reply.text.clone()));
                }
                let count = self.message_count.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= self.limits.message_cap {
                    self.marked.store(true, Ordering::SeqCst);
                    self.send_event(InstanceEvent::MessageCapReached { id: self.id.clone() });
                } else {
                    self.arm_idle_timer();
                }
                Ok(ExecuteReply {
                    text: reply.text,
                    message_count: count,
                    duration: reply.duration,
                })
            }
            Err(e @ CliError::Timeout { .. }) => {
                // A stuck CLI taints the worker regardless of recycling state.
                self.marked.store(true, Ordering::SeqCst);
                self.send_event(InstanceEvent::Tainted { id: self.id.clone() });
                Err(ExecuteError::Cli(e))
            }
            Err(e) => {
                self.arm_idle_timer();
                Err(ExecuteError::Cli(e))
            }
        }
    }

    /// Mark for destruction and stop the idle timer. Idempotent.
    pub fn destroy(&self) {
        if !self.marked.swap(true, Ordering::SeqCst) {
            debug!(instance_id = %self.id, "instance marked for destroy");
        }
        self.cancel_idle_timer();
    }

    /// Destroy and kill any in-flight child.
    pub fn force_terminate(&self) {
        self.destroy();
        self.adapter.terminate();
    }

    /// Point-in-time view for the stats API.
    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            id: self.id.clone(),
            session_key: self.session_key.clone(),
            busy: self.busy(),
            marked_for_destroy: self.marked(),
            message_count: self.message_count(),
            age_secs: self.age().as_secs(),
            idle_secs: self.idle_for().as_secs(),
        }
    }

    fn arm_idle_timer(&self) {
        let Some(instance) = self.weak_self.upgrade() else {
            return;
        };
        let token = CancellationToken::new();
        {
            let mut guard = self.idle_cancel.lock();
            guard.cancel();
            *guard = token.clone();
        }
        let timeout = self.limits.idle_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if !instance.busy() && !instance.marked() {
                        instance
                            .send_event(InstanceEvent::IdleExpired { id: instance.id.clone() });
                    }
                }
            }
        });
    }

    fn cancel_idle_timer(&self) {
        self.idle_cancel.lock().cancel();
    }

    fn send_event(&self, event: InstanceEvent) {
        if self.events.try_send(event).is_err() {
            debug!(instance_id = %self.id, "pool event channel full or closed");
        }
    }
}

/// Serializable instance view.
#[derive(Debug, Clone, serde::Serialize)]
pub struct InstanceSnapshot {
    pub id: String,
    pub session_key: String,
    pub busy: bool,
    pub marked_for_destroy: bool,
    pub message_count: u32,
    pub age_secs: u64,
    pub idle_secs: u64,
}

/// Concatenate the tail of the conversation ahead of the new prompt.
fn compose_prompt(history: &[ContextMessage], prompt: &str, pairs: usize) -> String {
    if history.is_empty() {
        return prompt.to_owned();
    }
    let take = pairs.saturating_mul(2);
    let start = history.len().saturating_sub(take);
    let mut buf = String::new();
    for message in &history[start..] {
        buf.push_str(message.role.label());
        buf.push_str(": ");
        buf.push_str(&message.content);
        buf.push_str("\n\n");
    }
    buf.push_str("user: ");
    buf.push_str(prompt);
    buf
}

#[cfg(test)]
#[path = "instance_tests.rs"]
mod tests;
