// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Instance pool: owns every live CLI worker and its session binding.
//!
//! All bindings live in one map under one lock; the pool is the single
//! reader of instance lifecycle events and the only code that destroys.
//! A busy instance is never torn down mid-call; destruction polls the
//! busy flag on a retry interval until the call drains.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{CliAdapter, CliCommand};
use crate::instance::{Instance, InstanceEvent, InstanceLimits, InstanceSnapshot};
use crate::session::ContextMessage;

/// Why an acquire failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Every slot is held by a busy or marked instance.
    Capacity,
    ShuttingDown,
}

/// Pool tunables.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_instances: usize,
    pub limits: InstanceLimits,
    pub max_age: Duration,
    pub destroy_retry: Duration,
    pub maintenance_interval: Duration,
    pub per_call_timeout: Duration,
    pub cli: CliCommand,
}

/// Aggregate pool view.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub busy: usize,
    pub idle: usize,
    pub marked_for_destroy: usize,
    pub avg_idle_secs: f64,
    pub instances: Vec<InstanceSnapshot>,
}

pub struct Pool {
    config: PoolConfig,
    instances: RwLock<HashMap<String, Arc<Instance>>>,
    events_tx: mpsc::Sender<InstanceEvent>,
    events_rx: tokio::sync::Mutex<Option<mpsc::Receiver<InstanceEvent>>>,
    released: Notify,
    shutting_down: AtomicBool,
    seq: AtomicU64,
    weak_self: Weak<Pool>,
}

impl Pool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(64);
        Arc::new_cyclic(|weak| Self {
            config,
            instances: RwLock::new(HashMap::new()),
            events_tx,
            events_rx: tokio::sync::Mutex::new(Some(events_rx)),
            released: Notify::new(),
            shutting_down: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            weak_self: weak.clone(),
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Return the live instance bound to `key`, or create one.
    ///
    /// A marked binding is replaced, and an over-age binding is replaced
    /// once it is idle; a busy over-age instance keeps serving this call
    /// (replacing it mid-call would run two workers for one session) and
    /// the age sweep recycles it when the call drains. At capacity the
    /// longest-idle unmarked instance yields its slot; its conversation
    /// survives in the session store and the next acquire for that session
    /// re-seeds a fresh worker.
    pub async fn acquire(
        &self,
        key: &str,
        seed_context: Vec<ContextMessage>,
    ) -> Result<Arc<Instance>, PoolError> {
        if self.is_shutting_down() {
            return Err(PoolError::ShuttingDown);
        }

        let mut map = self.instances.write().await;

        if let Some(existing) = map.get(key) {
            let replace = existing.marked()
                || (existing.age() >= self.config.max_age && !existing.busy());
            if !replace {
                return Ok(Arc::clone(existing));
            }
            if let Some(old) = map.remove(key) {
                debug!(instance_id = %old.id(), "replacing marked or over-age instance");
                self.spawn_destroy(old);
            }
        }

        if map.len() >= self.config.max_instances {
            let victim = map
                .iter()
                .filter(|(_, inst)| !inst.busy() && !inst.marked())
                .max_by_key(|(_, inst)| inst.idle_for())
                .map(|(k, _)| k.clone());
            match victim {
                Some(victim_key) => {
                    if let Some(old) = map.remove(&victim_key) {
                        debug!(
                            instance_id = %old.id(),
                            session_key = %victim_key,
                            "evicting idle instance for capacity"
                        );
                        old.destroy();
                    }
                }
                None => return Err(PoolError::Capacity),
            }
        }

        let id = format!("inst-{}", self.seq.fetch_add(1, Ordering::Relaxed) + 1);
        let adapter = CliAdapter::new(self.config.cli.clone(), self.config.per_call_timeout);
        let instance = Instance::new(
            id,
            key.to_owned(),
            adapter,
            self.config.limits.clone(),
            seed_context,
            self.events_tx.clone(),
        );
        debug!(instance_id = %instance.id(), session_key = %key, "instance created");
        map.insert(key.to_owned(), Arc::clone(&instance));
        Ok(instance)
    }

    /// Mark an instance and unbind it once its in-flight call drains.
    pub fn spawn_destroy(&self, instance: Arc<Instance>) {
        instance.destroy();
        let Some(pool) = self.weak_self.upgrade() else {
            return;
        };
        let retry = self.config.destroy_retry;
        tokio::spawn(async move {
            while instance.busy() {
                tokio::time::sleep(retry).await;
            }
            pool.unbind(&instance).await;
        });
    }

    /// Destroy by instance id (event-loop path).
    pub async fn destroy_by_id(&self, instance_id: &str) {
        let found = {
            let map = self.instances.read().await;
            map.values().find(|inst| inst.id() == instance_id).cloned()
        };
        if let Some(instance) = found {
            self.spawn_destroy(instance);
        }
    }

    async fn unbind(&self, instance: &Arc<Instance>) {
        let mut map = self.instances.write().await;
        map.retain(|_, bound| !Arc::ptr_eq(bound, instance));
        drop(map);
        debug!(instance_id = %instance.id(), "instance destroyed and unbound");
        self.released.notify_one();
    }

    /// Wait until a slot may have opened up.
    pub async fn released(&self) {
        self.released.notified().await;
    }

    /// Signal drainers that an instance went idle.
    pub fn signal_released(&self) {
        self.released.notify_one();
    }

    pub async fn stats(&self) -> PoolStats {
        let map = self.instances.read().await;
        let instances: Vec<InstanceSnapshot> = map.values().map(|inst| inst.snapshot()).collect();
        let total = instances.len();
        let busy = instances.iter().filter(|s| s.busy).count();
        let marked = instances.iter().filter(|s| s.marked_for_destroy).count();
        let avg_idle_secs = if total == 0 {
            0.0
        } else {
            instances.iter().map(|s| s.idle_secs as f64).sum::<f64>() / total as f64
        };
        PoolStats {
            total,
            busy,
            idle: total - busy,
            marked_for_destroy: marked,
            avg_idle_secs,
            instances,
        }
    }

    /// Consume instance events and run age maintenance until shutdown.
    pub fn spawn_event_loop(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let Some(pool) = self.weak_self.upgrade() else {
            return tokio::spawn(async {});
        };
        tokio::spawn(async move {
            let mut rx = match pool.events_rx.lock().await.take() {
                Some(rx) => rx,
                None => {
                    warn!("pool event loop already running");
                    return;
                }
            };
            let mut tick = tokio::time::interval(pool.config.maintenance_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("pool event loop shutting down");
                        return;
                    }
                    event = rx.recv() => {
                        let Some(event) = event else { return };
                        match event {
                            InstanceEvent::IdleExpired { id } => {
                                debug!(instance_id = %id, "idle timeout expired");
                                pool.destroy_by_id(&id).await;
                            }
                            InstanceEvent::MessageCapReached { id } => {
                                debug!(instance_id = %id, "message cap reached");
                                pool.destroy_by_id(&id).await;
                            }
                            InstanceEvent::Tainted { id } => {
                                warn!(instance_id = %id, "instance tainted by CLI timeout");
                                pool.destroy_by_id(&id).await;
                            }
                        }
                    }
                    _ = tick.tick() => {
                        pool.age_sweep().await;
                    }
                }
            }
        })
    }

    async fn age_sweep(&self) {
        let over_age: Vec<Arc<Instance>> = {
            let map = self.instances.read().await;
            map.values()
                .filter(|inst| !inst.marked() && inst.age() >= self.config.max_age)
                .cloned()
                .collect()
        };
        for instance in over_age {
            debug!(instance_id = %instance.id(), "instance over age cap");
            self.spawn_destroy(instance);
        }
    }

    /// Stop admitting, wait out the grace period, then force-terminate.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + grace;
        loop {
            let busy = {
                let map = self.instances.read().await;
                map.values().filter(|inst| inst.busy()).count()
            };
            if busy == 0 || Instant::now() >= deadline {
                if busy > 0 {
                    warn!(busy, "shutdown grace elapsed with calls in flight");
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let drained: Vec<Arc<Instance>> = {
            let mut map = self.instances.write().await;
            map.drain().map(|(_, inst)| inst).collect()
        };
        let count = drained.len();
        for instance in drained {
            instance.force_terminate();
        }
        if count > 0 {
            info!(count, "pool shut down, instances terminated");
        }
        self.released.notify_waiters();
    }
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
