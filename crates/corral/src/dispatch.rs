// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The submission pipeline: credential gate → rate limit → session lookup →
//! pool acquire → execute → session append → usage row.
//!
//! When the pool is out of capacity the submission parks in a bounded FIFO
//! under its request id; a single drainer task retries whenever the pool
//! signals a release. Admitted submissions produce exactly one usage row,
//! written at their terminal transition.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::CliError;
use crate::credential::{Credential, CredentialStore};
use crate::error::{ErrorCode, Rejection};
use crate::instance::{ExecuteError, Instance};
use crate::pool::{Pool, PoolError};
use crate::ratelimit::{RateDecision, SlidingWindow};
use crate::request::{RequestRecord, RequestRegistry};
use crate::session::SessionStore;
use crate::usage::{Usage, UsageEntry, UsageLogger};

const ENDPOINT_SUBMIT: &str = "submissions";

/// Generation options accepted on a submission. Unknown keys are rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmissionOptions {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub presence_penalty: Option<f64>,
}

impl SubmissionOptions {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(format!("temperature must be in [0, 2], got {t}"));
            }
        }
        if let Some(m) = self.max_tokens {
            if !(1..=4000).contains(&m) {
                return Err(format!("max_tokens must be in [1, 4000], got {m}"));
            }
        }
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(format!("top_p must be in [0, 1], got {p}"));
            }
        }
        if let Some(p) = self.frequency_penalty {
            if !(-2.0..=2.0).contains(&p) {
                return Err(format!("frequency_penalty must be in [-2, 2], got {p}"));
            }
        }
        if let Some(p) = self.presence_penalty {
            if !(-2.0..=2.0).contains(&p) {
                return Err(format!("presence_penalty must be in [-2, 2], got {p}"));
            }
        }
        Ok(())
    }
}

/// One client-originated request to run a prompt.
#[derive(Debug, Clone)]
pub struct Submission {
    pub bearer: String,
    pub prompt: String,
    pub tool_id: Option<String>,
    pub session_id: Option<String>,
    pub stream: bool,
    pub options: Option<SubmissionOptions>,
    pub remote_addr: Option<String>,
    pub client: Option<String>,
}

/// Synchronous completion payload.
#[derive(Debug, Clone, Serialize)]
pub struct CompletedResponse {
    pub status: String,
    pub request_id: String,
    pub reply: String,
    pub usage: Usage,
    pub tool_id: String,
    pub session_id: Option<String>,
    pub latency_ms: u64,
}

/// What a submit call produced.
#[derive(Debug)]
pub enum SubmitOutcome {
    Completed(Box<CompletedResponse>),
    Queued { request_id: String },
}

/// Delivery frames for streaming consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    Queued { request_id: String },
    Text { content: String },
    Done { usage: Usage, latency_ms: u64 },
    Error { kind: String, message: String },
}

/// Dispatcher tunables.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub queue_capacity: usize,
    pub credential_ceiling: u32,
    pub address_ceiling: u32,
    pub default_tool_id: String,
}

/// Everything needed to run one admitted submission.
#[derive(Debug, Clone)]
struct JobSpec {
    request_id: String,
    credential: Credential,
    prompt: String,
    tool_id: String,
    session_id: Option<String>,
    remote_addr: Option<String>,
    client: Option<String>,
}

struct QueuedJob {
    spec: JobSpec,
    frames: Option<mpsc::Sender<StreamFrame>>,
}

pub struct Dispatcher {
    config: DispatchConfig,
    credentials: Arc<CredentialStore>,
    limiter: Arc<SlidingWindow>,
    sessions: Arc<SessionStore>,
    pool: Arc<Pool>,
    usage: Arc<UsageLogger>,
    requests: Arc<RequestRegistry>,
    queue: tokio::sync::Mutex<VecDeque<QueuedJob>>,
    queue_notify: Notify,
    draining: AtomicBool,
    weak_self: Weak<Dispatcher>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DispatchConfig,
        credentials: Arc<CredentialStore>,
        limiter: Arc<SlidingWindow>,
        sessions: Arc<SessionStore>,
        pool: Arc<Pool>,
        usage: Arc<UsageLogger>,
        requests: Arc<RequestRegistry>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            credentials,
            limiter,
            sessions,
            pool,
            usage,
            requests,
            queue: tokio::sync::Mutex::new(VecDeque::new()),
            queue_notify: Notify::new(),
            draining: AtomicBool::new(false),
            weak_self: weak.clone(),
        })
    }

    /// Orchestrate one submission end-to-end.
    pub async fn submit(&self, submission: Submission) -> Result<SubmitOutcome, Rejection> {
        self.submit_inner(submission, None).await
    }

    /// Streaming variant: frames arrive on the returned channel.
    pub fn submit_stream(&self, submission: Submission) -> mpsc::Receiver<StreamFrame> {
        let (tx, rx) = mpsc::channel(8);
        let Some(dispatcher) = self.weak_self.upgrade() else {
            return rx;
        };
        tokio::spawn(async move {
            match dispatcher.submit_inner(submission, Some(tx.clone())).await {
                Ok(SubmitOutcome::Completed(resp)) => {
                    let _ = tx.send(StreamFrame::Text { content: resp.reply.clone() }).await;
                    let _ = tx
                        .send(StreamFrame::Done { usage: resp.usage, latency_ms: resp.latency_ms })
                        .await;
                }
                Ok(SubmitOutcome::Queued { .. }) => {
                    // The queued frame was already sent before enqueueing;
                    // completion frames come from the drainer.
                }
                Err(rejection) => {
                    let _ = tx
                        .send(StreamFrame::Error {
                            kind: rejection.code.as_str().to_owned(),
                            message: rejection.message,
                        })
                        .await;
                }
            }
        });
        rx
    }

    async fn submit_inner(
        &self,
        submission: Submission,
        frames: Option<mpsc::Sender<StreamFrame>>,
    ) -> Result<SubmitOutcome, Rejection> {
        // Validation short-circuits: no usage row, no mutation.
        if submission.prompt.trim().is_empty() {
            return Err(Rejection::new(ErrorCode::BadRequest, "prompt must not be empty"));
        }
        if let Some(options) = &submission.options {
            options.validate().map_err(|m| Rejection::new(ErrorCode::BadRequest, m))?;
        }
        if self.draining.load(Ordering::SeqCst) {
            return Err(Rejection::new(ErrorCode::ShuttingDown, "service is shutting down"));
        }

        let credential = self
            .credentials
            .validate(&submission.bearer)
            .await
            .map_err(internal)?
            .ok_or_else(|| {
                Rejection::new(ErrorCode::Unauthorized, "invalid or missing credential")
            })?;

        // One request id covers the record and every usage row.
        let request_id = RequestRegistry::new_request_id();

        let ceiling = credential.hourly_ceiling.unwrap_or(self.config.credential_ceiling);
        let decision = self.limiter.check(&credential_key(&credential.id), ceiling);
        if !decision.allowed {
            self.log_rejection(&request_id, &credential.id, &submission, 429, "rate limited");
            return Err(Rejection::new(
                ErrorCode::RateLimited,
                format!("rate limit of {ceiling} per window exceeded"),
            ));
        }
        if self.config.address_ceiling > 0 {
            if let Some(addr) = &submission.remote_addr {
                let decision =
                    self.limiter.check(&address_key(addr), self.config.address_ceiling);
                if !decision.allowed {
                    self.log_rejection(
                        &request_id,
                        &credential.id,
                        &submission,
                        429,
                        "rate limited by address",
                    );
                    return Err(Rejection::new(
                        ErrorCode::RateLimited,
                        "address rate limit exceeded",
                    ));
                }
            }
        }

        let session = match &submission.session_id {
            Some(session_id) => {
                match self.sessions.get(session_id, &credential.id).await.map_err(internal)? {
                    Some(session) => Some(session),
                    None => {
                        self.log_rejection(
                            &request_id,
                            &credential.id,
                            &submission,
                            404,
                            "session not found",
                        );
                        return Err(Rejection::new(
                            ErrorCode::NoSuchSession,
                            "session not found, expired, or not yours",
                        ));
                    }
                }
            }
            None => None,
        };

        self.credentials.record_use(&credential.id);

        let tool_id = submission
            .tool_id
            .clone()
            .or_else(|| session.as_ref().map(|s| s.tool_id.clone()))
            .unwrap_or_else(|| self.config.default_tool_id.clone());

        self.requests
            .insert(RequestRecord::new(
                request_id.clone(),
                tool_id.clone(),
                submission.session_id.clone(),
                submission.prompt.clone(),
                credential.id.clone(),
            ))
            .await;

        let spec = JobSpec {
            request_id: request_id.clone(),
            credential,
            prompt: submission.prompt.clone(),
            tool_id,
            session_id: submission.session_id.clone(),
            remote_addr: submission.remote_addr.clone(),
            client: submission.client.clone(),
        };

        let key = spec.session_id.clone().unwrap_or_else(|| request_id.clone());
        let seed = session.map(|s| s.context).unwrap_or_default();

        match self.pool.acquire(&key, seed).await {
            Ok(instance) => match self.run_job(&spec, instance).await? {
                Some(response) => Ok(SubmitOutcome::Completed(Box::new(response))),
                None => Err(Rejection::new(
                    ErrorCode::Internal,
                    "request was cancelled before dispatch",
                )),
            },
            Err(PoolError::ShuttingDown) => {
                let rejection =
                    Rejection::new(ErrorCode::ShuttingDown, "service is shutting down");
                self.fail_admitted(&spec, &rejection).await;
                Err(rejection)
            }
            Err(PoolError::Capacity) => {
                let mut queue = self.queue.lock().await;
                if queue.len() >= self.config.queue_capacity {
                    drop(queue);
                    let rejection = Rejection::new(
                        ErrorCode::CapacityExhausted,
                        "too many concurrent sessions",
                    );
                    self.fail_admitted(&spec, &rejection).await;
                    return Err(rejection);
                }
                // The queued frame must precede anything the drainer sends.
                if let Some(frames) = &frames {
                    let _ = frames
                        .send(StreamFrame::Queued { request_id: request_id.clone() })
                        .await;
                }
                queue.push_back(QueuedJob { spec, frames });
                drop(queue);
                self.queue_notify.notify_one();
                info!(request_id = %request_id, "submission queued for capacity");
                Ok(SubmitOutcome::Queued { request_id })
            }
        }
    }

    /// Execute an admitted submission on an acquired instance.
    ///
    /// Returns `Ok(None)` when the record went terminal (a cancel) between
    /// dequeue and dispatch; the instance is released untouched and the
    /// cancel already wrote the one usage row.
    async fn run_job(
        &self,
        spec: &JobSpec,
        instance: Arc<Instance>,
    ) -> Result<Option<CompletedResponse>, Rejection> {
        if !self.requests.mark_running(&spec.request_id).await {
            self.pool.signal_released();
            debug!(request_id = %spec.request_id, "record no longer queued, skipping dispatch");
            return Ok(None);
        }
        let started = Instant::now();
        let result = instance.execute(&spec.prompt).await;
        self.pool.signal_released();

        match result {
            Ok(reply) => {
                if let Some(session_id) = &spec.session_id {
                    if let Err(e) = self
                        .sessions
                        .append_exchange(
                            session_id,
                            &spec.credential.id,
                            &spec.prompt,
                            &reply.text,
                        )
                        .await
                    {
                        warn!(session_id = %session_id, err = %e, "failed to append exchange");
                    }
                }

                let usage = Usage::from_exchange(&spec.prompt, &reply.text);
                let latency_ms = started.elapsed().as_millis() as u64;
                self.requests
                    .complete(&spec.request_id, &reply.text, usage.clone(), latency_ms)
                    .await;

                let mut entry =
                    UsageEntry::new(&spec.request_id, &spec.credential.id, ENDPOINT_SUBMIT, 200);
                entry.input_tokens = usage.input_tokens;
                entry.output_tokens = usage.output_tokens;
                entry.latency_ms = latency_ms;
                entry.remote_addr = spec.remote_addr.clone();
                entry.client = spec.client.clone();
                self.usage.record(entry);

                debug!(request_id = %spec.request_id, latency_ms, "submission completed");
                Ok(Some(CompletedResponse {
                    status: "ok".to_owned(),
                    request_id: spec.request_id.clone(),
                    reply: reply.text,
                    usage,
                    tool_id: spec.tool_id.clone(),
                    session_id: spec.session_id.clone(),
                    latency_ms,
                }))
            }
            Err(error) => {
                let code = match &error {
                    ExecuteError::DestroyScheduled => ErrorCode::Internal,
                    ExecuteError::Cli(CliError::Timeout { .. }) => ErrorCode::CliTimeout,
                    ExecuteError::Cli(_) => ErrorCode::CliFailed,
                };
                let message = error.to_string();
                let latency_ms = started.elapsed().as_millis() as u64;
                self.requests.fail(&spec.request_id, code.as_str(), &message).await;

                let mut entry = UsageEntry::new(
                    &spec.request_id,
                    &spec.credential.id,
                    ENDPOINT_SUBMIT,
                    code.http_status(),
                );
                entry.latency_ms = latency_ms;
                entry.error = Some(message.clone());
                entry.remote_addr = spec.remote_addr.clone();
                entry.client = spec.client.clone();
                self.usage.record(entry);

                warn!(request_id = %spec.request_id, code = %code, "submission failed");
                Err(Rejection::new(code, message))
            }
        }
    }

    /// Run the queue drainer until shutdown.
    pub fn spawn_drainer(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let Some(dispatcher) = self.weak_self.upgrade() else {
            return tokio::spawn(async {});
        };
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        dispatcher.fail_queued("service is shutting down").await;
                        debug!("dispatch drainer shutting down");
                        return;
                    }
                    _ = dispatcher.pool.released() => {}
                    _ = dispatcher.queue_notify.notified() => {}
                }
                dispatcher.drain().await;
            }
        })
    }

    async fn drain(&self) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        loop {
            let job = { self.queue.lock().await.pop_front() };
            let Some(job) = job else { return };

            // Cancelled or already failed while parked.
            if !self.requests.is_queued(&job.spec.request_id).await {
                continue;
            }

            // Re-resolve the session: it may have expired while queued.
            let seed = match &job.spec.session_id {
                Some(session_id) => {
                    match self.sessions.get(session_id, &job.spec.credential.id).await {
                        Ok(Some(session)) => session.context,
                        Ok(None) => {
                            let rejection = Rejection::new(
                                ErrorCode::NoSuchSession,
                                "session expired while queued",
                            );
                            self.fail_admitted(&job.spec, &rejection).await;
                            send_error_frame(&job.frames, &rejection).await;
                            continue;
                        }
                        Err(e) => {
                            let rejection = internal(e);
                            self.fail_admitted(&job.spec, &rejection).await;
                            send_error_frame(&job.frames, &rejection).await;
                            continue;
                        }
                    }
                }
                None => Vec::new(),
            };

            let key = job
                .spec
                .session_id
                .clone()
                .unwrap_or_else(|| job.spec.request_id.clone());
            match self.pool.acquire(&key, seed).await {
                Ok(instance) => {
                    let dispatcher = Arc::clone(&this);
                    tokio::spawn(async move {
                        let result = dispatcher.run_job(&job.spec, instance).await;
                        match result {
                            Ok(Some(response)) => {
                                if let Some(frames) = &job.frames {
                                    let _ = frames
                                        .send(StreamFrame::Text {
                                            content: response.reply.clone(),
                                        })
                                        .await;
                                    let _ = frames
                                        .send(StreamFrame::Done {
                                            usage: response.usage,
                                            latency_ms: response.latency_ms,
                                        })
                                        .await;
                                }
                            }
                            Ok(None) => {
                                // Cancelled in flight: end the stream.
                                if let Some(frames) = &job.frames {
                                    let _ = frames
                                        .send(StreamFrame::Error {
                                            kind: "CANCELLED".to_owned(),
                                            message: "cancelled by client".to_owned(),
                                        })
                                        .await;
                                }
                            }
                            Err(rejection) => {
                                send_error_frame(&job.frames, &rejection).await;
                            }
                        }
                    });
                }
                Err(PoolError::Capacity) => {
                    self.queue.lock().await.push_front(job);
                    return;
                }
                Err(PoolError::ShuttingDown) => {
                    let rejection =
                        Rejection::new(ErrorCode::ShuttingDown, "service is shutting down");
                    self.fail_admitted(&job.spec, &rejection).await;
                    send_error_frame(&job.frames, &rejection).await;
                }
            }
        }
    }

    /// Refuse new submissions from now on.
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    /// Fail everything still parked in the queue.
    pub async fn fail_queued(&self, reason: &str) {
        let jobs: Vec<QueuedJob> = { self.queue.lock().await.drain(..).collect() };
        for job in jobs {
            if !self.requests.is_queued(&job.spec.request_id).await {
                continue;
            }
            let rejection = Rejection::new(ErrorCode::ShuttingDown, reason);
            self.fail_admitted(&job.spec, &rejection).await;
            send_error_frame(&job.frames, &rejection).await;
        }
    }

    /// Poll a request record owned by the caller.
    pub async fn poll(&self, request_id: &str, credential_id: &str) -> Option<RequestRecord> {
        self.requests.get_owned(request_id, credential_id).await
    }

    /// Cancel a queued request. Running requests are uninterruptible.
    pub async fn cancel(
        &self,
        request_id: &str,
        credential: &Credential,
    ) -> Result<(), Rejection> {
        let record = self
            .requests
            .get_owned(request_id, &credential.id)
            .await
            .ok_or_else(|| {
                Rejection::new(ErrorCode::NoSuchRequest, "request not found or expired")
            })?;

        if self.requests.cancel(&record.id).await {
            let mut entry = UsageEntry::new(&record.id, &credential.id, ENDPOINT_SUBMIT, 499);
            entry.error = Some("cancelled by client".to_owned());
            self.usage.record(entry);
            info!(request_id = %record.id, "queued request cancelled");
            Ok(())
        } else {
            Err(Rejection::new(ErrorCode::BadRequest, "request is not queued"))
        }
    }

    /// Remaining quota for a credential, without recording an arrival.
    pub fn quota(&self, credential: &Credential) -> RateDecision {
        let ceiling = credential.hourly_ceiling.unwrap_or(self.config.credential_ceiling);
        self.limiter.remaining(&credential_key(&credential.id), ceiling)
    }

    pub async fn queue_depth(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Terminal bookkeeping for an admitted submission that never ran.
    async fn fail_admitted(&self, spec: &JobSpec, rejection: &Rejection) {
        self.requests
            .fail(&spec.request_id, rejection.code.as_str(), &rejection.message)
            .await;
        let mut entry = UsageEntry::new(
            &spec.request_id,
            &spec.credential.id,
            ENDPOINT_SUBMIT,
            rejection.code.http_status(),
        );
        entry.error = Some(rejection.message.clone());
        entry.remote_addr = spec.remote_addr.clone();
        entry.client = spec.client.clone();
        self.usage.record(entry);
    }

    /// Usage row for a rejection that happened before a record existed.
    fn log_rejection(
        &self,
        request_id: &str,
        credential_id: &str,
        submission: &Submission,
        status: u16,
        error: &str,
    ) {
        let mut entry = UsageEntry::new(request_id, credential_id, ENDPOINT_SUBMIT, status);
        entry.error = Some(error.to_owned());
        entry.remote_addr = submission.remote_addr.clone();
        entry.client = submission.client.clone();
        self.usage.record(entry);
    }
}

async fn send_error_frame(frames: &Option<mpsc::Sender<StreamFrame>>, rejection: &Rejection) {
    if let Some(frames) = frames {
        let _ = frames
            .send(StreamFrame::Error {
                kind: rejection.code.as_str().to_owned(),
                message: rejection.message.clone(),
            })
            .await;
    }
}

fn credential_key(id: &str) -> String {
    format!("cred:{id}")
}

fn address_key(addr: &str) -> String {
    format!("addr:{addr}")
}

fn internal(e: impl std::fmt::Display) -> Rejection {
    Rejection::new(ErrorCode::Internal, e.to_string())
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
