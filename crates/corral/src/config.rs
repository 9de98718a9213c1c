// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Multi-tenant request broker for interactive CLI agents.
#[derive(Debug, Clone, Parser)]
#[command(name = "corral", version, about)]
pub struct CorralConfig {
    /// Host address to bind to.
    #[arg(long, env = "CORRAL_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// HTTP port to listen on.
    #[arg(long, env = "CORRAL_PORT", default_value = "8080")]
    pub port: u16,

    /// Path to the SQLite database file.
    #[arg(long, env = "CORRAL_DB", default_value = "corral.db")]
    pub db: PathBuf,

    /// Config directory override exported to the CLI child
    /// (account selection).
    #[arg(long, env = "CORRAL_CLI_CONFIG_DIR")]
    pub cli_config_dir: Option<PathBuf>,

    /// Hard cap on live CLI instances.
    #[arg(long, env = "CORRAL_MAX_INSTANCES", default_value = "5")]
    pub max_instances: usize,

    /// Messages served by one instance before it is recycled.
    #[arg(long, env = "CORRAL_MAX_MESSAGES_PER_INSTANCE", default_value = "50")]
    pub max_messages_per_instance: u32,

    /// Instance age cap in seconds before recycling.
    #[arg(long, env = "CORRAL_MAX_INSTANCE_AGE", default_value = "3600")]
    pub max_instance_age_secs: u64,

    /// Idle seconds before an instance is destroyed.
    #[arg(long, env = "CORRAL_IDLE_TIMEOUT", default_value = "300")]
    pub idle_timeout_secs: u64,

    /// Wall-clock timeout for one CLI call, in seconds (upper bound 300).
    #[arg(long = "per-call-timeout", env = "CORRAL_PER_CALL_TIMEOUT", default_value = "120")]
    pub per_call_timeout_secs: u64,

    /// Seconds a streaming consumer may wait between frames.
    #[arg(long, env = "CORRAL_STREAM_IDLE_TIMEOUT", default_value = "300")]
    pub stream_idle_timeout_secs: u64,

    /// Conversation pairs forwarded to the CLI ahead of a new prompt.
    #[arg(long, env = "CORRAL_HISTORY_PAIRS", default_value = "4")]
    pub history_pairs: usize,

    /// Default session TTL in seconds (bounded 300–86400).
    #[arg(long = "session-ttl", env = "CORRAL_SESSION_TTL", default_value = "3600")]
    pub session_ttl_secs: u64,

    /// Context entries kept per session before head trimming.
    #[arg(long, env = "CORRAL_SESSION_CONTEXT_CAP", default_value = "50")]
    pub session_context_cap: usize,

    /// Seconds a terminal request record stays pollable.
    #[arg(long, env = "CORRAL_RESULT_RETENTION", default_value = "3600")]
    pub result_retention_secs: u64,

    /// Sliding-window length for rate limiting, in seconds.
    #[arg(long, env = "CORRAL_RATE_LIMIT_WINDOW", default_value = "3600")]
    pub rate_limit_window_secs: u64,

    /// Per-credential ceiling inside the window (overridable per row).
    #[arg(long, env = "CORRAL_CREDENTIAL_CEILING", default_value = "100")]
    pub credential_hourly_ceiling: u32,

    /// Per-address ceiling inside the window (0 = disabled).
    #[arg(long, env = "CORRAL_ADDRESS_CEILING", default_value = "0")]
    pub address_hourly_ceiling: u32,

    /// Submissions held in the dispatch queue before back-pressure.
    #[arg(long, env = "CORRAL_QUEUE_CAPACITY", default_value = "100")]
    pub queue_capacity: usize,

    /// Seconds a validated credential stays cached.
    #[arg(long, env = "CORRAL_CREDENTIAL_CACHE_TTL", default_value = "300")]
    pub credential_cache_ttl_secs: u64,

    /// Interval between expired-session sweeps, in seconds.
    #[arg(long, env = "CORRAL_SWEEP_INTERVAL", default_value = "1800")]
    pub sweep_interval_secs: u64,

    /// Milliseconds between destroy retries while an instance is busy.
    #[arg(long, env = "CORRAL_DESTROY_RETRY_MS", default_value = "2000")]
    pub destroy_retry_ms: u64,

    /// Interval between pool maintenance passes (age caps), in seconds.
    #[arg(long, env = "CORRAL_MAINTENANCE_INTERVAL", default_value = "30")]
    pub maintenance_interval_secs: u64,

    /// Seconds in-flight calls get to finish after shutdown begins.
    #[arg(long, env = "CORRAL_SHUTDOWN_GRACE", default_value = "10")]
    pub shutdown_grace_secs: u64,

    /// Hard shutdown ceiling in seconds.
    #[arg(long, env = "CORRAL_SHUTDOWN_HARD_TIMEOUT", default_value = "30")]
    pub shutdown_hard_timeout_secs: u64,

    /// Log format (json or text).
    #[arg(long, env = "CORRAL_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "CORRAL_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// CLI command to broker (after --). Defaults to `claude`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub cli_command: Vec<String>,
}

impl CorralConfig {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_instances == 0 {
            anyhow::bail!("--max-instances must be at least 1");
        }
        if self.max_messages_per_instance == 0 {
            anyhow::bail!("--max-messages-per-instance must be at least 1");
        }
        if self.per_call_timeout_secs == 0 || self.per_call_timeout_secs > 300 {
            anyhow::bail!("--per-call-timeout must be in 1..=300 seconds");
        }
        if !(300..=86_400).contains(&self.session_ttl_secs) {
            anyhow::bail!("--session-ttl must be in 300..=86400 seconds");
        }
        if self.session_context_cap < 2 {
            anyhow::bail!("--session-context-cap must hold at least one exchange");
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("--queue-capacity must be at least 1");
        }
        if self.rate_limit_window_secs == 0 {
            anyhow::bail!("--rate-limit-window must be at least 1 second");
        }
        match self.log_format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("invalid log format: {other}"),
        }
        Ok(())
    }

    /// The CLI program and arguments, defaulting to `claude`.
    pub fn effective_cli_command(&self) -> Vec<String> {
        if self.cli_command.is_empty() {
            vec!["claude".to_owned()]
        } else {
            self.cli_command.clone()
        }
    }

    pub fn per_call_timeout(&self) -> Duration {
        Duration::from_secs(self.per_call_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn max_instance_age(&self) -> Duration {
        Duration::from_secs(self.max_instance_age_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn result_retention(&self) -> Duration {
        Duration::from_secs(self.result_retention_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn credential_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.credential_cache_ttl_secs)
    }

    pub fn destroy_retry(&self) -> Duration {
        Duration::from_millis(self.destroy_retry_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn shutdown_hard_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_hard_timeout_secs)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
