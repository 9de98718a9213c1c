// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::CorralConfig;
use crate::credential::CredentialStore;
use crate::dispatch::Dispatcher;
use crate::pool::Pool;
use crate::session::SessionStore;
use crate::storage::Storage;

/// Shared broker state handed to every HTTP handler.
pub struct CorralState {
    pub config: Arc<CorralConfig>,
    pub storage: Arc<Storage>,
    pub dispatcher: Arc<Dispatcher>,
    pub sessions: Arc<SessionStore>,
    pub credentials: Arc<CredentialStore>,
    pub pool: Arc<Pool>,
    pub shutdown: CancellationToken,
}

/// Return current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
