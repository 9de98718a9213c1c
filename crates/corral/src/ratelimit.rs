// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-key sliding-window admission.
//!
//! One timestamp per arrival inside the last window; eviction happens on
//! every check so the set stays bounded by the ceiling plus over-limit
//! traffic that has not yet aged out.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;

use crate::state::epoch_ms;

/// Outcome of one admission check or probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at_ms: u64,
}

/// Sliding-window rate limiter over arbitrary string keys.
pub struct SlidingWindow {
    window_ms: u64,
    entries: Mutex<HashMap<String, VecDeque<u64>>>,
}

impl SlidingWindow {
    pub fn new(window: Duration) -> Self {
        Self { window_ms: window.as_millis() as u64, entries: Mutex::new(HashMap::new()) }
    }

    /// Record an arrival and decide admission.
    ///
    /// The arrival is inserted before comparing, so the first ceiling+1
    /// arrival in a window is the first one rejected, and rejected
    /// arrivals keep the window saturated until they age out.
    pub fn check(&self, key: &str, ceiling: u32) -> RateDecision {
        let now = epoch_ms();
        let cutoff = now.saturating_sub(self.window_ms);

        let mut entries = self.entries.lock();
        let window = entries.entry(key.to_owned()).or_default();
        while window.front().is_some_and(|&at| at < cutoff) {
            window.pop_front();
        }
        window.push_back(now);

        let count = window.len() as u32;
        RateDecision {
            allowed: count <= ceiling,
            limit: ceiling,
            remaining: ceiling.saturating_sub(count),
            reset_at_ms: now + self.window_ms,
        }
    }

    /// Probe the current window without recording an arrival.
    pub fn remaining(&self, key: &str, ceiling: u32) -> RateDecision {
        let now = epoch_ms();
        let cutoff = now.saturating_sub(self.window_ms);

        let mut entries = self.entries.lock();
        let (count, oldest) = match entries.get_mut(key) {
            Some(window) => {
                while window.front().is_some_and(|&at| at < cutoff) {
                    window.pop_front();
                }
                let oldest = window.front().copied();
                if window.is_empty() {
                    entries.remove(key);
                    (0, None)
                } else {
                    (window.len() as u32, oldest)
                }
            }
            None => (0, None),
        };

        RateDecision {
            allowed: count < ceiling,
            limit: ceiling,
            remaining: ceiling.saturating_sub(count),
            reset_at_ms: oldest.map(|at| at + self.window_ms).unwrap_or(now),
        }
    }
}

#[cfg(test)]
#[path = "ratelimit_tests.rs"]
mod tests;
