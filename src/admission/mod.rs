//! Admission control for Portcullis
//!
//! A fixed-window rate limiter with a bounded FIFO wait queue per key.
//!
//! The global map lock is only held long enough to fetch or create a key's
//! window; all counting happens under that window's own mutex, so unrelated
//! keys never contend. Neither lock is held across an `.await`.

mod window;

pub use window::WindowSnapshot;

use crate::RequestContext;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep_until, Instant};
use window::{Arrival, WindowState};

/// Admission failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Rate limit exceeded for '{key}'; retry after {}s", retry_after.as_secs())]
    RateLimited { key: String, retry_after: Duration },

    #[error("Gave up waiting in the admission queue for '{key}'")]
    QueueOverflow { key: String },
}

/// Order in which queued callers are granted slots
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOrder {
    #[default]
    OldestFirst,
}

/// Which request attribute partitions the limiter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyBy {
    /// One window shared by every caller
    Global,
    /// Client socket address
    Ip,
    /// Subject of a validated bearer token, falling back to the client address
    #[default]
    Credential,
    /// Matched route prefix
    Route,
}

impl KeyBy {
    /// Derive the limiter key for a request
    ///
    /// `subject` must come from a token that passed validation; unvalidated
    /// credentials never select a window.
    pub fn resolve(&self, ctx: &RequestContext, subject: Option<&str>, route: Option<&str>) -> String {
        match self {
            KeyBy::Global => "global".to_string(),
            KeyBy::Ip => ip_key(ctx),
            KeyBy::Credential => match subject {
                Some(subject) => format!("sub:{}", subject),
                None => ip_key(ctx),
            },
            KeyBy::Route => format!("route:{}", route.unwrap_or("-")),
        }
    }
}

impl fmt::Display for KeyBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyBy::Global => "global",
            KeyBy::Ip => "ip",
            KeyBy::Credential => "credential",
            KeyBy::Route => "route",
        };
        f.write_str(name)
    }
}

fn ip_key(ctx: &RequestContext) -> String {
    match ctx.client_ip {
        Some(ip) => format!("ip:{}", ip),
        None => "ip:unknown".to_string(),
    }
}

/// Window and queue sizing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionLimits {
    pub permit_limit: u32,
    pub window: Duration,
    pub queue_limit: usize,
    pub queue_order: QueueOrder,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            permit_limit: 5,
            window: Duration::from_secs(15),
            queue_limit: 2,
            queue_order: QueueOrder::OldestFirst,
        }
    }
}

/// Proof of admission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permit {
    /// Key the slot was taken from
    pub key: String,
    /// Time spent queued (zero when admitted immediately)
    pub waited: Duration,
}

type Slot = Arc<Mutex<WindowState>>;

/// Fixed-window rate limiter with bounded FIFO queueing
pub struct AdmissionController {
    limits: AdmissionLimits,
    windows: Mutex<HashMap<String, Slot>>,
}

impl AdmissionController {
    pub fn new(limits: AdmissionLimits) -> Self {
        Self {
            limits,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn limits(&self) -> &AdmissionLimits {
        &self.limits
    }

    fn slot(&self, key: &str) -> Slot {
        let mut windows = self.windows.lock();
        windows
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(WindowState::default())))
            .clone()
    }

    /// Admit a request, queueing for as long as it takes
    pub async fn admit(&self, key: &str) -> Result<Permit, AdmissionError> {
        self.acquire(key, None).await
    }

    /// Admit a request, giving up with `QueueOverflow` once `deadline` passes
    pub async fn admit_with_deadline(
        &self,
        key: &str,
        deadline: Instant,
    ) -> Result<Permit, AdmissionError> {
        self.acquire(key, Some(deadline)).await
    }

    async fn acquire(&self, key: &str, deadline: Option<Instant>) -> Result<Permit, AdmissionError> {
        let arrived = Instant::now();
        let slot = self.slot(key);

        let arrival = slot.lock().arrive(arrived, &self.limits);
        let (id, grant) = match arrival {
            Arrival::Admitted => {
                return Ok(Permit {
                    key: key.to_string(),
                    waited: Duration::ZERO,
                })
            }
            Arrival::Rejected { retry_after } => {
                tracing::debug!(key = %key, ?retry_after, "Admission rejected; queue full");
                return Err(AdmissionError::RateLimited {
                    key: key.to_string(),
                    retry_after,
                });
            }
            Arrival::Queued { id, grant } => (id, grant),
        };

        tracing::debug!(key = %key, waiter = id, "Request queued for admission");
        let mut waiter = QueuedWaiter {
            slot: slot.clone(),
            limits: &self.limits,
            id,
            grant,
            claimed: false,
        };

        loop {
            let window_end = {
                let mut state = slot.lock();
                state.roll(Instant::now(), &self.limits);
                state.window_end(Instant::now(), &self.limits)
            };
            let wake = match deadline {
                Some(deadline) => window_end.min(deadline),
                None => window_end,
            };

            tokio::select! {
                biased;

                granted = &mut waiter.grant => {
                    if granted.is_err() {
                        tracing::warn!(key = %key, waiter = id, "Admission grant channel closed");
                        return Err(AdmissionError::QueueOverflow { key: key.to_string() });
                    }
                    waiter.claimed = true;
                    return Ok(Permit {
                        key: key.to_string(),
                        waited: arrived.elapsed(),
                    });
                }

                _ = sleep_until(wake) => {
                    let Some(deadline) = deadline else { continue };
                    if Instant::now() < deadline {
                        continue;
                    }

                    slot.lock().roll(Instant::now(), &self.limits);
                    if waiter.grant.try_recv().is_ok() {
                        waiter.claimed = true;
                        return Ok(Permit {
                            key: key.to_string(),
                            waited: arrived.elapsed(),
                        });
                    }
                    tracing::debug!(key = %key, waiter = id, "Admission deadline elapsed while queued");
                    return Err(AdmissionError::QueueOverflow { key: key.to_string() });
                }
            }
        }
    }

    /// Current counters for a key, if it has a window
    pub fn snapshot(&self, key: &str) -> Option<WindowSnapshot> {
        let slot = self.windows.lock().get(key).cloned()?;
        let snapshot = slot.lock().snapshot();
        Some(snapshot)
    }

    /// Number of keys with a live window
    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().len()
    }

    /// Evict windows that have elapsed with nobody waiting
    ///
    /// Returns how many windows were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, slot| {
            Arc::strong_count(slot) > 1 || !slot.lock().is_idle(now, &self.limits)
        });
        let evicted = before - windows.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = windows.len(), "Swept idle admission windows");
        }
        evicted
    }
}

/// Queue membership of one suspended caller
///
/// Dropping it before the grant is observed either removes the caller from
/// the queue or, if a slot was already granted, hands that slot back.
struct QueuedWaiter<'a> {
    slot: Slot,
    limits: &'a AdmissionLimits,
    id: u64,
    grant: tokio::sync::oneshot::Receiver<u64>,
    claimed: bool,
}

impl Drop for QueuedWaiter<'_> {
    fn drop(&mut self) {
        if self.claimed {
            return;
        }
        let mut state = self.slot.lock();
        if state.cancel(self.id) {
            return;
        }
        if let Ok(generation) = self.grant.try_recv() {
            state.refund(generation, self.limits);
        }
    }
}
