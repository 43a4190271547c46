use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::constants::SSE_PING_COMMENT;

// Channel feeding the client's SSE body; waits push liveness pings into it.
pub type PingSender = mpsc::Sender<Result<Bytes, std::io::Error>>;

const SLOT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
#[error("slot store error: {0}")]
pub struct SlotStoreError(pub String);

// Counter keyspace shared by every arbiter decision. Infrastructure errors
// surface as Err and are treated as deny by all callers (fail-closed).
pub trait SlotStore: Send + Sync {
    fn increment(&self, key: &str) -> Result<i64, SlotStoreError>;
    // Floors at zero; decrementing an absent key is a no-op.
    fn decrement(&self, key: &str) -> Result<i64, SlotStoreError>;
    fn current(&self, key: &str) -> Result<i64, SlotStoreError>;
}

#[derive(Default)]
pub struct InMemorySlotStore {
    counters: DashMap<String, i64>,
}

impl InMemorySlotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SlotStore for InMemorySlotStore {
    fn increment(&self, key: &str) -> Result<i64, SlotStoreError> {
        let mut entry = self.counters.entry(key.to_string()).or_insert(0);
        *entry += 1;
        Ok(*entry)
    }

    fn decrement(&self, key: &str) -> Result<i64, SlotStoreError> {
        let mut entry = self.counters.entry(key.to_string()).or_insert(0);
        *entry = (*entry - 1).max(0);
        Ok(*entry)
    }

    fn current(&self, key: &str) -> Result<i64, SlotStoreError> {
        Ok(self.counters.get(key).map(|v| *v).unwrap_or(0))
    }
}

// Releases its slot exactly once, on explicit release or on drop — drop is
// the safety net for cancellation and early-return paths.
pub struct SlotGuard {
    store: Arc<dyn SlotStore>,
    key: String,
    released: AtomicBool,
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish()
    }
}

impl SlotGuard {
    fn new(store: Arc<dyn SlotStore>, key: String) -> Self {
        Self {
            store,
            key,
            released: AtomicBool::new(false),
        }
    }

    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.store.decrement(&self.key) {
            tracing::warn!("[W-SLOT-RELEASE] failed_to_release_slot {}: {}", self.key, e);
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("slot wait timed out")]
    Timeout,
    #[error("request cancelled while waiting for slot")]
    Cancelled,
    #[error(transparent)]
    Infra(#[from] SlotStoreError),
}

pub fn user_slot_key(user_id: i64) -> String {
    format!("user:{}", user_id)
}

pub fn account_slot_key(account_id: i64) -> String {
    format!("account:{}", account_id)
}

// Wait-queue depth per concurrency cap. Monotone non-decreasing; zero
// disables waiting entirely.
pub fn calculate_max_wait(concurrency: i32) -> i64 {
    if concurrency <= 0 {
        return 0;
    }
    (concurrency as i64 * 3).min(60)
}

pub struct ConcurrencyArbiter {
    store: Arc<dyn SlotStore>,
    ping_interval: Duration,
}

impl ConcurrencyArbiter {
    pub fn new(store: Arc<dyn SlotStore>, ping_interval: Duration) -> Self {
        Self {
            store,
            ping_interval,
        }
    }

    pub fn store(&self) -> Arc<dyn SlotStore> {
        self.store.clone()
    }

    pub fn current_load(&self, key: &str) -> Result<i64, SlotStoreError> {
        self.store.current(key)
    }

    // Single atomic attempt. `cap <= 0` means uncapped, but the slot is
    // still counted so load-aware ranking sees it.
    pub fn try_acquire_slot(
        &self,
        key: &str,
        cap: i32,
    ) -> Result<Option<SlotGuard>, SlotStoreError> {
        let value = self.store.increment(key)?;
        if cap > 0 && value > cap as i64 {
            self.store.decrement(key)?;
            return Ok(None);
        }
        Ok(Some(SlotGuard::new(self.store.clone(), key.to_string())))
    }

    // Joins the wait queue for `key`. False when the queue is full or
    // waiting is disabled.
    pub fn increment_wait_count(&self, key: &str, max_waiters: i64) -> Result<bool, SlotStoreError> {
        if max_waiters <= 0 {
            return Ok(false);
        }
        let wait_key = format!("{}:wait", key);
        let value = self.store.increment(&wait_key)?;
        if value > max_waiters {
            self.store.decrement(&wait_key)?;
            return Ok(false);
        }
        Ok(true)
    }

    pub fn decrement_wait_count(&self, key: &str) {
        let wait_key = format!("{}:wait", key);
        if let Err(e) = self.store.decrement(&wait_key) {
            tracing::warn!("[W-WAIT-RELEASE] failed_to_decrement_wait_count {}: {}", wait_key, e);
        }
    }

    pub fn wait_count(&self, key: &str) -> Result<i64, SlotStoreError> {
        self.store.current(&format!("{}:wait", key))
    }

    // Blocking wait for a slot: polls until acquired, the deadline passes,
    // or the caller goes away. Streaming callers get comment pings so the
    // connection stays alive through the wait.
    pub async fn acquire_slot_with_wait(
        &self,
        key: &str,
        cap: i32,
        timeout: Duration,
        cancel: &CancellationToken,
        ping: Option<&PingSender>,
    ) -> Result<SlotGuard, AcquireError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut poll = tokio::time::interval(SLOT_POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ping_tick = tokio::time::interval(self.ping_interval.max(Duration::from_secs(1)));
        // The first interval tick fires immediately; swallow it so a ping
        // is only emitted after a full period of actual waiting.
        ping_tick.tick().await;

        loop {
            if let Some(guard) = self.try_acquire_slot(key, cap)? {
                return Ok(guard);
            }
            tokio::select! {
                _ = poll.tick() => {}
                _ = ping_tick.tick() => {
                    if let Some(sender) = ping {
                        debug!("slot_wait_ping key={}", key);
                        let _ = sender.send(Ok(Bytes::from_static(SSE_PING_COMMENT.as_bytes()))).await;
                    }
                }
                _ = cancel.cancelled() => return Err(AcquireError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Err(AcquireError::Timeout),
            }
        }
    }
}
