//! Keyed serialization queue
//!
//! One fair `tokio::sync::Mutex` per subject key, created on first use and
//! reclaimed when the last holder or waiter lets go. Waiters on a key are
//! served in arrival order; different keys never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

type Slot = Arc<tokio::sync::Mutex<()>>;

#[derive(Default)]
struct Inner {
    slots: Mutex<HashMap<String, Slot>>,
}

/// Arena of per-subject locks
#[derive(Clone, Default)]
pub struct SubjectQueue {
    inner: Arc<Inner>,
}

impl SubjectQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive ownership of `key`.
    pub async fn acquire(&self, key: &str) -> SubjectGuard {
        let slot = {
            let mut slots = self
                .inner
                .slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            slots.entry(key.to_string()).or_default().clone()
        };

        let guard = slot.clone().lock_owned().await;
        SubjectGuard {
            key: key.to_string(),
            slot,
            guard: Some(guard),
            inner: self.inner.clone(),
        }
    }

    /// Keys currently held or waited on.
    pub fn active_subjects(&self) -> usize {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Exclusive hold on one subject. Released on drop.
pub struct SubjectGuard {
    key: String,
    slot: Slot,
    guard: Option<OwnedMutexGuard<()>>,
    inner: Arc<Inner>,
}

impl SubjectGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for SubjectGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubjectGuard").field("key", &self.key).finish()
    }
}

impl Drop for SubjectGuard {
    fn drop(&mut self) {
        // Unlock first so a waiter can proceed even if reclamation is skipped.
        self.guard.take();

        let mut slots = self
            .inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Two references left: the map's and ours. Nobody else holds or waits.
        if Arc::strong_count(&self.slot) == 2 {
            slots.remove(&self.key);
        }
    }
}
