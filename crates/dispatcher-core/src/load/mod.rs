//! # Call-load tracker
//!
//! Remembers which destination serves each in-flight call routed by the
//! least-loaded algorithm, so the destination's load counter follows the call
//! through failover, confirmation and hangup.
//!
//! Calls are spread over a power-of-two number of buckets by the hash of
//! their Call-ID. Each bucket has its own lock and no operation holds more
//! than one bucket lock at a time. [`CallLoadTracker::get`] returns a copy of
//! the entry, so no lock outlives a call.
//!
//! Entries carry two deadlines: one from creation and one that only applies
//! while the call is unconfirmed. [`CallLoadTracker::sweep`] drops entries
//! past either deadline and gives their load back exactly once.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{DispatcherError, Result};
use crate::hash::ds_hash;
use crate::registry::{Generation, Registry};
use crate::types::SetId;

/// Lifecycle of a tracked call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallLoadState {
    /// INVITE routed, no 2xx seen yet
    Init,
    Confirmed,
}

/// A tracked call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallLoadEntry {
    pub call_id: String,
    pub duid: String,
    pub group: SetId,
    pub state: CallLoadState,
    pub created: Instant,
    /// Removed after this instant whatever the state
    pub expires: Option<Instant>,
    /// Removed after this instant while still `Init`
    pub init_expires: Option<Instant>,
}

impl CallLoadEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires.is_some_and(|at| at < now)
            || (self.state == CallLoadState::Init && self.init_expires.is_some_and(|at| at < now))
    }
}

/// Tracker sizing and deadlines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerSettings {
    /// Rounded up to a power of two
    pub buckets: usize,
    /// Zero disables the deadline
    pub expire: Duration,
    /// Zero disables the deadline
    pub init_expire: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            buckets: 256,
            expire: Duration::from_secs(7200),
            init_expire: Duration::from_secs(7200),
        }
    }
}

type Bucket = Mutex<HashMap<String, CallLoadEntry>>;

pub struct CallLoadTracker {
    buckets: Vec<Bucket>,
    mask: usize,
    registry: Arc<Registry>,
    settings: TrackerSettings,
}

impl CallLoadTracker {
    pub fn new(registry: Arc<Registry>, settings: TrackerSettings) -> Self {
        let size = settings.buckets.max(1).next_power_of_two();
        let buckets = (0..size).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            buckets,
            mask: size - 1,
            registry,
            settings,
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket(&self, call_id: &str) -> &Bucket {
        let index = ds_hash(Some(call_id), None) as usize & self.mask;
        &self.buckets[index]
    }

    fn deadline(&self, now: Instant, after: Duration) -> Option<Instant> {
        if after.is_zero() {
            None
        } else {
            Some(now + after)
        }
    }

    fn new_entry(&self, call_id: &str, duid: &str, group: SetId) -> CallLoadEntry {
        let now = Instant::now();
        CallLoadEntry {
            call_id: call_id.to_string(),
            duid: duid.to_string(),
            group,
            state: CallLoadState::Init,
            created: now,
            expires: self.deadline(now, self.settings.expire),
            init_expires: self.deadline(now, self.settings.init_expire),
        }
    }

    /// Account `call_id` to destination `duid` of `group`.
    ///
    /// Returns `false` when the call is already tracked; the existing entry
    /// and the load counters are left alone.
    pub fn add(&self, call_id: &str, duid: &str, group: SetId) -> Result<bool> {
        let generation = self.registry.snapshot();
        let destination = generation
            .lookup(group)
            .ok_or(DispatcherError::SetNotFound(group))?
            .find_by_duid(duid)
            .ok_or_else(|| DispatcherError::DestinationNotFound {
                group,
                address: duid.to_string(),
            })?;

        {
            let mut bucket = self.bucket(call_id).lock();
            if bucket.contains_key(call_id) {
                debug!("call {} already tracked", call_id);
                return Ok(false);
            }
            bucket.insert(call_id.to_string(), self.new_entry(call_id, duid, group));
        }

        destination.increment_load();
        debug!("call {} accounted to {} in set {}", call_id, duid, group);
        Ok(true)
    }

    /// Copy of the entry for `call_id`
    pub fn get(&self, call_id: &str) -> Option<CallLoadEntry> {
        self.bucket(call_id).lock().get(call_id).cloned()
    }

    /// Stop tracking `call_id` and give its load back
    pub fn remove(&self, call_id: &str) -> Result<CallLoadEntry> {
        let entry = self
            .bucket(call_id)
            .lock()
            .remove(call_id)
            .ok_or_else(|| DispatcherError::TrackerMiss(call_id.to_string()))?;

        self.release(&self.registry.snapshot(), &entry);
        Ok(entry)
    }

    /// Move `call_id` to destination `new_duid` of the same group
    pub fn replace(&self, call_id: &str, new_duid: &str) -> Result<()> {
        let generation = self.registry.snapshot();
        let (old, new) = {
            let mut bucket = self.bucket(call_id).lock();
            let entry = bucket
                .get_mut(call_id)
                .ok_or_else(|| DispatcherError::TrackerMiss(call_id.to_string()))?;
            let set = generation
                .lookup(entry.group)
                .ok_or(DispatcherError::SetNotFound(entry.group))?;
            let missing = |duid: &str| DispatcherError::DestinationNotFound {
                group: entry.group,
                address: duid.to_string(),
            };
            let old = set.find_by_duid(&entry.duid).ok_or_else(|| missing(&entry.duid))?;
            let new = set.find_by_duid(new_duid).ok_or_else(|| missing(new_duid))?;

            *entry = self.new_entry(call_id, new_duid, entry.group);
            (old, new)
        };

        old.decrement_load();
        new.increment_load();
        debug!("call {} moved to {}", call_id, new_duid);
        Ok(())
    }

    pub fn set_state(&self, call_id: &str, state: CallLoadState) -> Result<()> {
        let mut bucket = self.bucket(call_id).lock();
        let entry = bucket
            .get_mut(call_id)
            .ok_or_else(|| DispatcherError::TrackerMiss(call_id.to_string()))?;
        entry.state = state;
        Ok(())
    }

    /// Mark the call answered
    pub fn confirm(&self, call_id: &str) -> Result<()> {
        self.set_state(call_id, CallLoadState::Confirmed)
    }

    /// Drop every entry past a deadline at `now`. Returns the number removed.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let generation = self.registry.snapshot();
        let mut removed = 0;
        for bucket in &self.buckets {
            let mut expired = Vec::new();
            bucket.lock().retain(|_, entry| {
                if entry.is_expired(now) {
                    expired.push(entry.clone());
                    false
                } else {
                    true
                }
            });
            for entry in &expired {
                debug!("call {} expired", entry.call_id);
                self.release(&generation, entry);
            }
            removed += expired.len();
        }
        removed
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Forget every call without touching load counters
    pub fn clear(&self) {
        for bucket in &self.buckets {
            bucket.lock().clear();
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, generation: &Generation, entry: &CallLoadEntry) {
        match generation
            .lookup(entry.group)
            .and_then(|set| set.find_by_duid(&entry.duid))
        {
            Some(destination) => destination.decrement_load(),
            None => warn!(
                "destination {} of set {} gone, load of call {} dropped",
                entry.duid, entry.group, entry.call_id
            ),
        }
    }

    /// Sweep every `interval` until `cancel` fires
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = self.sweep();
                        if removed > 0 {
                            info!("expired {} tracked calls", removed);
                        }
                    }
                    _ = cancel.cancelled() => {
                        debug!("call-load sweeper stopped");
                        break;
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for CallLoadTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallLoadTracker")
            .field("buckets", &self.buckets.len())
            .field("settings", &self.settings)
            .finish()
    }
}
