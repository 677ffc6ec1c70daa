//! The per-cycle watch set and its partition into shards.
//!
//! Shard 0 reserves slot 0 for the update signal, so its entries sit at
//! slots `1..=capacity`. Every other shard starts its entries at slot 0.

use std::sync::Arc;

use crate::models::session::ResourceId;
use crate::watcher::process::ProcessHandle;
use crate::watcher::token::{SessionToken, Waitable};

/// One thing the watcher waits on this cycle.
#[derive(Debug, Clone)]
pub enum WatchEntry {
    /// An open session's token.
    Session {
        /// Locked resource.
        resource: ResourceId,
        /// Registry-owned token; never closed by the watcher.
        token: SessionToken,
    },
    /// A client process that has been launched but not locked its resource.
    Spawning {
        /// Resource being spawned.
        resource: ResourceId,
        /// Watcher-owned handle on the launched process.
        handle: Arc<ProcessHandle>,
    },
}

impl WatchEntry {
    /// The resource this entry belongs to.
    #[must_use]
    pub fn resource(&self) -> &ResourceId {
        match self {
            Self::Session { resource, .. } | Self::Spawning { resource, .. } => resource,
        }
    }

    /// The waitable behind this entry.
    #[must_use]
    pub fn waitable(&self) -> &dyn Waitable {
        match self {
            Self::Session { token, .. } => token,
            Self::Spawning { handle, .. } => handle.as_ref(),
        }
    }
}

/// Ordered partition of watch entries into shards.
#[derive(Debug, Clone)]
pub struct WatchSet {
    shards: Vec<Vec<WatchEntry>>,
    capacity: usize,
    pid_race: bool,
}

impl WatchSet {
    /// Split `entries` into shards of at most `capacity` entries, keeping
    /// their order. There is always at least one shard.
    #[must_use]
    pub fn partition(entries: Vec<WatchEntry>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut shards: Vec<Vec<WatchEntry>> =
            Vec::with_capacity(entries.len().div_ceil(capacity).max(1));
        let mut current = Vec::with_capacity(capacity.min(entries.len()));

        for entry in entries {
            if current.len() == capacity {
                shards.push(std::mem::take(&mut current));
            }
            current.push(entry);
        }

        if !current.is_empty() || shards.is_empty() {
            shards.push(current);
        }

        Self {
            shards,
            capacity,
            pid_race: false,
        }
    }

    /// Flag that some spawning session has no resolvable pid yet.
    #[must_use]
    pub fn with_pid_race(mut self, pid_race: bool) -> Self {
        self.pid_race = pid_race;
        self
    }

    /// Whether a spawning pid could not be resolved during the rescan.
    #[must_use]
    pub fn has_pid_race(&self) -> bool {
        self.pid_race
    }

    /// Number of shards (never zero).
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Maximum entries per shard.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries of one shard, empty when out of range.
    #[must_use]
    pub fn shard(&self, index: usize) -> &[WatchEntry] {
        match self.shards.get(index) {
            Some(entries) => entries,
            None => &[],
        }
    }

    /// Total entries across all shards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(Vec::len).sum()
    }

    /// Whether nothing is watched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate every entry in shard order.
    pub fn iter(&self) -> impl Iterator<Item = &WatchEntry> {
        self.shards.iter().flatten()
    }

    /// Count of session-token entries.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.iter()
            .filter(|entry| matches!(entry, WatchEntry::Session { .. }))
            .count()
    }

    /// Count of spawning-process entries.
    #[must_use]
    pub fn spawning_count(&self) -> usize {
        self.iter()
            .filter(|entry| matches!(entry, WatchEntry::Spawning { .. }))
            .count()
    }

    /// First entry slot of a shard.
    #[must_use]
    pub fn first_slot(shard: usize) -> usize {
        usize::from(shard == 0)
    }

    /// Map a signaled slot back to its entry. Slot 0 of shard 0 is the
    /// update signal and maps to `None`.
    #[must_use]
    pub fn entry_at(&self, shard: usize, slot: usize) -> Option<&WatchEntry> {
        let index = slot.checked_sub(Self::first_slot(shard))?;
        self.shards.get(shard)?.get(index)
    }
}
