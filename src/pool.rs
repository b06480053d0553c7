//! In-memory index of running workers.
//!
//! The pool holds non-owning entries keyed by runner id; the manager owns
//! the runners themselves. Entries are partitioned into idle and busy (the
//! platform's per-runner busy flag is authoritative, reconciled each
//! scaling tick) and indexed by capability tag for targeted selection.
//! The lock is never held across I/O.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use parking_lot::RwLock;

use crate::platform::{RemoteRunner, RemoteStatus};

/// Non-owning view of one running worker.
#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub id: u32,
    pub name: String,
    pub labels: Vec<String>,
    pub started_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolCounts {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
}

#[derive(Default)]
struct PoolInner {
    entries: BTreeMap<u32, PoolEntry>,
    /// Insertion-ordered ids; oldest idle first.
    idle: Vec<u32>,
    busy: Vec<u32>,
    by_capability: HashMap<String, Vec<u32>>,
}

impl PoolInner {
    fn detach(&mut self, id: u32) {
        self.idle.retain(|&i| i != id);
        self.busy.retain(|&i| i != id);
    }
}

/// Thread-safe pool of running workers.
#[derive(Default)]
pub struct Pool {
    inner: RwLock<PoolInner>,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a newly started runner. It begins idle.
    pub fn add(&self, entry: PoolEntry) {
        let mut inner = self.inner.write();
        let id = entry.id;
        for label in &entry.labels {
            inner
                .by_capability
                .entry(label.clone())
                .or_default()
                .push(id);
        }
        inner.entries.insert(id, entry);
        inner.detach(id);
        inner.idle.push(id);
    }

    pub fn remove(&self, id: u32) -> Option<PoolEntry> {
        let mut inner = self.inner.write();
        let entry = inner.entries.remove(&id)?;
        inner.detach(id);
        for ids in inner.by_capability.values_mut() {
            ids.retain(|&i| i != id);
        }
        Some(entry)
    }

    pub fn mark_busy(&self, id: u32) {
        let mut inner = self.inner.write();
        if inner.entries.contains_key(&id) && !inner.busy.contains(&id) {
            inner.detach(id);
            inner.busy.push(id);
        }
    }

    pub fn mark_idle(&self, id: u32) {
        let mut inner = self.inner.write();
        if inner.entries.contains_key(&id) && !inner.idle.contains(&id) {
            inner.detach(id);
            inner.idle.push(id);
        }
    }

    /// First idle runner whose capability set covers `required_tags`.
    pub fn pick_idle(&self, required_tags: &[&str]) -> Option<u32> {
        let inner = self.inner.read();
        inner.idle.iter().copied().find(|id| {
            let entry = &inner.entries[id];
            required_tags
                .iter()
                .all(|tag| entry.labels.iter().any(|l| l == tag))
        })
    }

    /// Up to `n` idle runners, oldest first.
    pub fn oldest_idle(&self, n: usize) -> Vec<u32> {
        let inner = self.inner.read();
        let mut ids: Vec<u32> = inner.idle.clone();
        ids.sort_by_key(|id| inner.entries[id].started_at);
        ids.truncate(n);
        ids
    }

    pub fn counts(&self) -> PoolCounts {
        let inner = self.inner.read();
        PoolCounts {
            total: inner.entries.len(),
            idle: inner.idle.len(),
            busy: inner.busy.len(),
        }
    }

    pub fn contains(&self, id: u32) -> bool {
        self.inner.read().entries.contains_key(&id)
    }

    /// Runner uptime, measured from when it entered the pool.
    pub fn uptime(&self, id: u32) -> Option<std::time::Duration> {
        self.inner
            .read()
            .entries
            .get(&id)
            .map(|e| e.started_at.elapsed())
    }

    pub fn ids(&self) -> Vec<u32> {
        self.inner.read().entries.keys().copied().collect()
    }

    /// Reconcile the idle/busy partition against the platform inventory.
    ///
    /// Runners the platform reports busy move to the busy set and vice
    /// versa; pool members absent from the inventory are left as they are
    /// (registration may still be propagating).
    pub fn reconcile(&self, remote: &[RemoteRunner]) {
        let mut inner = self.inner.write();
        let ids: Vec<u32> = inner.entries.keys().copied().collect();
        for id in ids {
            let name = inner.entries[&id].name.clone();
            let Some(observed) = remote.iter().find(|r| r.name == name) else {
                continue;
            };
            let busy = observed.busy && observed.status == RemoteStatus::Online;
            if busy && !inner.busy.contains(&id) {
                inner.detach(id);
                inner.busy.push(id);
            } else if !busy && !inner.idle.contains(&id) {
                inner.detach(id);
                inner.idle.push(id);
            }
        }
    }
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
