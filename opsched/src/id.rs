// id.rs — Identifiers for nodes, scopes, compile tasks and workers
//
// Task ids come from an `IdAllocator`. The process-wide allocator is backed by
// one atomic counter, so ids stay unique across batches running on different
// threads and are never reused within a process lifetime.
//
// Scope ids are signed: positive ids belong to the upstream fusion passes,
// negative ids are handed out privately by `ScopeIdAllocator` for single-op
// and demoted scopes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// Index of a node inside a `Graph`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Scope identifier. Negative ids denote single-op (non-fusable) scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeId(pub i64);

impl ScopeId {
    /// Ids at or below zero never name a multi-node fusion group.
    pub fn is_fusion_assigned(self) -> bool {
        self.0 > 0
    }
}

/// Identifier of one compile task. Strictly increasing in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

/// Explicit unit of concurrency for submit/poll. Completions are delivered
/// per handle, so two callers on different handles never see each other's
/// results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerHandle(pub u64);

static NEXT_WORKER: AtomicU64 = AtomicU64::new(1);

impl WorkerHandle {
    /// A handle no other caller in this process holds.
    pub fn fresh() -> Self {
        WorkerHandle(NEXT_WORKER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

// ── Task id allocation ──────────────────────────────────────────────────────

/// Source of task ids. Implementations must hand out strictly increasing,
/// never repeated ids.
pub trait IdAllocator {
    fn next(&self) -> TaskId;
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Production allocator: one atomic counter shared by the whole process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessTaskIds;

impl IdAllocator for ProcessTaskIds {
    fn next(&self) -> TaskId {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Deterministic allocator starting at a chosen value. Used where a test or
/// a replay needs reproducible task ids.
#[derive(Debug)]
pub struct SequentialTaskIds {
    next: AtomicU64,
}

impl SequentialTaskIds {
    pub fn starting_at(first: u64) -> Self {
        SequentialTaskIds {
            next: AtomicU64::new(first),
        }
    }
}

impl Default for SequentialTaskIds {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl IdAllocator for SequentialTaskIds {
    fn next(&self) -> TaskId {
        TaskId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

// ── Scope id allocation ─────────────────────────────────────────────────────

/// Private negative counter for single-op scopes.
#[derive(Debug, Clone)]
pub struct ScopeIdAllocator {
    next: i64,
}

impl Default for ScopeIdAllocator {
    fn default() -> Self {
        ScopeIdAllocator { next: -1 }
    }
}

impl ScopeIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start strictly below every id in `existing` (and below zero).
    pub fn below<'a>(existing: impl IntoIterator<Item = &'a ScopeId>) -> Self {
        let min = existing.into_iter().map(|s| s.0).min().unwrap_or(0);
        ScopeIdAllocator {
            next: min.min(0).saturating_sub(1),
        }
    }

    /// Start below every key of an existing scope map.
    pub fn below_scopes<V>(scopes: &BTreeMap<ScopeId, V>) -> Self {
        Self::below(scopes.keys())
    }

    pub fn alloc(&mut self) -> Result<ScopeId, SchedulerError> {
        if self.next == i64::MIN {
            return Err(SchedulerError::ScopeIdExhausted);
        }
        let id = ScopeId(self.next);
        self.next -= 1;
        Ok(id)
    }

    /// Never raise the counter; only push it further down.
    pub fn reserve_below(&mut self, id: ScopeId) {
        if id.0 <= self.next {
            self.next = id.0.saturating_sub(1);
        }
    }
}
