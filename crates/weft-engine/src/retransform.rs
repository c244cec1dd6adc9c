//! Retransformation coordination
//!
//! Owns the installed rule set (copy-on-write: readers snapshot an Arc,
//! installs swap it atomically) and the per-type transformation records.
//! When the rule set changes, every recorded type whose hierarchy
//! intersects a changed rule's type pattern is marked stale and queued to
//! a dedicated worker thread, which re-runs the resolve/match/weave
//! pipeline and asks the host to redefine the type. One type's rejection
//! never aborts the rest of the batch.

use crate::host::{RedefineRejected, RejectionKind, ScopeId};
use crate::matcher::rule_targets_type;
use crossbeam::channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use weft_advice::{RuleError, RuleSet, RuleSetBuilder};

/// Per-type transformation state
///
/// A type starts untouched (no record), becomes `Transformed` after its
/// first pass through the pipeline, turns `Stale` when a rule-set change
/// affects it, and returns to `Transformed` when the worker re-applies
/// the pipeline. The record disappears with its scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeState {
    /// The recorded version is current
    Transformed,
    /// A rule-set change affects this type; retransformation is queued
    Stale,
}

/// Bookkeeping for one loaded type
#[derive(Debug, Clone)]
pub struct TransformationRecord {
    /// Rule-set version last applied
    pub applied_version: u64,
    /// Current state
    pub state: TypeState,
    /// Whether the applied pass actually rewrote the image
    pub woven: bool,
    /// Hierarchy membership snapshot taken at transformation time
    pub members: Arc<FxHashSet<String>>,
}

/// Re-runs the pipeline for one type; implemented by the agent
pub(crate) trait RetransformPipeline: Send + Sync {
    fn retransform(&self, scope: ScopeId, name: &str) -> Result<(), RedefineRejected>;
}

/// Copy-on-write holder of the installed rule set
struct RuleSetHolder {
    current: RwLock<Arc<RuleSet>>,
}

impl RuleSetHolder {
    fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(RuleSet::empty())),
        }
    }

    fn current(&self) -> Arc<RuleSet> {
        self.current.read().clone()
    }

    /// Build and swap in one step; the version is assigned under the
    /// write lock, so it is monotonic across concurrent installs
    fn install(&self, builder: RuleSetBuilder) -> Result<(Arc<RuleSet>, Arc<RuleSet>), RuleError> {
        let mut guard = self.current.write();
        let next = Arc::new(builder.build(guard.version() + 1)?);
        let previous = std::mem::replace(&mut *guard, next.clone());
        Ok((previous, next))
    }
}

/// Tracks transformation records and drives retransformation
pub struct RetransformCoordinator {
    holder: RuleSetHolder,
    records: Arc<DashMap<(ScopeId, String), TransformationRecord>>,
    tx: Mutex<Option<Sender<(ScopeId, String)>>>,
    rx: Mutex<Option<Receiver<(ScopeId, String)>>>,
    pending: Arc<AtomicUsize>,
    worker: Mutex<Option<JoinHandle<()>>>,
    max_attempts: u32,
}

impl RetransformCoordinator {
    /// Create a coordinator; the worker starts separately once the
    /// pipeline exists
    pub fn new(max_attempts: u32) -> Self {
        let (tx, rx) = unbounded();
        Self {
            holder: RuleSetHolder::new(),
            records: Arc::new(DashMap::new()),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            pending: Arc::new(AtomicUsize::new(0)),
            worker: Mutex::new(None),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Snapshot of the installed rule set
    pub fn current_rules(&self) -> Arc<RuleSet> {
        self.holder.current()
    }

    /// Number of queued or in-flight retransformations
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Record of a loaded type, if it went through the pipeline
    pub fn record(&self, scope: ScopeId, name: &str) -> Option<TransformationRecord> {
        self.records
            .get(&(scope, name.to_string()))
            .map(|entry| entry.clone())
    }

    /// Update a type's record after a successful pass
    pub fn record_transformed(
        &self,
        scope: ScopeId,
        name: &str,
        version: u64,
        woven: bool,
        members: Arc<FxHashSet<String>>,
    ) {
        self.records.insert(
            (scope, name.to_string()),
            TransformationRecord {
                applied_version: version,
                state: TypeState::Transformed,
                woven,
                members,
            },
        );
    }

    /// Drop every record belonging to a closed scope
    pub fn drop_scope(&self, scope: ScopeId) {
        self.records.retain(|(record_scope, _), _| *record_scope != scope);
    }

    /// Install a new rule set and queue every affected loaded type
    ///
    /// Returns the new version. A build failure leaves the previous set
    /// installed and no type queued.
    pub fn install_rules(&self, builder: RuleSetBuilder) -> Result<u64, RuleError> {
        let (previous, next) = self.holder.install(builder)?;

        let mut affected: Vec<(ScopeId, String)> = Vec::new();
        {
            let changed = previous.changed_rules(&next);
            for entry in self.records.iter() {
                let record = entry.value();
                if record.state == TypeState::Stale || record.applied_version == next.version() {
                    continue;
                }
                let (scope, name) = entry.key();
                if changed
                    .iter()
                    .any(|rule| rule_targets_type(rule, name, &record.members))
                {
                    affected.push((*scope, name.clone()));
                }
            }
        }

        debug!(
            version = next.version(),
            affected = affected.len(),
            "rule set installed"
        );
        for key in affected {
            if let Some(mut record) = self.records.get_mut(&key) {
                record.state = TypeState::Stale;
            }
            self.enqueue(key);
        }
        Ok(next.version())
    }

    fn enqueue(&self, key: (ScopeId, String)) {
        let guard = self.tx.lock();
        if let Some(tx) = guard.as_ref() {
            self.pending.fetch_add(1, Ordering::Relaxed);
            let _ = tx.send(key);
        }
    }

    /// Spawn the worker thread driving queued retransformations
    pub(crate) fn start_worker(&self, pipeline: Arc<dyn RetransformPipeline>) {
        let Some(rx) = self.rx.lock().take() else {
            return;
        };
        let pending = self.pending.clone();
        let records_mark = RecordsMark {
            records: self.records.clone(),
        };
        let max_attempts = self.max_attempts;

        let handle = thread::Builder::new()
            .name("weft-retransform".to_string())
            .spawn(move || {
                for (scope, name) in rx.iter() {
                    run_one(&*pipeline, scope, &name, max_attempts, &records_mark);
                    pending.fetch_sub(1, Ordering::Relaxed);
                }
            })
            .expect("Failed to spawn retransformation worker");
        *self.worker.lock() = Some(handle);
    }

    /// Stop the worker: close the queue and join with a bounded wait
    pub fn shutdown(&self) {
        self.tx.lock().take();
        if let Some(handle) = self.worker.lock().take() {
            let start = Instant::now();
            let timeout = Duration::from_secs(2);
            loop {
                if handle.is_finished() {
                    let _ = handle.join();
                    return;
                }
                if start.elapsed() > timeout {
                    drop(handle);
                    return;
                }
                thread::sleep(Duration::from_millis(5));
            }
        }
    }
}

/// Shared view of the record table handed to the worker
struct RecordsMark {
    records: Arc<DashMap<(ScopeId, String), TransformationRecord>>,
}

impl RecordsMark {
    fn end_stale_episode(&self, scope: ScopeId, name: &str) {
        if let Some(mut record) = self.records.get_mut(&(scope, name.to_string())) {
            if record.state == TypeState::Stale {
                record.state = TypeState::Transformed;
            }
        }
    }
}

fn run_one(
    pipeline: &dyn RetransformPipeline,
    scope: ScopeId,
    name: &str,
    max_attempts: u32,
    records: &RecordsMark,
) {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match pipeline.retransform(scope, name) {
            Ok(()) => return,
            Err(rejection) if rejection.kind == RejectionKind::Transient && attempt < max_attempts => {
                debug!(%scope, name, attempt, %rejection, "transient rejection, retrying");
                thread::sleep(Duration::from_millis(10 * attempt as u64));
            }
            Err(rejection) => {
                // The type stays at its last successfully applied
                // version; the rest of the batch proceeds.
                warn!(%scope, name, %rejection, "redefinition rejected");
                records.end_stale_episode(scope, name);
                return;
            }
        }
    }
}
