//! Transformation watchdog and cache maintenance
//!
//! Transformations run inside the host's class-loading critical sections
//! and cannot be cancelled from here. The watchdog is observability
//! only: a maintenance thread wakes on a fixed interval, warns once per
//! transformation that has been active beyond the liveness threshold,
//! and runs the hierarchy-cache sweep on the same tick.

use crate::hierarchy::TypeHierarchyCache;
use crate::host::ScopeId;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::warn;

/// Watchdog timing policy
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Fixed check interval
    pub interval: Duration,
    /// Liveness threshold before a transformation is reported stuck
    pub threshold: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            threshold: Duration::from_secs(5),
        }
    }
}

struct ActiveTransform {
    scope: ScopeId,
    type_name: String,
    thread_name: String,
    started: Instant,
    warned: AtomicBool,
}

/// Liveness monitor for in-flight transformations
pub struct Watchdog {
    active: DashMap<u64, ActiveTransform>,
    next_id: AtomicU64,
    warnings: AtomicU64,
    shutdown: AtomicBool,
    lock: Mutex<()>,
    notify: Condvar,
    handle: Mutex<Option<JoinHandle<()>>>,
    config: WatchdogConfig,
}

impl Watchdog {
    /// Create a watchdog with the given timing policy
    pub fn new(config: WatchdogConfig) -> Arc<Self> {
        Arc::new(Self {
            active: DashMap::new(),
            next_id: AtomicU64::new(1),
            warnings: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            lock: Mutex::new(()),
            notify: Condvar::new(),
            handle: Mutex::new(None),
            config,
        })
    }

    /// Register an in-flight transformation; dropping the guard ends it
    pub fn guard(self: &Arc<Self>, scope: ScopeId, type_name: &str) -> TransformGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.active.insert(
            id,
            ActiveTransform {
                scope,
                type_name: type_name.to_string(),
                thread_name: thread::current().name().unwrap_or("<unnamed>").to_string(),
                started: Instant::now(),
                warned: AtomicBool::new(false),
            },
        );
        TransformGuard {
            watchdog: self.clone(),
            id,
        }
    }

    /// Number of stuck-transformation warnings emitted so far
    pub fn warnings(&self) -> u64 {
        self.warnings.load(Ordering::Relaxed)
    }

    /// Number of currently active transformations
    pub fn active(&self) -> usize {
        self.active.len()
    }

    /// Start the maintenance thread
    pub fn start(self: &Arc<Self>, cache: Arc<TypeHierarchyCache>) {
        let watchdog = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("weft-maintenance".to_string())
            .spawn(move || {
                watchdog.run_loop(cache);
            })
            .expect("Failed to spawn maintenance thread");
        *self.handle.lock() = Some(handle);
    }

    fn run_loop(&self, cache: Arc<TypeHierarchyCache>) {
        loop {
            {
                let mut guard = self.lock.lock();
                let _ = self.notify.wait_for(&mut guard, self.config.interval);
            }
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            self.check_liveness();
            cache.sweep();
        }
    }

    fn check_liveness(&self) {
        for entry in self.active.iter() {
            let transform = entry.value();
            if transform.started.elapsed() < self.config.threshold {
                continue;
            }
            if transform.warned.swap(true, Ordering::Relaxed) {
                continue;
            }
            self.warnings.fetch_add(1, Ordering::Relaxed);
            // Diagnostic only: the loader lock cannot be broken safely
            // from outside the host.
            warn!(
                scope = %transform.scope,
                type_name = %transform.type_name,
                thread = %transform.thread_name,
                elapsed_ms = transform.started.elapsed().as_millis() as u64,
                "transformation active beyond liveness threshold, possible loader deadlock"
            );
        }
    }

    /// Stop the maintenance thread with a bounded join
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.notify.notify_one();

        if let Some(handle) = self.handle.lock().take() {
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

/// Active-transformation registration; removal happens on drop
pub struct TransformGuard {
    watchdog: Arc<Watchdog>,
    id: u64,
}

impl Drop for TransformGuard {
    fn drop(&mut self) {
        self.watchdog.active.remove(&self.id);
    }
}
