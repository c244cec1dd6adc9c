//! Agent facade
//!
//! Wires the hierarchy cache, matcher, weaver, coordinator, and watchdog
//! into the two entry points the host calls: the per-type load
//! notification and the administrative interface. Nothing in here ever
//! panics into the host's class-loading path; any internal failure logs
//! and hands the original bytes back.

use crate::hierarchy::{CacheConfig, TypeHierarchyCache};
use crate::host::{Host, HostError, RedefineRejected, RejectionKind, ScopeId};
use crate::matcher::match_type;
use crate::retransform::{RetransformCoordinator, RetransformPipeline, TransformationRecord};
use crate::telemetry::{HookDispatcher, HookSink};
use crate::watchdog::{Watchdog, WatchdogConfig};
use crate::weaver::weave;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use tracing::{debug, warn};
use weft_advice::{RuleError, RuleSetBuilder};
use weft_bytecode::{ClassImage, TypeDescriptor};

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Type-name prefixes never woven; defaults to the agent's own
    /// hook-runtime namespace
    pub excluded_prefixes: Vec<String>,
    /// Hierarchy-cache sizing policy
    pub cache: CacheConfig,
    /// Watchdog timing policy
    pub watchdog: WatchdogConfig,
    /// Attempts per type before a transient redefinition rejection is
    /// given up on
    pub max_redefine_attempts: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            excluded_prefixes: vec!["weft/".to_string(), "weft.".to_string()],
            cache: CacheConfig::default(),
            watchdog: WatchdogConfig::default(),
            max_redefine_attempts: 3,
        }
    }
}

/// Operator-facing diagnostics snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostics {
    /// Version of the installed rule set
    pub rule_set_version: u64,
    /// Hierarchy-cache entry count
    pub cache_entries: usize,
    /// Queued or in-flight retransformations
    pub pending_retransforms: usize,
    /// Stuck-transformation warnings emitted
    pub watchdog_warnings: u64,
    /// Hook-sink panics caught at the dispatch boundary
    pub hook_failures: u64,
}

enum PassResult {
    /// The pipeline ran but the plan changed nothing
    Unchanged {
        version: u64,
        members: Arc<FxHashSet<String>>,
    },
    /// The image was rewritten
    Rewritten {
        bytes: Vec<u8>,
        version: u64,
        members: Arc<FxHashSet<String>>,
    },
    /// The image could not be processed; the type stays untouched
    Skipped,
}

struct AgentCore {
    host: Arc<dyn Host>,
    cache: Arc<TypeHierarchyCache>,
    coordinator: Arc<RetransformCoordinator>,
    dispatcher: Arc<HookDispatcher>,
    watchdog: Arc<Watchdog>,
    config: AgentConfig,
}

impl AgentCore {
    fn excluded(&self, name: &str) -> bool {
        self.config
            .excluded_prefixes
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
    }

    /// One resolve/match/weave pass over raw bytes
    fn run_pass(&self, scope: ScopeId, name: &str, bytes: &[u8]) -> PassResult {
        let descriptor = match TypeDescriptor::peek(bytes) {
            Ok(descriptor) => Arc::new(descriptor),
            Err(err) => {
                warn!(%scope, name, %err, "undecodable image, leaving type untouched");
                return PassResult::Skipped;
            }
        };

        let rules = self.coordinator.current_rules();
        let hierarchy = self
            .cache
            .resolve(self.host.as_ref(), scope, descriptor.clone(), &rules);
        let matches = match_type(&descriptor, &hierarchy, &rules);

        let mut members = hierarchy.member_names.clone();
        members.extend(hierarchy.mixins.iter().cloned());
        let members = Arc::new(members);
        let version = rules.version();

        if matches.is_empty() {
            return PassResult::Unchanged { version, members };
        }

        let image = match ClassImage::decode(bytes) {
            Ok(image) => image,
            Err(err) => {
                warn!(%scope, name, %err, "undecodable image, leaving type untouched");
                return PassResult::Skipped;
            }
        };
        match weave(&image, &matches) {
            Ok(None) => PassResult::Unchanged { version, members },
            Ok(Some(woven)) => PassResult::Rewritten {
                bytes: woven.encode(),
                version,
                members,
            },
            Err(err) => {
                warn!(%scope, name, %err, "weaving failed, leaving type untouched");
                PassResult::Skipped
            }
        }
    }
}

impl RetransformPipeline for AgentCore {
    fn retransform(&self, scope: ScopeId, name: &str) -> Result<(), RedefineRejected> {
        let previously_woven = self
            .coordinator
            .record(scope, name)
            .map(|record| record.woven)
            .unwrap_or(false);

        // The host hands back the pristine original representation, not
        // the previously woven bytes.
        let bytes = match self.host.get_raw_representation(scope, name) {
            Ok(bytes) => bytes,
            Err(HostError::NotFound(_)) => {
                debug!(%scope, name, "type gone before retransformation");
                return Ok(());
            }
            Err(HostError::Failed(reason)) => {
                return Err(RedefineRejected {
                    kind: RejectionKind::Transient,
                    reason,
                })
            }
        };

        let _guard = self.watchdog.guard(scope, name);
        match self.run_pass(scope, name, &bytes) {
            PassResult::Skipped => Ok(()),
            PassResult::Unchanged { version, members } => {
                if previously_woven {
                    // The new rule set no longer touches this type;
                    // restore the original image.
                    self.host.redefine(scope, name, bytes)?;
                    self.cache.invalidate(scope, name);
                }
                self.coordinator
                    .record_transformed(scope, name, version, false, members);
                Ok(())
            }
            PassResult::Rewritten {
                bytes: woven,
                version,
                members,
            } => {
                self.host.redefine(scope, name, woven)?;
                self.cache.invalidate(scope, name);
                self.coordinator
                    .record_transformed(scope, name, version, true, members);
                Ok(())
            }
        }
    }
}

/// The interception agent
///
/// One instance per host process; all entry points are callable from any
/// thread.
pub struct Agent {
    core: Arc<AgentCore>,
}

impl Agent {
    /// Build and start an agent over a host and a telemetry sink
    pub fn new(host: Arc<dyn Host>, sink: Arc<dyn HookSink>, config: AgentConfig) -> Self {
        let cache = Arc::new(TypeHierarchyCache::new(config.cache.clone()));
        let coordinator = Arc::new(RetransformCoordinator::new(config.max_redefine_attempts));
        let watchdog = Watchdog::new(config.watchdog.clone());
        let dispatcher = Arc::new(HookDispatcher::new(sink));

        let core = Arc::new(AgentCore {
            host,
            cache: cache.clone(),
            coordinator: coordinator.clone(),
            dispatcher,
            watchdog: watchdog.clone(),
            config,
        });
        coordinator.start_worker(core.clone());
        watchdog.start(cache);
        Self { core }
    }

    /// Build an agent with default configuration
    pub fn with_defaults(host: Arc<dyn Host>, sink: Arc<dyn HookSink>) -> Self {
        Self::new(host, sink, AgentConfig::default())
    }

    /// Load notification: called once per type immediately before it
    /// becomes active
    ///
    /// Returns the rewritten image bytes, or `None` to keep the original
    /// representation.
    pub fn on_type_load(&self, scope: ScopeId, name: &str, bytes: &[u8]) -> Option<Vec<u8>> {
        if self.core.excluded(name) {
            return None;
        }
        let _guard = self.core.watchdog.guard(scope, name);
        match self.core.run_pass(scope, name, bytes) {
            PassResult::Skipped => None,
            PassResult::Unchanged { version, members } => {
                self.core
                    .coordinator
                    .record_transformed(scope, name, version, false, members);
                None
            }
            PassResult::Rewritten {
                bytes,
                version,
                members,
            } => {
                self.core
                    .coordinator
                    .record_transformed(scope, name, version, true, members);
                Some(bytes)
            }
        }
    }

    /// A class-loading scope became unreachable; drop everything keyed
    /// to it
    pub fn on_scope_closed(&self, scope: ScopeId) {
        self.core.cache.invalidate_scope(scope);
        self.core.coordinator.drop_scope(scope);
    }

    /// A type was redefined outside the agent; invalidate every cached
    /// hierarchy that contains it
    pub fn on_type_redefined(&self, scope: ScopeId, name: &str) {
        self.core.cache.invalidate(scope, name);
    }

    /// Install a new rule set
    ///
    /// Returns the new version. Affected loaded types are marked stale
    /// and retransformed in the background. A build failure leaves the
    /// previous set installed.
    pub fn update_rule_set(&self, builder: RuleSetBuilder) -> Result<u64, RuleError> {
        self.core.coordinator.install_rules(builder)
    }

    /// Transformation record of a loaded type, if it went through the
    /// pipeline
    pub fn record(&self, scope: ScopeId, name: &str) -> Option<TransformationRecord> {
        self.core.coordinator.record(scope, name)
    }

    /// The dispatcher the host's hook instructions call into
    pub fn dispatcher(&self) -> Arc<HookDispatcher> {
        self.core.dispatcher.clone()
    }

    /// Operator diagnostics snapshot
    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            rule_set_version: self.core.coordinator.current_rules().version(),
            cache_entries: self.core.cache.len(),
            pending_retransforms: self.core.coordinator.pending(),
            watchdog_warnings: self.core.watchdog.warnings(),
            hook_failures: self.core.dispatcher.failures(),
        }
    }

    /// Stop the background worker and the maintenance thread
    pub fn shutdown(&self) {
        self.core.coordinator.shutdown();
        self.core.watchdog.stop();
    }
}
