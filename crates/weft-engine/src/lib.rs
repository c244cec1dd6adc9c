//! Weft Interception Engine
//!
//! The matching-and-transformation core of the Weft agent:
//! - Hierarchy resolution and caching per class-loading scope
//! - Rule matching (a pure function over descriptor, hierarchy, rules)
//! - Method weaving with entry/return/throw hooks and capability mix-ins
//! - Retransformation when the rule set changes at runtime
//! - Watchdog observability for stuck concurrent transformations
//!
//! The engine runs inside the host's class-loading path: everything on
//! the load path is synchronous, bounded by hierarchy size and rule
//! count, and guaranteed never to panic or throw into the host.

#![warn(rust_2018_idioms)]

pub mod agent;
pub mod hierarchy;
pub mod host;
pub mod matcher;
pub mod retransform;
pub mod telemetry;
pub mod watchdog;
pub mod weaver;

pub use agent::{Agent, AgentConfig, Diagnostics};
pub use hierarchy::{AnalyzedHierarchy, CacheConfig, TypeHierarchyCache};
pub use host::{Host, HostError, RedefineRejected, RejectionKind, ScopeId};
pub use matcher::{match_type, MethodMatch, TypeMatches};
pub use retransform::{RetransformCoordinator, TransformationRecord, TypeState};
pub use telemetry::{HookDispatcher, HookSink, HookToken, NoopSink, Value};
pub use watchdog::{Watchdog, WatchdogConfig};
pub use weaver::{weave, WeaveError};
