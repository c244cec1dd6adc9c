//! Host runtime boundary
//!
//! The engine never owns type loading; it consumes structural queries
//! and redefinition from the host through this trait. Calls may block
//! (an ancestor may still be mid-load on another thread) and are never
//! assumed cheap, which is why everything behind them is cached.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use weft_bytecode::TypeDescriptor;

/// Identifier of a class-loading scope
///
/// Types are keyed by (scope, name); the same name in two scopes is two
/// distinct types. A scope that becomes unreachable is reported through
/// [`crate::agent::Agent::on_scope_closed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub u32);

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope#{}", self.0)
    }
}

/// Structural-query failures
#[derive(Debug, Error)]
pub enum HostError {
    /// The named type is unknown to the scope
    #[error("type {0} not found")]
    NotFound(String),

    /// The host failed internally
    #[error("host failure: {0}")]
    Failed(String),
}

/// Why the host refused a redefinition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    /// Worth retrying (the type was busy, the host was mid-GC, ...)
    Transient,
    /// Permanent: the new image is structurally incompatible
    Structural,
}

/// A rejected redefinition request
#[derive(Debug, Error)]
#[error("redefinition rejected ({kind:?}): {reason}")]
pub struct RedefineRejected {
    /// Whether a retry can succeed
    pub kind: RejectionKind,
    /// Host-supplied reason
    pub reason: String,
}

/// Structural-query and redefinition interface of the host runtime
pub trait Host: Send + Sync {
    /// Structural view of a type; may block while the host loads it
    fn get_structure(&self, scope: ScopeId, name: &str) -> Result<Arc<TypeDescriptor>, HostError>;

    /// Current raw image bytes of a loaded type
    fn get_raw_representation(&self, scope: ScopeId, name: &str) -> Result<Vec<u8>, HostError>;

    /// Replace the executable representation of a loaded type
    fn redefine(&self, scope: ScopeId, name: &str, bytes: Vec<u8>) -> Result<(), RedefineRejected>;
}
