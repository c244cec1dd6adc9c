//! Type hierarchy resolution and caching
//!
//! This module owns the analyzed view of every loaded type: the resolved
//! superclass chain, the transitive interface set, and the capability
//! mix-ins the current rule set injects. Entries are cached per
//! (scope, name) and shared read-only with the matcher and the weaver.

mod cache;

pub use cache::{CacheConfig, TypeHierarchyCache};

use rustc_hash::FxHashSet;
use std::sync::Arc;
use weft_advice::{RuleSet, TypePattern};
use weft_bytecode::TypeDescriptor;

/// Resolved transitive hierarchy of a type
///
/// `member_names` holds every supertype name reachable from the
/// declaration, including names whose own structure could not be
/// resolved; `unresolved` marks the branches that were truncated at the
/// loaded-world boundary.
#[derive(Debug)]
pub struct AnalyzedHierarchy {
    /// The type this hierarchy belongs to
    pub descriptor: Arc<TypeDescriptor>,
    /// Resolved ancestor descriptors (classes and interfaces), in
    /// breadth-first declaration order
    pub ancestors: Vec<Arc<TypeDescriptor>>,
    /// Every known supertype name, resolved or not
    pub member_names: FxHashSet<String>,
    /// Declared ancestor names whose structure was unavailable
    pub unresolved: Vec<String>,
    /// Capability mix-in interfaces the rule set injects into this type
    pub mixins: Vec<String>,
    /// Rule-set version the mix-in set was computed against
    pub rule_version: u64,
}

impl AnalyzedHierarchy {
    /// Whether a name is the type itself, a supertype, or an injected
    /// mix-in
    pub fn has_member(&self, name: &str) -> bool {
        self.descriptor.name == name
            || self.member_names.contains(name)
            || self.mixins.iter().any(|m| m == name)
    }
}

/// Compute the mix-in interfaces a rule set injects into a type
///
/// Membership is decided against the declared hierarchy only; a mix-in
/// never makes the type eligible for another mix-in.
pub(crate) fn compute_mixins(
    descriptor: &TypeDescriptor,
    member_names: &FxHashSet<String>,
    rules: &RuleSet,
) -> Vec<String> {
    let mut mixins: Vec<String> = Vec::new();
    for rule in rules.rules() {
        let Some(spec) = rule.mixin() else { continue };
        let applies = match rule.type_pattern() {
            TypePattern::Exact(name) | TypePattern::SubtypeOf(name) => {
                name == &descriptor.name || member_names.contains(name)
            }
            TypePattern::Matches(pattern) => pattern.matches(&descriptor.name),
        };
        if applies && !mixins.iter().any(|m| m == &spec.interface) {
            mixins.push(spec.interface.clone());
        }
    }
    mixins
}
