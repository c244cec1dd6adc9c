//! Rule matching
//!
//! A pure function from (descriptor, hierarchy, rule set) to the per-
//! method weave plan. No mutable state is touched, so the weaver and the
//! retransformation worker can call it from any thread, and identical
//! inputs always produce identical plans.

use crate::hierarchy::AnalyzedHierarchy;
use rustc_hash::FxHashSet;
use std::sync::Arc;
use weft_advice::{MixinSpec, Rule, RuleSet, TypePattern};
use weft_bytecode::{MethodSig, TypeDescriptor};

/// Weave plan for one declared method
#[derive(Debug)]
pub struct MethodMatch {
    /// Index of the method in the declaring image
    pub method_index: usize,
    /// The matched signature
    pub sig: MethodSig,
    /// Applicable rules, in rule-set declaration order; this is the
    /// entry-hook invocation order, and exit hooks run reversed
    pub rules: Vec<Arc<Rule>>,
    /// Hook context names, parallel to `rules`
    pub contexts: Vec<String>,
}

/// Weave plan for a whole type
#[derive(Debug)]
pub struct TypeMatches {
    /// Rule-set version the plan was derived from
    pub rule_version: u64,
    /// Methods with at least one applicable rule
    pub methods: Vec<MethodMatch>,
    /// Mix-ins to inject, deduplicated by interface
    pub mixins: Vec<MixinSpec>,
}

impl TypeMatches {
    /// Whether the plan changes nothing
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty() && self.mixins.is_empty()
    }
}

/// Compute the weave plan for a type
pub fn match_type(
    descriptor: &TypeDescriptor,
    hierarchy: &AnalyzedHierarchy,
    rules: &RuleSet,
) -> TypeMatches {
    let mut methods = Vec::new();
    for (method_index, sig) in descriptor.methods.iter().enumerate() {
        if sig.is_synthetic() || sig.is_bridge() {
            continue;
        }
        let mut matched: Vec<Arc<Rule>> = Vec::new();
        for rule in rules.rules() {
            if rule_applies(rule, descriptor, hierarchy, sig) {
                matched.push(rule.clone());
            }
        }
        if !matched.is_empty() {
            let contexts = matched
                .iter()
                .map(|rule| rule.hooks().context.clone())
                .collect();
            methods.push(MethodMatch {
                method_index,
                sig: sig.clone(),
                rules: matched,
                contexts,
            });
        }
    }

    let mut mixins: Vec<MixinSpec> = Vec::new();
    for rule in rules.rules() {
        if let Some(spec) = rule.mixin() {
            if hierarchy.mixins.iter().any(|m| m == &spec.interface)
                && !mixins.iter().any(|m| m.interface == spec.interface)
            {
                mixins.push(spec.clone());
            }
        }
    }

    TypeMatches {
        rule_version: rules.version(),
        methods,
        mixins,
    }
}

/// Whether one rule applies to one declared method
///
/// A rule applies at most once per method regardless of how many
/// hierarchy members its type pattern matches.
fn rule_applies(
    rule: &Rule,
    descriptor: &TypeDescriptor,
    hierarchy: &AnalyzedHierarchy,
    sig: &MethodSig,
) -> bool {
    if !rule.matches_method(sig) {
        return false;
    }
    match rule.type_pattern() {
        TypePattern::SubtypeOf(name) => {
            name == &descriptor.name || hierarchy.has_member(name)
        }
        TypePattern::Matches(pattern) => pattern.matches(&descriptor.name),
        TypePattern::Exact(name) => {
            if name == &descriptor.name {
                return true;
            }
            // Override inheritance: an exact target reaches a subtype's
            // method when the named ancestor declares an equal signature.
            rule.applies_to_overrides()
                && hierarchy.ancestors.iter().any(|ancestor| {
                    &ancestor.name == name
                        && ancestor.methods.iter().any(|m| m.same_signature(sig))
                })
        }
    }
}

/// Whether a rule's type pattern can reach a type, given its recorded
/// hierarchy membership; used to compute the retransformation set
pub fn rule_targets_type(rule: &Rule, type_name: &str, members: &FxHashSet<String>) -> bool {
    match rule.type_pattern() {
        TypePattern::Exact(name) | TypePattern::SubtypeOf(name) => {
            name == type_name || members.contains(name)
        }
        TypePattern::Matches(pattern) => pattern.matches(type_name),
    }
}
