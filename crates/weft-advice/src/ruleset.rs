//! Versioned rule sets
//!
//! A [`RuleSet`] is the immutable, ordered collection the engine matches
//! against. Declaration order is significant: it is the entry-hook
//! invocation order, and exit hooks run in the exact reverse order.
//! Construction goes through [`RuleSetBuilder`], which validates every
//! declaration before any rule becomes visible.

use crate::rule::{Rule, RuleDecl};
use crate::RuleError;
use std::sync::Arc;

/// An immutable, versioned, ordered collection of rules
#[derive(Debug, Clone)]
pub struct RuleSet {
    version: u64,
    rules: Vec<Arc<Rule>>,
}

impl RuleSet {
    /// The empty rule set, version 0
    pub fn empty() -> Self {
        Self {
            version: 0,
            rules: Vec::new(),
        }
    }

    /// Rule-set version; assigned by the installer, monotonically
    /// increasing
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Rules in declaration order
    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the set has no rules
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules present in exactly one of the two sets (symmetric
    /// difference, by declaration equality)
    pub fn changed_rules<'a>(&'a self, other: &'a RuleSet) -> Vec<&'a Rule> {
        let mut changed = Vec::new();
        for rule in &self.rules {
            if !other.rules.iter().any(|o| o.as_ref() == rule.as_ref()) {
                changed.push(rule.as_ref());
            }
        }
        for rule in &other.rules {
            if !self.rules.iter().any(|s| s.as_ref() == rule.as_ref()) {
                changed.push(rule.as_ref());
            }
        }
        changed
    }
}

/// Builder validating declarations into a rule set
///
/// `build` is all-or-nothing: the first malformed declaration fails the
/// whole build, so a previously installed set is never partially
/// replaced.
#[derive(Debug, Default)]
pub struct RuleSetBuilder {
    decls: Vec<RuleDecl>,
}

impl RuleSetBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder over existing declarations
    pub fn from_decls(decls: Vec<RuleDecl>) -> Self {
        Self { decls }
    }

    /// Append a declaration
    pub fn push(&mut self, decl: RuleDecl) -> &mut Self {
        self.decls.push(decl);
        self
    }

    /// Compile every declaration into a rule set with the given version
    pub fn build(self, version: u64) -> Result<RuleSet, RuleError> {
        let mut rules = Vec::with_capacity(self.decls.len());
        for decl in self.decls {
            rules.push(Arc::new(Rule::compile(decl)?));
        }
        Ok(RuleSet { version, rules })
    }
}
