//! Interception rules
//!
//! A [`RuleDecl`] is the raw, serializable declaration the configuration
//! loader hands the engine; a [`Rule`] is the compiled, immutable form
//! with patterns resolved to match functions. Rules compare by their
//! declarations, which is what rule-set diffing is built on.

use crate::pattern::{ModifierMask, NamePattern, ParamsPattern, TypePattern};
use crate::RuleError;
use serde::{Deserialize, Serialize};
use weft_bytecode::MethodSig;

/// Hook contract of a rule
///
/// The entry hook always fires (it creates the token pairing the
/// invocation with its exit); return and throw participation can be
/// opted out per rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookSpec {
    /// Context name passed to the telemetry sink on every hook call
    pub context: String,
    /// Invoke the return hook
    #[serde(default = "default_true")]
    pub on_return: bool,
    /// Invoke the throw hook
    #[serde(default = "default_true")]
    pub on_throw: bool,
}

/// A capability mix-in injected into matching types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixinSpec {
    /// Interface name added to the woven type
    pub interface: String,
    /// Synthetic backing field carrying the mix-in state
    pub backing_field: String,
}

/// Raw rule declaration, as produced by the configuration loader
///
/// Exactly one of `target`, `subtype_of`, or `type_matches` must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDecl {
    /// Stable rule name, used for diffing and diagnostics
    pub name: String,
    /// Exact target type name
    #[serde(default)]
    pub target: Option<String>,
    /// Subtype-style target: matches any type whose hierarchy contains
    /// this name
    #[serde(default)]
    pub subtype_of: Option<String>,
    /// Wildcard pattern over the type's own name
    #[serde(default)]
    pub type_matches: Option<String>,
    /// Method-name pattern
    pub method: String,
    /// Parameter-type tokens; absent means any parameter list
    #[serde(default)]
    pub params: Option<Vec<String>>,
    /// Modifier tokens (`static`, `!private`, ...)
    #[serde(default)]
    pub modifiers: Vec<String>,
    /// Hook contract
    #[serde(flatten)]
    pub hooks: HookSpec,
    /// Whether an exact target propagates to overriding methods in
    /// subtypes
    #[serde(default = "default_true")]
    pub overrides: bool,
    /// Capability mix-in injected into matching types
    #[serde(default)]
    pub mixin: Option<MixinSpec>,
}

fn default_true() -> bool {
    true
}

impl RuleDecl {
    /// Start a declaration with the given name, method pattern, and hook
    /// context
    pub fn new(
        name: impl Into<String>,
        method: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target: None,
            subtype_of: None,
            type_matches: None,
            method: method.into(),
            params: None,
            modifiers: Vec::new(),
            hooks: HookSpec {
                context: context.into(),
                on_return: true,
                on_throw: true,
            },
            overrides: true,
            mixin: None,
        }
    }

    /// Target the type with exactly this name
    pub fn target(mut self, name: impl Into<String>) -> Self {
        self.target = Some(name.into());
        self
    }

    /// Target any subtype of this name
    pub fn subtype_of(mut self, name: impl Into<String>) -> Self {
        self.subtype_of = Some(name.into());
        self
    }

    /// Target any type whose own name matches this pattern
    pub fn type_matches(mut self, pattern: impl Into<String>) -> Self {
        self.type_matches = Some(pattern.into());
        self
    }

    /// Restrict the parameter list
    pub fn params(mut self, tokens: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.params = Some(tokens.into_iter().map(Into::into).collect());
        self
    }

    /// Require or forbid modifiers
    pub fn modifiers(mut self, tokens: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.modifiers = tokens.into_iter().map(Into::into).collect();
        self
    }

    /// Do not propagate an exact target to overriding methods
    pub fn no_overrides(mut self) -> Self {
        self.overrides = false;
        self
    }

    /// Inject a capability mix-in into matching types
    pub fn mixin(mut self, interface: impl Into<String>, backing_field: impl Into<String>) -> Self {
        self.mixin = Some(MixinSpec {
            interface: interface.into(),
            backing_field: backing_field.into(),
        });
        self
    }
}

/// A compiled, immutable interception rule
#[derive(Debug)]
pub struct Rule {
    decl: RuleDecl,
    type_pattern: TypePattern,
    method: NamePattern,
    params: ParamsPattern,
    modifiers: ModifierMask,
}

impl Rule {
    /// Compile a declaration; every pattern is validated here, so a
    /// malformed declaration never reaches the matcher
    pub fn compile(decl: RuleDecl) -> Result<Self, RuleError> {
        let rule = decl.name.clone();
        if decl.hooks.context.is_empty() {
            return Err(RuleError::EmptyContext { rule });
        }

        let targets = [&decl.target, &decl.subtype_of, &decl.type_matches];
        match targets.iter().filter(|t| t.is_some()).count() {
            0 => return Err(RuleError::MissingTarget { rule }),
            1 => {}
            _ => return Err(RuleError::AmbiguousTarget { rule }),
        }

        let type_pattern = if let Some(name) = &decl.target {
            if name.is_empty() {
                return Err(RuleError::EmptyPattern { rule });
            }
            TypePattern::Exact(name.clone())
        } else if let Some(name) = &decl.subtype_of {
            if name.is_empty() {
                return Err(RuleError::EmptyPattern { rule });
            }
            TypePattern::SubtypeOf(name.clone())
        } else {
            let raw = decl.type_matches.as_deref().unwrap_or_default();
            TypePattern::Matches(NamePattern::compile(&rule, raw)?)
        };

        let method = NamePattern::compile(&rule, &decl.method)?;
        let params = ParamsPattern::parse(&rule, decl.params.as_deref())?;
        let modifiers = ModifierMask::parse(&rule, &decl.modifiers)?;

        Ok(Self {
            decl,
            type_pattern,
            method,
            params,
            modifiers,
        })
    }

    /// Stable rule name
    pub fn name(&self) -> &str {
        &self.decl.name
    }

    /// The declaration this rule was compiled from
    pub fn decl(&self) -> &RuleDecl {
        &self.decl
    }

    /// The compiled target-type pattern
    pub fn type_pattern(&self) -> &TypePattern {
        &self.type_pattern
    }

    /// Hook contract
    pub fn hooks(&self) -> &HookSpec {
        &self.decl.hooks
    }

    /// Capability mix-in, if the rule injects one
    pub fn mixin(&self) -> Option<&MixinSpec> {
        self.decl.mixin.as_ref()
    }

    /// Whether an exact target propagates to overriding methods
    pub fn applies_to_overrides(&self) -> bool {
        self.decl.overrides
    }

    /// Test the method-signature part of the rule (name, parameters,
    /// modifiers) against a declared method
    pub fn matches_method(&self, sig: &MethodSig) -> bool {
        self.method.matches(&sig.name)
            && self.params.matches(&sig.params)
            && self.modifiers.matches(sig.flags)
    }
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.decl == other.decl
    }
}
