//! Weft Advice Model
//!
//! Declarative interception rules ("advice") and versioned rule sets.
//! A rule names a target-type pattern, a method-signature pattern, and a
//! hook contract; a rule set is the immutable, ordered, versioned
//! collection the engine matches against. Rule sets are built atomically:
//! one malformed declaration fails the whole build and leaves the
//! previously installed set untouched.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod pattern;
pub mod rule;
pub mod ruleset;

pub use pattern::{ModifierMask, NamePattern, ParamToken, ParamsPattern, TypePattern};
pub use rule::{HookSpec, MixinSpec, Rule, RuleDecl};
pub use ruleset::{RuleSet, RuleSetBuilder};

use thiserror::Error;

/// Errors rejected at rule-set construction time
#[derive(Debug, Error)]
pub enum RuleError {
    /// A name pattern was empty
    #[error("rule {rule}: empty pattern")]
    EmptyPattern {
        /// Offending rule name
        rule: String,
    },

    /// A wildcard pattern did not compile
    #[error("rule {rule}: malformed pattern {pattern:?}: {source}")]
    MalformedPattern {
        /// Offending rule name
        rule: String,
        /// Raw pattern text
        pattern: String,
        /// Underlying regex error
        source: regex::Error,
    },

    /// A declaration named no target-type pattern
    #[error("rule {rule}: no target type (one of target, subtype_of, type_matches required)")]
    MissingTarget {
        /// Offending rule name
        rule: String,
    },

    /// A declaration named more than one target-type pattern
    #[error("rule {rule}: ambiguous target type (target, subtype_of, type_matches are exclusive)")]
    AmbiguousTarget {
        /// Offending rule name
        rule: String,
    },

    /// A declaration carried an empty hook context
    #[error("rule {rule}: empty hook context")]
    EmptyContext {
        /// Offending rule name
        rule: String,
    },

    /// A modifier token was not recognized
    #[error("rule {rule}: unknown modifier {modifier:?}")]
    UnknownModifier {
        /// Offending rule name
        rule: String,
        /// Unrecognized modifier token
        modifier: String,
    },

    /// A variadic marker appeared in a non-trailing position
    #[error("rule {rule}: variadic marker \"..\" must be the last parameter token")]
    MisplacedVariadic {
        /// Offending rule name
        rule: String,
    },
}
