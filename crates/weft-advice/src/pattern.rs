//! Compiled rule patterns
//!
//! Every pattern compiles, at rule-set build time, into a boolean match
//! function over names, parameter lists, or modifier flags. Wildcard
//! patterns (`*` and `?`) compile to anchored regexes; exact patterns
//! stay plain string comparisons.

use crate::RuleError;
use weft_bytecode::descriptor::method_flags;

/// A name pattern: exact text, the any-wildcard, or a glob
#[derive(Debug, Clone)]
pub struct NamePattern {
    raw: String,
    matcher: NameMatcher,
}

#[derive(Debug, Clone)]
enum NameMatcher {
    Exact(String),
    Any,
    Glob(regex::Regex),
}

impl NamePattern {
    /// Compile a pattern; `*` matches any run of characters, `?` any
    /// single character
    pub fn compile(rule: &str, raw: &str) -> Result<Self, RuleError> {
        if raw.is_empty() {
            return Err(RuleError::EmptyPattern {
                rule: rule.to_string(),
            });
        }
        let matcher = if raw == "*" {
            NameMatcher::Any
        } else if raw.contains('*') || raw.contains('?') {
            let mut source = String::with_capacity(raw.len() + 8);
            source.push('^');
            for ch in raw.chars() {
                match ch {
                    '*' => source.push_str(".*"),
                    '?' => source.push('.'),
                    other => source.push_str(&regex::escape(&other.to_string())),
                }
            }
            source.push('$');
            let compiled = regex::Regex::new(&source).map_err(|source| {
                RuleError::MalformedPattern {
                    rule: rule.to_string(),
                    pattern: raw.to_string(),
                    source,
                }
            })?;
            NameMatcher::Glob(compiled)
        } else {
            NameMatcher::Exact(raw.to_string())
        };
        Ok(Self {
            raw: raw.to_string(),
            matcher,
        })
    }

    /// The raw pattern text
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Test a name against the pattern
    pub fn matches(&self, name: &str) -> bool {
        match &self.matcher {
            NameMatcher::Exact(text) => name == text,
            NameMatcher::Any => true,
            NameMatcher::Glob(regex) => regex.is_match(name),
        }
    }
}

/// A target-type pattern
#[derive(Debug, Clone)]
pub enum TypePattern {
    /// The type with exactly this name; propagates to overriding methods
    /// in subtypes unless the rule opts out
    Exact(String),
    /// Any type whose hierarchy (self included) contains this name
    SubtypeOf(String),
    /// Any type whose own name matches this pattern
    Matches(NamePattern),
}

impl TypePattern {
    /// The name an exact or subtype pattern targets, if any
    pub fn target_name(&self) -> Option<&str> {
        match self {
            TypePattern::Exact(name) | TypePattern::SubtypeOf(name) => Some(name),
            TypePattern::Matches(_) => None,
        }
    }
}

/// One token of a parameter-list pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamToken {
    /// Matches any single parameter type
    Any,
    /// Matches exactly this parameter type name
    Type(String),
}

impl ParamToken {
    fn matches(&self, param: &str) -> bool {
        match self {
            ParamToken::Any => true,
            ParamToken::Type(name) => name == param,
        }
    }
}

/// A parameter-list pattern
///
/// A `*` token matches any type at that position but still consumes
/// exactly one parameter; arity-independent matching requires the
/// trailing variadic marker `..`.
#[derive(Debug, Clone)]
pub enum ParamsPattern {
    /// Any parameter list
    Any,
    /// A token list, optionally variadic after the listed prefix
    List {
        /// Per-position tokens
        tokens: Vec<ParamToken>,
        /// Whether arbitrary trailing parameters are accepted
        variadic: bool,
    },
}

impl ParamsPattern {
    /// Parse a declared token list; `None` means any parameter list
    pub fn parse(rule: &str, decl: Option<&[String]>) -> Result<Self, RuleError> {
        let Some(decl) = decl else {
            return Ok(ParamsPattern::Any);
        };
        let mut tokens = Vec::with_capacity(decl.len());
        let mut variadic = false;
        for (position, raw) in decl.iter().enumerate() {
            if raw == ".." {
                if position + 1 != decl.len() {
                    return Err(RuleError::MisplacedVariadic {
                        rule: rule.to_string(),
                    });
                }
                variadic = true;
            } else if raw == "*" {
                tokens.push(ParamToken::Any);
            } else {
                tokens.push(ParamToken::Type(raw.clone()));
            }
        }
        Ok(ParamsPattern::List { tokens, variadic })
    }

    /// Test a parameter list against the pattern
    pub fn matches(&self, params: &[String]) -> bool {
        match self {
            ParamsPattern::Any => true,
            ParamsPattern::List { tokens, variadic } => {
                let arity_ok = if *variadic {
                    params.len() >= tokens.len()
                } else {
                    params.len() == tokens.len()
                };
                arity_ok
                    && tokens
                        .iter()
                        .zip(params)
                        .all(|(token, param)| token.matches(param))
            }
        }
    }
}

/// Required and forbidden method modifier flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModifierMask {
    /// Flags that must all be set
    pub required: u16,
    /// Flags that must all be clear
    pub forbidden: u16,
}

impl ModifierMask {
    /// Parse modifier tokens; a leading `!` forbids the flag
    pub fn parse(rule: &str, decl: &[String]) -> Result<Self, RuleError> {
        let mut mask = ModifierMask::default();
        for token in decl {
            let (negated, name) = match token.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, token.as_str()),
            };
            let flag = match name {
                "public" => method_flags::PUBLIC,
                "private" => method_flags::PRIVATE,
                "static" => method_flags::STATIC,
                "abstract" => method_flags::ABSTRACT,
                _ => {
                    return Err(RuleError::UnknownModifier {
                        rule: rule.to_string(),
                        modifier: token.clone(),
                    })
                }
            };
            if negated {
                mask.forbidden |= flag;
            } else {
                mask.required |= flag;
            }
        }
        Ok(mask)
    }

    /// Test method flags against the mask
    pub fn matches(&self, flags: u16) -> bool {
        flags & self.required == self.required && flags & self.forbidden == 0
    }
}
