//! Method weaving
//!
//! The weaver takes a decoded class image plus a weave plan and emits a
//! new image; the input is never mutated. Around every matched method
//! body it splices an entry sequence (one `EnterHook` per rule, in
//! declaration order), an exit block (`ReturnHook` per rule, reversed),
//! and a catch-all handler (`ThrowHook` per rule, reversed, then a
//! rethrow). Splicing is done on instruction indices through an old-to-
//! new relocation map, so every original jump target and handler range
//! survives the insertion.
//!
//! Calling convention: instance methods receive the receiver in local
//! slot 0 and parameters from slot 1.

use crate::matcher::{MethodMatch, TypeMatches};
use thiserror::Error;
use tracing::debug;
use weft_advice::MixinSpec;
use weft_bytecode::descriptor::method_flags;
use weft_bytecode::image::{ClassImage, FieldDef, HandlerEntry, MethodDef};
use weft_bytecode::{verify_image, ConstantPool, Insn, MethodSig, VerifyError};

/// Index sentinel patched to the exit block once its position is known
const EXIT_SENTINEL: u32 = u32::MAX;

/// Weaving failures
///
/// These never reach the host's load path; the agent logs them and hands
/// the original bytes back.
#[derive(Debug, Error)]
pub enum WeaveError {
    /// Hook slots would overflow the local index space
    #[error("{method}: cannot allocate hook slots (local count {local_count}, {rules} rules)")]
    LocalOverflow {
        /// Method name
        method: String,
        /// Declared local count
        local_count: u16,
        /// Matched rule count
        rules: usize,
    },

    /// The input body jumps outside itself
    #[error("{method}: input jump target {target} outside body of length {len}")]
    BadJumpTarget {
        /// Method name
        method: String,
        /// Offending target
        target: u32,
        /// Input body length
        len: usize,
    },

    /// The input handler table references a range outside the body
    #[error("{method}: input handler range {start}..{end} outside body of length {len}")]
    BadHandlerRange {
        /// Method name
        method: String,
        /// Range start
        start: u32,
        /// Range end
        end: u32,
        /// Input body length
        len: usize,
    },

    /// The woven image failed structural verification
    #[error(transparent)]
    Verify(#[from] VerifyError),
}

/// Weave a class image according to a plan
///
/// Returns `None` when the plan changes nothing, so the caller can hand
/// the original bytes back unmodified. The output image always passes
/// [`verify_image`].
pub fn weave(image: &ClassImage, matches: &TypeMatches) -> Result<Option<ClassImage>, WeaveError> {
    if matches.is_empty() {
        return Ok(None);
    }

    let mut woven = image.clone();
    let mut changed = false;
    for spec in &matches.mixins {
        changed |= apply_mixin(&mut woven, spec);
    }

    let ClassImage { methods, pool, .. } = &mut woven;
    for plan in &matches.methods {
        let Some(method) = methods.get_mut(plan.method_index) else {
            continue;
        };
        if method.code.is_empty() {
            // Abstract or native bodies have nothing to wrap.
            debug!(method = %method.sig.name, "skipping bodyless matched method");
            continue;
        }
        weave_method(method, plan, pool)?;
        changed = true;
    }

    if !changed {
        return Ok(None);
    }
    verify_image(&woven)?;
    Ok(Some(woven))
}

/// Add a mix-in interface, its backing field, and synthetic accessors
///
/// Idempotent: a type already carrying the interface is left untouched.
/// The backing field starts null; the host's object model owns that
/// initialization, which precedes any hook execution.
fn apply_mixin(image: &mut ClassImage, spec: &MixinSpec) -> bool {
    if image.interfaces.iter().any(|i| i == &spec.interface) {
        return false;
    }
    image.interfaces.push(spec.interface.clone());

    let field_index = image.fields.len() as u16;
    image.fields.push(FieldDef {
        name: spec.backing_field.clone(),
        flags: method_flags::SYNTHETIC,
    });

    let accessor_base = spec.backing_field.trim_start_matches('$');
    image.methods.push(MethodDef {
        sig: MethodSig {
            name: format!("{accessor_base}$get"),
            params: vec![],
            ret: "object".to_string(),
            flags: method_flags::PUBLIC | method_flags::SYNTHETIC,
        },
        local_count: 1,
        code: vec![Insn::LoadLocal(0), Insn::LoadField(field_index), Insn::Return],
        handlers: vec![],
    });
    image.methods.push(MethodDef {
        sig: MethodSig {
            name: format!("{accessor_base}$set"),
            params: vec!["object".to_string()],
            ret: "void".to_string(),
            flags: method_flags::PUBLIC | method_flags::SYNTHETIC,
        },
        local_count: 2,
        code: vec![
            Insn::LoadLocal(0),
            Insn::LoadLocal(1),
            Insn::StoreField(field_index),
            Insn::ReturnVoid,
        ],
        handlers: vec![],
    });
    true
}

fn weave_method(
    method: &mut MethodDef,
    plan: &MethodMatch,
    pool: &mut ConstantPool,
) -> Result<(), WeaveError> {
    let rule_count = plan.rules.len();
    let returns_value = method.sig.returns_value();
    let base = method.local_count;
    let extra = rule_count + usize::from(returns_value);
    let new_local_count = (base as usize)
        .checked_add(extra)
        .filter(|&total| total <= u16::MAX as usize)
        .ok_or(WeaveError::LocalOverflow {
            method: method.sig.name.clone(),
            local_count: base,
            rules: rule_count,
        })? as u16;
    let token_slot = |i: usize| base + i as u16;
    let result_slot = base + rule_count as u16;

    let contexts: Vec<u32> = plan
        .contexts
        .iter()
        .map(|context| pool.intern(context))
        .collect();

    let old_len = method.code.len();
    let mut code: Vec<Insn> = Vec::with_capacity(old_len + 3 * rule_count + 8);

    // Entry sequence, declaration order.
    for (i, &context) in contexts.iter().enumerate() {
        code.push(Insn::EnterHook {
            context,
            token_slot: token_slot(i),
        });
    }
    let prologue = code.len();

    // Relocate the original body; returns are redirected to the shared
    // exit block.
    let mut map: Vec<u32> = Vec::with_capacity(old_len);
    for insn in &method.code {
        map.push(code.len() as u32);
        match insn {
            Insn::Return => {
                if returns_value {
                    code.push(Insn::StoreLocal(result_slot));
                }
                code.push(Insn::Jump(EXIT_SENTINEL));
            }
            Insn::ReturnVoid => code.push(Insn::Jump(EXIT_SENTINEL)),
            other => code.push(other.clone()),
        }
    }
    let body_end = code.len();

    for insn in &mut code[prologue..body_end] {
        if let Some(target) = insn.jump_target() {
            if target == EXIT_SENTINEL {
                continue;
            }
            let relocated =
                map.get(target as usize)
                    .copied()
                    .ok_or(WeaveError::BadJumpTarget {
                        method: plan.sig.name.clone(),
                        target,
                        len: old_len,
                    })?;
            insn.set_jump_target(relocated);
        }
    }

    // Exit block: the return value (if any) is back on the stack while
    // the return hooks run, reversed.
    let exit_index = code.len() as u32;
    if returns_value {
        code.push(Insn::LoadLocal(result_slot));
    }
    for i in (0..rule_count).rev() {
        if plan.rules[i].hooks().on_return {
            code.push(Insn::ReturnHook {
                token_slot: token_slot(i),
            });
        }
    }
    code.push(if returns_value {
        Insn::Return
    } else {
        Insn::ReturnVoid
    });

    // Catch-all handler: throw hooks reversed, then rethrow unchanged.
    let handler_index = code.len() as u32;
    for i in (0..rule_count).rev() {
        if plan.rules[i].hooks().on_throw {
            code.push(Insn::ThrowHook {
                token_slot: token_slot(i),
            });
        }
    }
    code.push(Insn::Throw);

    for insn in &mut code[prologue..body_end] {
        if insn.jump_target() == Some(EXIT_SENTINEL) {
            insn.set_jump_target(exit_index);
        }
    }

    // Original handler entries keep their relative positions and stay
    // ahead of the catch-all, so inner handlers still win the first-match
    // lookup.
    let mut handlers = Vec::with_capacity(method.handlers.len() + 1);
    for entry in &method.handlers {
        let relocate = |index: u32| -> Result<u32, WeaveError> {
            if index as usize == old_len {
                return Ok(body_end as u32);
            }
            map.get(index as usize)
                .copied()
                .ok_or(WeaveError::BadHandlerRange {
                    method: plan.sig.name.clone(),
                    start: entry.start,
                    end: entry.end,
                    len: old_len,
                })
        };
        handlers.push(HandlerEntry {
            start: relocate(entry.start)?,
            end: relocate(entry.end)?,
            handler: relocate(entry.handler)?,
        });
    }
    handlers.push(HandlerEntry {
        start: prologue as u32,
        end: body_end as u32,
        handler: handler_index,
    });

    method.code = code;
    method.local_count = new_local_count;
    method.handlers = handlers;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::AnalyzedHierarchy;
    use crate::matcher::match_type;
    use rustc_hash::FxHashSet;
    use std::sync::Arc;
    use weft_advice::{RuleDecl, RuleSet, RuleSetBuilder};
    use weft_bytecode::TypeDescriptor;

    fn image_with_run() -> ClassImage {
        let mut image = ClassImage::new("Derived");
        image.superclass = Some("Base".to_string());
        image.methods.push(MethodDef {
            sig: MethodSig {
                name: "run".to_string(),
                params: vec![],
                ret: "int".to_string(),
                flags: method_flags::PUBLIC,
            },
            local_count: 1,
            code: vec![Insn::ConstI64(42), Insn::Return],
            handlers: vec![],
        });
        image
    }

    fn plan_for(image: &ClassImage, rules: &RuleSet) -> TypeMatches {
        let descriptor = Arc::new(image.descriptor());
        let member_names: FxHashSet<String> =
            image.superclass.iter().cloned().collect();
        let mixins = crate::hierarchy::compute_mixins(&descriptor, &member_names, rules);
        let hierarchy = AnalyzedHierarchy {
            descriptor: descriptor.clone(),
            ancestors: vec![Arc::new(TypeDescriptor::named("Base"))],
            member_names,
            unresolved: Vec::new(),
            mixins,
            rule_version: rules.version(),
        };
        match_type(&descriptor, &hierarchy, rules)
    }

    fn two_rule_set() -> RuleSet {
        RuleSetBuilder::from_decls(vec![
            RuleDecl::new("r1", "run", "ctx-1").subtype_of("Base"),
            RuleDecl::new("r2", "run", "ctx-2").subtype_of("Base"),
        ])
        .build(1)
        .unwrap()
    }

    #[test]
    fn test_empty_plan_returns_none() {
        let image = image_with_run();
        let rules = RuleSet::empty();
        let plan = plan_for(&image, &rules);
        assert!(weave(&image, &plan).unwrap().is_none());
    }

    #[test]
    fn test_woven_shape_two_rules() {
        let image = image_with_run();
        let rules = two_rule_set();
        let plan = plan_for(&image, &rules);
        let woven = weave(&image, &plan).unwrap().unwrap();

        let method = woven.method("run").unwrap();
        // 2 entries + (const, store, jump) + (load, 2 return hooks, return)
        // + (2 throw hooks, throw)
        assert_eq!(method.code.len(), 12);
        assert_eq!(method.local_count, 4); // this + 2 tokens + result
        assert_eq!(method.handlers.len(), 1);

        // Entry order is declaration order.
        let ctx = |index: u32| woven.pool.get(index).unwrap().to_string();
        match (&method.code[0], &method.code[1]) {
            (
                Insn::EnterHook { context: a, token_slot: s1 },
                Insn::EnterHook { context: b, token_slot: s2 },
            ) => {
                assert_eq!(ctx(*a), "ctx-1");
                assert_eq!(ctx(*b), "ctx-2");
                assert_eq!((*s1, *s2), (1, 2));
            }
            other => panic!("unexpected prologue: {other:?}"),
        }

        // Exit hooks reversed.
        let return_hooks: Vec<u16> = method
            .code
            .iter()
            .filter_map(|insn| match insn {
                Insn::ReturnHook { token_slot } => Some(*token_slot),
                _ => None,
            })
            .collect();
        assert_eq!(return_hooks, [2, 1]);

        let throw_hooks: Vec<u16> = method
            .code
            .iter()
            .filter_map(|insn| match insn {
                Insn::ThrowHook { token_slot } => Some(*token_slot),
                _ => None,
            })
            .collect();
        assert_eq!(throw_hooks, [2, 1]);

        // Catch-all covers exactly the relocated body.
        let handler = method.handlers[0];
        assert_eq!(handler.start, 2);
        assert_eq!(handler.end, 5);
    }

    #[test]
    fn test_original_jumps_relocated() {
        let mut image = ClassImage::new("Derived");
        image.superclass = Some("Base".to_string());
        image.methods.push(MethodDef {
            sig: MethodSig {
                name: "run".to_string(),
                params: vec![],
                ret: "int".to_string(),
                flags: method_flags::PUBLIC,
            },
            local_count: 1,
            code: vec![
                Insn::ConstTrue,
                Insn::JumpIfFalse(4), // to the second return
                Insn::ConstI64(1),
                Insn::Return,
                Insn::ConstI64(2),
                Insn::Return,
            ],
            handlers: vec![],
        });
        let rules = RuleSetBuilder::from_decls(vec![
            RuleDecl::new("r", "run", "ctx").subtype_of("Base")
        ])
        .build(1)
        .unwrap();
        let plan = plan_for(&image, &rules);
        let woven = weave(&image, &plan).unwrap().unwrap();
        let method = woven.method("run").unwrap();

        // Prologue is 1 instruction; old index 4 relocates past the two
        // extra instructions the first return expanded into.
        let jump = method
            .code
            .iter()
            .find_map(|insn| match insn {
                Insn::JumpIfFalse(target) => Some(*target),
                _ => None,
            })
            .unwrap();
        assert!(matches!(method.code[jump as usize], Insn::ConstI64(2)));
    }

    #[test]
    fn test_original_handlers_stay_ahead_of_catch_all() {
        let mut image = ClassImage::new("Derived");
        image.superclass = Some("Base".to_string());
        image.methods.push(MethodDef {
            sig: MethodSig {
                name: "run".to_string(),
                params: vec![],
                ret: "void".to_string(),
                flags: method_flags::PUBLIC,
            },
            local_count: 1,
            code: vec![
                Insn::ConstStr(0),
                Insn::Throw,
                Insn::Pop, // inner handler: swallow and return
                Insn::ReturnVoid,
            ],
            handlers: vec![HandlerEntry {
                start: 0,
                end: 2,
                handler: 2,
            }],
        });
        image.pool.intern("boom");
        let rules = RuleSetBuilder::from_decls(vec![
            RuleDecl::new("r", "run", "ctx").subtype_of("Base")
        ])
        .build(1)
        .unwrap();
        let plan = plan_for(&image, &rules);
        let woven = weave(&image, &plan).unwrap().unwrap();
        let method = woven.method("run").unwrap();

        assert_eq!(method.handlers.len(), 2);
        let inner = method.handlers[0];
        let outer = method.handlers[1];
        assert_eq!((inner.start, inner.end, inner.handler), (1, 3, 3));
        assert!(outer.start <= inner.start && outer.end >= inner.end);
    }

    #[test]
    fn test_mixin_synthesis() {
        let image = image_with_run();
        let rules = RuleSetBuilder::from_decls(vec![
            RuleDecl::new("inject", "run", "ctx")
                .subtype_of("Base")
                .mixin("weft/Traced", "$traceState"),
        ])
        .build(1)
        .unwrap();
        let plan = plan_for(&image, &rules);
        let woven = weave(&image, &plan).unwrap().unwrap();

        assert!(woven.interfaces.iter().any(|i| i == "weft/Traced"));
        assert_eq!(woven.fields.len(), 1);
        assert_eq!(woven.fields[0].name, "$traceState");
        assert!(woven.method("traceState$get").is_some());
        assert!(woven.method("traceState$set").is_some());
        // Accessors are synthetic and never matched by later passes.
        assert!(woven.method("traceState$get").unwrap().sig.is_synthetic());
    }

    #[test]
    fn test_mixin_is_idempotent() {
        let mut image = image_with_run();
        image.interfaces.push("weft/Traced".to_string());
        let spec = MixinSpec {
            interface: "weft/Traced".to_string(),
            backing_field: "$traceState".to_string(),
        };
        assert!(!apply_mixin(&mut image, &spec));
        assert!(image.fields.is_empty());
    }

    #[test]
    fn test_void_method_exit_block() {
        let mut image = ClassImage::new("Derived");
        image.superclass = Some("Base".to_string());
        image.methods.push(MethodDef {
            sig: MethodSig {
                name: "run".to_string(),
                params: vec![],
                ret: "void".to_string(),
                flags: method_flags::PUBLIC,
            },
            local_count: 1,
            code: vec![Insn::Nop, Insn::ReturnVoid],
            handlers: vec![],
        });
        let rules = RuleSetBuilder::from_decls(vec![
            RuleDecl::new("r", "run", "ctx").subtype_of("Base")
        ])
        .build(1)
        .unwrap();
        let plan = plan_for(&image, &rules);
        let woven = weave(&image, &plan).unwrap().unwrap();
        let method = woven.method("run").unwrap();

        // No result slot for void methods.
        assert_eq!(method.local_count, 2);
        assert!(!method.code.iter().any(|i| matches!(i, Insn::StoreLocal(_))));
        assert!(matches!(method.code.last(), Some(Insn::Throw)));
    }

    #[test]
    fn test_bad_input_jump_rejected() {
        let mut image = image_with_run();
        image.methods[0].code = vec![Insn::Jump(17), Insn::Return];
        let rules = two_rule_set();
        let plan = plan_for(&image, &rules);
        assert!(matches!(
            weave(&image, &plan),
            Err(WeaveError::BadJumpTarget { target: 17, .. })
        ));
    }
}
