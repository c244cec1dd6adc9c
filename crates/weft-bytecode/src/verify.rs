//! Structural image verification
//!
//! Checks the invariants the weaver and the host both rely on: jump
//! targets land on real instructions, handler ranges are well-formed,
//! local and constant references are in bounds, and non-abstract bodies
//! end in a terminator. Stack-shape simulation is left to the host's own
//! loader.

use crate::descriptor::MethodSig;
use crate::image::{ClassImage, MethodDef};
use crate::opcode::Insn;

/// Structural verification errors
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// Jump to an out-of-range instruction index
    #[error("{method}: invalid jump target {target} at instruction {index} (code length {len})")]
    InvalidJumpTarget {
        /// Method name
        method: String,
        /// Offending jump target
        target: u32,
        /// Index of the jumping instruction
        index: usize,
        /// Code length
        len: usize,
    },

    /// Malformed exception-handler range
    #[error("{method}: invalid handler range {start}..{end} -> {handler} (code length {len})")]
    InvalidHandlerRange {
        /// Method name
        method: String,
        /// Range start
        start: u32,
        /// Range end (exclusive)
        end: u32,
        /// Handler entry point
        handler: u32,
        /// Code length
        len: usize,
    },

    /// Local slot reference beyond the declared local count
    #[error("{method}: local slot {slot} out of range (local count {local_count})")]
    InvalidLocalRef {
        /// Method name
        method: String,
        /// Offending slot
        slot: u16,
        /// Declared local count
        local_count: u16,
    },

    /// Constant-pool reference beyond the pool size
    #[error("{method}: constant index {index} out of range (pool size {pool_len})")]
    InvalidConstantRef {
        /// Method name
        method: String,
        /// Offending index
        index: u32,
        /// Pool size
        pool_len: usize,
    },

    /// A non-abstract method whose body has no code
    #[error("{method}: non-abstract method has an empty body")]
    EmptyBody {
        /// Method name
        method: String,
    },

    /// Execution can fall off the end of a body
    #[error("{method}: execution falls off the end of the body")]
    FallOffEnd {
        /// Method name
        method: String,
    },
}

/// Verify every method body in an image
pub fn verify_image(image: &ClassImage) -> Result<(), VerifyError> {
    for method in &image.methods {
        verify_method(method, image.pool.len())?;
    }
    Ok(())
}

fn verify_method(method: &MethodDef, pool_len: usize) -> Result<(), VerifyError> {
    let MethodSig { name, .. } = &method.sig;
    let len = method.code.len();

    if method.sig.is_abstract() {
        return Ok(());
    }
    if len == 0 {
        return Err(VerifyError::EmptyBody {
            method: name.clone(),
        });
    }

    for (index, insn) in method.code.iter().enumerate() {
        if let Some(target) = insn.jump_target() {
            if target as usize >= len {
                return Err(VerifyError::InvalidJumpTarget {
                    method: name.clone(),
                    target,
                    index,
                    len,
                });
            }
        }

        let slot = match insn {
            Insn::LoadLocal(slot) | Insn::StoreLocal(slot) => Some(*slot),
            Insn::EnterHook { token_slot, .. }
            | Insn::ReturnHook { token_slot }
            | Insn::ThrowHook { token_slot } => Some(*token_slot),
            _ => None,
        };
        if let Some(slot) = slot {
            if slot >= method.local_count {
                return Err(VerifyError::InvalidLocalRef {
                    method: name.clone(),
                    slot,
                    local_count: method.local_count,
                });
            }
        }

        let constant = match insn {
            Insn::ConstStr(index) => Some(*index),
            Insn::EnterHook { context, .. } => Some(*context),
            _ => None,
        };
        if let Some(index) = constant {
            if index as usize >= pool_len {
                return Err(VerifyError::InvalidConstantRef {
                    method: name.clone(),
                    index,
                    pool_len,
                });
            }
        }
    }

    for entry in &method.handlers {
        let valid = entry.start < entry.end
            && (entry.end as usize) <= len
            && (entry.handler as usize) < len;
        if !valid {
            return Err(VerifyError::InvalidHandlerRange {
                method: name.clone(),
                start: entry.start,
                end: entry.end,
                handler: entry.handler,
                len,
            });
        }
    }

    if !method.code[len - 1].is_terminator() {
        return Err(VerifyError::FallOffEnd {
            method: name.clone(),
        });
    }

    Ok(())
}
