//! Instruction set for Weft class images
//!
//! Method bodies are sequences of [`Insn`] values. On the wire each
//! instruction is a single opcode byte followed by its operands; decoded
//! instructions carry jump targets and handler ranges as instruction
//! indices, which is what makes splicing during weaving tractable.

use crate::encoder::{DecodeError, ImageReader, ImageWriter};

/// Single-byte opcode enumeration
///
/// Categories:
/// - 0x00-0x0F: stack manipulation & constants
/// - 0x10-0x1F: local variables
/// - 0x20-0x2F: arithmetic & comparison
/// - 0x90-0x9F: control flow
/// - 0xA0-0xAF: calls & returns
/// - 0xB0-0xBF: object field access
/// - 0xE0-0xEF: error handling
/// - 0xF0-0xFF: interception hooks (emitted only by the weaver)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// No operation
    Nop = 0x00,
    /// Pop top value from stack
    Pop = 0x01,
    /// Duplicate top stack value
    Dup = 0x02,

    /// Push null constant
    ConstNull = 0x04,
    /// Push true constant
    ConstTrue = 0x05,
    /// Push false constant
    ConstFalse = 0x06,
    /// Push 64-bit integer constant (operand: i64)
    ConstI64 = 0x07,
    /// Push 64-bit float constant (operand: f64)
    ConstF64 = 0x08,
    /// Push string constant from pool (operand: u32 index)
    ConstStr = 0x09,

    /// Load local variable onto stack (operand: u16 slot)
    LoadLocal = 0x10,
    /// Store top of stack to local variable (operand: u16 slot)
    StoreLocal = 0x11,

    /// Integer addition: pop b, pop a, push a + b
    Add = 0x20,
    /// Integer subtraction: pop b, pop a, push a - b
    Sub = 0x21,
    /// Integer multiplication: pop b, pop a, push a * b
    Mul = 0x22,
    /// Generic equality: pop b, pop a, push a == b
    Eq = 0x28,

    /// Unconditional jump (operand: u32 instruction index)
    Jump = 0x90,
    /// Conditional jump: pop condition, jump when false (operand: u32 index)
    JumpIfFalse = 0x91,

    /// Call a free function (operands: u32 function index, u16 arg count)
    Call = 0xA0,
    /// Call a virtual method (operands: u32 method index, u16 arg count)
    CallVirtual = 0xA1,
    /// Return top of stack
    Return = 0xA2,
    /// Return without a value
    ReturnVoid = 0xA3,

    /// Load instance field: pop object, push field (operand: u16 index)
    LoadField = 0xB0,
    /// Store instance field: pop value, pop object (operand: u16 index)
    StoreField = 0xB1,

    /// Throw: pop exception value and unwind to the nearest handler
    Throw = 0xE0,

    /// Invoke an entry hook (operands: u32 context index, u16 token slot)
    EnterHook = 0xF0,
    /// Invoke a return hook with the token in a slot (operand: u16 token slot)
    ReturnHook = 0xF1,
    /// Invoke a throw hook with the token in a slot (operand: u16 token slot)
    ThrowHook = 0xF2,
}

impl Opcode {
    /// Convert the opcode to its byte representation
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse an opcode from a byte
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Opcode::Nop),
            0x01 => Some(Opcode::Pop),
            0x02 => Some(Opcode::Dup),
            0x04 => Some(Opcode::ConstNull),
            0x05 => Some(Opcode::ConstTrue),
            0x06 => Some(Opcode::ConstFalse),
            0x07 => Some(Opcode::ConstI64),
            0x08 => Some(Opcode::ConstF64),
            0x09 => Some(Opcode::ConstStr),
            0x10 => Some(Opcode::LoadLocal),
            0x11 => Some(Opcode::StoreLocal),
            0x20 => Some(Opcode::Add),
            0x21 => Some(Opcode::Sub),
            0x22 => Some(Opcode::Mul),
            0x28 => Some(Opcode::Eq),
            0x90 => Some(Opcode::Jump),
            0x91 => Some(Opcode::JumpIfFalse),
            0xA0 => Some(Opcode::Call),
            0xA1 => Some(Opcode::CallVirtual),
            0xA2 => Some(Opcode::Return),
            0xA3 => Some(Opcode::ReturnVoid),
            0xB0 => Some(Opcode::LoadField),
            0xB1 => Some(Opcode::StoreField),
            0xE0 => Some(Opcode::Throw),
            0xF0 => Some(Opcode::EnterHook),
            0xF1 => Some(Opcode::ReturnHook),
            0xF2 => Some(Opcode::ThrowHook),
            _ => None,
        }
    }
}

/// A decoded instruction
///
/// Jump operands are instruction indices into the owning method's code
/// vector, not byte offsets.
#[derive(Debug, Clone, PartialEq)]
pub enum Insn {
    /// No operation
    Nop,
    /// Pop top value
    Pop,
    /// Duplicate top value
    Dup,
    /// Push null
    ConstNull,
    /// Push true
    ConstTrue,
    /// Push false
    ConstFalse,
    /// Push integer constant
    ConstI64(i64),
    /// Push float constant
    ConstF64(f64),
    /// Push string constant from the pool
    ConstStr(u32),
    /// Load local slot
    LoadLocal(u16),
    /// Store to local slot
    StoreLocal(u16),
    /// Integer addition
    Add,
    /// Integer subtraction
    Sub,
    /// Integer multiplication
    Mul,
    /// Generic equality
    Eq,
    /// Unconditional jump to instruction index
    Jump(u32),
    /// Jump to instruction index when popped condition is false
    JumpIfFalse(u32),
    /// Call a free function
    Call {
        /// Function index in the host's function table
        function: u32,
        /// Number of arguments popped
        argc: u16,
    },
    /// Call a virtual method
    CallVirtual {
        /// Method index in the receiver's method table
        method: u32,
        /// Number of arguments popped (receiver excluded)
        argc: u16,
    },
    /// Return top of stack
    Return,
    /// Return without a value
    ReturnVoid,
    /// Load instance field
    LoadField(u16),
    /// Store instance field
    StoreField(u16),
    /// Throw the popped exception value
    Throw,
    /// Invoke an entry hook, storing the returned token in a local slot
    EnterHook {
        /// Constant-pool index of the hook context name
        context: u32,
        /// Local slot receiving the invocation token
        token_slot: u16,
    },
    /// Invoke a return hook; the return value (if any) is on top of stack
    /// and is left in place
    ReturnHook {
        /// Local slot holding the invocation token
        token_slot: u16,
    },
    /// Invoke a throw hook; the in-flight exception is on top of stack and
    /// is left in place
    ThrowHook {
        /// Local slot holding the invocation token
        token_slot: u16,
    },
}

impl Insn {
    /// The opcode this instruction encodes to
    pub fn opcode(&self) -> Opcode {
        match self {
            Insn::Nop => Opcode::Nop,
            Insn::Pop => Opcode::Pop,
            Insn::Dup => Opcode::Dup,
            Insn::ConstNull => Opcode::ConstNull,
            Insn::ConstTrue => Opcode::ConstTrue,
            Insn::ConstFalse => Opcode::ConstFalse,
            Insn::ConstI64(_) => Opcode::ConstI64,
            Insn::ConstF64(_) => Opcode::ConstF64,
            Insn::ConstStr(_) => Opcode::ConstStr,
            Insn::LoadLocal(_) => Opcode::LoadLocal,
            Insn::StoreLocal(_) => Opcode::StoreLocal,
            Insn::Add => Opcode::Add,
            Insn::Sub => Opcode::Sub,
            Insn::Mul => Opcode::Mul,
            Insn::Eq => Opcode::Eq,
            Insn::Jump(_) => Opcode::Jump,
            Insn::JumpIfFalse(_) => Opcode::JumpIfFalse,
            Insn::Call { .. } => Opcode::Call,
            Insn::CallVirtual { .. } => Opcode::CallVirtual,
            Insn::Return => Opcode::Return,
            Insn::ReturnVoid => Opcode::ReturnVoid,
            Insn::LoadField(_) => Opcode::LoadField,
            Insn::StoreField(_) => Opcode::StoreField,
            Insn::Throw => Opcode::Throw,
            Insn::EnterHook { .. } => Opcode::EnterHook,
            Insn::ReturnHook { .. } => Opcode::ReturnHook,
            Insn::ThrowHook { .. } => Opcode::ThrowHook,
        }
    }

    /// The jump target, for control-flow instructions
    pub fn jump_target(&self) -> Option<u32> {
        match self {
            Insn::Jump(target) | Insn::JumpIfFalse(target) => Some(*target),
            _ => None,
        }
    }

    /// Rewrite the jump target of a control-flow instruction
    pub fn set_jump_target(&mut self, new_target: u32) {
        match self {
            Insn::Jump(target) | Insn::JumpIfFalse(target) => *target = new_target,
            _ => {}
        }
    }

    /// Whether control never falls through to the next instruction
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Insn::Return | Insn::ReturnVoid | Insn::Throw | Insn::Jump(_)
        )
    }

    /// Encode the instruction into a writer
    pub fn encode(&self, writer: &mut ImageWriter) {
        writer.emit_u8(self.opcode().to_u8());
        match self {
            Insn::ConstI64(value) => writer.emit_i64(*value),
            Insn::ConstF64(value) => writer.emit_f64(*value),
            Insn::ConstStr(index) => writer.emit_u32(*index),
            Insn::LoadLocal(slot) | Insn::StoreLocal(slot) => writer.emit_u16(*slot),
            Insn::Jump(target) | Insn::JumpIfFalse(target) => writer.emit_u32(*target),
            Insn::Call { function, argc } => {
                writer.emit_u32(*function);
                writer.emit_u16(*argc);
            }
            Insn::CallVirtual { method, argc } => {
                writer.emit_u32(*method);
                writer.emit_u16(*argc);
            }
            Insn::LoadField(index) | Insn::StoreField(index) => writer.emit_u16(*index),
            Insn::EnterHook {
                context,
                token_slot,
            } => {
                writer.emit_u32(*context);
                writer.emit_u16(*token_slot);
            }
            Insn::ReturnHook { token_slot } | Insn::ThrowHook { token_slot } => {
                writer.emit_u16(*token_slot)
            }
            _ => {}
        }
    }

    /// Decode one instruction from a reader
    pub fn decode(reader: &mut ImageReader<'_>) -> Result<Self, DecodeError> {
        let offset = reader.position();
        let byte = reader.read_u8()?;
        let opcode = Opcode::from_u8(byte).ok_or(DecodeError::InvalidOpcode(byte, offset))?;

        let insn = match opcode {
            Opcode::Nop => Insn::Nop,
            Opcode::Pop => Insn::Pop,
            Opcode::Dup => Insn::Dup,
            Opcode::ConstNull => Insn::ConstNull,
            Opcode::ConstTrue => Insn::ConstTrue,
            Opcode::ConstFalse => Insn::ConstFalse,
            Opcode::ConstI64 => Insn::ConstI64(reader.read_i64()?),
            Opcode::ConstF64 => Insn::ConstF64(reader.read_f64()?),
            Opcode::ConstStr => Insn::ConstStr(reader.read_u32()?),
            Opcode::LoadLocal => Insn::LoadLocal(reader.read_u16()?),
            Opcode::StoreLocal => Insn::StoreLocal(reader.read_u16()?),
            Opcode::Add => Insn::Add,
            Opcode::Sub => Insn::Sub,
            Opcode::Mul => Insn::Mul,
            Opcode::Eq => Insn::Eq,
            Opcode::Jump => Insn::Jump(reader.read_u32()?),
            Opcode::JumpIfFalse => Insn::JumpIfFalse(reader.read_u32()?),
            Opcode::Call => Insn::Call {
                function: reader.read_u32()?,
                argc: reader.read_u16()?,
            },
            Opcode::CallVirtual => Insn::CallVirtual {
                method: reader.read_u32()?,
                argc: reader.read_u16()?,
            },
            Opcode::Return => Insn::Return,
            Opcode::ReturnVoid => Insn::ReturnVoid,
            Opcode::LoadField => Insn::LoadField(reader.read_u16()?),
            Opcode::StoreField => Insn::StoreField(reader.read_u16()?),
            Opcode::Throw => Insn::Throw,
            Opcode::EnterHook => Insn::EnterHook {
                context: reader.read_u32()?,
                token_slot: reader.read_u16()?,
            },
            Opcode::ReturnHook => Insn::ReturnHook {
                token_slot: reader.read_u16()?,
            },
            Opcode::ThrowHook => Insn::ThrowHook {
                token_slot: reader.read_u16()?,
            },
        };
        Ok(insn)
    }
}
