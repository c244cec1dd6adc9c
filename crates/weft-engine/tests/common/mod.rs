//! Shared harness for engine integration tests
//!
//! Provides an in-memory host, recording telemetry sinks, and a small
//! instruction evaluator able to execute woven method bodies so tests
//! can observe hook ordering around real control flow.

#![allow(dead_code)]

use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use weft_bytecode::{ClassImage, Insn, TypeDescriptor};
use weft_engine::{
    Host, HostError, HookDispatcher, HookSink, HookToken, RedefineRejected, RejectionKind, ScopeId,
    Value,
};

/// In-memory host: a table of installed class images
///
/// `get_raw_representation` hands back the pristine original bytes, the
/// way a real host keeps pre-transformation representations for
/// retransform passes.
pub struct MemoryHost {
    current: DashMap<(ScopeId, String), Vec<u8>>,
    originals: DashMap<(ScopeId, String), Vec<u8>>,
    redefinitions: Mutex<Vec<(ScopeId, String)>>,
    rejections: Mutex<FxHashMap<String, (RejectionKind, u32)>>,
}

impl MemoryHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            current: DashMap::new(),
            originals: DashMap::new(),
            redefinitions: Mutex::new(Vec::new()),
            rejections: Mutex::new(FxHashMap::default()),
        })
    }

    pub fn install(&self, scope: ScopeId, image: &ClassImage) -> Vec<u8> {
        let bytes = image.encode();
        let key = (scope, image.name.clone());
        self.current.insert(key.clone(), bytes.clone());
        self.originals.insert(key, bytes.clone());
        bytes
    }

    /// Store woven bytes as the active representation, the way a host
    /// applies the load-notification result
    pub fn activate(&self, scope: ScopeId, name: &str, bytes: Vec<u8>) {
        self.current.insert((scope, name.to_string()), bytes);
    }

    pub fn current_image(&self, scope: ScopeId, name: &str) -> ClassImage {
        let bytes = self
            .current
            .get(&(scope, name.to_string()))
            .expect("type not installed");
        ClassImage::decode(&bytes).expect("stored image must decode")
    }

    pub fn redefinitions(&self) -> Vec<(ScopeId, String)> {
        self.redefinitions.lock().clone()
    }

    /// Reject the next `times` redefinitions of a type
    pub fn reject(&self, name: &str, kind: RejectionKind, times: u32) {
        self.rejections
            .lock()
            .insert(name.to_string(), (kind, times));
    }
}

impl Host for MemoryHost {
    fn get_structure(&self, scope: ScopeId, name: &str) -> Result<Arc<TypeDescriptor>, HostError> {
        let bytes = self
            .current
            .get(&(scope, name.to_string()))
            .ok_or_else(|| HostError::NotFound(name.to_string()))?;
        TypeDescriptor::peek(&bytes)
            .map(Arc::new)
            .map_err(|err| HostError::Failed(err.to_string()))
    }

    fn get_raw_representation(&self, scope: ScopeId, name: &str) -> Result<Vec<u8>, HostError> {
        self.originals
            .get(&(scope, name.to_string()))
            .map(|bytes| bytes.clone())
            .ok_or_else(|| HostError::NotFound(name.to_string()))
    }

    fn redefine(&self, scope: ScopeId, name: &str, bytes: Vec<u8>) -> Result<(), RedefineRejected> {
        {
            let mut rejections = self.rejections.lock();
            if let Some((kind, remaining)) = rejections.get_mut(name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    let kind = *kind;
                    if *remaining == 0 {
                        rejections.remove(name);
                    }
                    return Err(RedefineRejected {
                        kind,
                        reason: "test rejection".to_string(),
                    });
                }
            }
        }
        self.current.insert((scope, name.to_string()), bytes);
        self.redefinitions
            .lock()
            .push((scope, name.to_string()));
        Ok(())
    }
}

/// Telemetry event captured by [`RecordingSink`]
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Entry { context: String, token: u64 },
    Return { token: u64, value: Option<Value> },
    Throw { token: u64, error: Value },
}

/// Sink recording every hook call with fresh tokens
pub struct RecordingSink {
    next_token: AtomicU64,
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_token: AtomicU64::new(1),
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl HookSink for RecordingSink {
    fn on_entry(&self, context: &str, _args: &[Value]) -> HookToken {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.events.lock().push(Event::Entry {
            context: context.to_string(),
            token,
        });
        HookToken(token)
    }

    fn on_return(&self, token: HookToken, value: Option<&Value>) {
        self.events.lock().push(Event::Return {
            token: token.0,
            value: value.cloned(),
        });
    }

    fn on_throw(&self, token: HookToken, error: &Value) {
        self.events.lock().push(Event::Throw {
            token: token.0,
            error: error.clone(),
        });
    }
}

/// Sink whose entry hook always panics
pub struct PanickingEntrySink;

impl HookSink for PanickingEntrySink {
    fn on_entry(&self, _context: &str, _args: &[Value]) -> HookToken {
        panic!("entry hook exploded");
    }

    fn on_return(&self, _token: HookToken, _value: Option<&Value>) {}

    fn on_throw(&self, _token: HookToken, _error: &Value) {}
}

/// Result of evaluating one method body
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Returned(Option<Value>),
    Threw(Value),
}

/// Execute a method body, dispatching hook instructions through the
/// given dispatcher
///
/// Supports the instruction subset tests exercise; calls and field
/// access are out of scope for the harness.
pub fn eval_method(
    image: &ClassImage,
    method_name: &str,
    args: &[Value],
    dispatcher: &HookDispatcher,
) -> Outcome {
    let method = image
        .method(method_name)
        .unwrap_or_else(|| panic!("method {method_name} not found"));
    let mut locals = vec![Value::Null; method.local_count as usize];
    locals[..args.len()].clone_from_slice(args);
    let mut stack: Vec<Value> = Vec::new();
    let mut pc: usize = 0;

    loop {
        let insn = &method.code[pc];
        match insn {
            Insn::Nop => pc += 1,
            Insn::Pop => {
                stack.pop();
                pc += 1;
            }
            Insn::Dup => {
                let top = stack.last().expect("dup on empty stack").clone();
                stack.push(top);
                pc += 1;
            }
            Insn::ConstNull => {
                stack.push(Value::Null);
                pc += 1;
            }
            Insn::ConstTrue => {
                stack.push(Value::Bool(true));
                pc += 1;
            }
            Insn::ConstFalse => {
                stack.push(Value::Bool(false));
                pc += 1;
            }
            Insn::ConstI64(value) => {
                stack.push(Value::I64(*value));
                pc += 1;
            }
            Insn::ConstF64(value) => {
                stack.push(Value::F64(*value));
                pc += 1;
            }
            Insn::ConstStr(index) => {
                let text = image.pool.get(*index).expect("constant in pool");
                stack.push(Value::Str(text.to_string()));
                pc += 1;
            }
            Insn::LoadLocal(slot) => {
                stack.push(locals[*slot as usize].clone());
                pc += 1;
            }
            Insn::StoreLocal(slot) => {
                locals[*slot as usize] = stack.pop().expect("store on empty stack");
                pc += 1;
            }
            Insn::Add | Insn::Sub | Insn::Mul => {
                let (Some(Value::I64(b)), Some(Value::I64(a))) = (stack.pop(), stack.pop()) else {
                    panic!("arithmetic on non-integers");
                };
                stack.push(Value::I64(match insn {
                    Insn::Add => a + b,
                    Insn::Sub => a - b,
                    _ => a * b,
                }));
                pc += 1;
            }
            Insn::Eq => {
                let b = stack.pop().expect("eq on empty stack");
                let a = stack.pop().expect("eq on empty stack");
                stack.push(Value::Bool(a == b));
                pc += 1;
            }
            Insn::Jump(target) => pc = *target as usize,
            Insn::JumpIfFalse(target) => {
                let Some(Value::Bool(condition)) = stack.pop() else {
                    panic!("branch on non-boolean");
                };
                pc = if condition { pc + 1 } else { *target as usize };
            }
            Insn::Return => {
                let value = stack.pop().expect("return on empty stack");
                return Outcome::Returned(Some(value));
            }
            Insn::ReturnVoid => return Outcome::Returned(None),
            Insn::Throw => {
                let exception = stack.pop().expect("throw on empty stack");
                let handler = method
                    .handlers
                    .iter()
                    .find(|entry| (entry.start as usize) <= pc && pc < entry.end as usize);
                match handler {
                    Some(entry) => {
                        stack.clear();
                        stack.push(exception);
                        pc = entry.handler as usize;
                    }
                    None => return Outcome::Threw(exception),
                }
            }
            Insn::EnterHook {
                context,
                token_slot,
            } => {
                let context = image.pool.get(*context).expect("hook context in pool");
                let token = dispatcher.entry(context, args);
                locals[*token_slot as usize] = Value::I64(token.0 as i64);
                pc += 1;
            }
            Insn::ReturnHook { token_slot } => {
                let token = token_from_local(&locals[*token_slot as usize]);
                dispatcher.ret(token, stack.last());
                pc += 1;
            }
            Insn::ThrowHook { token_slot } => {
                let token = token_from_local(&locals[*token_slot as usize]);
                let error = stack.last().expect("throw hook without exception").clone();
                dispatcher.throw(token, &error);
                pc += 1;
            }
            unsupported => panic!("instruction {unsupported:?} unsupported by test evaluator"),
        }
    }
}

fn token_from_local(value: &Value) -> HookToken {
    match value {
        Value::I64(token) => HookToken(*token as u64),
        other => panic!("token slot held {other:?}"),
    }
}
