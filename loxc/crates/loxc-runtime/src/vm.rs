//! The opcode dispatch loop and everything it leans on: call frames, the
//! value stack, globals, the open-upvalue list, and the call/invoke/bind
//! protocols of spec.md §4.4.
//!
//! Allocation-adjacent methods (`alloc_closure`, `capture_upvalue`, …) each
//! assemble a [`Roots`] from `self`'s fields and pass it to `Heap` directly,
//! rather than routing through a method that borrows all of `self` — a
//! method taking `&self` would keep that borrow alive for as long as the
//! `Roots` it returns is used, which conflicts with the `&mut self.heap`
//! call that follows. Building `Roots` through the free function
//! [`build_roots`] keeps each borrow scoped to the field it actually reads.

use std::io::{self, Write};

use loxc_compiler::compile;
use loxc_gc::{
    is_falsey, GcConfig, GcRef, Heap, NativeFnPtr, ObjKind, OpCode, Roots, Table, UpvalueState,
    Value,
};
use loxc_util::{BacktraceFrame, CompileErrors, RuntimeError};

/// Matches spec.md §4.4's VM state: a fixed cap on call-frame nesting
/// (`FRAMES_MAX`), the source of the "Stack overflow." runtime error.
const FRAMES_MAX: usize = 64;

#[derive(Debug, Clone, Copy)]
pub struct CallFrame {
    closure: GcRef,
    ip: usize,
    slots_base: usize,
}

/// The three outcomes of §6.1's `interpret`. Carries the diagnostics rather
/// than printing them itself, so a driver (or a test) can render, log, or
/// assert on them however it likes; `loxt` owns the stderr formatting and
/// the exit-code mapping of §6.3.
#[derive(Debug)]
pub enum InterpretResult {
    Ok,
    CompileError(CompileErrors),
    RuntimeError(RuntimeError),
}

/// Runtime-configurable switches for the optional flags of spec.md §6.4,
/// realized as constructor arguments rather than compile-time features
/// (§4.3's expansion note: simpler to ship, test, and toggle).
#[derive(Debug, Clone, Copy, Default)]
pub struct VmConfig {
    pub gc: GcConfig,
    pub trace: bool,
    pub print_code: bool,
}

/// Tags extracted from a callee's `ObjKind` before dispatching, so the
/// borrow of `self.heap` used to read the tag ends before `call_value`
/// recurses into a `&mut self` method.
enum Callable {
    Closure,
    Native,
    Class,
    BoundMethod,
    Other,
}

pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Sorted by descending stack slot, per spec.md §3.5.
    open_upvalues: Vec<GcRef>,
    /// The interned `"init"` string spec.md §3.5 calls out as an explicit
    /// GC root; also the key used to look up a class's initializer.
    init_string: GcRef,
    config: VmConfig,
    output: Box<dyn Write>,
}

impl Vm {
    pub fn new(config: VmConfig) -> Self {
        Self::with_output(config, Box::new(io::stdout()))
    }

    fn with_output(config: VmConfig, output: Box<dyn Write>) -> Self {
        let mut heap = Heap::new(config.gc);
        let init_string = heap.copy_string("init", &Roots::default());
        let mut vm = Self {
            heap,
            stack: Vec::new(),
            frames: Vec::new(),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            init_string,
            config,
            output,
        };
        crate::stdlib::install(&mut vm);
        vm
    }

    /// Registers a native under `name` in globals, per spec.md §4.8's
    /// registration mechanism. Public so an embedder can add its own
    /// natives the same way [`crate::stdlib::install`] does.
    pub fn define_native(&mut self, name: &str, function: NativeFnPtr) {
        let name_ref = self.copy_string(name);
        let native_ref = self.alloc_native(name_ref, function);
        let hash = self.heap.string_hash(name_ref);
        self.globals.set(name_ref, hash, Value::Obj(native_ref));
    }

    /// Compiles and runs `source` as a top-level script (spec.md §6.1):
    /// wraps it in a closure, pushes it, and calls it with zero arguments.
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let script = match compile(source, &mut self.heap) {
            Ok(function) => function,
            Err(errors) => return InterpretResult::CompileError(errors),
        };

        if self.config.print_code {
            let text = match self.heap.kind(script) {
                ObjKind::Function(f) => f.chunk.disassemble("<script>", &self.heap),
                _ => unreachable!("compile() must return a Function"),
            };
            tracing::info!("{text}");
        }

        // Root the bare function on the stack before wrapping it in a
        // closure, per spec.md §4.7/§9's allocation-during-GC discipline.
        self.push(Value::Obj(script));
        let closure = self.alloc_closure(script, Vec::new());
        self.pop();
        self.push(Value::Obj(closure));

        if let Err(err) = self.call_closure(closure, 0) {
            return InterpretResult::RuntimeError(err);
        }
        match self.run() {
            Ok(()) => InterpretResult::Ok,
            Err(err) => InterpretResult::RuntimeError(err),
        }
    }

    // -- the dispatch loop --------------------------------------------------

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.config.trace {
                self.trace_instruction();
            }

            let instruction = self.read_u8();
            match OpCode::from_byte(instruction) {
                OpCode::Constant => {
                    let idx = self.read_u8();
                    let value = self.current_chunk_constant(idx);
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_u8() as usize;
                    let base = self.frames[self.frames.len() - 1].slots_base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_u8() as usize;
                    let base = self.frames[self.frames.len() - 1].slots_base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let idx = self.read_u8();
                    let name = self.global_name_constant(idx);
                    let hash = self.heap.string_hash(name);
                    match self.globals.get(name, hash) {
                        Some(value) => self.push(value),
                        None => return Err(self.undefined_variable(name)),
                    }
                }
                OpCode::DefineGlobal => {
                    let idx = self.read_u8();
                    let name = self.global_name_constant(idx);
                    let hash = self.heap.string_hash(name);
                    let value = self.peek(0);
                    self.globals.set(name, hash, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let idx = self.read_u8();
                    let name = self.global_name_constant(idx);
                    let hash = self.heap.string_hash(name);
                    let value = self.peek(0);
                    if self.globals.set(name, hash, value) {
                        self.globals.delete(name, hash);
                        return Err(self.undefined_variable(name));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_u8() as usize;
                    let upvalue = self.frame_upvalue(slot);
                    self.push(self.get_upvalue_value(upvalue));
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_u8() as usize;
                    let upvalue = self.frame_upvalue(slot);
                    let value = self.peek(0);
                    self.set_upvalue_value(upvalue, value);
                }
                OpCode::GetProperty => self.get_property()?,
                OpCode::SetProperty => self.set_property()?,
                OpCode::GetSuper => {
                    let idx = self.read_u8();
                    let name = self
                        .current_chunk_constant(idx)
                        .as_obj()
                        .expect("OP_GET_SUPER name constant must be a string");
                    let superclass = self
                        .pop()
                        .as_obj()
                        .expect("OP_GET_SUPER operand must be a class");
                    self.bind_method(superclass, name)?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => self.binary_compare(|a, b| a > b)?,
                OpCode::Less => self.binary_compare(|a, b| a < b)?,
                OpCode::Add => self.add()?,
                OpCode::Subtract => self.binary_number(|a, b| a - b)?,
                OpCode::Multiply => self.binary_number(|a, b| a * b)?,
                OpCode::Divide => self.binary_number(|a, b| a / b)?,
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(is_falsey(value)));
                }
                OpCode::Negate => {
                    let value = self.peek(0);
                    match value.as_number() {
                        Some(n) => {
                            self.pop();
                            self.push(Value::Number(-n));
                        }
                        None => return Err(self.runtime_error("Operand must be a number.")),
                    }
                }
                OpCode::Print => {
                    let value = self.pop();
                    let text = self.heap.format_value(value);
                    writeln!(self.output, "{text}").expect("write to VM output failed");
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    let idx = self.frames.len() - 1;
                    self.frames[idx].ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if is_falsey(self.peek(0)) {
                        let idx = self.frames.len() - 1;
                        self.frames[idx].ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    let idx = self.frames.len() - 1;
                    self.frames[idx].ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = self.read_u8();
                    let callee = self.peek(argc as usize);
                    self.call_value(callee, argc)?;
                }
                OpCode::Invoke => {
                    let name_idx = self.read_u8();
                    let argc = self.read_u8();
                    let name = self
                        .current_chunk_constant(name_idx)
                        .as_obj()
                        .expect("OP_INVOKE name constant must be a string");
                    self.invoke(name, argc)?;
                }
                OpCode::SuperInvoke => {
                    let name_idx = self.read_u8();
                    let argc = self.read_u8();
                    let name = self
                        .current_chunk_constant(name_idx)
                        .as_obj()
                        .expect("OP_SUPER_INVOKE name constant must be a string");
                    let superclass = self
                        .pop()
                        .as_obj()
                        .expect("OP_SUPER_INVOKE operand must be a class");
                    self.invoke_from_class(superclass, name, argc)?;
                }
                OpCode::Closure => self.closure_instruction(),
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("OP_RETURN with no active frame");
                    self.close_upvalues(frame.slots_base);
                    self.stack.truncate(frame.slots_base);
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.push(result);
                }
                OpCode::Class => {
                    let idx = self.read_u8();
                    let name = self
                        .current_chunk_constant(idx)
                        .as_obj()
                        .expect("OP_CLASS name constant must be a string");
                    let class = self.alloc_class(name);
                    self.push(Value::Obj(class));
                }
                OpCode::Inherit => self.inherit()?,
                OpCode::Method => {
                    let idx = self.read_u8();
                    let name = self
                        .current_chunk_constant(idx)
                        .as_obj()
                        .expect("OP_METHOD name constant must be a string");
                    let method = self.pop();
                    let hash = self.heap.string_hash(name);
                    if let Value::Obj(class) = self.peek(0) {
                        if let ObjKind::Class(c) = self.heap.kind_mut(class) {
                            c.methods.set(name, hash, method);
                        }
                    }
                }
            }
        }
    }

    // -- calls, methods, binding --------------------------------------------

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), RuntimeError> {
        let r = match callee {
            Value::Obj(r) => r,
            _ => return Err(self.runtime_error("Can only call functions and classes.")),
        };
        let tag = match self.heap.kind(r) {
            ObjKind::Closure(_) => Callable::Closure,
            ObjKind::Native(_) => Callable::Native,
            ObjKind::Class(_) => Callable::Class,
            ObjKind::BoundMethod(_) => Callable::BoundMethod,
            _ => Callable::Other,
        };
        match tag {
            Callable::Closure => self.call_closure(r, argc),
            Callable::Native => self.call_native(r, argc),
            Callable::Class => self.call_class(r, argc),
            Callable::BoundMethod => self.call_bound_method(r, argc),
            Callable::Other => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    fn call_closure(&mut self, closure: GcRef, argc: u8) -> Result<(), RuntimeError> {
        let function = match self.heap.kind(closure) {
            ObjKind::Closure(c) => c.function,
            _ => unreachable!("call_closure called on a non-Closure"),
        };
        let arity = match self.heap.kind(function) {
            ObjKind::Function(f) => f.arity,
            _ => unreachable!(),
        };
        if argc != arity {
            return Err(self.runtime_error(format!(
                "Expected {arity} arguments but got {argc}."
            )));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        let slots_base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots_base,
        });
        Ok(())
    }

    fn call_native(&mut self, native: GcRef, argc: u8) -> Result<(), RuntimeError> {
        let function = match self.heap.kind(native) {
            ObjKind::Native(n) => n.function,
            _ => unreachable!("call_native called on a non-Native"),
        };
        let base = self.stack.len() - argc as usize;
        let result = function(&self.heap, &self.stack[base..]);
        match result {
            Ok(value) => {
                self.stack.truncate(base - 1);
                self.push(value);
                Ok(())
            }
            Err(message) => Err(self.runtime_error(message)),
        }
    }

    fn call_class(&mut self, class: GcRef, argc: u8) -> Result<(), RuntimeError> {
        let instance = self.alloc_instance(class);
        let callee_slot = self.stack.len() - argc as usize - 1;
        self.stack[callee_slot] = Value::Obj(instance);

        let hash = self.heap.string_hash(self.init_string);
        let initializer = match self.heap.kind(class) {
            ObjKind::Class(c) => c.methods.get(self.init_string, hash),
            _ => unreachable!("call_class called on a non-Class"),
        };
        match initializer {
            Some(Value::Obj(init_closure)) => self.call_closure(init_closure, argc),
            Some(_) => unreachable!("class method table holds a non-closure value"),
            None if argc == 0 => Ok(()),
            None => Err(self.runtime_error(format!("Expected 0 arguments but got {argc}."))),
        }
    }

    fn call_bound_method(&mut self, bound: GcRef, argc: u8) -> Result<(), RuntimeError> {
        let (receiver, method) = match self.heap.kind(bound) {
            ObjKind::BoundMethod(b) => (b.receiver, b.method),
            _ => unreachable!("call_bound_method called on a non-BoundMethod"),
        };
        let callee_slot = self.stack.len() - argc as usize - 1;
        self.stack[callee_slot] = receiver;
        self.call_closure(method, argc)
    }

    fn invoke(&mut self, name: GcRef, argc: u8) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc as usize);
        let instance = match receiver {
            Value::Obj(r) if matches!(self.heap.kind(r), ObjKind::Instance(_)) => r,
            _ => return Err(self.runtime_error("Only instances have methods.")),
        };

        let hash = self.heap.string_hash(name);
        let field = match self.heap.kind(instance) {
            ObjKind::Instance(i) => i.fields.get(name, hash),
            _ => unreachable!(),
        };
        // A field shadows a method of the same name (spec.md §4.4).
        if let Some(value) = field {
            let callee_slot = self.stack.len() - argc as usize - 1;
            self.stack[callee_slot] = value;
            return self.call_value(value, argc);
        }

        let class = match self.heap.kind(instance) {
            ObjKind::Instance(i) => i.class,
            _ => unreachable!(),
        };
        self.invoke_from_class(class, name, argc)
    }

    fn invoke_from_class(&mut self, class: GcRef, name: GcRef, argc: u8) -> Result<(), RuntimeError> {
        let hash = self.heap.string_hash(name);
        let method = match self.heap.kind(class) {
            ObjKind::Class(c) => c.methods.get(name, hash),
            _ => unreachable!(),
        };
        match method {
            Some(Value::Obj(closure)) => self.call_closure(closure, argc),
            _ => Err(self.undefined_property(name)),
        }
    }

    fn bind_method(&mut self, class: GcRef, name: GcRef) -> Result<(), RuntimeError> {
        let hash = self.heap.string_hash(name);
        let method = match self.heap.kind(class) {
            ObjKind::Class(c) => c.methods.get(name, hash),
            _ => unreachable!(),
        };
        let closure = match method {
            Some(Value::Obj(closure)) => closure,
            _ => return Err(self.undefined_property(name)),
        };
        let receiver = self.peek(0);
        let bound = self.alloc_bound_method(receiver, closure);
        self.pop();
        self.push(Value::Obj(bound));
        Ok(())
    }

    fn get_property(&mut self) -> Result<(), RuntimeError> {
        let idx = self.read_u8();
        let name = self
            .current_chunk_constant(idx)
            .as_obj()
            .expect("OP_GET_PROPERTY name constant must be a string");
        let receiver = self.peek(0);
        let instance = match receiver {
            Value::Obj(r) if matches!(self.heap.kind(r), ObjKind::Instance(_)) => r,
            _ => return Err(self.runtime_error("Only instances have properties.")),
        };

        let hash = self.heap.string_hash(name);
        let field = match self.heap.kind(instance) {
            ObjKind::Instance(i) => i.fields.get(name, hash),
            _ => unreachable!(),
        };
        match field {
            Some(value) => {
                self.pop();
                self.push(value);
                Ok(())
            }
            None => {
                let class = match self.heap.kind(instance) {
                    ObjKind::Instance(i) => i.class,
                    _ => unreachable!(),
                };
                self.bind_method(class, name)
            }
        }
    }

    fn set_property(&mut self) -> Result<(), RuntimeError> {
        let idx = self.read_u8();
        let name = self
            .current_chunk_constant(idx)
            .as_obj()
            .expect("OP_SET_PROPERTY name constant must be a string");
        let instance = match self.peek(1) {
            Value::Obj(r) if matches!(self.heap.kind(r), ObjKind::Instance(_)) => r,
            _ => return Err(self.runtime_error("Only instances have fields.")),
        };
        let value = self.peek(0);
        let hash = self.heap.string_hash(name);
        if let ObjKind::Instance(i) = self.heap.kind_mut(instance) {
            i.fields.set(name, hash, value);
        }
        let value = self.pop();
        self.pop(); // instance
        self.push(value);
        Ok(())
    }

    fn inherit(&mut self) -> Result<(), RuntimeError> {
        let superclass = match self.peek(1) {
            Value::Obj(r) if matches!(self.heap.kind(r), ObjKind::Class(_)) => r,
            _ => return Err(self.runtime_error("Superclass must be a class.")),
        };
        let subclass = match self.peek(0) {
            Value::Obj(r) => r,
            _ => unreachable!("OP_INHERIT subclass operand must be a class"),
        };

        let entries: Vec<(GcRef, u32, Value)> = match self.heap.kind(superclass) {
            ObjKind::Class(c) => c
                .methods
                .iter()
                .map(|(key, value)| (key, self.heap.string_hash(key), value))
                .collect(),
            _ => unreachable!(),
        };
        if let ObjKind::Class(sub) = self.heap.kind_mut(subclass) {
            for (key, hash, value) in entries {
                sub.methods.set(key, hash, value);
            }
        }
        self.pop(); // the redundant class reference the compiler pushed for OP_INHERIT
        Ok(())
    }

    fn closure_instruction(&mut self) {
        let const_idx = self.read_u8();
        let function = self
            .current_chunk_constant(const_idx)
            .as_obj()
            .expect("OP_CLOSURE constant must be a function");
        let upvalue_count = match self.heap.kind(function) {
            ObjKind::Function(f) => f.upvalue_count,
            _ => unreachable!(),
        };

        let mut upvalues = Vec::with_capacity(upvalue_count as usize);
        for _ in 0..upvalue_count {
            let is_local = self.read_u8();
            let index = self.read_u8() as usize;
            let frame_idx = self.frames.len() - 1;
            if is_local != 0 {
                let slot = self.frames[frame_idx].slots_base + index;
                upvalues.push(self.capture_upvalue(slot));
            } else {
                let enclosing = self.frames[frame_idx].closure;
                let up = match self.heap.kind(enclosing) {
                    ObjKind::Closure(c) => c.upvalues[index],
                    _ => unreachable!(),
                };
                upvalues.push(up);
            }
        }

        let closure = self.alloc_closure(function, upvalues);
        self.push(Value::Obj(closure));
    }

    // -- upvalues -------------------------------------------------------

    fn frame_upvalue(&self, slot: usize) -> GcRef {
        let idx = self.frames.len() - 1;
        let closure = self.frames[idx].closure;
        match self.heap.kind(closure) {
            ObjKind::Closure(c) => c.upvalues[slot],
            _ => unreachable!(),
        }
    }

    fn get_upvalue_value(&self, upvalue: GcRef) -> Value {
        match self.heap.kind(upvalue) {
            ObjKind::Upvalue(u) => match u.state {
                UpvalueState::Open(slot) => self.stack[slot],
                UpvalueState::Closed(v) => v,
            },
            _ => unreachable!(),
        }
    }

    fn set_upvalue_value(&mut self, upvalue: GcRef, value: Value) {
        let slot = match self.heap.kind(upvalue) {
            ObjKind::Upvalue(u) => match u.state {
                UpvalueState::Open(slot) => Some(slot),
                UpvalueState::Closed(_) => None,
            },
            _ => unreachable!(),
        };
        match slot {
            Some(slot) => self.stack[slot] = value,
            None => {
                if let ObjKind::Upvalue(u) = self.heap.kind_mut(upvalue) {
                    u.state = UpvalueState::Closed(value);
                }
            }
        }
    }

    fn upvalue_slot(&self, r: GcRef) -> Option<usize> {
        match self.heap.kind(r) {
            ObjKind::Upvalue(u) => match u.state {
                UpvalueState::Open(slot) => Some(slot),
                UpvalueState::Closed(_) => None,
            },
            _ => unreachable!("expected an Upvalue object"),
        }
    }

    /// Reuses an already-open upvalue for `slot` if one exists; otherwise
    /// allocates one and splices it into `open_upvalues`, keeping the list
    /// sorted by descending slot (spec.md §3.5).
    fn capture_upvalue(&mut self, slot: usize) -> GcRef {
        for &r in &self.open_upvalues {
            if self.upvalue_slot(r) == Some(slot) {
                return r;
            }
        }

        let frame_closures = self.frame_closures();
        let extra = [self.init_string];
        let roots = build_roots(
            &self.stack,
            &frame_closures,
            &self.open_upvalues,
            &self.globals,
            &extra,
        );
        let upvalue = self.heap.alloc_upvalue(UpvalueState::Open(slot), &roots);

        let pos = self
            .open_upvalues
            .iter()
            .position(|&r| self.upvalue_slot(r).is_some_and(|s| s < slot))
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(pos, upvalue);
        upvalue
    }

    /// Migrates every open upvalue at or above `from_slot` to `Closed`,
    /// per spec.md §4.4. The open list is sorted by descending slot, so
    /// these are always a prefix of it.
    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(&r) = self.open_upvalues.first() {
            match self.upvalue_slot(r) {
                Some(slot) if slot >= from_slot => {
                    let value = self.stack[slot];
                    if let ObjKind::Upvalue(u) = self.heap.kind_mut(r) {
                        u.state = UpvalueState::Closed(value);
                    }
                    self.open_upvalues.remove(0);
                }
                _ => break,
            }
        }
    }

    // -- arithmetic -------------------------------------------------------

    fn binary_number(&mut self, op: impl Fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        match (self.peek(1).as_number(), self.peek(0).as_number()) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(op(a, b)));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn binary_compare(&mut self, op: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        match (self.peek(1).as_number(), self.peek(0).as_number()) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                self.push(Value::Bool(op(a, b)));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn add(&mut self) -> Result<(), RuntimeError> {
        match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(a + b));
                Ok(())
            }
            (Value::Obj(a), Value::Obj(b)) if self.is_string(a) && self.is_string(b) => {
                let concatenated = format!("{}{}", self.heap.format_value(Value::Obj(a)), self.heap.format_value(Value::Obj(b)));
                self.pop();
                self.pop();
                let r = self.take_string(concatenated);
                self.push(Value::Obj(r));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be two numbers or two strings.")),
        }
    }

    fn is_string(&self, r: GcRef) -> bool {
        matches!(self.heap.kind(r), ObjKind::String(_))
    }

    // -- rooted allocation helpers ------------------------------------------

    fn alloc_closure(&mut self, function: GcRef, upvalues: Vec<GcRef>) -> GcRef {
        let frame_closures = self.frame_closures();
        let extra = [self.init_string];
        let roots = build_roots(
            &self.stack,
            &frame_closures,
            &self.open_upvalues,
            &self.globals,
            &extra,
        );
        self.heap.alloc_closure(function, upvalues, &roots)
    }

    fn alloc_native(&mut self, name: GcRef, function: NativeFnPtr) -> GcRef {
        let frame_closures = self.frame_closures();
        let extra = [self.init_string];
        let roots = build_roots(
            &self.stack,
            &frame_closures,
            &self.open_upvalues,
            &self.globals,
            &extra,
        );
        self.heap.alloc_native(name, function, &roots)
    }

    fn alloc_class(&mut self, name: GcRef) -> GcRef {
        let frame_closures = self.frame_closures();
        let extra = [self.init_string];
        let roots = build_roots(
            &self.stack,
            &frame_closures,
            &self.open_upvalues,
            &self.globals,
            &extra,
        );
        self.heap.alloc_class(name, &roots)
    }

    fn alloc_instance(&mut self, class: GcRef) -> GcRef {
        let frame_closures = self.frame_closures();
        let extra = [self.init_string];
        let roots = build_roots(
            &self.stack,
            &frame_closures,
            &self.open_upvalues,
            &self.globals,
            &extra,
        );
        self.heap.alloc_instance(class, &roots)
    }

    fn alloc_bound_method(&mut self, receiver: Value, method: GcRef) -> GcRef {
        let frame_closures = self.frame_closures();
        let extra = [self.init_string];
        let roots = build_roots(
            &self.stack,
            &frame_closures,
            &self.open_upvalues,
            &self.globals,
            &extra,
        );
        self.heap.alloc_bound_method(receiver, method, &roots)
    }

    fn copy_string(&mut self, s: &str) -> GcRef {
        let frame_closures = self.frame_closures();
        let extra = [self.init_string];
        let roots = build_roots(
            &self.stack,
            &frame_closures,
            &self.open_upvalues,
            &self.globals,
            &extra,
        );
        self.heap.copy_string(s, &roots)
    }

    fn take_string(&mut self, s: String) -> GcRef {
        let frame_closures = self.frame_closures();
        let extra = [self.init_string];
        let roots = build_roots(
            &self.stack,
            &frame_closures,
            &self.open_upvalues,
            &self.globals,
            &extra,
        );
        self.heap.take_string(s, &roots)
    }

    fn frame_closures(&self) -> Vec<GcRef> {
        self.frames.iter().map(|f| f.closure).collect()
    }

    // -- errors -----------------------------------------------------------

    fn undefined_variable(&mut self, name: GcRef) -> RuntimeError {
        let text = self.heap.format_value(Value::Obj(name));
        self.runtime_error(format!("Undefined variable '{text}'."))
    }

    fn undefined_property(&mut self, name: GcRef) -> RuntimeError {
        let text = self.heap.format_value(Value::Obj(name));
        self.runtime_error(format!("Undefined property '{text}'."))
    }

    /// Builds the backtrace (innermost frame first) and resets the stack
    /// and frames, per spec.md §4.4/§7's "all fatal, no user-level catch".
    fn runtime_error(&mut self, message: impl Into<String>) -> RuntimeError {
        let message = message.into();
        let mut backtrace = Vec::with_capacity(self.frames.len());
        for frame_idx in (0..self.frames.len()).rev() {
            let line = self.current_line(frame_idx);
            let function = self.frame_function(frame_idx);
            let function_name = match self.heap.kind(function) {
                ObjKind::Function(f) => f.name.map(|n| self.heap.format_value(Value::Obj(n))),
                _ => unreachable!(),
            };
            backtrace.push(BacktraceFrame { line, function_name });
        }
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        RuntimeError::new(message, backtrace)
    }

    // -- bytecode reading ---------------------------------------------------

    fn frame_function(&self, frame_idx: usize) -> GcRef {
        match self.heap.kind(self.frames[frame_idx].closure) {
            ObjKind::Closure(c) => c.function,
            _ => unreachable!("frame closure must wrap a Closure object"),
        }
    }

    fn read_u8(&mut self) -> u8 {
        let frame_idx = self.frames.len() - 1;
        let ip = self.frames[frame_idx].ip;
        let function = self.frame_function(frame_idx);
        let byte = match self.heap.kind(function) {
            ObjKind::Function(f) => f.chunk.code[ip],
            _ => unreachable!(),
        };
        self.frames[frame_idx].ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_u8() as u16;
        let lo = self.read_u8() as u16;
        (hi << 8) | lo
    }

    fn current_chunk_constant(&self, idx: u8) -> Value {
        let frame_idx = self.frames.len() - 1;
        let function = self.frame_function(frame_idx);
        match self.heap.kind(function) {
            ObjKind::Function(f) => f.chunk.constants[idx as usize],
            _ => unreachable!(),
        }
    }

    /// `GET_GLOBAL`/`DEFINE_GLOBAL`/`SET_GLOBAL`'s operand is always a
    /// string constant (the compiler never emits anything else there).
    fn global_name_constant(&self, idx: u8) -> GcRef {
        self.current_chunk_constant(idx)
            .as_obj()
            .expect("global name constant must be a string")
    }

    fn current_line(&self, frame_idx: usize) -> u32 {
        let function = self.frame_function(frame_idx);
        let ip = self.frames[frame_idx].ip;
        match self.heap.kind(function) {
            ObjKind::Function(f) => f.chunk.lines[ip.saturating_sub(1)],
            _ => unreachable!(),
        }
    }

    fn trace_instruction(&self) {
        let frame_idx = self.frames.len() - 1;
        let ip = self.frames[frame_idx].ip;
        let function = self.frame_function(frame_idx);
        let stack_preview: String = self
            .stack
            .iter()
            .map(|v| format!("[ {} ]", self.heap.format_value(*v)))
            .collect();
        let (instruction, _) = match self.heap.kind(function) {
            ObjKind::Function(f) => f.chunk.disassemble_instruction(&self.heap, ip),
            _ => unreachable!(),
        };
        tracing::trace!(stack = %stack_preview, %instruction, "step");
    }

    // -- stack --------------------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("pop from an empty VM stack")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }
}

/// Assembles a [`Roots`] from individually-borrowed fields so the borrow
/// checker sees it as disjoint from `self.heap` (see the module doc).
fn build_roots<'a>(
    stack: &'a [Value],
    frame_closures: &'a [GcRef],
    open_upvalues: &'a [GcRef],
    globals: &'a Table,
    extra: &'a [GcRef],
) -> Roots<'a> {
    Roots {
        stack,
        frame_closures,
        open_upvalues,
        globals,
        extra,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn run_capturing(source: &str) -> (InterpretResult, String) {
        let buffer = SharedBuffer::default();
        let mut vm = Vm::with_output(VmConfig::default(), Box::new(buffer.clone()));
        let result = vm.interpret(source);
        let text = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        (result, text)
    }

    #[test]
    fn arithmetic_and_print() {
        let (result, out) = run_capturing("print 1 + 2 * 3;");
        assert!(matches!(result, InterpretResult::Ok));
        assert_eq!(out, "7\n");
    }

    #[test]
    fn string_concatenation() {
        let (result, out) = run_capturing(r#"print "foo" + "bar";"#);
        assert!(matches!(result, InterpretResult::Ok));
        assert_eq!(out, "foobar\n");
    }

    #[test]
    fn closure_capture_across_return() {
        let source = r#"
            fun makeCounter() { var i = 0; fun inc() { i = i + 1; print i; } return inc; }
            var c = makeCounter(); c(); c(); c();
        "#;
        let (result, out) = run_capturing(source);
        assert!(matches!(result, InterpretResult::Ok));
        assert_eq!(out, "1\n2\n3\n");
    }

    #[test]
    fn class_method_and_this() {
        let source = r#"
            class Greeter { greet(name) { print "hi " + name; } }
            Greeter().greet("world");
        "#;
        let (result, out) = run_capturing(source);
        assert!(matches!(result, InterpretResult::Ok));
        assert_eq!(out, "hi world\n");
    }

    #[test]
    fn inheritance_and_super() {
        let source = r#"
            class A { m() { print "A"; } }
            class B < A { m() { super.m(); print "B"; } }
            B().m();
        "#;
        let (result, out) = run_capturing(source);
        assert!(matches!(result, InterpretResult::Ok));
        assert_eq!(out, "A\nB\n");
    }

    #[test]
    fn fibonacci_recursion() {
        let source = r#"
            fun fib(n){ if (n < 2) return n; return fib(n-1) + fib(n-2); }
            print fib(10);
        "#;
        let (result, out) = run_capturing(source);
        assert!(matches!(result, InterpretResult::Ok));
        assert_eq!(out, "55\n");
    }

    #[test]
    fn initializer_implicitly_returns_the_receiver() {
        let source = r#"
            class Box { init(v) { this.v = v; } }
            var b = Box(42);
            print b.v;
        "#;
        let (result, out) = run_capturing(source);
        assert!(matches!(result, InterpretResult::Ok));
        assert_eq!(out, "42\n");
    }

    #[test]
    fn undefined_variable_is_a_runtime_error() {
        let (result, _) = run_capturing("print x;");
        match result {
            InterpretResult::RuntimeError(err) => {
                assert!(err.message.contains("Undefined variable 'x'."));
            }
            other => panic!("expected a runtime error, got {other:?}"),
        }
    }

    #[test]
    fn adding_a_string_and_a_number_is_a_runtime_error() {
        let (result, _) = run_capturing(r#""a" + 1;"#);
        match result {
            InterpretResult::RuntimeError(err) => {
                assert!(err.message.contains("Operands must be two numbers or two strings."));
            }
            other => panic!("expected a runtime error, got {other:?}"),
        }
    }

    #[test]
    fn arity_mismatch_is_a_runtime_error() {
        let (result, _) = run_capturing("fun f(a) { return a; } f(1, 2);");
        match result {
            InterpretResult::RuntimeError(err) => {
                assert!(err.message.contains("Expected 1 arguments but got 2."));
            }
            other => panic!("expected a runtime error, got {other:?}"),
        }
    }

    #[test]
    fn calling_a_non_callable_value_is_a_runtime_error() {
        let (result, _) = run_capturing("var x = 1; x();");
        match result {
            InterpretResult::RuntimeError(err) => {
                assert!(err.message.contains("Can only call functions and classes."));
            }
            other => panic!("expected a runtime error, got {other:?}"),
        }
    }

    #[test]
    fn deep_recursion_overflows_the_frame_stack() {
        let source = "fun rec(n) { return rec(n + 1); } rec(0);";
        let (result, _) = run_capturing(source);
        match result {
            InterpretResult::RuntimeError(err) => {
                assert!(err.message.contains("Stack overflow."));
            }
            other => panic!("expected a runtime error, got {other:?}"),
        }
    }

    #[test]
    fn compile_error_is_reported_without_running_anything() {
        let (result, out) = run_capturing("print ;");
        assert!(matches!(result, InterpretResult::CompileError(_)));
        assert_eq!(out, "");
    }
}
