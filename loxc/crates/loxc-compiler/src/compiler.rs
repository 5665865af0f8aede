//! The single-pass compiler (spec.md §4.2): lexer, Pratt parser, and
//! bytecode emitter fused into one walk over the token stream, with no
//! intermediate AST. Locals, upvalues, and class context are resolved as
//! compile-time-only bookkeeping that never reaches the heap; everything
//! that *does* reach the heap (strings, function objects) goes through
//! [`Heap`]'s allocation methods so a collection can run safely mid-compile.
//!
//! `Heap` is threaded through as an explicit parameter rather than stored on
//! `Compiler` itself: the compiler's own in-progress function chain is a
//! GC root while compiling, and assembling that root list only when an
//! allocation is about to happen (see [`Compiler::roots`]) avoids the
//! self-referential-borrow tangle that storing `&mut Heap` on `Compiler`
//! would create.

use loxc_gc::{GcRef, Heap, LoxFunction, ObjKind, OpCode, Roots, Value};
use loxc_lex::{Lexer, Token, TokenKind};
use loxc_util::{CompileError, CompileErrors};

use crate::rules::{rule, Precedence};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local {
    name: String,
    /// `None` while the initializer of its own `var` statement is still
    /// being compiled (spec.md §4.2's "can't read local variable in its own
    /// initializer" edge case).
    depth: Option<i32>,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

/// Per-function compile-time state: one pushed for the top-level script and
/// one more for every nested function/method/lambda body, forming the
/// `enclosing` chain spec.md §4.2 describes as a parallel stack rather than
/// a linked list of owned structs (Rust's borrow checker is much happier
/// with `Vec<FunctionScope>` than with each scope owning its enclosing
/// scope by value).
struct FunctionScope {
    function: GcRef,
    fn_type: FunctionType,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

impl FunctionScope {
    fn new(function: GcRef, fn_type: FunctionType) -> Self {
        // Slot 0 is reserved: `this` for methods/initializers, otherwise an
        // unnamed slot nothing can reference by name.
        let implicit_name = match fn_type {
            FunctionType::Method | FunctionType::Initializer => "this",
            FunctionType::Function | FunctionType::Script => "",
        };
        Self {
            function,
            fn_type,
            locals: vec![Local {
                name: implicit_name.to_string(),
                depth: Some(0),
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassScope {
    has_superclass: bool,
}

pub struct Compiler<'src> {
    lexer: Lexer<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    scopes: Vec<FunctionScope>,
    classes: Vec<ClassScope>,
}

/// Compiles `source` into a top-level script function, or collects every
/// syntax error encountered (spec.md §4.2's panic-mode recovery means a
/// single run can report more than one).
pub fn compile(source: &str, heap: &mut Heap) -> Result<GcRef, CompileErrors> {
    let mut compiler = Compiler::new(source);
    let script = compiler.alloc_function(None, heap);
    compiler.scopes.push(FunctionScope::new(script, FunctionType::Script));

    compiler.advance();
    while !compiler.check(TokenKind::Eof) {
        compiler.declaration(heap);
    }
    compiler.consume(TokenKind::Eof, "Expect end of expression.");
    compiler.emit_return(heap);

    let root = compiler.scopes.pop().expect("script scope still on the stack");
    if let ObjKind::Function(f) = heap.kind_mut(root.function) {
        f.upvalue_count = root.upvalues.len() as u8;
    }

    if compiler.had_error {
        Err(CompileErrors(compiler.errors))
    } else {
        Ok(root.function)
    }
}

impl<'src> Compiler<'src> {
    fn new(source: &'src str) -> Self {
        let placeholder = Token::new(TokenKind::Eof, "", 0);
        Self {
            lexer: Lexer::new(source.as_bytes()),
            previous: placeholder.clone(),
            current: placeholder,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            scopes: Vec::new(),
            classes: Vec::new(),
        }
    }

    // -- token stream -----------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current.clone();
        loop {
            self.current = self.lexer.next_token();
            if let TokenKind::Error(msg) = self.current.kind.clone() {
                self.error_at_current(&msg);
                continue;
            }
            break;
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    // -- error reporting ----------------------------------------------------

    fn token_report(token: &Token) -> (u32, Option<String>) {
        match token.kind {
            TokenKind::Eof | TokenKind::Error(_) => (token.line, None),
            _ => (token.line, Some(token.lexeme.to_string())),
        }
    }

    fn error_at_current(&mut self, message: &str) {
        let (line, lexeme) = Self::token_report(&self.current);
        self.report(line, lexeme, message);
    }

    fn error(&mut self, message: &str) {
        let (line, lexeme) = Self::token_report(&self.previous);
        self.report(line, lexeme, message);
    }

    fn report(&mut self, line: u32, lexeme: Option<String>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.errors.push(CompileError::new(line, lexeme, message.to_string()));
    }

    /// Panic-mode recovery (spec.md §4.2): discard tokens until we're
    /// probably at the start of the next statement, so one syntax error
    /// doesn't cascade into a wall of bogus follow-on errors.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(TokenKind::Eof) {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // -- GC interaction -----------------------------------------------------

    /// Every function object currently being compiled (outermost first),
    /// the compiler's contribution to the root set for any collection that
    /// runs mid-compile.
    fn roots(&self) -> Vec<GcRef> {
        self.scopes.iter().map(|s| s.function).collect()
    }

    fn alloc_function(&mut self, name: Option<GcRef>, heap: &mut Heap) -> GcRef {
        let extra = self.roots();
        let roots = Roots {
            extra: &extra,
            ..Roots::default()
        };
        heap.alloc_function(LoxFunction::new(name), &roots)
    }

    fn intern(&mut self, s: &str, heap: &mut Heap) -> GcRef {
        let extra = self.roots();
        let roots = Roots {
            extra: &extra,
            ..Roots::default()
        };
        heap.copy_string(s, &roots)
    }

    // -- bytecode emission --------------------------------------------------

    fn current_function(&self) -> GcRef {
        self.scopes.last().expect("no active function scope").function
    }

    fn chunk_len(&self, heap: &Heap) -> usize {
        match heap.kind(self.current_function()) {
            ObjKind::Function(f) => f.chunk.code.len(),
            _ => unreachable!("current function scope must hold a Function object"),
        }
    }

    fn emit_byte(&mut self, byte: u8, heap: &mut Heap) {
        let line = self.previous.line;
        let function = self.current_function();
        if let ObjKind::Function(f) = heap.kind_mut(function) {
            f.chunk.write_u8(byte, line);
        }
    }

    fn emit_op(&mut self, op: OpCode, heap: &mut Heap) {
        self.emit_byte(op as u8, heap);
    }

    fn emit_jump(&mut self, op: OpCode, heap: &mut Heap) -> usize {
        self.emit_op(op, heap);
        self.emit_byte(0xff, heap);
        self.emit_byte(0xff, heap);
        self.chunk_len(heap) - 2
    }

    fn patch_jump(&mut self, offset: usize, heap: &mut Heap) {
        let jump = self.chunk_len(heap) - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let function = self.current_function();
        if let ObjKind::Function(f) = heap.kind_mut(function) {
            f.chunk.code[offset] = ((jump >> 8) & 0xff) as u8;
            f.chunk.code[offset + 1] = (jump & 0xff) as u8;
        }
    }

    fn emit_loop(&mut self, loop_start: usize, heap: &mut Heap) {
        self.emit_op(OpCode::Loop, heap);
        let offset = self.chunk_len(heap) - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte((offset >> 8) as u8, heap);
        self.emit_byte((offset & 0xff) as u8, heap);
    }

    fn make_constant(&mut self, value: Value, heap: &mut Heap) -> u8 {
        let function = self.current_function();
        let idx = match heap.kind_mut(function) {
            ObjKind::Function(f) => f.chunk.add_constant(value),
            _ => unreachable!(),
        };
        if idx > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        idx as u8
    }

    fn emit_constant(&mut self, value: Value, heap: &mut Heap) {
        let idx = self.make_constant(value, heap);
        self.emit_op(OpCode::Constant, heap);
        self.emit_byte(idx, heap);
    }

    fn emit_return(&mut self, heap: &mut Heap) {
        if self.scopes.last().unwrap().fn_type == FunctionType::Initializer {
            self.emit_op(OpCode::GetLocal, heap);
            self.emit_byte(0, heap);
        } else {
            self.emit_op(OpCode::Nil, heap);
        }
        self.emit_op(OpCode::Return, heap);
    }

    fn identifier_constant(&mut self, name: &str, heap: &mut Heap) -> u8 {
        let r = self.intern(name, heap);
        self.make_constant(Value::Obj(r), heap)
    }

    // -- scopes & locals ------------------------------------------------

    fn begin_scope(&mut self) {
        self.scopes.last_mut().unwrap().scope_depth += 1;
    }

    fn end_scope(&mut self, heap: &mut Heap) {
        let mut closed: Vec<bool> = Vec::new();
        {
            let scope = self.scopes.last_mut().unwrap();
            scope.scope_depth -= 1;
            let depth = scope.scope_depth;
            while let Some(local) = scope.locals.last() {
                if local.depth.map_or(false, |d| d > depth) {
                    closed.push(local.is_captured);
                    scope.locals.pop();
                } else {
                    break;
                }
            }
        }
        for is_captured in closed {
            if is_captured {
                self.emit_op(OpCode::CloseUpvalue, heap);
            } else {
                self.emit_op(OpCode::Pop, heap);
            }
        }
    }

    fn add_local(&mut self, name: String) {
        if self.scopes.last().unwrap().locals.len() >= 256 {
            self.error("Too many local variables in function.");
            return;
        }
        self.scopes.last_mut().unwrap().locals.push(Local {
            name,
            depth: None,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        let scope_depth = self.scopes.last().unwrap().scope_depth;
        if scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme.to_string();
        let dup = {
            let locals = &self.scopes.last().unwrap().locals;
            let mut found = false;
            for local in locals.iter().rev() {
                if let Some(d) = local.depth {
                    if d < scope_depth {
                        break;
                    }
                }
                if local.name == name {
                    found = true;
                    break;
                }
            }
            found
        };
        if dup {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn mark_initialized(&mut self) {
        let scope = self.scopes.last_mut().unwrap();
        if scope.scope_depth == 0 {
            return;
        }
        let depth = scope.scope_depth;
        if let Some(local) = scope.locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    fn parse_variable(&mut self, message: &str, heap: &mut Heap) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.scopes.last().unwrap().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme.to_string();
        self.identifier_constant(&name, heap)
    }

    fn define_variable(&mut self, global: u8, heap: &mut Heap) {
        if self.scopes.last().unwrap().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op(OpCode::DefineGlobal, heap);
        self.emit_byte(global, heap);
    }

    fn resolve_local(&mut self, scope_idx: usize, name: &str) -> Option<u8> {
        let found = self.scopes[scope_idx]
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, l)| l.name == name)
            .map(|(i, l)| (i as u8, l.depth.is_some()));
        match found {
            Some((idx, true)) => Some(idx),
            Some((idx, false)) => {
                self.error("Can't read local variable in its own initializer.");
                Some(idx)
            }
            None => None,
        }
    }

    fn resolve_upvalue(&mut self, scope_idx: usize, name: &str) -> Option<u8> {
        if scope_idx == 0 {
            return None;
        }
        if let Some(local_idx) = self.resolve_local(scope_idx - 1, name) {
            self.scopes[scope_idx - 1].locals[local_idx as usize].is_captured = true;
            return Some(self.add_upvalue(scope_idx, local_idx, true));
        }
        if let Some(upvalue_idx) = self.resolve_upvalue(scope_idx - 1, name) {
            return Some(self.add_upvalue(scope_idx, upvalue_idx, false));
        }
        None
    }

    fn add_upvalue(&mut self, scope_idx: usize, index: u8, is_local: bool) -> u8 {
        {
            let existing = self.scopes[scope_idx]
                .upvalues
                .iter()
                .position(|u| u.index == index && u.is_local == is_local);
            if let Some(pos) = existing {
                return pos as u8;
            }
        }
        if self.scopes[scope_idx].upvalues.len() >= 256 {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.scopes[scope_idx].upvalues.push(UpvalueDesc { index, is_local });
        (self.scopes[scope_idx].upvalues.len() - 1) as u8
    }

    fn named_variable(&mut self, name: &str, can_assign: bool, heap: &mut Heap) {
        let scope_idx = self.scopes.len() - 1;
        let (get_op, set_op, slot) = if let Some(local) = self.resolve_local(scope_idx, name) {
            (OpCode::GetLocal, OpCode::SetLocal, local)
        } else if let Some(upvalue) = self.resolve_upvalue(scope_idx, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, upvalue)
        } else {
            let global = self.identifier_constant(name, heap);
            (OpCode::GetGlobal, OpCode::SetGlobal, global)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression(heap);
            self.emit_op(set_op, heap);
            self.emit_byte(slot, heap);
        } else {
            self.emit_op(get_op, heap);
            self.emit_byte(slot, heap);
        }
    }

    // -- expressions ------------------------------------------------------

    fn expression(&mut self, heap: &mut Heap) {
        self.parse_precedence(Precedence::Assignment, heap);
    }

    fn parse_precedence(&mut self, precedence: Precedence, heap: &mut Heap) {
        self.advance();
        let prefix = match rule(&self.previous.kind).prefix {
            Some(f) => f,
            None => {
                self.error("Expect expression.");
                return;
            }
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, heap, can_assign);

        while precedence <= rule(&self.current.kind).precedence {
            self.advance();
            let infix = rule(&self.previous.kind).infix.expect("infix rule must exist here");
            infix(self, heap, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn number(&mut self, heap: &mut Heap, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value), heap);
    }

    fn string(&mut self, heap: &mut Heap, _can_assign: bool) {
        let raw = self.previous.lexeme;
        let inner = &raw[1..raw.len() - 1];
        let s = self.intern(inner, heap);
        self.emit_constant(Value::Obj(s), heap);
    }

    fn literal(&mut self, heap: &mut Heap, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False, heap),
            TokenKind::Nil => self.emit_op(OpCode::Nil, heap),
            TokenKind::True => self.emit_op(OpCode::True, heap),
            _ => unreachable!(),
        }
    }

    fn grouping(&mut self, heap: &mut Heap, _can_assign: bool) {
        self.expression(heap);
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, heap: &mut Heap, _can_assign: bool) {
        let op_kind = self.previous.kind.clone();
        self.parse_precedence(Precedence::Unary, heap);
        match op_kind {
            TokenKind::Minus => self.emit_op(OpCode::Negate, heap),
            TokenKind::Bang => self.emit_op(OpCode::Not, heap),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, heap: &mut Heap, _can_assign: bool) {
        let op_kind = self.previous.kind.clone();
        let next_prec = rule(&op_kind).precedence.next();
        self.parse_precedence(next_prec, heap);
        match op_kind {
            TokenKind::Plus => self.emit_op(OpCode::Add, heap),
            TokenKind::Minus => self.emit_op(OpCode::Subtract, heap),
            TokenKind::Star => self.emit_op(OpCode::Multiply, heap),
            TokenKind::Slash => self.emit_op(OpCode::Divide, heap),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal, heap),
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal, heap);
                self.emit_op(OpCode::Not, heap);
            }
            TokenKind::Greater => self.emit_op(OpCode::Greater, heap),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less, heap);
                self.emit_op(OpCode::Not, heap);
            }
            TokenKind::Less => self.emit_op(OpCode::Less, heap),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater, heap);
                self.emit_op(OpCode::Not, heap);
            }
            _ => unreachable!(),
        }
    }

    fn and_(&mut self, heap: &mut Heap, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse, heap);
        self.emit_op(OpCode::Pop, heap);
        self.parse_precedence(Precedence::And, heap);
        self.patch_jump(end_jump, heap);
    }

    fn or_(&mut self, heap: &mut Heap, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse, heap);
        let end_jump = self.emit_jump(OpCode::Jump, heap);
        self.patch_jump(else_jump, heap);
        self.emit_op(OpCode::Pop, heap);
        self.parse_precedence(Precedence::Or, heap);
        self.patch_jump(end_jump, heap);
    }

    fn variable(&mut self, heap: &mut Heap, can_assign: bool) {
        let name = self.previous.lexeme.to_string();
        self.named_variable(&name, can_assign, heap);
    }

    fn this_(&mut self, heap: &mut Heap, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable("this", false, heap);
    }

    fn super_(&mut self, heap: &mut Heap, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let method_name = self.previous.lexeme.to_string();
        let name_const = self.identifier_constant(&method_name, heap);

        self.named_variable("this", false, heap);
        if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list(heap);
            self.named_variable("super", false, heap);
            self.emit_op(OpCode::SuperInvoke, heap);
            self.emit_byte(name_const, heap);
            self.emit_byte(arg_count, heap);
        } else {
            self.named_variable("super", false, heap);
            self.emit_op(OpCode::GetSuper, heap);
            self.emit_byte(name_const, heap);
        }
    }

    fn dot(&mut self, heap: &mut Heap, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme.to_string();
        let name_const = self.identifier_constant(&name, heap);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression(heap);
            self.emit_op(OpCode::SetProperty, heap);
            self.emit_byte(name_const, heap);
        } else if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list(heap);
            self.emit_op(OpCode::Invoke, heap);
            self.emit_byte(name_const, heap);
            self.emit_byte(arg_count, heap);
        } else {
            self.emit_op(OpCode::GetProperty, heap);
            self.emit_byte(name_const, heap);
        }
    }

    fn call(&mut self, heap: &mut Heap, _can_assign: bool) {
        let arg_count = self.argument_list(heap);
        self.emit_op(OpCode::Call, heap);
        self.emit_byte(arg_count, heap);
    }

    fn argument_list(&mut self, heap: &mut Heap) -> u8 {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression(heap);
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count as u8
    }

    // -- statements -------------------------------------------------------

    fn declaration(&mut self, heap: &mut Heap) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration(heap);
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration(heap);
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration(heap);
        } else {
            self.statement(heap);
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self, heap: &mut Heap) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme.to_string();
        self.declare_variable();
        let name_const = self.identifier_constant(&class_name, heap);
        self.emit_op(OpCode::Class, heap);
        self.emit_byte(name_const, heap);
        self.define_variable(name_const, heap);

        self.classes.push(ClassScope { has_superclass: false });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let superclass_name = self.previous.lexeme.to_string();
            if superclass_name == class_name {
                self.error("A class can't inherit from itself.");
            }
            self.named_variable(&superclass_name, false, heap);

            self.begin_scope();
            self.add_local("super".to_string());
            self.define_variable(0, heap);

            self.named_variable(&class_name, false, heap);
            self.emit_op(OpCode::Inherit, heap);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(&class_name, false, heap);

        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method(heap);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop, heap);

        if self.classes.last().unwrap().has_superclass {
            self.end_scope(heap);
        }
        self.classes.pop();
    }

    fn method(&mut self, heap: &mut Heap) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme.to_string();
        let const_idx = self.identifier_constant(&name, heap);
        let fn_type = if name == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(fn_type, heap);
        self.emit_op(OpCode::Method, heap);
        self.emit_byte(const_idx, heap);
    }

    fn fun_declaration(&mut self, heap: &mut Heap) {
        let global = self.parse_variable("Expect function name.", heap);
        self.mark_initialized();
        self.function(FunctionType::Function, heap);
        self.define_variable(global, heap);
    }

    fn function(&mut self, fn_type: FunctionType, heap: &mut Heap) {
        let fn_name = self.previous.lexeme.to_string();
        let name_ref = self.intern(&fn_name, heap);
        let function_obj = self.alloc_function(Some(name_ref), heap);
        self.scopes.push(FunctionScope::new(function_obj, fn_type));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        let mut arity: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                arity += 1;
                if arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let param_const = self.parse_variable("Expect parameter name.", heap);
                self.define_variable(param_const, heap);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        if let ObjKind::Function(f) = heap.kind_mut(function_obj) {
            f.arity = arity.min(255) as u8;
        }

        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block(heap);

        self.emit_return(heap);
        let finished = self.scopes.pop().expect("function scope still on the stack");
        if let ObjKind::Function(f) = heap.kind_mut(finished.function) {
            f.upvalue_count = finished.upvalues.len() as u8;
        }

        let const_idx = self.make_constant(Value::Obj(finished.function), heap);
        self.emit_op(OpCode::Closure, heap);
        self.emit_byte(const_idx, heap);
        for uv in &finished.upvalues {
            self.emit_byte(if uv.is_local { 1 } else { 0 }, heap);
            self.emit_byte(uv.index, heap);
        }
    }

    fn var_declaration(&mut self, heap: &mut Heap) {
        let global = self.parse_variable("Expect variable name.", heap);
        if self.match_token(TokenKind::Equal) {
            self.expression(heap);
        } else {
            self.emit_op(OpCode::Nil, heap);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global, heap);
    }

    fn statement(&mut self, heap: &mut Heap) {
        if self.match_token(TokenKind::Print) {
            self.print_statement(heap);
        } else if self.match_token(TokenKind::For) {
            self.for_statement(heap);
        } else if self.match_token(TokenKind::If) {
            self.if_statement(heap);
        } else if self.match_token(TokenKind::Return) {
            self.return_statement(heap);
        } else if self.match_token(TokenKind::While) {
            self.while_statement(heap);
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block(heap);
            self.end_scope(heap);
        } else {
            self.expression_statement(heap);
        }
    }

    fn block(&mut self, heap: &mut Heap) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration(heap);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self, heap: &mut Heap) {
        self.expression(heap);
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print, heap);
    }

    fn expression_statement(&mut self, heap: &mut Heap) {
        self.expression(heap);
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop, heap);
    }

    fn return_statement(&mut self, heap: &mut Heap) {
        if self.scopes.last().unwrap().fn_type == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return(heap);
        } else {
            if self.scopes.last().unwrap().fn_type == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression(heap);
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return, heap);
        }
    }

    fn if_statement(&mut self, heap: &mut Heap) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression(heap);
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse, heap);
        self.emit_op(OpCode::Pop, heap);
        self.statement(heap);

        let else_jump = self.emit_jump(OpCode::Jump, heap);
        self.patch_jump(then_jump, heap);
        self.emit_op(OpCode::Pop, heap);

        if self.match_token(TokenKind::Else) {
            self.statement(heap);
        }
        self.patch_jump(else_jump, heap);
    }

    fn while_statement(&mut self, heap: &mut Heap) {
        let loop_start = self.chunk_len(heap);
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression(heap);
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse, heap);
        self.emit_op(OpCode::Pop, heap);
        self.statement(heap);
        self.emit_loop(loop_start, heap);

        self.patch_jump(exit_jump, heap);
        self.emit_op(OpCode::Pop, heap);
    }

    fn for_statement(&mut self, heap: &mut Heap) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // no initializer clause
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration(heap);
        } else {
            self.expression_statement(heap);
        }

        let mut loop_start = self.chunk_len(heap);
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression(heap);
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse, heap));
            self.emit_op(OpCode::Pop, heap);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump, heap);
            let increment_start = self.chunk_len(heap);
            self.expression(heap);
            self.emit_op(OpCode::Pop, heap);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start, heap);
            loop_start = increment_start;
            self.patch_jump(body_jump, heap);
        }

        self.statement(heap);
        self.emit_loop(loop_start, heap);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump, heap);
            self.emit_op(OpCode::Pop, heap);
        }
        self.end_scope(heap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loxc_gc::GcConfig;

    fn compile_ok(src: &str) -> GcRef {
        let mut heap = Heap::new(GcConfig::default());
        compile(src, &mut heap).expect("expected a successful compile")
    }

    fn compile_err(src: &str) -> CompileErrors {
        let mut heap = Heap::new(GcConfig::default());
        compile(src, &mut heap).expect_err("expected a compile error")
    }

    #[test]
    fn compiles_a_trivial_script() {
        compile_ok("print 1 + 2;");
    }

    #[test]
    fn compiles_closures_and_classes() {
        compile_ok(
            r#"
            class Counter {
                init() { this.n = 0; }
                next() { this.n = this.n + 1; return this.n; }
            }
            var c = Counter();
            fun makeAdder(x) { fun add(y) { return x + y; } return add; }
            print makeAdder(1)(2);
            "#,
        );
    }

    #[test]
    fn self_inheriting_class_is_an_error() {
        let errors = compile_err("class Oops < Oops {}");
        assert!(errors.0.iter().any(|e| e.message.contains("inherit from itself")));
    }

    #[test]
    fn top_level_return_is_an_error() {
        let errors = compile_err("return 1;");
        assert!(errors.0.iter().any(|e| e.message.contains("top-level code")));
    }

    #[test]
    fn redeclaring_a_local_in_the_same_scope_is_an_error() {
        let errors = compile_err("{ var a = 1; var a = 2; }");
        assert!(errors.0.iter().any(|e| e.message.contains("Already a variable")));
    }

    #[test]
    fn reading_a_local_in_its_own_initializer_is_an_error() {
        let errors = compile_err("{ var a = a; }");
        assert!(errors
            .0
            .iter()
            .any(|e| e.message.contains("own initializer")));
    }

    #[test]
    fn panic_mode_recovers_at_the_next_statement() {
        let errors = compile_err("var ; var x = 1; print x;");
        // one error for the missing identifier, not one per subsequent token
        assert_eq!(errors.0.len(), 1);
    }

    #[test]
    fn accepts_257_locals_but_compiles_to_errors_past_256() {
        let mut src = String::from("{\n");
        for i in 0..257 {
            src.push_str(&format!("var v{} = {};\n", i, i));
        }
        src.push('}');
        let errors = compile_err(&src);
        assert!(errors.0.iter().any(|e| e.message.contains("Too many local variables")));
    }

    #[test]
    fn accepts_255_params_but_errors_past_255() {
        let params: Vec<String> = (0..256).map(|i| format!("p{}", i)).collect();
        let src = format!("fun f({}) {{}}", params.join(", "));
        let errors = compile_err(&src);
        assert!(errors.0.iter().any(|e| e.message.contains("more than 255 parameters")));
    }
}
