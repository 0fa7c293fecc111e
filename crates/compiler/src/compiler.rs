//! Single-pass recursive-descent parser with Pratt-style expression parsing
//! (spec.md §4.2), emitting bytecode directly into a `Function`'s `Chunk` —
//! there is no separate AST stage.

use std::fs;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use simpl_core::chunk::OpCode;
use simpl_core::object::{
    ClosureData, FunctionData, FunctionKind, ModuleData, ObjFunction, ObjModule, ObjString,
    UpvalueDescriptor,
};
use simpl_core::table::Table;
use simpl_core::{Chunk, Heap, Value};

use crate::error::{CompileError, CompileErrors};
use crate::lexer::Lexer;
use crate::module_graph::{ModuleGraph, ModuleState};
use crate::token::{Token, TokenKind};

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_PARAMS: usize = 255;
const MAX_ARGS: usize = 255;
/// spec.md §9 open question: loop/try-catch/switch nesting share one bound
/// so compile-time and run-time stack sizing agree. Matches
/// `simpl_runtime::config::DEFAULT_MAX_BLOCK_NESTING` (see DESIGN.md).
const MAX_BLOCK_STACK: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

fn precedence_of(kind: TokenKind) -> Precedence {
    use TokenKind::*;
    match kind {
        Equal | PlusEqual | MinusEqual | StarEqual | SlashEqual => Precedence::Assignment,
        Or => Precedence::Or,
        And => Precedence::And,
        BangEqual | EqualEqual => Precedence::Equality,
        Greater | GreaterEqual | Less | LessEqual => Precedence::Comparison,
        Plus | Minus => Precedence::Term,
        Star | Slash => Precedence::Factor,
        LeftParen | Dot | LeftBracket => Precedence::Call,
        _ => Precedence::None,
    }
}

struct Local<'src> {
    name: &'src str,
    depth: Option<usize>,
    is_captured: bool,
}

struct UpvalueSlot {
    index: u8,
    is_local: bool,
}

enum BlockCtx {
    Loop(LoopCtx),
    TryCatch,
    Switch(SwitchCtx),
}

struct LoopCtx {
    start_ip: usize,
    /// Offset of the 4-byte (startOff16, outOff16) operand of this loop's
    /// `OP_LOOP_GUARD`, patched once the loop's end is known.
    guard_operand: usize,
}

struct SwitchCtx {
    has_default: bool,
}

/// Per-function compilation record (spec.md §4.2's `Compiler`).
struct FunctionScope<'src> {
    function_name: Option<String>,
    kind: FunctionKind,
    chunk: Chunk,
    arity: u8,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueSlot>,
    scope_depth: usize,
    block_stack: Vec<BlockCtx>,
    is_module_boundary: bool,
}

impl<'src> FunctionScope<'src> {
    fn new(kind: FunctionKind, name: Option<String>) -> Self {
        let implicit_name = if matches!(kind, FunctionKind::Method | FunctionKind::Constructor) {
            "this"
        } else {
            ""
        };
        FunctionScope {
            function_name: name,
            kind,
            chunk: Chunk::new(),
            arity: 0,
            locals: vec![Local {
                name: implicit_name,
                depth: Some(0),
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
            block_stack: Vec::new(),
            is_module_boundary: matches!(kind, FunctionKind::Module | FunctionKind::Script),
        }
    }
}

pub struct Compiler<'src> {
    lexer: Lexer<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    errors: CompileErrors,
    panic_mode: bool,
    scopes: Vec<FunctionScope<'src>>,
    heap: &'src mut Heap,
    module_graph: &'src mut ModuleGraph,
    entry_dir: PathBuf,
    current_dir: PathBuf,
}

pub struct CompileOutcome {
    pub function: NonNull<ObjFunction>,
}

impl<'src> Compiler<'src> {
    pub fn compile(
        source: &'src str,
        heap: &'src mut Heap,
        module_graph: &'src mut ModuleGraph,
        kind: FunctionKind,
        base_dir: PathBuf,
    ) -> Result<CompileOutcome, CompileErrors> {
        Self::compile_inner(source, heap, module_graph, kind, base_dir.clone(), base_dir)
    }

    /// Like [`Compiler::compile`] but with the entry-file directory and the
    /// currently-compiling file's directory tracked separately, so a nested
    /// module compiled mid-import resolves its own relative imports against
    /// its own directory while "absolute-looking" paths still resolve
    /// against the original entry file's directory (spec.md §6, "Source
    /// files").
    fn compile_inner(
        source: &'src str,
        heap: &'src mut Heap,
        module_graph: &'src mut ModuleGraph,
        kind: FunctionKind,
        entry_dir: PathBuf,
        current_dir: PathBuf,
    ) -> Result<CompileOutcome, CompileErrors> {
        let mut lexer = Lexer::new(source);
        let first = lexer.scan_token();
        let mut compiler = Compiler {
            lexer,
            current: first,
            previous: first,
            errors: CompileErrors::default(),
            panic_mode: false,
            scopes: vec![FunctionScope::new(kind, None)],
            heap,
            module_graph,
            entry_dir,
            current_dir,
        };

        while compiler.current.kind != TokenKind::Eof {
            compiler.declaration();
        }

        let (function, _top_level_upvalues) = compiler.end_function();
        if compiler.errors.is_empty() {
            Ok(CompileOutcome { function })
        } else {
            Err(compiler.errors)
        }
    }

    // -- token stream helpers --------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.lexer.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            self.error_at_current(self.current.lexeme);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.errors.push(CompileError::new(token.line, message.to_string()));
    }

    /// Panic-mode synchronization: skip tokens until a statement boundary so
    /// one pass can surface more than one error (spec.md §7).
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            use TokenKind::*;
            if matches!(
                self.current.kind,
                Class | Fun | Var | For | If | While | Return | Import | Export
            ) {
                return;
            }
            self.advance();
        }
    }

    // -- bytecode emission -------------------------------------------------

    fn scope_mut(&mut self) -> &mut FunctionScope<'src> {
        self.scopes.last_mut().unwrap()
    }

    fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.scope_mut().chunk
    }

    fn emit_u8(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk_mut().write_u8(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.previous.line;
        self.chunk_mut().write_op(op, line);
    }

    fn emit_ops(&mut self, a: OpCode, b: OpCode) {
        self.emit_op(a);
        self.emit_op(b);
    }

    fn emit_u16(&mut self, value: u16) {
        let line = self.previous.line;
        self.chunk_mut().write_u16(value, line);
    }

    fn emit_constant(&mut self, value: Value) {
        if self.chunk_mut().constants.len() >= 256 {
            self.error("Too many constants in one chunk.");
            return;
        }
        let idx = self.chunk_mut().add_constant(value);
        self.emit_op(OpCode::Constant);
        self.emit_u8(idx);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let interned = self.heap.intern(name);
        if self.chunk_mut().constants.len() >= 256 {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        self.chunk_mut().add_constant(Value::Obj(
            NonNull::new(interned.as_ptr() as *mut simpl_core::object::GcHeader).unwrap(),
        ))
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_u16(0xffff);
        self.chunk_mut().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let target = self.chunk_mut().code.len();
        let delta = target - offset - 2;
        if delta > u16::MAX as usize {
            self.error("Jump target too far.");
        }
        self.chunk_mut().patch_u16(offset, delta as u16);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.chunk_mut().code.len() + 2 - loop_start;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_u16(offset as u16);
    }

    /// Pops the current function scope, allocates its `Function` object, and
    /// returns it along with the upvalue descriptors the *enclosing* scope
    /// needs to write after `OP_CLOSURE` (spec.md §4.2 "Closures").
    fn end_function(&mut self) -> (NonNull<ObjFunction>, Vec<UpvalueSlot>) {
        self.emit_default_return();
        let scope = self.scopes.pop().unwrap();
        let name = scope
            .function_name
            .as_deref()
            .map(|n| self.heap.intern(n));
        let function = self.heap.alloc_function(FunctionData {
            arity: scope.arity,
            upvalue_count: scope.upvalues.len(),
            chunk: scope.chunk,
            name,
            kind: scope.kind,
        });
        (function, scope.upvalues)
    }

    fn emit_default_return(&mut self) {
        if matches!(
            self.scopes.last().unwrap().kind,
            FunctionKind::Constructor
        ) {
            self.emit_op(OpCode::GetLocal);
            self.emit_u8(0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    // -- scopes --------------------------------------------------------

    fn begin_scope(&mut self) {
        self.scope_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let scope = self.scope_mut();
        scope.scope_depth -= 1;
        let depth = scope.scope_depth;
        while let Some(local) = scope.locals.last() {
            if local.depth.map(|d| d > depth).unwrap_or(false) {
                if scope.locals.last().unwrap().is_captured {
                    self.emit_op(OpCode::CloseUpvalue);
                } else {
                    self.emit_op(OpCode::Pop);
                }
                self.scope_mut().locals.pop();
            } else {
                break;
            }
        }
    }

    // -- variables -------------------------------------------------------

    fn declare_variable(&mut self, name: &'src str) {
        let scope = self.scope_mut();
        if scope.scope_depth == 0 {
            return;
        }
        for local in scope.locals.iter().rev() {
            if local.depth.map(|d| d < scope.scope_depth).unwrap_or(false) {
                break;
            }
            if local.name == name {
                self.error("Already a variable with this name in this scope.");
                return;
            }
        }
        if scope.locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        scope.locals.push(Local {
            name,
            depth: None,
            is_captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        let scope = self.scope_mut();
        if scope.scope_depth == 0 {
            return;
        }
        let depth = scope.scope_depth;
        scope.locals.last_mut().unwrap().depth = Some(depth);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        let name = self.previous.lexeme;
        self.declare_variable(name);
        if self.scope_mut().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(name)
    }

    fn define_variable(&mut self, global_const: u8) {
        if self.scope_mut().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op(OpCode::DefineGlobal);
        self.emit_u8(global_const);
    }

    fn resolve_local(&self, scope_idx: usize, name: &str) -> Option<u8> {
        let scope = &self.scopes[scope_idx];
        scope
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, l)| l.name == name)
            .map(|(i, _)| i as u8)
    }

    /// Semantic-enclosing index: the nearest outer scope, skipping module
    /// boundaries, per spec.md §4.2's variable resolution order.
    fn semantic_enclosing(&self, scope_idx: usize) -> Option<usize> {
        if scope_idx == 0 {
            return None;
        }
        Some(scope_idx - 1)
    }

    fn resolve_upvalue(&mut self, scope_idx: usize, name: &'src str) -> Option<u8> {
        let enclosing = self.semantic_enclosing(scope_idx)?;
        if let Some(local) = self.resolve_local(enclosing, name) {
            self.scopes[enclosing].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(scope_idx, local, true));
        }
        if let Some(up) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(scope_idx, up, false));
        }
        None
    }

    fn add_upvalue(&mut self, scope_idx: usize, index: u8, is_local: bool) -> u8 {
        let scope = &mut self.scopes[scope_idx];
        for (i, up) in scope.upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return i as u8;
            }
        }
        if scope.upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        scope.upvalues.push(UpvalueSlot { index, is_local });
        (scope.upvalues.len() - 1) as u8
    }

    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        let scope_idx = self.scopes.len() - 1;
        let (get_op, set_op, arg): (OpCode, OpCode, u8) =
            if let Some(slot) = self.resolve_local(scope_idx, name) {
                (OpCode::GetLocal, OpCode::SetLocal, slot)
            } else if let Some(slot) = self.resolve_upvalue(scope_idx, name) {
                (OpCode::GetUpvalue, OpCode::SetUpvalue, slot)
            } else {
                let c = self.identifier_constant(name);
                (OpCode::GetGlobal, OpCode::SetGlobal, c)
            };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(set_op);
            self.emit_u8(arg);
        } else if can_assign && self.compound_assign_op() {
            self.emit_op(get_op);
            self.emit_u8(arg);
            self.expression();
            self.emit_op(self.previous_compound_op());
            self.emit_op(set_op);
            self.emit_u8(arg);
        } else {
            self.emit_op(get_op);
            self.emit_u8(arg);
        }
    }

    fn compound_assign_op(&mut self) -> bool {
        use TokenKind::*;
        matches!(
            self.current.kind,
            PlusEqual | MinusEqual | StarEqual | SlashEqual
        ) && {
            self.advance();
            true
        }
    }

    fn previous_compound_op(&self) -> OpCode {
        match self.previous.kind {
            TokenKind::PlusEqual => OpCode::Add,
            TokenKind::MinusEqual => OpCode::Subtract,
            TokenKind::StarEqual => OpCode::Multiply,
            TokenKind::SlashEqual => OpCode::Divide,
            _ => unreachable!(),
        }
    }

    // -- expressions -----------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix(self.previous.kind, can_assign) {
            self.error("Expect expression.");
            return;
        }
        self.finish_precedence(precedence, can_assign);
    }

    /// The infix tail of `parse_precedence`, split out so `grouping` can
    /// resume a Pratt parse after it has already consumed a prefix token
    /// itself (the `(a (op b)*)` case: an identifier was consumed to check
    /// for the arrow-lambda shorthand before falling back to an ordinary
    /// expression).
    fn finish_precedence(&mut self, precedence: Precedence, can_assign: bool) {
        while precedence <= precedence_of(self.current.kind) {
            self.advance();
            self.infix(self.previous.kind, can_assign);
        }
        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn prefix(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        use TokenKind::*;
        match kind {
            LeftParen => self.grouping(can_assign),
            Minus | Bang => self.unary(),
            Number => self.number(),
            String => self.string_literal(),
            StringInterpolation => self.string_interpolation(),
            True | False | Nil => self.literal(),
            Identifier => self.named_variable(self.previous.lexeme, can_assign),
            This => self.named_variable("this", false),
            Super => self.super_(),
            LeftBracket => self.array_literal(),
            LeftBrace => self.object_literal(),
            Fun => self.lambda(),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, kind: TokenKind, can_assign: bool) {
        use TokenKind::*;
        match kind {
            Plus | Minus | Star | Slash | BangEqual | EqualEqual | Greater | GreaterEqual | Less
            | LessEqual => self.binary(),
            And => self.and(),
            Or => self.or(),
            LeftParen => self.call(),
            Dot => self.dot(can_assign),
            LeftBracket => self.index(can_assign),
            _ => {}
        }
    }

    /// `(` is overloaded between a parenthesized expression and the
    /// arrow-lambda shorthand `(params) -> expr|block`. Grounded on
    /// `examples/original_source/src/compiler.c`'s `grouping`, which
    /// disambiguates by how far it can commit before seeing a `->`: empty
    /// parens or a parameter list followed by `,` can only be a lambda, a
    /// single identifier followed by `)` commits to a lambda only if `->`
    /// actually follows it (otherwise it was just a grouped name), and
    /// anything else falls back to an ordinary grouped expression.
    fn grouping(&mut self, can_assign: bool) {
        if self.matches(TokenKind::RightParen) {
            self.consume(TokenKind::Arrow, "Expect '->' for anonymous function.");
            self.compile_arrow_lambda(Vec::new());
            return;
        }
        if self.check(TokenKind::Identifier) {
            self.advance();
            let name = self.previous.lexeme;
            if self.check(TokenKind::Comma) {
                let mut params = vec![name];
                while self.matches(TokenKind::Comma) {
                    self.consume(TokenKind::Identifier, "Expect parameter name.");
                    params.push(self.previous.lexeme);
                }
                self.consume(TokenKind::RightParen, "Expect ')' after parameter list.");
                self.consume(TokenKind::Arrow, "Expect '->' for anonymous function.");
                self.compile_arrow_lambda(params);
                return;
            }
            if self.matches(TokenKind::RightParen) {
                if self.matches(TokenKind::Arrow) {
                    self.compile_arrow_lambda(vec![name]);
                } else {
                    self.named_variable(name, can_assign);
                }
                return;
            }
            // `(a (op b)*)`: the identifier was just the start of an ordinary
            // grouped expression.
            self.named_variable(name, can_assign);
            self.finish_precedence(Precedence::Assignment, can_assign);
            self.consume(TokenKind::RightParen, "Expect ')' after expression.");
            return;
        }
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    /// Compiles the body of an arrow lambda whose parameter names have
    /// already been parsed (spec.md §4.2 "Closures"). `params` is empty for
    /// `() -> ...`, the declared names otherwise.
    fn compile_arrow_lambda(&mut self, params: Vec<&'src str>) {
        self.scopes.push(FunctionScope::new(FunctionKind::Lambda, None));
        self.begin_scope();
        for name in params {
            if self.scope_mut().arity as usize >= MAX_PARAMS {
                self.error("Too many parameters.");
            }
            self.scope_mut().arity += 1;
            self.declare_variable(name);
            self.mark_initialized();
        }
        if self.matches(TokenKind::LeftBrace) {
            self.block();
        } else {
            self.expression();
            self.emit_op(OpCode::Return);
        }
        let (function, upvalues) = self.end_function();
        self.emit_closure(function, &upvalues);
    }

    fn unary(&mut self) {
        let op = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self) {
        let op = self.previous.kind;
        let prec = precedence_of(op);
        self.parse_precedence(prec.next());
        match op {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::BangEqual => self.emit_ops(OpCode::Equal, OpCode::Not),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(OpCode::Less, OpCode::Not),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_ops(OpCode::Greater, OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn and(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn number(&mut self) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!(),
        }
    }

    fn string_literal(&mut self) {
        let raw = self.previous.lexeme;
        let body = &raw[1..raw.len() - 1];
        let interned = self.heap.intern(body);
        self.emit_constant(Value::Obj(
            NonNull::new(interned.as_ptr() as *mut simpl_core::object::GcHeader).unwrap(),
        ));
    }

    /// Compiles a `"...$(expr)..."` literal: the template (with placeholders
    /// replaced by a marker) becomes a constant, each placeholder expression
    /// is compiled in source order via a nested lexer, and
    /// `OP_STRING_INTERPOLATION` pops and formats them at runtime
    /// (spec.md §4.2).
    fn string_interpolation(&mut self) {
        let raw = self.previous.lexeme;
        let body = &raw[1..raw.len() - 1];
        let mut template = String::new();
        let mut placeholder_count: u16 = 0;
        let mut rest = body;
        while let Some(start) = rest.find("$(") {
            template.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let mut depth = 1usize;
            let mut end = 0usize;
            for (i, c) in after.char_indices() {
                match c {
                    '(' => depth += 1,
                    ')' => {
                        depth -= 1;
                        if depth == 0 {
                            end = i;
                            break;
                        }
                    }
                    _ => {}
                }
            }
            let expr_src = &after[..end];
            self.lexer.push_source(expr_src);
            self.advance();
            self.expression();
            self.lexer.pop_source();
            if placeholder_count >= 255 {
                self.error("Too many interpolation placeholders.");
            }
            placeholder_count += 1;
            template.push('\0'); // placeholder marker the VM substitutes in order
            rest = &after[end + 1..];
        }
        template.push_str(rest);
        let template_str = self.heap.intern(&template);
        if self.chunk_mut().constants.len() >= 256 {
            self.error("Too many constants in one chunk.");
            return;
        }
        let idx = self.chunk_mut().add_constant(Value::Obj(
            NonNull::new(template_str.as_ptr() as *mut simpl_core::object::GcHeader).unwrap(),
        ));
        self.emit_op(OpCode::StringInterpolation);
        self.emit_u8(idx);
    }

    fn array_literal(&mut self) {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                if count >= MAX_ARGS as u16 {
                    self.error("Too many array-literal elements.");
                }
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after array elements.");
        self.emit_op(OpCode::Array);
        self.emit_u8(count as u8);
    }

    /// Object literals desugar to `Object()` instances with properties set
    /// from `{ key: value, ... }` pairs; we emit them as an array of
    /// alternating key/value constants consumed by `OP_OBJECT` at runtime.
    fn object_literal(&mut self) {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightBrace) {
            loop {
                if self.check(TokenKind::Identifier) || self.check(TokenKind::String) {
                    self.advance();
                    let key = if self.previous.kind == TokenKind::String {
                        let raw = self.previous.lexeme;
                        raw[1..raw.len() - 1].to_string()
                    } else {
                        self.previous.lexeme.to_string()
                    };
                    let interned = self.heap.intern(&key);
                    self.emit_constant(Value::Obj(
                        NonNull::new(interned.as_ptr() as *mut simpl_core::object::GcHeader)
                            .unwrap(),
                    ));
                } else {
                    self.error("Expect property name.");
                }
                self.consume(TokenKind::Colon, "Expect ':' after property name.");
                self.expression();
                if count >= 255 {
                    self.error("Too many object-literal properties.");
                }
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after object literal.");
        self.emit_op(OpCode::Object);
        self.emit_u8(count as u8);
    }

    fn call(&mut self) {
        let argc = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_u8(argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count >= MAX_ARGS as u16 {
                    self.error("Too many call arguments.");
                }
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme;
        let name_const = self.identifier_constant(name);

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetProperty);
            self.emit_u8(name_const);
        } else if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_op(OpCode::Invoke);
            self.emit_u8(name_const);
            self.emit_u8(argc);
        } else {
            self.emit_op(OpCode::GetProperty);
            self.emit_u8(name_const);
            self.emit_u8(0);
        }
    }

    fn index(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "Expect ']' after index.");
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetItem);
        } else {
            self.emit_op(OpCode::GetItem);
            self.emit_u8(0);
        }
    }

    fn lambda(&mut self) {
        self.function_body(FunctionKind::Lambda, None);
    }

    fn super_(&mut self) {
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name_const = self.identifier_constant(self.previous.lexeme);
        let scope_idx = self.scopes.len() - 1;
        self.named_variable_get("this", scope_idx);
        if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable_get("super", scope_idx);
            self.emit_op(OpCode::Invoke);
            self.emit_u8(name_const);
            self.emit_u8(argc);
        } else {
            self.named_variable_get("super", scope_idx);
            self.emit_op(OpCode::GetProperty);
            self.emit_u8(name_const);
            self.emit_u8(1);
        }
    }

    fn named_variable_get(&mut self, name: &'src str, scope_idx: usize) {
        if let Some(slot) = self.resolve_local(scope_idx, name) {
            self.emit_op(OpCode::GetLocal);
            self.emit_u8(slot);
        } else if let Some(slot) = self.resolve_upvalue(scope_idx, name) {
            self.emit_op(OpCode::GetUpvalue);
            self.emit_u8(slot);
        } else {
            let c = self.identifier_constant(name);
            self.emit_op(OpCode::GetGlobal);
            self.emit_u8(c);
        }
    }

    // -- statements --------------------------------------------------------

    fn declaration(&mut self) {
        if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Import) {
            self.import_declaration();
        } else if self.matches(TokenKind::Export) {
            self.export_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        let name = self.previous.lexeme.to_string();
        self.function_body(FunctionKind::Function, Some(name));
        self.define_variable(global);
    }

    fn function_body(&mut self, kind: FunctionKind, name: Option<String>) {
        self.scopes.push(FunctionScope::new(kind, name));
        self.begin_scope();

        let is_lambda_shorthand = kind == FunctionKind::Lambda;
        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let scope = self.scope_mut();
                if scope.arity as usize >= MAX_PARAMS {
                    self.error("Too many parameters.");
                }
                self.scope_mut().arity += 1;
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");

        if is_lambda_shorthand && self.matches(TokenKind::Arrow) {
            self.expression();
            self.emit_op(OpCode::Return);
        } else {
            self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
            self.block();
        }

        let (function, upvalues) = self.end_function();
        self.emit_closure(function, &upvalues);
    }

    fn emit_closure(&mut self, function: NonNull<ObjFunction>, upvalues: &[UpvalueSlot]) {
        if self.chunk_mut().constants.len() >= 256 {
            self.error("Too many constants in one chunk.");
            return;
        }
        let idx = self.chunk_mut().add_constant(Value::Obj(
            NonNull::new(
                simpl_core::object::GcObject::<FunctionData>::as_header_ptr(function.as_ptr()),
            )
            .unwrap(),
        ));
        self.emit_op(OpCode::Closure);
        self.emit_u8(idx);
        for up in upvalues {
            self.emit_u8(up.is_local as u8);
            self.emit_u8(up.index);
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::Throw) {
            self.throw_statement();
        } else if self.matches(TokenKind::Try) {
            self.try_statement();
        } else if self.matches(TokenKind::Switch) {
            self.switch_statement();
        } else if self.matches(TokenKind::Break) {
            self.break_statement();
        } else if self.matches(TokenKind::Continue) {
            self.continue_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn push_loop_guard(&mut self) -> usize {
        self.emit_op(OpCode::LoopGuard);
        let operand = self.chunk_mut().code.len();
        self.emit_u16(0xffff);
        self.emit_u16(0xffff);
        operand
    }

    fn patch_loop_guard(&mut self, operand: usize, start_ip: usize, out_ip: usize) {
        let start_delta = start_ip as i64 - (operand as i64 + 4);
        let out_delta = out_ip as i64 - (operand as i64 + 4);
        self.chunk_mut().patch_u16(operand, start_delta as u16);
        self.chunk_mut().patch_u16(operand + 2, out_delta as u16);
    }

    fn while_statement(&mut self) {
        if self.scope_mut().block_stack.len() >= MAX_BLOCK_STACK {
            self.error("Too many nested loops/try-catch/switch blocks.");
        }
        let guard_operand = self.push_loop_guard();
        let loop_start = self.chunk_mut().code.len();
        self.scope_mut().block_stack.push(BlockCtx::Loop(LoopCtx {
            start_ip: loop_start,
            guard_operand,
        }));

        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        let out_ip = self.chunk_mut().code.len();
        self.emit_op(OpCode::LoopGuardEnd);

        let ctx = self.scope_mut().block_stack.pop().unwrap();
        if let BlockCtx::Loop(l) = ctx {
            self.patch_loop_guard(l.guard_operand, l.start_ip, out_ip);
        }
    }

    /// Only the classical C-style `for (init; cond; incr) body` shape is
    /// desugared through `while`'s primitives; `for range(...)` and
    /// `for NAME of EXPR` compile through their own dedicated opcodes
    /// (spec.md §4.2 "Sugared for", §4.4 "for-of/for range runtime").
    fn for_statement(&mut self) {
        self.begin_scope();
        if self.check(TokenKind::Identifier) && self.peek_is_of_or_range() {
            self.for_of_or_range_statement();
            self.end_scope();
            return;
        }

        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.matches(TokenKind::Semicolon) {
            // no initializer
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        if self.scope_mut().block_stack.len() >= MAX_BLOCK_STACK {
            self.error("Too many nested loops/try-catch/switch blocks.");
        }
        let guard_operand = self.push_loop_guard();
        let mut loop_start = self.chunk_mut().code.len();
        self.scope_mut().block_stack.push(BlockCtx::Loop(LoopCtx {
            start_ip: loop_start,
            guard_operand,
        }));

        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.check(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.chunk_mut().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
            if let Some(BlockCtx::Loop(l)) = self.scope_mut().block_stack.last_mut() {
                l.start_ip = loop_start;
            }
        } else {
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(jump) = exit_jump {
            self.patch_jump(jump);
            self.emit_op(OpCode::Pop);
        }
        let out_ip = self.chunk_mut().code.len();
        self.emit_op(OpCode::LoopGuardEnd);

        let ctx = self.scope_mut().block_stack.pop().unwrap();
        if let BlockCtx::Loop(l) = ctx {
            self.patch_loop_guard(l.guard_operand, l.start_ip, out_ip);
        }
        self.end_scope();
    }

    /// Lookahead without consuming: true if the identifier just ahead of the
    /// current token is immediately followed by `of` or this is a
    /// `for range(` form. We approximate by checking the raw lexeme of the
    /// current token against the literal keyword `range`.
    fn peek_is_of_or_range(&self) -> bool {
        self.current.lexeme == "range"
    }

    fn for_of_or_range_statement(&mut self) {
        if self.current.lexeme == "range" {
            self.advance();
            self.consume(TokenKind::LeftParen, "Expect '(' after 'range'.");
            self.expression();
            let mut has_end = false;
            let mut has_step = false;
            if self.matches(TokenKind::Comma) {
                has_end = true;
                self.expression();
                if self.matches(TokenKind::Comma) {
                    has_step = true;
                    self.expression();
                }
            }
            if !has_end {
                self.emit_op(OpCode::Nil);
            }
            if !has_step {
                self.emit_op(OpCode::Nil);
            }
            self.consume(TokenKind::RightParen, "Expect ')' after range arguments.");
            self.declare_synthetic_local("@start");
            self.declare_synthetic_local("@end");
            self.declare_synthetic_local("@step");
            self.emit_op(OpCode::RangedLoopSetup);

            if self.scope_mut().block_stack.len() >= MAX_BLOCK_STACK {
                self.error("Too many nested loops/try-catch/switch blocks.");
            }
            let guard_operand = self.push_loop_guard();
            let loop_start = self.chunk_mut().code.len();
            self.scope_mut().block_stack.push(BlockCtx::Loop(LoopCtx {
                start_ip: loop_start,
                guard_operand,
            }));
            self.emit_op(OpCode::RangedLoop);
            self.consume(TokenKind::LeftBrace, "Expect '{' before loop body.");
            self.begin_scope();
            self.block();
            self.end_scope();
            self.emit_loop(loop_start);
            let out_ip = self.chunk_mut().code.len();
            self.emit_op(OpCode::LoopGuardEnd);
            let ctx = self.scope_mut().block_stack.pop().unwrap();
            if let BlockCtx::Loop(l) = ctx {
                self.patch_loop_guard(l.guard_operand, l.start_ip, out_ip);
            }
            return;
        }

        self.consume(TokenKind::Identifier, "Expect loop variable name.");
        let item_name = self.previous.lexeme;
        self.consume(TokenKind::Of, "Expect 'of' in for-of loop.");
        self.expression();
        self.consume(TokenKind::LeftBrace, "Expect '{' before loop body.");

        self.declare_synthetic_local("@index");
        self.emit_constant(Value::Number(-1.0));
        self.mark_initialized();
        self.declare_synthetic_local("@iterable");
        self.mark_initialized();
        self.declare_variable(item_name);
        self.emit_op(OpCode::Nil);
        self.mark_initialized();

        if self.scope_mut().block_stack.len() >= MAX_BLOCK_STACK {
            self.error("Too many nested loops/try-catch/switch blocks.");
        }
        let guard_operand = self.push_loop_guard();
        let loop_start = self.chunk_mut().code.len();
        self.scope_mut().block_stack.push(BlockCtx::Loop(LoopCtx {
            start_ip: loop_start,
            guard_operand,
        }));
        self.emit_op(OpCode::NamedLoop);

        self.begin_scope();
        self.block();
        self.end_scope();
        self.emit_loop(loop_start);
        let out_ip = self.chunk_mut().code.len();
        self.emit_op(OpCode::LoopGuardEnd);
        let ctx = self.scope_mut().block_stack.pop().unwrap();
        if let BlockCtx::Loop(l) = ctx {
            self.patch_loop_guard(l.guard_operand, l.start_ip, out_ip);
        }
    }

    fn declare_synthetic_local(&mut self, name: &'static str) {
        let scope = self.scope_mut();
        if scope.locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        let depth = scope.scope_depth;
        scope.locals.push(Local {
            name,
            depth: Some(depth),
            is_captured: false,
        });
    }

    fn innermost_loop(&mut self) -> Option<&mut LoopCtx> {
        self.scopes
            .last_mut()
            .unwrap()
            .block_stack
            .iter_mut()
            .rev()
            .find_map(|b| match b {
                BlockCtx::Loop(l) => Some(l),
                _ => None,
            })
    }

    fn break_statement(&mut self) {
        if self.innermost_loop().is_none() {
            self.error("Cannot use 'break' outside of a loop.");
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
        self.emit_op(OpCode::LoopBreak);
    }

    fn continue_statement(&mut self) {
        if self.innermost_loop().is_none() {
            self.error("Cannot use 'continue' outside of a loop.");
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
        self.emit_op(OpCode::LoopContinue);
    }

    fn return_statement(&mut self) {
        if matches!(self.scopes.last().unwrap().kind, FunctionKind::Script) {
            self.error("Cannot return from top-level code.");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_default_return();
        } else {
            if matches!(
                self.scopes.last().unwrap().kind,
                FunctionKind::Constructor
            ) {
                self.error("Cannot return a value from a constructor.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn throw_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after thrown value.");
        self.emit_op(OpCode::Throw);
    }

    fn try_statement(&mut self) {
        if self.scope_mut().block_stack.len() >= MAX_BLOCK_STACK {
            self.error("Too many nested loops/try-catch/switch blocks.");
        }
        self.emit_op(OpCode::TryCatch);
        let operand = self.chunk_mut().code.len();
        self.emit_u16(0xffff); // catch offset
        self.emit_u16(0xffff); // out offset
        self.emit_u8(0); // hasCatchParam, patched below

        self.scope_mut().block_stack.push(BlockCtx::TryCatch);
        self.consume(TokenKind::LeftBrace, "Expect '{' after 'try'.");
        self.begin_scope();
        self.block();
        self.end_scope();
        self.scope_mut().block_stack.pop();

        let try_end_jump = self.emit_jump(OpCode::Jump);
        self.emit_op(OpCode::TryCatchTryEnd);
        let catch_ip = self.chunk_mut().code.len();

        self.consume(TokenKind::Catch, "Expect 'catch' after try block.");
        self.consume(TokenKind::LeftParen, "Expect '(' after 'catch'.");
        self.begin_scope();
        let mut has_param = 0u8;
        if !self.check(TokenKind::RightParen) {
            self.consume(TokenKind::Identifier, "Expect catch parameter name.");
            let name = self.previous.lexeme;
            self.declare_variable(name);
            self.mark_initialized();
            has_param = 1;
        }
        self.consume(TokenKind::RightParen, "Expect ')' after catch parameter.");
        self.consume(TokenKind::LeftBrace, "Expect '{' after catch clause.");
        self.block();
        self.end_scope();

        let out_ip = self.chunk_mut().code.len();
        self.patch_jump(try_end_jump);

        let catch_delta = catch_ip as i64 - (operand as i64 + 5);
        let out_delta = out_ip as i64 - (operand as i64 + 5);
        self.chunk_mut().patch_u16(operand, catch_delta as u16);
        self.chunk_mut().patch_u16(operand + 2, out_delta as u16);
        self.chunk_mut().code[operand + 4] = has_param;
    }

    /// Open question (spec.md §9): the original's switch back-edge is
    /// computed against a transient default marker. We resolve it as
    /// conventional switch semantics: at most one matching `case` (or the
    /// `default`, if no case matched) runs, then control falls straight to
    /// `SWITCH_END` — no fallthrough between cases.
    fn switch_statement(&mut self) {
        if self.scope_mut().block_stack.len() >= MAX_BLOCK_STACK {
            self.error("Too many nested loops/try-catch/switch blocks.");
        }
        self.consume(TokenKind::LeftParen, "Expect '(' after 'switch'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after switch value.");
        self.emit_op(OpCode::Switch);
        self.consume(TokenKind::LeftBrace, "Expect '{' before switch body.");

        self.scope_mut()
            .block_stack
            .push(BlockCtx::Switch(SwitchCtx { has_default: false }));

        let mut end_jumps = Vec::new();
        while self.matches(TokenKind::Case) {
            self.expression();
            self.consume(TokenKind::Colon, "Expect ':' after case value.");
            self.emit_op(OpCode::SwitchCase);
            let case_jump = self.emit_jump(OpCode::JumpIfFalse);
            self.emit_op(OpCode::Pop);
            while !self.check(TokenKind::Case)
                && !self.check(TokenKind::Default)
                && !self.check(TokenKind::RightBrace)
            {
                self.statement();
            }
            end_jumps.push(self.emit_jump(OpCode::Jump));
            self.patch_jump(case_jump);
            self.emit_op(OpCode::Pop);
        }

        if self.matches(TokenKind::Default) {
            if let Some(BlockCtx::Switch(ctx)) = self.scope_mut().block_stack.last_mut() {
                if ctx.has_default {
                    self.error("Only one 'default' case allowed in switch.");
                }
                ctx.has_default = true;
            }
            self.emit_op(OpCode::SwitchDefault);
            self.consume(TokenKind::Colon, "Expect ':' after 'default'.");
            while !self.check(TokenKind::RightBrace) {
                self.statement();
            }
        }

        for jump in end_jumps {
            self.patch_jump(jump);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after switch body.");
        self.emit_op(OpCode::SwitchEnd);
        // SWITCH_END's offset operand is patched by the VM's own internal
        // bookkeeping at emission time in the original; we emit 0 since our
        // dispatch pops the switch-value slot unconditionally on reaching it.
        self.emit_u16(0);
        self.scope_mut().block_stack.pop();
    }

    // -- classes ------------------------------------------------------------

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme;
        let name_const = self.identifier_constant(class_name);
        self.declare_variable(class_name);
        self.emit_op(OpCode::Class);
        self.emit_u8(name_const);
        self.define_variable(name_const);

        let has_superclass = self.matches(TokenKind::Extends);
        if has_superclass {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let super_name = self.previous.lexeme;
            if super_name == class_name {
                self.error("A class cannot inherit from itself.");
            }
            self.named_variable(super_name, false);

            self.begin_scope();
            self.declare_synthetic_local("super");
            self.mark_initialized();

            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method(class_name);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop); // drop the class value pushed for METHOD targeting

        if has_superclass {
            self.end_scope();
        }
    }

    fn method(&mut self, class_name: &str) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let method_name = self.previous.lexeme;
        let name_const = self.identifier_constant(method_name);
        let kind = if method_name == class_name {
            FunctionKind::Constructor
        } else {
            FunctionKind::Method
        };
        self.function_body_for_method(kind, method_name.to_string());
        self.emit_op(OpCode::Method);
        self.emit_u8(name_const);
    }

    fn function_body_for_method(&mut self, kind: FunctionKind, name: String) {
        self.function_body(kind, Some(name));
    }

    // -- modules --------------------------------------------------------

    /// `import [name from] "path";` — the module at `path` is compiled
    /// eagerly, right here, so its resulting `Module` object can be baked
    /// into the constant pool for `OP_IMPORT`. Whether its *body* has run is
    /// a separate, runtime-only concern (`Module.evaluated`, spec.md §4.4):
    /// the compiler only ever compiles a given path once, caching the
    /// result in `module_graph` so repeated or mutually-referencing imports
    /// reuse the same `Module` object rather than recompiling.
    fn import_declaration(&mut self) {
        let binding_global = if !self.check(TokenKind::String) {
            let global = self.parse_variable("Expect import identifier name.");
            self.consume(TokenKind::From, "Expect 'from' after import identifier.");
            Some(global)
        } else {
            None
        };

        self.consume(TokenKind::String, "Expect import path.");
        let raw = self.previous.lexeme;
        let path_text = raw[1..raw.len() - 1].to_string();
        let resolved = self.resolve_import_path(&path_text);

        let cached = match self.module_graph.lookup(&resolved) {
            Some(node) if node.state == ModuleState::Compiling => {
                self.error("Cyclic dependency detected in import graph.");
                return;
            }
            Some(node) => node.module,
            None => None,
        };

        let module = match cached {
            Some(module) => module,
            None => match self.compile_imported_module(&resolved) {
                Some(module) => module,
                None => {
                    self.error("Cannot compile module.");
                    return;
                }
            },
        };

        if self.chunk_mut().constants.len() >= 256 {
            self.error("Too many constants in one chunk.");
            return;
        }
        let idx = self.chunk_mut().add_constant(Value::Obj(
            NonNull::new(ObjModule::as_header_ptr(module.as_ptr())).unwrap(),
        ));
        self.emit_op(OpCode::Import);
        self.emit_u8(idx);

        if let Some(global) = binding_global {
            self.define_variable(global);
        } else {
            self.emit_op(OpCode::Pop);
        }

        self.consume(TokenKind::Semicolon, "Expect ';' after import statement.");
    }

    /// Reads `resolved` from disk and recursively compiles it as a module
    /// body, recording cycle-detection state in `module_graph` along the
    /// way. Returns `None` (after recording any compile errors onto this
    /// compiler's own error list) if the file can't be read or fails to
    /// compile.
    fn compile_imported_module(&mut self, resolved: &Path) -> Option<NonNull<ObjModule>> {
        let source = match fs::read_to_string(resolved) {
            Ok(source) => source,
            Err(err) => {
                self.error(&format!("Cannot read module '{}': {err}", resolved.display()));
                return None;
            }
        };

        self.module_graph.begin_compiling(resolved.to_path_buf());
        let module_dir = resolved
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.current_dir.clone());

        let outcome = Compiler::compile_inner(
            &source,
            &mut *self.heap,
            &mut *self.module_graph,
            FunctionKind::Module,
            self.entry_dir.clone(),
            module_dir,
        );

        match outcome {
            Ok(outcome) => {
                let module = self.heap.alloc_module(ModuleData {
                    function: outcome.function,
                    evaluated: false,
                    exports: Table::new(),
                    path: resolved.to_path_buf(),
                });
                self.module_graph.finish_compiling(&resolved.to_path_buf(), module);
                Some(module)
            }
            Err(mut errors) => {
                self.errors.0.append(&mut errors.0);
                None
            }
        }
    }

    /// Resolves an import path against the correct base directory
    /// (spec.md §6, "Source files"): a relative-looking path is resolved
    /// against the directory of the file that wrote the `import`, while an
    /// absolute-looking path is resolved against the entry file's
    /// directory (its leading separator is treated as "rooted at the
    /// program", not the filesystem root).
    fn resolve_import_path(&self, raw: &str) -> PathBuf {
        let p = Path::new(raw);
        if p.is_absolute() {
            self.entry_dir.join(raw.trim_start_matches(['/', '\\']))
        } else {
            self.current_dir.join(p)
        }
    }

    fn export_declaration(&mut self) {
        if !matches!(
            self.scopes.last().unwrap().kind,
            FunctionKind::Module
        ) {
            self.error("'export' is only valid at module top level.");
        }
        self.consume(TokenKind::Identifier, "Expect exported name.");
        let name = self.previous.lexeme;
        let name_const = self.identifier_constant(name);
        self.named_variable(name, false);
        self.emit_op(OpCode::Export);
        self.emit_u8(name_const);
    }
}
