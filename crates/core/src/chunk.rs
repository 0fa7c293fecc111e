//! Bytecode chunks: the immutable instruction buffer of a compiled function.

use crate::value::Value;

/// One-byte instruction opcodes, per the bytecode design in spec.md §4.3.
///
/// Every variant here is exactly one byte on the wire; operands, where
/// present, follow as raw bytes in the chunk's `code` vector and are decoded
/// by the VM loop, not stored in this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Constant,
    True,
    False,
    Nil,
    StringInterpolation,
    Array,
    Object,

    GetLocal,
    SetLocal,
    GetUpvalue,
    SetUpvalue,
    GetGlobal,
    DefineGlobal,
    SetGlobal,
    CloseUpvalue,

    GetProperty,
    SetProperty,
    GetItem,
    SetItem,
    Invoke,

    Add,
    Subtract,
    Multiply,
    Divide,
    Negate,
    Equal,
    Greater,
    Less,
    Not,

    Jump,
    JumpIfFalse,
    Loop,
    LoopGuard,
    LoopGuardEnd,
    LoopBreak,
    LoopContinue,
    NamedLoop,
    RangedLoopSetup,
    RangedLoop,
    Switch,
    SwitchCase,
    SwitchDefault,
    SwitchBreak,
    SwitchEnd,

    Call,
    Closure,
    Class,
    Inherit,
    Super,
    Method,

    TryCatch,
    TryCatchTryEnd,
    Throw,

    Import,
    Export,

    Pop,
    /// Legacy `print` statement: pop the top of stack, write its stringified
    /// form followed by a newline to stdout.
    Print,
    Return,
}

impl OpCode {
    /// Decode a raw byte emitted by the compiler back into an opcode.
    ///
    /// # Panics
    /// Panics on a byte that is not a valid opcode; a well-formed chunk never
    /// produces one, so this indicates a compiler or disassembler bug rather
    /// than a condition user code can trigger.
    pub fn from_u8(byte: u8) -> OpCode {
        match byte {
            0 => OpCode::Constant,
            1 => OpCode::True,
            2 => OpCode::False,
            3 => OpCode::Nil,
            4 => OpCode::StringInterpolation,
            5 => OpCode::Array,
            6 => OpCode::Object,
            7 => OpCode::GetLocal,
            8 => OpCode::SetLocal,
            9 => OpCode::GetUpvalue,
            10 => OpCode::SetUpvalue,
            11 => OpCode::GetGlobal,
            12 => OpCode::DefineGlobal,
            13 => OpCode::SetGlobal,
            14 => OpCode::CloseUpvalue,
            15 => OpCode::GetProperty,
            16 => OpCode::SetProperty,
            17 => OpCode::GetItem,
            18 => OpCode::SetItem,
            19 => OpCode::Invoke,
            20 => OpCode::Add,
            21 => OpCode::Subtract,
            22 => OpCode::Multiply,
            23 => OpCode::Divide,
            24 => OpCode::Negate,
            25 => OpCode::Equal,
            26 => OpCode::Greater,
            27 => OpCode::Less,
            28 => OpCode::Not,
            29 => OpCode::Jump,
            30 => OpCode::JumpIfFalse,
            31 => OpCode::Loop,
            32 => OpCode::LoopGuard,
            33 => OpCode::LoopGuardEnd,
            34 => OpCode::LoopBreak,
            35 => OpCode::LoopContinue,
            36 => OpCode::NamedLoop,
            37 => OpCode::RangedLoopSetup,
            38 => OpCode::RangedLoop,
            39 => OpCode::Switch,
            40 => OpCode::SwitchCase,
            41 => OpCode::SwitchDefault,
            42 => OpCode::SwitchBreak,
            43 => OpCode::SwitchEnd,
            44 => OpCode::Call,
            45 => OpCode::Closure,
            46 => OpCode::Class,
            47 => OpCode::Inherit,
            48 => OpCode::Super,
            49 => OpCode::Method,
            50 => OpCode::TryCatch,
            51 => OpCode::TryCatchTryEnd,
            52 => OpCode::Throw,
            53 => OpCode::Import,
            54 => OpCode::Export,
            55 => OpCode::Pop,
            56 => OpCode::Print,
            57 => OpCode::Return,
            other => panic!("invalid opcode byte {other}"),
        }
    }
}

/// A compiled function's code, source lines and constant pool.
#[derive(Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    /// One entry per byte in `code`, for error reporting (spec.md §4.1/§7).
    pub lines: Vec<u32>,
    pub constants: Vec<Value>,
}

impl Chunk {
    pub fn new() -> Self {
        Chunk::default()
    }

    pub fn write_u8(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    pub fn write_op(&mut self, op: OpCode, line: u32) {
        self.write_u8(op as u8, line);
    }

    pub fn write_u16(&mut self, value: u16, line: u32) {
        let [hi, lo] = value.to_be_bytes();
        self.write_u8(hi, line);
        self.write_u8(lo, line);
    }

    /// Patch a big-endian 16-bit placeholder previously written at `offset`.
    pub fn patch_u16(&mut self, offset: usize, value: u16) {
        let [hi, lo] = value.to_be_bytes();
        self.code[offset] = hi;
        self.code[offset + 1] = lo;
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.code[offset], self.code[offset + 1]])
    }

    /// Add a constant to the pool, returning its index.
    ///
    /// # Panics
    /// Panics if the pool already holds 256 entries; callers must check
    /// `constants.len() < 256` and raise a compile error themselves before
    /// calling this (spec.md §8 "Maximum 256 constants per function").
    pub fn add_constant(&mut self, value: Value) -> u8 {
        assert!(self.constants.len() < 256, "too many constants in one chunk");
        self.constants.push(value);
        (self.constants.len() - 1) as u8
    }

    pub fn line_at(&self, offset: usize) -> u32 {
        self.lines.get(offset).copied().unwrap_or(0)
    }
}
