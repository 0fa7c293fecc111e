//! Value representation, bytecode chunks, hash table and heap/GC primitives
//! shared by the rest of the Simpl toolchain.
//!
//! This crate knows nothing about lexing, parsing, or instruction dispatch;
//! it defines the shapes those layers build on (`Value`, `Chunk`, `Table`,
//! the `Obj*` heap kinds) and the allocator/collector that manages them.

pub mod chunk;
pub mod heap;
pub mod object;
pub mod table;
pub mod value;

pub use chunk::{Chunk, OpCode};
pub use heap::{Heap, Tracer};
pub use table::Table;
pub use value::Value;
