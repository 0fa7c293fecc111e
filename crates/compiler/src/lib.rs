//! Lexer and single-pass Pratt-parser bytecode compiler for Simpl source
//! text (spec.md §4.1–§4.2).
//!
//! The compiler depends only on `simpl-core`'s object model and heap — it
//! allocates `Function`/`Module` objects as it goes rather than building an
//! intermediate AST. The runtime crate drives this compiler directly, both
//! for top-level script/REPL input and (recursively, via `import`) for
//! module bodies encountered mid-compilation.

pub mod compiler;
pub mod error;
pub mod lexer;
pub mod module_graph;
pub mod token;

pub use compiler::{CompileOutcome, Compiler};
pub use error::{CompileError, CompileErrors};
pub use module_graph::{ModuleGraph, ModuleNode, ModuleState};
