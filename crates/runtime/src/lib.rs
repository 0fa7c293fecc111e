//! Virtual machine, garbage collector, thread scheduler and core classes
//! for the Simpl language (spec.md §4–§7).
//!
//! `simpl-core` supplies the value/object model and the collector's
//! allocation primitives; `simpl-compiler` turns source text into
//! `Function`/`Module` objects. This crate ties them together: `vm`
//! drives the bytecode dispatch loop and the cooperative GC safe-point
//! protocol, `natives` installs the built-in classes every script starts
//! with, `scheduler` and `sync` back `System.Thread`/locks/semaphores, and
//! `thread` holds the per-OS-thread interpreter state none of that needs
//! to share.

pub mod config;
pub mod error;
pub mod natives;
pub mod scheduler;
pub mod sync;
pub mod thread;
pub mod vm;

pub use config::Config;
pub use error::RuntimeFault;
pub use natives::{BuiltinClasses, NativeCtx};
pub use thread::Thread;
pub use vm::{InterpretError, Vm};
