//! Compile-time diagnostics.
//!
//! Modeled on the teacher's `CodeGenError` (manual `Display`/`Error`/`From`
//! impls, no `thiserror`): a flat enum naming every failure spec.md §7 lists
//! under "Compile errors", each carrying the source line it was raised at.

use std::fmt;

#[derive(Debug, Clone)]
pub struct CompileError {
    pub line: u32,
    pub message: String,
}

impl CompileError {
    pub fn new(line: u32, message: impl Into<String>) -> Self {
        CompileError {
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error: {}", self.line, self.message)
    }
}

impl std::error::Error for CompileError {}

/// A compilation pass reports every error it can find in one pass (panic-mode
/// synchronization, spec.md §7), rather than aborting on the first one.
#[derive(Debug, Default)]
pub struct CompileErrors(pub Vec<CompileError>);

impl CompileErrors {
    pub fn push(&mut self, err: CompileError) {
        self.0.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileErrors {}

impl From<CompileError> for CompileErrors {
    fn from(err: CompileError) -> Self {
        CompileErrors(vec![err])
    }
}
