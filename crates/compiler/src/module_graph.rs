//! Compile-time module graph: cycle detection and single-compilation
//! caching for `import` (spec.md §4.2, supplemented by
//! `examples/original_source/src/modules.h`'s COMPILING/COMPILED states).

use std::collections::HashMap;
use std::path::PathBuf;
use std::ptr::NonNull;

use simpl_core::object::ObjModule;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ModuleState {
    Compiling,
    Compiled,
}

pub struct ModuleNode {
    pub state: ModuleState,
    /// Populated once the module's function has been built; used to reuse
    /// the same `Module` object across repeated imports of the same path.
    pub module: Option<NonNull<ObjModule>>,
}

/// Keyed by canonicalized absolute source path, per spec.md §4.2.
#[derive(Default)]
pub struct ModuleGraph {
    nodes: HashMap<PathBuf, ModuleNode>,
}

impl ModuleGraph {
    pub fn new() -> Self {
        ModuleGraph::default()
    }

    pub fn lookup(&self, path: &PathBuf) -> Option<&ModuleNode> {
        self.nodes.get(path)
    }

    pub fn begin_compiling(&mut self, path: PathBuf) {
        self.nodes.insert(
            path,
            ModuleNode {
                state: ModuleState::Compiling,
                module: None,
            },
        );
    }

    pub fn finish_compiling(&mut self, path: &PathBuf, module: NonNull<ObjModule>) {
        if let Some(node) = self.nodes.get_mut(path) {
            node.state = ModuleState::Compiled;
            node.module = Some(module);
        }
    }
}
