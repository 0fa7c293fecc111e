//! Runtime-wide tunables, constructible from CLI flags or environment
//! variables (SPEC_FULL.md §2 "Config"), in the spirit of the teacher's
//! `CompilerConfig`.

use std::env;

/// Factor the GC threshold grows by after each collection (spec.md §4.5
/// "Triggering": `GCThreshold = bytesAllocated * 2`).
const DEFAULT_GC_GROWTH_FACTOR: usize = 2;

/// spec.md §4.4 bound: at most 64 simultaneous call frames per thread.
pub const DEFAULT_MAX_FRAMES: usize = 64;

/// spec.md §4.4 bound: value stack is 64 * 256 slots per thread.
pub const DEFAULT_MAX_STACK: usize = 64 * 256;

/// spec.md §9 open question, resolved per §8 boundaries: loop/try-catch/
/// switch nesting share one bound so compile-time and run-time stack sizing
/// agree (see DESIGN.md).
pub const DEFAULT_MAX_BLOCK_NESTING: usize = 8;

#[derive(Debug, Clone)]
pub struct Config {
    pub gc_growth_factor: usize,
    pub max_frames: usize,
    pub max_stack: usize,
    pub max_block_nesting: usize,
    /// `SIMPL_DEBUG`-style verbose diagnostics, gating `[DEBUG]`-prefixed
    /// prints from the GC and scheduler.
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            gc_growth_factor: DEFAULT_GC_GROWTH_FACTOR,
            max_frames: DEFAULT_MAX_FRAMES,
            max_stack: DEFAULT_MAX_STACK,
            max_block_nesting: DEFAULT_MAX_BLOCK_NESTING,
            verbose: false,
        }
    }
}

impl Config {
    /// Start from defaults, then apply `SIMPL_*` environment overrides. CLI
    /// flags (parsed by `simpl-repl`) are applied on top of this by the
    /// caller.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Ok(v) = env::var("SIMPL_DEBUG") {
            config.verbose = v != "0" && !v.is_empty();
        }
        if let Ok(v) = env::var("SIMPL_MAX_FRAMES") {
            if let Ok(n) = v.parse() {
                config.max_frames = n;
            }
        }
        config
    }

    pub fn debug_log(&self, message: impl AsRef<str>) {
        if self.verbose {
            eprintln!("[DEBUG] {}", message.as_ref());
        }
    }
}
