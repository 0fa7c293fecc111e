//! `simpl` command-line entry point (spec.md §6 "External interfaces").
//!
//! `progname [path]`: no arguments starts an interactive, persistent-state
//! REPL; one argument reads and interprets a file, exiting 65 on a compile
//! error or 70 on a runtime error; more than one argument is a usage error.
//! Argument parsing follows the teacher's `clap::Parser` derive idiom
//! (`examples/navicore-cem3/crates/repl/src/main.rs`); the run/exit-code
//! shape is the same `run(...) -> Result<(), String>` plus
//! `eprintln!`-then-`exit` pattern the teacher's binaries use, adapted to
//! this crate's line-based `rustyline` loop rather than a TUI.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

use simpl_runtime::{Config, InterpretError, Vm};

#[derive(Parser)]
#[command(name = "simpl", version, about = "Run or interactively explore Simpl scripts")]
struct Args {
    /// Script to interpret. Omit to start an interactive REPL.
    path: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    match args.path {
        None => {
            run_repl();
            ExitCode::SUCCESS
        }
        Some(path) => run_file(&path),
    }
}

fn run_file(path: &std::path::Path) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Error: can't read {}: {e}", path.display());
            return ExitCode::from(74);
        }
    };

    let entry_dir = path.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    let vm = Vm::new_shared_with_entry_dir(Config::from_env(), entry_dir);

    match vm.interpret_file(&source) {
        Ok(_) => ExitCode::SUCCESS,
        Err(InterpretError::Compile(errors)) => {
            eprintln!("{errors}");
            ExitCode::from(65)
        }
        Err(InterpretError::Runtime(fault)) => {
            eprintln!("{fault}");
            ExitCode::from(70)
        }
    }
}

/// Reads one line at a time until EOF, interpreting each in the same
/// persistent thread and namespace (spec.md §6).
fn run_repl() {
    let vm = Vm::new_shared(Config::from_env());
    let mut thread = vm.new_root_thread();
    let namespace = {
        let mut table = simpl_core::Table::new();
        table.add_all_from(&vm.base_namespace);
        std::rc::Rc::new(std::cell::RefCell::new(table))
    };

    let mut editor = DefaultEditor::new().expect("failed to initialize line editor");
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                editor.add_history_entry(line.as_str()).ok();
                match vm.interpret_line(&line, &mut thread, namespace.clone()) {
                    Ok(value) => {
                        if !matches!(value, simpl_core::Value::Nil) {
                            println!("{}", vm.stringify(value));
                        }
                    }
                    Err(InterpretError::Compile(errors)) => eprintln!("{errors}"),
                    Err(InterpretError::Runtime(fault)) => eprintln!("{fault}"),
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Error: {e}");
                break;
            }
        }
    }
}
