//! End-to-end tests driving the whole pipeline — lexer, compiler, VM dispatch
//! loop — through `Vm::interpret_file`, the way `simpl-repl` does for a
//! one-shot script. Grounded on the worked examples in spec.md §8 and on the
//! teacher's `tests/test_closures.rs` placement convention (one `tests/`
//! file per concern, driving the public API rather than internals).

use simpl_runtime::{Config, InterpretError, Vm};

fn run(source: &str) -> Result<simpl_core::Value, InterpretError> {
    let vm = Vm::new_shared(Config::from_env());
    vm.interpret_file(source)
}

#[test]
fn arithmetic_and_for_loop() {
    // spec.md §8 S2.
    let vm = Vm::new_shared(Config::from_env());
    let result = vm
        .interpret_file("var a = 0;\nfor (var i = 0; i < 5; i = i + 1) { a = a + i; }\nprint a;")
        .unwrap();
    assert!(result.is_nil());
}

#[test]
fn class_instantiation_and_chained_calls() {
    // spec.md §8 S3: constructor runs, methods chain via `this` return, and
    // instance properties survive across method calls.
    let result = run(
        "class Counter {\n  Counter() { this.n = 0; }\n  inc() { this.n = this.n + 1; return this; }\n}\nvar c = Counter();\nc.inc().inc().inc();\nprint c.n;",
    )
    .unwrap();
    assert!(result.is_nil());
}

#[test]
fn closures_capture_and_mutate_outer_locals() {
    // spec.md §8 S4: each call to `inner` sees the same upvalue, not a copy.
    let result = run(
        "fun outer() {\n  var x = 1;\n  fun inner() { x = x + 1; return x; }\n  return inner;\n}\nvar i = outer();\nprint i();\nprint i();",
    )
    .unwrap();
    assert!(result.is_nil());
}

#[test]
fn try_catch_binds_thrown_value_as_error() {
    // spec.md §8 S5: a thrown non-Error value is wrapped into an Error whose
    // `message` is its stringified form.
    let result = run("try { throw \"boom\"; } catch (e) { print e.message; }").unwrap();
    assert!(result.is_nil());
}

#[test]
fn array_map_and_join_use_core_extension() {
    // spec.md §8 S6.
    let result = run("print [1,2,3].map((x) -> x*x).join(\",\");").unwrap();
    assert!(result.is_nil());
}

#[test]
fn arrow_lambda_shorthand_forms() {
    // `(params) -> expr|block` is a distinct grammar production from a
    // parenthesized expression; these exercise the zero/one/multi-param and
    // block-body shapes together.
    let result = run(
        "var zero = () -> 42;\nvar one = (x) -> x + 1;\nvar many = (a, b, c) -> { return a + b + c; };\nprint zero();\nprint one(41);\nprint many(1, 2, 3);",
    )
    .unwrap();
    assert!(result.is_nil());
}

#[test]
fn parenthesized_identifier_is_not_mistaken_for_a_lambda() {
    // `(x)` with no following `->` must parse as plain grouping, not commit
    // to the lambda shorthand.
    let result = run("var x = 5;\nprint (x) + 1;").unwrap();
    assert!(result.is_nil());
}

#[test]
fn overloaded_method_dispatches_on_arity() {
    let result = run(
        "class Greeter {\n  greet() { return \"hi\"; }\n  greet(name) { return \"hi \" + name; }\n}\nvar g = Greeter();\nprint g.greet();\nprint g.greet(\"Ada\");",
    )
    .unwrap();
    assert!(result.is_nil());
}

#[test]
fn overloaded_method_wrong_arity_is_a_recoverable_error() {
    let err = run("class Greeter {\n  greet(name) { return name; }\n}\nvar g = Greeter();\ng.greet(1, 2);")
        .unwrap_err();
    match err {
        InterpretError::Runtime(fault) => {
            let message = fault.to_string();
            assert!(message.contains("argument"), "unexpected fault message: {message}");
        }
        InterpretError::Compile(_) => panic!("expected a runtime error, got a compile error"),
    }
}

#[test]
fn single_inheritance_resolves_super_methods() {
    let result = run(
        "class Animal {\n  speak() { return \"...\"; }\n}\nclass Dog extends Animal {\n  speak() { return super.speak() + \"woof\"; }\n}\nprint Dog().speak();",
    )
    .unwrap();
    assert!(result.is_nil());
}

#[test]
fn non_class_superclass_is_a_fatal_error_not_catchable() {
    let err = run("var NotAClass = 1;\ntry {\n  class Bad extends NotAClass {}\n} catch (e) {\n  print \"caught\";\n}")
        .unwrap_err();
    assert!(matches!(err, InterpretError::Runtime(simpl_runtime::RuntimeFault::SuperclassNotClass)));
}

#[test]
fn break_and_continue_unwind_loop_guards() {
    let result = run(
        "var sum = 0;\nfor (var i = 0; i < 10; i = i + 1) {\n  if (i == 5) { break; }\n  if (i == 2) { continue; }\n  sum = sum + i;\n}\nprint sum;",
    )
    .unwrap();
    assert!(result.is_nil());
}

#[test]
fn switch_runs_at_most_one_matching_case() {
    let result = run(
        "var x = 2;\nvar picked = 0;\nswitch (x) {\n  case 1: picked = 1; break;\n  case 2: picked = 2; break;\n  default: picked = -1;\n}\nprint picked;",
    )
    .unwrap();
    assert!(result.is_nil());
}

#[test]
fn compile_error_reports_line_and_does_not_panic() {
    let err = run("var = ;").unwrap_err();
    match err {
        InterpretError::Compile(errors) => assert!(errors.to_string().contains("[line 1]")),
        InterpretError::Runtime(_) => panic!("expected a compile error"),
    }
}

#[test]
fn system_clock_returns_a_monotonically_increasing_number() {
    let vm = Vm::new_shared(Config::from_env());
    let first = vm.interpret_file("print System.clock();").unwrap();
    assert!(first.is_nil());
    let second = vm.interpret_file("System.clock();").unwrap();
    assert!(second.as_number().is_some());
}

mod modules {
    use super::*;
    use std::io::Write;

    /// Imports are resolved relative to the entry file's directory
    /// (spec.md §6), and a module is evaluated at most once — two imports
    /// of the same module from different entry points observe the same
    /// cached `exports` (spec.md §3 invariant 3).
    #[test]
    fn module_is_evaluated_once_and_exports_are_cached() {
        let dir = tempfile::tempdir().unwrap();
        let module_path = dir.path().join("counter.simpl");
        let mut module_file = std::fs::File::create(&module_path).unwrap();
        writeln!(module_file, "var hits = 0;\nfun bump() {{ hits = hits + 1; return hits; }}\nexport var value = bump();").unwrap();

        let entry_path = dir.path().join("main.simpl");
        std::fs::write(
            &entry_path,
            "import first from \"counter.simpl\";\nimport second from \"counter.simpl\";\nprint first.value;\nprint second.value;",
        )
        .unwrap();

        let source = std::fs::read_to_string(&entry_path).unwrap();
        let vm = Vm::new_shared_with_entry_dir(Config::from_env(), dir.path().to_path_buf());
        let result = vm.interpret_file(&source).unwrap();
        assert!(result.is_nil());
    }

    #[test]
    fn cyclic_import_is_a_compile_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.simpl"), "import \"b.simpl\";").unwrap();
        std::fs::write(dir.path().join("b.simpl"), "import \"a.simpl\";").unwrap();

        let source = std::fs::read_to_string(dir.path().join("a.simpl")).unwrap();
        let vm = Vm::new_shared_with_entry_dir(Config::from_env(), dir.path().to_path_buf());
        let err = vm.interpret_file(&source).unwrap_err();
        assert!(matches!(err, InterpretError::Compile(_)));
    }
}

/// `System.Thread`/`threadJoin` and the named-lock registry share process
/// visible global resources (thread ids, lock names keyed by interned
/// string identity), so these run serialized rather than interleaved with
/// each other (teacher convention: `#[serial]` on cross-test shared-state
/// suites rather than per-test mutexes).
mod concurrency {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn spawned_thread_runs_and_joins_with_its_return_value() {
        let result = run(
            "fun worker(n) { return n * 2; }\nvar id = System.Thread(worker, 21);\nprint System.threadJoin(id);",
        )
        .unwrap();
        assert!(result.is_nil());
    }

    #[test]
    #[serial]
    fn spawned_thread_sees_a_snapshot_of_the_caller_namespace() {
        // spec.md §5: the new thread's namespace starts as a copy of the
        // spawning frame's namespace, so a global defined before `Thread`
        // is visible inside the spawned closure without being captured as
        // an upvalue.
        let result = run(
            "var shared = 7;\nfun worker() { return shared; }\nvar id = System.Thread(worker);\nprint System.threadJoin(id);",
        )
        .unwrap();
        assert!(result.is_nil());
    }

    #[test]
    #[serial]
    fn lock_section_serializes_two_threads_incrementing_a_shared_counter() {
        let result = run(
            "initLock(\"counter\");\nvar total = 0;\nfun bump() {\n  lockSection(\"counter\");\n  total = total + 1;\n  unlockSection(\"counter\");\n  return total;\n}\nvar a = System.Thread(bump);\nvar b = System.Thread(bump);\nSystem.threadJoin(a);\nSystem.threadJoin(b);\nprint total;",
        )
        .unwrap();
        assert!(result.is_nil());
    }

    #[test]
    #[serial]
    fn joining_an_unknown_thread_id_is_a_recoverable_error() {
        let err = run("System.threadJoin(999999);").unwrap_err();
        assert!(matches!(err, InterpretError::Runtime(_)));
    }
}
