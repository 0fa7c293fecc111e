//! `System.Thread`/`System.threadJoin` (spec.md §5 "Threads"), grounded on
//! `examples/original_source/src/multithreading.c`'s `spawnThread`/
//! `getThread`/`killThread` and `core.c`'s `__nativeSystemThread`/
//! `__nativeSystemThreadJoin`.
//!
//! The original snapshots the caller's namespace into the new OS thread's
//! globals (`tableAddAll(&program->frame->namespace, &workerThread->global)`)
//! and runs the whole interpreter loop on a raw `pthread`, joining on a
//! `Value*` the worker stashes before it exits. We reproduce the same shape
//! with `std::thread::spawn` returning a `Value` directly and a registry of
//! `JoinHandle`s keyed by an incrementing id, instead of a linked list
//! walked by pointer identity.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use simpl_core::object::{ObjClosure, ObjFunction, ObjKind, downcast};
use simpl_core::value::Value;

use crate::error::RuntimeFault;
use crate::thread::{CallFrame, FrameOrigin, Thread};
use crate::vm::Vm;

#[derive(Default)]
pub struct ThreadRegistry {
    next_id: u64,
    handles: HashMap<u64, JoinHandle<Result<Value, RuntimeFault>>>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        ThreadRegistry::default()
    }

    fn insert(&mut self, handle: JoinHandle<Result<Value, RuntimeFault>>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.handles.insert(id, handle);
        id
    }

    fn take(&mut self, id: u64) -> Option<JoinHandle<Result<Value, RuntimeFault>>> {
        self.handles.remove(&id)
    }
}

/// Spawns `closure(arg)` on a fresh OS thread whose namespace starts as a
/// snapshot of `caller`'s current frame namespace, and returns the spawned
/// thread's id as a `Value::Number` (spec.md §5 "`System.Thread(fn, arg?)`
/// starts `fn` on a new OS thread ... returns a thread id").
///
/// `ObjClosure`/`ObjFunction`/`Table` carry raw, non-atomic `NonNull`
/// pointers and aren't `Send` (only `Value` is, see `simpl_core::value`).
/// Everything the spawned closure needs to cross the thread boundary is
/// therefore funneled through `Value`s — the closure itself, and the
/// caller's namespace as a flat list of key/value pairs — and reassembled
/// (downcast, and re-wrapped in a fresh `Rc<RefCell<_>>`) inside the new
/// thread, which never shares that `Rc` with the thread that spawned it.
pub fn spawn(
    vm: &Arc<Vm>,
    caller: &Thread,
    closure: std::ptr::NonNull<ObjClosure>,
    arg: Value,
) -> Result<Value, String> {
    let closure_value = Value::Obj(
        std::ptr::NonNull::new(ObjClosure::as_header_ptr(closure.as_ptr())).unwrap(),
    );

    let namespace_entries: Vec<(Value, Value)> = caller
        .current_frame()
        .namespace
        .borrow()
        .iter()
        .map(|(key, value)| {
            let key_value = Value::Obj(
                std::ptr::NonNull::new(simpl_core::object::ObjString::as_header_ptr(key.as_ptr()))
                    .unwrap(),
            );
            (key_value, value)
        })
        .collect();

    let vm = Arc::clone(vm);

    let builder = std::thread::Builder::new();
    let handle = builder
        .spawn(move || -> Result<Value, RuntimeFault> {
            let Value::Obj(h) = closure_value else { unreachable!() };
            let closure: std::ptr::NonNull<ObjClosure> = unsafe { downcast(h, ObjKind::Closure) };
            let function = unsafe { closure.as_ref() }.data.function;
            let arity = unsafe { function.as_ref() }.data.arity;

            let mut table = simpl_core::table::Table::new();
            for (key_value, value) in namespace_entries {
                let Value::Obj(kh) = key_value else { unreachable!() };
                let key: std::ptr::NonNull<simpl_core::object::ObjString> =
                    unsafe { downcast(kh, ObjKind::String) };
                table.set(key, value);
            }
            let namespace = std::rc::Rc::new(std::cell::RefCell::new(table));

            let mut worker = Thread::new(vm.alloc_thread_id());
            vm.gc.register_thread();
            worker.push(Value::Obj(
                std::ptr::NonNull::new(ObjFunction::as_header_ptr(function.as_ptr())).unwrap(),
            ));
            if arity > 0 {
                worker.push(arg);
            }
            worker.frames.push(CallFrame {
                function,
                origin: FrameOrigin::Closure(closure),
                ip: 0,
                slot_base: 0,
                namespace,
            });
            let result = vm.run(&mut worker);
            vm.gc.unregister_thread(worker.id);
            result
        })
        .map_err(|_| "Can't spawn new thread.".to_string())?;

    let id = vm.threads.lock().unwrap().insert(handle);
    Ok(Value::Number(id as f64))
}

/// Joins the thread identified by `id`, per `__nativeSystemThreadJoin`:
/// "Can't find thread." if unregistered, "Joined thread errored." if its
/// dispatch loop returned a `RuntimeFault`, else the thread's final value.
pub fn join(vm: &Arc<Vm>, id: f64) -> Result<Value, String> {
    let handle = vm
        .threads
        .lock()
        .unwrap()
        .take(id as u64)
        .ok_or_else(|| "Can't find thread.".to_string())?;

    let result = handle.join().map_err(|_| "Can't join thread.".to_string())?;
    result.map_err(|_| "Joined thread errored.".to_string())
}
