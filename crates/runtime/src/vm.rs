//! The virtual machine: instruction dispatch, call mechanics, upvalue
//! capture/close, exception/loop/switch unwinding, module evaluation and
//! the GC safe-point protocol (spec.md §4.4/§4.5, grounded line-by-line on
//! `examples/original_source/src/vm.c`'s `run()`).
//!
//! Concurrency shape (spec.md §5): a [`Vm`] is one shared, `Arc`-held value.
//! Only heap allocation and collection are serialised behind
//! `Vm::heap`'s mutex (the spec's `memoryAllocationMutex`); everything else
//! a running thread touches — its own value stack, frames, and namespace —
//! is private to that OS thread. Reading another thread's shared Instance
//! properties without a user-level lock is racy by design (spec.md §5
//! "Ordering"), exactly as in the source material.

use std::cell::RefCell;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};

use simpl_compiler::module_graph::ModuleGraph;
use simpl_core::chunk::OpCode;
use simpl_core::heap::{Heap, Tracer};
use simpl_core::object::{
    ArrayData, BoundOverloadedMethodData, ClassData, ClosureData, FunctionKind, GcHeader, GcObject,
    InstanceData, MethodKind, MethodSlot, ModuleData, NativeFnData, ObjArray, ObjBoundOverloadedMethod,
    ObjClass, ObjClosure, ObjFunction, ObjInstance, ObjKind, ObjModule, ObjNativeFn,
    ObjOverloadedMethod, ObjString, ObjUpValue, OverloadError, OverloadedMethodData, UpValueLocation,
    UpvalueDescriptor, downcast,
};
use simpl_core::table::Table;
use simpl_core::value::Value;

use crate::config::Config;
use crate::error::{RuntimeFault, TraceFrame, format_stack_trace};
use crate::natives::BuiltinClasses;
use crate::scheduler::ThreadRegistry;
use crate::sync::{LockRegistry, SemaphoreRegistry};
use crate::thread::{CallFrame, FrameOrigin, LoopRecord, Thread, TryCatchRecord};

/// spec.md §5 "Suspension points": a request-and-park protocol. The thread
/// whose allocation first observes `Heap::should_collect` becomes the
/// collector; every other live thread publishes a snapshot of its own roots
/// and parks until the collector signals completion.
#[derive(Default)]
struct GcState {
    collecting: bool,
    active: usize,
    parked: usize,
    generation: u64,
}

pub struct GcCoordinator {
    state: Mutex<GcState>,
    cv: Condvar,
    /// Per-thread root snapshots, refreshed by each thread immediately
    /// before it parks for a collection it did not initiate.
    snapshots: Mutex<std::collections::HashMap<u64, RootSnapshot>>,
}

/// A `Send`-able bag of raw object pointers a thread publishes as its roots.
/// Safe to hand across threads under the same invariant `Value`'s `Send`
/// impl relies on (`simpl_core::value`): the objects these point at are
/// only ever mutated by their owning thread or by the collector while every
/// other thread is parked.
struct RootSnapshot(Vec<NonNull<GcHeader>>);
unsafe impl Send for RootSnapshot {}

impl GcCoordinator {
    fn new() -> Self {
        GcCoordinator {
            state: Mutex::new(GcState::default()),
            cv: Condvar::new(),
            snapshots: Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn register_thread(&self) {
        self.state.lock().unwrap().active += 1;
    }

    fn unregister_thread(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        state.active = state.active.saturating_sub(1);
        self.snapshots.lock().unwrap().remove(&id);
        self.cv.notify_all();
    }

    fn publish(&self, id: u64, thread: &Thread) {
        let mut roots = Vec::new();
        collect_thread_roots(thread, &mut roots);
        self.snapshots.lock().unwrap().insert(id, RootSnapshot(roots));
    }

    /// Called at an allocation safe-point. If this thread's own allocation
    /// crossed the GC threshold it becomes the collector; otherwise, if a
    /// collection is already underway, it publishes its roots and parks.
    fn maybe_collect(&self, vm: &Vm, id: u64, thread: &Thread) {
        {
            let state = self.state.lock().unwrap();
            if !state.collecting && !vm_should_collect(vm) {
                return;
            }
        }
        let mut state = self.state.lock().unwrap();
        if state.collecting {
            // Someone else is already collecting: publish and park.
            drop(state);
            self.publish(id, thread);
            let mut state = self.state.lock().unwrap();
            state.parked += 1;
            self.cv.notify_all();
            let generation = state.generation;
            while state.collecting && state.generation == generation {
                state = self.cv.wait(state).unwrap();
            }
            state.parked = state.parked.saturating_sub(1);
            return;
        }

        // Become the collector.
        state.collecting = true;
        let waiters = state.active.saturating_sub(1);
        drop(state);
        self.publish(id, thread);
        {
            let mut state = self.state.lock().unwrap();
            while state.parked < waiters {
                state = self.cv.wait(state).unwrap();
            }
        }

        {
            let mut heap = vm.heap.lock().unwrap();
            let snapshots = self.snapshots.lock().unwrap();
            heap.collect(|tracer| {
                for (&snap_id, snapshot) in snapshots.iter() {
                    if snap_id == id {
                        continue;
                    }
                    for &obj in &snapshot.0 {
                        tracer.mark_object(obj);
                    }
                }
                mark_builtins(vm, tracer);
            });
        }

        let mut state = self.state.lock().unwrap();
        state.collecting = false;
        state.parked = 0;
        state.generation = state.generation.wrapping_add(1);
        self.cv.notify_all();
    }
}

fn vm_should_collect(vm: &Vm) -> bool {
    vm.heap.lock().unwrap().should_collect()
}

fn mark_builtins(vm: &Vm, tracer: &mut Tracer) {
    vm.builtins.mark(tracer);
}

fn collect_thread_roots(thread: &Thread, out: &mut Vec<NonNull<GcHeader>>) {
    for value in &thread.stack {
        if let Some(header) = value.header() {
            out.push(header);
        }
    }
    for frame in &thread.frames {
        out.push(GcObject::as_header_ptr(frame.function.as_ptr()).cast::<GcHeader>().try_into_nonnull());
        match frame.origin {
            FrameOrigin::Closure(c) => out.push(c.cast()),
            FrameOrigin::Module(m) => out.push(m.cast()),
            FrameOrigin::Script => {}
        }
        for (k, v) in frame.namespace.borrow().iter() {
            out.push(k.cast());
            if let Some(header) = v.header() {
                out.push(header);
            }
        }
    }
    for &uv in &thread.open_upvalues {
        out.push(uv.cast());
    }
}

/// Tiny shim so the ad-hoc pointer casts above read naturally; a raw
/// `*mut GcHeader` from `as_header_ptr` is always non-null (it was built
/// from a live `NonNull`).
trait IntoNonNull {
    fn try_into_nonnull(self) -> NonNull<GcHeader>;
}
impl IntoNonNull for *mut GcHeader {
    fn try_into_nonnull(self) -> NonNull<GcHeader> {
        NonNull::new(self).expect("header pointer from a live object is never null")
    }
}

/// spec.md §4.4 "VMState" (resolved from
/// `examples/original_source/src/vm.h`): tracks whether built-ins are still
/// being installed so the first few allocations aren't mistaken for
/// ordinary user allocations when deciding GC eligibility.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VMState {
    Initializing,
    Extending,
    Initialized,
}

pub struct Vm {
    pub heap: Mutex<Heap>,
    pub base_namespace: Table,
    pub builtins: BuiltinClasses,
    pub module_graph: Mutex<ModuleGraph>,
    pub locks: Mutex<LockRegistry>,
    pub semaphores: SemaphoreRegistry,
    pub gc: GcCoordinator,
    pub config: Config,
    pub entry_dir: PathBuf,
    pub state: std::sync::atomic::AtomicU8,
    next_thread_id: AtomicU64,
    /// `System.Thread`/`System.threadJoin`'s backing registry of spawned OS
    /// threads, keyed by an incrementing id (spec.md §5 "Threads").
    pub threads: Mutex<ThreadRegistry>,
    /// A weak self-reference so natives that need to spawn/join OS threads
    /// (`crate::scheduler::spawn`/`join` take `&Arc<Vm>`) can recover one
    /// from the `&Vm` a [`crate::natives::NativeCtx`] actually carries.
    /// Populated by [`Vm::new_shared`]; empty (and unused) for a bare
    /// `Vm::new` that never spawns threads, e.g. in unit tests.
    self_weak: OnceLock<Weak<Vm>>,
}

// SAFETY: every `NonNull`/raw pointer reachable from a `Vm` refers to
// objects whose only mutators are (a) the owning OS thread for its private
// state, and (b) the collector while every other registered thread is
// parked (see `GcCoordinator`). No code outside this invariant ever derefs
// a `Vm`-reachable pointer from a second thread concurrently.
unsafe impl Send for Vm {}
unsafe impl Sync for Vm {}

impl Vm {
    pub fn new(config: Config) -> Self {
        let mut heap = Heap::new();
        let (builtins, base_namespace) = crate::natives::install(&mut heap);
        Vm {
            heap: Mutex::new(heap),
            base_namespace,
            builtins,
            module_graph: Mutex::new(ModuleGraph::new()),
            locks: Mutex::new(LockRegistry::new()),
            semaphores: SemaphoreRegistry::new(),
            gc: GcCoordinator::new(),
            config,
            entry_dir: PathBuf::from("."),
            state: std::sync::atomic::AtomicU8::new(VMState::Initialized as u8),
            next_thread_id: AtomicU64::new(0),
            threads: Mutex::new(ThreadRegistry::new()),
            self_weak: OnceLock::new(),
        }
    }

    /// Builds a `Vm` that knows its own `Arc` handle, so natives can recover
    /// an `Arc<Vm>` to pass to `crate::scheduler::spawn`/`join`.
    pub fn new_shared(config: Config) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let vm = Vm::new(config);
            vm.self_weak.set(weak.clone()).ok();
            vm
        })
    }

    /// Like `new_shared`, but resolves imports relative to `entry_dir`
    /// instead of the process's current directory (spec.md §6 "Imports are
    /// resolved relative to the entry file's directory").
    pub fn new_shared_with_entry_dir(config: Config, entry_dir: PathBuf) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let mut vm = Vm::new(config);
            vm.entry_dir = entry_dir;
            vm.self_weak.set(weak.clone()).ok();
            vm
        })
    }

    /// Recovers the `Arc<Vm>` handle installed by `new_shared`.
    ///
    /// # Panics
    /// If this `Vm` was built with `Vm::new` directly (no shared handle), or
    /// if every `Arc` has already been dropped while still running.
    pub fn shared_self(&self) -> Arc<Self> {
        self.self_weak
            .get()
            .expect("Vm::shared_self called on a Vm built with Vm::new, not Vm::new_shared")
            .upgrade()
            .expect("Vm dropped while still running")
    }

    pub fn alloc_thread_id(&self) -> u64 {
        self.next_thread_id.fetch_add(1, Ordering::SeqCst)
    }

    fn fresh_namespace(&self) -> Rc<RefCell<Table>> {
        let mut table = Table::new();
        table.add_all_from(&self.base_namespace);
        Rc::new(RefCell::new(table))
    }

    /// Compile `source` (kind `Script`) and run it to completion on a fresh
    /// thread whose namespace starts from the VM's built-ins — the
    /// one-argument CLI path (spec.md §6).
    pub fn interpret_file(&self, source: &str) -> Result<Value, InterpretError> {
        let mut thread = Thread::new(self.alloc_thread_id());
        self.gc.register_thread();
        let result = self.interpret_into(source, &mut thread, self.fresh_namespace());
        self.gc.unregister_thread(thread.id);
        result
    }

    /// Compile `source` and run it on `thread`, reusing `namespace` — this
    /// is how the REPL keeps globals alive across lines (spec.md §6 "no
    /// arguments: interactive REPL ... each line is interpreted in the
    /// persistent VM state").
    pub fn interpret_line(&self, source: &str, thread: &mut Thread, namespace: Rc<RefCell<Table>>) -> Result<Value, InterpretError> {
        self.interpret_into(source, thread, namespace)
    }

    fn interpret_into(&self, source: &str, thread: &mut Thread, namespace: Rc<RefCell<Table>>) -> Result<Value, InterpretError> {
        let function = {
            let mut heap = self.heap.lock().unwrap();
            let mut graph = self.module_graph.lock().unwrap();
            simpl_compiler::Compiler::compile(source, &mut heap, &mut graph, FunctionKind::Script, self.entry_dir.clone())
                .map_err(InterpretError::Compile)?
                .function
        };

        thread.push(Value::Obj(NonNull::new(ObjFunction::as_header_ptr(function.as_ptr())).unwrap()));
        thread.frames.push(CallFrame {
            function,
            origin: FrameOrigin::Script,
            ip: 0,
            slot_base: thread.stack.len() - 1,
            namespace,
        });

        self.run(thread).map_err(InterpretError::Runtime)
    }

    pub fn new_root_thread(&self) -> Thread {
        Thread::new(self.alloc_thread_id())
    }

    // -- dispatch ----------------------------------------------------------

    /// Run `thread` until its bottommost frame returns. Grounded on
    /// `run()` in `examples/original_source/src/vm.c`.
    pub fn run(&self, thread: &mut Thread) -> Result<Value, RuntimeFault> {
        let base_frame_count = thread.frames.len() - 1;
        loop {
            let op = self.read_op(thread);
            match op {
                OpCode::Constant => {
                    let v = self.read_constant(thread);
                    thread.push(v);
                }
                OpCode::True => thread.push(Value::Bool(true)),
                OpCode::False => thread.push(Value::Bool(false)),
                OpCode::Nil => thread.push(Value::Nil),
                OpCode::StringInterpolation => {
                    let template = self.read_constant(thread);
                    let Value::Obj(h) = template else { unreachable!() };
                    let template_str = unsafe { downcast::<simpl_core::object::StringData>(h, ObjKind::String) };
                    let template_str = unsafe { template_str.as_ref() }.as_str().to_string();
                    let count = self.read_u8(thread) as usize;
                    let mut parts = Vec::with_capacity(count);
                    for _ in 0..count {
                        parts.push(thread.pop());
                    }
                    parts.reverse();
                    let mut rendered = String::new();
                    let mut parts_iter = parts.into_iter();
                    let mut chunks = template_str.split("\u{0}");
                    if let Some(first) = chunks.next() {
                        rendered.push_str(first);
                    }
                    for chunk in chunks {
                        if let Some(p) = parts_iter.next() {
                            rendered.push_str(&self.stringify(p));
                        }
                        rendered.push_str(chunk);
                    }
                    let interned = self.intern_tagged(&rendered);
                    thread.push(Value::Obj(NonNull::new(ObjString::as_header_ptr(interned.as_ptr())).unwrap()));
                }
                OpCode::Array => {
                    let len = self.read_u8(thread) as usize;
                    let items = thread.stack.split_off(thread.stack.len() - len);
                    let arr = {
                        let mut heap = self.heap.lock().unwrap();
                        heap.alloc_array(items)
                    };
                    self.tag(arr.cast(), self.builtins.array_class);
                    thread.push(Value::Obj(NonNull::new(ObjArray::as_header_ptr(arr.as_ptr())).unwrap()));
                }
                OpCode::Object => {
                    let instance = self.new_instance(self.builtins.object_class);
                    let count = self.read_u8(thread) as usize;
                    for _ in 0..count {
                        let value = thread.pop();
                        let key = thread.pop();
                        let Value::Obj(h) = key else { unreachable!("object literal key must be a string") };
                        let key = unsafe { downcast(h, ObjKind::String) };
                        unsafe { &mut (*instance.as_ptr()).data }.properties.set(key, value);
                    }
                    thread.push(Value::Obj(NonNull::new(ObjInstance::as_header_ptr(instance.as_ptr())).unwrap()));
                }
                OpCode::GetLocal => {
                    let slot = self.read_u8(thread) as usize;
                    let base = thread.current_frame().slot_base;
                    thread.push(thread.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_u8(thread) as usize;
                    let base = thread.current_frame().slot_base;
                    thread.stack[base + slot] = thread.peek(0);
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_u8(thread) as usize;
                    let uv = self.current_closure_upvalue(thread, slot);
                    thread.push(self.read_upvalue(thread, uv));
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_u8(thread) as usize;
                    let uv = self.current_closure_upvalue(thread, slot);
                    let v = thread.peek(0);
                    self.write_upvalue(thread, uv, v);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string_constant(thread);
                    let ns = thread.current_frame().namespace.clone();
                    match ns.borrow().get(name) {
                        Some(v) => thread.push(v),
                        None => {
                            if let Some(fault) = self.recoverable_error(
                                thread,
                                format!("Undefined variable '{}'", unsafe { name.as_ref() }.as_str()),
                            )? {
                                return Err(fault);
                            }
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string_constant(thread);
                    let v = thread.peek(0);
                    thread.current_frame().namespace.borrow_mut().set(name, v);
                    thread.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string_constant(thread);
                    let ns = thread.current_frame().namespace.clone();
                    let was_new = ns.borrow_mut().set(name, thread.peek(0));
                    if was_new {
                        ns.borrow_mut().delete(name);
                        if let Some(fault) = self.recoverable_error(
                            thread,
                            format!("Undefined variable '{}'", unsafe { name.as_ref() }.as_str()),
                        )? {
                            return Err(fault);
                        }
                    }
                }
                OpCode::CloseUpvalue => {
                    let floor = thread.stack.len() - 1;
                    self.close_upvalues(thread, floor);
                    thread.pop();
                }
                OpCode::GetProperty => {
                    let name = self.read_string_constant(thread);
                    let keep_base = self.read_u8(thread) != 0;
                    let base = if keep_base { thread.peek(0) } else { thread.pop() };
                    let value = self.get_property(base, name);
                    thread.push(value.unwrap_or(Value::Nil));
                }
                OpCode::SetProperty => {
                    let value = thread.pop();
                    let base = thread.pop();
                    let name = self.read_string_constant(thread);
                    match base {
                        Value::Obj(h) if unsafe { h.as_ref() }.kind == ObjKind::Instance => {
                            let inst: NonNull<ObjInstance> = unsafe { downcast(h, ObjKind::Instance) };
                            unsafe { &mut (*inst.as_ptr()).data }.properties.set(name, value);
                            thread.push(value);
                        }
                        _ => {
                            if let Some(fault) = self.recoverable_error(
                                thread,
                                format!("Cannot access property '{}'.", unsafe { name.as_ref() }.as_str()),
                            )? {
                                return Err(fault);
                            }
                        }
                    }
                }
                OpCode::GetItem => {
                    let keep_base = self.read_u8(thread) != 0;
                    let (index, base) = if keep_base {
                        (thread.peek(0), thread.peek(1))
                    } else {
                        let index = thread.pop();
                        let base = thread.pop();
                        (index, base)
                    };
                    match self.get_item(base, index) {
                        Ok(v) => thread.push(v),
                        Err(msg) => {
                            if let Some(fault) = self.recoverable_error(thread, msg)? {
                                return Err(fault);
                            }
                        }
                    }
                }
                OpCode::SetItem => {
                    let value = thread.pop();
                    let index = thread.pop();
                    let base = thread.pop();
                    match self.set_item(base, index, value) {
                        Ok(()) => thread.push(value),
                        Err(msg) => {
                            if let Some(fault) = self.recoverable_error(thread, msg)? {
                                return Err(fault);
                            }
                        }
                    }
                }
                OpCode::Invoke => {
                    let name = self.read_string_constant(thread);
                    let argc = self.read_u8(thread) as usize;
                    let base = thread.peek(argc);
                    if let Some(fault) = self.invoke(thread, base, name, argc)? {
                        return Err(fault);
                    }
                }
                OpCode::Add => {
                    let (a, b) = (thread.peek(1), thread.peek(0));
                    match (a, b) {
                        (Value::Number(x), Value::Number(y)) => {
                            thread.pop();
                            thread.pop();
                            thread.push(Value::Number(x + y));
                        }
                        _ if a.is_obj_kind(ObjKind::String) && b.is_obj_kind(ObjKind::String) => {
                            thread.pop();
                            thread.pop();
                            let sa = self.stringify(a);
                            let sb = self.stringify(b);
                            let concatenated = self.intern_tagged(&format!("{sa}{sb}"));
                            thread.push(Value::Obj(NonNull::new(ObjString::as_header_ptr(concatenated.as_ptr())).unwrap()));
                        }
                        _ => {
                            if let Some(fault) =
                                self.recoverable_error(thread, "Operands must be two numbers or two strings.".into())?
                            {
                                return Err(fault);
                            }
                        }
                    }
                }
                OpCode::Subtract => self.binary_numeric(thread, |a, b| a - b)?,
                OpCode::Multiply => self.binary_numeric(thread, |a, b| a * b)?,
                OpCode::Divide => self.binary_numeric(thread, |a, b| a / b)?,
                OpCode::Greater => self.binary_compare(thread, |a, b| a > b)?,
                OpCode::Less => self.binary_compare(thread, |a, b| a < b)?,
                OpCode::Equal => {
                    let b = thread.pop();
                    let a = thread.pop();
                    thread.push(Value::Bool(a.values_equal(&b)));
                }
                OpCode::Not => {
                    let v = thread.pop();
                    thread.push(Value::Bool(v.is_falsey()));
                }
                OpCode::Negate => {
                    if let Value::Number(n) = thread.peek(0) {
                        thread.pop();
                        thread.push(Value::Number(-n));
                    } else if let Some(fault) = self.recoverable_error(thread, "Operand must be a number.".into())? {
                        return Err(fault);
                    }
                }
                OpCode::Jump => {
                    let offset = self.read_u16(thread);
                    thread.current_frame_mut().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16(thread);
                    if thread.peek(0).is_falsey() {
                        thread.current_frame_mut().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16(thread);
                    thread.current_frame_mut().ip -= offset as usize;
                }
                OpCode::LoopGuard => {
                    if thread.loop_stack.len() + 1 >= self.config.max_block_nesting {
                        return Err(RuntimeFault::BlockStackOverflow);
                    }
                    let start_off = self.read_u16(thread);
                    let out_off = self.read_u16(thread);
                    let ip = thread.current_frame().ip;
                    thread.loop_stack.push(LoopRecord {
                        frame_index: thread.current_frame_index(),
                        stack_top: thread.stack.len(),
                        start_ip: ip + start_off as usize,
                        out_ip: ip + out_off as usize,
                    });
                }
                OpCode::LoopGuardEnd => {
                    thread.loop_stack.pop();
                }
                OpCode::LoopBreak => {
                    let loop_rec = thread.loop_stack.last().expect("break outside loop").clone_fields();
                    self.pop_enclosed_try_catches(thread, &loop_rec);
                    thread.current_frame_mut().ip = loop_rec.out_ip;
                    thread.stack.truncate(loop_rec.stack_top + 1);
                    self.close_upvalues(thread, loop_rec.stack_top.saturating_sub(1));
                }
                OpCode::LoopContinue => {
                    let loop_rec = thread.loop_stack.last().expect("continue outside loop").clone_fields();
                    self.pop_enclosed_try_catches(thread, &loop_rec);
                    thread.current_frame_mut().ip = loop_rec.start_ip;
                    thread.stack.truncate(loop_rec.stack_top);
                    self.close_upvalues(thread, loop_rec.stack_top.saturating_sub(1));
                }
                OpCode::NamedLoop => {
                    let iterator = thread.peek(0);
                    let idx = thread.peek(1);
                    let Value::Number(idx) = idx else { unreachable!() };
                    let next_idx = idx + 1.0;
                    let Value::Obj(h) = iterator else {
                        if let Some(fault) =
                            self.recoverable_error(thread, "Expected for each iterator variable to be iterable.".into())?
                        {
                            return Err(fault);
                        }
                        continue;
                    };
                    if unsafe { h.as_ref() }.kind != ObjKind::Array {
                        if let Some(fault) =
                            self.recoverable_error(thread, "Expected for each iterator variable to be iterable.".into())?
                        {
                            return Err(fault);
                        }
                        continue;
                    }
                    let arr: NonNull<ObjArray> = unsafe { downcast(h, ObjKind::Array) };
                    let len = unsafe { arr.as_ref() }.data.items.len();
                    let loop_rec = thread.loop_stack.last().expect("for-of outside loop guard").clone_fields();
                    if next_idx as usize >= len {
                        thread.current_frame_mut().ip = loop_rec.out_ip;
                        thread.stack.truncate(loop_rec.stack_top + 1);
                        continue;
                    }
                    let item = unsafe { arr.as_ref() }.data.items[next_idx as usize];
                    let top = thread.stack.len();
                    thread.stack[top - 2] = Value::Number(next_idx);
                    thread.stack[top - 3] = item;
                }
                OpCode::RangedLoopSetup => {
                    let top = thread.stack.len();
                    let start = thread.stack[top - 3];
                    let mut end = thread.stack[top - 2];
                    let mut step = thread.stack[top - 1];
                    let Value::Number(start_n) = start else {
                        if let Some(fault) = self.recoverable_error(thread, "range() bounds must be numbers.".into())? {
                            return Err(fault);
                        }
                        continue;
                    };
                    let start_n = if end.is_nil() {
                        end = Value::Number(start_n);
                        0.0
                    } else {
                        start_n
                    };
                    let end_n = match end {
                        Value::Number(n) => n,
                        _ => start_n,
                    };
                    if step.is_nil() {
                        step = Value::Number((end_n - start_n).signum());
                    }
                    thread.stack[top - 3] = Value::Number(start_n);
                    thread.stack[top - 2] = Value::Number(end_n);
                    thread.stack[top - 1] = step;
                }
                OpCode::RangedLoop => {
                    let top = thread.stack.len();
                    let Value::Number(cur) = thread.stack[top - 3] else { unreachable!() };
                    let Value::Number(end) = thread.stack[top - 2] else { unreachable!() };
                    let Value::Number(step) = thread.stack[top - 1] else { unreachable!() };
                    let loop_rec = thread.loop_stack.last().expect("range loop outside loop guard").clone_fields();
                    let finished = if step == 0.0 {
                        if let Some(fault) =
                            self.recoverable_error(thread, "range() step must not be zero.".into())?
                        {
                            return Err(fault);
                        }
                        continue;
                    } else if step > 0.0 {
                        cur >= end
                    } else {
                        cur <= end
                    };
                    if finished {
                        thread.current_frame_mut().ip = loop_rec.out_ip;
                        thread.stack.truncate(loop_rec.stack_top + 1);
                        continue;
                    }
                    thread.stack[top - 3] = Value::Number(cur + step);
                }
                OpCode::Switch => { /* marker only; the switch value is already on the stack */ }
                OpCode::SwitchCase => {
                    let case_value = thread.pop();
                    let switch_value = thread.peek(0);
                    thread.push(Value::Bool(switch_value.values_equal(&case_value)));
                }
                OpCode::SwitchDefault | OpCode::SwitchBreak => {}
                OpCode::SwitchEnd => {
                    let _unused_offset = self.read_u16(thread);
                    thread.pop();
                }
                OpCode::Call => {
                    let argc = self.read_u8(thread) as usize;
                    let callee = thread.peek(argc);
                    if let Some(fault) = self.call_value(thread, callee, argc)? {
                        return Err(fault);
                    }
                }
                OpCode::Closure => {
                    let fn_value = self.read_constant(thread);
                    let Value::Obj(h) = fn_value else { unreachable!() };
                    let function: NonNull<ObjFunction> = unsafe { downcast(h, ObjKind::Function) };
                    let upvalue_count = unsafe { function.as_ref() }.data.upvalue_count;
                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let index = self.read_u8(thread);
                        let is_local = self.read_u8(thread) != 0;
                        if is_local {
                            let base = thread.current_frame().slot_base;
                            upvalues.push(self.capture_upvalue(thread, base + index as usize));
                        } else {
                            upvalues.push(self.current_closure_upvalue(thread, index as usize));
                        }
                    }
                    let closure = {
                        let mut heap = self.heap.lock().unwrap();
                        heap.alloc_closure(ClosureData { function, upvalues })
                    };
                    thread.push(Value::Obj(NonNull::new(ObjClosure::as_header_ptr(closure.as_ptr())).unwrap()));
                }
                OpCode::Class => {
                    let name = self.read_string_constant(thread);
                    let class = {
                        let mut heap = self.heap.lock().unwrap();
                        heap.alloc_class(ClassData { name, methods: Table::new(), superclass: None })
                    };
                    self.tag(class.cast(), self.builtins.class_class);
                    thread.push(Value::Obj(NonNull::new(ObjClass::as_header_ptr(class.as_ptr())).unwrap()));
                }
                OpCode::Inherit => {
                    let Value::Obj(h) = thread.pop() else { unreachable!() };
                    let class: NonNull<ObjClass> = unsafe { downcast(h, ObjKind::Class) };
                    let superclass = thread.peek(0);
                    // spec.md §7 lists a non-class superclass among the
                    // *fatal* runtime errors, not the recoverable ones: it
                    // cannot be caught by a `try`/`catch`.
                    let Value::Obj(sh) = superclass else {
                        return Err(RuntimeFault::SuperclassNotClass);
                    };
                    if unsafe { sh.as_ref() }.kind != ObjKind::Class {
                        return Err(RuntimeFault::SuperclassNotClass);
                    }
                    let superclass: NonNull<ObjClass> = unsafe { downcast(sh, ObjKind::Class) };
                    self.inherit_methods(superclass, class);
                    unsafe { &mut (*class.as_ptr()).data }.superclass = Some(superclass);
                }
                OpCode::Super => {
                    let Value::Obj(kh) = thread.pop() else { unreachable!() };
                    let klass: NonNull<ObjClass> = unsafe { downcast(kh, ObjKind::Class) };
                    let base = thread.pop();
                    let name = self.read_string_constant(thread);
                    match self.class_bound_method(base, klass, name) {
                        Some(v) => thread.push(v),
                        None => {
                            if let Some(fault) = self.recoverable_error(
                                thread,
                                format!("Cannot access method '{}'.", unsafe { name.as_ref() }.as_str()),
                            )? {
                                return Err(fault);
                            }
                        }
                    }
                }
                OpCode::Method => {
                    let name = self.read_string_constant(thread);
                    self.define_method(thread, name);
                }
                OpCode::TryCatch => {
                    if thread.try_catch_stack.len() + 1 >= self.config.max_block_nesting {
                        return Err(RuntimeFault::BlockStackOverflow);
                    }
                    let catch_off = self.read_u16(thread);
                    let out_off = self.read_u16(thread);
                    let has_param = self.read_u8(thread) != 0;
                    let ip = thread.current_frame().ip;
                    thread.try_catch_stack.push(TryCatchRecord {
                        frame_index: thread.current_frame_index(),
                        stack_top: thread.stack.len(),
                        start_ip: ip,
                        catch_ip: ip + catch_off as usize,
                        out_ip: ip + out_off as usize,
                        has_catch_param: has_param,
                    });
                }
                OpCode::TryCatchTryEnd => {
                    let record = thread.try_catch_stack.pop().expect("try-catch-try-end without a pending block");
                    thread.current_frame_mut().ip = record.out_ip;
                }
                OpCode::Throw => {
                    let value = thread.pop();
                    if let Some(fault) = self.unwind_to_catch(thread, value)? {
                        return Err(fault);
                    }
                }
                OpCode::Pop => {
                    thread.pop();
                }
                OpCode::Print => {
                    let v = thread.pop();
                    println!("{}", self.stringify(v));
                }
                OpCode::Import => {
                    let constant = self.read_constant(thread);
                    let Value::Obj(h) = constant else { unreachable!() };
                    let module: NonNull<ObjModule> = unsafe { downcast(h, ObjKind::Module) };
                    if !unsafe { module.as_ref() }.data.evaluated {
                        thread.push(Value::Obj(
                            NonNull::new(ObjFunction::as_header_ptr(unsafe { module.as_ref() }.data.function.as_ptr()))
                                .unwrap(),
                        ));
                        self.call_module(thread, module)?;
                    } else {
                        let exports = self.new_instance(self.builtins.module_exports_class);
                        let src = &unsafe { module.as_ref() }.data.exports;
                        unsafe { &mut (*exports.as_ptr()).data }.properties.add_all_from(src);
                        thread.push(Value::Obj(NonNull::new(ObjInstance::as_header_ptr(exports.as_ptr())).unwrap()));
                    }
                }
                OpCode::Export => {
                    let name = self.read_string_constant(thread);
                    let value = thread.pop();
                    let frame = thread.current_frame();
                    match frame.origin {
                        FrameOrigin::Module(m) => {
                            let is_new = unsafe { &mut (*m.as_ptr()).data }.exports.set(name, value);
                            if !is_new {
                                return Err(RuntimeFault::UncaughtException {
                                    message: format!(
                                        "Already exporting member with name '{}'.",
                                        unsafe { name.as_ref() }.as_str()
                                    ),
                                    stack_trace: self.stack_trace(thread),
                                });
                            }
                        }
                        _ => {
                            if let Some(fault) =
                                self.recoverable_error(thread, "'export' is only valid inside a module.".into())?
                            {
                                return Err(fault);
                            }
                        }
                    }
                }
                OpCode::Return => {
                    let mut result = thread.pop();
                    let frame_index = thread.current_frame_index();
                    let slot_base = thread.current_frame().slot_base;
                    self.close_upvalues(thread, slot_base);

                    if let FrameOrigin::Module(m) = thread.current_frame().origin {
                        unsafe { (*m.as_ptr()).data.evaluated = true };
                        let exports_instance = self.new_instance(self.builtins.module_exports_class);
                        let src = &unsafe { m.as_ref() }.data.exports;
                        unsafe { &mut (*exports_instance.as_ptr()).data }.properties.add_all_from(src);
                        result = Value::Obj(NonNull::new(ObjInstance::as_header_ptr(exports_instance.as_ptr())).unwrap());
                    }

                    thread.loop_stack.retain(|l| l.frame_index != frame_index);
                    thread.try_catch_stack.retain(|t| t.frame_index != frame_index);

                    thread.frames.pop();
                    if thread.frames.len() == base_frame_count {
                        thread.stack.truncate(slot_base);
                        return Ok(result);
                    }
                    thread.stack.truncate(slot_base);
                    thread.push(result);
                }
            }
        }
    }

    // -- opcode helpers ------------------------------------------------------

    fn read_op(&self, thread: &mut Thread) -> OpCode {
        let byte = self.read_u8(thread);
        OpCode::from_u8(byte)
    }

    fn read_u8(&self, thread: &mut Thread) -> u8 {
        let frame = thread.current_frame_mut();
        let function = frame.function;
        let byte = unsafe { function.as_ref() }.data.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&self, thread: &mut Thread) -> u16 {
        let hi = self.read_u8(thread);
        let lo = self.read_u8(thread);
        u16::from_be_bytes([hi, lo])
    }

    fn read_constant(&self, thread: &mut Thread) -> Value {
        let idx = self.read_u8(thread);
        let frame = thread.current_frame();
        unsafe { frame.function.as_ref() }.data.chunk.constants[idx as usize]
    }

    fn read_string_constant(&self, thread: &mut Thread) -> NonNull<ObjString> {
        let Value::Obj(h) = self.read_constant(thread) else {
            unreachable!("string constant operand must be a String")
        };
        unsafe { downcast(h, ObjKind::String) }
    }

    fn binary_numeric(&self, thread: &mut Thread, op: impl FnOnce(f64, f64) -> f64) -> Result<(), RuntimeFault> {
        if let (Value::Number(a), Value::Number(b)) = (thread.peek(1), thread.peek(0)) {
            thread.pop();
            thread.pop();
            thread.push(Value::Number(op(a, b)));
            Ok(())
        } else if let Some(fault) = self.recoverable_error(thread, "Operands must be numbers.".into())? {
            Err(fault)
        } else {
            Ok(())
        }
    }

    fn binary_compare(&self, thread: &mut Thread, op: impl FnOnce(f64, f64) -> bool) -> Result<(), RuntimeFault> {
        if let (Value::Number(a), Value::Number(b)) = (thread.peek(1), thread.peek(0)) {
            thread.pop();
            thread.pop();
            thread.push(Value::Bool(op(a, b)));
            Ok(())
        } else if let Some(fault) = self.recoverable_error(thread, "Operands must be numbers.".into())? {
            Err(fault)
        } else {
            Ok(())
        }
    }

    // -- upvalues -------------------------------------------------------

    fn current_closure_upvalue(&self, thread: &Thread, index: usize) -> NonNull<ObjUpValue> {
        match thread.current_frame().origin {
            FrameOrigin::Closure(c) => unsafe { c.as_ref() }.data.upvalues[index],
            _ => unreachable!("upvalue access outside a closure frame"),
        }
    }

    fn read_upvalue(&self, thread: &Thread, uv: NonNull<ObjUpValue>) -> Value {
        match unsafe { uv.as_ref() }.data.location {
            UpValueLocation::Open { slot, .. } => thread.stack[slot],
            UpValueLocation::Closed(v) => v,
        }
    }

    fn write_upvalue(&self, thread: &mut Thread, uv: NonNull<ObjUpValue>, value: Value) {
        match unsafe { uv.as_ref() }.data.location {
            UpValueLocation::Open { slot, .. } => thread.stack[slot] = value,
            UpValueLocation::Closed(_) => unsafe { (*uv.as_ptr()).data.location = UpValueLocation::Closed(value) },
        }
    }

    /// Walk the thread's open-upvalue list (sorted descending by slot,
    /// spec.md §8 invariant 2), reusing an existing upvalue for `slot` or
    /// inserting a fresh one.
    fn capture_upvalue(&self, thread: &mut Thread, slot: usize) -> NonNull<ObjUpValue> {
        let mut insert_at = thread.open_upvalues.len();
        for (i, &uv) in thread.open_upvalues.iter().enumerate() {
            let existing_slot = match unsafe { uv.as_ref() }.data.location {
                UpValueLocation::Open { slot: s, .. } => s,
                UpValueLocation::Closed(_) => continue,
            };
            if existing_slot == slot {
                return uv;
            }
            if existing_slot < slot {
                insert_at = i;
                break;
            }
        }
        let created = {
            let mut heap = self.heap.lock().unwrap();
            heap.alloc_upvalue(UpValueLocation::Open { thread_id: thread.id, slot })
        };
        thread.open_upvalues.insert(insert_at, created);
        created
    }

    fn close_upvalues(&self, thread: &mut Thread, floor: usize) {
        let mut i = 0;
        while i < thread.open_upvalues.len() {
            let uv = thread.open_upvalues[i];
            let slot = match unsafe { uv.as_ref() }.data.location {
                UpValueLocation::Open { slot, .. } => slot,
                UpValueLocation::Closed(_) => {
                    i += 1;
                    continue;
                }
            };
            if slot < floor {
                break;
            }
            let value = thread.stack[slot];
            unsafe { (*uv.as_ptr()).data.location = UpValueLocation::Closed(value) };
            thread.open_upvalues.remove(i);
        }
    }

    // -- calls ------------------------------------------------------------

    fn call_value(&self, thread: &mut Thread, callee: Value, argc: usize) -> Result<Option<RuntimeFault>, RuntimeFault> {
        if let Value::Obj(h) = callee {
            match unsafe { h.as_ref() }.kind {
                ObjKind::Class => {
                    let class: NonNull<ObjClass> = unsafe { downcast(h, ObjKind::Class) };
                    return self.call_constructor(thread, class, argc);
                }
                ObjKind::BoundOverloadedMethod => {
                    let bound: NonNull<ObjBoundOverloadedMethod> = unsafe { downcast(h, ObjKind::BoundOverloadedMethod) };
                    let data = unsafe { bound.as_ref() };
                    let top = thread.stack.len();
                    thread.stack[top - argc - 1] = data.data.base;
                    return self.dispatch_overloaded(thread, data.data.method, argc, true);
                }
                ObjKind::Closure => {
                    let closure: NonNull<ObjClosure> = unsafe { downcast(h, ObjKind::Closure) };
                    let arity = unsafe { closure.as_ref() }.data.function.as_ref().data.arity as usize;
                    if arity > argc {
                        return Ok(Some(self.as_fault(
                            thread,
                            self.recoverable_error(thread, format!("Expected {arity} arguments but got {argc}."))?,
                        )));
                    }
                    return self.call_closure(thread, closure, argc).map(|()| None);
                }
                _ => {}
            }
        }
        Ok(self.as_fault(thread, self.recoverable_error(thread, "Can only call functions.".into())?))
    }

    fn as_fault(&self, _thread: &mut Thread, unwound: Option<RuntimeFault>) -> Option<RuntimeFault> {
        unwound
    }

    fn call_closure(&self, thread: &mut Thread, closure: NonNull<ObjClosure>, argc: usize) -> Result<(), RuntimeFault> {
        if thread.frames.len() >= self.config.max_frames {
            return Err(RuntimeFault::FrameOverflow);
        }
        let namespace = thread.current_frame().namespace.clone();
        let function = unsafe { closure.as_ref() }.data.function;
        thread.frames.push(CallFrame {
            function,
            origin: FrameOrigin::Closure(closure),
            ip: 0,
            slot_base: thread.stack.len() - argc - 1,
            namespace,
        });
        Ok(())
    }

    fn call_module(&self, thread: &mut Thread, module: NonNull<ObjModule>) -> Result<(), RuntimeFault> {
        if thread.frames.len() >= self.config.max_frames {
            return Err(RuntimeFault::FrameOverflow);
        }
        let function = unsafe { module.as_ref() }.data.function;
        thread.frames.push(CallFrame {
            function,
            origin: FrameOrigin::Module(module),
            ip: 0,
            slot_base: thread.stack.len() - 1,
            namespace: self.fresh_namespace(),
        });
        Ok(())
    }

    fn call_constructor(&self, thread: &mut Thread, class: NonNull<ObjClass>, argc: usize) -> Result<Option<RuntimeFault>, RuntimeFault> {
        let instance = self.new_instance(class);
        let top = thread.stack.len();
        thread.stack[top - argc - 1] = Value::Obj(NonNull::new(ObjInstance::as_header_ptr(instance.as_ptr())).unwrap());

        let class_name = unsafe { class.as_ref() }.data.name;
        let initializer = unsafe { class.as_ref() }.data.methods.get(class_name);
        match initializer {
            Some(Value::Obj(h)) => {
                let method: NonNull<ObjOverloadedMethod> = unsafe { downcast(h, ObjKind::OverloadedMethod) };
                self.dispatch_overloaded(thread, method, argc, true)
            }
            _ => {
                if argc != 0 {
                    Ok(Some(self.as_fault(
                        thread,
                        self.recoverable_error(thread, format!("Expected 0 arguments but got {argc}."))?,
                    )))
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn dispatch_overloaded(&self, thread: &mut Thread, method: NonNull<ObjOverloadedMethod>, argc: usize, is_method: bool) -> Result<Option<RuntimeFault>, RuntimeFault> {
        let data = unsafe { method.as_ref() };
        match data.data.resolve(argc) {
            Ok((_, MethodSlot::Native(native))) => {
                let result = self.call_native(thread, native, argc, is_method);
                match result {
                    Ok(()) => Ok(None),
                    Err(msg) => Ok(Some(self.as_fault(thread, self.recoverable_error(thread, msg)?))),
                }
            }
            Ok((_, MethodSlot::User(closure))) => self.call_closure(thread, closure, argc).map(|()| None),
            Ok((_, MethodSlot::Empty)) => unreachable!("resolve() never returns an empty slot"),
            Err(OverloadError::WrongArity { expected }) => Ok(Some(self.as_fault(
                thread,
                self.recoverable_error(thread, format!("Expected {expected} arguments but got {argc}."))?,
            ))),
            Err(OverloadError::NoSlots) => Ok(Some(self.as_fault(
                thread,
                self.recoverable_error(thread, "No matching overload for this call.".into())?,
            ))),
        }
    }

    fn call_native(&self, thread: &mut Thread, native: NonNull<ObjNativeFn>, argc: usize, is_method: bool) -> Result<(), String> {
        let data = unsafe { native.as_ref() };
        let skip = if is_method { 1 } else { 0 };
        let first_arg = thread.stack.len() - argc - skip;
        let args_ptr = thread.stack[first_arg..].as_ptr();
        let mut ctx = crate::natives::NativeCtx { vm: self, thread };
        let result = (data.data.function)((&mut ctx) as *mut crate::natives::NativeCtx as *mut (), argc + skip, args_ptr);
        match result {
            Ok(value) => {
                thread.stack.truncate(first_arg);
                thread.push(value);
                Ok(())
            }
            Err(Value::Obj(h)) if unsafe { h.as_ref() }.kind == ObjKind::String => {
                let s: NonNull<ObjString> = unsafe { downcast(h, ObjKind::String) };
                thread.stack.truncate(first_arg);
                Err(unsafe { s.as_ref() }.as_str().to_string())
            }
            Err(_) => {
                thread.stack.truncate(first_arg);
                Err("native function error".to_string())
            }
        }
    }

    /// Re-enters the interpreter to run a Simpl-level callable from inside a
    /// native function (e.g. `Array.map`'s callback, spec.md §8 scenario
    /// S6). The original achieves this for granted because its "core
    /// extension" is itself bytecode sharing the interpreter's one call
    /// stack (SPEC_FULL.md §3); reimplementing `map` as a genuine Rust
    /// native instead means a fresh, nested call to `run` standing in for
    /// that shared stack.
    ///
    /// Natives therefore form their own catch boundary: while the callback
    /// runs, every try/catch record established *before* this call is
    /// hidden from `unwind_to_catch`, so an uncaught throw inside the
    /// callback can only be caught by a `try`/`catch` that is itself inside
    /// the callback's own call chain, never by one lexically wrapping the
    /// native call site. A fully re-entrant exception model would need the
    /// nested `run` to stop mid-unwind exactly at this boundary, which the
    /// single `base_frame_count`-driven loop has no way to do safely; this
    /// is a deliberate, narrower semantics documented in DESIGN.md rather
    /// than attempting that.
    pub(crate) fn call_callback(&self, thread: &mut Thread, callee: Value, args: &[Value]) -> Result<Value, String> {
        let hidden_try_catches: Vec<TryCatchRecord> = thread.try_catch_stack.drain(..).collect();
        let frames_before = thread.frames.len();

        thread.push(callee);
        for &arg in args {
            thread.push(arg);
        }
        let argc = args.len();

        let outcome = (|| -> Result<Value, RuntimeFault> {
            if let Some(fault) = self.call_value(thread, callee, argc)? {
                return Err(fault);
            }
            if thread.frames.len() == frames_before {
                return Ok(thread.pop());
            }
            self.run(thread)
        })();

        thread.try_catch_stack.extend(hidden_try_catches);

        outcome.map_err(|fault| match fault {
            RuntimeFault::UncaughtException { message, .. } => message,
            other => other.to_string(),
        })
    }

    fn invoke(&self, thread: &mut Thread, base: Value, name: NonNull<ObjString>, argc: usize) -> Result<Option<RuntimeFault>, RuntimeFault> {
        if let Value::Obj(h) = base {
            if unsafe { h.as_ref() }.kind == ObjKind::Instance {
                let inst: NonNull<ObjInstance> = unsafe { downcast(h, ObjKind::Instance) };
                if let Some(value) = unsafe { inst.as_ref() }.data.properties.get(name) {
                    return self.call_value(thread, value, argc);
                }
            }
        }
        match self.get_property(base, name) {
            Some(value) => self.call_value(thread, value, argc),
            None => Ok(Some(self.as_fault(
                thread,
                self.recoverable_error(thread, format!("Undefined property '{}'.", unsafe { name.as_ref() }.as_str()))?,
            ))),
        }
    }

    // -- property / item access -------------------------------------------

    fn get_property(&self, base: Value, name: NonNull<ObjString>) -> Option<Value> {
        if let Value::Obj(h) = base {
            if unsafe { h.as_ref() }.kind == ObjKind::Instance {
                let inst: NonNull<ObjInstance> = unsafe { downcast(h, ObjKind::Instance) };
                if let Some(v) = unsafe { inst.as_ref() }.data.properties.get(name) {
                    return Some(v);
                }
            }
        }
        self.object_class_property(base, name)
    }

    /// Mirrors `objectClassProperty` in the source: resolves `base`'s class
    /// (by header for heap objects, by the VM's fixed primitive classes
    /// otherwise) and binds an overloaded method to `base` if found.
    fn object_class_property(&self, base: Value, name: NonNull<ObjString>) -> Option<Value> {
        let class = match base {
            Value::Obj(h) => unsafe { h.as_ref() }.class.get()?,
            Value::Number(_) => self.builtins.number_class,
            Value::Bool(_) => self.builtins.bool_class,
            Value::Nil => self.builtins.nil_class,
        };
        let property = unsafe { class.as_ref() }.data.methods.get(name)?;
        self.bind_if_overloaded(base, property)
    }

    fn class_bound_method(&self, base: Value, klass: NonNull<ObjClass>, name: NonNull<ObjString>) -> Option<Value> {
        let property = unsafe { klass.as_ref() }.data.methods.get(name)?;
        self.bind_if_overloaded(base, property)
    }

    fn bind_if_overloaded(&self, base: Value, property: Value) -> Option<Value> {
        if let Value::Obj(h) = property {
            if unsafe { h.as_ref() }.kind == ObjKind::OverloadedMethod {
                let method: NonNull<ObjOverloadedMethod> = unsafe { downcast(h, ObjKind::OverloadedMethod) };
                let bound = {
                    let mut heap = self.heap.lock().unwrap();
                    heap.alloc(ObjKind::BoundOverloadedMethod, BoundOverloadedMethodData { base, method })
                };
                return Some(Value::Obj(NonNull::new(ObjBoundOverloadedMethod::as_header_ptr(bound.as_ptr())).unwrap()));
            }
        }
        Some(property)
    }

    fn get_item(&self, base: Value, index: Value) -> Result<Value, String> {
        let Value::Obj(h) = base else {
            return Err("Cannot access property.".to_string());
        };
        if unsafe { h.as_ref() }.kind != ObjKind::Array {
            return Err("Cannot access property.".to_string());
        }
        let arr: NonNull<ObjArray> = unsafe { downcast(h, ObjKind::Array) };
        let Value::Number(i) = index else {
            return Err("Array index must be a number.".to_string());
        };
        let items = &unsafe { arr.as_ref() }.data.items;
        if i < 0.0 || i as usize >= items.len() {
            return Ok(Value::Nil);
        }
        Ok(items[i as usize])
    }

    fn set_item(&self, base: Value, index: Value, value: Value) -> Result<(), String> {
        let Value::Obj(h) = base else {
            return Err("Cannot access property".to_string());
        };
        if unsafe { h.as_ref() }.kind != ObjKind::Array {
            return Err("Cannot access property".to_string());
        }
        let arr: NonNull<ObjArray> = unsafe { downcast(h, ObjKind::Array) };
        let Value::Number(i) = index else {
            return Err("Array index must be a number.".to_string());
        };
        let items = &mut unsafe { &mut (*arr.as_ptr()).data }.items;
        if i < 0.0 || i as usize >= items.len() {
            return Err("Array index out of bounds.".to_string());
        }
        items[i as usize] = value;
        Ok(())
    }

    // -- classes ------------------------------------------------------------

    pub(crate) fn new_instance(&self, class: NonNull<ObjClass>) -> NonNull<ObjInstance> {
        let instance = {
            let mut heap = self.heap.lock().unwrap();
            heap.alloc_instance(InstanceData { properties: Table::new() })
        };
        self.tag(instance.cast(), class);
        instance
    }

    /// Deep-copies arity slots into fresh `OverloadedMethod`s so a subclass
    /// can override one arity without mutating the superclass's table
    /// (spec.md §4.6).
    fn inherit_methods(&self, superclass: NonNull<ObjClass>, subclass: NonNull<ObjClass>) {
        let mut heap = self.heap.lock().unwrap();
        let pairs: Vec<_> = unsafe { superclass.as_ref() }.data.methods.iter().collect();
        for (name, value) in pairs {
            if let Value::Obj(h) = value {
                if unsafe { h.as_ref() }.kind == ObjKind::OverloadedMethod {
                    let src: NonNull<ObjOverloadedMethod> = unsafe { downcast(h, ObjKind::OverloadedMethod) };
                    let src_data = unsafe { src.as_ref() };
                    let mut copy = OverloadedMethodData::new(src_data.data.name, src_data.data.kind);
                    copy.slots = src_data.data.slots;
                    let copy = heap.alloc_overloaded_method(copy);
                    unsafe { &mut (*subclass.as_ptr()).data }
                        .methods
                        .set(name, Value::Obj(NonNull::new(ObjOverloadedMethod::as_header_ptr(copy.as_ptr())).unwrap()));
                    continue;
                }
            }
            unsafe { &mut (*subclass.as_ptr()).data }.methods.set(name, value);
        }
    }

    fn define_method(&self, thread: &mut Thread, name: NonNull<ObjString>) {
        let method_value = thread.peek(0);
        let Value::Obj(ch) = thread.peek(1) else { unreachable!() };
        let class: NonNull<ObjClass> = unsafe { downcast(ch, ObjKind::Class) };
        let Value::Obj(mh) = method_value else { unreachable!() };
        let closure: NonNull<ObjClosure> = unsafe { downcast(mh, ObjKind::Closure) };
        let arity = unsafe { closure.as_ref() }.data.function.as_ref().data.arity as usize;

        let existing = unsafe { class.as_ref() }.data.methods.get(name);
        if let Some(Value::Obj(eh)) = existing {
            if unsafe { eh.as_ref() }.kind == ObjKind::OverloadedMethod {
                let om: NonNull<ObjOverloadedMethod> = unsafe { downcast(eh, ObjKind::OverloadedMethod) };
                if unsafe { om.as_ref() }.data.kind == MethodKind::User {
                    unsafe { (*om.as_ptr()).data.slots[arity] = MethodSlot::User(closure) };
                    thread.pop();
                    return;
                }
            }
        }

        let mut data = OverloadedMethodData::new(name, MethodKind::User);
        data.slots[arity] = MethodSlot::User(closure);
        let om = {
            let mut heap = self.heap.lock().unwrap();
            heap.alloc_overloaded_method(data)
        };
        unsafe { &mut (*class.as_ptr()).data }
            .methods
            .set(name, Value::Obj(NonNull::new(ObjOverloadedMethod::as_header_ptr(om.as_ptr())).unwrap()));
        thread.pop();
    }

    pub(crate) fn tag<T>(&self, header: NonNull<GcHeader>, class: NonNull<ObjClass>) {
        unsafe { header.as_ref() }.class.set(Some(class));
        let _ = std::marker::PhantomData::<T>;
    }

    pub(crate) fn intern_tagged(&self, s: &str) -> NonNull<ObjString> {
        let interned = {
            let mut heap = self.heap.lock().unwrap();
            heap.intern(s)
        };
        self.tag(interned.cast(), self.builtins.string_class);
        interned
    }

    // -- loop / try-catch bookkeeping -------------------------------------

    fn pop_enclosed_try_catches(&self, thread: &mut Thread, loop_rec: &LoopRecord) {
        while let Some(top) = thread.try_catch_stack.last() {
            if top.frame_index == loop_rec.frame_index
                && top.out_ip > loop_rec.start_ip
                && top.out_ip < loop_rec.out_ip
            {
                thread.try_catch_stack.pop();
            } else {
                break;
            }
        }
    }

    /// Convenience wrapper: build an `Error` instance from a native-style
    /// message and run it through the normal unwind path. Returns `Ok(None)`
    /// when a catch handler absorbed it and execution should keep going.
    fn recoverable_error(&self, thread: &mut Thread, message: String) -> Result<Option<RuntimeFault>, RuntimeFault> {
        let value = self.make_error_value(thread, message);
        self.unwind_to_catch(thread, value)
    }

    fn make_error_value(&self, thread: &mut Thread, message: String) -> Value {
        let instance = self.new_instance(self.builtins.error_class);
        let msg = self.intern_tagged(&message);
        let stack = self.intern_tagged(&self.stack_trace(thread));
        let data = unsafe { &mut (*instance.as_ptr()).data };
        // `message`/`stack` keys themselves must be the canonical interned
        // strings regardless of the value they map to.
        let message_key = self.intern_tagged("message");
        let stack_key = self.intern_tagged("stack");
        data.properties.set(message_key, Value::Obj(NonNull::new(ObjString::as_header_ptr(msg.as_ptr())).unwrap()));
        data.properties.set(stack_key, Value::Obj(NonNull::new(ObjString::as_header_ptr(stack.as_ptr())).unwrap()));
        Value::Obj(NonNull::new(ObjInstance::as_header_ptr(instance.as_ptr())).unwrap())
    }

    /// Implements `OP_THROW` and every recoverable-error call site (spec.md
    /// §4.4 "Exceptions"). Returns `Ok(Some(fault))` only when no
    /// `TryCatch` is pending anywhere on the thread.
    fn unwind_to_catch(&self, thread: &mut Thread, value: Value) -> Result<Option<RuntimeFault>, RuntimeFault> {
        if thread.try_catch_stack.is_empty() {
            let (message, trace) = self.describe_uncaught(thread, value);
            return Ok(Some(RuntimeFault::UncaughtException { message, stack_trace: trace }));
        }

        let record = thread.try_catch_stack.pop().unwrap();

        while thread.current_frame_index() != record.frame_index {
            let idx = thread.current_frame_index();
            thread.loop_stack.retain(|l| l.frame_index != idx);
            thread.frames.pop();
        }

        thread.loop_stack.retain(|l| {
            !(l.frame_index == record.frame_index && l.out_ip > record.start_ip && l.out_ip < record.out_ip)
        });

        thread.stack.truncate(record.stack_top);
        thread.current_frame_mut().ip = record.catch_ip;

        if record.has_catch_param {
            let wrapped = self.ensure_error_instance(thread, value);
            thread.push(wrapped);
        }

        self.close_upvalues(thread, record.stack_top.saturating_sub(1));
        Ok(None)
    }

    fn ensure_error_instance(&self, thread: &mut Thread, value: Value) -> Value {
        if let Value::Obj(h) = value {
            if unsafe { h.as_ref() }.class.get() == Some(self.builtins.error_class) {
                return value;
            }
        }
        self.make_error_value(thread, self.stringify(value))
    }

    fn describe_uncaught(&self, thread: &mut Thread, value: Value) -> (String, String) {
        if let Value::Obj(h) = value {
            if unsafe { h.as_ref() }.class.get() == Some(self.builtins.error_class) {
                let inst: NonNull<ObjInstance> = unsafe { downcast(h, ObjKind::Instance) };
                let message_key = self.intern_tagged("message");
                let stack_key = self.intern_tagged("stack");
                let message = unsafe { inst.as_ref() }.data.properties.get(message_key).map(|v| self.stringify(v));
                let stack = unsafe { inst.as_ref() }.data.properties.get(stack_key).map(|v| self.stringify(v));
                return (
                    message.unwrap_or_default(),
                    stack.unwrap_or_else(|| self.stack_trace(thread)),
                );
            }
        }
        (self.stringify(value), self.stack_trace(thread))
    }

    /// Innermost-first, per spec.md §7 "the stack trace lists frames from
    /// innermost outward".
    pub(crate) fn stack_trace(&self, thread: &Thread) -> String {
        let mut frames = Vec::new();
        for frame in thread.frames.iter().rev() {
            let function = unsafe { frame.function.as_ref() };
            let line = function.data.chunk.line_at(frame.ip.saturating_sub(1));
            let label = match frame.origin {
                FrameOrigin::Script => "script".to_string(),
                FrameOrigin::Module(m) => format!("file {}", unsafe { m.as_ref() }.data.path.display()),
                FrameOrigin::Closure(_) => match function.data.kind {
                    FunctionKind::Lambda => "lambda function".to_string(),
                    _ => function
                        .data
                        .name
                        .map(|n| unsafe { n.as_ref() }.as_str().to_string())
                        .unwrap_or_else(|| "anonymous function".to_string()),
                },
            };
            frames.push(TraceFrame { line, label });
        }
        format_stack_trace(&frames)
    }

    /// String conversion used by `print`, string interpolation, `+`
    /// concatenation and uncaught-exception formatting.
    pub fn stringify(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(n),
            Value::Obj(h) => match unsafe { h.as_ref() }.kind {
                ObjKind::String => {
                    let s: NonNull<ObjString> = unsafe { downcast(h, ObjKind::String) };
                    unsafe { s.as_ref() }.as_str().to_string()
                }
                ObjKind::Array => {
                    let a: NonNull<ObjArray> = unsafe { downcast(h, ObjKind::Array) };
                    let items = &unsafe { a.as_ref() }.data.items;
                    let parts: Vec<_> = items.iter().map(|v| self.stringify(*v)).collect();
                    format!("[{}]", parts.join(", "))
                }
                ObjKind::Class => {
                    let c: NonNull<ObjClass> = unsafe { downcast(h, ObjKind::Class) };
                    unsafe { c.as_ref() }.data.name.as_ref().as_str().to_string()
                }
                ObjKind::Instance => {
                    let i: NonNull<ObjInstance> = unsafe { downcast(h, ObjKind::Instance) };
                    let class_name = unsafe { i.as_ref() }
                        .header
                        .class
                        .get()
                        .map(|c| unsafe { c.as_ref() }.data.name.as_ref().as_str().to_string())
                        .unwrap_or_else(|| "Object".to_string());
                    format!("<{class_name} instance>")
                }
                ObjKind::Closure => "<fn>".to_string(),
                ObjKind::Module => "<module>".to_string(),
                _ => "<object>".to_string(),
            },
        }
    }
}

/// Numbers print without a trailing `.0` for integral values, matching the
/// teacher-adjacent convention used across the example pack for
/// user-facing numeric formatting.
fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

impl LoopRecord {
    fn clone_fields(&self) -> LoopRecord {
        LoopRecord {
            frame_index: self.frame_index,
            stack_top: self.stack_top,
            start_ip: self.start_ip,
            out_ip: self.out_ip,
        }
    }
}

#[derive(Debug)]
pub enum InterpretError {
    Compile(simpl_compiler::CompileErrors),
    Runtime(RuntimeFault),
}

impl std::fmt::Display for InterpretError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterpretError::Compile(e) => write!(f, "{e}"),
            InterpretError::Runtime(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for InterpretError {}
