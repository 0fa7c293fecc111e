//! Allocation, string interning and the tracing mark-sweep collector.
//!
//! `Heap` owns every object's memory and the singly linked allocation list
//! that the sweep phase walks (spec.md §3 Lifecycle, §4.5). It knows nothing
//! about call frames, thread stacks or the compiler's in-progress functions:
//! those roots live in `simpl-compiler`/`simpl-runtime`, so `collect` takes a
//! caller-supplied closure that marks them through a [`Tracer`]. This keeps
//! the dependency arrow pointing one way, core never needs to know about the
//! crates built on top of it.

use std::alloc::{Layout, alloc, dealloc};
use std::ptr::NonNull;

use crate::object::{
    ArrayData, ClassData, ClosureData, FunctionData, GcHeader, GcObject, InstanceData, ModuleData,
    ObjArray, ObjClass, ObjClosure, ObjFunction, ObjInstance, ObjKind, ObjModule,
    ObjOverloadedMethod, ObjString, ObjUpValue, OverloadedMethodData, StringData, UpValueData,
    UpValueLocation, fnv1a_hash,
};
use crate::table::Table;
use crate::value::Value;

const WHITE_LIST_MAX: usize = 16;
const GC_GROWTH_FACTOR: usize = 2;
const DEFAULT_GC_THRESHOLD: usize = 1024 * 1024;

pub struct Heap {
    head: Option<NonNull<GcHeader>>,
    pub bytes_allocated: usize,
    pub gc_threshold: usize,
    pub strings: Table,
    assembly_line_floor: Option<NonNull<GcHeader>>,
    white_list: Vec<NonNull<GcHeader>>,
    /// Set once the VM starts allocating during collection itself; lets
    /// `alloc` skip the recursive collection-triggers-collection case.
    pub gc_paused: bool,
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            head: None,
            bytes_allocated: 0,
            gc_threshold: DEFAULT_GC_THRESHOLD,
            strings: Table::new(),
            assembly_line_floor: None,
            white_list: Vec::new(),
            gc_paused: false,
        }
    }

    pub fn should_collect(&self) -> bool {
        !self.gc_paused && self.bytes_allocated >= self.gc_threshold
    }

    fn link(&mut self, header: NonNull<GcHeader>) {
        unsafe { header.as_ref() }.next.set(self.head);
        self.head = Some(header);
    }

    /// Allocate a new heap object and link it into the allocation list. Does
    /// not itself trigger collection: callers check `should_collect` and run
    /// `collect` before calling this, per the `reallocate` contract in
    /// spec.md §3/§4.5.
    pub fn alloc<T>(&mut self, kind: ObjKind, data: T) -> NonNull<GcObject<T>> {
        let layout = Layout::new::<GcObject<T>>();
        let ptr = unsafe { alloc(layout) } as *mut GcObject<T>;
        let ptr = NonNull::new(ptr).expect("allocation failure");
        unsafe { ptr.as_ptr().write(GcObject::new(kind, data)) };
        self.bytes_allocated += layout.size();
        let header_ptr = NonNull::new(GcObject::<T>::as_header_ptr(ptr.as_ptr())).unwrap();
        self.link(header_ptr);
        ptr
    }

    /// Intern a string, reusing an existing live string with equal bytes.
    pub fn intern(&mut self, bytes: &str) -> NonNull<ObjString> {
        let hash = fnv1a_hash(bytes.as_bytes());
        if let Some(existing) = self.strings.find_string(bytes, hash) {
            return existing;
        }
        let obj = self.alloc(
            ObjKind::String,
            StringData {
                chars: bytes.into(),
                hash,
            },
        );
        self.strings.set(obj, Value::Nil);
        obj
    }

    pub fn alloc_function(&mut self, data: FunctionData) -> NonNull<ObjFunction> {
        self.alloc(ObjKind::Function, data)
    }

    pub fn alloc_closure(&mut self, data: ClosureData) -> NonNull<ObjClosure> {
        self.alloc(ObjKind::Closure, data)
    }

    pub fn alloc_upvalue(&mut self, location: UpValueLocation) -> NonNull<ObjUpValue> {
        self.alloc(
            ObjKind::UpValue,
            UpValueData {
                location,
                next: None,
            },
        )
    }

    pub fn alloc_class(&mut self, data: ClassData) -> NonNull<ObjClass> {
        self.alloc(ObjKind::Class, data)
    }

    pub fn alloc_instance(&mut self, data: InstanceData) -> NonNull<ObjInstance> {
        self.alloc(ObjKind::Instance, data)
    }

    pub fn alloc_array(&mut self, items: Vec<Value>) -> NonNull<ObjArray> {
        self.alloc(ObjKind::Array, ArrayData { items })
    }

    pub fn alloc_module(&mut self, data: ModuleData) -> NonNull<ObjModule> {
        self.alloc(ObjKind::Module, data)
    }

    pub fn alloc_overloaded_method(
        &mut self,
        data: OverloadedMethodData,
    ) -> NonNull<ObjOverloadedMethod> {
        self.alloc(ObjKind::OverloadedMethod, data)
    }

    // -- assembly line / white list -------------------------------------

    /// Protect every object allocated from this point forward until
    /// `end_assembly_line` (spec.md §4.5), for building an object graph
    /// whose intermediate nodes aren't yet reachable from any root.
    pub fn begin_assembly_line(&mut self) {
        self.assembly_line_floor = self.head;
    }

    pub fn end_assembly_line(&mut self) {
        self.assembly_line_floor = None;
    }

    /// Pin a single object against collection until popped. Bounded at 16
    /// entries, matching `GCWhiteList`/`GCPopWhiteList` in the original.
    pub fn push_white(&mut self, header: NonNull<GcHeader>) {
        assert!(
            self.white_list.len() < WHITE_LIST_MAX,
            "GC white-list overflow"
        );
        self.white_list.push(header);
    }

    pub fn pop_white(&mut self) {
        self.white_list.pop();
    }

    // -- collection -------------------------------------------------------

    /// Run one stop-the-world mark-sweep cycle. `mark_extra_roots` is called
    /// once with a [`Tracer`] so callers outside this crate (the VM's thread
    /// stacks, the compiler's in-progress functions) can mark their own
    /// roots without this crate needing to know their types.
    pub fn collect(&mut self, mark_extra_roots: impl FnOnce(&mut Tracer)) {
        let mut tracer = Tracer { gray: Vec::new() };

        // The intern table itself is never a root (spec.md §4.6's weak
        // semantics): a string survives only if something outside `strings`
        // still marks it.
        if let Some(floor) = self.assembly_line_floor {
            let mut cursor = self.head;
            while let Some(obj) = cursor {
                tracer.mark_object(obj);
                if obj == floor {
                    break;
                }
                cursor = unsafe { obj.as_ref() }.next.get();
            }
        }
        for &pinned in &self.white_list {
            tracer.mark_object(pinned);
        }

        mark_extra_roots(&mut tracer);

        while let Some(obj) = tracer.gray.pop() {
            blacken(obj, &mut tracer);
        }

        // Drop the intern table's entries for any now-unmarked string before
        // sweeping frees the underlying objects, so the table never holds a
        // dangling pointer (spec.md §4.5 "Sweep").
        self.strings.remove_unmarked_keys();
        self.sweep();
        self.gc_threshold = self.bytes_allocated.max(DEFAULT_GC_THRESHOLD) * GC_GROWTH_FACTOR;
    }

    fn sweep(&mut self) {
        let mut prev: Option<NonNull<GcHeader>> = None;
        let mut cursor = self.head;
        while let Some(obj) = cursor {
            let header = unsafe { obj.as_ref() };
            let next = header.next.get();
            if header.is_marked.get() {
                header.is_marked.set(false);
                prev = Some(obj);
            } else {
                match prev {
                    Some(p) => unsafe { p.as_ref() }.next.set(next),
                    None => self.head = next,
                }
                unsafe { free_object(obj) };
            }
            cursor = next;
        }
    }
}

/// Worklist for the mark phase. Exposed so `simpl-compiler`/`simpl-runtime`
/// can mark their own roots from inside the `collect` callback.
pub struct Tracer {
    gray: Vec<NonNull<GcHeader>>,
}

impl Tracer {
    pub fn mark_value(&mut self, value: Value) {
        if let Some(header) = value.header() {
            self.mark_object(header);
        }
    }

    pub fn mark_object(&mut self, header: NonNull<GcHeader>) {
        let h = unsafe { header.as_ref() };
        if h.is_marked.replace(true) {
            return;
        }
        self.gray.push(header);
    }
}

fn blacken(header: NonNull<GcHeader>, tracer: &mut Tracer) {
    let h = unsafe { header.as_ref() };
    if let Some(class) = h.class.get() {
        tracer.mark_object(class.cast());
    }
    match h.kind {
        ObjKind::String | ObjKind::NativeFn => {}
        ObjKind::Function => {
            let f: NonNull<ObjFunction> = header.cast();
            let f = unsafe { f.as_ref() };
            if let Some(name) = f.data.name {
                tracer.mark_object(name.cast());
            }
            for c in &f.data.chunk.constants {
                tracer.mark_value(*c);
            }
        }
        ObjKind::Closure => {
            let c: NonNull<ObjClosure> = header.cast();
            let c = unsafe { c.as_ref() };
            tracer.mark_object(c.data.function.cast());
            for uv in &c.data.upvalues {
                tracer.mark_object(uv.cast());
            }
        }
        ObjKind::UpValue => {
            let u: NonNull<ObjUpValue> = header.cast();
            let u = unsafe { u.as_ref() };
            if let UpValueLocation::Closed(v) = u.data.location {
                tracer.mark_value(v);
            }
        }
        ObjKind::OverloadedMethod => {
            let m: NonNull<ObjOverloadedMethod> = header.cast();
            let m = unsafe { m.as_ref() };
            tracer.mark_object(m.data.name.cast());
            for slot in &m.data.slots {
                match slot {
                    crate::object::MethodSlot::User(c) => tracer.mark_object(c.cast()),
                    crate::object::MethodSlot::Native(n) => tracer.mark_object(n.cast()),
                    crate::object::MethodSlot::Empty => {}
                }
            }
        }
        ObjKind::BoundOverloadedMethod => {
            let b: NonNull<crate::object::ObjBoundOverloadedMethod> = header.cast();
            let b = unsafe { b.as_ref() };
            tracer.mark_value(b.data.base);
            tracer.mark_object(b.data.method.cast());
        }
        ObjKind::Class => {
            let c: NonNull<ObjClass> = header.cast();
            let c = unsafe { c.as_ref() };
            tracer.mark_object(c.data.name.cast());
            for (k, v) in c.data.methods.iter() {
                tracer.mark_object(k.cast());
                tracer.mark_value(v);
            }
            if let Some(sup) = c.data.superclass {
                tracer.mark_object(sup.cast());
            }
        }
        ObjKind::Instance => {
            let i: NonNull<ObjInstance> = header.cast();
            let i = unsafe { i.as_ref() };
            for (k, v) in i.data.properties.iter() {
                tracer.mark_object(k.cast());
                tracer.mark_value(v);
            }
        }
        ObjKind::Array => {
            let a: NonNull<ObjArray> = header.cast();
            let a = unsafe { a.as_ref() };
            for v in &a.data.items {
                tracer.mark_value(*v);
            }
        }
        ObjKind::Module => {
            let m: NonNull<ObjModule> = header.cast();
            let m = unsafe { m.as_ref() };
            tracer.mark_object(m.data.function.cast());
            for (k, v) in m.data.exports.iter() {
                tracer.mark_object(k.cast());
                tracer.mark_value(v);
            }
        }
    }
}

/// # Safety
/// `header` must be the last reference to this object; nothing may read or
/// write through it afterward.
unsafe fn free_object(header: NonNull<GcHeader>) {
    let kind = unsafe { header.as_ref() }.kind;
    macro_rules! drop_as {
        ($ty:ty) => {{
            let typed: NonNull<$ty> = header.cast();
            unsafe {
                std::ptr::drop_in_place(typed.as_ptr());
                dealloc(typed.as_ptr().cast(), Layout::new::<$ty>());
            }
        }};
    }
    match kind {
        ObjKind::String => drop_as!(ObjString),
        ObjKind::Function => drop_as!(ObjFunction),
        ObjKind::Closure => drop_as!(ObjClosure),
        ObjKind::UpValue => drop_as!(ObjUpValue),
        ObjKind::NativeFn => drop_as!(crate::object::ObjNativeFn),
        ObjKind::OverloadedMethod => drop_as!(ObjOverloadedMethod),
        ObjKind::BoundOverloadedMethod => drop_as!(crate::object::ObjBoundOverloadedMethod),
        ObjKind::Class => drop_as!(ObjClass),
        ObjKind::Instance => drop_as!(ObjInstance),
        ObjKind::Array => drop_as!(ObjArray),
        ObjKind::Module => drop_as!(ObjModule),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_returns_same_pointer_for_equal_bytes() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        assert_eq!(a, b);
    }

    #[test]
    fn unreferenced_string_is_collected_and_unlinked_from_intern_table() {
        let mut heap = Heap::new();
        heap.intern("temporary");
        // No root marks it: a collection with no extra roots sweeps it away.
        heap.collect(|_| {});
        assert!(
            heap.strings
                .find_string("temporary", fnv1a_hash(b"temporary"))
                .is_none()
        );
    }

    #[test]
    fn marked_object_survives_collection() {
        let mut heap = Heap::new();
        let s = heap.intern("kept");
        heap.collect(|tracer| tracer.mark_object(s.cast()));
        assert!(!unsafe { s.as_ref() }.header.is_marked.get()); // cleared after sweep
        assert!(heap.strings.find_string("kept", fnv1a_hash(b"kept")).is_some());
    }
}
