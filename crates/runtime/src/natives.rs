//! Core class installer (spec.md §6), grounded line-by-line on
//! `examples/original_source/src/core.c`'s `initCore`/`attachCore` and
//! `examples/original_source/lib/array.c`.
//!
//! Every value has a *class* used for method dispatch, stored in its
//! `GcHeader::class`. The original's `inherit()` does double duty and we
//! keep both halves: it sets an object's dispatch class, and if the object
//! is itself a class it additionally flattens the metaclass's methods
//! into the class's own table. A built-in class's instances are tagged
//! with that class directly (e.g. every string is tagged `string_class`);
//! the class *object itself* (the `String` identifier's value) is tagged
//! with its metaclass (`meta_string_class`), which is where `String.new`,
//! `String.isString` and friends are actually installed. User classes
//! declared with `class Foo {}` skip metaclasses entirely and are tagged
//! with the plain `class_class` (spec.md §4.4), which is why `Foo` only
//! ever responds to `toString`.
//!
//! `Array.map` has no counterpart in `core.c` (the original's array
//! higher-order helpers live in bytecode, not as natives) but spec.md §8
//! scenario S6 needs it; it is grounded on `Vm::call_callback`'s re-entrant
//! callback mechanism instead.

use std::ptr::NonNull;
use std::sync::OnceLock;
use std::time::Instant;

use simpl_core::heap::{Heap, Tracer};
use simpl_core::object::{
    ClassData, GcHeader, GcObject, MethodKind, MethodSlot, NativeFn, NativeFnData, ObjArray,
    ObjClass, ObjClosure, ObjInstance, ObjKind, ObjOverloadedMethod, ObjString,
    OverloadedMethodData, downcast,
};
use simpl_core::table::Table;
use simpl_core::value::Value;

use crate::thread::Thread;
use crate::vm::Vm;

/// The type-erased pointer a [`simpl_core::object::NativeFn`] receives is
/// always really a `*mut NativeCtx`; `Vm::call_native` builds one per call.
pub struct NativeCtx<'a> {
    pub vm: &'a Vm,
    pub thread: &'a mut Thread,
}

/// Every built-in class, pinned here so the collector never sweeps them
/// (see `mark`) and so `Vm` can tag values and resolve dispatch classes
/// without reaching back into this module's installation order.
pub struct BuiltinClasses {
    pub class_class: NonNull<ObjClass>,
    pub meta_string_class: NonNull<ObjClass>,
    pub string_class: NonNull<ObjClass>,
    pub nil_class: NonNull<ObjClass>,
    pub bool_class: NonNull<ObjClass>,
    pub meta_number_class: NonNull<ObjClass>,
    pub number_class: NonNull<ObjClass>,
    pub meta_math_class: NonNull<ObjClass>,
    pub math_class: NonNull<ObjClass>,
    pub meta_array_class: NonNull<ObjClass>,
    pub array_class: NonNull<ObjClass>,
    pub meta_error_class: NonNull<ObjClass>,
    pub error_class: NonNull<ObjClass>,
    pub module_exports_class: NonNull<ObjClass>,
    pub meta_object_class: NonNull<ObjClass>,
    pub object_class: NonNull<ObjClass>,
    pub meta_system_class: NonNull<ObjClass>,
    pub system_class: NonNull<ObjClass>,
}

// SAFETY: these pointers are allocated once at startup and never freed
// while the VM lives; sharing the handle across threads is the same
// invariant `Value`'s `Send`/`Sync` impls rely on (simpl_core::value).
unsafe impl Send for BuiltinClasses {}
unsafe impl Sync for BuiltinClasses {}

impl BuiltinClasses {
    pub fn mark(&self, tracer: &mut Tracer) {
        let classes = [
            self.class_class,
            self.meta_string_class,
            self.string_class,
            self.nil_class,
            self.bool_class,
            self.meta_number_class,
            self.number_class,
            self.meta_math_class,
            self.math_class,
            self.meta_array_class,
            self.array_class,
            self.meta_error_class,
            self.error_class,
            self.module_exports_class,
            self.meta_object_class,
            self.object_class,
            self.meta_system_class,
            self.system_class,
        ];
        for class in classes {
            tracer.mark_object(class.cast());
        }
    }
}

// ---------------------------------------------------------------------
// index helpers (core.c's SAFE_INDEX family)
// ---------------------------------------------------------------------

/// Clamp into `[0, len)`, wrapping negative indices from the end.
fn safe_index(idx: i64, len: i64) -> i64 {
    if idx >= len {
        len - 1
    } else if idx >= 0 {
        idx
    } else if -idx < len {
        len + idx
    } else {
        0
    }
}

/// Clamp into `[0, len]` (the end-exclusive variant `slice`/`substr` use
/// for their upper bound).
fn safe_index_inclusive(idx: i64, len: i64) -> i64 {
    if idx > len {
        len
    } else if idx >= 0 {
        idx
    } else if -idx < len {
        len + idx + 1
    } else {
        0
    }
}

/// Clamp into `[0, len]`, treating an out-of-range negative index as `0`.
fn safe_negative_circular_index(idx: i64, len: i64) -> i64 {
    if idx >= 0 {
        idx
    } else if -idx <= len {
        len + idx
    } else {
        0
    }
}

/// Like `safe_negative_circular_index`, but an index past the array in
/// either direction is left uncapped (`remove`'s start position, which is
/// then bounds-checked by the caller rather than silently clamped).
fn uncapped_negative_circular_index(idx: i64, len: i64) -> i64 {
    if idx >= 0 {
        idx
    } else if -idx <= len {
        len + idx
    } else {
        i64::MAX
    }
}

// ---------------------------------------------------------------------
// class-building helpers
// ---------------------------------------------------------------------

fn obj_value<T>(ptr: NonNull<GcObject<T>>) -> Value {
    Value::Obj(NonNull::new(GcObject::as_header_ptr(ptr.as_ptr())).unwrap())
}

fn new_class(heap: &mut Heap, name: &str) -> NonNull<ObjClass> {
    let key = heap.intern(name);
    heap.alloc_class(ClassData {
        name: key,
        methods: Table::new(),
        superclass: None,
    })
}

/// Tags `class` with `metaclass` for dispatch, and (since `class` is
/// itself a class) flattens `metaclass`'s already-installed methods into
/// `class`'s own table, so e.g. `String.new(...)` resolves the same way
/// whether `String` is treated as a value of `MetaString` or queried
/// through its own method table.
fn inherit(class: NonNull<ObjClass>, metaclass: NonNull<ObjClass>) {
    unsafe { class.as_ref() }.header.class.set(Some(metaclass));
    let pairs: Vec<_> = unsafe { metaclass.as_ref() }.data.methods.iter().collect();
    for (name, value) in pairs {
        unsafe { &mut (*class.as_ptr()).data }.methods.set(name, value);
    }
}

/// Registers `function` under `name` at arity slot `arity`, creating or
/// extending the `OverloadedMethod` that name maps to (spec.md §4.4).
fn define_native(heap: &mut Heap, class: NonNull<ObjClass>, name: &str, arity: usize, function: NativeFn) {
    let key = heap.intern(name);
    let native = heap.alloc(
        ObjKind::NativeFn,
        NativeFnData {
            name: key,
            arity: arity as u8,
            function,
        },
    );

    let methods = &mut unsafe { &mut (*class.as_ptr()).data }.methods;
    if let Some(Value::Obj(h)) = methods.get(key) {
        if unsafe { h.as_ref() }.kind == ObjKind::OverloadedMethod {
            let existing: NonNull<ObjOverloadedMethod> = unsafe { downcast(h, ObjKind::OverloadedMethod) };
            unsafe { (*existing.as_ptr()).data.slots[arity] = MethodSlot::Native(native) };
            return;
        }
    }

    let mut data = OverloadedMethodData::new(key, MethodKind::Native);
    data.slots[arity] = MethodSlot::Native(native);
    let overloaded = heap.alloc_overloaded_method(data);
    methods.set(key, obj_value(overloaded));
}

fn set_global(heap: &mut Heap, table: &mut Table, name: &str, class: NonNull<ObjClass>) {
    let key = heap.intern(name);
    table.set(key, obj_value(class));
}

// ---------------------------------------------------------------------
// argument helpers
// ---------------------------------------------------------------------

unsafe fn arg(args: *const Value, i: usize) -> Value {
    unsafe { *args.add(i) }
}

fn str_value(ctx: &NativeCtx, s: &str) -> Value {
    obj_value(ctx.vm.intern_tagged(s))
}

fn err_str(ctx: &NativeCtx, message: impl Into<String>) -> Value {
    str_value(ctx, &message.into())
}

fn consume_number(args: *const Value, idx: usize, label: &str, ctx: &NativeCtx) -> Result<f64, Value> {
    match unsafe { arg(args, idx) } {
        Value::Number(n) => Ok(n),
        _ => Err(err_str(ctx, format!("Expected {label} to be a number."))),
    }
}

fn consume_string(args: *const Value, idx: usize, label: &str, ctx: &NativeCtx) -> Result<NonNull<ObjString>, Value> {
    match unsafe { arg(args, idx) } {
        Value::Obj(h) if unsafe { h.as_ref() }.kind == ObjKind::String => Ok(unsafe { downcast(h, ObjKind::String) }),
        _ => Err(err_str(ctx, format!("Expected {label} to be a string."))),
    }
}

fn consume_array(args: *const Value, idx: usize, label: &str, ctx: &NativeCtx) -> Result<NonNull<ObjArray>, Value> {
    match unsafe { arg(args, idx) } {
        Value::Obj(h) if unsafe { h.as_ref() }.kind == ObjKind::Array => Ok(unsafe { downcast(h, ObjKind::Array) }),
        _ => Err(err_str(ctx, format!("Expected {label} to be an array."))),
    }
}

fn consume_instance(args: *const Value, idx: usize, label: &str, ctx: &NativeCtx) -> Result<NonNull<ObjInstance>, Value> {
    match unsafe { arg(args, idx) } {
        Value::Obj(h) if unsafe { h.as_ref() }.kind == ObjKind::Instance => Ok(unsafe { downcast(h, ObjKind::Instance) }),
        _ => Err(err_str(ctx, format!("Expected {label} to be an object."))),
    }
}

fn consume_closure(args: *const Value, idx: usize, label: &str, ctx: &NativeCtx) -> Result<NonNull<ObjClosure>, Value> {
    match unsafe { arg(args, idx) } {
        Value::Obj(h) if unsafe { h.as_ref() }.kind == ObjKind::Closure => Ok(unsafe { downcast(h, ObjKind::Closure) }),
        _ => Err(err_str(ctx, format!("Expected {label} to be a function."))),
    }
}

fn alloc_array(ctx: &NativeCtx, items: Vec<Value>) -> Value {
    let arr = {
        let mut heap = ctx.vm.heap.lock().unwrap();
        heap.alloc_array(items)
    };
    ctx.vm.tag(arr.cast(), ctx.vm.builtins.array_class);
    obj_value(arr)
}

// ---------------------------------------------------------------------
// Class
// ---------------------------------------------------------------------

fn native_class_to_string(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let value = unsafe { arg(args, 0) };
    Ok(str_value(ctx, &ctx.vm.stringify(value)))
}

// ---------------------------------------------------------------------
// String / MetaString
// ---------------------------------------------------------------------

fn native_string_to_upper_case(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let s = consume_string(args, 0, "receiver", ctx)?;
    Ok(str_value(ctx, &unsafe { s.as_ref() }.as_str().to_ascii_uppercase()))
}

fn native_string_to_lower_case(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let s = consume_string(args, 0, "receiver", ctx)?;
    Ok(str_value(ctx, &unsafe { s.as_ref() }.as_str().to_ascii_lowercase()))
}

fn native_string_includes(ctx: *mut (), argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let s = consume_string(args, 0, "receiver", ctx)?;
    let search = consume_string(args, 1, "searchString", ctx)?;
    let text = unsafe { s.as_ref() }.as_str();
    let needle = unsafe { search.as_ref() }.as_str();
    if needle.is_empty() {
        return Ok(Value::Bool(true));
    }
    let explicit = argc - 1;
    let mut start = 0i64;
    if explicit > 1 {
        start = consume_number(args, 2, "start", ctx)? as i64;
        start = safe_negative_circular_index(start, text.len() as i64);
    }
    let start = start.clamp(0, text.len() as i64) as usize;
    Ok(Value::Bool(text.get(start..).map(|t| t.contains(needle)).unwrap_or(false)))
}

fn native_string_split(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let s = consume_string(args, 0, "receiver", ctx)?;
    let sep = consume_string(args, 1, "separator", ctx)?;
    let text = unsafe { s.as_ref() }.as_str().to_string();
    let sep = unsafe { sep.as_ref() }.as_str().to_string();
    let parts: Vec<String> = if sep.is_empty() {
        text.chars().map(|c| c.to_string()).collect()
    } else {
        text.split(sep.as_str()).map(str::to_string).collect()
    };
    let items: Vec<Value> = parts.iter().map(|p| str_value(ctx, p)).collect();
    Ok(alloc_array(ctx, items))
}

fn native_string_substr(ctx: *mut (), argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let s = consume_string(args, 0, "receiver", ctx)?;
    let text = unsafe { s.as_ref() }.as_str();
    let len = text.len() as i64;
    let start = consume_number(args, 1, "startIdx", ctx)? as i64;
    let start = safe_negative_circular_index(start, len);
    let mut end = len;
    if argc - 1 > 1 {
        let raw_end = consume_number(args, 2, "endIdx", ctx)? as i64;
        end = safe_index_inclusive(raw_end, len);
    }
    let slice = if end > start { &text[start as usize..end as usize] } else { "" };
    Ok(str_value(ctx, slice))
}

fn native_string_length(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let s = consume_string(args, 0, "receiver", ctx)?;
    Ok(Value::Number(unsafe { s.as_ref() }.len() as f64))
}

fn native_string_ends_with(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let s = consume_string(args, 0, "receiver", ctx)?;
    let search = consume_string(args, 1, "searchString", ctx)?;
    Ok(Value::Bool(unsafe { s.as_ref() }.as_str().ends_with(unsafe { search.as_ref() }.as_str())))
}

fn native_string_starts_with(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let s = consume_string(args, 0, "receiver", ctx)?;
    let search = consume_string(args, 1, "searchString", ctx)?;
    Ok(Value::Bool(unsafe { s.as_ref() }.as_str().starts_with(unsafe { search.as_ref() }.as_str())))
}

fn native_string_trim_end(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let s = consume_string(args, 0, "receiver", ctx)?;
    Ok(str_value(ctx, unsafe { s.as_ref() }.as_str().trim_end_matches(' ')))
}

fn native_string_trim_start(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let s = consume_string(args, 0, "receiver", ctx)?;
    Ok(str_value(ctx, unsafe { s.as_ref() }.as_str().trim_start_matches(' ')))
}

fn native_string_char_code_at(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let s = consume_string(args, 0, "receiver", ctx)?;
    let index = consume_number(args, 1, "index", ctx)? as i64;
    let bytes = unsafe { s.as_ref() }.as_str().as_bytes();
    if index < 0 || index as usize >= bytes.len() {
        return Ok(Value::Nil);
    }
    Ok(Value::Number(bytes[index as usize] as f64))
}

fn native_string_is_empty(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let s = consume_string(args, 0, "receiver", ctx)?;
    Ok(Value::Bool(unsafe { s.as_ref() }.is_empty()))
}

/// -1 if the receiver sorts before `comparisson string`, 0 if equal, 1 if after.
fn native_string_compare(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let a = consume_string(args, 0, "receiver", ctx)?;
    let b = consume_string(args, 1, "comparisson string", ctx)?;
    let ordering = unsafe { a.as_ref() }.as_str().cmp(unsafe { b.as_ref() }.as_str());
    Ok(Value::Number(match ordering {
        std::cmp::Ordering::Less => -1.0,
        std::cmp::Ordering::Equal => 0.0,
        std::cmp::Ordering::Greater => 1.0,
    }))
}

fn native_static_string_new(ctx: *mut (), argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let explicit = argc - 1;
    let rendered = if explicit == 0 {
        String::new()
    } else {
        ctx.vm.stringify(unsafe { arg(args, 1) })
    };
    Ok(str_value(ctx, &rendered))
}

fn native_static_string_is_string(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let _ = unsafe { &mut *(ctx as *mut NativeCtx) };
    Ok(Value::Bool(unsafe { arg(args, 1) }.is_obj_kind(ObjKind::String)))
}

// ---------------------------------------------------------------------
// Number / MetaNumber
// ---------------------------------------------------------------------

fn native_static_number_is_number(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let _ = unsafe { &mut *(ctx as *mut NativeCtx) };
    Ok(Value::Bool(matches!(unsafe { arg(args, 1) }, Value::Number(_))))
}

fn native_static_number_to_number(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let s = consume_string(args, 1, "argument", ctx)?;
    match unsafe { s.as_ref() }.as_str().trim().parse::<f64>() {
        Ok(n) => Ok(Value::Number(n)),
        Err(_) => Ok(Value::Nil),
    }
}

fn native_static_number_to_integer(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    match unsafe { arg(args, 1) } {
        Value::Obj(h) if unsafe { h.as_ref() }.kind == ObjKind::String => {
            let s: NonNull<ObjString> = unsafe { downcast(h, ObjKind::String) };
            let text = unsafe { s.as_ref() }.as_str();
            let prefix_len = text
                .char_indices()
                .take_while(|&(i, c)| c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+')))
                .count();
            if prefix_len == 0 {
                return Ok(Value::Nil);
            }
            match text[..prefix_len].parse::<i64>() {
                Ok(n) => Ok(Value::Number(n as f64)),
                Err(_) => Ok(Value::Nil),
            }
        }
        Value::Number(n) => Ok(Value::Number(n.trunc())),
        _ => Err(err_str(ctx, "Expected argument to be a string or a number.")),
    }
}

// ---------------------------------------------------------------------
// Math / MetaMath
// ---------------------------------------------------------------------

fn native_static_math_abs(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let n = consume_number(args, 1, "argument", ctx)?;
    Ok(Value::Number(n.abs()))
}

fn native_static_math_min(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let a = consume_number(args, 1, "first argument", ctx)?;
    let b = consume_number(args, 2, "second argument", ctx)?;
    Ok(Value::Number(if a < b { a } else { b }))
}

fn native_static_math_max(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let a = consume_number(args, 1, "first argument", ctx)?;
    let b = consume_number(args, 2, "second argument", ctx)?;
    Ok(Value::Number(if a > b { a } else { b }))
}

fn native_static_math_clamp(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let bound_a = consume_number(args, 1, "lower bound", ctx)?;
    let n = consume_number(args, 2, "argument", ctx)?;
    let bound_b = consume_number(args, 3, "high bound", ctx)?;
    let (min, max) = if bound_a < bound_b { (bound_a, bound_b) } else { (bound_b, bound_a) };
    Ok(Value::Number(n.clamp(min, max)))
}

// ---------------------------------------------------------------------
// Array / MetaArray
// ---------------------------------------------------------------------

fn native_array_length(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let array = consume_array(args, 0, "receiver", ctx)?;
    Ok(Value::Number(unsafe { array.as_ref() }.data.items.len() as f64))
}

fn native_array_push(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let array = consume_array(args, 0, "receiver", ctx)?;
    let value = unsafe { arg(args, 1) };
    let items = &mut unsafe { &mut (*array.as_ptr()).data }.items;
    items.push(value);
    Ok(Value::Number(items.len() as f64))
}

fn native_array_pop(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let array = consume_array(args, 0, "receiver", ctx)?;
    Ok(unsafe { &mut (*array.as_ptr()).data }.items.pop().unwrap_or(Value::Nil))
}

fn native_array_unshift(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let array = consume_array(args, 0, "receiver", ctx)?;
    let value = unsafe { arg(args, 1) };
    let items = &mut unsafe { &mut (*array.as_ptr()).data }.items;
    items.insert(0, value);
    Ok(Value::Number(items.len() as f64))
}

fn native_array_shift(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let array = consume_array(args, 0, "receiver", ctx)?;
    let items = &mut unsafe { &mut (*array.as_ptr()).data }.items;
    if items.is_empty() {
        return Ok(Value::Nil);
    }
    Ok(items.remove(0))
}

fn native_array_slice(ctx: *mut (), argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let array = consume_array(args, 0, "receiver", ctx)?;
    let items = &unsafe { array.as_ref() }.data.items;
    let len = items.len() as i64;
    let explicit = argc - 1;
    let mut start = 0i64;
    let mut end = len;
    if explicit >= 1 {
        start = consume_number(args, 1, "start", ctx)? as i64;
        start = safe_negative_circular_index(start, len);
        if explicit == 2 {
            end = consume_number(args, 2, "end", ctx)? as i64;
            end = safe_index_inclusive(end, len);
        }
    }
    let sliced = if start < end { items[start as usize..end as usize].to_vec() } else { Vec::new() };
    Ok(alloc_array(ctx, sliced))
}

fn native_array_index_of(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let array = consume_array(args, 0, "receiver", ctx)?;
    let value = unsafe { arg(args, 1) };
    let items = &unsafe { array.as_ref() }.data.items;
    for (idx, item) in items.iter().enumerate() {
        if item.values_equal(&value) {
            return Ok(Value::Number(idx as f64));
        }
    }
    Ok(Value::Number(-1.0))
}

fn native_array_insert(ctx: *mut (), argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let array = consume_array(args, 0, "receiver", ctx)?;
    let index = consume_number(args, 1, "index", ctx)? as i64;
    let values_to_insert = argc - 2;
    let len = unsafe { array.as_ref() }.data.items.len() as i64;
    let insert_at = safe_index_inclusive(index, len) as usize;
    let values: Vec<Value> = (0..values_to_insert).map(|i| unsafe { arg(args, 2 + i) }).collect();
    let items = &mut unsafe { &mut (*array.as_ptr()).data }.items;
    for (offset, value) in values.into_iter().enumerate() {
        items.insert((insert_at + offset).min(items.len()), value);
    }
    Ok(Value::Obj(NonNull::new(ObjArray::as_header_ptr(array.as_ptr())).unwrap()))
}

fn native_array_remove(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let array = consume_array(args, 0, "receiver", ctx)?;
    let remove_idx = consume_number(args, 1, "index", ctx)? as i64;
    let count = consume_number(args, 2, "count", ctx)? as i64;
    let len = unsafe { array.as_ref() }.data.items.len() as i64;
    let start = uncapped_negative_circular_index(remove_idx, len);
    if start < len && count > 0 {
        let start = start as usize;
        let end = ((start as i64) + count).min(len) as usize;
        unsafe { &mut (*array.as_ptr()).data }.items.drain(start..end);
    }
    Ok(Value::Obj(NonNull::new(ObjArray::as_header_ptr(array.as_ptr())).unwrap()))
}

fn native_array_take(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let array = consume_array(args, 0, "receiver", ctx)?;
    let count = consume_number(args, 1, "argument", ctx)?;
    let items = &unsafe { array.as_ref() }.data.items;
    let count = (count as i64).clamp(0, items.len() as i64) as usize;
    Ok(alloc_array(ctx, items[..count].to_vec()))
}

fn native_array_join(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let array = consume_array(args, 0, "receiver", ctx)?;
    let items = unsafe { array.as_ref() }.data.items.clone();
    if items.is_empty() {
        return Ok(str_value(ctx, ""));
    }
    let sep = consume_string(args, 1, "separator", ctx)?;
    let sep = unsafe { sep.as_ref() }.as_str().to_string();
    let parts: Vec<String> = items.iter().map(|v| ctx.vm.stringify(*v)).collect();
    Ok(str_value(ctx, &parts.join(&sep)))
}

fn native_array_reverse(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let array = consume_array(args, 0, "receiver", ctx)?;
    let mut items = unsafe { array.as_ref() }.data.items.clone();
    items.reverse();
    Ok(alloc_array(ctx, items))
}

/// Not present in `core.c`: spec.md §8 scenario S6 needs a way to transform
/// an array with a Simpl closure, so this re-enters the interpreter via
/// `Vm::call_callback` once per element.
fn native_array_map(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let array = consume_array(args, 0, "receiver", ctx)?;
    let callback = consume_closure(args, 1, "callback", ctx)?;
    let callback_value = Value::Obj(NonNull::new(ObjClosure::as_header_ptr(callback.as_ptr())).unwrap());
    let items = unsafe { array.as_ref() }.data.items.clone();
    let mut mapped = Vec::with_capacity(items.len());
    for item in items {
        let result = ctx
            .vm
            .call_callback(ctx.thread, callback_value, &[item])
            .map_err(|message| err_str(ctx, message))?;
        mapped.push(result);
    }
    Ok(alloc_array(ctx, mapped))
}

fn native_static_array_is_array(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let _ = unsafe { &mut *(ctx as *mut NativeCtx) };
    Ok(Value::Bool(unsafe { arg(args, 1) }.is_obj_kind(ObjKind::Array)))
}

fn native_static_array_new(ctx: *mut (), argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let explicit = argc - 1;
    let length = if explicit == 1 { consume_number(args, 1, "length", ctx)? as usize } else { 0 };
    Ok(alloc_array(ctx, vec![Value::Nil; length]))
}

// ---------------------------------------------------------------------
// Error / MetaError
// ---------------------------------------------------------------------

fn native_static_error_new(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let message = consume_string(args, 1, "error message", ctx)?;
    let message_text = unsafe { message.as_ref() }.as_str().to_string();
    let stack_text = ctx.vm.stack_trace(ctx.thread);

    let instance = ctx.vm.new_instance(ctx.vm.builtins.error_class);
    let message_key = ctx.vm.intern_tagged("message");
    let stack_key = ctx.vm.intern_tagged("stack");
    let message_value = str_value(ctx, &message_text);
    let stack_value = str_value(ctx, &stack_text);
    let properties = &mut unsafe { &mut (*instance.as_ptr()).data }.properties;
    properties.set(message_key, message_value);
    properties.set(stack_key, stack_value);

    Ok(Value::Obj(NonNull::new(ObjInstance::as_header_ptr(instance.as_ptr())).unwrap()))
}

// ---------------------------------------------------------------------
// Object / MetaObject
// ---------------------------------------------------------------------

fn native_static_object_keys(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let instance = consume_instance(args, 1, "argument", ctx)?;
    let keys: Vec<String> = unsafe { instance.as_ref() }
        .data
        .properties
        .iter()
        .map(|(k, _)| unsafe { k.as_ref() }.as_str().to_string())
        .collect();
    let items: Vec<Value> = keys.iter().map(|k| str_value(ctx, k)).collect();
    Ok(alloc_array(ctx, items))
}

fn native_static_object_values(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let instance = consume_instance(args, 1, "argument", ctx)?;
    let rendered: Vec<String> = unsafe { instance.as_ref() }
        .data
        .properties
        .iter()
        .map(|(_, v)| ctx.vm.stringify(v))
        .collect();
    let items: Vec<Value> = rendered.iter().map(|v| str_value(ctx, v)).collect();
    Ok(alloc_array(ctx, items))
}

fn native_static_object_entries(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let instance = consume_instance(args, 1, "argument", ctx)?;
    let pairs: Vec<(String, String)> = unsafe { instance.as_ref() }
        .data
        .properties
        .iter()
        .map(|(k, v)| (unsafe { k.as_ref() }.as_str().to_string(), ctx.vm.stringify(v)))
        .collect();
    let entries: Vec<Value> = pairs
        .iter()
        .map(|(k, v)| alloc_array(ctx, vec![str_value(ctx, k), str_value(ctx, v)]))
        .collect();
    Ok(alloc_array(ctx, entries))
}

// ---------------------------------------------------------------------
// System / MetaSystem
// ---------------------------------------------------------------------

fn native_system_log(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let value = unsafe { arg(args, 1) };
    println!("{}", ctx.vm.stringify(value));
    Ok(Value::Nil)
}

fn native_system_scan(ctx: *mut (), _argc: usize, _args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let mut line = String::new();
    match std::io::stdin().read_line(&mut line) {
        Ok(0) | Err(_) => Err(err_str(ctx, "Unexpected scan error.")),
        Ok(_) => Ok(str_value(ctx, line.trim_end_matches(['\n', '\r']))),
    }
}

static PROCESS_START: OnceLock<Instant> = OnceLock::new();

fn native_system_clock(_ctx: *mut (), _argc: usize, _args: *const Value) -> Result<Value, Value> {
    let start = PROCESS_START.get_or_init(Instant::now);
    Ok(Value::Number(start.elapsed().as_secs_f64()))
}

fn native_system_thread(ctx: *mut (), argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let closure = consume_closure(args, 1, "argument", ctx)?;
    let explicit = argc - 1;
    let thread_arg = if explicit > 1 { unsafe { arg(args, 2) } } else { Value::Nil };
    let vm = ctx.vm.shared_self();
    crate::scheduler::spawn(&vm, ctx.thread, closure, thread_arg).map_err(|e| err_str(ctx, e))
}

fn native_system_thread_join(ctx: *mut (), _argc: usize, args: *const Value) -> Result<Value, Value> {
    let ctx = unsafe { &mut *(ctx as *mut NativeCtx) };
    let id = consume_number(args, 1, "thread id", ctx)?;
    let vm = ctx.vm.shared_self();
    crate::scheduler::join(&vm, id).map_err(|e| err_str(ctx, e))
}

// ---------------------------------------------------------------------
// installation
// ---------------------------------------------------------------------

/// Builds every built-in class and returns the VM-wide `BuiltinClasses`
/// handle alongside a base namespace table pre-populated with the
/// globals every fresh frame starts from (`examples/original_source/src/core.c`'s
/// `attachCore`).
pub fn install(heap: &mut Heap) -> (BuiltinClasses, Table) {
    let class_class = new_class(heap, "Class");
    define_native(heap, class_class, "toString", 0, native_class_to_string);
    // Class is its own class; `inherit` would just be a no-op self-copy.
    unsafe { class_class.as_ref() }.header.class.set(Some(class_class));

    let meta_string_class = new_class(heap, "MetaString");
    inherit(meta_string_class, class_class);
    define_native(heap, meta_string_class, "isString", 1, native_static_string_is_string);
    define_native(heap, meta_string_class, "new", 0, native_static_string_new);
    define_native(heap, meta_string_class, "new", 1, native_static_string_new);
    define_native(heap, meta_string_class, "String", 0, native_static_string_new);
    define_native(heap, meta_string_class, "String", 1, native_static_string_new);

    let string_class = new_class(heap, "String");
    inherit(string_class, meta_string_class);
    define_native(heap, string_class, "toUpperCase", 0, native_string_to_upper_case);
    define_native(heap, string_class, "toLowerCase", 0, native_string_to_lower_case);
    define_native(heap, string_class, "includes", 0, native_string_includes);
    define_native(heap, string_class, "includes", 1, native_string_includes);
    define_native(heap, string_class, "split", 1, native_string_split);
    define_native(heap, string_class, "substr", 1, native_string_substr);
    define_native(heap, string_class, "substr", 2, native_string_substr);
    define_native(heap, string_class, "length", 0, native_string_length);
    define_native(heap, string_class, "endsWith", 1, native_string_ends_with);
    define_native(heap, string_class, "startsWith", 1, native_string_starts_with);
    define_native(heap, string_class, "trimEnd", 0, native_string_trim_end);
    define_native(heap, string_class, "trimStart", 0, native_string_trim_start);
    define_native(heap, string_class, "charCodeAt", 1, native_string_char_code_at);
    define_native(heap, string_class, "isEmpty", 0, native_string_is_empty);
    define_native(heap, string_class, "compare", 1, native_string_compare);

    let nil_class = new_class(heap, "Nil");
    inherit(nil_class, class_class);

    let bool_class = new_class(heap, "Bool");
    inherit(bool_class, class_class);

    let meta_number_class = new_class(heap, "MetaNumber");
    inherit(meta_number_class, class_class);
    define_native(heap, meta_number_class, "isNumber", 1, native_static_number_is_number);
    define_native(heap, meta_number_class, "toNumber", 1, native_static_number_to_number);
    define_native(heap, meta_number_class, "toInteger", 1, native_static_number_to_integer);

    let number_class = new_class(heap, "Number");
    inherit(number_class, meta_number_class);

    let meta_math_class = new_class(heap, "MetaMath");
    inherit(meta_math_class, class_class);
    define_native(heap, meta_math_class, "abs", 1, native_static_math_abs);
    define_native(heap, meta_math_class, "min", 2, native_static_math_min);
    define_native(heap, meta_math_class, "max", 2, native_static_math_max);
    define_native(heap, meta_math_class, "clamp", 3, native_static_math_clamp);

    let math_class = new_class(heap, "Math");
    inherit(math_class, meta_math_class);

    let meta_array_class = new_class(heap, "MetaArray");
    inherit(meta_array_class, class_class);
    define_native(heap, meta_array_class, "isArray", 1, native_static_array_is_array);
    define_native(heap, meta_array_class, "new", 0, native_static_array_new);
    define_native(heap, meta_array_class, "new", 1, native_static_array_new);
    define_native(heap, meta_array_class, "Array", 0, native_static_array_new);
    define_native(heap, meta_array_class, "Array", 1, native_static_array_new);

    let meta_object_class = new_class(heap, "MetaObject");
    inherit(meta_object_class, class_class);
    define_native(heap, meta_object_class, "keys", 1, native_static_object_keys);
    define_native(heap, meta_object_class, "values", 1, native_static_object_values);
    define_native(heap, meta_object_class, "entries", 1, native_static_object_entries);

    let array_class = new_class(heap, "Array");
    inherit(array_class, meta_array_class);
    define_native(heap, array_class, "length", 0, native_array_length);
    define_native(heap, array_class, "push", 1, native_array_push);
    define_native(heap, array_class, "pop", 0, native_array_pop);
    define_native(heap, array_class, "unshift", 1, native_array_unshift);
    define_native(heap, array_class, "shift", 0, native_array_shift);
    define_native(heap, array_class, "slice", 0, native_array_slice);
    define_native(heap, array_class, "slice", 1, native_array_slice);
    define_native(heap, array_class, "slice", 2, native_array_slice);
    define_native(heap, array_class, "indexOf", 1, native_array_index_of);
    for arity in 2..=15 {
        define_native(heap, array_class, "insert", arity, native_array_insert);
    }
    define_native(heap, array_class, "remove", 2, native_array_remove);
    define_native(heap, array_class, "take", 1, native_array_take);
    define_native(heap, array_class, "join", 1, native_array_join);
    define_native(heap, array_class, "reverse", 0, native_array_reverse);
    define_native(heap, array_class, "map", 1, native_array_map);

    let meta_error_class = new_class(heap, "MetaError");
    inherit(meta_error_class, class_class);
    define_native(heap, meta_error_class, "new", 1, native_static_error_new);
    define_native(heap, meta_error_class, "Error", 1, native_static_error_new);

    let error_class = new_class(heap, "Error");
    inherit(error_class, meta_error_class);

    let module_exports_class = new_class(heap, "Exports");
    inherit(module_exports_class, class_class);

    let meta_system_class = new_class(heap, "MetaSystem");
    inherit(meta_system_class, class_class);
    define_native(heap, meta_system_class, "clock", 0, native_system_clock);
    define_native(heap, meta_system_class, "log", 1, native_system_log);
    define_native(heap, meta_system_class, "scan", 0, native_system_scan);
    define_native(heap, meta_system_class, "Thread", 1, native_system_thread);
    define_native(heap, meta_system_class, "Thread", 2, native_system_thread);
    define_native(heap, meta_system_class, "threadJoin", 1, native_system_thread_join);

    let system_class = new_class(heap, "System");
    inherit(system_class, meta_system_class);

    let object_class = new_class(heap, "Object");
    inherit(object_class, meta_object_class);

    let builtins = BuiltinClasses {
        class_class,
        meta_string_class,
        string_class,
        nil_class,
        bool_class,
        meta_number_class,
        number_class,
        meta_math_class,
        math_class,
        meta_array_class,
        array_class,
        meta_error_class,
        error_class,
        module_exports_class,
        meta_object_class,
        object_class,
        meta_system_class,
        system_class,
    };

    let mut base_namespace = Table::new();
    set_global(heap, &mut base_namespace, "Error", error_class);
    set_global(heap, &mut base_namespace, "String", string_class);
    set_global(heap, &mut base_namespace, "Number", number_class);
    set_global(heap, &mut base_namespace, "Math", math_class);
    set_global(heap, &mut base_namespace, "Array", array_class);
    set_global(heap, &mut base_namespace, "System", system_class);
    set_global(heap, &mut base_namespace, "Object", object_class);

    (builtins, base_namespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installs_expected_globals() {
        let mut heap = Heap::new();
        let (builtins, globals) = install(&mut heap);
        for name in ["Error", "String", "Number", "Math", "Array", "System", "Object"] {
            assert!(globals.get_str(name).is_some(), "missing global {name}");
        }
        assert_eq!(unsafe { builtins.string_class.as_ref() }.data.name.as_ref().as_str(), "String");
    }

    #[test]
    fn string_class_exposes_metaclass_statics() {
        let mut heap = Heap::new();
        let (builtins, _globals) = install(&mut heap);
        let has_new = unsafe { builtins.meta_string_class.as_ref() }.data.methods.get_str("new").is_some();
        assert!(has_new);
    }
}
