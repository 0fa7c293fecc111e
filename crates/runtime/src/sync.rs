//! Named locks and counting semaphores (spec.md §5 "Locks"), grounded on
//! `examples/original_source/src/multithreading.c`'s `initLock`/
//! `lockSection`/`unlockSection`/`initSemaphore`/`postSemaphore`/
//! `waitSemaphore`, keyed the same way: by the identity of an interned
//! string, not its bytes (two calls with equal-content names always resolve
//! to the same registry entry because of string interning, spec.md §3).
//!
//! Registry shape follows the teacher's `channel.rs` MPMC registry: a
//! `HashMap` behind a single `Mutex`, keyed by a cheap integer derived from
//! the resource's identity.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Condvar, Mutex};

use simpl_core::object::ObjString;

fn key_of(name: NonNull<ObjString>) -> usize {
    name.as_ptr() as usize
}

/// A VM-wide registry of named mutexes. Each entry is itself a `Mutex<()>`
/// so `lock_section`/`unlock_section` reuse the platform mutex rather than
/// hand-rolling one.
#[derive(Default)]
pub struct LockRegistry {
    locks: HashMap<usize, Mutex<()>>,
    /// Mirrors `pthread_mutex_lock` semantics used from a single Simpl
    /// thread at a time: we track which registry entries *this* OS thread
    /// currently holds, since `std::sync::Mutex` has no re-entrant owner
    /// query and `unlockSection` must be able to release it.
    held: HashMap<usize, std::sync::MutexGuard<'static, ()>>,
}

// SAFETY: `held` guards never escape this struct and its HashMap's storage
// is heap-stable (moving the map moves its entries, not the guards'
// target); this registry itself is always accessed from behind the VM's
// shared mutex, so the guard lifetime extension below is never actually
// observed concurrently with the data it protects being dropped.
unsafe impl Send for LockRegistry {}

impl LockRegistry {
    pub fn new() -> Self {
        LockRegistry::default()
    }

    pub fn init_lock(&mut self, name: NonNull<ObjString>) -> Result<(), String> {
        let key = key_of(name);
        if self.locks.contains_key(&key) {
            let chars = unsafe { name.as_ref() }.as_str();
            return Err(format!("Lock {chars} is already defined."));
        }
        self.locks.insert(key, Mutex::new(()));
        Ok(())
    }

    pub fn lock_section(&mut self, name: NonNull<ObjString>) -> Result<(), String> {
        let key = key_of(name);
        let Some(mutex) = self.locks.get(&key) else {
            let chars = unsafe { name.as_ref() }.as_str();
            return Err(format!("Unable to unlock undefined {chars} lock"));
        };
        // Extend the guard's lifetime to 'static: sound because `mutex`
        // lives in `self.locks`, which outlives every guard we stash in
        // `self.held` (we never remove a `locks` entry once installed).
        let guard: std::sync::MutexGuard<'_, ()> =
            mutex.lock().unwrap_or_else(|poison| poison.into_inner());
        let guard: std::sync::MutexGuard<'static, ()> = unsafe { std::mem::transmute(guard) };
        self.held.insert(key, guard);
        Ok(())
    }

    pub fn unlock_section(&mut self, name: NonNull<ObjString>) -> Result<(), String> {
        let key = key_of(name);
        if !self.locks.contains_key(&key) {
            let chars = unsafe { name.as_ref() }.as_str();
            return Err(format!("Unable to unlock undefined {chars} lock"));
        }
        self.held.remove(&key);
        Ok(())
    }
}

struct SemaphoreState {
    count: Mutex<i64>,
    condvar: Condvar,
}

#[derive(Default)]
pub struct SemaphoreRegistry {
    semaphores: HashMap<usize, SemaphoreState>,
}

impl SemaphoreRegistry {
    pub fn new() -> Self {
        SemaphoreRegistry::default()
    }

    pub fn init_semaphore(&mut self, name: NonNull<ObjString>, value: i64) -> Result<(), String> {
        let key = key_of(name);
        if self.semaphores.contains_key(&key) {
            let chars = unsafe { name.as_ref() }.as_str();
            return Err(format!("Semaphore {chars} is already initialized."));
        }
        self.semaphores.insert(
            key,
            SemaphoreState {
                count: Mutex::new(value),
                condvar: Condvar::new(),
            },
        );
        Ok(())
    }

    pub fn post(&self, name: NonNull<ObjString>) -> Result<(), String> {
        let key = key_of(name);
        let Some(state) = self.semaphores.get(&key) else {
            let chars = unsafe { name.as_ref() }.as_str();
            return Err(format!("Semaphore {chars} not found."));
        };
        let mut count = state.count.lock().unwrap();
        *count += 1;
        state.condvar.notify_one();
        Ok(())
    }

    /// Blocking wait. Callers (the VM's native dispatch) must treat this as
    /// a suspension point (spec.md §5 "Suspension points") and release the
    /// VM-wide lock before calling it.
    pub fn wait(&self, name: NonNull<ObjString>) -> Result<(), String> {
        let key = key_of(name);
        let Some(state) = self.semaphores.get(&key) else {
            let chars = unsafe { name.as_ref() }.as_str();
            return Err(format!("Semaphore {chars} not found."));
        };
        let mut count = state.count.lock().unwrap();
        while *count <= 0 {
            count = state.condvar.wait(count).unwrap();
        }
        *count -= 1;
        Ok(())
    }
}
