//! Closure registry
//!
//! Holds the strong reference to every callable native code can still
//! reach. Lookups clone what an invocation needs and drop the borrow
//! before the callable runs, so callables may re-enter the engine (and
//! register or release other closures) freely. Releases requested while
//! any trampoline is executing are deferred until the outermost
//! invocation returns. Even then the released code may still be on the
//! stack, so it is parked and freed at the next invocation or
//! registration.

use super::RegistrationId;
use crate::descriptor::{TrampolineKind, TypeDescriptor};
use crate::logging::log_closure_released;
use crate::value::Callable;
use libffi::middle::Closure;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Executable trampoline code and the id its userdata points at
pub(crate) struct NativeCode {
    pub(crate) closure: Closure<'static>,
    pub(crate) userdata: *mut u64,
}

impl Drop for NativeCode {
    fn drop(&mut self) {
        if !self.userdata.is_null() {
            // SAFETY: leaked from a Box at registration time; the closure
            // reading it is dropped right after this
            unsafe {
                drop(Box::from_raw(self.userdata));
            }
        }
    }
}

pub(crate) struct Registration {
    pub(crate) callable: Callable,
    pub(crate) kind: TrampolineKind,
    pub(crate) arg_types: Rc<[TypeDescriptor]>,
    pub(crate) return_type: Rc<TypeDescriptor>,
    pub(crate) code: NativeCode,
}

/// What one invocation needs, detached from the registry
#[derive(Clone)]
pub(crate) struct Invocation {
    pub(crate) callable: Callable,
    pub(crate) kind: TrampolineKind,
    pub(crate) arg_types: Rc<[TypeDescriptor]>,
    pub(crate) return_type: Rc<TypeDescriptor>,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<u64, Registration>,
    next_id: u64,
    depth: usize,
    pending: Vec<(u64, &'static str)>,
    parked: Vec<NativeCode>,
}

thread_local! {
    static REGISTRY: RefCell<Registry> = RefCell::new(Registry::default());
}

/// Reserve the next id; ids are never reused within a process
pub(crate) fn next_id() -> u64 {
    REGISTRY.with(|r| {
        let mut r = r.borrow_mut();
        r.next_id += 1;
        r.next_id
    })
}

pub(crate) fn insert(id: u64, registration: Registration) {
    let parked = REGISTRY.with(|r| {
        let mut r = r.borrow_mut();
        r.entries.insert(id, registration);
        std::mem::take(&mut r.parked)
    });
    drop(parked);
}

pub(crate) fn lookup(id: u64) -> Option<Invocation> {
    REGISTRY.with(|r| {
        r.borrow().entries.get(&id).map(|entry| Invocation {
            callable: entry.callable.clone(),
            kind: entry.kind,
            arg_types: Rc::clone(&entry.arg_types),
            return_type: Rc::clone(&entry.return_type),
        })
    })
}

/// Release a registration now, or once no trampoline is executing
pub(crate) fn release(id: u64, reason: &'static str) -> bool {
    let removed = REGISTRY.try_with(|r| {
        let mut r = r.borrow_mut();
        if !r.entries.contains_key(&id) {
            return None;
        }
        if r.depth > 0 {
            r.pending.push((id, reason));
            return Some(None);
        }
        Some(r.entries.remove(&id))
    });

    match removed {
        Ok(Some(Some(registration))) => {
            log_closure_released(id, reason);
            // dropped outside the borrow: the callable may own wrappers
            drop(registration);
            true
        }
        Ok(Some(None)) => true,
        _ => false,
    }
}

/// Enter an invocation; the outermost one frees parked code, none of
/// which can still be executing
pub(crate) fn enter() {
    let parked = REGISTRY.with(|r| {
        let mut r = r.borrow_mut();
        r.depth += 1;
        if r.depth == 1 {
            std::mem::take(&mut r.parked)
        } else {
            Vec::new()
        }
    });
    drop(parked);
}

/// Leave an invocation; the outermost one applies deferred releases
pub(crate) fn leave() {
    let released = REGISTRY.with(|r| {
        let mut r = r.borrow_mut();
        r.depth = r.depth.saturating_sub(1);
        if r.depth > 0 {
            return Vec::new();
        }
        let mut released = Vec::new();
        for (id, reason) in std::mem::take(&mut r.pending) {
            if let Some(entry) = r.entries.remove(&id) {
                r.parked.push(entry.code);
                released.push((id, reason, entry.callable));
            }
        }
        released
    });
    for (id, reason, callable) in released {
        log_closure_released(id, reason);
        drop(callable);
    }
}

#[cfg(test)]
pub(crate) fn parked() -> usize {
    REGISTRY.with(|r| r.borrow().parked.len())
}

pub(crate) fn live() -> usize {
    REGISTRY.with(|r| r.borrow().entries.len())
}

pub(crate) fn ids_for(identity: usize) -> Vec<RegistrationId> {
    let mut ids: Vec<_> = REGISTRY.with(|r| {
        r.borrow()
            .entries
            .iter()
            .filter(|(_, entry)| entry.callable.identity() == identity)
            .map(|(id, _)| RegistrationId(*id))
            .collect()
    });
    ids.sort();
    ids
}

/// Drop every callable at engine stop
///
/// The trampoline code itself is leaked: native objects that outlive the
/// engine may still call it, and it answers with a zero result.
pub(crate) fn retire_all() -> usize {
    let (entries, parked): (Vec<Registration>, Vec<NativeCode>) = REGISTRY.with(|r| {
        let mut r = r.borrow_mut();
        r.pending.clear();
        let entries = r.entries.drain().map(|(_, entry)| entry).collect();
        (entries, std::mem::take(&mut r.parked))
    });
    drop(parked);
    let count = entries.len();
    for entry in entries {
        let Registration { callable, code, .. } = entry;
        std::mem::forget(code);
        drop(callable);
    }
    count
}
