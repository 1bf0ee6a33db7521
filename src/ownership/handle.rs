//! Ownership-tagged handles for native objects and boxed structs

use super::{cache, release, retain, FreeFn, RefcountFns};
use crate::errors::Result;
use std::cell::Cell;
use std::fmt;
use std::os::raw::c_void;
use std::rc::Rc;

pub(crate) struct ObjectInner {
    pub(crate) address: usize,
    /// Native references this wrapper is responsible for releasing
    pub(crate) held: Cell<u32>,
    pub(crate) fns: RefcountFns,
}

impl Drop for ObjectInner {
    fn drop(&mut self) {
        cache::forget(self.address, self as *const ObjectInner);
        for _ in 0..self.held.get() {
            release(&self.fns, self.address);
        }
    }
}

/// Wrapper around a reference-counted native object
///
/// At most one wrapper exists per live native pointer; clones share it.
/// Every reference the wrapper claimed (owned results, [`acquire`]) is
/// released once the last clone is dropped.
///
/// [`acquire`]: ObjectHandle::acquire
#[derive(Clone)]
pub struct ObjectHandle(pub(crate) Rc<ObjectInner>);

impl ObjectHandle {
    pub(crate) fn new(address: usize, fns: RefcountFns) -> Self {
        Self(Rc::new(ObjectInner {
            address,
            held: Cell::new(0),
            fns,
        }))
    }

    #[inline]
    pub fn address(&self) -> usize {
        self.0.address
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut c_void {
        self.0.address as *mut c_void
    }

    /// Whether this wrapper holds at least one native reference
    pub fn is_owned(&self) -> bool {
        self.0.held.get() > 0
    }

    pub fn held_references(&self) -> u32 {
        self.0.held.get()
    }

    /// Claim a new native reference, released with the wrapper
    pub fn acquire(&self) {
        retain(&self.0.fns, self.0.address);
        self.adopt();
    }

    /// Take over a reference native code already transferred
    pub(crate) fn adopt(&self) {
        self.0.held.set(self.0.held.get() + 1);
    }

    pub(crate) fn refcount_fns(&self) -> RefcountFns {
        self.0.fns
    }

    /// Retain on behalf of native code receiving a full transfer
    pub(crate) fn retain_for_transfer(&self) {
        retain(&self.0.fns, self.0.address);
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for ObjectHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Object({:#x}, held={})",
            self.0.address,
            self.0.held.get()
        )
    }
}

pub(crate) struct BoxedInner {
    pub(crate) address: usize,
    pub(crate) type_name: String,
    pub(crate) library: String,
    pub(crate) size: Option<usize>,
    /// Set only when the wrapper owns the struct
    pub(crate) free: Option<FreeFn>,
    pub(crate) owned: bool,
}

impl Drop for BoxedInner {
    fn drop(&mut self) {
        if !self.owned || self.address == 0 {
            return;
        }
        match self.free {
            Some(free) => {
                tracing::trace!(
                    target: "nativebridge::ownership",
                    type_name = %self.type_name,
                    address = format_args!("{:#x}", self.address),
                    "boxed free"
                );
                // SAFETY: the wrapper owns the struct and `free` belongs to its type
                unsafe { free(self.address as *mut c_void) }
            }
            None => tracing::warn!(
                target: "nativebridge::ownership",
                type_name = %self.type_name,
                library = %self.library,
                "no free function for owned boxed value, leaking"
            ),
        }
    }
}

/// Wrapper around an opaque native struct
///
/// Boxed values are not identity-cached: two retrievals of the same
/// pointer produce two wrappers.
#[derive(Clone)]
pub struct BoxedHandle(pub(crate) Rc<BoxedInner>);

impl BoxedHandle {
    pub(crate) fn new(
        address: usize,
        type_name: &str,
        library: &str,
        size: Option<usize>,
        free: Option<FreeFn>,
        owned: bool,
    ) -> Self {
        Self(Rc::new(BoxedInner {
            address,
            type_name: type_name.to_string(),
            library: library.to_string(),
            size,
            free: if owned { free } else { None },
            owned,
        }))
    }

    #[inline]
    pub fn address(&self) -> usize {
        self.0.address
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut c_void {
        self.0.address as *mut c_void
    }

    pub fn type_name(&self) -> &str {
        &self.0.type_name
    }

    pub fn library(&self) -> &str {
        &self.0.library
    }

    /// Byte size, known for engine-allocated buffers
    pub fn size(&self) -> Option<usize> {
        self.0.size
    }

    pub fn is_owned(&self) -> bool {
        self.0.owned
    }

    /// Owned copy made through the type's copy function
    #[allow(clippy::wrong_self_convention)]
    pub fn to_owned(&self) -> Result<BoxedHandle> {
        crate::lifecycle::with_engine(|engine| super::copy_boxed(&engine.config, self))
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for BoxedHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for BoxedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Boxed({}, {:#x}, {})",
            self.0.type_name,
            self.0.address,
            if self.0.owned { "owned" } else { "borrowed" }
        )
    }
}
