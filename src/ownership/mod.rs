//! Ownership & refcount tracker
//!
//! Design: every object-like value crossing the boundary is classified by
//! its descriptor's ownership tag, never by inference:
//! - borrowed results: wrapper with no claimed references
//! - owned results: the transferred reference is adopted by the wrapper
//! - owned arguments: one extra reference is taken for native code
//!
//! Object wrappers are unique per live pointer (see `cache`). Boxed
//! structs are wrapped per retrieval and freed through functions looked
//! up by type name.

mod cache;
mod handle;

#[cfg(test)]
mod tests;

pub use cache::live_wrappers;
pub use handle::{BoxedHandle, ObjectHandle};

use crate::config::EngineConfig;
use crate::descriptor::Ownership;
use crate::errors::{EngineError, Result};
use crate::interop::library::lookup_symbol;
use crate::logging::log_refcount;
use crate::value::Value;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use once_cell::unsync::OnceCell;
use std::cell::Cell;
use std::fmt;
use std::os::raw::c_void;

pub type RetainFn = unsafe extern "C" fn(*mut c_void) -> *mut c_void;
pub type ReleaseFn = unsafe extern "C" fn(*mut c_void);
pub(crate) type FreeFn = unsafe extern "C" fn(*mut c_void);
pub(crate) type CopyFn = unsafe extern "C" fn(*const c_void) -> *mut c_void;

/// Retain/release pair of the native object model
#[derive(Clone, Copy)]
pub struct RefcountFns {
    pub retain: RetainFn,
    pub release: ReleaseFn,
}

impl RefcountFns {
    pub fn new(retain: RetainFn, release: ReleaseFn) -> Self {
        Self { retain, release }
    }

    fn resolve(config: &EngineConfig) -> Result<Self> {
        let objects = &config.objects;
        let retain = crate::interop::library::resolve_symbol(config, &objects.library, &objects.retain)?;
        let release = crate::interop::library::resolve_symbol(config, &objects.library, &objects.release)?;
        // SAFETY: the configured symbols follow the g_object_ref/unref signatures
        unsafe {
            Ok(Self {
                retain: std::mem::transmute::<usize, RetainFn>(retain),
                release: std::mem::transmute::<usize, ReleaseFn>(release),
            })
        }
    }
}

impl fmt::Debug for RefcountFns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RefcountFns(retain={:#x}, release={:#x})",
            self.retain as usize, self.release as usize
        )
    }
}

thread_local! {
    static RETAINS: Cell<u64> = const { Cell::new(0) };
    static RELEASES: Cell<u64> = const { Cell::new(0) };
}

pub(crate) fn retain(fns: &RefcountFns, address: usize) {
    log_refcount("retain", address);
    RETAINS.with(|c| c.set(c.get() + 1));
    // SAFETY: `address` is a live object of the configured object model
    unsafe {
        (fns.retain)(address as *mut c_void);
    }
}

pub(crate) fn release(fns: &RefcountFns, address: usize) {
    log_refcount("release", address);
    let _ = RELEASES.try_with(|c| c.set(c.get() + 1));
    // SAFETY: called once per reference previously claimed
    unsafe { (fns.release)(address as *mut c_void) }
}

/// Retains and releases issued by the tracker on this thread
pub fn refcount_traffic() -> (u64, u64) {
    (RETAINS.with(Cell::get), RELEASES.with(Cell::get))
}

pub(crate) fn reset_traffic() {
    RETAINS.with(|c| c.set(0));
    RELEASES.with(|c| c.set(0));
}

/// Forget every wrapper identity; live handles keep their references
pub(crate) fn clear_wrappers() {
    cache::clear();
}

/// Per-engine object state; the retain/release pair resolves lazily
pub(crate) struct ObjectTracker {
    fns: OnceCell<RefcountFns>,
}

impl ObjectTracker {
    pub(crate) fn new(fns: Option<RefcountFns>) -> Self {
        let cell = OnceCell::new();
        if let Some(fns) = fns {
            let _ = cell.set(fns);
        }
        Self { fns: cell }
    }

    pub(crate) fn refcount_fns(&self, config: &EngineConfig) -> Result<RefcountFns> {
        self.fns
            .get_or_try_init(|| RefcountFns::resolve(config))
            .copied()
    }

    /// Wrap a native object pointer, reusing the live wrapper if any
    pub(crate) fn wrap_object(
        &self,
        config: &EngineConfig,
        address: usize,
        ownership: Ownership,
    ) -> Result<Value> {
        if address == 0 {
            return Ok(Value::Null);
        }

        let handle = match cache::lookup(address) {
            Some(inner) => ObjectHandle(inner),
            None => {
                let handle = ObjectHandle::new(address, self.refcount_fns(config)?);
                cache::insert(&handle.0);
                handle
            }
        };

        if ownership.is_owned() {
            handle.adopt();
        }
        Ok(Value::Object(handle))
    }

    /// Native pointer for an object argument
    ///
    /// Owned (transfer full) arguments get one extra reference that
    /// native code takes over.
    pub(crate) fn object_argument(
        &self,
        config: &EngineConfig,
        value: &Value,
        ownership: Ownership,
        optional: bool,
    ) -> Result<usize> {
        let address = match value {
            Value::Object(handle) => {
                if ownership.is_owned() {
                    handle.retain_for_transfer();
                }
                return Ok(handle.address());
            }
            Value::Pointer(address) if *address != 0 => *address,
            Value::Null | Value::Pointer(0) if optional => return Ok(0),
            other => {
                return Err(EngineError::marshal(
                    if optional { "object or null" } else { "non-null object" },
                    other.describe(),
                ))
            }
        };

        if ownership.is_owned() {
            retain(&self.refcount_fns(config)?, address);
        }
        Ok(address)
    }
}

/// Copy/free functions of a boxed type
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct BoxedFns {
    pub(crate) copy: Option<CopyFn>,
    pub(crate) free: Option<FreeFn>,
}

static BOXED_FNS: Lazy<DashMap<(String, String), BoxedFns>> = Lazy::new(DashMap::new);

/// C function prefix for a CamelCase type name: `GdkRGBA` -> `gdk_rgba`
pub fn c_prefix(type_name: &str) -> String {
    let chars: Vec<char> = type_name.chars().collect();
    let mut prefix = String::with_capacity(type_name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
            if prev.is_ascii_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_ascii_uppercase() && next_lower)
            {
                prefix.push('_');
            }
        }
        prefix.push(c.to_ascii_lowercase());
    }
    prefix
}

/// Look up (and cache) the copy/free pair of a boxed type
pub(crate) fn boxed_fns(config: &EngineConfig, type_name: &str, library: &str) -> BoxedFns {
    let key = (library.to_string(), type_name.to_string());
    if let Some(fns) = BOXED_FNS.get(&key) {
        return *fns;
    }

    let overrides = config.boxed.get(type_name);
    let prefix = c_prefix(type_name);
    let find = |explicit: Option<&String>, suffixes: &[&str]| -> Option<usize> {
        if let Some(symbol) = explicit {
            return lookup_symbol(config, library, symbol);
        }
        suffixes
            .iter()
            .find_map(|suffix| lookup_symbol(config, library, &format!("{}{}", prefix, suffix)))
    };

    let copy = find(overrides.and_then(|o| o.copy.as_ref()), &["_copy", "_ref"]);
    let free = find(overrides.and_then(|o| o.free.as_ref()), &["_free", "_unref"]);

    // SAFETY: boxed copy/free functions follow GBoxedCopyFunc/GBoxedFreeFunc
    let fns = unsafe {
        BoxedFns {
            copy: copy.map(|a| std::mem::transmute::<usize, CopyFn>(a)),
            free: free.map(|a| std::mem::transmute::<usize, FreeFn>(a)),
        }
    };
    if fns.free.is_none() {
        tracing::debug!(
            target: "nativebridge::ownership",
            type_name,
            library,
            "boxed type has no free function"
        );
    }
    BOXED_FNS.insert(key, fns);
    fns
}

pub(crate) unsafe extern "C" fn c_free(ptr: *mut c_void) {
    libc::free(ptr.cast());
}

/// Wrap a boxed pointer per the descriptor's ownership
pub(crate) fn wrap_boxed(
    config: &EngineConfig,
    address: usize,
    type_name: &str,
    library: &str,
    ownership: Ownership,
) -> Value {
    if address == 0 {
        return Value::Null;
    }
    let free = if ownership.is_owned() {
        boxed_fns(config, type_name, library).free
    } else {
        None
    };
    Value::Boxed(BoxedHandle::new(
        address,
        type_name,
        library,
        None,
        free,
        ownership.is_owned(),
    ))
}

/// Owned copy of a boxed value
pub(crate) fn copy_boxed(config: &EngineConfig, boxed: &BoxedHandle) -> Result<BoxedHandle> {
    let address = copy_boxed_address(config, boxed)?;
    let free = boxed_free_fn(config, boxed);
    Ok(BoxedHandle::new(
        address,
        boxed.type_name(),
        boxed.library(),
        boxed.size(),
        free,
        true,
    ))
}

/// Free function for copies of `boxed`
pub(crate) fn boxed_free_fn(config: &EngineConfig, boxed: &BoxedHandle) -> Option<FreeFn> {
    match boxed.size() {
        Some(_) => Some(c_free as FreeFn),
        None => boxed_fns(config, boxed.type_name(), boxed.library()).free,
    }
}

/// Raw copy of a boxed value for native code to own
pub(crate) fn copy_boxed_address(config: &EngineConfig, boxed: &BoxedHandle) -> Result<usize> {
    if let Some(size) = boxed.size() {
        // SAFETY: engine-allocated buffers are exactly `size` bytes
        unsafe {
            let copy = libc::malloc(size.max(1));
            if copy.is_null() {
                return Err(EngineError::marshal(boxed.type_name(), "allocation failure"));
            }
            std::ptr::copy_nonoverlapping(boxed.as_ptr() as *const u8, copy as *mut u8, size);
            return Ok(copy as usize);
        }
    }

    match boxed_fns(config, boxed.type_name(), boxed.library()).copy {
        // SAFETY: copy function of this boxed type
        Some(copy) => Ok(unsafe { copy(boxed.as_ptr()) } as usize),
        None => Err(EngineError::marshal(
            format!("owned {}", boxed.type_name()),
            "boxed value without a copy function",
        )),
    }
}

/// Native pointer for a boxed argument; owned transfers receive a copy
pub(crate) fn boxed_argument(
    config: &EngineConfig,
    value: &Value,
    type_name: &str,
    ownership: Ownership,
    optional: bool,
) -> Result<usize> {
    match value {
        Value::Boxed(boxed) => {
            if boxed.type_name() != type_name {
                return Err(EngineError::marshal(
                    type_name.to_string(),
                    format!("boxed {}", boxed.type_name()),
                ));
            }
            if ownership.is_owned() {
                copy_boxed_address(config, boxed)
            } else {
                Ok(boxed.address())
            }
        }
        Value::Pointer(address) if *address != 0 => Ok(*address),
        Value::Null | Value::Pointer(0) if optional => Ok(0),
        other => Err(EngineError::marshal(
            format!("boxed {}", type_name),
            other.describe(),
        )),
    }
}
