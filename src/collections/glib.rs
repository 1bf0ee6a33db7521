//! GLib container layouts and the functions that manage them
//!
//! List nodes and pointer-array headers have stable public layouts and
//! are walked directly. Everything that allocates or frees goes through
//! GLib itself, resolved from the configured GLib library.

use crate::config::EngineConfig;
use crate::errors::Result;
use crate::interop::library::resolve_symbol;
use std::os::raw::{c_int, c_uint, c_void};

/// `GList` node
#[repr(C)]
pub struct GList {
    pub data: *mut c_void,
    pub next: *mut GList,
    pub prev: *mut GList,
}

/// `GSList` node
#[repr(C)]
pub struct GSList {
    pub data: *mut c_void,
    pub next: *mut GSList,
}

/// Public header of `GPtrArray`
#[repr(C)]
pub struct GPtrArray {
    pub pdata: *mut *mut c_void,
    pub len: c_uint,
}

/// Storage for a `GHashTableIter` (opaque, at most six words in GLib)
#[repr(C)]
#[derive(Default)]
pub struct GHashTableIter {
    _dummy: [usize; 8],
}

type HashFn = unsafe extern "C" fn(*const c_void) -> c_uint;
type EqualFn = unsafe extern "C" fn(*const c_void, *const c_void) -> c_int;
type DestroyFn = Option<unsafe extern "C" fn(*mut c_void)>;

macro_rules! glib_fn {
    ($self:ident, $name:literal, $ty:ty) => {
        std::mem::transmute::<usize, $ty>($self.symbol($name)?)
    };
}

/// GLib entry points, resolved (and cached) on first use
pub(crate) struct Glib<'a> {
    config: &'a EngineConfig,
}

impl<'a> Glib<'a> {
    pub(crate) fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    fn symbol(&self, name: &str) -> Result<usize> {
        resolve_symbol(self.config, &self.config.glib.library, name)
    }

    /// A `void (*)(gpointer)` GLib function, for deferred cleanup
    pub(crate) fn destructor(&self, name: &str) -> Result<unsafe extern "C" fn(*mut c_void)> {
        let address = self.symbol(name)?;
        // SAFETY: callers only name single-pointer GLib free/unref functions
        Ok(unsafe { std::mem::transmute::<usize, unsafe extern "C" fn(*mut c_void)>(address) })
    }

    pub(crate) unsafe fn list_prepend(&self, list: *mut GList, data: *mut c_void) -> Result<*mut GList> {
        let f = glib_fn!(self, "g_list_prepend", unsafe extern "C" fn(*mut GList, *mut c_void) -> *mut GList);
        Ok(f(list, data))
    }

    pub(crate) unsafe fn list_free(&self, list: *mut GList) -> Result<()> {
        let f = glib_fn!(self, "g_list_free", unsafe extern "C" fn(*mut GList));
        f(list);
        Ok(())
    }

    pub(crate) unsafe fn slist_prepend(&self, list: *mut GSList, data: *mut c_void) -> Result<*mut GSList> {
        let f = glib_fn!(self, "g_slist_prepend", unsafe extern "C" fn(*mut GSList, *mut c_void) -> *mut GSList);
        Ok(f(list, data))
    }

    pub(crate) unsafe fn slist_free(&self, list: *mut GSList) -> Result<()> {
        let f = glib_fn!(self, "g_slist_free", unsafe extern "C" fn(*mut GSList));
        f(list);
        Ok(())
    }

    pub(crate) unsafe fn ptr_array_sized_new(&self, reserved: c_uint) -> Result<*mut GPtrArray> {
        let f = glib_fn!(self, "g_ptr_array_sized_new", unsafe extern "C" fn(c_uint) -> *mut GPtrArray);
        Ok(f(reserved))
    }

    pub(crate) unsafe fn ptr_array_add(&self, array: *mut GPtrArray, data: *mut c_void) -> Result<()> {
        let f = glib_fn!(self, "g_ptr_array_add", unsafe extern "C" fn(*mut GPtrArray, *mut c_void));
        f(array, data);
        Ok(())
    }

    pub(crate) unsafe fn ptr_array_unref(&self, array: *mut GPtrArray) -> Result<()> {
        let f = glib_fn!(self, "g_ptr_array_unref", unsafe extern "C" fn(*mut GPtrArray));
        f(array);
        Ok(())
    }

    /// New table hashing keys by string content or by pointer value
    pub(crate) unsafe fn hash_table_new(&self, string_keys: bool) -> Result<*mut c_void> {
        let (hash, equal) = if string_keys {
            (
                glib_fn!(self, "g_str_hash", HashFn),
                glib_fn!(self, "g_str_equal", EqualFn),
            )
        } else {
            (
                glib_fn!(self, "g_direct_hash", HashFn),
                glib_fn!(self, "g_direct_equal", EqualFn),
            )
        };
        let f = glib_fn!(
            self,
            "g_hash_table_new_full",
            unsafe extern "C" fn(HashFn, EqualFn, DestroyFn, DestroyFn) -> *mut c_void
        );
        Ok(f(hash, equal, None, None))
    }

    pub(crate) unsafe fn hash_table_insert(
        &self,
        table: *mut c_void,
        key: *mut c_void,
        value: *mut c_void,
    ) -> Result<()> {
        let f = glib_fn!(
            self,
            "g_hash_table_insert",
            unsafe extern "C" fn(*mut c_void, *mut c_void, *mut c_void) -> c_int
        );
        f(table, key, value);
        Ok(())
    }

    /// All key/value payloads in iteration order
    pub(crate) unsafe fn hash_table_entries(&self, table: *mut c_void) -> Result<Vec<(usize, usize)>> {
        let init = glib_fn!(
            self,
            "g_hash_table_iter_init",
            unsafe extern "C" fn(*mut GHashTableIter, *mut c_void)
        );
        let next = glib_fn!(
            self,
            "g_hash_table_iter_next",
            unsafe extern "C" fn(*mut GHashTableIter, *mut *mut c_void, *mut *mut c_void) -> c_int
        );

        let mut iter = GHashTableIter::default();
        init(&mut iter, table);
        let mut entries = Vec::new();
        let mut key = std::ptr::null_mut();
        let mut value = std::ptr::null_mut();
        while next(&mut iter, &mut key, &mut value) != 0 {
            entries.push((key as usize, value as usize));
        }
        Ok(entries)
    }

    pub(crate) unsafe fn hash_table_unref(&self, table: *mut c_void) -> Result<()> {
        let f = glib_fn!(self, "g_hash_table_unref", unsafe extern "C" fn(*mut c_void));
        f(table);
        Ok(())
    }

    /// One iteration of the default main context
    pub(crate) fn main_context_iteration(&self, may_block: bool) -> Result<bool> {
        // SAFETY: NULL selects the default context
        unsafe {
            let f = glib_fn!(
                self,
                "g_main_context_iteration",
                unsafe extern "C" fn(*mut c_void, c_int) -> c_int
            );
            Ok(f(std::ptr::null_mut(), may_block as c_int) != 0)
        }
    }
}

/// Walk a `GList`, collecting node payloads
///
/// # Safety
/// `head` must be NULL or a well-formed list
pub(crate) unsafe fn list_payloads(head: *const GList) -> Vec<usize> {
    let mut payloads = Vec::new();
    let mut node = head;
    while !node.is_null() {
        payloads.push((*node).data as usize);
        node = (*node).next;
    }
    payloads
}

/// Walk a `GSList`, collecting node payloads
///
/// # Safety
/// `head` must be NULL or a well-formed list
pub(crate) unsafe fn slist_payloads(head: *const GSList) -> Vec<usize> {
    let mut payloads = Vec::new();
    let mut node = head;
    while !node.is_null() {
        payloads.push((*node).data as usize);
        node = (*node).next;
    }
    payloads
}

/// Payloads of a `GPtrArray`
///
/// # Safety
/// `array` must be NULL or a live pointer array
pub(crate) unsafe fn ptr_array_payloads(array: *const GPtrArray) -> Vec<usize> {
    if array.is_null() || (*array).pdata.is_null() {
        return Vec::new();
    }
    (0..(*array).len as usize)
        .map(|i| *(*array).pdata.add(i) as usize)
        .collect()
}
