//! In-process doubles of the native libraries unit tests drive
//!
//! Everything is registered as the static library [`FAKE`], which also
//! stands in for GLib and for the object model's retain/release pair.

use crate::collections::glib::{GList, GPtrArray, GSList};
use crate::config::EngineConfig;
use crate::interop::StaticLibrary;
use crate::lifecycle::{is_running, start_with, stop, StartOptions};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};
use std::cell::{Cell, RefCell};
use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_uint, c_void};

pub(crate) const FAKE: &str = "libfake";

/// Engines are bound to one thread and one process-wide owner slot
static ENGINE_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Running engine for the duration of a test
pub(crate) struct EngineGuard {
    _lock: MutexGuard<'static, ()>,
}

impl EngineGuard {
    pub(crate) fn start() -> Self {
        Self::start_with(config())
    }

    pub(crate) fn start_with(config: EngineConfig) -> Self {
        let lock = ENGINE_LOCK.lock();
        start_with(
            "org.nativebridge.UnitTests",
            StartOptions::new()
                .with_config(config)
                .with_static_library(FAKE, library()),
        )
        .expect("engine start");
        reset();
        Self { _lock: lock }
    }
}

impl Drop for EngineGuard {
    fn drop(&mut self) {
        if is_running() {
            stop();
        }
    }
}

pub(crate) fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.objects.library = FAKE.to_string();
    config.objects.retain = "fake_object_ref".to_string();
    config.objects.release = "fake_object_unref".to_string();
    config.glib.library = FAKE.to_string();
    config
}

thread_local! {
    static CONTAINERS_FREED: Cell<usize> = const { Cell::new(0) };
    static SOURCES: RefCell<Vec<Source>> = const { RefCell::new(Vec::new()) };
    static NEXT_SOURCE: Cell<c_uint> = const { Cell::new(0) };
    static HANDLERS: RefCell<Vec<Handler>> = const { RefCell::new(Vec::new()) };
    static NEXT_HANDLER: Cell<u64> = const { Cell::new(0) };
}

fn reset() {
    CONTAINERS_FREED.with(|c| c.set(0));
    SOURCES.with(|s| s.borrow_mut().clear());
    HANDLERS.with(|h| h.borrow_mut().clear());
}

/// Lists, pointer arrays and hash tables released on this thread
pub(crate) fn containers_freed() -> usize {
    CONTAINERS_FREED.with(Cell::get)
}

fn container_freed() {
    CONTAINERS_FREED.with(|c| c.set(c.get() + 1));
}

macro_rules! symbols {
    ($lib:expr, $($name:ident),* $(,)?) => {
        $lib$(.symbol(stringify!($name), $name as *const c_void))*
    };
}

pub(crate) fn library() -> StaticLibrary {
    symbols!(
        StaticLibrary::new(),
        fake_object_new,
        fake_object_ref,
        fake_object_unref,
        fake_object_refcount,
        fake_object_peek,
        fake_object_dup,
        fake_add_i32,
        fake_scale_f64,
        fake_half_f32,
        fake_not,
        fake_wide,
        fake_strlen,
        fake_upper,
        fake_greeting,
        fake_divmod,
        fake_increment,
        fake_fill_string,
        fake_open,
        fake_sum_i32,
        fake_strv_length,
        fake_range,
        fake_sum_fixed3,
        fake_join_slist,
        fake_list_identity,
        fake_ptr_array_length,
        fake_hash_lookup,
        fake_hash_size,
        fake_compare,
        fake_run_destroy,
        fake_idle_add_full,
        fake_signal_connect,
        fake_signal_emit,
        fake_signal_disconnect,
        g_error_free,
        g_list_prepend,
        g_list_free,
        g_slist_prepend,
        g_slist_free,
        g_ptr_array_sized_new,
        g_ptr_array_add,
        g_ptr_array_unref,
        g_str_hash,
        g_str_equal,
        g_direct_hash,
        g_direct_equal,
        g_hash_table_new_full,
        g_hash_table_insert,
        g_hash_table_iter_init,
        g_hash_table_iter_next,
        g_hash_table_unref,
        g_main_context_iteration,
    )
}

// ---------------------------------------------------------------------------
// Object model
// ---------------------------------------------------------------------------

#[repr(C)]
pub(crate) struct FakeObject {
    pub(crate) refcount: c_int,
}

/// Objects are never freed so tests can read counts after the last unref
pub(crate) extern "C" fn fake_object_new() -> *mut c_void {
    Box::into_raw(Box::new(FakeObject { refcount: 1 })) as *mut c_void
}

pub(crate) unsafe extern "C" fn fake_object_ref(object: *mut c_void) -> *mut c_void {
    (*(object as *mut FakeObject)).refcount += 1;
    object
}

pub(crate) unsafe extern "C" fn fake_object_unref(object: *mut c_void) {
    (*(object as *mut FakeObject)).refcount -= 1;
}

pub(crate) unsafe extern "C" fn fake_object_refcount(object: *const c_void) -> c_int {
    (*(object as *const FakeObject)).refcount
}

/// transfer none
unsafe extern "C" fn fake_object_peek(object: *mut c_void) -> *mut c_void {
    object
}

/// transfer full
unsafe extern "C" fn fake_object_dup(object: *mut c_void) -> *mut c_void {
    fake_object_ref(object)
}

pub(crate) fn refcount(address: usize) -> c_int {
    unsafe { fake_object_refcount(address as *const c_void) }
}

// ---------------------------------------------------------------------------
// Scalars and strings
// ---------------------------------------------------------------------------

extern "C" fn fake_add_i32(a: i32, b: i32) -> i32 {
    a.wrapping_add(b)
}

extern "C" fn fake_scale_f64(x: f64, factor: f64) -> f64 {
    x * factor
}

extern "C" fn fake_half_f32(x: f32) -> f32 {
    x / 2.0
}

extern "C" fn fake_not(b: c_int) -> c_int {
    (b == 0) as c_int
}

extern "C" fn fake_wide(a: i8, b: u16, c: i64, d: f32) -> f64 {
    a as f64 + b as f64 + c as f64 + d as f64
}

unsafe extern "C" fn fake_strlen(s: *const c_char) -> u64 {
    if s.is_null() {
        return u64::MAX;
    }
    CStr::from_ptr(s).to_bytes().len() as u64
}

/// transfer full
unsafe extern "C" fn fake_upper(s: *const c_char) -> *mut c_char {
    let upper = CStr::from_ptr(s).to_string_lossy().to_uppercase();
    let c = std::ffi::CString::new(upper).unwrap_or_default();
    libc::strdup(c.as_ptr())
}

/// transfer none
extern "C" fn fake_greeting() -> *const c_char {
    b"hello\0".as_ptr() as *const c_char
}

// ---------------------------------------------------------------------------
// Out-parameters
// ---------------------------------------------------------------------------

unsafe extern "C" fn fake_divmod(a: i32, b: i32, quotient: *mut i32, remainder: *mut i32) -> c_int {
    if b == 0 {
        return 0;
    }
    *quotient = a / b;
    *remainder = a % b;
    1
}

unsafe extern "C" fn fake_increment(value: *mut i64) {
    *value += 1;
}

unsafe extern "C" fn fake_fill_string(out: *mut *mut c_char) {
    *out = libc::strdup(b"filled\0".as_ptr() as *const c_char);
}

#[repr(C)]
pub(crate) struct FakeError {
    domain: u32,
    code: i32,
    message: *mut c_char,
}

/// Fails with a GError-shaped error for any path starting with "/missing"
unsafe extern "C" fn fake_open(path: *const c_char, error: *mut *mut FakeError) -> c_int {
    if !CStr::from_ptr(path).to_bytes().starts_with(b"/missing") {
        return 1;
    }
    if !error.is_null() {
        let e = libc::malloc(std::mem::size_of::<FakeError>()) as *mut FakeError;
        e.write(FakeError {
            domain: 7,
            code: 4,
            message: libc::strdup(b"No such file\0".as_ptr() as *const c_char),
        });
        *error = e;
    }
    0
}

unsafe extern "C" fn g_error_free(error: *mut c_void) {
    let e = error as *mut FakeError;
    libc::free((*e).message as *mut c_void);
    libc::free(error);
}

// ---------------------------------------------------------------------------
// Arrays and containers
// ---------------------------------------------------------------------------

unsafe extern "C" fn fake_sum_i32(values: *const i32, length: usize) -> i64 {
    (0..length).map(|i| *values.add(i) as i64).sum()
}

unsafe extern "C" fn fake_strv_length(strv: *const *const c_char) -> c_uint {
    let mut n = 0;
    while !(*strv.add(n)).is_null() {
        n += 1;
    }
    n as c_uint
}

/// transfer full, `0..n` with the count written to `length`
unsafe extern "C" fn fake_range(n: i32, length: *mut i32) -> *mut i32 {
    let values = libc::calloc(n.max(1) as usize, 4) as *mut i32;
    for i in 0..n {
        *values.add(i as usize) = i;
    }
    *length = n;
    values
}

unsafe extern "C" fn fake_sum_fixed3(values: *const f64) -> f64 {
    *values + *values.add(1) + *values.add(2)
}

/// transfer full
unsafe extern "C" fn fake_join_slist(list: *const GSList, separator: *const c_char) -> *mut c_char {
    let separator = CStr::from_ptr(separator).to_string_lossy();
    let mut parts = Vec::new();
    let mut node = list;
    while !node.is_null() {
        parts.push(CStr::from_ptr((*node).data as *const c_char).to_string_lossy().into_owned());
        node = (*node).next;
    }
    let joined = std::ffi::CString::new(parts.join(&separator)).unwrap_or_default();
    libc::strdup(joined.as_ptr())
}

/// transfer none
extern "C" fn fake_list_identity(list: *mut GList) -> *mut GList {
    list
}

unsafe extern "C" fn fake_ptr_array_length(array: *const GPtrArray) -> c_uint {
    (*array).len
}

unsafe extern "C" fn fake_hash_lookup(table: *mut c_void, key: *const c_void) -> *mut c_void {
    let table = &*(table as *const FakeHashTable);
    table
        .entries
        .iter()
        .find(|(k, _)| (table.equal)(*k as *const c_void, key) != 0)
        .map_or(std::ptr::null_mut(), |(_, v)| *v as *mut c_void)
}

unsafe extern "C" fn fake_hash_size(table: *mut c_void) -> c_uint {
    (*(table as *const FakeHashTable)).entries.len() as c_uint
}

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

type CompareFn = unsafe extern "C" fn(i64, i64, *mut c_void) -> c_int;
type SourceFn = unsafe extern "C" fn(*mut c_void) -> c_int;
type NotifyFn = unsafe extern "C" fn(*mut c_void);
type ClosureNotifyFn = unsafe extern "C" fn(*mut c_void, *mut c_void);
type HandlerFn = unsafe extern "C" fn(*mut c_void, c_int, *mut c_void) -> c_int;

unsafe extern "C" fn fake_compare(compare: CompareFn, data: *mut c_void, a: i64, b: i64) -> c_int {
    compare(a, b, data)
}

unsafe extern "C" fn fake_run_destroy(destroy: NotifyFn, data: *mut c_void) {
    destroy(data);
}

struct Source {
    id: c_uint,
    func: SourceFn,
    data: *mut c_void,
    notify: Option<NotifyFn>,
}

unsafe extern "C" fn fake_idle_add_full(
    _priority: c_int,
    func: SourceFn,
    data: *mut c_void,
    notify: Option<NotifyFn>,
) -> c_uint {
    let id = NEXT_SOURCE.with(|n| {
        n.set(n.get() + 1);
        n.get()
    });
    SOURCES.with(|s| s.borrow_mut().push(Source { id, func, data, notify }));
    id
}

/// Dispatch every pending idle source once
unsafe extern "C" fn g_main_context_iteration(_context: *mut c_void, _may_block: c_int) -> c_int {
    let ready: Vec<(c_uint, SourceFn, *mut c_void)> =
        SOURCES.with(|s| s.borrow().iter().map(|src| (src.id, src.func, src.data)).collect());
    for &(id, func, data) in &ready {
        if func(data) == 0 {
            let removed = SOURCES.with(|s| {
                let mut s = s.borrow_mut();
                let index = s.iter().position(|src| src.id == id)?;
                Some(s.remove(index))
            });
            if let Some(Source { notify: Some(notify), data, .. }) = removed {
                notify(data);
            }
        }
    }
    (!ready.is_empty()) as c_int
}

pub(crate) fn pending_sources() -> usize {
    SOURCES.with(|s| s.borrow().len())
}

struct Handler {
    id: u64,
    instance: usize,
    func: HandlerFn,
    data: *mut c_void,
    notify: Option<ClosureNotifyFn>,
}

unsafe extern "C" fn fake_signal_connect(
    instance: *mut c_void,
    func: HandlerFn,
    data: *mut c_void,
    notify: Option<ClosureNotifyFn>,
) -> u64 {
    let id = NEXT_HANDLER.with(|n| {
        n.set(n.get() + 1);
        n.get()
    });
    HANDLERS.with(|h| {
        h.borrow_mut().push(Handler {
            id,
            instance: instance as usize,
            func,
            data,
            notify,
        })
    });
    id
}

/// Sum of every handler's result
unsafe extern "C" fn fake_signal_emit(instance: *mut c_void, value: c_int) -> c_int {
    let handlers: Vec<(HandlerFn, *mut c_void)> = HANDLERS.with(|h| {
        h.borrow()
            .iter()
            .filter(|handler| handler.instance == instance as usize)
            .map(|handler| (handler.func, handler.data))
            .collect()
    });
    handlers
        .into_iter()
        .map(|(func, data)| func(instance, value, data))
        .sum()
}

unsafe extern "C" fn fake_signal_disconnect(_instance: *mut c_void, id: u64) {
    let removed = HANDLERS.with(|h| {
        let mut h = h.borrow_mut();
        let index = h.iter().position(|handler| handler.id == id)?;
        Some(h.remove(index))
    });
    if let Some(Handler { notify: Some(notify), data, .. }) = removed {
        notify(data, std::ptr::null_mut());
    }
}

// ---------------------------------------------------------------------------
// GLib containers
// ---------------------------------------------------------------------------

unsafe extern "C" fn g_list_prepend(list: *mut GList, data: *mut c_void) -> *mut GList {
    let node = libc::malloc(std::mem::size_of::<GList>()) as *mut GList;
    node.write(GList {
        data,
        next: list,
        prev: std::ptr::null_mut(),
    });
    if !list.is_null() {
        (*list).prev = node;
    }
    node
}

unsafe extern "C" fn g_list_free(list: *mut GList) {
    let mut node = list;
    while !node.is_null() {
        let next = (*node).next;
        libc::free(node as *mut c_void);
        node = next;
    }
    container_freed();
}

unsafe extern "C" fn g_slist_prepend(list: *mut GSList, data: *mut c_void) -> *mut GSList {
    let node = libc::malloc(std::mem::size_of::<GSList>()) as *mut GSList;
    node.write(GSList { data, next: list });
    node
}

unsafe extern "C" fn g_slist_free(list: *mut GSList) {
    let mut node = list;
    while !node.is_null() {
        let next = (*node).next;
        libc::free(node as *mut c_void);
        node = next;
    }
    container_freed();
}

#[repr(C)]
struct FakePtrArray {
    header: GPtrArray,
    storage: Vec<*mut c_void>,
}

unsafe extern "C" fn g_ptr_array_sized_new(reserved: c_uint) -> *mut GPtrArray {
    let mut array = Box::new(FakePtrArray {
        header: GPtrArray {
            pdata: std::ptr::null_mut(),
            len: 0,
        },
        storage: Vec::with_capacity(reserved as usize),
    });
    array.header.pdata = array.storage.as_mut_ptr();
    Box::into_raw(array) as *mut GPtrArray
}

unsafe extern "C" fn g_ptr_array_add(array: *mut GPtrArray, data: *mut c_void) {
    let array = &mut *(array as *mut FakePtrArray);
    array.storage.push(data);
    array.header.pdata = array.storage.as_mut_ptr();
    array.header.len = array.storage.len() as c_uint;
}

unsafe extern "C" fn g_ptr_array_unref(array: *mut GPtrArray) {
    drop(Box::from_raw(array as *mut FakePtrArray));
    container_freed();
}

type EqualFn = unsafe extern "C" fn(*const c_void, *const c_void) -> c_int;

struct FakeHashTable {
    equal: EqualFn,
    entries: Vec<(usize, usize)>,
}

unsafe extern "C" fn g_str_hash(key: *const c_void) -> c_uint {
    CStr::from_ptr(key as *const c_char)
        .to_bytes()
        .iter()
        .fold(5381u32, |h, b| h.wrapping_mul(33).wrapping_add(*b as u32))
}

unsafe extern "C" fn g_str_equal(a: *const c_void, b: *const c_void) -> c_int {
    (CStr::from_ptr(a as *const c_char) == CStr::from_ptr(b as *const c_char)) as c_int
}

extern "C" fn g_direct_hash(key: *const c_void) -> c_uint {
    key as usize as c_uint
}

extern "C" fn g_direct_equal(a: *const c_void, b: *const c_void) -> c_int {
    (a == b) as c_int
}

unsafe extern "C" fn g_hash_table_new_full(
    _hash: unsafe extern "C" fn(*const c_void) -> c_uint,
    equal: EqualFn,
    _key_destroy: Option<NotifyFn>,
    _value_destroy: Option<NotifyFn>,
) -> *mut c_void {
    Box::into_raw(Box::new(FakeHashTable {
        equal,
        entries: Vec::new(),
    })) as *mut c_void
}

unsafe extern "C" fn g_hash_table_insert(table: *mut c_void, key: *mut c_void, value: *mut c_void) -> c_int {
    let table = &mut *(table as *mut FakeHashTable);
    let equal = table.equal;
    match table
        .entries
        .iter_mut()
        .find(|(k, _)| equal(*k as *const c_void, key) != 0)
    {
        Some(entry) => {
            entry.1 = value as usize;
            0
        }
        None => {
            table.entries.push((key as usize, value as usize));
            1
        }
    }
}

/// Iterator words: `[table, next index]`
unsafe extern "C" fn g_hash_table_iter_init(iter: *mut usize, table: *mut c_void) {
    *iter = table as usize;
    *iter.add(1) = 0;
}

unsafe extern "C" fn g_hash_table_iter_next(
    iter: *mut usize,
    key: *mut *mut c_void,
    value: *mut *mut c_void,
) -> c_int {
    let table = &*(*iter as *const FakeHashTable);
    let index = *iter.add(1);
    match table.entries.get(index) {
        Some((k, v)) => {
            *key = *k as *mut c_void;
            *value = *v as *mut c_void;
            *iter.add(1) = index + 1;
            1
        }
        None => 0,
    }
}

unsafe extern "C" fn g_hash_table_unref(table: *mut c_void) {
    drop(Box::from_raw(table as *mut FakeHashTable));
    container_freed();
}
