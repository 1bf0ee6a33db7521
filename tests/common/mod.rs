//! Shared doubles for integration tests
//!
//! One static library, [`LIB`], stands in for the object model, GLib and
//! a handful of application functions.

#![allow(dead_code)]

use nativebridge::{is_running, start_with, stop, EngineConfig, StartOptions, StaticLibrary};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};
use std::cell::{Cell, RefCell};
use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_uint, c_void};
use std::sync::atomic::{AtomicUsize, Ordering};

pub const LIB: &str = "libtest";
pub const APP_ID: &str = "org.nativebridge.IntegrationTests";

static LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Serializes engines across the test threads of one binary
pub fn lock() -> MutexGuard<'static, ()> {
    LOCK.lock()
}

pub struct Engine {
    _lock: MutexGuard<'static, ()>,
}

impl Engine {
    pub fn start() -> Self {
        Self::start_with(config())
    }

    pub fn start_with(config: EngineConfig) -> Self {
        let lock = lock();
        start_with(APP_ID, options(config)).expect("engine start");
        reset();
        Self { _lock: lock }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if is_running() {
            stop();
        }
    }
}

pub fn options(config: EngineConfig) -> StartOptions {
    StartOptions::new()
        .with_config(config)
        .with_static_library(LIB, library())
}

pub fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.objects.library = LIB.to_string();
    config.objects.retain = "test_object_ref".to_string();
    config.objects.release = "test_object_unref".to_string();
    config.glib.library = LIB.to_string();
    config
}

thread_local! {
    static SOURCES: RefCell<Vec<Source>> = const { RefCell::new(Vec::new()) };
    static HANDLERS: RefCell<Vec<Handler>> = const { RefCell::new(Vec::new()) };
    static NEXT_ID: Cell<u64> = const { Cell::new(0) };
    static CONTAINED: RefCell<Vec<(usize, usize)>> = const { RefCell::new(Vec::new()) };
}

/// Objects whose refcount reached zero
pub static FINALIZED: AtomicUsize = AtomicUsize::new(0);
pub static INIT_CALLS: AtomicUsize = AtomicUsize::new(0);
pub static SHUTDOWN_CALLS: AtomicUsize = AtomicUsize::new(0);

fn reset() {
    SOURCES.with(|s| s.borrow_mut().clear());
    HANDLERS.with(|h| h.borrow_mut().clear());
    CONTAINED.with(|c| c.borrow_mut().clear());
}

pub fn finalized() -> usize {
    FINALIZED.load(Ordering::SeqCst)
}

fn next_id() -> u64 {
    NEXT_ID.with(|n| {
        n.set(n.get() + 1);
        n.get()
    })
}

macro_rules! symbols {
    ($lib:expr, $($name:ident),* $(,)?) => {
        $lib$(.symbol(stringify!($name), $name as *const c_void))*
    };
}

pub fn library() -> StaticLibrary {
    symbols!(
        StaticLibrary::new(),
        test_object_new,
        test_object_ref,
        test_object_unref,
        test_object_get_child,
        test_object_take,
        test_object_dup,
        test_container_add,
        test_container_remove,
        test_container_count,
        test_app_new,
        test_init,
        test_shutdown,
        echo_i8,
        echo_u8,
        echo_i16,
        echo_u16,
        echo_i32,
        echo_u32,
        echo_i64,
        echo_u64,
        echo_f32,
        echo_f64,
        echo_bool,
        echo_string,
        swap_i32,
        load_file,
        g_error_free,
        children_list,
        g_list_prepend,
        g_list_free,
        sort_i64,
        g_idle_add_full,
        g_source_remove,
        g_main_context_iteration,
        g_signal_connect_data,
        g_signal_emit_value,
        g_signal_handler_disconnect,
    )
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

#[repr(C)]
pub struct TestObject {
    pub refcount: c_int,
    pub child: *mut TestObject,
}

/// Counts and children are readable after finalization; memory is never freed
pub extern "C" fn test_object_new() -> *mut c_void {
    Box::into_raw(Box::new(TestObject {
        refcount: 1,
        child: std::ptr::null_mut(),
    })) as *mut c_void
}

pub unsafe extern "C" fn test_object_ref(object: *mut c_void) -> *mut c_void {
    (*(object as *mut TestObject)).refcount += 1;
    object
}

pub unsafe extern "C" fn test_object_unref(object: *mut c_void) {
    let object = object as *mut TestObject;
    (*object).refcount -= 1;
    if (*object).refcount == 0 {
        FINALIZED.fetch_add(1, Ordering::SeqCst);
        if !(*object).child.is_null() {
            test_object_unref((*object).child as *mut c_void);
        }
    }
}

pub fn refcount(address: usize) -> c_int {
    unsafe { (*(address as *const TestObject)).refcount }
}

/// transfer none; the child is created on first access and owned by its parent
unsafe extern "C" fn test_object_get_child(parent: *mut c_void) -> *mut c_void {
    let parent = parent as *mut TestObject;
    if (*parent).child.is_null() {
        (*parent).child = test_object_new() as *mut TestObject;
    }
    (*parent).child as *mut c_void
}

/// transfer full: consumes the caller's reference
unsafe extern "C" fn test_object_take(object: *mut c_void) {
    test_object_unref(object);
}

/// transfer full: a new reference to an existing object
unsafe extern "C" fn test_object_dup(object: *mut c_void) -> *mut c_void {
    test_object_ref(object)
}

/// The container keeps its own reference to every child
unsafe extern "C" fn test_container_add(container: *mut c_void, child: *mut c_void) {
    test_object_ref(child);
    CONTAINED.with(|c| c.borrow_mut().push((container as usize, child as usize)));
}

unsafe extern "C" fn test_container_remove(container: *mut c_void, child: *mut c_void) -> c_int {
    let removed = CONTAINED.with(|c| {
        let mut c = c.borrow_mut();
        let index = c
            .iter()
            .position(|&(parent, item)| parent == container as usize && item == child as usize)?;
        Some(c.remove(index))
    });
    if removed.is_some() {
        test_object_unref(child);
    }
    removed.is_some() as c_int
}

unsafe extern "C" fn test_container_count(container: *mut c_void) -> c_uint {
    CONTAINED.with(|c| {
        c.borrow()
            .iter()
            .filter(|&&(parent, _)| parent == container as usize)
            .count() as c_uint
    })
}

/// Application constructor; rejects ids without a dot
unsafe extern "C" fn test_app_new(id: *const c_char, _flags: c_int) -> *mut c_void {
    if !CStr::from_ptr(id).to_bytes().contains(&b'.') {
        return std::ptr::null_mut();
    }
    test_object_new()
}

extern "C" fn test_init() {
    INIT_CALLS.fetch_add(1, Ordering::SeqCst);
}

extern "C" fn test_shutdown() {
    SHUTDOWN_CALLS.fetch_add(1, Ordering::SeqCst);
}

// ---------------------------------------------------------------------------
// Scalars, strings, out-parameters
// ---------------------------------------------------------------------------

extern "C" fn echo_i8(v: i8) -> i8 { v }
extern "C" fn echo_u8(v: u8) -> u8 { v }
extern "C" fn echo_i16(v: i16) -> i16 { v }
extern "C" fn echo_u16(v: u16) -> u16 { v }
extern "C" fn echo_i32(v: i32) -> i32 { v }
extern "C" fn echo_u32(v: u32) -> u32 { v }
extern "C" fn echo_i64(v: i64) -> i64 { v }
extern "C" fn echo_u64(v: u64) -> u64 { v }
extern "C" fn echo_f32(v: f32) -> f32 { v }
extern "C" fn echo_f64(v: f64) -> f64 { v }
extern "C" fn echo_bool(v: c_int) -> c_int { v }

/// transfer full
unsafe extern "C" fn echo_string(s: *const c_char) -> *mut c_char {
    libc::strdup(s)
}

unsafe extern "C" fn swap_i32(a: *mut i32, b: *mut i32) {
    std::ptr::swap(a, b);
}

#[repr(C)]
pub struct TestError {
    pub domain: u32,
    pub code: i32,
    pub message: *mut c_char,
}

/// Fails for empty paths
unsafe extern "C" fn load_file(path: *const c_char, contents: *mut *mut c_char, error: *mut *mut TestError) -> c_int {
    let path = CStr::from_ptr(path);
    if path.to_bytes().is_empty() {
        let e = libc::malloc(std::mem::size_of::<TestError>()) as *mut TestError;
        e.write(TestError {
            domain: 1,
            code: 2,
            message: libc::strdup(b"empty path\0".as_ptr() as *const c_char),
        });
        *error = e;
        return 0;
    }
    *contents = libc::strdup(path.as_ptr());
    1
}

unsafe extern "C" fn g_error_free(error: *mut c_void) {
    libc::free((*(error as *mut TestError)).message as *mut c_void);
    libc::free(error);
}

// ---------------------------------------------------------------------------
// Lists
// ---------------------------------------------------------------------------

#[repr(C)]
pub struct GList {
    pub data: *mut c_void,
    pub next: *mut GList,
    pub prev: *mut GList,
}

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
}

/// transfer container: a fresh list of the parent's child, repeated `n` times
unsafe extern "C" fn children_list(parent: *mut c_void, n: c_int) -> *mut GList {
    let child = test_object_get_child(parent);
    let mut list = std::ptr::null_mut();
    for _ in 0..n {
        list = g_list_prepend(list, child);
    }
    list
}

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

type CompareFn = unsafe extern "C" fn(i64, i64, *mut c_void) -> c_int;
type SourceFn = unsafe extern "C" fn(*mut c_void) -> c_int;
type NotifyFn = unsafe extern "C" fn(*mut c_void);
type ClosureNotifyFn = unsafe extern "C" fn(*mut c_void, *mut c_void);
type HandlerFn = unsafe extern "C" fn(*mut c_void, *const c_char, *mut c_void) -> c_int;

/// Insertion sort of `values` through the compare callback
unsafe extern "C" fn sort_i64(values: *mut i64, length: usize, compare: CompareFn, data: *mut c_void) {
    let values = std::slice::from_raw_parts_mut(values, length);
    for i in 1..values.len() {
        let mut j = i;
        while j > 0 && compare(values[j - 1], values[j], data) > 0 {
            values.swap(j - 1, j);
            j -= 1;
        }
    }
}

struct Source {
    id: c_uint,
    func: SourceFn,
    data: *mut c_void,
    notify: Option<NotifyFn>,
}

unsafe extern "C" fn g_idle_add_full(
    _priority: c_int,
    func: SourceFn,
    data: *mut c_void,
    notify: Option<NotifyFn>,
) -> c_uint {
    let id = next_id() as c_uint;
    SOURCES.with(|s| s.borrow_mut().push(Source { id, func, data, notify }));
    id
}

fn remove_source(id: c_uint) -> bool {
    let removed = SOURCES.with(|s| {
        let mut s = s.borrow_mut();
        let index = s.iter().position(|src| src.id == id)?;
        Some(s.remove(index))
    });
    match removed {
        Some(Source { notify: Some(notify), data, .. }) => {
            unsafe { notify(data) };
            true
        }
        Some(_) => true,
        None => false,
    }
}

unsafe extern "C" fn g_source_remove(id: c_uint) -> c_int {
    remove_source(id) as c_int
}

unsafe extern "C" fn g_main_context_iteration(_context: *mut c_void, _may_block: c_int) -> c_int {
    let ready: Vec<(c_uint, SourceFn, *mut c_void)> =
        SOURCES.with(|s| s.borrow().iter().map(|src| (src.id, src.func, src.data)).collect());
    for &(id, func, data) in &ready {
        if func(data) == 0 {
            remove_source(id);
        }
    }
    (!ready.is_empty()) as c_int
}

pub fn pending_sources() -> usize {
    SOURCES.with(|s| s.borrow().len())
}

struct Handler {
    id: u64,
    instance: usize,
    func: HandlerFn,
    data: *mut c_void,
    notify: Option<ClosureNotifyFn>,
}

unsafe extern "C" fn g_signal_connect_data(
    instance: *mut c_void,
    func: HandlerFn,
    data: *mut c_void,
    notify: Option<ClosureNotifyFn>,
) -> u64 {
    let id = next_id();
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

/// Number of handlers that returned TRUE
unsafe extern "C" fn g_signal_emit_value(instance: *mut c_void, detail: *const c_char) -> c_int {
    let handlers: Vec<(HandlerFn, *mut c_void)> = HANDLERS.with(|h| {
        h.borrow()
            .iter()
            .filter(|handler| handler.instance == instance as usize)
            .map(|handler| (handler.func, handler.data))
            .collect()
    });
    handlers
        .into_iter()
        .filter(|(func, data)| func(instance, detail, *data) != 0)
        .count() as c_int
}

unsafe extern "C" fn g_signal_handler_disconnect(_instance: *mut c_void, id: u64) {
    let removed = HANDLERS.with(|h| {
        let mut h = h.borrow_mut();
        let index = h.iter().position(|handler| handler.id == id)?;
        Some(h.remove(index))
    });
    if let Some(Handler { notify: Some(notify), data, .. }) = removed {
        notify(data, std::ptr::null_mut());
    }
}
