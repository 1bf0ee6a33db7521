//! Process lifecycle
//!
//! `start` binds one engine to the calling thread; every other entry point
//! borrows it through [`with_engine`]. Using the engine before `start`,
//! after `stop`, or from another thread is a programming error and panics
//! with a message naming the owning thread.

use crate::collections::glib::Glib;
use crate::config::EngineConfig;
use crate::descriptor::{Ownership, TypeDescriptor};
use crate::errors::{EngineError, Result};
use crate::interop::call::{dispatch, CifKey};
use crate::interop::library::{libraries_loaded, register_static_library, resolve_symbol};
use crate::interop::{Argument, StaticLibrary};
use crate::logging::{self, log_engine_start, log_engine_stop};
use crate::ownership::{self, live_wrappers, refcount_traffic, ObjectTracker, RefcountFns};
use crate::trampoline::{self, live_closures};
use crate::value::Value;
use libffi::middle::Cif;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::thread::{self, ThreadId};

/// State owned by a running engine
pub(crate) struct Engine {
    pub(crate) application_id: String,
    pub(crate) config: EngineConfig,
    pub(crate) objects: ObjectTracker,
    pub(crate) cifs: RefCell<HashMap<CifKey, Rc<Cif>>>,
    calls_made: Cell<usize>,
    marshal_errors: Cell<usize>,
    application: RefCell<Option<Value>>,
}

impl Engine {
    fn new(application_id: &str, config: EngineConfig, refcount: Option<RefcountFns>) -> Self {
        Self {
            application_id: application_id.to_string(),
            config,
            objects: ObjectTracker::new(refcount),
            cifs: RefCell::new(HashMap::new()),
            calls_made: Cell::new(0),
            marshal_errors: Cell::new(0),
            application: RefCell::new(None),
        }
    }

    #[inline]
    pub(crate) fn count_call(&self) {
        self.calls_made.set(self.calls_made.get() + 1);
    }

    #[inline]
    pub(crate) fn count_marshal_error(&self) {
        self.marshal_errors.set(self.marshal_errors.get() + 1);
    }
}

struct Owner {
    thread: ThreadId,
    thread_name: String,
    application_id: String,
}

static OWNER: Lazy<Mutex<Option<Owner>>> = Lazy::new(|| Mutex::new(None));

thread_local! {
    static ENGINE: RefCell<Option<Engine>> = const { RefCell::new(None) };
}

/// Extra inputs to [`start_with`]
#[derive(Default)]
pub struct StartOptions {
    /// Configuration; discovered from the environment when absent
    pub config: Option<EngineConfig>,
    /// In-process symbol tables registered before anything resolves
    pub static_libraries: Vec<(String, StaticLibrary)>,
    /// Retain/release pair overriding `[objects]`
    pub refcount: Option<RefcountFns>,
}

impl StartOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_static_library(mut self, name: &str, library: StaticLibrary) -> Self {
        self.static_libraries.push((name.to_string(), library));
        self
    }

    pub fn with_refcount(mut self, fns: RefcountFns) -> Self {
        self.refcount = Some(fns);
        self
    }
}

/// Engine counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InteropStats {
    pub calls_made: usize,
    pub marshal_errors: usize,
    pub libraries_loaded: usize,
    pub live_wrappers: usize,
    pub live_closures: usize,
    pub retains: u64,
    pub releases: u64,
}

/// Start the engine with a discovered configuration
pub fn start(application_id: &str) -> Result<()> {
    start_with(application_id, StartOptions::default())
}

/// Start the engine on the calling thread
pub fn start_with(application_id: &str, options: StartOptions) -> Result<()> {
    validate_application_id(application_id)?;
    let config = options.config.unwrap_or_else(EngineConfig::discover);
    logging::init_with_config(config.logging.to_log_config());

    {
        let mut owner = OWNER.lock();
        if let Some(running) = owner.as_ref() {
            return Err(EngineError::AlreadyStarted {
                application_id: running.application_id.clone(),
            });
        }
        let current = thread::current();
        *owner = Some(Owner {
            thread: current.id(),
            thread_name: current.name().unwrap_or("<unnamed>").to_string(),
            application_id: application_id.to_string(),
        });
    }

    for (name, library) in options.static_libraries {
        register_static_library(&name, library);
    }
    ownership::reset_traffic();
    ENGINE.with(|slot| {
        *slot.borrow_mut() = Some(Engine::new(application_id, config, options.refcount));
    });

    if let Err(e) = run_start_hooks() {
        tracing::error!(target: "nativebridge::lifecycle", error = %e, "start hook failed");
        teardown();
        return Err(e);
    }
    log_engine_start(application_id);
    Ok(())
}

fn run_start_hooks() -> Result<()> {
    with_engine(|engine| {
        if let Some(init) = &engine.config.runtime.init {
            let address = resolve_symbol(&engine.config, &init.library, &init.symbol)?;
            dispatch(engine, address, &[], &TypeDescriptor::Void)?;
        }

        if let Some(app) = &engine.config.runtime.application {
            let address = resolve_symbol(&engine.config, &app.library, &app.constructor)?;
            let args = [
                Argument::new(TypeDescriptor::string(Ownership::Borrowed), engine.application_id.as_str()),
                Argument::new(TypeDescriptor::i32(), app.flags),
            ];
            let application = dispatch(engine, address, &args, &TypeDescriptor::object(Ownership::Owned))?;
            *engine.application.borrow_mut() = Some(application);
        }
        Ok(())
    })
}

/// Stop the engine
///
/// Runs the shutdown hook, drops the application object and every
/// registered callable, and forgets all wrapper identities. Must not be
/// called from inside a callback.
pub fn stop() {
    let (application_id, wrappers, closures) = with_engine(|engine| {
        if let Some(shutdown) = &engine.config.runtime.shutdown {
            let result = resolve_symbol(&engine.config, &shutdown.library, &shutdown.symbol)
                .and_then(|address| dispatch(engine, address, &[], &TypeDescriptor::Void));
            if let Err(e) = result {
                tracing::warn!(target: "nativebridge::lifecycle", error = %e, "shutdown hook failed");
            }
        }
        (engine.application_id.clone(), live_wrappers(), live_closures())
    });

    teardown();
    log_engine_stop(&application_id, wrappers, closures);
}

fn teardown() {
    let engine = ENGINE.with(|slot| match slot.try_borrow_mut() {
        Ok(mut slot) => slot.take(),
        Err(_) => panic!("nativebridge: stop() called while an engine call is in progress"),
    });

    if let Some(engine) = engine {
        // released with no engine borrow held
        let application = engine.application.borrow_mut().take();
        drop(application);
        drop(engine);
    }
    let retired = trampoline::retire_all();
    if retired > 0 {
        tracing::debug!(target: "nativebridge::lifecycle", retired, "closures retired");
    }
    ownership::clear_wrappers();
    *OWNER.lock() = None;
}

/// Whether an engine is running on the calling thread
pub fn is_running() -> bool {
    ENGINE
        .try_with(|slot| slot.try_borrow().map(|e| e.is_some()).unwrap_or(true))
        .unwrap_or(false)
}

/// Run `f` against the running engine
///
/// # Panics
/// If no engine runs on this thread.
pub(crate) fn with_engine<R>(f: impl FnOnce(&Engine) -> R) -> R {
    ENGINE.with(|slot| {
        let engine = slot.borrow();
        match engine.as_ref() {
            Some(engine) => f(engine),
            None => panic!("{}", misuse_message()),
        }
    })
}

/// Like [`with_engine`], but `None` instead of a panic
pub(crate) fn try_with_engine<R>(f: impl FnOnce(&Engine) -> R) -> Option<R> {
    ENGINE
        .try_with(|slot| {
            let engine = slot.try_borrow().ok()?;
            engine.as_ref().map(f)
        })
        .ok()
        .flatten()
}

fn misuse_message() -> String {
    let current = thread::current();
    match OWNER.lock().as_ref() {
        Some(owner) if owner.thread != current.id() => format!(
            "nativebridge: engine for '{}' is bound to thread '{}' ({:?}), used from '{}' ({:?})",
            owner.application_id,
            owner.thread_name,
            owner.thread,
            current.name().unwrap_or("<unnamed>"),
            current.id()
        ),
        _ => "nativebridge: engine not running; call start() first".to_string(),
    }
}

/// Run one iteration of the default GLib main context
///
/// Returns whether any event was dispatched.
pub fn iterate(may_block: bool) -> Result<bool> {
    with_engine(|engine| Glib::new(&engine.config).main_context_iteration(may_block))
}

/// Application object created by the configured constructor
pub fn application() -> Option<Value> {
    with_engine(|engine| engine.application.borrow().clone())
}

pub fn stats() -> InteropStats {
    with_engine(|engine| {
        let (retains, releases) = refcount_traffic();
        InteropStats {
            calls_made: engine.calls_made.get(),
            marshal_errors: engine.marshal_errors.get(),
            libraries_loaded: libraries_loaded(),
            live_wrappers: live_wrappers(),
            live_closures: live_closures(),
            retains,
            releases,
        }
    })
}

/// GApplication id rules
pub fn validate_application_id(id: &str) -> Result<()> {
    let invalid = || EngineError::InvalidApplicationId { id: id.to_string() };
    if id.is_empty() || id.len() > 255 {
        return Err(invalid());
    }

    let mut elements = 0;
    for element in id.split('.') {
        let mut chars = element.chars();
        match chars.next() {
            None => return Err(invalid()),
            Some(c) if c.is_ascii_digit() => return Err(invalid()),
            Some(_) => {}
        }
        if !element
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(invalid());
        }
        elements += 1;
    }

    if elements < 2 {
        return Err(invalid());
    }
    Ok(())
}
