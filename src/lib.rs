//! nativebridge - dynamic foreign-call marshaling for GObject-style libraries
//!
//! Callers describe native signatures with [`TypeDescriptor`] values and
//! invoke functions by library and symbol name:
//!
//! ```no_run
//! use nativebridge::{call, start, stop, Argument, Ownership, TypeDescriptor};
//!
//! start("org.example.Demo").unwrap();
//! let len = call(
//!     "libc.so.6",
//!     "strlen",
//!     &[Argument::new(TypeDescriptor::string(Ownership::Borrowed), "hello")],
//!     &TypeDescriptor::u64(),
//! )
//! .unwrap();
//! assert_eq!(len.as_int(), Some(5));
//! stop();
//! ```
//!
//! Module map, leaves first:
//! - [`descriptor`] - type descriptors
//! - [`memory`] - typed field access and allocation
//! - [`ownership`] - refcount discipline and the wrapper identity cache
//! - [`collections`] - arrays, lists and hash tables
//! - [`interop`] - library loading and the call dispatcher
//! - [`trampoline`] - native-callable closures
//! - [`lifecycle`] - engine start/stop

pub mod collections;
pub mod config;
pub mod descriptor;
pub mod errors;
pub mod interop;
pub mod lifecycle;
pub mod logging;
pub mod memory;
pub mod ownership;
pub mod trampoline;
pub mod value;

#[cfg(test)]
pub(crate) mod testing;

pub use config::EngineConfig;
pub use descriptor::{ContainerKind, FloatWidth, IntWidth, Ownership, TrampolineKind, TypeDescriptor};
pub use errors::{EngineError, NativeCallError, Result};
pub use interop::{call, call_address, register_static_library, Argument, StaticLibrary};
pub use lifecycle::{application, is_running, iterate, start, start_with, stats, stop, InteropStats, StartOptions};
pub use memory::{alloc, read, write};
pub use ownership::{live_wrappers, BoxedHandle, ObjectHandle, RefcountFns};
pub use trampoline::{live_closures, unregister, NativeCallback, RegistrationId};
pub use value::{create_ref, Callable, ReferenceCell, Value};
