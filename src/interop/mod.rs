//! Interoperability - call native C-ABI functions described at runtime
//!
//! Architecture:
//! - `types.rs` - native slot types and the untyped slot union
//! - `library.rs` - library loading, symbol resolution, static libraries
//! - `marshal.rs` - managed values <-> native slots, out-parameters
//! - `call.rs` - dispatch through cached libffi call interfaces

mod types;
pub(crate) mod call;
pub(crate) mod library;
pub(crate) mod marshal;

pub use call::{call, call_address};
pub use library::{libraries_loaded, load_library, register_static_library, resolve_symbol, StaticLibrary};
pub use marshal::Argument;
pub use types::{NativeSlot, SlotType};
