//! Engine error taxonomy
//!
//! Resolution and marshaling failures are recoverable at the call site.
//! Native failures reported through an error out-parameter are *not*
//! engine errors: they surface as a populated reference cell and are
//! decoded with [`NativeCallError::from_value`].

use crate::value::Value;
use std::ffi::CStr;
use std::fmt;
use std::os::raw::{c_char, c_void};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Library could not be opened
    LibraryLoad { library: String, reason: String },
    /// Symbol missing from an opened library
    SymbolResolution { library: String, symbol: String, reason: String },
    /// Value incompatible with its descriptor's native shape
    Marshal { expected: String, found: String, context: String },
    /// Descriptor that can never be marshaled
    InvalidDescriptor { reason: String },
    InvalidApplicationId { id: String },
    AlreadyStarted { application_id: String },
    Config { reason: String },
}

impl EngineError {
    pub fn marshal(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::Marshal {
            expected: expected.into(),
            found: found.into(),
            context: String::new(),
        }
    }

    pub fn invalid_descriptor(reason: impl Into<String>) -> Self {
        Self::InvalidDescriptor { reason: reason.into() }
    }

    pub fn symbol(library: &str, symbol: &str, reason: impl Into<String>) -> Self {
        Self::SymbolResolution {
            library: library.to_string(),
            symbol: symbol.to_string(),
            reason: reason.into(),
        }
    }

    /// Attach the argument position or field the failure belongs to
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        if let Self::Marshal { context, .. } = &mut self {
            let ctx = ctx.into();
            if context.is_empty() {
                *context = ctx;
            } else {
                *context = format!("{}: {}", ctx, context);
            }
        }
        self
    }

    /// Whether the failure happened while converting a value
    pub fn is_marshal(&self) -> bool {
        matches!(self, Self::Marshal { .. })
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LibraryLoad { library, reason } => {
                write!(f, "Failed to load library '{}': {}", library, reason)
            }
            Self::SymbolResolution { library, symbol, reason } => {
                write!(f, "Unable to resolve '{}' in '{}': {}", symbol, library, reason)
            }
            Self::Marshal { expected, found, context } => {
                if context.is_empty() {
                    write!(f, "Cannot marshal {} as {}", found, expected)
                } else {
                    write!(f, "Cannot marshal {} as {} ({})", found, expected, context)
                }
            }
            Self::InvalidDescriptor { reason } => {
                write!(f, "Invalid type descriptor: {}", reason)
            }
            Self::InvalidApplicationId { id } => {
                write!(f, "Invalid application id: '{}'", id)
            }
            Self::AlreadyStarted { application_id } => {
                write!(f, "Engine already started for '{}'", application_id)
            }
            Self::Config { reason } => write!(f, "Configuration error: {}", reason),
        }
    }
}

impl std::error::Error for EngineError {}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Failure reported by native code through an error out-parameter
///
/// Layout mirrors GError: `{ u32 domain; i32 code; char *message; }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCallError {
    pub domain: u32,
    pub code: i32,
    pub message: String,
}

#[repr(C)]
struct RawError {
    domain: u32,
    code: i32,
    message: *const c_char,
}

impl NativeCallError {
    /// Decode the value left in an error reference cell
    ///
    /// Returns `None` for `Null` (the call succeeded) and for values that
    /// are not pointer-like.
    pub fn from_value(value: &Value) -> Option<Self> {
        let ptr = value.address()?;
        if ptr == 0 {
            return None;
        }
        // SAFETY: a non-null error out-parameter points at a GError
        unsafe { Self::from_raw(ptr as *const c_void) }
    }

    /// # Safety
    /// `ptr` must be null or point at a live GError-layout struct
    pub unsafe fn from_raw(ptr: *const c_void) -> Option<Self> {
        if ptr.is_null() {
            return None;
        }
        let raw = &*(ptr as *const RawError);
        let message = if raw.message.is_null() {
            String::new()
        } else {
            CStr::from_ptr(raw.message).to_string_lossy().into_owned()
        };
        Some(Self {
            domain: raw.domain,
            code: raw.code,
            message,
        })
    }
}

impl fmt::Display for NativeCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "native error {}:{}: {}", self.domain, self.code, self.message)
    }
}
