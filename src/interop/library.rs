//! Dynamic library loading and symbol resolution
//!
//! Libraries are opened once through `libloading` and kept for the rest of
//! the process; unloading a library that still has live trampolines or
//! wrappers pointing into it is never safe. Static libraries are tables of
//! in-process `extern "C"` functions that shadow dynamic loading.

use crate::config::EngineConfig;
use crate::errors::{EngineError, Result};
use crate::logging::log_library_loaded;
use dashmap::DashMap;
use libloading::Library;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::os::raw::c_void;
use std::path::Path;
use std::sync::Arc;

static LOADED: Lazy<DashMap<String, Arc<Library>>> = Lazy::new(DashMap::new);
static SYMBOLS: Lazy<DashMap<(String, String), usize>> = Lazy::new(DashMap::new);
static STATIC_LIBRARIES: Lazy<DashMap<String, Arc<StaticLibrary>>> = Lazy::new(DashMap::new);

#[cfg(target_os = "macos")]
const EXTENSIONS: &[&str] = &[".dylib", ".so"];
#[cfg(target_os = "windows")]
const EXTENSIONS: &[&str] = &[".dll"];
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
const EXTENSIONS: &[&str] = &[".so"];

/// Table of in-process native functions registered under a library name
#[derive(Debug, Default, Clone)]
pub struct StaticLibrary {
    symbols: HashMap<String, usize>,
}

impl StaticLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function; `address` is an `extern "C" fn` cast to a pointer
    pub fn symbol(mut self, name: &str, address: *const c_void) -> Self {
        self.symbols.insert(name.to_string(), address as usize);
        self
    }

    pub fn get(&self, name: &str) -> Option<usize> {
        self.symbols.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// Register (or replace) a static library
pub fn register_static_library(name: &str, library: StaticLibrary) {
    tracing::debug!(
        target: "nativebridge::library",
        name,
        symbols = library.len(),
        "static library registered"
    );
    STATIC_LIBRARIES.insert(name.to_string(), Arc::new(library));
}

/// Number of dynamic libraries opened so far
pub fn libraries_loaded() -> usize {
    LOADED.len()
}

/// Open `name` (after alias resolution), reusing a previous load
pub fn load_library(config: &EngineConfig, name: &str) -> Result<Arc<Library>> {
    let resolved = config.resolve_alias(name);
    if let Some(library) = LOADED.get(resolved) {
        return Ok(Arc::clone(library.value()));
    }

    let mut last_error = None;
    for candidate in candidates(config, resolved) {
        // SAFETY: running library initializers is inherent to dynamic loading
        match unsafe { Library::new(&candidate) } {
            Ok(library) => {
                log_library_loaded(name, &candidate);
                let library = Arc::new(library);
                let entry = LOADED
                    .entry(resolved.to_string())
                    .or_insert_with(|| Arc::clone(&library));
                return Ok(Arc::clone(entry.value()));
            }
            Err(e) => last_error = Some(e.to_string()),
        }
    }

    Err(EngineError::LibraryLoad {
        library: name.to_string(),
        reason: last_error.unwrap_or_else(|| "no candidate paths".to_string()),
    })
}

/// File names tried for a library, in order
fn candidates(config: &EngineConfig, name: &str) -> Vec<String> {
    let mut names = vec![name.to_string()];
    let has_extension = EXTENSIONS.iter().any(|ext| name.contains(ext));
    if !has_extension {
        names.extend(EXTENSIONS.iter().map(|ext| format!("{}{}", name, ext)));
    }

    if !Path::new(name).is_absolute() {
        let bare = names.clone();
        for dir in &config.libraries.search_paths {
            for file in &bare {
                names.push(Path::new(dir).join(file).to_string_lossy().into_owned());
            }
        }
    }
    names
}

/// Resolve a function address in `library`
pub fn resolve_symbol(config: &EngineConfig, library: &str, symbol: &str) -> Result<usize> {
    let resolved = config.resolve_alias(library);
    if let Some(table) = STATIC_LIBRARIES
        .get(library)
        .or_else(|| STATIC_LIBRARIES.get(resolved))
    {
        return table.get(symbol).ok_or_else(|| {
            EngineError::symbol(library, symbol, "not present in static library")
        });
    }

    let key = (resolved.to_string(), symbol.to_string());
    if let Some(address) = SYMBOLS.get(&key) {
        return Ok(*address);
    }

    let handle = load_library(config, library).map_err(|e| match e {
        EngineError::LibraryLoad { reason, .. } => EngineError::symbol(library, symbol, reason),
        other => other,
    })?;

    // SAFETY: the symbol is only ever used as an opaque code address
    let address = unsafe {
        handle
            .get::<unsafe extern "C" fn()>(symbol.as_bytes())
            .map(|f| *f as usize)
            .map_err(|e| EngineError::symbol(library, symbol, e.to_string()))?
    };

    if address == 0 {
        return Err(EngineError::symbol(library, symbol, "resolved to NULL"));
    }
    SYMBOLS.insert(key, address);
    Ok(address)
}

/// Resolve a function that may legitimately be absent
pub fn lookup_symbol(config: &EngineConfig, library: &str, symbol: &str) -> Option<usize> {
    resolve_symbol(config, library, symbol).ok()
}
