use crate::errors::{EngineError, Result};
use crate::logging::{parse_level, LogConfig, LogFormat, LogOutput};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// File name looked up by [`EngineConfig::discover`]
pub const CONFIG_FILE_NAME: &str = "nativebridge.toml";

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "NATIVEBRIDGE_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub libraries: LibrariesConfig,

    #[serde(default)]
    pub objects: ObjectsConfig,

    #[serde(default)]
    pub glib: GlibConfig,

    /// Copy/free overrides keyed by boxed type name
    #[serde(default)]
    pub boxed: HashMap<String, BoxedFunctionsConfig>,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LibrariesConfig {
    /// Short names mapped to loadable file names (`gtk = "libgtk-4.so.1"`)
    #[serde(default)]
    pub aliases: HashMap<String, String>,

    /// Directories tried when a bare name fails to load
    #[serde(default)]
    pub search_paths: Vec<String>,
}

/// Retain/release pair for reference-counted objects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectsConfig {
    #[serde(default = "default_gobject_library")]
    pub library: String,

    #[serde(default = "default_retain")]
    pub retain: String,

    #[serde(default = "default_release")]
    pub release: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlibConfig {
    #[serde(default = "default_glib_library")]
    pub library: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoxedFunctionsConfig {
    #[serde(default)]
    pub copy: Option<String>,

    #[serde(default)]
    pub free: Option<String>,
}

/// A native function named by library and symbol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolRef {
    pub library: String,
    pub symbol: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Zero-argument function called during `start`
    #[serde(default)]
    pub init: Option<SymbolRef>,

    /// Zero-argument function called during `stop`
    #[serde(default)]
    pub shutdown: Option<SymbolRef>,

    /// Application object constructor, `fn(const char *id, int flags) -> object`
    #[serde(default)]
    pub application: Option<ApplicationConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub library: String,
    pub constructor: String,
    #[serde(default)]
    pub flags: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Directory for rolling log files; stderr when absent
    #[serde(default)]
    pub directory: Option<String>,

    #[serde(default)]
    pub filter: Option<String>,
}

impl Default for ObjectsConfig {
    fn default() -> Self {
        Self {
            library: default_gobject_library(),
            retain: default_retain(),
            release: default_release(),
        }
    }
}

impl Default for GlibConfig {
    fn default() -> Self {
        Self {
            library: default_glib_library(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::Compact,
            directory: None,
            filter: None,
        }
    }
}

fn default_gobject_library() -> String { "libgobject-2.0.so.0".to_string() }
fn default_glib_library() -> String { "libglib-2.0.so.0".to_string() }
fn default_retain() -> String { "g_object_ref".to_string() }
fn default_release() -> String { "g_object_unref".to_string() }
fn default_level() -> String { "info".to_string() }

impl LoggingConfig {
    /// Convert to the logging module's runtime configuration
    pub fn to_log_config(&self) -> LogConfig {
        let mut config = LogConfig::new()
            .with_level(parse_level(&self.level).unwrap_or(tracing::Level::INFO))
            .with_format(self.format);
        if let Some(directory) = &self.directory {
            config = config.with_output(LogOutput::File {
                directory: directory.clone(),
                prefix: "nativebridge".to_string(),
            });
        }
        if let Some(filter) = &self.filter {
            config = config.with_filter(filter.clone());
        }
        config
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| EngineError::Config {
            reason: format!("Failed to read {}: {}", path.display(), e),
        })?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML string
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| EngineError::Config {
            reason: format!("Failed to parse config: {}", e),
        })
    }

    /// Find configuration: `$NATIVEBRIDGE_CONFIG`, then `nativebridge.toml`
    /// in the current directory or any parent, else defaults
    pub fn discover() -> Self {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            match Self::load(Path::new(&path)) {
                Ok(config) => return config,
                Err(e) => tracing::warn!(path, error = %e, "ignoring unreadable config"),
            }
        }

        let mut current = std::env::current_dir().ok();
        while let Some(dir) = current {
            let candidate = dir.join(CONFIG_FILE_NAME);
            if candidate.exists() {
                if let Ok(config) = Self::load(&candidate) {
                    return config;
                }
            }
            current = dir.parent().map(PathBuf::from);
        }

        Self::default()
    }

    /// Resolve a library alias; unknown names pass through unchanged
    pub fn resolve_alias<'a>(&'a self, name: &'a str) -> &'a str {
        self.libraries
            .aliases
            .get(name)
            .map(String::as_str)
            .unwrap_or(name)
    }

    /// Generate default configuration file content
    pub fn generate_default() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate config"))
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| EngineError::Config {
            reason: format!("Failed to serialize config: {}", e),
        })?;

        fs::write(path, content).map_err(|e| EngineError::Config {
            reason: format!("Failed to write {}: {}", path.display(), e),
        })
    }
}
