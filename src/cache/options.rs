//! Cache Options
//!
//! Backend-scoped default options layered with caller overrides.
//!
//! The defaults live in a map keyed by backend name. Callers never mutate
//! it; an [`OptionsBuilder`] copies the defaults and deep-merges override
//! layers on top, in the order they were added.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::key::PartTagSet;
use crate::error::{Error, Result};

/// Where cache options live inside an application config document
pub const OPTIONS_NAMESPACE: &str = "cache.options";

/// Disk-backed backend name
pub const CACHE_FS: &str = "cache_fs";

/// Memory-backed backend name
pub const CACHE_MEMBUF: &str = "cache_membuf";

/// Option holding the cache working path
pub const CACHE_PATH_OPTION: &str = "cache_path";

/// Default buffer pool capacity (1GB)
pub const DEFAULT_MEMBUF_CAPACITY: u64 = 1024 * 1024 * 1024;

/// Default buffer pool page size (128MB)
pub const DEFAULT_MEMBUF_PAGE_SIZE: u64 = 128 * 1024 * 1024;

/// Directory relative cache paths are resolved against
static APP_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
});

/// Application root directory
pub fn app_root() -> &'static Path {
    APP_ROOT.as_path()
}

/// Resolve a configured cache path.
///
/// Absent stays absent, absolute paths are used verbatim, relative paths are
/// joined onto `root`.
pub fn resolve_cache_path(value: Option<&str>, root: &Path) -> Option<PathBuf> {
    let value = value?;
    let path = Path::new(value);
    if path.is_absolute() {
        Some(path.to_path_buf())
    } else {
        Some(root.join(path))
    }
}

/// Buffer-pool backend options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MembufOptions {
    /// Total pool capacity in bytes
    pub capacity: u64,
    /// Page size in bytes (largest single part)
    pub page_size: u64,
    /// Accepted part tags
    pub part_tags: PartTagSet,
    /// Accept cluster workers
    pub cluster: bool,
}

impl Default for MembufOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_MEMBUF_CAPACITY,
            page_size: DEFAULT_MEMBUF_PAGE_SIZE,
            part_tags: PartTagSet::default(),
            cluster: false,
        }
    }
}

/// Disk backend options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsOptions {
    /// Accepted part tags
    pub part_tags: PartTagSet,
}

/// Built-in default options, keyed by backend name
pub fn default_options() -> Map<String, Value> {
    let mut map = Map::new();
    // Serializing plain structs of primitives cannot fail
    map.insert(
        CACHE_FS.to_string(),
        serde_json::to_value(FsOptions::default()).unwrap_or(Value::Null),
    );
    map.insert(
        CACHE_MEMBUF.to_string(),
        serde_json::to_value(MembufOptions::default()).unwrap_or(Value::Null),
    );
    map
}

/// Resolved, layered cache options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheOptions {
    values: Map<String, Value>,
}

impl CacheOptions {
    /// Built-in defaults with no overrides
    pub fn defaults() -> Self {
        Self {
            values: default_options(),
        }
    }

    /// Start building options from the defaults
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::new()
    }

    /// Look up a value by dotted path (`cache_membuf.capacity`)
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.values.get(first)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// Check if a top-level key is present
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Raw cache path option
    pub fn cache_path(&self) -> Option<&str> {
        self.values.get(CACHE_PATH_OPTION).and_then(Value::as_str)
    }

    /// Cache path resolved against the application root
    pub fn resolved_cache_path(&self) -> Option<PathBuf> {
        resolve_cache_path(self.cache_path(), app_root())
    }

    /// Deserialize one backend's option section
    pub fn backend<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T> {
        match self.values.get(name) {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| Error::Config(format!("invalid options for {}: {}", name, e))),
            None => Ok(T::default()),
        }
    }

    /// All option values
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }
}

/// Layers overrides onto the default options map
#[derive(Debug, Clone)]
pub struct OptionsBuilder {
    layers: Vec<Value>,
}

impl Default for OptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OptionsBuilder {
    /// Builder starting from the built-in defaults
    pub fn new() -> Self {
        Self {
            layers: vec![Value::Object(default_options())],
        }
    }

    /// Builder starting from nothing
    pub fn empty() -> Self {
        Self { layers: Vec::new() }
    }

    /// Layer the section found at [`OPTIONS_NAMESPACE`] of an application
    /// config document. A document without that section adds nothing.
    pub fn with_config(mut self, document: &Value) -> Self {
        let mut current = Some(document);
        for part in OPTIONS_NAMESPACE.split('.') {
            current = current.and_then(|v| v.get(part));
        }
        if let Some(section) = current {
            self.layers.push(section.clone());
        }
        self
    }

    /// Layer an override object
    pub fn with_overrides(mut self, overrides: Value) -> Self {
        self.layers.push(overrides);
        self
    }

    /// Layer a single value at a dotted path
    pub fn set(self, path: &str, value: impl Into<Value>) -> Self {
        let mut layer = value.into();
        for part in path.rsplit('.') {
            let mut map = Map::new();
            map.insert(part.to_string(), layer);
            layer = Value::Object(map);
        }
        self.with_overrides(layer)
    }

    /// Merge every layer into a fresh options map
    pub fn build(self) -> Result<CacheOptions> {
        let mut merged = Value::Object(Map::new());
        for layer in self.layers {
            if !layer.is_object() {
                return Err(Error::Config(format!(
                    "option overrides must be an object, got {}",
                    layer
                )));
            }
            deep_merge(&mut merged, layer);
        }
        match merged {
            Value::Object(values) => Ok(CacheOptions { values }),
            _ => Err(Error::Internal("merged options are not an object".into())),
        }
    }
}

/// Recursively merge `overlay` into `base`; non-object values replace.
fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

// =============================================================================
// Tests
// =============================================================================
