use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Base directory for relative source paths.
pub const ENV_DATA_DIR: &str = "BUBBALOOP_REPLAY_DATA_DIR";
/// Overrides the configured cache budget, in bytes.
pub const ENV_CACHE_BYTES: &str = "BUBBALOOP_REPLAY_CACHE_BYTES";

/// Environment captured once at startup and passed down explicitly.
///
/// Provider construction and the Player read settings from here rather
/// than from the process environment, so tests can build their own.
#[derive(Debug, Clone, Default)]
pub struct ReplayContext {
    vars: HashMap<String, String>,
}

impl ReplayContext {
    /// Snapshot the process environment.
    pub fn from_env() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.var(ENV_DATA_DIR).map(Path::new)
    }

    /// Resolve a source path against the data directory when it is relative.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        match self.data_dir() {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }

    pub fn cache_budget_override(&self) -> Option<u64> {
        let raw = self.var(ENV_CACHE_BYTES)?;
        match raw.parse() {
            Ok(bytes) => Some(bytes),
            Err(_) => {
                log::warn!("Ignoring {ENV_CACHE_BYTES}={raw}: not a byte count");
                None
            }
        }
    }
}
