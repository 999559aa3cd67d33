use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::DEFAULT_RUNTIME_BASE;

/// Normalized base location of the interpreter installation, always ending in `/`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeLocation(String);

impl RuntimeLocation {
    pub fn default_base() -> Self {
        Self(DEFAULT_RUNTIME_BASE.to_string())
    }

    /// Resolves an optional override against `origin`, falling back to the default base
    pub fn resolve(base: Option<&str>, origin: &Path) -> Self {
        let base = base
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .unwrap_or(DEFAULT_RUNTIME_BASE);
        let with_separator = if base.ends_with('/') {
            base.to_string()
        } else {
            format!("{base}/")
        };

        if Path::new(&with_separator).is_absolute() {
            return Self(with_separator);
        }

        let relative = with_separator.trim_start_matches("./");
        let mut resolved = origin.join(relative).to_string_lossy().into_owned();
        if !resolved.ends_with('/') {
            resolved.push('/');
        }
        Self(resolved)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_RUNTIME_BASE
    }

    /// Path of a file published under this base
    pub fn entry(&self, file: &str) -> PathBuf {
        PathBuf::from(format!("{}{}", self.0, file))
    }
}

impl fmt::Display for RuntimeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
