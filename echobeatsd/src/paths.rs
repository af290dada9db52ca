//! Where the daemon keeps its files.
//!
//! - Linux: ~/.config/echobeats/
//! - Windows: %APPDATA%\echobeats\
//! - MacOS: ~/Library/Application Support/echobeats/

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::DaemonError;

#[derive(Debug, Clone)]
pub struct AppPaths {
    dir: PathBuf,
}

impl AppPaths {
    pub fn new() -> Result<Self, DaemonError> {
        let base = dirs::config_dir().ok_or(DaemonError::NoConfigDir)?;
        Self::at(base.join("echobeats"))
    }

    /// Rooted at an explicit directory, created if missing.
    pub fn at(dir: impl Into<PathBuf>) -> Result<Self, DaemonError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| DaemonError::io(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.dir.join("config.json")
    }

    pub fn trace_file(&self) -> PathBuf {
        self.dir.join("trace.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_live_under_the_app_dir() {
        let root = std::env::temp_dir().join(format!("echobeatsd-paths-{}", std::process::id()));
        let paths = AppPaths::at(&root).unwrap();
        assert!(paths.dir().is_dir());
        assert_eq!(paths.config_file(), root.join("config.json"));
        assert_eq!(paths.trace_file(), root.join("trace.json"));
        fs::remove_dir_all(&root).ok();
    }
}
