//! Helper configuration file and runtime directory.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Env var overriding the runtime directory (socket + PID file).
pub const RUNTIME_DIR_ENV: &str = "WARDEN_RUNTIME_DIR";

/// Optional TOML configuration (`~/.config/warden/config.toml`).
///
/// Every key is optional; command line values take precedence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HelperConfig {
    pub socket: Option<String>,
    /// Seconds without connections before the helper exits (0 = never).
    pub idle_timeout: Option<u64>,
    pub accept_timeout_ms: Option<u64>,
    pub worker_idle_timeout: Option<u64>,
    pub shutdown_grace: Option<u64>,
    /// Seconds between background remote-config polls (0 = disabled).
    pub rc_poll_interval: Option<u64>,
}

impl HelperConfig {
    /// Load from an explicit path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid TOML.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("failed to read {}: {e}", path.display()))?;
        toml::from_str(&content).map_err(|e| eyre::eyre!("failed to parse {}: {e}", path.display()))
    }

    /// Load the explicit file if given, otherwise the default file when it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if a file that exists cannot be parsed, or if an
    /// explicitly given file is missing.
    pub fn resolve(explicit: Option<&Path>) -> crate::Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }
}

#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("warden").join("config.toml"))
}

/// Returns the warden runtime directory (`~/.warden/`).
/// Respects `WARDEN_RUNTIME_DIR` env override for testing.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn runtime_dir() -> std::io::Result<PathBuf> {
    if let Ok(dir) = std::env::var(RUNTIME_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }

    dirs::home_dir().map(|h| h.join(".warden")).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "cannot determine home directory",
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::EnvGuard;

    #[test]
    fn parses_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "idle_timeout = 0\nsocket = \"@warden\"\n").unwrap();

        let config = HelperConfig::load(&path).unwrap();
        assert_eq!(config.idle_timeout, Some(0));
        assert_eq!(config.socket.as_deref(), Some("@warden"));
        assert_eq!(config.rc_poll_interval, None);
    }

    #[test]
    fn rejects_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "threshold = 0.5\n").unwrap();
        assert!(HelperConfig::load(&path).is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(HelperConfig::resolve(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn runtime_dir_respects_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let _guard = EnvGuard::new(dir.path());
        assert_eq!(runtime_dir().unwrap(), dir.path().to_path_buf());
    }
}
