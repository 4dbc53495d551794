//! Centralized path resolution for phoenix
//!
//! # Environment Variables
//!
//! - `PHOENIX_CONFIG_DIR` - Override config directory
//! - `PHOENIX_STATE_DIR` - Override state directory (locks, CA scratch files)
//!
//! # Path Resolution Priority
//!
//! For config_dir():
//! 1. `PHOENIX_CONFIG_DIR` environment variable
//! 2. `XDG_CONFIG_HOME/phoenix` (if set)
//! 3. `/usr/local/phoenix_hypervisor/etc`
//!
//! For state_dir():
//! 1. `PHOENIX_STATE_DIR` environment variable
//! 2. `XDG_STATE_HOME/phoenix` (if set)
//! 3. `/var/lib/phoenix`

use std::path::{Path, PathBuf};

/// Environment variable for config directory override
pub const ENV_CONFIG_DIR: &str = "PHOENIX_CONFIG_DIR";

/// Environment variable for state directory override
pub const ENV_STATE_DIR: &str = "PHOENIX_STATE_DIR";

/// Name of the settings file inside the config directory
pub const SETTINGS_FILE: &str = "phoenix.toml";

const SYSTEM_CONFIG_DIR: &str = "/usr/local/phoenix_hypervisor/etc";
const SYSTEM_STATE_DIR: &str = "/var/lib/phoenix";

/// Get the phoenix config directory path
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(ENV_CONFIG_DIR) {
        let path = expand(&dir);
        log::debug!(
            "Using config dir from {}: {}",
            ENV_CONFIG_DIR,
            path.display()
        );
        return path;
    }

    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        let path = PathBuf::from(xdg_config).join("phoenix");
        log::debug!("Using XDG_CONFIG_HOME: {}", path.display());
        return path;
    }

    let path = PathBuf::from(SYSTEM_CONFIG_DIR);
    log::debug!("Using default config dir: {}", path.display());
    path
}

/// Get the phoenix state directory path
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(ENV_STATE_DIR) {
        let path = expand(&dir);
        log::debug!("Using state dir from {}: {}", ENV_STATE_DIR, path.display());
        return path;
    }

    if let Ok(xdg_state) = std::env::var("XDG_STATE_HOME") {
        let path = PathBuf::from(xdg_state).join("phoenix");
        log::debug!("Using XDG_STATE_HOME: {}", path.display());
        return path;
    }

    let path = PathBuf::from(SYSTEM_STATE_DIR);
    log::debug!("Using default state dir: {}", path.display());
    path
}

/// Settings file: explicit path if given, else `phoenix.toml` in [`config_dir`]
pub fn settings_file(explicit: Option<&Path>) -> PathBuf {
    match explicit {
        Some(path) => expand(&path.to_string_lossy()),
        None => config_dir().join(SETTINGS_FILE),
    }
}

/// Expand ~ and environment variables in a path string.
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}

/// Resolve `path` against `base` unless it is already absolute
pub fn resolve_against(base: &Path, path: &str) -> PathBuf {
    let expanded = expand(path);
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    /// Serialises tests that touch process environment
    pub(crate) static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Run `f` with `key` set (or removed for `None`), restoring it afterwards
    pub(crate) fn with_env<F, R>(key: &str, value: Option<&str>, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let original = env::var(key).ok();
        // SAFETY: guarded by ENV_LOCK; no other test thread touches the environment
        unsafe {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
        let result = f();
        // SAFETY: as above
        unsafe {
            match original {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
        result
    }

    #[test]
    fn test_config_dir_env_override() {
        with_env(ENV_CONFIG_DIR, Some("/custom/config/path"), || {
            assert_eq!(config_dir(), PathBuf::from("/custom/config/path"));
        });
    }

    #[test]
    fn test_config_dir_env_override_with_tilde() {
        let home = dirs::home_dir().unwrap();
        with_env(ENV_CONFIG_DIR, Some("~/phoenix-tilde-test"), || {
            assert_eq!(config_dir(), home.join("phoenix-tilde-test"));
        });
    }

    #[test]
    fn test_state_dir_env_override() {
        with_env(ENV_STATE_DIR, Some("/custom/state"), || {
            assert_eq!(state_dir(), PathBuf::from("/custom/state"));
        });
    }

    #[test]
    fn test_settings_file_prefers_explicit_path() {
        assert_eq!(
            settings_file(Some(Path::new("/etc/phoenix/custom.toml"))),
            PathBuf::from("/etc/phoenix/custom.toml")
        );
        with_env(ENV_CONFIG_DIR, Some("/cfg"), || {
            assert_eq!(settings_file(None), PathBuf::from("/cfg/phoenix.toml"));
        });
    }

    #[test]
    fn test_resolve_against() {
        let base = Path::new("/usr/local/phoenix_hypervisor/etc");
        assert_eq!(
            resolve_against(base, "phoenix_lxc_configs.json"),
            base.join("phoenix_lxc_configs.json")
        );
        assert_eq!(
            resolve_against(base, "/srv/lxc.json"),
            PathBuf::from("/srv/lxc.json")
        );
    }
}
