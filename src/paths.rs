//! Where Visun keeps its config file, SQLite database and logs.
//!
//! `VISUN_CONFIG_DIR`, `VISUN_DATA_DIR` and `VISUN_STATE_DIR` win when set to
//! an absolute path. Otherwise the platform base directories from `etcetera`
//! are used, each with a `visun` subdirectory.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const APP_DIR: &str = "visun";

/// Directories resolved at startup and carried on `Config`.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Config directory: config.toml lives here
    pub config_dir: PathBuf,

    /// Data directory: the SQLite database
    pub data_dir: PathBuf,

    /// State directory: logs
    pub state_dir: PathBuf,
}

impl Paths {
    /// Resolve all paths using real environment variables.
    pub fn resolve() -> Result<Self> {
        Self::resolve_with_env(|key| std::env::var(key))
    }

    /// Same as `resolve`, reading variables through `env_fn`.
    pub fn resolve_with_env<F>(env_fn: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        use etcetera::BaseStrategy;

        let strategy = etcetera::choose_base_strategy()
            .map_err(|e| anyhow::anyhow!("Failed to determine base directories: {}", e))?;

        let config_dir = override_or(&env_fn, "VISUN_CONFIG_DIR", || {
            strategy.config_dir().join(APP_DIR)
        });
        let data_dir = override_or(&env_fn, "VISUN_DATA_DIR", || {
            strategy.data_dir().join(APP_DIR)
        });
        // macOS and Windows have no state dir; logs go under data there.
        let state_dir = override_or(&env_fn, "VISUN_STATE_DIR", || {
            strategy
                .state_dir()
                .unwrap_or_else(|| strategy.data_dir())
                .join(APP_DIR)
        });

        Ok(Self {
            config_dir,
            data_dir,
            state_dir,
        })
    }

    /// Config file: config_dir/config.toml
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Database: data_dir/visun.sqlite
    pub fn database(&self) -> PathBuf {
        self.data_dir.join("visun.sqlite")
    }

    /// Logs directory
    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    /// Everything under one directory, as `config/`, `data/` and `state/`.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            config_dir: root.join("config"),
            data_dir: root.join("data"),
            state_dir: root.join("state"),
        }
    }

    /// Create missing directories, private to the current user.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.config_dir, &self.data_dir, &self.state_dir] {
            create_private_dir(dir)?;
        }
        Ok(())
    }
}

impl Default for Paths {
    /// Falls back to `~/.visun` (or `./.visun` without a home) when the
    /// platform directories cannot be determined.
    fn default() -> Self {
        Self::resolve().unwrap_or_else(|e| {
            let home = etcetera::home_dir().unwrap_or_else(|_| PathBuf::from("."));
            let root = home.join(format!(".{}", APP_DIR));
            tracing::warn!("{:#}; using {}", e, root.display());
            Self::rooted_at(&root)
        })
    }
}

/// The variable's value when it is a non-empty absolute path, else `default()`.
fn override_or<F>(env_fn: &F, var: &str, default: impl FnOnce() -> PathBuf) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    env_fn(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .unwrap_or_else(default)
}

fn create_private_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}
