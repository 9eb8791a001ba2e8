use std::io;
use std::path::{Path, PathBuf};

use directories::{BaseDirs, ProjectDirs};

/// Overrides the log directory; an empty value disables file logging.
pub const LOG_DIR_ENV: &str = "ORCTERM_LOG_DIR";

pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "orcterm", "orcterm").map(|dirs| dirs.config_dir().to_path_buf())
}

pub fn known_hosts_file() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("known_hosts"))
}

pub fn settings_file() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("settings.toml"))
}

/// Create the config directory (owner-only on Unix) and return it
pub fn ensure_config_dir() -> io::Result<PathBuf> {
    let dir = config_dir().ok_or_else(|| missing("config"))?;
    create_private_dir(&dir)?;
    Ok(dir)
}

/// `~/` prefixed paths resolve against the home directory
pub fn expand_tilde(path: &str) -> PathBuf {
    let home = BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .or_else(|| std::env::var_os("HOME").map(PathBuf::from));

    match (path.strip_prefix("~/"), home) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

pub fn log_dir() -> Option<PathBuf> {
    match std::env::var(LOG_DIR_ENV) {
        Ok(raw) if raw.trim().is_empty() => None,
        Ok(raw) => Some(PathBuf::from(raw.trim())),
        Err(_) => config_dir().map(|dir| dir.join("logs")),
    }
}

pub fn ensure_log_dir() -> io::Result<PathBuf> {
    let dir = log_dir().ok_or_else(|| missing("log"))?;
    create_private_dir(&dir)?;
    Ok(dir)
}

fn missing(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("Could not determine {what} directory"),
    )
}

fn create_private_dir(dir: &Path) -> io::Result<()> {
    if dir.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}
