use std::path::{Path, PathBuf};

pub const DATA_DIR_ENV: &str = "HOOKWORK_DATA_DIR";

/// Platform-specific operations abstracted behind a common interface.
/// Each OS provides its own `NativePlatform` implementation so call sites
/// remain free of `#[cfg]` blocks.
pub trait Platform {
    /// Send a termination signal to the process identified by `pid`.
    fn kill_process(pid: &str) -> std::io::Result<std::process::Output>;

    /// Whether a process with this pid currently exists.
    fn process_alive(pid: &str) -> bool;

    /// Spawn a child that tails / follows a log file.
    fn tail_file(path: &Path) -> std::io::Result<std::process::Child>;

    /// Set restrictive *directory* permissions (0o700 on Unix, no-op on Windows).
    fn restrict_dir_permissions(path: &Path);

    /// Set restrictive *file* permissions (0o600 on Unix, no-op on Windows).
    fn restrict_file_permissions(path: &Path);

    /// Conventional data directory when no override is set.
    /// Unix: `~/.hookwork`, Windows: `%APPDATA%\hookwork`.
    fn default_data_dir() -> Option<PathBuf>;
}

/// `HOOKWORK_DATA_DIR` when set, else the platform default.
pub fn data_dir() -> anyhow::Result<PathBuf> {
    resolve_data_dir(std::env::var_os(DATA_DIR_ENV).map(PathBuf::from))
}

fn resolve_data_dir(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(dir) = explicit
        && !dir.as_os_str().is_empty()
    {
        return Ok(dir);
    }
    NativePlatform::default_data_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine a data directory; set {}", DATA_DIR_ENV))
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::NativePlatform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::NativePlatform;
