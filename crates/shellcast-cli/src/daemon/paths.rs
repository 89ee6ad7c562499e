//! Socket, PID file and recordings path resolution.
//!
//! Priority for socket directory:
//! 1. `SHELLCAST_SOCKET_DIR` (explicit override)
//! 2. `XDG_RUNTIME_DIR/shellcast` (Linux standard)
//! 3. `~/.shellcast` (home directory fallback)
//! 4. `/tmp/shellcast` (last resort)
//!
//! Several daemons can run side by side via `SHELLCAST_INSTANCE`
//! (default: "default"). Each instance gets `{socket_dir}/{instance}.sock`.

use std::env;
use std::path::{Path, PathBuf};

/// Directory recordings are written to unless overridden.
pub const DEFAULT_RECORDS_DIR: &str = "records";

/// Whether `name` is safe to use as a session identifier or file stem.
///
/// Names must be non-empty, contain only ASCII alphanumerics, hyphens and
/// underscores, and not start with a hyphen (could be read as an option).
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Get current instance name from env or default.
pub fn get_instance() -> String {
    env::var("SHELLCAST_INSTANCE").unwrap_or_else(|_| "default".to_string())
}

/// Get socket directory with priority fallback.
pub fn get_socket_dir() -> PathBuf {
    if let Ok(dir) = env::var("SHELLCAST_SOCKET_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    if let Ok(runtime_dir) = env::var("XDG_RUNTIME_DIR") {
        if !runtime_dir.is_empty() {
            return PathBuf::from(runtime_dir).join("shellcast");
        }
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".shellcast");
    }

    env::temp_dir().join("shellcast")
}

/// Returns the instance name, or "default" when it is unsafe as a file stem.
pub(crate) fn sanitize_instance_name(name: &str) -> String {
    if is_valid_name(name) {
        name.to_string()
    } else {
        tracing::warn!(
            "Invalid instance name '{}', using 'default'. Names must contain only alphanumeric, hyphen, underscore.",
            name
        );
        "default".to_string()
    }
}

/// Get socket path for an instance (current instance when `None`).
pub fn get_socket_path(instance: Option<&str>) -> PathBuf {
    let name = instance.map(String::from).unwrap_or_else(get_instance);
    get_socket_dir().join(format!("{}.sock", sanitize_instance_name(&name)))
}

/// Get PID file path for an instance (current instance when `None`).
pub fn get_pid_path(instance: Option<&str>) -> PathBuf {
    let name = instance.map(String::from).unwrap_or_else(get_instance);
    get_socket_dir().join(format!("{}.pid", sanitize_instance_name(&name)))
}

/// Ensure socket directory exists with secure permissions (0700 on Unix).
pub fn ensure_socket_dir() -> std::io::Result<()> {
    let dir = get_socket_dir();
    std::fs::create_dir_all(&dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
    }

    Ok(())
}

/// Recordings directory: explicit flag, then `SHELLCAST_RECORDS_DIR`, then `./records`.
pub fn get_records_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    match env::var("SHELLCAST_RECORDS_DIR") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from(DEFAULT_RECORDS_DIR),
    }
}
