//! Resolution of the llamafile executable.
//!
//! Candidates are tried in a fixed order: explicit path, `LLAMAFILE`, the
//! `PATH` search, the legacy `LLAMAFILE_PATH`, then `./llamafile`. A
//! candidate that exists but is not executable is skipped like a missing one,
//! except an explicit path, which fails immediately.

use crate::error::{ClientError, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name of the server binary.
pub const EXECUTABLE_NAME: &str = "llamafile";

/// Primary environment variable naming the binary.
pub const PRIMARY_ENV: &str = "LLAMAFILE";

/// Legacy environment variable naming the binary.
pub const LEGACY_ENV: &str = "LLAMAFILE_PATH";

/// Inputs for the search, captured once so lookups are deterministic.
#[derive(Debug, Clone, Default)]
pub struct SearchContext {
    pub primary_env: Option<OsString>,
    pub legacy_env: Option<OsString>,
    pub path_var: Option<OsString>,
    pub cwd: PathBuf,
}

impl SearchContext {
    /// Snapshot the current process environment.
    pub fn from_env() -> Self {
        Self {
            primary_env: non_empty(std::env::var_os(PRIMARY_ENV)),
            legacy_env: non_empty(std::env::var_os(LEGACY_ENV)),
            path_var: std::env::var_os("PATH"),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd.join(path)
        }
    }
}

fn non_empty(value: Option<OsString>) -> Option<OsString> {
    value.filter(|v| !v.is_empty())
}

/// Resolve the executable using the live process environment.
pub fn locate(explicit: Option<&Path>) -> Result<PathBuf> {
    locate_in(explicit, &SearchContext::from_env())
}

/// Resolve the executable against a captured [`SearchContext`].
pub fn locate_in(explicit: Option<&Path>, ctx: &SearchContext) -> Result<PathBuf> {
    if let Some(path) = explicit {
        let candidate = ctx.absolute(path);
        debug!("Checking specified executable path: {}", candidate.display());
        if is_executable(&candidate) {
            return Ok(candidate);
        }
        return Err(ClientError::NotFound(format!(
            "specified path {} does not exist or is not executable",
            candidate.display()
        )));
    }

    if let Some(env_path) = &ctx.primary_env {
        let candidate = ctx.absolute(Path::new(env_path));
        debug!("Checking {}: {}", PRIMARY_ENV, candidate.display());
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }

    if let Some(found) = search_path(ctx) {
        debug!("Found {} in PATH: {}", EXECUTABLE_NAME, found.display());
        return Ok(found);
    }

    if let Some(env_path) = &ctx.legacy_env {
        let candidate = ctx.absolute(Path::new(env_path));
        debug!("Checking {}: {}", LEGACY_ENV, candidate.display());
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }

    let candidate = ctx.cwd.join(EXECUTABLE_NAME);
    debug!("Checking working directory: {}", candidate.display());
    if is_executable(&candidate) {
        return Ok(candidate);
    }

    Err(ClientError::NotFound(format!(
        "{} not found via {}, PATH, {}, or the current directory",
        EXECUTABLE_NAME, PRIMARY_ENV, LEGACY_ENV
    )))
}

fn search_path(ctx: &SearchContext) -> Option<PathBuf> {
    let path_var = ctx.path_var.as_ref()?;
    std::env::split_paths(path_var)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| ctx.absolute(&dir).join(EXECUTABLE_NAME))
        .find(|candidate| is_executable(candidate))
}

/// A regular file with at least one execute bit set.
#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_executable(path: &Path) -> bool {
    path.is_file()
}
