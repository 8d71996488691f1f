//! Fatal preconditions checked before any task runs.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::utils::{OrchestratorError, Result};

const GIB: u64 = 1024 * 1024 * 1024;

/// Resolve the engine binary, either as an explicit path or via `PATH`.
pub fn locate_binary(binary: &str) -> Result<PathBuf> {
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    locate_binary_in(binary, &path_var)
}

fn locate_binary_in(binary: &str, path_var: &std::ffi::OsStr) -> Result<PathBuf> {
    let missing = || {
        OrchestratorError::FatalPrecondition(format!(
            "the '{binary}' binary is not found; install it or set engine.binary"
        ))
    };

    if binary.contains('/') {
        let candidate = PathBuf::from(binary);
        return if is_executable(&candidate) {
            Ok(candidate)
        } else {
            Err(missing())
        };
    }

    std::env::split_paths(path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(missing)
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

pub fn require_root() -> Result<()> {
    if nix::unistd::geteuid().is_root() {
        debug!("running with root privileges");
        Ok(())
    } else {
        Err(OrchestratorError::FatalPrecondition(
            "this command must be run as root".to_string(),
        ))
    }
}

/// Log the engine version. Failure here is only worth a warning.
pub async fn log_engine_version(engine: &Engine) {
    match engine.version().await {
        Ok(version) => info!("Using {version}"),
        Err(err) => warn!(error = %err, "could not determine engine version"),
    }
}

/// Run all preflight checks for a run that will touch repositories.
pub async fn check(engine: &Engine, binary: &str, needs_root: bool) -> Result<()> {
    let resolved = locate_binary(binary)?;
    debug!(binary = %resolved.display(), "engine binary located");

    if needs_root {
        require_root()?;
    }

    log_engine_version(engine).await;
    Ok(())
}

pub fn free_space_bytes(path: &Path) -> Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|e| OrchestratorError::Io(std::io::Error::from(e)))?;
    #[allow(clippy::unnecessary_cast)]
    let bytes = (stat.fragment_size() as u64).saturating_mul(stat.blocks_available() as u64);
    Ok(bytes)
}

/// Warn when `path` has less than `min_gb` GiB free. Never fails: returns
/// whether the space looked sufficient (or could not be determined).
pub fn check_free_space(path: &Path, min_gb: u64) -> bool {
    match free_space_bytes(path) {
        Ok(bytes) if bytes < min_gb.saturating_mul(GIB) => {
            warn!(
                path = %path.display(),
                free_gb = %format!("{:.1}", bytes as f64 / GIB as f64),
                recommended_gb = min_gb,
                "low disk space on restore target"
            );
            false
        }
        Ok(bytes) => {
            info!(
                path = %path.display(),
                free_gb = %format!("{:.1}", bytes as f64 / GIB as f64),
                "sufficient disk space"
            );
            true
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "could not check free space");
            true
        }
    }
}
