//! Logging configuration using tracing.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Log files larger than this are moved aside before a run starts.
const ROTATE_THRESHOLD_BYTES: u64 = 10 * 1024 * 1024;

/// Initialize logging with the specified level.
///
/// Console output always goes to stderr. When `file` is given, the same events
/// are appended to it without ANSI colors; a file that cannot be opened only
/// costs the file sink, never the run.
pub fn init(level: &str, file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let (file_layer, file_error) = match file.map(open_log_file) {
        Some(Ok(handle)) => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(handle))
                    .boxed(),
            ),
            None,
        ),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .init();

    if let Some(e) = file_error {
        tracing::warn!("Failed to set up log file, continuing with console logging only: {e:#}");
    }

    Ok(())
}

fn open_log_file(path: &Path) -> anyhow::Result<File> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }

    if let Some(rotated) = rotate_if_large(path)? {
        eprintln!("Rotated previous log to {}", rotated.display());
    }

    let handle = OpenOptions::new().create(true).append(true).open(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(handle)
}

/// Move `path` aside with a timestamp suffix when it exceeds the rotation threshold.
fn rotate_if_large(path: &Path) -> std::io::Result<Option<PathBuf>> {
    match fs::metadata(path) {
        Ok(meta) if meta.len() > ROTATE_THRESHOLD_BYTES => {
            let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
            let rotated = PathBuf::from(format!("{}.{}", path.display(), stamp));
            fs::rename(path, &rotated)?;
            Ok(Some(rotated))
        }
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
