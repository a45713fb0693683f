//! Logging setup.
//!
//! `init` wires tracing for the whole process. `UserLog` is the per-tenant
//! append-only log file kept next to each tenant's store; a broker writes a
//! line to it for every notable event in its tenant's life.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::time;

/// Initialize tracing for the application.
///
/// Levels map like the CLI expects; unknown strings fall back to `info`.
/// When `file` is given, output goes there instead of stderr.
pub fn init(default_level: &str, file: Option<&Path>) {
    let lvl = match default_level.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" | "warning" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    };

    if let Some(path) = file {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => {
                let _ = tracing_subscriber::fmt()
                    .with_max_level(lvl)
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(Arc::new(f))
                    .try_init();
                return;
            }
            Err(err) => {
                eprintln!("could not open log file {}: {err}", path.display());
            }
        }
    }

    // try_init so tests and libraries can call this more than once
    let _ = tracing_subscriber::fmt()
        .with_max_level(lvl)
        .with_target(false)
        .try_init();
}

/// Append-only per-tenant log file.
pub struct UserLog {
    label: String,
    path: PathBuf,
    file: Mutex<File>,
}

impl UserLog {
    /// Open (or create) the log at `path`, tagging every line with `label`.
    pub fn open(path: impl Into<PathBuf>, label: &str) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            label: label.to_string(),
            path,
            file: Mutex::new(file),
        })
    }

    /// Write one timestamped line. Write failures are swallowed; tenant
    /// logging must never take a request down.
    pub fn log(&self, line: &str) {
        use std::io::Write;

        let stamp = time::nice_datetime(time::now());
        let mut file = self.file.lock();
        let _ = writeln!(file, "{stamp} [{}] {line}", self.label);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
