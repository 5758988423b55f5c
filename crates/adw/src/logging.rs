//! Tracing setup for the `adw` binary.
//!
//! Two layers:
//! - stderr, filtered by `RUST_LOG` (default `info`), compact format
//! - a plain-text copy of the same events into the current stage's
//!   `agents/<run_id>/<stage>/execution.log`, switched by the stage runner
//!   as the pipeline advances

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Handle to the run-scoped log file. Cloning shares the same target.
#[derive(Debug, Clone, Default)]
pub struct RunLog {
    target: Arc<Mutex<Option<(PathBuf, File)>>>,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct subsequent events to `path`, creating parent directories.
    pub fn open(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut target = self
            .target
            .lock()
            .map_err(|_| io::Error::other("run log lock poisoned"))?;
        *target = Some((path.to_path_buf(), file));
        Ok(())
    }

    /// Current log file, if one is open.
    pub fn path(&self) -> Option<PathBuf> {
        self.target
            .lock()
            .ok()
            .and_then(|t| t.as_ref().map(|(p, _)| p.clone()))
    }
}

/// Writer for one event; drops output while no file is open.
#[derive(Debug)]
pub struct RunLogWriter {
    target: Arc<Mutex<Option<(PathBuf, File)>>>,
}

impl Write for RunLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut target = self
            .target
            .lock()
            .map_err(|_| io::Error::other("run log lock poisoned"))?;
        match target.as_mut() {
            Some((_, file)) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut target = self
            .target
            .lock()
            .map_err(|_| io::Error::other("run log lock poisoned"))?;
        match target.as_mut() {
            Some((_, file)) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for RunLog {
    type Writer = RunLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RunLogWriter {
            target: Arc::clone(&self.target),
        }
    }
}

/// Install the global subscriber and return the run log handle.
///
/// ```bash
/// RUST_LOG=adw=debug adw plan 123
/// ```
pub fn init() -> RunLog {
    let run_log = RunLog::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr).compact())
        .with(
            fmt::layer()
                .with_writer(run_log.clone())
                .with_ansi(false)
                .with_target(false),
        )
        .init();

    run_log
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn writes_go_to_the_open_file() {
        let dir = TempDir::new().unwrap();
        let log = RunLog::new();

        // Nothing open yet: output is discarded.
        log.make_writer().write_all(b"dropped\n").unwrap();

        let first = dir.path().join("abc12345/plan/execution.log");
        log.open(&first).unwrap();
        log.make_writer().write_all(b"planning\n").unwrap();
        assert_eq!(log.path().as_deref(), Some(first.as_path()));

        let second = dir.path().join("abc12345/build/execution.log");
        log.clone().open(&second).unwrap();
        log.make_writer().write_all(b"building\n").unwrap();

        assert_eq!(std::fs::read_to_string(&first).unwrap(), "planning\n");
        assert_eq!(std::fs::read_to_string(&second).unwrap(), "building\n");
    }
}
