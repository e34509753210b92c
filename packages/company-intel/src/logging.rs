//! Tracing setup and log file rotation.
//!
//! The file layer writes through a [`LogFile`], which reopens its path after a
//! rotation so output keeps landing in the live file rather than in `<path>.1`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LogConfig;

/// File behind the installed subscriber, if any.
static ACTIVE: OnceLock<LogFile> = OnceLock::new();

/// Install the global subscriber: env filter, stderr output, and a plain-text
/// file layer when a log file is configured.
///
/// Returns an error if the log file cannot be opened or a subscriber is
/// already installed.
pub fn init(config: &LogConfig) -> io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let log_file = config.file.as_deref().map(LogFile::open).transpose()?;
    let file_layer = log_file.clone().map(|file| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file)
            .boxed()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e))?;

    if let Some(file) = log_file {
        let _ = ACTIVE.set(file);
    }
    Ok(())
}

/// Appending log file that can be rotated while a subscriber writes to it.
#[derive(Clone)]
pub struct LogFile {
    inner: Arc<LogFileInner>,
}

struct LogFileInner {
    path: PathBuf,
    file: Mutex<File>,
}

impl LogFile {
    /// Open `path` for appending, creating it and its parent directory.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            inner: Arc::new(LogFileInner {
                path: path.to_path_buf(),
                file: Mutex::new(open_append(path)?),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Rotate once the file passes `limit` bytes, then reopen the live path.
    ///
    /// Writers are blocked for the duration, so no line is split across files.
    pub fn rotate_if_oversized(&self, limit: u64) -> io::Result<bool> {
        let mut file = self.lock();
        if !rotate_path(&self.inner.path, limit)? {
            return Ok(false);
        }
        *file = open_append(&self.inner.path)?;
        Ok(true)
    }

    fn lock(&self) -> MutexGuard<'_, File> {
        self.inner.file.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Locked handle produced for each formatted event.
pub struct LogFileWriter<'a> {
    file: MutexGuard<'a, File>,
}

impl io::Write for LogFileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = LogFileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        LogFileWriter { file: self.lock() }
    }
}

/// Move `path` aside to `<path>.1` once it grows past `limit` bytes.
///
/// When `path` is the file the installed subscriber writes to, the rotation
/// goes through that [`LogFile`] so logging continues in a fresh `path`.
/// A missing file is not an error. Returns whether a rotation happened.
pub fn rotate_if_oversized(path: &Path, limit: u64) -> io::Result<bool> {
    match ACTIVE.get() {
        Some(active) if active.path() == path => active.rotate_if_oversized(limit),
        _ => rotate_path(path, limit),
    }
}

fn rotate_path(path: &Path, limit: u64) -> io::Result<bool> {
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if size <= limit {
        return Ok(false);
    }

    let rotated = rotated_path(path);
    if rotated.exists() {
        fs::remove_file(&rotated)?;
    }
    fs::rename(path, &rotated)?;
    Ok(true)
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn rotated_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".1");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_log_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.log");
        fs::write(&path, vec![b'x'; 10]).unwrap();

        assert!(!rotate_if_oversized(&path, 10).unwrap());
        assert!(path.exists());
    }

    #[test]
    fn test_oversized_log_is_rotated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.log");
        fs::write(&path, vec![b'x'; 11]).unwrap();
        fs::write(dir.path().join("session.log.1"), b"older").unwrap();

        assert!(rotate_if_oversized(&path, 10).unwrap());
        assert!(!path.exists());
        assert_eq!(fs::read(dir.path().join("session.log.1")).unwrap().len(), 11);
    }

    fn logged_with(file: &LogFile, body: impl FnOnce()) {
        let subscriber = tracing_subscriber::registry().with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file.clone()),
        );
        tracing::subscriber::with_default(subscriber, body);
    }

    #[test]
    fn test_logging_continues_in_live_file_after_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.log");
        let file = LogFile::open(&path).unwrap();

        logged_with(&file, || {
            tracing::info!("before-rotation-marker");
            assert!(file.rotate_if_oversized(10).unwrap());
            tracing::info!("after-rotation-marker");
        });

        let live = fs::read_to_string(&path).unwrap();
        let rotated = fs::read_to_string(dir.path().join("session.log.1")).unwrap();
        assert!(live.contains("after-rotation-marker"));
        assert!(!live.contains("before-rotation-marker"));
        assert!(rotated.contains("before-rotation-marker"));
        assert!(!rotated.contains("after-rotation-marker"));
    }

    #[test]
    fn test_rotation_by_path_goes_through_installed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("installed.log");
        let file = LogFile::open(&path).unwrap();
        assert!(ACTIVE.set(file.clone()).is_ok());

        logged_with(&file, || {
            tracing::info!("first-generation");
            assert!(rotate_if_oversized(&path, 10).unwrap());
            tracing::info!("second-generation");
            assert!(rotate_if_oversized(&path, 10).unwrap());
            tracing::info!("third-generation");
        });

        let live = fs::read_to_string(&path).unwrap();
        let rotated = fs::read_to_string(dir.path().join("installed.log.1")).unwrap();
        assert!(live.contains("third-generation"));
        assert!(rotated.contains("second-generation"));
        assert!(!rotated.contains("first-generation"));
    }

    #[test]
    fn test_missing_log_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!rotate_if_oversized(&dir.path().join("absent.log"), 10).unwrap());
    }
}
