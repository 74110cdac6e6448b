//! System log: tracing subscriber setup plus a size-rotating file writer
//! and the query helpers behind `GET /api/logs/system`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// A line-buffered writer that rotates `<path>` to `<path>.1` once the file
/// exceeds `max_size_bytes`. One previous generation is kept.
#[derive(Clone)]
pub struct RotatingWriter {
    inner: Arc<Mutex<RotatingInner>>,
}

struct RotatingInner {
    path: PathBuf,
    max_size_bytes: u64,
    file: Option<std::fs::File>,
}

impl RotatingWriter {
    pub fn new(path: impl Into<PathBuf>, max_size_bytes: u64) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create log directory {}", parent.display())
                })?;
            }
        }
        Ok(Self {
            inner: Arc::new(Mutex::new(RotatingInner {
                path,
                max_size_bytes,
                file: None,
            })),
        })
    }
}

impl RotatingInner {
    fn ensure_open(&mut self) -> std::io::Result<&mut std::fs::File> {
        if self.file.is_none() {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.file = Some(file);
        }
        Ok(self.file.as_mut().expect("file opened above"))
    }

    fn rotate_if_needed(&mut self) -> std::io::Result<()> {
        let size = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if size < self.max_size_bytes {
            return Ok(());
        }

        self.file = None;
        let rotated = rotated_path(&self.path);
        // The previous generation is overwritten; two files is the cap.
        let _ = std::fs::remove_file(&rotated);
        std::fs::rename(&self.path, &rotated)?;
        Ok(())
    }
}

fn rotated_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".1");
    PathBuf::from(os)
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.rotate_if_needed()?;
        inner.ensure_open()?.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for RotatingWriter {
    type Writer = RotatingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Install the global subscriber: human-readable stderr plus the rotating
/// system log file, both honoring `RUST_LOG`.
pub fn init_tracing(log_path: &Path, max_size_bytes: u64) -> Result<RotatingWriter> {
    let writer = RotatingWriter::new(log_path, max_size_bytes)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer.clone()),
        )
        .try_init()
        .ok();

    Ok(writer)
}

// ---------------------------------------------------------------------------
// Query side (`GET /api/logs/system`)
// ---------------------------------------------------------------------------

/// Read the last `lines` lines of the system log, newest last, filtered by
/// an optional substring and an optional level token.
pub fn query_system_log(
    path: &Path,
    lines: usize,
    search: Option<&str>,
    level: Option<&str>,
) -> Result<Vec<String>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };

    let level_token = level.map(|l| l.to_uppercase());

    let matched: Vec<&str> = contents
        .lines()
        .filter(|line| {
            if let Some(ref token) = level_token {
                if !line.contains(token.as_str()) {
                    return false;
                }
            }
            if let Some(search) = search {
                if !line.to_lowercase().contains(&search.to_lowercase()) {
                    return false;
                }
            }
            true
        })
        .collect();

    let start = matched.len().saturating_sub(lines);
    Ok(matched[start..].iter().map(|s| s.to_string()).collect())
}
