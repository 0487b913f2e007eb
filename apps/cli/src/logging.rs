//! Subscriber setup: human output on stderr plus a per-session file, both
//! with device identifiers redacted.

use anyhow::{Context, Result};
use regex::Regex;
use restorekit_core::compact_timestamp;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use time::OffsetDateTime;
use tracing::warn;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const UDID_PATTERN: &str = r"\b[0-9A-Fa-f]{8,40}\b";
const UDID_PLACEHOLDER: &str = "<UDID>";

/// Log sink that masks identifier-looking hex runs before they reach `W`.
pub struct Redacting<W> {
    inner: Mutex<W>,
    pattern: Regex,
}

impl<W: Write> Redacting<W> {
    pub fn new(inner: W) -> Result<Self> {
        Ok(Self {
            inner: Mutex::new(inner),
            pattern: Regex::new(UDID_PATTERN)?,
        })
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct RedactingWriter<'a, W> {
    inner: MutexGuard<'a, W>,
    pattern: &'a Regex,
}

impl<'a, W: Write + 'a> MakeWriter<'a> for Redacting<W> {
    type Writer = RedactingWriter<'a, W>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: self.inner.lock().unwrap_or_else(PoisonError::into_inner),
            pattern: &self.pattern,
        }
    }
}

impl<W: Write> Write for RedactingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        let redacted = self.pattern.replace_all(&text, UDID_PLACEHOLDER);
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn open_session_log(log_dir: &Path) -> Result<(PathBuf, File)> {
    fs::create_dir_all(log_dir).with_context(|| format!("create {}", log_dir.display()))?;
    let path = log_dir.join(format!(
        "session-{}.log",
        compact_timestamp(OffsetDateTime::now_utc())
    ));
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open {}", path.display()))?;
    Ok((path, file))
}

/// Installs the global subscriber. Returns the session log path, or `None`
/// when only stderr logging could be set up.
pub fn init(log_dir: &Path, verbose: bool) -> Option<PathBuf> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let stderr = match Redacting::new(io::stderr()) {
        Ok(stderr) => stderr,
        Err(err) => {
            eprintln!("logging disabled: {:#}", err);
            return None;
        }
    };
    let stderr_layer = fmt::layer().with_writer(stderr).with_target(false);

    match open_session_log(log_dir).and_then(|(path, file)| Ok((path, Redacting::new(file)?))) {
        Ok((path, writer)) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(path)
        }
        Err(err) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            warn!(error = %format!("{:#}", err), "session log unavailable; logging to stderr only");
            None
        }
    }
}
