//! Device log capture: live syslog streaming and crash report export.

use regex::Regex;
use restorekit_host::{find_tool, request_terminate, run_tool, wait_with_deadline};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const IDEVICESYSLOG: &str = "idevicesyslog";
pub const IDEVICECRASHREPORT: &str = "idevicecrashreport";

const CRASH_PULL_TIMEOUT: Duration = Duration::from_secs(300);
const STOP_GRACE: Duration = Duration::from_secs(2);
const STAGING_DIR: &str = ".restorekit-staging";

#[derive(Debug, Error)]
pub enum LogsError {
    #[error("{0} not found; install libimobiledevice")]
    ToolMissing(&'static str),

    #[error("invalid filter expression: {0}")]
    InvalidFilter(#[from] regex::Error),

    #[error("{tool} exited with code {code}: {stderr}")]
    ToolFailed {
        tool: &'static str,
        code: i32,
        stderr: String,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

fn io_error(context: impl Into<String>) -> impl FnOnce(io::Error) -> LogsError {
    let context = context.into();
    move |source| LogsError::Io { context, source }
}

/// Lines read on a background thread, optionally tied to the child process
/// producing them.
pub struct LineStream {
    lines: Receiver<String>,
    child: Option<Child>,
}

enum NextLine {
    Line(String),
    Ended,
    Expired,
}

impl LineStream {
    pub fn from_reader<R: Read + Send + 'static>(reader: R, child: Option<Child>) -> io::Result<Self> {
        let (tx, lines) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name("log-reader".to_string())
            .spawn(move || {
                let mut reader = BufReader::new(reader);
                let mut buf = Vec::new();
                loop {
                    buf.clear();
                    match reader.read_until(b'\n', &mut buf) {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) => {
                            debug!(error = %err, "log stream read failed");
                            break;
                        }
                    }
                    let text = String::from_utf8_lossy(&buf);
                    if tx.send(text.trim_end_matches(['\r', '\n']).to_string()).is_err() {
                        break;
                    }
                }
            });
        match spawned {
            Ok(_) => Ok(Self { lines, child }),
            Err(err) => {
                if let Some(mut child) = child {
                    let _ = child.kill();
                    let _ = child.wait();
                }
                Err(err)
            }
        }
    }

    fn next_line(&self, deadline: Option<Instant>) -> NextLine {
        let received = match deadline {
            Some(deadline) => self
                .lines
                .recv_timeout(deadline.saturating_duration_since(Instant::now())),
            None => self.lines.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(line) => NextLine::Line(line),
            Err(RecvTimeoutError::Disconnected) => NextLine::Ended,
            Err(RecvTimeoutError::Timeout) => NextLine::Expired,
        }
    }

    fn close(mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        if let Err(err) = request_terminate(&mut child) {
            debug!(error = %err, "terminate request failed");
        }
        if !matches!(wait_with_deadline(&mut child, STOP_GRACE), Ok(Some(_))) {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

pub trait SyslogSource {
    fn tool(&self) -> &'static str;
    fn available(&self) -> bool;
    fn open(&self, udid: Option<&str>) -> io::Result<LineStream>;
}

/// `idevicesyslog [-u UDID]` with stdout and stderr on one pipe.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdeviceSyslog;

impl SyslogSource for IdeviceSyslog {
    fn tool(&self) -> &'static str {
        IDEVICESYSLOG
    }

    fn available(&self) -> bool {
        find_tool(IDEVICESYSLOG).is_some()
    }

    fn open(&self, udid: Option<&str>) -> io::Result<LineStream> {
        let program = find_tool(IDEVICESYSLOG)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "idevicesyslog not found"))?;
        let (reader, writer) = io::pipe()?;
        let child = {
            let mut command = Command::new(program);
            if let Some(udid) = udid {
                command.args(["-u", udid]);
            }
            command
                .stdin(Stdio::null())
                .stdout(writer.try_clone()?)
                .stderr(writer);
            command.spawn()?
        };
        LineStream::from_reader(reader, Some(child))
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyslogOptions<'a> {
    pub udid: Option<&'a str>,
    pub save: Option<&'a Path>,
    pub filter: Option<&'a str>,
    /// Stop after this long; `None` or zero streams until the source ends.
    pub duration: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyslogSummary {
    pub lines_read: u64,
    pub lines_matched: u64,
    pub duration_reached: bool,
}

/// Copies syslog lines matching `filter` to `out` (and the save file) until
/// the source ends or `duration` elapses.
pub fn stream_syslog(
    source: &dyn SyslogSource,
    options: &SyslogOptions<'_>,
    out: &mut dyn Write,
) -> Result<SyslogSummary, LogsError> {
    if !source.available() {
        return Err(LogsError::ToolMissing(source.tool()));
    }
    let filter = options.filter.map(Regex::new).transpose()?;
    let mut save = match options.save {
        Some(path) => Some(open_append(path)?),
        None => None,
    };
    let stream = source
        .open(options.udid)
        .map_err(io_error(format!("start {}", source.tool())))?;
    let deadline = options
        .duration
        .filter(|limit| !limit.is_zero())
        .map(|limit| Instant::now() + limit);
    info!(tool = source.tool(), filter = options.filter, "streaming syslog");

    let mut summary = SyslogSummary::default();
    let result = loop {
        let line = match stream.next_line(deadline) {
            NextLine::Line(line) => line,
            NextLine::Ended => break Ok(()),
            NextLine::Expired => {
                summary.duration_reached = true;
                break Ok(());
            }
        };
        summary.lines_read += 1;
        if filter.as_ref().is_some_and(|filter| !filter.is_match(&line)) {
            continue;
        }
        summary.lines_matched += 1;
        if let Err(err) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
            break Err(io_error("write syslog output")(err));
        }
        if let Some(file) = save.as_mut() {
            if let Err(err) = writeln!(file, "{}", line) {
                warn!(error = %err, "writing syslog save file failed; continuing without it");
                save = None;
            }
        }
    };
    stream.close();
    debug!(?summary, "syslog stream finished");
    result.map(|_| summary)
}

fn open_append(path: &Path) -> Result<File, LogsError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_error(format!("create {}", parent.display())))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_error(format!("open {}", path.display())))
}

pub trait CrashReportSource {
    fn tool(&self) -> &'static str;
    fn available(&self) -> bool;
    /// Copies the device's crash reports into `dest`.
    fn pull(&self, udid: Option<&str>, dest: &Path) -> Result<(), LogsError>;
}

/// `idevicecrashreport -k -e [-u UDID] DIR`: reports stay on the device.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdeviceCrashReport;

impl CrashReportSource for IdeviceCrashReport {
    fn tool(&self) -> &'static str {
        IDEVICECRASHREPORT
    }

    fn available(&self) -> bool {
        find_tool(IDEVICECRASHREPORT).is_some()
    }

    fn pull(&self, udid: Option<&str>, dest: &Path) -> Result<(), LogsError> {
        let program = find_tool(IDEVICECRASHREPORT).ok_or(LogsError::ToolMissing(IDEVICECRASHREPORT))?;
        let dest = dest.to_string_lossy();
        let mut args = vec!["-k", "-e"];
        if let Some(udid) = udid {
            args.extend(["-u", udid]);
        }
        args.push(dest.as_ref());
        let output = run_tool(program, &args, CRASH_PULL_TIMEOUT);
        if output.ok() {
            return Ok(());
        }
        Err(LogsError::ToolFailed {
            tool: IDEVICECRASHREPORT,
            code: output.code,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrashExport {
    pub source: &'static str,
    pub out_dir: PathBuf,
    pub exported: Vec<PathBuf>,
    pub skipped: usize,
}

/// Pulls crash reports into a staging directory under `out_dir`, then keeps
/// the newest `limit` files (all of them when `limit` is 0).
pub fn export_crashlogs(
    source: &dyn CrashReportSource,
    udid: Option<&str>,
    out_dir: &Path,
    limit: usize,
) -> Result<CrashExport, LogsError> {
    if !source.available() {
        return Err(LogsError::ToolMissing(source.tool()));
    }
    let staging = out_dir.join(STAGING_DIR);
    if staging.exists() {
        fs::remove_dir_all(&staging).map_err(io_error(format!("clear {}", staging.display())))?;
    }
    fs::create_dir_all(&staging).map_err(io_error(format!("create {}", staging.display())))?;

    let result = source
        .pull(udid, &staging)
        .and_then(|_| collect_newest(&staging, out_dir, limit));
    if let Err(err) = fs::remove_dir_all(&staging) {
        warn!(error = %err, path = %staging.display(), "staging directory not removed");
    }
    let (exported, skipped) = result?;
    info!(exported = exported.len(), skipped, out_dir = %out_dir.display(), "crash reports exported");
    Ok(CrashExport {
        source: source.tool(),
        out_dir: out_dir.to_path_buf(),
        exported,
        skipped,
    })
}

fn collect_newest(staging: &Path, out_dir: &Path, limit: usize) -> Result<(Vec<PathBuf>, usize), LogsError> {
    let mut files = Vec::new();
    walk_files(staging, &mut files)?;
    files.sort_by(|(a_path, a_time), (b_path, b_time)| b_time.cmp(a_time).then_with(|| a_path.cmp(b_path)));
    let keep = if limit == 0 { files.len() } else { limit.min(files.len()) };
    let skipped = files.len() - keep;

    let mut exported = Vec::with_capacity(keep);
    for (path, _) in files.into_iter().take(keep) {
        let relative = path.strip_prefix(staging).unwrap_or(&path);
        let target = out_dir.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_error(format!("create {}", parent.display())))?;
        }
        fs::rename(&path, &target).map_err(io_error(format!("move {}", path.display())))?;
        exported.push(target);
    }
    Ok((exported, skipped))
}

fn walk_files(dir: &Path, files: &mut Vec<(PathBuf, SystemTime)>) -> Result<(), LogsError> {
    let entries = fs::read_dir(dir).map_err(io_error(format!("read {}", dir.display())))?;
    for entry in entries {
        let entry = entry.map_err(io_error(format!("read {}", dir.display())))?;
        let path = entry.path();
        let meta = entry
            .metadata()
            .map_err(io_error(format!("stat {}", path.display())))?;
        if meta.is_dir() {
            walk_files(&path, files)?;
        } else if meta.is_file() {
            files.push((path, meta.modified().unwrap_or(SystemTime::UNIX_EPOCH)));
        }
    }
    Ok(())
}
