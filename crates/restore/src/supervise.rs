//! Child process supervision: one worker drains the combined output into the
//! log file and the step extractor; the foreground owns exit-wait and
//! termination.

use crate::steps::StepExtractor;
use restorekit_core::Step;
use restorekit_host::{request_terminate, wait_with_deadline};
use std::fs::File;
use std::io::{self, BufRead, BufReader, PipeReader, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

enum WorkerEvent {
    Milestone(String),
    Finished { lines: u64, log_error: Option<String> },
}

pub(crate) struct ProcessOutcome {
    pub code: i32,
    pub timed_out: bool,
    pub milestones: Vec<Step>,
}

pub(crate) struct Supervised {
    child: Child,
    events: Receiver<WorkerEvent>,
    worker: JoinHandle<()>,
}

/// Spawns `command` with stdout and stderr on one pipe and starts the
/// output worker. The log file moves into the worker.
pub(crate) fn spawn(command: &[String], log: File, extractor: StepExtractor) -> io::Result<Supervised> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;
    let (reader, writer) = io::pipe()?;
    let mut child = {
        let mut process = Command::new(program);
        process
            .args(args)
            .stdin(Stdio::null())
            .stdout(writer.try_clone()?)
            .stderr(writer);
        process.spawn()?
    };

    let (tx, events) = mpsc::channel();
    let worker = thread::Builder::new()
        .name("restore-output".to_string())
        .spawn(move || drain(reader, log, extractor, tx))
        .map_err(|err| {
            error!(error = %err, "output worker failed to start; stopping idevicerestore");
            reap(&mut child);
            err
        })?;
    Ok(Supervised {
        child,
        events,
        worker,
    })
}

/// Kills and waits a child that must not keep running unsupervised.
fn reap(child: &mut Child) {
    if let Err(err) = child.kill() {
        debug!(error = %err, "kill failed");
    }
    if let Err(err) = child.wait() {
        debug!(error = %err, "wait after kill failed");
    }
}

fn drain(reader: PipeReader, log: File, mut extractor: StepExtractor, tx: Sender<WorkerEvent>) {
    let mut reader = BufReader::new(reader);
    let mut log = Some(log);
    let mut log_error = None;
    let mut buf = Vec::new();
    let mut lines = 0u64;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(error = %err, "reading restore output failed");
                break;
            }
        }
        lines += 1;

        let write_failed = match log.as_mut() {
            Some(file) => file.write_all(&buf).err(),
            None => None,
        };
        if let Some(err) = write_failed {
            error!(error = %err, "writing restore log failed; continuing without it");
            log_error = Some(err.to_string());
            log = None;
        }

        let text = String::from_utf8_lossy(&buf);
        let line = text.trim_end_matches(['\r', '\n']);
        debug!(target: "restorekit_restore", line, "idevicerestore output");
        for name in extractor.feed(line) {
            let _ = tx.send(WorkerEvent::Milestone(name));
        }
    }
    if let Some(mut file) = log {
        if let Err(err) = file.flush() {
            log_error.get_or_insert(err.to_string());
        }
    }
    let _ = tx.send(WorkerEvent::Finished { lines, log_error });
}

impl Supervised {
    /// Waits for exit (bounded by `timeout`), tears the child down, then
    /// collects milestones for at most `join_timeout`.
    pub(crate) fn wait(
        mut self,
        timeout: Option<Duration>,
        grace: Duration,
        join_timeout: Duration,
    ) -> ProcessOutcome {
        let mut timed_out = false;
        let status = match timeout {
            Some(limit) => match wait_with_deadline(&mut self.child, limit) {
                Ok(Some(status)) => Some(status),
                Ok(None) => {
                    timed_out = true;
                    error!(seconds = limit.as_secs(), "idevicerestore timed out");
                    self.terminate(grace)
                }
                Err(err) => {
                    error!(error = %err, "waiting for idevicerestore failed");
                    self.terminate(grace)
                }
            },
            None => match self.child.wait() {
                Ok(status) => Some(status),
                Err(err) => {
                    error!(error = %err, "waiting for idevicerestore failed");
                    self.terminate(grace)
                }
            },
        };
        let code = status.map(exit_code).unwrap_or(-1);
        let milestones = self.collect(join_timeout);
        ProcessOutcome {
            code,
            timed_out,
            milestones,
        }
    }

    /// SIGTERM, a bounded wait, then kill.
    fn terminate(&mut self, grace: Duration) -> Option<ExitStatus> {
        if let Err(err) = request_terminate(&mut self.child) {
            debug!(error = %err, "terminate request failed");
        }
        match wait_with_deadline(&mut self.child, grace) {
            Ok(Some(status)) => return Some(status),
            Ok(None) => warn!("idevicerestore ignored termination; killing"),
            Err(err) => debug!(error = %err, "wait after terminate failed"),
        }
        if let Err(err) = self.child.kill() {
            debug!(error = %err, "kill failed");
        }
        self.child.wait().ok()
    }

    fn collect(self, join_timeout: Duration) -> Vec<Step> {
        let deadline = Instant::now() + join_timeout;
        let mut milestones = Vec::new();
        let mut worker_done = false;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(WorkerEvent::Milestone(name)) => milestones.push(Step::passed(name)),
                Ok(WorkerEvent::Finished { lines, log_error }) => {
                    debug!(lines, ?log_error, "output worker finished");
                    worker_done = true;
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    worker_done = true;
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        seconds = join_timeout.as_secs(),
                        "output worker still running; leaving it detached"
                    );
                    break;
                }
            }
        }
        if worker_done && self.worker.join().is_err() {
            warn!("output worker panicked");
        }
        milestones
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
