use crate::process::wait_with_deadline;
use std::ffi::OsStr;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

pub const EXIT_NOT_FOUND: i32 = 127;
pub const EXIT_UNAVAILABLE: i32 = -1;

/// Captured result of one bounded tool invocation. Never an error: a missing
/// tool is code 127, a timeout or spawn failure is code -1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn ok(&self) -> bool {
        self.code == 0
    }

    fn not_found(program: &OsStr) -> Self {
        Self {
            code: EXIT_NOT_FOUND,
            stdout: String::new(),
            stderr: format!("{} not found", program.to_string_lossy()),
        }
    }

    fn unavailable(stderr: impl Into<String>) -> Self {
        Self {
            code: EXIT_UNAVAILABLE,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Resolves `name` against `PATH` (and `PATHEXT` on Windows). Names that
/// already contain a path separator are checked directly.
pub fn find_tool(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&paths) {
        for file_name in executable_names(name) {
            let full = dir.join(&file_name);
            if is_executable(&full) {
                return Some(full);
            }
        }
    }
    None
}

#[cfg(windows)]
fn executable_names(name: &str) -> Vec<String> {
    if Path::new(name).extension().is_some() {
        return vec![name.to_string()];
    }
    let exts = std::env::var("PATHEXT").unwrap_or_else(|_| ".EXE;.CMD;.BAT;.COM".to_string());
    let mut names = vec![name.to_string()];
    names.extend(
        exts.split(';')
            .filter(|ext| !ext.is_empty())
            .map(|ext| format!("{}{}", name, ext.to_ascii_lowercase())),
    );
    names
}

#[cfg(not(windows))]
fn executable_names(name: &str) -> Vec<String> {
    vec![name.to_string()]
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Runs a tool to completion with captured output, killing it once `timeout`
/// elapses.
pub fn run_tool<S: AsRef<OsStr>>(program: S, args: &[&str], timeout: Duration) -> ToolOutput {
    let program = program.as_ref();
    debug!(program = %program.to_string_lossy(), ?args, "running tool");
    let mut child = match Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return ToolOutput::not_found(program),
        Err(err) => return ToolOutput::unavailable(err.to_string()),
    };

    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);

    match wait_with_deadline(&mut child, timeout) {
        Ok(Some(status)) => ToolOutput {
            code: status.code().unwrap_or(EXIT_UNAVAILABLE),
            stdout: join_reader(stdout),
            stderr: join_reader(stderr),
        },
        Ok(None) => {
            debug!(program = %program.to_string_lossy(), "tool timed out");
            let _ = child.kill();
            let _ = child.wait();
            ToolOutput::unavailable("timeout")
        }
        Err(err) => {
            let _ = child.kill();
            let _ = child.wait();
            ToolOutput::unavailable(err.to_string())
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_tool_reports_not_found() {
        let output = run_tool(
            "restorekit-definitely-missing-tool",
            &[],
            Duration::from_secs(5),
        );
        assert_eq!(output.code, EXIT_NOT_FOUND);
        assert!(!output.ok());
        assert!(output.stderr.contains("not found"));
        assert!(find_tool("restorekit-definitely-missing-tool").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn captures_stdout_and_exit_code() {
        let output = run_tool("sh", &["-c", "echo hello; echo oops >&2; exit 3"], Duration::from_secs(10));
        assert_eq!(output.code, 3);
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[cfg(unix)]
    #[test]
    fn slow_tool_is_killed_at_deadline() {
        let started = std::time::Instant::now();
        let output = run_tool("sh", &["-c", "exec sleep 30"], Duration::from_millis(200));
        assert_eq!(output.code, EXIT_UNAVAILABLE);
        assert_eq!(output.stderr, "timeout");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn explicit_paths_are_checked_directly() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("tool.sh");
        std::fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
        assert!(find_tool(script.to_str().unwrap()).is_none());
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(find_tool(script.to_str().unwrap()), Some(script.clone()));
    }
}
