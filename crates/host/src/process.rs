use std::io;
use std::process::{Child, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Polls `child` until it exits or `timeout` elapses. `Ok(None)` means the
/// child is still running.
pub fn wait_with_deadline(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL.min(timeout - elapsed));
    }
}

/// Asks the child to stop. SIGTERM on unix; Windows has no graceful signal
/// for console tools, so the process is terminated outright.
pub fn request_terminate(child: &mut Child) -> io::Result<()> {
    #[cfg(unix)]
    {
        let pid = libc::pid_t::try_from(child.id())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        child.kill()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn returns_status_of_quick_child() {
        let mut child = Command::new("sh").args(["-c", "exit 4"]).spawn().unwrap();
        let status = wait_with_deadline(&mut child, Duration::from_secs(10)).unwrap();
        assert_eq!(status.and_then(|s| s.code()), Some(4));
    }

    #[test]
    fn terminate_stops_sleeping_child() {
        let mut child = Command::new("sh").args(["-c", "exec sleep 30"]).spawn().unwrap();
        assert!(wait_with_deadline(&mut child, Duration::from_millis(100)).unwrap().is_none());
        request_terminate(&mut child).unwrap();
        let status = wait_with_deadline(&mut child, Duration::from_secs(5)).unwrap();
        let status = status.expect("child should exit after SIGTERM");
        assert!(!status.success());
    }
}
