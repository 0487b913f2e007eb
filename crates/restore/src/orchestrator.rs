use crate::command::{compose_command, restore_log_path};
use crate::steps::StepTable;
use crate::supervise;
use restorekit_artifact::ArtifactValidator;
use restorekit_core::{
    compact_timestamp, format_rfc3339, RestoreResult, RestoreStatus, Step, COMPOSE_STEP,
    RESOLVE_LATEST_STEP, RESTORE_TOOL_STEP, TIMEOUT_STEP,
};
use restorekit_host::HostProbe;
use restorekit_preflight::{DeviceLookup, Preflight, PreflightRequest, DEFAULT_MIN_DISK_GB};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tracing::{error, info, warn};

pub const OPEN_LOG_STEP: &str = "open_log";

#[derive(Debug, Clone)]
pub struct RestoreSettings {
    pub restore_tool: String,
    pub log_dir: PathBuf,
    pub min_disk_gb: u64,
    pub step_patterns: StepTable,
    pub terminate_grace: Duration,
    pub worker_join_timeout: Duration,
}

impl Default for RestoreSettings {
    fn default() -> Self {
        Self {
            restore_tool: RESTORE_TOOL_STEP.to_string(),
            log_dir: PathBuf::from("logs"),
            min_disk_gb: DEFAULT_MIN_DISK_GB,
            step_patterns: StepTable::default(),
            terminate_grace: Duration::from_secs(5),
            worker_join_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestoreParams {
    pub udid: Option<String>,
    pub ipsw: Option<PathBuf>,
    pub latest: bool,
    pub wipe: bool,
    pub preflight_only: bool,
    pub dry_run: bool,
    /// Bound on the restore tool's run time; zero means unbounded.
    pub timeout: Option<Duration>,
}

impl Default for RestoreParams {
    fn default() -> Self {
        Self {
            udid: None,
            ipsw: None,
            latest: false,
            wipe: true,
            preflight_only: false,
            dry_run: false,
            timeout: None,
        }
    }
}

/// Accumulates steps for one run and stamps the result on every exit path.
struct RunRecord<'p> {
    params: &'p RestoreParams,
    started_at: OffsetDateTime,
    started: Instant,
    logfile: PathBuf,
    steps: Vec<Step>,
}

impl RunRecord<'_> {
    fn finish(self, status: RestoreStatus) -> RestoreResult {
        RestoreResult {
            status,
            udid: self.params.udid.clone(),
            ipsw: self.params.ipsw.as_ref().map(|path| path.display().to_string()),
            wipe: self.params.wipe,
            steps: self.steps,
            logfile: self.logfile,
            started_at: format_rfc3339(self.started_at),
            finished_at: format_rfc3339(OffsetDateTime::now_utc()),
            duration_sec: self.started.elapsed().as_secs(),
        }
    }
}

pub struct RestoreOrchestrator<'a> {
    settings: RestoreSettings,
    host: &'a dyn HostProbe,
    validator: &'a dyn ArtifactValidator,
    lookup: &'a dyn DeviceLookup,
}

impl<'a> RestoreOrchestrator<'a> {
    pub fn new(
        settings: RestoreSettings,
        host: &'a dyn HostProbe,
        validator: &'a dyn ArtifactValidator,
        lookup: &'a dyn DeviceLookup,
    ) -> Self {
        Self {
            settings,
            host,
            validator,
            lookup,
        }
    }

    pub fn settings(&self) -> &RestoreSettings {
        &self.settings
    }

    /// Never fails: every outcome, including spawn and log errors, is
    /// reported through the returned steps.
    pub fn run(&self, params: &RestoreParams) -> RestoreResult {
        let started_at = OffsetDateTime::now_utc();
        let udid = params.udid.as_deref();
        let mut record = RunRecord {
            params,
            started_at,
            started: Instant::now(),
            logfile: restore_log_path(&self.settings.log_dir, udid, &compact_timestamp(started_at)),
            steps: Vec::new(),
        };

        if params.latest && params.ipsw.is_none() {
            warn!("latest firmware resolution requested but not available");
            record
                .steps
                .push(Step::failed(RESOLVE_LATEST_STEP, "--latest is not implemented"));
            return record.finish(RestoreStatus::Failure);
        }

        let preflight = Preflight::new(self.host, self.validator, self.lookup).run(&PreflightRequest {
            udid,
            ipsw: params.ipsw.as_deref(),
            restore_tool: &self.settings.restore_tool,
            min_disk_gb: self.settings.min_disk_gb,
            disk_target: &self.settings.log_dir,
        });
        record.steps.extend(preflight.steps());

        if params.preflight_only {
            let status = if preflight.ok {
                RestoreStatus::Success
            } else {
                RestoreStatus::Failure
            };
            return record.finish(status);
        }
        if !preflight.ok {
            return record.finish(RestoreStatus::Failure);
        }
        let Some(ipsw) = params.ipsw.as_deref() else {
            return record.finish(RestoreStatus::Failure);
        };

        let command = compose_command(&self.settings.restore_tool, udid, ipsw, params.wipe);
        if params.dry_run {
            info!(command = %command.join(" "), "dry run; restore not started");
            record
                .steps
                .push(Step::new(COMPOSE_STEP, true, Some(command.join(" "))));
            return record.finish(RestoreStatus::Success);
        }

        let log = match open_log(&record.logfile) {
            Ok(file) => file,
            Err(err) => {
                error!(path = %record.logfile.display(), error = %err, "cannot create restore log");
                record.steps.push(Step::failed(OPEN_LOG_STEP, err.to_string()));
                return record.finish(RestoreStatus::Failure);
            }
        };

        info!(
            udid = udid.unwrap_or("auto"),
            command = %command.join(" "),
            "starting idevicerestore"
        );
        let supervised = match supervise::spawn(&command, log, self.settings.step_patterns.extractor()) {
            Ok(supervised) => supervised,
            Err(err) => {
                error!(error = %err, "idevicerestore failed to start");
                record.steps.push(Step::failed(RESTORE_TOOL_STEP, err.to_string()));
                return record.finish(RestoreStatus::Failure);
            }
        };

        // A zero bound means none.
        let timeout = params.timeout.filter(|limit| !limit.is_zero());
        let outcome = supervised.wait(
            timeout,
            self.settings.terminate_grace,
            self.settings.worker_join_timeout,
        );
        record.steps.extend(outcome.milestones);

        let mut code = outcome.code;
        if outcome.timed_out {
            let seconds = timeout.map(|limit| limit.as_secs()).unwrap_or_default();
            record
                .steps
                .push(Step::failed(TIMEOUT_STEP, format!("{}s", seconds)));
            if code == 0 {
                code = 1;
            }
        }
        let ok = code == 0;
        record
            .steps
            .push(Step::new(RESTORE_TOOL_STEP, ok, Some(format!("rc={}", code))));

        if ok {
            info!(logfile = %record.logfile.display(), "restore completed");
            record.finish(RestoreStatus::Success)
        } else {
            error!(rc = code, logfile = %record.logfile.display(), "restore failed");
            record.finish(RestoreStatus::Failure)
        }
    }
}

fn open_log(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    File::create(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use restorekit_artifact::ArtifactReport;
    use restorekit_core::{Device, DeviceError, RestoreOutcome, PREFLIGHT_STEP};
    use restorekit_host::{HostError, ServiceStatus};

    struct Host {
        tool: bool,
    }

    impl HostProbe for Host {
        fn has_tool(&self, _name: &str) -> bool {
            self.tool
        }

        fn free_space_bytes(&self, _path: &Path) -> Result<u64, HostError> {
            Ok(500 * 1024 * 1024 * 1024)
        }

        fn service_status(&self, _name: &str) -> Result<ServiceStatus, HostError> {
            Err(HostError::Unsupported("service query requires Windows"))
        }
    }

    struct Valid;

    impl ArtifactValidator for Valid {
        fn validate(&self, _path: &Path) -> ArtifactReport {
            ArtifactReport {
                ok: true,
                size: 10,
                sha256: Some("00".repeat(32)),
                has_manifest: true,
                error: None,
            }
        }
    }

    struct NoDevice;

    impl DeviceLookup for NoDevice {
        fn lookup(&self, udid: &str) -> Result<Device, DeviceError> {
            Err(DeviceError::QueryFailed {
                udid: udid.to_string(),
            })
        }
    }

    fn settings(log_dir: &Path) -> RestoreSettings {
        RestoreSettings {
            restore_tool: "/nonexistent/idevicerestore".to_string(),
            log_dir: log_dir.to_path_buf(),
            ..RestoreSettings::default()
        }
    }

    #[test]
    fn latest_is_unsupported_and_skips_everything() {
        let dir = tempfile::tempdir().unwrap();
        let host = Host { tool: true };
        let orchestrator = RestoreOrchestrator::new(settings(dir.path()), &host, &Valid, &NoDevice);
        let result = orchestrator.run(&RestoreParams {
            latest: true,
            ..RestoreParams::default()
        });
        assert_eq!(result.status, RestoreStatus::Failure);
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].name, RESOLVE_LATEST_STEP);
        assert_eq!(result.outcome(), RestoreOutcome::Unsupported);
        assert!(result.logfile.is_absolute());
        assert_eq!(result.duration_sec, 0);
    }

    #[test]
    fn preflight_only_reports_aggregate() {
        let dir = tempfile::tempdir().unwrap();
        let ipsw = dir.path().join("fw.ipsw");
        fs::write(&ipsw, b"zip").unwrap();
        let host = Host { tool: true };
        let orchestrator = RestoreOrchestrator::new(settings(dir.path()), &host, &Valid, &NoDevice);
        let result = orchestrator.run(&RestoreParams {
            ipsw: Some(ipsw),
            preflight_only: true,
            ..RestoreParams::default()
        });
        assert!(result.is_success());
        assert!(result.step(PREFLIGHT_STEP).unwrap().ok);
        assert!(result.step(RESTORE_TOOL_STEP).is_none());
        assert!(!result.logfile.exists());
    }

    #[test]
    fn failed_preflight_never_composes() {
        let dir = tempfile::tempdir().unwrap();
        let host = Host { tool: false };
        let orchestrator = RestoreOrchestrator::new(settings(dir.path()), &host, &Valid, &NoDevice);
        let result = orchestrator.run(&RestoreParams {
            udid: Some("AAA".to_string()),
            dry_run: true,
            ..RestoreParams::default()
        });
        assert_eq!(result.status, RestoreStatus::Failure);
        assert!(result.step(COMPOSE_STEP).is_none());
        assert!(result.is_validation_failure());
        assert_eq!(result.outcome(), RestoreOutcome::ValidationFailure);
        let preflight = result.step(PREFLIGHT_STEP).unwrap();
        assert_eq!(
            preflight.detail.as_deref(),
            Some("check_idevicerestore; ipsw_exists")
        );
    }

    #[test]
    fn dry_run_composes_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let ipsw = dir.path().join("fw.ipsw");
        fs::write(&ipsw, b"zip").unwrap();
        let host = Host { tool: true };
        let orchestrator = RestoreOrchestrator::new(settings(dir.path()), &host, &Valid, &NoDevice);
        let result = orchestrator.run(&RestoreParams {
            udid: Some("AAA".to_string()),
            ipsw: Some(ipsw.clone()),
            dry_run: true,
            ..RestoreParams::default()
        });
        assert!(result.is_success());
        let compose = result.steps.last().unwrap();
        assert_eq!(compose.name, COMPOSE_STEP);
        assert_eq!(
            compose.detail,
            Some(format!("/nonexistent/idevicerestore -w -u AAA {}", ipsw.display()))
        );
        assert!(!dir.path().join("AAA").exists());
        assert!(result.logfile.starts_with(dir.path()));
    }

    #[test]
    fn unusable_log_dir_fails_before_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let ipsw = dir.path().join("fw.ipsw");
        fs::write(&ipsw, b"zip").unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"").unwrap();
        let host = Host { tool: true };
        let orchestrator = RestoreOrchestrator::new(settings(&blocker), &host, &Valid, &NoDevice);
        let result = orchestrator.run(&RestoreParams {
            ipsw: Some(ipsw),
            ..RestoreParams::default()
        });
        assert_eq!(result.status, RestoreStatus::Failure);
        let last = result.steps.last().unwrap();
        assert_eq!(last.name, OPEN_LOG_STEP);
        assert!(!last.ok);
        assert!(result.step(RESTORE_TOOL_STEP).is_none());
        assert_eq!(result.outcome(), RestoreOutcome::OperationalFailure);
    }

    #[test]
    fn spawn_failure_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let ipsw = dir.path().join("fw.ipsw");
        fs::write(&ipsw, b"zip").unwrap();
        let host = Host { tool: true };
        let orchestrator = RestoreOrchestrator::new(settings(dir.path()), &host, &Valid, &NoDevice);
        let result = orchestrator.run(&RestoreParams {
            ipsw: Some(ipsw),
            ..RestoreParams::default()
        });
        assert_eq!(result.status, RestoreStatus::Failure);
        let last = result.steps.last().unwrap();
        assert_eq!(last.name, RESTORE_TOOL_STEP);
        assert!(!last.ok);
        assert!(result.logfile.exists());
        assert_eq!(result.outcome(), RestoreOutcome::OperationalFailure);
    }
}
