use anyhow::{Context, Result};
use restorekit_core::{now_utc_rfc3339, RestoreOutcome, RestoreResult, RESULT_SCHEMA_VERSION};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct ReportPaths {
    pub run_id: String,
    pub root: PathBuf,
    pub run_json: PathBuf,
    /// Copy of the restore log, when the run produced one.
    pub logs_path: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub created_at_utc: String,
    pub result_schema_version: String,
    pub outcome: RestoreOutcome,
    pub result: RestoreResult,
}

/// Writes `<base>/reports/<run_id>/run.json` and, if present, a copy of the
/// restore log beside it.
pub fn write_result_report(base: impl AsRef<Path>, result: &RestoreResult) -> Result<ReportPaths> {
    let run_id = Uuid::new_v4().to_string();
    let root = base.as_ref().join("reports").join(&run_id);
    std::fs::create_dir_all(&root)
        .with_context(|| format!("create report dir {}", root.display()))?;

    let run_json = root.join("run.json");
    let report = RunReport {
        run_id: run_id.clone(),
        created_at_utc: now_utc_rfc3339(),
        result_schema_version: RESULT_SCHEMA_VERSION.to_string(),
        outcome: result.outcome(),
        result: result.clone(),
    };
    std::fs::write(&run_json, serde_json::to_string_pretty(&report)?)
        .with_context(|| format!("write {}", run_json.display()))?;

    let logs_path = if result.logfile.is_file() {
        let target = root.join("restore.log");
        std::fs::copy(&result.logfile, &target)
            .with_context(|| format!("copy {}", result.logfile.display()))?;
        Some(target)
    } else {
        None
    };

    Ok(ReportPaths {
        run_id,
        root,
        run_json,
        logs_path,
    })
}

pub fn load_result_report(path: impl AsRef<Path>) -> Result<RunReport> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let report = serde_json::from_str(&data).with_context(|| format!("parse {}", path.display()))?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use restorekit_core::{RestoreStatus, Step, TIMEOUT_STEP};

    fn result(logfile: PathBuf) -> RestoreResult {
        RestoreResult {
            status: RestoreStatus::Failure,
            udid: Some("AAA".to_string()),
            ipsw: Some("/fw/x.ipsw".to_string()),
            wipe: true,
            steps: vec![
                Step::passed("extract"),
                Step::failed(TIMEOUT_STEP, "60s"),
                Step::failed("idevicerestore", "rc=-15"),
            ],
            logfile,
            started_at: "2024-01-01T12:00:00Z".to_string(),
            finished_at: "2024-01-01T12:01:00Z".to_string(),
            duration_sec: 60,
        }
    }

    #[test]
    fn bundle_round_trips_with_log_copy() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("restore.log");
        std::fs::write(&log, "Extracting filesystem\n").unwrap();

        let paths = write_result_report(dir.path(), &result(log)).unwrap();
        assert!(paths.root.starts_with(dir.path().join("reports")));
        assert_eq!(
            std::fs::read_to_string(paths.logs_path.unwrap()).unwrap(),
            "Extracting filesystem\n"
        );

        let loaded = load_result_report(&paths.run_json).unwrap();
        assert_eq!(loaded.run_id, paths.run_id);
        assert_eq!(loaded.result_schema_version, RESULT_SCHEMA_VERSION);
        assert_eq!(loaded.outcome, RestoreOutcome::Timeout);
        assert_eq!(loaded.result.steps.len(), 3);
        assert_eq!(loaded.result.udid.as_deref(), Some("AAA"));
    }

    #[test]
    fn missing_log_is_not_copied() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_result_report(dir.path(), &result(dir.path().join("never-written.log"))).unwrap();
        assert!(paths.logs_path.is_none());
        assert!(paths.run_json.is_file());
    }

    #[test]
    fn loading_garbage_fails_with_context() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, "{").unwrap();
        let err = load_result_report(&path).unwrap_err();
        assert!(format!("{:#}", err).starts_with("parse "));
    }
}
