use restorekit_artifact::ArtifactValidator;
use restorekit_core::{Device, DeviceError, Step, PREFLIGHT_STEP};
use restorekit_devices::diag::APPLE_MOBILE_DEVICE_SERVICE;
use restorekit_devices::DeviceResolver;
use restorekit_host::HostProbe;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const CHECK_RESTORE_TOOL: &str = "check_idevicerestore";
pub const CHECK_IPSW_EXISTS: &str = "ipsw_exists";
pub const CHECK_IPSW_VALIDATED: &str = "ipsw_validated";
pub const CHECK_DISK_FREE: &str = "disk_free_gb";
pub const CHECK_AMDS_RUNNING: &str = "amds_running";
pub const CHECK_DEVICE_INFO: &str = "device_info";

/// Recorded but never part of the aggregate outcome.
pub const OPTIONAL_CHECKS: &[&str] = &[CHECK_AMDS_RUNNING, CHECK_DEVICE_INFO];

pub const DEFAULT_MIN_DISK_GB: u64 = 10;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

pub fn is_optional(name: &str) -> bool {
    OPTIONAL_CHECKS.contains(&name)
}

/// Best-effort device lookup by a known identifier. Never discovers.
pub trait DeviceLookup: Send + Sync {
    fn lookup(&self, udid: &str) -> Result<Device, DeviceError>;
}

impl DeviceLookup for DeviceResolver {
    fn lookup(&self, udid: &str) -> Result<Device, DeviceError> {
        self.lookup_info(udid)
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CheckEntry {
    pub name: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_manifest: Option<bool>,
}

impl CheckEntry {
    fn new(name: &str, ok: bool) -> Self {
        Self {
            name: name.to_string(),
            ok,
            ..Self::default()
        }
    }

    fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// `key=value` pairs of the populated fields, joined with `, `.
    pub fn format_detail(&self) -> Option<String> {
        let mut parts = Vec::new();
        let mut push = |key: &str, value: Option<String>| {
            if let Some(value) = value.filter(|value| !value.is_empty()) {
                parts.push(format!("{}={}", key, value));
            }
        };
        push("error", self.error.clone());
        push("detail", self.detail.clone());
        push("path", self.path.clone());
        push("value", self.value.map(|value| value.to_string()));
        push("size", self.size.map(|size| size.to_string()));
        push("threshold", self.threshold.map(|threshold| threshold.to_string()));
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(", "))
        }
    }

    pub fn to_step(&self) -> Step {
        Step::new(self.name.clone(), self.ok, self.format_detail())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CheckError {
    pub name: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PreflightReport {
    pub ok: bool,
    pub checks: Vec<CheckEntry>,
    pub errors: Vec<CheckError>,
}

impl PreflightReport {
    fn record(&mut self, entry: CheckEntry) {
        if !entry.ok && !is_optional(&entry.name) {
            let message = entry
                .error
                .clone()
                .or_else(|| entry.detail.clone())
                .unwrap_or_default();
            self.errors.push(CheckError {
                name: entry.name.clone(),
                message,
            });
        }
        self.checks.push(entry);
    }

    fn finish(mut self) -> Self {
        self.ok = self
            .checks
            .iter()
            .filter(|entry| !is_optional(&entry.name))
            .all(|entry| entry.ok);
        self
    }

    pub fn failed_required(&self) -> Vec<&str> {
        self.errors.iter().map(|error| error.name.as_str()).collect()
    }

    /// One step per check followed by the aggregate `preflight` step.
    pub fn steps(&self) -> Vec<Step> {
        let mut steps: Vec<Step> = self.checks.iter().map(CheckEntry::to_step).collect();
        let failed = self.failed_required();
        let detail = (!failed.is_empty()).then(|| failed.join("; "));
        steps.push(Step::new(PREFLIGHT_STEP, self.ok, detail));
        steps
    }
}

#[derive(Debug, Clone)]
pub struct PreflightRequest<'a> {
    pub udid: Option<&'a str>,
    pub ipsw: Option<&'a Path>,
    pub restore_tool: &'a str,
    pub min_disk_gb: u64,
    /// Where the restore log will be written; free space is measured there.
    pub disk_target: &'a Path,
}

pub struct Preflight<'a> {
    host: &'a dyn HostProbe,
    validator: &'a dyn ArtifactValidator,
    lookup: &'a dyn DeviceLookup,
}

impl<'a> Preflight<'a> {
    pub fn new(
        host: &'a dyn HostProbe,
        validator: &'a dyn ArtifactValidator,
        lookup: &'a dyn DeviceLookup,
    ) -> Self {
        Self {
            host,
            validator,
            lookup,
        }
    }

    pub fn run(&self, request: &PreflightRequest<'_>) -> PreflightReport {
        let mut report = PreflightReport::default();

        let tool_ok = self.host.has_tool(request.restore_tool);
        let mut tool = CheckEntry::new(CHECK_RESTORE_TOOL, tool_ok);
        if !tool_ok {
            tool = tool.with_error(format!("{} not found", request.restore_tool));
        }
        report.record(tool);

        match request.ipsw {
            None => report.record(
                CheckEntry::new(CHECK_IPSW_EXISTS, false).with_error("no IPSW path provided"),
            ),
            Some(ipsw) => {
                let exists = ipsw.exists();
                report.record(CheckEntry {
                    path: Some(ipsw.display().to_string()),
                    ..CheckEntry::new(CHECK_IPSW_EXISTS, exists)
                });
                if exists {
                    report.record(self.validate_artifact(ipsw));
                } else {
                    report.record(
                        CheckEntry::new(CHECK_IPSW_VALIDATED, false).with_error("IPSW not found"),
                    );
                }
            }
        }

        report.record(self.check_disk(request.disk_target, request.min_disk_gb));
        report.record(self.check_service());
        report.record(self.check_device(request.udid));

        let report = report.finish();
        if report.ok {
            info!(checks = report.checks.len(), "preflight passed");
        } else {
            warn!(failed = ?report.failed_required(), "preflight failed");
        }
        report
    }

    fn validate_artifact(&self, ipsw: &Path) -> CheckEntry {
        let validation = self.validator.validate(ipsw);
        if validation.ok {
            if let Some(sha256) = &validation.sha256 {
                info!(path = %ipsw.display(), sha256 = %sha256, "validated IPSW");
            }
        }
        CheckEntry {
            error: validation.error,
            size: Some(validation.size),
            sha256: validation.sha256,
            has_manifest: Some(validation.has_manifest),
            ..CheckEntry::new(CHECK_IPSW_VALIDATED, validation.ok)
        }
    }

    fn check_disk(&self, target: &Path, min_disk_gb: u64) -> CheckEntry {
        let probe_path = nearest_existing(target);
        match self.host.free_space_bytes(&probe_path) {
            Ok(bytes) => {
                let free_gb = bytes as f64 / BYTES_PER_GB;
                let ok = free_gb >= min_disk_gb as f64;
                let mut entry = CheckEntry {
                    value: Some((free_gb * 100.0).round() / 100.0),
                    threshold: Some(min_disk_gb),
                    ..CheckEntry::new(CHECK_DISK_FREE, ok)
                };
                if !ok {
                    entry = entry.with_error(format!(
                        "free space {:.1}GB below minimum {}GB",
                        free_gb, min_disk_gb
                    ));
                }
                entry
            }
            Err(err) => {
                warn!(path = %probe_path.display(), error = %err, "failed to query disk usage");
                CheckEntry::new(CHECK_DISK_FREE, false).with_error(err.to_string())
            }
        }
    }

    fn check_service(&self) -> CheckEntry {
        match self.host.service_status(APPLE_MOBILE_DEVICE_SERVICE) {
            Ok(status) => CheckEntry::new(CHECK_AMDS_RUNNING, status.running)
                .with_detail(if status.running { "running" } else { "stopped" }),
            Err(err) => {
                debug!(error = %err, "service check failed");
                CheckEntry::new(CHECK_AMDS_RUNNING, false).with_error(err.to_string())
            }
        }
    }

    fn check_device(&self, udid: Option<&str>) -> CheckEntry {
        let Some(udid) = udid else {
            return CheckEntry::new(CHECK_DEVICE_INFO, false);
        };
        match self.lookup.lookup(udid) {
            Ok(device) => {
                let detail = format!(
                    "product_type={}, product_version={}",
                    device.product_type.as_deref().unwrap_or("unknown"),
                    device.product_version.as_deref().unwrap_or("unknown")
                );
                CheckEntry::new(CHECK_DEVICE_INFO, true).with_detail(detail)
            }
            Err(err) => {
                debug!(udid, error = %err, "device info lookup failed");
                CheckEntry::new(CHECK_DEVICE_INFO, false)
            }
        }
    }
}

/// The log directory usually does not exist yet; measure its closest
/// existing ancestor instead.
fn nearest_existing(target: &Path) -> PathBuf {
    let mut current = Some(target);
    while let Some(path) = current {
        if path.exists() {
            return path.to_path_buf();
        }
        current = path.parent().filter(|parent| !parent.as_os_str().is_empty());
    }
    PathBuf::from(".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use restorekit_artifact::ArtifactReport;
    use restorekit_core::Connection;
    use restorekit_host::{HostError, ServiceSource, ServiceStatus};
    use std::sync::atomic::{AtomicBool, Ordering};

    const GB: u64 = 1024 * 1024 * 1024;

    struct FakeHost {
        tool: bool,
        free_bytes: u64,
        service_running: Option<bool>,
    }

    impl FakeHost {
        fn healthy() -> Self {
            Self {
                tool: true,
                free_bytes: 50 * GB,
                service_running: Some(true),
            }
        }
    }

    impl HostProbe for FakeHost {
        fn has_tool(&self, _name: &str) -> bool {
            self.tool
        }

        fn free_space_bytes(&self, _path: &Path) -> Result<u64, HostError> {
            Ok(self.free_bytes)
        }

        fn service_status(&self, _name: &str) -> Result<ServiceStatus, HostError> {
            match self.service_running {
                Some(running) => Ok(ServiceStatus {
                    running,
                    status: if running { "Running" } else { "Stopped" }.to_string(),
                    source: ServiceSource::ScQuery,
                }),
                None => Err(HostError::Unsupported("service query requires Windows")),
            }
        }
    }

    struct FakeValidator {
        ok: bool,
        called: AtomicBool,
    }

    impl FakeValidator {
        fn new(ok: bool) -> Self {
            Self {
                ok,
                called: AtomicBool::new(false),
            }
        }
    }

    impl ArtifactValidator for FakeValidator {
        fn validate(&self, _path: &Path) -> ArtifactReport {
            self.called.store(true, Ordering::SeqCst);
            ArtifactReport {
                ok: self.ok,
                size: 1234,
                sha256: Some("ab".repeat(32)),
                has_manifest: self.ok,
                error: (!self.ok).then(|| "IPSW is not a valid ZIP archive".to_string()),
            }
        }
    }

    struct FakeLookup(bool);

    impl DeviceLookup for FakeLookup {
        fn lookup(&self, udid: &str) -> Result<Device, DeviceError> {
            if self.0 {
                let mut device = Device::bare(udid, Connection::Usb);
                device.product_type = Some("iPhone12,1".to_string());
                device.product_version = Some("17.0".to_string());
                Ok(device)
            } else {
                Err(DeviceError::QueryFailed {
                    udid: udid.to_string(),
                })
            }
        }
    }

    fn request<'a>(ipsw: Option<&'a Path>, udid: Option<&'a str>) -> PreflightRequest<'a> {
        PreflightRequest {
            udid,
            ipsw,
            restore_tool: "idevicerestore",
            min_disk_gb: DEFAULT_MIN_DISK_GB,
            disk_target: Path::new("."),
        }
    }

    fn names(report: &PreflightReport) -> Vec<&str> {
        report.checks.iter().map(|entry| entry.name.as_str()).collect()
    }

    #[test]
    fn all_required_checks_pass() {
        let host = FakeHost::healthy();
        let validator = FakeValidator::new(true);
        let lookup = FakeLookup(true);
        let manifest = Path::new(env!("CARGO_MANIFEST_DIR")).join("Cargo.toml");
        let report = Preflight::new(&host, &validator, &lookup).run(&request(Some(&manifest), Some("AAA")));

        assert!(report.ok);
        assert!(report.errors.is_empty());
        assert_eq!(
            names(&report),
            vec![
                CHECK_RESTORE_TOOL,
                CHECK_IPSW_EXISTS,
                CHECK_IPSW_VALIDATED,
                CHECK_DISK_FREE,
                CHECK_AMDS_RUNNING,
                CHECK_DEVICE_INFO
            ]
        );
        let validated = &report.checks[2];
        assert_eq!(validated.size, Some(1234));
        assert_eq!(validated.has_manifest, Some(true));
        assert_eq!(
            report.checks[5].detail.as_deref(),
            Some("product_type=iPhone12,1, product_version=17.0")
        );
    }

    #[test]
    fn missing_path_skips_validation() {
        let host = FakeHost::healthy();
        let validator = FakeValidator::new(true);
        let report = Preflight::new(&host, &validator, &FakeLookup(true)).run(&request(None, None));
        assert!(!report.ok);
        assert!(!names(&report).contains(&CHECK_IPSW_VALIDATED));
        assert_eq!(report.errors[0].name, CHECK_IPSW_EXISTS);
        assert_eq!(report.errors[0].message, "no IPSW path provided");
        assert!(!validator.called.load(Ordering::SeqCst));
    }

    #[test]
    fn nonexistent_path_fails_validation_without_validator() {
        let host = FakeHost::healthy();
        let validator = FakeValidator::new(true);
        let path = Path::new("/definitely/not/here.ipsw");
        let report = Preflight::new(&host, &validator, &FakeLookup(true)).run(&request(Some(path), None));
        assert!(!report.ok);
        let validated = report
            .checks
            .iter()
            .find(|entry| entry.name == CHECK_IPSW_VALIDATED)
            .unwrap();
        assert_eq!(validated.error.as_deref(), Some("IPSW not found"));
        assert!(!validator.called.load(Ordering::SeqCst));
    }

    #[test]
    fn low_disk_reports_measured_and_required() {
        let host = FakeHost {
            free_bytes: 2 * GB,
            ..FakeHost::healthy()
        };
        let validator = FakeValidator::new(true);
        let manifest = Path::new(env!("CARGO_MANIFEST_DIR")).join("Cargo.toml");
        let report = Preflight::new(&host, &validator, &FakeLookup(true)).run(&request(Some(&manifest), None));
        assert!(!report.ok);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].name, CHECK_DISK_FREE);
        assert_eq!(report.errors[0].message, "free space 2.0GB below minimum 10GB");
    }

    #[test]
    fn optional_checks_never_change_aggregate() {
        let manifest = Path::new(env!("CARGO_MANIFEST_DIR")).join("Cargo.toml");
        let validator = FakeValidator::new(true);
        for (service, lookup_ok) in [(Some(true), true), (Some(false), false), (None, false)] {
            let host = FakeHost {
                service_running: service,
                ..FakeHost::healthy()
            };
            let lookup = FakeLookup(lookup_ok);
            let report = Preflight::new(&host, &validator, &lookup).run(&request(Some(&manifest), Some("AAA")));
            assert!(report.ok, "service={:?} lookup={}", service, lookup_ok);
            assert!(report.errors.is_empty());
        }
    }

    #[test]
    fn steps_end_with_aggregate() {
        let host = FakeHost {
            tool: false,
            ..FakeHost::healthy()
        };
        let validator = FakeValidator::new(false);
        let manifest = Path::new(env!("CARGO_MANIFEST_DIR")).join("Cargo.toml");
        let report = Preflight::new(&host, &validator, &FakeLookup(false)).run(&request(Some(&manifest), None));
        let steps = report.steps();
        let last = steps.last().unwrap();
        assert_eq!(last.name, PREFLIGHT_STEP);
        assert!(!last.ok);
        assert_eq!(last.detail.as_deref(), Some("check_idevicerestore; ipsw_validated"));
        assert_eq!(
            steps[0].detail.as_deref(),
            Some("error=idevicerestore not found")
        );
        assert_eq!(
            steps[2].detail.as_deref(),
            Some("error=IPSW is not a valid ZIP archive, size=1234")
        );
    }

    #[test]
    fn detail_formatting_skips_empty_fields() {
        let entry = CheckEntry {
            value: Some(42.5),
            threshold: Some(10),
            ..CheckEntry::new(CHECK_DISK_FREE, true)
        };
        assert_eq!(entry.format_detail().as_deref(), Some("value=42.5, threshold=10"));
        assert_eq!(CheckEntry::new("x", true).format_detail(), None);
    }

    #[test]
    fn nearest_existing_walks_up() {
        let here = Path::new(env!("CARGO_MANIFEST_DIR"));
        assert_eq!(nearest_existing(&here.join("no/such/dir")), here);
        assert_eq!(nearest_existing(Path::new("no-such-relative-dir")), PathBuf::from("."));
    }
}
