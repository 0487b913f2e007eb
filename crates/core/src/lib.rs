use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::OffsetDateTime;

pub const RESULT_SCHEMA_VERSION: &str = "1.0.0";

/// Name of the terminal step recorded for the restore tool's exit code.
pub const RESTORE_TOOL_STEP: &str = "idevicerestore";
pub const TIMEOUT_STEP: &str = "timeout";
pub const PREFLIGHT_STEP: &str = "preflight";
pub const RESOLVE_LATEST_STEP: &str = "resolve_latest_ipsw";
pub const COMPOSE_STEP: &str = "compose_cmd";

/// Steps whose failure means nothing destructive was attempted.
pub const VALIDATION_STEPS: &[&str] = &[
    "check_idevicerestore",
    "ipsw_exists",
    "ipsw_validated",
    "disk_free_gb",
    PREFLIGHT_STEP,
    RESOLVE_LATEST_STEP,
];

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    Normal,
    Recovery,
    Dfu,
    #[default]
    Unknown,
}

impl DeviceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceMode::Normal => "normal",
            DeviceMode::Recovery => "recovery",
            DeviceMode::Dfu => "dfu",
            DeviceMode::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Connection {
    Usb,
    Wifi,
    #[default]
    Unknown,
}

impl Connection {
    /// Accepts only `usb` and `wifi` (case-insensitive); everything else is unknown.
    pub fn from_hint(hint: Option<&str>) -> Self {
        match hint.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
            Some("usb") => Connection::Usb,
            Some("wifi") => Connection::Wifi,
            _ => Connection::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Connection::Usb => "usb",
            Connection::Wifi => "wifi",
            Connection::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Device {
    pub udid: Option<String>,
    pub product_type: Option<String>,
    pub product_version: Option<String>,
    pub device_name: Option<String>,
    pub connection: Connection,
    pub mode: DeviceMode,
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,
}

impl Device {
    /// Record carrying only what discovery knows about a device.
    pub fn bare(udid: impl Into<String>, connection: Connection) -> Self {
        Self {
            udid: Some(udid.into()),
            product_type: None,
            product_version: None,
            device_name: None,
            connection,
            mode: DeviceMode::Unknown,
            details: BTreeMap::new(),
        }
    }

    /// Placeholder for a device seen only by the low-level USB probe.
    pub fn dfu_placeholder() -> Self {
        Self {
            udid: None,
            product_type: None,
            product_version: None,
            device_name: Some("(DFU device)".to_string()),
            connection: Connection::Usb,
            mode: DeviceMode::Dfu,
            details: BTreeMap::new(),
        }
    }

    /// Fills the connection only when it is still unknown.
    pub fn with_connection_hint(mut self, hint: Connection) -> Self {
        if self.connection == Connection::Unknown {
            self.connection = hint;
        }
        self
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Step {
    pub name: String,
    pub ok: bool,
    pub detail: Option<String>,
}

impl Step {
    pub fn new(name: impl Into<String>, ok: bool, detail: Option<String>) -> Self {
        Self {
            name: name.into(),
            ok,
            detail,
        }
    }

    pub fn passed(name: impl Into<String>) -> Self {
        Self::new(name, true, None)
    }

    pub fn failed(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(name, false, Some(detail.into()))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RestoreStatus {
    Success,
    Failure,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RestoreOutcome {
    Success,
    ValidationFailure,
    OperationalFailure,
    Timeout,
    Unsupported,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RestoreResult {
    pub status: RestoreStatus,
    pub udid: Option<String>,
    pub ipsw: Option<String>,
    pub wipe: bool,
    pub steps: Vec<Step>,
    pub logfile: PathBuf,
    pub started_at: String,
    pub finished_at: String,
    pub duration_sec: u64,
}

impl RestoreResult {
    pub fn is_success(&self) -> bool {
        self.status == RestoreStatus::Success
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.name == name)
    }

    /// True when a check guarding the destructive phase failed.
    pub fn is_validation_failure(&self) -> bool {
        self.steps
            .iter()
            .any(|step| !step.ok && VALIDATION_STEPS.contains(&step.name.as_str()))
    }

    pub fn timed_out(&self) -> bool {
        self.step(TIMEOUT_STEP).is_some()
    }

    pub fn outcome(&self) -> RestoreOutcome {
        if self.is_success() {
            return RestoreOutcome::Success;
        }
        if self
            .step(RESOLVE_LATEST_STEP)
            .map(|step| !step.ok)
            .unwrap_or(false)
        {
            return RestoreOutcome::Unsupported;
        }
        if self.is_validation_failure() {
            return RestoreOutcome::ValidationFailure;
        }
        if self.timed_out() {
            return RestoreOutcome::Timeout;
        }
        RestoreOutcome::OperationalFailure
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("required tools are missing: {}", .tools.join(", "))]
    ToolMissing { tools: Vec<String> },

    #[error("no device detected")]
    NoDevicesFound,

    #[error("multiple devices detected, pass --udid to pick one")]
    MultipleDevicesAmbiguous { udids: Vec<String> },

    #[error("device identifier could not be determined")]
    UdidUnresolved,

    #[error("could not read device information for {udid}")]
    QueryFailed { udid: String },
}

impl DeviceError {
    /// Sorts and deduplicates the tool names.
    pub fn tool_missing<I, S>(tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut tools: Vec<String> = tools.into_iter().map(Into::into).collect();
        tools.sort();
        tools.dedup();
        DeviceError::ToolMissing { tools }
    }

    pub fn ambiguous<I, S>(udids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut udids: Vec<String> = udids.into_iter().map(Into::into).collect();
        udids.sort();
        DeviceError::MultipleDevicesAmbiguous { udids }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            DeviceError::ToolMissing { .. } => 2,
            DeviceError::NoDevicesFound => 3,
            DeviceError::MultipleDevicesAmbiguous { .. } => 4,
            DeviceError::UdidUnresolved => 5,
            DeviceError::QueryFailed { .. } => 6,
        }
    }

    /// Structured fields for machine-readable error output.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            DeviceError::ToolMissing { tools } => serde_json::json!({ "missing_tools": tools }),
            DeviceError::MultipleDevicesAmbiguous { udids } => serde_json::json!({ "udids": udids }),
            _ => serde_json::json!({}),
        }
    }
}

pub fn now_utc_rfc3339() -> String {
    format_rfc3339(OffsetDateTime::now_utc())
}

pub fn format_rfc3339(at: OffsetDateTime) -> String {
    at.format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// `YYYYMMDD-HHMMSS`, used in log file names.
pub fn compact_timestamp(at: OffsetDateTime) -> String {
    at.format(format_description!("[year][month][day]-[hour][minute][second]"))
        .unwrap_or_else(|_| "19700101-000000".to_string())
}
