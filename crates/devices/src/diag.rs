use crate::logs::{IDEVICECRASHREPORT, IDEVICESYSLOG};
use crate::recovery::{parse_irecovery_q, IRECOVERY};
use restorekit_core::DeviceMode;
use restorekit_host::{find_tool, run_tool, HostError, HostProbe};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const VERSION_MAX_CHARS: usize = 200;
const PATH_PREVIEW_CHARS: usize = 120;

pub const APPLE_MOBILE_DEVICE_SERVICE: &str = "Apple Mobile Device Service";

pub const CHECKED_TOOLS: &[&str] = &[
    "idevice_id",
    "ideviceinfo",
    IDEVICESYSLOG,
    IDEVICECRASHREPORT,
    IRECOVERY,
    "idevicerestore",
];

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ServiceReport {
    /// False when this host cannot query services at all.
    pub supported: bool,
    pub running: bool,
    pub status: Option<String>,
    pub source: Option<&'static str>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ToolEntry {
    pub name: String,
    pub found: bool,
    pub path: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ToolInventory {
    pub entries: Vec<ToolEntry>,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct UsbReport {
    pub irecovery_available: bool,
    pub dfu_detected: bool,
    pub recovery_detected: bool,
    pub raw: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct HostReport {
    pub path_preview: String,
    pub path_length: usize,
    pub disk_free_gb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_error: Option<String>,
    /// `None` when USB enumeration is unavailable on this host.
    pub apple_usb_present: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apple_usb_sample: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apple_usb_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UsbDiagnostics {
    pub amds: ServiceReport,
    pub tools: ToolInventory,
    pub usb: UsbReport,
    pub host: HostReport,
    pub hints: Vec<String>,
}

pub fn diag_usb(host: &dyn HostProbe) -> UsbDiagnostics {
    let amds = service_report(host);
    let tools = tool_inventory();
    let irecovery_available = tools
        .entries
        .iter()
        .any(|entry| entry.name == IRECOVERY && entry.found);
    let usb = usb_report(irecovery_available);
    let host = host_report(host, Path::new("."));
    let hints = build_hints(&amds, &tools, &usb, &host);
    UsbDiagnostics {
        amds,
        tools,
        usb,
        host,
        hints,
    }
}

fn service_report(host: &dyn HostProbe) -> ServiceReport {
    match host.service_status(APPLE_MOBILE_DEVICE_SERVICE) {
        Ok(status) => ServiceReport {
            supported: true,
            running: status.running,
            status: Some(status.status),
            source: Some(status.source.as_str()),
            error: None,
        },
        Err(err) => ServiceReport {
            supported: !matches!(err, HostError::Unsupported(_)),
            error: Some(err.to_string()),
            ..ServiceReport::default()
        },
    }
}

fn tool_inventory() -> ToolInventory {
    let mut inventory = ToolInventory::default();
    for name in CHECKED_TOOLS {
        let path = find_tool(name);
        let version = path.as_deref().and_then(probe_version);
        if path.is_none() {
            inventory.missing.push(name.to_string());
        }
        inventory.entries.push(ToolEntry {
            name: name.to_string(),
            found: path.is_some(),
            path: path.map(|path| path.display().to_string()),
            version,
        });
    }
    inventory
}

fn probe_version(path: &Path) -> Option<String> {
    ["--version", "-V"].iter().find_map(|flag| {
        let output = run_tool(path, &[flag], PROBE_TIMEOUT);
        let text = if output.stdout.trim().is_empty() {
            output.stderr.trim()
        } else {
            output.stdout.trim()
        };
        first_line(text)
    })
}

fn first_line(text: &str) -> Option<String> {
    let line = text.lines().next()?.trim();
    if line.is_empty() {
        return None;
    }
    Some(line.chars().take(VERSION_MAX_CHARS).collect())
}

fn usb_report(irecovery_available: bool) -> UsbReport {
    let mut report = UsbReport {
        irecovery_available,
        ..UsbReport::default()
    };
    if !irecovery_available {
        return report;
    }
    let output = run_tool(IRECOVERY, &["-q"], PROBE_TIMEOUT);
    if output.ok() && !output.stdout.trim().is_empty() {
        match parse_irecovery_q(&output.stdout) {
            DeviceMode::Dfu => report.dfu_detected = true,
            DeviceMode::Recovery => report.recovery_detected = true,
            _ => {}
        }
        report.raw = Some(output.stdout.trim().to_string());
    } else {
        let stderr = output.stderr.trim();
        report.error = Some(if stderr.is_empty() {
            "irecovery -q failed".to_string()
        } else {
            stderr.to_string()
        });
    }
    report
}

fn host_report(host: &dyn HostProbe, dir: &Path) -> HostReport {
    let path_value = std::env::var("PATH").unwrap_or_default();
    let mut report = HostReport {
        path_preview: path_preview(&path_value),
        path_length: path_value.chars().count(),
        ..HostReport::default()
    };
    match host.free_space_bytes(dir) {
        Ok(bytes) => report.disk_free_gb = Some(round2(bytes as f64 / 1024f64.powi(3))),
        Err(err) => {
            debug!(error = %err, "free space query failed");
            report.disk_error = Some(err.to_string());
        }
    }
    match host.apple_usb_present() {
        Ok(presence) => {
            report.apple_usb_present = Some(presence.present);
            report.apple_usb_sample = presence.sample;
        }
        Err(HostError::Unsupported(reason)) => debug!(reason, "USB enumeration unavailable"),
        Err(err) => report.apple_usb_error = Some(err.to_string()),
    }
    report
}

fn path_preview(value: &str) -> String {
    if value.chars().count() <= PATH_PREVIEW_CHARS {
        return value.to_string();
    }
    let head: String = value.chars().take(PATH_PREVIEW_CHARS - 3).collect();
    format!("{}...", head)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn build_hints(
    amds: &ServiceReport,
    tools: &ToolInventory,
    usb: &UsbReport,
    host: &HostReport,
) -> Vec<String> {
    let mut hints = Vec::new();
    if !tools.missing.is_empty() {
        hints.push(format!(
            "Missing tools: {}; install libimobiledevice and irecovery.",
            tools.missing.join(", ")
        ));
    }
    if amds.supported && !amds.running {
        hints.push(
            "Apple Mobile Device Service is not running; start it or install the Apple device drivers."
                .to_string(),
        );
    }
    if usb.dfu_detected {
        hints.push("DFU device detected: 'list' omits it unless --include-dfu; see 'recovery status'.".to_string());
    } else if usb.recovery_detected {
        hints.push("Recovery mode detected: see 'recovery status' for details.".to_string());
    }
    if host.apple_usb_present == Some(false) {
        hints.push("No Apple USB device found; check the cable and USB port.".to_string());
    }
    let mut unique = Vec::with_capacity(hints.len());
    for hint in hints {
        if !unique.contains(&hint) {
            unique.push(hint);
        }
    }
    unique
}
