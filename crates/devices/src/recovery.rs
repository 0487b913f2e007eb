use restorekit_core::DeviceMode;
use restorekit_host::{find_tool, run_tool};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

pub const IRECOVERY: &str = "irecovery";
pub const IDEVICEDIAGNOSTICS: &str = "idevicediagnostics";

/// Reads the mode out of `irecovery -q` output by looking for the words
/// DFU, Recovery and Normal, in that order.
pub fn parse_irecovery_q(text: &str) -> DeviceMode {
    let has_word = |word: &str| {
        text.split(|ch: char| !ch.is_ascii_alphanumeric())
            .any(|token| token.eq_ignore_ascii_case(word))
    };
    if has_word("dfu") {
        DeviceMode::Dfu
    } else if has_word("recovery") {
        DeviceMode::Recovery
    } else if has_word("normal") {
        DeviceMode::Normal
    } else {
        DeviceMode::Unknown
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RecoveryStatus {
    pub mode: DeviceMode,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub tool_missing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl RecoveryStatus {
    fn unknown(error: impl Into<String>) -> Self {
        Self {
            mode: DeviceMode::Unknown,
            tool_missing: false,
            error: Some(error.into()),
            stderr: None,
            raw: None,
        }
    }
}

fn with_udid<'a>(mut args: Vec<&'a str>, udid: Option<&'a str>) -> Vec<&'a str> {
    if let Some(udid) = udid {
        args.extend(["-u", udid]);
    }
    args
}

pub fn status(udid: Option<&str>) -> RecoveryStatus {
    let Some(tool) = find_tool(IRECOVERY) else {
        warn!("irecovery not found; status unavailable");
        return RecoveryStatus {
            tool_missing: true,
            ..RecoveryStatus::unknown("irecovery not found")
        };
    };
    let args = with_udid(vec!["-q"], udid);
    let output = run_tool(tool, &args, RECOVERY_TIMEOUT);
    if !output.ok() {
        error!(code = output.code, stderr = output.stderr.trim(), "irecovery -q failed");
        return RecoveryStatus {
            stderr: Some(output.stderr.trim().to_string()),
            ..RecoveryStatus::unknown("irecovery -q failed")
        };
    }
    let mode = parse_irecovery_q(&output.stdout);
    RecoveryStatus {
        mode,
        tool_missing: false,
        error: None,
        stderr: None,
        raw: (mode == DeviceMode::Unknown).then(|| output.stdout.trim().to_string()),
    }
}

/// `idevicediagnostics enter_recovery`.
pub fn enter(udid: Option<&str>) -> bool {
    run_recovery_command(IDEVICEDIAGNOSTICS, vec!["enter_recovery"], udid)
}

/// `irecovery -n`: leave recovery/DFU.
pub fn kickout(udid: Option<&str>) -> bool {
    run_recovery_command(IRECOVERY, vec!["-n"], udid)
}

fn run_recovery_command(program: &str, args: Vec<&str>, udid: Option<&str>) -> bool {
    let Some(tool) = find_tool(program) else {
        warn!(program, "tool not found; recovery command skipped");
        return false;
    };
    let args = with_udid(args, udid);
    info!(program, ?args, "executing recovery command");
    let output = run_tool(tool, &args, RECOVERY_TIMEOUT);
    if !output.ok() {
        error!(
            program,
            code = output.code,
            stdout = output.stdout.trim(),
            stderr = output.stderr.trim(),
            "recovery command failed"
        );
        return false;
    }
    true
}

/// Low-level USB probe for devices that only show up in DFU. Must not fail.
pub trait DfuProbe: Send + Sync {
    fn dfu_detected(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IrecoveryProbe;

impl DfuProbe for IrecoveryProbe {
    fn dfu_detected(&self) -> bool {
        let Some(tool) = find_tool(IRECOVERY) else {
            return false;
        };
        let output = run_tool(tool, &["-q"], PROBE_TIMEOUT);
        if !output.ok() || output.stdout.trim().is_empty() {
            debug!(code = output.code, "irecovery probe found nothing");
            return false;
        }
        parse_irecovery_q(&output.stdout) == DeviceMode::Dfu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modes_from_query_output() {
        assert_eq!(parse_irecovery_q("CPID: 0x8030\nMODE: DFU\n"), DeviceMode::Dfu);
        assert_eq!(parse_irecovery_q("MODE: Recovery\nPRODUCT: iPhone12,8"), DeviceMode::Recovery);
        assert_eq!(parse_irecovery_q("mode: normal"), DeviceMode::Normal);
        assert_eq!(parse_irecovery_q("ERROR: Unable to connect to device"), DeviceMode::Unknown);
        assert_eq!(parse_irecovery_q(""), DeviceMode::Unknown);
    }

    #[test]
    fn dfu_requires_whole_word() {
        assert_eq!(parse_irecovery_q("SRTG: iBoot-DFUX"), DeviceMode::Unknown);
    }

    #[test]
    fn udid_flag_is_appended() {
        assert_eq!(with_udid(vec!["-q"], Some("AAA")), vec!["-q", "-u", "AAA"]);
        assert_eq!(with_udid(vec!["-q"], None), vec!["-q"]);
    }

    #[test]
    fn status_serializes_sparse() {
        let status = RecoveryStatus {
            tool_missing: true,
            ..RecoveryStatus::unknown("irecovery not found")
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["mode"], "unknown");
        assert_eq!(value["tool_missing"], true);
        assert!(value.get("raw").is_none());
    }
}
