use crate::normalize::{parse_kv_text, raw_info_from_plist, RawInfo, RawValue};
use restorekit_host::{find_tool, run_tool};
use std::time::Duration;
use tracing::debug;

const INFO_TIMEOUT: Duration = Duration::from_secs(10);
pub const IDEVICEINFO: &str = "ideviceinfo";

/// A tier in the device-info lookup. `fetch` returns `None` on any failure.
pub trait InfoSource: Send + Sync {
    fn name(&self) -> &'static str;
    fn tool(&self) -> &'static str;
    fn available(&self) -> bool;
    fn fetch(&self, udid: &str) -> Option<RawInfo>;
}

/// `ideviceinfo -x`: XML property list with typed values.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlistInfoSource;

impl InfoSource for PlistInfoSource {
    fn name(&self) -> &'static str {
        "ideviceinfo-plist"
    }

    fn tool(&self) -> &'static str {
        IDEVICEINFO
    }

    fn available(&self) -> bool {
        find_tool(IDEVICEINFO).is_some()
    }

    fn fetch(&self, udid: &str) -> Option<RawInfo> {
        let tool = find_tool(IDEVICEINFO)?;
        let output = run_tool(tool, &["-u", udid, "-x"], INFO_TIMEOUT);
        if !output.ok() || output.stdout.trim().is_empty() {
            debug!(udid, code = output.code, "structured info unavailable");
            return None;
        }
        let value = plist::Value::from_reader_xml(output.stdout.as_bytes())
            .map_err(|err| debug!(udid, error = %err, "plist parse failed"))
            .ok()?;
        let mut raw = raw_info_from_plist(&value)?;
        raw.entry("UniqueDeviceID".to_string())
            .or_insert_with(|| RawValue::from(udid));
        Some(raw)
    }
}

/// Plain `ideviceinfo`: `key: value` lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextInfoSource;

impl InfoSource for TextInfoSource {
    fn name(&self) -> &'static str {
        "ideviceinfo-text"
    }

    fn tool(&self) -> &'static str {
        IDEVICEINFO
    }

    fn available(&self) -> bool {
        find_tool(IDEVICEINFO).is_some()
    }

    fn fetch(&self, udid: &str) -> Option<RawInfo> {
        let tool = find_tool(IDEVICEINFO)?;
        let output = run_tool(tool, &["-u", udid], INFO_TIMEOUT);
        if !output.ok() || output.stdout.trim().is_empty() {
            return None;
        }
        let mut raw = parse_kv_text(&output.stdout);
        let has_udid = matches!(raw.get("UniqueDeviceID"), Some(RawValue::String(value)) if !value.is_empty());
        if !has_udid {
            raw.insert("UniqueDeviceID".to_string(), RawValue::from(udid));
        }
        Some(raw)
    }
}
