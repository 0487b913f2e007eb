//! The only place raw tool property maps are interpreted. Everything past
//! [`normalize`] works with [`Device`].

use restorekit_core::{Connection, Device, DeviceMode};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

/// One property as reported by a device-info tool.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    String(String),
    Integer(i64),
    Real(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    Array(Vec<RawValue>),
    Dict(BTreeMap<String, RawValue>),
}

pub type RawInfo = BTreeMap<String, RawValue>;

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::String(value.to_string())
    }
}

impl From<String> for RawValue {
    fn from(value: String) -> Self {
        RawValue::String(value)
    }
}

impl From<i64> for RawValue {
    fn from(value: i64) -> Self {
        RawValue::Integer(value)
    }
}

impl From<bool> for RawValue {
    fn from(value: bool) -> Self {
        RawValue::Bool(value)
    }
}

impl From<Vec<u8>> for RawValue {
    fn from(value: Vec<u8>) -> Self {
        RawValue::Bytes(value)
    }
}

impl RawValue {
    /// Boolean true, a nonzero number, or "1"/"true"/"yes" in any case.
    pub fn is_truthy(&self) -> bool {
        match self {
            RawValue::Bool(value) => *value,
            RawValue::Integer(value) => *value != 0,
            RawValue::Real(value) => *value != 0.0,
            RawValue::String(value) => {
                matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
            }
            _ => false,
        }
    }

    fn as_text(&self) -> Option<String> {
        match self {
            RawValue::String(value) if !value.is_empty() => Some(value.clone()),
            RawValue::Integer(value) => Some(value.to_string()),
            RawValue::Real(value) => Some(value.to_string()),
            _ => None,
        }
    }

    /// JSON form used in `Device::details`; bytes become lower-case hex.
    pub fn to_json(&self) -> Value {
        match self {
            RawValue::String(value) => Value::String(value.clone()),
            RawValue::Integer(value) => Value::from(*value),
            RawValue::Real(value) => Number::from_f64(*value)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            RawValue::Bool(value) => Value::Bool(*value),
            RawValue::Bytes(value) => Value::String(hex::encode(value)),
            RawValue::Array(values) => Value::Array(values.iter().map(RawValue::to_json).collect()),
            RawValue::Dict(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect::<Map<String, Value>>(),
            ),
        }
    }
}

pub fn normalize(raw: &RawInfo, udid: Option<&str>, connection_hint: Option<&str>) -> Device {
    let connection_raw = text_field(raw, &["ConnectionType"]).or_else(|| connection_hint.map(str::to_string));
    Device {
        udid: text_field(raw, &["UniqueDeviceID", "udid"]).or_else(|| udid.map(str::to_string)),
        product_type: text_field(raw, &["ProductType", "product_type"]),
        product_version: text_field(raw, &["ProductVersion", "product_version"]),
        device_name: text_field(raw, &["DeviceName", "device_name"]),
        connection: Connection::from_hint(connection_raw.as_deref()),
        mode: detect_mode(raw),
        details: raw
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect(),
    }
}

pub fn detect_mode(raw: &RawInfo) -> DeviceMode {
    let flag = |key: &str| raw.get(key).map(RawValue::is_truthy).unwrap_or(false);
    let device_mode_dfu = matches!(
        raw.get("DeviceMode"),
        Some(RawValue::String(value)) if value.trim().eq_ignore_ascii_case("dfu")
    );
    if flag("DFUMode") || device_mode_dfu {
        return DeviceMode::Dfu;
    }
    if flag("RecoveryMode") || flag("IsInRecoveryMode") {
        return DeviceMode::Recovery;
    }
    if text_field(raw, &["ProductVersion"]).is_some() {
        return DeviceMode::Normal;
    }
    DeviceMode::Unknown
}

fn text_field(raw: &RawInfo, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| raw.get(*key).and_then(RawValue::as_text))
}

/// Parses `key: value` lines; blank lines and lines without a colon are skipped.
pub fn parse_kv_text(text: &str) -> RawInfo {
    let mut data = RawInfo::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        data.insert(key.trim().to_string(), RawValue::String(value.trim().to_string()));
    }
    data
}

pub fn raw_from_plist(value: &plist::Value) -> Option<RawValue> {
    let raw = match value {
        plist::Value::String(value) => RawValue::String(value.clone()),
        plist::Value::Boolean(value) => RawValue::Bool(*value),
        plist::Value::Integer(value) => match value.as_signed() {
            Some(signed) => RawValue::Integer(signed),
            None => RawValue::String(value.as_unsigned()?.to_string()),
        },
        plist::Value::Real(value) => RawValue::Real(*value),
        plist::Value::Data(value) => RawValue::Bytes(value.clone()),
        plist::Value::Date(value) => RawValue::String(value.to_xml_format()),
        plist::Value::Uid(value) => RawValue::Integer(i64::try_from(value.get()).ok()?),
        plist::Value::Array(values) => RawValue::Array(values.iter().filter_map(raw_from_plist).collect()),
        plist::Value::Dictionary(dict) => RawValue::Dict(
            dict.iter()
                .filter_map(|(key, value)| Some((key.clone(), raw_from_plist(value)?)))
                .collect(),
        ),
        _ => return None,
    };
    Some(raw)
}

/// Top-level dictionary of a property list, or `None` for any other root.
pub fn raw_info_from_plist(value: &plist::Value) -> Option<RawInfo> {
    match raw_from_plist(value)? {
        RawValue::Dict(entries) => Some(entries),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(entries: &[(&str, RawValue)]) -> RawInfo {
        entries
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn mode_follows_precedence() {
        assert_eq!(detect_mode(&info(&[("ProductVersion", "17.0".into())])), DeviceMode::Normal);
        assert_eq!(detect_mode(&info(&[("RecoveryMode", "1".into())])), DeviceMode::Recovery);
        assert_eq!(detect_mode(&RawInfo::new()), DeviceMode::Unknown);
        assert_eq!(
            detect_mode(&info(&[("DFUMode", true.into()), ("ProductVersion", "17.0".into())])),
            DeviceMode::Dfu
        );
        assert_eq!(
            detect_mode(&info(&[("DeviceMode", "dfu".into()), ("RecoveryMode", "yes".into())])),
            DeviceMode::Dfu
        );
        assert_eq!(
            detect_mode(&info(&[("IsInRecoveryMode", 1i64.into()), ("ProductVersion", "17.0".into())])),
            DeviceMode::Recovery
        );
    }

    #[test]
    fn truthiness_rules() {
        assert!(RawValue::from("TRUE").is_truthy());
        assert!(RawValue::from(" yes ").is_truthy());
        assert!(RawValue::from(2i64).is_truthy());
        assert!(RawValue::Real(0.5).is_truthy());
        assert!(!RawValue::from("0").is_truthy());
        assert!(!RawValue::from("on").is_truthy());
        assert!(!RawValue::from(false).is_truthy());
        assert!(!RawValue::Bytes(vec![1]).is_truthy());
    }

    #[test]
    fn normalize_maps_fields_and_connection() {
        let raw = info(&[
            ("ProductVersion", "17.0".into()),
            ("ProductType", "iPhone12,1".into()),
            ("DeviceName", "Demo".into()),
            ("UniqueDeviceID", "0001".into()),
        ]);
        let device = normalize(&raw, Some("ignored"), Some("USB"));
        assert_eq!(device.udid.as_deref(), Some("0001"));
        assert_eq!(device.product_type.as_deref(), Some("iPhone12,1"));
        assert_eq!(device.device_name.as_deref(), Some("Demo"));
        assert_eq!(device.mode, DeviceMode::Normal);
        assert_eq!(device.connection, Connection::Usb);
        assert_eq!(device.details["ProductType"], "iPhone12,1");

        let device = normalize(&info(&[("ConnectionType", "Network".into())]), Some("0002"), Some("usb"));
        assert_eq!(device.udid.as_deref(), Some("0002"));
        assert_eq!(device.connection, Connection::Unknown);
    }

    #[test]
    fn binary_values_become_hex_everywhere() {
        let mut nested = BTreeMap::new();
        nested.insert("Blob".to_string(), RawValue::Bytes(vec![0xde, 0xad]));
        let raw = info(&[
            ("BasebandSerialNumber", RawValue::Bytes(vec![0x00, 0x01])),
            ("Nested", RawValue::Dict(nested)),
            ("List", RawValue::Array(vec![RawValue::Bytes(vec![0xff])])),
        ]);
        let first = normalize(&raw, Some("0001"), None);
        let second = normalize(&raw, Some("0001"), None);
        assert_eq!(first.details["BasebandSerialNumber"], "0001");
        assert_eq!(first.details["Nested"]["Blob"], "dead");
        assert_eq!(first.details["List"][0], "ff");
        assert_eq!(first.details, second.details);
        assert!(serde_json::to_string(&first).is_ok());
    }

    #[test]
    fn kv_text_skips_noise() {
        let parsed = parse_kv_text(
            "\n    ProductType: iPhone12,1\n    DeviceName: Demo Phone\n    # comment\n    TimeZone: Europe/Berlin: CET\n",
        );
        assert_eq!(parsed["ProductType"], RawValue::from("iPhone12,1"));
        assert_eq!(parsed["DeviceName"], RawValue::from("Demo Phone"));
        assert_eq!(parsed["TimeZone"], RawValue::from("Europe/Berlin: CET"));
        assert_eq!(parsed.len(), 3);
    }

    #[test]
    fn plist_dictionary_converts_with_data() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>UniqueDeviceID</key><string>00008030-001</string>
    <key>ProductVersion</key><string>17.0</string>
    <key>BasebandSerialNumber</key><data>AAE=</data>
    <key>PasswordProtected</key><false/>
    <key>ChipID</key><integer>32816</integer>
</dict>
</plist>"#;
        let value = plist::Value::from_reader_xml(xml.as_bytes()).unwrap();
        let raw = raw_info_from_plist(&value).unwrap();
        assert_eq!(raw["BasebandSerialNumber"], RawValue::Bytes(vec![0x00, 0x01]));
        assert_eq!(raw["ChipID"], RawValue::Integer(32816));
        let device = normalize(&raw, None, None);
        assert_eq!(device.udid.as_deref(), Some("00008030-001"));
        assert_eq!(device.details["BasebandSerialNumber"], "0001");
        assert_eq!(device.details["PasswordProtected"], false);
    }
}
