use crate::discovery::{default_backends, discover, Discovery, DiscoveryBackend};
use crate::info::{InfoSource, PlistInfoSource, TextInfoSource};
use crate::normalize::normalize;
use crate::recovery::{DfuProbe, IrecoveryProbe};
use restorekit_core::{Device, DeviceError, DeviceMode};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Turns an optional identifier into exactly one device, backed by ranked
/// discovery backends and a two-tier info lookup.
pub struct DeviceResolver {
    backends: Vec<Box<dyn DiscoveryBackend>>,
    structured: Box<dyn InfoSource>,
    text: Box<dyn InfoSource>,
    dfu_probe: Box<dyn DfuProbe>,
}

impl Default for DeviceResolver {
    fn default() -> Self {
        Self::system()
    }
}

impl DeviceResolver {
    pub fn new(
        backends: Vec<Box<dyn DiscoveryBackend>>,
        structured: Box<dyn InfoSource>,
        text: Box<dyn InfoSource>,
        dfu_probe: Box<dyn DfuProbe>,
    ) -> Self {
        Self {
            backends,
            structured,
            text,
            dfu_probe,
        }
    }

    /// Backed by the host's libimobiledevice/pymobiledevice3 tools.
    pub fn system() -> Self {
        Self::new(
            default_backends(),
            Box::new(PlistInfoSource),
            Box::new(TextInfoSource),
            Box::new(IrecoveryProbe),
        )
    }

    pub fn discover(&self) -> Discovery {
        discover(&self.backends)
    }

    /// A given identifier is returned as-is; otherwise discovery must yield
    /// exactly one candidate.
    pub fn resolve_target(&self, udid: Option<&str>) -> Result<String, DeviceError> {
        if let Some(udid) = udid {
            return Ok(udid.to_string());
        }
        let discovery = self.discover();
        if discovery.devices.is_empty() {
            if discovery.tools_missing() {
                return Err(DeviceError::tool_missing(discovery.missing_tools));
            }
            return Err(DeviceError::NoDevicesFound);
        }
        if discovery.devices.len() > 1 {
            return Err(DeviceError::ambiguous(discovery.udids()));
        }
        discovery
            .devices
            .into_iter()
            .next()
            .map(|device| device.udid)
            .ok_or(DeviceError::UdidUnresolved)
    }

    pub fn get_info(&self, udid: Option<&str>) -> Result<Device, DeviceError> {
        let udid = self.resolve_target(udid)?;
        self.lookup_info(&udid)
    }

    /// Info for a known identifier, without discovery.
    pub fn lookup_info(&self, udid: &str) -> Result<Device, DeviceError> {
        if udid.trim().is_empty() {
            return Err(DeviceError::UdidUnresolved);
        }
        if let Some(raw) = self.structured.fetch(udid) {
            debug!(udid, source = self.structured.name(), "device info fetched");
            return Ok(normalize(&raw, Some(udid), None));
        }
        if let Some(raw) = self.text.fetch(udid) {
            debug!(udid, source = self.text.name(), "device info fetched");
            return Ok(normalize(&raw, Some(udid), Some("usb")));
        }
        if !self.text.available() {
            return Err(DeviceError::tool_missing([self.text.tool()]));
        }
        Err(DeviceError::QueryFailed {
            udid: udid.to_string(),
        })
    }

    /// Every discovered device with whatever detail could be read for it.
    pub fn list_devices(&self, include_dfu: bool) -> Result<Vec<Device>, DeviceError> {
        let discovery = self.discover();
        let mut devices = Vec::with_capacity(discovery.devices.len());

        if discovery.devices.is_empty() {
            if discovery.tools_missing() && !discovery.missing_tools.is_empty() {
                return Err(DeviceError::tool_missing(discovery.missing_tools));
            }
        } else {
            let mut info_missing_tools = BTreeSet::new();
            for entry in &discovery.devices {
                let device = match self.lookup_info(&entry.udid) {
                    Ok(device) => device.with_connection_hint(entry.connection),
                    Err(DeviceError::ToolMissing { tools }) => {
                        info_missing_tools.extend(tools);
                        Device::bare(entry.udid.clone(), entry.connection)
                    }
                    Err(err) => {
                        debug!(udid = %entry.udid, error = %err, "info lookup degraded to bare entry");
                        Device::bare(entry.udid.clone(), entry.connection)
                    }
                };
                devices.push(device);
            }
            if !info_missing_tools.is_empty() {
                return Err(DeviceError::tool_missing(info_missing_tools));
            }
        }

        if include_dfu
            && !devices.iter().any(|device| device.mode == DeviceMode::Dfu)
            && self.dfu_probe.dfu_detected()
        {
            info!("DFU device detected via USB probe");
            devices.push(Device::dfu_placeholder());
        }
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::fakes::FakeBackend;
    use crate::normalize::{RawInfo, RawValue};
    use restorekit_core::Connection;
    use std::collections::BTreeMap;

    struct FakeInfo {
        available: bool,
        entries: BTreeMap<String, RawInfo>,
    }

    impl FakeInfo {
        fn empty(available: bool) -> Box<dyn InfoSource> {
            Box::new(Self {
                available,
                entries: BTreeMap::new(),
            })
        }

        fn with(udid: &str, entries: &[(&str, RawValue)]) -> Box<dyn InfoSource> {
            let raw = entries
                .iter()
                .map(|(key, value)| (key.to_string(), value.clone()))
                .collect();
            let mut map = BTreeMap::new();
            map.insert(udid.to_string(), raw);
            Box::new(Self {
                available: true,
                entries: map,
            })
        }
    }

    impl InfoSource for FakeInfo {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn tool(&self) -> &'static str {
            "ideviceinfo"
        }

        fn available(&self) -> bool {
            self.available
        }

        fn fetch(&self, udid: &str) -> Option<RawInfo> {
            self.entries.get(udid).cloned()
        }
    }

    struct FakeProbe(bool);

    impl DfuProbe for FakeProbe {
        fn dfu_detected(&self) -> bool {
            self.0
        }
    }

    fn resolver(
        backends: Vec<Box<dyn DiscoveryBackend>>,
        structured: Box<dyn InfoSource>,
        text: Box<dyn InfoSource>,
        dfu: bool,
    ) -> DeviceResolver {
        DeviceResolver::new(backends, structured, text, Box::new(FakeProbe(dfu)))
    }

    #[test]
    fn explicit_udid_is_returned_unchanged() {
        let r = resolver(vec![], FakeInfo::empty(true), FakeInfo::empty(true), false);
        assert_eq!(r.resolve_target(Some("anything")).unwrap(), "anything");
    }

    #[test]
    fn zero_candidates_is_no_devices() {
        let r = resolver(
            vec![FakeBackend::with("idevice_id", &[])],
            FakeInfo::empty(true),
            FakeInfo::empty(true),
            false,
        );
        assert!(matches!(r.resolve_target(None), Err(DeviceError::NoDevicesFound)));
    }

    #[test]
    fn zero_candidates_without_backends_is_tool_missing() {
        let r = resolver(
            vec![FakeBackend::missing("pymobiledevice3"), FakeBackend::missing("idevice_id")],
            FakeInfo::empty(true),
            FakeInfo::empty(true),
            false,
        );
        match r.resolve_target(None) {
            Err(DeviceError::ToolMissing { tools }) => {
                assert_eq!(tools, vec!["idevice_id", "pymobiledevice3"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn single_candidate_resolves() {
        let r = resolver(
            vec![FakeBackend::with("idevice_id", &[("AAA", Connection::Usb)])],
            FakeInfo::empty(true),
            FakeInfo::empty(true),
            false,
        );
        assert_eq!(r.resolve_target(None).unwrap(), "AAA");
    }

    #[test]
    fn several_candidates_are_ambiguous_and_sorted() {
        let r = resolver(
            vec![
                FakeBackend::with("usbmux", &[("CCC", Connection::Wifi), ("AAA", Connection::Usb)]),
                FakeBackend::with("idevice_id", &[("BBB", Connection::Usb), ("AAA", Connection::Usb)]),
            ],
            FakeInfo::empty(true),
            FakeInfo::empty(true),
            false,
        );
        match r.resolve_target(None) {
            Err(DeviceError::MultipleDevicesAmbiguous { udids }) => {
                assert_eq!(udids, vec!["AAA", "BBB", "CCC"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn structured_source_wins_over_text() {
        let r = resolver(
            vec![],
            FakeInfo::with("AAA", &[("ProductVersion", "17.0".into()), ("ConnectionType", "WiFi".into())]),
            FakeInfo::with("AAA", &[("ProductVersion", "16.0".into())]),
            false,
        );
        let device = r.get_info(Some("AAA")).unwrap();
        assert_eq!(device.product_version.as_deref(), Some("17.0"));
        assert_eq!(device.connection, Connection::Wifi);
    }

    #[test]
    fn text_fallback_assumes_usb() {
        let r = resolver(
            vec![],
            FakeInfo::empty(false),
            FakeInfo::with("AAA", &[("ProductVersion", "16.0".into())]),
            false,
        );
        let device = r.get_info(Some("AAA")).unwrap();
        assert_eq!(device.product_version.as_deref(), Some("16.0"));
        assert_eq!(device.connection, Connection::Usb);
        assert_eq!(device.mode, DeviceMode::Normal);
    }

    #[test]
    fn missing_fallback_tool_is_tool_missing() {
        let r = resolver(vec![], FakeInfo::empty(false), FakeInfo::empty(false), false);
        match r.get_info(Some("AAA")) {
            Err(DeviceError::ToolMissing { tools }) => assert_eq!(tools, vec!["ideviceinfo"]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn failing_but_present_tool_is_query_failure() {
        let r = resolver(vec![], FakeInfo::empty(true), FakeInfo::empty(true), false);
        assert!(matches!(r.get_info(Some("AAA")), Err(DeviceError::QueryFailed { .. })));
    }

    #[test]
    fn listing_degrades_failed_entries() {
        let r = resolver(
            vec![FakeBackend::with("usbmux", &[("AAA", Connection::Wifi), ("BBB", Connection::Usb)])],
            FakeInfo::with("AAA", &[("ProductVersion", "17.0".into())]),
            FakeInfo::empty(true),
            false,
        );
        let devices = r.list_devices(false).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].product_version.as_deref(), Some("17.0"));
        assert_eq!(devices[0].connection, Connection::Wifi);
        assert_eq!(devices[1], Device::bare("BBB", Connection::Usb));
    }

    #[test]
    fn listing_appends_single_dfu_placeholder() {
        let r = resolver(
            vec![FakeBackend::with("idevice_id", &[])],
            FakeInfo::empty(true),
            FakeInfo::empty(true),
            true,
        );
        let devices = r.list_devices(true).unwrap();
        assert_eq!(devices, vec![Device::dfu_placeholder()]);
        assert!(r.list_devices(false).unwrap().is_empty());
    }

    #[test]
    fn listing_skips_placeholder_when_dfu_already_listed() {
        let r = resolver(
            vec![FakeBackend::with("idevice_id", &[("AAA", Connection::Usb)])],
            FakeInfo::with("AAA", &[("DFUMode", true.into())]),
            FakeInfo::empty(true),
            true,
        );
        let devices = r.list_devices(true).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].mode, DeviceMode::Dfu);
    }
}
