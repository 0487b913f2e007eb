use restorekit_core::Connection;
use restorekit_host::{find_tool, run_tool};
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub udid: String,
    pub connection: Connection,
    pub source: &'static str,
}

/// What one backend saw. `available == false` means its tool is absent,
/// which is different from an empty `devices` list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendScan {
    pub devices: Vec<DiscoveredDevice>,
    pub available: bool,
}

impl BackendScan {
    pub fn unavailable() -> Self {
        Self {
            devices: Vec::new(),
            available: false,
        }
    }

    pub fn empty() -> Self {
        Self {
            devices: Vec::new(),
            available: true,
        }
    }
}

pub trait DiscoveryBackend: Send + Sync {
    fn name(&self) -> &'static str;
    /// Executable the backend depends on, reported when it is missing.
    fn tool(&self) -> &'static str;
    fn scan(&self) -> BackendScan;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    pub devices: Vec<DiscoveredDevice>,
    pub missing_tools: Vec<String>,
    pub any_available: bool,
}

impl Discovery {
    /// Nothing found because nothing could look.
    pub fn tools_missing(&self) -> bool {
        self.devices.is_empty() && !self.any_available
    }

    pub fn udids(&self) -> Vec<String> {
        self.devices.iter().map(|device| device.udid.clone()).collect()
    }
}

/// Merges backend results in rank order. The first backend to report an
/// identifier owns its entry.
pub fn discover(backends: &[Box<dyn DiscoveryBackend>]) -> Discovery {
    let mut discovery = Discovery::default();
    let mut seen = HashSet::new();
    for backend in backends {
        let scan = backend.scan();
        debug!(
            backend = backend.name(),
            available = scan.available,
            found = scan.devices.len(),
            "discovery backend scanned"
        );
        if !scan.available {
            discovery.missing_tools.push(backend.tool().to_string());
            continue;
        }
        discovery.any_available = true;
        for device in scan.devices {
            if seen.insert(device.udid.clone()) {
                discovery.devices.push(device);
            }
        }
    }
    discovery
}

/// `pymobiledevice3 usbmux list`: JSON array with transport information.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsbmuxBackend;

impl DiscoveryBackend for UsbmuxBackend {
    fn name(&self) -> &'static str {
        "usbmux"
    }

    fn tool(&self) -> &'static str {
        "pymobiledevice3"
    }

    fn scan(&self) -> BackendScan {
        let Some(tool) = find_tool(self.tool()) else {
            return BackendScan::unavailable();
        };
        let output = run_tool(tool, &["usbmux", "list"], DISCOVERY_TIMEOUT);
        if !output.ok() {
            return BackendScan::empty();
        }
        BackendScan {
            devices: parse_usbmux_list(&output.stdout, self.name()),
            available: true,
        }
    }
}

pub fn parse_usbmux_list(text: &str, source: &'static str) -> Vec<DiscoveredDevice> {
    let Ok(serde_json::Value::Array(entries)) = serde_json::from_str::<serde_json::Value>(text) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let udid = ["Identifier", "UniqueDeviceID", "SerialNumber"]
                .iter()
                .find_map(|key| entry.get(*key).and_then(|value| value.as_str()))
                .filter(|value| !value.trim().is_empty())?;
            let connection = match entry.get("ConnectionType").and_then(|value| value.as_str()) {
                Some(kind) if kind.eq_ignore_ascii_case("network") => Connection::Wifi,
                other => Connection::from_hint(other),
            };
            Some(DiscoveredDevice {
                udid: udid.trim().to_string(),
                connection,
                source,
            })
        })
        .collect()
}

/// `idevice_id -l`: one identifier per line, USB only.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdeviceIdBackend;

impl DiscoveryBackend for IdeviceIdBackend {
    fn name(&self) -> &'static str {
        "idevice_id"
    }

    fn tool(&self) -> &'static str {
        "idevice_id"
    }

    fn scan(&self) -> BackendScan {
        let Some(tool) = find_tool(self.tool()) else {
            return BackendScan::unavailable();
        };
        let output = run_tool(tool, &["-l"], DISCOVERY_TIMEOUT);
        // idevice_id exits 1 when no device is attached.
        if output.code != 0 && output.code != 1 {
            return BackendScan::empty();
        }
        BackendScan {
            devices: parse_id_lines(&output.stdout, self.name()),
            available: true,
        }
    }
}

pub fn parse_id_lines(text: &str, source: &'static str) -> Vec<DiscoveredDevice> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|udid| DiscoveredDevice {
            udid: udid.to_string(),
            connection: Connection::Usb,
            source,
        })
        .collect()
}

pub fn default_backends() -> Vec<Box<dyn DiscoveryBackend>> {
    vec![Box::new(UsbmuxBackend), Box::new(IdeviceIdBackend)]
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;

    pub struct FakeBackend {
        pub name: &'static str,
        pub scan: BackendScan,
    }

    impl FakeBackend {
        pub fn with(name: &'static str, entries: &[(&str, Connection)]) -> Box<dyn DiscoveryBackend> {
            Box::new(Self {
                name,
                scan: BackendScan {
                    devices: entries
                        .iter()
                        .map(|(udid, connection)| DiscoveredDevice {
                            udid: udid.to_string(),
                            connection: *connection,
                            source: name,
                        })
                        .collect(),
                    available: true,
                },
            })
        }

        pub fn missing(name: &'static str) -> Box<dyn DiscoveryBackend> {
            Box::new(Self {
                name,
                scan: BackendScan::unavailable(),
            })
        }
    }

    impl DiscoveryBackend for FakeBackend {
        fn name(&self) -> &'static str {
            self.name
        }

        fn tool(&self) -> &'static str {
            self.name
        }

        fn scan(&self) -> BackendScan {
            self.scan.clone()
        }
    }
}
