use crate::HostError;
use std::fs;
use std::path::Path;

pub const APPLE_VENDOR_ID: &str = "05ac";

/// Whether any Apple USB device is attached, with a short sample of the
/// first match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbPresence {
    pub present: bool,
    pub sample: Option<String>,
}

#[cfg(windows)]
pub fn apple_usb_present() -> Result<UsbPresence, HostError> {
    use crate::tools::run_tool;
    use std::time::Duration;

    let script = format!(
        "Get-PnpDevice | Where-Object {{ $_.InstanceId -like 'USB\\VID_{}*' }} | Select-Object -First 1 | Out-String",
        APPLE_VENDOR_ID.to_ascii_uppercase()
    );
    let output = run_tool(
        "powershell",
        &["-NoProfile", "-Command", &script],
        Duration::from_secs(5),
    );
    if !output.ok() {
        let stderr = output.stderr.trim();
        return Err(HostError::Query(if stderr.is_empty() {
            format!("exit code {}", output.code)
        } else {
            stderr.to_string()
        }));
    }
    let sample = output.stdout.trim();
    Ok(UsbPresence {
        present: !sample.is_empty(),
        sample: (!sample.is_empty()).then(|| sample.to_string()),
    })
}

#[cfg(target_os = "linux")]
pub fn apple_usb_present() -> Result<UsbPresence, HostError> {
    scan_sysfs(Path::new("/sys/bus/usb/devices"))
}

#[cfg(not(any(windows, target_os = "linux")))]
pub fn apple_usb_present() -> Result<UsbPresence, HostError> {
    Err(HostError::Unsupported("USB device enumeration requires Windows or Linux"))
}

/// Looks for an Apple vendor id under a sysfs-style `devices` directory.
pub fn scan_sysfs(root: &Path) -> Result<UsbPresence, HostError> {
    let entries = fs::read_dir(root).map_err(|source| HostError::Io {
        context: format!("read {}", root.display()),
        source,
    })?;
    let mut names: Vec<_> = entries.filter_map(|entry| entry.ok()).map(|entry| entry.path()).collect();
    names.sort();
    for dir in names {
        let Ok(vendor) = fs::read_to_string(dir.join("idVendor")) else {
            continue;
        };
        if !vendor.trim().eq_ignore_ascii_case(APPLE_VENDOR_ID) {
            continue;
        }
        let product = fs::read_to_string(dir.join("product"))
            .map(|text| text.trim().to_string())
            .unwrap_or_default();
        let location = dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let sample = if product.is_empty() {
            location
        } else {
            format!("{} ({})", product, location)
        };
        return Ok(UsbPresence {
            present: true,
            sample: Some(sample),
        });
    }
    Ok(UsbPresence {
        present: false,
        sample: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(root: &Path, name: &str, vendor: &str, product: Option<&str>) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("idVendor"), format!("{}\n", vendor)).unwrap();
        if let Some(product) = product {
            fs::write(dir.join("product"), format!("{}\n", product)).unwrap();
        }
    }

    #[test]
    fn apple_vendor_is_found_in_sysfs() {
        let root = tempfile::tempdir().unwrap();
        device(root.path(), "1-1", "046d", Some("USB Receiver"));
        device(root.path(), "1-2", "05ac", Some("iPhone"));
        fs::create_dir_all(root.path().join("usb1")).unwrap();

        let presence = scan_sysfs(root.path()).unwrap();
        assert!(presence.present);
        assert_eq!(presence.sample.as_deref(), Some("iPhone (1-2)"));
    }

    #[test]
    fn no_apple_vendor_means_absent() {
        let root = tempfile::tempdir().unwrap();
        device(root.path(), "1-1", "046d", None);
        let presence = scan_sysfs(root.path()).unwrap();
        assert!(!presence.present);
        assert_eq!(presence.sample, None);
    }

    #[test]
    fn missing_root_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        assert!(scan_sysfs(&root.path().join("nope")).is_err());
    }
}
