//! Human and JSON renderings of command results.

use restorekit_core::{Device, DeviceError, RestoreResult};
use restorekit_devices::{CrashExport, RecoveryStatus, UsbDiagnostics};
use serde::Serialize;
use serde_json::{json, Value};

pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(err) => eprintln!("failed to format JSON output: {}", err),
    }
}

pub fn print_error(error: &anyhow::Error, json: bool) {
    if json {
        print_json(&json!({ "error": format!("{:#}", error) }));
    } else {
        eprintln!("Error: {}", error);
        for cause in error.chain().skip(1) {
            eprintln!("  caused by: {}", cause);
        }
    }
}

pub fn print_device_error(error: &DeviceError, json: bool) {
    if json {
        let mut payload = error.payload();
        if let Value::Object(map) = &mut payload {
            map.insert("error".to_string(), Value::String(error.to_string()));
        }
        print_json(&payload);
        return;
    }
    eprintln!("{}", error);
    match error {
        DeviceError::ToolMissing { tools } => eprintln!("Missing tools: {}", tools.join(", ")),
        DeviceError::MultipleDevicesAmbiguous { udids } => {
            for udid in udids {
                eprintln!("  {}", udid);
            }
        }
        _ => {}
    }
}

/// The device fields shown in listings; raw details are left out.
#[derive(Debug, Serialize)]
pub struct DeviceSummary<'a> {
    pub udid: Option<&'a str>,
    pub product_type: Option<&'a str>,
    pub product_version: Option<&'a str>,
    pub device_name: Option<&'a str>,
    pub mode: &'static str,
    pub connection: &'static str,
}

impl<'a> From<&'a Device> for DeviceSummary<'a> {
    fn from(device: &'a Device) -> Self {
        Self {
            udid: device.udid.as_deref(),
            product_type: device.product_type.as_deref(),
            product_version: device.product_version.as_deref(),
            device_name: device.device_name.as_deref(),
            mode: device.mode.as_str(),
            connection: device.connection.as_str(),
        }
    }
}

pub fn print_device_list(devices: &[Device], json: bool) {
    if json {
        let summaries: Vec<DeviceSummary<'_>> = devices.iter().map(DeviceSummary::from).collect();
        print_json(&summaries);
        return;
    }
    if devices.is_empty() {
        println!("No devices detected.");
        return;
    }
    let header = ["UDID", "PRODUCT", "VERSION", "NAME", "MODE", "CONNECTION"];
    let rows: Vec<[String; 6]> = devices
        .iter()
        .map(|device| {
            [
                device.udid.clone().unwrap_or_else(|| "?".to_string()),
                device.product_type.clone().unwrap_or_else(|| "?".to_string()),
                device.product_version.clone().unwrap_or_else(|| "?".to_string()),
                device.device_name.clone().unwrap_or_else(|| "?".to_string()),
                device.mode.to_string(),
                device.connection.to_string(),
            ]
        })
        .collect();
    let mut widths = header.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }
    print_row(&header.map(str::to_string), &widths);
    for row in &rows {
        print_row(row, &widths);
    }
}

fn print_row(cells: &[String; 6], widths: &[usize; 6]) {
    let line: Vec<String> = cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
        .collect();
    println!("{}", line.join("  ").trim_end());
}

pub fn print_device_info(device: &Device, json: bool) {
    if json {
        print_json(device);
        return;
    }
    let summary = DeviceSummary::from(device);
    let unknown = "?";
    println!("udid: {}", summary.udid.unwrap_or(unknown));
    println!("product_type: {}", summary.product_type.unwrap_or(unknown));
    println!("product_version: {}", summary.product_version.unwrap_or(unknown));
    println!("device_name: {}", summary.device_name.unwrap_or(unknown));
    println!("mode: {}", summary.mode);
    println!("connection: {}", summary.connection);
    if !device.details.is_empty() {
        println!("details:");
        for (key, value) in &device.details {
            match value {
                Value::String(text) => println!("  {}: {}", key, text),
                other => println!("  {}: {}", key, other),
            }
        }
    }
}

pub fn print_recovery_status(status: &RecoveryStatus, json: bool) {
    if json {
        print_json(status);
        return;
    }
    println!("mode: {}", status.mode);
    if let Some(error) = &status.error {
        println!("error: {}", error);
    }
}

pub fn print_restore_result(result: &RestoreResult, report: Option<&str>, json: bool) {
    if json {
        let mut value = serde_json::to_value(result).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.insert("outcome".to_string(), json!(result.outcome()));
            if let Some(report) = report {
                map.insert("report".to_string(), Value::String(report.to_string()));
            }
        }
        print_json(&value);
        return;
    }
    for step in &result.steps {
        let mark = if step.ok { "ok  " } else { "FAIL" };
        match &step.detail {
            Some(detail) => println!("[{}] {} ({})", mark, step.name, detail),
            None => println!("[{}] {}", mark, step.name),
        }
    }
    let status = if result.is_success() { "success" } else { "failure" };
    println!("Status: {} | Log: {}", status, result.logfile.display());
    if let Some(report) = report {
        println!("Report: {}", report);
    }
}

pub fn print_diag(diag: &UsbDiagnostics, json: bool) {
    if json {
        print_json(diag);
        return;
    }
    if diag.amds.supported {
        let amds_state = diag.amds.status.as_deref().unwrap_or("unknown");
        println!(
            "Apple Mobile Device Service: {} ({})",
            if diag.amds.running { "running" } else { "not running" },
            amds_state
        );
    } else {
        println!("Apple Mobile Device Service: not applicable on this host");
    }
    println!("Tools:");
    for entry in &diag.tools.entries {
        let location = entry.path.as_deref().unwrap_or("not found");
        match &entry.version {
            Some(version) => println!("  {:<20} {} [{}]", entry.name, location, version),
            None => println!("  {:<20} {}", entry.name, location),
        }
    }
    println!(
        "USB: dfu={} recovery={}",
        diag.usb.dfu_detected, diag.usb.recovery_detected
    );
    match (diag.host.apple_usb_present, &diag.host.apple_usb_error) {
        (Some(true), _) => println!(
            "Apple USB device: present ({})",
            diag.host.apple_usb_sample.as_deref().unwrap_or("?")
        ),
        (Some(false), _) => println!("Apple USB device: none found"),
        (None, Some(error)) => println!("Apple USB device: query failed ({})", error),
        (None, None) => {}
    }
    if let Some(free) = diag.host.disk_free_gb {
        println!("Disk free: {:.2} GB", free);
    }
    println!("PATH ({} chars): {}", diag.host.path_length, diag.host.path_preview);
    if !diag.hints.is_empty() {
        println!("Hints:");
        for hint in &diag.hints {
            println!("  - {}", hint);
        }
    }
}

pub fn print_crash_export(export: &CrashExport, json: bool) {
    if json {
        let mut value = serde_json::to_value(export).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            map.insert("status".to_string(), Value::String("success".to_string()));
        }
        print_json(&value);
        return;
    }
    println!("Exported: {} files | Skipped: {}", export.exported.len(), export.skipped);
    if !export.exported.is_empty() {
        println!("Files:");
        for path in &export.exported {
            println!("  {}", path.display());
        }
    }
    println!("Destination: {}", export.out_dir.display());
}
