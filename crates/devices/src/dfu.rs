//! Button sequences for putting a device into DFU mode.

use restorekit_core::{Device, DeviceError};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DfuStep {
    pub order: u8,
    pub description: &'static str,
    /// Seconds to hold, when the step is timed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
}

struct DfuGuide {
    product_type: &'static str,
    model: &'static str,
    steps: &'static [DfuStep],
}

const fn step(order: u8, description: &'static str, duration: Option<u32>) -> DfuStep {
    DfuStep {
        order,
        description,
        duration,
    }
}

static GUIDES: &[DfuGuide] = &[
    DfuGuide {
        product_type: "iPhone12,8",
        model: "iPhone SE (2nd/3rd generation)",
        steps: &[
            step(1, "Connect the device to this computer and power it off.", None),
            step(2, "Hold the side button and volume down together.", Some(10)),
            step(3, "Keep holding volume down and release the side button.", Some(5)),
            step(
                4,
                "Keep holding volume down until the screen stays dark and the host reports a new USB device.",
                None,
            ),
        ],
    },
    DfuGuide {
        product_type: "iPad11,7",
        model: "iPad (8th generation, Home button)",
        steps: &[
            step(1, "Connect the device to this computer and power it off.", None),
            step(2, "Hold the top button and the Home button together.", Some(10)),
            step(3, "Keep holding Home and release the top button.", Some(5)),
            step(
                4,
                "Keep holding Home until the screen stays dark and the host reports a new USB device.",
                None,
            ),
        ],
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DfuInstructions {
    pub product_type: String,
    pub model: &'static str,
    pub steps: Vec<DfuStep>,
    pub timings: Vec<u32>,
    pub total_duration: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DfuGuideError {
    #[error("no DFU guide for {0}")]
    UnknownModel(String),

    #[error("product type could not be determined; pass --model")]
    NoProductType,
}

fn family(product_type: &str) -> &str {
    product_type.split(',').next().unwrap_or(product_type)
}

/// Exact product type first, then any guide of the same family
/// (`iPhone12,1` uses the `iPhone12,8` sequence).
fn find_guide(product_type: &str) -> Option<&'static DfuGuide> {
    GUIDES
        .iter()
        .find(|guide| guide.product_type == product_type)
        .or_else(|| {
            GUIDES
                .iter()
                .find(|guide| family(guide.product_type) == family(product_type))
        })
}

pub fn instructions(product_type: &str) -> Result<DfuInstructions, DfuGuideError> {
    let guide = find_guide(product_type).ok_or_else(|| DfuGuideError::UnknownModel(product_type.to_string()))?;
    let timings: Vec<u32> = guide.steps.iter().filter_map(|step| step.duration).collect();
    Ok(DfuInstructions {
        product_type: product_type.to_string(),
        model: guide.model,
        steps: guide.steps.to_vec(),
        total_duration: timings.iter().sum(),
        timings,
    })
}

/// Picks the product type for the guide: the attached device's when `udid`
/// resolves, else `model`.
pub fn guide_product_type<F>(model: Option<&str>, udid: Option<&str>, lookup: F) -> Result<String, DfuGuideError>
where
    F: FnOnce(&str) -> Result<Device, DeviceError>,
{
    if let Some(udid) = udid {
        match lookup(udid) {
            Ok(device) => {
                if let Some(product_type) = device.product_type {
                    return Ok(product_type);
                }
            }
            Err(err) => warn!(udid, error = %err, "device info unavailable for DFU guide"),
        }
    }
    model.map(str::to_string).ok_or(DfuGuideError::NoProductType)
}
