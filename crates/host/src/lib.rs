//! Host-side plumbing: locating and running external tools, disk space and
//! service queries, and process termination.

pub mod process;
pub mod service;
pub mod tools;
pub mod usb;

#[cfg(windows)]
mod space;
#[cfg(unix)]
mod space_unix;

use std::path::Path;
use thiserror::Error;

pub use process::{request_terminate, wait_with_deadline};
pub use service::{ServiceSource, ServiceStatus};
pub use tools::{find_tool, run_tool, ToolOutput};
pub use usb::UsbPresence;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("{0}")]
    Unsupported(&'static str),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Query(String),
}

/// Everything the preflight and restore layers ask of the host machine.
pub trait HostProbe: Send + Sync {
    fn has_tool(&self, name: &str) -> bool;
    fn free_space_bytes(&self, path: &Path) -> Result<u64, HostError>;
    fn service_status(&self, name: &str) -> Result<ServiceStatus, HostError>;

    fn apple_usb_present(&self) -> Result<UsbPresence, HostError> {
        Err(HostError::Unsupported("USB device enumeration not available"))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHost;

impl HostProbe for SystemHost {
    fn has_tool(&self, name: &str) -> bool {
        find_tool(name).is_some()
    }

    fn free_space_bytes(&self, path: &Path) -> Result<u64, HostError> {
        free_space_bytes(path)
    }

    fn service_status(&self, name: &str) -> Result<ServiceStatus, HostError> {
        service::query_service(name)
    }

    fn apple_usb_present(&self) -> Result<UsbPresence, HostError> {
        usb::apple_usb_present()
    }
}

pub fn free_space_bytes(path: &Path) -> Result<u64, HostError> {
    #[cfg(unix)]
    {
        space_unix::free_space_bytes(path)
    }
    #[cfg(windows)]
    {
        space::free_space_bytes(path)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = path;
        Err(HostError::Unsupported("free space query is not supported on this OS"))
    }
}
