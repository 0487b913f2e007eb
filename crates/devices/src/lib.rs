//! Device discovery, info lookup and normalization, recovery-mode tooling,
//! log capture and the DFU guide.

pub mod dfu;
pub mod diag;
pub mod discovery;
pub mod info;
pub mod logs;
pub mod normalize;
pub mod recovery;
pub mod resolver;

pub use dfu::{DfuGuideError, DfuInstructions};
pub use diag::{diag_usb, UsbDiagnostics};
pub use discovery::{default_backends, discover, DiscoveredDevice, Discovery, DiscoveryBackend};
pub use info::{InfoSource, PlistInfoSource, TextInfoSource};
pub use logs::{
    export_crashlogs, stream_syslog, CrashExport, CrashReportSource, IdeviceCrashReport, IdeviceSyslog,
    LogsError, SyslogOptions, SyslogSource, SyslogSummary,
};
pub use normalize::{normalize, RawInfo, RawValue};
pub use recovery::{DfuProbe, IrecoveryProbe, RecoveryStatus};
pub use resolver::DeviceResolver;
