//! restorekit - inspect attached iOS devices and drive firmware restores.

mod logging;
mod output;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use restorekit_artifact::IpswValidator;
use restorekit_core::{RestoreOutcome, RestoreResult, RESTORE_TOOL_STEP};
use restorekit_devices::{
    dfu, diag_usb, export_crashlogs, recovery, stream_syslog, DeviceResolver, IdeviceCrashReport,
    IdeviceSyslog, LogsError, SyslogOptions,
};
use restorekit_host::SystemHost;
use restorekit_report::write_result_report;
use restorekit_restore::{load_patterns, RestoreOrchestrator, RestoreParams, RestoreSettings};
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "restorekit")]
#[command(about = "Inspect attached iOS devices and drive firmware restores")]
#[command(version)]
struct Cli {
    /// Machine-readable output
    #[arg(long, global = true)]
    json: bool,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory for session and restore logs
    #[arg(long, global = true, env = "RESTOREKIT_LOG_DIR", default_value = "logs")]
    log_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the tool version
    Version,

    /// List attached devices
    List {
        /// Also probe for a device sitting in DFU mode
        #[arg(long)]
        include_dfu: bool,
    },

    /// Show details for one device
    Info {
        #[arg(long)]
        udid: Option<String>,
    },

    /// Restore or update firmware
    Flash(FlashArgs),

    /// Stream the device syslog
    Logs {
        #[arg(long)]
        udid: Option<String>,

        /// Append matching lines to this file
        #[arg(long)]
        save: Option<PathBuf>,

        /// Only show lines matching this regular expression
        #[arg(long)]
        filter: Option<String>,

        /// Stop after this many seconds (0 streams until interrupted)
        #[arg(long, value_name = "SECONDS")]
        duration: Option<u64>,
    },

    /// Export crash reports from the device
    LogsCrash {
        #[arg(long)]
        udid: Option<String>,

        /// Destination directory
        #[arg(long)]
        out: PathBuf,

        /// Keep at most this many of the newest reports (0 keeps all)
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Walk through entering DFU mode
    DfuGuide {
        /// Product type, e.g. iPhone12,8
        #[arg(long)]
        model: Option<String>,

        /// Read the product type from this attached device
        #[arg(long)]
        udid: Option<String>,

        /// Print the steps without timed countdowns
        #[arg(long)]
        no_countdown: bool,
    },

    /// Recovery mode control
    Recovery {
        #[arg(value_enum)]
        action: RecoveryAction,

        #[arg(long)]
        udid: Option<String>,
    },

    /// Host diagnostics
    #[command(subcommand)]
    Diag(DiagCommands),
}

#[derive(Args, Debug)]
struct FlashArgs {
    #[arg(long)]
    udid: Option<String>,

    /// Firmware image (.ipsw)
    #[arg(long)]
    ipsw: Option<PathBuf>,

    /// Use the latest signed firmware (not available yet)
    #[arg(long)]
    latest: bool,

    /// Keep user data (`-r`) instead of erasing (`-w`)
    #[arg(long)]
    update: bool,

    /// Run the checks only
    #[arg(long)]
    preflight_only: bool,

    /// Print the restore command without running it
    #[arg(long)]
    dry_run: bool,

    /// Abort the restore after this many seconds (0 disables the bound)
    #[arg(long, value_name = "SECONDS")]
    timeout: Option<u64>,

    /// Write a report bundle under this directory
    #[arg(long)]
    report_dir: Option<PathBuf>,

    #[arg(long, env = "RESTOREKIT_MIN_DISK_GB", default_value_t = 10)]
    min_disk_gb: u64,

    #[arg(long, env = "RESTOREKIT_RESTORE_TOOL", default_value = RESTORE_TOOL_STEP)]
    restore_tool: String,

    /// JSON file replacing the milestone pattern table
    #[arg(long, env = "RESTOREKIT_STEP_PATTERNS")]
    step_patterns: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum RecoveryAction {
    Enter,
    Status,
    Kickout,
}

#[derive(Subcommand, Debug)]
enum DiagCommands {
    /// USB, driver service and tool inventory
    Usb,
}

const EXIT_OK: u8 = 0;
const EXIT_FAILURE: u8 = 1;
const EXIT_VALIDATION: u8 = 2;

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Some(path) = logging::init(&cli.log_dir, cli.verbose) {
        tracing::debug!(path = %path.display(), "session log opened");
    }

    match execute(&cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            output::print_error(&err, cli.json);
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn execute(cli: &Cli) -> Result<u8> {
    match &cli.command {
        Commands::Version => {
            let version = env!("CARGO_PKG_VERSION");
            if cli.json {
                output::print_json(&serde_json::json!({ "version": version }));
            } else {
                println!("restorekit v{}", version);
            }
            Ok(EXIT_OK)
        }
        Commands::List { include_dfu } => {
            match DeviceResolver::system().list_devices(*include_dfu) {
                Ok(devices) => {
                    output::print_device_list(&devices, cli.json);
                    Ok(EXIT_OK)
                }
                Err(err) => Ok(device_failure(&err, cli.json)),
            }
        }
        Commands::Info { udid } => match DeviceResolver::system().get_info(udid.as_deref()) {
            Ok(device) => {
                output::print_device_info(&device, cli.json);
                Ok(EXIT_OK)
            }
            Err(err) => Ok(device_failure(&err, cli.json)),
        },
        Commands::Flash(args) => flash(cli, args),
        Commands::Logs {
            udid,
            save,
            filter,
            duration,
        } => {
            let options = SyslogOptions {
                udid: udid.as_deref(),
                save: save.as_deref(),
                filter: filter.as_deref(),
                duration: duration.map(Duration::from_secs),
            };
            let stdout = std::io::stdout();
            match stream_syslog(&IdeviceSyslog, &options, &mut stdout.lock()) {
                Ok(summary) => {
                    info!(lines = summary.lines_matched, "syslog stream ended");
                    Ok(EXIT_OK)
                }
                Err(err) => Ok(logs_failure(err, cli.json)),
            }
        }
        Commands::LogsCrash { udid, out, limit } => {
            match export_crashlogs(&IdeviceCrashReport, udid.as_deref(), out, *limit) {
                Ok(export) => {
                    output::print_crash_export(&export, cli.json);
                    Ok(EXIT_OK)
                }
                Err(err) => {
                    output::print_error(&anyhow::Error::from(err), cli.json);
                    Ok(EXIT_FAILURE)
                }
            }
        }
        Commands::DfuGuide {
            model,
            udid,
            no_countdown,
        } => dfu_guide(model.as_deref(), udid.as_deref(), !no_countdown, cli.json),
        Commands::Recovery { action, udid } => Ok(run_recovery(*action, udid.as_deref(), cli.json)),
        Commands::Diag(DiagCommands::Usb) => {
            output::print_diag(&diag_usb(&SystemHost), cli.json);
            Ok(EXIT_OK)
        }
    }
}

fn device_failure(err: &restorekit_core::DeviceError, json: bool) -> u8 {
    output::print_device_error(err, json);
    u8::try_from(err.exit_code()).unwrap_or(EXIT_FAILURE)
}

fn logs_failure(err: LogsError, json: bool) -> u8 {
    let code = match err {
        LogsError::ToolMissing(_) | LogsError::InvalidFilter(_) => EXIT_VALIDATION,
        _ => EXIT_FAILURE,
    };
    output::print_error(&anyhow::Error::from(err), json);
    code
}

fn dfu_guide(model: Option<&str>, udid: Option<&str>, countdown: bool, json: bool) -> Result<u8> {
    let product_type = dfu::guide_product_type(model, udid, |udid| DeviceResolver::system().lookup_info(udid))?;
    let instructions = dfu::instructions(&product_type)?;
    if json {
        output::print_json(&instructions);
        return Ok(EXIT_OK);
    }
    println!("DFU guide for {}", instructions.model);
    for step in &instructions.steps {
        match step.duration.filter(|_| countdown) {
            Some(seconds) => {
                for remaining in (1..=seconds).rev() {
                    println!("{} ({}s)", step.description, remaining);
                    thread::sleep(Duration::from_secs(1));
                }
            }
            None => println!("{}", step.description),
        }
    }
    println!("Once the device is in DFU, confirm with `restorekit recovery status --json`.");
    Ok(EXIT_OK)
}

fn run_recovery(action: RecoveryAction, udid: Option<&str>, json: bool) -> u8 {
    match action {
        RecoveryAction::Status => {
            output::print_recovery_status(&recovery::status(udid), json);
            EXIT_OK
        }
        RecoveryAction::Enter | RecoveryAction::Kickout => {
            let ok = if action == RecoveryAction::Enter {
                recovery::enter(udid)
            } else {
                recovery::kickout(udid)
            };
            if json {
                output::print_json(&serde_json::json!({ "ok": ok }));
            }
            if ok {
                EXIT_OK
            } else {
                EXIT_FAILURE
            }
        }
    }
}

fn restore_settings(cli: &Cli, args: &FlashArgs) -> Result<RestoreSettings> {
    let mut settings = RestoreSettings {
        restore_tool: args.restore_tool.clone(),
        log_dir: cli.log_dir.clone(),
        min_disk_gb: args.min_disk_gb,
        ..RestoreSettings::default()
    };
    if let Some(path) = &args.step_patterns {
        settings.step_patterns = load_patterns(path)?;
        info!(path = %path.display(), "using custom step patterns");
    }
    Ok(settings)
}

fn flash(cli: &Cli, args: &FlashArgs) -> Result<u8> {
    let settings = match restore_settings(cli, args) {
        Ok(settings) => settings,
        Err(err) => {
            output::print_error(&err, cli.json);
            return Ok(EXIT_VALIDATION);
        }
    };
    let host = SystemHost;
    let validator = IpswValidator;
    let resolver = DeviceResolver::system();
    let orchestrator = RestoreOrchestrator::new(settings, &host, &validator, &resolver);

    let result = orchestrator.run(&RestoreParams {
        udid: args.udid.clone(),
        ipsw: args.ipsw.clone(),
        latest: args.latest,
        wipe: !args.update,
        preflight_only: args.preflight_only,
        dry_run: args.dry_run,
        timeout: args.timeout.map(Duration::from_secs),
    });

    let report = match &args.report_dir {
        Some(dir) => match write_result_report(dir, &result)
            .with_context(|| format!("write report under {}", dir.display()))
        {
            Ok(paths) => Some(paths.root.display().to_string()),
            Err(err) => {
                warn!(error = %format!("{:#}", err), "report bundle not written");
                None
            }
        },
        None => None,
    };

    output::print_restore_result(&result, report.as_deref(), cli.json);
    Ok(flash_exit_code(&result))
}

fn flash_exit_code(result: &RestoreResult) -> u8 {
    match result.outcome() {
        RestoreOutcome::Success => EXIT_OK,
        RestoreOutcome::OperationalFailure | RestoreOutcome::Timeout => EXIT_FAILURE,
        RestoreOutcome::ValidationFailure | RestoreOutcome::Unsupported => EXIT_VALIDATION,
    }
}
