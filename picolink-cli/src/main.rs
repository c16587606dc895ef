//! picolink CLI - record a Pico-class device's serial output and flash it.
//!
//! ## Features
//!
//! - Continuous recording with auto-reconnect and session-rolling logs
//! - Firmware upload over the UF2 mass-storage bootloader
//! - Serial port auto-detection by VID/PID/product/manufacturer
//! - Shell completion generation
//! - Environment variable support

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{Shell, generate};
use console::style;
use env_logger::Env;
use log::debug;
use picolink::{LinkConfig, Platform, PortQuery, Settings, UploadConfig};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

mod commands;
mod config;
mod serial;

use commands::record::cmd_record;
use commands::upload::cmd_upload;
use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl+C handler; polled by every long-running loop.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl+C was received.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

fn install_interrupt_handler() {
    let _ = ctrlc::set_handler(|| {
        INTERRUPTED.store(true, Ordering::SeqCst);
    });
}

/// picolink - record a Pico's USB-CDC output and flash UF2 firmware.
///
/// Environment variables:
///   PICOLINK_PORT              - Default serial port
///   PICOLINK_BAUD              - Default baud rate (default: 115200)
///   PICOLINK_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "picolink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port (e.g., /dev/ttyACM0 or COM3). Auto-detected if omitted.
    #[arg(short, long, global = true, env = "PICOLINK_PORT")]
    port: Option<String>,

    /// Baud rate for the data connection.
    #[arg(short, long, global = true, env = "PICOLINK_BAUD")]
    baud: Option<u32>,

    /// USB Vendor ID to match (accepts 0x prefix; 0 to ignore).
    #[arg(long, global = true, value_parser = parse_hex_u16)]
    vid: Option<u16>,

    /// USB Product ID to match (accepts 0x prefix; 0 to ignore).
    #[arg(long, global = true, value_parser = parse_hex_u16)]
    pid: Option<u16>,

    /// Substring of the USB product string (case-insensitive).
    #[arg(long, global = true)]
    product: Option<String>,

    /// Substring of the USB manufacturer string (case-insensitive).
    #[arg(long, global = true)]
    manufacturer: Option<String>,

    /// Hint for device ordering; detection works regardless.
    #[arg(long, global = true, value_enum, default_value = "auto")]
    platform: PlatformArg,

    /// Marker that starts a new session.
    #[arg(long, global = true)]
    session_marker: Option<String>,

    /// Give up on the handshake after this many seconds. By default the
    /// handshake retries forever, matching the device's slow-boot behavior.
    #[arg(long, global = true, value_name = "SECS")]
    handshake_timeout: Option<u64>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "PICOLINK_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Platform hint values.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum PlatformArg {
    /// Pick based on the running OS.
    Auto,
    /// POSIX conventions.
    Linux,
    /// Windows conventions.
    Windows,
}

impl From<PlatformArg> for Platform {
    fn from(arg: PlatformArg) -> Self {
        match arg {
            PlatformArg::Auto => Self::Auto,
            PlatformArg::Linux => Self::Linux,
            PlatformArg::Windows => Self::Windows,
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Record device output into session log files.
    Record {
        /// Directory to write logs into.
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Directory for data lines; omitting it disables the data tee.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Prefix that identifies data lines.
        #[arg(long, default_value = "D")]
        data_prefix: String,

        /// Directory holding firmware images for Ctrl+U uploads.
        #[arg(long)]
        image_dir: Option<PathBuf>,
    },

    /// Flash UF2 images by driving the device into its bootloader.
    Upload {
        /// Directory holding the firmware images to copy.
        #[arg(long)]
        image_dir: Option<PathBuf>,

        /// Volume label to look for on the bootloader drive.
        #[arg(long)]
        label: Option<String>,

        /// Seconds to wait for the bootloader drive to appear.
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Parse a USB id (supports 0x prefix and plain decimal).
fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|e| format!("Invalid USB id '{s}': {e}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if std::env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(Some(env_logger::TimestampPrecision::Seconds))
        .init();

    debug!("picolink v{}", env!("CARGO_PKG_VERSION"));

    install_interrupt_handler();

    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    let settings = build_settings(&cli, &config);

    match &cli.command {
        Commands::Record {
            log_dir,
            data_dir,
            data_prefix,
            image_dir,
        } => {
            let mut settings = settings;
            if let Some(dir) = image_dir.clone() {
                settings.upload.image_dir = dir;
            }
            let log_dir = log_dir
                .clone()
                .or_else(|| config.record.log_dir.clone())
                .unwrap_or_else(|| PathBuf::from("logs"));
            let data_dir = data_dir.clone().or_else(|| config.record.data_dir.clone());
            cmd_record(settings, log_dir, data_dir, data_prefix, cli.quiet)?;
        },
        Commands::Upload {
            image_dir,
            label,
            timeout,
        } => {
            let mut settings = settings;
            if let Some(dir) = image_dir.clone() {
                settings.upload.image_dir = dir;
            }
            if let Some(label) = label.clone() {
                settings.upload.drive_label = label;
            }
            if let Some(secs) = timeout {
                settings.upload.drive_timeout = Duration::from_secs(*secs);
            }
            cmd_upload(settings, cli.quiet, cli.non_interactive)?;
        },
        Commands::ListPorts { json } => {
            cmd_list_ports(*json);
        },
        Commands::Completions { shell } => {
            cmd_completions(*shell);
        },
    }

    Ok(())
}

/// Fold CLI arguments over config-file values into the library settings.
fn build_settings(cli: &Cli, config: &Config) -> Settings {
    let query = PortQuery {
        port: cli.port.clone().or_else(|| config.connection.port.clone()),
        vid: cli
            .vid
            .or(config.connection.vid)
            .filter(|v| *v != 0),
        pid: cli
            .pid
            .or(config.connection.pid)
            .filter(|p| *p != 0),
        product: cli
            .product
            .clone()
            .or_else(|| config.connection.product.clone())
            .unwrap_or_default(),
        manufacturer: cli
            .manufacturer
            .clone()
            .or_else(|| config.connection.manufacturer.clone())
            .unwrap_or_default(),
        platform: cli.platform.into(),
    };

    let mut link = LinkConfig {
        handshake_timeout: cli.handshake_timeout.map(Duration::from_secs),
        ..LinkConfig::default()
    };
    if let Some(baud) = cli.baud.or(config.connection.baud) {
        link.baud = baud;
    }
    if let Some(marker) = cli
        .session_marker
        .clone()
        .or_else(|| config.record.session_marker.clone())
    {
        link.session_marker = marker;
    }

    let mut upload = UploadConfig::default();
    if let Some(label) = config.upload.label.clone() {
        upload.drive_label = label;
    }
    if let Some(dir) = config.upload.image_dir.clone() {
        upload.image_dir = dir;
    }
    if let Some(secs) = config.upload.timeout_secs {
        upload.drive_timeout = Duration::from_secs(secs);
    }

    Settings {
        query,
        link,
        upload,
    }
}

/// List ports command implementation.
fn cmd_list_ports(json: bool) {
    let detected = picolink::detect_ports();

    if json {
        let ports: Vec<serde_json::Value> = detected
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&ports).unwrap_or_default()
        );
        return;
    }

    eprintln!("{}", style("Available serial ports").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return;
    }

    for port in &detected {
        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{vid_pid}{product}",
            style("•").green(),
            style(&port.name).cyan()
        );
    }
}

/// Generate shell completions.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    // ---- clap validation ----

    #[test]
    fn test_cli_command_is_valid() {
        // Verifies that all derive macros produce a valid clap Command
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_record_defaults() {
        let cli = Cli::try_parse_from(["picolink", "record"]).unwrap();
        assert!(cli.port.is_none());
        assert!(cli.baud.is_none());
        assert!(!cli.quiet);
        if let Commands::Record {
            log_dir,
            data_dir,
            data_prefix,
            image_dir,
        } = cli.command
        {
            assert!(log_dir.is_none());
            assert!(data_dir.is_none());
            assert_eq!(data_prefix, "D");
            assert!(image_dir.is_none());
        } else {
            panic!("Expected Record command");
        }
    }

    #[test]
    fn test_cli_parse_record_with_options() {
        let cli = Cli::try_parse_from([
            "picolink",
            "--port",
            "/dev/ttyACM0",
            "--baud",
            "9600",
            "record",
            "--log-dir",
            "out",
            "--data-dir",
            "data",
            "--data-prefix",
            "X",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(cli.baud, Some(9600));
        if let Commands::Record {
            log_dir,
            data_dir,
            data_prefix,
            ..
        } = cli.command
        {
            assert_eq!(log_dir.unwrap().to_str().unwrap(), "out");
            assert_eq!(data_dir.unwrap().to_str().unwrap(), "data");
            assert_eq!(data_prefix, "X");
        } else {
            panic!("Expected Record command");
        }
    }

    #[test]
    fn test_cli_parse_upload() {
        let cli = Cli::try_parse_from([
            "picolink",
            "upload",
            "--image-dir",
            "firmware",
            "--label",
            "RPI-RP2",
            "--timeout",
            "30",
        ])
        .unwrap();
        if let Commands::Upload {
            image_dir,
            label,
            timeout,
        } = cli.command
        {
            assert_eq!(image_dir.unwrap().to_str().unwrap(), "firmware");
            assert_eq!(label.as_deref(), Some("RPI-RP2"));
            assert_eq!(timeout, Some(30));
        } else {
            panic!("Expected Upload command");
        }
    }

    #[test]
    fn test_cli_parse_list_ports_json() {
        let cli = Cli::try_parse_from(["picolink", "list-ports", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::ListPorts { json: true }));
    }

    #[test]
    fn test_cli_parse_vid_pid_hex_and_decimal() {
        let cli = Cli::try_parse_from([
            "picolink",
            "--vid",
            "0x2E8A",
            "--pid",
            "10",
            "list-ports",
        ])
        .unwrap();
        assert_eq!(cli.vid, Some(0x2E8A));
        assert_eq!(cli.pid, Some(10));
    }

    #[test]
    fn test_cli_parse_platform_values() {
        for (value, expected) in [
            ("auto", Platform::Auto),
            ("linux", Platform::Linux),
            ("windows", Platform::Windows),
        ] {
            let cli =
                Cli::try_parse_from(["picolink", "--platform", value, "list-ports"]).unwrap();
            assert_eq!(Platform::from(cli.platform), expected);
        }
    }

    #[test]
    fn test_cli_missing_subcommand_fails() {
        assert!(Cli::try_parse_from(["picolink"]).is_err());
    }

    #[test]
    fn test_cli_invalid_platform_fails() {
        assert!(Cli::try_parse_from(["picolink", "--platform", "bsd", "list-ports"]).is_err());
    }

    // ---- parse_hex_u16 ----

    #[test]
    fn test_parse_hex_u16_with_prefix() {
        assert_eq!(parse_hex_u16("0x2E8A").unwrap(), 0x2E8A);
        assert_eq!(parse_hex_u16("0X2E8A").unwrap(), 0x2E8A);
    }

    #[test]
    fn test_parse_hex_u16_decimal() {
        assert_eq!(parse_hex_u16("11914").unwrap(), 11914);
        assert_eq!(parse_hex_u16("0").unwrap(), 0);
    }

    #[test]
    fn test_parse_hex_u16_invalid() {
        assert!(parse_hex_u16("pico").is_err());
        assert!(parse_hex_u16("0xZZ").is_err());
        assert!(parse_hex_u16("70000").is_err());
    }

    // ---- build_settings ----

    #[test]
    fn test_build_settings_defaults() {
        let cli = Cli::try_parse_from(["picolink", "record"]).unwrap();
        let settings = build_settings(&cli, &Config::default());
        assert_eq!(settings.link.baud, 115_200);
        assert_eq!(settings.link.session_marker, "::RPI-PICO-LOG::START");
        assert!(settings.link.handshake_timeout.is_none());
        assert!(settings.query.port.is_none());
        assert!(settings.query.vid.is_none());
    }

    #[test]
    fn test_build_settings_cli_overrides_config() {
        let cli = Cli::try_parse_from(["picolink", "--port", "/dev/ttyACM9", "record"]).unwrap();
        let mut config = Config::default();
        config.connection.port = Some("/dev/ttyACM0".to_string());
        config.connection.baud = Some(9600);

        let settings = build_settings(&cli, &config);
        // CLI port wins; config baud applies since the CLI left it unset.
        assert_eq!(settings.query.port.as_deref(), Some("/dev/ttyACM9"));
        assert_eq!(settings.link.baud, 9600);
    }

    #[test]
    fn test_build_settings_zero_vid_means_ignore() {
        let cli = Cli::try_parse_from(["picolink", "--vid", "0", "record"]).unwrap();
        let settings = build_settings(&cli, &Config::default());
        assert!(settings.query.vid.is_none());
    }

    #[test]
    fn test_build_settings_handshake_timeout_opt_in() {
        let cli =
            Cli::try_parse_from(["picolink", "--handshake-timeout", "30", "record"]).unwrap();
        let settings = build_settings(&cli, &Config::default());
        assert_eq!(
            settings.link.handshake_timeout,
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_build_settings_upload_config_applies() {
        let cli = Cli::try_parse_from(["picolink", "upload"]).unwrap();
        let mut config = Config::default();
        config.upload.label = Some("CUSTOM".to_string());
        config.upload.timeout_secs = Some(5);

        let settings = build_settings(&cli, &config);
        assert_eq!(settings.upload.drive_label, "CUSTOM");
        assert_eq!(settings.upload.drive_timeout, Duration::from_secs(5));
    }
}
