//! Configuration surface for the device link and the firmware updater.
//!
//! Defaults reproduce the behavior of the reference deployment: a Raspberry
//! Pi Pico (RP2040) logging over USB-CDC at 115200 baud, announcing new
//! sessions with `::RPI-PICO-LOG::START`, and exposing an `RPI-RP2` labeled
//! mass-storage volume while in its UF2 bootloader.

use std::path::PathBuf;
use std::time::Duration;

/// Default baud rate for the data connection.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Marker substring the device emits at the start of each logical session.
pub const DEFAULT_SESSION_MARKER: &str = "::RPI-PICO-LOG::START";

/// Message the host repeats during the handshake until the marker arrives.
pub const DEFAULT_READY_MESSAGE: &str = "::RPI-ZERO-LOG::READY";

/// Command sent to the device to announce an imminent firmware upload.
pub const DEFAULT_UPLOAD_COMMAND: &str = "::RPI-ZERO-LOG::UPLOAD";

/// Baud rate whose open/close cycle resets an RP2040 into its bootloader.
pub const DEFAULT_TRIGGER_BAUD: u32 = 1200;

/// Volume label the RP2040 bootloader exposes.
pub const DEFAULT_DRIVE_LABEL: &str = "RPI-RP2";

/// File extension of flashable firmware images.
pub const DEFAULT_IMAGE_EXTENSION: &str = "uf2";

/// Platform hint used for port ordering and OS-specific drive discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Platform {
    /// Pick based on the compile-time target.
    #[default]
    Auto,
    /// POSIX conventions (`/dev/ttyACM*`, mount-table scanning).
    Linux,
    /// Windows conventions (`COM<n>`, volume-label queries).
    Windows,
}

impl Platform {
    /// Resolve `Auto` to a concrete platform before use.
    #[must_use]
    pub fn resolved(self) -> Self {
        match self {
            Self::Auto => {
                if cfg!(windows) {
                    Self::Windows
                } else {
                    Self::Linux
                }
            },
            other => other,
        }
    }
}

/// Criteria for selecting a serial port.
///
/// An explicit `port` short-circuits all other criteria; otherwise every
/// set field must match for a candidate to be accepted.
#[derive(Debug, Clone, Default)]
pub struct PortQuery {
    /// Explicit port path (e.g., `/dev/ttyACM0` or `COM3`); used unchecked.
    pub port: Option<String>,
    /// USB Vendor ID to match (`None` to ignore).
    pub vid: Option<u16>,
    /// USB Product ID to match (`None` to ignore).
    pub pid: Option<u16>,
    /// Case-insensitive substring of the USB product string (empty to ignore).
    pub product: String,
    /// Case-insensitive substring of the USB manufacturer string (empty to ignore).
    pub manufacturer: String,
    /// Port-ordering hint; resolved to a concrete platform before use.
    pub platform: Platform,
}

impl PortQuery {
    /// Query for an explicit port path.
    #[must_use]
    pub fn explicit(port: impl Into<String>) -> Self {
        Self {
            port: Some(port.into()),
            ..Self::default()
        }
    }
}

/// Settings for the connection lifecycle: handshake, streaming, reconnect.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Baud rate for the data connection.
    pub baud: u32,
    /// Substring that marks the start of a device session.
    pub session_marker: String,
    /// Message repeated during the handshake.
    pub ready_message: String,
    /// Command announcing a firmware upload to the device.
    pub upload_command: String,
    /// Serial read timeout; bounds every blocking read so control
    /// commands are observed between reads.
    pub serial_timeout: Duration,
    /// Maximum bytes per serial read.
    pub read_chunk_size: usize,
    /// First reconnect delay after a failure.
    pub initial_backoff: Duration,
    /// Ceiling for the reconnect delay.
    pub max_backoff: Duration,
    /// Wait between port-resolution attempts when no port is present.
    pub reconnect_retry_interval: Duration,
    /// Interval between handshake ready-message sends.
    pub handshake_send_interval: Duration,
    /// Optional bound on the handshake. `None` (the default) retries
    /// forever at the send interval, matching the reference behavior;
    /// set to give up and reconnect after the duration elapses.
    pub handshake_timeout: Option<Duration>,
    /// Capacity of the bounded channel delivering decoded lines.
    pub line_queue_capacity: usize,
    /// How long [`crate::DeviceLink::join`] waits for the worker to exit.
    pub join_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            baud: DEFAULT_BAUD,
            session_marker: DEFAULT_SESSION_MARKER.to_string(),
            ready_message: DEFAULT_READY_MESSAGE.to_string(),
            upload_command: DEFAULT_UPLOAD_COMMAND.to_string(),
            serial_timeout: Duration::from_millis(100),
            read_chunk_size: 1024,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
            reconnect_retry_interval: Duration::from_millis(500),
            handshake_send_interval: Duration::from_millis(500),
            handshake_timeout: None,
            line_queue_capacity: 1000,
            join_timeout: Duration::from_secs(2),
        }
    }
}

/// Settings for driving the bootloader and copying firmware images.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Baud rate whose open/close cycle triggers the bootloader reset.
    pub trigger_baud: u32,
    /// Volume label of the bootloader's mass-storage drive.
    pub drive_label: String,
    /// How long to wait for the drive to enumerate.
    pub drive_timeout: Duration,
    /// Interval between drive-discovery polls.
    pub drive_poll_interval: Duration,
    /// Extension of flashable image files in `image_dir`.
    pub image_extension: String,
    /// Directory holding the firmware images to copy.
    pub image_dir: PathBuf,
    /// Copy attempts per image before it is reported failed.
    pub copy_retries: u32,
    /// Wait between copy attempts.
    pub copy_retry_wait: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            trigger_baud: DEFAULT_TRIGGER_BAUD,
            drive_label: DEFAULT_DRIVE_LABEL.to_string(),
            drive_timeout: Duration::from_secs(20),
            drive_poll_interval: Duration::from_millis(500),
            image_extension: DEFAULT_IMAGE_EXTENSION.to_string(),
            image_dir: PathBuf::from("upload_binary"),
            copy_retries: 3,
            copy_retry_wait: Duration::from_secs(1),
        }
    }
}

/// Full settings bundle for a device link.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// Port-selection criteria.
    pub query: PortQuery,
    /// Connection lifecycle settings.
    pub link: LinkConfig,
    /// Firmware upload settings.
    pub upload: UploadConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_resolved_never_auto() {
        assert_ne!(Platform::Auto.resolved(), Platform::Auto);
    }

    #[test]
    fn test_platform_resolved_identity_for_concrete() {
        assert_eq!(Platform::Linux.resolved(), Platform::Linux);
        assert_eq!(Platform::Windows.resolved(), Platform::Windows);
    }

    #[test]
    fn test_link_defaults_match_reference_deployment() {
        let link = LinkConfig::default();
        assert_eq!(link.baud, 115_200);
        assert_eq!(link.session_marker, "::RPI-PICO-LOG::START");
        assert_eq!(link.ready_message, "::RPI-ZERO-LOG::READY");
        assert_eq!(link.initial_backoff, Duration::from_millis(500));
        assert_eq!(link.max_backoff, Duration::from_secs(5));
        assert!(link.handshake_timeout.is_none());
    }

    #[test]
    fn test_upload_defaults_match_rp2040() {
        let upload = UploadConfig::default();
        assert_eq!(upload.trigger_baud, 1200);
        assert_eq!(upload.drive_label, "RPI-RP2");
        assert_eq!(upload.image_extension, "uf2");
        assert_eq!(upload.drive_timeout, Duration::from_secs(20));
    }

    #[test]
    fn test_port_query_explicit() {
        let query = PortQuery::explicit("/dev/ttyACM3");
        assert_eq!(query.port.as_deref(), Some("/dev/ttyACM3"));
        assert!(query.vid.is_none());
        assert!(query.product.is_empty());
    }
}
