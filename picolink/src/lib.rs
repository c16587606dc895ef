//! # picolink
//!
//! A library for keeping a persistent serial link to a Pico-class
//! (RP2040) device and re-flashing it over the same link.
//!
//! The core pieces:
//!
//! - Automatic port resolution by VID/PID/product/manufacturer hints
//! - Auto-reconnect with exponential backoff across unplug/replug cycles
//! - A ready/marker handshake that synchronizes session boundaries
//! - Line framing with lossy UTF-8 decoding of the device's output
//! - A firmware update engine that drives the UF2 mass-storage
//!   bootloader and copies images onto the exposed volume
//! - A session-rolling file recorder for the decoded lines
//!
//! The link runs on a dedicated background worker owned by
//! [`DeviceLink`]; the caller reads decoded [`LineEvent`]s from a bounded
//! channel and can request a firmware upload at any time.
//!
//! ## Example
//!
//! ```rust,no_run
//! use picolink::{DeviceLink, Settings, UploadRequest};
//! use std::time::Duration;
//!
//! fn main() -> picolink::Result<()> {
//!     let link = DeviceLink::spawn(Settings::default())?;
//!
//!     // Stream decoded lines; order is stable within one connection.
//!     for _ in 0..100 {
//!         if let Ok(event) = link.recv_line_timeout(Duration::from_millis(500)) {
//!             println!("{}", event.text);
//!         }
//!     }
//!
//!     // Flash new firmware; the link reconnects by itself afterwards.
//!     link.request_firmware_upload(UploadRequest::default())?;
//!
//!     link.stop();
//!     link.join()
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod config;
pub mod error;
pub mod framing;
pub mod handshake;
pub mod port;
pub mod recorder;
pub mod supervisor;
pub mod upload;

// Re-exports for convenience
pub use {
    backoff::BackoffPolicy,
    config::{LinkConfig, Platform, PortQuery, Settings, UploadConfig},
    error::{Error, Result},
    framing::LineFramer,
    handshake::{HandshakeHost, HandshakeOutcome},
    port::{PortDescriptor, detect_ports, resolve},
    recorder::{FileRecorder, LineSink},
    supervisor::{ConnectionState, DeviceLink, LineEvent, UploadRequest},
    upload::{FirmwareUpdater, UploadEvent, UploadOutcome, volume::VolumeInspector},
};
