//! Firmware update engine.
//!
//! Flashing an RP2040-class device over USB needs no protocol: close the
//! data connection, open the port briefly at 1200 baud (the documented
//! reset-into-bootloader mechanism), wait for the mass-storage volume to
//! enumerate, and copy the UF2 image(s) onto it. The device reboots into
//! the new firmware by itself, after which the supervisor's normal
//! reconnect/handshake cycle picks it back up.
//!
//! Every failure inside the engine is converted into an [`UploadOutcome`]
//! at this boundary — an upload can fail, but it can never take the link
//! worker down.

pub mod volume;

use std::fmt;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::config::Settings;
use crate::port;

/// Result of one firmware upload attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Every image was copied to the bootloader drive.
    Completed,
    /// The bootloader drive did not enumerate within the detection timeout.
    DriveNotFound,
    /// The upload directory contained no image files.
    NoImagesFound,
    /// One or more images failed to copy within the retry budget.
    CopyFailed(Vec<String>),
    /// The upload directory could not be read.
    Io(String),
}

impl UploadOutcome {
    /// Whether the upload flashed every image.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for UploadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::DriveNotFound => write!(f, "bootloader drive not found"),
            Self::NoImagesFound => write!(f, "no firmware images found"),
            Self::CopyFailed(images) => write!(f, "copy failed for: {}", images.join(", ")),
            Self::Io(cause) => write!(f, "I/O error: {cause}"),
        }
    }
}

/// Progress notifications emitted while an upload runs.
///
/// The engine reports through `log` as well; this callback exists so a
/// frontend can render progress without scraping log output.
#[derive(Debug)]
pub enum UploadEvent<'a> {
    /// The upload command was written to the live connection.
    CommandSent,
    /// About to open/close the port at the trigger baud rate.
    TriggeringBootloader {
        /// Port being used for the trigger.
        port: &'a str,
    },
    /// Polling for the bootloader's mass-storage volume.
    SearchingDrive {
        /// Volume label being searched for.
        label: &'a str,
    },
    /// The bootloader drive was found.
    DriveFound {
        /// Mount path of the drive.
        mount: &'a Path,
    },
    /// A copy attempt is starting.
    CopyingImage {
        /// Image being copied.
        image: &'a Path,
        /// 1-based attempt number.
        attempt: u32,
        /// Total attempts allowed.
        attempts: u32,
    },
    /// An image was copied successfully.
    ImageCopied {
        /// Image that was copied.
        image: &'a Path,
    },
    /// An image exhausted its retry budget.
    ImageFailed {
        /// Image that failed.
        image: &'a Path,
    },
}

/// Orchestrates the announce, trigger, locate, and copy steps of one
/// firmware upload.
pub struct FirmwareUpdater<'a> {
    settings: &'a Settings,
}

impl<'a> FirmwareUpdater<'a> {
    /// Create an updater over the link settings.
    #[must_use]
    pub fn new(settings: &'a Settings) -> Self {
        Self { settings }
    }

    /// Run the full upload sequence.
    ///
    /// `connection` is the still-open data connection, if any — the upload
    /// command is written to it before it is dropped (manual triggers pass
    /// `None`). `bound_port` is the port the connection was bound to, used
    /// as a fallback when re-resolution finds nothing. `cancelled` is
    /// polled at every suspension point.
    pub fn perform_upload(
        &self,
        connection: Option<Box<dyn serialport::SerialPort>>,
        bound_port: Option<&str>,
        cancelled: &mut dyn FnMut() -> bool,
        observer: &mut dyn FnMut(UploadEvent<'_>),
    ) -> UploadOutcome {
        let link = &self.settings.link;
        let upload = &self.settings.upload;

        // Step 1+2: announce the upload on the live connection, then drop
        // it — the trigger needs exclusive ownership of the port. The
        // device may already be unresponsive, so write errors only log.
        if let Some(mut conn) = connection {
            let command = format!("{}\n", link.upload_command);
            match conn.write_all(command.as_bytes()).and_then(|()| conn.flush()) {
                Ok(()) => {
                    info!("Upload command sent");
                    observer(UploadEvent::CommandSent);
                },
                Err(e) => warn!("Upload command write failed (continuing): {e}"),
            }
            drop(conn);
        }

        // Step 3: reset the device into its bootloader.
        let port_name = port::resolve(&self.settings.query)
            .map(|p| p.name)
            .or_else(|| bound_port.map(str::to_string));
        match &port_name {
            Some(name) => {
                observer(UploadEvent::TriggeringBootloader { port: name });
                trigger_bootloader(name, upload.trigger_baud);
            },
            None => warn!("No port available for bootloader trigger; assuming device is already in bootloader"),
        }

        // Step 4: wait for the mass-storage volume.
        info!(
            "Waiting up to {:?} for drive '{}'",
            upload.drive_timeout, upload.drive_label
        );
        observer(UploadEvent::SearchingDrive {
            label: &upload.drive_label,
        });
        let inspector = volume::platform_inspector();
        let Some(mount) = volume::locate(
            inspector.as_ref(),
            &upload.drive_label,
            upload.drive_timeout,
            upload.drive_poll_interval,
            &mut *cancelled,
        ) else {
            warn!(
                "Bootloader drive '{}' not found within {:?}",
                upload.drive_label, upload.drive_timeout
            );
            return UploadOutcome::DriveNotFound;
        };
        info!("Bootloader drive found at {}", mount.display());
        observer(UploadEvent::DriveFound { mount: &mount });

        // Step 5: collect the images.
        let images = match find_images(&upload.image_dir, &upload.image_extension) {
            Ok(images) => images,
            Err(e) => {
                warn!(
                    "Cannot read image directory {}: {e}",
                    upload.image_dir.display()
                );
                return UploadOutcome::Io(e.to_string());
            },
        };
        if images.is_empty() {
            warn!(
                "No .{} images in {}",
                upload.image_extension,
                upload.image_dir.display()
            );
            return UploadOutcome::NoImagesFound;
        }

        // Step 6+7: copy with bounded retry.
        copy_images(
            &images,
            &mount,
            upload.copy_retries,
            upload.copy_retry_wait,
            cancelled,
            observer,
        )
    }
}

/// Open and immediately close the port at the trigger baud rate.
///
/// On the RP2040 a 1200-baud open/close cycle resets the chip into its
/// mass-storage bootloader. Failure only logs — the device may already be
/// in the bootloader, in which case the port is gone.
fn trigger_bootloader(port_name: &str, baud: u32) {
    match serialport::new(port_name, baud)
        .timeout(Duration::from_millis(200))
        .open()
    {
        Ok(handle) => {
            drop(handle);
            info!("Bootloader trigger issued on {port_name}");
        },
        Err(e) => warn!("Could not open {port_name} at trigger baud: {e}"),
    }
}

/// Firmware images with the configured extension, in stable name order.
fn find_images(dir: &Path, extension: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut images: Vec<PathBuf> = fs::read_dir(dir)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
        })
        .collect();
    images.sort();
    Ok(images)
}

/// Copy each image to the drive, retrying per image up to `retries` times.
fn copy_images(
    images: &[PathBuf],
    mount: &Path,
    retries: u32,
    retry_wait: Duration,
    cancelled: &mut dyn FnMut() -> bool,
    observer: &mut dyn FnMut(UploadEvent<'_>),
) -> UploadOutcome {
    let attempts = retries.max(1);
    let mut failed = Vec::new();

    for image in images {
        let file_name = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| image.display().to_string());
        let dest = mount.join(&file_name);
        let mut copied = false;

        for attempt in 1..=attempts {
            if cancelled() {
                warn!("Upload cancelled; remaining images not copied");
                failed.push(file_name.clone());
                return UploadOutcome::CopyFailed(failed);
            }

            observer(UploadEvent::CopyingImage {
                image,
                attempt,
                attempts,
            });
            match fs::copy(image, &dest) {
                Ok(_) => {
                    info!("Copied {} -> {}", image.display(), dest.display());
                    observer(UploadEvent::ImageCopied { image });
                    copied = true;
                    break;
                },
                Err(e) => {
                    warn!(
                        "Copy attempt {attempt}/{attempts} failed for {}: {e}",
                        image.display()
                    );
                    if attempt < attempts {
                        thread::sleep(retry_wait);
                    }
                },
            }
        }

        if !copied {
            observer(UploadEvent::ImageFailed { image });
            failed.push(file_name);
        }
    }

    if failed.is_empty() {
        info!("Firmware upload complete ({} image(s))", images.len());
        UploadOutcome::Completed
    } else {
        UploadOutcome::CopyFailed(failed)
    }
}
