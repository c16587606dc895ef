//! Upload command implementation.
//!
//! Manual firmware-upload trigger: a thin caller of the library's update
//! engine. Useful when no recording session is running — for example to
//! flash a device straight from CI or a bench script.

use anyhow::{Context, Result, bail};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use picolink::{FirmwareUpdater, Settings, UploadEvent};
use std::time::Duration;

use crate::{serial, use_fancy_output, was_interrupted};

/// Run the upload sequence once and report the outcome.
pub(crate) fn cmd_upload(mut settings: Settings, quiet: bool, non_interactive: bool) -> Result<()> {
    // The trigger needs a port. If the resolver finds nothing, fall back
    // to manual selection; without any port the engine still polls for an
    // already-bootloadered device.
    if settings.query.port.is_none() && picolink::resolve(&settings.query).is_none() {
        match serial::choose_port(non_interactive) {
            Ok(port) => settings.query.port = Some(port),
            Err(e) => {
                eprintln!(
                    "{} {e}; proceeding without a bootloader trigger",
                    style("⚠").yellow()
                );
            },
        }
    }

    std::fs::create_dir_all(&settings.upload.image_dir).with_context(|| {
        format!(
            "Failed to create image directory {}",
            settings.upload.image_dir.display()
        )
    })?;

    if !quiet {
        eprintln!(
            "{} Uploading images from {}",
            style("📦").cyan(),
            style(settings.upload.image_dir.display()).green()
        );
    }

    let pb = if quiet || !use_fancy_output() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new_spinner();
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap(),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    };

    let updater = FirmwareUpdater::new(&settings);
    let outcome = updater.perform_upload(
        None,
        None,
        &mut was_interrupted,
        &mut |event| match event {
            UploadEvent::CommandSent => {},
            UploadEvent::TriggeringBootloader { port } => {
                pb.set_message(format!("Triggering bootloader on {port}"));
            },
            UploadEvent::SearchingDrive { label } => {
                pb.set_message(format!("Waiting for drive '{label}'"));
            },
            UploadEvent::DriveFound { mount } => {
                pb.println(format!(
                    "{} Drive found at {}",
                    style("✓").green(),
                    mount.display()
                ));
            },
            UploadEvent::CopyingImage {
                image,
                attempt,
                attempts,
            } => {
                pb.set_message(format!(
                    "Copying {} (attempt {attempt}/{attempts})",
                    image.display()
                ));
            },
            UploadEvent::ImageCopied { image } => {
                pb.println(format!("{} Copied {}", style("✓").green(), image.display()));
            },
            UploadEvent::ImageFailed { image } => {
                pb.println(format!("{} Failed {}", style("✗").red(), image.display()));
            },
        },
    );

    pb.finish_and_clear();

    if outcome.is_success() {
        if !quiet {
            eprintln!(
                "{} Firmware upload completed; the device reboots into the new image",
                style("🎉").green().bold()
            );
        }
        Ok(())
    } else {
        bail!("Firmware upload failed: {outcome}");
    }
}
