//! Record command implementation.
//!
//! Runs the link supervisor, echoes each decoded line to stdout, and
//! records it through the session-rolling file recorder. In a TTY the
//! terminal runs in raw mode so single keys work: Ctrl+C stops, Ctrl+U
//! triggers a firmware upload without interrupting the recording loop
//! (the supervisor handles the flash and reconnects by itself).

use std::io::{self, IsTerminal, Write as _};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use console::style;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyModifiers};
use crossterm::terminal;
use picolink::recorder::LineSink;
use picolink::{DeviceLink, FileRecorder, Settings, UploadRequest};

use crate::was_interrupted;

/// How long each consume-loop pass waits for a line.
const RECV_INTERVAL: Duration = Duration::from_millis(200);

/// Run the recorder until interrupted.
pub(crate) fn cmd_record(
    settings: Settings,
    log_dir: PathBuf,
    data_dir: Option<PathBuf>,
    data_prefix: &str,
    quiet: bool,
) -> Result<()> {
    let mut recorder = FileRecorder::new(&log_dir, settings.link.session_marker.clone());
    if let Some(data_dir) = data_dir {
        recorder = recorder.with_data_dir(data_dir, data_prefix);
    }

    let tty = io::stdout().is_terminal() && io::stdin().is_terminal();

    if !quiet {
        eprintln!(
            "{} Recording to {}",
            style("📼").cyan(),
            style(log_dir.display()).green()
        );
        if tty {
            eprintln!(
                "{}",
                style("Ctrl+C exits, Ctrl+U uploads firmware").dim()
            );
        }
    }

    let link = DeviceLink::spawn(settings).context("Failed to start the link worker")?;

    let _raw_guard = if tty {
        terminal::enable_raw_mode().context("Failed to enable raw terminal mode")?;
        Some(RawModeGuard)
    } else {
        None
    };

    let result = consume_loop(&link, &mut recorder, tty);

    link.stop();
    recorder.close();
    // A missed join deadline is fatal to the process, not something to
    // swallow: the worker owns a serial handle we cannot reclaim.
    link.join().context("Link worker failed to stop")?;

    drop(_raw_guard);
    if !quiet {
        eprintln!("{} Recording stopped", style("👋").cyan());
    }

    result
}

fn consume_loop(link: &DeviceLink, recorder: &mut FileRecorder, tty: bool) -> Result<()> {
    loop {
        if was_interrupted() {
            return Ok(());
        }

        if tty && handle_keys(link)? {
            return Ok(());
        }

        match link.recv_line_timeout(RECV_INTERVAL) {
            Ok(event) => {
                print_line(&event.text, tty);
                recorder
                    .write_line(&event.text)
                    .context("Failed to record line")?;
            },
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {},
            // Worker exited on its own; nothing more will arrive.
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
}

/// Drain pending key events. Returns true when the user asked to exit.
fn handle_keys(link: &DeviceLink) -> Result<bool> {
    while event::poll(Duration::ZERO)? {
        if let Event::Key(KeyEvent {
            code, modifiers, ..
        }) = event::read()?
        {
            match (code, modifiers) {
                (KeyCode::Char('c'), KeyModifiers::CONTROL) => return Ok(true),
                (KeyCode::Char('u'), KeyModifiers::CONTROL) => {
                    print_line("", true);
                    eprint!("{} Firmware upload requested\r\n", style("⚡").yellow());
                    if link.request_firmware_upload(UploadRequest::default()).is_err() {
                        eprint!(
                            "{} Link worker is gone; cannot upload\r\n",
                            style("⚠").yellow()
                        );
                    }
                },
                _ => {},
            }
        }
    }
    Ok(false)
}

/// Raw mode needs an explicit carriage return.
fn print_line(text: &str, raw: bool) {
    if raw {
        print!("{text}\r\n");
    } else {
        println!("{text}");
    }
    io::stdout().flush().ok();
}

/// RAII guard to restore terminal mode on drop.
struct RawModeGuard;

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}
