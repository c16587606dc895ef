//! Session-rolling line recorder.
//!
//! Lines land under `<base>/<DD-MM-YYYY>/session-NNN.log`. A line carrying
//! the session marker starts a new session file; a date change starts a
//! new day folder and re-derives the numbering from whatever files already
//! exist there, so restarts never overwrite earlier sessions. Lines
//! starting with the data prefix are additionally tee'd into a parallel
//! `data-NNN.log` hierarchy when a data directory is configured.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use log::{info, warn};

/// Day-folder name format.
const DATE_FORMAT: &str = "%d-%m-%Y";

/// Consumer of decoded lines.
///
/// Implementations must not block the link indefinitely — the worker's
/// line channel is bounded, and a stalled sink eventually stalls the
/// serial read loop.
pub trait LineSink {
    /// Record one decoded line (terminator already stripped).
    fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Flush and release resources; called once on shutdown.
    fn close(&mut self);
}

/// Writes lines to per-session log files organized by date.
pub struct FileRecorder {
    base_dir: PathBuf,
    data_dir: Option<PathBuf>,
    session_marker: String,
    data_prefix: String,
    cur_date: String,
    session_index: u32,
    cur_file: Option<File>,
    cur_data_file: Option<File>,
}

impl FileRecorder {
    /// Create a recorder writing under `base_dir`. Session numbering is
    /// derived lazily from the files already present for today.
    pub fn new(base_dir: impl Into<PathBuf>, session_marker: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            data_dir: None,
            session_marker: session_marker.into(),
            data_prefix: "D".to_string(),
            cur_date: Local::now().format(DATE_FORMAT).to_string(),
            session_index: 0, // 0 = not yet derived
            cur_file: None,
            cur_data_file: None,
        }
    }

    /// Also tee lines starting with `prefix` into `data_dir`.
    #[must_use]
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        self.data_dir = Some(data_dir.into());
        self.data_prefix = prefix.into();
        self
    }

    fn folder(&self, data: bool) -> io::Result<PathBuf> {
        let base = if data {
            self.data_dir.as_ref().unwrap_or(&self.base_dir)
        } else {
            &self.base_dir
        };
        let dir = base.join(&self.cur_date);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Highest existing session number in today's log and data folders,
    /// plus one. Both folders are checked so the hierarchies stay in step.
    fn next_session_index(&self) -> io::Result<u32> {
        let mut highest = 0;

        let mut scan = |dir: &Path, prefix: &str| {
            let Ok(entries) = fs::read_dir(dir) else {
                return;
            };
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if let Some(number) = parse_session_number(&name, prefix) {
                    highest = highest.max(number);
                }
            }
        };

        scan(&self.folder(false)?, "session-");
        if self.data_dir.is_some() {
            scan(&self.folder(true)?, "data-");
        }

        Ok(highest + 1)
    }

    fn ensure_index(&mut self) -> io::Result<()> {
        if self.session_index == 0 {
            self.session_index = self.next_session_index()?;
        }
        Ok(())
    }

    /// Close current files and open the next session files.
    fn roll_session(&mut self) -> io::Result<()> {
        self.cur_file = Some(append_file(
            &self.folder(false)?.join(format!("session-{:03}.log", self.session_index)),
        )?);

        if self.data_dir.is_some() {
            self.cur_data_file = Some(append_file(
                &self.folder(true)?.join(format!("data-{:03}.log", self.session_index)),
            )?);
        }

        Ok(())
    }

    /// A new day gets a new folder and restarts the numbering scan there.
    fn maybe_roll_date(&mut self) -> io::Result<()> {
        let today = Local::now().format(DATE_FORMAT).to_string();
        if today != self.cur_date {
            self.cur_file = None;
            self.cur_data_file = None;
            self.cur_date = today;
            self.session_index = self.next_session_index()?;
            self.roll_session()?;
        }
        Ok(())
    }
}

impl LineSink for FileRecorder {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.maybe_roll_date()?;
        self.ensure_index()?;

        if !self.session_marker.is_empty() && line.contains(&self.session_marker) {
            if self.cur_file.is_some() {
                self.session_index += 1;
                info!(
                    "Session marker detected, rolling to session-{:03}.log",
                    self.session_index
                );
            } else {
                info!(
                    "First session marker detected, creating session-{:03}.log",
                    self.session_index
                );
            }
            self.roll_session()?;
            return Ok(());
        }

        if self.cur_file.is_none() {
            self.roll_session()?;
        }
        if let Some(file) = self.cur_file.as_mut() {
            writeln!(file, "{line}")?;
            file.flush()?;
        }

        if self.data_dir.is_some() && line.starts_with(&self.data_prefix) {
            if let Some(file) = self.cur_data_file.as_mut() {
                writeln!(file, "{line}")?;
                file.flush()?;
            }
        }

        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut file) = self.cur_file.take() {
            if let Err(e) = file.flush() {
                warn!("Flush on close failed: {e}");
            }
        }
        if let Some(mut file) = self.cur_data_file.take() {
            if let Err(e) = file.flush() {
                warn!("Flush on close failed: {e}");
            }
        }
    }
}

fn append_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Extract `NNN` from `<prefix>NNN.log`.
fn parse_session_number(file_name: &str, prefix: &str) -> Option<u32> {
    file_name
        .strip_prefix(prefix)?
        .strip_suffix(".log")?
        .parse()
        .ok()
}
