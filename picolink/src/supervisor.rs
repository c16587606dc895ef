//! Connection lifecycle supervision.
//!
//! One dedicated worker thread per device link owns the serial handle, the
//! line framer, and the connection state — nothing else touches them. The
//! outside world talks to the worker over a typed command channel
//! (`Stop`, `RequestUpload`) and reads decoded lines from a bounded
//! channel; there is no shared mutable state beyond the two channels.

use std::io::Read;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::config::{Platform, Settings};
use crate::error::{Error, Result};
use crate::framing::LineFramer;
use crate::handshake::{self, HandshakeHost, HandshakeOutcome};
use crate::port;
use crate::upload::FirmwareUpdater;

/// How long the worker sleeps between stop-flag polls while waiting.
const POLL_SLICE: Duration = Duration::from_millis(10);

/// Lifecycle states of one device link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection; resolving a port or waiting out a backoff delay.
    Disconnected,
    /// A port was found and is being opened.
    Connecting,
    /// Connected; repeating the ready message until the marker arrives.
    Handshaking,
    /// Decoded lines are flowing to the consumer.
    Streaming,
    /// An upload request was observed; about to leave streaming.
    UploadRequested,
    /// The firmware update engine owns the device.
    Flashing,
    /// Terminal: the stop signal was honored.
    Stopped,
}

/// A firmware upload request.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    /// Platform hint for drive discovery; `Auto` keeps the configured one.
    pub platform: Platform,
    /// Override for the configured image directory.
    pub image_dir: Option<PathBuf>,
}

/// One decoded line from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineEvent {
    /// The decoded text, line terminator stripped.
    pub text: String,
    /// Connection epoch the line arrived in. Ordering is only meaningful
    /// within one epoch; a reconnect starts a new one.
    pub epoch: u64,
}

/// Typed requests consumed by the worker's poll loop.
enum Command {
    Stop,
    RequestUpload(UploadRequest),
}

/// Handle to a running device link.
///
/// Dropping the handle without calling [`stop`](Self::stop) also shuts the
/// worker down: the command channel disconnects and the worker treats that
/// as a stop signal.
pub struct DeviceLink {
    commands: Sender<Command>,
    lines: Receiver<LineEvent>,
    worker: Option<JoinHandle<()>>,
    join_timeout: Duration,
    image_dir: PathBuf,
}

impl DeviceLink {
    /// Spawn the background worker for `settings`.
    pub fn spawn(settings: Settings) -> Result<Self> {
        let (commands, command_rx) = mpsc::channel();
        let (line_tx, lines) = mpsc::sync_channel(settings.link.line_queue_capacity);
        let join_timeout = settings.link.join_timeout;
        let image_dir = settings.upload.image_dir.clone();

        let worker = thread::Builder::new()
            .name("picolink-worker".to_string())
            .spawn(move || Worker::new(settings, command_rx, line_tx).run())
            .map_err(Error::Io)?;

        Ok(Self {
            commands,
            lines,
            worker: Some(worker),
            join_timeout,
            image_dir,
        })
    }

    /// Wait up to `timeout` for the next decoded line.
    pub fn recv_line_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<LineEvent, RecvTimeoutError> {
        self.lines.recv_timeout(timeout)
    }

    /// Take a line if one is ready.
    #[must_use]
    pub fn try_recv_line(&self) -> Option<LineEvent> {
        self.lines.try_recv().ok()
    }

    /// Ask the worker to flash new firmware at the next opportunity.
    ///
    /// Establishes the image directory if absent. The effect is
    /// asynchronous: the worker picks the request up from its streaming
    /// loop. A request while an upload is already pending or in flight is
    /// a no-op (logged by the worker).
    pub fn request_firmware_upload(&self, request: UploadRequest) -> Result<()> {
        let dir = request.image_dir.clone().unwrap_or_else(|| self.image_dir.clone());
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("Could not create image directory {}: {e}", dir.display());
        }
        self.commands
            .send(Command::RequestUpload(request))
            .map_err(|_| Error::WorkerGone)
    }

    /// Signal the worker to stop. Idempotent.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    /// Whether the worker thread has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait for the worker to exit, bounded by the configured join timeout.
    ///
    /// A missed deadline returns [`Error::JoinTimeout`] — the host process
    /// must treat that as fatal rather than ignore it.
    pub fn join(mut self) -> Result<()> {
        let Some(handle) = self.worker.take() else {
            return Ok(());
        };

        let deadline = Instant::now() + self.join_timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                return Err(Error::JoinTimeout(self.join_timeout));
            }
            thread::sleep(POLL_SLICE);
        }
        handle.join().map_err(|_| Error::WorkerGone)
    }
}

/// Worker-side command state. The pending slot holds at most one upload
/// request; further requests while it is occupied (or while flashing) are
/// rejected as documented.
struct Control {
    commands: Receiver<Command>,
    stop: bool,
    consumer_gone: bool,
    pending_upload: Option<UploadRequest>,
    flashing: bool,
}

impl Control {
    fn new(commands: Receiver<Command>) -> Self {
        Self {
            commands,
            stop: false,
            consumer_gone: false,
            pending_upload: None,
            flashing: false,
        }
    }

    /// Drain queued commands; returns true once stop was requested.
    fn poll(&mut self) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(Command::Stop) => self.stop = true,
                Ok(Command::RequestUpload(request)) => {
                    if self.flashing || self.pending_upload.is_some() {
                        warn!("Firmware upload already in progress; request ignored");
                    } else {
                        info!("Firmware upload requested");
                        self.pending_upload = Some(request);
                    }
                },
                Err(TryRecvError::Empty) => break,
                // Handle dropped without an explicit stop.
                Err(TryRecvError::Disconnected) => {
                    self.stop = true;
                    break;
                },
            }
        }
        self.stop
    }

    fn done(&self) -> bool {
        self.stop || self.consumer_gone
    }
}

/// Push one line into the bounded channel.
///
/// Backpressure policy: bounded blocking with a periodic stop poll. On a
/// full channel the worker retries every [`POLL_SLICE`], draining commands
/// in between, so a slow consumer delays lines but never delays shutdown
/// or upload requests. Lines are not dropped.
fn send_line(lines: &SyncSender<LineEvent>, control: &mut Control, event: LineEvent) -> bool {
    let mut event = event;
    loop {
        if control.done() {
            return false;
        }
        match lines.try_send(event) {
            Ok(()) => return true,
            Err(TrySendError::Full(back)) => {
                event = back;
                control.poll();
                thread::sleep(POLL_SLICE);
            },
            Err(TrySendError::Disconnected(_)) => {
                control.consumer_gone = true;
                return false;
            },
        }
    }
}

/// Bridges the handshake loop to the worker's channels.
struct HandshakeIo<'a> {
    control: &'a mut Control,
    lines: &'a SyncSender<LineEvent>,
    epoch: u64,
}

impl HandshakeHost for HandshakeIo<'_> {
    fn cancelled(&mut self) -> bool {
        self.control.poll();
        self.control.done()
    }

    fn emit(&mut self, line: String) -> bool {
        send_line(
            self.lines,
            self.control,
            LineEvent {
                text: line,
                epoch: self.epoch,
            },
        )
    }
}

/// Why the streaming loop ended.
enum StreamExit {
    Halted,
    ReadError,
    UploadRequested(UploadRequest),
}

struct Worker {
    settings: Settings,
    control: Control,
    lines: SyncSender<LineEvent>,
    state: ConnectionState,
    backoff: BackoffPolicy,
    epoch: u64,
}

impl Worker {
    fn new(settings: Settings, commands: Receiver<Command>, lines: SyncSender<LineEvent>) -> Self {
        let backoff = BackoffPolicy::new(settings.link.initial_backoff, settings.link.max_backoff);
        Self {
            settings,
            control: Control::new(commands),
            lines,
            state: ConnectionState::Disconnected,
            backoff,
            epoch: 0,
        }
    }

    fn run(mut self) {
        info!("Link worker started");
        while !self.control.done() {
            self.cycle();
        }
        self.set_state(ConnectionState::Stopped);
        info!("Link worker stopped");
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            info!("Link state: {:?} -> {next:?}", self.state);
            self.state = next;
        }
    }

    /// One pass of the lifecycle: resolve, connect, handshake, stream, and
    /// either flash or back off.
    fn cycle(&mut self) {
        if self.control.poll() {
            return;
        }
        self.set_state(ConnectionState::Disconnected);

        let Some(descriptor) = port::resolve(&self.settings.query) else {
            self.wait(self.settings.link.reconnect_retry_interval);
            return;
        };

        self.set_state(ConnectionState::Connecting);
        let mut conn = match serialport::new(&descriptor.name, self.settings.link.baud)
            .timeout(self.settings.link.serial_timeout)
            .open()
        {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Open failed for {}: {e}", descriptor.name);
                self.set_state(ConnectionState::Disconnected);
                self.apply_backoff();
                return;
            },
        };
        info!("Connected: {}", descriptor.name);

        // Fresh framer per epoch: partial trailing data from a previous
        // connection never leaks into this one.
        let mut framer = LineFramer::new();
        self.epoch += 1;

        self.set_state(ConnectionState::Handshaking);
        let mut io = HandshakeIo {
            control: &mut self.control,
            lines: &self.lines,
            epoch: self.epoch,
        };
        let handshake_result =
            handshake::exchange(conn.as_mut(), &mut framer, &self.settings.link, &mut io);

        match handshake_result {
            Ok(HandshakeOutcome::SessionStarted) => {},
            Ok(HandshakeOutcome::Cancelled) => {
                self.set_state(ConnectionState::Disconnected);
                return;
            },
            Ok(HandshakeOutcome::TimedOut) => {
                info!("Handshake timed out; reconnecting");
                drop(conn);
                self.set_state(ConnectionState::Disconnected);
                return;
            },
            Err(e) => {
                warn!("Handshake I/O error: {e}");
                drop(conn);
                self.set_state(ConnectionState::Disconnected);
                self.apply_backoff();
                return;
            },
        }

        self.set_state(ConnectionState::Streaming);
        // Reset exactly on entry into streaming: one good connection
        // restores the fast retry.
        self.backoff.reset();

        match self.stream(&mut conn, &mut framer) {
            StreamExit::Halted => {
                self.set_state(ConnectionState::Disconnected);
            },
            StreamExit::ReadError => {
                drop(conn);
                info!("Disconnected, retrying...");
                self.set_state(ConnectionState::Disconnected);
                self.apply_backoff();
            },
            StreamExit::UploadRequested(request) => {
                self.set_state(ConnectionState::UploadRequested);
                self.flash(conn, &descriptor.name, request);
                // No backoff: the device reboots into new firmware and is
                // expected to reappear; go straight back to resolution.
                self.set_state(ConnectionState::Disconnected);
            },
        }
    }

    /// Read chunks, frame lines, hand them to the consumer. Commands are
    /// polled every iteration; the bounded read timeout keeps each
    /// iteration short.
    fn stream(
        &mut self,
        conn: &mut Box<dyn serialport::SerialPort>,
        framer: &mut LineFramer,
    ) -> StreamExit {
        let mut chunk = vec![0u8; self.settings.link.read_chunk_size];

        loop {
            if self.control.poll() || self.control.consumer_gone {
                return StreamExit::Halted;
            }
            if let Some(request) = self.control.pending_upload.take() {
                return StreamExit::UploadRequested(request);
            }

            let n = match conn.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if handshake::is_read_timeout(&e) => continue,
                Err(e) => {
                    warn!("Read error: {e}");
                    return StreamExit::ReadError;
                },
            };
            if n == 0 {
                continue;
            }

            for text in framer.feed(&chunk[..n]) {
                let event = LineEvent {
                    text,
                    epoch: self.epoch,
                };
                if !send_line(&self.lines, &mut self.control, event) {
                    return StreamExit::Halted;
                }
            }
        }
    }

    /// Run the firmware update engine with the request's overrides. The
    /// in-flight flag is cleared unconditionally afterwards so the
    /// reconnect cycle resumes whatever the outcome.
    fn flash(&mut self, conn: Box<dyn serialport::SerialPort>, bound_port: &str, request: UploadRequest) {
        self.set_state(ConnectionState::Flashing);
        self.control.flashing = true;

        let mut settings = self.settings.clone();
        if request.platform != Platform::Auto {
            settings.query.platform = request.platform;
        }
        if let Some(dir) = request.image_dir {
            settings.upload.image_dir = dir;
        }

        let control = &mut self.control;
        let outcome = FirmwareUpdater::new(&settings).perform_upload(
            Some(conn),
            Some(bound_port),
            &mut || control.poll(),
            &mut |_| {},
        );

        if outcome.is_success() {
            info!("Firmware upload {outcome}");
        } else {
            warn!("Firmware upload failed: {outcome}");
        }

        self.control.flashing = false;
    }

    fn apply_backoff(&mut self) {
        let delay = self.backoff.next_delay();
        debug!("Reconnecting in {delay:?}");
        self.wait(delay);
    }

    /// Sleep in slices, draining commands so stop stays responsive.
    fn wait(&mut self, total: Duration) {
        let deadline = Instant::now() + total;
        loop {
            if self.control.poll() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep(POLL_SLICE.min(deadline - now));
        }
    }
}
