//! Post-connect session handshake.
//!
//! After a port opens, the device may still be booting or mid-session. The
//! host repeats a ready message until the device answers with a line
//! containing the session-start marker; only then does streaming begin.
//! There is no attempt cap by design — a hung peer means a low-duty-cycle
//! retry loop until the caller cancels or the optional
//! [`handshake_timeout`](crate::LinkConfig::handshake_timeout) elapses.

use std::io::{self, Read, Write};
use std::thread;
use std::time::Instant;

use log::{debug, trace};

use crate::config::LinkConfig;
use crate::framing::LineFramer;

/// How a handshake attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// The session-start marker was observed; streaming may begin.
    SessionStarted,
    /// The host cancelled, or the line consumer went away.
    Cancelled,
    /// The configured `handshake_timeout` elapsed without a marker.
    TimedOut,
}

/// Caller-side hooks the handshake loop talks to.
///
/// One object rather than separate closures so a worker can poll its
/// command channel from `cancelled` and push into its line channel from
/// `emit` without fighting over the same borrows.
pub trait HandshakeHost {
    /// Polled once per loop iteration; returning true aborts the handshake.
    fn cancelled(&mut self) -> bool;

    /// Receives the marker line and any complete lines framed behind it.
    /// Returning false means the consumer is gone and aborts the handshake.
    fn emit(&mut self, line: String) -> bool;
}

/// Plain closures work as a host: `(cancelled, emit)`.
impl<C, E> HandshakeHost for (C, E)
where
    C: FnMut() -> bool,
    E: FnMut(String) -> bool,
{
    fn cancelled(&mut self) -> bool {
        (self.0)()
    }

    fn emit(&mut self, line: String) -> bool {
        (self.1)(line)
    }
}

/// Drive the ready/marker exchange on an open connection.
///
/// Writes `<ready_message>\n`, waits the send interval, reads whatever is
/// available and scans the framed lines for the marker substring. The
/// cancellation poll runs once per iteration, so shutdown latency is
/// bounded by the send interval plus the serial read timeout.
///
/// I/O errors propagate to the caller, which treats them like any other
/// failed connection.
pub fn exchange<P, H>(
    port: &mut P,
    framer: &mut LineFramer,
    cfg: &LinkConfig,
    host: &mut H,
) -> io::Result<HandshakeOutcome>
where
    P: Read + Write + ?Sized,
    H: HandshakeHost + ?Sized,
{
    let ready_line = format!("{}\n", cfg.ready_message);
    let deadline = cfg.handshake_timeout.map(|t| Instant::now() + t);
    let mut chunk = vec![0u8; cfg.read_chunk_size];

    debug!(
        "Handshake: sending ready message until {:?} is seen",
        cfg.session_marker
    );

    loop {
        if host.cancelled() {
            return Ok(HandshakeOutcome::Cancelled);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            debug!("Handshake timed out");
            return Ok(HandshakeOutcome::TimedOut);
        }

        port.write_all(ready_line.as_bytes())?;
        port.flush()?;
        thread::sleep(cfg.handshake_send_interval);

        let n = match port.read(&mut chunk) {
            Ok(n) => n,
            Err(e) if is_read_timeout(&e) => 0,
            Err(e) => return Err(e),
        };
        if n == 0 {
            continue;
        }

        trace!("Handshake: read {n} bytes");
        let mut found = false;
        for line in framer.feed(&chunk[..n]) {
            if !found && line.contains(&cfg.session_marker) {
                debug!("Handshake: session marker received");
                found = true;
            }
            // Forward the marker line and everything framed behind it.
            if found && !host.emit(line) {
                return Ok(HandshakeOutcome::Cancelled);
            }
        }
        if found {
            return Ok(HandshakeOutcome::SessionStarted);
        }
    }
}

/// Bounded serial reads surface their deadline as an error; treat those as
/// an empty read rather than a link failure.
pub(crate) fn is_read_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Scripted bidirectional port: pops one read per call, records writes.
    struct ScriptedPort {
        reads: VecDeque<Vec<u8>>,
        written: Vec<u8>,
    }

    impl ScriptedPort {
        fn new(reads: &[&[u8]]) -> Self {
            Self {
                reads: reads.iter().map(|r| r.to_vec()).collect(),
                written: Vec::new(),
            }
        }
    }

    impl Read for ScriptedPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(data) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                },
                None => Err(io::Error::new(io::ErrorKind::TimedOut, "no data")),
            }
        }
    }

    impl Write for ScriptedPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn fast_config() -> LinkConfig {
        LinkConfig {
            handshake_send_interval: Duration::from_millis(1),
            ..LinkConfig::default()
        }
    }

    #[test]
    fn test_marker_substring_match_ends_handshake() {
        let mut port = ScriptedPort::new(&[b"noise::RPI-PICO-LOG::STARTtrailing\n"]);
        let mut framer = LineFramer::new();
        let mut emitted = Vec::new();

        let outcome = exchange(
            &mut port,
            &mut framer,
            &fast_config(),
            &mut (
                || false,
                |line| {
                    emitted.push(line);
                    true
                },
            ),
        )
        .unwrap();

        assert_eq!(outcome, HandshakeOutcome::SessionStarted);
        assert_eq!(emitted, vec!["noise::RPI-PICO-LOG::STARTtrailing"]);
    }

    #[test]
    fn test_ready_message_is_written_with_line_feed() {
        let mut port = ScriptedPort::new(&[b"::RPI-PICO-LOG::START\n"]);
        let mut framer = LineFramer::new();

        exchange(
            &mut port,
            &mut framer,
            &fast_config(),
            &mut (|| false, |_| true),
        )
        .unwrap();

        let written = String::from_utf8(port.written.clone()).unwrap();
        assert!(written.starts_with("::RPI-ZERO-LOG::READY\n"));
    }

    #[test]
    fn test_non_marker_lines_are_discarded() {
        let mut port =
            ScriptedPort::new(&[b"boot noise\n", b"more noise\n::RPI-PICO-LOG::START\n"]);
        let mut framer = LineFramer::new();
        let mut emitted = Vec::new();

        let outcome = exchange(
            &mut port,
            &mut framer,
            &fast_config(),
            &mut (
                || false,
                |line| {
                    emitted.push(line);
                    true
                },
            ),
        )
        .unwrap();

        assert_eq!(outcome, HandshakeOutcome::SessionStarted);
        assert_eq!(emitted, vec!["::RPI-PICO-LOG::START"]);
    }

    #[test]
    fn test_lines_behind_marker_in_same_chunk_are_forwarded() {
        let mut port = ScriptedPort::new(&[b"::RPI-PICO-LOG::START\nfirst data\n"]);
        let mut framer = LineFramer::new();
        let mut emitted = Vec::new();

        exchange(
            &mut port,
            &mut framer,
            &fast_config(),
            &mut (
                || false,
                |line| {
                    emitted.push(line);
                    true
                },
            ),
        )
        .unwrap();

        assert_eq!(emitted, vec!["::RPI-PICO-LOG::START", "first data"]);
    }

    #[test]
    fn test_cancellation_ends_handshake_without_marker() {
        let mut port = ScriptedPort::new(&[]);
        let mut framer = LineFramer::new();
        let mut polls = 0;

        let outcome = exchange(
            &mut port,
            &mut framer,
            &fast_config(),
            &mut (
                || {
                    polls += 1;
                    polls > 2
                },
                |_| true,
            ),
        )
        .unwrap();

        assert_eq!(outcome, HandshakeOutcome::Cancelled);
    }

    #[test]
    fn test_timeout_ends_handshake() {
        let mut port = ScriptedPort::new(&[]);
        let mut framer = LineFramer::new();
        let cfg = LinkConfig {
            handshake_send_interval: Duration::from_millis(1),
            handshake_timeout: Some(Duration::from_millis(10)),
            ..LinkConfig::default()
        };

        let outcome = exchange(&mut port, &mut framer, &cfg, &mut (|| false, |_| true)).unwrap();
        assert_eq!(outcome, HandshakeOutcome::TimedOut);
    }

    #[test]
    fn test_consumer_gone_cancels() {
        let mut port = ScriptedPort::new(&[b"::RPI-PICO-LOG::START\n"]);
        let mut framer = LineFramer::new();

        let outcome = exchange(&mut port, &mut framer, &fast_config(), &mut (|| false, |_| false))
            .unwrap();
        assert_eq!(outcome, HandshakeOutcome::Cancelled);
    }
}
