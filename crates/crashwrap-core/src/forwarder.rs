//! Stream forwarding between the payload and this process
//!
//! Two pumps run on their own threads:
//! - stdout: read from the child, write to the stdout sink, nothing else
//! - stderr: a reader thread feeds chunks over a channel to a detector
//!   thread, which passes ordinary output to the stderr sink and keeps the
//!   crash capture
//!
//! The detector thread waits with a timeout whenever the detector has a
//! timer armed, so a pending partial match gets `patience` to complete and
//! a capture can be closed early by a quiet period.
//!
//! Each pump keeps draining its source after a sink write fails so the
//! child never blocks on a full pipe.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::detector::{Detector, Phase};

/// Read buffer size for both pumps
const CHUNK_SIZE: usize = 8192;

/// Writer shared between the caller and a pump thread
pub type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Which child stream a pump is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// Destination for forwarded bytes
#[derive(Clone, Default)]
pub enum Sink {
    /// This process's stdout
    Stdout,
    /// This process's stderr
    #[default]
    Stderr,
    /// A caller-provided writer
    Writer(SharedWriter),
}

impl Sink {
    /// Wrap a writer as a sink
    pub fn writer<W: Write + Send + 'static>(writer: W) -> Self {
        Sink::Writer(Arc::new(Mutex::new(Box::new(writer))))
    }

    /// Write a whole chunk and flush it
    ///
    /// Flushing per chunk keeps partial lines moving; `io::stdout()` would
    /// otherwise hold them until the next newline.
    pub fn write_chunk(&self, bytes: &[u8]) -> io::Result<()> {
        match self {
            Sink::Stdout => {
                let mut out = io::stdout().lock();
                out.write_all(bytes)?;
                out.flush()
            }
            Sink::Stderr => {
                let mut err = io::stderr().lock();
                err.write_all(bytes)?;
                err.flush()
            }
            Sink::Writer(writer) => {
                let mut writer = writer.lock();
                writer.write_all(bytes)?;
                writer.flush()
            }
        }
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sink::Stdout => write!(f, "Sink::Stdout"),
            Sink::Stderr => write!(f, "Sink::Stderr"),
            Sink::Writer(_) => write!(f, "Sink::Writer(..)"),
        }
    }
}

/// Timers for the stderr detector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectorTiming {
    /// How long a partial signature match may wait for its next byte
    /// (None = until the stream closes)
    pub patience: Option<Duration>,
    /// How long a capture may go without new bytes before it is final
    /// (None = until the stream closes)
    pub quiet_period: Option<Duration>,
}

/// How a pump ended
#[derive(Debug, Default)]
pub struct PumpReport {
    /// Bytes read from the child
    pub bytes_read: u64,
    /// Bytes written to the sink
    pub bytes_forwarded: u64,
    /// First read or write failure
    pub error: Option<io::Error>,
}

impl PumpReport {
    fn record_error(&mut self, stream: StreamKind, error: io::Error) {
        log::warn!("crashwrap: {} pump error: {}", stream, error);
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Forward `out` to the sink unless an earlier write already failed
    fn forward(&mut self, stream: StreamKind, sink: &Sink, out: &mut Vec<u8>) {
        if out.is_empty() {
            return;
        }
        if self.error.is_none() {
            match sink.write_chunk(out) {
                Ok(()) => self.bytes_forwarded += out.len() as u64,
                Err(e) => self.record_error(stream, e),
            }
        }
        out.clear();
    }
}

/// How the stderr pump ended
#[derive(Debug, Default)]
pub struct DetectionReport {
    pub pump: PumpReport,
    /// Confirmed capture, if a signature matched
    pub capture: Option<Vec<u8>>,
    /// The signature that started the capture
    pub signature: Option<Vec<u8>>,
}

/// Copy `source` to `sink` until end of file
pub fn pump_plain<R: Read>(mut source: R, stream: StreamKind, sink: &Sink) -> PumpReport {
    let mut report = PumpReport::default();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                report.record_error(stream, e);
                break;
            }
        };
        report.bytes_read += n as u64;
        let mut out = buf[..n].to_vec();
        report.forward(stream, sink, &mut out);
    }

    log::debug!(
        "crashwrap: {} pump done, {} bytes read",
        stream,
        report.bytes_read
    );
    report
}

/// Read `source` into a channel until end of file or error
fn read_chunks<R: Read>(mut source: R, tx: Sender<io::Result<Vec<u8>>>) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Ok(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = tx.send(Err(e));
                break;
            }
        }
    }
}

/// Run the detector over chunks from `rx` until the channel closes
fn detect_chunks(
    rx: Receiver<io::Result<Vec<u8>>>,
    sink: &Sink,
    mut detector: Detector,
    timing: DetectorTiming,
) -> DetectionReport {
    let stream = StreamKind::Stderr;
    let mut report = PumpReport::default();
    let mut out = Vec::with_capacity(CHUNK_SIZE);

    loop {
        let timer = match detector.phase() {
            Phase::PartialMatch => timing.patience,
            Phase::Capturing => timing.quiet_period,
            Phase::Scanning | Phase::Confirmed => None,
        };

        let next = match timer {
            Some(limit) => match rx.recv_timeout(limit) {
                Ok(next) => Some(next),
                Err(RecvTimeoutError::Timeout) => {
                    let phase = detector.phase();
                    detector.expire(&mut out);
                    log::debug!(
                        "crashwrap: stderr quiet for {:?} in {:?}, now {:?}",
                        limit,
                        phase,
                        detector.phase()
                    );
                    report.forward(stream, sink, &mut out);
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => None,
            },
            None => rx.recv().ok(),
        };

        match next {
            Some(Ok(chunk)) => {
                report.bytes_read += chunk.len() as u64;
                let before = detector.phase();
                detector.feed(&chunk, &mut out);
                if before != Phase::Capturing && detector.phase() == Phase::Capturing {
                    log::debug!("crashwrap: crash signature matched on stderr");
                }
            }
            Some(Err(e)) => {
                report.record_error(stream, e);
                break;
            }
            None => break,
        }
        report.forward(stream, sink, &mut out);
    }

    let signature = detector.matched_signature().map(|s| s.to_vec());
    let capture = detector.finish(&mut out);
    report.forward(stream, sink, &mut out);

    log::debug!(
        "crashwrap: stderr pump done, {} bytes read, capture: {:?} bytes",
        report.bytes_read,
        capture.as_ref().map(|c| c.len())
    );

    DetectionReport {
        pump: report,
        capture,
        signature,
    }
}

/// Copy `source` to `sink` through `detector` until end of file
pub fn pump_detecting<R: Read + Send + 'static>(
    source: R,
    sink: &Sink,
    detector: Detector,
    timing: DetectorTiming,
) -> io::Result<DetectionReport> {
    let (tx, rx) = mpsc::channel();
    let reader = thread::Builder::new()
        .name("crashwrap-stderr-reader".into())
        .spawn(move || read_chunks(source, tx))?;

    let mut report = detect_chunks(rx, sink, detector, timing);

    // The channel is closed, so the reader has already returned
    if reader.join().is_err() {
        report
            .pump
            .record_error(StreamKind::Stderr, thread_panicked("stderr reader"));
    }
    Ok(report)
}

/// Running pair of stream pumps
pub struct Forwarder {
    stdout: JoinHandle<PumpReport>,
    stderr: JoinHandle<io::Result<DetectionReport>>,
}

impl Forwarder {
    /// Start pumping `stdout` and `stderr` on their own threads
    pub fn start<O, E>(
        stdout: O,
        stderr: E,
        stdout_sink: Sink,
        stderr_sink: Sink,
        detector: Detector,
        timing: DetectorTiming,
    ) -> io::Result<Self>
    where
        O: Read + Send + 'static,
        E: Read + Send + 'static,
    {
        let stdout = thread::Builder::new()
            .name("crashwrap-stdout".into())
            .spawn(move || pump_plain(stdout, StreamKind::Stdout, &stdout_sink))?;

        let stderr = thread::Builder::new()
            .name("crashwrap-stderr".into())
            .spawn(move || pump_detecting(stderr, &stderr_sink, detector, timing))?;

        Ok(Self { stdout, stderr })
    }

    /// Wait for both streams to reach end of file
    pub fn join(self) -> (PumpReport, DetectionReport) {
        let stdout = self.stdout.join().unwrap_or_else(|_| PumpReport {
            error: Some(thread_panicked("stdout pump")),
            ..Default::default()
        });

        let stderr = match self.stderr.join() {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => DetectionReport {
                pump: PumpReport {
                    error: Some(e),
                    ..Default::default()
                },
                ..Default::default()
            },
            Err(_) => DetectionReport {
                pump: PumpReport {
                    error: Some(thread_panicked("stderr pump")),
                    ..Default::default()
                },
                ..Default::default()
            },
        };

        (stdout, stderr)
    }
}

fn thread_panicked(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("{} panicked", what))
}
