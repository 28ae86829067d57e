//! The wrap orchestrator
//!
//! `wrap` is called once near the start of `main`. Without a relaunch
//! token in the environment the process becomes the supervisor: it
//! re-executes itself with a token, forwards the child's output, waits for
//! it, and hands any crash capture to the handler. With a token it is the
//! payload and `wrap` returns at once so the real program can run.

use std::borrow::Cow;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};

use crate::config::WrapConfig;
use crate::error::WrapError;
use crate::forwarder::{Forwarder, StreamKind};
#[cfg(unix)]
use crate::signals::SignalForwarder;
use crate::token::{self, RelaunchToken, TOKEN_ENV_KEY};

/// Which side of the relaunch this process is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Supervisor,
    Payload,
}

/// Result of a successful `wrap` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapOutcome {
    /// The payload ran to completion under this process
    Supervisor {
        /// Child exit code, or `128 + signal` if it was killed by a signal
        exit_status: i32,
        /// Whether the handler was invoked
        captured: bool,
    },
    /// This process is the payload; run the real program
    Payload,
}

impl WrapOutcome {
    pub fn role(&self) -> Role {
        match self {
            WrapOutcome::Supervisor { .. } => Role::Supervisor,
            WrapOutcome::Payload => Role::Payload,
        }
    }

    /// True when the caller should exit instead of running its logic
    pub fn is_done(&self) -> bool {
        self.role() == Role::Supervisor
    }

    pub fn exit_status(&self) -> Option<i32> {
        match self {
            WrapOutcome::Supervisor { exit_status, .. } => Some(*exit_status),
            WrapOutcome::Payload => None,
        }
    }

    pub fn captured(&self) -> bool {
        matches!(self, WrapOutcome::Supervisor { captured: true, .. })
    }
}

/// Crash output captured from the payload's stderr
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    bytes: Vec<u8>,
    signature: Vec<u8>,
    exit_status: i32,
}

impl Capture {
    /// Captured bytes, with invalid UTF-8 replaced
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The signature that started the capture
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Exit status of the payload that produced the capture
    pub fn exit_status(&self) -> i32 {
        self.exit_status
    }
}

/// Map a child's exit status to a single code
///
/// Normal exit gives the exit code. On Unix a signal death gives
/// `128 + signal`, like a shell. Anything else gives -1.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    -1
}

/// Run as supervisor or payload depending on the relaunch token
///
/// As supervisor on Unix, the configured forwarded signals are relayed to
/// the payload and the ignored ones (SIGINT by default) are dropped until
/// the payload exits. After that both sets take their default action again.
pub fn wrap(config: &WrapConfig) -> Result<WrapOutcome, WrapError> {
    config.validate()?;

    if let Some(token) = token::current() {
        config.mark_payload();
        log::debug!(
            "crashwrap: running as payload (supervisor PID {:?}, call {:?})",
            token.supervisor_pid(),
            token.call()
        );
        return Ok(WrapOutcome::Payload);
    }

    supervise(config)
}

/// `wrap` with the default configuration around `handler`
pub fn basic_wrap<F>(handler: F) -> Result<WrapOutcome, WrapError>
where
    F: Fn(&Capture) + Send + Sync + 'static,
{
    wrap(&WrapConfig::new(handler))
}

/// Program and arguments for the payload
fn resolve_command(config: &WrapConfig) -> Result<(PathBuf, Vec<OsString>), WrapError> {
    if let Some(command) = config.command_override() {
        return Ok((command.program.clone(), command.args.clone()));
    }

    let program = std::env::current_exe().map_err(WrapError::Executable)?;
    Ok((program, std::env::args_os().skip(1).collect()))
}

/// Kill and reap a child we cannot monitor
fn abandon(mut child: Child, stream: StreamKind, source: io::Error) -> WrapError {
    let _ = child.kill();
    match child.wait() {
        Ok(status) => WrapError::Stream {
            stream,
            exit_status: exit_code(status),
            captured: false,
            source,
        },
        Err(e) => WrapError::Wait(e),
    }
}

fn supervise(config: &WrapConfig) -> Result<WrapOutcome, WrapError> {
    let (program, args) = resolve_command(config)?;
    let token = RelaunchToken::mint();

    let mut child = Command::new(&program)
        .args(&args)
        .env(TOKEN_ENV_KEY, token.encode())
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| WrapError::Spawn {
            program: program.clone(),
            source,
        })?;

    let pid = child.id();
    log::debug!(
        "crashwrap: spawned payload PID {} from {} (token {})",
        pid,
        program.display(),
        token.encode()
    );

    let (child_stdout, child_stderr) = match (child.stdout.take(), child.stderr.take()) {
        (Some(stdout), Some(stderr)) => (stdout, stderr),
        _ => {
            let missing = io::Error::new(io::ErrorKind::BrokenPipe, "child pipes not captured");
            return Err(abandon(child, StreamKind::Stderr, missing));
        }
    };

    #[cfg(unix)]
    let signals = match SignalForwarder::start(
        pid,
        config.forwarded_signals(),
        config.ignored_signals(),
    ) {
        Ok(signals) => signals,
        Err(e) => {
            log::warn!("crashwrap: signal handling disabled: {}", e);
            None
        }
    };

    let forwarder = match Forwarder::start(
        child_stdout,
        child_stderr,
        config.stdout_sink().clone(),
        config.stderr_sink().clone(),
        config.detector(),
        config.timing(),
    ) {
        Ok(forwarder) => forwarder,
        Err(e) => return Err(abandon(child, StreamKind::Stderr, e)),
    };

    // Join point 1: both streams drained
    let (stdout_report, stderr_report) = forwarder.join();

    // Join point 2: child exited
    let status = child.wait();

    #[cfg(unix)]
    drop(signals);

    let exit_status = exit_code(status.map_err(WrapError::Wait)?);
    log::debug!(
        "crashwrap: payload PID {} exited with {} ({} stdout / {} stderr bytes)",
        pid,
        exit_status,
        stdout_report.bytes_read,
        stderr_report.pump.bytes_read
    );

    let mut stream_error = stdout_report
        .error
        .map(|e| (StreamKind::Stdout, e))
        .or_else(|| stderr_report.pump.error.map(|e| (StreamKind::Stderr, e)));

    let captured = match stderr_report.capture {
        Some(bytes) => {
            log::info!(
                "crashwrap: captured {} bytes of crash output from PID {}",
                bytes.len(),
                pid
            );

            if !config.is_hiding_capture() {
                if let Err(e) = config.stderr_sink().write_chunk(&bytes) {
                    log::warn!("crashwrap: failed to forward capture: {}", e);
                    stream_error.get_or_insert((StreamKind::Stderr, e));
                }
            }

            let capture = Capture {
                bytes,
                signature: stderr_report.signature.unwrap_or_default(),
                exit_status,
            };
            if let Some(handler) = config.handler_fn() {
                handler(&capture);
            }
            true
        }
        None => false,
    };

    match stream_error {
        Some((stream, source)) => Err(WrapError::Stream {
            stream,
            exit_status,
            captured,
            source,
        }),
        None => Ok(WrapOutcome::Supervisor {
            exit_status,
            captured,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_wrap_requires_handler() {
        let config = WrapConfig::default();
        let err = wrap(&config).unwrap_err();
        assert!(matches!(err, WrapError::Config(_)));
        assert!(!crate::status::wrapped(Some(&config)));
    }

    #[test]
    fn test_outcome_accessors() {
        let supervisor = WrapOutcome::Supervisor {
            exit_status: 2,
            captured: true,
        };
        assert_eq!(supervisor.role(), Role::Supervisor);
        assert!(supervisor.is_done());
        assert_eq!(supervisor.exit_status(), Some(2));
        assert!(supervisor.captured());

        let payload = WrapOutcome::Payload;
        assert_eq!(payload.role(), Role::Payload);
        assert!(!payload.is_done());
        assert_eq!(payload.exit_status(), None);
        assert!(!payload.captured());
    }

    #[test]
    fn test_capture_text_is_lossy() {
        let capture = Capture {
            bytes: b"panic: \xffbad".to_vec(),
            signature: b"panic:".to_vec(),
            exit_status: 2,
        };
        assert_eq!(capture.len(), 11);
        assert!(!capture.is_empty());
        assert_eq!(capture.text(), "panic: \u{fffd}bad");
        assert_eq!(capture.signature(), b"panic:");
        assert_eq!(capture.exit_status(), 2);
    }

    /// Writer that collects everything into a shared buffer
    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<u8>>>);

    impl Collect {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    impl io::Write for Collect {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Writer that always fails
    struct Broken;

    impl io::Write for Broken {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    const CRASHING: &str = "echo before >&2; echo 'panic: boom' >&2; echo 'goroutine 1' >&2; exit 2";

    /// Supervise `sh -c script`, recording every capture handed to the handler
    fn sh(script: &str, captures: &Arc<Mutex<Vec<String>>>) -> WrapConfig {
        let captures = Arc::clone(captures);
        WrapConfig::new(move |capture: &Capture| captures.lock().push(capture.text().into_owned()))
            .command("/bin/sh", ["-c", script])
            .forward_signals(Vec::new())
            .ignore_signals(Vec::new())
    }

    #[test]
    fn test_spawn_failure() {
        let config = WrapConfig::new(|_| {})
            .command("/no/such/prog", Vec::<&str>::new())
            .forward_signals(Vec::new())
            .ignore_signals(Vec::new());
        let err = wrap(&config).unwrap_err();
        assert!(matches!(err, WrapError::Spawn { .. }), "got {:?}", err);
        assert!(!crate::status::wrapped(Some(&config)));
    }

    #[test]
    #[cfg(unix)]
    fn test_sink_failure_still_reaps_child() {
        let captures = Arc::new(Mutex::new(Vec::new()));
        let stderr = Collect::default();
        let config = sh("echo hi; echo 'plain' >&2; exit 5", &captures)
            .stdout_writer(Broken)
            .stderr_writer(stderr.clone());

        let err = wrap(&config).unwrap_err();
        assert!(
            matches!(
                err,
                WrapError::Stream {
                    stream: StreamKind::Stdout,
                    exit_status: 5,
                    captured: false,
                    ..
                }
            ),
            "got {:?}",
            err
        );
        assert_eq!(stderr.text(), "plain\n");
        assert!(captures.lock().is_empty());
    }

    #[test]
    #[cfg(unix)]
    fn test_hidden_capture_handled_once() {
        let captures = Arc::new(Mutex::new(Vec::new()));
        let stdout = Collect::default();
        let stderr = Collect::default();
        let config = sh(CRASHING, &captures)
            .hide_capture(true)
            .stdout_writer(stdout.clone())
            .stderr_writer(stderr.clone());

        let outcome = wrap(&config).unwrap();
        assert_eq!(
            outcome,
            WrapOutcome::Supervisor {
                exit_status: 2,
                captured: true
            }
        );
        assert_eq!(*captures.lock(), vec!["panic: boom\ngoroutine 1\n".to_string()]);
        assert_eq!(stderr.text(), "before\n");
        assert!(stdout.text().is_empty());
    }

    #[test]
    #[cfg(unix)]
    fn test_shown_capture_reaches_stderr_sink() {
        let captures = Arc::new(Mutex::new(Vec::new()));
        let stderr = Collect::default();
        let config = sh(CRASHING, &captures)
            .stdout_writer(Collect::default())
            .stderr_writer(stderr.clone());

        let outcome = wrap(&config).unwrap();
        assert!(outcome.captured());
        assert_eq!(captures.lock().len(), 1);
        assert_eq!(stderr.text(), "before\npanic: boom\ngoroutine 1\n");
    }

    #[test]
    #[cfg(unix)]
    fn test_stream_error_after_capture() {
        let captures = Arc::new(Mutex::new(Vec::new()));
        let config = sh("echo hi; echo 'panic: boom' >&2; exit 3", &captures)
            .hide_capture(true)
            .stdout_writer(Broken)
            .stderr_writer(Collect::default());

        let err = wrap(&config).unwrap_err();
        assert!(err.captured(), "got {:?}", err);
        assert_eq!(err.exit_status(), Some(3));
        assert_eq!(captures.lock().len(), 1);
    }

    #[test]
    #[cfg(unix)]
    fn test_exit_code_convention() {
        use std::os::unix::process::ExitStatusExt;

        // Raw wait statuses: exit code in the high byte, signal in the low bits
        assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code(ExitStatus::from_raw(libc::SIGKILL)), 128 + 9);
        assert_eq!(exit_code(ExitStatus::from_raw(libc::SIGABRT)), 128 + 6);
    }
}
