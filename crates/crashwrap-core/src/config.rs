//! Wrap configuration
//!
//! A `WrapConfig` is built once, then passed by reference to `wrap`. The
//! only state that changes afterwards is the per-instance payload flag,
//! which `wrap` sets when this exact configuration takes the payload branch.

use std::ffi::OsString;
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::detector::{Detector, DEFAULT_SIGNATURES};
use crate::error::WrapError;
use crate::forwarder::{DetectorTiming, Sink};
use crate::wrap::Capture;

/// Default time a partial signature match may wait for its next byte
pub const DEFAULT_PATIENCE: Duration = Duration::from_millis(300);

/// Callback receiving a confirmed crash capture
pub type Handler = Arc<dyn Fn(&Capture) + Send + Sync>;

/// Program to launch instead of re-executing the current one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOverride {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

/// Signals relayed to the payload by default
#[cfg(unix)]
fn default_forward_signals() -> Vec<i32> {
    vec![libc::SIGTERM]
}

/// Signals the supervisor swallows by default
///
/// A terminal Ctrl-C already reaches the payload through the foreground
/// process group, so relaying SIGINT would deliver it twice.
#[cfg(unix)]
fn default_ignore_signals() -> Vec<i32> {
    vec![libc::SIGINT]
}

#[cfg(not(unix))]
fn default_forward_signals() -> Vec<i32> {
    Vec::new()
}

#[cfg(not(unix))]
fn default_ignore_signals() -> Vec<i32> {
    Vec::new()
}

/// Configuration for one `wrap` call
pub struct WrapConfig {
    handler: Option<Handler>,
    hide_capture: bool,
    signatures: Vec<Vec<u8>>,
    patience: Option<Duration>,
    quiet_period: Option<Duration>,
    command: Option<CommandOverride>,
    stdout: Sink,
    stderr: Sink,
    forward_signals: Vec<i32>,
    ignore_signals: Vec<i32>,
    /// Set when `wrap` took the payload branch with this instance
    payload: AtomicBool,
}

impl Default for WrapConfig {
    fn default() -> Self {
        Self {
            handler: None,
            hide_capture: false,
            signatures: DEFAULT_SIGNATURES
                .iter()
                .map(|s| s.as_bytes().to_vec())
                .collect(),
            patience: Some(DEFAULT_PATIENCE),
            quiet_period: None,
            command: None,
            stdout: Sink::Stdout,
            stderr: Sink::Stderr,
            forward_signals: default_forward_signals(),
            ignore_signals: default_ignore_signals(),
            payload: AtomicBool::new(false),
        }
    }
}

impl WrapConfig {
    /// Default configuration around a handler
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&Capture) + Send + Sync + 'static,
    {
        Self::default().handler(handler)
    }

    /// Set the capture handler
    pub fn handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Capture) + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Keep the raw capture off this process's stderr
    pub fn hide_capture(mut self, hide: bool) -> Self {
        self.hide_capture = hide;
        self
    }

    /// Replace the signature set
    pub fn signatures<I, S>(mut self, signatures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        self.signatures = signatures
            .into_iter()
            .map(|s| s.as_ref().to_vec())
            .collect();
        self
    }

    /// Append one signature to the set
    pub fn add_signature<S: AsRef<[u8]>>(mut self, signature: S) -> Self {
        self.signatures.push(signature.as_ref().to_vec());
        self
    }

    /// How long a partial signature match may wait for more bytes
    ///
    /// `None` holds a partial match until it is disproved or stderr closes.
    pub fn patience(mut self, patience: Option<Duration>) -> Self {
        self.patience = patience;
        self
    }

    /// How long a capture may go without new bytes before it is final
    ///
    /// `None` captures until stderr closes.
    pub fn quiet_period(mut self, quiet_period: Option<Duration>) -> Self {
        self.quiet_period = quiet_period;
        self
    }

    /// Launch `program` with `args` instead of re-executing this process
    pub fn command<P, I, A>(mut self, program: P, args: I) -> Self
    where
        P: Into<PathBuf>,
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.command = Some(CommandOverride {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Send the child's stdout to `writer` instead of this process's stdout
    pub fn stdout_writer<W: Write + Send + 'static>(mut self, writer: W) -> Self {
        self.stdout = Sink::writer(writer);
        self
    }

    /// Send the child's stderr to `writer` instead of this process's stderr
    pub fn stderr_writer<W: Write + Send + 'static>(mut self, writer: W) -> Self {
        self.stderr = Sink::writer(writer);
        self
    }

    /// Signals relayed to the payload while it runs (Unix only)
    ///
    /// Only list signals aimed at the supervisor alone. A signal sent to the
    /// whole process group already reaches the payload directly. A signal
    /// in both lists is forwarded.
    ///
    /// While the payload runs, forwarded and ignored signals never stop the
    /// supervisor. Once `wrap` returns they take their default action again.
    pub fn forward_signals(mut self, signals: Vec<i32>) -> Self {
        self.forward_signals = signals;
        self
    }

    /// Signals the supervisor catches and drops while the payload runs
    /// (Unix only)
    pub fn ignore_signals(mut self, signals: Vec<i32>) -> Self {
        self.ignore_signals = signals;
        self
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    pub fn is_hiding_capture(&self) -> bool {
        self.hide_capture
    }

    pub fn signature_set(&self) -> &[Vec<u8>] {
        &self.signatures
    }

    pub fn command_override(&self) -> Option<&CommandOverride> {
        self.command.as_ref()
    }

    pub fn forwarded_signals(&self) -> &[i32] {
        &self.forward_signals
    }

    pub fn ignored_signals(&self) -> &[i32] {
        &self.ignore_signals
    }

    /// Detector timers derived from this configuration
    pub fn timing(&self) -> DetectorTiming {
        DetectorTiming {
            patience: self.patience,
            quiet_period: self.quiet_period,
        }
    }

    /// Check the configuration before any process is spawned
    pub fn validate(&self) -> Result<(), WrapError> {
        if self.handler.is_none() {
            return Err(WrapError::Config("a capture handler is required".into()));
        }
        if self.signatures.is_empty() {
            return Err(WrapError::Config(
                "at least one crash signature is required".into(),
            ));
        }
        if self.signatures.iter().any(|s| s.is_empty()) {
            return Err(WrapError::Config("crash signatures must not be empty".into()));
        }
        Ok(())
    }

    pub(crate) fn handler_fn(&self) -> Option<&Handler> {
        self.handler.as_ref()
    }

    pub(crate) fn detector(&self) -> Detector {
        Detector::new(&self.signatures)
    }

    pub(crate) fn stdout_sink(&self) -> &Sink {
        &self.stdout
    }

    pub(crate) fn stderr_sink(&self) -> &Sink {
        &self.stderr
    }

    pub(crate) fn mark_payload(&self) {
        self.payload.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_payload(&self) -> bool {
        self.payload.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for WrapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrapConfig")
            .field("handler", &self.handler.as_ref().map(|_| ".."))
            .field("hide_capture", &self.hide_capture)
            .field(
                "signatures",
                &self
                    .signatures
                    .iter()
                    .map(|s| String::from_utf8_lossy(s))
                    .collect::<Vec<_>>(),
            )
            .field("patience", &self.patience)
            .field("quiet_period", &self.quiet_period)
            .field("command", &self.command)
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .field("forward_signals", &self.forward_signals)
            .field("ignore_signals", &self.ignore_signals)
            .field("payload", &self.is_payload())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WrapConfig::default();
        assert!(!config.has_handler());
        assert!(!config.is_hiding_capture());
        assert_eq!(config.signature_set().len(), DEFAULT_SIGNATURES.len());
        assert_eq!(config.timing().patience, Some(DEFAULT_PATIENCE));
        assert_eq!(config.timing().quiet_period, None);
        assert!(config.command_override().is_none());
        assert!(!config.is_payload());
    }

    #[test]
    #[cfg(unix)]
    fn test_default_signal_policy() {
        let config = WrapConfig::default();
        assert_eq!(config.forwarded_signals(), &[libc::SIGTERM]);
        assert_eq!(config.ignored_signals(), &[libc::SIGINT]);
    }

    #[test]
    fn test_missing_handler_rejected() {
        let err = WrapConfig::default().validate().unwrap_err();
        assert!(matches!(err, WrapError::Config(_)));
    }

    #[test]
    fn test_empty_signature_set_rejected() {
        let config = WrapConfig::new(|_| {}).signatures(Vec::<String>::new());
        assert!(matches!(config.validate(), Err(WrapError::Config(_))));
    }

    #[test]
    fn test_empty_signature_rejected() {
        let config = WrapConfig::new(|_| {}).add_signature("");
        assert!(matches!(config.validate(), Err(WrapError::Config(_))));
    }

    #[test]
    fn test_builder() {
        let config = WrapConfig::new(|_| {})
            .hide_capture(true)
            .signatures(["BOOM"])
            .add_signature("CRASH")
            .patience(None)
            .quiet_period(Some(Duration::from_secs(2)))
            .command("/bin/sh", ["-c", "exit 3"])
            .forward_signals(Vec::new())
            .ignore_signals(vec![2, 15]);

        assert!(config.validate().is_ok());
        assert!(config.is_hiding_capture());
        assert_eq!(
            config.signature_set(),
            &[b"BOOM".to_vec(), b"CRASH".to_vec()]
        );
        assert_eq!(config.timing().patience, None);
        assert_eq!(config.timing().quiet_period, Some(Duration::from_secs(2)));
        let command = config.command_override().unwrap();
        assert_eq!(command.program, PathBuf::from("/bin/sh"));
        assert_eq!(command.args, vec![OsString::from("-c"), OsString::from("exit 3")]);
        assert!(config.forwarded_signals().is_empty());
        assert_eq!(config.ignored_signals(), &[2, 15]);
    }

    #[test]
    fn test_payload_flag_is_per_instance() {
        let a = WrapConfig::new(|_| {});
        let b = WrapConfig::new(|_| {});
        a.mark_payload();
        assert!(a.is_payload());
        assert!(!b.is_payload());
    }

    #[test]
    fn test_debug_hides_handler() {
        let config = WrapConfig::new(|_| {});
        let debug = format!("{:?}", config);
        assert!(debug.contains("WrapConfig"));
        assert!(debug.contains("panic:"));
    }
}
