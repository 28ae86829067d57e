//! crashwrap-core: Self-relaunching crash capture supervisor
//!
//! This crate provides the building blocks for running a program as a
//! monitored copy of itself:
//! - Relaunch token protocol (supervisor/payload negotiation)
//! - Incremental crash signature detector for the child's stderr
//! - Concurrent stdout/stderr forwarding
//! - The `wrap` orchestrator and the `wrapped` status queries
//!
//! ```no_run
//! use crashwrap_core::{wrap, WrapConfig, WrapOutcome};
//!
//! let config = WrapConfig::new(|capture| {
//!     eprintln!("the program crashed ({} bytes of output)", capture.len());
//! });
//!
//! match wrap(&config) {
//!     Ok(WrapOutcome::Supervisor { exit_status, .. }) => std::process::exit(exit_status),
//!     Ok(WrapOutcome::Payload) => { /* run the real program */ }
//!     Err(e) => eprintln!("crashwrap: {}", e),
//! }
//! ```

pub mod config;
pub mod detector;
pub mod error;
pub mod forwarder;
#[cfg(unix)]
mod signals;
pub mod status;
pub mod token;
pub mod wrap;

pub use config::{CommandOverride, Handler, WrapConfig, DEFAULT_PATIENCE};
pub use detector::{Detector, Phase, DEFAULT_SIGNATURES};
pub use error::WrapError;
pub use forwarder::{DetectorTiming, Forwarder, Sink, StreamKind};
pub use status::{relaunch_token, wrapped};
pub use token::{RelaunchToken, TOKEN_ENV_KEY};
pub use wrap::{basic_wrap, exit_code, wrap, Capture, Role, WrapOutcome};
