//! Relaunch token carried in the payload's environment
//!
//! The supervisor writes `CRASHWRAP_RELAUNCH_TOKEN=<pid>:<call>` into the
//! environment of the child it spawns. The child decodes it once, on first
//! use, and keeps the typed value for the rest of its life.

use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

/// Environment variable holding the relaunch token
pub const TOKEN_ENV_KEY: &str = "CRASHWRAP_RELAUNCH_TOKEN";

/// Sequence number for wrap calls made by this process
static NEXT_CALL: AtomicU64 = AtomicU64::new(1);

/// Token this process was started with (decoded once)
static STARTUP_TOKEN: OnceLock<Option<RelaunchToken>> = OnceLock::new();

/// Marker telling a process it is the payload of some supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaunchToken {
    raw: String,
    supervisor_pid: Option<u32>,
    call: Option<u64>,
}

impl RelaunchToken {
    /// Mint a token for a child spawned by this process
    pub fn mint() -> Self {
        let pid = std::process::id();
        let call = NEXT_CALL.fetch_add(1, Ordering::Relaxed);
        Self {
            raw: format!("{}:{}", pid, call),
            supervisor_pid: Some(pid),
            call: Some(call),
        }
    }

    /// Decode a token value
    ///
    /// Any value counts as a token; the pid and call fields are only filled
    /// in when the value is well formed.
    pub fn decode(value: &OsStr) -> Self {
        let raw = value.to_string_lossy().into_owned();
        let (supervisor_pid, call) = match raw.split_once(':') {
            Some((pid, call)) => (pid.parse().ok(), call.parse().ok()),
            None => (None, None),
        };
        Self {
            raw,
            supervisor_pid,
            call,
        }
    }

    /// Value written into the child's environment
    pub fn encode(&self) -> &str {
        &self.raw
    }

    /// PID of the supervisor that minted this token
    pub fn supervisor_pid(&self) -> Option<u32> {
        self.supervisor_pid
    }

    /// Which wrap call of the supervisor minted this token
    pub fn call(&self) -> Option<u64> {
        self.call
    }
}

/// Read the token from the live process environment
fn from_environment() -> Option<RelaunchToken> {
    std::env::var_os(TOKEN_ENV_KEY).map(|value| RelaunchToken::decode(&value))
}

/// Token this process was started with
///
/// The environment is read on the first call only; later changes to
/// `CRASHWRAP_RELAUNCH_TOKEN` are not observed.
pub fn current() -> Option<&'static RelaunchToken> {
    STARTUP_TOKEN.get_or_init(from_environment).as_ref()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_encodes_pid_and_call() {
        let token = RelaunchToken::mint();
        assert_eq!(token.supervisor_pid(), Some(std::process::id()));
        assert!(token.call().is_some());
        assert_eq!(
            token.encode(),
            format!("{}:{}", std::process::id(), token.call().unwrap())
        );
    }

    #[test]
    fn test_mint_sequence_advances() {
        let first = RelaunchToken::mint();
        let second = RelaunchToken::mint();
        assert!(second.call().unwrap() > first.call().unwrap());
        assert_ne!(first, second);
    }

    #[test]
    fn test_decode_minted_value() {
        let token = RelaunchToken::mint();
        let decoded = RelaunchToken::decode(OsStr::new(token.encode()));
        assert_eq!(decoded, token);
    }

    #[test]
    fn test_decode_malformed_value_still_present() {
        let decoded = RelaunchToken::decode(OsStr::new("not-a-token"));
        assert_eq!(decoded.encode(), "not-a-token");
        assert_eq!(decoded.supervisor_pid(), None);
        assert_eq!(decoded.call(), None);

        let decoded = RelaunchToken::decode(OsStr::new("12:abc"));
        assert_eq!(decoded.supervisor_pid(), Some(12));
        assert_eq!(decoded.call(), None);
    }

    #[test]
    fn test_current_is_stable() {
        let first = current().cloned();
        let second = current().cloned();
        assert_eq!(first, second);
    }
}
