//! Wrapped-status queries
//!
//! Two questions with deliberately different answers:
//! - `wrapped(None)`: was this process started by *some* supervisor? True
//!   for every descendant that inherited a relaunch token.
//! - `wrapped(Some(config))`: did `wrap(config)` run in this process and
//!   take the payload branch? An inherited token alone never makes this
//!   true.

use crate::config::WrapConfig;
use crate::token::{self, RelaunchToken};

/// Whether this process runs as a wrapped payload
pub fn wrapped(config: Option<&WrapConfig>) -> bool {
    match config {
        Some(config) => config.is_payload(),
        None => token::current().is_some(),
    }
}

/// The relaunch token this process was started with, if any
pub fn relaunch_token() -> Option<&'static RelaunchToken> {
    token::current()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_config_is_not_wrapped() {
        let config = WrapConfig::new(|_| {});
        assert!(!wrapped(Some(&config)));
    }

    #[test]
    fn test_config_wrapped_after_payload_branch() {
        let a = WrapConfig::new(|_| {});
        let b = WrapConfig::new(|_| {});
        a.mark_payload();
        assert!(wrapped(Some(&a)));
        assert!(!wrapped(Some(&b)));
    }

    #[test]
    fn test_global_query_matches_token() {
        assert_eq!(wrapped(None), relaunch_token().is_some());
    }
}
