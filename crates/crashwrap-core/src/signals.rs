//! Signal handling in the supervisor while its payload runs
//!
//! Forwarded signals are caught and re-sent to the child with `kill(2)`.
//! Ignored signals are caught and dropped. Either way the supervisor keeps
//! running so it can still collect the crash output and exit status.
//!
//! signal-hook cannot uninstall a handler once installed. Every handled
//! signal therefore also gets a conditional default action, armed whenever
//! no payload is being supervised, so after `wrap` returns the signal
//! behaves as if it had never been touched.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use signal_hook::iterator::{Handle, Signals};

/// Process-wide switch for the default actions
struct DefaultActions {
    /// True while no payload is supervised
    idle: Arc<AtomicBool>,
    state: Mutex<DefaultState>,
}

struct DefaultState {
    armed: HashSet<i32>,
    supervising: usize,
}

fn default_actions() -> &'static DefaultActions {
    static ACTIONS: OnceLock<DefaultActions> = OnceLock::new();
    ACTIONS.get_or_init(|| DefaultActions {
        idle: Arc::new(AtomicBool::new(true)),
        state: Mutex::new(DefaultState {
            armed: HashSet::new(),
            supervising: 0,
        }),
    })
}

impl DefaultActions {
    /// Suspend default actions and make sure `signals` have one to restore
    fn enter(&self, signals: &[i32]) -> io::Result<()> {
        let mut state = self.state.lock();
        state.supervising += 1;
        self.idle.store(false, Ordering::SeqCst);

        for &signal in signals {
            if state.armed.contains(&signal) {
                continue;
            }
            if let Err(e) = signal_hook::flag::register_conditional_default(
                signal,
                Arc::clone(&self.idle),
            ) {
                drop(state);
                self.leave();
                return Err(e);
            }
            state.armed.insert(signal);
        }
        Ok(())
    }

    fn leave(&self) {
        let mut state = self.state.lock();
        state.supervising = state.supervising.saturating_sub(1);
        if state.supervising == 0 {
            self.idle.store(true, Ordering::SeqCst);
        }
    }
}

/// Background thread relaying or dropping signals for one child
pub(crate) struct SignalForwarder {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl SignalForwarder {
    /// Start relaying `forward` to `pid` and dropping `ignore`
    ///
    /// Returns `Ok(None)` when both lists are empty.
    pub(crate) fn start(pid: u32, forward: &[i32], ignore: &[i32]) -> io::Result<Option<Self>> {
        let mut handled = forward.to_vec();
        for signal in ignore {
            if !handled.contains(signal) {
                handled.push(*signal);
            }
        }
        if handled.is_empty() {
            return Ok(None);
        }

        default_actions().enter(&handled)?;
        match Self::spawn(pid, &handled, forward.to_vec()) {
            Ok(forwarder) => Ok(Some(forwarder)),
            Err(e) => {
                default_actions().leave();
                Err(e)
            }
        }
    }

    fn spawn(pid: u32, handled: &[i32], forward: Vec<i32>) -> io::Result<Self> {
        let mut incoming = Signals::new(handled)?;
        let handle = incoming.handle();

        let thread = thread::Builder::new()
            .name("crashwrap-signals".into())
            .spawn(move || {
                for signal in incoming.forever() {
                    if !forward.contains(&signal) {
                        log::debug!("crashwrap: ignoring signal {}", signal);
                        continue;
                    }

                    log::debug!("crashwrap: forwarding signal {} to PID {}", signal, pid);
                    let ret = unsafe { libc::kill(pid as libc::pid_t, signal) };
                    if ret != 0 {
                        log::warn!(
                            "crashwrap: failed to forward signal {} to PID {}: {}",
                            signal,
                            pid,
                            io::Error::last_os_error()
                        );
                    }
                }
            })?;

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }
}

impl Drop for SignalForwarder {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        default_actions().leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_no_signals_no_thread() {
        let forwarder = SignalForwarder::start(std::process::id(), &[], &[]).unwrap();
        assert!(forwarder.is_none());
    }

    #[test]
    fn test_start_and_stop() {
        let forwarder =
            SignalForwarder::start(std::process::id(), &[libc::SIGUSR2], &[]).unwrap();
        assert!(forwarder.is_some());
        drop(forwarder);
    }

    #[test]
    fn test_ignored_signal_does_not_stop_supervisor() {
        let forwarder =
            SignalForwarder::start(std::process::id(), &[], &[libc::SIGUSR1]).unwrap();
        assert!(forwarder.is_some());
        assert!(!default_actions().idle.load(Ordering::SeqCst));

        // Default action for SIGUSR1 would terminate the test process
        assert_eq!(unsafe { libc::raise(libc::SIGUSR1) }, 0);
        thread::sleep(Duration::from_millis(50));
        drop(forwarder);
    }
}
