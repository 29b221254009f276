//! Termination handling.
//!
//! A signal handler may only do async-signal-safe work, so it just sets an atomic
//! flag. Handlers are installed without `SA_RESTART`: a process blocked on a queue
//! gets `EINTR`, the control channel sees the flag and returns
//! [`IpcError::Cancelled`], and the orchestrator tears down on its own thread. A
//! signal that arrives just before the wait begins is still seen, because the channel
//! rechecks the flag at least every `SHUTDOWN_POLL_INTERVAL`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use nix::libc::c_int;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

use crate::error::{IpcError, ObjectKind, Result};

/// Signals treated as a request to leave the listening state.
pub const TERMINATION_SIGNALS: [Signal; 2] = [Signal::SIGTERM, Signal::SIGINT];

/// Shared "please stop" flag. Cheap to clone; all clones observe the same request.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// The flag the installed handlers write to. Set once per process.
static SIGNAL_FLAG: OnceLock<ShutdownFlag> = OnceLock::new();

extern "C" fn on_termination(_signum: c_int) {
    if let Some(flag) = SIGNAL_FLAG.get() {
        flag.0.store(true, Ordering::SeqCst);
    }
}

/// Route `signals` to `flag`.
///
/// Only one flag can be bound per process; installing again with the same flag
/// (e.g. for additional signals) is allowed.
pub fn install_signal_handlers(flag: &ShutdownFlag, signals: &[Signal]) -> Result<()> {
    let bound = SIGNAL_FLAG.get_or_init(|| flag.clone());
    if !bound.same_as(flag) {
        return Err(IpcError::config(
            "signal handlers are already bound to another shutdown flag",
        ));
    }

    let action = SigAction::new(
        SigHandler::Handler(on_termination),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in signals {
        // SAFETY: on_termination only performs an atomic load of an initialised
        // OnceLock and an atomic store, both async-signal-safe.
        unsafe { sigaction(*signal, &action) }
            .map_err(|e| IpcError::resource(ObjectKind::Signal, signal.as_str(), e))?;
        tracing::debug!(signal = signal.as_str(), "Installed termination handler");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn clones_share_the_request() {
        let flag = ShutdownFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_requested());
        flag.request();
        assert!(clone.is_requested());
    }

    #[test]
    fn independent_flags_do_not_interfere() {
        let a = ShutdownFlag::new();
        let b = ShutdownFlag::new();
        a.request();
        assert!(!b.is_requested());
    }

    #[test]
    #[serial_test::serial(signal)]
    fn binding_a_second_flag_is_rejected() {
        let bound = test_support::signal_flag();
        assert!(install_signal_handlers(&bound, &[test_support::TEST_SIGNAL]).is_ok());

        let other = ShutdownFlag::new();
        let err = install_signal_handlers(&other, &[test_support::TEST_SIGNAL]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    #[serial_test::serial(signal)]
    fn signal_sets_the_bound_flag() {
        let flag = test_support::signal_flag();
        nix::sys::signal::raise(test_support::TEST_SIGNAL).unwrap();
        assert!(flag.is_requested());
    }
}
