//! Helpers shared by unit tests.

use std::sync::OnceLock;

use nix::sys::signal::Signal;

use crate::shutdown::{ShutdownFlag, install_signal_handlers};

/// Signal routed to [`signal_flag`]. Tests raising it must be `#[serial(signal)]`.
pub const TEST_SIGNAL: Signal = Signal::SIGUSR1;

/// A kernel object name no other test (or test run) uses.
pub fn unique_name(tag: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("/shmq-test-{tag}-{}", &id[..12])
}

/// Names for a full host/worker session.
pub fn unique_names() -> crate::config::ResourceNames {
    let id = uuid::Uuid::new_v4().simple().to_string();
    crate::config::ResourceNames::with_prefix(&format!("/shmq-test-{}", &id[..12]))
}

/// The process-wide flag bound to [`TEST_SIGNAL`], cleared on every call.
pub fn signal_flag() -> ShutdownFlag {
    static FLAG: OnceLock<ShutdownFlag> = OnceLock::new();
    let flag = FLAG
        .get_or_init(|| {
            let flag = ShutdownFlag::new();
            install_signal_handlers(&flag, &[TEST_SIGNAL]).unwrap();
            flag
        })
        .clone();
    flag.reset();
    flag
}
