//! shmq: request/response exchange between two processes over POSIX shared memory,
//! coordinated by a pair of POSIX message queues.

pub mod bridge;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod session;
pub mod shutdown;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use bridge::channel::ControlChannel;
pub use bridge::protocol::ControlToken;
pub use bridge::segment::SharedSegment;
pub use config::{ResourceNames, Role, RunMode, SessionConfig};
pub use error::{ErrorKind, IpcError, Result};
pub use orchestrator::HostSession;
pub use session::{SessionState, SessionSummary};
pub use shutdown::{ShutdownFlag, TERMINATION_SIGNALS, install_signal_handlers};
pub use worker::{AppendSuffix, PayloadHandler, WorkerSession};
