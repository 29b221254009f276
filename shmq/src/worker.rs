//! Worker side of an exchange.
//!
//! The worker waits for a length token, reads the request from the segment, hands it
//! to a [`PayloadHandler`], and writes the reply back in place. In continuous mode it
//! keeps serving until a termination signal interrupts the wait.

use crate::config::{Role, RunMode, SessionConfig};
use crate::error::{IpcError, Result};
use crate::session::{Session, SessionState, SessionSummary};
use crate::shutdown::ShutdownFlag;

/// Business logic applied to each request.
pub trait PayloadHandler {
    fn process(&mut self, request: Vec<u8>) -> Vec<u8>;
}

impl<F> PayloadHandler for F
where
    F: FnMut(Vec<u8>) -> Vec<u8>,
{
    fn process(&mut self, request: Vec<u8>) -> Vec<u8> {
        self(request)
    }
}

/// Appends a fixed suffix to every request.
#[derive(Debug, Clone)]
pub struct AppendSuffix {
    suffix: Vec<u8>,
}

impl AppendSuffix {
    pub const DEFAULT_SUFFIX: &'static str = " processed";

    pub fn new(suffix: impl Into<Vec<u8>>) -> Self {
        Self {
            suffix: suffix.into(),
        }
    }
}

impl Default for AppendSuffix {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SUFFIX)
    }
}

impl PayloadHandler for AppendSuffix {
    fn process(&mut self, mut request: Vec<u8>) -> Vec<u8> {
        request.extend_from_slice(&self.suffix);
        request
    }
}

pub struct WorkerSession<H> {
    session: Session,
    handler: H,
}

impl<H: PayloadHandler> WorkerSession<H> {
    pub fn new(config: SessionConfig, shutdown: ShutdownFlag, handler: H) -> Result<Self> {
        if config.role != Role::Worker {
            return Err(IpcError::config(format!(
                "worker session needs role worker, got {}",
                config.role
            )));
        }
        Ok(Self {
            session: Session::new(config, shutdown),
            handler,
        })
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn summary(&self) -> SessionSummary {
        self.session.summary()
    }

    /// Serve requests until done, then tear down without unlinking (by default).
    pub fn run(&mut self) -> Result<SessionSummary> {
        self.session.start()?;
        let continuous = self.session.config().run_mode == RunMode::Continuous;

        loop {
            // A shutdown request seen between rounds ends the loop like an interrupted wait.
            let received = if self.session.is_listening() {
                self.session.receive_payload()
            } else {
                Err(IpcError::Cancelled)
            };
            let request = match received {
                Ok(request) => request,
                Err(e) if e.is_cancelled() && continuous => {
                    tracing::info!(rounds = self.session.rounds(), "Worker stopping on request");
                    break;
                }
                Err(e) => return Err(self.session.fail(e)),
            };

            let request_bytes = request.len();
            let reply = self.handler.process(request);
            if let Err(e) = self.session.send_payload(&reply) {
                return Err(self.session.fail(e));
            }
            self.session.record_round(None);
            tracing::info!(
                request_bytes,
                reply_bytes = reply.len(),
                round = self.session.rounds(),
                "Request served"
            );

            if !continuous {
                break;
            }
        }

        self.session.finish()?;
        Ok(self.session.summary())
    }
}
