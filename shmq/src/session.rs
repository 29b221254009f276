//! Session lifecycle shared by the host and worker orchestrators.
//!
//! A session owns one [`SharedSegment`] and one [`ControlChannel`]. It connects them
//! in that order, moves payloads through them, and tears them down in the reverse
//! order exactly once.

use serde::Serialize;

use crate::bridge::channel::ControlChannel;
use crate::bridge::protocol::ControlToken;
use crate::bridge::segment::SharedSegment;
use crate::config::{Role, SessionConfig};
use crate::error::{IpcError, Result};
use crate::shutdown::ShutdownFlag;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    #[default]
    Idle,
    Listening,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Listening => "LISTENING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

/// What a session did, as reported by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub role: Role,
    pub state: SessionState,
    pub rounds: usize,
    /// Payloads the peer sent back, decoded lossily as UTF-8. Empty for workers.
    pub responses: Vec<String>,
    pub version: &'static str,
}

pub struct Session {
    config: SessionConfig,
    shutdown: ShutdownFlag,
    state: SessionState,
    segment: SharedSegment,
    channel: ControlChannel,
    rounds: usize,
    responses: Vec<String>,
}

impl Session {
    pub fn new(config: SessionConfig, shutdown: ShutdownFlag) -> Self {
        let segment = SharedSegment::with_min_size(config.min_segment_size);
        let channel = ControlChannel::new(shutdown.clone());
        Self {
            config,
            shutdown,
            state: SessionState::Idle,
            segment,
            channel,
            rounds: 0,
            responses: Vec::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn rounds(&self) -> usize {
        self.rounds
    }

    pub fn segment_capacity(&self) -> usize {
        self.segment.capacity()
    }

    pub fn is_listening(&self) -> bool {
        self.state == SessionState::Listening && !self.shutdown.is_requested()
    }

    fn transition(&mut self, to: SessionState) {
        tracing::info!(
            role = %self.config.role,
            from = self.state.as_str(),
            to = to.as_str(),
            "Session state changed"
        );
        self.state = to;
    }

    /// Connect the segment, then the control channel.
    ///
    /// On failure whatever was connected is released and the session ends `Failed`.
    pub fn start(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(IpcError::config(format!(
                "session cannot start from state {}",
                self.state.as_str()
            )));
        }

        if let Err(e) = self.connect_all() {
            return Err(self.fail(e));
        }
        self.transition(SessionState::Listening);
        Ok(())
    }

    fn connect_all(&mut self) -> Result<()> {
        self.config.validate()?;
        self.segment.connect(&self.config.names.segment)?;
        let queues = self.config.queues();
        self.channel
            .connect(&queues.own_inbound, &queues.peer_inbound)
    }

    fn ensure_listening(&self) -> Result<()> {
        if self.state == SessionState::Listening {
            Ok(())
        } else {
            Err(IpcError::config(format!(
                "session is {}, not LISTENING",
                self.state.as_str()
            )))
        }
    }

    /// Place `payload` in the segment and announce its length to the peer.
    pub fn send_payload(&mut self, payload: &[u8]) -> Result<usize> {
        self.ensure_listening()?;
        let written = self.segment.write(payload)?;
        self.channel.send_wait(&ControlToken::for_length(written))?;
        Ok(written)
    }

    /// Wait for the peer's token and read the payload it announces.
    pub fn receive_payload(&mut self) -> Result<Vec<u8>> {
        self.ensure_listening()?;
        let token = self.channel.receive_wait()?;
        let len = token.payload_len()?;
        self.segment.read(len)
    }

    /// Count one finished exchange, keeping the peer's reply if there was one.
    pub fn record_round(&mut self, response: Option<&[u8]>) {
        self.rounds += 1;
        if let Some(bytes) = response {
            self.responses
                .push(String::from_utf8_lossy(bytes).into_owned());
        }
    }

    fn teardown(&mut self) -> Result<()> {
        let unlink = self.config.unlink_on_teardown;
        let channel = self.channel.disconnect(unlink);
        if let Err(e) = &channel {
            tracing::warn!(role = %self.config.role, error = %e, "Control channel teardown failed");
        }
        let segment = self.segment.disconnect(unlink);
        if let Err(e) = &segment {
            tracing::warn!(role = %self.config.role, error = %e, "Shared memory teardown failed");
        }
        channel.and(segment)
    }

    /// Release everything and end `Completed`.
    ///
    /// Only a listening session can complete. A failed teardown ends the session
    /// `Failed` instead.
    pub fn finish(&mut self) -> Result<()> {
        self.ensure_listening()?;
        if let Err(e) = self.teardown() {
            self.transition(SessionState::Failed);
            return Err(e);
        }
        self.transition(SessionState::Completed);
        Ok(())
    }

    /// Release everything, end `Failed`, and hand `err` back to the caller.
    pub fn fail(&mut self, err: IpcError) -> IpcError {
        tracing::error!(role = %self.config.role, error = %err, "Session failed");
        // Teardown failures are already logged; the original error wins.
        let _ = self.teardown();
        self.transition(SessionState::Failed);
        err
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            role: self.config.role,
            state: self.state,
            rounds: self.rounds,
            responses: self.responses.clone(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state == SessionState::Listening {
            tracing::warn!(role = %self.config.role, "Session dropped while listening");
            let _ = self.teardown();
        }
    }
}
