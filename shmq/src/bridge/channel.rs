//! Control channel: a pair of named POSIX message queues.
//!
//! Each side reads from its own inbound queue and writes to the peer's inbound queue.
//! Both calls block. Delivery is FIFO per direction; nothing orders the two
//! directions relative to each other, the session protocol does that.
//!
//! A blocked call never waits longer than [`SHUTDOWN_POLL_INTERVAL`] without looking
//! at the shutdown flag. A termination signal usually ends the wait at once with
//! `EINTR`; the interval bounds the case where the signal lands just before the
//! call starts blocking.

use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::mqueue::{
    MQ_OFlag, MqAttr, MqdT, mq_attr_member_t, mq_close, mq_getattr, mq_open, mq_send,
    mq_timedreceive, mq_unlink,
};
use nix::sys::stat::Mode;
use nix::sys::time::TimeSpec;

use super::protocol::{ControlToken, MAX_TOKEN_LEN};
use crate::error::{IpcError, ObjectKind, Result};
use crate::shutdown::ShutdownFlag;

/// Queue depth requested on creation. The protocol keeps at most one token in flight
/// per direction; the slack lets a sender run ahead without blocking.
pub const MAX_PENDING_TOKENS: usize = 10;

/// Longest stretch a blocked send or receive goes without checking for shutdown.
pub const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Absolute `CLOCK_REALTIME` deadline `wait` from now, as `mq_timedreceive` expects.
fn deadline_after(wait: Duration) -> TimeSpec {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    TimeSpec::from_duration(now + wait)
}

struct OpenQueues {
    own_inbound: String,
    peer_inbound: String,
    inbound: MqdT,
    outbound: MqdT,
    /// Sized from the inbound queue's actual `mq_msgsize`.
    recv_buf: Vec<u8>,
}

pub struct ControlChannel {
    shutdown: ShutdownFlag,
    queues: Option<OpenQueues>,
}

fn open_queue(name: &str, access: MQ_OFlag) -> Result<MqdT> {
    let attr = MqAttr::new(
        0,
        MAX_PENDING_TOKENS as mq_attr_member_t,
        MAX_TOKEN_LEN as mq_attr_member_t,
        0,
    );
    mq_open(
        name,
        access | MQ_OFlag::O_CREAT,
        Mode::S_IRUSR | Mode::S_IWUSR,
        Some(&attr),
    )
    .map_err(|e| IpcError::resource(ObjectKind::Queue, name, e))
}

fn unlink_queue(name: &str) -> Result<()> {
    match mq_unlink(name) {
        Ok(()) => Ok(()),
        Err(Errno::ENOENT) => {
            tracing::debug!(name, "Message queue already unlinked");
            Ok(())
        }
        Err(e) => Err(IpcError::io("unlink", name, e)),
    }
}

impl ControlChannel {
    /// `shutdown` is checked before every send or receive attempt.
    pub fn new(shutdown: ShutdownFlag) -> Self {
        Self {
            shutdown,
            queues: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.queues.is_some()
    }

    pub fn connect(&mut self, own_inbound: &str, peer_inbound: &str) -> Result<()> {
        if own_inbound == peer_inbound {
            return Err(IpcError::config(format!(
                "inbound and outbound queue are both '{own_inbound}'"
            )));
        }
        if self.queues.is_some() {
            return Err(IpcError::config("control channel is already connected"));
        }

        let inbound = open_queue(own_inbound, MQ_OFlag::O_RDONLY)?;
        // Non-blocking so a full peer queue is retried on our own schedule.
        let outbound = match open_queue(peer_inbound, MQ_OFlag::O_WRONLY | MQ_OFlag::O_NONBLOCK) {
            Ok(mqd) => mqd,
            Err(e) => {
                let _ = mq_close(inbound);
                return Err(e);
            }
        };

        // An existing queue keeps the attributes it was created with.
        let msgsize = match mq_getattr(&inbound) {
            Ok(attr) => attr.msgsize() as usize,
            Err(e) => {
                let _ = mq_close(inbound);
                let _ = mq_close(outbound);
                return Err(IpcError::resource(ObjectKind::Queue, own_inbound, e));
            }
        };

        tracing::info!(own_inbound, peer_inbound, msgsize, "Control channel connected");
        self.queues = Some(OpenQueues {
            own_inbound: own_inbound.to_string(),
            peer_inbound: peer_inbound.to_string(),
            inbound,
            outbound,
            recv_buf: vec![0; msgsize.max(MAX_TOKEN_LEN)],
        });
        Ok(())
    }

    fn queues_mut(&mut self, op: &'static str) -> Result<&mut OpenQueues> {
        self.queues.as_mut().ok_or_else(|| {
            IpcError::io(
                op,
                "<disconnected>",
                std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "control channel is not connected",
                ),
            )
        })
    }

    /// Enqueue `token` for the peer, waiting while its queue is full.
    pub fn send_wait(&mut self, token: &ControlToken) -> Result<()> {
        let shutdown = self.shutdown.clone();
        let queues = self.queues_mut("send")?;
        loop {
            if shutdown.is_requested() {
                return Err(IpcError::Cancelled);
            }
            match mq_send(&queues.outbound, token.as_bytes(), 0) {
                Ok(()) => {
                    tracing::debug!(queue = %queues.peer_inbound, %token, "Control token sent");
                    return Ok(());
                }
                Err(Errno::EAGAIN) => thread::sleep(SHUTDOWN_POLL_INTERVAL),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(IpcError::io("send", &queues.peer_inbound, e)),
            }
        }
    }

    /// Block until a token arrives on our inbound queue.
    pub fn receive_wait(&mut self) -> Result<ControlToken> {
        let shutdown = self.shutdown.clone();
        let queues = self.queues_mut("receive")?;
        let mut priority = 0u32;
        loop {
            if shutdown.is_requested() {
                return Err(IpcError::Cancelled);
            }
            let deadline = deadline_after(SHUTDOWN_POLL_INTERVAL);
            match mq_timedreceive(&queues.inbound, &mut queues.recv_buf, &mut priority, &deadline) {
                Ok(len) => {
                    let token = ControlToken::from_bytes(&queues.recv_buf[..len])?;
                    tracing::debug!(queue = %queues.own_inbound, %token, "Control token received");
                    return Ok(token);
                }
                Err(Errno::ETIMEDOUT | Errno::EINTR) => continue,
                Err(e) => return Err(IpcError::io("receive", &queues.own_inbound, e)),
            }
        }
    }

    /// Close both queues; with `should_unlink` also remove both names.
    ///
    /// Calling this on a disconnected channel succeeds without doing anything.
    pub fn disconnect(&mut self, should_unlink: bool) -> Result<()> {
        let Some(queues) = self.queues.take() else {
            return Ok(());
        };
        let OpenQueues {
            own_inbound,
            peer_inbound,
            inbound,
            outbound,
            ..
        } = queues;

        let mut result = mq_close(inbound).map_err(|e| IpcError::io("close", &own_inbound, e));
        result = result.and(mq_close(outbound).map_err(|e| IpcError::io("close", &peer_inbound, e)));

        if should_unlink {
            result = result.and(unlink_queue(&own_inbound));
            result = result.and(unlink_queue(&peer_inbound));
        }

        tracing::info!(
            own_inbound = %own_inbound,
            peer_inbound = %peer_inbound,
            unlink = should_unlink,
            "Control channel disconnected"
        );
        result
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect(false) {
            tracing::warn!(error = %e, "Failed to close control channel on drop");
        }
    }
}
