//! Host side of an exchange.
//!
//! Flow:
//! 1. Connect the segment, then the control channel
//! 2. Write a request into the segment and send its length to the worker
//! 3. Block until the worker answers with the length of its reply, then read it
//! 4. Repeat for each queued request (continuous mode only)
//! 5. Tear down and unlink the named objects

use crate::config::{Role, RunMode, SessionConfig};
use crate::error::{IpcError, Result};
use crate::session::{Session, SessionState, SessionSummary};
use crate::shutdown::ShutdownFlag;

/// The request sent when none is given.
pub const DEFAULT_REQUEST: &str = "payload of task-1";

pub struct HostSession {
    session: Session,
    requests: Vec<Vec<u8>>,
}

impl HostSession {
    pub fn new(config: SessionConfig, shutdown: ShutdownFlag, requests: Vec<Vec<u8>>) -> Result<Self> {
        if config.role != Role::Host {
            return Err(IpcError::config(format!(
                "host session needs role host, got {}",
                config.role
            )));
        }
        Ok(Self {
            session: Session::new(config, shutdown),
            requests,
        })
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn summary(&self) -> SessionSummary {
        self.session.summary()
    }

    pub fn start(&mut self) -> Result<()> {
        self.session.start()
    }

    /// One exchange on a started session: send `payload`, wait for the reply.
    ///
    /// Any failure ends the session.
    pub fn request(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let exchanged = self
            .session
            .send_payload(payload)
            .and_then(|_| self.session.receive_payload());
        match exchanged {
            Ok(response) => {
                self.session.record_round(Some(&response));
                tracing::info!(
                    request_bytes = payload.len(),
                    response_bytes = response.len(),
                    round = self.session.rounds(),
                    "Exchange complete"
                );
                Ok(response)
            }
            Err(e) => Err(self.session.fail(e)),
        }
    }

    /// Run the whole exchange and tear down.
    ///
    /// Single-shot sessions send only the first request.
    pub fn run(&mut self) -> Result<SessionSummary> {
        if self.requests.is_empty() {
            let err = IpcError::config("host session has no requests to send");
            return Err(self.session.fail(err));
        }

        self.session.start()?;

        let count = match self.session.config().run_mode {
            RunMode::SingleShot => 1,
            RunMode::Continuous => self.requests.len(),
        };
        let requests = std::mem::take(&mut self.requests);
        for payload in requests.iter().take(count) {
            self.request(payload)?;
        }

        self.session.finish()?;
        Ok(self.session.summary())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    use nix::sys::pthread::{pthread_kill, pthread_self};

    use super::*;
    use crate::config::ResourceNames;
    use crate::error::ErrorKind;
    use crate::test_support::{TEST_SIGNAL, signal_flag, unique_names};
    use crate::worker::{AppendSuffix, WorkerSession};

    fn host(names: &ResourceNames, mode: RunMode, requests: Vec<Vec<u8>>) -> HostSession {
        let config = SessionConfig::new(Role::Host)
            .with_names(names.clone())
            .with_run_mode(mode);
        HostSession::new(config, ShutdownFlag::new(), requests).unwrap()
    }

    #[test]
    fn single_exchange_end_to_end() {
        let names = unique_names();
        let worker_names = names.clone();
        let worker = thread::spawn(move || {
            let config = SessionConfig::new(Role::Worker).with_names(worker_names);
            let mut worker =
                WorkerSession::new(config, ShutdownFlag::new(), AppendSuffix::default()).unwrap();
            worker.run().unwrap()
        });

        let mut host = host(&names, RunMode::SingleShot, vec![DEFAULT_REQUEST.into()]);
        let summary = host.run().unwrap();
        let worker_summary = worker.join().unwrap();

        assert_eq!(DEFAULT_REQUEST.len(), 17);
        assert_eq!(summary.state, SessionState::Completed);
        assert_eq!(summary.rounds, 1);
        assert_eq!(summary.responses, vec!["payload of task-1 processed"]);
        assert_eq!(summary.responses[0].len(), 27);
        assert_eq!(worker_summary.state, SessionState::Completed);
        assert_eq!(worker_summary.rounds, 1);
    }

    #[test]
    fn single_shot_sends_only_the_first_request() {
        let names = unique_names();
        let worker_names = names.clone();
        let worker = thread::spawn(move || {
            let config = SessionConfig::new(Role::Worker).with_names(worker_names);
            let mut worker =
                WorkerSession::new(config, ShutdownFlag::new(), AppendSuffix::default()).unwrap();
            worker.run().unwrap()
        });

        let mut host = host(
            &names,
            RunMode::SingleShot,
            vec![b"first".to_vec(), b"second".to_vec()],
        );
        let summary = host.run().unwrap();
        worker.join().unwrap();

        assert_eq!(summary.responses, vec!["first processed"]);
    }

    #[test]
    #[serial_test::serial(signal)]
    fn continuous_exchange_grows_the_segment() {
        let names = unique_names();
        let shutdown = signal_flag();
        let worker_names = names.clone();
        let worker_shutdown = shutdown.clone();
        let (tid_tx, tid_rx) = mpsc::channel();
        let worker = thread::spawn(move || {
            tid_tx.send(pthread_self()).unwrap();
            let config = SessionConfig::new(Role::Worker)
                .with_names(worker_names)
                .with_run_mode(RunMode::Continuous);
            let mut worker =
                WorkerSession::new(config, worker_shutdown, AppendSuffix::default()).unwrap();
            worker.run()
        });
        let worker_tid = tid_rx.recv().unwrap();

        let large = vec![b'x'; 3 * 4096 + 1];
        let mut host = host(
            &names,
            RunMode::Continuous,
            vec![b"small".to_vec(), large.clone(), b"tail".to_vec()],
        );
        let summary = host.run().unwrap();

        assert_eq!(summary.rounds, 3);
        assert_eq!(summary.responses[0], "small processed");
        assert_eq!(summary.responses[1].len(), large.len() + " processed".len());
        assert!(summary.responses[1].ends_with(" processed"));
        assert_eq!(summary.responses[2], "tail processed");

        // One signal, delivered while the worker waits for a fourth request.
        pthread_kill(worker_tid, TEST_SIGNAL).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !worker.is_finished() {
            assert!(Instant::now() < deadline, "worker ignored the termination signal");
            thread::sleep(Duration::from_millis(10));
        }
        assert!(shutdown.is_requested());
        let worker_summary = worker.join().unwrap().unwrap();
        assert_eq!(worker_summary.state, SessionState::Completed);
        assert_eq!(worker_summary.rounds, 3);
    }

    #[test]
    fn explicit_requests_on_started_session() {
        let names = unique_names();
        let worker_names = names.clone();
        let worker = thread::spawn(move || {
            let config = SessionConfig::new(Role::Worker).with_names(worker_names);
            let mut worker = WorkerSession::new(config, ShutdownFlag::new(), |mut req: Vec<u8>| {
                req.reverse();
                req
            })
            .unwrap();
            worker.run().unwrap()
        });

        let mut host = host(&names, RunMode::SingleShot, Vec::new());
        host.start().unwrap();
        assert_eq!(host.request(b"abc").unwrap(), b"cba");
        assert_eq!(host.state(), SessionState::Listening);
        worker.join().unwrap();
    }

    #[test]
    fn no_requests_is_config_error() {
        let mut host = host(&unique_names(), RunMode::SingleShot, Vec::new());
        let err = host.run().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert_eq!(host.state(), SessionState::Failed);
    }

    #[test]
    fn worker_role_is_rejected() {
        let config = SessionConfig::new(Role::Worker);
        let err = HostSession::new(config, ShutdownFlag::new(), Vec::new())
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn unopenable_segment_never_listens() {
        let names = unique_names();
        // A directory squatting on the shm path makes shm_open fail.
        let squatter = format!("/dev/shm{}", names.segment);
        std::fs::create_dir(&squatter).unwrap();

        let mut host = host(&names, RunMode::SingleShot, vec![DEFAULT_REQUEST.into()]);
        let err = host.run().unwrap_err();
        std::fs::remove_dir(&squatter).unwrap();

        assert_eq!(err.kind(), ErrorKind::Resource);
        assert_eq!(host.state(), SessionState::Failed);
        assert_eq!(host.summary().rounds, 0);
    }
}
