//! Session configuration: role, kernel object names and run mode.
//!
//! Everything here is an immutable value built once at startup and handed to the
//! session. Both processes must agree on [`ResourceNames`]; only the queue direction
//! flips with the [`Role`].

use serde::{Deserialize, Serialize};

use crate::bridge::segment::MIN_SEGMENT_SIZE;
use crate::error::{IpcError, Result};

pub const DEFAULT_SEGMENT_NAME: &str = "/shmq-segment";
pub const DEFAULT_HOST_QUEUE_NAME: &str = "/shmq-host";
pub const DEFAULT_WORKER_QUEUE_NAME: &str = "/shmq-worker";

pub const SEGMENT_ENV: &str = "SHMQ_SEGMENT";
pub const HOST_QUEUE_ENV: &str = "SHMQ_HOST_QUEUE";
pub const WORKER_QUEUE_ENV: &str = "SHMQ_WORKER_QUEUE";

/// POSIX limits object names to NAME_MAX, leading slash included.
const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Worker,
}

impl Role {
    pub fn from_host_flag(is_host: bool) -> Self {
        if is_host { Self::Host } else { Self::Worker }
    }

    pub fn is_host(&self) -> bool {
        matches!(self, Self::Host)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Worker => "worker",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a session performs one exchange or keeps serving until told to stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    SingleShot,
    Continuous,
}

/// The three well-known kernel object names shared by host and worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    pub segment: String,
    pub host_queue: String,
    pub worker_queue: String,
}

impl Default for ResourceNames {
    fn default() -> Self {
        Self {
            segment: DEFAULT_SEGMENT_NAME.to_string(),
            host_queue: DEFAULT_HOST_QUEUE_NAME.to_string(),
            worker_queue: DEFAULT_WORKER_QUEUE_NAME.to_string(),
        }
    }
}

impl ResourceNames {
    /// Names derived from a common prefix, e.g. `/app` gives `/app-segment`,
    /// `/app-host` and `/app-worker`.
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            segment: format!("{prefix}-segment"),
            host_queue: format!("{prefix}-host"),
            worker_queue: format!("{prefix}-worker"),
        }
    }

    /// Defaults overridden by `SHMQ_SEGMENT`, `SHMQ_HOST_QUEUE` and `SHMQ_WORKER_QUEUE`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let names = Self {
            segment: lookup(SEGMENT_ENV).unwrap_or(defaults.segment),
            host_queue: lookup(HOST_QUEUE_ENV).unwrap_or(defaults.host_queue),
            worker_queue: lookup(WORKER_QUEUE_ENV).unwrap_or(defaults.worker_queue),
        };
        names.validate()?;
        Ok(names)
    }

    pub fn validate(&self) -> Result<()> {
        validate_name(&self.segment)?;
        validate_name(&self.host_queue)?;
        validate_name(&self.worker_queue)?;
        if self.host_queue == self.worker_queue {
            return Err(IpcError::config(format!(
                "host and worker queues must differ, both are '{}'",
                self.host_queue
            )));
        }
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    let Some(rest) = name.strip_prefix('/') else {
        return Err(IpcError::config(format!("object name '{name}' must start with '/'")));
    };
    if rest.is_empty() || rest.contains('/') {
        return Err(IpcError::config(format!(
            "object name '{name}' must be a single '/'-prefixed component"
        )));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(IpcError::config(format!(
            "object name '{name}' exceeds {MAX_NAME_LEN} bytes"
        )));
    }
    Ok(())
}

/// Queue names as seen from one side: where we read and where the peer reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedQueuePair {
    pub own_inbound: String,
    pub peer_inbound: String,
}

impl NamedQueuePair {
    pub fn for_role(role: Role, names: &ResourceNames) -> Self {
        match role {
            Role::Host => Self {
                own_inbound: names.host_queue.clone(),
                peer_inbound: names.worker_queue.clone(),
            },
            Role::Worker => Self {
                own_inbound: names.worker_queue.clone(),
                peer_inbound: names.host_queue.clone(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub role: Role,
    pub names: ResourceNames,
    pub run_mode: RunMode,
    /// Destroy the named objects on teardown. Defaults to true for the host only.
    pub unlink_on_teardown: bool,
    /// Lower bound for the initial segment size (rounded up to a page).
    pub min_segment_size: usize,
}

impl SessionConfig {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            names: ResourceNames::default(),
            run_mode: RunMode::default(),
            unlink_on_teardown: role.is_host(),
            min_segment_size: MIN_SEGMENT_SIZE,
        }
    }

    pub fn with_names(mut self, names: ResourceNames) -> Self {
        self.names = names;
        self
    }

    pub fn with_run_mode(mut self, run_mode: RunMode) -> Self {
        self.run_mode = run_mode;
        self
    }

    pub fn with_unlink_on_teardown(mut self, unlink: bool) -> Self {
        self.unlink_on_teardown = unlink;
        self
    }

    pub fn with_min_segment_size(mut self, bytes: usize) -> Self {
        self.min_segment_size = bytes;
        self
    }

    pub fn queues(&self) -> NamedQueuePair {
        NamedQueuePair::for_role(self.role, &self.names)
    }

    pub fn validate(&self) -> Result<()> {
        self.names.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_pair_flips_between_roles() {
        let names = ResourceNames::default();
        let host = NamedQueuePair::for_role(Role::Host, &names);
        let worker = NamedQueuePair::for_role(Role::Worker, &names);

        assert_eq!(host.own_inbound, DEFAULT_HOST_QUEUE_NAME);
        assert_eq!(host.peer_inbound, DEFAULT_WORKER_QUEUE_NAME);
        assert_eq!(host.own_inbound, worker.peer_inbound);
        assert_eq!(host.peer_inbound, worker.own_inbound);
        assert_ne!(host.own_inbound, host.peer_inbound);
    }

    #[test]
    fn role_from_flag() {
        assert_eq!(Role::from_host_flag(true), Role::Host);
        assert_eq!(Role::from_host_flag(false), Role::Worker);
    }

    #[test]
    fn only_host_unlinks_by_default() {
        assert!(SessionConfig::new(Role::Host).unlink_on_teardown);
        assert!(!SessionConfig::new(Role::Worker).unlink_on_teardown);
        assert!(
            SessionConfig::new(Role::Worker)
                .with_unlink_on_teardown(true)
                .unlink_on_teardown
        );
    }

    #[test]
    fn lookup_overrides_defaults() {
        let names = ResourceNames::from_lookup(|key| match key {
            SEGMENT_ENV => Some("/custom-seg".to_string()),
            _ => None,
        })
        .unwrap();

        assert_eq!(names.segment, "/custom-seg");
        assert_eq!(names.host_queue, DEFAULT_HOST_QUEUE_NAME);
        assert_eq!(names.worker_queue, DEFAULT_WORKER_QUEUE_NAME);
    }

    #[test]
    fn rejects_malformed_names() {
        for bad in ["no-slash", "/", "/a/b"] {
            let names = ResourceNames {
                segment: bad.to_string(),
                ..ResourceNames::default()
            };
            assert!(names.validate().is_err(), "{bad} should be rejected");
        }

        let long = format!("/{}", "x".repeat(MAX_NAME_LEN));
        let names = ResourceNames {
            segment: long,
            ..ResourceNames::default()
        };
        assert!(names.validate().is_err());
    }

    #[test]
    fn rejects_identical_queue_names() {
        let names = ResourceNames {
            worker_queue: DEFAULT_HOST_QUEUE_NAME.to_string(),
            ..ResourceNames::default()
        };
        let err = names.validate().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn prefix_names_are_valid() {
        let names = ResourceNames::with_prefix("/app");
        assert_eq!(names.segment, "/app-segment");
        assert!(names.validate().is_ok());
    }

    #[test]
    fn run_mode_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunMode::SingleShot).unwrap(),
            "\"single_shot\""
        );
        assert_eq!(serde_json::to_string(&Role::Worker).unwrap(), "\"worker\"");
    }
}
