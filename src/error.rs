use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::JobStatus;

/// Entity families the coordinator resolves by identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Agent,
    Job,
    HashFile,
    Wordlist,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Agent => write!(f, "agent"),
            EntityKind::Job => write!(f, "job"),
            EntityKind::HashFile => write!(f, "hash file"),
            EntityKind::Wordlist => write!(f, "wordlist"),
        }
    }
}

/// Coarse category of a [`FleetError`], matched by callers instead of the
/// individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Duplicate,
    Validation,
    Conflict,
    Dispatch,
    Storage,
    Internal,
}

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("Agent already registered: {name} at {address}:{port}")]
    AlreadyRegistered {
        name: String,
        address: String,
        port: u16,
    },

    #[error("Registration key is already bound to another agent")]
    KeyInUse,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Cannot {action} job {job_id} while it is {status}")]
    InvalidTransition {
        job_id: Uuid,
        status: JobStatus,
        action: &'static str,
    },

    #[error("Agent {agent_id} is running job {job_id}")]
    AgentBusy { agent_id: Uuid, job_id: Uuid },

    #[error("Agent {agent_id} is the required placement of job {job_id}")]
    AgentPinned { agent_id: Uuid, job_id: Uuid },

    #[error("Dispatch to agent {agent_id} failed: {message}")]
    Dispatch { agent_id: Uuid, message: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FleetError {
    pub fn not_found(kind: EntityKind, id: impl ToString) -> Self {
        FleetError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Wordlists are referenced by name, so names are unique.
    pub fn duplicate_wordlist(name: &str) -> Self {
        FleetError::Validation(format!("a wordlist named '{}' already exists", name))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FleetError::NotFound { .. } => ErrorKind::NotFound,
            FleetError::AlreadyRegistered { .. } | FleetError::KeyInUse => ErrorKind::Duplicate,
            FleetError::Validation(_) => ErrorKind::Validation,
            FleetError::InvalidTransition { .. }
            | FleetError::AgentBusy { .. }
            | FleetError::AgentPinned { .. } => ErrorKind::Conflict,
            FleetError::Dispatch { .. } => ErrorKind::Dispatch,
            FleetError::Storage(_) => ErrorKind::Storage,
            FleetError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<rusqlite::Error> for FleetError {
    fn from(e: rusqlite::Error) -> Self {
        FleetError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
