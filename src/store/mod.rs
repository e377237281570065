//! Persistence contract for the orchestration core.
//!
//! The core never talks to a concrete database. It depends on one
//! repository trait per entity family plus [`Store::apply`], the single
//! primitive through which every status-changing write goes:
//!
//! - a batch of [`Mutation`]s is evaluated in order inside one transaction
//! - each mutation is guarded (expected status, bound agent or job,
//!   heartbeat age); a `required` mutation whose guard fails aborts the
//!   whole batch and `apply` returns `false`
//! - optional mutations whose guard fails are skipped
//!
//! A `false` result is how claim races and stale reports surface; it is not
//! an error.
//!
//! Two implementations ship with the crate: [`MemoryStore`] and
//! [`SqliteStore`].

pub mod artifact;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::registry::{Agent, AgentStatus};
use crate::scheduler::{Job, JobStatus, TerminalReason};

pub use artifact::{HashFile, Wordlist};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Precondition on a job row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobGuard {
    /// Allowed current statuses; empty accepts any.
    pub statuses: Vec<JobStatus>,
    /// Expected bound agent (`Some(None)` = must be unbound).
    pub assigned_agent: Option<Option<Uuid>>,
}

impl JobGuard {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn status_in(statuses: &[JobStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            ..Default::default()
        }
    }

    pub fn assigned_to(mut self, agent: Option<Uuid>) -> Self {
        self.assigned_agent = Some(agent);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && self.assigned_agent.map_or(true, |a| job.assigned_agent == a)
    }
}

/// Column changes for a job row. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub assigned_agent: Option<Option<Uuid>>,
    /// Stored progress becomes `max(stored, value)`.
    pub raise_progress: Option<f64>,
    /// Stored processed words become `max(stored, value)`.
    pub raise_processed: Option<u64>,
    pub speed: Option<f64>,
    pub eta: Option<Option<DateTime<Utc>>>,
    pub result: Option<String>,
    pub reason: Option<TerminalReason>,
    pub error: Option<String>,
    /// Written only if the job has no start time yet.
    pub stamp_started: Option<DateTime<Utc>>,
    pub clear_started: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub bump_requeues: bool,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn apply(&self, job: &mut Job) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(agent) = self.assigned_agent {
            job.assigned_agent = agent;
        }
        if let Some(p) = self.raise_progress {
            job.progress = job.progress.max(p);
        }
        if let Some(w) = self.raise_processed {
            job.processed_words = job.processed_words.max(w);
        }
        if let Some(speed) = self.speed {
            job.speed = speed;
        }
        if let Some(eta) = self.eta {
            job.eta = eta;
        }
        if let Some(ref result) = self.result {
            job.result = Some(result.clone());
        }
        if let Some(reason) = self.reason {
            job.reason = Some(reason);
        }
        if let Some(ref error) = self.error {
            job.error = Some(error.clone());
        }
        if self.clear_started {
            job.started_at = None;
        }
        if let Some(at) = self.stamp_started {
            job.started_at.get_or_insert(at);
        }
        if let Some(at) = self.completed_at {
            job.completed_at = Some(at);
        }
        if self.bump_requeues {
            job.requeues += 1;
        }
    }
}

/// Precondition on an agent row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentGuard {
    pub statuses: Vec<AgentStatus>,
    pub current_job: Option<Option<Uuid>>,
    /// Last heartbeat must be strictly older than this.
    pub heartbeat_before: Option<DateTime<Utc>>,
}

impl AgentGuard {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn status_in(statuses: &[AgentStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            ..Default::default()
        }
    }

    pub fn holding(mut self, job: Option<Uuid>) -> Self {
        self.current_job = Some(job);
        self
    }

    pub fn silent_since(mut self, cutoff: DateTime<Utc>) -> Self {
        self.heartbeat_before = Some(cutoff);
        self
    }

    pub fn matches(&self, agent: &Agent) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&agent.status))
            && self.current_job.map_or(true, |j| agent.current_job == j)
            && self.heartbeat_before.map_or(true, |c| agent.last_heartbeat < c)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentPatch {
    pub status: Option<AgentStatus>,
    pub current_job: Option<Option<Uuid>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl AgentPatch {
    /// Bind `job` and mark busy.
    pub fn bind(job: Uuid) -> Self {
        Self {
            status: Some(AgentStatus::Busy),
            current_job: Some(Some(job)),
            last_heartbeat: None,
        }
    }

    /// Drop any job and mark online.
    pub fn release() -> Self {
        Self {
            status: Some(AgentStatus::Online),
            current_job: Some(None),
            last_heartbeat: None,
        }
    }

    pub fn apply(&self, agent: &mut Agent) {
        if let Some(status) = self.status {
            agent.status = status;
        }
        if let Some(job) = self.current_job {
            agent.current_job = job;
        }
        if let Some(at) = self.last_heartbeat {
            agent.last_heartbeat = at;
        }
    }
}

/// One guarded write inside a [`Store::apply`] batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Job {
        id: Uuid,
        guard: JobGuard,
        patch: JobPatch,
        required: bool,
    },
    Agent {
        id: Uuid,
        guard: AgentGuard,
        patch: AgentPatch,
        required: bool,
    },
    DeleteJob {
        id: Uuid,
        guard: JobGuard,
        required: bool,
    },
}

impl Mutation {
    pub fn job(id: Uuid, guard: JobGuard, patch: JobPatch) -> Self {
        Mutation::Job {
            id,
            guard,
            patch,
            required: true,
        }
    }

    pub fn agent(id: Uuid, guard: AgentGuard, patch: AgentPatch) -> Self {
        Mutation::Agent {
            id,
            guard,
            patch,
            required: true,
        }
    }

    pub fn delete_job(id: Uuid, guard: JobGuard) -> Self {
        Mutation::DeleteJob {
            id,
            guard,
            required: true,
        }
    }

    /// Skip instead of aborting the batch when the guard fails.
    pub fn optional(mut self) -> Self {
        match &mut self {
            Mutation::Job { required, .. }
            | Mutation::Agent { required, .. }
            | Mutation::DeleteJob { required, .. } => *required = false,
        }
        self
    }

    pub fn is_required(&self) -> bool {
        match self {
            Mutation::Job { required, .. }
            | Mutation::Agent { required, .. }
            | Mutation::DeleteJob { required, .. } => *required,
        }
    }
}

#[async_trait]
pub trait AgentRepository: Send + Sync {
    /// Insert a new agent. Fails with `AlreadyRegistered` when the
    /// (name, address, port) triple exists, `KeyInUse` when the
    /// registration key is bound to another agent.
    async fn insert_agent(&self, agent: &Agent) -> Result<()>;

    async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>>;

    async fn find_agent(&self, name: &str, address: &str, port: u16) -> Result<Option<Agent>>;

    /// All agents in registration order.
    async fn list_agents(&self) -> Result<Vec<Agent>>;

    /// Remove an agent that holds no job. Returns false otherwise.
    async fn delete_agent(&self, id: Uuid) -> Result<bool>;
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert all jobs in one transaction (a master and its partitions).
    async fn insert_jobs(&self, jobs: &[Job]) -> Result<()>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;

    /// All jobs by creation time.
    async fn list_jobs(&self) -> Result<Vec<Job>>;

    /// Partitions of a master in keyspace order.
    async fn children(&self, master_id: Uuid) -> Result<Vec<Job>>;

    /// Pending single jobs and partitions, oldest first.
    async fn claimable_jobs(&self) -> Result<Vec<Job>>;

    /// Oldest claimable job `agent` may run: capability match, and either no
    /// explicit placement or placement on this agent.
    async fn next_job_for_agent(&self, agent: &Agent) -> Result<Option<Job>>;
}

#[async_trait]
pub trait HashFileRepository: Send + Sync {
    async fn insert_hash_file(&self, file: &HashFile) -> Result<()>;
    async fn get_hash_file(&self, id: Uuid) -> Result<Option<HashFile>>;
    async fn list_hash_files(&self) -> Result<Vec<HashFile>>;
}

#[async_trait]
pub trait WordlistRepository: Send + Sync {
    async fn insert_wordlist(&self, wordlist: &Wordlist) -> Result<()>;
    async fn get_wordlist(&self, id: Uuid) -> Result<Option<Wordlist>>;
    async fn find_wordlist(&self, name: &str) -> Result<Option<Wordlist>>;
    async fn list_wordlists(&self) -> Result<Vec<Wordlist>>;
}

#[async_trait]
pub trait Store: AgentRepository + JobRepository + HashFileRepository + WordlistRepository {
    /// Apply `batch` atomically. Returns false, with nothing written, if a
    /// required mutation's guard did not hold.
    async fn apply(&self, batch: Vec<Mutation>) -> Result<bool>;
}

/// Ordering shared by both stores for claimable work: creation time, then
/// keyspace start so partitions of one master queue in order.
pub(crate) fn fifo_key(job: &Job) -> (DateTime<Utc>, u64, Uuid) {
    (job.created_at, job.keyspace.map(|r| r.start).unwrap_or(0), job.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::JobSpec;

    fn job() -> Job {
        Job::new(JobSpec {
            name: "j".into(),
            hash_type: 0,
            attack_mode: 0,
            hash_file_id: Uuid::new_v4(),
            wordlist_id: Uuid::new_v4(),
            rules: None,
            preferred_agent: None,
            total_words: 100,
        })
    }

    #[test]
    fn progress_patch_never_lowers() {
        let mut j = job();
        JobPatch {
            raise_progress: Some(0.4),
            raise_processed: Some(40),
            ..Default::default()
        }
        .apply(&mut j);
        JobPatch {
            raise_progress: Some(0.25),
            raise_processed: Some(25),
            ..Default::default()
        }
        .apply(&mut j);
        assert_eq!(j.progress, 0.4);
        assert_eq!(j.processed_words, 40);
    }

    #[test]
    fn started_stamp_is_write_once() {
        let mut j = job();
        let first = Utc::now();
        let later = first + chrono::Duration::seconds(60);
        JobPatch {
            stamp_started: Some(first),
            ..Default::default()
        }
        .apply(&mut j);
        JobPatch {
            stamp_started: Some(later),
            ..Default::default()
        }
        .apply(&mut j);
        assert_eq!(j.started_at, Some(first));
    }

    #[test]
    fn guard_checks_status_and_binding() {
        let mut j = job();
        let agent = Uuid::new_v4();
        let guard = JobGuard::status_in(&[JobStatus::Running]).assigned_to(Some(agent));
        assert!(!guard.matches(&j));
        j.status = JobStatus::Running;
        j.assigned_agent = Some(agent);
        assert!(guard.matches(&j));
        j.assigned_agent = Some(Uuid::new_v4());
        assert!(!guard.matches(&j));
    }

    #[test]
    fn optional_flag() {
        let m = Mutation::job(Uuid::nil(), JobGuard::any(), JobPatch::default());
        assert!(m.is_required());
        assert!(!m.optional().is_required());
    }
}
