use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Paused,
    ];

    /// Statuses a job can still leave.
    pub const ACTIVE: [JobStatus; 3] = [JobStatus::Pending, JobStatus::Running, JobStatus::Paused];

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        JobStatus::ALL.into_iter().find(|st| st.as_str() == s)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a job runs on its own, coordinates partitions, or is one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Single,
    /// Never bound to an agent; its status and progress follow its partitions.
    Master,
    Partition,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Single => "single",
            JobKind::Master => "master",
            JobKind::Partition => "partition",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "single" => Some(JobKind::Single),
            "master" => Some(JobKind::Master),
            "partition" => Some(JobKind::Partition),
            _ => None,
        }
    }
}

/// Why a job reached its terminal state when that is not a plain success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    /// A sibling partition found the result first.
    Superseded,
    /// The keyspace was searched without a match.
    Exhausted,
    /// The agent went silent and the requeue budget was spent.
    AgentLost,
    /// The agent reported a failure running the job.
    AgentError,
    /// At least one partition failed and none succeeded.
    PartitionFailed,
}

impl TerminalReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminalReason::Superseded => "superseded",
            TerminalReason::Exhausted => "exhausted",
            TerminalReason::AgentLost => "agent_lost",
            TerminalReason::AgentError => "agent_error",
            TerminalReason::PartitionFailed => "partition_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "superseded" => Some(TerminalReason::Superseded),
            "exhausted" => Some(TerminalReason::Exhausted),
            "agent_lost" => Some(TerminalReason::AgentLost),
            "agent_error" => Some(TerminalReason::AgentError),
            "partition_failed" => Some(TerminalReason::PartitionFailed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Half-open word-index range `[start, end)` over a wordlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyspaceRange {
    pub start: u64,
    pub end: u64,
}

impl KeyspaceRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// The user-supplied definition of a job, validated and resolved.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub hash_type: u32,
    pub attack_mode: u32,
    pub hash_file_id: Uuid,
    pub wordlist_id: Uuid,
    pub rules: Option<String>,
    pub preferred_agent: Option<Uuid>,
    pub total_words: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub status: JobStatus,
    pub kind: JobKind,
    pub hash_type: u32,
    pub attack_mode: u32,
    pub hash_file_id: Uuid,
    pub wordlist_id: Uuid,
    pub rules: Option<String>,
    /// Explicit placement requested by the client; only this agent may run it.
    pub preferred_agent: Option<Uuid>,
    /// Agent a partition was sized for; preferred when idle, not required.
    pub affinity: Option<Uuid>,
    pub assigned_agent: Option<Uuid>,
    pub parent_id: Option<Uuid>,
    pub keyspace: Option<KeyspaceRange>,
    pub progress: f64,
    pub speed: f64,
    pub eta: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub reason: Option<TerminalReason>,
    pub error: Option<String>,
    pub total_words: u64,
    /// Words processed within this job's own range.
    pub processed_words: u64,
    pub requeues: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        Self::with_kind(spec, JobKind::Single, Utc::now())
    }

    pub fn master(spec: JobSpec) -> Self {
        Self::with_kind(spec, JobKind::Master, Utc::now())
    }

    fn with_kind(spec: JobSpec, kind: JobKind, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: spec.name,
            status: JobStatus::Pending,
            kind,
            hash_type: spec.hash_type,
            attack_mode: spec.attack_mode,
            hash_file_id: spec.hash_file_id,
            wordlist_id: spec.wordlist_id,
            rules: spec.rules,
            preferred_agent: spec.preferred_agent,
            affinity: None,
            assigned_agent: None,
            parent_id: None,
            keyspace: None,
            progress: 0.0,
            speed: 0.0,
            eta: None,
            result: None,
            reason: None,
            error: None,
            total_words: spec.total_words,
            processed_words: 0,
            requeues: 0,
            created_at,
            started_at: None,
            completed_at: None,
        }
    }

    /// Build partition `index` of `master`, covering `range`.
    ///
    /// Partitions inherit the master's hash type, attack mode, hash file,
    /// wordlist, rules and creation time so they queue with it.
    pub fn partition_of(
        master: &Job,
        index: usize,
        range: Option<KeyspaceRange>,
        affinity: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: format!("{} [{}]", master.name, index + 1),
            kind: JobKind::Partition,
            preferred_agent: None,
            affinity,
            parent_id: Some(master.id),
            keyspace: range,
            total_words: range.map(|r| r.len()).unwrap_or(master.total_words),
            ..master.clone()
        }
    }

    pub fn is_claimable(&self) -> bool {
        self.status == JobStatus::Pending && self.kind != JobKind::Master
    }

    /// Number of words this job must cover.
    pub fn range_len(&self) -> u64 {
        self.keyspace.map(|r| r.len()).unwrap_or(self.total_words)
    }

    /// Absolute wordlist index a fresh agent should start from.
    pub fn resume_offset(&self) -> u64 {
        let start = self.keyspace.map(|r| r.start).unwrap_or(0);
        start + self.processed_words.min(self.range_len())
    }

    /// Absolute wordlist index to stop at, when the keyspace is known.
    pub fn limit(&self) -> Option<u64> {
        match self.keyspace {
            Some(r) => Some(r.end),
            None if self.total_words > 0 => Some(self.total_words),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> JobSpec {
        JobSpec {
            name: "office-ntlm".to_string(),
            hash_type: 1000,
            attack_mode: 0,
            hash_file_id: Uuid::new_v4(),
            wordlist_id: Uuid::new_v4(),
            rules: Some("best64".to_string()),
            preferred_agent: None,
            total_words: 1_000,
        }
    }

    #[test]
    fn new_job_is_pending() {
        let job = Job::new(spec());
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.kind, JobKind::Single);
        assert!(job.assigned_agent.is_none());
        assert!(job.is_claimable());
        assert_eq!(job.progress, 0.0);
    }

    #[test]
    fn master_is_never_claimable() {
        let master = Job::master(spec());
        assert!(!master.is_claimable());
    }

    #[test]
    fn partition_inherits_definition() {
        let master = Job::master(spec());
        let agent = Uuid::new_v4();
        let part = Job::partition_of(&master, 1, Some(KeyspaceRange::new(400, 700)), Some(agent));

        assert_ne!(part.id, master.id);
        assert_eq!(part.parent_id, Some(master.id));
        assert_eq!(part.kind, JobKind::Partition);
        assert_eq!(part.hash_type, master.hash_type);
        assert_eq!(part.rules, master.rules);
        assert_eq!(part.total_words, 300);
        assert_eq!(part.affinity, Some(agent));
        assert_eq!(part.name, "office-ntlm [2]");
    }

    #[test]
    fn resume_offset_is_absolute() {
        let master = Job::master(spec());
        let mut part = Job::partition_of(&master, 0, Some(KeyspaceRange::new(400, 700)), None);
        assert_eq!(part.resume_offset(), 400);
        part.processed_words = 120;
        assert_eq!(part.resume_offset(), 520);
        assert_eq!(part.limit(), Some(700));

        let mut single = Job::new(spec());
        single.processed_words = 5_000;
        assert_eq!(single.resume_offset(), 1_000);
        assert_eq!(single.limit(), Some(1_000));
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in JobStatus::ALL {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
    }
}
