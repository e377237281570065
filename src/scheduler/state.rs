//! Job state machine.
//!
//! ```text
//! pending ──claim──▶ running ──found / exhausted──▶ completed
//!    │  ▲              │  │
//!    │  └──requeue─────┘  └──error / agent lost──▶ failed
//!    ▼                 ▼
//!  paused ◀──pause─────┘
//!    └──resume──▶ pending
//! ```
//!
//! Completed and failed are final. Resuming goes through pending so the
//! scheduler picks a fresh agent, which continues from the stored offset.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::error::{EntityKind, FleetError, Result};
use crate::registry::AgentRegistry;
use crate::scheduler::dispatch::{notify_stop, AgentDispatcher};
use crate::scheduler::{Job, JobKind, JobStatus, TerminalReason};
use crate::store::{JobGuard, JobPatch, Mutation, Store};

/// Bound on optimistic retries when a guarded batch loses a race.
pub(crate) const MAX_ATTEMPTS: usize = 8;

pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;

    matches!(
        (from, to),
        (Pending, Running)
            | (Pending, Paused)
            | (Pending, Failed)
            | (Running, Pending)
            | (Running, Paused)
            | (Running, Completed)
            | (Running, Failed)
            | (Paused, Pending)
            | (Paused, Failed)
    )
}

pub fn check_transition(job: &Job, to: JobStatus, action: &'static str) -> Result<()> {
    if can_transition(job.status, to) {
        Ok(())
    } else {
        Err(FleetError::InvalidTransition {
            job_id: job.id,
            status: job.status,
            action,
        })
    }
}

fn paused_patch() -> JobPatch {
    JobPatch {
        status: Some(JobStatus::Paused),
        assigned_agent: Some(None),
        speed: Some(0.0),
        eta: Some(None),
        ..Default::default()
    }
}

/// Patch for a running job whose agent went silent: back to pending while
/// the requeue budget lasts, failed after. The boolean is true on requeue.
///
/// Processed words are kept so the next agent resumes where this one stopped.
pub(crate) fn lost_agent_patch(
    job: &Job,
    config: &CoordinatorConfig,
    now: DateTime<Utc>,
) -> (JobPatch, bool) {
    if config.may_requeue(job.requeues) {
        let patch = JobPatch {
            status: Some(JobStatus::Pending),
            assigned_agent: Some(None),
            speed: Some(0.0),
            eta: Some(None),
            bump_requeues: true,
            ..Default::default()
        };
        (patch, true)
    } else {
        let patch = JobPatch {
            status: Some(JobStatus::Failed),
            reason: Some(TerminalReason::AgentLost),
            error: Some("agent stopped responding".to_string()),
            speed: Some(0.0),
            eta: Some(None),
            completed_at: Some(now),
            ..Default::default()
        };
        (patch, false)
    }
}

/// Mutations to add to the batch that makes partition `finishing` terminal
/// without a result.
///
/// While other partitions are still open, the batch only asserts that they
/// are: if one of them finishes concurrently the batch fails and the caller
/// re-reads, so exactly one of the last two finishers settles the master.
/// Once every other partition is terminal, the master fails with
/// `Exhausted` when all of them exhausted their range, `PartitionFailed`
/// otherwise.
pub(crate) fn settle_master(
    master: &Job,
    children: &[Job],
    finishing: Uuid,
    reason: TerminalReason,
    now: DateTime<Utc>,
) -> Vec<Mutation> {
    let mut batch = Vec::new();
    let mut all_exhausted = reason == TerminalReason::Exhausted;

    for child in children.iter().filter(|c| c.id != finishing) {
        if child.status.is_terminal() {
            all_exhausted &= child.reason == Some(TerminalReason::Exhausted);
        } else {
            batch.push(Mutation::job(
                child.id,
                JobGuard::status_in(&JobStatus::ACTIVE),
                JobPatch::default(),
            ));
        }
    }
    if !batch.is_empty() {
        return batch;
    }

    let reason = if all_exhausted {
        TerminalReason::Exhausted
    } else {
        TerminalReason::PartitionFailed
    };
    batch.push(Mutation::job(
        master.id,
        JobGuard::status_in(&[JobStatus::Running]),
        JobPatch {
            status: Some(JobStatus::Failed),
            reason: Some(reason),
            speed: Some(0.0),
            eta: Some(None),
            completed_at: Some(now),
            ..Default::default()
        },
    ));
    batch
}

/// Operator-driven transitions: pause, resume and delete.
///
/// Partitions are controlled through their master; a master cascades each
/// transition to its open partitions in the same batch.
#[derive(Clone)]
pub struct JobStateMachine {
    store: Arc<dyn Store>,
    dispatcher: Arc<dyn AgentDispatcher>,
}

impl JobStateMachine {
    pub fn new(store: Arc<dyn Store>, dispatcher: Arc<dyn AgentDispatcher>) -> Self {
        Self { store, dispatcher }
    }

    async fn load(&self, job_id: Uuid) -> Result<Job> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| FleetError::not_found(EntityKind::Job, job_id))?;
        if job.kind == JobKind::Partition {
            return Err(FleetError::Validation(format!(
                "job {} is a partition; control its master job instead",
                job_id
            )));
        }
        Ok(job)
    }

    async fn children_of(&self, job: &Job) -> Result<Vec<Job>> {
        if job.kind == JobKind::Master {
            self.store.children(job.id).await
        } else {
            Ok(Vec::new())
        }
    }

    /// Pause a pending or running job. Running agents are released and told
    /// to stop; progress and processed words are kept.
    pub async fn pause(&self, job_id: Uuid) -> Result<Job> {
        for _ in 0..MAX_ATTEMPTS {
            let job = self.load(job_id).await?;
            check_transition(&job, JobStatus::Paused, "pause")?;

            let children = self.children_of(&job).await?;

            let mut batch = Vec::new();
            let mut released = Vec::new();
            for j in std::iter::once(&job).chain(children.iter()) {
                if !matches!(j.status, JobStatus::Pending | JobStatus::Running) {
                    continue;
                }
                batch.push(Mutation::job(
                    j.id,
                    JobGuard::status_in(&[j.status]).assigned_to(j.assigned_agent),
                    paused_patch(),
                ));
                if let (JobStatus::Running, Some(agent_id)) = (j.status, j.assigned_agent) {
                    batch.push(AgentRegistry::release(agent_id, j.id));
                    released.push((agent_id, j.id));
                }
            }

            if !self.store.apply(batch).await? {
                tracing::debug!(job_id = %job_id, "Pause raced with another update, retrying");
                continue;
            }

            tracing::info!(job_id = %job_id, released = released.len(), "Job paused");
            for (agent_id, id) in released {
                notify_stop(self.store.as_ref(), self.dispatcher.as_ref(), agent_id, id).await;
            }
            return self.load(job_id).await;
        }
        Err(FleetError::Internal(format!(
            "job {} kept changing while pausing",
            job_id
        )))
    }

    /// Return a paused job to pending so the scheduler can place it again.
    pub async fn resume(&self, job_id: Uuid) -> Result<Job> {
        for _ in 0..MAX_ATTEMPTS {
            let job = self.load(job_id).await?;
            if job.status != JobStatus::Paused {
                return Err(FleetError::InvalidTransition {
                    job_id,
                    status: job.status,
                    action: "resume",
                });
            }

            let mut batch = vec![Mutation::job(
                job.id,
                JobGuard::status_in(&[JobStatus::Paused]),
                JobPatch::status(JobStatus::Pending),
            )];
            for child in self.children_of(&job).await? {
                if child.status == JobStatus::Paused {
                    batch.push(Mutation::job(
                        child.id,
                        JobGuard::status_in(&[JobStatus::Paused]),
                        JobPatch::status(JobStatus::Pending),
                    ));
                }
            }

            if !self.store.apply(batch).await? {
                tracing::debug!(job_id = %job_id, "Resume raced with another update, retrying");
                continue;
            }
            tracing::info!(job_id = %job_id, "Job resumed");
            return self.load(job_id).await;
        }
        Err(FleetError::Internal(format!(
            "job {} kept changing while resuming",
            job_id
        )))
    }

    /// Delete a job that is not running. A master goes with its partitions.
    pub async fn delete(&self, job_id: Uuid) -> Result<()> {
        for _ in 0..MAX_ATTEMPTS {
            let job = self.load(job_id).await?;
            let children = self.children_of(&job).await?;

            if let Some(running) = std::iter::once(&job)
                .chain(children.iter())
                .find(|j| j.status == JobStatus::Running)
            {
                return Err(FleetError::InvalidTransition {
                    job_id,
                    status: running.status,
                    action: "delete",
                });
            }

            let mut batch: Vec<Mutation> = children
                .iter()
                .map(|c| Mutation::delete_job(c.id, JobGuard::status_in(&[c.status])))
                .collect();
            batch.push(Mutation::delete_job(
                job.id,
                JobGuard::status_in(&[job.status]),
            ));

            if !self.store.apply(batch).await? {
                tracing::debug!(job_id = %job_id, "Delete raced with another update, retrying");
                continue;
            }
            tracing::info!(job_id = %job_id, partitions = children.len(), "Job deleted");
            return Ok(());
        }
        Err(FleetError::Internal(format!(
            "job {} kept changing while deleting",
            job_id
        )))
    }
}
