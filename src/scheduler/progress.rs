//! Progress ingestion.
//!
//! Agents push reports for the job they hold. A report only counts while the
//! job is running on the reporting agent; anything else (a retried report
//! after completion, a report from an agent the job was taken from) is
//! stale and ignored. Progress and processed words only move forward.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EntityKind, FleetError, Result};
use crate::registry::AgentRegistry;
use crate::scheduler::dispatch::{notify_stop, AgentDispatcher};
use crate::scheduler::state::{settle_master, MAX_ATTEMPTS};
use crate::scheduler::{Job, JobStatus, TerminalReason};
use crate::store::{AgentGuard, AgentPatch, JobGuard, JobPatch, Mutation, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Running,
    /// A hash was cracked; `result` carries the plaintext.
    Found,
    /// The whole range was searched without a match.
    Exhausted,
    /// The agent could not run the job.
    Errored,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub status: ReportStatus,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub eta: Option<DateTime<Utc>>,
    /// Words processed within the job's range, when the agent counts them.
    /// Derived from `progress` otherwise.
    #[serde(default)]
    pub processed_words: Option<u64>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ProgressReport {
    pub fn running(progress: f64, speed: f64) -> Self {
        Self {
            status: ReportStatus::Running,
            progress,
            speed,
            eta: None,
            processed_words: None,
            result: None,
            error: None,
        }
    }

    pub fn found(result: impl Into<String>) -> Self {
        Self {
            status: ReportStatus::Found,
            progress: 1.0,
            result: Some(result.into()),
            ..Self::running(1.0, 0.0)
        }
    }

    pub fn exhausted() -> Self {
        Self {
            status: ReportStatus::Exhausted,
            ..Self::running(1.0, 0.0)
        }
    }

    pub fn errored(message: impl Into<String>) -> Self {
        Self {
            status: ReportStatus::Errored,
            error: Some(message.into()),
            ..Self::running(0.0, 0.0)
        }
    }

    pub fn with_eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    pub fn with_processed_words(mut self, words: u64) -> Self {
        self.processed_words = Some(words);
        self
    }

    fn validate(&self) -> Result<()> {
        if !self.progress.is_finite() || !(0.0..=1.0).contains(&self.progress) {
            return Err(FleetError::Validation(format!(
                "progress must be within [0, 1], got {}",
                self.progress
            )));
        }
        if !self.speed.is_finite() || self.speed < 0.0 {
            return Err(FleetError::Validation(format!(
                "speed must be non-negative, got {}",
                self.speed
            )));
        }
        if self.status == ReportStatus::Found
            && self.result.as_deref().map_or(true, str::is_empty)
        {
            return Err(FleetError::Validation(
                "a found report must carry the result".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportOutcome {
    /// Progress stored.
    Accepted,
    /// The job reached a terminal state and its agent was released.
    Finished,
    /// The job is not running on the reporting agent; nothing changed.
    Stale,
}

/// Rolled-up view of a master's partitions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggregate {
    /// Range-weighted mean of partition progress.
    pub progress: f64,
    /// Sum over running partitions.
    pub speed: f64,
    /// Latest estimate among running partitions.
    pub eta: Option<DateTime<Utc>>,
    pub processed_words: u64,
}

pub fn aggregate(children: &[Job]) -> Aggregate {
    let weight = |j: &Job| j.range_len().max(1) as f64;
    let total: f64 = children.iter().map(weight).sum();
    let progress = if total > 0.0 {
        children.iter().map(|j| weight(j) * j.progress).sum::<f64>() / total
    } else {
        0.0
    };
    let running = || children.iter().filter(|j| j.status == JobStatus::Running);

    Aggregate {
        progress: progress.clamp(0.0, 1.0),
        speed: running().map(|j| j.speed).sum(),
        eta: running().filter_map(|j| j.eta).max(),
        processed_words: children.iter().map(|j| j.processed_words).sum(),
    }
}

fn running_on(agent_id: Uuid) -> JobGuard {
    JobGuard::status_in(&[JobStatus::Running]).assigned_to(Some(agent_id))
}

/// Ingests agent reports and applies their effects on job, master and
/// siblings in one guarded batch per report.
#[derive(Clone)]
pub struct ProgressAggregator {
    store: Arc<dyn Store>,
    dispatcher: Arc<dyn AgentDispatcher>,
}

impl ProgressAggregator {
    pub fn new(store: Arc<dyn Store>, dispatcher: Arc<dyn AgentDispatcher>) -> Self {
        Self { store, dispatcher }
    }

    pub async fn report(
        &self,
        job_id: Uuid,
        agent_id: Uuid,
        report: ProgressReport,
    ) -> Result<ReportOutcome> {
        self.report_at(job_id, agent_id, report, Utc::now()).await
    }

    pub async fn report_at(
        &self,
        job_id: Uuid,
        agent_id: Uuid,
        report: ProgressReport,
        now: DateTime<Utc>,
    ) -> Result<ReportOutcome> {
        report.validate()?;
        if self.store.get_agent(agent_id).await?.is_none() {
            return Err(FleetError::not_found(EntityKind::Agent, agent_id));
        }

        for _ in 0..MAX_ATTEMPTS {
            let job = self
                .store
                .get_job(job_id)
                .await?
                .ok_or_else(|| FleetError::not_found(EntityKind::Job, job_id))?;
            if job.status != JobStatus::Running || job.assigned_agent != Some(agent_id) {
                tracing::debug!(
                    job_id = %job_id,
                    agent_id = %agent_id,
                    status = %job.status,
                    "Ignoring stale report"
                );
                return Ok(ReportOutcome::Stale);
            }

            let master = match job.parent_id {
                Some(master_id) => self.store.get_job(master_id).await?,
                None => None,
            };
            let siblings = match &master {
                Some(m) => self.store.children(m.id).await?,
                None => Vec::new(),
            };

            let mut stops = Vec::new();
            let (batch, outcome) = match report.status {
                ReportStatus::Running => (
                    progress_batch(&job, master.as_ref(), &siblings, &report, agent_id, now),
                    ReportOutcome::Accepted,
                ),
                ReportStatus::Found => (
                    found_batch(&job, master.as_ref(), &siblings, &report, agent_id, now, &mut stops),
                    ReportOutcome::Finished,
                ),
                ReportStatus::Exhausted | ReportStatus::Errored => (
                    unsuccessful_batch(&job, master.as_ref(), &siblings, &report, agent_id, now),
                    ReportOutcome::Finished,
                ),
            };

            if !self.store.apply(batch).await? {
                tracing::debug!(job_id = %job_id, "Report raced with another update, retrying");
                continue;
            }

            match report.status {
                ReportStatus::Running => {
                    tracing::trace!(
                        job_id = %job_id,
                        progress = report.progress,
                        speed = report.speed,
                        "Progress"
                    );
                }
                ReportStatus::Found => {
                    tracing::info!(
                        job_id = %job_id,
                        agent_id = %agent_id,
                        master_id = ?master.as_ref().map(|m| m.id),
                        superseded = stops.len(),
                        "Result found"
                    );
                }
                ReportStatus::Exhausted => {
                    tracing::info!(job_id = %job_id, agent_id = %agent_id, "Keyspace exhausted");
                }
                ReportStatus::Errored => {
                    tracing::warn!(
                        job_id = %job_id,
                        agent_id = %agent_id,
                        error = report.error.as_deref().unwrap_or(""),
                        "Agent reported failure"
                    );
                }
            }

            for (agent, job) in stops {
                notify_stop(self.store.as_ref(), self.dispatcher.as_ref(), agent, job).await;
            }
            return Ok(outcome);
        }

        Err(FleetError::Internal(format!(
            "job {} kept changing while applying a report",
            job_id
        )))
    }
}

fn processed_words(job: &Job, report: &ProgressReport) -> u64 {
    let len = job.range_len();
    report
        .processed_words
        .unwrap_or_else(|| (report.progress * len as f64).floor() as u64)
        .min(len)
}

fn progress_batch(
    job: &Job,
    master: Option<&Job>,
    siblings: &[Job],
    report: &ProgressReport,
    agent_id: Uuid,
    now: DateTime<Utc>,
) -> Vec<Mutation> {
    let patch = JobPatch {
        raise_progress: Some(report.progress),
        raise_processed: Some(processed_words(job, report)),
        speed: Some(report.speed),
        eta: Some(report.eta),
        ..Default::default()
    };

    let mut batch = vec![
        Mutation::job(job.id, running_on(agent_id), patch.clone()),
        Mutation::agent(
            agent_id,
            AgentGuard::any().holding(Some(job.id)),
            AgentPatch {
                last_heartbeat: Some(now),
                ..Default::default()
            },
        )
        .optional(),
    ];

    if let Some(master) = master {
        let updated: Vec<Job> = siblings
            .iter()
            .cloned()
            .map(|mut j| {
                if j.id == job.id {
                    patch.apply(&mut j);
                }
                j
            })
            .collect();
        let agg = aggregate(&updated);
        batch.push(
            Mutation::job(
                master.id,
                JobGuard::status_in(&[JobStatus::Running]),
                JobPatch {
                    raise_progress: Some(agg.progress),
                    raise_processed: Some(agg.processed_words),
                    speed: Some(agg.speed),
                    eta: Some(agg.eta),
                    ..Default::default()
                },
            )
            .optional(),
        );
    }
    batch
}

fn found_batch(
    job: &Job,
    master: Option<&Job>,
    siblings: &[Job],
    report: &ProgressReport,
    agent_id: Uuid,
    now: DateTime<Utc>,
    stops: &mut Vec<(Uuid, Uuid)>,
) -> Vec<Mutation> {
    let done = |words: u64| JobPatch {
        status: Some(JobStatus::Completed),
        raise_progress: Some(1.0),
        raise_processed: Some(words),
        speed: Some(0.0),
        eta: Some(None),
        result: report.result.clone(),
        completed_at: Some(now),
        ..Default::default()
    };

    let mut batch = vec![
        Mutation::job(job.id, running_on(agent_id), done(job.range_len())),
        AgentRegistry::release(agent_id, job.id).optional(),
    ];

    let Some(master) = master else {
        return batch;
    };

    // Exactly one partition can move the master out of running.
    batch.push(Mutation::job(
        master.id,
        JobGuard::status_in(&[JobStatus::Running]),
        done(master.total_words),
    ));

    for sibling in siblings.iter().filter(|s| s.id != job.id && !s.status.is_terminal()) {
        batch.push(Mutation::job(
            sibling.id,
            JobGuard::status_in(&[sibling.status]).assigned_to(sibling.assigned_agent),
            JobPatch {
                status: Some(JobStatus::Failed),
                reason: Some(TerminalReason::Superseded),
                speed: Some(0.0),
                eta: Some(None),
                completed_at: Some(now),
                ..Default::default()
            },
        ));
        if let (JobStatus::Running, Some(holder)) = (sibling.status, sibling.assigned_agent) {
            batch.push(AgentRegistry::release(holder, sibling.id).optional());
            stops.push((holder, sibling.id));
        }
    }
    batch
}

fn unsuccessful_batch(
    job: &Job,
    master: Option<&Job>,
    siblings: &[Job],
    report: &ProgressReport,
    agent_id: Uuid,
    now: DateTime<Utc>,
) -> Vec<Mutation> {
    let (patch, reason) = if report.status == ReportStatus::Exhausted {
        let patch = JobPatch {
            status: Some(JobStatus::Completed),
            raise_progress: Some(1.0),
            raise_processed: Some(job.range_len()),
            reason: Some(TerminalReason::Exhausted),
            speed: Some(0.0),
            eta: Some(None),
            completed_at: Some(now),
            ..Default::default()
        };
        (patch, TerminalReason::Exhausted)
    } else {
        let patch = JobPatch {
            status: Some(JobStatus::Failed),
            reason: Some(TerminalReason::AgentError),
            error: Some(
                report
                    .error
                    .clone()
                    .unwrap_or_else(|| "agent reported an error".to_string()),
            ),
            speed: Some(0.0),
            eta: Some(None),
            completed_at: Some(now),
            ..Default::default()
        };
        (patch, TerminalReason::AgentError)
    };

    let mut batch = vec![
        Mutation::job(job.id, running_on(agent_id), patch),
        AgentRegistry::release(agent_id, job.id).optional(),
    ];
    if let Some(master) = master {
        batch.extend(settle_master(master, siblings, job.id, reason, now));
    }
    batch
}
