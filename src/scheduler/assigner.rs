use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::error::Result;
use crate::registry::{Agent, AgentRegistry};
use crate::scheduler::dispatch::{AgentDispatcher, WorkOrder};
use crate::scheduler::{Job, JobStatus};
use crate::store::{JobGuard, JobPatch, Mutation, Store};

/// Outcome of one scheduling pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassReport {
    /// (job, agent) pairs claimed and dispatched.
    pub assigned: Vec<(Uuid, Uuid)>,
    /// Claims lost to a concurrent writer.
    pub races: usize,
    /// Claims rolled back because the work order did not reach the agent.
    pub dispatch_failures: usize,
}

enum Claim {
    Dispatched,
    Lost,
    RolledBack,
}

/// Matches pending work to idle agents.
///
/// A pass walks claimable jobs oldest first and pairs each with an idle,
/// capable agent. The pairing is a single guarded batch (job pending and
/// unbound, agent online and free), so concurrent passes can never bind a
/// job or an agent twice; the loser just moves on.
#[derive(Clone)]
pub struct JobAssigner {
    store: Arc<dyn Store>,
    dispatcher: Arc<dyn AgentDispatcher>,
    config: CoordinatorConfig,
}

impl JobAssigner {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Arc<dyn AgentDispatcher>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            config,
        }
    }

    pub async fn run_pass(&self) -> Result<PassReport> {
        self.run_pass_at(Utc::now()).await
    }

    pub async fn run_pass_at(&self, now: DateTime<Utc>) -> Result<PassReport> {
        let mut report = PassReport::default();

        let jobs = self.store.claimable_jobs().await?;
        if jobs.is_empty() {
            return Ok(report);
        }

        let timeout = self.config.heartbeat_timeout();
        let idle: Vec<Agent> = self
            .store
            .list_agents()
            .await?
            .into_iter()
            .filter(|a| a.is_idle(now, timeout))
            .collect();
        let mut taken: HashSet<Uuid> = HashSet::new();

        for job in &jobs {
            if taken.len() == idle.len() {
                break;
            }
            let Some(agent) = pick_agent(job, &idle, &taken) else {
                continue;
            };
            // Whatever happens to the claim, this agent is done for this pass.
            taken.insert(agent.id);

            match self.claim_and_dispatch(job, agent, now).await? {
                Claim::Dispatched => report.assigned.push((job.id, agent.id)),
                Claim::Lost => report.races += 1,
                Claim::RolledBack => report.dispatch_failures += 1,
            }
        }

        if !report.assigned.is_empty() || report.dispatch_failures > 0 {
            tracing::debug!(
                assigned = report.assigned.len(),
                races = report.races,
                dispatch_failures = report.dispatch_failures,
                "Scheduling pass"
            );
        }
        Ok(report)
    }

    /// Give `agent_id` the oldest job it can run, if it is idle.
    ///
    /// Used right after an agent registers or frees up, so it does not wait
    /// for the next periodic pass. Returns the job it was given.
    pub async fn assign_agent(&self, agent_id: Uuid) -> Result<Option<Uuid>> {
        let now = Utc::now();
        for _ in 0..super::state::MAX_ATTEMPTS {
            let Some(agent) = self.store.get_agent(agent_id).await? else {
                return Ok(None);
            };
            if !agent.is_idle(now, self.config.heartbeat_timeout()) {
                return Ok(None);
            }
            let Some(job) = self.store.next_job_for_agent(&agent).await? else {
                return Ok(None);
            };

            match self.claim_and_dispatch(&job, &agent, now).await? {
                Claim::Dispatched => return Ok(Some(job.id)),
                Claim::Lost => continue,
                Claim::RolledBack => return Ok(None),
            }
        }
        Ok(None)
    }

    async fn claim_and_dispatch(
        &self,
        job: &Job,
        agent: &Agent,
        now: DateTime<Utc>,
    ) -> Result<Claim> {
        let mut claim = vec![
            Mutation::job(
                job.id,
                JobGuard::status_in(&[JobStatus::Pending]).assigned_to(None),
                JobPatch {
                    status: Some(JobStatus::Running),
                    assigned_agent: Some(Some(agent.id)),
                    ..Default::default()
                },
            ),
            AgentRegistry::mark_busy(agent.id, job.id),
        ];
        if let Some(master_id) = job.parent_id {
            claim.push(
                Mutation::job(
                    master_id,
                    JobGuard::status_in(&[JobStatus::Pending]),
                    JobPatch {
                        status: Some(JobStatus::Running),
                        stamp_started: Some(now),
                        ..Default::default()
                    },
                )
                .optional(),
            );
        }

        if !self.store.apply(claim).await? {
            tracing::debug!(
                job_id = %job.id,
                agent_id = %agent.id,
                "Claim lost to a concurrent writer"
            );
            return Ok(Claim::Lost);
        }

        let dispatch = self.dispatcher.dispatch(agent, WorkOrder::for_job(job));
        let delivered = match tokio::time::timeout(self.config.dispatch_timeout(), dispatch).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "no acknowledgment within {}ms",
                self.config.dispatch_timeout_ms
            )),
        };

        if let Err(message) = delivered {
            tracing::warn!(
                job_id = %job.id,
                agent_id = %agent.id,
                error = %message,
                "Dispatch failed, releasing claim"
            );
            let rolled_back = self
                .store
                .apply(vec![
                    Mutation::job(
                        job.id,
                        JobGuard::status_in(&[JobStatus::Running]).assigned_to(Some(agent.id)),
                        JobPatch {
                            status: Some(JobStatus::Pending),
                            assigned_agent: Some(None),
                            ..Default::default()
                        },
                    ),
                    AgentRegistry::release(agent.id, job.id).optional(),
                ])
                .await?;
            if !rolled_back {
                tracing::debug!(job_id = %job.id, "Job moved on before rollback");
            } else if let Some(master_id) = job.parent_id {
                self.release_master(master_id).await?;
            }
            return Ok(Claim::RolledBack);
        }

        self.store
            .apply(vec![Mutation::job(
                job.id,
                JobGuard::status_in(&[JobStatus::Running]).assigned_to(Some(agent.id)),
                JobPatch {
                    stamp_started: Some(now),
                    ..Default::default()
                },
            )])
            .await?;

        tracing::info!(
            job_id = %job.id,
            agent_id = %agent.id,
            agent = %agent.name,
            skip = job.resume_offset(),
            "Job assigned"
        );
        Ok(Claim::Dispatched)
    }

    /// Put a master back to pending after a failed partition dispatch, unless
    /// some partition has moved on since.
    ///
    /// Every partition is asserted pending in the same batch, so a sibling
    /// claimed concurrently keeps the master running. The start time is
    /// cleared only if no partition ever started.
    async fn release_master(&self, master_id: Uuid) -> Result<()> {
        let children = self.store.children(master_id).await?;
        if children.iter().any(|c| c.status != JobStatus::Pending) {
            return Ok(());
        }

        let mut batch: Vec<Mutation> = children
            .iter()
            .map(|c| {
                Mutation::job(
                    c.id,
                    JobGuard::status_in(&[JobStatus::Pending]),
                    JobPatch::default(),
                )
            })
            .collect();
        batch.push(Mutation::job(
            master_id,
            JobGuard::status_in(&[JobStatus::Running]),
            JobPatch {
                status: Some(JobStatus::Pending),
                clear_started: children.iter().all(|c| c.started_at.is_none()),
                ..Default::default()
            },
        ));

        if self.store.apply(batch).await? {
            tracing::info!(job_id = %master_id, "Distributed job back to pending");
        }
        Ok(())
    }
}

/// Agent for `job` among `idle`, skipping those already `taken`.
///
/// An explicit placement only ever matches that agent. Otherwise the agent
/// a partition was sized for wins if it is free, then the first capable one.
fn pick_agent<'a>(job: &Job, idle: &'a [Agent], taken: &HashSet<Uuid>) -> Option<&'a Agent> {
    let free = |a: &&Agent| !taken.contains(&a.id) && a.supports(job.hash_type, job.attack_mode);

    if let Some(preferred) = job.preferred_agent {
        return idle.iter().filter(free).find(|a| a.id == preferred);
    }
    if let Some(affinity) = job.affinity {
        if let Some(agent) = idle.iter().filter(free).find(|a| a.id == affinity) {
            return Some(agent);
        }
    }
    idle.iter().find(free)
}
