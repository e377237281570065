pub mod agent;
pub mod capability;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::error::{EntityKind, FleetError, Result};
use crate::scheduler::state;
use crate::scheduler::{JobStatus, TerminalReason};
use crate::store::{AgentGuard, AgentPatch, JobGuard, Mutation, Store};

pub use agent::{Agent, AgentStatus, NewAgent};
pub use capability::CapabilitySet;

/// What a staleness sweep did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    /// Agents marked offline.
    pub offline: Vec<Uuid>,
    /// Jobs returned to pending after losing their agent.
    pub requeued: Vec<Uuid>,
    /// Jobs failed because their requeue budget was spent.
    pub failed: Vec<Uuid>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.offline.is_empty()
    }
}

enum Eviction {
    Idle,
    Requeued(Uuid),
    Failed(Uuid),
}

/// Tracks known agents and their liveness.
///
/// Holds no agent state of its own; every call reads from or writes to the
/// store. Busy/online toggles are not exposed as standalone writes: callers
/// fold [`AgentRegistry::mark_busy`] and [`AgentRegistry::release`] into the
/// same batch that moves the job.
#[derive(Clone)]
pub struct AgentRegistry {
    store: Arc<dyn Store>,
    config: CoordinatorConfig,
}

impl AgentRegistry {
    pub fn new(store: Arc<dyn Store>, config: CoordinatorConfig) -> Self {
        Self { store, config }
    }

    pub async fn register(&self, req: NewAgent) -> Result<Agent> {
        self.register_at(req, Utc::now()).await
    }

    pub async fn register_at(&self, req: NewAgent, now: DateTime<Utc>) -> Result<Agent> {
        validate_registration(&req)?;

        let agent = Agent::from_registration(req, now);
        self.store.insert_agent(&agent).await?;

        tracing::info!(
            agent_id = %agent.id,
            name = %agent.name,
            endpoint = %agent.endpoint(),
            capabilities = %agent.capabilities,
            "Agent registered"
        );
        Ok(agent)
    }

    pub async fn heartbeat(&self, agent_id: Uuid) -> Result<Agent> {
        self.heartbeat_at(agent_id, Utc::now()).await
    }

    /// Record a heartbeat. An offline agent comes back online; an unknown
    /// agent is `NotFound` and is not registered implicitly.
    pub async fn heartbeat_at(&self, agent_id: Uuid, now: DateTime<Utc>) -> Result<Agent> {
        let before = self.get(agent_id).await?;

        let touched = self
            .store
            .apply(vec![
                Mutation::agent(
                    agent_id,
                    AgentGuard::any(),
                    AgentPatch {
                        last_heartbeat: Some(now),
                        ..Default::default()
                    },
                ),
                Mutation::agent(
                    agent_id,
                    AgentGuard::status_in(&[AgentStatus::Offline]),
                    AgentPatch {
                        status: Some(AgentStatus::Online),
                        ..Default::default()
                    },
                )
                .optional(),
            ])
            .await?;
        if !touched {
            return Err(FleetError::not_found(EntityKind::Agent, agent_id));
        }

        if before.status == AgentStatus::Offline {
            tracing::info!(agent_id = %agent_id, name = %before.name, "Agent back online");
        } else {
            tracing::trace!(agent_id = %agent_id, "Heartbeat");
        }
        self.get(agent_id).await
    }

    pub async fn get(&self, agent_id: Uuid) -> Result<Agent> {
        self.store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| FleetError::not_found(EntityKind::Agent, agent_id))
    }

    pub async fn list(&self) -> Result<Vec<Agent>> {
        self.list_at(Utc::now()).await
    }

    /// Every agent, with those silent past the heartbeat timeout reported
    /// offline even before a sweep has recorded it. A silent agent's job is
    /// still shown until the sweep requeues it.
    pub async fn list_at(&self, now: DateTime<Utc>) -> Result<Vec<Agent>> {
        let timeout = self.config.heartbeat_timeout();
        Ok(self
            .store
            .list_agents()
            .await?
            .into_iter()
            .map(|mut a| {
                a.status = a.effective_status(now, timeout);
                a
            })
            .collect())
    }

    /// Online agents with no job and a fresh heartbeat, in registration order.
    pub async fn list_idle(&self) -> Result<Vec<Agent>> {
        self.list_idle_at(Utc::now()).await
    }

    pub async fn list_idle_at(&self, now: DateTime<Utc>) -> Result<Vec<Agent>> {
        let timeout = self.config.heartbeat_timeout();
        Ok(self
            .store
            .list_agents()
            .await?
            .into_iter()
            .filter(|a| a.is_idle(now, timeout))
            .collect())
    }

    /// Idle agents able to run `hash_type` with `attack_mode`.
    pub async fn list_available(&self, hash_type: u32, attack_mode: u32) -> Result<Vec<Agent>> {
        Ok(self
            .list_idle()
            .await?
            .into_iter()
            .filter(|a| a.supports(hash_type, attack_mode))
            .collect())
    }

    /// Remove an agent. Refused while it holds a job, or while an unfinished
    /// job is placed on it explicitly, since no other agent could take that
    /// job.
    pub async fn deregister(&self, agent_id: Uuid) -> Result<()> {
        let agent = self.get(agent_id).await?;
        if let Some(job_id) = agent.current_job {
            return Err(FleetError::AgentBusy { agent_id, job_id });
        }
        let pinned = self
            .store
            .list_jobs()
            .await?
            .into_iter()
            .find(|j| j.preferred_agent == Some(agent_id) && !j.status.is_terminal());
        if let Some(job) = pinned {
            return Err(FleetError::AgentPinned {
                agent_id,
                job_id: job.id,
            });
        }
        if !self.store.delete_agent(agent_id).await? {
            let agent = self.get(agent_id).await?;
            if let Some(job_id) = agent.current_job {
                return Err(FleetError::AgentBusy { agent_id, job_id });
            }
            return Err(FleetError::not_found(EntityKind::Agent, agent_id));
        }
        tracing::info!(agent_id = %agent_id, name = %agent.name, "Agent deregistered");
        Ok(())
    }

    /// Claim half of an assignment: `agent_id` goes from idle to busy with
    /// `job_id`.
    pub fn mark_busy(agent_id: Uuid, job_id: Uuid) -> Mutation {
        Mutation::agent(
            agent_id,
            AgentGuard::status_in(&[AgentStatus::Online]).holding(None),
            AgentPatch::bind(job_id),
        )
    }

    /// Release half of an assignment: `agent_id` drops `job_id` and is online
    /// again.
    pub fn release(agent_id: Uuid, job_id: Uuid) -> Mutation {
        Mutation::agent(
            agent_id,
            AgentGuard::any().holding(Some(job_id)),
            AgentPatch::release(),
        )
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Mark agents silent beyond the heartbeat timeout offline and recover
    /// the jobs they held.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let cutoff = now - self.config.heartbeat_timeout();
        let mut report = SweepReport::default();

        for agent in self.store.list_agents().await? {
            if agent.status == AgentStatus::Offline || agent.last_heartbeat >= cutoff {
                continue;
            }
            let Some(eviction) = self.evict(&agent, cutoff, now).await? else {
                continue;
            };
            report.offline.push(agent.id);
            match eviction {
                Eviction::Idle => {}
                Eviction::Requeued(job_id) => report.requeued.push(job_id),
                Eviction::Failed(job_id) => report.failed.push(job_id),
            }
        }

        if !report.is_empty() {
            tracing::info!(
                offline = report.offline.len(),
                requeued = report.requeued.len(),
                failed = report.failed.len(),
                "Staleness sweep"
            );
        }
        Ok(report)
    }

    async fn evict(
        &self,
        agent: &Agent,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Eviction>> {
        let mut batch = vec![Mutation::agent(
            agent.id,
            AgentGuard::status_in(&[agent.status])
                .holding(agent.current_job)
                .silent_since(cutoff),
            AgentPatch {
                status: Some(AgentStatus::Offline),
                current_job: Some(None),
                last_heartbeat: None,
            },
        )];
        let mut eviction = Eviction::Idle;

        if let Some(job_id) = agent.current_job {
            let job = self
                .store
                .get_job(job_id)
                .await?
                .filter(|j| j.status == JobStatus::Running && j.assigned_agent == Some(agent.id));

            if let Some(job) = job {
                let (patch, requeued) = state::lost_agent_patch(&job, &self.config, now);
                batch.push(Mutation::job(
                    job.id,
                    JobGuard::status_in(&[JobStatus::Running]).assigned_to(Some(agent.id)),
                    patch,
                ));

                if requeued {
                    eviction = Eviction::Requeued(job.id);
                } else {
                    if let Some(master_id) = job.parent_id {
                        if let Some(master) = self.store.get_job(master_id).await? {
                            let children = self.store.children(master_id).await?;
                            batch.extend(state::settle_master(
                                &master,
                                &children,
                                job.id,
                                TerminalReason::AgentLost,
                                now,
                            ));
                        }
                    }
                    eviction = Eviction::Failed(job.id);
                }
            }
        }

        if !self.store.apply(batch).await? {
            tracing::debug!(agent_id = %agent.id, "Agent changed during sweep, skipping");
            return Ok(None);
        }

        match &eviction {
            Eviction::Idle => {
                tracing::warn!(agent_id = %agent.id, name = %agent.name, "Agent offline");
            }
            Eviction::Requeued(job_id) => {
                tracing::warn!(
                    agent_id = %agent.id,
                    job_id = %job_id,
                    "Agent offline, job requeued"
                );
            }
            Eviction::Failed(job_id) => {
                tracing::warn!(
                    agent_id = %agent.id,
                    job_id = %job_id,
                    "Agent offline, job failed after exhausting requeues"
                );
            }
        }
        Ok(Some(eviction))
    }
}

fn validate_registration(req: &NewAgent) -> Result<()> {
    if req.name.trim().is_empty() {
        return Err(FleetError::Validation("agent name is required".into()));
    }
    if req.address.trim().is_empty() {
        return Err(FleetError::Validation("agent address is required".into()));
    }
    if req.port == 0 {
        return Err(FleetError::Validation("agent port must be non-zero".into()));
    }
    if req.registration_key.is_empty() {
        return Err(FleetError::Validation("registration key is required".into()));
    }
    if let Some(t) = req.throughput {
        if !t.is_finite() || t <= 0.0 {
            return Err(FleetError::Validation(format!(
                "throughput must be a positive number, got {}",
                t
            )));
        }
    }
    CapabilitySet::parse(&req.capabilities)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(name: &str) -> NewAgent {
        NewAgent {
            name: name.to_string(),
            address: "10.0.0.5".to_string(),
            port: 8080,
            capabilities: "hash=0,1000".to_string(),
            throughput: None,
            registration_key: format!("key-{}", name),
        }
    }

    #[test]
    fn test_registration_validation() {
        assert!(validate_registration(&req("rig1")).is_ok());

        let mut bad = req("");
        assert!(validate_registration(&bad).is_err());

        bad = req("rig1");
        bad.capabilities = "hash=sha1".into();
        assert!(validate_registration(&bad).is_err());

        bad = req("rig1");
        bad.throughput = Some(f64::NAN);
        assert!(validate_registration(&bad).is_err());

        bad = req("rig1");
        bad.registration_key.clear();
        assert!(validate_registration(&bad).is_err());
    }

    #[test]
    fn test_claim_and_release_mutations() {
        let agent = Uuid::new_v4();
        let job = Uuid::new_v4();

        match AgentRegistry::mark_busy(agent, job) {
            Mutation::Agent { id, guard, patch, required } => {
                assert_eq!(id, agent);
                assert!(required);
                assert_eq!(guard.statuses, vec![AgentStatus::Online]);
                assert_eq!(guard.current_job, Some(None));
                assert_eq!(patch, AgentPatch::bind(job));
            }
            other => panic!("unexpected mutation {:?}", other),
        }

        match AgentRegistry::release(agent, job) {
            Mutation::Agent { guard, patch, .. } => {
                assert_eq!(guard.current_job, Some(Some(job)));
                assert_eq!(patch, AgentPatch::release());
            }
            other => panic!("unexpected mutation {:?}", other),
        }
    }
}
