//! Entry points for the transport layer.
//!
//! Requests arrive with identifiers as strings; everything is validated and
//! resolved before the first write, so a rejected request leaves no trace.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{CoordinatorConfig, DistributionPolicy};
use crate::error::{EntityKind, FleetError, Result};
use crate::registry::{Agent, AgentRegistry, NewAgent, SweepReport};
use crate::scheduler::progress::aggregate;
use crate::scheduler::{
    keyspace, AgentDispatcher, Job, JobAssigner, JobKind, JobSpec, JobStateMachine, KeyspaceRange,
    PassReport, ProgressAggregator, ProgressReport, ReportOutcome,
};
use crate::store::{HashFile, Store, Wordlist};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub name: String,
    pub hash_type: i64,
    pub attack_mode: i64,
    pub hash_file_id: String,
    /// Wordlist name or identifier.
    #[serde(default)]
    pub wordlist: String,
    /// Takes precedence over `wordlist` when set.
    #[serde(default)]
    pub wordlist_id: Option<String>,
    /// Run only on this agent.
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub rules: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DistributedJobRequest {
    #[serde(flatten)]
    pub job: CreateJobRequest,
    /// Partition count when agents are chosen automatically.
    #[serde(default)]
    pub partitions: Option<usize>,
    /// Agents to split across, one partition each.
    #[serde(default)]
    pub agents: Vec<String>,
}

/// A created distributed job. When the request degraded to a plain job,
/// `master` is that job and `partitions` is empty.
#[derive(Debug, Clone, Serialize)]
pub struct DistributedJob {
    pub master: Job,
    pub partitions: Vec<Job>,
}

/// A job as reported to clients. For a master, progress, speed and ETA are
/// rolled up from `partitions`.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: Job,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub partitions: Vec<Job>,
}

fn parse_id(kind: EntityKind, raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| FleetError::Validation(format!("malformed {} id '{}'", kind, raw)))
}

fn non_negative(field: &str, value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        FleetError::Validation(format!("{} must be a non-negative integer, got {}", field, value))
    })
}

pub struct Coordinator {
    store: Arc<dyn Store>,
    config: CoordinatorConfig,
    registry: AgentRegistry,
    assigner: JobAssigner,
    progress: ProgressAggregator,
    states: JobStateMachine,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Arc<dyn AgentDispatcher>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            registry: AgentRegistry::new(store.clone(), config.clone()),
            assigner: JobAssigner::new(store.clone(), dispatcher.clone(), config.clone()),
            progress: ProgressAggregator::new(store.clone(), dispatcher.clone()),
            states: JobStateMachine::new(store.clone(), dispatcher),
            store,
            config,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn assigner(&self) -> &JobAssigner {
        &self.assigner
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    pub async fn create_job(&self, req: CreateJobRequest) -> Result<Job> {
        let spec = self.resolve(&req).await?;
        let job = Job::new(spec);
        self.store.insert_jobs(std::slice::from_ref(&job)).await?;

        tracing::info!(
            job_id = %job.id,
            name = %job.name,
            hash_type = job.hash_type,
            attack_mode = job.attack_mode,
            total_words = job.total_words,
            preferred_agent = ?job.preferred_agent,
            "Job created"
        );
        Ok(job)
    }

    pub async fn create_distributed_job(&self, req: DistributedJobRequest) -> Result<DistributedJob> {
        let spec = self.resolve(&req.job).await?;
        if spec.preferred_agent.is_some() {
            return Err(FleetError::Validation(
                "a distributed job is placed with `agents`, not `agent_id`".into(),
            ));
        }

        let mut seen = HashSet::new();
        let mut explicit = Vec::new();
        for raw in &req.agents {
            let id = parse_id(EntityKind::Agent, raw)?;
            if seen.insert(id) {
                explicit.push(id);
            }
        }

        let requested = match (explicit.len(), req.partitions) {
            (0, Some(n)) => n,
            (0, None) => {
                return Err(FleetError::Validation(
                    "either partitions or agents is required".into(),
                ))
            }
            (n, Some(p)) if p != n => {
                return Err(FleetError::Validation(format!(
                    "{} partitions requested for {} agents",
                    p, n
                )))
            }
            (n, _) => n,
        };
        if requested == 0 {
            return Err(FleetError::Validation("partitions must be at least 1".into()));
        }

        let mut targets = Vec::with_capacity(explicit.len());
        for id in explicit {
            let agent = self.registry.get(id).await?;
            if !agent.supports(spec.hash_type, spec.attack_mode) {
                return Err(FleetError::Validation(format!(
                    "agent {} cannot run hash type {} with attack mode {}",
                    agent.name, spec.hash_type, spec.attack_mode
                )));
            }
            targets.push(agent);
        }

        if requested == 1 {
            return match self.config.distribution {
                DistributionPolicy::Degrade => {
                    let mut spec = spec;
                    spec.preferred_agent = targets.first().map(|a| a.id);
                    let job = Job::new(spec);
                    self.store.insert_jobs(std::slice::from_ref(&job)).await?;
                    tracing::info!(
                        job_id = %job.id,
                        preferred_agent = ?job.preferred_agent,
                        "Single-partition request created as a plain job"
                    );
                    Ok(DistributedJob {
                        master: job,
                        partitions: Vec::new(),
                    })
                }
                DistributionPolicy::Reject => Err(FleetError::Validation(
                    "a distributed job needs at least two partitions".into(),
                )),
            };
        }

        if targets.is_empty() {
            targets = self.pick_targets(&spec, requested).await?;
        }

        let ranges: Vec<Option<KeyspaceRange>> = if spec.total_words == 0 {
            vec![None]
        } else if targets.is_empty() {
            vec![Some(KeyspaceRange::new(0, spec.total_words))]
        } else {
            let weights: Vec<f64> = targets.iter().map(Agent::weight).collect();
            keyspace::split(spec.total_words, &weights)
                .into_iter()
                .map(Some)
                .collect()
        };

        let master = Job::master(spec);
        let partitions: Vec<Job> = ranges
            .into_iter()
            .enumerate()
            .map(|(i, range)| {
                Job::partition_of(&master, i, range, targets.get(i).map(|a| a.id))
            })
            .collect();

        let mut rows = Vec::with_capacity(partitions.len() + 1);
        rows.push(master.clone());
        rows.extend(partitions.iter().cloned());
        self.store.insert_jobs(&rows).await?;

        tracing::info!(
            job_id = %master.id,
            name = %master.name,
            partitions = partitions.len(),
            requested,
            total_words = master.total_words,
            "Distributed job created"
        );
        Ok(DistributedJob { master, partitions })
    }

    /// The `count` fastest idle capable agents, or none when fewer are
    /// available (the job then runs as a single partition).
    async fn pick_targets(&self, spec: &JobSpec, count: usize) -> Result<Vec<Agent>> {
        let mut available = self
            .registry
            .list_available(spec.hash_type, spec.attack_mode)
            .await?;
        if available.len() < count {
            tracing::info!(
                requested = count,
                available = available.len(),
                "Not enough idle agents, using a single partition"
            );
            return Ok(Vec::new());
        }
        available.sort_by(|a, b| b.weight().total_cmp(&a.weight()));
        available.truncate(count);
        Ok(available)
    }

    async fn resolve(&self, req: &CreateJobRequest) -> Result<JobSpec> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(FleetError::Validation("job name is required".into()));
        }
        let hash_type = non_negative("hash_type", req.hash_type)?;
        let attack_mode = non_negative("attack_mode", req.attack_mode)?;

        if req.hash_file_id.trim().is_empty() {
            return Err(FleetError::Validation("hash file is required".into()));
        }
        let hash_file = self.resolve_hash_file(&req.hash_file_id).await?;
        let wordlist = self.resolve_wordlist(req).await?;

        let preferred_agent = match req.agent_id.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(raw) => {
                let agent = self.registry.get(parse_id(EntityKind::Agent, raw)?).await?;
                if !agent.supports(hash_type, attack_mode) {
                    return Err(FleetError::Validation(format!(
                        "agent {} cannot run hash type {} with attack mode {}",
                        agent.name, hash_type, attack_mode
                    )));
                }
                Some(agent.id)
            }
            None => None,
        };

        Ok(JobSpec {
            name: name.to_string(),
            hash_type,
            attack_mode,
            hash_file_id: hash_file.id,
            wordlist_id: wordlist.id,
            rules: req.rules.clone().filter(|r| !r.trim().is_empty()),
            preferred_agent,
            total_words: wordlist.word_count.unwrap_or(0),
        })
    }

    async fn resolve_hash_file(&self, raw: &str) -> Result<HashFile> {
        let id = parse_id(EntityKind::HashFile, raw)?;
        self.store
            .get_hash_file(id)
            .await?
            .ok_or_else(|| FleetError::not_found(EntityKind::HashFile, id))
    }

    async fn resolve_wordlist(&self, req: &CreateJobRequest) -> Result<Wordlist> {
        if let Some(raw) = req.wordlist_id.as_deref().filter(|s| !s.trim().is_empty()) {
            let id = parse_id(EntityKind::Wordlist, raw)?;
            return self
                .store
                .get_wordlist(id)
                .await?
                .ok_or_else(|| FleetError::not_found(EntityKind::Wordlist, id));
        }

        let reference = req.wordlist.trim();
        if reference.is_empty() {
            return Err(FleetError::Validation("wordlist is required".into()));
        }
        let found = match Uuid::parse_str(reference) {
            Ok(id) => self.store.get_wordlist(id).await?,
            Err(_) => self.store.find_wordlist(reference).await?,
        };
        found.ok_or_else(|| FleetError::not_found(EntityKind::Wordlist, reference))
    }

    pub async fn get_job_status(&self, job_id: Uuid) -> Result<JobView> {
        let mut job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| FleetError::not_found(EntityKind::Job, job_id))?;
        if job.kind != JobKind::Master {
            return Ok(JobView {
                job,
                partitions: Vec::new(),
            });
        }

        let partitions = self.store.children(job.id).await?;
        if !partitions.is_empty() && !job.status.is_terminal() {
            let agg = aggregate(&partitions);
            job.progress = job.progress.max(agg.progress);
            job.processed_words = job.processed_words.max(agg.processed_words);
            job.speed = agg.speed;
            job.eta = agg.eta;
        }
        Ok(JobView { job, partitions })
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        self.store.list_jobs().await
    }

    pub async fn pause_job(&self, job_id: Uuid) -> Result<Job> {
        self.states.pause(job_id).await
    }

    pub async fn resume_job(&self, job_id: Uuid) -> Result<Job> {
        self.states.resume(job_id).await
    }

    pub async fn delete_job(&self, job_id: Uuid) -> Result<()> {
        self.states.delete(job_id).await
    }

    pub async fn report_agent_progress(
        &self,
        job_id: Uuid,
        agent_id: Uuid,
        report: ProgressReport,
    ) -> Result<ReportOutcome> {
        let outcome = self.progress.report(job_id, agent_id, report).await?;
        if outcome == ReportOutcome::Finished {
            self.offer_work(agent_id).await;
        }
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Agents
    // ------------------------------------------------------------------

    pub async fn register_agent(&self, req: NewAgent) -> Result<Agent> {
        let agent = self.registry.register(req).await?;
        self.offer_work(agent.id).await;
        Ok(agent)
    }

    pub async fn heartbeat(&self, agent_id: Uuid) -> Result<Agent> {
        self.registry.heartbeat(agent_id).await
    }

    pub async fn deregister_agent(&self, agent_id: Uuid) -> Result<()> {
        self.registry.deregister(agent_id).await
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>> {
        self.registry.list().await
    }

    // ------------------------------------------------------------------
    // Uploaded artifacts
    // ------------------------------------------------------------------

    pub async fn add_hash_file(&self, file: HashFile) -> Result<HashFile> {
        if file.name.trim().is_empty() {
            return Err(FleetError::Validation("hash file name is required".into()));
        }
        self.store.insert_hash_file(&file).await?;
        tracing::info!(
            hash_file_id = %file.id,
            name = %file.name,
            hashes = file.hash_count,
            "Hash file added"
        );
        Ok(file)
    }

    pub async fn add_wordlist(&self, wordlist: Wordlist) -> Result<Wordlist> {
        if wordlist.name.trim().is_empty() {
            return Err(FleetError::Validation("wordlist name is required".into()));
        }
        self.store.insert_wordlist(&wordlist).await?;
        tracing::info!(
            wordlist_id = %wordlist.id,
            name = %wordlist.name,
            words = ?wordlist.word_count,
            "Wordlist added"
        );
        Ok(wordlist)
    }

    pub async fn list_hash_files(&self) -> Result<Vec<HashFile>> {
        self.store.list_hash_files().await
    }

    pub async fn list_wordlists(&self) -> Result<Vec<Wordlist>> {
        self.store.list_wordlists().await
    }

    // ------------------------------------------------------------------
    // Background work
    // ------------------------------------------------------------------

    pub async fn schedule(&self) -> Result<PassReport> {
        self.assigner.run_pass().await
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.registry.sweep().await
    }

    /// Try to hand `agent_id` work right away. Failures only delay the
    /// assignment to the next pass.
    async fn offer_work(&self, agent_id: Uuid) {
        if let Err(e) = self.assigner.assign_agent(agent_id).await {
            tracing::warn!(agent_id = %agent_id, error = %e, "On-demand assignment failed");
        }
    }
}
