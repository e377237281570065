use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::registry::Agent;
use crate::scheduler::Job;
use crate::store::{
    fifo_key, AgentRepository, HashFile, HashFileRepository, JobRepository, Mutation, Store,
    Wordlist, WordlistRepository,
};

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<Uuid, Job>,
    agents: HashMap<Uuid, Agent>,
    hash_files: HashMap<Uuid, HashFile>,
    wordlists: HashMap<Uuid, Wordlist>,
}

/// In-process store. Every operation runs under one lock, which makes each
/// [`Store::apply`] batch trivially atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs currently stored, masters and partitions included.
    pub fn job_count(&self) -> usize {
        self.state.lock().jobs.len()
    }
}

#[async_trait]
impl AgentRepository for MemoryStore {
    async fn insert_agent(&self, agent: &Agent) -> Result<()> {
        let mut state = self.state.lock();
        for existing in state.agents.values() {
            if existing.name == agent.name
                && existing.address == agent.address
                && existing.port == agent.port
            {
                return Err(FleetError::AlreadyRegistered {
                    name: agent.name.clone(),
                    address: agent.address.clone(),
                    port: agent.port,
                });
            }
            if existing.registration_key == agent.registration_key {
                return Err(FleetError::KeyInUse);
            }
        }
        state.agents.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>> {
        Ok(self.state.lock().agents.get(&id).cloned())
    }

    async fn find_agent(&self, name: &str, address: &str, port: u16) -> Result<Option<Agent>> {
        Ok(self
            .state
            .lock()
            .agents
            .values()
            .find(|a| a.name == name && a.address == address && a.port == port)
            .cloned())
    }

    async fn list_agents(&self) -> Result<Vec<Agent>> {
        let mut agents: Vec<Agent> = self.state.lock().agents.values().cloned().collect();
        agents.sort_by_key(|a| (a.registered_at, a.id));
        Ok(agents)
    }

    async fn delete_agent(&self, id: Uuid) -> Result<bool> {
        let mut state = self.state.lock();
        match state.agents.get(&id) {
            Some(agent) if agent.current_job.is_none() => {
                state.agents.remove(&id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn insert_jobs(&self, jobs: &[Job]) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(dup) = jobs.iter().find(|j| state.jobs.contains_key(&j.id)) {
            return Err(FleetError::Storage(format!("job {} already stored", dup.id)));
        }
        for job in jobs {
            state.jobs.insert(job.id, job.clone());
        }
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.state.lock().jobs.get(&id).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self.state.lock().jobs.values().cloned().collect();
        jobs.sort_by_key(fifo_key);
        Ok(jobs)
    }

    async fn children(&self, master_id: Uuid) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .state
            .lock()
            .jobs
            .values()
            .filter(|j| j.parent_id == Some(master_id))
            .cloned()
            .collect();
        jobs.sort_by_key(fifo_key);
        Ok(jobs)
    }

    async fn claimable_jobs(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .state
            .lock()
            .jobs
            .values()
            .filter(|j| j.is_claimable())
            .cloned()
            .collect();
        jobs.sort_by_key(fifo_key);
        Ok(jobs)
    }

    async fn next_job_for_agent(&self, agent: &Agent) -> Result<Option<Job>> {
        let Some(caps) = agent.capability_set() else {
            return Ok(None);
        };
        let state = self.state.lock();
        Ok(state
            .jobs
            .values()
            .filter(|j| j.is_claimable())
            .filter(|j| j.preferred_agent.map_or(true, |p| p == agent.id))
            .filter(|j| caps.supports(j.hash_type, j.attack_mode))
            .min_by_key(|j| fifo_key(j))
            .cloned())
    }
}

#[async_trait]
impl HashFileRepository for MemoryStore {
    async fn insert_hash_file(&self, file: &HashFile) -> Result<()> {
        self.state.lock().hash_files.insert(file.id, file.clone());
        Ok(())
    }

    async fn get_hash_file(&self, id: Uuid) -> Result<Option<HashFile>> {
        Ok(self.state.lock().hash_files.get(&id).cloned())
    }

    async fn list_hash_files(&self) -> Result<Vec<HashFile>> {
        let mut files: Vec<HashFile> = self.state.lock().hash_files.values().cloned().collect();
        files.sort_by_key(|f| f.created_at);
        Ok(files)
    }
}

#[async_trait]
impl WordlistRepository for MemoryStore {
    async fn insert_wordlist(&self, wordlist: &Wordlist) -> Result<()> {
        let mut state = self.state.lock();
        if state.wordlists.values().any(|w| w.name == wordlist.name) {
            return Err(FleetError::duplicate_wordlist(&wordlist.name));
        }
        state.wordlists.insert(wordlist.id, wordlist.clone());
        Ok(())
    }

    async fn get_wordlist(&self, id: Uuid) -> Result<Option<Wordlist>> {
        Ok(self.state.lock().wordlists.get(&id).cloned())
    }

    async fn find_wordlist(&self, name: &str) -> Result<Option<Wordlist>> {
        Ok(self
            .state
            .lock()
            .wordlists
            .values()
            .filter(|w| w.name == name)
            .min_by_key(|w| w.created_at)
            .cloned())
    }

    async fn list_wordlists(&self) -> Result<Vec<Wordlist>> {
        let mut lists: Vec<Wordlist> = self.state.lock().wordlists.values().cloned().collect();
        lists.sort_by_key(|w| w.created_at);
        Ok(lists)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn apply(&self, batch: Vec<Mutation>) -> Result<bool> {
        let mut state = self.state.lock();

        // Mutations run against scratch copies; nothing reaches `state`
        // unless every required guard held. `None` marks a missing or
        // deleted job.
        let mut jobs: HashMap<Uuid, Option<Job>> = HashMap::new();
        let mut agents: HashMap<Uuid, Option<Agent>> = HashMap::new();

        for mutation in &batch {
            let applied = match mutation {
                Mutation::Job {
                    id, guard, patch, ..
                } => {
                    let slot = jobs
                        .entry(*id)
                        .or_insert_with(|| state.jobs.get(id).cloned());
                    match slot {
                        Some(job) if guard.matches(job) => {
                            patch.apply(job);
                            true
                        }
                        _ => false,
                    }
                }
                Mutation::Agent {
                    id, guard, patch, ..
                } => {
                    let slot = agents
                        .entry(*id)
                        .or_insert_with(|| state.agents.get(id).cloned());
                    match slot {
                        Some(agent) if guard.matches(agent) => {
                            patch.apply(agent);
                            true
                        }
                        _ => false,
                    }
                }
                Mutation::DeleteJob { id, guard, .. } => {
                    let slot = jobs
                        .entry(*id)
                        .or_insert_with(|| state.jobs.get(id).cloned());
                    if slot.as_ref().is_some_and(|job| guard.matches(job)) {
                        *slot = None;
                        true
                    } else {
                        false
                    }
                }
            };

            if !applied && mutation.is_required() {
                return Ok(false);
            }
        }

        for (id, job) in jobs {
            match job {
                Some(job) => {
                    state.jobs.insert(id, job);
                }
                None => {
                    state.jobs.remove(&id);
                }
            }
        }
        for (id, agent) in agents {
            if let Some(agent) = agent {
                state.agents.insert(id, agent);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{AgentStatus, NewAgent};
    use crate::scheduler::{JobSpec, JobStatus};
    use crate::store::{AgentGuard, AgentPatch, JobGuard, JobPatch};
    use chrono::Utc;

    fn agent(name: &str) -> Agent {
        Agent::from_registration(
            NewAgent {
                name: name.to_string(),
                address: "10.0.0.5".to_string(),
                port: 8080,
                capabilities: String::new(),
                throughput: None,
                registration_key: format!("key-{}", name),
            },
            Utc::now(),
        )
    }

    fn job() -> Job {
        Job::new(JobSpec {
            name: "j".into(),
            hash_type: 0,
            attack_mode: 0,
            hash_file_id: Uuid::new_v4(),
            wordlist_id: Uuid::new_v4(),
            rules: None,
            preferred_agent: None,
            total_words: 10,
        })
    }

    #[tokio::test]
    async fn failed_required_guard_writes_nothing() {
        let store = MemoryStore::new();
        let a = agent("rig1");
        let j = job();
        store.insert_agent(&a).await.unwrap();
        store.insert_jobs(&[j.clone()]).await.unwrap();

        let applied = store
            .apply(vec![
                Mutation::job(
                    j.id,
                    JobGuard::status_in(&[JobStatus::Pending]),
                    JobPatch::status(JobStatus::Running),
                ),
                Mutation::agent(
                    a.id,
                    AgentGuard::status_in(&[AgentStatus::Busy]),
                    AgentPatch::release(),
                ),
            ])
            .await
            .unwrap();

        assert!(!applied);
        let stored = store.get_job(j.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn optional_miss_does_not_abort() {
        let store = MemoryStore::new();
        let j = job();
        store.insert_jobs(&[j.clone()]).await.unwrap();

        let applied = store
            .apply(vec![
                Mutation::job(j.id, JobGuard::any(), JobPatch::status(JobStatus::Paused)),
                Mutation::job(Uuid::new_v4(), JobGuard::any(), JobPatch::default()).optional(),
            ])
            .await
            .unwrap();

        assert!(applied);
        assert_eq!(
            store.get_job(j.id).await.unwrap().unwrap().status,
            JobStatus::Paused
        );
    }

    #[tokio::test]
    async fn guarded_delete() {
        let store = MemoryStore::new();
        let mut j = job();
        j.status = JobStatus::Running;
        store.insert_jobs(&[j.clone()]).await.unwrap();

        let not_running = JobGuard::status_in(&[
            JobStatus::Pending,
            JobStatus::Paused,
            JobStatus::Completed,
            JobStatus::Failed,
        ]);
        assert!(!store
            .apply(vec![Mutation::delete_job(j.id, not_running.clone())])
            .await
            .unwrap());
        assert_eq!(store.job_count(), 1);

        store
            .apply(vec![Mutation::job(
                j.id,
                JobGuard::any(),
                JobPatch::status(JobStatus::Failed),
            )])
            .await
            .unwrap();
        assert!(store
            .apply(vec![Mutation::delete_job(j.id, not_running)])
            .await
            .unwrap());
        assert_eq!(store.job_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_agents_rejected() {
        let store = MemoryStore::new();
        let a = agent("rig1");
        store.insert_agent(&a).await.unwrap();

        let mut same_endpoint = agent("rig1");
        same_endpoint.registration_key = "other".to_string();
        let err = store.insert_agent(&same_endpoint).await.unwrap_err();
        assert!(matches!(err, FleetError::AlreadyRegistered { .. }));

        let mut same_key = agent("rig2");
        same_key.registration_key = a.registration_key.clone();
        let err = store.insert_agent(&same_key).await.unwrap_err();
        assert!(matches!(err, FleetError::KeyInUse));
    }

    #[tokio::test]
    async fn duplicate_wordlist_names_rejected() {
        let store = MemoryStore::new();
        store
            .insert_wordlist(&Wordlist::new("rockyou.txt", Some(100), 1_024))
            .await
            .unwrap();

        let err = store
            .insert_wordlist(&Wordlist::new("rockyou.txt", None, 2_048))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));
        assert_eq!(store.list_wordlists().await.unwrap().len(), 1);
    }
}
