//! Hand-off of work to agents.
//!
//! The transport that actually reaches an agent lives outside this crate;
//! the scheduler only needs an acknowledgment that a work order was
//! accepted. [`ChannelDispatcher`] queues commands on an mpsc channel for
//! whatever transport drains it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::registry::Agent;
use crate::scheduler::Job;
use crate::store::Store;

/// Everything an agent needs to start or resume a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOrder {
    pub job_id: Uuid,
    pub master_id: Option<Uuid>,
    pub name: String,
    pub hash_type: u32,
    pub attack_mode: u32,
    pub hash_file_id: Uuid,
    pub wordlist_id: Uuid,
    pub rules: Option<String>,
    /// First wordlist index to process.
    pub skip: u64,
    /// Wordlist index to stop before; `None` runs to the end.
    pub limit: Option<u64>,
}

impl WorkOrder {
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            master_id: job.parent_id,
            name: job.name.clone(),
            hash_type: job.hash_type,
            attack_mode: job.attack_mode,
            hash_file_id: job.hash_file_id,
            wordlist_id: job.wordlist_id,
            rules: job.rules.clone(),
            skip: job.resume_offset(),
            limit: job.limit(),
        }
    }
}

#[mockall::automock]
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    /// Deliver `order` and wait for the agent to accept it.
    async fn dispatch(&self, agent: &Agent, order: WorkOrder) -> Result<()>;

    /// Ask the agent to abandon `job_id`.
    async fn stop(&self, agent: &Agent, job_id: Uuid) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentCommand {
    Start {
        agent_id: Uuid,
        endpoint: String,
        order: WorkOrder,
    },
    Stop {
        agent_id: Uuid,
        endpoint: String,
        job_id: Uuid,
    },
}

impl AgentCommand {
    pub fn agent_id(&self) -> Uuid {
        match self {
            AgentCommand::Start { agent_id, .. } | AgentCommand::Stop { agent_id, .. } => *agent_id,
        }
    }
}

/// Dispatcher that hands commands to an in-process transport over a
/// bounded channel. A closed or full channel counts as a failed dispatch.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::Sender<AgentCommand>,
}

impl ChannelDispatcher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AgentCommand>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    fn send(&self, agent: &Agent, command: AgentCommand) -> Result<()> {
        self.tx.try_send(command).map_err(|e| FleetError::Dispatch {
            agent_id: agent.id,
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl AgentDispatcher for ChannelDispatcher {
    async fn dispatch(&self, agent: &Agent, order: WorkOrder) -> Result<()> {
        self.send(
            agent,
            AgentCommand::Start {
                agent_id: agent.id,
                endpoint: agent.endpoint(),
                order,
            },
        )
    }

    async fn stop(&self, agent: &Agent, job_id: Uuid) -> Result<()> {
        self.send(
            agent,
            AgentCommand::Stop {
                agent_id: agent.id,
                endpoint: agent.endpoint(),
                job_id,
            },
        )
    }
}

/// Best-effort stop notification. The store already reflects the stop, so
/// failures are only logged.
pub(crate) async fn notify_stop(
    store: &dyn Store,
    dispatcher: &dyn AgentDispatcher,
    agent_id: Uuid,
    job_id: Uuid,
) {
    let agent = match store.get_agent(agent_id).await {
        Ok(Some(agent)) => agent,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(agent_id = %agent_id, error = %e, "Could not load agent to stop job");
            return;
        }
    };
    if let Err(e) = dispatcher.stop(&agent, job_id).await {
        tracing::warn!(
            agent_id = %agent_id,
            job_id = %job_id,
            error = %e,
            "Stop notification not delivered"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NewAgent;
    use crate::scheduler::{JobSpec, KeyspaceRange};
    use chrono::Utc;

    fn agent() -> Agent {
        Agent::from_registration(
            NewAgent {
                name: "rig1".into(),
                address: "10.0.0.5".into(),
                port: 8080,
                capabilities: String::new(),
                throughput: None,
                registration_key: "k".into(),
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_work_order_resumes_from_offset() {
        let master = Job::master(JobSpec {
            name: "m".into(),
            hash_type: 1000,
            attack_mode: 0,
            hash_file_id: Uuid::new_v4(),
            wordlist_id: Uuid::new_v4(),
            rules: Some("best64".into()),
            preferred_agent: None,
            total_words: 1_000,
        });
        let mut part = Job::partition_of(&master, 1, Some(KeyspaceRange::new(500, 1_000)), None);
        part.processed_words = 120;

        let order = WorkOrder::for_job(&part);
        assert_eq!(order.master_id, Some(master.id));
        assert_eq!(order.skip, 620);
        assert_eq!(order.limit, Some(1_000));
        assert_eq!(order.rules.as_deref(), Some("best64"));
    }

    #[tokio::test]
    async fn test_channel_dispatcher_queues_commands() {
        let (dispatcher, mut rx) = ChannelDispatcher::new(4);
        let a = agent();
        let job_id = Uuid::new_v4();

        dispatcher.stop(&a, job_id).await.unwrap();
        match rx.recv().await.unwrap() {
            AgentCommand::Stop {
                agent_id,
                endpoint,
                job_id: stopped,
            } => {
                assert_eq!(agent_id, a.id);
                assert_eq!(endpoint, "10.0.0.5:8080");
                assert_eq!(stopped, job_id);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_closed_channel_is_dispatch_error() {
        let (dispatcher, rx) = ChannelDispatcher::new(1);
        drop(rx);
        let err = dispatcher.stop(&agent(), Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, FleetError::Dispatch { .. }));
    }
}
