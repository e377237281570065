use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::registry::capability::CapabilitySet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
    Busy,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Offline => "offline",
            AgentStatus::Busy => "busy",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(AgentStatus::Online),
            "offline" => Some(AgentStatus::Offline),
            "busy" => Some(AgentStatus::Busy),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration request from an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAgent {
    pub name: String,
    pub address: String,
    pub port: u16,
    /// Opaque capability descriptor, see [`CapabilitySet::parse`].
    pub capabilities: String,
    /// Declared words per second; used to size keyspace partitions.
    pub throughput: Option<f64>,
    pub registration_key: String,
}

/// A registered compute worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub capabilities: String,
    pub throughput: Option<f64>,
    pub status: AgentStatus,
    /// The one job this agent is running; `Some` iff status is busy.
    pub current_job: Option<Uuid>,
    #[serde(skip_serializing)]
    pub registration_key: String,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl Agent {
    pub fn from_registration(req: NewAgent, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: req.name,
            address: req.address,
            port: req.port,
            capabilities: req.capabilities,
            throughput: req.throughput,
            status: AgentStatus::Online,
            current_job: None,
            registration_key: req.registration_key,
            last_heartbeat: now,
            registered_at: now,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// `None` if the stored descriptor does not parse; such an agent matches
    /// no job.
    pub fn capability_set(&self) -> Option<CapabilitySet> {
        CapabilitySet::parse(&self.capabilities).ok()
    }

    pub fn supports(&self, hash_type: u32, attack_mode: u32) -> bool {
        self.capability_set()
            .is_some_and(|caps| caps.supports(hash_type, attack_mode))
    }

    /// Relative speed used when splitting keyspace; unknown counts as 1.
    pub fn weight(&self) -> f64 {
        match self.throughput {
            Some(t) if t.is_finite() && t > 0.0 => t,
            _ => 1.0,
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.last_heartbeat > timeout
    }

    /// Status as seen by callers: past the heartbeat timeout an agent counts
    /// as offline whatever the stored status says.
    pub fn effective_status(&self, now: DateTime<Utc>, timeout: Duration) -> AgentStatus {
        if self.is_stale(now, timeout) {
            AgentStatus::Offline
        } else {
            self.status
        }
    }

    /// Online, not holding a job, and heard from within `timeout`.
    pub fn is_idle(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.status == AgentStatus::Online
            && self.current_job.is_none()
            && !self.is_stale(now, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration() -> NewAgent {
        NewAgent {
            name: "rig1".to_string(),
            address: "10.0.0.5".to_string(),
            port: 8080,
            capabilities: "hash=0,1000;mode=0".to_string(),
            throughput: None,
            registration_key: "k-1".to_string(),
        }
    }

    #[test]
    fn registered_agent_starts_online() {
        let now = Utc::now();
        let agent = Agent::from_registration(registration(), now);
        assert_eq!(agent.status, AgentStatus::Online);
        assert_eq!(agent.endpoint(), "10.0.0.5:8080");
        assert_eq!(agent.weight(), 1.0);
        assert!(agent.supports(1000, 0));
        assert!(!agent.supports(1000, 3));
    }

    #[test]
    fn staleness_follows_heartbeat_age() {
        let now = Utc::now();
        let mut agent = Agent::from_registration(registration(), now);
        let timeout = Duration::seconds(30);

        assert!(agent.is_idle(now, timeout));
        assert!(!agent.is_stale(now + Duration::seconds(30), timeout));
        assert!(agent.is_stale(now + Duration::seconds(31), timeout));
        assert!(!agent.is_idle(now + Duration::seconds(31), timeout));

        agent.current_job = Some(Uuid::new_v4());
        assert!(!agent.is_idle(now, timeout));
    }

    #[test]
    fn silent_agent_reads_as_offline() {
        let now = Utc::now();
        let mut agent = Agent::from_registration(registration(), now);
        agent.status = AgentStatus::Busy;
        let timeout = Duration::seconds(30);

        assert_eq!(agent.effective_status(now, timeout), AgentStatus::Busy);
        assert_eq!(
            agent.effective_status(now + Duration::seconds(31), timeout),
            AgentStatus::Offline
        );
    }

    #[test]
    fn invalid_throughput_falls_back_to_unit_weight() {
        let mut req = registration();
        req.throughput = Some(-3.0);
        let agent = Agent::from_registration(req, Utc::now());
        assert_eq!(agent.weight(), 1.0);
    }
}
