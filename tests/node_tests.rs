
use std::time::Duration;

use hashfleet::config::{CoordinatorConfig, ServerConfig};
use hashfleet::node::{open_store, Node};
use hashfleet::registry::AgentStatus;
use hashfleet::scheduler::JobStatus;
use test_harness::{assert_eventually, TestFleet};
use tokio_util::sync::CancellationToken;

fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig::default()
        .with_schedule_interval_ms(10)
        .with_sweep_interval_ms(10)
        .with_heartbeat_timeout_ms(400)
}

#[tokio::test]
async fn test_loops_assign_sweep_and_stop_on_shutdown() {
    let mut fleet = TestFleet::with_config(fast_config()).await;
    let agent = fleet.register("rig1").await;
    let job = fleet
        .coordinator
        .create_job(fleet.job_request("ntlm"))
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let node = Node::new(fleet.coordinator.clone());
    let handle = tokio::spawn(node.run(shutdown.clone()));

    let store = fleet.store.clone();
    assert_eventually(
        || {
            let store = store.clone();
            async move {
                use hashfleet::store::JobRepository;
                store.get_job(job.id).await.unwrap().map(|j| j.status) == Some(JobStatus::Running)
            }
        },
        Duration::from_secs(2),
        "scheduling loop never assigned the job",
    )
    .await;

    // No heartbeats: the sweep loop takes the agent offline and requeues.
    assert_eventually(
        || {
            let store = store.clone();
            async move {
                use hashfleet::store::AgentRepository;
                store.get_agent(agent.id).await.unwrap().map(|a| a.status)
                    == Some(AgentStatus::Offline)
            }
        },
        Duration::from_secs(2),
        "sweep loop never marked the agent offline",
    )
    .await;
    let requeued = fleet.job(job.id).await;
    assert_eq!(requeued.status, JobStatus::Pending);
    assert_eq!(requeued.requeues, 1);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("node did not stop after shutdown")
        .unwrap()
        .unwrap();
}

#[test]
fn test_open_store_follows_database_setting() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("fleet.db");

    open_store(&ServerConfig::new(Some(path.clone()))).unwrap();
    assert!(path.exists());

    open_store(&ServerConfig::default()).unwrap();
}
