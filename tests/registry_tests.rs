
use chrono::{Duration, Utc};
use hashfleet::config::CoordinatorConfig;
use hashfleet::error::{ErrorKind, FleetError};
use hashfleet::registry::{AgentStatus, NewAgent};
use hashfleet::scheduler::{JobStatus, TerminalReason};
use test_harness::TestFleet;
use uuid::Uuid;

fn rig1(key: &str) -> NewAgent {
    NewAgent {
        name: "rig1".to_string(),
        address: "10.0.0.5".to_string(),
        port: 8080,
        capabilities: "hash=0,1000;mode=0,3".to_string(),
        throughput: Some(2_500_000.0),
        registration_key: key.to_string(),
    }
}

#[tokio::test]
async fn test_register_then_duplicate_is_rejected() {
    let fleet = TestFleet::new().await;

    let agent = fleet.coordinator.register_agent(rig1("k1")).await.unwrap();
    assert_eq!(agent.status, AgentStatus::Online);
    assert!(agent.current_job.is_none());
    assert_eq!(agent.endpoint(), "10.0.0.5:8080");

    let err = fleet
        .coordinator
        .register_agent(rig1("k2"))
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::AlreadyRegistered { .. }));
    assert_eq!(err.kind(), ErrorKind::Duplicate);

    assert_eq!(fleet.coordinator.list_agents().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_registration_key_is_single_use() {
    let fleet = TestFleet::new().await;
    fleet.coordinator.register_agent(rig1("shared")).await.unwrap();

    let mut other = rig1("shared");
    other.name = "rig2".to_string();
    let err = fleet.coordinator.register_agent(other).await.unwrap_err();
    assert!(matches!(err, FleetError::KeyInUse));
}

#[tokio::test]
async fn test_registration_validation() {
    let fleet = TestFleet::new().await;

    let mut nameless = rig1("k");
    nameless.name = "  ".to_string();
    assert_eq!(
        fleet.coordinator.register_agent(nameless).await.unwrap_err().kind(),
        ErrorKind::Validation
    );

    let mut bad_caps = rig1("k");
    bad_caps.capabilities = "gpu=yes".to_string();
    assert_eq!(
        fleet.coordinator.register_agent(bad_caps).await.unwrap_err().kind(),
        ErrorKind::Validation
    );

    assert!(fleet.coordinator.list_agents().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_heartbeat_unknown_agent_is_not_found() {
    let fleet = TestFleet::new().await;
    let err = fleet.coordinator.heartbeat(Uuid::new_v4()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(fleet.coordinator.list_agents().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_heartbeat_keeps_agent_alive_through_sweep() {
    let mut fleet = TestFleet::new().await;
    let agent = fleet.register("rig1").await;
    let registry = fleet.coordinator.registry();
    let now = Utc::now();

    registry
        .heartbeat_at(agent.id, now + Duration::seconds(20))
        .await
        .unwrap();
    let report = registry.sweep_at(now + Duration::seconds(31)).await.unwrap();
    assert!(report.is_empty());
    assert_eq!(fleet.agent(agent.id).await.status, AgentStatus::Online);

    let report = registry.sweep_at(now + Duration::seconds(51)).await.unwrap();
    assert_eq!(report.offline, vec![agent.id]);
    assert_eq!(fleet.agent(agent.id).await.status, AgentStatus::Offline);
}

#[tokio::test]
async fn test_offline_agent_returns_on_heartbeat() {
    let mut fleet = TestFleet::new().await;
    let agent = fleet.register("rig1").await;
    let registry = fleet.coordinator.registry();

    registry
        .sweep_at(Utc::now() + Duration::seconds(31))
        .await
        .unwrap();
    assert_eq!(fleet.agent(agent.id).await.status, AgentStatus::Offline);
    assert!(registry.list_idle().await.unwrap().is_empty());

    let back = fleet.coordinator.heartbeat(agent.id).await.unwrap();
    assert_eq!(back.status, AgentStatus::Online);
    assert_eq!(registry.list_idle().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_list_available_filters_capabilities() {
    let mut fleet = TestFleet::new().await;
    let md5 = fleet.register_with("md5-rig", "hash=0", None).await;
    let ntlm = fleet.register_with("ntlm-rig", "hash=1000;mode=0", None).await;
    let any = fleet.register("any-rig").await;

    let available = fleet
        .coordinator
        .registry()
        .list_available(1000, 0)
        .await
        .unwrap();
    let mut ids: Vec<Uuid> = available.iter().map(|a| a.id).collect();
    ids.sort();
    let mut expected = vec![ntlm.id, any.id];
    expected.sort();
    assert_eq!(ids, expected);

    let available = fleet
        .coordinator
        .registry()
        .list_available(1000, 3)
        .await
        .unwrap();
    assert_eq!(available.len(), 1);
    assert_eq!(available[0].id, any.id);
    assert!(!available.iter().any(|a| a.id == md5.id));
}

#[tokio::test]
async fn test_deregister_refused_while_busy() {
    let mut fleet = TestFleet::new().await;
    let job = fleet
        .coordinator
        .create_job(fleet.job_request("ntlm"))
        .await
        .unwrap();
    let agent = fleet.register("rig1").await;
    assert_eq!(fleet.agent(agent.id).await.current_job, Some(job.id));

    let err = fleet
        .coordinator
        .deregister_agent(agent.id)
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::AgentBusy { job_id, .. } if job_id == job.id));

    fleet.coordinator.pause_job(job.id).await.unwrap();
    fleet.coordinator.deregister_agent(agent.id).await.unwrap();
    assert_eq!(
        fleet.coordinator.deregister_agent(agent.id).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[tokio::test]
async fn test_deregister_refused_while_a_job_is_placed_on_agent() {
    let mut fleet = TestFleet::new().await;
    let agent = fleet.register("rig1").await;
    let mut req = fleet.job_request("pinned");
    req.agent_id = Some(agent.id.to_string());
    let job = fleet.coordinator.create_job(req).await.unwrap();
    assert_eq!(fleet.job(job.id).await.status, JobStatus::Pending);

    let err = fleet
        .coordinator
        .deregister_agent(agent.id)
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::AgentPinned { job_id, .. } if job_id == job.id));
    assert_eq!(err.kind(), ErrorKind::Conflict);

    fleet.coordinator.delete_job(job.id).await.unwrap();
    fleet.coordinator.deregister_agent(agent.id).await.unwrap();
}

#[tokio::test]
async fn test_silent_agent_listed_offline_before_sweep() {
    let mut fleet = TestFleet::new().await;
    let agent = fleet.register("rig1").await;
    let registry = fleet.coordinator.registry();

    let now = Utc::now();
    let listed = registry.list_at(now).await.unwrap();
    assert_eq!(listed[0].status, AgentStatus::Online);

    let listed = registry.list_at(now + Duration::seconds(45)).await.unwrap();
    assert_eq!(listed[0].id, agent.id);
    assert_eq!(listed[0].status, AgentStatus::Offline);
    // Only the view changes; the stored row waits for the sweep.
    assert_eq!(fleet.agent(agent.id).await.status, AgentStatus::Online);
}

#[tokio::test]
async fn test_sweep_requeues_job_and_next_agent_resumes() {
    let mut fleet = TestFleet::new().await;
    let job = fleet
        .coordinator
        .create_job(fleet.job_request("ntlm"))
        .await
        .unwrap();
    let rig1 = fleet.register("rig1").await;
    assert_eq!(fleet.drain_starts(), vec![(rig1.id, job.id)]);

    fleet
        .coordinator
        .report_agent_progress(
            job.id,
            rig1.id,
            hashfleet::scheduler::ProgressReport::running(0.25, 1_000_000.0),
        )
        .await
        .unwrap();

    let report = fleet
        .coordinator
        .registry()
        .sweep_at(Utc::now() + Duration::seconds(31))
        .await
        .unwrap();
    assert_eq!(report.offline, vec![rig1.id]);
    assert_eq!(report.requeued, vec![job.id]);
    assert!(report.failed.is_empty());

    let requeued = fleet.job(job.id).await;
    assert_eq!(requeued.status, JobStatus::Pending);
    assert!(requeued.assigned_agent.is_none());
    assert_eq!(requeued.requeues, 1);
    assert_eq!(requeued.processed_words, 250_000);
    let lost = fleet.agent(rig1.id).await;
    assert_eq!(lost.status, AgentStatus::Offline);
    assert!(lost.current_job.is_none());

    let rig2 = fleet.register("rig2").await;
    let starts = fleet.drain_commands();
    assert_eq!(starts.len(), 1);
    match &starts[0] {
        hashfleet::scheduler::AgentCommand::Start {
            agent_id, order, ..
        } => {
            assert_eq!(*agent_id, rig2.id);
            assert_eq!(order.job_id, job.id);
            assert_eq!(order.skip, 250_000);
        }
        other => panic!("expected a start order, got {:?}", other),
    }
}

#[tokio::test]
async fn test_sweep_fails_job_once_requeues_are_spent() {
    let config = CoordinatorConfig::default().with_max_requeues(Some(0));
    let mut fleet = TestFleet::with_config(config).await;
    let job = fleet
        .coordinator
        .create_job(fleet.job_request("ntlm"))
        .await
        .unwrap();
    let agent = fleet.register("rig1").await;

    let report = fleet
        .coordinator
        .registry()
        .sweep_at(Utc::now() + Duration::seconds(31))
        .await
        .unwrap();
    assert_eq!(report.failed, vec![job.id]);

    let failed = fleet.job(job.id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.reason, Some(TerminalReason::AgentLost));
    assert!(failed.completed_at.is_some());
    assert!(fleet.agent(agent.id).await.current_job.is_none());
}
