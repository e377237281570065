
use hashfleet::error::{ErrorKind, FleetError};
use hashfleet::registry::AgentStatus;
use hashfleet::scheduler::{AgentCommand, JobStatus, ProgressReport, ReportOutcome};
use test_harness::TestFleet;

#[tokio::test]
async fn test_pause_releases_agent_and_resume_continues_from_offset() {
    let mut fleet = TestFleet::new().await;
    let job = fleet
        .coordinator
        .create_job(fleet.job_request("ntlm"))
        .await
        .unwrap();
    let agent = fleet.register("rig1").await;
    fleet
        .coordinator
        .report_agent_progress(job.id, agent.id, ProgressReport::running(0.3, 1_000.0))
        .await
        .unwrap();
    fleet.drain_commands();

    let paused = fleet.coordinator.pause_job(job.id).await.unwrap();
    assert_eq!(paused.status, JobStatus::Paused);
    assert!(paused.assigned_agent.is_none());
    assert_eq!(paused.progress, 0.3);
    assert_eq!(paused.processed_words, 300_000);

    let freed = fleet.agent(agent.id).await;
    assert_eq!(freed.status, AgentStatus::Online);
    assert!(freed.current_job.is_none());
    assert!(matches!(
        fleet.drain_commands().as_slice(),
        [AgentCommand::Stop { job_id, .. }] if *job_id == job.id
    ));

    // Paused work is not scheduled, and late reports change nothing.
    assert!(fleet.coordinator.schedule().await.unwrap().assigned.is_empty());
    let late = fleet
        .coordinator
        .report_agent_progress(job.id, agent.id, ProgressReport::running(0.35, 1_000.0))
        .await
        .unwrap();
    assert_eq!(late, ReportOutcome::Stale);

    let resumed = fleet.coordinator.resume_job(job.id).await.unwrap();
    assert_eq!(resumed.status, JobStatus::Pending);

    fleet.coordinator.schedule().await.unwrap();
    let commands = fleet.drain_commands();
    match commands.as_slice() {
        [AgentCommand::Start { order, .. }] => {
            assert_eq!(order.job_id, job.id);
            assert_eq!(order.skip, 300_000);
        }
        other => panic!("expected one start order, got {:?}", other),
    }
}

#[tokio::test]
async fn test_pause_pending_job() {
    let fleet = TestFleet::new().await;
    let job = fleet
        .coordinator
        .create_job(fleet.job_request("queued"))
        .await
        .unwrap();

    let paused = fleet.coordinator.pause_job(job.id).await.unwrap();
    assert_eq!(paused.status, JobStatus::Paused);
    assert_eq!(
        fleet.coordinator.pause_job(job.id).await.unwrap_err().kind(),
        ErrorKind::Conflict
    );
}

#[tokio::test]
async fn test_terminal_jobs_are_final() {
    let mut fleet = TestFleet::new().await;
    let job = fleet
        .coordinator
        .create_job(fleet.job_request("ntlm"))
        .await
        .unwrap();
    let agent = fleet.register("rig1").await;
    fleet
        .coordinator
        .report_agent_progress(job.id, agent.id, ProgressReport::found("hunter2"))
        .await
        .unwrap();

    let err = fleet.coordinator.pause_job(job.id).await.unwrap_err();
    assert!(matches!(
        err,
        FleetError::InvalidTransition {
            status: JobStatus::Completed,
            action: "pause",
            ..
        }
    ));
    assert_eq!(
        fleet.coordinator.resume_job(job.id).await.unwrap_err().kind(),
        ErrorKind::Conflict
    );
    assert_eq!(fleet.job(job.id).await.status, JobStatus::Completed);

    // Finished jobs may still be cleaned up.
    fleet.coordinator.delete_job(job.id).await.unwrap();
    assert_eq!(
        fleet.coordinator.get_job_status(job.id).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[tokio::test]
async fn test_resume_requires_paused() {
    let fleet = TestFleet::new().await;
    let job = fleet
        .coordinator
        .create_job(fleet.job_request("queued"))
        .await
        .unwrap();
    let err = fleet.coordinator.resume_job(job.id).await.unwrap_err();
    assert!(matches!(
        err,
        FleetError::InvalidTransition {
            status: JobStatus::Pending,
            action: "resume",
            ..
        }
    ));
}

#[tokio::test]
async fn test_delete_refused_while_running() {
    let mut fleet = TestFleet::new().await;
    let job = fleet
        .coordinator
        .create_job(fleet.job_request("ntlm"))
        .await
        .unwrap();
    fleet.register("rig1").await;

    let err = fleet.coordinator.delete_job(job.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(fleet.store.job_count(), 1);
}

#[tokio::test]
async fn test_master_controls_cascade_to_partitions() {
    let mut fleet = TestFleet::new().await;
    let rig1 = fleet.register("rig1").await;
    let rig2 = fleet.register("rig2").await;
    let job = fleet
        .coordinator
        .create_distributed_job(fleet.request_on_agents("split", &[&rig1, &rig2]))
        .await
        .unwrap();
    fleet.coordinator.schedule().await.unwrap();
    assert_eq!(fleet.job(job.master.id).await.status, JobStatus::Running);

    // Partitions are driven through their master.
    let part = job.partitions[0].id;
    for err in [
        fleet.coordinator.pause_job(part).await.unwrap_err(),
        fleet.coordinator.resume_job(part).await.unwrap_err(),
        fleet.coordinator.delete_job(part).await.unwrap_err(),
    ] {
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    let paused = fleet.coordinator.pause_job(job.master.id).await.unwrap();
    assert_eq!(paused.status, JobStatus::Paused);
    for p in &job.partitions {
        let stored = fleet.job(p.id).await;
        assert_eq!(stored.status, JobStatus::Paused);
        assert!(stored.assigned_agent.is_none());
    }
    assert_eq!(fleet.agent(rig1.id).await.status, AgentStatus::Online);
    assert_eq!(fleet.agent(rig2.id).await.status, AgentStatus::Online);

    fleet.coordinator.resume_job(job.master.id).await.unwrap();
    assert_eq!(fleet.job(job.master.id).await.status, JobStatus::Pending);
    let report = fleet.coordinator.schedule().await.unwrap();
    assert_eq!(report.assigned.len(), 2);
    assert_eq!(fleet.job(job.master.id).await.status, JobStatus::Running);

    fleet.coordinator.pause_job(job.master.id).await.unwrap();
    fleet.coordinator.delete_job(job.master.id).await.unwrap();
    assert_eq!(fleet.store.job_count(), 0);
}
