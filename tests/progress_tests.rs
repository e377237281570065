
use chrono::{Duration, Utc};
use hashfleet::error::ErrorKind;
use hashfleet::registry::{Agent, AgentStatus};
use hashfleet::scheduler::{Job, JobStatus, ProgressReport, ReportOutcome, TerminalReason};
use test_harness::TestFleet;
use uuid::Uuid;

/// A fleet with one agent already running one job.
async fn running_job() -> (TestFleet, Job, Agent) {
    let mut fleet = TestFleet::new().await;
    let job = fleet
        .coordinator
        .create_job(fleet.job_request("ntlm"))
        .await
        .unwrap();
    let agent = fleet.register("rig1").await;
    assert_eq!(fleet.job(job.id).await.status, JobStatus::Running);
    (fleet, job, agent)
}

#[tokio::test]
async fn test_out_of_order_reports_never_lower_progress() {
    let (fleet, job, agent) = running_job().await;

    let eta = Utc::now() + Duration::minutes(10);
    let first = fleet
        .coordinator
        .report_agent_progress(
            job.id,
            agent.id,
            ProgressReport::running(0.40, 2_000_000.0).with_eta(eta),
        )
        .await
        .unwrap();
    assert_eq!(first, ReportOutcome::Accepted);

    fleet
        .coordinator
        .report_agent_progress(job.id, agent.id, ProgressReport::running(0.25, 1_500_000.0))
        .await
        .unwrap();

    let stored = fleet.job(job.id).await;
    assert_eq!(stored.progress, 0.40);
    assert_eq!(stored.processed_words, 400_000);
    // Speed and ETA are instantaneous and follow the latest report.
    assert_eq!(stored.speed, 1_500_000.0);
    assert!(stored.eta.is_none());
    assert_eq!(stored.status, JobStatus::Running);
}

#[tokio::test]
async fn test_report_counts_as_heartbeat() {
    let (fleet, job, agent) = running_job().await;
    let before = fleet.agent(agent.id).await.last_heartbeat;

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    fleet
        .coordinator
        .report_agent_progress(job.id, agent.id, ProgressReport::running(0.1, 10.0))
        .await
        .unwrap();
    assert!(fleet.agent(agent.id).await.last_heartbeat > before);
}

#[tokio::test]
async fn test_found_result_completes_job_and_is_idempotent() {
    let (fleet, job, agent) = running_job().await;

    let outcome = fleet
        .coordinator
        .report_agent_progress(job.id, agent.id, ProgressReport::found("Summer2024!"))
        .await
        .unwrap();
    assert_eq!(outcome, ReportOutcome::Finished);

    let done = fleet.job(job.id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.result.as_deref(), Some("Summer2024!"));
    assert_eq!(done.progress, 1.0);
    assert!(done.completed_at.is_some());
    assert!(done.reason.is_none());

    let freed = fleet.agent(agent.id).await;
    assert_eq!(freed.status, AgentStatus::Online);
    assert!(freed.current_job.is_none());

    // The agent retries the same report after a lost acknowledgment.
    let again = fleet
        .coordinator
        .report_agent_progress(job.id, agent.id, ProgressReport::found("Summer2024!"))
        .await
        .unwrap();
    assert_eq!(again, ReportOutcome::Stale);
    assert_eq!(fleet.job(job.id).await, done);
}

#[tokio::test]
async fn test_late_progress_after_completion_is_ignored() {
    let (fleet, job, agent) = running_job().await;
    fleet
        .coordinator
        .report_agent_progress(job.id, agent.id, ProgressReport::exhausted())
        .await
        .unwrap();
    let done = fleet.job(job.id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.reason, Some(TerminalReason::Exhausted));
    assert!(done.result.is_none());

    let late = fleet
        .coordinator
        .report_agent_progress(job.id, agent.id, ProgressReport::running(0.9, 5.0))
        .await
        .unwrap();
    assert_eq!(late, ReportOutcome::Stale);
    assert_eq!(fleet.job(job.id).await, done);
}

#[tokio::test]
async fn test_report_from_wrong_agent_is_stale() {
    let (mut fleet, job, _agent) = running_job().await;
    let other = fleet.register("rig2").await;

    let outcome = fleet
        .coordinator
        .report_agent_progress(job.id, other.id, ProgressReport::found("nope"))
        .await
        .unwrap();
    assert_eq!(outcome, ReportOutcome::Stale);

    let job = fleet.job(job.id).await;
    assert_eq!(job.status, JobStatus::Running);
    assert!(job.result.is_none());
}

#[tokio::test]
async fn test_report_errors() {
    let (fleet, job, agent) = running_job().await;

    let err = fleet
        .coordinator
        .report_agent_progress(job.id, Uuid::new_v4(), ProgressReport::running(0.1, 1.0))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = fleet
        .coordinator
        .report_agent_progress(Uuid::new_v4(), agent.id, ProgressReport::running(0.1, 1.0))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = fleet
        .coordinator
        .report_agent_progress(job.id, agent.id, ProgressReport::running(1.5, 1.0))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let mut empty = ProgressReport::found("x");
    empty.result = Some(String::new());
    let err = fleet
        .coordinator
        .report_agent_progress(job.id, agent.id, empty)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    assert_eq!(fleet.job(job.id).await.progress, 0.0);
}

#[tokio::test]
async fn test_agent_failure_fails_job_and_frees_agent() {
    let (fleet, job, agent) = running_job().await;

    let outcome = fleet
        .coordinator
        .report_agent_progress(
            job.id,
            agent.id,
            ProgressReport::errored("hashcat exited with status 255"),
        )
        .await
        .unwrap();
    assert_eq!(outcome, ReportOutcome::Finished);

    let failed = fleet.job(job.id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.reason, Some(TerminalReason::AgentError));
    assert_eq!(failed.error.as_deref(), Some("hashcat exited with status 255"));
    assert_eq!(fleet.agent(agent.id).await.status, AgentStatus::Online);
}

#[tokio::test]
async fn test_processed_words_prefer_agent_count() {
    let (fleet, job, agent) = running_job().await;
    fleet
        .coordinator
        .report_agent_progress(
            job.id,
            agent.id,
            ProgressReport::running(0.5, 1.0).with_processed_words(480_123),
        )
        .await
        .unwrap();

    let stored = fleet.job(job.id).await;
    assert_eq!(stored.processed_words, 480_123);
    assert_eq!(stored.resume_offset(), 480_123);
}
