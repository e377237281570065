pub mod assigner;
pub mod dispatch;
pub mod job;
pub mod keyspace;
pub mod progress;
pub mod state;

pub use assigner::{JobAssigner, PassReport};
pub use dispatch::{AgentCommand, AgentDispatcher, ChannelDispatcher, WorkOrder};
pub use job::{Job, JobKind, JobSpec, JobStatus, KeyspaceRange, TerminalReason};
pub use progress::{Aggregate, ProgressAggregator, ProgressReport, ReportOutcome, ReportStatus};
pub use state::JobStateMachine;
