use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use hashfleet::config::{CoordinatorConfig, DistributionPolicy, ServerConfig};
use hashfleet::coordinator::{Coordinator, CreateJobRequest, DistributedJobRequest, JobView};
use hashfleet::node::{open_store, Node};
use hashfleet::registry::{Agent, AgentStatus};
use hashfleet::scheduler::{AgentCommand, ChannelDispatcher, Job, JobStatus};
use hashfleet::shutdown::install_shutdown_handler;
use hashfleet::store::{HashFile, Wordlist};

#[derive(Parser, Debug)]
#[command(name = "hashfleet")]
#[command(version)]
#[command(about = "Job orchestration for a fleet of password-cracking agents")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the coordinator's scheduling and sweep loops
    Server(ServerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Agent inspection commands
    Agent {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: AgentCommands,
    },

    /// Hash file and wordlist bookkeeping
    Artifact {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ArtifactCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// SQLite database file (state is kept in memory when omitted)
    #[arg(long)]
    database: Option<PathBuf>,

    /// Seconds of silence after which an agent is presumed offline
    #[arg(long, default_value = "30")]
    heartbeat_timeout_secs: u64,

    /// Milliseconds between staleness sweeps
    #[arg(long, default_value = "10000")]
    sweep_interval_ms: u64,

    /// Milliseconds between scheduling passes
    #[arg(long, default_value = "1000")]
    schedule_interval_ms: u64,

    /// Milliseconds to wait for an agent to accept a work order
    #[arg(long, default_value = "5000")]
    dispatch_timeout_ms: u64,

    /// Requeues allowed after an agent is lost (0 fails the job right away)
    #[arg(long, default_value = "3", conflicts_with = "unlimited_requeues")]
    max_requeues: u32,

    /// Requeue lost jobs indefinitely
    #[arg(long)]
    unlimited_requeues: bool,

    /// Reject distributed jobs that resolve to a single partition instead
    /// of running them as plain jobs
    #[arg(long)]
    reject_single_partition: bool,

    /// Capacity of the outbound agent command queue
    #[arg(long, default_value = "1024")]
    command_queue: usize,
}

// =============================================================================
// Client Arguments (shared by job, agent and artifact commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// SQLite database file shared with the server
    #[arg(long, short = 'd', default_value = "hashfleet.db")]
    database: PathBuf,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Create a job, optionally split across agents
    Create {
        /// Job name
        name: String,

        /// Hash type code
        #[arg(long, short = 'm')]
        hash_type: i64,

        /// Attack mode code
        #[arg(long, short = 'a', default_value = "0")]
        attack_mode: i64,

        /// Hash file id
        #[arg(long)]
        hash_file: String,

        /// Wordlist name or id
        #[arg(long, short = 'w')]
        wordlist: String,

        /// Rule set passed through to the agent
        #[arg(long)]
        rules: Option<String>,

        /// Run only on this agent
        #[arg(long, conflicts_with_all = ["partitions", "agents"])]
        agent: Option<String>,

        /// Split across this many automatically chosen agents
        #[arg(long)]
        partitions: Option<usize>,

        /// Split across these agents (comma-separated ids)
        #[arg(long, value_delimiter = ',')]
        agents: Vec<String>,
    },
    /// Get status of a specific job
    Status {
        /// The job ID (UUID)
        job_id: String,
    },
    /// List all jobs
    List {
        /// Only show jobs in this status
        #[arg(long)]
        status: Option<String>,
    },
    /// Pause a pending or running job
    Pause { job_id: String },
    /// Return a paused job to the queue
    Resume { job_id: String },
    /// Delete a job and its partitions
    Delete { job_id: String },
}

// =============================================================================
// Agent Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum AgentCommands {
    /// List registered agents
    List,
    /// Remove an idle agent
    Remove { agent_id: String },
}

// =============================================================================
// Artifact Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum ArtifactCommands {
    /// Record an uploaded hash file
    AddHashes {
        name: String,
        #[arg(long)]
        hash_type: Option<u32>,
        #[arg(long, default_value = "0")]
        count: u64,
    },
    /// Record an uploaded wordlist
    AddWordlist {
        name: String,
        /// Number of words, if already indexed
        #[arg(long)]
        words: Option<u64>,
        #[arg(long, default_value = "0")]
        size: u64,
    },
    /// List hash files and wordlists
    List,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobCreateOutput {
    job_id: String,
    kind: String,
    partitions: Vec<String>,
}

#[derive(Serialize)]
struct JobListItem {
    job_id: String,
    name: String,
    kind: String,
    status: String,
    progress: f64,
    agent: Option<String>,
}

#[derive(Serialize)]
struct JobListOutput {
    jobs: Vec<JobListItem>,
    total_count: usize,
}

#[derive(Serialize)]
struct AgentListItem {
    agent_id: String,
    name: String,
    endpoint: String,
    status: String,
    current_job: Option<String>,
    throughput: Option<f64>,
    last_heartbeat: String,
}

#[derive(Serialize)]
struct ArtifactListOutput {
    hash_files: Vec<HashFile>,
    wordlists: Vec<Wordlist>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_uuid(raw: &str) -> Result<Uuid, Box<dyn std::error::Error>> {
    Uuid::parse_str(raw.trim()).map_err(|_| format!("'{}' is not a valid id", raw).into())
}

fn short_id(id: Uuid) -> String {
    id.to_string()[..8].to_string()
}

fn job_list_item(job: &Job) -> JobListItem {
    JobListItem {
        job_id: job.id.to_string(),
        name: job.name.clone(),
        kind: job.kind.as_str().to_string(),
        status: job.status.as_str().to_string(),
        progress: job.progress,
        agent: job.assigned_agent.map(|a| a.to_string()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Coordinator over the shared database for one-shot client commands.
///
/// Stop commands raised here (pausing a running job) have no transport to
/// travel on; the agent learns of the change from its next report.
fn open_client(args: &ClientArgs) -> Result<Coordinator, Box<dyn std::error::Error>> {
    let store = open_store(&ServerConfig::new(Some(args.database.clone())))?;
    let (dispatcher, _commands) = ChannelDispatcher::new(64);
    Ok(Coordinator::new(
        store,
        Arc::new(dispatcher),
        CoordinatorConfig::default(),
    ))
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let coordinator = CoordinatorConfig::default()
        .with_heartbeat_timeout_ms(args.heartbeat_timeout_secs * 1_000)
        .with_sweep_interval_ms(args.sweep_interval_ms)
        .with_schedule_interval_ms(args.schedule_interval_ms)
        .with_dispatch_timeout_ms(args.dispatch_timeout_ms)
        .with_max_requeues((!args.unlimited_requeues).then_some(args.max_requeues))
        .with_distribution(if args.reject_single_partition {
            DistributionPolicy::Reject
        } else {
            DistributionPolicy::Degrade
        });
    let config = ServerConfig::new(args.database).with_coordinator(coordinator);

    tracing::info!(
        database = ?config.database,
        heartbeat_timeout_ms = config.coordinator.heartbeat_timeout_ms,
        max_requeues = ?config.coordinator.max_requeues,
        distribution = ?config.coordinator.distribution,
        "Starting hashfleet coordinator"
    );

    let store = open_store(&config)?;
    let (dispatcher, mut commands) = ChannelDispatcher::new(args.command_queue);
    let coordinator = Arc::new(Coordinator::new(
        store,
        Arc::new(dispatcher),
        config.coordinator.clone(),
    ));

    // Agent transport is external; log what would go out on it.
    tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            match &command {
                AgentCommand::Start {
                    agent_id,
                    endpoint,
                    order,
                } => tracing::info!(
                    agent_id = %agent_id,
                    endpoint = %endpoint,
                    job_id = %order.job_id,
                    skip = order.skip,
                    limit = ?order.limit,
                    "Work order queued"
                ),
                AgentCommand::Stop {
                    agent_id,
                    endpoint,
                    job_id,
                } => tracing::info!(
                    agent_id = %agent_id,
                    endpoint = %endpoint,
                    job_id = %job_id,
                    "Stop order queued"
                ),
            }
        }
    });

    let shutdown = install_shutdown_handler();
    Node::new(coordinator).run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

#[allow(clippy::too_many_arguments)]
async fn handle_job_create(
    coordinator: &Coordinator,
    name: String,
    hash_type: i64,
    attack_mode: i64,
    hash_file: String,
    wordlist: String,
    rules: Option<String>,
    agent: Option<String>,
    partitions: Option<usize>,
    agents: Vec<String>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let request = CreateJobRequest {
        name,
        hash_type,
        attack_mode,
        hash_file_id: hash_file,
        wordlist,
        wordlist_id: None,
        agent_id: agent,
        rules,
    };

    let (master, parts) = if partitions.is_some() || !agents.is_empty() {
        let created = coordinator
            .create_distributed_job(DistributedJobRequest {
                job: request,
                partitions,
                agents,
            })
            .await?;
        (created.master, created.partitions)
    } else {
        (coordinator.create_job(request).await?, Vec::new())
    };

    match output_format {
        OutputFormat::Json => print_json(&JobCreateOutput {
            job_id: master.id.to_string(),
            kind: master.kind.as_str().to_string(),
            partitions: parts.iter().map(|p| p.id.to_string()).collect(),
        })?,
        OutputFormat::Table => {
            println!("Job created successfully!");
            println!("Job ID: {}", master.id);
            for part in &parts {
                let range = part
                    .keyspace
                    .map(|r| format!("[{}, {})", r.start, r.end))
                    .unwrap_or_else(|| "whole wordlist".to_string());
                println!("  Partition {} {}", part.id, range);
            }
        }
    }
    Ok(())
}

async fn handle_job_status(
    coordinator: &Coordinator,
    job_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let view: JobView = coordinator.get_job_status(parse_uuid(&job_id)?).await?;

    match output_format {
        OutputFormat::Json => print_json(&view)?,
        OutputFormat::Table => {
            let job = &view.job;
            println!("Job ID:      {}", job.id);
            println!("Name:        {}", job.name);
            println!("Kind:        {}", job.kind.as_str());
            println!("Status:      {}", job.status);
            println!("Progress:    {:.1}%", job.progress * 100.0);
            if job.speed > 0.0 {
                println!("Speed:       {:.0} words/s", job.speed);
            }
            if let Some(eta) = job.eta {
                println!("ETA:         {}", eta.to_rfc3339());
            }
            if let Some(agent) = job.assigned_agent {
                println!("Agent:       {}", agent);
            }
            if let Some(reason) = job.reason {
                println!("Reason:      {}", reason);
            }
            if let Some(result) = &job.result {
                println!("Result:      {}", result);
            }
            if let Some(error) = &job.error {
                println!("Error:");
                for line in error.lines() {
                    println!("  {}", line);
                }
            }
            if !view.partitions.is_empty() {
                println!();
                println!("{:<10} {:<11} {:>8} {:<24} AGENT", "PART", "STATUS", "PROGRESS", "RANGE");
                println!("{}", "-".repeat(66));
                for part in &view.partitions {
                    let range = part
                        .keyspace
                        .map(|r| format!("[{}, {})", r.start, r.end))
                        .unwrap_or_else(|| "-".to_string());
                    let agent = part
                        .assigned_agent
                        .map(short_id)
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<10} {:<11} {:>7.1}% {:<24} {}",
                        short_id(part.id),
                        part.status.as_str(),
                        part.progress * 100.0,
                        range,
                        agent
                    );
                }
            }
        }
    }
    Ok(())
}

async fn handle_job_list(
    coordinator: &Coordinator,
    status: Option<String>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let filter = match status.as_deref() {
        Some(s) => Some(
            JobStatus::parse(&s.to_ascii_lowercase())
                .ok_or_else(|| format!("unknown status '{}'", s))?,
        ),
        None => None,
    };
    let jobs: Vec<JobListItem> = coordinator
        .list_jobs()
        .await?
        .iter()
        .filter(|j| filter.map_or(true, |st| j.status == st))
        .map(job_list_item)
        .collect();

    match output_format {
        OutputFormat::Json => print_json(&JobListOutput {
            total_count: jobs.len(),
            jobs,
        })?,
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
            } else {
                println!(
                    "{:<38} {:<10} {:<11} {:>8}  NAME",
                    "JOB ID", "KIND", "STATUS", "PROGRESS"
                );
                println!("{}", "-".repeat(84));
                for job in &jobs {
                    let name = if job.name.chars().count() > 20 {
                        format!("{}...", job.name.chars().take(17).collect::<String>())
                    } else {
                        job.name.clone()
                    };
                    println!(
                        "{:<38} {:<10} {:<11} {:>7.1}%  {}",
                        job.job_id,
                        job.kind,
                        job.status,
                        job.progress * 100.0,
                        name
                    );
                }
                println!();
                println!("Showing {} jobs", jobs.len());
            }
        }
    }
    Ok(())
}

async fn handle_agent_list(
    coordinator: &Coordinator,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let agents: Vec<Agent> = coordinator.list_agents().await?;

    match output_format {
        OutputFormat::Json => {
            let items: Vec<AgentListItem> = agents
                .iter()
                .map(|a| AgentListItem {
                    agent_id: a.id.to_string(),
                    name: a.name.clone(),
                    endpoint: a.endpoint(),
                    status: a.status.to_string(),
                    current_job: a.current_job.map(|j| j.to_string()),
                    throughput: a.throughput,
                    last_heartbeat: a.last_heartbeat.to_rfc3339(),
                })
                .collect();
            print_json(&items)?;
        }
        OutputFormat::Table => {
            if agents.is_empty() {
                println!("No agents registered.");
                return Ok(());
            }
            println!(
                "{:<38} {:<16} {:<22} {:<8} JOB",
                "AGENT ID", "NAME", "ENDPOINT", "STATUS"
            );
            println!("{}", "-".repeat(96));
            for agent in &agents {
                let status_icon = match agent.status {
                    AgentStatus::Online => "[+]",
                    AgentStatus::Busy => "[*]",
                    AgentStatus::Offline => "[-]",
                };
                println!(
                    "{:<38} {:<16} {:<22} {} {:<4} {}",
                    agent.id,
                    agent.name,
                    agent.endpoint(),
                    status_icon,
                    agent.status,
                    agent
                        .current_job
                        .map(short_id)
                        .unwrap_or_else(|| "-".to_string())
                );
            }
        }
    }
    Ok(())
}

async fn handle_artifact_list(
    coordinator: &Coordinator,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let hash_files = coordinator.list_hash_files().await?;
    let wordlists = coordinator.list_wordlists().await?;

    match output_format {
        OutputFormat::Json => print_json(&ArtifactListOutput {
            hash_files,
            wordlists,
        })?,
        OutputFormat::Table => {
            println!("Hash files");
            println!("{}", "=".repeat(40));
            for file in &hash_files {
                println!("{}  {:<20} {} hashes", file.id, file.name, file.hash_count);
            }
            println!();
            println!("Wordlists");
            println!("{}", "=".repeat(40));
            for list in &wordlists {
                let words = list
                    .word_count
                    .map(|w| format!("{} words", w))
                    .unwrap_or_else(|| "not indexed".to_string());
                println!("{}  {:<20} {}", list.id, list.name, words);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Job { client, command } => {
            let coordinator = open_client(&client)?;

            match command {
                JobCommands::Create {
                    name,
                    hash_type,
                    attack_mode,
                    hash_file,
                    wordlist,
                    rules,
                    agent,
                    partitions,
                    agents,
                } => {
                    handle_job_create(
                        &coordinator,
                        name,
                        hash_type,
                        attack_mode,
                        hash_file,
                        wordlist,
                        rules,
                        agent,
                        partitions,
                        agents,
                        &client.output,
                    )
                    .await?;
                }
                JobCommands::Status { job_id } => {
                    handle_job_status(&coordinator, job_id, &client.output).await?;
                }
                JobCommands::List { status } => {
                    handle_job_list(&coordinator, status, &client.output).await?;
                }
                JobCommands::Pause { job_id } => {
                    let job = coordinator.pause_job(parse_uuid(&job_id)?).await?;
                    println!("Job {} is {}", job.id, job.status);
                }
                JobCommands::Resume { job_id } => {
                    let job = coordinator.resume_job(parse_uuid(&job_id)?).await?;
                    println!("Job {} is {}", job.id, job.status);
                }
                JobCommands::Delete { job_id } => {
                    let id = parse_uuid(&job_id)?;
                    coordinator.delete_job(id).await?;
                    println!("Job {} deleted", id);
                }
            }
        }
        Commands::Agent { client, command } => {
            let coordinator = open_client(&client)?;

            match command {
                AgentCommands::List => {
                    handle_agent_list(&coordinator, &client.output).await?;
                }
                AgentCommands::Remove { agent_id } => {
                    let id = parse_uuid(&agent_id)?;
                    coordinator.deregister_agent(id).await?;
                    println!("Agent {} removed", id);
                }
            }
        }
        Commands::Artifact { client, command } => {
            let coordinator = open_client(&client)?;

            match command {
                ArtifactCommands::AddHashes {
                    name,
                    hash_type,
                    count,
                } => {
                    let file = coordinator
                        .add_hash_file(HashFile::new(name, hash_type, count))
                        .await?;
                    match client.output {
                        OutputFormat::Json => print_json(&file)?,
                        OutputFormat::Table => println!("Hash file ID: {}", file.id),
                    }
                }
                ArtifactCommands::AddWordlist { name, words, size } => {
                    let list = coordinator
                        .add_wordlist(Wordlist::new(name, words, size))
                        .await?;
                    match client.output {
                        OutputFormat::Json => print_json(&list)?,
                        OutputFormat::Table => println!("Wordlist ID: {}", list.id),
                    }
                }
                ArtifactCommands::List => {
                    handle_artifact_list(&coordinator, &client.output).await?;
                }
            }
        }
    }

    Ok(())
}
