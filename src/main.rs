use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use cron_lite::config::{StoreConfig, WorkerConfig};
use cron_lite::jobs::JobStore;
use cron_lite::keys::Keyspace;
use cron_lite::logs::JsonLinesLogStore;
use cron_lite::node::WorkerNode;
use cron_lite::scheduler::Job;
use cron_lite::shutdown::install_shutdown_handler;
use cron_lite::store::{EtcdStore, MemoryStore};

#[derive(Parser, Debug)]
#[command(name = "cron-lite")]
#[command(version)]
#[command(about = "A distributed cron scheduler coordinated through etcd")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a worker that schedules and executes jobs
    Worker(WorkerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// List live workers
    Workers {
        #[command(flatten)]
        client: ClientArgs,
    },
}

// =============================================================================
// Shared Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct StoreArgs {
    /// etcd endpoints (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = "127.0.0.1:2379")]
    endpoints: Vec<String>,

    /// Key prefix every cron-lite key lives under
    #[arg(long, default_value = cron_lite::keys::DEFAULT_ROOT)]
    root: String,

    /// Connection timeout in milliseconds
    #[arg(long, default_value = "5000")]
    dial_timeout_ms: u64,
}

impl StoreArgs {
    fn store_config(&self) -> StoreConfig {
        StoreConfig {
            endpoints: self.endpoints.clone(),
            dial_timeout: Duration::from_millis(self.dial_timeout_ms),
        }
    }

    fn keys(&self) -> Keyspace {
        Keyspace::new(self.root.clone())
    }
}

#[derive(Parser, Debug)]
struct ClientArgs {
    #[command(flatten)]
    store: StoreArgs,

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
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Shell used to run job commands
    #[arg(long, default_value = "/bin/sh")]
    shell: String,

    /// IP to register under workers/ (detected when omitted)
    #[arg(long)]
    advertise_ip: Option<String>,

    /// File execution logs are appended to, one JSON document per line
    #[arg(long, default_value = "cron-lite-logs.jsonl")]
    log_file: PathBuf,

    /// Lease TTL of the per-job lock in milliseconds
    #[arg(long, default_value = "5000")]
    lock_ttl_ms: u64,

    /// Upper bound of the random delay before racing for a job lock, in milliseconds
    #[arg(long, default_value = "1000")]
    jitter_ms: u64,

    /// Number of log records written per batch
    #[arg(long, default_value = "100")]
    log_batch_size: usize,

    /// Longest a partial log batch waits before being written, in milliseconds
    #[arg(long, default_value = "1000")]
    log_commit_timeout_ms: u64,

    /// Run against an in-process store instead of etcd (single worker demo)
    #[arg(long)]
    in_memory: bool,

    /// Job to save before starting, as "name|cron expression|command".
    /// Repeatable. Mostly useful with --in-memory.
    #[arg(long = "job", value_parser = parse_job_arg)]
    jobs: Vec<Job>,
}

impl WorkerArgs {
    fn worker_config(&self) -> WorkerConfig {
        let mut config = WorkerConfig {
            store: self.store.store_config(),
            keys: self.store.keys(),
            shell: self.shell.clone(),
            advertise_ip: self.advertise_ip.clone(),
            ..WorkerConfig::default()
        };
        config.lock.lease_ttl = Duration::from_millis(self.lock_ttl_ms);
        config.lock.jitter_max = Duration::from_millis(self.jitter_ms);
        config.log_sink.batch_size = self.log_batch_size;
        config.log_sink.commit_timeout = Duration::from_millis(self.log_commit_timeout_ms);
        config.log_sink.path = self.log_file.clone();
        config
    }
}

// =============================================================================
// Job Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Create or replace a job
    Save {
        /// Job name
        name: String,

        /// Cron expression, seconds first (e.g. "*/5 * * * * *"); 5-field
        /// expressions run at second 0
        #[arg(long)]
        cron: String,

        /// Shell command to run (e.g. "echo hello")
        #[arg(long)]
        command: String,
    },
    /// Delete a job
    Delete {
        /// Job name
        name: String,
    },
    /// List all jobs
    List,
    /// Kill the running execution of a job on every worker
    Kill {
        /// Job name
        name: String,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobSaveOutput {
    job: Job,
    replaced: Option<Job>,
}

#[derive(Serialize)]
struct JobDeleteOutput {
    name: String,
    deleted: Option<Job>,
}

#[derive(Serialize)]
struct JobListOutput {
    jobs: Vec<Job>,
    total_count: usize,
}

#[derive(Serialize)]
struct WorkersOutput {
    workers: Vec<String>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_job_arg(arg: &str) -> Result<Job, String> {
    let mut parts = arg.splitn(3, '|');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), Some(cron), Some(command)) => {
            let job = Job::new(name.trim(), command.trim(), cron.trim());
            job.validate().map_err(|e| e.to_string())?;
            Ok(job)
        }
        _ => Err(format!(
            "invalid job {:?}, expected \"name|cron expression|command\"",
            arg
        )),
    }
}

async fn connect_jobs(args: &StoreArgs) -> Result<JobStore, Box<dyn std::error::Error>> {
    let store = EtcdStore::connect(&args.store_config()).await?;
    Ok(JobStore::new(Arc::new(store), args.keys()))
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let head: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

// =============================================================================
// Worker Implementation
// =============================================================================

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = args.worker_config();
    config.validate()?;

    let node = if args.in_memory {
        if config.advertise_ip.is_none() {
            config.advertise_ip = Some("127.0.0.1".to_string());
        }
        let log_store = JsonLinesLogStore::new(config.log_sink.path.clone());
        WorkerNode::new(config, Arc::new(MemoryStore::new()), Arc::new(log_store))
    } else {
        WorkerNode::connect(config).await?
    };

    let jobs = node.jobs();
    for job in &args.jobs {
        jobs.save(job).await?;
    }

    tracing::info!(
        in_memory = args.in_memory,
        endpoints = ?node.config.store.endpoints,
        root = %node.config.keys.root(),
        log_file = %node.config.log_sink.path.display(),
        seeded_jobs = args.jobs.len(),
        "Starting cron-lite worker"
    );

    let shutdown = install_shutdown_handler()?;
    node.run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_save(
    jobs: &JobStore,
    job: Job,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let replaced = jobs.save(&job).await?;

    match output_format {
        OutputFormat::Json => {
            let output = JobSaveOutput { job, replaced };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => match replaced {
            Some(old) => println!(
                "Job {} updated (was \"{}\" running {})",
                job.name, old.cron_expr, old.command
            ),
            None => println!("Job {} created", job.name),
        },
    }
    Ok(())
}

async fn handle_job_delete(
    jobs: &JobStore,
    name: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let deleted = jobs.delete(&name).await?;

    match output_format {
        OutputFormat::Json => {
            let output = JobDeleteOutput { name, deleted };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if deleted.is_some() {
                println!("Job {} deleted", name);
            } else {
                println!("Job {} not found", name);
            }
        }
    }
    Ok(())
}

async fn handle_job_list(
    jobs: &JobStore,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let all_jobs = jobs.list().await?;

    match output_format {
        OutputFormat::Json => {
            let output = JobListOutput {
                total_count: all_jobs.len(),
                jobs: all_jobs,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if all_jobs.is_empty() {
                println!("No jobs found.");
            } else {
                println!("{:<24} {:<24} COMMAND", "NAME", "CRON");
                println!("{}", "-".repeat(78));
                for job in &all_jobs {
                    println!(
                        "{:<24} {:<24} {}",
                        truncate(&job.name, 24),
                        job.cron_expr,
                        truncate(&job.command, 28)
                    );
                }
                println!("\nTotal: {} job(s)", all_jobs.len());
            }
        }
    }
    Ok(())
}

async fn handle_job_kill(
    jobs: &JobStore,
    name: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    jobs.kill(&name).await?;

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "name": name, "kill_requested": true }));
        }
        OutputFormat::Table => println!("Kill requested for job {}", name),
    }
    Ok(())
}

async fn handle_workers(
    jobs: &JobStore,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let workers = jobs.list_workers().await?;

    match output_format {
        OutputFormat::Json => {
            let output = WorkersOutput { workers };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if workers.is_empty() {
                println!("No live workers.");
            } else {
                println!("WORKER");
                println!("{}", "-".repeat(24));
                for ip in &workers {
                    println!("{}", ip);
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Worker(worker_args) => {
            run_worker(worker_args).await?;
        }
        Commands::Job { client, command } => {
            let jobs = connect_jobs(&client.store).await?;

            match command {
                JobCommands::Save {
                    name,
                    cron,
                    command: cmd,
                } => {
                    handle_job_save(&jobs, Job::new(name, cmd, cron), &client.output).await?;
                }
                JobCommands::Delete { name } => {
                    handle_job_delete(&jobs, name, &client.output).await?;
                }
                JobCommands::List => {
                    handle_job_list(&jobs, &client.output).await?;
                }
                JobCommands::Kill { name } => {
                    handle_job_kill(&jobs, name, &client.output).await?;
                }
            }
        }
        Commands::Workers { client } => {
            let jobs = connect_jobs(&client.store).await?;
            handle_workers(&jobs, &client.output).await?;
        }
    }

    Ok(())
}
