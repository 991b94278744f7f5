use clap::{Parser, ValueEnum};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use jobgate::api::{ErrorResponse, SubmitJobResponse};
use jobgate::config::{
    default_categories, load_categories, SchedulerConfig, ServerConfig, WorkerConfig,
};
use jobgate::scheduler::{JobView, QueueStatus};
use jobgate::server::Server;
use jobgate::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "jobgate")]
#[command(version)]
#[command(about = "Credit-billed job admission and execution scheduler")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the scheduler and its HTTP API
    Server(ServerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Admission queue commands
    Queue {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: QueueCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Port for the HTTP API
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Maximum number of jobs running at once (at least 1)
    #[arg(long, default_value = "3", value_parser = parse_ceiling)]
    max_concurrent: usize,

    /// Directory under which each job gets its own output directory
    #[arg(long, default_value = "results")]
    results_root: PathBuf,

    /// Directory holding the worker scripts
    #[arg(long, default_value = "automation_scripts")]
    scripts_dir: PathBuf,

    /// Program used to run worker scripts
    #[arg(long, default_value = "python3")]
    interpreter: String,

    /// JSON file with the category catalogue (defaults to the built-in one)
    #[arg(long)]
    categories: Option<PathBuf>,

    /// Kill a worker after this many seconds (0 disables the limit)
    #[arg(long, default_value = "600")]
    worker_timeout_secs: u64,

    /// Open an account in the in-memory ledger, as USER=BALANCE.
    /// May be repeated.
    #[arg(long = "account", value_parser = parse_account)]
    accounts: Vec<(String, f64)>,
}

// =============================================================================
// Client Arguments (shared by job and queue commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server base URL
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a new job
    Submit {
        /// Account charged for the job
        #[arg(long)]
        user: String,

        /// Work category (e.g. "egm-download")
        #[arg(long)]
        category: String,

        /// Input file handed to the worker
        input: PathBuf,

        /// Higher runs first within the category
        #[arg(long)]
        priority: Option<i32>,

        /// Credits to charge instead of the category default
        #[arg(long)]
        credits: Option<f64>,

        /// Extra arguments passed through to the worker
        #[arg(last = true)]
        extra: Vec<String>,
    },
    /// Get status of a specific job
    Status {
        /// The job ID (UUID)
        job_id: String,
    },
    /// Cancel a job that is still queued
    Cancel {
        /// The job ID (UUID)
        job_id: String,
    },
    /// List a user's recent jobs
    List {
        #[arg(long)]
        user: String,
    },
}

#[derive(clap::Subcommand, Debug)]
enum QueueCommands {
    /// Show slot usage
    Status,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_ceiling(s: &str) -> Result<usize, String> {
    match s.trim().parse::<usize>() {
        Ok(0) => Err("ceiling must be at least 1, or no job could ever start".to_string()),
        Ok(n) => Ok(n),
        Err(_) => Err(format!("invalid ceiling '{}'", s)),
    }
}

fn parse_account(s: &str) -> Result<(String, f64), String> {
    let (user, balance) = s
        .split_once('=')
        .ok_or_else(|| format!("expected USER=BALANCE, got '{}'", s))?;
    let balance: f64 = balance
        .trim()
        .parse()
        .map_err(|_| format!("invalid balance '{}'", balance))?;
    if user.trim().is_empty() {
        return Err("user must not be empty".to_string());
    }
    Ok((user.trim().to_string(), balance))
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Decode a successful body, or print the server's error and exit.
async fn read_response<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, Box<dyn std::error::Error>> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }
    let message = match response.json::<ErrorResponse>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    };
    eprintln!("Error ({}): {}", status.as_u16(), message);
    std::process::exit(1);
}

fn print_job_table(job: &JobView) {
    println!("Job ID:     {}", job.job_id);
    println!("Category:   {}", job.category);
    println!("Input:      {}", job.input_file_name);
    println!("Status:     {}", job.status.to_string().to_uppercase());
    if let Some(position) = job.queue_position {
        println!("Position:   {}", position);
    }
    if let Some(progress) = job.progress_percent {
        println!("Progress:   {}%", progress);
    }
    if let Some(download) = &job.download_ref {
        println!("Download:   {}", download);
    }
    if !job.result_files.is_empty() {
        println!("Results:");
        for file in &job.result_files {
            println!("  {}", file);
        }
    }
    if let Some(error) = &job.error {
        println!("Error:");
        for line in error.lines() {
            println!("  {}", line);
        }
    }
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let categories = match &args.categories {
        Some(path) => load_categories(path)?,
        None => default_categories(),
    };
    let worker = WorkerConfig {
        interpreter: args.interpreter,
        scripts_dir: args.scripts_dir,
        timeout: (args.worker_timeout_secs > 0)
            .then(|| Duration::from_secs(args.worker_timeout_secs)),
    };
    let scheduler = SchedulerConfig::default()
        .with_max_concurrent(args.max_concurrent)
        .with_results_root(args.results_root)
        .with_categories(categories)
        .with_worker(worker);

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let config = ServerConfig {
        listen_addr,
        scheduler,
        initial_balances: args.accounts,
    };

    let shutdown = install_shutdown_handler();
    Server::new(config).await.run(shutdown).await
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_submit(
    http: &reqwest::Client,
    client: &ClientArgs,
    body: serde_json::Value,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = http
        .post(format!("{}/api/jobs", client.addr))
        .json(&body)
        .send()
        .await?;
    let resp: SubmitJobResponse = read_response(response).await?;

    match client.output {
        OutputFormat::Json => print_json(&resp)?,
        OutputFormat::Table => {
            println!("{}", resp.message);
            println!("Job ID:      {}", resp.job_id);
            println!("New balance: {}", resp.new_balance);
        }
    }
    Ok(())
}

async fn handle_job_status(
    http: &reqwest::Client,
    client: &ClientArgs,
    job_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = http
        .get(format!("{}/api/jobs/{}/status", client.addr, job_id))
        .send()
        .await?;
    let job: JobView = read_response(response).await?;

    match client.output {
        OutputFormat::Json => print_json(&job)?,
        OutputFormat::Table => print_job_table(&job),
    }
    Ok(())
}

async fn handle_job_cancel(
    http: &reqwest::Client,
    client: &ClientArgs,
    job_id: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = http
        .post(format!("{}/api/jobs/{}/cancel", client.addr, job_id))
        .send()
        .await?;
    let job: JobView = read_response(response).await?;

    match client.output {
        OutputFormat::Json => print_json(&job)?,
        OutputFormat::Table => {
            println!("Job cancelled and credits refunded.");
            print_job_table(&job);
        }
    }
    Ok(())
}

async fn handle_job_list(
    http: &reqwest::Client,
    client: &ClientArgs,
    user: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = http
        .get(format!("{}/api/jobs/user/{}", client.addr, user))
        .send()
        .await?;
    let jobs: Vec<JobView> = read_response(response).await?;

    match client.output {
        OutputFormat::Json => print_json(&jobs)?,
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!(
                "{:<38} {:<12} {:<24} {:<6} CREATED",
                "JOB ID", "STATUS", "CATEGORY", "POS"
            );
            println!("{}", "-".repeat(100));
            for job in jobs {
                let position = job
                    .queue_position
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<38} {:<12} {:<24} {:<6} {}",
                    job.job_id,
                    job.status.to_string().to_uppercase(),
                    job.category,
                    position,
                    job.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
    }
    Ok(())
}

async fn handle_queue_status(
    http: &reqwest::Client,
    client: &ClientArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = http
        .get(format!("{}/api/queue/status", client.addr))
        .send()
        .await?;
    let status: QueueStatus = read_response(response).await?;

    match client.output {
        OutputFormat::Json => print_json(&status)?,
        OutputFormat::Table => {
            println!("Queue Status");
            println!("{}", "=".repeat(40));
            println!("Processing: {}/{}", status.processing_count, status.ceiling);
            if !status.active_job_ids.is_empty() {
                println!();
                println!("Active jobs:");
                for id in status.active_job_ids {
                    println!("  {}", id);
                }
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
            let http = reqwest::Client::new();
            match command {
                JobCommands::Submit {
                    user,
                    category,
                    input,
                    priority,
                    credits,
                    extra,
                } => {
                    let body = serde_json::json!({
                        "user_id": user,
                        "category": category,
                        "input_path": input,
                        "priority": priority,
                        "credits": credits,
                        "extra_args": extra,
                    });
                    handle_job_submit(&http, &client, body).await?;
                }
                JobCommands::Status { job_id } => {
                    handle_job_status(&http, &client, &job_id).await?;
                }
                JobCommands::Cancel { job_id } => {
                    handle_job_cancel(&http, &client, &job_id).await?;
                }
                JobCommands::List { user } => {
                    handle_job_list(&http, &client, &user).await?;
                }
            }
        }
        Commands::Queue { client, command } => {
            let http = reqwest::Client::new();
            match command {
                QueueCommands::Status => {
                    handle_queue_status(&http, &client).await?;
                }
            }
        }
    }

    Ok(())
}
