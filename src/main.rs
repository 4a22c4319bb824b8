use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use gram_lite::config::ManagerConfig;
use gram_lite::service::GramService;
use gram_lite::shutdown::install_shutdown_handler;
use gram_lite::store::{FileStore, JobStore};

#[derive(Parser, Debug)]
#[command(name = "gram-lite")]
#[command(version)]
#[command(about = "A grid job manager with swap-out, restart reload and orderly shutdown")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the job manager service
    Server(ServerArgs),

    /// Inspect persisted job state files
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
}

// =============================================================================
// Shared Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct LocationArgs {
    /// Host name used in state file names
    #[arg(long, default_value = "localhost")]
    hostname: String,

    /// Local user name used in default state file names
    #[arg(long, default_value = "gram")]
    logname: String,

    /// Installation root; the default state directory is <root>/tmp/gram_job_state
    #[arg(long, default_value = "/usr/local/gram")]
    install_root: PathBuf,

    /// Explicit state directory (files are then named job.<host>.<u1>.<u2>)
    #[arg(long)]
    state_dir: Option<PathBuf>,
}

impl LocationArgs {
    fn config(&self) -> ManagerConfig {
        let mut config = ManagerConfig::new(self.hostname.clone(), self.logname.clone());
        config.install_root = self.install_root.clone();
        config.state_dir = self.state_dir.clone();
        config
    }
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    #[command(flatten)]
    location: LocationArgs,

    /// Seconds an idle poll-wait job stays in memory before swap-out
    #[arg(long, default_value = "60")]
    swap_out_delay: u64,

    /// Seconds to wait after the last job leaves before exiting
    #[arg(long, default_value = "60")]
    grace_period: u64,

    /// LRM completion events arrive asynchronously (enables swap-out and
    /// LRM id splitting)
    #[arg(long)]
    event_stream: bool,

    /// Maximum number of job requests tracked at once
    #[arg(long, default_value = "10000")]
    max_requests: usize,

    /// Seconds between job polls when event streaming is off
    #[arg(long, default_value = "30")]
    poll_interval: u64,

    /// Port for the HTTP status surface (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Append log lines to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

// =============================================================================
// State Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum StateCommands {
    /// List persisted jobs
    List {
        #[command(flatten)]
        location: LocationArgs,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct StateListItem {
    job_contact: String,
    phase: String,
    restart_phase: String,
    failure_code: i32,
    lrm_job_id: Option<String>,
    stop_reason: Option<String>,
}

// =============================================================================
// Server Implementation
// =============================================================================

fn init_logging(log_file: Option<&PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

fn server_config(args: &ServerArgs) -> Result<ManagerConfig, Box<dyn std::error::Error>> {
    let dashboard_addr: Option<SocketAddr> = match args.dashboard_port {
        Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
        None => None,
    };

    Ok(ManagerConfig {
        swap_out_delay: Duration::from_secs(args.swap_out_delay),
        grace_period_delay: Duration::from_secs(args.grace_period),
        event_stream_enabled: args.event_stream,
        max_requests: args.max_requests,
        poll_interval: Duration::from_secs(args.poll_interval),
        dashboard_addr,
        log_file: args.log_file.clone(),
        ..args.location.config()
    })
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = server_config(&args)?;
    init_logging(config.log_file.as_ref())?;

    tracing::info!(
        hostname = %config.hostname,
        state_dir = %config.state_dir_path().display(),
        event_stream = config.event_stream_enabled,
        swap_out_delay_secs = args.swap_out_delay,
        grace_period_secs = args.grace_period,
        dashboard_addr = ?config.dashboard_addr,
        "Starting gram-lite job manager"
    );

    let shutdown = install_shutdown_handler()?;
    let service = GramService::new(config)?;
    service.run(shutdown).await?;

    tracing::info!("Job manager exited");
    Ok(())
}

// =============================================================================
// State Command Handlers
// =============================================================================

fn handle_state_list(
    location: &LocationArgs,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = FileStore::from_config(&location.config());
    let mut items = Vec::new();
    let mut unreadable = 0usize;

    for key in store.enumerate_keys()? {
        match store.load(&key) {
            Ok(record) => items.push(StateListItem {
                job_contact: record.key.to_string(),
                phase: record.phase.to_string(),
                restart_phase: record.restart_phase.to_string(),
                failure_code: record.failure_code,
                lrm_job_id: record.lrm_job_id,
                stop_reason: record.stop_reason.map(|reason| reason.to_string()),
            }),
            Err(e) => {
                eprintln!("Skipping {}: {}", key, e);
                unreadable += 1;
            }
        }
    }

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        OutputFormat::Table => {
            if items.is_empty() {
                println!("No persisted jobs in {}", store.dir().display());
            } else {
                println!(
                    "{:<44} {:<14} {:<14} LRM JOB ID",
                    "JOB CONTACT", "PHASE", "RESTART"
                );
                println!("{}", "-".repeat(90));
                for item in &items {
                    println!(
                        "{:<44} {:<14} {:<14} {}",
                        item.job_contact,
                        item.phase,
                        item.restart_phase,
                        item.lrm_job_id.as_deref().unwrap_or("-")
                    );
                }
                println!();
                println!("{} jobs, {} unreadable", items.len(), unreadable);
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
        Commands::State { command } => match command {
            StateCommands::List { location, output } => {
                handle_state_list(&location, &output)?;
            }
        },
    }

    Ok(())
}
