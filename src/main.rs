use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use boltbuild::config::{Config, ConfigSource};
use boltbuild::coordinator::{Coordinator, SubmitTarget};
use boltbuild::dashboard::{run_dashboard, DashboardState};
use boltbuild::protocol::JobResult;
use boltbuild::shutdown::install_shutdown_handler;
use boltbuild::worker::{local_identity, WorkerServer};

#[derive(Parser, Debug)]
#[command(name = "boltbuild")]
#[command(version)]
#[command(about = "Distributed build system: workers run builds, a coordinator finds and feeds them")]
#[command(propagate_version = true)]
struct Args {
    /// Path to the YAML configuration file (created with defaults if missing)
    #[arg(long, short = 'c', global = true, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a build worker
    Worker {
        /// Port to listen on (overrides worker.port)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Run the coordinator with discovery and the web dashboard
    Coordinator {
        /// Dashboard port (overrides dashboard.port)
        #[arg(long)]
        dashboard_port: Option<u16>,
    },

    /// Run one build and exit
    Build(BuildArgs),
}

#[derive(Parser, Debug)]
struct BuildArgs {
    /// Environment name from build.environments
    environment: String,

    /// Worker address to build on; discovery is skipped when set
    #[arg(long, short = 'w')]
    worker: Option<String>,

    /// How long to wait for discovery to find a worker
    #[arg(long, default_value = "15")]
    wait_secs: u64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct BuildOutput<'a> {
    job_id: &'a str,
    success: bool,
    duration_ms: u128,
    error: &'a str,
    artifacts: Vec<&'a str>,
    output: &'a str,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let (config, source) = Config::load(&args.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    if source == ConfigSource::CreatedDefault {
        tracing::info!(path = %args.config.display(), "Wrote default configuration");
    }

    let config = Arc::new(config);
    match args.command {
        Commands::Worker { port } => run_worker(config, port).await,
        Commands::Coordinator { dashboard_port } => run_coordinator(config, dashboard_port).await,
        Commands::Build(build) => run_build(config, build).await,
    }
}

// =============================================================================
// Worker
// =============================================================================

async fn run_worker(config: Arc<Config>, port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let port = port.unwrap_or(config.worker.port);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    let identity = local_identity(&config.worker, port);

    tracing::info!(
        worker_id = %identity.id,
        address = %identity.address,
        port,
        temp_root = %config.build.temp_root().display(),
        "Starting boltbuild worker"
    );

    let shutdown = install_shutdown_handler();
    let server = Arc::new(WorkerServer::new(identity, config.build.sandbox()));
    server.run(listener, shutdown).await;
    Ok(())
}

// =============================================================================
// Coordinator
// =============================================================================

async fn run_coordinator(
    config: Arc<Config>,
    dashboard_port: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    let dashboard_addr: SocketAddr =
        format!("0.0.0.0:{}", dashboard_port.unwrap_or(config.dashboard.port)).parse()?;

    tracing::info!(
        ports = ?config.coordinator.discovery.ports,
        environments = config.build.environments.len(),
        dashboard_addr = %dashboard_addr,
        "Starting boltbuild coordinator"
    );

    let shutdown = install_shutdown_handler();
    let coordinator = Coordinator::new(config);
    let background = coordinator.spawn_background(shutdown.clone());

    let state = DashboardState { coordinator };
    run_dashboard(dashboard_addr, state, shutdown.clone()).await;

    // The dashboard only returns early if it could not bind.
    shutdown.cancel();
    for handle in background {
        let _ = handle.await;
    }
    Ok(())
}

// =============================================================================
// One-shot build
// =============================================================================

async fn run_build(config: Arc<Config>, args: BuildArgs) -> Result<(), Box<dyn std::error::Error>> {
    let coordinator = Coordinator::new(config.clone());
    let shutdown = CancellationToken::new();

    let target = match &args.worker {
        Some(addr) => {
            coordinator
                .connect(addr, config.coordinator.discovery.connect_timeout())
                .await?;
            SubmitTarget::Address(addr.clone())
        }
        None => {
            coordinator.spawn_background(shutdown.clone());
            wait_for_worker(&coordinator, Duration::from_secs(args.wait_secs)).await;
            SubmitTarget::Any
        }
    };

    let result = coordinator.submit_build(&args.environment, target).await;
    shutdown.cancel();
    let result = result?;

    print_result(&result, &args.output)?;
    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

async fn wait_for_worker(coordinator: &Coordinator, wait: Duration) {
    let deadline = tokio::time::Instant::now() + wait;
    while coordinator.registry().is_empty().await && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

fn print_result(result: &JobResult, output_format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let mut artifacts: Vec<&str> = result.output_files.keys().map(String::as_str).collect();
    artifacts.sort_unstable();

    match output_format {
        OutputFormat::Json => {
            let output = BuildOutput {
                job_id: &result.id,
                success: result.success,
                duration_ms: result.duration.as_millis(),
                error: &result.error,
                artifacts,
                output: &result.output,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job ID:    {}", result.id);
            println!("Status:    {}", if result.success { "succeeded" } else { "failed" });
            println!("Duration:  {:.2?}", result.duration);
            if !result.error.is_empty() {
                println!("Error:     {}", result.error);
            }
            if !artifacts.is_empty() {
                println!("Artifacts:");
                for path in artifacts {
                    println!("  {}", path);
                }
            }
            if !result.output.is_empty() {
                println!("Output:");
                for line in result.output.lines() {
                    println!("  {}", line);
                }
            }
        }
    }
    Ok(())
}
