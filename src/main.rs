use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use fleet_agent::config::AgentConfig;
use fleet_agent::shutdown::install_shutdown_handler;
use fleet_agent::Agent;

#[derive(Parser, Debug)]
#[command(name = "fleet-agent")]
#[command(version)]
#[command(about = "Host agent that runs scripts and file commands for a control plane")]
struct Args {
    /// Control-plane endpoints (ws:// or wss://); repeat or comma-separate
    #[arg(long = "server", required = true, value_delimiter = ',')]
    servers: Vec<String>,

    /// File caching the agent id across restarts
    #[arg(long, default_value = "uuid.txt")]
    identity_file: PathBuf,

    /// SQLite file holding task history
    #[arg(long, default_value = "tasks.db")]
    store: PathBuf,

    /// Number of dispatch workers
    #[arg(long, default_value = "10")]
    workers: usize,

    /// Capacity of the inbound message queue
    #[arg(long, default_value = "10")]
    queue_capacity: usize,

    /// Keepalive interval in seconds
    #[arg(long, default_value = "60", value_parser = clap::value_parser!(u64).range(1..))]
    heartbeat_secs: u64,

    /// Delay between connect and registration attempts in seconds
    #[arg(long, default_value = "5", value_parser = clap::value_parser!(u64).range(1..))]
    retry_secs: u64,

    /// Directory for script and output temp files (defaults to the OS temp dir)
    #[arg(long)]
    temp_dir: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> AgentConfig {
        let mut config = AgentConfig::new(self.servers);
        config.identity_path = self.identity_file;
        config.store_path = self.store;
        config.dispatch.workers = self.workers;
        config.dispatch.queue_capacity = self.queue_capacity;
        config.connection.heartbeat_interval = Duration::from_secs(self.heartbeat_secs);
        config.connection.connect_retry_delay = Duration::from_secs(self.retry_secs);
        config.connection.register_retry_delay = Duration::from_secs(self.retry_secs);
        config.platform.temp_dir = self.temp_dir;
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = args.into_config();
    tracing::info!(
        servers = ?config.servers,
        workers = config.dispatch.workers,
        "Starting fleet-agent"
    );

    let agent = Agent::new(config)?;
    let shutdown = install_shutdown_handler();
    agent.run(shutdown).await?;
    Ok(())
}
