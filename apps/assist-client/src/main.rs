mod assistance;
mod backend;
mod config;
mod runner;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use peer_signal::PeerId;

use crate::config::AppConfig;

#[derive(Parser, Debug)]
#[command(name = "assist-client")]
#[command(about = "Remote assistance client: answers calls and follows session instructions")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Relay host (overrides ASSIST_RELAY_HOST)
    #[arg(long, global = true)]
    relay_host: Option<String>,

    /// Relay port (overrides ASSIST_RELAY_PORT)
    #[arg(long, global = true)]
    relay_port: Option<u16>,

    /// Use ws/http instead of wss/https for the relay
    #[arg(long, global = true)]
    insecure: bool,

    /// Peer id to register under (overrides ASSIST_PEER_ID)
    #[arg(long, global = true)]
    peer_id: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect, register with the backend and wait for requests (default)
    Run,
    /// List the peers currently connected to the relay
    Peers,
}

impl Cli {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(host) = &self.relay_host {
            config.relay.host = host.clone();
        }
        if let Some(port) = self.relay_port {
            config.relay.port = port;
        }
        if self.insecure {
            config.relay.secure = false;
        }
        if let Some(peer_id) = self.peer_id.as_deref().filter(|id| !id.is_empty()) {
            config.peer.peer_id = Some(PeerId::new(peer_id));
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let mut config = AppConfig::from_env();
    cli.apply(&mut config);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => runner::run(config).await,
        Commands::Peers => runner::list_peers(config).await,
    }
}
