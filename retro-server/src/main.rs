//! Retro server binary
//!
//! Serves retrospective rooms over WebSockets at `/ws/retro/<room-id>/`.
//! Every flag can also be set through a `RETRO_*` environment variable;
//! log output is controlled with `RUST_LOG`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{info, warn};
use retro_collab::{RetroServer, ServerConfig, SessionRegistry};
use retro_core::{RetroRules, TopicMatching, Workspace};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "retro-server")]
#[command(version, about = "Real-time collaborative retrospective server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    options: ServerOptions,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept connections (default)
    Serve,
    /// Create a new room record and print its id
    CreateRoom,
}

#[derive(Args, Debug)]
struct ServerOptions {
    /// Address to listen on
    #[arg(long, env = "RETRO_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory for room records; rooms live in memory when unset
    #[arg(long, env = "RETRO_STORAGE", value_name = "DIR")]
    storage: Option<PathBuf>,

    /// Frames queued per connection before it is dropped as a slow consumer
    #[arg(long, env = "RETRO_OUTBOUND_CAPACITY", default_value_t = 256)]
    outbound_capacity: usize,

    /// Refuse connections to rooms without a record
    #[arg(long, env = "RETRO_NO_AUTO_CREATE")]
    no_auto_create: bool,

    /// Cap on votes per person
    #[arg(long, env = "RETRO_MAX_VOTES")]
    max_votes: Option<usize>,

    /// How topic text is matched when several topics share it
    #[arg(long, env = "RETRO_TOPIC_MATCHING", value_enum, default_value = "first-match")]
    topic_matching: MatchingArg,

    /// Evict rooms with no connections after this many idle seconds
    #[arg(long, env = "RETRO_IDLE_EVICTION_SECS")]
    idle_eviction_secs: Option<u64>,

    /// Seconds between eviction sweeps
    #[arg(long, env = "RETRO_SWEEP_INTERVAL_SECS", default_value_t = 30)]
    sweep_interval_secs: u64,

    /// Workspace width used for initial topic placement
    #[arg(long, env = "RETRO_WIDTH", default_value_t = 1400)]
    width: i32,

    /// Workspace height used for initial topic placement
    #[arg(long, env = "RETRO_HEIGHT", default_value_t = 800)]
    height: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum MatchingArg {
    FirstMatch,
    FirstUnclaimed,
}

impl From<MatchingArg> for TopicMatching {
    fn from(arg: MatchingArg) -> Self {
        match arg {
            MatchingArg::FirstMatch => TopicMatching::FirstMatch,
            MatchingArg::FirstUnclaimed => TopicMatching::FirstUnclaimed,
        }
    }
}

impl ServerOptions {
    fn to_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            outbound_capacity: self.outbound_capacity.max(1),
            workspace: Workspace::new(self.width, self.height),
            storage_path: self.storage.clone(),
            auto_create_rooms: !self.no_auto_create,
            rules: RetroRules {
                max_votes: self.max_votes,
                topic_matching: self.topic_matching.into(),
            },
            idle_eviction_secs: self.idle_eviction_secs,
            sweep_interval_secs: self.sweep_interval_secs.max(1),
        }
    }
}

async fn serve(config: ServerConfig) -> Result<(), BoxError> {
    info!(
        "Starting retro server on {} (storage: {})",
        config.bind_addr,
        config
            .storage_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "memory".to_string())
    );
    if config.storage_path.is_none() && !config.auto_create_rooms {
        warn!("No storage configured and auto-create is off; every connection will be refused");
    }

    let server = RetroServer::new(config)?;
    server.run().await
}

async fn create_room(config: ServerConfig) -> Result<(), BoxError> {
    if config.storage_path.is_none() {
        warn!("No storage configured; the room will not outlive this process");
    }

    let store = config.open_store()?;
    let registry = SessionRegistry::new(config.registry_config(), store);
    let room = registry.create_room().await?;

    println!("{room}");
    println!("ws://{}{}", config.bind_addr, room.path());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();

    let cli = Cli::parse();
    let config = cli.options.to_config();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::CreateRoom => create_room(config).await,
    }
}
