//! Watch one comparison run from the terminal.
//!
//! Configuration comes from `ARENA_*` environment variables (a `.env` file is
//! honoured); flags override them.

mod render;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use arena_stream::observability::init_observability;
use arena_stream::prelude::*;
use arena_stream::{BackendFlavor, RunPhase, TransportKind};
use clap::Parser;

use crate::render::Console;

#[derive(Debug, Parser)]
#[command(name = "arena-watch", about = "Stream every agent of a comparison run, paced per agent")]
struct Cli {
    /// Run to watch.
    run_id: String,
    /// Backend base URL (overrides `ARENA_BASE_URL`).
    #[arg(long)]
    base_url: Option<String>,
    /// `push` or `poll` (overrides `ARENA_TRANSPORT`).
    #[arg(long)]
    transport: Option<TransportKind>,
    /// `gateway` or `direct` (overrides `ARENA_BACKEND_FLAVOR`).
    #[arg(long)]
    flavor: Option<BackendFlavor>,
    /// Reveal rate per agent (overrides `ARENA_CHARS_PER_SECOND`).
    #[arg(long)]
    chars_per_second: Option<u32>,
    /// Poll interval in milliseconds (overrides `ARENA_POLL_INTERVAL_MS`).
    #[arg(long)]
    poll_interval_ms: Option<u64>,
    /// Agent to select as the winner once the run completes.
    #[arg(long)]
    select: Option<String>,
}

impl Cli {
    fn config(&self) -> anyhow::Result<ArenaConfig> {
        self.config_from(|key| std::env::var(key).ok())
    }

    /// Environment first, flags on top.
    fn config_from(&self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<ArenaConfig> {
        let mut config = ArenaConfig::from_vars(self.base_url.as_deref(), lookup)
            .context("loading ARENA_* configuration")?;
        if let Some(kind) = self.transport {
            config.transport = kind;
        }
        if let Some(flavor) = self.flavor {
            config.push.flavor = flavor;
        }
        if let Some(rate) = self.chars_per_second {
            config.coordinator.pacer.chars_per_second = rate;
        }
        if let Some(ms) = self.poll_interval_ms {
            config.poll.interval = Duration::from_millis(ms);
        }
        Ok(config)
    }
}

fn load_env() {
    let _ = dotenvy::from_path(std::path::Path::new(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/.env"
    )));
    let _ = dotenvy::dotenv();
}

fn build_transport(config: &ArenaConfig) -> anyhow::Result<Arc<dyn TransportAdapter>> {
    let transport: Arc<dyn TransportAdapter> = match config.transport {
        TransportKind::Push => Arc::new(PushTransport::new(config.push.clone())?),
        TransportKind::Poll => Arc::new(PollTransport::new(config.poll.clone())?),
    };
    Ok(transport)
}

/// True once the run is over and every agent has drained.
async fn run_finished(coordinator: &StreamCoordinator) -> anyhow::Result<bool> {
    let snapshot = coordinator.snapshot().await?;
    Ok(snapshot.phase == Some(RunPhase::Completed) && snapshot.agents.is_empty())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env();
    init_observability();
    let cli = Cli::parse();
    let config = cli.config()?;
    tracing::info!(run_id = %cli.run_id, transport = ?config.transport, "watching run");

    let (sink, mut rendered) = ChannelSink::new();
    let coordinator = StreamCoordinator::builder()
        .transport(build_transport(&config)?)
        .sink(Arc::new(sink))
        .config(config.coordinator.clone())
        .build()?;
    coordinator.start(cli.run_id.as_str()).await?;

    let mut console = Console::default();
    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            event = rendered.recv() => {
                let Some(event) = event else { break };
                console.render(&event, &mut stdout)?;
                match event {
                    SinkEvent::ConnectionState(ConnectionState::Error) => {
                        coordinator.stop().await?;
                        anyhow::bail!("run {} could not be streamed", cli.run_id);
                    }
                    SinkEvent::Complete { .. }
                    | SinkEvent::ConnectionState(ConnectionState::Disconnected) => {
                        if run_finished(&coordinator).await? {
                            break;
                        }
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                coordinator.stop().await?;
                return Ok(());
            }
        }
    }

    if let Some(agent) = cli.select.as_deref() {
        if !console.completed().contains(&AgentId::new(agent)) {
            tracing::warn!(agent_id = agent, "selected agent never completed in this session");
        }
        coordinator.select(cli.run_id.as_str(), agent).await?;
        println!("selected {agent} for run {}", cli.run_id);
    }
    coordinator.stop().await?;
    Ok(())
}
