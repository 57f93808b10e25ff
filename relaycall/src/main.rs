mod bootstrap;
mod console;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use relaycall_core::credentials::StaticCredentialStore;
use relaycall_core::traits::SignalingTransport;
use relaycall_core::{logging, CoordinatorDeps, EndReason, Error, SessionCoordinator};
use relaycall_media::WebRtcNegotiator;
use relaycall_relay::RelayClient;
use relaycall_signaling::SignalingChannel;

#[derive(Debug, Parser)]
#[command(name = "relaycall", version, about = "Join a relayed multi-party call from a terminal")]
struct Cli {
    /// Config file (YAML or TOML)
    #[arg(short, long, env = "RELAYCALL_CONFIG_PATH")]
    config: Option<String>,

    /// Accept the call as soon as it is offered
    #[arg(long)]
    auto_accept: bool,

    /// Override `logging.level`
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let mut config = bootstrap::load_config(cli.config.as_deref());
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(Error::Configuration(format!(
            "validation failed with {} error(s)",
            errors.len()
        ))
        .into());
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("RelayCall starting...");

    // 3. Collaborators
    let signaling = Arc::new(SignalingChannel::new(&config.signaling));
    let relay = Arc::new(RelayClient::from_config(&config.relay)?);
    info!(signaling = %config.signaling.url, relay = %relay.base_url(), "Endpoints");
    let negotiator = Arc::new(WebRtcNegotiator::new(&config.media).await?);
    let credentials = Arc::new(StaticCredentialStore::from_config(&config.credentials));

    let mut remote_tracks = negotiator.subscribe_remote_tracks();
    tokio::spawn(async move {
        loop {
            match remote_tracks.recv().await {
                Ok(remote) => info!(
                    mid = ?remote.mid,
                    track = %remote.track.id(),
                    kind = %remote.track.kind(),
                    "Receiving remote media"
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed remote track notifications"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // 4. Coordinator
    let deps = CoordinatorDeps {
        signaling: signaling.clone(),
        relay,
        negotiator,
        credentials,
    };
    let (coordinator, handle) = SessionCoordinator::new(&config, deps);

    tokio::spawn(console::print_events(handle.subscribe()));
    let mut task = coordinator.spawn();

    if cli.auto_accept {
        handle.accept().await?;
    }
    tokio::spawn(console::read_commands(handle.clone()));

    // 5. Run until the call ends or the user interrupts
    let snapshot = tokio::select! {
        result = &mut task => result?,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Failed to listen for ctrl-c");
            }
            info!("Interrupted, leaving call");
            if let Err(e) = handle.leave().await {
                warn!(error = %e, "Leave not delivered");
            }
            task.await?
        }
    };

    signaling.disconnect().await;
    println!("{}", console::describe_snapshot(&snapshot));

    match snapshot.end_reason {
        Some(EndReason::Failed(e)) => Err(anyhow::anyhow!("Call failed: {e}")),
        _ => {
            info!("RelayCall finished");
            Ok(())
        }
    }
}
