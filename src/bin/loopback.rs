//! Churn Loopback Demo
//!
//! Runs two bridging peers in one process and relays their signalling
//! directly between them:
//! - `alice` negotiates with the configured provider
//! - `bob` answers with whatever provider alice offered
//! - once connected, alice sends a message and bob echoes it back

use anyhow::{anyhow, Context, Result};
use churn_tunnel::{
    config::{generate_example_config, Config, LoggingConfig},
    peer::{DataChannel, PeerConnection, UdpPeerFactory},
    BridgingPeerConnection, ProviderType, SignallingMessage,
};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Upper bound on connection establishment
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

type Bridge = BridgingPeerConnection<UdpPeerFactory>;

/// Churn loopback - two obfuscated peers talking over localhost
#[derive(Parser, Debug)]
#[command(name = "churn-loopback")]
#[command(about = "Connect two churn peers over localhost and exchange a message")]
#[command(version)]
struct Args {
    /// Configuration file path (defaults are used if it does not exist)
    #[arg(short, long, default_value = "churn.toml")]
    config: String,

    /// Write an example configuration to the config path and exit
    #[arg(long)]
    generate_config: bool,

    /// Provider alice offers (PLAIN, CHURN, HOLO_ICE; overrides config)
    #[arg(short, long)]
    provider: Option<ProviderType>,

    /// Message alice sends
    #[arg(short, long, default_value = "hello from alice")]
    message: String,

    /// Log level (overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

fn init_logging(logging: &LoggingConfig, level: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_new(level.unwrap_or(&logging.level))
        .with_context(|| format!("Invalid log level {:?}", logging.level))?;
    let writer = match &logging.file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("Failed to open log file {}", path))?;
            BoxMakeWriter::new(std::sync::Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    match logging.format.as_str() {
        "compact" => builder.compact().init(),
        _ => builder.pretty().init(),
    }
    Ok(())
}

/// Forward every envelope from one bridge into the other
fn relay(name: &'static str, mut signals: mpsc::UnboundedReceiver<SignallingMessage>, to: Arc<Bridge>) {
    tokio::spawn(async move {
        while let Some(message) = signals.recv().await {
            match message.to_json() {
                Ok(json) => debug!("{} -> {}", name, json),
                Err(e) => warn!("{}: cannot encode signal: {}", name, e),
            }
            if let Err(e) = to.handle_signal_message(message).await {
                warn!("{}: relay failed: {}", name, e);
            }
        }
    });
}

/// Echo every message on channels bob receives
fn echo(mut channels: mpsc::UnboundedReceiver<DataChannel>) {
    tokio::spawn(async move {
        while let Some(mut channel) = channels.recv().await {
            info!("bob: peer opened channel {}", channel.label());
            tokio::spawn(async move {
                while let Some(payload) = channel.recv().await {
                    if channel.send(payload).is_err() {
                        break;
                    }
                }
            });
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        generate_example_config()
            .save(&args.config)
            .context("Failed to write example config")?;
        println!("Wrote example configuration to {}", args.config);
        return Ok(());
    }

    let config = if Path::new(&args.config).exists() {
        Config::load(&args.config).context("Failed to load configuration")?
    } else {
        Config::default()
    };
    init_logging(&config.logging, args.log_level.as_deref())?;

    let provider = args.provider.unwrap_or(config.bridge.provider);
    info!("churn-loopback {} offering {}", churn_tunnel::VERSION, provider);

    let mut alice = Bridge::new(provider, "alice", UdpPeerFactory::default(), config.churn.clone())
        .with_pipe_config(config.pipe.clone());
    let mut bob = Bridge::best("bob", UdpPeerFactory::default(), config.churn.clone())
        .with_pipe_config(config.pipe.clone());

    let alice_signals = alice
        .take_signal_queue()
        .ok_or_else(|| anyhow!("alice signal queue taken"))?;
    let bob_signals = bob
        .take_signal_queue()
        .ok_or_else(|| anyhow!("bob signal queue taken"))?;
    let bob_channels = bob
        .take_channel_queue()
        .ok_or_else(|| anyhow!("bob channel queue taken"))?;

    let alice = Arc::new(alice);
    let bob = Arc::new(bob);
    relay("alice", alice_signals, bob.clone());
    relay("bob", bob_signals, alice.clone());
    echo(bob_channels);

    alice.negotiate_connection().await.context("Negotiation failed")?;
    timeout(CONNECT_TIMEOUT, alice.state().once_connected())
        .await
        .context("Timed out connecting")??;
    info!(
        "connected: alice={:?} bob={:?}",
        alice.provider_type().await,
        bob.provider_type().await
    );

    let mut chat = alice.open_data_channel("chat").await?;
    chat.send(args.message.clone().into_bytes())?;
    let reply = timeout(Duration::from_secs(5), chat.recv())
        .await
        .context("Timed out waiting for echo")?
        .ok_or_else(|| anyhow!("channel closed before echo"))?;
    println!("alice sent {:?}, bob echoed {:?}", args.message, String::from_utf8_lossy(&reply));

    alice.close().await?;
    timeout(Duration::from_secs(5), bob.state().once_closed())
        .await
        .context("bob did not see the close")?;
    Ok(())
}
