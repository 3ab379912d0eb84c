use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use meet_client::protocol::PushEvent;
use meet_client::{SessionConfig, SignalEvent, SignalingBridge, SignalingChannel, WsSignaling};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Watches a room on a conferencing signaling server without publishing media.
#[derive(Parser, Debug)]
#[command(name = "meet-probe")]
struct Args {
    /// Signaling server URL (defaults to MEET_SIGNALING_URL or ws://127.0.0.1:8080)
    #[arg(long)]
    url: Option<String>,

    /// Room to watch
    #[arg(long, default_value = "test-room")]
    room: String,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// JSON session config file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .compact()
        .init();

    let mut config = match &args.config {
        Some(path) => SessionConfig::from_file(path)?,
        None => SessionConfig::from_env()?,
    };
    if let Some(url) = args.url {
        config.signaling_url = url;
    }

    let channel = Arc::new(WsSignaling::connect(&config).await?);
    let monitor = channel.monitor();
    let mut signals = channel.subscribe();
    let bridge = SignalingBridge::new(channel, config.request_timeout());

    let caps = bridge.router_capabilities().await?;
    for codec in &caps.codecs {
        info!(kind = %codec.kind, mime_type = %codec.mime_type, clock_rate = codec.clock_rate, "router codec");
    }

    bridge.join_room(&args.room).await?;
    info!(room_id = %args.room, "watching room; Ctrl-C to leave");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            signal = signals.recv() => match signal {
                Ok(SignalEvent::Push(event)) => log_push(&event),
                Ok(SignalEvent::Disconnected) => warn!("signaling lost; reconnecting"),
                Ok(SignalEvent::Reconnected) => {
                    info!(generation = monitor.current().generation, "signaling restored; rejoining");
                    if let Err(e) = bridge.join_room(&args.room).await {
                        error!("rejoin failed: {}", e);
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "dropped signaling events"),
                Err(RecvError::Closed) => {
                    error!("signaling channel closed");
                    return Ok(());
                }
            },
        }
    }

    if let Err(e) = bridge.leave_room(&args.room).await {
        warn!("leave-room failed: {}", e);
    }
    info!(room_id = %args.room, "left room");
    Ok(())
}

fn log_push(event: &PushEvent) {
    match event {
        PushEvent::ExistingProducers { producers, .. } => {
            for producer in producers {
                info!(producer_id = %producer.producer_id, kind = %producer.kind, peer = producer.peer_key(), "existing producer");
            }
        }
        PushEvent::NewProducer { producer, .. } => {
            info!(producer_id = %producer.producer_id, kind = %producer.kind, peer = producer.peer_key(), "new producer");
        }
        PushEvent::ProducerClosed { producer_id, .. } => info!(%producer_id, "producer closed"),
        PushEvent::PeerJoined {
            peer_id,
            display_name,
            ..
        } => info!(%peer_id, display_name = display_name.as_deref().unwrap_or(""), "peer joined"),
        PushEvent::PeerLeft { peer_id, .. } => info!(%peer_id, "peer left"),
        PushEvent::ChatMessage { message, .. } => info!(from = %message.from, "{}", message.text),
    }
}
