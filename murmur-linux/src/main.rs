// Murmur Linux node: TCP transport, PCM-file call audio, and a small CLI.

mod config;
mod node;
mod pcm;
mod transport;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use murmur_core::{CallState, Envelope, TransferEvent};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::transport::Transport;

#[derive(Parser)]
#[command(name = "murmur", version, about = "Peer-to-peer messaging node")]
struct Cli {
    /// Config file path (default: ~/.config/murmur/config.toml, then /etc/murmur/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Listen for peers and serve transfers and calls until interrupted (default).
    Run,
    /// Send a file to the node at ADDR.
    Send {
        addr: SocketAddr,
        file: PathBuf,
        #[arg(long, default_value = "direct")]
        chat: String,
    },
    /// Send a text message to the node at ADDR.
    Text {
        addr: SocketAddr,
        message: String,
        #[arg(long, default_value = "direct")]
        chat: String,
    },
    /// Call the node at ADDR and hang up after the given time.
    Call {
        addr: SocketAddr,
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load(cli.config.as_deref())?;
    let rt = tokio::runtime::Runtime::new()?;
    // The node is driven from this thread; its blocking teardown stays off the worker pool.
    rt.block_on(run(cfg, cli.command.unwrap_or(Command::Run)))
}

async fn run(cfg: config::Config, command: Command) -> anyhow::Result<()> {
    let peers: transport::PeerSenders = Arc::new(Mutex::new(HashMap::new()));
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let node = node::build(&cfg, peers.clone(), events_tx);
    let transport = Transport::new(node.clone(), cfg.node_name.clone(), peers);

    match command {
        Command::Run => {
            let listener = tokio::spawn(transport.clone().listen(cfg.listen_port));
            tokio::select! {
                res = listener => {
                    res.context("listener task")?.context("listening")?;
                }
                res = shutdown_signal() => {
                    res?;
                    info!("shutting down");
                }
            }
            transport.deliver(node.shutdown()).await;
        }
        Command::Send { addr, file, chat } => {
            let peer = transport.connect(addr).await.with_context(|| format!("connecting to {addr}"))?;
            let path = file.to_string_lossy();
            let start = node
                .send_file(&peer, &path, &chat)
                .with_context(|| format!("opening {}", file.display()))?;
            let Envelope::FileStart { file_id, file_size, .. } = &start.envelope else {
                anyhow::bail!("unexpected announce envelope");
            };
            let file_id = file_id.clone();
            info!(peer = %peer, file_id = %file_id, size = file_size, "sending");
            let done_already = *file_size == 0;
            transport.deliver(vec![start]).await;
            if !done_already {
                tokio::select! {
                    outcome = wait_for_transfer(&mut events, &file_id) => outcome?,
                    res = shutdown_signal() => {
                        res?;
                        transport.deliver(node.cancel_transfer(&file_id)).await;
                        warn!("send interrupted");
                    }
                }
            }
            transport.disconnect(&peer).await;
        }
        Command::Text {
            addr,
            message,
            chat,
        } => {
            let peer = transport.connect(addr).await.with_context(|| format!("connecting to {addr}"))?;
            transport
                .deliver(vec![node.send_text(&peer, &chat, &message)])
                .await;
            transport.disconnect(&peer).await;
        }
        Command::Call { addr, seconds } => {
            let peer = transport.connect(addr).await.with_context(|| format!("connecting to {addr}"))?;
            transport.deliver(vec![node.place_call(&peer)?]).await;
            let deadline = tokio::time::Instant::now() + Duration::from_secs(seconds);
            tokio::select! {
                _ = wait_for_call_end(&node, deadline) => {}
                res = shutdown_signal() => res?,
            }
            transport.deliver(node.hang_up()).await;
            transport.disconnect(&peer).await;
        }
    }
    Ok(())
}

/// Wait for the sender side of `file_id` to complete or fail.
async fn wait_for_transfer(
    events: &mut mpsc::UnboundedReceiver<TransferEvent>,
    file_id: &str,
) -> anyhow::Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            TransferEvent::Completed { progress, sha256 } if progress.file_id == file_id => {
                println!(
                    "sent {} ({} bytes, sha256 {sha256})",
                    progress.file_name, progress.total_size
                );
                return Ok(());
            }
            TransferEvent::Failed { progress, error } if progress.file_id == file_id => {
                anyhow::bail!("transfer of {} failed: {error}", progress.file_name);
            }
            _ => {}
        }
    }
    anyhow::bail!("transfer events closed")
}

/// Return when the call goes back to idle (peer rejected or hung up) or at `deadline`.
async fn wait_for_call_end(node: &node::Node, deadline: tokio::time::Instant) {
    let mut tick = tokio::time::interval(Duration::from_millis(100));
    while tokio::time::Instant::now() < deadline {
        tick.tick().await;
        if node.call_state() == CallState::Idle {
            info!("call ended by peer");
            return;
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
