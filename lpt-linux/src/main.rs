// lpt daemon: hosts both long-poll plugin roles on one dispatcher task.

mod channels;
mod config;
mod http;
mod node;

use lpt_core::PeerId;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> Result<(), Box<dyn std::error::Error>> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("lpt-linux {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load();
    let own = cfg.peer_id.unwrap_or_else(PeerId::random);
    let bind = node::listen_addr(cfg.listen_port);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let listener = TcpListener::bind(bind).await?;
        tracing::info!(
            peer = %own,
            %bind,
            public_url = cfg.public_url.as_deref().unwrap_or("-"),
            peers = cfg.peers.len(),
            "lpt-linux {} listening",
            VERSION
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handles = channels::HandleSource::default();
        let mut node = node::Node::new(own, cfg.plugin.clone(), &cfg.peers, events_tx.clone(), handles.clone())?;
        if let Some(url) = &cfg.public_url {
            if let Err(e) = node.serve_on(url) {
                tracing::warn!(%url, error = %e, "ignoring public_url");
            }
        }
        let keepalive = cfg.keepalive_interval(node.keepalive_factor());

        tokio::spawn(async move {
            if let Err(e) = http::run_listener(listener, events_tx, handles).await {
                tracing::error!(error = %e, "listener stopped");
            }
        });
        node::run(node, events_rx, keepalive, async {
            if let Err(e) = shutdown_signal().await {
                tracing::error!(error = %e, "signal handler failed");
            }
        })
        .await;
        Ok::<(), Box<dyn std::error::Error>>(())
    })?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
