// btide node: accept loop, outbound peers and the operator console.

mod config;
mod console;
mod node;
mod peers;
mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::node::Node;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut config_path = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("btide {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            other => bail!("unexpected argument {other}\nusage: btide [--config PATH]"),
        }
    }

    // stdout belongs to the console
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load(config_path.as_deref())?;

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(run(cfg));
    // a pending stdin read would otherwise hold shutdown open
    rt.shutdown_timeout(Duration::from_millis(500));
    result
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", cfg.port))
        .await
        .with_context(|| format!("binding port {}", cfg.port))?;
    tracing::info!(
        port = cfg.port,
        directory = %cfg.directory.display(),
        max_peers = cfg.max_peers,
        "btide {} listening",
        VERSION
    );

    let node = Arc::new(Node::new(cfg));
    let server = tokio::spawn(server::run_server(
        listener,
        node.registry.clone(),
        node.peers.clone(),
        node.config.max_peers,
    ));

    let stdin = BufReader::new(tokio::io::stdin());
    tokio::select! {
        r = console::run_console(&node, stdin, tokio::io::stdout()) => r?,
        r = shutdown_signal() => {
            r?;
            tracing::info!("signal received, shutting down");
        }
    }

    server.abort();
    node.disconnect_all().await;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
