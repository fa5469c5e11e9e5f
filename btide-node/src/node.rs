//! Node state shared by the console and the accept loop.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail};
use btide_core::registry::{self, AddedPackage};
use btide_core::session::{self, FetchReport, TransferError};
use btide_core::{Package, Registry, SharedRegistry};

use crate::config::Config;
use crate::peers::{self, PeerTable, SharedPeers};

/// Registry entry as shown by PACKAGES.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageStatus {
    pub ident: String,
    pub path: PathBuf,
    pub complete: bool,
}

pub struct Node {
    pub config: Config,
    pub registry: SharedRegistry,
    pub peers: SharedPeers,
}

impl Node {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: Registry::new().shared(),
            peers: PeerTable::new().shared(),
        }
    }

    fn wait(&self) -> Duration {
        Duration::from_secs(self.config.receive_timeout_secs)
    }

    pub async fn connect(&self, addr: SocketAddr) -> anyhow::Result<()> {
        if self.peers.lock().await.outbound(&addr).is_some() {
            bail!("already connected to {addr}");
        }
        let link = peers::connect(addr, self.wait()).await?;
        if !self.peers.lock().await.add_outbound(addr, link.clone()) {
            peers::disconnect(addr, link).await;
            bail!("already connected to {addr}");
        }
        Ok(())
    }

    /// False if `addr` was not connected.
    pub async fn disconnect(&self, addr: SocketAddr) -> bool {
        let link = self.peers.lock().await.remove_outbound(&addr);
        match link {
            Some(link) => {
                peers::disconnect(addr, link).await;
                true
            }
            None => false,
        }
    }

    pub async fn disconnect_all(&self) {
        let links = self.peers.lock().await.drain_outbound();
        for (addr, link) in links {
            peers::disconnect(addr, link).await;
        }
    }

    pub async fn add_package(&self, descriptor: &Path) -> anyhow::Result<AddedPackage> {
        Ok(registry::add_package(&self.registry, descriptor, &self.config.directory).await?)
    }

    pub async fn remove_package(&self, prefix: &str) -> anyhow::Result<Package> {
        Ok(registry::remove_package(&self.registry, prefix).await?)
    }

    /// Current packages with a fresh completion scan of each.
    pub async fn packages(&self) -> anyhow::Result<Vec<PackageStatus>> {
        let packages: Vec<Package> = self.registry.lock().await.iter().cloned().collect();
        let statuses: Vec<PackageStatus> = tokio::task::spawn_blocking(move || {
            packages
                .iter()
                .map(|p| PackageStatus {
                    ident: p.ident().to_string(),
                    path: p.data_path().to_path_buf(),
                    complete: p.scan().map(|c| c.covers(p.manifest())).unwrap_or(false),
                })
                .collect()
        })
        .await?;
        Ok(statuses)
    }

    /// Fetch one chunk of the package matched by `ident` from a connected peer.
    /// A peer whose channel fails is dropped from the table.
    pub async fn fetch(
        &self,
        addr: SocketAddr,
        ident: &str,
        hash: &str,
        resume_offset: u32,
    ) -> anyhow::Result<FetchReport> {
        let link = self
            .peers
            .lock()
            .await
            .outbound(&addr)
            .ok_or_else(|| anyhow!("peer {addr} not in list"))?;
        let package = self
            .registry
            .lock()
            .await
            .find(ident)
            .cloned()
            .ok_or_else(|| anyhow!("package {ident} is not managed"))?;

        let options = self.config.fetch_options();
        let result = {
            let mut stream = link.lock().await;
            session::fetch(&mut *stream, &package, hash, resume_offset, &options).await
        };
        if let Err(
            TransferError::ChannelClosed | TransferError::Timeout(_) | TransferError::Wire(_),
        ) = &result
        {
            if let Some(link) = self.peers.lock().await.remove_outbound(&addr) {
                peers::disconnect(addr, link).await;
            }
        }
        Ok(result?)
    }
}
