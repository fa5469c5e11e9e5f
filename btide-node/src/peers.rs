//! Peer bookkeeping: outbound links opened from the console and the set of
//! inbound addresses currently served by the accept loop.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use btide_core::session::TransferError;
use btide_core::wire::{read_packet, write_packet};
use btide_core::{Message, Packet, PacketKind};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// One outbound connection. The mutex keeps a single request in flight per peer.
pub type PeerLink = Arc<Mutex<TcpStream>>;

pub type SharedPeers = Arc<Mutex<PeerTable>>;

#[derive(Debug, Default)]
pub struct PeerTable {
    outbound: BTreeMap<SocketAddr, PeerLink>,
    inbound: BTreeSet<SocketAddr>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedPeers {
        Arc::new(Mutex::new(self))
    }

    /// False if `addr` already has a link; the existing one is kept.
    pub fn add_outbound(&mut self, addr: SocketAddr, link: PeerLink) -> bool {
        if self.outbound.contains_key(&addr) {
            return false;
        }
        self.outbound.insert(addr, link);
        true
    }

    pub fn outbound(&self, addr: &SocketAddr) -> Option<PeerLink> {
        self.outbound.get(addr).cloned()
    }

    pub fn remove_outbound(&mut self, addr: &SocketAddr) -> Option<PeerLink> {
        self.outbound.remove(addr)
    }

    pub fn drain_outbound(&mut self) -> Vec<(SocketAddr, PeerLink)> {
        std::mem::take(&mut self.outbound).into_iter().collect()
    }

    pub fn outbound_addrs(&self) -> impl Iterator<Item = &SocketAddr> {
        self.outbound.keys()
    }

    pub fn add_inbound(&mut self, addr: SocketAddr) {
        self.inbound.insert(addr);
    }

    pub fn remove_inbound(&mut self, addr: &SocketAddr) {
        self.inbound.remove(addr);
    }

    pub fn inbound_addrs(&self) -> impl Iterator<Item = &SocketAddr> {
        self.inbound.iter()
    }
}

/// Connecting side of the handshake: expect HELLO, answer ACK.
pub async fn handshake<S>(stream: &mut S, wait: Duration) -> Result<(), TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let packet = match tokio::time::timeout(wait, read_packet(stream)).await {
        Err(_) => return Err(TransferError::Timeout(wait)),
        Ok(read) => read?.ok_or(TransferError::ChannelClosed)?,
    };
    if packet.kind() != PacketKind::Hello {
        return Err(TransferError::ProtocolMismatch {
            expected: PacketKind::Hello,
            got: format!("{:?}", packet.kind()),
        });
    }
    write_packet(stream, &Packet::new(Message::Ack)).await?;
    Ok(())
}

/// Open a TCP connection to `addr` and complete the handshake.
pub async fn connect(addr: SocketAddr, wait: Duration) -> anyhow::Result<PeerLink> {
    let mut stream = tokio::time::timeout(wait, TcpStream::connect(addr))
        .await
        .map_err(|_| TransferError::Timeout(wait))??;
    stream.set_nodelay(true)?;
    handshake(&mut stream, wait).await?;
    tracing::info!(%addr, "connected to peer");
    Ok(Arc::new(Mutex::new(stream)))
}

/// Tell the peer we are leaving and close the link. Errors are logged only.
pub async fn disconnect(addr: SocketAddr, link: PeerLink) {
    let mut stream = link.lock().await;
    if let Err(e) = write_packet(&mut *stream, &Packet::new(Message::Disconnect)).await {
        tracing::debug!(%addr, error = %e, "disconnect notice not delivered");
    }
    let _ = stream.shutdown().await;
    tracing::info!(%addr, "disconnected from peer");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handshake_answers_hello_with_ack() {
        let (mut a, mut b) = tokio::io::duplex(16 * 1024);
        write_packet(&mut b, &Packet::new(Message::Hello)).await.unwrap();
        handshake(&mut a, Duration::from_secs(1)).await.unwrap();
        let reply = read_packet(&mut b).await.unwrap().unwrap();
        assert_eq!(reply.kind(), PacketKind::Ack);
    }

    #[tokio::test]
    async fn handshake_rejects_other_kinds() {
        let (mut a, mut b) = tokio::io::duplex(16 * 1024);
        write_packet(&mut b, &Packet::new(Message::Ping)).await.unwrap();
        assert!(matches!(
            handshake(&mut a, Duration::from_secs(1)).await,
            Err(TransferError::ProtocolMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn handshake_times_out_or_sees_close() {
        let (mut a, b) = tokio::io::duplex(16 * 1024);
        assert!(matches!(
            handshake(&mut a, Duration::from_millis(20)).await,
            Err(TransferError::Timeout(_))
        ));
        drop(b);
        assert!(matches!(
            handshake(&mut a, Duration::from_millis(20)).await,
            Err(TransferError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn table_tracks_links() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();
        let link: PeerLink = Arc::new(Mutex::new(stream));

        let mut table = PeerTable::new();
        assert!(table.add_outbound(addr, link.clone()));
        assert!(!table.add_outbound(addr, link));
        assert!(table.outbound(&addr).is_some());
        assert_eq!(table.outbound_addrs().count(), 1);

        let inbound: SocketAddr = "10.0.0.2:4000".parse().unwrap();
        table.add_inbound(inbound);
        assert_eq!(table.inbound_addrs().collect::<Vec<_>>(), vec![&inbound]);
        table.remove_inbound(&inbound);
        assert_eq!(table.inbound_addrs().count(), 0);

        assert!(table.remove_outbound(&addr).is_some());
        assert!(table.outbound(&addr).is_none());
        assert!(table.drain_outbound().is_empty());
    }
}
