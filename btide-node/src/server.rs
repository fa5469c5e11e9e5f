//! Accept loop: greet each inbound peer with HELLO, then answer its packets
//! until it disconnects. At most `max_peers` connections are served at once.

use std::sync::Arc;

use btide_core::session::{serve_request, TransferError};
use btide_core::wire::{read_packet, write_packet, WireError};
use btide_core::{Message, Packet, SharedRegistry};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use crate::peers::SharedPeers;

pub async fn run_server(
    listener: TcpListener,
    registry: SharedRegistry,
    peers: SharedPeers,
    max_peers: usize,
) {
    let slots = Arc::new(Semaphore::new(max_peers));
    loop {
        let (mut stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        let Ok(permit) = slots.clone().try_acquire_owned() else {
            tracing::warn!(%addr, max_peers, "peer limit reached, refusing connection");
            let _ = write_packet(&mut stream, &Packet::new(Message::Disconnect)).await;
            continue;
        };
        let registry = registry.clone();
        let peers = peers.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let _ = stream.set_nodelay(true);
            peers.lock().await.add_inbound(addr);
            tracing::info!(%addr, "peer connected");
            match serve_connection(&mut stream, &registry).await {
                Ok(()) => tracing::info!(%addr, "peer disconnected"),
                Err(e) => tracing::warn!(%addr, error = %e, "peer connection dropped"),
            }
            peers.lock().await.remove_inbound(&addr);
        });
    }
}

/// Send HELLO and answer packets until DISCONNECT or a clean close.
pub async fn serve_connection<S>(stream: &mut S, registry: &SharedRegistry) -> Result<(), TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_packet(stream, &Packet::new(Message::Hello)).await?;
    loop {
        let packet = match read_packet(stream).await {
            Ok(Some(packet)) => packet,
            Ok(None) => return Ok(()),
            Err(WireError::Decode(e)) => {
                tracing::warn!(error = %e, "undecodable packet ignored");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        match packet.message {
            Message::Hello => write_packet(stream, &Packet::new(Message::Ack)).await?,
            Message::Ping => write_packet(stream, &Packet::new(Message::Pong)).await?,
            Message::Disconnect => return Ok(()),
            Message::Ack | Message::Pong => {}
            Message::Request(request) => match serve_request(stream, registry, request).await {
                Ok(_) => {}
                Err(TransferError::Wire(e)) => return Err(e.into()),
                // logged by the responder; the connection stays usable
                Err(_) => {}
            },
            Message::Response(_) => tracing::warn!("unsolicited RESPONSE ignored"),
        }
    }
}
