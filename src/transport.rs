//! Datagram transport: one peer per link, receive with a deadline.

use std::future::Future;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::UFT_BUFFER_SIZE;
use crate::shutdown_mgr::ShutdownManager;
use crate::wire::{self, Packet};

/// The packet channel a transfer runs over.
pub trait Link: Send {
    fn peer(&self) -> SocketAddr;

    fn send(&mut self, packet: &Packet) -> impl Future<Output = Result<()>> + Send;

    /// Next packet from the peer, or `None` once `wait` has passed without one.
    fn recv(&mut self, wait: Duration) -> impl Future<Output = Result<Option<Packet>>> + Send;
}

pub async fn send_to(socket: &UdpSocket, peer: SocketAddr, packet: &Packet) -> Result<()> {
    let bytes = wire::encode(packet)?;
    socket
        .send_to(&bytes, peer)
        .await
        .map_err(Error::Transport)?;
    Ok(())
}

/// Client side: a socket connected to the server.
#[derive(Debug)]
pub struct SocketLink {
    socket: UdpSocket,
    peer: SocketAddr,
    buf: Vec<u8>,
}

impl SocketLink {
    pub async fn connect(server: SocketAddr) -> Result<SocketLink> {
        let local: SocketAddr = if server.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(local).await.map_err(Error::Transport)?;
        socket.connect(server).await.map_err(Error::Transport)?;
        Ok(SocketLink {
            socket,
            peer: server,
            buf: vec![0u8; UFT_BUFFER_SIZE],
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(Error::Transport)
    }

    /// Throws away datagrams already queued, such as late answers to an
    /// earlier command. Returns how many were dropped.
    pub fn discard_pending(&mut self) -> usize {
        let mut discarded = 0;
        while self.socket.try_recv(&mut self.buf).is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!(peer = %self.peer, discarded, "discarded stale datagrams");
        }
        discarded
    }
}

impl Link for SocketLink {
    fn peer(&self) -> SocketAddr {
        self.peer
    }

    async fn send(&mut self, packet: &Packet) -> Result<()> {
        let bytes = wire::encode(packet)?;
        self.socket.send(&bytes).await.map_err(Error::Transport)?;
        Ok(())
    }

    async fn recv(&mut self, wait: Duration) -> Result<Option<Packet>> {
        let deadline = Instant::now() + wait;
        loop {
            let len = match timeout_at(deadline, self.socket.recv(&mut self.buf)).await {
                Err(_) => return Ok(None),
                Ok(Ok(len)) => len,
                // ICMP port unreachable from an earlier send; the server may come back.
                Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => {
                    debug!(peer = %self.peer, "connection refused, still waiting");
                    continue;
                }
                Ok(Err(e)) => return Err(Error::Transport(e)),
            };
            match wire::decode(&self.buf[..len]) {
                Ok(packet) => return Ok(Some(packet)),
                Err(e) => warn!(peer = %self.peer, error = %e, "dropping malformed packet"),
            }
        }
    }
}

/// Server side: a session's view of the shared socket. Packets arrive through
/// the dispatcher, replies go straight out.
#[derive(Debug)]
pub struct PeerLink {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    inbox: mpsc::Receiver<Packet>,
    shutdown: ShutdownManager,
}

impl PeerLink {
    pub fn new(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        inbox: mpsc::Receiver<Packet>,
        shutdown: ShutdownManager,
    ) -> PeerLink {
        PeerLink {
            socket,
            peer,
            inbox,
            shutdown,
        }
    }
}

impl Link for PeerLink {
    fn peer(&self) -> SocketAddr {
        self.peer
    }

    async fn send(&mut self, packet: &Packet) -> Result<()> {
        send_to(&self.socket, self.peer, packet).await
    }

    async fn recv(&mut self, wait: Duration) -> Result<Option<Packet>> {
        tokio::select! {
            received = timeout(wait, self.inbox.recv()) => match received {
                Err(_) => Ok(None),
                Ok(Some(packet)) => Ok(Some(packet)),
                // the dispatcher dropped our entry
                Ok(None) => Err(Error::Cancelled),
            },
            _ = self.shutdown.recv() => Err(Error::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Verb;

    #[tokio::test]
    async fn socket_link_skips_malformed_datagrams() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut link = SocketLink::connect(server.local_addr().unwrap()).await.unwrap();
        let client = link.local_addr().unwrap();

        server.send_to(b"garbage", client).await.unwrap();
        send_to(&server, client, &Packet::data(4, &b"ok"[..])).await.unwrap();

        let packet = link.recv(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(packet, Packet::data(4, &b"ok"[..]));
    }

    #[tokio::test]
    async fn discard_pending_empties_the_queue() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut link = SocketLink::connect(server.local_addr().unwrap()).await.unwrap();
        let client = link.local_addr().unwrap();

        for seq in 0..2 {
            send_to(&server, client, &Packet::data(seq, &b"old"[..])).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(link.discard_pending(), 2);
        assert!(link.recv(Duration::from_millis(50)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn socket_link_times_out() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut link = SocketLink::connect(server.local_addr().unwrap()).await.unwrap();
        let got = link.recv(Duration::from_millis(50)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn peer_link_sends_through_shared_socket() {
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (_tx, rx) = mpsc::channel(4);
        let mut link = PeerLink::new(
            server.clone(),
            client.local_addr().unwrap(),
            rx,
            ShutdownManager::new(),
        );

        link.send(&Packet::command(Verb::List, "")).await.unwrap();
        let mut buf = [0u8; 64];
        let (len, from) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(from, server.local_addr().unwrap());
        assert_eq!(wire::decode(&buf[..len]).unwrap().verb(), Some(Verb::List));
    }

    #[tokio::test]
    async fn peer_link_stops_on_shutdown() {
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let (_tx, rx) = mpsc::channel(4);
        let shutdown = ShutdownManager::new();
        let mut link = PeerLink::new(server, "127.0.0.1:9".parse().unwrap(), rx, shutdown.clone());
        shutdown.send();
        assert!(matches!(
            link.recv(Duration::from_secs(5)).await,
            Err(Error::Cancelled)
        ));
    }
}
