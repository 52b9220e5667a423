//! The serving side: one shared socket, one task per transfer.

pub mod dispatch;
pub mod session;

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use stunclient::StunClient;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::protocol::UFT_BUFFER_SIZE;
use crate::shutdown_mgr::ShutdownManager;
use crate::store::FileStore;
use crate::wire;

pub use dispatch::Dispatcher;
pub use session::{SessionOutcome, SessionTable, Slot};

pub struct Server {
    socket: Arc<UdpSocket>,
    store: FileStore,
    config: ServerConfig,
    shutdown: ShutdownManager,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Server> {
        let socket = UdpSocket::bind(config.bind)
            .await
            .map_err(Error::Transport)?;
        Ok(Server {
            socket: Arc::new(socket),
            store: FileStore::new(config.root.clone()),
            config,
            shutdown: ShutdownManager::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(Error::Transport)
    }

    /// Triggering the returned manager stops `listen` and every running session.
    pub fn shutdown_handle(&self) -> ShutdownManager {
        self.shutdown.clone()
    }

    /// Asks `stun_server` which address this socket is reachable at from outside.
    pub async fn public_addr(&self, stun_server: &str) -> Result<SocketAddr> {
        let stun_addr = lookup_host(stun_server)
            .await
            .map_err(Error::Transport)?
            .find(|addr| addr.is_ipv4())
            .ok_or_else(|| {
                Error::Transport(std::io::Error::new(
                    ErrorKind::NotFound,
                    format!("no IPv4 address for {stun_server}"),
                ))
            })?;
        StunClient::new(stun_addr)
            .query_external_address_async(&self.socket)
            .await
            .map_err(|e| Error::Transport(std::io::Error::other(format!("{e:?}"))))
    }

    /// Serves until shutdown, or until an exit request has drained every session.
    pub async fn listen(&mut self) -> Result<()> {
        if let Some(stun_server) = self.config.stun_server.clone() {
            match self.public_addr(&stun_server).await {
                Ok(public) => info!(%public, "public address"),
                Err(e) => warn!(server = %stun_server, error = %e, "STUN query failed"),
            }
        }

        let table = Arc::new(SessionTable::new());
        let (outcome_tx, mut outcome_rx) = mpsc::channel(self.config.max_sessions);
        let mut dispatcher = Dispatcher::new(
            self.socket.clone(),
            self.store.clone(),
            table.clone(),
            self.config.clone(),
            self.shutdown.clone(),
            outcome_tx,
        );
        let mut shutdown = self.shutdown.clone();
        let mut in_buffer = vec![0u8; UFT_BUFFER_SIZE];
        info!(
            addr = %self.local_addr()?,
            root = %self.store.root().display(),
            "server is now listening"
        );

        let offer_ttl = self.config.retry.total_wait();
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut in_buffer) => {
                    let (len, peer) = match received {
                        Ok(received) => received,
                        Err(e) if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset) => {
                            debug!(error = %e, "peer went away");
                            continue;
                        }
                        Err(e) => return Err(Error::Transport(e)),
                    };
                    match wire::decode(&in_buffer[..len]) {
                        Ok(packet) => {
                            if let Err(e) = dispatcher.dispatch(peer, packet).await {
                                warn!(%peer, error = %e, "dropping packet");
                            }
                        }
                        Err(e) => warn!(%peer, error = %e, "dropping malformed packet"),
                    }
                }
                Some(outcome) = outcome_rx.recv() => {
                    table.finish(&outcome.peer, outcome.id);
                    log_outcome(&outcome);
                }
                _ = shutdown.recv() => {
                    info!(active = table.active_count(), "terminating server");
                    return Ok(());
                }
                // lets unanswered offers expire while draining
                _ = tokio::time::sleep(self.config.retry.initial()), if dispatcher.is_draining() => {}
            }

            // an offered GET counts until its client has had time to accept
            if dispatcher.is_draining() && !table.is_busy(offer_ttl) {
                info!("all sessions finished, exiting");
                return Ok(());
            }
        }
    }
}

fn log_outcome(outcome: &SessionOutcome) {
    let SessionOutcome {
        id,
        peer,
        verb,
        filename,
        result,
    } = outcome;
    match result {
        Ok(Some(report)) => info!(%peer, id, %verb, %report, "transfer finished"),
        Ok(None) => info!(%peer, id, %verb, file = %filename, "transfer ended"),
        Err(Error::Cancelled) => info!(%peer, id, %verb, file = %filename, "transfer cancelled"),
        Err(e) => warn!(%peer, id, %verb, file = %filename, error = %e, "transfer aborted"),
    }
}
