//! Routes each decoded packet to the session of its sender, or answers it directly.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use super::session::{self, SessionContext, SessionId, SessionOutcome, SessionTable, Slot};
use crate::config::ServerConfig;
use crate::engine::{GetServe, PutReceive, Transfer};
use crate::error::{Error, Result};
use crate::protocol::{
    AckKind, DeleteStatus, Kind, Verb, UFT_MAX_FILE_SIZE, UFT_PREFIX_SIZE,
};
use crate::shutdown_mgr::ShutdownManager;
use crate::store::{FileStore, OpenMode};
use crate::transport::send_to;
use crate::wire::Packet;

/// Largest UDP payload over IPv4, less the frame prefix and subtype.
const LIST_PAYLOAD_LIMIT: usize = 65_507 - UFT_PREFIX_SIZE - 1;

pub struct Dispatcher {
    socket: Arc<UdpSocket>,
    store: FileStore,
    table: Arc<SessionTable>,
    config: ServerConfig,
    shutdown: ShutdownManager,
    outcomes: mpsc::Sender<SessionOutcome>,
    next_id: SessionId,
    draining: bool,
}

impl Dispatcher {
    pub fn new(
        socket: Arc<UdpSocket>,
        store: FileStore,
        table: Arc<SessionTable>,
        config: ServerConfig,
        shutdown: ShutdownManager,
        outcomes: mpsc::Sender<SessionOutcome>,
    ) -> Dispatcher {
        Dispatcher {
            socket,
            store,
            table,
            config,
            shutdown,
            outcomes,
            next_id: 1,
            draining: false,
        }
    }

    /// True once a peer asked the server to exit.
    pub fn is_draining(&self) -> bool {
        self.draining
    }

    pub async fn dispatch(&mut self, peer: SocketAddr, packet: Packet) -> Result<()> {
        match packet.kind {
            Kind::Command => self.command(peer, packet).await,
            Kind::Ack
                if packet.ack_kind() == Some(AckKind::FileSize)
                    && self.table.offer(&peer).is_some() =>
            {
                self.accept_offer(peer).await
            }
            _ => self.forward(peer, packet),
        }
    }

    async fn command(&mut self, peer: SocketAddr, packet: Packet) -> Result<()> {
        let verb = packet
            .verb()
            .ok_or_else(|| Error::violation(format!("unknown command {:?}", packet.subtype)))?;

        let running = self.table.route(&peer);
        if let Some((_, Verb::Put, filename)) = &running {
            if verb == Verb::Put && packet.text() == *filename {
                return self.forward(peer, packet);
            }
        }
        if self.draining {
            info!(%peer, %verb, "server is draining, refusing command");
            return Ok(());
        }
        if let Some((_, running, filename)) = running {
            // a client only moves on once its own side of the transfer is over
            info!(%peer, %verb, %running, file = %filename, "new command supersedes running transfer");
            self.table.abandon(&peer);
        }

        match verb {
            Verb::Get => self.offer(peer, packet.text()).await,
            Verb::Put => self.start_put(peer, packet.text()).await,
            Verb::Delete => self.delete(peer, packet.text()).await,
            Verb::List => self.list(peer, packet.seq).await,
            Verb::Chat => {
                info!(%peer, message = %packet.text(), "chat");
                Ok(())
            }
            Verb::Exit => {
                info!(%peer, active = self.table.active_count(), "exit requested, draining");
                self.draining = true;
                Ok(())
            }
        }
    }

    /// Answers a GET with the file size and remembers the offer.
    async fn offer(&mut self, peer: SocketAddr, filename: String) -> Result<()> {
        let size = match self.store.size(&filename).await {
            Ok(size) if size <= UFT_MAX_FILE_SIZE => Some(size),
            Ok(size) => {
                warn!(%peer, file = %filename, size, "file too large to send");
                None
            }
            Err(Error::FileNotFound(_)) => None,
            Err(e) => {
                warn!(%peer, file = %filename, error = %e, "cannot offer file");
                None
            }
        };
        send_to(&self.socket, peer, &Packet::file_size_ack(size)).await?;
        match size {
            Some(size) => {
                debug!(%peer, file = %filename, size, "file offered");
                self.table.insert(peer, Slot::offered(filename, size));
            }
            None => {
                info!(%peer, file = %filename, "requested file is not available");
                self.table.withdraw_offer(&peer);
            }
        }
        Ok(())
    }

    async fn accept_offer(&mut self, peer: SocketAddr) -> Result<()> {
        let Some((filename, size)) = self.table.offer(&peer) else {
            return Err(Error::SessionNotFound(peer));
        };
        if !self.has_capacity(peer) {
            return Ok(());
        }
        let source = match self.store.open(&filename, OpenMode::Read).await {
            Ok(source) => source,
            Err(e) => {
                self.table.withdraw_offer(&peer);
                return Err(e);
            }
        };
        self.start(peer, Verb::Get, filename, GetServe::new(source, size));
        Ok(())
    }

    async fn start_put(&mut self, peer: SocketAddr, filename: String) -> Result<()> {
        if !self.has_capacity(peer) {
            return Ok(());
        }
        let dest = self.store.open(&filename, OpenMode::Write).await?;
        self.start(peer, Verb::Put, filename, PutReceive::new(dest));
        Ok(())
    }

    fn has_capacity(&self, peer: SocketAddr) -> bool {
        let active = self.table.active_count();
        if active >= self.config.max_sessions {
            warn!(%peer, active, "session limit reached, not starting transfer");
            return false;
        }
        true
    }

    fn start<T>(&mut self, peer: SocketAddr, verb: Verb, filename: String, transfer: T)
    where
        T: Transfer + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        let (inbox_tx, inbox_rx) = mpsc::channel(self.config.inbox_capacity);
        self.table.insert(
            peer,
            Slot::Active {
                id,
                verb,
                filename: filename.clone(),
                inbox: inbox_tx,
            },
        );
        info!(%peer, id, %verb, file = %filename, "transfer started");
        session::spawn(
            transfer,
            SessionContext {
                id,
                peer,
                verb,
                filename,
                socket: self.socket.clone(),
                inbox: inbox_rx,
                shutdown: self.shutdown.clone(),
                policy: self.config.retry,
                outcomes: self.outcomes.clone(),
            },
        );
    }

    async fn delete(&mut self, peer: SocketAddr, filename: String) -> Result<()> {
        let status = match self.store.remove(&filename).await {
            Ok(true) => DeleteStatus::Deleted,
            Ok(false) => DeleteStatus::NotFound,
            Err(e) => {
                warn!(%peer, file = %filename, error = %e, "delete failed");
                DeleteStatus::NotFound
            }
        };
        info!(%peer, file = %filename, ?status, "delete");
        let reply = Packet::ack(AckKind::Delete, status.code(), filename);
        send_to(&self.socket, peer, &reply).await
    }

    /// Answers with the directory listing under the request's sequence number.
    async fn list(&mut self, peer: SocketAddr, request: u32) -> Result<()> {
        let names = self.store.list_names().await?;
        let listing = join_within(&names, LIST_PAYLOAD_LIMIT);
        debug!(%peer, entries = names.len(), bytes = listing.len(), "list");
        send_to(&self.socket, peer, &Packet::ack(AckKind::List, request, listing)).await
    }

    fn forward(&self, peer: SocketAddr, packet: Packet) -> Result<()> {
        let Some((inbox, _, _)) = self.table.route(&peer) else {
            return Err(Error::SessionNotFound(peer));
        };
        match inbox.try_send(packet) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(packet)) => {
                warn!(%peer, kind = ?packet.kind, seq = packet.seq, "session inbox full, dropping");
                Ok(())
            }
            // the session is ending; its outcome will clear the slot
            Err(TrySendError::Closed(_)) => Ok(()),
        }
    }
}

/// Joins names with '\n', keeping only whole names that fit in `limit` bytes.
fn join_within(names: &[String], limit: usize) -> String {
    let mut out = String::new();
    for name in names {
        let extra = name.len() + usize::from(!out.is_empty());
        if out.len() + extra > limit {
            break;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(name);
    }
    out
}
