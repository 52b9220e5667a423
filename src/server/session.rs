//! Per-peer session bookkeeping for the server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::config::RetryPolicy;
use crate::engine::{drive, Transfer, TransferReport};
use crate::error::Result;
use crate::protocol::Verb;
use crate::shutdown_mgr::ShutdownManager;
use crate::transport::{Link, PeerLink};
use crate::wire::Packet;

pub type SessionId = u64;

/// What the server knows about one peer.
#[derive(Debug)]
pub enum Slot {
    /// A GET was answered with the file size; waiting for the client to accept.
    Offered {
        filename: String,
        size: u64,
        offered_at: Instant,
    },
    /// A transfer task is running; its packets go through `inbox`.
    Active {
        id: SessionId,
        verb: Verb,
        filename: String,
        inbox: mpsc::Sender<Packet>,
    },
}

impl Slot {
    pub fn offered(filename: String, size: u64) -> Slot {
        Slot::Offered {
            filename,
            size,
            offered_at: Instant::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Slot::Active { .. })
    }
}

/// Sent by a session task when it ends, however it ends.
#[derive(Debug)]
pub struct SessionOutcome {
    pub id: SessionId,
    pub peer: SocketAddr,
    pub verb: Verb,
    pub filename: String,
    pub result: Result<Option<TransferReport>>,
}

/// Peer address to slot; at most one slot per peer.
#[derive(Debug, Default)]
pub struct SessionTable {
    slots: DashMap<SocketAddr, Slot>,
}

impl SessionTable {
    pub fn new() -> SessionTable {
        SessionTable::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_active()).count()
    }

    /// True while a transfer runs or an offer younger than `offer_ttl` may
    /// still be accepted.
    pub fn is_busy(&self, offer_ttl: Duration) -> bool {
        self.slots.iter().any(|slot| match slot.value() {
            Slot::Active { .. } => true,
            Slot::Offered { offered_at, .. } => offered_at.elapsed() < offer_ttl,
        })
    }

    pub fn has_active(&self, peer: &SocketAddr) -> bool {
        self.slots.get(peer).is_some_and(|slot| slot.is_active())
    }

    pub fn insert(&self, peer: SocketAddr, slot: Slot) {
        self.slots.insert(peer, slot);
    }

    /// The filename and size offered to `peer`, if its slot is an offer.
    pub fn offer(&self, peer: &SocketAddr) -> Option<(String, u64)> {
        match self.slots.get(peer).as_deref() {
            Some(Slot::Offered { filename, size, .. }) => Some((filename.clone(), *size)),
            _ => None,
        }
    }

    /// Inbox and verb of the session running for `peer`.
    pub fn route(&self, peer: &SocketAddr) -> Option<(mpsc::Sender<Packet>, Verb, String)> {
        match self.slots.get(peer).as_deref() {
            Some(Slot::Active {
                inbox,
                verb,
                filename,
                ..
            }) => Some((inbox.clone(), *verb, filename.clone())),
            _ => None,
        }
    }

    /// Drops the offer made to `peer`, leaving an active session untouched.
    pub fn withdraw_offer(&self, peer: &SocketAddr) {
        self.slots
            .remove_if(peer, |_, slot| matches!(slot, Slot::Offered { .. }));
    }

    /// Forgets whatever `peer` had going. A running session sees its inbox close.
    pub fn abandon(&self, peer: &SocketAddr) -> Option<Slot> {
        self.slots.remove(peer).map(|(_, slot)| slot)
    }

    /// Removes the slot of session `id`. A newer session of the same peer stays.
    pub fn finish(&self, peer: &SocketAddr, id: SessionId) -> bool {
        self.slots
            .remove_if(peer, |_, slot| matches!(slot, Slot::Active { id: current, .. } if *current == id))
            .is_some()
    }
}

/// Everything a session task needs besides its transfer.
pub struct SessionContext {
    pub id: SessionId,
    pub peer: SocketAddr,
    pub verb: Verb,
    pub filename: String,
    pub socket: Arc<UdpSocket>,
    pub inbox: mpsc::Receiver<Packet>,
    pub shutdown: ShutdownManager,
    pub policy: RetryPolicy,
    pub outcomes: mpsc::Sender<SessionOutcome>,
}

/// Runs `transfer` to its end on a task of its own and reports the outcome.
pub fn spawn<T>(mut transfer: T, ctx: SessionContext)
where
    T: Transfer + 'static,
{
    let SessionContext {
        id,
        peer,
        verb,
        filename,
        socket,
        inbox,
        shutdown,
        policy,
        outcomes,
    } = ctx;
    tokio::spawn(async move {
        let mut link = PeerLink::new(socket, peer, inbox, shutdown);
        debug!(%peer, id, %verb, file = %filename, "session started");
        let result = drive(&mut link, &mut transfer, &policy)
            .await
            .map(|()| transfer.report());
        let outcome = SessionOutcome {
            id,
            peer: link.peer(),
            verb,
            filename,
            result,
        };
        // the serve loop may already be gone
        let _ = outcomes.send(outcome).await;
    });
}
