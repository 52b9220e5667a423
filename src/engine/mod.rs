//! Stop-and-wait transfer engine.
//!
//! Each transfer role is a state machine implementing [`Transfer`]: it produces
//! its opening packet, then turns every packet from the peer into at most one
//! reply. [`drive`] owns the waiting: it re-sends the last packet whenever the
//! peer stays silent for the current wait, backing off per [`RetryPolicy`], and
//! gives up with [`Error::Timeout`] once the retries are spent.

pub mod get;
pub mod put;

use std::fmt;
use std::future::Future;
use std::io::Write;

use crypto_hash::{Algorithm, Hasher};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::{Error, Result};
use crate::transport::Link;
use crate::wire::Packet;

pub use get::{GetDownload, GetServe, GetState};
pub use put::{PutReceive, PutState, PutUpload};

pub trait Transfer: Send {
    /// Packet that opens the exchange, if this side speaks first.
    fn start(&mut self) -> impl Future<Output = Result<Option<Packet>>> + Send;

    /// Advances on one packet from the peer and returns the reply, if any.
    fn on_packet(&mut self, packet: Packet) -> impl Future<Output = Result<Option<Packet>>> + Send;

    fn is_finished(&self) -> bool;

    /// Summary of a completed transfer.
    fn report(&self) -> Option<TransferReport>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub filename: String,
    pub bytes: u64,
    pub chunks: u32,
    /// Hex SHA-256 of the bytes that crossed the wire.
    pub sha256: String,
}

impl fmt::Display for TransferReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} bytes in {} chunks, sha256 {})",
            self.filename, self.bytes, self.chunks, self.sha256
        )
    }
}

/// Runs `transfer` over `link` until it finishes.
///
/// Each attempt has a fixed deadline: packets the transfer ignores or rejects
/// do not extend it, so a chatty peer cannot hold off retransmission.
pub async fn drive<L, T>(link: &mut L, transfer: &mut T, policy: &RetryPolicy) -> Result<()>
where
    L: Link,
    T: Transfer,
{
    let peer = link.peer();
    let mut last = transfer.start().await?;
    if let Some(packet) = &last {
        link.send(packet).await?;
    }

    let mut attempt = 0;
    let mut deadline = Instant::now() + policy.wait_for(attempt);
    while !transfer.is_finished() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let Some(packet) = link.recv(remaining).await? else {
            if attempt >= policy.max_retries {
                return Err(Error::Timeout {
                    attempts: attempt + 1,
                    waited: policy.wait_for(attempt),
                });
            }
            attempt += 1;
            if let Some(packet) = &last {
                debug!(%peer, kind = ?packet.kind, seq = packet.seq, attempt, "re-sending");
                link.send(packet).await?;
            }
            deadline = Instant::now() + policy.wait_for(attempt);
            continue;
        };

        match transfer.on_packet(packet).await {
            Ok(Some(reply)) => {
                link.send(&reply).await?;
                last = Some(reply);
                attempt = 0;
                deadline = Instant::now() + policy.wait_for(attempt);
            }
            Ok(None) => {}
            Err(e) if e.is_packet_local() => {
                warn!(%peer, error = %e, "dropping packet");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// SHA-256 fed chunk by chunk as a transfer progresses.
pub(crate) struct Digest {
    hasher: Hasher,
    hex: Option<String>,
}

impl Digest {
    pub(crate) fn new() -> Digest {
        Digest {
            hasher: Hasher::new(Algorithm::SHA256),
            hex: None,
        }
    }

    pub(crate) fn update(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.hasher.write_all(data)
    }

    pub(crate) fn finish(&mut self) -> String {
        if self.hex.is_none() {
            self.hex = Some(hex::encode(self.hasher.finish()));
        }
        self.hex.clone().unwrap_or_default()
    }

    pub(crate) fn value(&self) -> Option<&str> {
        self.hex.as_deref()
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Digest").field("hex", &self.hex).finish()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::protocol::{AckKind, Verb};

    /// Opens with a command and finishes on the first ack.
    struct PingPong {
        done: bool,
    }

    impl Transfer for PingPong {
        async fn start(&mut self) -> Result<Option<Packet>> {
            Ok(Some(Packet::command(Verb::List, "")))
        }

        async fn on_packet(&mut self, packet: Packet) -> Result<Option<Packet>> {
            match packet.ack_kind() {
                Some(AckKind::List) => {
                    self.done = true;
                    Ok(None)
                }
                _ => Err(Error::violation("expected a list ack")),
            }
        }

        fn is_finished(&self) -> bool {
            self.done
        }

        fn report(&self) -> Option<TransferReport> {
            None
        }
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let (mut link, _silent) = pair();
        let policy = fast_policy();
        let mut transfer = PingPong { done: false };

        let err = drive(&mut link, &mut transfer, &policy).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { attempts: 7, .. }));
        // the opening packet plus one re-send per retry
        assert_eq!(link.sent().len(), 1 + policy.max_retries as usize);
    }

    #[tokio::test]
    async fn skips_unexpected_packets_and_keeps_waiting() {
        let (mut link, mut peer) = pair();
        let mut transfer = PingPong { done: false };
        peer.send(&Packet::data(0, &b"noise"[..])).await.unwrap();
        peer.send(&Packet::ack(AckKind::List, 0, "a\nb")).await.unwrap();

        drive(&mut link, &mut transfer, &fast_policy()).await.unwrap();
        assert!(transfer.done);
    }

    #[tokio::test]
    async fn stale_traffic_does_not_postpone_the_timeout() {
        let (mut link, mut noisy) = pair();
        let chatter = tokio::spawn(async move {
            for seq in 0..500 {
                noisy.send(&Packet::data(seq, &b"stale"[..])).await.unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        });
        let mut transfer = PingPong { done: false };

        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(3),
            drive(&mut link, &mut transfer, &fast_policy()),
        )
        .await
        .expect("noise kept the transfer waiting");
        assert!(matches!(outcome, Err(Error::Timeout { attempts: 7, .. })));
        chatter.abort();
    }

    #[test]
    fn digest_of_known_input() {
        let mut digest = Digest::new();
        digest.update(b"ab").unwrap();
        digest.update(b"c").unwrap();
        assert_eq!(
            digest.finish(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(digest.value().is_some());
    }
}
