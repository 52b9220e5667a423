//! PUT: the client uploads a file into the server's directory.

use bytes::Bytes;
use tracing::{debug, info};

use super::{Digest, Transfer, TransferReport};
use crate::error::{Error, Result};
use crate::protocol::{chunk_count, AckKind, Kind, Verb, UFT_CHUNK_SIZE};
use crate::store::FileHandle;
use crate::wire::Packet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutState {
    Idle,
    AwaitPutAck,
    Sending { seq: u32 },
    Done,
    Aborted,
}

/// Client side of a PUT.
#[derive(Debug)]
pub struct PutUpload {
    source: FileHandle,
    total: u64,
    chunks: u32,
    state: PutState,
    in_flight: Option<Packet>,
    digest: Digest,
}

impl PutUpload {
    /// `source` must be freshly opened for reading and hold `total` bytes.
    pub fn new(source: FileHandle, total: u64) -> PutUpload {
        PutUpload {
            source,
            total,
            chunks: chunk_count(total),
            state: PutState::Idle,
            in_flight: None,
            digest: Digest::new(),
        }
    }

    pub fn state(&self) -> PutState {
        self.state
    }

    pub fn filename(&self) -> &str {
        self.source.name()
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunks
    }

    async fn send_chunk(&mut self, seq: u32) -> Result<Option<Packet>> {
        let remaining = self.total.saturating_sub(self.source.bytes());
        let want = remaining.min(UFT_CHUNK_SIZE as u64) as usize;
        let chunk = match self.source.read_chunk(want).await {
            Ok(chunk) if chunk.len() == want => chunk,
            Ok(_) => {
                self.state = PutState::Aborted;
                return Err(Error::file_io(
                    self.source.name(),
                    std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "file shrank during transfer",
                    ),
                ));
            }
            Err(e) => {
                self.state = PutState::Aborted;
                return Err(e);
            }
        };
        self.digest
            .update(&chunk)
            .map_err(|e| Error::file_io(self.source.name(), e))?;
        let packet = Packet::data(seq, chunk);
        self.in_flight = Some(packet.clone());
        self.state = PutState::Sending { seq };
        Ok(Some(packet))
    }
}

impl Transfer for PutUpload {
    async fn start(&mut self) -> Result<Option<Packet>> {
        self.state = PutState::AwaitPutAck;
        Ok(Some(Packet::command(Verb::Put, self.filename().to_string())))
    }

    async fn on_packet(&mut self, packet: Packet) -> Result<Option<Packet>> {
        match (self.state, packet.ack_kind()) {
            (PutState::AwaitPutAck, Some(AckKind::Put)) => {
                debug!(file = %self.filename(), chunks = self.chunks, "server ready");
                self.send_chunk(0).await
            }
            // the server answered our repeated command; chunk 0 may have been lost with it
            (PutState::Sending { seq: 0 }, Some(AckKind::Put)) => Ok(self.in_flight.clone()),
            (PutState::Sending { .. }, Some(AckKind::Put)) => Ok(None),
            (PutState::Sending { seq }, Some(AckKind::Data)) if packet.seq == seq => {
                if seq + 1 == self.chunks {
                    let sha256 = self.digest.finish();
                    info!(file = %self.filename(), bytes = self.total, %sha256, "upload complete");
                    self.state = PutState::Done;
                    return Ok(Some(Packet::completion()));
                }
                self.send_chunk(seq + 1).await
            }
            (PutState::Sending { seq }, Some(AckKind::Data)) if packet.seq < seq => {
                debug!(seq = packet.seq, current = seq, "stale acknowledgement");
                Ok(None)
            }
            (state, _) => Err(Error::violation(format!(
                "{:?} packet seq {} while {state:?}",
                packet.kind, packet.seq
            ))),
        }
    }

    fn is_finished(&self) -> bool {
        matches!(self.state, PutState::Done | PutState::Aborted)
    }

    fn report(&self) -> Option<TransferReport> {
        if self.state != PutState::Done {
            return None;
        }
        Some(TransferReport {
            filename: self.filename().to_string(),
            bytes: self.total,
            chunks: self.chunks,
            sha256: self.digest.value()?.to_string(),
        })
    }
}

/// Server side of a PUT. The destination is already open when this is built.
#[derive(Debug)]
pub struct PutReceive {
    filename: String,
    dest: Option<FileHandle>,
    expected: u32,
    received: u64,
    finished: bool,
    digest: Digest,
}

impl PutReceive {
    pub fn new(dest: FileHandle) -> PutReceive {
        PutReceive {
            filename: dest.name().to_string(),
            dest: Some(dest),
            expected: 0,
            received: 0,
            finished: false,
            digest: Digest::new(),
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    fn ready(&self) -> Packet {
        Packet::ack(AckKind::Put, 0, self.filename.clone())
    }

    async fn receive(&mut self, packet: Packet) -> Result<Option<Packet>> {
        let seq = packet.seq;
        if seq < self.expected {
            debug!(file = %self.filename, seq, "duplicate chunk, re-acknowledging");
            return Ok(Some(Packet::ack(AckKind::Data, seq, Bytes::new())));
        }
        if seq > self.expected {
            return Err(Error::violation(format!(
                "chunk {seq} while expecting {}",
                self.expected
            )));
        }
        if packet.payload.len() > UFT_CHUNK_SIZE {
            return Err(Error::violation(format!(
                "chunk {seq} carries {} bytes",
                packet.payload.len()
            )));
        }
        let dest = self
            .dest
            .as_mut()
            .ok_or_else(|| Error::violation("data after completion"))?;
        if let Err(e) = dest.write_chunk(&packet.payload).await {
            // partial uploads stay on disk
            self.dest = None;
            return Err(e);
        }
        self.digest
            .update(&packet.payload)
            .map_err(|e| Error::file_io(&self.filename, e))?;
        self.expected += 1;
        self.received += packet.payload.len() as u64;
        Ok(Some(Packet::ack(AckKind::Data, seq, Bytes::new())))
    }

    async fn complete(&mut self) -> Result<Option<Packet>> {
        if let Some(dest) = self.dest.take() {
            dest.close().await?;
            let sha256 = self.digest.finish();
            info!(file = %self.filename, bytes = self.received, chunks = self.expected, %sha256, "upload received");
        }
        self.finished = true;
        Ok(None)
    }
}

impl Transfer for PutReceive {
    async fn start(&mut self) -> Result<Option<Packet>> {
        Ok(Some(self.ready()))
    }

    async fn on_packet(&mut self, packet: Packet) -> Result<Option<Packet>> {
        match packet.kind {
            Kind::Data => self.receive(packet).await,
            Kind::FileSizeAck => self.complete().await,
            Kind::Command if packet.verb() == Some(Verb::Put) => {
                if packet.text() != self.filename {
                    return Err(Error::violation(format!(
                        "put of {} while receiving {}",
                        packet.text(),
                        self.filename
                    )));
                }
                // repeated command: our ready ack was lost
                Ok((self.expected == 0).then(|| self.ready()))
            }
            other => Err(Error::violation(format!(
                "{other:?} packet while receiving {}",
                self.filename
            ))),
        }
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn report(&self) -> Option<TransferReport> {
        if !self.finished {
            return None;
        }
        Some(TransferReport {
            filename: self.filename.clone(),
            bytes: self.received,
            chunks: self.expected,
            sha256: self.digest.value()?.to_string(),
        })
    }
}
