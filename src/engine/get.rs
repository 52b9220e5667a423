//! GET: the client downloads a file the server offers.

use bytes::Bytes;
use tracing::{debug, info};

use super::{Digest, Transfer, TransferReport};
use crate::error::{Error, Result};
use crate::protocol::{
    chunk_count, AckKind, Kind, Verb, UFT_CHUNK_SIZE, UFT_FOUND, UFT_MAX_FILE_SIZE, UFT_MISSING,
};
use crate::store::{FileHandle, FileStore, OpenMode};
use crate::wire::Packet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetState {
    Idle,
    AwaitFileSizeAck,
    Receiving { expected: u32 },
    Done,
    NotFound,
    Aborted,
}

/// Client side of a GET.
#[derive(Debug)]
pub struct GetDownload {
    store: FileStore,
    filename: String,
    state: GetState,
    dest: Option<FileHandle>,
    total: u64,
    chunks: u32,
    digest: Digest,
}

impl GetDownload {
    pub fn new(store: FileStore, filename: impl Into<String>) -> GetDownload {
        GetDownload {
            store,
            filename: filename.into(),
            state: GetState::Idle,
            dest: None,
            total: 0,
            chunks: 0,
            digest: Digest::new(),
        }
    }

    pub fn state(&self) -> GetState {
        self.state
    }

    /// Size the server announced, once known.
    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunks
    }

    /// Drops the destination handle and marks the transfer aborted.
    pub fn abort(&mut self) {
        self.dest = None;
        if !self.is_finished() {
            self.state = GetState::Aborted;
        }
    }

    async fn accept_offer(&mut self, packet: &Packet) -> Result<Option<Packet>> {
        match packet.seq {
            UFT_FOUND => {}
            UFT_MISSING => {
                info!(file = %self.filename, "server does not have the file");
                self.state = GetState::NotFound;
                return Ok(None);
            }
            other => {
                return Err(Error::violation(format!(
                    "file-size answer with status {other}"
                )))
            }
        }
        let total: u64 = packet
            .text()
            .trim()
            .parse()
            .map_err(|_| Error::violation(format!("unreadable file size {:?}", packet.text())))?;
        if total > UFT_MAX_FILE_SIZE {
            return Err(Error::violation(format!("announced size {total} is too large")));
        }

        let dest = match self.store.open(&self.filename, OpenMode::Write).await {
            Ok(dest) => dest,
            Err(e) => {
                self.state = GetState::Aborted;
                return Err(e);
            }
        };
        self.dest = Some(dest);
        self.total = total;
        self.chunks = chunk_count(total);
        self.state = GetState::Receiving { expected: 0 };
        debug!(file = %self.filename, total, chunks = self.chunks, "offer accepted");
        Ok(Some(Packet::ack(AckKind::FileSize, UFT_FOUND, Bytes::new())))
    }

    async fn receive(&mut self, expected: u32, packet: Packet) -> Result<Option<Packet>> {
        if packet.seq < expected {
            debug!(file = %self.filename, seq = packet.seq, "duplicate chunk, re-acknowledging");
            return Ok(Some(Packet::ack(AckKind::Data, packet.seq, Bytes::new())));
        }
        if packet.seq > expected {
            return Err(Error::violation(format!(
                "chunk {} while expecting {expected}",
                packet.seq
            )));
        }
        if packet.payload.len() > UFT_CHUNK_SIZE {
            return Err(Error::violation(format!(
                "chunk {} carries {} bytes",
                packet.seq,
                packet.payload.len()
            )));
        }

        if let Err(e) = self.write(&packet.payload).await {
            self.abort();
            return Err(e);
        }
        let next = expected + 1;
        if next == self.chunks {
            if let Some(dest) = self.dest.take() {
                dest.close().await?;
            }
            let sha256 = self.digest.finish();
            info!(file = %self.filename, bytes = self.total, %sha256, "download complete");
            self.state = GetState::Done;
        } else {
            self.state = GetState::Receiving { expected: next };
        }
        Ok(Some(Packet::ack(AckKind::Data, packet.seq, Bytes::new())))
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let dest = self
            .dest
            .as_mut()
            .ok_or_else(|| Error::violation("data before the destination was opened"))?;
        dest.write_chunk(data).await?;
        self.digest
            .update(data)
            .map_err(|e| Error::file_io(&self.filename, e))
    }
}

impl Transfer for GetDownload {
    async fn start(&mut self) -> Result<Option<Packet>> {
        self.state = GetState::AwaitFileSizeAck;
        Ok(Some(Packet::command(Verb::Get, self.filename.clone())))
    }

    async fn on_packet(&mut self, packet: Packet) -> Result<Option<Packet>> {
        match (self.state, packet.kind) {
            (GetState::AwaitFileSizeAck, Kind::FileSizeAck) => self.accept_offer(&packet).await,
            // our ack of the offer was lost and the server answered a repeat
            (GetState::Receiving { expected: 0 }, Kind::FileSizeAck) => Ok(Some(Packet::ack(
                AckKind::FileSize,
                UFT_FOUND,
                Bytes::new(),
            ))),
            (GetState::Receiving { expected }, Kind::Data) => self.receive(expected, packet).await,
            (state, kind) => Err(Error::violation(format!(
                "{kind:?} packet seq {} while {state:?}",
                packet.seq
            ))),
        }
    }

    fn is_finished(&self) -> bool {
        matches!(
            self.state,
            GetState::Done | GetState::NotFound | GetState::Aborted
        )
    }

    fn report(&self) -> Option<TransferReport> {
        match self.state {
            GetState::Done => Some(TransferReport {
                filename: self.filename.clone(),
                bytes: self.total,
                chunks: self.chunks,
                sha256: self.digest.value()?.to_string(),
            }),
            _ => None,
        }
    }
}

/// Server side of a GET, created once the client accepted the offer.
#[derive(Debug)]
pub struct GetServe {
    source: FileHandle,
    total: u64,
    chunks: u32,
    /// Chunk currently awaiting its acknowledgement.
    in_flight: Packet,
    finished: bool,
    digest: Digest,
}

impl GetServe {
    pub fn new(source: FileHandle, total: u64) -> GetServe {
        GetServe {
            source,
            total,
            chunks: chunk_count(total),
            in_flight: Packet::data(0, Bytes::new()),
            finished: false,
            digest: Digest::new(),
        }
    }

    pub fn filename(&self) -> &str {
        self.source.name()
    }

    async fn load(&mut self, seq: u32) -> Result<Packet> {
        let remaining = self.total.saturating_sub(self.source.bytes());
        let want = remaining.min(UFT_CHUNK_SIZE as u64) as usize;
        let chunk = self.source.read_chunk(want).await?;
        if chunk.len() < want {
            return Err(Error::file_io(
                self.source.name(),
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "file shrank during transfer",
                ),
            ));
        }
        self.digest
            .update(&chunk)
            .map_err(|e| Error::file_io(self.source.name(), e))?;
        let packet = Packet::data(seq, chunk);
        self.in_flight = packet.clone();
        Ok(packet)
    }
}

impl Transfer for GetServe {
    async fn start(&mut self) -> Result<Option<Packet>> {
        Ok(Some(self.load(0).await?))
    }

    async fn on_packet(&mut self, packet: Packet) -> Result<Option<Packet>> {
        let current = self.in_flight.seq;
        match packet.ack_kind() {
            Some(AckKind::Data) if packet.seq == current => {
                if current + 1 == self.chunks {
                    let sha256 = self.digest.finish();
                    info!(file = %self.filename(), bytes = self.total, %sha256, "upload to peer complete");
                    self.finished = true;
                    return Ok(None);
                }
                Ok(Some(self.load(current + 1).await?))
            }
            Some(AckKind::Data) if packet.seq < current => {
                debug!(seq = packet.seq, current, "stale acknowledgement");
                Ok(None)
            }
            Some(AckKind::Data) => Err(Error::violation(format!(
                "ack for chunk {} while chunk {current} is in flight",
                packet.seq
            ))),
            // the client repeated its acceptance before chunk 0 got through
            Some(AckKind::FileSize) if current == 0 => Ok(Some(self.in_flight.clone())),
            Some(AckKind::FileSize) => Ok(None),
            _ => Err(Error::violation(format!(
                "{:?} packet while sending {}",
                packet.kind,
                self.filename()
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
            filename: self.filename().to_string(),
            bytes: self.total,
            chunks: self.chunks,
            sha256: self.digest.value()?.to_string(),
        })
    }
}
