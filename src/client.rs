//! Client side: one command at a time against one server.

use std::net::SocketAddr;

use bytes::Bytes;
use tracing::{debug, info};

use crate::config::RetryPolicy;
use crate::engine::{drive, GetDownload, GetState, PutUpload, Transfer, TransferReport};
use crate::error::{Error, Result};
use crate::protocol::{
    AckKind, CommandRequest, DeleteStatus, Verb, UFT_FIELD_MAX, UFT_MAX_FILE_SIZE,
};
use crate::store::{FileStore, OpenMode};
use crate::transport::{Link, SocketLink};
use crate::wire::Packet;

/// What a command produced, for the prompt to print.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Transferred(TransferReport),
    Deleted(DeleteStatus),
    Listing(Vec<String>),
    Sent,
}

#[derive(Debug)]
pub struct Client {
    link: SocketLink,
    store: FileStore,
    policy: RetryPolicy,
    /// Number of the last list request, echoed back by the server.
    requests: u32,
}

impl Client {
    pub async fn connect(server: SocketAddr, store: FileStore, policy: RetryPolicy) -> Result<Client> {
        let link = SocketLink::connect(server).await?;
        debug!(%server, local = %link.local_addr()?, "client socket ready");
        Ok(Client {
            link,
            store,
            policy,
            requests: 0,
        })
    }

    pub fn server(&self) -> SocketAddr {
        self.link.peer()
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    pub async fn run(&mut self, request: &CommandRequest) -> Result<Reply> {
        let name = request.filename.as_str();
        match request.verb {
            Verb::Get => self.get(name).await.map(Reply::Transferred),
            Verb::Put => self.put(name).await.map(Reply::Transferred),
            Verb::Delete => self.delete(name).await.map(Reply::Deleted),
            Verb::List => self.list().await.map(Reply::Listing),
            Verb::Chat => self.chat(name).await.map(|()| Reply::Sent),
            Verb::Exit => self.exit().await.map(|()| Reply::Sent),
        }
    }

    /// Downloads `filename` into the local store.
    pub async fn get(&mut self, filename: &str) -> Result<TransferReport> {
        let mut download = GetDownload::new(self.store.clone(), filename);
        self.link.discard_pending();
        if let Err(e) = drive(&mut self.link, &mut download, &self.policy).await {
            download.abort();
            return Err(e);
        }
        match download.state() {
            GetState::NotFound => Err(Error::FileNotFound(filename.to_string())),
            _ => finished(&download),
        }
    }

    /// Uploads `filename` from the local store.
    pub async fn put(&mut self, filename: &str) -> Result<TransferReport> {
        if !self.store.exists(filename).await? {
            return Err(Error::FileNotFound(filename.to_string()));
        }
        let size = self.store.size(filename).await?;
        if size > UFT_MAX_FILE_SIZE {
            return Err(Error::FileTooLarge {
                name: filename.to_string(),
                size,
            });
        }
        let source = self.store.open(filename, OpenMode::Read).await?;
        let mut upload = PutUpload::new(source, size);
        self.link.discard_pending();
        drive(&mut self.link, &mut upload, &self.policy).await?;
        finished(&upload)
    }

    pub async fn delete(&mut self, filename: &str) -> Result<DeleteStatus> {
        let command = Packet::command(Verb::Delete, filename.to_string());
        let echo = Echo::Payload(command.payload.clone());
        let reply = self.request(command, AckKind::Delete, echo).await?;
        DeleteStatus::from_code(reply.seq)
            .ok_or_else(|| Error::violation(format!("delete status {}", reply.seq)))
    }

    /// Names in the server's directory.
    pub async fn list(&mut self) -> Result<Vec<String>> {
        self.requests = self.requests % UFT_FIELD_MAX + 1;
        let command = Packet::command(Verb::List, "").with_seq(self.requests);
        let reply = self
            .request(command, AckKind::List, Echo::Seq(self.requests))
            .await?;
        Ok(reply
            .text()
            .split('\n')
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Sends one line for the server to log. There is no answer to wait for.
    pub async fn chat(&mut self, text: &str) -> Result<()> {
        self.link
            .send(&Packet::command(Verb::Chat, text.to_string()))
            .await
    }

    /// Asks the server to finish its transfers and stop.
    pub async fn exit(&mut self) -> Result<()> {
        info!(server = %self.server(), "asking server to exit");
        self.link.send(&Packet::command(Verb::Exit, "")).await
    }

    async fn request(&mut self, command: Packet, expect: AckKind, echo: Echo) -> Result<Packet> {
        let mut exchange = Exchange {
            command,
            expect,
            echo,
            reply: None,
        };
        self.link.discard_pending();
        drive(&mut self.link, &mut exchange, &self.policy).await?;
        exchange
            .reply
            .ok_or_else(|| Error::violation("exchange ended without a reply"))
    }
}

fn finished<T: Transfer>(transfer: &T) -> Result<TransferReport> {
    transfer
        .report()
        .ok_or_else(|| Error::violation("transfer ended without completing"))
}

/// What an answer repeats from its command.
#[derive(Debug)]
enum Echo {
    Payload(Bytes),
    Seq(u32),
}

impl Echo {
    fn matches(&self, packet: &Packet) -> bool {
        match self {
            Echo::Payload(payload) => packet.payload == *payload,
            Echo::Seq(seq) => packet.seq == *seq,
        }
    }
}

/// A command answered by a single acknowledgement.
struct Exchange {
    command: Packet,
    expect: AckKind,
    echo: Echo,
    reply: Option<Packet>,
}

impl Transfer for Exchange {
    async fn start(&mut self) -> Result<Option<Packet>> {
        Ok(Some(self.command.clone()))
    }

    async fn on_packet(&mut self, packet: Packet) -> Result<Option<Packet>> {
        if packet.ack_kind() != Some(self.expect) {
            return Err(Error::violation(format!(
                "{:?} packet while waiting for a {:?} ack",
                packet.kind, self.expect
            )));
        }
        if !self.echo.matches(&packet) {
            return Err(Error::violation(format!(
                "{:?} ack answers an earlier command",
                self.expect
            )));
        }
        self.reply = Some(packet);
        Ok(None)
    }

    fn is_finished(&self) -> bool {
        self.reply.is_some()
    }

    fn report(&self) -> Option<TransferReport> {
        None
    }
}
