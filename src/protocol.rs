/* How a file is sent
 * ------------------
 * Every datagram is one packet: a kind tag, two fixed-width decimal fields
 * (sequence number, payload length), a subtype byte for C/A/K packets, then
 * the payload. See `wire` for the byte layout.
 *
 * GET (server -> client):
 *   client  C(G, filename)
 *   server  K(seq=1 found | seq=2 missing, subtype '0', payload = size in ASCII)
 *   client  A(seq=1, subtype 'F')                 only when found
 *   server  D(seq=0, chunk 0)
 *   client  A(seq=0, subtype 'D')
 *   ...     one chunk in flight until the last chunk has been acknowledged
 *
 * PUT (client -> server):
 *   client  C(P, filename)
 *   server  A(seq=0, subtype 'P', payload = filename)
 *   client  D(seq=n, chunk n)    server  A(seq=n, subtype 'D')    for each chunk
 *   client  K(seq=0, subtype '0')                 completion, server closes the file
 *
 * Either side re-sends its last packet when the expected answer does not arrive
 * in time, backing off between attempts. Duplicates below the expected sequence
 * number are acknowledged again and otherwise ignored.
 *
 * One-shot commands:
 *   C(D, filename) -> A(seq=1 deleted | seq=2 missing, subtype 'X', payload = filename)
 *   C(L, seq=n)    -> A(seq=n, subtype 'L', payload = names joined by '\n')
 * The echoed filename and request number let a client tell a late answer to
 * an earlier command from the answer it is waiting for.
 *   C(X, text)     -> no reply, the server logs the line
 *   C(E)           -> no reply, the server drains its sessions and stops
 */

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

// Protocol configuration constants
pub const UFT_CHUNK_SIZE: usize = 2048;
pub const UFT_FIELD_WIDTH: usize = 6;
pub const UFT_FIELD_MAX: u32 = 999_999;
pub const UFT_PAD_MARKER: u8 = b'*';
/// Tag, sequence number and payload length.
pub const UFT_PREFIX_SIZE: usize = 1 + 2 * UFT_FIELD_WIDTH;
pub const UFT_MAX_DATA_FRAME: usize = UFT_PREFIX_SIZE + UFT_CHUNK_SIZE;
/// Largest UDP payload we are willing to receive (list replies can exceed a chunk).
pub const UFT_BUFFER_SIZE: usize = 65_535;
/// Files needing more chunks than the sequence field can number are refused.
pub const UFT_MAX_FILE_SIZE: u64 = (UFT_FIELD_MAX as u64 + 1) * UFT_CHUNK_SIZE as u64;

pub const UFT_FOUND: u32 = 1;
pub const UFT_MISSING: u32 = 2;

/// Packet kind, the first byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    Data = b'D',
    Command = b'C',
    Ack = b'A',
    FileSize = b'F',
    /// File-size answer from the server, completion notice from the client.
    FileSizeAck = b'K',
}

impl Kind {
    pub const ALL: [Kind; 5] = [
        Kind::Data,
        Kind::Command,
        Kind::Ack,
        Kind::FileSize,
        Kind::FileSizeAck,
    ];

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Kind> {
        Kind::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    /// Whether frames of this kind carry a subtype byte after the prefix.
    pub fn has_subtype(self) -> bool {
        matches!(self, Kind::Command | Kind::Ack | Kind::FileSizeAck)
    }
}

/// Subtype byte of command packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Verb {
    Get = b'G',
    Put = b'P',
    Delete = b'D',
    List = b'L',
    Chat = b'X',
    Exit = b'E',
}

impl Verb {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Verb> {
        [
            Verb::Get,
            Verb::Put,
            Verb::Delete,
            Verb::List,
            Verb::Chat,
            Verb::Exit,
        ]
        .into_iter()
        .find(|verb| verb.tag() == tag)
    }

    /// Verbs whose argument names a file.
    pub fn takes_filename(self) -> bool {
        matches!(self, Verb::Get | Verb::Put | Verb::Delete)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verb::Get => "get",
            Verb::Put => "put",
            Verb::Delete => "delete",
            Verb::List => "list",
            Verb::Chat => "chat",
            Verb::Exit => "exit",
        };
        f.write_str(name)
    }
}

/// Subtype byte of acknowledgement packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AckKind {
    FileSize = b'F',
    Data = b'D',
    Put = b'P',
    Delete = b'X',
    List = b'L',
}

impl AckKind {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<AckKind> {
        [
            AckKind::FileSize,
            AckKind::Data,
            AckKind::Put,
            AckKind::Delete,
            AckKind::List,
        ]
        .into_iter()
        .find(|kind| kind.tag() == tag)
    }
}

/// Subtype used where the frame needs one but nothing is distinguished.
pub const UFT_GENERIC_SUBTYPE: u8 = b'0';

/// Outcome of a delete request, carried in the acknowledgement's sequence field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStatus {
    Deleted,
    NotFound,
}

impl DeleteStatus {
    pub fn code(self) -> u32 {
        match self {
            DeleteStatus::Deleted => UFT_FOUND,
            DeleteStatus::NotFound => UFT_MISSING,
        }
    }

    pub fn from_code(code: u32) -> Option<DeleteStatus> {
        match code {
            UFT_FOUND => Some(DeleteStatus::Deleted),
            UFT_MISSING => Some(DeleteStatus::NotFound),
            _ => None,
        }
    }
}

/// Number of chunks a file of `total_bytes` travels in. Empty files still take one.
pub fn chunk_count(total_bytes: u64) -> u32 {
    let chunks = total_bytes.div_ceil(UFT_CHUNK_SIZE as u64).max(1);
    u32::try_from(chunks).unwrap_or(u32::MAX)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandParseError {
    #[error("empty command")]
    Empty,

    #[error("unknown command: {0}")]
    UnknownVerb(String),

    #[error("{0} needs an argument")]
    MissingArgument(Verb),
}

/// One line typed at the client prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub verb: Verb,
    /// File name for get/put/delete, message text for chat, empty otherwise.
    pub filename: String,
}

impl FromStr for CommandRequest {
    type Err = CommandParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        let verb = match word.to_lowercase().as_str() {
            "" => return Err(CommandParseError::Empty),
            "get" | "gt" => Verb::Get,
            "put" | "pt" => Verb::Put,
            "delete" | "dl" => Verb::Delete,
            "list" | "ls" => Verb::List,
            "chat" | "ch" => Verb::Chat,
            "exit" | "ex" => Verb::Exit,
            other => return Err(CommandParseError::UnknownVerb(other.to_string())),
        };
        if (verb.takes_filename() || verb == Verb::Chat) && rest.is_empty() {
            return Err(CommandParseError::MissingArgument(verb));
        }
        let filename = match verb {
            Verb::List | Verb::Exit => String::new(),
            _ => rest.to_string(),
        };
        Ok(CommandRequest { verb, filename })
    }
}
