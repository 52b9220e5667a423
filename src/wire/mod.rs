//! Packet framing.
//!
//! | offset   | field           | width   |
//! |----------|-----------------|---------|
//! | 0        | kind tag        | 1       |
//! | 1        | sequence number | 6       |
//! | 7        | payload length  | 6       |
//! | 13       | subtype         | 1, `C`/`A`/`K` only |
//! | 13 or 14 | payload         | length  |
//!
//! Both numeric fields use the padded decimal encoding from [`decimal`].

pub mod cursor;
pub mod decimal;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::protocol::{
    AckKind, Kind, Verb, UFT_FIELD_MAX, UFT_FOUND, UFT_GENERIC_SUBTYPE, UFT_MISSING,
    UFT_PREFIX_SIZE,
};
use cursor::Cursor;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unknown packet kind tag {0:#04x}")]
    UnknownKind(u8),

    #[error("invalid digit {0:#04x} in decimal field")]
    BadDigit(u8),

    #[error("decimal field holds no digits")]
    EmptyField,

    #[error("value {0} does not fit a six-digit field")]
    FieldOverflow(u64),

    #[error("{0:?} packet needs a subtype byte")]
    MissingSubtype(Kind),

    #[error("{0:?} packet cannot carry a subtype byte")]
    UnexpectedSubtype(Kind),
}

/// One datagram's worth of protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: Kind,
    pub seq: u32,
    pub subtype: Option<u8>,
    pub payload: Bytes,
}

impl Packet {
    pub fn data(seq: u32, payload: impl Into<Bytes>) -> Packet {
        Packet {
            kind: Kind::Data,
            seq,
            subtype: None,
            payload: payload.into(),
        }
    }

    pub fn command(verb: Verb, arg: impl Into<Bytes>) -> Packet {
        Packet {
            kind: Kind::Command,
            seq: 0,
            subtype: Some(verb.tag()),
            payload: arg.into(),
        }
    }

    /// The same packet under another sequence number.
    pub fn with_seq(self, seq: u32) -> Packet {
        Packet { seq, ..self }
    }

    pub fn ack(kind: AckKind, seq: u32, payload: impl Into<Bytes>) -> Packet {
        Packet {
            kind: Kind::Ack,
            seq,
            subtype: Some(kind.tag()),
            payload: payload.into(),
        }
    }

    /// Server's answer to a GET command.
    pub fn file_size_ack(size: Option<u64>) -> Packet {
        let (seq, payload) = match size {
            Some(size) => (UFT_FOUND, Bytes::from(size.to_string())),
            None => (UFT_MISSING, Bytes::new()),
        };
        Packet {
            kind: Kind::FileSizeAck,
            seq,
            subtype: Some(UFT_GENERIC_SUBTYPE),
            payload,
        }
    }

    /// Client's notice that the last PUT chunk was acknowledged.
    pub fn completion() -> Packet {
        Packet {
            kind: Kind::FileSizeAck,
            seq: 0,
            subtype: Some(UFT_GENERIC_SUBTYPE),
            payload: Bytes::new(),
        }
    }

    pub fn verb(&self) -> Option<Verb> {
        match self.kind {
            Kind::Command => self.subtype.and_then(Verb::from_tag),
            _ => None,
        }
    }

    pub fn ack_kind(&self) -> Option<AckKind> {
        match self.kind {
            Kind::Ack => self.subtype.and_then(AckKind::from_tag),
            _ => None,
        }
    }

    /// Payload as text, for filenames and chat lines.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn encoded_len(&self) -> usize {
        UFT_PREFIX_SIZE + usize::from(self.kind.has_subtype()) + self.payload.len()
    }
}

pub fn encode(packet: &Packet) -> Result<Bytes, WireError> {
    let mut out = BytesMut::with_capacity(packet.encoded_len());
    encode_into(packet, &mut out)?;
    Ok(out.freeze())
}

pub fn encode_into(packet: &Packet, out: &mut BytesMut) -> Result<(), WireError> {
    match (packet.kind.has_subtype(), packet.subtype) {
        (true, None) => return Err(WireError::MissingSubtype(packet.kind)),
        (false, Some(_)) => return Err(WireError::UnexpectedSubtype(packet.kind)),
        _ => {}
    }
    let len = u32::try_from(packet.payload.len())
        .ok()
        .filter(|&len| len <= UFT_FIELD_MAX)
        .ok_or(WireError::FieldOverflow(packet.payload.len() as u64))?;

    out.reserve(packet.encoded_len());
    out.put_u8(packet.kind.tag());
    decimal::put(out, packet.seq)?;
    decimal::put(out, len)?;
    if let Some(subtype) = packet.subtype {
        out.put_u8(subtype);
    }
    out.put_slice(&packet.payload);
    Ok(())
}

/// Parses one datagram. Bytes past the declared payload are ignored.
pub fn decode(buf: &[u8]) -> Result<Packet, WireError> {
    if buf.len() < UFT_PREFIX_SIZE {
        return Err(WireError::Truncated {
            needed: UFT_PREFIX_SIZE,
            available: buf.len(),
        });
    }
    let mut cursor = Cursor::new(buf);
    let tag = cursor.u8()?;
    let kind = Kind::from_tag(tag).ok_or(WireError::UnknownKind(tag))?;
    let seq = cursor.decimal()?;
    let len = cursor.decimal()? as usize;
    let subtype = if kind.has_subtype() {
        Some(cursor.u8()?)
    } else {
        None
    };
    let payload = Bytes::copy_from_slice(cursor.take(len)?);
    Ok(Packet {
        kind,
        seq,
        subtype,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn data_frame_layout() {
        let bytes = encode(&Packet::data(3, &b"abcd"[..])).unwrap();
        assert_eq!(&bytes[..], b"D*****3*****4abcd");
    }

    #[test]
    fn command_frame_layout() {
        let bytes = encode(&Packet::command(Verb::Get, "foo.txt")).unwrap();
        assert_eq!(&bytes[..], b"C*****0*****7Gfoo.txt");
    }

    #[test]
    fn file_size_ack_carries_found_flag_and_size() {
        let found = decode(&encode(&Packet::file_size_ack(Some(5000))).unwrap()).unwrap();
        assert_eq!(found.kind, Kind::FileSizeAck);
        assert_eq!(found.seq, UFT_FOUND);
        assert_eq!(found.text(), "5000");

        let missing = decode(&encode(&Packet::file_size_ack(None)).unwrap()).unwrap();
        assert_eq!(missing.seq, UFT_MISSING);
        assert!(missing.payload.is_empty());
    }

    #[test]
    fn full_chunk_fits_the_data_frame() {
        let packet = Packet::data(999_999, vec![0xAB; 2048]);
        let bytes = encode(&packet).unwrap();
        assert_eq!(bytes.len(), crate::protocol::UFT_MAX_DATA_FRAME);
        assert_eq!(decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn rejects_short_buffers() {
        assert!(matches!(
            decode(b"D*****0"),
            Err(WireError::Truncated { needed: 13, .. })
        ));
        // subtype byte missing
        assert!(matches!(
            decode(b"A*****0*****0"),
            Err(WireError::Truncated { .. })
        ));
        // declared payload longer than what arrived
        assert!(matches!(
            decode(b"D*****0****10short"),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_unknown_kind() {
        assert_eq!(
            decode(b"Z*****0*****0"),
            Err(WireError::UnknownKind(b'Z'))
        );
    }

    #[test]
    fn ignores_trailing_bytes() {
        let packet = decode(b"D*****1*****2hi\0\0\0").unwrap();
        assert_eq!(&packet.payload[..], b"hi");
    }

    #[test]
    fn refuses_inconsistent_subtype() {
        let mut packet = Packet::data(0, Bytes::new());
        packet.subtype = Some(b'0');
        assert_eq!(encode(&packet), Err(WireError::UnexpectedSubtype(Kind::Data)));
        let mut packet = Packet::completion();
        packet.subtype = None;
        assert_eq!(
            encode(&packet),
            Err(WireError::MissingSubtype(Kind::FileSizeAck))
        );
    }

    #[test]
    fn refuses_out_of_range_sequence() {
        assert_eq!(
            encode(&Packet::data(1_000_000, Bytes::new())),
            Err(WireError::FieldOverflow(1_000_000))
        );
    }

    fn any_packet() -> impl Strategy<Value = Packet> {
        (
            prop::sample::select(Kind::ALL.to_vec()),
            0..=UFT_FIELD_MAX,
            any::<u8>(),
            prop::collection::vec(any::<u8>(), 0..2100),
        )
            .prop_map(|(kind, seq, subtype, payload)| Packet {
                kind,
                seq,
                subtype: kind.has_subtype().then_some(subtype),
                payload: Bytes::from(payload),
            })
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(packet in any_packet()) {
            let bytes = encode(&packet).unwrap();
            prop_assert_eq!(bytes.len(), packet.encoded_len());
            prop_assert_eq!(decode(&bytes).unwrap(), packet);
        }

        #[test]
        fn every_strict_prefix_is_rejected(packet in any_packet()) {
            let bytes = encode(&packet).unwrap();
            for cut in [0, bytes.len() / 2, bytes.len() - 1] {
                prop_assert!(decode(&bytes[..cut]).is_err());
            }
        }
    }
}
