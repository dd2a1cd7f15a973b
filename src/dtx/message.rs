// Jackson Coxson
//! Wire format for DTX ("Distributed Objects") messages.
//!
//! A message is split into one or more fragments on the wire. Fragment 0
//! carries only the 32-byte header; fragments `1..N` each carry a slice of
//! the payload, which is reassembled by concatenation. All header fields
//! are big-endian, in contrast to the little-endian auxiliary buffer nested
//! inside the payload.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{keyed_archive, IdeviceError};

pub const MAGIC: u32 = 0x1F3D5B79;
const HEADER_LEN: u32 = 32;
const AUX_MAGIC: u32 = 0x1F0;

/// Upper bound on a single message's total payload length.
pub const MAX_PAYLOAD_SIZE: u64 = 256 * 1024 * 1024;

/// `flags & 0xF` payload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Ack,
    Invocation,
    RawArchive,
    Unknown(u32),
}

impl PayloadKind {
    fn from_flags(flags: u32) -> Self {
        match flags & 0xF {
            0x0 => Self::Ack,
            0x2 => Self::Invocation,
            0x3 => Self::RawArchive,
            other => Self::Unknown(other),
        }
    }

    fn flags(self) -> u32 {
        match self {
            Self::Ack => 0x0,
            Self::Invocation => 0x2,
            Self::RawArchive => 0x3,
            Self::Unknown(f) => f,
        }
    }
}

const EXPECTS_REPLY_FLAG: u32 = 0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub channel_id: i32,
    pub message_id: u32,
}

/// Typed entry in the little-endian auxiliary buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum AuxValue {
    /// An NSKeyedArchiver-encoded object (tag 2).
    Archived(Vec<u8>),
    /// A 32-bit signed integer (tag 3).
    I32(i32),
    /// A 64-bit signed integer (tag 4).
    I64(i64),
}

impl AuxValue {
    pub fn archived(value: impl Into<plist::Value>) -> Result<Self, IdeviceError> {
        let mut builder = keyed_archive::ArchiveBuilder::new();
        let root = builder.push_plist_value(&value.into());
        Ok(Self::Archived(builder.finish(root)?))
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            AuxValue::Archived(bytes) => {
                out.extend_from_slice(&2u32.to_le_bytes());
                out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                out.extend_from_slice(bytes);
            }
            AuxValue::I32(v) => {
                out.extend_from_slice(&3u32.to_le_bytes());
                out.extend_from_slice(&v.to_le_bytes());
            }
            AuxValue::I64(v) => {
                out.extend_from_slice(&4u32.to_le_bytes());
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
    }

    fn decode(tag: u32, bytes: &mut &[u8]) -> Result<Self, IdeviceError> {
        match tag {
            2 => {
                if bytes.len() < 4 {
                    return Err(IdeviceError::NotEnoughBytes(bytes.len(), 4));
                }
                let len = u32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize;
                *bytes = &bytes[4..];
                if bytes.len() < len {
                    return Err(IdeviceError::NotEnoughBytes(bytes.len(), len));
                }
                let data = bytes[..len].to_vec();
                *bytes = &bytes[len..];
                Ok(AuxValue::Archived(data))
            }
            3 => {
                if bytes.len() < 4 {
                    return Err(IdeviceError::NotEnoughBytes(bytes.len(), 4));
                }
                let v = i32::from_le_bytes(bytes[..4].try_into().unwrap());
                *bytes = &bytes[4..];
                Ok(AuxValue::I32(v))
            }
            4 => {
                if bytes.len() < 8 {
                    return Err(IdeviceError::NotEnoughBytes(bytes.len(), 8));
                }
                let v = i64::from_le_bytes(bytes[..8].try_into().unwrap());
                *bytes = &bytes[8..];
                Ok(AuxValue::I64(v))
            }
            other => Err(IdeviceError::UnknownAuxValueType(other)),
        }
    }

    /// Decodes this value as an archived object, if it is one.
    pub fn as_object(&self) -> Result<Option<keyed_archive::Archive>, IdeviceError> {
        match self {
            AuxValue::Archived(bytes) => Ok(Some(keyed_archive::Archive::decode(bytes)?)),
            _ => Ok(None),
        }
    }
}

/// The auxiliary buffer: a little-endian sequence of `(tag, value)` entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuxBuffer {
    pub values: Vec<AuxValue>,
}

impl AuxBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, value: AuxValue) -> Self {
        self.values.push(value);
        self
    }

    fn serialize(&self) -> Vec<u8> {
        let mut body = Vec::new();
        for v in &self.values {
            v.encode(&mut body);
        }

        let mut out = Vec::with_capacity(8 + body.len());
        out.extend_from_slice(&AUX_MAGIC.to_le_bytes());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        out
    }

    fn parse(bytes: &[u8]) -> Result<Self, IdeviceError> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        if bytes.len() < 8 {
            return Err(IdeviceError::NotEnoughBytes(bytes.len(), 8));
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if magic != AUX_MAGIC {
            return Err(IdeviceError::ProtocolError(format!(
                "bad aux magic 0x{magic:x}"
            )));
        }
        let len = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
        let mut rest = &bytes[8..8 + len.min(bytes.len().saturating_sub(8))];

        let mut values = Vec::new();
        while rest.len() >= 4 {
            let tag = u32::from_le_bytes(rest[..4].try_into().unwrap());
            rest = &rest[4..];
            values.push(AuxValue::decode(tag, &mut rest)?);
        }
        Ok(Self { values })
    }
}

/// A fully reassembled DTX message.
#[derive(Debug, Clone)]
pub struct DtxMessage {
    pub channel_id: i32,
    pub message_id: u32,
    pub conversation_index: u32,
    pub kind: PayloadKind,
    pub expects_reply: bool,
    pub aux: AuxBuffer,
    /// Raw archived-object payload bytes (selector string, return value, etc).
    pub payload: Vec<u8>,
}

impl DtxMessage {
    pub fn key(&self) -> MessageKey {
        MessageKey {
            channel_id: self.channel_id,
            message_id: self.message_id,
        }
    }

    pub fn invocation(
        channel_id: i32,
        message_id: u32,
        conversation_index: u32,
        selector: &str,
        aux: AuxBuffer,
        expects_reply: bool,
    ) -> Result<Self, IdeviceError> {
        let mut builder = keyed_archive::ArchiveBuilder::new();
        let root = builder.push_string(selector);
        Ok(Self {
            channel_id,
            message_id,
            conversation_index,
            kind: PayloadKind::Invocation,
            expects_reply,
            aux,
            payload: builder.finish(root)?,
        })
    }

    pub fn raw_archive(
        channel_id: i32,
        message_id: u32,
        conversation_index: u32,
        payload: Vec<u8>,
        expects_reply: bool,
    ) -> Self {
        Self {
            channel_id,
            message_id,
            conversation_index,
            kind: PayloadKind::RawArchive,
            expects_reply,
            aux: AuxBuffer::default(),
            payload,
        }
    }

    pub fn ack(channel_id: i32, message_id: u32, conversation_index: u32) -> Self {
        Self {
            channel_id,
            message_id,
            conversation_index,
            kind: PayloadKind::Ack,
            expects_reply: false,
            aux: AuxBuffer::default(),
            payload: Vec::new(),
        }
    }

    /// Decodes the selector out of an invocation-kind message's payload.
    pub fn selector(&self) -> Option<String> {
        if self.payload.is_empty() {
            return None;
        }
        let archive = keyed_archive::Archive::decode(&self.payload).ok()?;
        match archive.root_object()? {
            keyed_archive::Node::String(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// Serializes this message into one or more wire fragments.
    pub fn serialize(&self) -> Vec<u8> {
        let aux = self.aux.serialize();
        let total_length = (aux.len() + self.payload.len()) as u64;

        let mut payload_header = Vec::with_capacity(16);
        let mut flags = self.kind.flags();
        if self.expects_reply {
            flags |= EXPECTS_REPLY_FLAG;
        }
        payload_header.extend_from_slice(&flags.to_be_bytes());
        payload_header.extend_from_slice(&(aux.len() as u32).to_be_bytes());
        payload_header.extend_from_slice(&total_length.to_be_bytes());

        let mut body = payload_header;
        body.extend_from_slice(&aux);
        body.extend_from_slice(&self.payload);

        let fragment_count = body.len().div_ceil(FRAGMENT_CHUNK).max(1) as u16;

        let mut out = Vec::new();
        if fragment_count == 1 {
            out.extend_from_slice(&Self::header(
                0,
                1,
                self.message_id,
                body.len() as u32,
                self.conversation_index,
                self.channel_id,
                self.expects_reply,
            ));
            out.extend_from_slice(&body);
            return out;
        }

        // Fragment 0: header only, declares the *total* body length.
        out.extend_from_slice(&Self::header(
            0,
            fragment_count,
            self.message_id,
            body.len() as u32,
            self.conversation_index,
            self.channel_id,
            self.expects_reply,
        ));

        for (idx, chunk) in body.chunks(FRAGMENT_CHUNK).enumerate() {
            out.extend_from_slice(&Self::header(
                (idx + 1) as u16,
                fragment_count,
                self.message_id,
                chunk.len() as u32,
                self.conversation_index,
                self.channel_id,
                self.expects_reply,
            ));
            out.extend_from_slice(chunk);
        }

        out
    }

    #[allow(clippy::too_many_arguments)]
    fn header(
        fragment_id: u16,
        fragment_count: u16,
        message_id: u32,
        payload_length: u32,
        conversation_index: u32,
        channel_id: i32,
        expects_reply: bool,
    ) -> [u8; 32] {
        let mut buf = [0u8; 32];
        buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&HEADER_LEN.to_be_bytes());
        buf[8..10].copy_from_slice(&fragment_id.to_be_bytes());
        buf[10..12].copy_from_slice(&fragment_count.to_be_bytes());
        buf[12..16].copy_from_slice(&payload_length.to_be_bytes());
        buf[16..20].copy_from_slice(&message_id.to_be_bytes());
        buf[20..24].copy_from_slice(&conversation_index.to_be_bytes());
        buf[24..28].copy_from_slice(&channel_id.to_be_bytes());
        let flag = if expects_reply { 1u32 } else { 0 };
        buf[28..32].copy_from_slice(&flag.to_be_bytes());
        buf
    }

    /// Reads one complete (possibly multi-fragment) message from `reader`.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, IdeviceError> {
        let mut body = Vec::new();
        let mut total_len: Option<u32> = None;
        let mut channel_id = 0i32;
        let mut message_id = 0u32;
        let mut conversation_index = 0u32;
        let mut expects_reply = false;

        let fragment_count = loop {
            let mut hdr = [0u8; 32];
            reader.read_exact(&mut hdr).await?;

            let magic = u32::from_be_bytes(hdr[0..4].try_into().unwrap());
            if magic != MAGIC {
                return Err(IdeviceError::ProtocolError(format!(
                    "bad DTX magic 0x{magic:x}"
                )));
            }
            let fragment_id = u16::from_be_bytes(hdr[8..10].try_into().unwrap());
            let fragment_count = u16::from_be_bytes(hdr[10..12].try_into().unwrap());
            let payload_length = u32::from_be_bytes(hdr[12..16].try_into().unwrap());
            message_id = u32::from_be_bytes(hdr[16..20].try_into().unwrap());
            conversation_index = u32::from_be_bytes(hdr[20..24].try_into().unwrap());
            channel_id = i32::from_be_bytes(hdr[24..28].try_into().unwrap());
            expects_reply = u32::from_be_bytes(hdr[28..32].try_into().unwrap()) == 1;

            if payload_length as u64 > MAX_PAYLOAD_SIZE {
                return Err(IdeviceError::ProtocolError(format!(
                    "DTX payload {payload_length} exceeds ceiling"
                )));
            }

            if fragment_count > 1 && fragment_id == 0 {
                // Fragment 0 of a multi-fragment message carries only the header;
                // payload_length here is the *total* body length, not a chunk size.
                total_len = Some(payload_length);
                continue;
            }

            let mut chunk = vec![0u8; payload_length as usize];
            reader.read_exact(&mut chunk).await?;
            body.extend_from_slice(&chunk);

            if fragment_id == fragment_count - 1 || fragment_count <= 1 {
                break fragment_count;
            }
        };
        let _ = (fragment_count, total_len);

        if body.len() < 16 {
            return Err(IdeviceError::NotEnoughBytes(body.len(), 16));
        }
        let flags = u32::from_be_bytes(body[0..4].try_into().unwrap());
        let aux_length = u32::from_be_bytes(body[4..8].try_into().unwrap()) as usize;
        let total_length = u64::from_be_bytes(body[8..16].try_into().unwrap());

        if aux_length > body.len() - 16 {
            return Err(IdeviceError::NotEnoughBytes(body.len() - 16, aux_length));
        }
        let aux = AuxBuffer::parse(&body[16..16 + aux_length])?;

        let payload_start = 16 + aux_length;
        let payload_len = (total_length as usize).saturating_sub(aux_length);
        let payload_end = (payload_start + payload_len).min(body.len());
        let payload = body[payload_start..payload_end].to_vec();

        Ok(Self {
            channel_id,
            message_id,
            conversation_index,
            kind: PayloadKind::from_flags(flags),
            expects_reply,
            aux,
            payload,
        })
    }
}

/// Fragments larger than this are split; chosen to match observed `go-ios`/`pymobiledevice3`
/// behavior (65504 == 2^16 - 32, leaving headroom for the fragment's own header on the wire).
const FRAGMENT_CHUNK: usize = 65504;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_fragment_message_round_trips() {
        let aux = AuxBuffer::new().push(AuxValue::I32(7)).push(AuxValue::I64(-9));
        let msg = DtxMessage::invocation(0, 1, 0, "_notifyOfPublishedCapabilities:", aux, true)
            .unwrap();
        let bytes = msg.serialize();
        let mut reader = &bytes[..];
        let parsed = DtxMessage::read(&mut reader).await.unwrap();

        assert_eq!(parsed.channel_id, 0);
        assert_eq!(parsed.message_id, 1);
        assert_eq!(parsed.conversation_index, 0);
        assert_eq!(parsed.kind, PayloadKind::Invocation);
        assert!(parsed.expects_reply);
        assert_eq!(parsed.aux.values, msg.aux.values);
        assert_eq!(parsed.selector().as_deref(), Some("_notifyOfPublishedCapabilities:"));
    }

    #[tokio::test]
    async fn multi_fragment_message_reassembles() {
        let payload = vec![0x42u8; FRAGMENT_CHUNK * 2 + 17];
        let msg = DtxMessage::raw_archive(3, 5, 1, payload.clone(), false);
        let bytes = msg.serialize();
        let mut reader = &bytes[..];
        let parsed = DtxMessage::read(&mut reader).await.unwrap();

        assert_eq!(parsed.channel_id, 3);
        assert_eq!(parsed.payload.len(), payload.len());
        assert_eq!(parsed.payload, payload);
    }

    #[tokio::test]
    async fn message_exactly_at_fragment_boundary_reassembles() {
        let payload = vec![0x7u8; FRAGMENT_CHUNK * 3];
        let msg = DtxMessage::raw_archive(1, 2, 0, payload.clone(), false);
        let bytes = msg.serialize();
        let mut reader = &bytes[..];
        let parsed = DtxMessage::read(&mut reader).await.unwrap();
        assert_eq!(parsed.payload, payload);
    }
}
