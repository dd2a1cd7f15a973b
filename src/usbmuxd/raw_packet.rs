// Jackson Coxson

//! Wire framing for the mux daemon's local control socket: a 16-byte
//! little-endian header (total size, protocol version, message type, tag)
//! followed by the plist body.

use plist::Dictionary;

pub struct RawPacket {
    payload: plist::Dictionary,
    version: u32,
    message_type: u32,
    tag: u32,
}

impl RawPacket {
    pub fn new(payload: Dictionary, version: u32, message_type: u32, tag: u32) -> Self {
        Self {
            payload,
            version,
            message_type,
            tag,
        }
    }
}

impl From<RawPacket> for Vec<u8> {
    fn from(value: RawPacket) -> Self {
        let mut body = Vec::new();
        plist::Value::Dictionary(value.payload)
            .to_writer_xml(&mut body)
            .expect("plist dictionaries always serialize");

        let mut out = Vec::with_capacity(16 + body.len());
        let total_size = (16 + body.len()) as u32;
        out.extend_from_slice(&total_size.to_le_bytes());
        out.extend_from_slice(&value.version.to_le_bytes());
        out.extend_from_slice(&value.message_type.to_le_bytes());
        out.extend_from_slice(&value.tag.to_le_bytes());
        out.extend_from_slice(&body);
        out
    }
}
