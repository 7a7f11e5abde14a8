use crate::error::{RdsmError, Result};

/// Size of every handshake message on the wire.
pub const MESSAGE_SIZE: usize = 32;

/// Type tag of a handshake message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageKind {
    /// Carries the sender's region descriptor.
    Descriptor = 0,
    /// Sender has both sent and received a descriptor.
    Done = 1,
}

impl MessageKind {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(MessageKind::Descriptor),
            1 => Some(MessageKind::Done),
            _ => None,
        }
    }
}

/// What a peer needs to address our region with one-sided operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionDescriptor {
    /// Start of the registered region (the local flag section).
    pub addr: u64,
    /// Registered length in bytes.
    pub length: u64,
    /// Protection key peers present on every access.
    pub rkey: u32,
    /// Queue pair number of the sender's end of the link.
    pub qp_num: u32,
}

/// Message exchanged over the control channel while a link handshakes.
///
/// ```text
/// [0..4]   kind: u32 LE
/// [4..8]   qp_num: u32 LE
/// [8..16]  addr: u64 LE
/// [16..24] length: u64 LE
/// [24..28] rkey: u32 LE
/// [28..32] reserved (must be 0)
/// ```
///
/// `Done` carries only its kind; the remaining bytes are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMessage {
    Descriptor(RegionDescriptor),
    Done,
}

impl HandshakeMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            HandshakeMessage::Descriptor(_) => MessageKind::Descriptor,
            HandshakeMessage::Done => MessageKind::Done,
        }
    }

    pub fn encode(&self) -> [u8; MESSAGE_SIZE] {
        let mut buf = [0u8; MESSAGE_SIZE];
        buf[0..4].copy_from_slice(&(self.kind() as u32).to_le_bytes());
        if let HandshakeMessage::Descriptor(d) = self {
            buf[4..8].copy_from_slice(&d.qp_num.to_le_bytes());
            buf[8..16].copy_from_slice(&d.addr.to_le_bytes());
            buf[16..24].copy_from_slice(&d.length.to_le_bytes());
            buf[24..28].copy_from_slice(&d.rkey.to_le_bytes());
        }
        buf
    }

    /// Decode a received message. `buf` is the received payload, which
    /// must be exactly [`MESSAGE_SIZE`] bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let buf: &[u8; MESSAGE_SIZE] = buf.try_into().map_err(|_| {
            RdsmError::DecodeFailed(format!(
                "expected {MESSAGE_SIZE} bytes, got {}",
                buf.len()
            ))
        })?;
        let raw_kind = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let kind = MessageKind::from_u32(raw_kind)
            .ok_or_else(|| RdsmError::DecodeFailed(format!("unknown message kind {raw_kind}")))?;
        Ok(match kind {
            MessageKind::Descriptor => HandshakeMessage::Descriptor(RegionDescriptor {
                qp_num: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
                addr: u64::from_le_bytes([
                    buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
                ]),
                length: u64::from_le_bytes([
                    buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
                ]),
                rkey: u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]),
            }),
            MessageKind::Done => HandshakeMessage::Done,
        })
    }
}
