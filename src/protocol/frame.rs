//! Packet framing.
//!
//! ```text
//! +------+------+-----------------------------+-----------------+
//! | 0x10 | 0x01 | type (3 bits) | len (13 bits) | payload (len B) |
//! +------+------+-----------------------------+-----------------+
//! ```
//!
//! The type/length word is big-endian.

use thiserror::Error;

/// Fixed two-byte frame prefix.
pub const SENTINEL: [u8; 2] = [0x10, 0x01];
/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD: usize = 0x1FFF;
pub const HEADER_LEN: usize = 4;

/// Positive acknowledgement byte.
pub const ACK: u8 = 0x06;
/// Negative acknowledgement byte.
pub const NAK: u8 = 0x15;

/// Data Link Escape: prefixes console commands to suppress the echo.
pub const DLE: u8 = 0x10;

const LENGTH_MASK: u16 = 0x1FFF;
const TYPE_MASK: u16 = 0xE000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Response,
    Eval,
    Event,
    FileOpen,
    Data,
    FileReceive,
}

impl FrameType {
    pub const fn tag(self) -> u16 {
        match self {
            FrameType::Response => 0x0000,
            FrameType::Eval => 0x2000,
            FrameType::Event => 0x4000,
            FrameType::FileOpen => 0x6000,
            FrameType::Data => 0x8000,
            FrameType::FileReceive => 0xA000,
        }
    }

    pub fn from_tag(tag: u16) -> Option<Self> {
        Some(match tag & TYPE_MASK {
            0x0000 => FrameType::Response,
            0x2000 => FrameType::Eval,
            0x4000 => FrameType::Event,
            0x6000 => FrameType::FileOpen,
            0x8000 => FrameType::Data,
            0xA000 => FrameType::FileReceive,
            _ => return None,
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("payload of {len} bytes exceeds the {max} byte frame limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("frame does not start with the 0x10 0x01 sentinel")]
    BadSentinel,

    #[error("frame header needs 4 bytes, got {0}")]
    Truncated(usize),

    #[error("unknown frame type tag {0:#06x}")]
    UnknownType(u16),
}

/// Encode `payload` as one frame of type `kind`.
pub fn encode(kind: FrameType, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD,
        });
    }

    // Length fits in 13 bits after the check above.
    let word = kind.tag() | (payload.len() as u16 & LENGTH_MASK);

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&SENTINEL);
    frame.extend_from_slice(&word.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameType,
    pub len: usize,
}

impl FrameHeader {
    /// Parse the first [`HEADER_LEN`] bytes of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::Truncated(bytes.len()));
        }
        if bytes[..2] != SENTINEL {
            return Err(FrameError::BadSentinel);
        }
        let word = u16::from_be_bytes([bytes[2], bytes[3]]);
        let kind = FrameType::from_tag(word).ok_or(FrameError::UnknownType(word & TYPE_MASK))?;
        Ok(Self {
            kind,
            len: usize::from(word & LENGTH_MASK),
        })
    }
}
