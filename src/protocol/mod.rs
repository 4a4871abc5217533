//! Packetized file transfer to the device.
//!
//! The device speaks a small framed protocol on top of its JavaScript
//! console: a 4-byte header, a payload of at most 8191 bytes, and a single
//! ACK (0x06) or NAK (0x15) byte in reply. Plain console commands are sent
//! as DLE-prefixed lines on the same stream.

pub mod errors;
pub mod frame;
pub mod link;
pub mod session;

pub use errors::{LinkError, TransferError};
pub use frame::{encode, FrameError, FrameHeader, FrameType, ACK, MAX_PAYLOAD, NAK};
pub use link::{parse_firmware_version, parse_listing, Acknowledgement, DeviceLink, LinkLease};
pub use session::{
    FileOpenRecord, Progress, StorageTarget, TransferOptions, TransferSession, TransferSummary,
};
