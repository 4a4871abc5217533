use crate::protocol::frame::FrameError;
use std::time::Duration;
use thiserror::Error;

/// Failures of a single exchange on the device link.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("device rejected the frame (NAK)")]
    Nak,

    #[error("no acknowledgement within {0:?}")]
    Timeout(Duration),

    #[error("device link closed")]
    Disconnected,

    #[error("an acknowledgement is already pending on this link")]
    AckPending,

    #[error("device link is in use by another session")]
    Busy,

    #[error("could not parse directory listing: {0:?}")]
    BadListing(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a whole file transfer.
#[derive(Error, Debug)]
pub enum TransferError {
    /// Packet 0 is the file-open frame, data chunks count from 1.
    #[error("sending '{file}' failed at packet {packet}/{total}: {source}")]
    Packet {
        file: String,
        packet: usize,
        total: usize,
        #[source]
        source: LinkError,
    },

    #[error("chunk size {size} must be between 1 and {max}")]
    InvalidChunkSize { size: usize, max: usize },

    #[error("could not encode file-open record: {0}")]
    Encode(#[from] serde_json::Error),
}

impl TransferError {
    pub fn is_nak(&self) -> bool {
        matches!(
            self,
            TransferError::Packet {
                source: LinkError::Nak,
                ..
            }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            TransferError::Packet {
                source: LinkError::Timeout(_),
                ..
            }
        )
    }
}
