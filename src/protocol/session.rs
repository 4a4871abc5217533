//! File transfer over the packet protocol.
//!
//! A transfer is one file-open frame followed by the file's data in fixed
//! size chunks. Each frame waits for its ACK/NAK before the next one goes
//! out. There is no retry or resume: a NAK or timeout fails the file and
//! the caller starts over from the beginning.

use crate::config::schema::TransferSettings;
use crate::protocol::errors::{LinkError, TransferError};
use crate::protocol::frame::{FrameType, MAX_PAYLOAD};
use crate::protocol::link::LinkLease;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

/// Where a file lands on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageTarget {
    /// Internal flash storage
    #[default]
    Primary,
    /// SD card
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    pub storage: StorageTarget,
    pub chunk_size: usize,
    pub timeout: Duration,
    /// Send data frames without waiting for acknowledgements. The file-open
    /// frame is always acknowledged.
    pub skip_ack: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            storage: StorageTarget::Primary,
            chunk_size: 1024,
            timeout: Duration::from_millis(5000),
            skip_ack: false,
        }
    }
}

impl TransferOptions {
    pub fn from_settings(settings: &TransferSettings) -> Self {
        Self {
            chunk_size: settings.chunk_size,
            timeout: Duration::from_millis(settings.timeout_ms),
            ..Self::default()
        }
    }

    pub fn with_storage(mut self, storage: StorageTarget) -> Self {
        self.storage = storage;
        self
    }
}

/// Payload of the file-open frame, e.g. `{"fn":"VERSION","s":9,"fs":1}`.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct FileOpenRecord<'a> {
    #[serde(rename = "fn")]
    pub name: &'a str,
    #[serde(rename = "s")]
    pub size: usize,
    /// Present (as 1) only for secondary storage
    #[serde(rename = "fs", skip_serializing_if = "Option::is_none")]
    pub secondary: Option<u8>,
}

impl<'a> FileOpenRecord<'a> {
    pub fn new(name: &'a str, size: usize, storage: StorageTarget) -> Self {
        Self {
            name,
            size,
            secondary: match storage {
                StorageTarget::Primary => None,
                StorageTarget::Secondary => Some(1),
            },
        }
    }
}

/// Data chunks sent so far; `total` also counts the file-open frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub sent: usize,
    pub total: usize,
}

impl Progress {
    /// True once every data chunk is through.
    pub fn is_complete(&self) -> bool {
        self.sent + 1 >= self.total
    }
}

/// Per-file state of one transfer.
#[derive(Debug)]
pub struct TransferSession<'a> {
    name: &'a str,
    data: &'a [u8],
    options: TransferOptions,
    offset: usize,
    chunks_sent: usize,
}

impl<'a> TransferSession<'a> {
    pub fn new(
        name: &'a str,
        data: &'a [u8],
        options: TransferOptions,
    ) -> Result<Self, TransferError> {
        if options.chunk_size == 0 || options.chunk_size > MAX_PAYLOAD {
            return Err(TransferError::InvalidChunkSize {
                size: options.chunk_size,
                max: MAX_PAYLOAD,
            });
        }
        Ok(Self {
            name,
            data,
            options,
            offset: 0,
            chunks_sent: 0,
        })
    }

    pub fn data_chunks(&self) -> usize {
        self.data.len().div_ceil(self.options.chunk_size)
    }

    /// Data chunks plus the file-open frame.
    pub fn total_packets(&self) -> usize {
        self.data_chunks() + 1
    }

    pub fn progress(&self) -> Progress {
        Progress {
            sent: self.chunks_sent,
            total: self.total_packets(),
        }
    }

    pub fn open_record(&self) -> FileOpenRecord<'a> {
        FileOpenRecord::new(self.name, self.data.len(), self.options.storage)
    }

    fn next_chunk(&mut self) -> Option<&'a [u8]> {
        if self.offset >= self.data.len() {
            return None;
        }
        let end = (self.offset + self.options.chunk_size).min(self.data.len());
        let chunk = &self.data[self.offset..end];
        self.offset = end;
        Some(chunk)
    }

    fn fail(&self, packet: usize, source: LinkError) -> TransferError {
        TransferError::Packet {
            file: self.name.to_string(),
            packet,
            total: self.total_packets(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    pub name: String,
    pub bytes: usize,
    pub packets: usize,
}

impl LinkLease<'_> {
    /// Send `data` to the device as file `name`.
    ///
    /// `progress` is called once before the first frame and again after each
    /// data chunk.
    pub async fn send_file(
        &mut self,
        name: &str,
        data: &[u8],
        options: &TransferOptions,
        mut progress: impl FnMut(Progress),
    ) -> Result<TransferSummary, TransferError> {
        let mut session = TransferSession::new(name, data, *options)?;
        let open = serde_json::to_vec(&session.open_record())?;
        let ack_wait = (!options.skip_ack).then_some(options.timeout);

        info!(
            file = name,
            bytes = data.len(),
            storage = ?options.storage,
            "sending file"
        );
        progress(session.progress());

        self.send_frame(FrameType::FileOpen, &open, Some(options.timeout))
            .await
            .map_err(|e| session.fail(0, e))?;

        while let Some(chunk) = session.next_chunk() {
            let packet = session.chunks_sent + 1;
            self.send_frame(FrameType::Data, chunk, ack_wait)
                .await
                .map_err(|e| session.fail(packet, e))?;
            session.chunks_sent = packet;
            debug!(file = name, packet, total = session.total_packets(), "chunk sent");
            progress(session.progress());
        }

        info!(file = name, "file sent");
        Ok(TransferSummary {
            name: name.to_string(),
            bytes: data.len(),
            packets: session.total_packets(),
        })
    }
}
