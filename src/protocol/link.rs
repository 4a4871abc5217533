//! Exclusive access to the device byte stream.
//!
//! One reader task owns the inbound half. Every received byte lands in a
//! console buffer; ACK/NAK bytes additionally resolve the single pending
//! acknowledgement, if one is armed. Acknowledgements carry no sequence
//! number, so at most one frame may wait for one at a time. Writers go
//! through a [`LinkLease`], which holds the link exclusively.

use crate::config::version::EspruinoVersion;
use crate::protocol::errors::LinkError;
use crate::protocol::frame::{self, FrameType, ACK, DLE, NAK};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Oldest console bytes are dropped past this size.
const CONSOLE_LIMIT: usize = 64 * 1024;

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    Ack,
    Nak,
}

#[derive(Default)]
struct InboundState {
    pending: Option<oneshot::Sender<Acknowledgement>>,
    console: Vec<u8>,
    closed: bool,
}

#[derive(Default)]
struct Inbound {
    state: Mutex<InboundState>,
}

impl Inbound {
    fn lock(&self) -> MutexGuard<'_, InboundState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn receive(&self, bytes: &[u8]) {
        let mut state = self.lock();
        for &byte in bytes {
            let ack = match byte {
                ACK => Acknowledgement::Ack,
                NAK => Acknowledgement::Nak,
                _ => continue,
            };
            if let Some(tx) = state.pending.take() {
                debug!(?ack, "acknowledgement received");
                let _ = tx.send(ack);
            }
        }

        state.console.extend_from_slice(bytes);
        if state.console.len() > CONSOLE_LIMIT {
            let excess = state.console.len() - CONSOLE_LIMIT;
            state.console.drain(..excess);
        }
    }

    fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        // Dropping the sender wakes the waiter with a disconnect.
        state.pending = None;
    }
}

async fn read_loop<R>(mut reader: R, inbound: Arc<Inbound>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                trace!(bytes = n, "received");
                inbound.receive(&buf[..n]);
            }
            Err(e) => {
                warn!(error = %e, "device link read failed");
                break;
            }
        }
    }
    debug!("device link closed");
    inbound.close();
}

/// A connection to one device.
pub struct DeviceLink {
    writer: tokio::sync::Mutex<BoxWriter>,
    inbound: Arc<Inbound>,
    reader: JoinHandle<()>,
}

impl DeviceLink {
    /// Wrap a byte stream and start the reader task.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let inbound = Arc::new(Inbound::default());
        let reader = tokio::spawn(read_loop(read_half, Arc::clone(&inbound)));
        Self {
            writer: tokio::sync::Mutex::new(Box::new(write_half)),
            inbound,
            reader,
        }
    }

    /// Wait for exclusive use of the link.
    pub async fn lease(&self) -> LinkLease<'_> {
        LinkLease {
            writer: self.writer.lock().await,
            inbound: &self.inbound,
        }
    }

    /// Take the link if nobody else holds it.
    pub fn try_lease(&self) -> Result<LinkLease<'_>, LinkError> {
        let writer = self.writer.try_lock().map_err(|_| LinkError::Busy)?;
        Ok(LinkLease {
            writer,
            inbound: &self.inbound,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.inbound.lock().closed
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// The armed acknowledgement slot. Disarms on drop, so a timed-out or
/// cancelled wait never leaves a stale waiter behind.
struct PendingAck<'a> {
    rx: oneshot::Receiver<Acknowledgement>,
    inbound: &'a Inbound,
}

impl PendingAck<'_> {
    async fn wait(mut self, timeout: Duration) -> Result<(), LinkError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Err(_) => Err(LinkError::Timeout(timeout)),
            Ok(Err(_)) => Err(LinkError::Disconnected),
            Ok(Ok(Acknowledgement::Ack)) => Ok(()),
            Ok(Ok(Acknowledgement::Nak)) => Err(LinkError::Nak),
        }
    }
}

impl Drop for PendingAck<'_> {
    fn drop(&mut self) {
        self.inbound.lock().pending = None;
    }
}

/// Exclusive handle for writing to the device.
pub struct LinkLease<'a> {
    writer: tokio::sync::MutexGuard<'a, BoxWriter>,
    inbound: &'a Inbound,
}

impl<'a> LinkLease<'a> {
    fn arm(&self) -> Result<PendingAck<'a>, LinkError> {
        let mut state = self.inbound.lock();
        if state.closed {
            return Err(LinkError::Disconnected);
        }
        if state.pending.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(LinkError::AckPending);
        }

        let (tx, rx) = oneshot::channel();
        state.pending = Some(tx);
        Ok(PendingAck {
            rx,
            inbound: self.inbound,
        })
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Send one frame, optionally waiting up to `wait` for ACK/NAK.
    ///
    /// The acknowledgement slot is armed before the first byte goes out so a
    /// fast reply can't be missed.
    pub async fn send_frame(
        &mut self,
        kind: FrameType,
        payload: &[u8],
        wait: Option<Duration>,
    ) -> Result<(), LinkError> {
        let bytes = frame::encode(kind, payload)?;
        let pending = match wait {
            Some(_) => Some(self.arm()?),
            None => None,
        };

        trace!(?kind, len = payload.len(), "sending frame");
        self.write_raw(&bytes).await?;

        match (pending, wait) {
            (Some(pending), Some(timeout)) => pending.wait(timeout).await,
            _ => Ok(()),
        }
    }

    /// Run `command` on the device console without echo.
    pub async fn eval(&mut self, command: &str) -> Result<(), LinkError> {
        debug!(command, "eval");
        let mut line = Vec::with_capacity(command.len() + 2);
        line.push(DLE);
        line.extend_from_slice(command.as_bytes());
        line.push(b'\n');
        self.write_raw(&line).await
    }

    pub fn clear_console(&self) {
        self.inbound.lock().console.clear();
    }

    /// Everything received since the console was last cleared.
    pub fn console_text(&self) -> String {
        String::from_utf8_lossy(&self.inbound.lock().console).into_owned()
    }

    /// Evaluate `command` and collect what the device prints within `settle`.
    pub async fn query(&mut self, command: &str, settle: Duration) -> Result<String, LinkError> {
        self.clear_console();
        self.eval(command).await?;
        tokio::time::sleep(settle).await;
        Ok(self.console_text())
    }

    /// Names in directory `path` on secondary storage.
    ///
    /// A missing directory lists as empty.
    pub async fn list_dir(&mut self, path: &str, settle: Duration) -> Result<Vec<String>, LinkError> {
        let command = format!(
            "print(JSON.stringify(require('fs').readdir({})||[]))",
            js_string(path)
        );
        let response = self.query(&command, settle).await?;
        parse_listing(&response).ok_or(LinkError::BadListing(response))
    }

    /// Create `path` and each of its parents, ignoring errors on the device.
    pub async fn make_dirs(&mut self, path: &str, pause: Duration) -> Result<(), LinkError> {
        let mut prefix = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);
            self.eval(&format!(
                "try{{require('fs').mkdir({});}}catch(e){{}}",
                js_string(&prefix)
            ))
            .await?;
            tokio::time::sleep(pause).await;
        }
        Ok(())
    }

    /// The interpreter version the device reports, if it answers.
    pub async fn device_version(
        &mut self,
        settle: Duration,
    ) -> Result<Option<EspruinoVersion>, LinkError> {
        let response = self.query("print(process.env.VERSION)", settle).await?;
        Ok(EspruinoVersion::parse(&response).ok())
    }

    /// The firmware release the device runs (its `VERSION` global), e.g.
    /// `1.29.123`. `None` if the device has none set.
    pub async fn firmware_version(&mut self, settle: Duration) -> Result<Option<String>, LinkError> {
        let response = self
            .query(
                r#"if(typeof VERSION!=="undefined") print("V:" + VERSION); else print("V:NONE");"#,
                settle,
            )
            .await?;
        Ok(parse_firmware_version(&response))
    }
}

/// Pull the `V:<version>` answer out of console output.
pub fn parse_firmware_version(response: &str) -> Option<String> {
    response.match_indices("V:").find_map(|(at, _)| {
        let rest = &response[at + 2..];
        let end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        let version = rest[..end].trim_matches('.');
        (!version.is_empty()).then(|| version.to_string())
    })
}

/// JSON string literal, which is also a valid JS string literal.
pub(crate) fn js_string(value: &str) -> String {
    serde_json::Value::from(value).to_string()
}

/// Find the JSON string array in console output.
///
/// Line breaks the device inserts are removed first. Text before the array
/// (prompts, other output) is skipped. Output with no bracketed text at all
/// (an error from a missing card, say) lists as empty; `None` means there
/// was an array but it could not be read.
pub fn parse_listing(response: &str) -> Option<Vec<String>> {
    let cleaned: String = response.chars().filter(|c| *c != '\r' && *c != '\n').collect();
    let (Some(first), Some(end)) = (cleaned.find('['), cleaned.rfind(']')) else {
        return Some(Vec::new());
    };
    if first > end {
        return Some(Vec::new());
    }

    cleaned[..=end]
        .match_indices('[')
        .find_map(|(start, _)| serde_json::from_str::<Vec<String>>(&cleaned[start..=end]).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::marker::PhantomData;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{DuplexStream, ReadBuf};

    /// A stream that may move between threads but not be shared by them,
    /// like most serial port handles.
    struct Unshared {
        inner: DuplexStream,
        _not_sync: PhantomData<Cell<()>>,
    }

    impl AsyncRead for Unshared {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for Unshared {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    #[tokio::test]
    async fn test_link_over_stream_that_is_not_sync() {
        let (host, mut device) = tokio::io::duplex(256);
        let link = DeviceLink::new(Unshared {
            inner: host,
            _not_sync: PhantomData,
        });

        link.lease().await.eval("load();").await.unwrap();

        let mut buf = [0u8; 9];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x10load();\n");
    }

    #[test]
    fn test_parse_listing_plain() {
        assert_eq!(
            parse_listing("[\"a.wav\",\"b.wav\"]\r\n>"),
            Some(vec!["a.wav".to_string(), "b.wav".to_string()])
        );
    }

    #[test]
    fn test_parse_listing_with_noise_and_breaks() {
        let response = "=undefined\r\n>[\"one\",\r\n\"two\"]\r\n>";
        assert_eq!(
            parse_listing(response),
            Some(vec!["one".to_string(), "two".to_string()])
        );
    }

    #[test]
    fn test_parse_listing_empty_and_garbage() {
        assert_eq!(parse_listing("[]\n"), Some(Vec::new()));
        assert_eq!(parse_listing("[not json]"), None);
    }

    #[test]
    fn test_parse_listing_without_array_is_empty() {
        assert_eq!(parse_listing("Uncaught Error: Unable to mount SD card\r\n>"), Some(Vec::new()));
        assert_eq!(parse_listing("]oops["), Some(Vec::new()));
        assert_eq!(parse_listing(""), Some(Vec::new()));
    }

    #[test]
    fn test_parse_firmware_version() {
        assert_eq!(parse_firmware_version("V:1.29.123\r\n>"), Some("1.29.123".into()));
        assert_eq!(parse_firmware_version(">V:1.31\r\n"), Some("1.31".into()));
        assert_eq!(parse_firmware_version("V:NONE\r\n>"), None);
        assert_eq!(
            parse_firmware_version("print(\"V:\" + VERSION)\r\nV:1.29.123\r\n>"),
            Some("1.29.123".into())
        );
        assert_eq!(parse_firmware_version("Uncaught ReferenceError"), None);
    }

    #[test]
    fn test_js_string_escapes() {
        assert_eq!(js_string("USER/a\"b"), r#""USER/a\"b""#);
    }

    #[tokio::test]
    async fn test_eval_writes_dle_line() {
        let (client, mut device) = tokio::io::duplex(256);
        let link = DeviceLink::new(client);
        link.lease().await.eval("reset()").await.unwrap();

        let mut buf = [0u8; 9];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x10reset()\n");
    }

    #[tokio::test]
    async fn test_try_lease_busy() {
        let (client, _device) = tokio::io::duplex(64);
        let link = DeviceLink::new(client);
        let _held = link.lease().await;
        assert!(matches!(link.try_lease(), Err(LinkError::Busy)));
    }

    #[tokio::test]
    async fn test_ack_pending_rejected() {
        let (client, _device) = tokio::io::duplex(64);
        let link = DeviceLink::new(client);
        let lease = link.lease().await;
        let _first = lease.arm().unwrap();
        assert!(matches!(lease.arm(), Err(LinkError::AckPending)));
    }

    #[tokio::test]
    async fn test_disarm_on_drop() {
        let (client, _device) = tokio::io::duplex(64);
        let link = DeviceLink::new(client);
        let lease = link.lease().await;
        drop(lease.arm().unwrap());
        assert!(lease.arm().is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_while_waiting() {
        let (client, device) = tokio::io::duplex(64);
        let link = DeviceLink::new(client);
        let mut lease = link.lease().await;
        drop(device);

        let err = lease
            .send_frame(FrameType::Data, b"x", Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Disconnected | LinkError::Io(_)));
    }
}
