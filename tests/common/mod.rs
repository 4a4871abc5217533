//! In-memory stand-in for a device on the other end of the link.
//!
//! Speaks just enough of the protocol for tests: acknowledges frames
//! (or NAKs / ignores scripted ones), reassembles uploaded files, answers
//! directory listings and the version query, and records every console
//! command it sees.

#![allow(dead_code)]

use cfw_builder::protocol::frame::{FrameHeader, FrameType, ACK, DLE, HEADER_LEN, NAK, SENTINEL};
use cfw_builder::protocol::DeviceLink;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Nak,
    /// Say nothing, so the host times out
    Silent,
}

#[derive(Debug, Default)]
pub struct DeviceScript {
    /// Reply for (file name, packet); packet 0 is the file-open frame
    pub replies: HashMap<(String, usize), Reply>,
    /// Directory contents on secondary storage
    pub listings: HashMap<String, Vec<String>>,
    /// Files whose open frame is NAKed when aimed at secondary storage
    pub reject_secondary: HashSet<String>,
    /// Answer listings with an error message instead of an array
    pub listing_error: bool,
    /// Answer listings with a broken array
    pub garbled_listing: bool,
    /// What `process.env.VERSION` prints
    pub version: Option<String>,
    /// The firmware's `VERSION` global
    pub firmware: Option<String>,
}

impl DeviceScript {
    pub fn reply(mut self, file: &str, packet: usize, reply: Reply) -> Self {
        self.replies.insert((file.to_string(), packet), reply);
        self
    }

    pub fn reject_secondary(mut self, file: &str) -> Self {
        self.reject_secondary.insert(file.to_string());
        self
    }

    pub fn listing(mut self, dir: &str, files: &[&str]) -> Self {
        self.listings.insert(
            dir.to_string(),
            files.iter().map(|f| f.to_string()).collect(),
        );
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub name: String,
    pub secondary: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct DeviceLog {
    /// Frame type and payload, in arrival order
    pub frames: Vec<(FrameType, Vec<u8>)>,
    pub commands: Vec<String>,
    /// Completed uploads, in completion order
    pub files: Vec<ReceivedFile>,
}

impl DeviceLog {
    pub fn data_payloads(&self) -> Vec<&[u8]> {
        self.frames
            .iter()
            .filter(|(kind, _)| *kind == FrameType::Data)
            .map(|(_, payload)| payload.as_slice())
            .collect()
    }

    pub fn file(&self, name: &str, secondary: bool) -> Option<&ReceivedFile> {
        self.files
            .iter()
            .rev()
            .find(|f| f.name == name && f.secondary == secondary)
    }

    pub fn command_index(&self, needle: &str) -> Option<usize> {
        self.commands.iter().position(|c| c.contains(needle))
    }
}

pub struct FakeDevice {
    pub log: Arc<Mutex<DeviceLog>>,
    handled: Arc<Notify>,
    task: JoinHandle<()>,
}

impl FakeDevice {
    pub fn log(&self) -> std::sync::MutexGuard<'_, DeviceLog> {
        self.log.lock().unwrap()
    }

    /// Wait until the device has processed a command containing `needle`.
    ///
    /// Console commands get no reply, so the host can finish before the
    /// device has read its last line.
    pub async fn settle(&self, needle: &str) {
        let seen = async {
            loop {
                let handled = self.handled.notified();
                let found = self.log().command_index(needle).is_some();
                if found {
                    return;
                }
                handled.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), seen)
            .await
            .unwrap_or_else(|_| panic!("device never saw a command containing {needle:?}"));
    }

    /// Hang up the device side of the link.
    pub fn disconnect(self) {
        self.task.abort();
    }
}

/// A link wired to a fresh fake device.
pub fn connect(script: DeviceScript) -> (DeviceLink, FakeDevice) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let log = Arc::new(Mutex::new(DeviceLog::default()));
    let handled = Arc::new(Notify::new());
    let task = tokio::spawn(run(server, script, Arc::clone(&log), Arc::clone(&handled)));
    (DeviceLink::new(client), FakeDevice { log, handled, task })
}

enum Event {
    Frame(FrameType, Vec<u8>),
    Command(String),
}

struct Incoming {
    name: String,
    size: usize,
    secondary: bool,
    data: Vec<u8>,
    packet: usize,
}

struct Device {
    script: DeviceScript,
    current: Option<Incoming>,
    log: Arc<Mutex<DeviceLog>>,
}

async fn run(
    mut stream: DuplexStream,
    script: DeviceScript,
    log: Arc<Mutex<DeviceLog>>,
    handled: Arc<Notify>,
) {
    let mut device = Device {
        script,
        current: None,
        log,
    };
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);

        while let Some(event) = next_event(&mut buf) {
            let reply = device.handle(event);
            handled.notify_waiters();
            if !reply.is_empty() && stream.write_all(&reply).await.is_err() {
                return;
            }
        }
    }
}

fn next_event(buf: &mut Vec<u8>) -> Option<Event> {
    loop {
        if buf.is_empty() || *buf == [DLE] {
            return None;
        }
        if buf.starts_with(&SENTINEL) {
            let header = FrameHeader::parse(buf.as_slice()).ok()?;
            let total = HEADER_LEN + header.len;
            if buf.len() < total {
                return None;
            }
            let payload = buf[HEADER_LEN..total].to_vec();
            buf.drain(..total);
            return Some(Event::Frame(header.kind, payload));
        }
        if buf[0] == DLE {
            let end = buf.iter().position(|&b| b == b'\n')?;
            let line = String::from_utf8_lossy(&buf[1..end]).into_owned();
            buf.drain(..=end);
            return Some(Event::Command(line));
        }
        buf.remove(0);
    }
}

impl Device {
    fn handle(&mut self, event: Event) -> Vec<u8> {
        match event {
            Event::Frame(kind, payload) => {
                self.log.lock().unwrap().frames.push((kind, payload.clone()));
                self.frame(kind, payload)
            }
            Event::Command(command) => {
                self.log.lock().unwrap().commands.push(command.clone());
                self.command(&command)
            }
        }
    }

    fn frame(&mut self, kind: FrameType, payload: Vec<u8>) -> Vec<u8> {
        let (name, packet) = match kind {
            FrameType::FileOpen => {
                let record: serde_json::Value = serde_json::from_slice(&payload).unwrap();
                let incoming = Incoming {
                    name: record["fn"].as_str().unwrap().to_string(),
                    size: record["s"].as_u64().unwrap() as usize,
                    secondary: record.get("fs").is_some(),
                    data: Vec::new(),
                    packet: 0,
                };
                let name = incoming.name.clone();
                if incoming.secondary && self.script.reject_secondary.contains(&name) {
                    return vec![NAK];
                }
                self.current = Some(incoming);
                (name, 0)
            }
            FrameType::Data => {
                let Some(current) = self.current.as_mut() else {
                    return vec![NAK];
                };
                current.packet += 1;
                current.data.extend_from_slice(&payload);
                (current.name.clone(), current.packet)
            }
            _ => return vec![NAK],
        };

        let reply = self
            .script
            .replies
            .get(&(name, packet))
            .copied()
            .unwrap_or(Reply::Ack);
        if reply == Reply::Ack {
            self.finish_if_complete();
        }

        match reply {
            Reply::Ack => vec![ACK],
            Reply::Nak => {
                self.current = None;
                vec![NAK]
            }
            Reply::Silent => Vec::new(),
        }
    }

    fn finish_if_complete(&mut self) {
        let complete = self
            .current
            .as_ref()
            .is_some_and(|c| c.data.len() >= c.size);
        if !complete {
            return;
        }
        let Some(done) = self.current.take() else {
            return;
        };

        if done.secondary {
            if let Some((dir, file)) = done.name.rsplit_once('/') {
                let entries = self.script.listings.entry(dir.to_string()).or_default();
                if !entries.iter().any(|e| e == file) {
                    entries.push(file.to_string());
                }
            }
        }
        self.log.lock().unwrap().files.push(ReceivedFile {
            name: done.name,
            secondary: done.secondary,
            data: done.data,
        });
    }

    fn command(&mut self, command: &str) -> Vec<u8> {
        if let Some(rest) = command.split_once("readdir(").map(|(_, rest)| rest) {
            if self.script.listing_error {
                return b"Uncaught Error: Unable to mount SD card\r\n>".to_vec();
            }
            if self.script.garbled_listing {
                return b"[\"_perks.dat\" \"action_boy.avi\"]\r\n>".to_vec();
            }
            let path_literal = rest.split(")||").next().unwrap();
            let path: String = serde_json::from_str(path_literal).unwrap();
            let entries = self.script.listings.get(&path).cloned().unwrap_or_default();
            let mut out = serde_json::to_vec(&entries).unwrap();
            out.extend_from_slice(b"\r\n>");
            return out;
        }
        if command.contains("print(\"V:\"") {
            return match &self.script.firmware {
                Some(version) => format!("V:{version}\r\n>").into_bytes(),
                None => b"V:NONE\r\n>".to_vec(),
            };
        }
        if command.contains("process.env.VERSION") {
            return match &self.script.version {
                Some(version) => format!("{version}\r\n>").into_bytes(),
                None => b"undefined\r\n>".to_vec(),
            };
        }
        Vec::new()
    }
}
