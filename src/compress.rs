//! Boundary to the external minifier/tokenizer.
//!
//! The compressor is opaque: source text in, artifact bytes out. Any failure
//! falls back to the uncompressed source.

use std::io::Write;
use std::process::{Command, Stdio};
use std::thread;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum CompressError {
    #[error("compressor '{program}' is not available: {source}")]
    Unavailable {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("compressor '{program}' exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("compressor '{program}' produced no output")]
    Empty { program: String },

    #[error("I/O error talking to compressor: {0}")]
    Io(#[from] std::io::Error),
}

pub trait Compressor {
    fn compress(&self, source: &str) -> Result<Vec<u8>, CompressError>;
}

/// Runs an external program that reads the source on stdin and writes the
/// compressed artifact on stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandCompressor {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandCompressor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Split a whitespace-separated command line (no quoting rules).
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self {
            program: program.to_string(),
            args: parts.map(str::to_string).collect(),
        })
    }
}

impl Compressor for CommandCompressor {
    fn compress(&self, source: &str) -> Result<Vec<u8>, CompressError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| CompressError::Unavailable {
            program: self.program.clone(),
            source,
        })?;

        // Feed stdin from another thread so a chatty child can't deadlock us.
        let writer = child.stdin.take().map(|mut stdin| {
            let input = source.as_bytes().to_vec();
            thread::spawn(move || stdin.write_all(&input))
        });

        let output = child.wait_with_output()?;

        if let Some(handle) = writer {
            match handle.join() {
                Ok(Ok(())) => {}
                // The child may exit without reading everything; its status decides.
                Ok(Err(e)) => debug!(error = %e, "compressor closed stdin early"),
                Err(_) => debug!("compressor stdin writer panicked"),
            }
        }

        if !output.status.success() {
            return Err(CompressError::Failed {
                program: self.program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        if output.stdout.is_empty() {
            return Err(CompressError::Empty {
                program: self.program.clone(),
            });
        }

        Ok(output.stdout)
    }
}

/// Artifact bytes plus whether compression actually happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compressed {
    pub bytes: Vec<u8>,
    pub compressed: bool,
}

/// Compress `source`, or fall back to its raw bytes.
///
/// Never fails: a missing or failing compressor is logged and the
/// uncompressed text is used.
pub fn compress_or_fallback(compressor: Option<&dyn Compressor>, source: &str) -> Compressed {
    let Some(compressor) = compressor else {
        return Compressed {
            bytes: source.as_bytes().to_vec(),
            compressed: false,
        };
    };

    match compressor.compress(source) {
        Ok(bytes) => {
            debug!(
                before = source.len(),
                after = bytes.len(),
                "compressed artifact"
            );
            Compressed {
                bytes,
                compressed: true,
            }
        }
        Err(e) => {
            warn!(error = %e, "compression unavailable, using uncompressed source");
            Compressed {
                bytes: source.as_bytes().to_vec(),
                compressed: false,
            }
        }
    }
}
