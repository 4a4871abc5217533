//! Build pipeline: resolve, stamp, compress.

use crate::compress::{compress_or_fallback, Compressor};
use crate::config::applicator::{resolve, ModuleInputs, OperationReport, ResolveError};
use crate::config::registry::ModuleRegistry;
use crate::stamp::{detect_version, stamp, stamp_at, version_from_file_name};
use std::io::Write;
use std::path::Path;
use thiserror::Error;
use tracing::info;

/// Largest artifact the device will accept (128 KiB).
pub const MAX_ARTIFACT_SIZE: usize = 128 * 1024;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("artifact is {size} bytes, over the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The finished, transfer-ready firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    /// Stamped version, also written to the device's VERSION record
    pub version: String,
    pub compressed: bool,
}

impl Artifact {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Pre-flight size check; runs before any transfer starts.
    pub fn check_size(&self) -> Result<(), ArtifactError> {
        if self.bytes.len() > MAX_ARTIFACT_SIZE {
            return Err(ArtifactError::TooLarge {
                size: self.bytes.len(),
                max: MAX_ARTIFACT_SIZE,
            });
        }
        Ok(())
    }

    /// Write the artifact atomically.
    pub fn save(&self, path: &Path) -> Result<(), ArtifactError> {
        atomic_write(path, &self.bytes)?;
        info!(path = %path.display(), bytes = self.bytes.len(), "saved artifact");
        Ok(())
    }
}

fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    // Tempfile in the same directory keeps the rename on one filesystem
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    Ok(())
}

/// Everything a build needs besides the registry.
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    /// Base firmware source text
    pub source: String,
    /// File name the source came from, used for the fallback version
    pub file_name: Option<String>,
    /// Module keys in selection order
    pub modules: Vec<String>,
    pub inputs: ModuleInputs,
    /// Fixed clock for reproducible stamps
    pub unix_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Build {
    pub artifact: Artifact,
    /// Patched and stamped source before compression
    pub source: String,
    pub reports: Vec<OperationReport>,
    pub combos_applied: Vec<String>,
}

/// Run the whole pipeline for `request`.
///
/// Only unknown or malformed modules fail the build. Absent regions show up
/// in the reports and a failing compressor falls back to the plain source.
pub fn build(
    registry: &ModuleRegistry,
    request: &BuildRequest,
    compressor: Option<&dyn Compressor>,
) -> Result<Build, ResolveError> {
    let selected = registry.select(&request.modules)?;
    let resolution = resolve(
        &request.source,
        &selected,
        registry.combos(),
        &request.inputs,
    )?;

    let fallback = detect_version(&request.source)
        .or_else(|| request.file_name.as_deref().and_then(version_from_file_name));
    let stamped = match request.unix_secs {
        Some(secs) => stamp_at(&resolution.buffer, fallback, secs),
        None => stamp(&resolution.buffer, fallback),
    };

    let compressed = compress_or_fallback(compressor, &stamped.text);
    let artifact = Artifact {
        bytes: compressed.bytes,
        version: stamped.version,
        compressed: compressed.compressed,
    };
    info!(
        bytes = artifact.len(),
        version = %artifact.version,
        compressed = artifact.compressed,
        "built artifact"
    );

    Ok(Build {
        artifact,
        source: stamped.text,
        reports: resolution.reports,
        combos_applied: resolution.combos_applied,
    })
}
