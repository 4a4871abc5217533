//! Resource sync: upload the module files the device doesn't have yet.
//!
//! The device's own directory listing decides what is already present;
//! nothing is cached on the host side.

use crate::config::schema::ResourceManifest;
use crate::protocol::errors::LinkError;
use crate::protocol::link::LinkLease;
use crate::protocol::session::{StorageTarget, TransferOptions};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Files of `manifest` missing from `listing`, in manifest order.
pub fn plan<'a>(manifest: &'a ResourceManifest, listing: &[String]) -> Vec<&'a str> {
    manifest
        .files
        .iter()
        .map(String::as_str)
        .filter(|file| !listing.iter().any(|existing| existing == file))
        .collect()
}

/// Where resource file contents come from.
pub trait ResourceSource {
    fn fetch(&self, folder: &str, file: &str) -> impl Future<Output = std::io::Result<Vec<u8>>>;
}

/// Reads resources from `<root>/<source_folder>/<file>`.
#[derive(Debug, Clone)]
pub struct FsResourceSource {
    pub root: PathBuf,
}

impl FsResourceSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ResourceSource for FsResourceSource {
    async fn fetch(&self, folder: &str, file: &str) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(self.root.join(folder).join(file)).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub transfer: TransferOptions,
    /// Wait for the directory listing to arrive
    pub listing_settle: Duration,
    /// Pause between `mkdir` commands
    pub mkdir_pause: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            transfer: TransferOptions::default().with_storage(StorageTarget::Secondary),
            listing_settle: Duration::from_millis(1000),
            mkdir_pause: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub uploaded: Vec<String>,
    /// Already on the device
    pub present: Vec<String>,
    /// File name and reason
    pub failed: Vec<(String, String)>,
    /// The listing held an array that could not be read, so nothing was
    /// uploaded
    pub listing_failed: bool,
}

/// Bring the device's copy of `manifest` up to date.
///
/// Fetch and transfer failures are per file: they are logged, recorded in
/// the report and the next file is tried. A reply without any listing counts
/// as an empty directory; a garbled listing skips the whole manifest. Only
/// link I/O failures outside a file transfer are returned as errors.
pub async fn sync_resources<S: ResourceSource>(
    lease: &mut LinkLease<'_>,
    manifest: &ResourceManifest,
    source: &S,
    options: &SyncOptions,
) -> Result<SyncReport, LinkError> {
    let mut report = SyncReport::default();
    let dir = manifest.target_path.trim_end_matches('/');

    lease.make_dirs(dir, options.mkdir_pause).await?;

    let listing = match lease.list_dir(dir, options.listing_settle).await {
        Ok(listing) => listing,
        Err(LinkError::BadListing(response)) => {
            warn!(dir, response = %response, "could not read device listing, skipping resources");
            report.listing_failed = true;
            return Ok(report);
        }
        Err(e) => return Err(e),
    };
    debug!(dir, existing = listing.len(), "device listing");

    let upload = plan(manifest, &listing);
    report.present = manifest
        .files
        .iter()
        .filter(|f| !upload.contains(&f.as_str()))
        .cloned()
        .collect();

    if upload.is_empty() {
        info!(dir, "all resources already present");
        return Ok(report);
    }
    info!(
        dir,
        upload = upload.len(),
        present = report.present.len(),
        "uploading resources"
    );

    for file in upload {
        let data = match source.fetch(&manifest.source_folder, file).await {
            Ok(data) => data,
            Err(e) => {
                warn!(file, error = %e, "could not read resource, skipping");
                report.failed.push((file.to_string(), e.to_string()));
                continue;
            }
        };

        let remote = format!("{dir}/{file}");
        match lease.send_file(&remote, &data, &options.transfer, |_| {}).await {
            Ok(_) => report.uploaded.push(file.to_string()),
            Err(e) => {
                warn!(file, error = %e, "resource upload failed, skipping");
                report.failed.push((file.to_string(), e.to_string()));
            }
        }
    }

    Ok(report)
}
