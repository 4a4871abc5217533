//! Install workflow: push a built artifact, its VERSION record and module
//! resources to the device, then reboot it.

use crate::artifact::{Artifact, ArtifactError};
use crate::config::schema::{ResourceManifest, TransferSettings};
use crate::protocol::errors::{LinkError, TransferError};
use crate::protocol::link::{DeviceLink, LinkLease};
use crate::protocol::session::{Progress, StorageTarget, TransferOptions, TransferSummary};
use crate::resources::{sync_resources, ResourceSource, SyncOptions, SyncReport};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Boot file the device runs from flash.
pub const FLASH_BOOT_FILE: &str = ".bootcde";
/// Firmware file the device installs from the SD card.
pub const SD_FIRMWARE_FILE: &str = "FW.js";
pub const VERSION_FILE: &str = "VERSION";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallTarget {
    /// Write straight to internal flash
    Flash,
    /// Stage on the SD card for the device's own installer
    SdCard,
}

#[derive(Error, Debug)]
pub enum InstallError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

#[derive(Debug, Clone, Copy)]
pub struct InstallOptions {
    pub transfer: TransferOptions,
    pub sync: SyncOptions,
    /// Wait after `reset()` before talking to the device again
    pub reset_settle: Duration,
    /// Pause after each console command
    pub command_pause: Duration,
    pub skip_resources: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            transfer: TransferOptions::default(),
            sync: SyncOptions::default(),
            reset_settle: Duration::from_millis(2000),
            command_pause: Duration::from_millis(200),
            skip_resources: false,
        }
    }
}

impl InstallOptions {
    pub fn from_settings(settings: &TransferSettings) -> Self {
        let transfer = TransferOptions::from_settings(settings);
        Self {
            transfer,
            sync: SyncOptions {
                transfer: transfer.with_storage(StorageTarget::Secondary),
                listing_settle: Duration::from_millis(settings.listing_settle_ms),
                ..SyncOptions::default()
            },
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstallReport {
    pub target: InstallTarget,
    pub firmware: TransferSummary,
    pub version: String,
    /// Set when the best-effort VERSION copy on the SD card failed
    pub sd_version_error: Option<String>,
    /// Module key and its sync report
    pub resources: Vec<(String, SyncReport)>,
}

/// Install `artifact` on the device behind `link`.
///
/// Fails with `Busy` if another session holds the link. The size ceiling is
/// checked before anything is sent.
pub async fn install<S: ResourceSource>(
    link: &DeviceLink,
    artifact: &Artifact,
    target: InstallTarget,
    resources: &[(&str, &ResourceManifest)],
    source: &S,
    options: &InstallOptions,
    mut progress: impl FnMut(&str, Progress),
) -> Result<InstallReport, InstallError> {
    artifact.check_size()?;
    let mut lease = link.try_lease()?;
    let version = artifact.version.as_bytes();

    info!(?target, bytes = artifact.len(), version = %artifact.version, "installing");
    lease.eval("reset()").await?;
    tokio::time::sleep(options.reset_settle).await;

    let primary = options.transfer.with_storage(StorageTarget::Primary);
    let secondary = options.transfer.with_storage(StorageTarget::Secondary);
    let mut sd_version_error = None;

    let firmware = match target {
        InstallTarget::Flash => {
            command(&mut lease, &erase_storage(FLASH_BOOT_FILE), options).await?;
            let summary = lease
                .send_file(FLASH_BOOT_FILE, &artifact.bytes, &primary, |p| {
                    progress(FLASH_BOOT_FILE, p)
                })
                .await?;

            command(&mut lease, &erase_storage(VERSION_FILE), options).await?;
            lease
                .send_file(VERSION_FILE, version, &primary, |p| progress(VERSION_FILE, p))
                .await?;

            // The SD copy only matters for a later SD install.
            command(&mut lease, &unlink_fs(VERSION_FILE), options).await?;
            if let Err(e) = lease
                .send_file(VERSION_FILE, version, &secondary, |p| progress(VERSION_FILE, p))
                .await
            {
                warn!(error = %e, "could not write VERSION to the SD card");
                sd_version_error = Some(e.to_string());
            }
            summary
        }
        InstallTarget::SdCard => {
            command(&mut lease, &unlink_fs(SD_FIRMWARE_FILE), options).await?;
            let summary = lease
                .send_file(SD_FIRMWARE_FILE, &artifact.bytes, &secondary, |p| {
                    progress(SD_FIRMWARE_FILE, p)
                })
                .await?;

            command(&mut lease, &unlink_fs(VERSION_FILE), options).await?;
            lease
                .send_file(VERSION_FILE, version, &secondary, |p| progress(VERSION_FILE, p))
                .await?;
            summary
        }
    };

    let mut synced = Vec::new();
    if !options.skip_resources {
        for (key, manifest) in resources {
            info!(module = key, "syncing resources");
            let report = sync_resources(&mut lease, manifest, source, &options.sync).await?;
            synced.push((key.to_string(), report));
        }
    }

    lease.eval("E.reboot()").await?;
    info!("install complete, device rebooting");

    Ok(InstallReport {
        target,
        firmware,
        version: artifact.version.clone(),
        sd_version_error,
        resources: synced,
    })
}

/// Make the device install `FW.js` from its SD card.
///
/// Overwrites the in-memory VERSION so the boot check sees a mismatch, then
/// reloads. The device reboots; the link is unusable afterwards.
pub async fn trigger_sd_install(
    link: &DeviceLink,
    options: &InstallOptions,
) -> Result<(), LinkError> {
    let mut lease = link.try_lease()?;
    lease.eval("reset();").await?;
    tokio::time::sleep(options.reset_settle).await;
    command(&mut lease, "VERSION=\"0.00.000\";", options).await?;
    lease.eval("load();").await?;
    info!("SD install triggered");
    Ok(())
}

async fn command(
    lease: &mut LinkLease<'_>,
    cmd: &str,
    options: &InstallOptions,
) -> Result<(), LinkError> {
    lease.eval(cmd).await?;
    tokio::time::sleep(options.command_pause).await;
    Ok(())
}

fn erase_storage(file: &str) -> String {
    format!("try{{require(\"Storage\").erase(\"{file}\");}}catch(e){{}}")
}

fn unlink_fs(file: &str) -> String {
    format!("try{{require(\"fs\").unlink(\"{file}\");}}catch(e){{}}")
}
