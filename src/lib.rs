//! CFW Builder: custom firmware builder and installer for Espruino devices
//!
//! Builds a firmware artifact from a base JavaScript source and a set of
//! selectable patch modules, then installs it over the device's packetized
//! file-transfer protocol.
//!
//! # Architecture
//!
//! Firmware source carries comment markers (`//ModBegin_Region`,
//! `/*ModInsert_Point*/`, ...) that name the places a module may change. All
//! patch operations compile down to a verified byte-span [`Edit`]; the
//! intelligence lives in locating the markers, not in applying text.
//!
//! The pipeline:
//!
//! 1. [`config`] loads module definitions from TOML into a [`ModuleRegistry`]
//! 2. [`config::resolve`] applies the selected modules, then combo rules
//! 3. [`stamp`] rewrites the `const VERSION` literal with a build suffix
//! 4. [`compress`] minifies through an external command, or falls back
//! 5. [`install`] pushes the artifact, VERSION record and module resources
//!    over a [`DeviceLink`]
//!
//! # Example
//!
//! ```
//! use cfw_builder::config::{resolve, ModuleInputs, PatchModule};
//!
//! let base = "//RadioBegin_Menu\nold\n//RadioEnd_Menu";
//! let radio = PatchModule::new("Radio").with_replace("Menu", "new");
//!
//! let resolution = resolve(base, &[&radio], &[], &ModuleInputs::new()).unwrap();
//! assert_eq!(resolution.buffer, "//RadioBegin_Menu\nnew\n//RadioEnd_Menu");
//! ```

pub mod artifact;
pub mod compress;
pub mod config;
pub mod edit;
pub mod install;
pub mod marker;
pub mod protocol;
pub mod resources;
pub mod stamp;

// Re-exports
pub use artifact::{build, Artifact, ArtifactError, Build, BuildRequest, MAX_ARTIFACT_SIZE};
pub use compress::{CommandCompressor, CompressError, Compressor};
pub use config::{
    load_from_path, load_from_str, resolve, ConfigError, ModuleRegistry, PatchModule,
    PatchOperation, PatchResult, ResolveError,
};
pub use edit::{Edit, EditError, EditOutcome, EditResult};
pub use install::{install, trigger_sd_install, InstallError, InstallOptions, InstallTarget};
pub use protocol::{DeviceLink, LinkError, LinkLease, TransferError, TransferOptions};
pub use resources::{FsResourceSource, ResourceSource, SyncReport};
pub use stamp::{stamp, Stamped};
