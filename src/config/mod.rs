pub mod applicator;
pub mod loader;
pub mod module;
pub mod registry;
pub mod schema;
pub mod version;

pub use applicator::{
    resolve, ModuleInputs, OperationReport, PatchResult, Resolution, ResolveError,
};
pub use loader::{definition_files, load_from_path, load_from_str, load_registry, ConfigError};
pub use module::{PatchModule, PatchOperation, Replacement};
pub use registry::{builtin_combos, ComboRule, ModuleRegistry, SPECIAL_PERKS_COMBO};
pub use schema::{
    FirmwareDefinition, InputSpec, Metadata, ModuleConfig, ModuleDefinition, ResourceManifest,
    TransferSettings, ValidationError, ValidationIssue,
};
pub use version::{compatible_firmware, matches_requirement, EspruinoVersion, VersionError};
