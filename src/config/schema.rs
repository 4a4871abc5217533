use crate::config::module::{PatchModule, PatchOperation, Replacement};
use crate::marker::is_valid_name;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;

/// One module definition file.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct ModuleConfig {
    #[serde(default)]
    pub meta: Metadata,
    #[serde(default)]
    pub transfer: Option<TransferSettings>,
    #[serde(default)]
    pub firmware: Vec<FirmwareDefinition>,
    #[serde(default)]
    pub modules: Vec<ModuleDefinition>,
}

impl ModuleConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut issues = Vec::new();

        if self.modules.is_empty() && self.firmware.is_empty() {
            issues.push(ValidationIssue::EmptyDefinitions);
        }

        if let Some(transfer) = &self.transfer {
            transfer.collect_issues(&mut issues);
        }

        for firmware in &self.firmware {
            if firmware.key.trim().is_empty() {
                issues.push(ValidationIssue::MissingField {
                    module: None,
                    field: "firmware.key",
                });
            }
            if firmware.file.trim().is_empty() {
                issues.push(ValidationIssue::MissingField {
                    module: Some(firmware.key.clone()),
                    field: "firmware.file",
                });
            }
        }

        let mut seen = HashSet::new();
        for module in &self.modules {
            if !seen.insert(module.key.as_str()) {
                issues.push(ValidationIssue::DuplicateModule {
                    key: module.key.clone(),
                });
            }
            module.collect_issues(&mut issues);
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { issues })
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Metadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Tuning for the device transfer protocol.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct TransferSettings {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// How long to wait for a directory listing to arrive
    #[serde(default = "default_listing_settle_ms")]
    pub listing_settle_ms: u64,
}

fn default_chunk_size() -> usize {
    1024
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_listing_settle_ms() -> u64 {
    1000
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            timeout_ms: default_timeout_ms(),
            listing_settle_ms: default_listing_settle_ms(),
        }
    }
}

impl TransferSettings {
    fn collect_issues(&self, issues: &mut Vec<ValidationIssue>) {
        if self.chunk_size == 0 || self.chunk_size > crate::protocol::frame::MAX_PAYLOAD {
            issues.push(ValidationIssue::InvalidSetting {
                field: "transfer.chunk_size",
                message: format!(
                    "must be between 1 and {} bytes, got {}",
                    crate::protocol::frame::MAX_PAYLOAD,
                    self.chunk_size
                ),
            });
        }
        if self.timeout_ms == 0 {
            issues.push(ValidationIssue::InvalidSetting {
                field: "transfer.timeout_ms",
                message: "must be greater than zero".to_string(),
            });
        }
    }
}

/// A base firmware the modules can be applied to.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct FirmwareDefinition {
    pub key: String,
    #[serde(default)]
    pub name: String,
    pub file: String,
    /// Minimum Espruino interpreter version on the device, e.g. "2v25.359"
    #[serde(default)]
    pub espversion: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModuleDefinition {
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub input: Option<InputSpec>,
    #[serde(default)]
    pub resources: Option<ResourceManifest>,
    #[serde(default)]
    pub replace: Vec<ReplaceDefinition>,
    #[serde(default)]
    pub insert: Vec<InsertDefinition>,
    #[serde(default)]
    pub find: Vec<FindDefinition>,
}

/// The module takes one line of free text from the user.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct InputSpec {
    #[serde(default)]
    pub placeholder: Option<String>,
}

/// Extra files a module needs on the device.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ResourceManifest {
    /// Where the files are read from on the host
    pub source_folder: String,
    /// Directory on the device's secondary storage
    pub target_path: String,
    pub files: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReplaceDefinition {
    pub region: String,
    pub text: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InsertDefinition {
    pub marker: String,
    pub text: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FindDefinition {
    pub string: String,
    #[serde(default)]
    pub replace: Option<String>,
    #[serde(default)]
    pub use_input: bool,
}

impl ModuleDefinition {
    fn collect_issues(&self, issues: &mut Vec<ValidationIssue>) {
        let module = || Some(self.key.clone());

        if self.key.trim().is_empty() {
            issues.push(ValidationIssue::MissingField {
                module: None,
                field: "key",
            });
        } else if !is_valid_name(&self.key) {
            issues.push(ValidationIssue::InvalidName {
                module: None,
                field: "key",
                value: self.key.clone(),
            });
        }

        for replace in &self.replace {
            if !is_valid_name(&replace.region) {
                issues.push(ValidationIssue::InvalidName {
                    module: module(),
                    field: "replace.region",
                    value: replace.region.clone(),
                });
            }
        }

        for insert in &self.insert {
            if !is_valid_name(&insert.marker) {
                issues.push(ValidationIssue::InvalidName {
                    module: module(),
                    field: "insert.marker",
                    value: insert.marker.clone(),
                });
            }
        }

        for find in &self.find {
            if find.string.is_empty() {
                issues.push(ValidationIssue::MissingField {
                    module: module(),
                    field: "find.string",
                });
            }
            match (&find.replace, find.use_input) {
                (Some(_), true) => issues.push(ValidationIssue::InvalidCombo {
                    module: module(),
                    message: format!(
                        "find '{}' sets both replace and use_input",
                        find.string
                    ),
                }),
                (None, false) => issues.push(ValidationIssue::MissingField {
                    module: module(),
                    field: "find.replace",
                }),
                (None, true) if self.input.is_none() => {
                    issues.push(ValidationIssue::InvalidCombo {
                        module: module(),
                        message: format!(
                            "find '{}' uses input but the module declares no input",
                            find.string
                        ),
                    })
                }
                _ => {}
            }
        }

        if let Some(resources) = &self.resources {
            if resources.target_path.trim().is_empty() {
                issues.push(ValidationIssue::MissingField {
                    module: module(),
                    field: "resources.target_path",
                });
            }
            if resources.files.is_empty() {
                issues.push(ValidationIssue::MissingField {
                    module: module(),
                    field: "resources.files",
                });
            }
        }
    }

    /// Convert a validated definition into its runtime form.
    ///
    /// Operations are laid out in application order: replacements, then
    /// insertions, then find/replace rules, each in declaration order.
    pub fn to_module(&self) -> PatchModule {
        let replaces = self.replace.iter().map(|r| PatchOperation::Replace {
            region: r.region.clone(),
            text: r.text.clone(),
        });
        let inserts = self.insert.iter().map(|i| PatchOperation::Insert {
            marker: i.marker.clone(),
            text: i.text.clone(),
        });
        let finds = self.find.iter().map(|f| PatchOperation::FindReplace {
            find: f.string.clone(),
            replacement: match &f.replace {
                Some(text) if !f.use_input => Replacement::Literal(text.clone()),
                _ => Replacement::UserInput,
            },
        });

        PatchModule {
            key: self.key.clone(),
            name: if self.name.is_empty() {
                self.key.clone()
            } else {
                self.name.clone()
            },
            description: self.description.clone(),
            authors: self.authors.clone(),
            input: self.input.clone(),
            resources: self.resources.clone(),
            operations: replaces.chain(inserts).chain(finds).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, issue) in self.issues.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    EmptyDefinitions,
    MissingField {
        module: Option<String>,
        field: &'static str,
    },
    InvalidName {
        module: Option<String>,
        field: &'static str,
        value: String,
    },
    DuplicateModule {
        key: String,
    },
    InvalidCombo {
        module: Option<String>,
        message: String,
    },
    InvalidSetting {
        field: &'static str,
        message: String,
    },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::EmptyDefinitions => {
                write!(f, "definition file contains no modules or firmware")
            }
            ValidationIssue::MissingField { module, field } => match module {
                Some(key) => write!(f, "module '{key}' missing required field '{field}'"),
                None => write!(f, "entry missing required field '{field}'"),
            },
            ValidationIssue::InvalidName {
                module,
                field,
                value,
            } => match module {
                Some(key) => write!(
                    f,
                    "module '{key}' has invalid {field} '{value}' (expected [A-Za-z0-9_]+)"
                ),
                None => write!(f, "invalid {field} '{value}' (expected [A-Za-z0-9_]+)"),
            },
            ValidationIssue::DuplicateModule { key } => {
                write!(f, "module '{key}' is defined more than once")
            }
            ValidationIssue::InvalidCombo { module, message } => match module {
                Some(key) => write!(f, "module '{key}' has invalid configuration: {message}"),
                None => write!(f, "invalid module configuration: {message}"),
            },
            ValidationIssue::InvalidSetting { field, message } => {
                write!(f, "invalid setting '{field}': {message}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(key: &str) -> ModuleDefinition {
        ModuleDefinition {
            key: key.to_string(),
            name: String::new(),
            description: String::new(),
            authors: Vec::new(),
            input: None,
            resources: None,
            replace: Vec::new(),
            insert: Vec::new(),
            find: Vec::new(),
        }
    }

    fn config(modules: Vec<ModuleDefinition>) -> ModuleConfig {
        ModuleConfig {
            modules,
            ..ModuleConfig::default()
        }
    }

    #[test]
    fn test_empty_config_rejected() {
        let err = ModuleConfig::default().validate().unwrap_err();
        assert_eq!(err.issues, vec![ValidationIssue::EmptyDefinitions]);
    }

    #[test]
    fn test_duplicate_module_keys() {
        let err = config(vec![module("A"), module("A")]).validate().unwrap_err();
        assert!(err
            .issues
            .contains(&ValidationIssue::DuplicateModule { key: "A".into() }));
    }

    #[test]
    fn test_invalid_region_name() {
        let mut m = module("A");
        m.replace.push(ReplaceDefinition {
            region: "bad name".into(),
            text: "x".into(),
        });
        let err = config(vec![m]).validate().unwrap_err();
        assert!(matches!(
            &err.issues[0],
            ValidationIssue::InvalidName { field: "replace.region", .. }
        ));
    }

    #[test]
    fn test_find_requires_exactly_one_replacement_source() {
        let mut m = module("A");
        m.input = Some(InputSpec::default());
        m.find.push(FindDefinition {
            string: "x".into(),
            replace: Some("y".into()),
            use_input: true,
        });
        m.find.push(FindDefinition {
            string: "x".into(),
            replace: None,
            use_input: false,
        });
        let err = config(vec![m]).validate().unwrap_err();
        assert_eq!(err.issues.len(), 2);
    }

    #[test]
    fn test_use_input_requires_input_declaration() {
        let mut m = module("A");
        m.find.push(FindDefinition {
            string: "KPSS".into(),
            replace: None,
            use_input: true,
        });
        let err = config(vec![m]).validate().unwrap_err();
        assert!(err.to_string().contains("declares no input"));
    }

    #[test]
    fn test_transfer_settings_bounds() {
        let mut cfg = config(vec![module("A")]);
        cfg.transfer = Some(TransferSettings {
            chunk_size: 8192,
            timeout_ms: 0,
            listing_settle_ms: 0,
        });
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.issues.len(), 2);
    }

    #[test]
    fn test_to_module_orders_operations_by_phase() {
        let mut m = module("A");
        m.input = Some(InputSpec::default());
        m.find.push(FindDefinition {
            string: "f".into(),
            replace: None,
            use_input: true,
        });
        m.insert.push(InsertDefinition {
            marker: "I".into(),
            text: "i".into(),
        });
        m.replace.push(ReplaceDefinition {
            region: "R".into(),
            text: "r".into(),
        });

        let module = m.to_module();
        assert_eq!(module.name, "A");
        assert!(matches!(module.operations[0], PatchOperation::Replace { .. }));
        assert!(matches!(module.operations[1], PatchOperation::Insert { .. }));
        assert!(matches!(
            module.operations[2],
            PatchOperation::FindReplace {
                replacement: Replacement::UserInput,
                ..
            }
        ));
    }
}
