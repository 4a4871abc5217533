//! Integration tests for module definition loading
//!
//! Tests validation, multi-file registries and firmware compatibility

use cfw_builder::config::{
    compatible_firmware, load_from_path, load_from_str, ConfigError, ModuleRegistry,
    PatchOperation, Replacement, ValidationIssue,
};
use std::fs;
use tempfile::TempDir;

#[test]
fn test_load_module_config_basic() {
    let toml = r#"
[meta]
name = "radio"
description = "Radio station patches"

[[modules]]
key = "CustomRadioPatch"
name = "Custom Radio"
description = "Play your own stations."
authors = ["someone"]

[[modules.find]]
string = "Pip.radioKPSS"
replace = "Pip.radioCustom"

[[modules.insert]]
marker = "customFlag"
text = "&& !Pip.radioCustom"

[[modules.replace]]
region = "submenuRadio"
text = "let submenuRadio = () => {};"

[modules.resources]
source_folder = "resources/RADIO"
target_path = "RADIO"
files = ["KPSS_01.wav", "KPSS_02.wav"]
"#;

    let config = load_from_str(toml).unwrap();
    assert_eq!(config.meta.name, "radio");
    assert!(config.transfer.is_none());
    assert_eq!(config.modules.len(), 1);

    let module = config.modules[0].to_module();
    assert_eq!(module.authors, vec!["someone"]);
    assert_eq!(module.resources.as_ref().unwrap().files.len(), 2);

    // Application order, whatever the declaration order.
    let kinds: Vec<u8> = module.operations.iter().map(PatchOperation::phase).collect();
    assert_eq!(kinds, vec![0, 1, 2]);
    assert_eq!(
        module.operations[2],
        PatchOperation::FindReplace {
            find: "Pip.radioKPSS".into(),
            replacement: Replacement::Literal("Pip.radioCustom".into()),
        }
    );
}

#[test]
fn test_transfer_settings_defaults() {
    let config = load_from_str(
        r#"
[transfer]
timeout_ms = 2000

[[modules]]
key = "IconMod"
"#,
    )
    .unwrap();

    let transfer = config.transfer.unwrap();
    assert_eq!(transfer.chunk_size, 1024);
    assert_eq!(transfer.timeout_ms, 2000);
    assert_eq!(transfer.listing_settle_ms, 1000);
}

#[test]
fn test_validation_collects_every_issue() {
    let toml = r#"
[transfer]
chunk_size = 9000

[[modules]]
key = "Bad Key"

[[modules]]
key = "NamePatch"

[[modules.replace]]
region = "has-dash"
text = "x"

[[modules.find]]
string = "\"VAULT DWELLER\""
use_input = true

[[modules]]
key = "NamePatch"
"#;

    let err = load_from_str(toml).unwrap_err();
    let ConfigError::Invalid { source, .. } = &err else {
        panic!("expected validation error, got {err}");
    };

    let issues = &source.issues;
    assert!(issues
        .iter()
        .any(|i| matches!(i, ValidationIssue::InvalidSetting { field, .. } if *field == "transfer.chunk_size")));
    assert!(issues
        .iter()
        .any(|i| matches!(i, ValidationIssue::InvalidName { value, .. } if value == "Bad Key")));
    assert!(issues
        .iter()
        .any(|i| matches!(i, ValidationIssue::InvalidName { value, .. } if value == "has-dash")));
    assert!(issues
        .iter()
        .any(|i| matches!(i, ValidationIssue::InvalidCombo { .. })));
    assert!(issues
        .iter()
        .any(|i| matches!(i, ValidationIssue::DuplicateModule { key } if key == "NamePatch")));
}

#[test]
fn test_empty_definitions_rejected() {
    let err = load_from_str("[meta]\nname = \"nothing\"\n").unwrap_err();
    assert!(err.to_string().contains("invalid module definitions"));
}

#[test]
fn test_load_from_path_reports_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.toml");
    fs::write(&path, "[[modules]]\nkey = \n").unwrap();

    let err = load_from_path(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { file: Some(_), .. }));
    assert!(err.to_string().contains("broken.toml"));

    let missing = load_from_path(dir.path().join("missing.toml")).unwrap_err();
    assert!(matches!(missing, ConfigError::Read { .. }));
}

#[test]
fn test_registry_from_several_files() {
    let first = load_from_str(
        r#"
[transfer]
chunk_size = 512

[[modules]]
key = "IconMod"
"#,
    )
    .unwrap();
    let second = load_from_str(
        r#"
[transfer]
chunk_size = 2048

[[firmware]]
key = "1.29"
file = "FW_1.29.js"

[[modules]]
key = "AlarmPatch"
"#,
    )
    .unwrap();

    let registry = ModuleRegistry::from_configs([&first, &second]).unwrap();
    let keys: Vec<&str> = registry.modules().iter().map(|m| m.key.as_str()).collect();
    assert_eq!(keys, vec!["IconMod", "AlarmPatch"]);
    assert_eq!(registry.transfer().chunk_size, 512);
    assert_eq!(registry.firmware_by_key("1.29").unwrap().file, "FW_1.29.js");
}

#[test]
fn test_registry_rejects_duplicates_across_files() {
    let a = load_from_str("[[modules]]\nkey = \"IconMod\"\n").unwrap();
    let b = load_from_str("[[modules]]\nkey = \"IconMod\"\n").unwrap();

    let err = ModuleRegistry::from_configs([&a, &b]).unwrap_err();
    assert_eq!(
        err.issues,
        vec![ValidationIssue::DuplicateModule {
            key: "IconMod".into()
        }]
    );
}

#[test]
fn test_firmware_compatibility() {
    let config = load_from_str(
        r#"
[[firmware]]
key = "1.29"
file = "FW_1.29.js"
espversion = "2v25.359"

[[firmware]]
key = "1.31"
file = "FW_1.31.js"
espversion = "2v25.376"

[[firmware]]
key = "legacy"
file = "FW_legacy.js"
"#,
    )
    .unwrap();

    let keys = |device: &str| -> Vec<String> {
        compatible_firmware(&config.firmware, device)
            .into_iter()
            .map(|f| f.key.clone())
            .collect()
    };

    assert_eq!(keys("2v25.376"), vec!["1.29", "1.31", "legacy"]);
    assert_eq!(keys("2v25.360"), vec!["1.29", "legacy"]);
    assert_eq!(keys("2v24"), vec!["legacy"]);
    assert_eq!(keys("not a version"), vec!["legacy"]);
}
