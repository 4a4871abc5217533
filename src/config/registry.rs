//! Immutable set of loaded modules, firmware definitions and combo rules.

use crate::config::applicator::ResolveError;
use crate::config::module::PatchModule;
use crate::config::schema::{
    FirmwareDefinition, ModuleConfig, ResourceManifest, TransferSettings, ValidationError,
    ValidationIssue,
};
use std::collections::HashSet;

/// Reserved module key used for combo rule markers.
pub const SPECIAL_PERKS_COMBO: &str = "SpecialPerksCombo";

/// An extra region replacement applied when every required module is selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComboRule {
    /// Module key the rule's markers are spelled with
    pub key: String,
    pub requires: Vec<String>,
    pub region: String,
    pub text: String,
}

impl ComboRule {
    /// Stat menu gains the connect and diagnostics submenus when both the
    /// SPECIAL and perks modules are installed.
    pub fn special_perks() -> Self {
        Self {
            key: SPECIAL_PERKS_COMBO.to_string(),
            requires: vec!["SpecialPatch".to_string(), "PerksPatch".to_string()],
            region: "StatMenuItems".to_string(),
            text: "CONN: submenuConnect,\n            DIAG: submenuDiagnostics".to_string(),
        }
    }

    /// Whether every required module is in `selected`.
    pub fn is_triggered(&self, selected: &[&str]) -> bool {
        !self.requires.is_empty()
            && self
                .requires
                .iter()
                .all(|required| selected.contains(&required.as_str()))
    }
}

pub fn builtin_combos() -> Vec<ComboRule> {
    vec![ComboRule::special_perks()]
}

#[derive(Debug, Clone)]
pub struct ModuleRegistry {
    modules: Vec<PatchModule>,
    firmware: Vec<FirmwareDefinition>,
    transfer: TransferSettings,
    combos: Vec<ComboRule>,
}

impl ModuleRegistry {
    /// Registry from already-built modules, with the built-in combo rules.
    pub fn new(modules: Vec<PatchModule>) -> Self {
        Self {
            modules,
            firmware: Vec::new(),
            transfer: TransferSettings::default(),
            combos: builtin_combos(),
        }
    }

    pub fn with_combos(mut self, combos: Vec<ComboRule>) -> Self {
        self.combos = combos;
        self
    }

    pub fn with_firmware(mut self, firmware: Vec<FirmwareDefinition>) -> Self {
        self.firmware = firmware;
        self
    }

    pub fn from_config(config: &ModuleConfig) -> Self {
        Self {
            modules: config.modules.iter().map(|m| m.to_module()).collect(),
            firmware: config.firmware.clone(),
            transfer: config.transfer.unwrap_or_default(),
            combos: builtin_combos(),
        }
    }

    /// Merge several validated definition files.
    ///
    /// Module keys must be unique across files. The first file that sets
    /// `[transfer]` wins.
    pub fn from_configs<'a>(
        configs: impl IntoIterator<Item = &'a ModuleConfig>,
    ) -> Result<Self, ValidationError> {
        let mut registry = Self::new(Vec::new());
        let mut transfer = None;
        let mut seen = HashSet::new();
        let mut issues = Vec::new();

        for config in configs {
            for def in &config.modules {
                if !seen.insert(def.key.clone()) {
                    issues.push(ValidationIssue::DuplicateModule {
                        key: def.key.clone(),
                    });
                    continue;
                }
                registry.modules.push(def.to_module());
            }
            registry.firmware.extend(config.firmware.iter().cloned());
            if transfer.is_none() {
                transfer = config.transfer;
            }
        }

        if !issues.is_empty() {
            return Err(ValidationError { issues });
        }
        registry.transfer = transfer.unwrap_or_default();
        Ok(registry)
    }

    pub fn get(&self, key: &str) -> Option<&PatchModule> {
        self.modules.iter().find(|m| m.key == key)
    }

    pub fn modules(&self) -> &[PatchModule] {
        &self.modules
    }

    pub fn firmware(&self) -> &[FirmwareDefinition] {
        &self.firmware
    }

    pub fn transfer(&self) -> TransferSettings {
        self.transfer
    }

    pub fn combos(&self) -> &[ComboRule] {
        &self.combos
    }

    /// Look up the selected modules, keeping selection order.
    ///
    /// Repeated keys are selected once, at their first position.
    pub fn select<S: AsRef<str>>(&self, keys: &[S]) -> Result<Vec<&PatchModule>, ResolveError> {
        let mut seen = HashSet::new();
        let mut selected = Vec::with_capacity(keys.len());

        for key in keys {
            let key = key.as_ref();
            if !seen.insert(key) {
                continue;
            }
            let module = self.get(key).ok_or_else(|| ResolveError::UnknownModule {
                key: key.to_string(),
                suggestion: self.suggest(key),
            })?;
            selected.push(module);
        }

        Ok(selected)
    }

    /// Closest registered module key, for "did you mean" hints.
    pub fn suggest(&self, key: &str) -> Option<String> {
        self.modules
            .iter()
            .map(|m| (strsim::jaro_winkler(key, &m.key), &m.key))
            .filter(|(score, _)| *score > 0.8)
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, key)| key.clone())
    }

    /// Resource manifests of the selected modules, in selection order.
    pub fn resources_for<'a>(
        &self,
        selected: &[&'a PatchModule],
    ) -> Vec<(&'a str, &'a ResourceManifest)> {
        selected
            .iter()
            .filter_map(|m| m.resources.as_ref().map(|r| (m.key.as_str(), r)))
            .collect()
    }

    pub fn firmware_by_key(&self, key: &str) -> Option<&FirmwareDefinition> {
        self.firmware.iter().find(|f| f.key == key)
    }

    /// Base firmware for a device already running release `version`.
    ///
    /// Stamped releases (`1.29.123`) match the `1.29` entry.
    pub fn firmware_for_version(&self, version: &str) -> Option<&FirmwareDefinition> {
        let mut parts = version.trim().split('.');
        match (parts.next(), parts.next()) {
            (Some(major), Some(minor)) if !major.is_empty() && !minor.is_empty() => {
                self.firmware_by_key(&format!("{major}.{minor}"))
            }
            _ => None,
        }
    }
}
