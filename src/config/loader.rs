//! Reading module definition files from disk.

use crate::config::registry::ModuleRegistry;
use crate::config::schema::{ModuleConfig, ValidationError};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no module definitions at {}", .0.display())]
    NotFound(PathBuf),

    #[error("no .toml module definitions in {}", .0.display())]
    NoDefinitions(PathBuf),

    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to scan {}: {source}", .dir.display())]
    Scan {
        dir: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("failed to parse module definitions{}: {source}", origin(.file))]
    Parse {
        file: Option<PathBuf>,
        #[source]
        source: toml_edit::de::Error,
    },

    #[error("invalid module definitions{}:\n{source}", origin(.file))]
    Invalid {
        file: Option<PathBuf>,
        #[source]
        source: ValidationError,
    },
}

fn origin(file: &Option<PathBuf>) -> String {
    file.as_ref()
        .map(|p| format!(" in {}", p.display()))
        .unwrap_or_default()
}

impl ConfigError {
    fn in_file(mut self, path: &Path) -> Self {
        if let ConfigError::Parse { file, .. } | ConfigError::Invalid { file, .. } = &mut self {
            file.get_or_insert_with(|| path.to_path_buf());
        }
        self
    }
}

/// Parse and validate one definition document.
pub fn load_from_str(input: &str) -> Result<ModuleConfig, ConfigError> {
    let config: ModuleConfig =
        toml_edit::de::from_str(input).map_err(|source| ConfigError::Parse { file: None, source })?;
    config
        .validate()
        .map_err(|source| ConfigError::Invalid { file: None, source })?;
    Ok(config)
}

/// Load one definition file.
///
/// Relative `[[firmware]]` file paths are taken relative to the directory
/// holding the definition file.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<ModuleConfig, ConfigError> {
    let path = path.as_ref();
    let input = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config = load_from_str(&input).map_err(|e| e.in_file(path))?;

    let base = path.parent().unwrap_or_else(|| Path::new(""));
    for firmware in &mut config.firmware {
        if Path::new(&firmware.file).is_relative() {
            firmware.file = base.join(&firmware.file).to_string_lossy().into_owned();
        }
    }
    Ok(config)
}

/// The `.toml` files directly inside `dir`, sorted by name.
pub fn definition_files(dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).max_depth(1) {
        let entry = entry.map_err(|source| ConfigError::Scan {
            dir: dir.to_path_buf(),
            source,
        })?;
        if entry.file_type().is_file()
            && entry.path().extension().and_then(|ext| ext.to_str()) == Some("toml")
        {
            files.push(entry.into_path());
        }
    }
    files.sort();

    if files.is_empty() {
        return Err(ConfigError::NoDefinitions(dir.to_path_buf()));
    }
    Ok(files)
}

/// Build a registry from a definition file, or from every definition file
/// in a directory.
pub fn load_registry(path: &Path) -> Result<ModuleRegistry, ConfigError> {
    let files = if path.is_file() {
        vec![path.to_path_buf()]
    } else if path.is_dir() {
        definition_files(path)?
    } else {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    };

    let configs = files
        .iter()
        .map(|file| {
            debug!(file = %file.display(), "loading module definitions");
            load_from_path(file)
        })
        .collect::<Result<Vec<_>, _>>()?;

    ModuleRegistry::from_configs(&configs)
        .map_err(|source| ConfigError::Invalid { file: None, source })
}
