//! Patch set resolver - applies selected modules to a firmware source
//!
//! Modules are applied in selection order. Within a module, replacements run
//! first, then insertions, then find/replace rules. Combo rules run last.
//! Absent regions and markers are reported, not treated as errors.

use crate::config::module::{PatchModule, PatchOperation, Replacement};
use crate::config::registry::ComboRule;
use crate::edit::{self, EditError, EditOutcome};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

/// User free text per module key, for find rules that take input.
pub type ModuleInputs = HashMap<String, String>;

/// Result of applying a single operation
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "PatchResult should be checked for not-found conditions"]
pub enum PatchResult {
    /// Operation rewrote the buffer
    Applied { occurrences: usize },
    /// Begin/end markers for the region are not in the source
    RegionNotFound { region: String },
    /// Insertion marker is not in the source
    MarkerNotFound { marker: String },
    /// Search string does not occur in the source
    NoMatch { find: String },
    /// Module takes input but none was given
    SkippedInput,
}

impl PatchResult {
    pub fn is_applied(&self) -> bool {
        matches!(self, PatchResult::Applied { .. })
    }
}

impl fmt::Display for PatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchResult::Applied { occurrences: 1 } => write!(f, "applied"),
            PatchResult::Applied { occurrences } => {
                write!(f, "applied at {} places", occurrences)
            }
            PatchResult::RegionNotFound { region } => {
                write!(f, "region '{}' not found", region)
            }
            PatchResult::MarkerNotFound { marker } => {
                write!(f, "marker '{}' not found", marker)
            }
            PatchResult::NoMatch { find } => write!(f, "no match for {:?}", find),
            PatchResult::SkippedInput => write!(f, "skipped (no input)"),
        }
    }
}

/// One line of the resolve report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationReport {
    /// Module key, or the combo rule's reserved key
    pub module: String,
    pub operation: String,
    pub result: PatchResult,
}

/// Output of a resolve run.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub buffer: String,
    pub reports: Vec<OperationReport>,
    /// Keys of the combo rules that fired
    pub combos_applied: Vec<String>,
}

impl Resolution {
    /// Reports for operations that found nothing to patch.
    pub fn not_applied(&self) -> impl Iterator<Item = &OperationReport> {
        self.reports.iter().filter(|r| !r.result.is_applied())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("unknown module '{key}'{}", did_you_mean(.suggestion))]
    UnknownModule {
        key: String,
        suggestion: Option<String>,
    },

    #[error("module '{module}' has a malformed operation ({operation}): {reason}")]
    MalformedModule {
        module: String,
        operation: String,
        reason: String,
    },
}

fn did_you_mean(suggestion: &Option<String>) -> String {
    suggestion
        .as_ref()
        .map(|s| format!(" (did you mean '{s}'?)"))
        .unwrap_or_default()
}

impl ResolveError {
    fn malformed(module: &str, op: &PatchOperation, reason: impl fmt::Display) -> Self {
        ResolveError::MalformedModule {
            module: module.to_string(),
            operation: op.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Apply `modules` (in the given order) and then `combos` to `base`.
///
/// A malformed operation aborts the whole run; nothing partially patched is
/// returned.
pub fn resolve(
    base: &str,
    modules: &[&PatchModule],
    combos: &[ComboRule],
    inputs: &ModuleInputs,
) -> Result<Resolution, ResolveError> {
    let mut buffer = base.to_string();
    let mut reports = Vec::new();

    for module in modules {
        for op in module.ordered_operations() {
            op.validate()
                .map_err(|reason| ResolveError::malformed(&module.key, op, reason))?;

            let result = apply_operation(&mut buffer, module, op, inputs)
                .map_err(|e| ResolveError::malformed(&module.key, op, e))?;
            log_result(&module.key, op, &result);

            reports.push(OperationReport {
                module: module.key.clone(),
                operation: op.to_string(),
                result,
            });
        }
    }

    let selected: Vec<&str> = modules.iter().map(|m| m.key.as_str()).collect();
    let mut combos_applied = Vec::new();

    for combo in combos.iter().filter(|c| c.is_triggered(&selected)) {
        let op = PatchOperation::Replace {
            region: combo.region.clone(),
            text: combo.text.clone(),
        };
        let outcome = edit::apply_replace(&mut buffer, &combo.key, &combo.region, &combo.text)
            .map_err(|e| ResolveError::malformed(&combo.key, &op, e))?;
        let result = match outcome {
            EditOutcome::Applied { occurrences } => PatchResult::Applied { occurrences },
            EditOutcome::NotFound => PatchResult::RegionNotFound {
                region: combo.region.clone(),
            },
        };
        log_result(&combo.key, &op, &result);

        combos_applied.push(combo.key.clone());
        reports.push(OperationReport {
            module: combo.key.clone(),
            operation: op.to_string(),
            result,
        });
    }

    Ok(Resolution {
        buffer,
        reports,
        combos_applied,
    })
}

fn apply_operation(
    buffer: &mut String,
    module: &PatchModule,
    op: &PatchOperation,
    inputs: &ModuleInputs,
) -> Result<PatchResult, EditError> {
    match op {
        PatchOperation::Replace { region, text } => {
            Ok(match edit::apply_replace(buffer, &module.key, region, text)? {
                EditOutcome::Applied { occurrences } => PatchResult::Applied { occurrences },
                EditOutcome::NotFound => PatchResult::RegionNotFound {
                    region: region.clone(),
                },
            })
        }
        PatchOperation::Insert { marker, text } => {
            Ok(match edit::apply_insert(buffer, &module.key, marker, text)? {
                EditOutcome::Applied { occurrences } => PatchResult::Applied { occurrences },
                EditOutcome::NotFound => PatchResult::MarkerNotFound {
                    marker: marker.clone(),
                },
            })
        }
        PatchOperation::FindReplace { find, replacement } => {
            let replacement = match replacement {
                Replacement::Literal(text) => text.clone(),
                Replacement::UserInput => {
                    match inputs.get(&module.key).and_then(|raw| edit::quote_input(raw)) {
                        Some(quoted) => quoted,
                        None => return Ok(PatchResult::SkippedInput),
                    }
                }
            };
            Ok(match edit::apply_find_replace(buffer, find, &replacement)? {
                EditOutcome::Applied { occurrences } => PatchResult::Applied { occurrences },
                EditOutcome::NotFound => PatchResult::NoMatch { find: find.clone() },
            })
        }
    }
}

fn log_result(module: &str, op: &PatchOperation, result: &PatchResult) {
    match result {
        PatchResult::Applied { occurrences } => {
            info!(module, operation = %op, occurrences, "applied")
        }
        PatchResult::RegionNotFound { .. } | PatchResult::MarkerNotFound { .. } => {
            warn!(module, operation = %op, "{}", result)
        }
        PatchResult::NoMatch { .. } | PatchResult::SkippedInput => {
            debug!(module, operation = %op, "{}", result)
        }
    }
}
