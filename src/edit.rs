use crate::marker::{self, FoundMarker};
use thiserror::Error;

/// A splice of one byte range in the firmware buffer, checked against the
/// text it expects to overwrite.
///
/// Region replaces and marker inserts both lower to these. The marker locator
/// picks the spans; applying them is mechanical.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "Edit does nothing until apply_to() is called"]
pub struct Edit {
    /// First byte of the span
    pub byte_start: usize,
    /// One past the last byte of the span
    pub byte_end: usize,
    /// New text to put at [byte_start, byte_end)
    pub new_text: String,
    /// Text we expect to find at the span before applying
    pub expected_before: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EditError {
    #[error("Before-text verification failed at byte {byte_start}")]
    BeforeTextMismatch {
        byte_start: usize,
        byte_end: usize,
        expected: String,
        found: String,
    },

    #[error("Invalid byte range: [{byte_start}, {byte_end}) in buffer of length {buffer_len}")]
    InvalidByteRange {
        byte_start: usize,
        byte_end: usize,
        buffer_len: usize,
    },

    #[error("Byte range [{byte_start}, {byte_end}) splits a UTF-8 character")]
    NotCharBoundary { byte_start: usize, byte_end: usize },

    #[error("find/replace search string is empty")]
    EmptySearch,
}

/// Result of applying a single edit.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "an unchecked EditResult may hide a skipped splice"]
pub enum EditResult {
    /// Edit was applied
    Applied { bytes_changed: usize },
    /// Span already held the new text
    AlreadyApplied,
}

impl Edit {
    pub fn new(
        byte_start: usize,
        byte_end: usize,
        new_text: impl Into<String>,
        expected_before: impl Into<String>,
    ) -> Self {
        Self {
            byte_start,
            byte_end,
            new_text: new_text.into(),
            expected_before: expected_before.into(),
        }
    }

    /// Validate the edit against the current buffer.
    ///
    /// The text currently inside the span, once bounds and expectation check out.
    fn validate<'a>(&self, buffer: &'a str) -> Result<&'a str, EditError> {
        if self.byte_start > self.byte_end || self.byte_end > buffer.len() {
            return Err(EditError::InvalidByteRange {
                byte_start: self.byte_start,
                byte_end: self.byte_end,
                buffer_len: buffer.len(),
            });
        }

        let current = buffer
            .get(self.byte_start..self.byte_end)
            .ok_or(EditError::NotCharBoundary {
                byte_start: self.byte_start,
                byte_end: self.byte_end,
            })?;

        if current == self.new_text {
            return Ok(current);
        }

        if current != self.expected_before {
            return Err(EditError::BeforeTextMismatch {
                byte_start: self.byte_start,
                byte_end: self.byte_end,
                expected: self.expected_before.clone(),
                found: current.to_string(),
            });
        }

        Ok(current)
    }

    /// Apply this edit to `buffer` in place.
    pub fn apply_to(&self, buffer: &mut String) -> Result<EditResult, EditError> {
        let current = self.validate(buffer)?;
        if current == self.new_text {
            return Ok(EditResult::AlreadyApplied);
        }

        buffer.replace_range(self.byte_start..self.byte_end, &self.new_text);
        Ok(EditResult::Applied {
            bytes_changed: self.new_text.len(),
        })
    }

    /// Apply several edits to the same buffer.
    ///
    /// Edits are validated against the original buffer, sorted by byte_start
    /// descending and applied bottom-to-top so offsets stay valid.
    pub fn apply_batch(
        mut edits: Vec<Edit>,
        buffer: &mut String,
    ) -> Result<Vec<EditResult>, EditError> {
        if edits.is_empty() {
            return Ok(Vec::new());
        }

        edits.sort_by(|a, b| b.byte_start.cmp(&a.byte_start));

        for edit in &edits {
            edit.validate(buffer)?;
        }

        // Sorted descending: each earlier edit must end before the later one starts
        for window in edits.windows(2) {
            let (later, earlier) = (&window[0], &window[1]);
            if earlier.byte_end > later.byte_start {
                return Err(EditError::InvalidByteRange {
                    byte_start: later.byte_start,
                    byte_end: earlier.byte_end,
                    buffer_len: buffer.len(),
                });
            }
        }

        edits.iter().map(|edit| edit.apply_to(buffer)).collect()
    }
}

/// What a patch operation did to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    /// The buffer was rewritten at `occurrences` places
    Applied { occurrences: usize },
    /// The marker(s) or search string were absent; buffer untouched
    NotFound,
}

impl EditOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, EditOutcome::Applied { .. })
    }
}

/// Replace the body of region `region` of `module_key` with `new_text`.
///
/// The result is `<start marker>\n<trimmed new_text>\n<end marker>`, keeping the
/// exact marker spellings that were found so the region can be patched again.
/// A missing region leaves the buffer untouched and reports `NotFound`.
pub fn apply_replace(
    buffer: &mut String,
    module_key: &str,
    region: &str,
    new_text: &str,
) -> Result<EditOutcome, EditError> {
    let Some(span) = marker::locate(buffer, module_key, region) else {
        return Ok(EditOutcome::NotFound);
    };

    let byte_start = span.start.offset;
    let byte_end = span.end.end();
    let replacement = format!(
        "{}\n{}\n{}",
        span.start.text,
        new_text.trim(),
        span.end.text
    );
    let expected = buffer[byte_start..byte_end].to_string();

    let _ = Edit::new(byte_start, byte_end, replacement, expected).apply_to(buffer)?;
    Ok(EditOutcome::Applied { occurrences: 1 })
}

/// Insert `new_text` in front of every insertion marker `marker` of `module_key`.
///
/// Each occurrence becomes `\n<trimmed new_text>\n<marker>`. The leading
/// break keeps the code out of any line comment the marker follows; the
/// marker keeps its original spelling so later insertions still find it.
pub fn apply_insert(
    buffer: &mut String,
    module_key: &str,
    marker: &str,
    new_text: &str,
) -> Result<EditOutcome, EditError> {
    let points = marker::find_insertion_points(buffer, module_key, marker);
    if points.is_empty() {
        return Ok(EditOutcome::NotFound);
    }

    let code = new_text.trim();
    let occurrences = points.len();
    let edits = points
        .into_iter()
        .map(|FoundMarker { offset, text, .. }| {
            let end = offset + text.len();
            Edit::new(offset, end, format!("\n{code}\n{text}"), text)
        })
        .collect();

    let _ = Edit::apply_batch(edits, buffer)?;
    Ok(EditOutcome::Applied { occurrences })
}

/// Replace every literal occurrence of `find` with `replacement`.
///
/// The search string is matched literally; nothing in it is interpreted as a
/// pattern.
pub fn apply_find_replace(
    buffer: &mut String,
    find: &str,
    replacement: &str,
) -> Result<EditOutcome, EditError> {
    if find.is_empty() {
        return Err(EditError::EmptySearch);
    }

    let occurrences = buffer.matches(find).count();
    if occurrences == 0 {
        return Ok(EditOutcome::NotFound);
    }

    *buffer = buffer.replace(find, replacement);
    Ok(EditOutcome::Applied { occurrences })
}

/// Turn user-supplied free text into a double-quoted string literal.
///
/// Returns `None` for empty (or whitespace-only) input, in which case the
/// find/replace rule that wanted it is skipped.
pub fn quote_input(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut quoted = String::with_capacity(trimmed.len() + 2);
    quoted.push('"');
    for ch in trimmed.chars() {
        match ch {
            '\\' => quoted.push_str("\\\\"),
            '"' => quoted.push_str("\\\""),
            other => quoted.push(other),
        }
    }
    quoted.push('"');
    Some(quoted)
}
