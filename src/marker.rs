//! Marker grammar and region location.
//!
//! Firmware sources carry literal comment markers that delimit patchable
//! regions and insertion points. Every marker exists in two spellings:
//!
//! ```text
//! //<ModuleKey>Begin_<Region>      /*<ModuleKey>Begin_<Region>*/
//! //<ModuleKey>End_<Region>        /*<ModuleKey>End_<Region>*/
//! //<ModuleKey>Insert_<Marker>     /*<ModuleKey>Insert_<Marker>*/
//! ```
//!
//! The grammar is closed: no other spelling is recognised.

use std::fmt;

/// Textual spelling of a marker.
///
/// Declaration order is the tie-break order: when both spellings occur at the
/// same offset the line-comment spelling wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerStyle {
    /// `//KeyRole_Name`
    Line,
    /// `/*KeyRole_Name*/`
    Block,
}

impl MarkerStyle {
    pub const ALL: [MarkerStyle; 2] = [MarkerStyle::Line, MarkerStyle::Block];
}

/// What a marker delimits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerRole {
    Begin,
    End,
    Insert,
}

impl MarkerRole {
    fn as_str(self) -> &'static str {
        match self {
            MarkerRole::Begin => "Begin",
            MarkerRole::End => "End",
            MarkerRole::Insert => "Insert",
        }
    }
}

impl fmt::Display for MarkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the literal marker text for a module key, role and name.
pub fn marker_text(style: MarkerStyle, module_key: &str, role: MarkerRole, name: &str) -> String {
    match style {
        MarkerStyle::Line => format!("//{module_key}{role}_{name}"),
        MarkerStyle::Block => format!("/*{module_key}{role}_{name}*/"),
    }
}

/// Both spellings of one marker, in tie-break order.
fn spellings(module_key: &str, role: MarkerRole, name: &str) -> [(MarkerStyle, String); 2] {
    MarkerStyle::ALL.map(|style| (style, marker_text(style, module_key, role, name)))
}

/// Whether `name` is usable inside a marker (`[A-Za-z0-9_]+`).
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(is_identifier_byte)
}

fn is_identifier_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

/// A marker occurrence found in a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundMarker {
    /// Byte offset of the first marker byte
    pub offset: usize,
    /// Spelling that matched
    pub style: MarkerStyle,
    /// Exact marker text as it appears in the buffer
    pub text: String,
}

impl FoundMarker {
    /// Byte offset just past the marker.
    pub fn end(&self) -> usize {
        self.offset + self.text.len()
    }
}

/// A located replace region.
///
/// `start.offset < end.offset` always holds, and the span between
/// `start.end()` and `end.offset` is the region body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionSpan {
    pub start: FoundMarker,
    pub end: FoundMarker,
}

impl RegionSpan {
    /// Byte range of the region body (between the two markers).
    pub fn body(&self) -> std::ops::Range<usize> {
        self.start.end()..self.end.offset
    }
}

/// Find the lowest-offset occurrence of any candidate at or after `from`.
fn find_first(
    buffer: &str,
    from: usize,
    candidates: [(MarkerStyle, String); 2],
) -> Option<FoundMarker> {
    let haystack = buffer.get(from..)?;
    let mut best: Option<FoundMarker> = None;

    for (style, text) in candidates {
        if let Some(pos) = haystack.find(&text) {
            let offset = from + pos;
            // Strictly lower wins, so the earlier spelling keeps ties.
            if best.as_ref().map_or(true, |b| offset < b.offset) {
                best = Some(FoundMarker {
                    offset,
                    style,
                    text,
                });
            }
        }
    }

    best
}

/// Locate the replace region `region` of `module_key`.
///
/// The start marker is the lowest-offset occurrence of either spelling. The
/// end marker is searched only after the chosen start marker, again taking
/// the lowest offset. Returns `None` when either marker is absent; callers
/// treat that as a no-op.
pub fn locate(buffer: &str, module_key: &str, region: &str) -> Option<RegionSpan> {
    let start = find_first(buffer, 0, spellings(module_key, MarkerRole::Begin, region))?;
    let end = find_first(
        buffer,
        start.end(),
        spellings(module_key, MarkerRole::End, region),
    )?;
    Some(RegionSpan { start, end })
}

/// Find every insertion point for `marker` of `module_key`, left to right.
///
/// The line-comment spelling only matches when it is not immediately followed
/// by an identifier character, so `//KeyInsert_Menu` does not match inside
/// `//KeyInsert_MenuItems`. The block spelling is self-delimiting.
pub fn find_insertion_points(buffer: &str, module_key: &str, marker: &str) -> Vec<FoundMarker> {
    let line = marker_text(MarkerStyle::Line, module_key, MarkerRole::Insert, marker);
    let block = marker_text(MarkerStyle::Block, module_key, MarkerRole::Insert, marker);

    let mut found = Vec::new();
    let mut cursor = 0;

    while cursor < buffer.len() {
        let next_line = next_line_marker(buffer, cursor, &line);
        let next_block = buffer[cursor..].find(&block).map(|pos| cursor + pos);

        let hit = match (next_line, next_block) {
            (Some(l), Some(b)) if b < l => FoundMarker {
                offset: b,
                style: MarkerStyle::Block,
                text: block.clone(),
            },
            (Some(l), _) => FoundMarker {
                offset: l,
                style: MarkerStyle::Line,
                text: line.clone(),
            },
            (None, Some(b)) => FoundMarker {
                offset: b,
                style: MarkerStyle::Block,
                text: block.clone(),
            },
            (None, None) => break,
        };

        cursor = hit.end();
        found.push(hit);
    }

    found
}

/// Next line-style insertion marker at or after `from` that is not followed
/// by an identifier byte.
fn next_line_marker(buffer: &str, from: usize, marker: &str) -> Option<usize> {
    let mut cursor = from;
    while let Some(pos) = buffer.get(cursor..)?.find(marker) {
        let offset = cursor + pos;
        let after = offset + marker.len();
        match buffer.as_bytes().get(after) {
            Some(&b) if is_identifier_byte(b) => cursor = offset + 1,
            _ => return Some(offset),
        }
    }
    None
}
