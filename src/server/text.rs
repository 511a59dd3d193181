//! Incremental text application
//!
//! Applies an ordered list of range-based edits to a document. Each edit is
//! applied against the content as mutated by all prior edits, with a freshly
//! recomputed position-to-offset mapping per edit; protocol positions are
//! line plus UTF-16 column, not byte offsets. A single edit carrying no
//! range replaces the whole document.

use crate::error::{EngineError, Result};
use crate::protocol::{ContentChange, Position};

/// Resolve a batch of content changes against `content`.
///
/// A full replacement is accepted even when incremental changes were
/// expected. A nil range in any other configuration, or an inverted range,
/// is malformed input.
pub fn apply_content_changes(content: &str, changes: &[ContentChange]) -> Result<String> {
    if changes.is_empty() {
        return Err(EngineError::invalid_edit("no content changes provided"));
    }

    if changes.len() == 1 && changes[0].range.is_none() {
        return Ok(changes[0].text.clone());
    }

    let mut content = content.to_string();
    for change in changes {
        let range = change
            .range
            .ok_or_else(|| EngineError::invalid_edit("unexpected nil range for change"))?;
        let start = offset_of(&content, range.start)?;
        let end = offset_of(&content, range.end)?;
        if end < start {
            return Err(EngineError::invalid_edit(format!(
                "invalid range: end {:?} before start {:?}",
                range.end, range.start
            )));
        }
        let mut next = String::with_capacity(content.len() + change.text.len());
        next.push_str(&content[..start]);
        next.push_str(&change.text);
        next.push_str(&content[end..]);
        content = next;
    }
    Ok(content)
}

/// Byte offset of a line/UTF-16-column position in `content`.
fn offset_of(content: &str, pos: Position) -> Result<usize> {
    let mut line_start = 0usize;
    if pos.line > 0 {
        let mut line = 0u32;
        let mut found = false;
        for (idx, ch) in content.char_indices() {
            if ch == '\n' {
                line += 1;
                if line == pos.line {
                    line_start = idx + 1;
                    found = true;
                    break;
                }
            }
        }
        if !found {
            return Err(EngineError::invalid_edit(format!(
                "line {} beyond end of document",
                pos.line
            )));
        }
    }

    let mut units = 0u32;
    let mut offset = line_start;
    for ch in content[line_start..].chars() {
        if units >= pos.character || ch == '\n' {
            break;
        }
        units += ch.len_utf16() as u32;
        offset += ch.len_utf8();
    }
    if units < pos.character {
        return Err(EngineError::invalid_edit(format!(
            "column {} beyond end of line {}",
            pos.character, pos.line
        )));
    }
    Ok(offset)
}
