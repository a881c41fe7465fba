//! Text operation model shared by the document and presence channels.
//!
//! These are the value types exchanged with the remote session service:
//! - `TextOperation`: replace a character range of a document with new text
//! - `SelectionState`: a participant's caret/selection in a document
//!
//! Offsets are character offsets (not bytes) into the document text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when constructing or applying protocol values
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid range: end {end} is before start {start}")]
    InvalidRange { start: usize, end: usize },

    #[error("Range {start}..{end} is outside a document of {len} characters")]
    OutOfBounds { start: usize, end: usize, len: usize },
}

/// Replace the characters in `[range_start, range_end)` with `text`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextOperation {
    range_start: usize,
    range_end: usize,
    text: String,
}

impl TextOperation {
    /// Create a validated text operation
    pub fn new(range_start: usize, range_end: usize, text: impl Into<String>) -> Result<Self, ProtocolError> {
        if range_end < range_start {
            return Err(ProtocolError::InvalidRange {
                start: range_start,
                end: range_end,
            });
        }

        Ok(Self {
            range_start,
            range_end,
            text: text.into(),
        })
    }

    /// Build the operation for an editor change event: `old_len` characters at
    /// `offset` were replaced by `new_text`
    pub fn from_change(offset: usize, old_len: usize, new_text: impl Into<String>) -> Self {
        Self {
            range_start: offset,
            range_end: offset + old_len,
            text: new_text.into(),
        }
    }

    /// First replaced character
    pub fn range_start(&self) -> usize {
        self.range_start
    }

    /// End of the replaced range (exclusive)
    pub fn range_end(&self) -> usize {
        self.range_end
    }

    /// Replacement text
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Pure insertion (empty replaced range)
    pub fn is_insert(&self) -> bool {
        self.range_start == self.range_end && !self.text.is_empty()
    }

    /// Pure deletion (no replacement text)
    pub fn is_delete(&self) -> bool {
        self.range_start < self.range_end && self.text.is_empty()
    }

    /// Apply this operation to `target` in place.
    ///
    /// Either the whole replacement happens or `target` is left untouched.
    pub fn apply_to(&self, target: &mut String) -> Result<(), ProtocolError> {
        let len = target.chars().count();
        if self.range_end > len {
            return Err(ProtocolError::OutOfBounds {
                start: self.range_start,
                end: self.range_end,
                len,
            });
        }

        let start = byte_offset(target, self.range_start);
        let end = byte_offset(target, self.range_end);
        target.replace_range(start..end, &self.text);
        Ok(())
    }
}

/// Convert a character offset into a byte offset (clamped to the string end)
fn byte_offset(text: &str, char_offset: usize) -> usize {
    text.char_indices()
        .nth(char_offset)
        .map(|(i, _)| i)
        .unwrap_or(text.len())
}

/// Caret/selection of one participant in a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionState {
    /// Empty for the local participant broadcasting its own state
    participant_id: String,
    range_start: usize,
    range_end: usize,
    /// The anchor sits at `range_end` and the caret at `range_start`
    is_reversed: bool,
}

impl SelectionState {
    pub fn new(
        participant_id: impl Into<String>,
        range_start: usize,
        range_end: usize,
        is_reversed: bool,
    ) -> Result<Self, ProtocolError> {
        if range_end < range_start {
            return Err(ProtocolError::InvalidRange {
                start: range_start,
                end: range_end,
            });
        }

        Ok(Self {
            participant_id: participant_id.into(),
            range_start,
            range_end,
            is_reversed,
        })
    }

    /// Selection of the local participant from an anchor and caret (head) offset
    pub fn from_anchor(anchor: usize, head: usize) -> Self {
        Self {
            participant_id: String::new(),
            range_start: anchor.min(head),
            range_end: anchor.max(head),
            is_reversed: head < anchor,
        }
    }

    /// Owner of the selection, empty for the local participant
    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    /// Whether this state describes the local actor
    pub fn is_local(&self) -> bool {
        self.participant_id.is_empty()
    }

    pub fn range_start(&self) -> usize {
        self.range_start
    }

    pub fn range_end(&self) -> usize {
        self.range_end
    }

    /// Whether the anchor sits at `range_end`
    pub fn is_reversed(&self) -> bool {
        self.is_reversed
    }

    /// A caret without a selected range
    pub fn is_collapsed(&self) -> bool {
        self.range_start == self.range_end
    }

    /// Offset of the caret itself
    pub fn head(&self) -> usize {
        if self.is_reversed {
            self.range_start
        } else {
            self.range_end
        }
    }

    /// Same selection attributed to another participant
    pub fn with_participant(mut self, participant_id: impl Into<String>) -> Self {
        self.participant_id = participant_id.into();
        self
    }
}
