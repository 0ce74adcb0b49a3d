//! 按 1-based 成员索引路径在展开布局中定位偏移。
//!
//! `Line[2][1]` → Line 的第 2 个成员（Point），再取其第 1 个成员。
//! 路径停在聚合（结构体/数组）上时，取其第一个基本类型。

use std::ops::Range;

use thiserror::Error;

use super::expand::{ExpandedLayout, LayoutToken};
use super::offsets::{LeafOffset, OffsetTable};
use super::DefinitionError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("structure '{name}' is not defined")]
    UnknownStructure { name: String },

    #[error("structure '{name}' failed to compile: {source}")]
    InvalidStructure {
        name: String,
        #[source]
        source: DefinitionError,
    },

    #[error("index path {indices:?} is not valid for structure '{name}'")]
    InvalidIndex { name: String, indices: Vec<usize> },
}

pub fn resolve_offset(
    name: &str,
    layout: &ExpandedLayout,
    offsets: &OffsetTable,
    indices: &[usize],
) -> Result<LeafOffset, LookupError> {
    let invalid = || LookupError::InvalidIndex {
        name: name.to_string(),
        indices: indices.to_vec(),
    };

    if indices.is_empty() {
        return Err(invalid());
    }

    let tokens = &layout.tokens;
    let mut span = 0..tokens.len();
    let mut leaf_position = None;

    for (level, &index) in indices.iter().enumerate() {
        if index == 0 {
            return Err(invalid());
        }
        let member = nth_member(tokens, span.clone(), index - 1).ok_or_else(invalid)?;
        let is_last = level + 1 == indices.len();

        match &tokens[member.start] {
            LayoutToken::Primitive(_) if is_last => leaf_position = Some(member.start),
            LayoutToken::Primitive(_) => return Err(invalid()),
            LayoutToken::Enter(_) if is_last => {
                leaf_position = tokens[member.clone()]
                    .iter()
                    .position(|token| matches!(token, LayoutToken::Primitive(_)))
                    .map(|relative| member.start + relative);
            }
            LayoutToken::Enter(_) => span = member.start + 1..member.end - 1,
            LayoutToken::Leave(_) => return Err(invalid()),
        }
    }

    let position = leaf_position.ok_or_else(invalid)?;
    let ordinal = tokens[..position]
        .iter()
        .filter(|token| matches!(token, LayoutToken::Primitive(_)))
        .count();
    offsets.get(ordinal).ok_or_else(invalid)
}

/// Token range of the n-th (0-based) member inside `span`: a single primitive
/// or a balanced Enter..=Leave region.
fn nth_member(tokens: &[LayoutToken], span: Range<usize>, n: usize) -> Option<Range<usize>> {
    let mut cursor = span.start;
    let mut count = 0usize;
    while cursor < span.end {
        let end = match &tokens[cursor] {
            LayoutToken::Primitive(_) => cursor + 1,
            LayoutToken::Enter(_) => matching_leave(tokens, cursor)? + 1,
            LayoutToken::Leave(_) => return None,
        };
        if count == n {
            return Some(cursor..end);
        }
        count += 1;
        cursor = end;
    }
    None
}

fn matching_leave(tokens: &[LayoutToken], enter: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate().skip(enter) {
        match token {
            LayoutToken::Enter(_) => depth += 1,
            LayoutToken::Leave(_) => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            LayoutToken::Primitive(_) => {}
        }
    }
    None
}
