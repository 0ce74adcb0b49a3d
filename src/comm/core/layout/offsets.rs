//! 偏移量编译：按 Omron NJ/NX 的对齐规则为展开后的每个基本类型计算偏移。
//!
//! 规则：
//! - 光标先前进上一个成员的宽度，再向上对齐到“下一个成员”的对齐要求
//! - 嵌入结构体的起止边界要求整段结构体内最大的对齐
//! - 直接位于数组内的 BOOL 按位打包，记录位偏移（字节 * 8 + 位）

use super::expand::{Boundary, ExpandedLayout, LayoutToken};
use super::DefinitionError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LeafOffset {
    Byte(usize),
    /// 位偏移：byte * 8 + bit
    Bit(usize),
}

impl LeafOffset {
    pub fn raw(&self) -> usize {
        match self {
            LeafOffset::Byte(value) | LeafOffset::Bit(value) => *value,
        }
    }

    pub fn is_bit(&self) -> bool {
        matches!(self, LeafOffset::Bit(_))
    }
}

/// Offsets indexed by leaf ordinal (order of primitives in the expanded layout).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OffsetTable {
    pub entries: Vec<LeafOffset>,
}

impl OffsetTable {
    pub fn get(&self, leaf: usize) -> Option<LeafOffset> {
        self.entries.get(leaf).copied()
    }

    pub fn raw_values(&self) -> Vec<usize> {
        self.entries.iter().map(LeafOffset::raw).collect()
    }
}

pub fn compile_offsets(structure: &str, layout: &ExpandedLayout) -> Result<OffsetTable, DefinitionError> {
    let tokens = &layout.tokens;
    let analysis = analyse(tokens);

    let mut entries = Vec::with_capacity(tokens.len());
    let mut cursor = 0usize;
    let mut pending_width = 0usize;
    let mut required_align = 0usize;
    let mut bit_index = 0usize;

    for (i, token) in tokens.iter().enumerate() {
        let kind = match token {
            LayoutToken::Enter(_) | LayoutToken::Leave(_) => {
                close_bit_run(&mut bit_index, &mut pending_width);
                continue;
            }
            LayoutToken::Primitive(kind) => kind,
        };

        let packed = analysis.bit_packed[i];
        if !packed {
            close_bit_run(&mut bit_index, &mut pending_width);
        }

        cursor += pending_width;
        if cursor != 0 {
            if required_align == 0 {
                return Err(DefinitionError::AlignmentFailure {
                    structure: structure.to_string(),
                    position: entries.len(),
                });
            }
            cursor = cursor.div_ceil(required_align) * required_align;
        }

        if packed {
            entries.push(LeafOffset::Bit(cursor * 8 + bit_index));
            bit_index += 1;
            if bit_index == 8 {
                bit_index = 0;
                pending_width = 1;
            } else {
                pending_width = 0;
            }
        } else {
            entries.push(LeafOffset::Byte(cursor));
            pending_width = kind.byte_width();
        }

        required_align = next_alignment(tokens, i, &analysis);
    }

    Ok(OffsetTable { entries })
}

/// 部分填充的位字节结束后，下一个成员从下一个字节开始。
fn close_bit_run(bit_index: &mut usize, pending_width: &mut usize) {
    if *bit_index > 0 {
        *bit_index = 0;
        *pending_width = 1;
    }
}

struct Analysis {
    /// Largest primitive alignment inside the region; set on both boundary tokens.
    region_align: Vec<usize>,
    bit_packed: Vec<bool>,
}

fn analyse(tokens: &[LayoutToken]) -> Analysis {
    let mut region_align = vec![0usize; tokens.len()];
    let mut bit_packed = vec![false; tokens.len()];
    // (enter index, boundary is array, max alignment so far)
    let mut open: Vec<(usize, bool, usize)> = Vec::new();

    for (i, token) in tokens.iter().enumerate() {
        match token {
            LayoutToken::Enter(boundary) => {
                open.push((i, matches!(boundary, Boundary::Array), 0));
            }
            LayoutToken::Leave(_) => {
                if let Some((enter, _, max_align)) = open.pop() {
                    region_align[enter] = max_align;
                    region_align[i] = max_align;
                    if let Some(parent) = open.last_mut() {
                        parent.2 = parent.2.max(max_align);
                    }
                }
            }
            LayoutToken::Primitive(kind) => {
                let in_array = open.last().map(|(_, is_array, _)| *is_array).unwrap_or(false);
                let packed = kind.is_bool() && in_array;
                bit_packed[i] = packed;
                if let Some(frame) = open.last_mut() {
                    frame.2 = frame.2.max(kind.alignment(packed));
                }
            }
        }
    }

    Analysis {
        region_align,
        bit_packed,
    }
}

fn next_alignment(tokens: &[LayoutToken], current: usize, analysis: &Analysis) -> usize {
    let mut required = 0usize;
    for (j, token) in tokens.iter().enumerate().skip(current + 1) {
        match token {
            LayoutToken::Primitive(kind) => {
                return required.max(kind.alignment(analysis.bit_packed[j]));
            }
            LayoutToken::Enter(Boundary::Struct(_)) | LayoutToken::Leave(Boundary::Struct(_)) => {
                required = required.max(analysis.region_align[j]);
            }
            LayoutToken::Enter(Boundary::Array) | LayoutToken::Leave(Boundary::Array) => {}
        }
    }
    required
}
