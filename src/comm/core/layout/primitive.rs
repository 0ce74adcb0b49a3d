//! PLC 基本类型表：字节宽度与对齐要求。

use std::fmt;

/// Closed set of leaf types a structure member can resolve to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    Bool,
    Sint,
    Usint,
    Int,
    Uint,
    Dint,
    Udint,
    Lint,
    Ulint,
    Real,
    Lreal,
    Word,
    Dword,
    Lword,
    Time,
    /// `STRING[n]`，n 为字节容量
    FixedString(usize),
}

impl PrimitiveKind {
    /// Fixed keywords only; `STRING[n]` is handled by the member parser.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        let kind = match keyword {
            "BOOL" => PrimitiveKind::Bool,
            "SINT" => PrimitiveKind::Sint,
            "USINT" => PrimitiveKind::Usint,
            "INT" => PrimitiveKind::Int,
            "UINT" => PrimitiveKind::Uint,
            "DINT" => PrimitiveKind::Dint,
            "UDINT" => PrimitiveKind::Udint,
            "LINT" => PrimitiveKind::Lint,
            "ULINT" => PrimitiveKind::Ulint,
            "REAL" => PrimitiveKind::Real,
            "LREAL" => PrimitiveKind::Lreal,
            "WORD" => PrimitiveKind::Word,
            "DWORD" => PrimitiveKind::Dword,
            "LWORD" => PrimitiveKind::Lword,
            "TIME" | "DATE_AND_TIME" => PrimitiveKind::Time,
            _ => return None,
        };
        Some(kind)
    }

    /// Bytes occupied by one standalone element.
    pub fn byte_width(&self) -> usize {
        match self {
            PrimitiveKind::Bool => 2,
            PrimitiveKind::Sint | PrimitiveKind::Usint => 1,
            PrimitiveKind::Int | PrimitiveKind::Uint | PrimitiveKind::Word => 2,
            PrimitiveKind::Dint | PrimitiveKind::Udint | PrimitiveKind::Real | PrimitiveKind::Dword => 4,
            PrimitiveKind::Lint
            | PrimitiveKind::Ulint
            | PrimitiveKind::Lreal
            | PrimitiveKind::Lword
            | PrimitiveKind::Time => 8,
            PrimitiveKind::FixedString(capacity) => *capacity,
        }
    }

    /// `bit_packed` 为 true 表示该 BOOL 直接位于数组内（按位打包）。
    pub fn alignment(&self, bit_packed: bool) -> usize {
        match self {
            PrimitiveKind::Bool if bit_packed => 1,
            PrimitiveKind::Sint | PrimitiveKind::Usint | PrimitiveKind::FixedString(_) => 1,
            other => other.byte_width(),
        }
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, PrimitiveKind::Bool)
    }
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keyword = match self {
            PrimitiveKind::Bool => "BOOL",
            PrimitiveKind::Sint => "SINT",
            PrimitiveKind::Usint => "USINT",
            PrimitiveKind::Int => "INT",
            PrimitiveKind::Uint => "UINT",
            PrimitiveKind::Dint => "DINT",
            PrimitiveKind::Udint => "UDINT",
            PrimitiveKind::Lint => "LINT",
            PrimitiveKind::Ulint => "ULINT",
            PrimitiveKind::Real => "REAL",
            PrimitiveKind::Lreal => "LREAL",
            PrimitiveKind::Word => "WORD",
            PrimitiveKind::Dword => "DWORD",
            PrimitiveKind::Lword => "LWORD",
            PrimitiveKind::Time => "TIME",
            PrimitiveKind::FixedString(capacity) => return write!(f, "STRING[{capacity}]"),
        };
        f.write_str(keyword)
    }
}
