//! drvInfo 描述符解析：`[@poller] tagName dataType sliceCount offset extras`。
//!
//! 解析结果是完全类型化的 `ValueDescriptor`；连接串所需的 extras 在此阶段渲染完毕。
//! 反斜杠 `\` 成对出现时，其间的空格不作为分隔符（反斜杠本身会被去掉）。

use std::collections::HashSet;

use thiserror::Error;

use super::attributes::TagAttributes;
use super::layout::{LeafOffset, LookupError, StructTable};
use super::model::{DataType, INIT_POLLER, MAX_CIP_MESSAGE_DATA_SIZE};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("descriptor error: empty descriptor")]
    Empty,

    #[error("descriptor error: unterminated escape sequence")]
    UnclosedEscape,

    #[error("descriptor error: expected {expected} fields, got {got}")]
    WrongFieldCount { expected: usize, got: usize },

    #[error("descriptor error: poller '{name}' is reserved")]
    ReservedPoller { name: String },

    #[error("descriptor error: poller '{name}' does not exist")]
    UnknownPoller { name: String },

    #[error("descriptor error: tag '{tag}' has an unclosed '['")]
    UnclosedIndex { tag: String },

    #[error("descriptor error: start index '{raw}' of tag '{tag}' must be an integer >= 1")]
    InvalidStartIndex { tag: String, raw: String },

    #[error("descriptor error: unknown data type '{keyword}'")]
    UnknownDataType { keyword: String },

    #[error("descriptor error: invalid slice count '{raw}'")]
    InvalidSliceCount { raw: String },

    #[error("descriptor error: slice count {count} requires an indexed tag name like tag[1]")]
    SliceWithoutIndex { count: usize },

    #[error("descriptor error: {} does not support slices (count {count})", .data_type.keyword())]
    SliceNotSupported { data_type: DataType, count: usize },

    #[error("descriptor error: slice of {count} {} exceeds one CIP message (at most {max})", .data_type.keyword())]
    SliceTooLarge { data_type: DataType, count: usize, max: usize },

    #[error("descriptor error: invalid offset '{raw}': {reason}")]
    InvalidOffset { raw: String, reason: String },

    #[error("descriptor error: {0}")]
    Offset(#[from] LookupError),

    #[error("descriptor error: invalid extra '{segment}': {reason}")]
    InvalidExtra { segment: String, reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OffsetSource {
    /// `none`：读取位置从 0 开始
    Unspecified,
    Literal(usize),
    /// `structName[i][j]...`，1-based 成员路径
    StructRef { name: String, indices: Vec<usize> },
}

/// Parsed, fully typed process-value descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValueDescriptor {
    pub poller: Option<String>,
    pub tag_name: String,
    pub start_index: Option<usize>,
    pub data_type: DataType,
    pub slice_count: usize,
    pub offset_source: OffsetSource,
    pub offset: usize,
    /// `offset` 是位偏移（结构体数组内的 BOOL）。
    pub bit_addressed: bool,
    pub attributes: TagAttributes,
    /// 已渲染的 extras，直接拼到连接串末尾。
    pub extras: String,
}

impl ValueDescriptor {
    pub fn poller_name(&self) -> &str {
        self.poller.as_deref().unwrap_or(INIT_POLLER)
    }

    pub fn elem_count(&self) -> usize {
        if self.attributes.optimise {
            1
        } else {
            self.slice_count
        }
    }

    /// 父路径：`optimise=1` 时为自身 tag 名；否则为最后一个不在方括号内的 `.` 之前的部分。
    pub fn parent_path(&self) -> Option<String> {
        if self.attributes.optimise {
            return Some(self.tag_name.clone());
        }
        dotted_parent(&self.tag_name).map(str::to_string)
    }

    /// 带点号的成员路径：偏移描述的是字段在父结构体中的位置。
    pub fn locates_field_in_parent(&self) -> bool {
        !self.attributes.optimise && dotted_parent(&self.tag_name).is_some()
    }

    pub fn connection_string(&self, prefix: &str) -> String {
        format!(
            "{prefix}&name={}&elem_count={}{}",
            self.tag_name,
            self.elem_count(),
            self.extras
        )
    }
}

pub struct ParseContext<'a> {
    pub pollers: &'a HashSet<String>,
    pub structs: &'a StructTable,
}

pub fn parse_descriptor(text: &str, ctx: &ParseContext<'_>) -> Result<ValueDescriptor, DescriptorError> {
    let mut words = split_words(text)?;
    if words.is_empty() {
        return Err(DescriptorError::Empty);
    }

    let poller = match words[0].strip_prefix('@') {
        Some(name) => {
            let name = name.to_string();
            words.remove(0);
            if name == INIT_POLLER {
                return Err(DescriptorError::ReservedPoller { name });
            }
            if !ctx.pollers.contains(&name) {
                return Err(DescriptorError::UnknownPoller { name });
            }
            Some(name)
        }
        None => None,
    };

    if words.len() != 5 {
        return Err(DescriptorError::WrongFieldCount {
            expected: 5,
            got: words.len(),
        });
    }

    let tag_name = words[0].clone();
    let start_index = parse_start_index(&tag_name)?;
    let data_type = DataType::from_keyword(&words[1]).ok_or_else(|| DescriptorError::UnknownDataType {
        keyword: words[1].clone(),
    })?;
    let slice_count = parse_slice_count(&words[2], start_index.is_some(), data_type)?;
    let offset_source = parse_offset_source(&words[3])?;
    let leaf = match &offset_source {
        OffsetSource::Unspecified => LeafOffset::Byte(0),
        OffsetSource::Literal(offset) => LeafOffset::Byte(*offset),
        OffsetSource::StructRef { name, indices } => ctx.structs.resolve_offset(name, indices)?,
    };
    let attributes = TagAttributes::parse(&words[4], data_type)?;
    let extras = attributes.render(data_type);

    Ok(ValueDescriptor {
        poller,
        tag_name,
        start_index,
        data_type,
        slice_count,
        offset_source,
        offset: leaf.raw(),
        bit_addressed: leaf.is_bit(),
        attributes,
        extras,
    })
}

fn dotted_parent(tag_name: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut split = None;
    for (i, ch) in tag_name.char_indices() {
        match ch {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            '.' if depth == 0 => split = Some(i),
            _ => {}
        }
    }
    split.map(|i| &tag_name[..i]).filter(|parent| !parent.is_empty())
}

fn split_words(text: &str) -> Result<Vec<String>, DescriptorError> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut escaped = false;

    for ch in text.chars() {
        match ch {
            '\\' => escaped = !escaped,
            ' ' | '\t' if !escaped => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(ch),
        }
    }

    if escaped {
        return Err(DescriptorError::UnclosedEscape);
    }
    if !current.is_empty() {
        words.push(current);
    }
    Ok(words)
}

/// 第一对 `[...]` 给出起始下标；没有 `[` 则该 tag 不可切片。
fn parse_start_index(tag: &str) -> Result<Option<usize>, DescriptorError> {
    let Some(open) = tag.find('[') else {
        return Ok(None);
    };
    let rest = &tag[open + 1..];
    let close = rest.find(']').ok_or_else(|| DescriptorError::UnclosedIndex {
        tag: tag.to_string(),
    })?;
    let raw = &rest[..close];

    match raw.trim().parse::<i64>() {
        Ok(index) if index >= 1 => Ok(Some(index as usize)),
        _ => Err(DescriptorError::InvalidStartIndex {
            tag: tag.to_string(),
            raw: raw.to_string(),
        }),
    }
}

fn parse_slice_count(raw: &str, indexable: bool, data_type: DataType) -> Result<usize, DescriptorError> {
    if raw == "none" {
        return Ok(1);
    }

    let count = raw
        .parse::<i64>()
        .ok()
        .filter(|count| *count >= 0)
        .ok_or_else(|| DescriptorError::InvalidSliceCount { raw: raw.to_string() })?
        as usize;
    if count <= 1 {
        return Ok(1);
    }
    if !indexable {
        return Err(DescriptorError::SliceWithoutIndex { count });
    }
    if !data_type.supports_slices() {
        return Err(DescriptorError::SliceNotSupported { data_type, count });
    }
    let max = MAX_CIP_MESSAGE_DATA_SIZE / data_type.element_width().unwrap_or(1);
    if count > max {
        return Err(DescriptorError::SliceTooLarge { data_type, count, max });
    }
    Ok(count)
}

pub fn parse_offset_source(raw: &str) -> Result<OffsetSource, DescriptorError> {
    let invalid = |reason: &str| DescriptorError::InvalidOffset {
        raw: raw.to_string(),
        reason: reason.to_string(),
    };

    if raw == "none" {
        return Ok(OffsetSource::Unspecified);
    }

    if raw.starts_with(|c: char| c.is_ascii_digit() || c == '-' || c == '+') {
        return raw
            .parse::<u32>()
            .map(|offset| OffsetSource::Literal(offset as usize))
            .map_err(|_| invalid("expected a non-negative 32-bit integer"));
    }

    let open = raw
        .find('[')
        .ok_or_else(|| invalid("structure offsets need at least one index, e.g. name[1]"))?;
    let name = &raw[..open];
    if name.is_empty() || name.contains(']') {
        return Err(invalid("missing structure name"));
    }

    let mut indices = Vec::new();
    let mut rest = &raw[open..];
    while !rest.is_empty() {
        let inner = rest
            .strip_prefix('[')
            .and_then(|after| after.split_once(']'))
            .ok_or_else(|| invalid("indices must look like [n][m]..."))?;
        let index = inner
            .0
            .parse::<usize>()
            .map_err(|_| invalid("indices must be integers"))?;
        indices.push(index);
        rest = inner.1;
    }

    Ok(OffsetSource::StructRef {
        name: name.to_string(),
        indices,
    })
}

#[cfg(test)]
mod tests {
    use super::super::layout::StructDefinitions;
    use super::*;

    fn structs() -> StructTable {
        let mut defs = StructDefinitions::new();
        defs.insert("Point", vec!["DINT".to_string(), "DINT".to_string()]);
        defs.insert("Line", vec!["Point".to_string(), "Point".to_string()]);
        defs.insert("Flags", vec!["INT".to_string(), "ARRAY[0..7] OF BOOL".to_string()]);
        defs.insert("Broken", vec!["STRING".to_string()]);
        StructTable::compile(&defs)
    }

    fn pollers() -> HashSet<String> {
        ["testPoller".to_string()].into_iter().collect()
    }

    fn parse(text: &str) -> Result<ValueDescriptor, DescriptorError> {
        let pollers = pollers();
        let structs = structs();
        parse_descriptor(
            text,
            &ParseContext {
                pollers: &pollers,
                structs: &structs,
            },
        )
    }

    #[test]
    fn parses_a_full_descriptor() {
        let d = parse("@testPoller testString STRING none none &str_max_capacity=100&optimise=1").unwrap();
        assert_eq!(d.poller.as_deref(), Some("testPoller"));
        assert_eq!(d.tag_name, "testString");
        assert_eq!(d.data_type, DataType::String);
        assert_eq!(d.slice_count, 1);
        assert_eq!(d.offset, 0);
        assert!(d.attributes.optimise);
        assert!(d.extras.contains("str_max_capacity=100"));
        assert!(!d.extras.contains("optimise"));
    }

    #[test]
    fn values_without_poller_use_the_init_poller() {
        let d = parse("myReal REAL none none none").unwrap();
        assert_eq!(d.poller, None);
        assert_eq!(d.poller_name(), INIT_POLLER);
        assert_eq!(
            d.connection_string("protocol=ab-eip&gateway=10.0.0.1&path=1,0&plc=omron-njnx"),
            "protocol=ab-eip&gateway=10.0.0.1&path=1,0&plc=omron-njnx&name=myReal&elem_count=1&allow_packing=1"
        );
    }

    #[test]
    fn slices_need_an_indexed_name() {
        assert!(matches!(
            parse("@testPoller lwordArray LWORD 10 none none"),
            Err(DescriptorError::SliceWithoutIndex { count: 10 })
        ));
        let d = parse("@testPoller lwordArray[1] LWORD 10 none none").unwrap();
        assert_eq!(d.slice_count, 10);
        assert_eq!(d.start_index, Some(1));
        assert!(d.connection_string("p").contains("&elem_count=10"));
    }

    #[test]
    fn slices_are_refused_for_strings_and_lint() {
        assert!(matches!(
            parse("arr[1] LINT 4 none none"),
            Err(DescriptorError::SliceNotSupported { .. })
        ));
        assert!(matches!(
            parse("arr[1] STRING 2 none none"),
            Err(DescriptorError::SliceNotSupported { .. })
        ));
        assert_eq!(parse("arr[1] LINT 1 none none").unwrap().slice_count, 1);
        assert_eq!(parse("arr[1] DINT 0 none none").unwrap().slice_count, 1);
        assert!(parse("arr[1] DINT -3 none none").is_err());
        assert!(parse("arr[1] DINT 2.5 none none").is_err());
    }

    #[test]
    fn slices_must_fit_one_cip_message() {
        assert_eq!(parse("arr[1] REAL 498 none none").unwrap().slice_count, 498);
        assert!(matches!(
            parse("arr[1] REAL 499 none none"),
            Err(DescriptorError::SliceTooLarge { count: 499, max: 498, .. })
        ));
        assert!(matches!(
            parse("arr[1] DINT 18446744073709551615 none none"),
            Err(DescriptorError::InvalidSliceCount { .. })
        ));
        assert!(matches!(
            parse("arr[1] UDT 5000 none none"),
            Err(DescriptorError::SliceTooLarge { max: 1994, .. })
        ));
        assert!(matches!(
            parse("arr[1] LREAL 250 none none"),
            Err(DescriptorError::SliceTooLarge { max: 249, .. })
        ));
    }

    #[test]
    fn optimised_values_request_a_single_element() {
        let d = parse("arr[1] DINT 4 none &optimise=1").unwrap();
        assert_eq!(d.slice_count, 4);
        assert!(d.connection_string("p").contains("&elem_count=1"));
    }

    #[test]
    fn start_index_must_be_a_positive_integer() {
        for text in [
            "lwordArray[-2] LWORD none none none",
            "[x] LWORD none none none",
            "lwordArray[4 LWORD none none none",
            "lwordArray[0] LWORD none none none",
            "lwordArray[1.5] LWORD none none none",
        ] {
            assert!(parse(text).is_err(), "{text}");
        }
        assert_eq!(parse("lwordArray4] LWORD none none none").unwrap().start_index, None);
    }

    #[test]
    fn rejects_wrong_field_counts_and_types() {
        assert_eq!(parse(""), Err(DescriptorError::Empty));
        assert!(matches!(
            parse("tag REAL none none"),
            Err(DescriptorError::WrongFieldCount { expected: 5, got: 4 })
        ));
        assert!(matches!(
            parse("tag real none none none"),
            Err(DescriptorError::UnknownDataType { .. })
        ));
        assert!(matches!(
            parse("tag REAL none none none extra"),
            Err(DescriptorError::WrongFieldCount { got: 6, .. })
        ));
    }

    #[test]
    fn poller_must_exist_and_not_be_reserved() {
        assert!(matches!(
            parse("@nope tag REAL none none none"),
            Err(DescriptorError::UnknownPoller { .. })
        ));
        assert!(matches!(
            parse("@driverInitPoller tag REAL none none none"),
            Err(DescriptorError::ReservedPoller { .. })
        ));
    }

    #[test]
    fn escaped_spaces_stay_in_the_tag_name() {
        let d = parse(r"\my tag\ REAL none none none").unwrap();
        assert_eq!(d.tag_name, "my tag");
        assert_eq!(parse(r"\my tag REAL none none none"), Err(DescriptorError::UnclosedEscape));
    }

    #[test]
    fn literal_offsets_are_bounded() {
        assert_eq!(parse("t UDT none 12 none").unwrap().offset_source, OffsetSource::Literal(12));
        assert_eq!(parse("t UDT none none none").unwrap().offset_source, OffsetSource::Unspecified);
        assert_eq!(parse("t UDT none 0 none").unwrap().offset_source, OffsetSource::Literal(0));
        assert_eq!(parse("t UDT none none none").unwrap().offset, 0);
        for raw in ["-54", "2345321424325235", "sPSU[14[5]", "Line", "Line[a]", "[1]"] {
            assert!(
                matches!(
                    parse(&format!("t UDT none {raw} none")),
                    Err(DescriptorError::InvalidOffset { .. })
                ),
                "{raw}"
            );
        }
    }

    #[test]
    fn struct_offsets_resolve_through_the_table() {
        let d = parse("line.end.y DINT none Line[2][2] none").unwrap();
        assert_eq!(d.offset, 12);
        assert!(!d.bit_addressed);

        let d = parse("flags BOOL none Flags[2][3] none").unwrap();
        assert!(d.bit_addressed);
        assert_eq!(d.offset, 2 * 8 + 2);

        assert!(matches!(
            parse("t DINT none Line[3] none"),
            Err(DescriptorError::Offset(LookupError::InvalidIndex { .. }))
        ));
        assert!(matches!(
            parse("t DINT none Ghost[1] none"),
            Err(DescriptorError::Offset(LookupError::UnknownStructure { .. }))
        ));
        assert!(matches!(
            parse("t DINT none Broken[1] none"),
            Err(DescriptorError::Offset(LookupError::InvalidStructure { .. }))
        ));
    }
}
