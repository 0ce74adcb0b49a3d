//! 结构体定义：名称 → 成员类型描述（按声明顺序）。

use std::collections::HashMap;

use super::primitive::PrimitiveKind;
use super::DefinitionError;

/// One parsed member entry of a structure definition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemberDescriptor {
    Primitive(PrimitiveKind),
    /// `ARRAY[low..high] OF T`，上下界均包含
    ArrayOf {
        low: usize,
        high: usize,
        element: Box<MemberDescriptor>,
    },
    StructRef(String),
}

impl MemberDescriptor {
    pub fn parse(structure: &str, text: &str) -> Result<Self, DefinitionError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(DefinitionError::EmptyMember {
                structure: structure.to_string(),
            });
        }

        if let Some(rest) = text.strip_prefix("ARRAY[") {
            return parse_array(structure, text, rest);
        }

        parse_scalar(structure, text)
    }

    pub fn element_count(&self) -> usize {
        match self {
            MemberDescriptor::ArrayOf { low, high, .. } => high - low + 1,
            _ => 1,
        }
    }
}

fn parse_scalar(structure: &str, text: &str) -> Result<MemberDescriptor, DefinitionError> {
    if let Some(kind) = PrimitiveKind::from_keyword(text) {
        return Ok(MemberDescriptor::Primitive(kind));
    }

    if text.starts_with("STRING") {
        let capacity = text
            .strip_prefix("STRING[")
            .and_then(|rest| rest.strip_suffix(']'))
            .and_then(|digits| digits.trim().parse::<usize>().ok())
            .filter(|capacity| *capacity >= 1)
            .ok_or_else(|| DefinitionError::MalformedString {
                structure: structure.to_string(),
                member: text.to_string(),
            })?;
        return Ok(MemberDescriptor::Primitive(PrimitiveKind::FixedString(capacity)));
    }

    Ok(MemberDescriptor::StructRef(text.to_string()))
}

fn parse_array(structure: &str, text: &str, rest: &str) -> Result<MemberDescriptor, DefinitionError> {
    let malformed = |reason: &str| DefinitionError::MalformedArray {
        structure: structure.to_string(),
        member: text.to_string(),
        reason: reason.to_string(),
    };

    let close = rest.find(']').ok_or_else(|| malformed("missing ']'"))?;
    let (bounds, tail) = (&rest[..close], &rest[close + 1..]);
    let (low, high) = bounds
        .split_once("..")
        .ok_or_else(|| malformed("bounds must look like low..high"))?;
    let low: usize = low
        .trim()
        .parse()
        .map_err(|_| malformed("lower bound is not a non-negative integer"))?;
    let high: usize = high
        .trim()
        .parse()
        .map_err(|_| malformed("upper bound is not a non-negative integer"))?;
    if high < low {
        return Err(malformed("upper bound is below lower bound"));
    }

    let element = tail
        .trim_start()
        .strip_prefix("OF")
        .filter(|after| after.starts_with(char::is_whitespace))
        .map(str::trim)
        .filter(|element| !element.is_empty())
        .ok_or_else(|| malformed("expected 'OF <type>' after bounds"))?;
    if element.starts_with("ARRAY") {
        return Err(malformed("nested ARRAY element types are not supported"));
    }

    Ok(MemberDescriptor::ArrayOf {
        low,
        high,
        element: Box::new(parse_scalar(structure, element)?),
    })
}

/// Raw structure definitions keyed by name; declaration order is kept for reporting.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StructDefinitions {
    order: Vec<String>,
    members: HashMap<String, Vec<String>>,
}

impl StructDefinitions {
    pub fn new() -> Self {
        Self::default()
    }

    /// 返回 true 表示覆盖了同名的旧定义。
    pub fn insert(&mut self, name: impl Into<String>, members: Vec<String>) -> bool {
        let name = name.into();
        let replaced = self.members.insert(name.clone(), members).is_some();
        if !replaced {
            self.order.push(name);
        }
        replaced
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.members.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_arrays_strings_and_struct_refs() {
        assert_eq!(
            MemberDescriptor::parse("S", "ARRAY[0..3] OF INT").unwrap(),
            MemberDescriptor::ArrayOf {
                low: 0,
                high: 3,
                element: Box::new(MemberDescriptor::Primitive(PrimitiveKind::Int)),
            }
        );
        assert_eq!(
            MemberDescriptor::parse("S", "STRING[16]").unwrap(),
            MemberDescriptor::Primitive(PrimitiveKind::FixedString(16))
        );
        assert_eq!(
            MemberDescriptor::parse("S", "Point").unwrap(),
            MemberDescriptor::StructRef("Point".to_string())
        );
        assert_eq!(
            MemberDescriptor::parse("S", "ARRAY[2..4] OF Point")
                .unwrap()
                .element_count(),
            3
        );
    }

    #[test]
    fn rejects_malformed_arrays() {
        for text in [
            "ARRAY[0..3 OF INT",
            "ARRAY[3..1] OF INT",
            "ARRAY[-1..3] OF INT",
            "ARRAY[0..3] INT",
            "ARRAY[0..3] OF",
            "ARRAY[0-3] OF INT",
            "ARRAY[0..1] OF ARRAY[0..1] OF INT",
        ] {
            assert!(
                matches!(
                    MemberDescriptor::parse("S", text),
                    Err(DefinitionError::MalformedArray { .. })
                ),
                "{text} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_strings_without_capacity() {
        for text in ["STRING", "STRING[]", "STRING[0]", "STRING[x]"] {
            assert!(matches!(
                MemberDescriptor::parse("S", text),
                Err(DefinitionError::MalformedString { .. })
            ));
        }
    }

    #[test]
    fn insert_reports_replacement_and_keeps_order() {
        let mut defs = StructDefinitions::new();
        assert!(!defs.insert("B", vec!["INT".to_string()]));
        assert!(!defs.insert("A", vec!["INT".to_string()]));
        assert!(defs.insert("B", vec!["DINT".to_string()]));
        assert_eq!(defs.names().collect::<Vec<_>>(), vec!["B", "A"]);
        assert_eq!(defs.get("B").unwrap(), ["DINT".to_string()].as_slice());
    }
}
