//! 结构体展开：把定义递归展开成带边界标记的基本类型序列。

use std::fmt;

use super::definitions::{MemberDescriptor, StructDefinitions};
use super::primitive::PrimitiveKind;
use super::DefinitionError;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Boundary {
    Array,
    Struct(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LayoutToken {
    Primitive(PrimitiveKind),
    Enter(Boundary),
    Leave(Boundary),
}

/// Flattened structure: primitives in declaration order, with array and
/// embedded-structure regions marked by balanced `Enter`/`Leave` tokens.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExpandedLayout {
    pub tokens: Vec<LayoutToken>,
}

impl ExpandedLayout {
    pub fn primitive_count(&self) -> usize {
        self.primitives().count()
    }

    pub fn primitives(&self) -> impl Iterator<Item = &PrimitiveKind> {
        self.tokens.iter().filter_map(|token| match token {
            LayoutToken::Primitive(kind) => Some(kind),
            _ => None,
        })
    }
}

impl fmt::Display for ExpandedLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, token) in self.tokens.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match token {
                LayoutToken::Primitive(kind) => write!(f, "{kind}")?,
                LayoutToken::Enter(Boundary::Array) => f.write_str("array_start")?,
                LayoutToken::Leave(Boundary::Array) => f.write_str("array_end")?,
                LayoutToken::Enter(Boundary::Struct(name)) => write!(f, "{name}_start")?,
                LayoutToken::Leave(Boundary::Struct(name)) => write!(f, "{name}_end")?,
            }
        }
        Ok(())
    }
}

pub fn expand(definitions: &StructDefinitions, name: &str) -> Result<ExpandedLayout, DefinitionError> {
    let mut tokens = Vec::new();
    let mut chain = Vec::new();
    expand_struct(definitions, name, &mut chain, &mut tokens)?;
    Ok(ExpandedLayout { tokens })
}

fn expand_struct(
    definitions: &StructDefinitions,
    name: &str,
    chain: &mut Vec<String>,
    out: &mut Vec<LayoutToken>,
) -> Result<(), DefinitionError> {
    if chain.iter().any(|seen| seen == name) {
        let mut path = chain.clone();
        path.push(name.to_string());
        return Err(DefinitionError::CyclicDefinition {
            name: name.to_string(),
            chain: path.join(" -> "),
        });
    }

    let members = definitions
        .get(name)
        .ok_or_else(|| DefinitionError::UnknownStructure {
            name: name.to_string(),
        })?;

    chain.push(name.to_string());
    for text in members {
        let member = MemberDescriptor::parse(name, text)?;
        expand_member(definitions, &member, chain, out)?;
    }
    chain.pop();
    Ok(())
}

fn expand_member(
    definitions: &StructDefinitions,
    member: &MemberDescriptor,
    chain: &mut Vec<String>,
    out: &mut Vec<LayoutToken>,
) -> Result<(), DefinitionError> {
    match member {
        MemberDescriptor::Primitive(kind) => out.push(LayoutToken::Primitive(kind.clone())),
        MemberDescriptor::StructRef(child) => {
            out.push(LayoutToken::Enter(Boundary::Struct(child.clone())));
            expand_struct(definitions, child, chain, out)?;
            out.push(LayoutToken::Leave(Boundary::Struct(child.clone())));
        }
        MemberDescriptor::ArrayOf { element, .. } => {
            // 元素只展开一次，再按元素个数复制
            let mut single = Vec::new();
            expand_member(definitions, element, chain, &mut single)?;
            out.push(LayoutToken::Enter(Boundary::Array));
            for _ in 0..member.element_count() {
                out.extend(single.iter().cloned());
            }
            out.push(LayoutToken::Leave(Boundary::Array));
        }
    }
    Ok(())
}
