//! drvInfo 第 5 段（extras）：libplctag 传输参数与驱动自用参数。
//!
//! 解析阶段即完成默认值填充与驱动参数剥离，渲染结果直接拼接到连接串末尾：
//! - 未识别的键与 `str_max_capacity` 原样透传（保持出现顺序），位于默认值之前
//! - `offset_read_size` / `read_as_string` / `optimise` 仅驱动使用，永不下发
//! - 字符串相关参数只对 STRING/UDT 渲染

use log::warn;

use super::descriptor::DescriptorError;
use super::model::DataType;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StringConventions {
    pub zero_terminated: bool,
    pub fixed_length: bool,
    pub counted: bool,
    pub count_word_bytes: u32,
    pub pad_to_multiple_bytes: u32,
}

impl StringConventions {
    /// 独立 STRING tag：带 2 字节长度前缀。
    pub fn counted() -> Self {
        Self {
            zero_terminated: false,
            fixed_length: false,
            counted: true,
            count_word_bytes: 2,
            pad_to_multiple_bytes: 0,
        }
    }

    /// 结构体内的 STRING[n]：定长、以 0 结尾、无长度前缀。
    pub fn fixed() -> Self {
        Self {
            zero_terminated: true,
            fixed_length: true,
            counted: false,
            count_word_bytes: 0,
            pad_to_multiple_bytes: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagAttributes {
    pub allow_packing: bool,
    pub strings: StringConventions,
    pub str_max_capacity: Option<usize>,
    /// UDT 读取的字节数；缺省为从偏移到缓冲区末尾。
    pub offset_read_size: Option<usize>,
    /// 仅对 TIME 生效。
    pub read_as_string: bool,
    pub optimise: bool,
    pub passthrough: Vec<(String, String)>,
}

impl TagAttributes {
    pub fn defaults(optimise: bool) -> Self {
        Self {
            allow_packing: true,
            strings: if optimise {
                StringConventions::fixed()
            } else {
                StringConventions::counted()
            },
            str_max_capacity: None,
            offset_read_size: None,
            read_as_string: false,
            optimise,
            passthrough: Vec::new(),
        }
    }

    /// Attributes of a parent tag created to serve merged reads.
    pub fn shared_parent(allow_packing: bool) -> Self {
        Self {
            allow_packing,
            ..Self::defaults(true)
        }
    }

    pub fn parse(text: &str, data_type: DataType) -> Result<Self, DescriptorError> {
        let pairs = split_pairs(text)?;

        let optimise = match pairs.iter().rev().find(|(key, _)| *key == "optimise") {
            Some((key, value)) => parse_flag(key, value)?,
            None => false,
        };
        let mut attrs = Self::defaults(optimise);

        if !data_type.carries_strings() && pairs.iter().any(|(key, _)| key.starts_with("str_")) {
            warn!("str_* options only apply to STRING and UDT, ignored for {}", data_type.keyword());
        }

        for (key, value) in pairs {
            match key {
                "optimise" => {}
                "offset_read_size" => attrs.offset_read_size = Some(parse_count(key, value)?),
                "read_as_string" => {
                    let flag = parse_flag(key, value)?;
                    if flag && data_type != DataType::Time {
                        warn!("read_as_string only applies to TIME, ignored for {}", data_type.keyword());
                    } else {
                        attrs.read_as_string = flag;
                    }
                }
                "allow_packing" => attrs.allow_packing = parse_flag(key, value)?,
                "str_is_zero_terminated" => attrs.strings.zero_terminated = parse_flag(key, value)?,
                "str_is_fixed_length" => attrs.strings.fixed_length = parse_flag(key, value)?,
                "str_is_counted" => attrs.strings.counted = parse_flag(key, value)?,
                "str_count_word_bytes" => {
                    attrs.strings.count_word_bytes = parse_count(key, value)? as u32
                }
                "str_pad_to_multiple_bytes" => {
                    attrs.strings.pad_to_multiple_bytes = parse_count(key, value)? as u32
                }
                "str_max_capacity" => {
                    let capacity = parse_count(key, value)?;
                    if data_type.carries_strings() {
                        attrs.str_max_capacity = Some(capacity);
                        attrs.passthrough.push((key.to_string(), value.to_string()));
                    }
                }
                other => attrs.passthrough.push((other.to_string(), value.to_string())),
            }
        }

        Ok(attrs)
    }

    pub fn render(&self, data_type: DataType) -> String {
        let mut out = String::new();
        for (key, value) in &self.passthrough {
            out.push_str(&format!("&{key}={value}"));
        }

        out.push_str(&format!("&allow_packing={}", flag(self.allow_packing)));

        if data_type.carries_strings() {
            let s = &self.strings;
            out.push_str(&format!(
                "&str_is_zero_terminated={}&str_is_fixed_length={}&str_is_counted={}&str_count_word_bytes={}&str_pad_to_multiple_bytes={}",
                flag(s.zero_terminated),
                flag(s.fixed_length),
                flag(s.counted),
                s.count_word_bytes,
                s.pad_to_multiple_bytes
            ));
        }
        out
    }
}

fn split_pairs(text: &str) -> Result<Vec<(&str, &str)>, DescriptorError> {
    let text = text.trim();
    if text.is_empty() || text == "none" || text == "0" {
        return Ok(Vec::new());
    }

    let mut pairs = Vec::new();
    for segment in text.split('&').filter(|segment| !segment.is_empty()) {
        let (key, value) = segment
            .split_once('=')
            .map(|(key, value)| (key.trim(), value.trim()))
            .filter(|(key, value)| !key.is_empty() && !value.is_empty())
            .ok_or_else(|| DescriptorError::InvalidExtra {
                segment: segment.to_string(),
                reason: "expected key=value".to_string(),
            })?;
        pairs.push((key, value));
    }
    Ok(pairs)
}

fn parse_flag(key: &str, value: &str) -> Result<bool, DescriptorError> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(DescriptorError::InvalidExtra {
            segment: format!("{key}={value}"),
            reason: "expected 0 or 1".to_string(),
        }),
    }
}

fn parse_count(key: &str, value: &str) -> Result<usize, DescriptorError> {
    value.parse::<usize>().map_err(|_| DescriptorError::InvalidExtra {
        segment: format!("{key}={value}"),
        reason: "expected a non-negative integer".to_string(),
    })
}

fn flag(value: bool) -> u8 {
    u8::from(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_extras_render_packing_only_for_numbers() {
        for text in ["", "none", "0"] {
            let attrs = TagAttributes::parse(text, DataType::Real).unwrap();
            assert_eq!(attrs.render(DataType::Real), "&allow_packing=1");
        }
    }

    #[test]
    fn unknown_keys_pass_through_before_defaults() {
        let attrs = TagAttributes::parse("&iamimaginary=fish", DataType::Real).unwrap();
        assert_eq!(attrs.render(DataType::Real), "&iamimaginary=fish&allow_packing=1");
    }

    #[test]
    fn explicit_values_replace_defaults() {
        let attrs = TagAttributes::parse("allow_packing=0", DataType::Dint).unwrap();
        assert_eq!(attrs.render(DataType::Dint), "&allow_packing=0");
    }

    #[test]
    fn string_defaults_are_counted() {
        let attrs = TagAttributes::parse("none", DataType::String).unwrap();
        assert_eq!(
            attrs.render(DataType::String),
            "&allow_packing=1&str_is_zero_terminated=0&str_is_fixed_length=0&str_is_counted=1&str_count_word_bytes=2&str_pad_to_multiple_bytes=0"
        );
    }

    #[test]
    fn optimised_string_switches_to_fixed_length_and_strips_driver_keys() {
        let attrs =
            TagAttributes::parse("&str_max_capacity=100&optimise=1", DataType::String).unwrap();
        assert!(attrs.optimise);
        let rendered = attrs.render(DataType::String);
        assert!(rendered.contains("str_max_capacity=100"));
        assert!(rendered.contains("str_is_fixed_length=1"));
        assert!(rendered.contains("str_is_counted=0"));
        assert!(!rendered.contains("optimise"));
    }

    #[test]
    fn string_capacity_keeps_its_position_among_user_keys() {
        let attrs = TagAttributes::parse("&str_max_capacity=100&foo=1", DataType::String).unwrap();
        assert_eq!(attrs.str_max_capacity, Some(100));
        assert!(attrs
            .render(DataType::String)
            .starts_with("&str_max_capacity=100&foo=1&allow_packing=1&str_is_zero_terminated=0"));

        let attrs = TagAttributes::parse("&foo=1&str_max_capacity=100", DataType::Udt).unwrap();
        assert!(attrs.render(DataType::Udt).starts_with("&foo=1&str_max_capacity=100&allow_packing=1"));

        let attrs = TagAttributes::parse("&str_max_capacity=100", DataType::Dint).unwrap();
        assert_eq!(attrs.str_max_capacity, None);
        assert_eq!(attrs.render(DataType::Dint), "&allow_packing=1");
    }

    #[test]
    fn driver_keys_never_reach_the_transport() {
        let attrs = TagAttributes::parse("&offset_read_size=12&read_as_string=1", DataType::Time).unwrap();
        assert_eq!(attrs.offset_read_size, Some(12));
        assert!(attrs.read_as_string);
        assert_eq!(attrs.render(DataType::Time), "&allow_packing=1");
    }

    #[test]
    fn read_as_string_is_ignored_outside_time() {
        let attrs = TagAttributes::parse("read_as_string=1", DataType::Real).unwrap();
        assert!(!attrs.read_as_string);
        assert_eq!(attrs.render(DataType::Real), "&allow_packing=1");
    }

    #[test]
    fn rejects_segments_without_values() {
        assert!(TagAttributes::parse("&allow_packing", DataType::Real).is_err());
        assert!(TagAttributes::parse("&allow_packing=yes", DataType::Real).is_err());
        assert!(TagAttributes::parse("&str_max_capacity=-1", DataType::String).is_err());
    }
}
