//! Omron EIP 桥接：核心数据模型（DTO）。
//!
//! 约定：对外 JSON 字段统一 camelCase；值标识统一用 `Uuid`。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::codec::DecodedValue;

pub const SCHEMA_VERSION_V1: u32 = 1;

/// 保留的轮询组名：未指定 `@poller` 的值在合并完成后只读取一次。
pub const INIT_POLLER: &str = "driverInitPoller";

pub type ValueId = Uuid;

/// 单个 CIP 报文可携带的最大数据字节数（不含 2 字节序列号头）。
pub const MAX_CIP_MESSAGE_DATA_SIZE: usize = 1994;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
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
    String,
    Word,
    Dword,
    Lword,
    Udt,
    Time,
}

impl DataType {
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        let data_type = match keyword {
            "BOOL" => DataType::Bool,
            "SINT" => DataType::Sint,
            "USINT" => DataType::Usint,
            "INT" => DataType::Int,
            "UINT" => DataType::Uint,
            "DINT" => DataType::Dint,
            "UDINT" => DataType::Udint,
            "LINT" => DataType::Lint,
            "ULINT" => DataType::Ulint,
            "REAL" => DataType::Real,
            "LREAL" => DataType::Lreal,
            "STRING" => DataType::String,
            "WORD" => DataType::Word,
            "DWORD" => DataType::Dword,
            "LWORD" => DataType::Lword,
            "UDT" => DataType::Udt,
            "TIME" => DataType::Time,
            _ => return None,
        };
        Some(data_type)
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            DataType::Bool => "BOOL",
            DataType::Sint => "SINT",
            DataType::Usint => "USINT",
            DataType::Int => "INT",
            DataType::Uint => "UINT",
            DataType::Dint => "DINT",
            DataType::Udint => "UDINT",
            DataType::Lint => "LINT",
            DataType::Ulint => "ULINT",
            DataType::Real => "REAL",
            DataType::Lreal => "LREAL",
            DataType::String => "STRING",
            DataType::Word => "WORD",
            DataType::Dword => "DWORD",
            DataType::Lword => "LWORD",
            DataType::Udt => "UDT",
            DataType::Time => "TIME",
        }
    }

    /// 单个元素在 tag 缓冲区中的字节宽度；STRING/UDT 无固定宽度。
    pub fn element_width(&self) -> Option<usize> {
        match self {
            DataType::Bool => Some(2),
            DataType::Sint | DataType::Usint => Some(1),
            DataType::Int | DataType::Uint | DataType::Word => Some(2),
            DataType::Dint | DataType::Udint | DataType::Real | DataType::Dword => Some(4),
            DataType::Lint | DataType::Ulint | DataType::Lreal | DataType::Lword | DataType::Time => {
                Some(8)
            }
            DataType::String | DataType::Udt => None,
        }
    }

    /// STRING 与 UDT 会携带字符串相关的传输参数。
    pub fn carries_strings(&self) -> bool {
        matches!(self, DataType::String | DataType::Udt)
    }

    pub fn supports_slices(&self) -> bool {
        !matches!(self, DataType::String | DataType::Lint | DataType::Ulint)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum OptimisationState {
    NotRequested,
    DoNotOptimize,
    PendingOptimization,
    Optimized,
    Master,
    OptimizationFailed,
}

impl OptimisationState {
    /// 读取的是共享（聚合）缓冲区，而非值自己的 tag。
    pub fn reads_shared_buffer(&self) -> bool {
        matches!(self, OptimisationState::Optimized | OptimisationState::Master)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Quality {
    Ok,
    Timeout,
    CommError,
    DecodeError,
    ConfigError,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SampleResult {
    pub value_id: ValueId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<DecodedValue>,
    pub value_display: String,
    pub quality: Quality,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u32,
    #[serde(default)]
    pub error_message: String,
}

impl SampleResult {
    pub fn failure(
        value_id: ValueId,
        quality: Quality,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
        duration_ms: u32,
    ) -> Self {
        Self {
            value_id,
            value: None,
            value_display: "".to_string(),
            quality,
            timestamp,
            duration_ms,
            error_message: message.into(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PollStats {
    pub total: u32,
    pub ok: u32,
    pub timeout: u32,
    pub comm_error: u32,
    pub decode_error: u32,
    pub config_error: u32,
}

impl PollStats {
    pub fn from_results(results: &[SampleResult]) -> Self {
        let mut stats = PollStats::default();
        for result in results {
            stats.total += 1;
            match result.quality {
                Quality::Ok => stats.ok += 1,
                Quality::Timeout => stats.timeout += 1,
                Quality::CommError => stats.comm_error += 1,
                Quality::DecodeError => stats.decode_error += 1,
                Quality::ConfigError => stats.config_error += 1,
            }
        }
        stats
    }
}

/// 对外查询用：某个值当前的物理 tag 与合并状态。
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ValueInfo {
    pub value_id: ValueId,
    pub tag_name: String,
    pub poller: String,
    pub connection: String,
    pub state: OptimisationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<i32>,
    pub read_flag: bool,
    pub offset: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_type_keywords_round_trip() {
        for keyword in [
            "BOOL", "SINT", "USINT", "INT", "UINT", "DINT", "UDINT", "LINT", "ULINT", "REAL",
            "LREAL", "STRING", "WORD", "DWORD", "LWORD", "UDT", "TIME",
        ] {
            let data_type = DataType::from_keyword(keyword).unwrap();
            assert_eq!(data_type.keyword(), keyword);
        }
        assert_eq!(DataType::from_keyword("int"), None);
    }

    #[test]
    fn slices_are_refused_for_strings_and_64_bit_integers() {
        assert!(!DataType::String.supports_slices());
        assert!(!DataType::Lint.supports_slices());
        assert!(!DataType::Ulint.supports_slices());
        assert!(DataType::Lword.supports_slices());
    }

    #[test]
    fn sample_result_serializes_camel_case() {
        let result = SampleResult::failure(
            Uuid::from_u128(7),
            Quality::ConfigError,
            "not polled yet",
            DateTime::<Utc>::from_timestamp(0, 0).unwrap(),
            0,
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["quality"], "ConfigError");
        assert_eq!(json["errorMessage"], "not polled yet");
        assert!(json.get("value").is_none());
    }
}
