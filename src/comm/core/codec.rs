//! 值解析（codec）：从 tag 缓冲区按偏移取出类型化值，以及写回。
//!
//! 当前约定：
//! - 多字节数值为小端（libplctag 在缓冲区访问层已处理字节序）
//! - 非位寻址的 BOOL 占 2 字节，取第 0 位
//! - 共享缓冲区中的 STRING 为定长 `str_max_capacity` 字节，遇 0 截断
//! - TIME 为自 1970 年起的纳秒数（u64）
//! - 带点号的成员路径读自己的 tag 时，字段从 0 开始；读共享缓冲区时用描述符偏移

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::descriptor::ValueDescriptor;
use super::model::{DataType, MAX_CIP_MESSAGE_DATA_SIZE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalarType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
}

impl ScalarType {
    pub fn for_data_type(data_type: DataType) -> Option<Self> {
        let ty = match data_type {
            DataType::Sint => ScalarType::I8,
            DataType::Usint => ScalarType::U8,
            DataType::Int => ScalarType::I16,
            DataType::Uint | DataType::Word => ScalarType::U16,
            DataType::Dint => ScalarType::I32,
            DataType::Udint | DataType::Dword => ScalarType::U32,
            DataType::Real => ScalarType::F32,
            DataType::Lint => ScalarType::I64,
            DataType::Ulint | DataType::Lword | DataType::Time => ScalarType::U64,
            DataType::Lreal => ScalarType::F64,
            DataType::Bool | DataType::String | DataType::Udt => return None,
        };
        Some(ty)
    }

    pub fn width(&self) -> usize {
        match self {
            ScalarType::I8 | ScalarType::U8 => 1,
            ScalarType::I16 | ScalarType::U16 => 2,
            ScalarType::I32 | ScalarType::U32 | ScalarType::F32 => 4,
            ScalarType::I64 | ScalarType::U64 | ScalarType::F64 => 8,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Scalar {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
}

impl Scalar {
    pub fn from_le_bytes(ty: ScalarType, bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..ty.width())?;
        let value = match ty {
            ScalarType::I8 => Scalar::I8(i8::from_le_bytes(bytes.try_into().ok()?)),
            ScalarType::U8 => Scalar::U8(bytes[0]),
            ScalarType::I16 => Scalar::I16(i16::from_le_bytes(bytes.try_into().ok()?)),
            ScalarType::U16 => Scalar::U16(u16::from_le_bytes(bytes.try_into().ok()?)),
            ScalarType::I32 => Scalar::I32(i32::from_le_bytes(bytes.try_into().ok()?)),
            ScalarType::U32 => Scalar::U32(u32::from_le_bytes(bytes.try_into().ok()?)),
            ScalarType::I64 => Scalar::I64(i64::from_le_bytes(bytes.try_into().ok()?)),
            ScalarType::U64 => Scalar::U64(u64::from_le_bytes(bytes.try_into().ok()?)),
            ScalarType::F32 => Scalar::F32(f32::from_le_bytes(bytes.try_into().ok()?)),
            ScalarType::F64 => Scalar::F64(f64::from_le_bytes(bytes.try_into().ok()?)),
        };
        Some(value)
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            Scalar::I8(v) => v.to_le_bytes().to_vec(),
            Scalar::U8(v) => v.to_le_bytes().to_vec(),
            Scalar::I16(v) => v.to_le_bytes().to_vec(),
            Scalar::U16(v) => v.to_le_bytes().to_vec(),
            Scalar::I32(v) => v.to_le_bytes().to_vec(),
            Scalar::U32(v) => v.to_le_bytes().to_vec(),
            Scalar::I64(v) => v.to_le_bytes().to_vec(),
            Scalar::U64(v) => v.to_le_bytes().to_vec(),
            Scalar::F32(v) => v.to_le_bytes().to_vec(),
            Scalar::F64(v) => v.to_le_bytes().to_vec(),
        }
    }

    fn into_decoded(self) -> DecodedValue {
        match self {
            Scalar::I8(v) => DecodedValue::Int8(v),
            Scalar::U8(v) => DecodedValue::UInt8(v),
            Scalar::I16(v) => DecodedValue::Int16(v),
            Scalar::U16(v) => DecodedValue::UInt16(v),
            Scalar::I32(v) => DecodedValue::Int32(v),
            Scalar::U32(v) => DecodedValue::UInt32(v),
            Scalar::I64(v) => DecodedValue::Int64(v),
            Scalar::U64(v) => DecodedValue::UInt64(v),
            Scalar::F32(v) => DecodedValue::Float32(v),
            Scalar::F64(v) => DecodedValue::Float64(v),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("buffer access failed ({code}): {message}")]
pub struct BufferError {
    pub code: i32,
    pub message: String,
}

/// Typed access to a completed tag buffer.
pub trait TagBuffer {
    fn size(&self) -> Result<usize, BufferError>;
    fn get_bit(&self, bit_offset: usize) -> Result<bool, BufferError>;
    fn set_bit(&self, bit_offset: usize, value: bool) -> Result<(), BufferError>;
    fn get_scalar(&self, offset: usize, ty: ScalarType) -> Result<Scalar, BufferError>;
    fn set_scalar(&self, offset: usize, value: Scalar) -> Result<(), BufferError>;
    fn get_raw_bytes(&self, offset: usize, len: usize) -> Result<Vec<u8>, BufferError>;
    fn set_raw_bytes(&self, offset: usize, bytes: &[u8]) -> Result<(), BufferError>;
    fn get_string(&self, offset: usize) -> Result<String, BufferError>;
    fn set_string(&self, offset: usize, value: &str) -> Result<(), BufferError>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum DecodedValue {
    Bool(bool),
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Text(String),
    Bytes(Vec<u8>),
    Array(Vec<DecodedValue>),
}

impl DecodedValue {
    pub fn to_value_display(&self) -> String {
        match self {
            DecodedValue::Bool(value) => {
                if *value {
                    "1".to_string()
                } else {
                    "0".to_string()
                }
            }
            DecodedValue::Int8(value) => value.to_string(),
            DecodedValue::UInt8(value) => value.to_string(),
            DecodedValue::Int16(value) => value.to_string(),
            DecodedValue::UInt16(value) => value.to_string(),
            DecodedValue::Int32(value) => value.to_string(),
            DecodedValue::UInt32(value) => value.to_string(),
            DecodedValue::Int64(value) => value.to_string(),
            DecodedValue::UInt64(value) => value.to_string(),
            DecodedValue::Float32(value) => value.to_string(),
            DecodedValue::Float64(value) => value.to_string(),
            DecodedValue::Text(value) => value.clone(),
            DecodedValue::Bytes(bytes) => bytes
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(" "),
            DecodedValue::Array(values) => format!(
                "[{}]",
                values
                    .iter()
                    .map(DecodedValue::to_value_display)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }

    fn to_scalar(&self, ty: ScalarType) -> Option<Scalar> {
        let as_i128 = match self {
            DecodedValue::Int8(v) => Some(i128::from(*v)),
            DecodedValue::UInt8(v) => Some(i128::from(*v)),
            DecodedValue::Int16(v) => Some(i128::from(*v)),
            DecodedValue::UInt16(v) => Some(i128::from(*v)),
            DecodedValue::Int32(v) => Some(i128::from(*v)),
            DecodedValue::UInt32(v) => Some(i128::from(*v)),
            DecodedValue::Int64(v) => Some(i128::from(*v)),
            DecodedValue::UInt64(v) => Some(i128::from(*v)),
            _ => None,
        };
        let as_f64 = match self {
            DecodedValue::Float32(v) => Some(f64::from(*v)),
            DecodedValue::Float64(v) => Some(*v),
            _ => as_i128.map(|v| v as f64),
        };

        match ty {
            ScalarType::F32 => as_f64.map(|v| Scalar::F32(v as f32)),
            ScalarType::F64 => as_f64.map(Scalar::F64),
            ScalarType::I8 => as_i128.and_then(|v| i8::try_from(v).ok()).map(Scalar::I8),
            ScalarType::U8 => as_i128.and_then(|v| u8::try_from(v).ok()).map(Scalar::U8),
            ScalarType::I16 => as_i128.and_then(|v| i16::try_from(v).ok()).map(Scalar::I16),
            ScalarType::U16 => as_i128.and_then(|v| u16::try_from(v).ok()).map(Scalar::U16),
            ScalarType::I32 => as_i128.and_then(|v| i32::try_from(v).ok()).map(Scalar::I32),
            ScalarType::U32 => as_i128.and_then(|v| u32::try_from(v).ok()).map(Scalar::U32),
            ScalarType::I64 => as_i128.and_then(|v| i64::try_from(v).ok()).map(Scalar::I64),
            ScalarType::U64 => as_i128.and_then(|v| u64::try_from(v).ok()).map(Scalar::U64),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("decode error: {0}")]
    Buffer(#[from] BufferError),

    #[error("decode error: {len} bytes at offset {offset} exceed buffer of {size} bytes")]
    OutOfRange { offset: usize, len: usize, size: usize },

    #[error("decode error: TIME value {nanos} ns is out of range")]
    TimeOutOfRange { nanos: u64 },

    #[error("decode error: cannot write {got} into {}", .data_type.keyword())]
    TypeMismatch { data_type: DataType, got: String },

    #[error("decode error: element {index} past offset {base} overflows the buffer address range")]
    OffsetOverflow { base: usize, index: usize },

    #[error("decode error: expected {expected} elements, got {got}")]
    ElementCount { expected: usize, got: usize },
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DecodeOptions {
    /// 值位于共享（聚合）缓冲区内。
    pub shared_buffer: bool,
    pub timezone_offset_hours: f64,
}

/// 字段在当前读取缓冲区中的起始偏移。
pub fn base_offset(descriptor: &ValueDescriptor, options: DecodeOptions) -> usize {
    if !options.shared_buffer && descriptor.locates_field_in_parent() {
        0
    } else {
        descriptor.offset
    }
}

pub fn decode_value(
    buffer: &dyn TagBuffer,
    descriptor: &ValueDescriptor,
    options: DecodeOptions,
) -> Result<DecodedValue, DecodeError> {
    let base = base_offset(descriptor, options);
    let count = descriptor.slice_count.max(1);
    let mut values = Vec::with_capacity(count.min(MAX_CIP_MESSAGE_DATA_SIZE));

    match descriptor.data_type {
        DataType::String => return decode_string(buffer, descriptor, base, options),
        DataType::Udt => return decode_udt(buffer, descriptor, base),
        DataType::Bool => {
            for i in 0..count {
                values.push(DecodedValue::Bool(buffer.get_bit(bool_bit(descriptor, base, i)?)?));
            }
        }
        DataType::Time => {
            element_offset(base, count, 8)?;
            for i in 0..count {
                let offset = element_offset(base, i, 8)?;
                let value = if descriptor.attributes.read_as_string {
                    let nanos = match buffer.get_scalar(offset, ScalarType::U64)? {
                        Scalar::U64(nanos) => nanos,
                        _ => 0,
                    };
                    DecodedValue::Text(format_plc_time(nanos, options.timezone_offset_hours)?)
                } else {
                    DecodedValue::Bytes(buffer.get_raw_bytes(offset, 8)?)
                };
                values.push(value);
            }
        }
        numeric => {
            // for_data_type 只对 BOOL/STRING/UDT 返回 None，上面已分支处理
            let Some(ty) = ScalarType::for_data_type(numeric) else {
                return Err(DecodeError::TypeMismatch {
                    data_type: numeric,
                    got: "numeric read".to_string(),
                });
            };
            element_offset(base, count, ty.width())?;
            for i in 0..count {
                let scalar = buffer.get_scalar(element_offset(base, i, ty.width())?, ty)?;
                values.push(scalar.into_decoded());
            }
        }
    }

    if values.len() == 1 {
        Ok(values.remove(0))
    } else {
        Ok(DecodedValue::Array(values))
    }
}

pub fn encode_value(
    buffer: &dyn TagBuffer,
    descriptor: &ValueDescriptor,
    value: &DecodedValue,
    options: DecodeOptions,
) -> Result<(), DecodeError> {
    let data_type = descriptor.data_type;
    let base = base_offset(descriptor, options);
    let mismatch = || DecodeError::TypeMismatch {
        data_type,
        got: value.to_value_display(),
    };

    match data_type {
        DataType::String => {
            let DecodedValue::Text(text) = value else {
                return Err(mismatch());
            };
            match fixed_string_capacity(descriptor, options) {
                Some(capacity) => {
                    let size = buffer.size()?;
                    if base.checked_add(capacity).map_or(true, |end| end > size) {
                        return Err(DecodeError::OutOfRange {
                            offset: base,
                            len: capacity,
                            size,
                        });
                    }
                    let mut bytes = text.as_bytes().to_vec();
                    bytes.resize(capacity, 0);
                    buffer.set_raw_bytes(base, &bytes)?;
                }
                None => buffer.set_string(base, text)?,
            }
            Ok(())
        }
        DataType::Udt | DataType::Time => {
            let DecodedValue::Bytes(bytes) = value else {
                return Err(mismatch());
            };
            buffer.set_raw_bytes(base, bytes)?;
            Ok(())
        }
        _ => {
            let elements = match value {
                DecodedValue::Array(values) => values.as_slice(),
                single => std::slice::from_ref(single),
            };
            let expected = descriptor.slice_count.max(1);
            if elements.len() != expected {
                return Err(DecodeError::ElementCount {
                    expected,
                    got: elements.len(),
                });
            }

            for (i, element) in elements.iter().enumerate() {
                if data_type == DataType::Bool {
                    let DecodedValue::Bool(flag) = element else {
                        return Err(mismatch());
                    };
                    buffer.set_bit(bool_bit(descriptor, base, i)?, *flag)?;
                    continue;
                }
                let ty = ScalarType::for_data_type(data_type).ok_or_else(mismatch)?;
                let scalar = element.to_scalar(ty).ok_or_else(mismatch)?;
                buffer.set_scalar(element_offset(base, i, ty.width())?, scalar)?;
            }
            Ok(())
        }
    }
}

/// PLC 时间（纳秒）按时区偏移换算为 UTC 并格式化为 RFC 3339。
pub fn format_plc_time(nanos: u64, timezone_offset_hours: f64) -> Result<String, DecodeError> {
    let out_of_range = || DecodeError::TimeOutOfRange { nanos };
    let secs = i64::try_from(nanos / 1_000_000_000).map_err(|_| out_of_range())?;
    let plc_time = DateTime::<Utc>::from_timestamp(secs, (nanos % 1_000_000_000) as u32)
        .ok_or_else(out_of_range)?;
    let shift = chrono::Duration::milliseconds((timezone_offset_hours * 3_600_000.0).round() as i64);
    let utc = plc_time.checked_sub_signed(shift).ok_or_else(out_of_range)?;
    Ok(utc.to_rfc3339_opts(SecondsFormat::Nanos, true))
}

fn element_offset(base: usize, index: usize, width: usize) -> Result<usize, DecodeError> {
    index
        .checked_mul(width)
        .and_then(|step| base.checked_add(step))
        .ok_or(DecodeError::OffsetOverflow { base, index })
}

fn bool_bit(descriptor: &ValueDescriptor, base: usize, index: usize) -> Result<usize, DecodeError> {
    if descriptor.bit_addressed {
        base.checked_add(index).ok_or(DecodeError::OffsetOverflow { base, index })
    } else {
        element_offset(base, index, 2)?
            .checked_mul(8)
            .ok_or(DecodeError::OffsetOverflow { base, index })
    }
}

fn fixed_string_capacity(descriptor: &ValueDescriptor, options: DecodeOptions) -> Option<usize> {
    if options.shared_buffer || descriptor.attributes.optimise {
        descriptor.attributes.str_max_capacity
    } else {
        None
    }
}

fn decode_string(
    buffer: &dyn TagBuffer,
    descriptor: &ValueDescriptor,
    base: usize,
    options: DecodeOptions,
) -> Result<DecodedValue, DecodeError> {
    let Some(capacity) = fixed_string_capacity(descriptor, options) else {
        return Ok(DecodedValue::Text(buffer.get_string(base)?));
    };

    let size = buffer.size()?;
    if base >= size {
        return Err(DecodeError::OutOfRange {
            offset: base,
            len: capacity,
            size,
        });
    }
    let len = capacity.min(size - base);
    let bytes = buffer.get_raw_bytes(base, len)?;
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    Ok(DecodedValue::Text(String::from_utf8_lossy(&bytes[..end]).into_owned()))
}

fn decode_udt(buffer: &dyn TagBuffer, descriptor: &ValueDescriptor, base: usize) -> Result<DecodedValue, DecodeError> {
    let size = buffer.size()?;
    let offset = base;
    let len = match descriptor.attributes.offset_read_size {
        Some(len) => len,
        None => size.saturating_sub(offset),
    };
    offset
        .checked_add(len)
        .filter(|end| *end <= size)
        .ok_or(DecodeError::OutOfRange { offset, len, size })?;
    Ok(DecodedValue::Bytes(buffer.get_raw_bytes(offset, len)?))
}
