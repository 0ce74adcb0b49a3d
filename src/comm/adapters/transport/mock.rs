//! Mock 传输层（用于无真实 PLC 环境的单测/演示）。
//!
//! 行为约定（按连接串中的 `name=` 判断）：
//! - 名称包含 `missing` → 创建失败（NOT_FOUND）
//! - 名称包含 `timeout` → 读写永远停留在 Pending
//! - 名称包含 `error` → 读取完成但返回 BAD_REPLY
//! - 其他 → 读取时把“PLC 内存”复制到 tag 缓冲区；写入时反向复制

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use super::{TagHandle, TagStatus, TagTransport};
use crate::comm::core::codec::{Scalar, ScalarType};

pub const ERR_BAD_REPLY: i32 = -8;
pub const ERR_NOT_FOUND: i32 = -19;
pub const ERR_NULL_PTR: i32 = -25;
pub const ERR_OUT_OF_BOUNDS: i32 = -27;

const DEFAULT_TAG_SIZE: usize = 64;

#[derive(Debug)]
struct MockTag {
    name: String,
    status: TagStatus,
    buffer: Vec<u8>,
}

#[derive(Debug, Default)]
struct MockState {
    next_handle: TagHandle,
    tags: HashMap<TagHandle, MockTag>,
    memory: HashMap<String, Vec<u8>>,
    fail_create: HashSet<String>,
    created: usize,
    destroyed: usize,
    reads: HashMap<String, usize>,
}

#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置 PLC 侧某个 tag 的原始字节。
    pub fn set_memory(&self, tag_name: &str, bytes: Vec<u8>) {
        self.state.lock().memory.insert(tag_name.to_string(), bytes);
    }

    pub fn memory(&self, tag_name: &str) -> Option<Vec<u8>> {
        self.state.lock().memory.get(tag_name).cloned()
    }

    pub fn fail_create_for(&self, tag_name: &str) {
        self.state.lock().fail_create.insert(tag_name.to_string());
    }

    pub fn created_count(&self) -> usize {
        self.state.lock().created
    }

    pub fn destroyed_count(&self) -> usize {
        self.state.lock().destroyed
    }

    pub fn live_tags(&self) -> usize {
        self.state.lock().tags.len()
    }

    pub fn read_count(&self, tag_name: &str) -> usize {
        self.state.lock().reads.get(tag_name).copied().unwrap_or(0)
    }

    fn with_tag<T>(&self, handle: TagHandle, f: impl FnOnce(&mut MockTag) -> Result<T, i32>) -> Result<T, i32> {
        let mut state = self.state.lock();
        let tag = state.tags.get_mut(&handle).ok_or(ERR_NULL_PTR)?;
        f(tag)
    }
}

fn tag_name_of(connection: &str) -> String {
    connection
        .split('&')
        .find_map(|segment| segment.strip_prefix("name="))
        .unwrap_or_default()
        .to_string()
}

fn range(buffer: &[u8], offset: usize, len: usize) -> Result<std::ops::Range<usize>, i32> {
    let end = offset.checked_add(len).ok_or(ERR_OUT_OF_BOUNDS)?;
    if end > buffer.len() {
        return Err(ERR_OUT_OF_BOUNDS);
    }
    Ok(offset..end)
}

impl TagTransport for MockTransport {
    fn create_tag(&self, connection: &str, _timeout_ms: u64) -> Result<TagHandle, i32> {
        let name = tag_name_of(connection);
        let mut state = self.state.lock();
        if name.contains("missing") || state.fail_create.contains(&name) {
            return Err(ERR_NOT_FOUND);
        }

        state.next_handle += 1;
        state.created += 1;
        let handle = state.next_handle;
        let buffer = state
            .memory
            .get(&name)
            .cloned()
            .unwrap_or_else(|| vec![0u8; DEFAULT_TAG_SIZE]);
        state.tags.insert(
            handle,
            MockTag {
                name,
                status: TagStatus::Ok,
                buffer,
            },
        );
        Ok(handle)
    }

    fn read(&self, handle: TagHandle) -> TagStatus {
        let mut state = self.state.lock();
        let MockState { tags, memory, reads, .. } = &mut *state;
        let Some(tag) = tags.get_mut(&handle) else {
            return TagStatus::Error(ERR_NULL_PTR);
        };
        *reads.entry(tag.name.clone()).or_insert(0) += 1;

        if tag.name.contains("timeout") {
            tag.status = TagStatus::Pending;
        } else if tag.name.contains("error") {
            tag.status = TagStatus::Error(ERR_BAD_REPLY);
        } else {
            if let Some(bytes) = memory.get(&tag.name) {
                tag.buffer = bytes.clone();
            }
            tag.status = TagStatus::Ok;
        }
        TagStatus::Pending
    }

    fn write(&self, handle: TagHandle) -> TagStatus {
        let mut state = self.state.lock();
        let MockState { tags, memory, .. } = &mut *state;
        let Some(tag) = tags.get_mut(&handle) else {
            return TagStatus::Error(ERR_NULL_PTR);
        };

        if tag.name.contains("timeout") {
            tag.status = TagStatus::Pending;
        } else {
            memory.insert(tag.name.clone(), tag.buffer.clone());
            tag.status = TagStatus::Ok;
        }
        TagStatus::Pending
    }

    fn status(&self, handle: TagHandle) -> TagStatus {
        self.state
            .lock()
            .tags
            .get(&handle)
            .map(|tag| tag.status)
            .unwrap_or(TagStatus::Error(ERR_NULL_PTR))
    }

    fn destroy(&self, handle: TagHandle) {
        let mut state = self.state.lock();
        if state.tags.remove(&handle).is_some() {
            state.destroyed += 1;
        }
    }

    fn size(&self, handle: TagHandle) -> Result<usize, i32> {
        self.with_tag(handle, |tag| Ok(tag.buffer.len()))
    }

    fn get_bit(&self, handle: TagHandle, bit_offset: usize) -> Result<bool, i32> {
        self.with_tag(handle, |tag| {
            let byte = tag.buffer.get(bit_offset / 8).ok_or(ERR_OUT_OF_BOUNDS)?;
            Ok(byte & (1 << (bit_offset % 8)) != 0)
        })
    }

    fn set_bit(&self, handle: TagHandle, bit_offset: usize, value: bool) -> Result<(), i32> {
        self.with_tag(handle, |tag| {
            let byte = tag.buffer.get_mut(bit_offset / 8).ok_or(ERR_OUT_OF_BOUNDS)?;
            let mask = 1u8 << (bit_offset % 8);
            if value {
                *byte |= mask;
            } else {
                *byte &= !mask;
            }
            Ok(())
        })
    }

    fn get_scalar(&self, handle: TagHandle, offset: usize, ty: ScalarType) -> Result<Scalar, i32> {
        self.with_tag(handle, |tag| {
            let span = range(&tag.buffer, offset, ty.width())?;
            Scalar::from_le_bytes(ty, &tag.buffer[span]).ok_or(ERR_OUT_OF_BOUNDS)
        })
    }

    fn set_scalar(&self, handle: TagHandle, offset: usize, value: Scalar) -> Result<(), i32> {
        self.set_raw_bytes(handle, offset, &value.to_le_bytes())
    }

    fn get_raw_bytes(&self, handle: TagHandle, offset: usize, len: usize) -> Result<Vec<u8>, i32> {
        self.with_tag(handle, |tag| {
            let span = range(&tag.buffer, offset, len)?;
            Ok(tag.buffer[span].to_vec())
        })
    }

    fn set_raw_bytes(&self, handle: TagHandle, offset: usize, bytes: &[u8]) -> Result<(), i32> {
        self.with_tag(handle, |tag| {
            let span = range(&tag.buffer, offset, bytes.len())?;
            tag.buffer[span].copy_from_slice(bytes);
            Ok(())
        })
    }

    fn get_string(&self, handle: TagHandle, offset: usize) -> Result<String, i32> {
        self.with_tag(handle, |tag| {
            let span = range(&tag.buffer, offset, 2)?;
            let len = u16::from_le_bytes([tag.buffer[span.start], tag.buffer[span.start + 1]]) as usize;
            let span = range(&tag.buffer, offset + 2, len)?;
            Ok(String::from_utf8_lossy(&tag.buffer[span]).into_owned())
        })
    }

    fn set_string(&self, handle: TagHandle, offset: usize, value: &str) -> Result<(), i32> {
        let len = u16::try_from(value.len()).map_err(|_| ERR_OUT_OF_BOUNDS)?;
        self.with_tag(handle, |tag| {
            let span = range(&tag.buffer, offset, 2 + value.len())?;
            tag.buffer[span.start..span.start + 2].copy_from_slice(&len.to_le_bytes());
            tag.buffer[span.start + 2..span.end].copy_from_slice(value.as_bytes());
            Ok(())
        })
    }

    fn decode_error(&self, code: i32) -> String {
        match code {
            ERR_BAD_REPLY => "PLCTAG_ERR_BAD_REPLY".to_string(),
            ERR_NOT_FOUND => "PLCTAG_ERR_NOT_FOUND".to_string(),
            ERR_NULL_PTR => "PLCTAG_ERR_NULL_PTR".to_string(),
            ERR_OUT_OF_BOUNDS => "PLCTAG_ERR_OUT_OF_BOUNDS".to_string(),
            other => format!("PLCTAG_ERR_{other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::{PhysicalTag, TransportError};
    use super::*;
    use crate::comm::core::codec::TagBuffer;

    #[test]
    fn read_copies_plc_memory_into_the_tag_buffer() {
        let mock = Arc::new(MockTransport::new());
        mock.set_memory("counter", 7i32.to_le_bytes().to_vec());

        let tag = PhysicalTag::create(mock.clone(), "p&name=counter&elem_count=1", 100).unwrap();
        tag.start_read().unwrap();
        assert_eq!(tag.status(), TagStatus::Ok);
        assert_eq!(tag.get_scalar(0, ScalarType::I32).unwrap(), Scalar::I32(7));
        assert_eq!(mock.read_count("counter"), 1);
        assert!(tag.get_scalar(2, ScalarType::I32).is_err());
    }

    #[test]
    fn naming_conventions_drive_failures() {
        let mock = Arc::new(MockTransport::new());
        let err = PhysicalTag::create(mock.clone(), "p&name=missingTag", 100).unwrap_err();
        assert!(matches!(err, TransportError::CreateFailed { code: ERR_NOT_FOUND, .. }));

        let slow = PhysicalTag::create(mock.clone(), "p&name=timeoutTag", 100).unwrap();
        slow.start_read().unwrap();
        assert_eq!(slow.status(), TagStatus::Pending);

        let broken = PhysicalTag::create(mock.clone(), "p&name=errorTag", 100).unwrap();
        broken.start_read().unwrap();
        assert_eq!(broken.status(), TagStatus::Error(ERR_BAD_REPLY));
    }

    #[test]
    fn dropping_the_last_reference_destroys_the_handle() {
        let mock = Arc::new(MockTransport::new());
        let tag = PhysicalTag::create(mock.clone(), "p&name=a", 100).unwrap();
        let shared = Arc::clone(&tag);
        drop(tag);
        assert_eq!(mock.live_tags(), 1);
        drop(shared);
        assert_eq!(mock.live_tags(), 0);
        assert_eq!(mock.destroyed_count(), 1);
    }

    #[test]
    fn write_publishes_the_buffer() {
        let mock = Arc::new(MockTransport::new());
        let tag = PhysicalTag::create(mock.clone(), "p&name=s", 100).unwrap();
        tag.set_string(0, "hi").unwrap();
        tag.start_write().unwrap();
        let memory = mock.memory("s").unwrap();
        assert_eq!(&memory[..4], &[2, 0, b'h', b'i']);
    }
}
