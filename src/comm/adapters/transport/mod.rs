//! 传输层（transport）：对 libplctag 风格 tag 句柄接口的抽象。
//!
//! 约定：
//! - `create_tag` / `read` / `write` 均为非阻塞发起，完成情况通过 `status` 轮询
//! - 缓冲区访问与错误码沿用 libplctag 语义（负数为错误）
//! - 物理 tag 由 `PhysicalTag` 独占句柄，最后一个 `Arc` 释放时销毁

use std::fmt;
use std::sync::Arc;

use log::debug;
use thiserror::Error;

use crate::comm::core::codec::{BufferError, Scalar, ScalarType, TagBuffer};

pub mod mock;

pub type TagHandle = i32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TagStatus {
    Pending,
    Ok,
    Error(i32),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport error: could not create tag '{connection}' ({code}): {message}")]
    CreateFailed {
        connection: String,
        code: i32,
        message: String,
    },

    #[error("transport error: tag {handle} failed ({code}): {message}")]
    Status {
        handle: TagHandle,
        code: i32,
        message: String,
    },

    #[error("transport error: tag {handle} did not complete within {timeout_ms} ms")]
    Timeout { handle: TagHandle, timeout_ms: u64 },

    #[error("transport error: value has no physical tag")]
    NoTag,
}

/// libplctag-like tag API. Implementations must be callable from any thread.
pub trait TagTransport: Send + Sync {
    fn create_tag(&self, connection: &str, timeout_ms: u64) -> Result<TagHandle, i32>;
    fn read(&self, handle: TagHandle) -> TagStatus;
    fn write(&self, handle: TagHandle) -> TagStatus;
    fn status(&self, handle: TagHandle) -> TagStatus;
    fn destroy(&self, handle: TagHandle);

    fn size(&self, handle: TagHandle) -> Result<usize, i32>;
    fn get_bit(&self, handle: TagHandle, bit_offset: usize) -> Result<bool, i32>;
    fn set_bit(&self, handle: TagHandle, bit_offset: usize, value: bool) -> Result<(), i32>;
    fn get_scalar(&self, handle: TagHandle, offset: usize, ty: ScalarType) -> Result<Scalar, i32>;
    fn set_scalar(&self, handle: TagHandle, offset: usize, value: Scalar) -> Result<(), i32>;
    fn get_raw_bytes(&self, handle: TagHandle, offset: usize, len: usize) -> Result<Vec<u8>, i32>;
    fn set_raw_bytes(&self, handle: TagHandle, offset: usize, bytes: &[u8]) -> Result<(), i32>;
    fn get_string(&self, handle: TagHandle, offset: usize) -> Result<String, i32>;
    fn set_string(&self, handle: TagHandle, offset: usize, value: &str) -> Result<(), i32>;

    fn decode_error(&self, code: i32) -> String;
}

/// Owned transport handle. Shared between values through `Arc`; the handle is
/// destroyed when the last reference is dropped.
pub struct PhysicalTag {
    handle: TagHandle,
    connection: String,
    transport: Arc<dyn TagTransport>,
}

impl PhysicalTag {
    pub fn create(
        transport: Arc<dyn TagTransport>,
        connection: &str,
        timeout_ms: u64,
    ) -> Result<Arc<Self>, TransportError> {
        match transport.create_tag(connection, timeout_ms) {
            Ok(handle) => {
                debug!("created tag {handle}: {connection}");
                Ok(Arc::new(Self {
                    handle,
                    connection: connection.to_string(),
                    transport,
                }))
            }
            Err(code) => Err(TransportError::CreateFailed {
                connection: connection.to_string(),
                code,
                message: transport.decode_error(code),
            }),
        }
    }

    pub fn handle(&self) -> TagHandle {
        self.handle
    }

    pub fn connection(&self) -> &str {
        &self.connection
    }

    /// 发起读取；返回时数据不一定就绪。
    pub fn start_read(&self) -> Result<(), TransportError> {
        self.check(self.transport.read(self.handle))
    }

    pub fn start_write(&self) -> Result<(), TransportError> {
        self.check(self.transport.write(self.handle))
    }

    pub fn status(&self) -> TagStatus {
        self.transport.status(self.handle)
    }

    pub fn status_error(&self, code: i32) -> TransportError {
        TransportError::Status {
            handle: self.handle,
            code,
            message: self.transport.decode_error(code),
        }
    }

    fn check(&self, status: TagStatus) -> Result<(), TransportError> {
        match status {
            TagStatus::Pending | TagStatus::Ok => Ok(()),
            TagStatus::Error(code) => Err(self.status_error(code)),
        }
    }

    fn buffer_error(&self, code: i32) -> BufferError {
        BufferError {
            code,
            message: self.transport.decode_error(code),
        }
    }
}

impl fmt::Debug for PhysicalTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalTag")
            .field("handle", &self.handle)
            .field("connection", &self.connection)
            .finish()
    }
}

impl Drop for PhysicalTag {
    fn drop(&mut self) {
        debug!("destroying tag {}: {}", self.handle, self.connection);
        self.transport.destroy(self.handle);
    }
}

impl TagBuffer for PhysicalTag {
    fn size(&self) -> Result<usize, BufferError> {
        self.transport.size(self.handle).map_err(|c| self.buffer_error(c))
    }

    fn get_bit(&self, bit_offset: usize) -> Result<bool, BufferError> {
        self.transport
            .get_bit(self.handle, bit_offset)
            .map_err(|c| self.buffer_error(c))
    }

    fn set_bit(&self, bit_offset: usize, value: bool) -> Result<(), BufferError> {
        self.transport
            .set_bit(self.handle, bit_offset, value)
            .map_err(|c| self.buffer_error(c))
    }

    fn get_scalar(&self, offset: usize, ty: ScalarType) -> Result<Scalar, BufferError> {
        self.transport
            .get_scalar(self.handle, offset, ty)
            .map_err(|c| self.buffer_error(c))
    }

    fn set_scalar(&self, offset: usize, value: Scalar) -> Result<(), BufferError> {
        self.transport
            .set_scalar(self.handle, offset, value)
            .map_err(|c| self.buffer_error(c))
    }

    fn get_raw_bytes(&self, offset: usize, len: usize) -> Result<Vec<u8>, BufferError> {
        self.transport
            .get_raw_bytes(self.handle, offset, len)
            .map_err(|c| self.buffer_error(c))
    }

    fn set_raw_bytes(&self, offset: usize, bytes: &[u8]) -> Result<(), BufferError> {
        self.transport
            .set_raw_bytes(self.handle, offset, bytes)
            .map_err(|c| self.buffer_error(c))
    }

    fn get_string(&self, offset: usize) -> Result<String, BufferError> {
        self.transport
            .get_string(self.handle, offset)
            .map_err(|c| self.buffer_error(c))
    }

    fn set_string(&self, offset: usize, value: &str) -> Result<(), BufferError> {
        self.transport
            .set_string(self.handle, offset, value)
            .map_err(|c| self.buffer_error(c))
    }
}
