//! Omron EIP 桥接模块：core（纯逻辑）/ adapters（传输与文件）/ usecase（注册、合并、轮询）。

pub mod adapters;
pub mod config;
pub mod core;
pub mod error;
pub mod usecase;

pub use adapters::transport::mock::MockTransport;
pub use adapters::transport::{PhysicalTag, TagTransport};
pub use config::{DriverConfigV1, PollerConfig};
pub use error::BridgeError;
pub use usecase::driver::EipDriver;
