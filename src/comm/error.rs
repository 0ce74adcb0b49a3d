//! 错误分类汇总：各层错误统一映射为 `BridgeError`，并给出对应的采集质量。

use thiserror::Error;

use crate::comm::adapters::transport::TransportError;
use crate::comm::config::ConfigError;
use crate::comm::core::codec::DecodeError;
use crate::comm::core::descriptor::DescriptorError;
use crate::comm::core::layout::DefinitionError;
use crate::comm::core::model::{Quality, ValueId};
use crate::comm::core::optimise::OptimisationError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Optimisation(#[from] OptimisationError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("unknown value id: {0}")]
    UnknownValue(ValueId),

    #[error("unknown poller: {0}")]
    UnknownPoller(String),

    #[error("driver is not initialised: optimisation pass has not run yet")]
    NotInitialised,
}

impl BridgeError {
    pub fn quality(&self) -> Quality {
        match self {
            BridgeError::Transport(TransportError::Timeout { .. }) => Quality::Timeout,
            BridgeError::Transport(_) | BridgeError::Optimisation(_) => Quality::CommError,
            BridgeError::Decode(_) => Quality::DecodeError,
            BridgeError::Definition(_)
            | BridgeError::Descriptor(_)
            | BridgeError::Config(_)
            | BridgeError::UnknownValue(_)
            | BridgeError::UnknownPoller(_)
            | BridgeError::NotInitialised => Quality::ConfigError,
        }
    }
}
