//! Host/VM link: the channel between a kernel and its outer VM process.
//!
//! The link is shared by every kernel of one VM process and is never owned by
//! a kernel. Its contract with the kernel is request/response plus a
//! disconnect notification; the wire shape is the [`LinkRequest`] /
//! [`LinkResponse`] pair, serialisable with serde for transports that cross a
//! process boundary.

pub mod channel;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::Value;
use crate::types::KernelId;

pub use channel::{ChannelLink, Envelope, LinkEndpoint};

/// Failures on the link. They are local to the call that used the link.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    /// The outer VM process is gone or the link was closed.
    #[error("vm link disconnected")]
    Disconnected,
    /// No response arrived in time.
    #[error("vm link request timed out after {0:?}")]
    Timeout(Duration),
    /// The outer process answered with an error.
    #[error("vm reported error: {0}")]
    Remote(String),
    /// A response did not match its request.
    #[error("vm link protocol violation: {0}")]
    Protocol(String),
}

/// What a request asks the outer process to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkPayload {
    /// Invoke a host-side method.
    Rpc {
        /// Method name.
        method: String,
        /// JSON parameters.
        params: Value,
    },
    /// Liveness probe.
    Ping,
    /// Kernel lifecycle notification.
    Lifecycle {
        /// New lifecycle state label.
        state: String,
    },
}

/// A request travelling from a kernel to the outer process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRequest {
    /// Correlation identifier echoed by the response.
    pub id: Uuid,
    /// Kernel issuing the request.
    pub kernel: KernelId,
    /// Request body.
    pub payload: LinkPayload,
}

impl LinkRequest {
    /// Build a request with a fresh correlation id.
    pub fn new(kernel: KernelId, payload: LinkPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            kernel,
            payload,
        }
    }

    /// Method invocation request.
    pub fn rpc(kernel: KernelId, method: impl Into<String>, params: Value) -> Self {
        Self::new(
            kernel,
            LinkPayload::Rpc {
                method: method.into(),
                params,
            },
        )
    }

    /// Liveness probe.
    pub fn ping(kernel: KernelId) -> Self {
        Self::new(kernel, LinkPayload::Ping)
    }
}

/// The outer process's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LinkResponse {
    /// Success with a JSON value.
    Ok {
        /// Request id being answered.
        id: Uuid,
        /// Result value.
        value: Value,
    },
    /// Failure with a message.
    Error {
        /// Request id being answered.
        id: Uuid,
        /// Error message.
        message: String,
    },
}

impl LinkResponse {
    /// Successful answer to `request`.
    pub fn ok(request: &LinkRequest, value: Value) -> Self {
        Self::Ok {
            id: request.id,
            value,
        }
    }

    /// Error answer to `request`.
    pub fn error(request: &LinkRequest, message: impl Into<String>) -> Self {
        Self::Error {
            id: request.id,
            message: message.into(),
        }
    }

    /// Request id this answers.
    pub fn id(&self) -> Uuid {
        match self {
            Self::Ok { id, .. } | Self::Error { id, .. } => *id,
        }
    }

    /// Turn the answer into a value or a [`LinkError::Remote`].
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Remote`] for error answers.
    pub fn into_result(self) -> Result<Value, LinkError> {
        match self {
            Self::Ok { value, .. } => Ok(value),
            Self::Error { message, .. } => Err(LinkError::Remote(message)),
        }
    }
}

/// Kernel-side view of the link.
#[async_trait]
pub trait VmLink: Send + Sync {
    /// Identifier of the outer VM process.
    fn vm_id(&self) -> &str;

    /// Whether requests can currently be delivered.
    fn is_connected(&self) -> bool;

    /// Send a request and wait for its response.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Disconnected`] or [`LinkError::Timeout`] when the
    /// exchange cannot complete, [`LinkError::Protocol`] on a mismatched reply.
    async fn request(&self, request: LinkRequest) -> Result<LinkResponse, LinkError>;

    /// Resolve once the link has disconnected.
    async fn closed(&self);
}
