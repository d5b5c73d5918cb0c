//! Transport traits between a device session and its gateway.
//!
//! The wire encoding is up to the implementation; the session only relies on
//! these operations and on `ConnError::Rejected` meaning "the gateway refused
//! this identity".

use crate::{DeviceIdentity, Invocation, InvocationReply, Telemetry};
use async_trait::async_trait;
use std::sync::Arc;

/// Error type for connection operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnError {
    #[error("connection closed")]
    Closed,
    #[error("gateway unreachable: {0}")]
    Unreachable(String),
    #[error("rejected by gateway: {0}")]
    Rejected(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("receive failed: {0}")]
    ReceiveFailed(String),
    #[error("timeout")]
    Timeout,
    #[error("io error: {0}")]
    Io(String),
    #[error("other error: {0}")]
    Other(String),
}

impl From<std::io::Error> for ConnError {
    fn from(e: std::io::Error) -> Self {
        ConnError::Io(e.to_string())
    }
}

// =============================================================================
// Uplink: Device -> Gateway
// =============================================================================

/// Device-side transmitter.
#[async_trait]
pub trait GatewayTx: Send + Sync {
    /// Registers the identity with the gateway.
    /// Returns `ConnError::Rejected` if the gateway refuses it.
    async fn register(&self, identity: &DeviceIdentity) -> Result<(), ConnError>;

    /// Announces the device as online.
    async fn online(&self, identity: &DeviceIdentity) -> Result<(), ConnError>;

    /// Announces the device as offline.
    async fn offline(&self, identity: &DeviceIdentity) -> Result<(), ConnError>;

    /// Sends a property or event report.
    async fn send_telemetry(&self, report: &Telemetry) -> Result<(), ConnError>;

    /// Sends the result of an invocation.
    async fn send_reply(&self, reply: &InvocationReply) -> Result<(), ConnError>;

    /// Closes the uplink.
    async fn close(&self) -> Result<(), ConnError>;
}

// =============================================================================
// Downlink: Gateway -> Device
// =============================================================================

/// Device-side receiver.
#[async_trait]
pub trait GatewayRx: Send + Sync {
    /// Receives the next invocation from the gateway.
    /// Returns Ok(None) when the connection is closed normally.
    async fn recv_invocation(&self) -> Result<Option<Invocation>, ConnError>;
}

/// A device-side connection (sends uplink, receives downlink).
pub trait GatewayConn: GatewayTx + GatewayRx {}
impl<T: GatewayTx + GatewayRx> GatewayConn for T {}

/// Opens connections to a gateway.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, identity: &DeviceIdentity) -> Result<Arc<dyn GatewayConn>, ConnError>;
}
