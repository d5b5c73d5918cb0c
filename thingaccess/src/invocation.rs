//! Gateway-initiated operations on a device.

use crate::{Params, ThingResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Kind of operation the gateway can invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    GetProperties,
    SetProperties,
    CallService,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::GetProperties => "getProperties",
            OperationKind::SetProperties => "setProperties",
            OperationKind::CallService => "callService",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An operation with its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum Operation {
    GetProperties { keys: Vec<String> },
    SetProperties { properties: Params },
    CallService { name: String, args: Params },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::GetProperties { .. } => OperationKind::GetProperties,
            Operation::SetProperties { .. } => OperationKind::SetProperties,
            Operation::CallService { .. } => OperationKind::CallService,
        }
    }
}

/// Inbound request as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    /// Correlation id echoed in the reply.
    pub id: String,

    #[serde(flatten)]
    pub operation: Operation,

    /// Time the gateway is willing to wait, in milliseconds.
    #[serde(rename = "timeoutMs", default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Invocation {
    /// Creates an invocation with a fresh correlation id.
    pub fn new(operation: Operation) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation,
            timeout_ms: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }
}

/// Result sent back for an invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationReply {
    pub id: String,
    pub result: ThingResult,
}

/// An invocation accepted by the router and awaiting its result.
#[derive(Debug, Clone)]
pub struct PendingInvocation {
    pub id: String,
    pub operation: Operation,
    pub deadline: Instant,
}

/// Upper bound applied when a requested timeout overflows the clock.
const MAX_INVOCATION_TIMEOUT: Duration = Duration::from_secs(86400 * 365);

impl PendingInvocation {
    /// Stamps the deadline from the invocation's timeout, or `default_timeout`.
    pub fn accept(invocation: Invocation, default_timeout: Duration) -> Self {
        let timeout = invocation
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(default_timeout);
        let now = Instant::now();
        // Clamp absurd timeouts instead of overflowing the clock.
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + MAX_INVOCATION_TIMEOUT);
        Self {
            id: invocation.id,
            operation: invocation.operation,
            deadline,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }

    /// Builds the reply for this invocation.
    pub fn reply(&self, result: ThingResult) -> InvocationReply {
        InvocationReply {
            id: self.id.clone(),
            result,
        }
    }
}

#[cfg(test)]
mod invocation_tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_kind_names() {
        assert_eq!(OperationKind::GetProperties.to_string(), "getProperties");
        assert_eq!(OperationKind::SetProperties.to_string(), "setProperties");
        assert_eq!(OperationKind::CallService.to_string(), "callService");
    }

    #[test]
    fn test_with_timeout_saturates() {
        let op = || Operation::GetProperties { keys: Vec::new() };
        let inv = Invocation::new(op()).with_timeout(Duration::from_millis(1500));
        assert_eq!(inv.timeout_ms, Some(1500));

        let inv = Invocation::new(op()).with_timeout(Duration::MAX);
        assert_eq!(inv.timeout_ms, Some(u64::MAX));
    }

    #[tokio::test]
    async fn test_accept_clamps_huge_timeout() {
        let inv = Invocation::new(Operation::GetProperties { keys: Vec::new() })
            .with_timeout(Duration::MAX);
        let before = Instant::now();
        let pending = PendingInvocation::accept(inv, Duration::from_secs(10));
        assert!(pending.deadline > before + Duration::from_secs(86400));
    }

    #[test]
    fn test_invocation_json_shape() {
        let inv = Invocation {
            id: "42".to_string(),
            operation: Operation::GetProperties {
                keys: vec!["temperature".to_string()],
            },
            timeout_ms: Some(500),
        };
        let value = serde_json::to_value(&inv).unwrap();
        assert_eq!(
            value,
            json!({"id": "42", "method": "getProperties", "keys": ["temperature"], "timeoutMs": 500})
        );

        let parsed: Invocation = serde_json::from_value(json!({
            "id": "7",
            "method": "callService",
            "name": "reboot",
            "args": {"delay": 3}
        }))
        .unwrap();
        assert_eq!(parsed.operation.kind(), OperationKind::CallService);
        assert!(parsed.timeout_ms.is_none());
    }

    #[test]
    fn test_invocation_ids_are_unique() {
        let a = Invocation::new(Operation::GetProperties { keys: vec![] });
        let b = Invocation::new(Operation::GetProperties { keys: vec![] });
        assert_ne!(a.id, b.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_deadline() {
        let inv = Invocation::new(Operation::GetProperties { keys: vec![] })
            .with_timeout(Duration::from_millis(250));
        let start = Instant::now();
        let pending = PendingInvocation::accept(inv, Duration::from_secs(10));
        assert_eq!(pending.deadline - start, Duration::from_millis(250));

        let inv = Invocation::new(Operation::GetProperties { keys: vec![] });
        let pending = PendingInvocation::accept(inv, Duration::from_secs(10));
        assert_eq!(pending.deadline - start, Duration::from_secs(10));
    }
}
