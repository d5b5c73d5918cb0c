//! Property and event reports from device to gateway.
//!
//! Reports go through a bounded per-session queue drained by a sender task,
//! so a slow uplink never blocks the driver. When the queue is full the
//! oldest report is dropped: a device shadow wants fresh state more than it
//! wants every sample.

use crate::logger::Logger;
use crate::state::StateCell;
use crate::{
    GatewayConn, GatewayTx, Params, Result, SessionError, SessionState, TelemetryOverflow,
    log_debug, log_warn,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Default number of reports buffered per session.
pub const DEFAULT_TELEMETRY_CAPACITY: usize = 128;

/// A report pushed upward by the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Telemetry {
    Properties {
        properties: Params,
        time: DateTime<Utc>,
    },
    Event {
        name: String,
        payload: Params,
        time: DateTime<Utc>,
    },
}

impl Telemetry {
    /// Creates a property report stamped with the current time.
    pub fn properties(properties: Params) -> Self {
        Telemetry::Properties {
            properties,
            time: Utc::now(),
        }
    }

    /// Creates an event report stamped with the current time.
    pub fn event(name: impl Into<String>, payload: Params) -> Self {
        Telemetry::Event {
            name: name.into(),
            payload,
            time: Utc::now(),
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        match self {
            Telemetry::Properties { time, .. } | Telemetry::Event { time, .. } => *time,
        }
    }
}

#[derive(Default)]
struct QueueInner {
    items: VecDeque<Telemetry>,
    /// Drops not yet surfaced to a caller.
    unreported_drops: u64,
    total_drops: u64,
}

/// Bounded FIFO between reporters and the sender task.
pub(crate) struct TelemetryQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

impl TelemetryQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueues `report`, evicting the oldest entry if full.
    ///
    /// Returns the overflow caused by earlier pushes, if any.
    pub(crate) fn push(&self, report: Telemetry) -> Option<TelemetryOverflow> {
        let overflow = {
            let mut inner = self.inner.lock();
            let earlier = std::mem::take(&mut inner.unreported_drops);
            if inner.items.len() >= self.capacity {
                inner.items.pop_front();
                inner.unreported_drops += 1;
                inner.total_drops += 1;
            }
            inner.items.push_back(report);
            (earlier > 0).then_some(TelemetryOverflow { dropped: earlier })
        };
        self.notify.notify_one();
        overflow
    }

    pub(crate) fn pop(&self) -> Option<Telemetry> {
        self.inner.lock().items.pop_front()
    }

    /// Waits for the next report. Returns None once `cancel` fires.
    pub(crate) async fn next(&self, cancel: &CancellationToken) -> Option<Telemetry> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(report) = self.pop() {
                return Some(report);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub(crate) fn total_drops(&self) -> u64 {
        self.inner.lock().total_drops
    }

    pub(crate) fn clear(&self) {
        self.inner.lock().items.clear();
    }
}

/// Handle for pushing telemetry on a session.
///
/// Cheap to clone; reports from all clones share one FIFO.
#[derive(Clone)]
pub struct Reporter {
    state: StateCell,
    queue: Arc<TelemetryQueue>,
}

impl Reporter {
    pub(crate) fn new(state: StateCell, queue: Arc<TelemetryQueue>) -> Self {
        Self { state, queue }
    }

    /// Queues a property snapshot.
    ///
    /// `Ok(Some(overflow))` means this report was queued but earlier ones
    /// were dropped since the last call.
    pub fn report_properties(&self, properties: Params) -> Result<Option<TelemetryOverflow>> {
        self.enqueue("report_properties", Telemetry::properties(properties))
    }

    /// Queues an event.
    pub fn report_event(
        &self,
        name: impl Into<String>,
        payload: Params,
    ) -> Result<Option<TelemetryOverflow>> {
        self.enqueue("report_event", Telemetry::event(name, payload))
    }

    /// Returns the current session state.
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Returns the number of reports waiting to be sent.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Returns how many reports were dropped over the session's lifetime.
    pub fn dropped(&self) -> u64 {
        self.queue.total_drops()
    }

    fn enqueue(&self, op: &'static str, report: Telemetry) -> Result<Option<TelemetryOverflow>> {
        let state = self.state.get();
        if state != SessionState::Online {
            return Err(SessionError::invalid_state(op, state));
        }
        Ok(self.queue.push(report))
    }
}

/// Drains the queue into the transport in order until cancelled.
///
/// A failed send while online fails the session with `ConnectionLost`.
pub(crate) async fn run_sender(
    queue: Arc<TelemetryQueue>,
    conn: Arc<dyn GatewayConn>,
    state: StateCell,
    cancel: CancellationToken,
    logger: Arc<dyn Logger>,
) {
    while let Some(report) = queue.next(&cancel).await {
        let sent = tokio::select! {
            _ = cancel.cancelled() => break,
            sent = conn.send_telemetry(&report) => sent,
        };
        if let Err(e) = sent {
            if state.fail_from(
                SessionState::Online,
                SessionError::ConnectionLost(format!("telemetry send: {}", e)),
            ) {
                log_warn!(logger, "telemetry send failed, session failed: {}", e);
            }
            break;
        }
    }
    log_debug!(logger, "telemetry sender stopped");
}
