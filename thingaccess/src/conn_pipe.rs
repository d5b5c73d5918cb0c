//! In-memory gateway for testing and local runs.
//!
//! [`new_pipe`] returns a connected pair: the gateway end drives invocations
//! and observes uplink traffic, the device end implements [`GatewayConn`].
//! [`PipeGateway`] hands out such pairs as a [`Connector`] and lets tests
//! inject rejections and transient failures.

use crate::{
    ConnError, Connector, DeviceIdentity, GatewayConn, GatewayRx, GatewayTx, Invocation,
    InvocationReply, Operation, Telemetry, ThingResult,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock, mpsc};

/// Lifecycle notices a device sends to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    Registered(DeviceIdentity),
    Online(DeviceIdentity),
    Offline(DeviceIdentity),
}

/// Creates a connected pair of gateway and device connections.
pub fn new_pipe() -> (PipeGatewayConn, PipeDeviceConn) {
    // Uplink channels (device -> gateway)
    let (control_tx, control_rx) = mpsc::channel(64);
    let (telemetry_tx, telemetry_rx) = mpsc::channel(1024);
    let (replies_tx, replies_rx) = mpsc::channel(256);

    // Downlink channel (gateway -> device)
    let (invocations_tx, invocations_rx) = mpsc::channel(256);

    let shared = Arc::new(RwLock::new(PipeSharedState::default()));

    let gateway = PipeGatewayConn {
        control: Arc::new(Mutex::new(control_rx)),
        telemetry: Arc::new(Mutex::new(telemetry_rx)),
        replies: Arc::new(Mutex::new(replies_rx)),
        invocations: Arc::new(Mutex::new(Some(invocations_tx))),
        shared: shared.clone(),
    };

    let device = PipeDeviceConn {
        control: Mutex::new(Some(control_tx)),
        telemetry: Mutex::new(Some(telemetry_tx)),
        replies: Mutex::new(Some(replies_tx)),
        invocations: Mutex::new(invocations_rx),
        shared,
    };

    (gateway, device)
}

/// State shared by both ends of a pipe.
#[derive(Default)]
struct PipeSharedState {
    gateway_err: Option<String>,
    gateway_closed: bool,
    rejection: Option<String>,
    register_failures: u32,
}

/// Gateway end of a pipe. Cloning yields another handle to the same end.
#[derive(Clone)]
pub struct PipeGatewayConn {
    control: Arc<Mutex<mpsc::Receiver<ControlEvent>>>,
    telemetry: Arc<Mutex<mpsc::Receiver<Telemetry>>>,
    replies: Arc<Mutex<mpsc::Receiver<InvocationReply>>>,
    invocations: Arc<Mutex<Option<mpsc::Sender<Invocation>>>>,
    shared: Arc<RwLock<PipeSharedState>>,
}

impl PipeGatewayConn {
    /// Refuses the next registrations on this pipe with `reason`.
    pub async fn reject(&self, reason: impl Into<String>) {
        self.shared.write().await.rejection = Some(reason.into());
    }

    /// Fails the next `n` registrations with a transient error.
    pub async fn fail_registrations(&self, n: u32) {
        self.shared.write().await.register_failures = n;
    }

    /// Sends an invocation to the device.
    pub async fn send_invocation(&self, invocation: Invocation) -> Result<(), ConnError> {
        let tx = self.invocations.lock().await.clone().ok_or(ConnError::Closed)?;
        tx.send(invocation)
            .await
            .map_err(|e| ConnError::SendFailed(e.to_string()))
    }

    /// Sends `operation` with a fresh correlation id and returns the id.
    pub async fn invoke(&self, operation: Operation) -> Result<String, ConnError> {
        let invocation = Invocation::new(operation);
        let id = invocation.id.clone();
        self.send_invocation(invocation).await?;
        Ok(id)
    }

    /// Invokes `operation` and waits for its reply.
    ///
    /// Replies for other ids received meanwhile are discarded.
    pub async fn call(&self, operation: Operation) -> Result<ThingResult, ConnError> {
        let id = self.invoke(operation).await?;
        loop {
            match self.recv_reply().await? {
                Some(reply) if reply.id == id => return Ok(reply.result),
                Some(_) => continue,
                None => return Err(ConnError::Closed),
            }
        }
    }

    pub async fn recv_control(&self) -> Result<Option<ControlEvent>, ConnError> {
        Ok(self.control.lock().await.recv().await)
    }

    pub async fn recv_telemetry(&self) -> Result<Option<Telemetry>, ConnError> {
        Ok(self.telemetry.lock().await.recv().await)
    }

    /// Returns a report if one is already buffered.
    pub async fn try_recv_telemetry(&self) -> Option<Telemetry> {
        self.telemetry.lock().await.try_recv().ok()
    }

    pub async fn recv_reply(&self) -> Result<Option<InvocationReply>, ConnError> {
        Ok(self.replies.lock().await.recv().await)
    }

    /// Drops the link. With `err` set the device sees a receive failure
    /// instead of a clean end of stream.
    pub async fn disconnect(&self, err: Option<String>) {
        {
            let mut shared = self.shared.write().await;
            if shared.gateway_closed {
                return;
            }
            shared.gateway_closed = true;
            shared.gateway_err = err;
        }
        self.invocations.lock().await.take();
    }
}

/// Device end of a pipe.
pub struct PipeDeviceConn {
    control: Mutex<Option<mpsc::Sender<ControlEvent>>>,
    telemetry: Mutex<Option<mpsc::Sender<Telemetry>>>,
    replies: Mutex<Option<mpsc::Sender<InvocationReply>>>,
    invocations: Mutex<mpsc::Receiver<Invocation>>,
    shared: Arc<RwLock<PipeSharedState>>,
}

impl PipeDeviceConn {
    async fn ensure_open(&self) -> Result<(), ConnError> {
        if self.shared.read().await.gateway_closed {
            Err(ConnError::Closed)
        } else {
            Ok(())
        }
    }

    async fn send_control(&self, event: ControlEvent) -> Result<(), ConnError> {
        self.ensure_open().await?;
        let tx = self.control.lock().await.clone().ok_or(ConnError::Closed)?;
        tx.send(event)
            .await
            .map_err(|e| ConnError::SendFailed(e.to_string()))
    }
}

#[async_trait]
impl GatewayTx for PipeDeviceConn {
    async fn register(&self, identity: &DeviceIdentity) -> Result<(), ConnError> {
        {
            let mut shared = self.shared.write().await;
            if shared.register_failures > 0 {
                shared.register_failures -= 1;
                return Err(ConnError::Unreachable("registration dropped".to_string()));
            }
            if let Some(reason) = &shared.rejection {
                return Err(ConnError::Rejected(reason.clone()));
            }
        }
        self.send_control(ControlEvent::Registered(identity.clone()))
            .await
    }

    async fn online(&self, identity: &DeviceIdentity) -> Result<(), ConnError> {
        self.send_control(ControlEvent::Online(identity.clone()))
            .await
    }

    async fn offline(&self, identity: &DeviceIdentity) -> Result<(), ConnError> {
        self.send_control(ControlEvent::Offline(identity.clone()))
            .await
    }

    async fn send_telemetry(&self, report: &Telemetry) -> Result<(), ConnError> {
        self.ensure_open().await?;
        let tx = self.telemetry.lock().await.clone().ok_or(ConnError::Closed)?;
        tx.send(report.clone())
            .await
            .map_err(|e| ConnError::SendFailed(e.to_string()))
    }

    async fn send_reply(&self, reply: &InvocationReply) -> Result<(), ConnError> {
        self.ensure_open().await?;
        let tx = self.replies.lock().await.clone().ok_or(ConnError::Closed)?;
        tx.send(reply.clone())
            .await
            .map_err(|e| ConnError::SendFailed(e.to_string()))
    }

    async fn close(&self) -> Result<(), ConnError> {
        self.control.lock().await.take();
        self.telemetry.lock().await.take();
        self.replies.lock().await.take();
        Ok(())
    }
}

#[async_trait]
impl GatewayRx for PipeDeviceConn {
    async fn recv_invocation(&self) -> Result<Option<Invocation>, ConnError> {
        let mut rx = self.invocations.lock().await;
        match rx.recv().await {
            Some(invocation) => Ok(Some(invocation)),
            None => {
                let shared = self.shared.read().await;
                if let Some(ref err) = shared.gateway_err {
                    Err(ConnError::ReceiveFailed(err.clone()))
                } else {
                    Ok(None)
                }
            }
        }
    }
}

#[derive(Default)]
struct GatewayInner {
    devices: HashMap<DeviceIdentity, PipeGatewayConn>,
    rejected: HashMap<DeviceIdentity, String>,
    connect_failures: u32,
    register_failures: u32,
    feed: Option<mpsc::UnboundedSender<(DeviceIdentity, PipeGatewayConn)>>,
}

/// In-memory gateway accepting any number of devices.
///
/// Each `connect` opens a fresh pipe; the gateway end of the latest pipe per
/// identity is available through [`PipeGateway::device`].
#[derive(Clone, Default)]
pub struct PipeGateway {
    inner: Arc<parking_lot::Mutex<GatewayInner>>,
    connected: Arc<Notify>,
}

impl PipeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a gateway that also publishes every new connection.
    pub fn with_feed() -> (Self, mpsc::UnboundedReceiver<(DeviceIdentity, PipeGatewayConn)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let gateway = Self::new();
        gateway.inner.lock().feed = Some(tx);
        (gateway, rx)
    }

    /// Rejects registrations from `identity` with `reason`.
    pub fn reject(&self, identity: &DeviceIdentity, reason: impl Into<String>) {
        self.inner
            .lock()
            .rejected
            .insert(identity.clone(), reason.into());
    }

    /// Fails the next `n` connection attempts.
    pub fn fail_connects(&self, n: u32) {
        self.inner.lock().connect_failures = n;
    }

    /// Fails the first `n` registrations on the next connection with a
    /// transient error.
    pub fn fail_registrations(&self, n: u32) {
        self.inner.lock().register_failures = n;
    }

    /// Returns the gateway end for `identity`'s latest connection.
    pub fn device(&self, identity: &DeviceIdentity) -> Option<PipeGatewayConn> {
        self.inner.lock().devices.get(identity).cloned()
    }

    /// Waits until `identity` has connected.
    pub async fn wait_device(&self, identity: &DeviceIdentity) -> PipeGatewayConn {
        loop {
            let notified = self.connected.notified();
            if let Some(conn) = self.device(identity) {
                return conn;
            }
            notified.await;
        }
    }

    /// Returns every identity that has connected so far.
    pub fn connected(&self) -> Vec<DeviceIdentity> {
        self.inner.lock().devices.keys().cloned().collect()
    }
}

#[async_trait]
impl Connector for PipeGateway {
    async fn connect(&self, identity: &DeviceIdentity) -> Result<Arc<dyn GatewayConn>, ConnError> {
        let (gateway, device) = new_pipe();
        let (rejection, register_failures) = {
            let mut inner = self.inner.lock();
            if inner.connect_failures > 0 {
                inner.connect_failures -= 1;
                return Err(ConnError::Unreachable("gateway refused connection".to_string()));
            }
            let register_failures = std::mem::take(&mut inner.register_failures);
            (inner.rejected.get(identity).cloned(), register_failures)
        };

        {
            let mut shared = gateway.shared.write().await;
            shared.rejection = rejection;
            shared.register_failures = register_failures;
        }

        {
            let mut inner = self.inner.lock();
            inner.devices.insert(identity.clone(), gateway.clone());
            if let Some(feed) = &inner.feed {
                let _ = feed.send((identity.clone(), gateway));
            }
        }
        self.connected.notify_waiters();
        Ok(Arc::new(device))
    }
}

#[cfg(test)]
mod conn_pipe_tests {
    use super::*;
    use serde_json::json;

    fn lamp() -> DeviceIdentity {
        DeviceIdentity::new("pk", "lamp", "secret")
    }

    #[tokio::test]
    async fn test_pipe_uplink() {
        let (gateway, device) = new_pipe();
        device.register(&lamp()).await.unwrap();
        device
            .send_telemetry(&Telemetry::event("boot", Default::default()))
            .await
            .unwrap();

        assert_eq!(
            gateway.recv_control().await.unwrap(),
            Some(ControlEvent::Registered(lamp()))
        );
        let report = gateway.recv_telemetry().await.unwrap().unwrap();
        assert!(matches!(report, Telemetry::Event { ref name, .. } if name == "boot"));
        assert!(gateway.try_recv_telemetry().await.is_none());
    }

    #[tokio::test]
    async fn test_pipe_downlink() {
        let (gateway, device) = new_pipe();
        let id = gateway
            .invoke(Operation::GetProperties {
                keys: vec!["temperature".to_string()],
            })
            .await
            .unwrap();

        let invocation = device.recv_invocation().await.unwrap().unwrap();
        assert_eq!(invocation.id, id);

        let reply = InvocationReply {
            id: id.clone(),
            result: ThingResult::success(json!({"temperature": 41}).as_object().cloned().unwrap()),
        };
        device.send_reply(&reply).await.unwrap();
        assert_eq!(gateway.recv_reply().await.unwrap(), Some(reply));
    }

    #[tokio::test]
    async fn test_pipe_rejection() {
        let (gateway, device) = new_pipe();
        gateway.reject("bad secret").await;
        let err = device.register(&lamp()).await.unwrap_err();
        assert!(matches!(err, ConnError::Rejected(ref m) if m == "bad secret"));
    }

    #[tokio::test]
    async fn test_pipe_transient_registration_failure() {
        let (gateway, device) = new_pipe();
        gateway.fail_registrations(1).await;
        assert!(matches!(
            device.register(&lamp()).await,
            Err(ConnError::Unreachable(_))
        ));
        device.register(&lamp()).await.unwrap();
    }

    #[tokio::test]
    async fn test_pipe_disconnect() {
        let (gateway, device) = new_pipe();
        gateway.disconnect(Some("link down".to_string())).await;

        let err = device.recv_invocation().await.unwrap_err();
        assert!(matches!(err, ConnError::ReceiveFailed(ref m) if m == "link down"));
        assert!(matches!(
            device.send_telemetry(&Telemetry::event("x", Default::default())).await,
            Err(ConnError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_pipe_clean_disconnect() {
        let (gateway, device) = new_pipe();
        gateway.disconnect(None).await;
        assert!(device.recv_invocation().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_device_close_ends_uplink() {
        let (gateway, device) = new_pipe();
        device.close().await.unwrap();
        assert!(gateway.recv_control().await.unwrap().is_none());
        assert!(matches!(
            device.online(&lamp()).await,
            Err(ConnError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_gateway_connector() {
        let (gateway, mut feed) = PipeGateway::with_feed();
        gateway.fail_connects(1);
        assert!(gateway.connect(&lamp()).await.is_err());

        let waiter = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.wait_device(&lamp()).await })
        };
        let conn = gateway.connect(&lamp()).await.unwrap();
        let gateway_end = waiter.await.unwrap();

        conn.online(&lamp()).await.unwrap();
        assert_eq!(
            gateway_end.recv_control().await.unwrap(),
            Some(ControlEvent::Online(lamp()))
        );
        assert_eq!(gateway.connected(), vec![lamp()]);
        let (id, _) = feed.recv().await.unwrap();
        assert_eq!(id, lamp());
    }

    #[tokio::test]
    async fn test_gateway_rejects_identity() {
        let gateway = PipeGateway::new();
        gateway.reject(&lamp(), "unknown device");
        let conn = gateway.connect(&lamp()).await.unwrap();
        assert!(matches!(
            conn.register(&lamp()).await,
            Err(ConnError::Rejected(_))
        ));
    }
}
