//! Device session lifecycle.
//!
//! A [`Session`] drives one device through
//! `Created -> SetUp -> Registered -> Online -> Closing -> Closed`. While
//! online it owns a dispatcher task, a telemetry sender task and any periodic
//! ticks spawned by the driver; `cleanup` stops them all.

use crate::dispatch::Dispatcher;
use crate::logger::{self, Logger};
use crate::state::StateCell;
use crate::telemetry::{self, DEFAULT_TELEMETRY_CAPACITY, TelemetryQueue};
use crate::{
    CallbackRegistry, ConnError, Connector, DeviceIdentity, GatewayConn, GatewayTx, Params,
    Reporter, Result, SessionError, SessionState, TelemetryOverflow, log_debug, log_error,
    log_info, log_warn,
};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Timeouts and limits for a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on opening the transport in `setup`.
    pub connect_timeout: Duration,
    /// Bound on each of the register and online handshakes.
    pub handshake_timeout: Duration,
    /// Deadline for invocations that carry no timeout of their own.
    pub invocation_timeout: Duration,
    /// Bound on sending a reply or a teardown notice.
    pub send_timeout: Duration,
    pub telemetry_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            invocation_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(5),
            telemetry_capacity: DEFAULT_TELEMETRY_CAPACITY,
        }
    }
}

/// A device's connection to the gateway and the state it exposes.
///
/// `S` is the driver's per-device state. Handlers and periodic ticks get it
/// as `&mut S`; nothing else touches it.
pub struct Session<S> {
    identity: DeviceIdentity,
    registry: Arc<CallbackRegistry<S>>,
    device: Arc<Mutex<S>>,
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    logger: Arc<dyn Logger>,

    state: StateCell,
    queue: Arc<TelemetryQueue>,
    conn: Option<Arc<dyn GatewayConn>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl<S: Send + 'static> Session<S> {
    /// Creates a session in `Created`. Nothing is connected yet.
    pub fn new(
        identity: DeviceIdentity,
        registry: CallbackRegistry<S>,
        device: S,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let config = SessionConfig::default();
        let logger = logger::for_thing(&identity, logger::default_logger());
        Self {
            identity,
            registry: Arc::new(registry),
            device: Arc::new(Mutex::new(device)),
            connector,
            queue: Arc::new(TelemetryQueue::new(config.telemetry_capacity)),
            config,
            logger,
            state: StateCell::new(),
            conn: None,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.queue = Arc::new(TelemetryQueue::new(config.telemetry_capacity));
        self.config = config;
        self
    }

    /// Replaces the log sink. Messages are still prefixed with the thing id.
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger::for_thing(&self.identity, logger);
        self
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Returns the error that moved the session to `Failed`, if any.
    pub fn last_error(&self) -> Option<SessionError> {
        self.state.last_error()
    }

    /// Returns a handle for reporting telemetry from other tasks.
    pub fn reporter(&self) -> Reporter {
        Reporter::new(self.state.clone(), self.queue.clone())
    }

    pub fn report_properties(&self, properties: Params) -> Result<Option<TelemetryOverflow>> {
        self.reporter().report_properties(properties)
    }

    pub fn report_event(
        &self,
        name: impl Into<String>,
        payload: Params,
    ) -> Result<Option<TelemetryOverflow>> {
        self.reporter().report_event(name, payload)
    }

    /// Runs `f` with the device state locked.
    pub fn with_device<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let mut device = self.device.lock();
        f(&mut device)
    }

    /// Validates the identity and opens the transport.
    ///
    /// On failure the session stays in `Created` and `setup` may be called
    /// again.
    pub async fn setup(&mut self) -> Result<()> {
        let state = self.state.get();
        if state != SessionState::Created {
            return Err(SessionError::invalid_state("setup", state));
        }
        self.identity
            .validate()
            .map_err(SessionError::InvalidIdentity)?;

        let connected =
            tokio::time::timeout(self.config.connect_timeout, self.connector.connect(&self.identity))
                .await;
        let conn = match connected {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                log_debug!(self.logger, "connect failed: {}", e);
                return Err(SessionError::Transport(e.to_string()));
            }
            Err(_) => {
                log_debug!(self.logger, "connect timed out");
                return Err(SessionError::Transport(ConnError::Timeout.to_string()));
            }
        };

        self.conn = Some(conn);
        self.state.transition(SessionState::SetUp);
        log_debug!(self.logger, "transport established");
        Ok(())
    }

    /// Registers the identity and announces the device online.
    ///
    /// A rejection fails the session for good. Any other transport failure
    /// leaves it in `SetUp` so the step can be retried.
    pub async fn register_and_online(&mut self) -> Result<()> {
        let state = self.state.get();
        if state != SessionState::SetUp {
            return Err(SessionError::invalid_state("register_and_online", state));
        }
        let conn = match &self.conn {
            Some(conn) => conn.clone(),
            None => return Err(SessionError::invalid_state("register_and_online", state)),
        };

        if let Err(e) = self.handshake(conn.register(&self.identity)).await {
            return Err(self.handshake_failed("register", e));
        }
        self.state.transition(SessionState::Registered);

        if let Err(e) = self.handshake(conn.online(&self.identity)).await {
            return Err(self.handshake_failed("online", e));
        }
        if self.state.transition(SessionState::Online).is_none() {
            let state = self.state.get();
            return Err(SessionError::invalid_state("register_and_online", state));
        }

        self.spawn_online_tasks(conn);
        log_info!(self.logger, "online");
        Ok(())
    }

    /// Runs `tick` every `period` while the session is online.
    ///
    /// The task stops when the session leaves `Online` or is cleaned up.
    pub fn spawn_periodic<F>(&mut self, period: Duration, mut tick: F) -> Result<()>
    where
        F: FnMut(&mut S, &Reporter) + Send + 'static,
    {
        let state = self.state.get();
        if state != SessionState::Online {
            return Err(SessionError::invalid_state("spawn_periodic", state));
        }

        let period = period.max(Duration::from_millis(1));
        let device = self.device.clone();
        let reporter = self.reporter();
        let cancel = self.cancel.clone();
        let logger = self.logger.clone();

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if reporter.state() != SessionState::Online {
                    break;
                }
                {
                    let mut device = device.lock();
                    tick(&mut device, &reporter);
                }
            }
            log_debug!(logger, "periodic task stopped");
        }));
        Ok(())
    }

    /// Tears the session down from any state and ends in `Closed`.
    ///
    /// Pending invocations are answered with `"session closed"`. Calling it
    /// again is a no-op.
    pub async fn cleanup(&mut self) {
        let prev = self.state.get();
        if prev == SessionState::Closed {
            return;
        }
        self.state.transition(SessionState::Closing);

        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                if e.is_panic() {
                    log_error!(self.logger, "session task panicked: {}", e);
                }
            }
        }
        self.queue.clear();

        if let Some(conn) = self.conn.take() {
            let send_timeout = self.config.send_timeout;
            if prev == SessionState::Online {
                match tokio::time::timeout(send_timeout, conn.offline(&self.identity)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log_warn!(self.logger, "offline notice failed: {}", e),
                    Err(_) => log_warn!(self.logger, "offline notice timed out"),
                }
            }
            match tokio::time::timeout(send_timeout, conn.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log_warn!(self.logger, "close failed: {}", e),
                Err(_) => log_warn!(self.logger, "close timed out"),
            }
        }

        self.state.transition(SessionState::Closed);
        log_info!(self.logger, "closed (was {})", prev);
    }

    /// Marks the session failed without touching the transport.
    pub(crate) fn abandon(&self, err: SessionError) -> bool {
        self.state.fail(err)
    }

    pub(crate) fn state_cell(&self) -> StateCell {
        self.state.clone()
    }

    pub(crate) fn logger(&self) -> Arc<dyn Logger> {
        self.logger.clone()
    }

    async fn handshake(
        &self,
        step: impl Future<Output = std::result::Result<(), ConnError>>,
    ) -> std::result::Result<(), ConnError> {
        tokio::time::timeout(self.config.handshake_timeout, step)
            .await
            .unwrap_or(Err(ConnError::Timeout))
    }

    fn handshake_failed(&self, step: &str, err: ConnError) -> SessionError {
        match err {
            ConnError::Rejected(reason) => {
                let err = SessionError::Registration(reason);
                self.state.fail(err.clone());
                log_error!(self.logger, "{} rejected: {}", step, err);
                err
            }
            other => {
                self.state
                    .compare_and_set(SessionState::Registered, SessionState::SetUp);
                log_debug!(self.logger, "{} failed: {}", step, other);
                SessionError::Transport(other.to_string())
            }
        }
    }

    fn spawn_online_tasks(&mut self, conn: Arc<dyn GatewayConn>) {
        let dispatcher = Dispatcher {
            registry: self.registry.clone(),
            device: self.device.clone(),
            conn: conn.clone(),
            state: self.state.clone(),
            invocation_timeout: self.config.invocation_timeout,
            send_timeout: self.config.send_timeout,
            logger: self.logger.clone(),
        };
        self.tasks
            .push(tokio::spawn(dispatcher.run(self.cancel.clone())));
        self.tasks.push(tokio::spawn(telemetry::run_sender(
            self.queue.clone(),
            conn,
            self.state.clone(),
            self.cancel.clone(),
            self.logger.clone(),
        )));
    }
}

impl<S> Drop for Session<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod session_tests {
    use super::*;
    use crate::conn_pipe::PipeGateway;
    use crate::logger::NopLogger;
    use crate::ThingResult;

    fn session(gateway: &PipeGateway, device_name: &str) -> Session<u32> {
        let registry = CallbackRegistry::new()
            .on_get_properties(|count: &mut u32, _: &[String]| {
                *count += 1;
                ThingResult::ok()
            });
        Session::new(
            DeviceIdentity::new("pk", device_name, "secret"),
            registry,
            0,
            Arc::new(gateway.clone()),
        )
        .with_logger(Arc::new(NopLogger))
    }

    #[tokio::test]
    async fn test_setup_then_online() {
        let gateway = PipeGateway::new();
        let mut s = session(&gateway, "lamp");
        assert_eq!(s.state(), SessionState::Created);

        s.setup().await.unwrap();
        assert_eq!(s.state(), SessionState::SetUp);
        s.register_and_online().await.unwrap();
        assert_eq!(s.state(), SessionState::Online);

        s.cleanup().await;
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_register_before_setup_is_invalid() {
        let gateway = PipeGateway::new();
        let mut s = session(&gateway, "lamp");
        let err = s.register_and_online().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidState {
                op: "register_and_online",
                state: SessionState::Created
            }
        ));
        assert_eq!(s.state(), SessionState::Created);
    }

    #[tokio::test]
    async fn test_setup_twice_is_invalid() {
        let gateway = PipeGateway::new();
        let mut s = session(&gateway, "lamp");
        s.setup().await.unwrap();
        assert!(matches!(
            s.setup().await,
            Err(SessionError::InvalidState { op: "setup", .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_identity_stays_created() {
        let gateway = PipeGateway::new();
        let mut s = session(&gateway, "");
        assert!(matches!(
            s.setup().await,
            Err(SessionError::InvalidIdentity(_))
        ));
        assert_eq!(s.state(), SessionState::Created);
        assert!(gateway.connected().is_empty());
    }

    #[tokio::test]
    async fn test_connect_failure_is_retryable() {
        let gateway = PipeGateway::new();
        gateway.fail_connects(1);
        let mut s = session(&gateway, "lamp");

        let err = s.setup().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(s.state(), SessionState::Created);

        s.setup().await.unwrap();
        assert_eq!(s.state(), SessionState::SetUp);
    }

    #[tokio::test]
    async fn test_rejection_fails_session() {
        let gateway = PipeGateway::new();
        let id = DeviceIdentity::new("pk", "lamp", "secret");
        gateway.reject(&id, "unknown device");
        let mut s = session(&gateway, "lamp");

        s.setup().await.unwrap();
        let err = s.register_and_online().await.unwrap_err();
        assert!(matches!(err, SessionError::Registration(ref m) if m == "unknown device"));
        assert_eq!(s.state(), SessionState::Failed);
        assert!(matches!(s.last_error(), Some(SessionError::Registration(_))));

        // Failed is absorbing for protocol operations.
        assert!(s.register_and_online().await.is_err());
        s.cleanup().await;
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_transient_registration_failure_reverts_to_set_up() {
        let gateway = PipeGateway::new();
        gateway.fail_registrations(1);
        let mut s = session(&gateway, "lamp");
        s.setup().await.unwrap();

        let err = s.register_and_online().await.unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));
        assert_eq!(s.state(), SessionState::SetUp);

        s.register_and_online().await.unwrap();
        assert_eq!(s.state(), SessionState::Online);
        s.cleanup().await;
    }

    #[tokio::test]
    async fn test_spawn_periodic_requires_online() {
        let gateway = PipeGateway::new();
        let mut s = session(&gateway, "lamp");
        let err = s.spawn_periodic(Duration::from_secs(1), |_, _| {}).unwrap_err();
        assert!(matches!(err, SessionError::InvalidState { op: "spawn_periodic", .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_reports_until_cleanup() {
        let gateway = PipeGateway::new();
        let mut s = session(&gateway, "lamp");
        s.setup().await.unwrap();
        s.register_and_online().await.unwrap();
        let conn = gateway.device(s.identity()).unwrap();

        s.spawn_periodic(Duration::from_secs(2), |count, reporter| {
            *count += 1;
            let mut props = Params::new();
            props.insert("count".to_string(), (*count).into());
            let _ = reporter.report_properties(props);
        })
        .unwrap();

        for expected in 1..=3u32 {
            let report = conn.recv_telemetry().await.unwrap().unwrap();
            match report {
                crate::Telemetry::Properties { properties, .. } => {
                    assert_eq!(properties["count"], expected)
                }
                other => panic!("unexpected report {:?}", other),
            }
        }

        s.cleanup().await;
        let ticks = s.with_device(|count| *count);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(s.with_device(|count| *count), ticks);
    }

    #[tokio::test]
    async fn test_cleanup_sends_offline_when_online() {
        use crate::conn_pipe::ControlEvent;

        let gateway = PipeGateway::new();
        let mut s = session(&gateway, "lamp");
        s.setup().await.unwrap();
        s.register_and_online().await.unwrap();
        let conn = gateway.device(s.identity()).unwrap();
        s.cleanup().await;

        let id = s.identity().clone();
        assert_eq!(
            conn.recv_control().await.unwrap(),
            Some(ControlEvent::Registered(id.clone()))
        );
        assert_eq!(
            conn.recv_control().await.unwrap(),
            Some(ControlEvent::Online(id.clone()))
        );
        assert_eq!(
            conn.recv_control().await.unwrap(),
            Some(ControlEvent::Offline(id))
        );
        assert_eq!(conn.recv_control().await.unwrap(), None);
    }
}
