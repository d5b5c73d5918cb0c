//! Running many device sessions side by side.
//!
//! The [`Supervisor`] creates one [`Session`] per configured identity and
//! drives each through setup and registration on its own task. Transient
//! failures are retried with exponential backoff; a rejected registration is
//! final. A failed session is cleaned up at once, so its transport does not
//! outlive it. One device failing never holds up the others.

use crate::logger::{self, Logger};
use crate::state::StateCell;
use crate::{
    CallbackRegistry, Connector, DeviceIdentity, Reporter, Result, Session, SessionConfig,
    SessionError, SessionState, log_error, log_info, log_warn,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Device behavior plugged into a [`Supervisor`].
pub trait ThingDriver: Send + Sync + 'static {
    /// Per-device state handed to callbacks as `&mut State`.
    type State: Send + 'static;

    /// Builds the initial state and handlers for one device.
    fn init(&self, identity: &DeviceIdentity) -> (Self::State, CallbackRegistry<Self::State>);

    /// Called once the session is online, e.g. to start periodic reports.
    fn on_online(&self, session: &mut Session<Self::State>) -> Result<()> {
        let _ = session;
        Ok(())
    }
}

/// Backoff schedule for transient setup and registration failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Consecutive failures tolerated before the session is failed.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Returns the delay after the `attempt`-th consecutive failure (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        // Exponential backoff: initial, 2x, 4x, ... capped at max_backoff
        let shift = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

/// Configuration for a [`Supervisor`].
#[derive(Debug, Clone, Default)]
pub struct SupervisorConfig {
    pub session: SessionConfig,
    pub retry: RetryPolicy,
}

struct SessionSlot {
    state: StateCell,
    reporter: Reporter,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Owns the sessions of every configured device.
pub struct Supervisor<D: ThingDriver> {
    driver: Arc<D>,
    connector: Arc<dyn Connector>,
    config: SupervisorConfig,
    logger: Arc<dyn Logger>,
    sessions: HashMap<DeviceIdentity, SessionSlot>,
    order: Vec<DeviceIdentity>,
}

impl<D: ThingDriver> Supervisor<D> {
    pub fn new(driver: D, connector: Arc<dyn Connector>) -> Self {
        Self {
            driver: Arc::new(driver),
            connector,
            config: SupervisorConfig::default(),
            logger: logger::default_logger(),
            sessions: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: SupervisorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Starts a session for each identity and returns how many were started.
    ///
    /// Identities already supervised are skipped.
    pub fn start(&mut self, identities: impl IntoIterator<Item = DeviceIdentity>) -> usize {
        let mut started = 0;
        for identity in identities {
            if self.sessions.contains_key(&identity) {
                log_warn!(self.logger, "duplicate device {}, skipped", identity);
                continue;
            }

            let (state, registry) = self.driver.init(&identity);
            let session = Session::new(identity.clone(), registry, state, self.connector.clone())
                .with_config(self.config.session.clone())
                .with_logger(self.logger.clone());
            let shutdown = CancellationToken::new();
            let state = session.state_cell();
            let reporter = session.reporter();
            let task = tokio::spawn(run_session(
                self.driver.clone(),
                session,
                self.config.retry.clone(),
                shutdown.clone(),
            ));

            self.sessions.insert(
                identity.clone(),
                SessionSlot {
                    state,
                    reporter,
                    shutdown,
                    task: Some(task),
                },
            );
            self.order.push(identity);
            started += 1;
        }
        log_info!(self.logger, "started {} session(s)", started);
        started
    }

    pub fn state(&self, identity: &DeviceIdentity) -> Option<SessionState> {
        self.sessions.get(identity).map(|slot| slot.state.get())
    }

    pub fn last_error(&self, identity: &DeviceIdentity) -> Option<SessionError> {
        self.sessions
            .get(identity)
            .and_then(|slot| slot.state.last_error())
    }

    pub fn reporter(&self, identity: &DeviceIdentity) -> Option<Reporter> {
        self.sessions.get(identity).map(|slot| slot.reporter.clone())
    }

    pub fn subscribe(&self, identity: &DeviceIdentity) -> Option<watch::Receiver<SessionState>> {
        self.sessions.get(identity).map(|slot| slot.state.subscribe())
    }

    /// Returns every supervised identity with its state, in start order.
    pub fn states(&self) -> Vec<(DeviceIdentity, SessionState)> {
        self.order
            .iter()
            .filter_map(|id| self.state(id).map(|state| (id.clone(), state)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Waits until every session is online, failed or closed.
    pub async fn settled(&self) {
        for slot in self.sessions.values() {
            let mut rx = slot.state.subscribe();
            let _ = rx.wait_for(|state| state.is_settled()).await;
        }
    }

    /// Cleans up every session concurrently and waits for all of them.
    pub async fn shutdown_all(&mut self) {
        for slot in self.sessions.values() {
            slot.shutdown.cancel();
        }
        let tasks: Vec<_> = self
            .sessions
            .values_mut()
            .filter_map(|slot| slot.task.take())
            .collect();
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                log_error!(self.logger, "session task ended abnormally: {}", e);
            }
        }
        log_info!(self.logger, "all sessions shut down");
    }
}

impl<D: ThingDriver> Drop for Supervisor<D> {
    fn drop(&mut self) {
        for slot in self.sessions.values() {
            slot.shutdown.cancel();
        }
    }
}

async fn run_session<D: ThingDriver>(
    driver: Arc<D>,
    mut session: Session<D::State>,
    retry: RetryPolicy,
    shutdown: CancellationToken,
) {
    let logger = session.logger();
    let mut state = session.subscribe();
    let failed = async {
        bring_online(driver.as_ref(), &mut session, &retry).await;
        // Covers both a failed bring-up and a later ConnectionLost.
        let _ = state.wait_for(|s| *s == SessionState::Failed).await;
    };
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = failed => log_warn!(logger, "session failed, releasing transport"),
    }
    session.cleanup().await;
}

/// Drives `session` to `Online` or `Failed`.
async fn bring_online<D: ThingDriver>(
    driver: &D,
    session: &mut Session<D::State>,
    retry: &RetryPolicy,
) {
    let logger = session.logger();
    let max_attempts = retry.max_attempts.max(1);
    let mut failures = 0;

    loop {
        let step = match session.state() {
            SessionState::Created => session.setup().await,
            SessionState::SetUp => session.register_and_online().await,
            _ => break,
        };
        match step {
            Ok(()) => failures = 0,
            Err(e) if e.is_retryable() => {
                failures += 1;
                if failures >= max_attempts {
                    log_error!(logger, "giving up after {} attempt(s): {}", failures, e);
                    session.abandon(e);
                    return;
                }
                let backoff = retry.backoff(failures);
                log_warn!(
                    logger,
                    "{} (attempt {}/{}), retrying in {:?}",
                    e,
                    failures,
                    max_attempts,
                    backoff
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                // Rejections have already failed the session.
                session.abandon(e.clone());
                log_error!(logger, "session failed: {}", e);
                return;
            }
        }
    }

    if session.state() == SessionState::Online {
        if let Err(e) = driver.on_online(session) {
            log_error!(logger, "driver start failed: {}", e);
            session.abandon(SessionError::Callback(e.to_string()));
        }
    }
}
