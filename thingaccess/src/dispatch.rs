//! Inbound invocation routing.
//!
//! The dispatcher reads invocations off the downlink, runs the matching
//! handler synchronously in arrival order, then waits for each reply
//! concurrently so slow handlers never hold up fast ones.

use crate::callback::normalize_result;
use crate::logger::Logger;
use crate::state::StateCell;
use crate::{
    CallbackRegistry, GatewayConn, GatewayRx, GatewayTx, Invocation, PendingInvocation,
    SessionError, SessionState, ThingResult, log_debug, log_warn,
};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Message of the failure sent for invocations still pending at cleanup.
pub const SESSION_CLOSED_MESSAGE: &str = "session closed";

/// Message of the failure sent for invocations still pending when the
/// downlink is lost.
pub const CONNECTION_LOST_MESSAGE: &str = "connection lost";

pub(crate) struct Dispatcher<S> {
    pub(crate) registry: Arc<CallbackRegistry<S>>,
    pub(crate) device: Arc<Mutex<S>>,
    pub(crate) conn: Arc<dyn GatewayConn>,
    pub(crate) state: StateCell,
    pub(crate) invocation_timeout: Duration,
    pub(crate) send_timeout: Duration,
    pub(crate) logger: Arc<dyn Logger>,
}

impl<S: Send + 'static> Dispatcher<S> {
    /// Routes invocations until `cancel` fires or the downlink ends.
    ///
    /// Every accepted invocation gets exactly one reply before this returns.
    pub(crate) async fn run(self, cancel: CancellationToken) {
        let closing = cancel.child_token();
        let lost = Arc::new(AtomicBool::new(false));
        let mut pending = FuturesUnordered::new();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(()) = pending.next(), if !pending.is_empty() => {}
                received = self.conn.recv_invocation() => match received {
                    Ok(Some(invocation)) => {
                        pending.push(self.accept(invocation, closing.clone(), lost.clone()))
                    }
                    Ok(None) => {
                        self.connection_lost("downlink closed by gateway".to_string());
                        lost.store(true, Ordering::Release);
                        break;
                    }
                    Err(e) => {
                        self.connection_lost(e.to_string());
                        lost.store(true, Ordering::Release);
                        break;
                    }
                },
            }
        }

        closing.cancel();
        while pending.next().await.is_some() {}
        log_debug!(self.logger, "dispatcher stopped");
    }

    /// Runs the handler now and returns the future that delivers its reply.
    fn accept(
        &self,
        invocation: Invocation,
        closing: CancellationToken,
        lost: Arc<AtomicBool>,
    ) -> impl Future<Output = ()> + Send + 'static {
        let pending = PendingInvocation::accept(invocation, self.invocation_timeout);
        log_debug!(self.logger, "invocation {} {}", pending.id, pending.kind());

        let reply = {
            let mut device = self.device.lock();
            self.registry.call(&mut device, &pending.operation)
        };

        let conn = self.conn.clone();
        let logger = self.logger.clone();
        let send_timeout = self.send_timeout;

        async move {
            let result = tokio::select! {
                biased;
                result = reply.resolve(pending.deadline) => normalize_result(&pending.operation, result),
                _ = closing.cancelled() => {
                    if lost.load(Ordering::Acquire) {
                        ThingResult::failure(CONNECTION_LOST_MESSAGE)
                    } else {
                        ThingResult::failure(SESSION_CLOSED_MESSAGE)
                    }
                }
            };
            if result.is_failure() {
                log_debug!(logger, "invocation {} failed: {}", pending.id, result.message);
            }

            let reply = pending.reply(result);
            match tokio::time::timeout(send_timeout, conn.send_reply(&reply)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log_warn!(logger, "reply {} not delivered: {}", reply.id, e),
                Err(_) => log_warn!(logger, "reply {} not delivered: send timed out", reply.id),
            }
        }
    }

    fn connection_lost(&self, reason: String) {
        let err = SessionError::ConnectionLost(reason);
        let message = err.to_string();
        if self.state.fail_from(SessionState::Online, err) {
            log_warn!(self.logger, "{}", message);
        }
    }
}
