//! Driver callbacks and their normalization.
//!
//! A driver registers up to three handlers. Each handler receives the
//! session-owned device state and returns a [`Reply`], which is either an
//! immediate [`ThingResult`] or a pending one resolved later through a
//! [`Responder`]. The registry folds both forms into a single awaited result.

use crate::{Operation, OperationKind, Params, ThingResult};
use parking_lot::Mutex;
use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Message used when an invocation misses its deadline.
pub const TIMEOUT_MESSAGE: &str = "timeout";

/// A handler's answer: ready now, or resolved later.
#[derive(Debug)]
pub enum Reply {
    Ready(ThingResult),
    Pending(oneshot::Receiver<ThingResult>),
}

impl Reply {
    /// Creates a pending reply and the responder that resolves it.
    pub fn deferred() -> (Reply, Responder) {
        let (tx, rx) = oneshot::channel();
        (Reply::Pending(rx), Responder { tx })
    }

    /// Runs `fut` on the runtime and resolves the reply with its output.
    ///
    /// If the future panics the reply resolves as a callback failure.
    pub fn spawn<F>(fut: F) -> Reply
    where
        F: Future<Output = ThingResult> + Send + 'static,
    {
        let (reply, responder) = Reply::deferred();
        tokio::spawn(async move {
            responder.resolve(fut.await);
        });
        reply
    }

    /// Waits for the result until `deadline`.
    ///
    /// A result produced after the deadline is discarded in favor of a
    /// `"timeout"` failure.
    pub async fn resolve(self, deadline: Instant) -> ThingResult {
        match self {
            Reply::Ready(result) => {
                if Instant::now() > deadline {
                    ThingResult::failure(TIMEOUT_MESSAGE)
                } else {
                    result
                }
            }
            Reply::Pending(rx) => match tokio::time::timeout_at(deadline, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => ThingResult::failure("callback dropped its reply without a result"),
                Err(_) => ThingResult::failure(TIMEOUT_MESSAGE),
            },
        }
    }
}

impl From<ThingResult> for Reply {
    fn from(result: ThingResult) -> Self {
        Reply::Ready(result)
    }
}

/// Resolves a deferred [`Reply`].
#[derive(Debug)]
pub struct Responder {
    tx: oneshot::Sender<ThingResult>,
}

impl Responder {
    /// Delivers the result. Returns false if nobody waits for it anymore
    /// (the invocation timed out or the session closed).
    pub fn resolve(self, result: ThingResult) -> bool {
        self.tx.send(result).is_ok()
    }
}

type GetPropertiesFn<S> = dyn Fn(&mut S, &[String]) -> Reply + Send + Sync;
type SetPropertiesFn<S> = dyn Fn(&mut S, &Params) -> Reply + Send + Sync;
type CallServiceFn<S> = dyn Fn(&mut S, &str, &Params) -> Reply + Send + Sync;

/// Operation handlers supplied by a driver.
///
/// Missing handlers make the matching operation fail with
/// `"<kind> not supported"`; this is how a device declares read-only
/// properties or the absence of services.
pub struct CallbackRegistry<S> {
    get_properties: Option<Box<GetPropertiesFn<S>>>,
    set_properties: Option<Box<SetPropertiesFn<S>>>,
    call_service: Option<Box<CallServiceFn<S>>>,
}

impl<S> Default for CallbackRegistry<S> {
    fn default() -> Self {
        Self {
            get_properties: None,
            set_properties: None,
            call_service: None,
        }
    }
}

impl<S> CallbackRegistry<S> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the `getProperties` handler.
    pub fn on_get_properties<F, R>(mut self, f: F) -> Self
    where
        F: Fn(&mut S, &[String]) -> R + Send + Sync + 'static,
        R: Into<Reply>,
    {
        self.get_properties = Some(Box::new(move |state, keys| f(state, keys).into()));
        self
    }

    /// Registers the `setProperties` handler.
    pub fn on_set_properties<F, R>(mut self, f: F) -> Self
    where
        F: Fn(&mut S, &Params) -> R + Send + Sync + 'static,
        R: Into<Reply>,
    {
        self.set_properties = Some(Box::new(move |state, props| f(state, props).into()));
        self
    }

    /// Registers the `callService` handler.
    pub fn on_call_service<F, R>(mut self, f: F) -> Self
    where
        F: Fn(&mut S, &str, &Params) -> R + Send + Sync + 'static,
        R: Into<Reply>,
    {
        self.call_service = Some(Box::new(move |state, name, args| f(state, name, args).into()));
        self
    }

    /// Returns true if a handler is registered for `kind`.
    pub fn supports(&self, kind: OperationKind) -> bool {
        match kind {
            OperationKind::GetProperties => self.get_properties.is_some(),
            OperationKind::SetProperties => self.set_properties.is_some(),
            OperationKind::CallService => self.call_service.is_some(),
        }
    }

    /// Runs the handler for `op` without awaiting deferred results.
    ///
    /// Unsupported kinds and panicking handlers produce a ready failure.
    pub fn call(&self, state: &mut S, op: &Operation) -> Reply {
        let outcome = match op {
            Operation::GetProperties { keys } => self
                .get_properties
                .as_ref()
                .map(|h| catch_unwind(AssertUnwindSafe(|| h(state, keys.as_slice())))),
            Operation::SetProperties { properties } => self
                .set_properties
                .as_ref()
                .map(|h| catch_unwind(AssertUnwindSafe(|| h(state, properties)))),
            Operation::CallService { name, args } => self
                .call_service
                .as_ref()
                .map(|h| catch_unwind(AssertUnwindSafe(|| h(state, name.as_str(), args)))),
        };

        match outcome {
            None => Reply::Ready(ThingResult::failure(format!("{} not supported", op.kind()))),
            Some(Ok(reply)) => reply,
            Some(Err(panic)) => Reply::Ready(ThingResult::failure(format!(
                "{} callback panicked: {}",
                op.kind(),
                panic_message(&*panic)
            ))),
        }
    }

    /// Invokes the handler for `op` and waits for its result until `deadline`.
    pub async fn invoke(&self, state: &Mutex<S>, op: &Operation, deadline: Instant) -> ThingResult {
        let reply = {
            let mut guard = state.lock();
            self.call(&mut guard, op)
        };
        normalize_result(op, reply.resolve(deadline).await)
    }
}

/// Enforces the result invariants for the operation that produced `result`.
///
/// Failures lose their params; a `getProperties` success only keeps the keys
/// that were asked for.
pub fn normalize_result(op: &Operation, result: ThingResult) -> ThingResult {
    let result = result.normalize();
    match op {
        Operation::GetProperties { keys } if result.is_success() => result.retain_keys(keys),
        _ => result,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod callback_tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn params(v: serde_json::Value) -> Params {
        v.as_object().cloned().unwrap()
    }

    fn get(keys: &[&str]) -> Operation {
        Operation::GetProperties {
            keys: keys.iter().map(|k| k.to_string()).collect(),
        }
    }

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    struct Thing {
        temperature: i64,
    }

    fn thermometer() -> CallbackRegistry<Thing> {
        CallbackRegistry::new().on_get_properties(|thing: &mut Thing, keys: &[String]| {
            if keys.iter().any(|k| k == "temperature") {
                ThingResult::success(params(json!({"temperature": thing.temperature})))
            } else {
                ThingResult::failure("The requested properties does not exist.")
            }
        })
    }

    #[tokio::test]
    async fn test_invoke_get_properties() {
        let registry = thermometer();
        let state = Mutex::new(Thing { temperature: 41 });

        let result = registry.invoke(&state, &get(&["temperature"]), far()).await;
        assert!(result.is_success());
        assert_eq!(result.params, Some(params(json!({"temperature": 41}))));

        let result = registry.invoke(&state, &get(&["humidity"]), far()).await;
        assert!(result.is_failure());
        assert!(result.params.is_none());
    }

    #[tokio::test]
    async fn test_unregistered_kind_never_calls_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let registry = CallbackRegistry::new().on_get_properties(move |_: &mut (), _: &[String]| {
            counter.fetch_add(1, Ordering::SeqCst);
            ThingResult::ok()
        });
        let state = Mutex::new(());

        let op = Operation::CallService {
            name: "reboot".to_string(),
            args: Params::new(),
        };
        let result = registry.invoke(&state, &op, far()).await;
        assert!(result.is_failure());
        assert_eq!(result.message, "callService not supported");

        let op = Operation::SetProperties {
            properties: Params::new(),
        };
        let result = registry.invoke(&state, &op, far()).await;
        assert_eq!(result.message, "setProperties not supported");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!registry.supports(OperationKind::CallService));
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_failure() {
        let registry = CallbackRegistry::new()
            .on_set_properties(|_: &mut (), _: &Params| -> ThingResult { panic!("sensor bus fault") });
        let state = Mutex::new(());
        let op = Operation::SetProperties {
            properties: params(json!({"power": true})),
        };

        let result = registry.invoke(&state, &op, far()).await;
        assert!(result.is_failure());
        assert!(result.message.contains("sensor bus fault"), "{}", result.message);

        // The registry is still usable afterwards.
        let result = registry.invoke(&state, &op, far()).await;
        assert!(result.is_failure());
    }

    #[tokio::test]
    async fn test_deferred_reply() {
        let (reply, responder) = Reply::deferred();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            responder.resolve(ThingResult::failure("The requested service does not exist."));
        });

        let result = reply.resolve(far()).await;
        assert_eq!(result, ThingResult::failure("The requested service does not exist."));
    }

    #[tokio::test]
    async fn test_spawned_reply() {
        let registry = CallbackRegistry::new().on_call_service(|_: &mut (), name: &str, _: &Params| {
            let name = name.to_string();
            Reply::spawn(async move { ThingResult::ok().with_message(format!("{} done", name)) })
        });
        let state = Mutex::new(());
        let op = Operation::CallService {
            name: "blink".to_string(),
            args: Params::new(),
        };

        let result = registry.invoke(&state, &op, far()).await;
        assert!(result.is_success());
        assert_eq!(result.message, "blink done");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_timeout_discards_late_result() {
        let (reply, responder) = Reply::deferred();
        let deadline = Instant::now() + Duration::from_millis(100);

        let result = reply.resolve(deadline).await;
        assert_eq!(result.message, TIMEOUT_MESSAGE);
        assert!(result.is_failure());

        // Nobody listens anymore.
        assert!(!responder.resolve(ThingResult::ok()));
    }

    #[tokio::test]
    async fn test_dropped_responder() {
        let (reply, responder) = Reply::deferred();
        drop(responder);
        let result = reply.resolve(far()).await;
        assert!(result.is_failure());
        assert!(result.message.contains("without a result"));
    }

    async fn faulty_service() -> ThingResult {
        panic!("async driver fault")
    }

    #[tokio::test]
    async fn test_spawned_panic_becomes_failure() {
        let reply = Reply::spawn(faulty_service());
        let result = reply.resolve(far()).await;
        assert!(result.is_failure());
    }

    #[tokio::test]
    async fn test_get_properties_drops_unrequested_keys() {
        let registry = CallbackRegistry::new().on_get_properties(|_: &mut (), _: &[String]| {
            ThingResult::success(params(json!({"temperature": 41, "secret_calibration": 7})))
        });
        let state = Mutex::new(());

        let result = registry.invoke(&state, &get(&["temperature"]), far()).await;
        assert_eq!(result.params, Some(params(json!({"temperature": 41}))));
    }

    #[tokio::test]
    async fn test_handler_mutates_owned_state() {
        let registry = CallbackRegistry::new().on_set_properties(|thing: &mut Thing, props: &Params| {
            match props.get("temperature").and_then(|v| v.as_i64()) {
                Some(t) => {
                    thing.temperature = t;
                    ThingResult::ok()
                }
                None => ThingResult::failure("temperature missing"),
            }
        });
        let state = Mutex::new(Thing { temperature: 20 });
        let op = Operation::SetProperties {
            properties: params(json!({"temperature": 25})),
        };

        assert!(registry.invoke(&state, &op, far()).await.is_success());
        assert_eq!(state.lock().temperature, 25);
    }
}
