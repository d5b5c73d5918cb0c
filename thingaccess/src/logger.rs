//! Logging interface for thingaccess.
//!
//! Sessions and the supervisor log through a `Logger`. The default forwards
//! to `tracing`; [`ScopedLogger`] prefixes every line with the thing id.

use crate::DeviceIdentity;
use std::sync::Arc;

/// Logger interface for thingaccess components.
pub trait Logger: Send + Sync {
    fn error(&self, msg: &str);
    fn warn(&self, msg: &str);
    fn info(&self, msg: &str);
    fn debug(&self, msg: &str);
}

/// Returns the default logger that uses the `tracing` crate.
pub fn default_logger() -> Arc<dyn Logger> {
    Arc::new(TracingLogger)
}

struct TracingLogger;

impl Logger for TracingLogger {
    fn error(&self, msg: &str) {
        tracing::error!(target: "thingaccess", "{}", msg);
    }

    fn warn(&self, msg: &str) {
        tracing::warn!(target: "thingaccess", "{}", msg);
    }

    fn info(&self, msg: &str) {
        tracing::info!(target: "thingaccess", "{}", msg);
    }

    fn debug(&self, msg: &str) {
        tracing::debug!(target: "thingaccess", "{}", msg);
    }
}

/// No-op logger that discards all messages.
pub struct NopLogger;

impl Logger for NopLogger {
    fn error(&self, _msg: &str) {}
    fn warn(&self, _msg: &str) {}
    fn info(&self, _msg: &str) {}
    fn debug(&self, _msg: &str) {}
}

/// Logger that tags messages with `[productKey/deviceName]`.
pub struct ScopedLogger {
    prefix: String,
    inner: Arc<dyn Logger>,
}

impl ScopedLogger {
    pub fn new(identity: &DeviceIdentity, inner: Arc<dyn Logger>) -> Self {
        Self {
            prefix: format!("[{}]", identity.thing_id()),
            inner,
        }
    }
}

impl Logger for ScopedLogger {
    fn error(&self, msg: &str) {
        self.inner.error(&format!("{} {}", self.prefix, msg));
    }

    fn warn(&self, msg: &str) {
        self.inner.warn(&format!("{} {}", self.prefix, msg));
    }

    fn info(&self, msg: &str) {
        self.inner.info(&format!("{} {}", self.prefix, msg));
    }

    fn debug(&self, msg: &str) {
        self.inner.debug(&format!("{} {}", self.prefix, msg));
    }
}

/// Wraps `inner` so every message carries the thing id.
pub fn for_thing(identity: &DeviceIdentity, inner: Arc<dyn Logger>) -> Arc<dyn Logger> {
    Arc::new(ScopedLogger::new(identity, inner))
}

/// Convenience macro for formatted error logging.
#[macro_export]
macro_rules! log_error {
    ($logger:expr, $($arg:tt)*) => {
        $logger.error(&format!($($arg)*))
    };
}

/// Convenience macro for formatted warn logging.
#[macro_export]
macro_rules! log_warn {
    ($logger:expr, $($arg:tt)*) => {
        $logger.warn(&format!($($arg)*))
    };
}

/// Convenience macro for formatted info logging.
#[macro_export]
macro_rules! log_info {
    ($logger:expr, $($arg:tt)*) => {
        $logger.info(&format!($($arg)*))
    };
}

/// Convenience macro for formatted debug logging.
#[macro_export]
macro_rules! log_debug {
    ($logger:expr, $($arg:tt)*) => {
        $logger.debug(&format!($($arg)*))
    };
}

#[cfg(test)]
pub(crate) mod logger_tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct CapturingLogger {
        messages: Mutex<Vec<(String, String)>>,
    }

    impl CapturingLogger {
        pub(crate) fn messages(&self) -> Vec<(String, String)> {
            self.messages.lock().unwrap().clone()
        }

        fn push(&self, level: &str, msg: &str) {
            self.messages
                .lock()
                .unwrap()
                .push((level.to_string(), msg.to_string()));
        }
    }

    impl Logger for CapturingLogger {
        fn error(&self, msg: &str) {
            self.push("error", msg);
        }
        fn warn(&self, msg: &str) {
            self.push("warn", msg);
        }
        fn info(&self, msg: &str) {
            self.push("info", msg);
        }
        fn debug(&self, msg: &str) {
            self.push("debug", msg);
        }
    }

    #[test]
    fn test_capturing_logger() {
        let logger = CapturingLogger::default();
        log_error!(logger, "setup failed after {} attempts", 3);
        log_info!(logger, "online");

        let msgs = logger.messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0], ("error".to_string(), "setup failed after 3 attempts".to_string()));
        assert_eq!(msgs[1], ("info".to_string(), "online".to_string()));
    }

    #[test]
    fn test_scoped_logger_prefix() {
        let capture = Arc::new(CapturingLogger::default());
        let id = DeviceIdentity::new("pk", "sensor-1", "s");
        let logger = for_thing(&id, capture.clone());
        log_warn!(logger, "queue at {}%", 90);

        assert_eq!(
            capture.messages(),
            vec![("warn".to_string(), "[pk/sensor-1] queue at 90%".to_string())]
        );
    }

    #[test]
    fn test_nop_logger() {
        let logger = NopLogger;
        logger.error("should not panic");
        logger.debug("should not panic");
    }

    #[test]
    fn test_default_logger() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
        let logger = default_logger();
        logger.info("test default logger");
    }
}
