//! Sample drivers.

mod hello_thing;
mod light_sensor;

pub use hello_thing::HelloThing;
pub use light_sensor::LightSensor;

use serde_json::Value;
use thingaccess::{Params, SessionError, TelemetryOverflow};

pub(crate) const NO_SUCH_PROPERTY: &str = "The requested properties does not exist.";
pub(crate) const NO_SUCH_SERVICE: &str = "The requested service does not exist.";

/// Converts a `json!` object literal into params. Non-objects become empty.
pub(crate) fn props(value: Value) -> Params {
    match value {
        Value::Object(map) => map,
        _ => Params::new(),
    }
}

/// Logs the outcome of a report call.
pub(crate) fn log_report(
    thing_id: &str,
    outcome: Result<Option<TelemetryOverflow>, SessionError>,
) {
    match outcome {
        Ok(None) => tracing::debug!("{} report queued", thing_id),
        Ok(Some(overflow)) => tracing::warn!("{} {}", thing_id, overflow),
        Err(e) => tracing::warn!("{} report failed: {}", thing_id, e),
    }
}
