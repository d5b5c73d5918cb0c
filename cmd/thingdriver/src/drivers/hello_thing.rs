//! A thermometer stuck at 41 degrees that keeps warning about it.

use serde_json::json;
use std::time::Duration;
use thingaccess::{
    CallbackRegistry, DeviceIdentity, Params, Reply, Reporter, Result, Session, ThingDriver,
    ThingResult,
};

use super::{NO_SUCH_PROPERTY, NO_SUCH_SERVICE, log_report, props};

/// Above this the driver raises `high_temperature`.
const HIGH_TEMPERATURE: i64 = 40;

pub struct HelloThing {
    pub interval: Duration,
}

pub struct HelloThingState {
    thing_id: String,
    temperature: i64,
}

impl ThingDriver for HelloThing {
    type State = HelloThingState;

    fn init(&self, identity: &DeviceIdentity) -> (HelloThingState, CallbackRegistry<HelloThingState>) {
        let state = HelloThingState {
            thing_id: identity.thing_id(),
            temperature: 41,
        };
        let registry = CallbackRegistry::new()
            .on_get_properties(|state: &mut HelloThingState, keys: &[String]| {
                tracing::info!("get properties {:?} from {}", keys, state.thing_id);
                if keys.iter().any(|k| k == "temperature") {
                    ThingResult::success(props(json!({"temperature": state.temperature})))
                } else {
                    ThingResult::failure(NO_SUCH_PROPERTY)
                }
            })
            .on_set_properties(|state: &mut HelloThingState, properties: &Params| {
                tracing::info!("set properties {} to {}", json!(properties), state.thing_id);
                ThingResult::failure("failure")
            })
            .on_call_service(|state: &mut HelloThingState, name: &str, args: &Params| {
                tracing::info!("call service {} with {} on {}", name, json!(args), state.thing_id);
                Reply::spawn(async { ThingResult::failure(NO_SUCH_SERVICE) })
            });
        (state, registry)
    }

    fn on_online(&self, session: &mut Session<HelloThingState>) -> Result<()> {
        session.spawn_periodic(self.interval, tick)
    }
}

fn tick(state: &mut HelloThingState, reporter: &Reporter) {
    if state.temperature > HIGH_TEMPERATURE {
        let payload = props(json!({"temperature": state.temperature}));
        log_report(&state.thing_id, reporter.report_event("high_temperature", payload));
    }
    let properties = props(json!({"temperature": state.temperature}));
    log_report(&state.thing_id, reporter.report_properties(properties));
}
