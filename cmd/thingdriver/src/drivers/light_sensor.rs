//! A read-only light sensor sweeping 100..=600 lux.

use serde_json::json;
use std::time::Duration;
use thingaccess::{
    CallbackRegistry, DeviceIdentity, Params, Reporter, Result, Session, ThingDriver, ThingResult,
};

use super::{NO_SUCH_PROPERTY, NO_SUCH_SERVICE, log_report};

const PROPERTY: &str = "MeasuredIlluminance";
const MIN_LUX: i64 = 100;
const MAX_LUX: i64 = 600;
const STEP_LUX: i64 = 100;

pub struct LightSensor {
    pub interval: Duration,
}

pub struct LightSensorState {
    thing_id: String,
    illuminance: i64,
}

impl LightSensorState {
    fn advance(&mut self) {
        if self.illuminance >= MAX_LUX {
            self.illuminance = MIN_LUX;
        } else {
            self.illuminance += STEP_LUX;
        }
    }
}

impl ThingDriver for LightSensor {
    type State = LightSensorState;

    fn init(&self, identity: &DeviceIdentity) -> (LightSensorState, CallbackRegistry<LightSensorState>) {
        let state = LightSensorState {
            thing_id: identity.thing_id(),
            illuminance: MIN_LUX,
        };
        let registry = CallbackRegistry::new()
            .on_get_properties(|state: &mut LightSensorState, keys: &[String]| {
                tracing::info!("get properties {:?} from {}", keys, state.thing_id);
                if keys.iter().any(|k| k == PROPERTY) {
                    ThingResult::success(lux(state.illuminance))
                } else {
                    ThingResult::failure(NO_SUCH_PROPERTY)
                }
            })
            .on_set_properties(|state: &mut LightSensorState, properties: &Params| {
                tracing::info!("set properties {} to {}", json!(properties), state.thing_id);
                ThingResult::failure("The property is read-only.")
            })
            .on_call_service(|state: &mut LightSensorState, name: &str, args: &Params| {
                tracing::info!("call service {} with {} on {}", name, json!(args), state.thing_id);
                ThingResult::failure(NO_SUCH_SERVICE)
            });
        (state, registry)
    }

    fn on_online(&self, session: &mut Session<LightSensorState>) -> Result<()> {
        session.spawn_periodic(self.interval, tick)
    }
}

fn lux(value: i64) -> Params {
    let mut params = Params::new();
    params.insert(PROPERTY.to_string(), value.into());
    params
}

fn tick(state: &mut LightSensorState, reporter: &Reporter) {
    state.advance();
    let properties = lux(state.illuminance);
    log_report(&state.thing_id, reporter.report_properties(properties));
}
