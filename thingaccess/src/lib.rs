//! Device-side client for edge gateway "thing access".
//!
//! A device session registers an identity with the gateway, announces itself
//! online, answers gateway invocations through driver callbacks, and pushes
//! property and event telemetry:
//!
//! - [`DeviceIdentity`]: `productKey`/`deviceName`/`deviceSecret` triple
//! - [`ThingResult`] and [`ResultCode`]: the outcome of every operation
//! - [`CallbackRegistry`] and [`Reply`]: driver handlers, immediate or deferred
//! - [`Session`] and [`SessionState`]: the per-device lifecycle
//! - [`Reporter`]: cloneable telemetry handle
//! - [`Supervisor`] and [`ThingDriver`]: many devices, one driver
//! - Transport traits ([`GatewayTx`], [`GatewayRx`], [`Connector`])
//! - In-memory gateway for testing ([`conn_pipe::PipeGateway`])
//!
//! # Example
//!
//! ```rust
//! use thingaccess::{DeviceIdentity, ThingResult};
//!
//! let id = DeviceIdentity::new("a1b2c3", "sensor-01", "secret");
//! assert_eq!(id.thing_id(), "a1b2c3/sensor-01");
//! assert!(ThingResult::failure("read-only").is_failure());
//! ```

mod result;
mod identity;
mod state;
mod error;
mod invocation;
mod conn;
pub mod logger;
mod callback;
mod telemetry;
mod dispatch;
mod session;
mod supervisor;
pub mod conn_pipe;

pub use result::*;
pub use identity::*;
pub use state::SessionState;
pub use error::*;
pub use invocation::*;
pub use conn::*;
pub use callback::*;
pub use telemetry::{DEFAULT_TELEMETRY_CAPACITY, Reporter, Telemetry};
pub use dispatch::{CONNECTION_LOST_MESSAGE, SESSION_CLOSED_MESSAGE};
pub use session::*;
pub use supervisor::*;
pub use conn_pipe::new_pipe;
