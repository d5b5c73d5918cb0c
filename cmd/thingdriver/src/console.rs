//! Logs what the in-memory gateway receives from each device.

use thingaccess::conn_pipe::{ControlEvent, PipeGatewayConn};
use thingaccess::{DeviceIdentity, Telemetry};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Spawns a watcher for every connection published on `feed`.
pub fn spawn(mut feed: mpsc::UnboundedReceiver<(DeviceIdentity, PipeGatewayConn)>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some((identity, conn)) = feed.recv().await {
            tokio::spawn(watch_device(identity, conn));
        }
    })
}

async fn watch_device(identity: DeviceIdentity, conn: PipeGatewayConn) {
    let thing = identity.thing_id();
    tracing::debug!("gateway: {} connected", thing);
    loop {
        tokio::select! {
            event = conn.recv_control() => match event {
                Ok(Some(ControlEvent::Registered(_))) => tracing::info!("gateway: {} registered", thing),
                Ok(Some(ControlEvent::Online(_))) => tracing::info!("gateway: {} online", thing),
                Ok(Some(ControlEvent::Offline(_))) => tracing::info!("gateway: {} offline", thing),
                _ => break,
            },
            report = conn.recv_telemetry() => match report {
                Ok(Some(Telemetry::Properties { properties, time })) => {
                    tracing::info!("gateway: {} properties {} at {}", thing, serde_json::Value::Object(properties), time);
                }
                Ok(Some(Telemetry::Event { name, payload, time })) => {
                    tracing::info!("gateway: {} event {} {} at {}", thing, name, serde_json::Value::Object(payload), time);
                }
                _ => break,
            },
            reply = conn.recv_reply() => match reply {
                Ok(Some(reply)) => tracing::info!("gateway: {} reply {} {}", thing, reply.id, reply.result.code),
                _ => break,
            },
        }
    }
    tracing::debug!("gateway: {} disconnected", thing);
}
