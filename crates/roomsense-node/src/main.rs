//! # roomsense-node
//!
//! Daemon binary for the roomsense Bluetooth presence system.
//!
//! This binary provides:
//! - Continuous low-energy discovery with adapter watchdogs
//! - Round-robin Classic RSSI polling of configured devices
//! - Reactive presence entities with rolling-average smoothing
//! - Structured logging to file and stdout
//!
//! ## Running
//!
//! ```bash
//! # Development
//! cargo run --package roomsense-node
//!
//! # Production (on the node)
//! ROOMSENSE_ENV=production ./roomsense-node
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::sync::Arc;
use std::time::Duration;

use roomsense_core::adapter::AdapterManager;
use roomsense_core::ble::driver::BluezDriver;
use roomsense_core::classic::{ClassicEngine, CommandRunner, ShellCommandRunner};
use roomsense_core::entity::behaviors::{BehaviorSpec, StageSpec};
use roomsense_core::entity::{
    EntityDescriptor, EntityEvent, EntityHandle, EntityRegistry, LeadershipOracle,
};
use roomsense_core::{RadioDriver, RoomsenseConfig};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

mod logging;

/// Pause between Classic RSSI polling rounds.
const CLASSIC_POLL_INTERVAL: Duration = Duration::from_secs(6);

/// Window for smoothing Classic RSSI readings.
const RSSI_AVERAGE_WINDOW: Duration = Duration::from_secs(20);

/// Single-node deployment: no cluster, this node is always the leader.
struct SoleLeader;

impl LeadershipOracle for SoleLeader {
    fn is_majority_leader(&self) -> bool {
        true
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let production = std::env::var("ROOMSENSE_ENV").is_ok_and(|v| v == "production");
    logging::init(production)?;

    info!("Starting roomsense-node");

    let config = RoomsenseConfig::load()?;
    let le_adapter = config.le_adapter;

    let (driver, mut radio_events) = BluezDriver::new(le_adapter).await?;
    let adapters = Arc::new(AdapterManager::new(driver, ShellCommandRunner, le_adapter));
    let classic = Arc::new(ClassicEngine::new(
        Arc::clone(&adapters),
        ShellCommandRunner,
        config.scan_time_limit(),
    ));
    let registry = Arc::new(EntityRegistry::new(Arc::new(SoleLeader)));

    Arc::clone(&adapters).spawn_watchdogs();
    spawn_event_logger(&registry);

    // Pump driver events into the adapter state machine.
    let pump_adapters = Arc::clone(&adapters);
    tokio::spawn(async move {
        while let Some(event) = radio_events.recv().await {
            pump_adapters.handle_event(event).await;
        }
        debug!("radio event stream closed");
    });

    if config.classic_addresses.is_empty() {
        info!("no classic addresses configured, polling disabled");
    } else {
        let trackers =
            register_trackers(&registry, &classic, le_adapter, &config.classic_addresses).await?;
        tokio::spawn(poll_classic(Arc::clone(&classic), le_adapter, trackers));
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    adapters.shutdown().await;

    Ok(())
}

/// Log every entity update for journal-level visibility.
fn spawn_event_logger(registry: &EntityRegistry) {
    let mut events = registry.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                EntityEvent::NewEntity { entity, .. } => {
                    info!(id = entity.id, name = entity.name, "entity registered");
                }
                EntityEvent::Updated {
                    id,
                    diffs,
                    authoritative,
                } => {
                    debug!(id, changes = diffs.len(), authoritative, "entity updated");
                }
            }
        }
    });
}

/// Register one smoothed presence entity per tracked Classic address, naming
/// it from a device-info inquiry.
async fn register_trackers<D, C>(
    registry: &EntityRegistry,
    classic: &ClassicEngine<D, C>,
    adapter: u16,
    addresses: &[String],
) -> anyhow::Result<Vec<(String, EntityHandle)>>
where
    D: RadioDriver,
    C: CommandRunner,
{
    let mut trackers = Vec::with_capacity(addresses.len());
    for address in addresses {
        let info = classic.inquire_device_info(adapter, address).await?;
        let id = format!("classic-{}", address.to_lowercase().replace(':', ""));
        let entity = registry.add(
            EntityDescriptor::new(&id, &info.name)
                .distributed(true)
                .with_behaviors(vec![BehaviorSpec::state(vec![StageSpec::RollingAverage {
                    window: RSSI_AVERAGE_WINDOW,
                }])]),
            None,
        )?;
        entity.set_attribute("address", json!(address));
        if let Some(manufacturer) = info.manufacturer {
            entity.set_attribute("manufacturer", json!(manufacturer));
        }
        trackers.push((address.clone(), entity));
    }
    Ok(trackers)
}

/// Poll each tracked address in turn, feeding readings through the entity's
/// behavior chain. A missed reading clears the state.
async fn poll_classic<D, C>(
    classic: Arc<ClassicEngine<D, C>>,
    adapter: u16,
    trackers: Vec<(String, EntityHandle)>,
) where
    D: RadioDriver,
    C: CommandRunner,
{
    let mut tick = tokio::time::interval(CLASSIC_POLL_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        for (address, entity) in &trackers {
            match classic.inquire_rssi(adapter, address).await {
                Ok(Some(rssi)) => entity.set_state(json!(rssi)),
                Ok(None) => entity.set_state(Value::Null),
                Err(e) if e.is_lock_contention() => {
                    debug!(address, "adapter busy, skipping poll");
                }
                Err(e) => warn!(address, error = %e, "rssi poll failed"),
            }
        }
    }
}
