//! BlueZ-backed radio driver.
//!
//! Maps the [`RadioDriver`] and [`Peripheral`] ports onto `bluer` sessions.
//! Driver events are pumped into an unbounded channel; the host wires that
//! channel into [`crate::adapter::AdapterManager::handle_event`].

use std::sync::{Arc, Mutex};

use bluer::gatt::remote::{Characteristic, Service};
use bluer::{Adapter, AdapterEvent, AdapterProperty, Address, Session};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ble::{ConnectionState, Discovery, Peripheral, RadioDriver, RadioEvent};
use crate::error::{Result, RoomsenseError};

fn driver_err(e: bluer::Error) -> RoomsenseError {
    RoomsenseError::Driver(e.to_string())
}

struct Handles {
    _session: Session,
    adapter: Adapter,
}

impl Handles {
    async fn open(adapter_name: &str) -> Result<Self> {
        let session = Session::new().await.map_err(driver_err)?;
        let adapter = session.adapter(adapter_name).map_err(driver_err)?;
        adapter.set_powered(true).await.map_err(driver_err)?;
        Ok(Self {
            _session: session,
            adapter,
        })
    }
}

/// Radio driver over the BlueZ daemon.
pub struct BluezDriver {
    adapter_name: String,
    handles: tokio::sync::Mutex<Handles>,
    events: mpsc::UnboundedSender<RadioEvent>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl BluezDriver {
    /// Open a session against `hci<index>` and return the driver together
    /// with its event stream.
    ///
    /// # Errors
    ///
    /// Returns [`RoomsenseError::Driver`] when the daemon is unreachable or
    /// the adapter does not exist.
    pub async fn new(index: u16) -> Result<(Self, mpsc::UnboundedReceiver<RadioEvent>)> {
        let adapter_name = format!("hci{index}");
        let handles = Handles::open(&adapter_name).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(RadioEvent::PoweredOn);
        Ok((
            Self {
                adapter_name,
                handles: tokio::sync::Mutex::new(handles),
                events: tx,
                scan_task: Mutex::new(None),
            },
            rx,
        ))
    }

    /// Resolve a peripheral handle by Bluetooth address.
    ///
    /// # Errors
    ///
    /// Returns [`RoomsenseError::Driver`] for malformed addresses or devices
    /// the daemon has never seen.
    pub async fn peripheral(&self, address: &str) -> Result<BluezPeripheral> {
        let parsed: Address = address
            .parse()
            .map_err(|_| RoomsenseError::Driver(format!("invalid address: {address}")))?;
        let handles = self.handles.lock().await;
        let device = handles.adapter.device(parsed).map_err(driver_err)?;
        let connected = device.is_connected().await.map_err(driver_err)?;
        Ok(BluezPeripheral {
            device,
            state: Arc::new(Mutex::new(if connected {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            })),
        })
    }

    fn abort_scan(&self) {
        if let Some(task) = self.scan_task.lock().expect("scan task slot poisoned").take() {
            task.abort();
        }
    }
}

impl RadioDriver for BluezDriver {
    async fn start_scanning(&self, allow_duplicates: bool) -> Result<()> {
        let adapter = self.handles.lock().await.adapter.clone();
        let events = self.events.clone();

        let task = tokio::spawn(async move {
            // `discover_devices_with_changes` re-announces known devices on
            // every property change, which is what duplicate reporting means
            // under BlueZ.
            let stream = if allow_duplicates {
                adapter.discover_devices_with_changes().await.map(StreamExt::boxed)
            } else {
                adapter.discover_devices().await.map(StreamExt::boxed)
            };
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "discovery stream failed to open");
                    let _ = events.send(RadioEvent::Warning(e.to_string()));
                    return;
                }
            };
            let _ = events.send(RadioEvent::ScanStarted);

            while let Some(event) = stream.next().await {
                match event {
                    AdapterEvent::DeviceAdded(address) => {
                        let Ok(device) = adapter.device(address) else {
                            continue;
                        };
                        let rssi = device.rssi().await.unwrap_or_default();
                        let name = device.name().await.unwrap_or_default();
                        let _ = events.send(RadioEvent::Discovered(Discovery {
                            address: address.to_string(),
                            rssi,
                            name,
                        }));
                    }
                    AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) => {
                        let _ = events.send(if powered {
                            RadioEvent::PoweredOn
                        } else {
                            RadioEvent::PoweredOff
                        });
                    }
                    _ => {}
                }
            }
            debug!("discovery stream ended");
            let _ = events.send(RadioEvent::ScanStopped);
        });

        if let Some(previous) = self
            .scan_task
            .lock()
            .expect("scan task slot poisoned")
            .replace(task)
        {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_scanning(&self) -> Result<()> {
        self.abort_scan();
        let _ = self.events.send(RadioEvent::ScanStopped);
        Ok(())
    }

    async fn reset_bindings(&self) -> Result<()> {
        self.abort_scan();
        let mut handles = self.handles.lock().await;
        *handles = Handles::open(&self.adapter_name).await?;
        debug!(adapter = self.adapter_name, "driver bindings re-created");
        Ok(())
    }
}

/// One BlueZ device with a locally tracked connection state.
///
/// The cached state deliberately lags the daemon: an abandoned connect leaves
/// it at `Connecting`, which is the signal the engine uses to force a cleanup
/// disconnect.
#[derive(Clone)]
pub struct BluezPeripheral {
    device: bluer::Device,
    state: Arc<Mutex<ConnectionState>>,
}

impl BluezPeripheral {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().expect("connection state poisoned") = state;
    }

    async fn service(&self, uuid: Uuid) -> Result<Service> {
        for service in self.device.services().await.map_err(driver_err)? {
            if service.uuid().await.map_err(driver_err)? == uuid {
                return Ok(service);
            }
        }
        Err(RoomsenseError::Driver(format!("service not found: {uuid}")))
    }

    async fn characteristic(&self, service: Uuid, uuid: Uuid) -> Result<Characteristic> {
        let service = self.service(service).await?;
        for characteristic in service.characteristics().await.map_err(driver_err)? {
            if characteristic.uuid().await.map_err(driver_err)? == uuid {
                return Ok(characteristic);
            }
        }
        Err(RoomsenseError::Driver(format!(
            "characteristic not found: {uuid}"
        )))
    }
}

impl Peripheral for BluezPeripheral {
    fn id(&self) -> String {
        self.device.address().to_string()
    }

    fn connectable(&self) -> bool {
        // BlueZ does not surface advertisement connectability; any device the
        // daemon materializes is treated as connectable.
        true
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock().expect("connection state poisoned")
    }

    async fn connect(&self) -> Result<()> {
        self.set_state(ConnectionState::Connecting);
        match self.device.connect().await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(driver_err(e))
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.set_state(ConnectionState::Disconnecting);
        self.device.disconnect().await.map_err(driver_err)?;
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    async fn discover_services(&self, uuids: &[Uuid]) -> Result<Vec<Uuid>> {
        let mut found = Vec::new();
        for service in self.device.services().await.map_err(driver_err)? {
            let uuid = service.uuid().await.map_err(driver_err)?;
            if uuids.is_empty() || uuids.contains(&uuid) {
                found.push(uuid);
            }
        }
        Ok(found)
    }

    async fn discover_characteristics(&self, service: Uuid, uuids: &[Uuid]) -> Result<Vec<Uuid>> {
        let service = self.service(service).await?;
        let mut found = Vec::new();
        for characteristic in service.characteristics().await.map_err(driver_err)? {
            let uuid = characteristic.uuid().await.map_err(driver_err)?;
            if uuids.is_empty() || uuids.contains(&uuid) {
                found.push(uuid);
            }
        }
        Ok(found)
    }

    async fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(service, characteristic).await?;
        characteristic.read().await.map_err(driver_err)
    }
}
