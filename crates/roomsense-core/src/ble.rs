//! Low-energy scanning, connection, and characteristic queries.
//!
//! The radio driver sits behind the [`RadioDriver`] and [`Peripheral`] ports
//! so the engine logic runs against mocks in tests and against BlueZ (see
//! [`driver`]) in production. All driver calls are deadline-bounded through
//! [`crate::util::run_with_deadline`]; a timed-out call is abandoned, and any
//! state it strands (a peripheral stuck "connecting", a wedged driver) is
//! cleaned up by a forced disconnect or an adapter reset.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::adapter::AdapterManager;
use crate::classic::CommandRunner;
use crate::error::{Result, RoomsenseError};
use crate::util::{retry_with_deadline, run_with_deadline, RetryError};

#[cfg(feature = "bluetooth")]
pub mod driver;

/// Maximum connect attempts per [`BleEngine::connect`] call.
const CONNECT_ATTEMPTS: u32 = 5;

/// Overall deadline across all connect attempts.
const CONNECT_DEADLINE: Duration = Duration::from_secs(10);

/// Pause between connect attempts.
const CONNECT_RETRY_PAUSE: Duration = Duration::from_millis(100);

/// Bound on a single disconnect call.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Shared, shrinking deadline across all steps of a characteristic query.
const QUERY_DEADLINE: Duration = Duration::from_secs(15);

/// A raw discovery observed by the scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Discovery {
    /// Bluetooth address of the discovered device.
    pub address: String,
    /// Signal strength at discovery time, when the driver reports one.
    pub rssi: Option<i16>,
    /// Advertised name, when present.
    pub name: Option<String>,
}

/// Events emitted by the radio driver for the low-energy adapter.
#[derive(Debug, Clone)]
pub enum RadioEvent {
    /// The radio turned on.
    PoweredOn,
    /// The radio turned off.
    PoweredOff,
    /// Passive discovery started.
    ScanStarted,
    /// Passive discovery stopped.
    ScanStopped,
    /// A device was discovered (duplicates allowed).
    Discovered(Discovery),
    /// Driver-level warning worth surfacing in logs.
    Warning(String),
}

/// Port over the low-energy radio driver.
pub trait RadioDriver: Send + Sync + 'static {
    /// Begin continuous passive discovery.
    fn start_scanning(&self, allow_duplicates: bool) -> impl Future<Output = Result<()>> + Send;

    /// Stop passive discovery.
    fn stop_scanning(&self) -> impl Future<Output = Result<()>> + Send;

    /// Tear down and re-create the underlying driver bindings after a
    /// hardware reset.
    fn reset_bindings(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Connection lifecycle of a peripheral as the driver reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link.
    Disconnected,
    /// A connect call is in flight.
    Connecting,
    /// Link established.
    Connected,
    /// A disconnect call is in flight.
    Disconnecting,
}

/// Port over one BLE peripheral. Handles are borrowed per operation; cloning
/// is cheap so bounded calls can run on detached tasks.
pub trait Peripheral: Clone + Send + Sync + 'static {
    /// Stable identifier (typically the address).
    fn id(&self) -> String;

    /// Whether the peripheral advertises itself as connectable.
    fn connectable(&self) -> bool;

    /// Current connection state.
    fn connection_state(&self) -> ConnectionState;

    /// Establish a link.
    fn connect(&self) -> impl Future<Output = Result<()>> + Send;

    /// Tear down the link.
    fn disconnect(&self) -> impl Future<Output = Result<()>> + Send;

    /// Discover services matching the given UUIDs.
    fn discover_services(&self, uuids: &[Uuid]) -> impl Future<Output = Result<Vec<Uuid>>> + Send;

    /// Discover characteristics of a service matching the given UUIDs.
    fn discover_characteristics(
        &self,
        service: Uuid,
        uuids: &[Uuid],
    ) -> impl Future<Output = Result<Vec<Uuid>>> + Send;

    /// Read a characteristic value.
    fn read_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// Drives exclusive connect and characteristic-read flows through the
/// adapter lock.
pub struct BleEngine<D, C> {
    adapters: Arc<AdapterManager<D, C>>,
    connecting: Mutex<HashSet<String>>,
    query_slot: AtomicBool,
}

impl<D, C> BleEngine<D, C>
where
    D: RadioDriver,
    C: CommandRunner,
{
    /// Create an engine over the shared adapter manager.
    pub fn new(adapters: Arc<AdapterManager<D, C>>) -> Self {
        Self {
            adapters,
            connecting: Mutex::new(HashSet::new()),
            query_slot: AtomicBool::new(false),
        }
    }

    /// Try to take the single system-wide query slot.
    ///
    /// Characteristic reads are bounded to one in flight because the
    /// underlying driver cannot multiplex GATT reliably. Returns `false` if
    /// the slot is already held; callers must not query without it.
    #[must_use]
    pub fn try_acquire_query_slot(&self) -> bool {
        self.query_slot
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Release the query slot.
    pub fn release_query_slot(&self) {
        self.query_slot.store(false, Ordering::SeqCst);
    }

    /// Connect to a peripheral, holding the adapter lock on success.
    ///
    /// Retries up to 5 times within a 10 second overall deadline; an attempt
    /// that strands the peripheral in a transitional "connecting" state is
    /// cancelled with a forced disconnect before the next try. The adapter
    /// lock is always released on any failure path; on success the caller
    /// owns it until disconnect/unlock.
    ///
    /// # Errors
    ///
    /// - [`RoomsenseError::NonConnectable`] for non-connectable peripherals
    /// - [`RoomsenseError::AlreadyConnecting`] if an attempt is in flight
    /// - [`RoomsenseError::ConnectionTimedOut`] /
    ///   [`RoomsenseError::ConnectionRetriesExceeded`] on exhaustion
    /// - adapter lock contention errors from [`AdapterManager::lock`]
    pub async fn connect<P: Peripheral>(&self, peripheral: &P) -> Result<()> {
        let id = peripheral.id();

        if !peripheral.connectable() {
            return Err(RoomsenseError::NonConnectable(id));
        }
        if peripheral.connection_state() == ConnectionState::Connected {
            return Ok(());
        }
        {
            let mut connecting = self.connecting.lock().expect("connecting set poisoned");
            if !connecting.insert(id.clone()) {
                return Err(RoomsenseError::AlreadyConnecting(id));
            }
        }

        let result = self.connect_locked(peripheral, &id).await;

        self.connecting
            .lock()
            .expect("connecting set poisoned")
            .remove(&id);
        result
    }

    async fn connect_locked<P: Peripheral>(&self, peripheral: &P, id: &str) -> Result<()> {
        let adapter = self.adapters.le_adapter();
        self.adapters.lock(adapter).await?;

        let attempt = |remaining: Duration| {
            let peripheral = peripheral.clone();
            async move {
                let connecting = peripheral.clone();
                let outcome =
                    match run_with_deadline(remaining, async move { connecting.connect().await })
                        .await
                    {
                        Ok(Ok(())) => return Ok(()),
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(RoomsenseError::ConnectionTimedOut {
                            peripheral: peripheral.id(),
                        }),
                    };

                // The abandoned attempt can leave the link half-open; force a
                // disconnect so the next attempt starts clean.
                if peripheral.connection_state() == ConnectionState::Connecting {
                    let stuck = peripheral.clone();
                    let _ = run_with_deadline(DISCONNECT_TIMEOUT, async move {
                        stuck.disconnect().await
                    })
                    .await;
                }
                outcome
            }
        };

        let result = retry_with_deadline(
            CONNECT_ATTEMPTS,
            CONNECT_DEADLINE,
            CONNECT_RETRY_PAUSE,
            attempt,
        )
        .await;

        match result {
            Ok(()) => {
                debug!(peripheral = id, "connected");
                Ok(())
            }
            Err(err) => {
                self.adapters.unlock(adapter).await;
                Err(match err {
                    RetryError::DeadlineExceeded => RoomsenseError::ConnectionTimedOut {
                        peripheral: id.to_owned(),
                    },
                    RetryError::RetriesExceeded { attempts, .. } => {
                        RoomsenseError::ConnectionRetriesExceeded {
                            peripheral: id.to_owned(),
                            attempts,
                        }
                    }
                })
            }
        }
    }

    /// Disconnect from a peripheral. No-op unless the link is connecting or
    /// connected. A disconnect that fails or times out usually means a wedged
    /// driver, so it escalates to a full adapter reset.
    pub async fn disconnect<P: Peripheral>(&self, peripheral: &P) {
        if !matches!(
            peripheral.connection_state(),
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return;
        }

        let target = peripheral.clone();
        let outcome =
            run_with_deadline(DISCONNECT_TIMEOUT, async move { target.disconnect().await }).await;

        let failed = !matches!(outcome, Ok(Ok(())));
        if failed {
            warn!(
                peripheral = peripheral.id(),
                "disconnect failed, resetting adapter"
            );
            if let Err(e) = self.adapters.reset(self.adapters.le_adapter()).await {
                debug!(error = %e, "adapter reset skipped");
            }
        }
    }

    /// Read one GATT characteristic, degrading to `None` on any hardware
    /// hiccup.
    ///
    /// The caller must hold the query slot (see
    /// [`BleEngine::try_acquire_query_slot`]); without it the call refuses
    /// and returns `None`. All steps share a single 15 second deadline that
    /// shrinks as earlier steps consume it. A timed-out read additionally
    /// schedules an adapter reset since the driver is assumed stuck.
    /// Regardless of outcome, the peripheral is disconnected and the adapter
    /// lock released.
    pub async fn query<P: Peripheral>(
        &self,
        peripheral: &P,
        service: Uuid,
        characteristic: Uuid,
    ) -> Option<Vec<u8>> {
        if !self.query_slot.load(Ordering::SeqCst) {
            warn!(
                peripheral = peripheral.id(),
                "query refused: query slot not held"
            );
            return None;
        }

        let cutoff = Instant::now() + QUERY_DEADLINE;

        if let Err(e) = self.connect(peripheral).await {
            debug!(peripheral = peripheral.id(), error = %e, "query connect failed");
            return None;
        }

        let value = self
            .query_connected(peripheral, service, characteristic, cutoff)
            .await;

        // Guaranteed cleanup: drop the link and the adapter lock no matter
        // how the query went.
        if !matches!(
            peripheral.connection_state(),
            ConnectionState::Disconnecting | ConnectionState::Disconnected
        ) {
            self.disconnect(peripheral).await;
        }
        self.adapters.unlock(self.adapters.le_adapter()).await;

        value
    }

    async fn query_connected<P: Peripheral>(
        &self,
        peripheral: &P,
        service: Uuid,
        characteristic: Uuid,
        cutoff: Instant,
    ) -> Option<Vec<u8>> {
        let id = peripheral.id();

        let remaining = cutoff.saturating_duration_since(Instant::now());
        let probe = peripheral.clone();
        let services = match run_with_deadline(remaining, async move {
            probe.discover_services(&[service]).await
        })
        .await
        {
            Ok(Ok(list)) => list,
            Ok(Err(e)) => {
                debug!(peripheral = id, error = %e, "service discovery failed");
                return None;
            }
            Err(_) => {
                debug!(peripheral = id, "service discovery timed out");
                return None;
            }
        };
        if services.is_empty() || peripheral.connection_state() == ConnectionState::Disconnected {
            return None;
        }

        let remaining = cutoff.saturating_duration_since(Instant::now());
        let probe = peripheral.clone();
        let characteristics = match run_with_deadline(remaining, async move {
            probe
                .discover_characteristics(service, &[characteristic])
                .await
        })
        .await
        {
            Ok(Ok(list)) => list,
            Ok(Err(e)) => {
                debug!(peripheral = id, error = %e, "characteristic discovery failed");
                return None;
            }
            Err(_) => {
                debug!(peripheral = id, "characteristic discovery timed out");
                return None;
            }
        };
        if characteristics.is_empty()
            || peripheral.connection_state() == ConnectionState::Disconnected
        {
            return None;
        }

        let remaining = cutoff.saturating_duration_since(Instant::now());
        let reader = peripheral.clone();
        match run_with_deadline(remaining, async move {
            reader.read_characteristic(service, characteristic).await
        })
        .await
        {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                debug!(peripheral = id, error = %e, "characteristic read failed");
                None
            }
            Err(_) => {
                // A read that never returns means the driver is stuck; reset
                // out of band so this query still returns promptly.
                warn!(peripheral = id, "characteristic read timed out, scheduling reset");
                let adapters = Arc::clone(&self.adapters);
                tokio::spawn(async move {
                    if let Err(e) = adapters.reset(adapters.le_adapter()).await {
                        debug!(error = %e, "adapter reset skipped");
                    }
                });
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterState;
    use crate::classic::testing::MockRunner;
    use crate::testing::MockDriver;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    struct MockPeripheralInner {
        id: String,
        connectable: bool,
        state: Mutex<ConnectionState>,
        /// Scripted connect outcomes; empty means succeed.
        connect_script: Mutex<VecDeque<ConnectOutcome>>,
        disconnect_fails: AtomicBool,
        services: Vec<Uuid>,
        characteristics: Vec<Uuid>,
        value: Vec<u8>,
        read_delay: Mutex<Option<Duration>>,
        disconnect_calls: AtomicUsize,
    }

    #[derive(Clone, Copy)]
    enum ConnectOutcome {
        Ok,
        Fail,
        /// Fail after a delay, leaving the peripheral stuck in Connecting.
        Strand(Duration),
        /// Never complete within any attempt budget.
        Hang(Duration),
    }

    #[derive(Clone)]
    struct MockPeripheral {
        inner: Arc<MockPeripheralInner>,
    }

    impl MockPeripheral {
        fn new(service: Uuid, characteristic: Uuid, value: &[u8]) -> Self {
            Self {
                inner: Arc::new(MockPeripheralInner {
                    id: "f0:99:b6:00:00:01".into(),
                    connectable: true,
                    state: Mutex::new(ConnectionState::Disconnected),
                    connect_script: Mutex::new(VecDeque::new()),
                    disconnect_fails: AtomicBool::new(false),
                    services: vec![service],
                    characteristics: vec![characteristic],
                    value: value.to_vec(),
                    read_delay: Mutex::new(None),
                    disconnect_calls: AtomicUsize::new(0),
                }),
            }
        }

        fn script(self, outcomes: &[ConnectOutcome]) -> Self {
            *self.inner.connect_script.lock().unwrap() = outcomes.iter().copied().collect();
            self
        }

        fn non_connectable(self) -> Self {
            Self {
                inner: Arc::new(MockPeripheralInner {
                    id: self.inner.id.clone(),
                    connectable: false,
                    state: Mutex::new(*self.inner.state.lock().unwrap()),
                    connect_script: Mutex::new(self.inner.connect_script.lock().unwrap().clone()),
                    disconnect_fails: AtomicBool::new(false),
                    services: self.inner.services.clone(),
                    characteristics: self.inner.characteristics.clone(),
                    value: self.inner.value.clone(),
                    read_delay: Mutex::new(None),
                    disconnect_calls: AtomicUsize::new(0),
                }),
            }
        }

        fn with_read_delay(self, delay: Duration) -> Self {
            *self.inner.read_delay.lock().unwrap() = Some(delay);
            self
        }

        fn with_failing_disconnect(self) -> Self {
            self.inner.disconnect_fails.store(true, Ordering::SeqCst);
            self
        }

        fn set_state(&self, state: ConnectionState) {
            *self.inner.state.lock().unwrap() = state;
        }
    }

    impl Peripheral for MockPeripheral {
        fn id(&self) -> String {
            self.inner.id.clone()
        }

        fn connectable(&self) -> bool {
            self.inner.connectable
        }

        fn connection_state(&self) -> ConnectionState {
            *self.inner.state.lock().unwrap()
        }

        async fn connect(&self) -> Result<()> {
            let outcome = self
                .inner
                .connect_script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ConnectOutcome::Ok);
            match outcome {
                ConnectOutcome::Ok => {
                    self.set_state(ConnectionState::Connected);
                    Ok(())
                }
                ConnectOutcome::Fail => Err(RoomsenseError::Driver("connect refused".into())),
                ConnectOutcome::Strand(delay) => {
                    self.set_state(ConnectionState::Connecting);
                    tokio::time::sleep(delay).await;
                    Err(RoomsenseError::Driver("le connection abandoned".into()))
                }
                ConnectOutcome::Hang(delay) => {
                    self.set_state(ConnectionState::Connecting);
                    tokio::time::sleep(delay).await;
                    self.set_state(ConnectionState::Connected);
                    Ok(())
                }
            }
        }

        async fn disconnect(&self) -> Result<()> {
            self.inner.disconnect_calls.fetch_add(1, Ordering::SeqCst);
            if self.inner.disconnect_fails.load(Ordering::SeqCst) {
                return Err(RoomsenseError::Driver("disconnect failed".into()));
            }
            self.set_state(ConnectionState::Disconnected);
            Ok(())
        }

        async fn discover_services(&self, uuids: &[Uuid]) -> Result<Vec<Uuid>> {
            Ok(self
                .inner
                .services
                .iter()
                .filter(|u| uuids.contains(u))
                .copied()
                .collect())
        }

        async fn discover_characteristics(
            &self,
            _service: Uuid,
            uuids: &[Uuid],
        ) -> Result<Vec<Uuid>> {
            Ok(self
                .inner
                .characteristics
                .iter()
                .filter(|u| uuids.contains(u))
                .copied()
                .collect())
        }

        async fn read_characteristic(
            &self,
            _service: Uuid,
            _characteristic: Uuid,
        ) -> Result<Vec<u8>> {
            let delay = *self.inner.read_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.inner.value.clone())
        }
    }

    fn service_uuid() -> Uuid {
        Uuid::parse_str("5403c8a7-5c96-47e9-9ab8-59e373d875a7").unwrap()
    }

    fn char_uuid() -> Uuid {
        Uuid::parse_str("21c46f33-e813-4407-86ae-5c2c1a8b3766").unwrap()
    }

    fn engine(driver: MockDriver) -> BleEngine<MockDriver, MockRunner> {
        let adapters = Arc::new(AdapterManager::new(driver, MockRunner::ok(""), 0));
        BleEngine::new(adapters)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_refuses_non_connectable() {
        let eng = engine(MockDriver::new());
        let peripheral =
            MockPeripheral::new(service_uuid(), char_uuid(), b"1337").non_connectable();

        let err = eng.connect(&peripheral).await.unwrap_err();
        assert!(matches!(err, RoomsenseError::NonConnectable(_)));
        assert_eq!(eng.adapters.state_of(0), AdapterState::Inactive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_success_holds_adapter_lock() {
        let eng = engine(MockDriver::new());
        let peripheral = MockPeripheral::new(service_uuid(), char_uuid(), b"1337");

        eng.connect(&peripheral).await.unwrap();
        assert_eq!(peripheral.connection_state(), ConnectionState::Connected);
        assert_eq!(eng.adapters.state_of(0), AdapterState::InquiryLocked);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_already_connected_is_noop() {
        let eng = engine(MockDriver::new());
        let peripheral = MockPeripheral::new(service_uuid(), char_uuid(), b"1337");
        peripheral.set_state(ConnectionState::Connected);

        eng.connect(&peripheral).await.unwrap();
        assert_eq!(eng.adapters.state_of(0), AdapterState::Inactive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connect_rejected() {
        let eng = Arc::new(engine(MockDriver::new()));
        let peripheral = MockPeripheral::new(service_uuid(), char_uuid(), b"1337")
            .script(&[ConnectOutcome::Hang(Duration::from_secs(2))]);

        let first = {
            let eng = Arc::clone(&eng);
            let peripheral = peripheral.clone();
            tokio::spawn(async move { eng.connect(&peripheral).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = eng.connect(&peripheral).await.unwrap_err();
        assert!(matches!(err, RoomsenseError::AlreadyConnecting(_)));

        first.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_then_succeeds() {
        let eng = engine(MockDriver::new());
        let peripheral = MockPeripheral::new(service_uuid(), char_uuid(), b"1337").script(&[
            ConnectOutcome::Fail,
            ConnectOutcome::Fail,
            ConnectOutcome::Ok,
        ]);

        eng.connect(&peripheral).await.unwrap();
        assert_eq!(peripheral.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_exceeded_releases_lock() {
        let eng = engine(MockDriver::new());
        let peripheral = MockPeripheral::new(service_uuid(), char_uuid(), b"1337")
            .script(&[ConnectOutcome::Fail; 5]);

        let err = eng.connect(&peripheral).await.unwrap_err();
        assert!(matches!(
            err,
            RoomsenseError::ConnectionRetriesExceeded { attempts: 5, .. }
        ));
        assert_eq!(eng.adapters.state_of(0), AdapterState::Inactive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_overall_deadline_releases_lock() {
        let eng = engine(MockDriver::new());
        let peripheral = MockPeripheral::new(service_uuid(), char_uuid(), b"1337")
            .script(&[ConnectOutcome::Hang(Duration::from_secs(30))]);

        let err = eng.connect(&peripheral).await.unwrap_err();
        assert!(matches!(err, RoomsenseError::ConnectionTimedOut { .. }));
        assert_eq!(eng.adapters.state_of(0), AdapterState::Inactive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_connecting_gets_forced_disconnect() {
        let eng = engine(MockDriver::new());
        let peripheral = MockPeripheral::new(service_uuid(), char_uuid(), b"1337").script(&[
            ConnectOutcome::Strand(Duration::from_millis(50)),
            ConnectOutcome::Ok,
        ]);

        eng.connect(&peripheral).await.unwrap();
        assert!(peripheral.inner.disconnect_calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(peripheral.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_noop_when_not_connected() {
        let eng = engine(MockDriver::new());
        let peripheral = MockPeripheral::new(service_uuid(), char_uuid(), b"1337");

        eng.disconnect(&peripheral).await;
        assert_eq!(peripheral.inner.disconnect_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_failure_escalates_to_reset() {
        let driver = MockDriver::new();
        let eng = engine(driver.clone());
        let peripheral =
            MockPeripheral::new(service_uuid(), char_uuid(), b"1337").with_failing_disconnect();
        peripheral.set_state(ConnectionState::Connected);

        eng.disconnect(&peripheral).await;
        assert_eq!(driver.calls_named("reset_bindings"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_refused_without_slot() {
        let eng = engine(MockDriver::new());
        let peripheral = MockPeripheral::new(service_uuid(), char_uuid(), b"1337");

        let value = eng.query(&peripheral, service_uuid(), char_uuid()).await;
        assert_eq!(value, None);
        assert_eq!(peripheral.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_slot_is_single_slot() {
        let eng = engine(MockDriver::new());
        assert!(eng.try_acquire_query_slot());
        assert!(!eng.try_acquire_query_slot());
        eng.release_query_slot();
        assert!(eng.try_acquire_query_slot());
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_reads_value_and_cleans_up() {
        let eng = engine(MockDriver::new());
        let peripheral = MockPeripheral::new(service_uuid(), char_uuid(), b"1337");

        assert!(eng.try_acquire_query_slot());
        let value = eng.query(&peripheral, service_uuid(), char_uuid()).await;
        assert_eq!(value, Some(b"1337".to_vec()));
        assert_eq!(peripheral.connection_state(), ConnectionState::Disconnected);
        assert_eq!(eng.adapters.state_of(0), AdapterState::Inactive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_missing_service_returns_none() {
        let eng = engine(MockDriver::new());
        let other = Uuid::parse_str("00000000-0000-0000-0000-000000000000").unwrap();
        let peripheral = MockPeripheral::new(other, char_uuid(), b"1337");

        assert!(eng.try_acquire_query_slot());
        let value = eng.query(&peripheral, service_uuid(), char_uuid()).await;
        assert_eq!(value, None);
        // Cleanup still ran.
        assert_eq!(peripheral.connection_state(), ConnectionState::Disconnected);
        assert_eq!(eng.adapters.state_of(0), AdapterState::Inactive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_read_timeout_schedules_reset() {
        let driver = MockDriver::new();
        let eng = engine(driver.clone());
        let peripheral = MockPeripheral::new(service_uuid(), char_uuid(), b"1337")
            .with_read_delay(Duration::from_secs(60));

        assert!(eng.try_acquire_query_slot());
        let value = eng.query(&peripheral, service_uuid(), char_uuid()).await;
        assert_eq!(value, None);

        // Let the detached reset task run to completion.
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(driver.calls_named("reset_bindings"), 1);
        assert_eq!(eng.adapters.state_of(0), AdapterState::Inactive);
    }
}
