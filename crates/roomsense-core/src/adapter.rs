//! Bluetooth adapter arbitration.
//!
//! A single physical radio is shared between continuous passive scanning and
//! exclusive on-demand inquiries. This module owns the per-adapter state
//! table and serializes access through an explicit lock state machine rather
//! than a queue: a second locker fails immediately and retries on its own
//! schedule.
//!
//! Two watchdogs keep the radio healthy:
//! - a deadlock sweep that force-unlocks adapters stuck in an inquiry lock
//! - a scanner check that resets the low-energy adapter when discovery goes
//!   quiet for too long

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::ble::{RadioDriver, RadioEvent};
use crate::classic::CommandRunner;
use crate::error::{Result, RoomsenseError};

/// How often the deadlock sweep runs.
pub const DEADLOCK_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// An inquiry lock held longer than this is considered leaked and is
/// force-released by the sweep.
pub const DEADLOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// How often the scanner health check runs.
pub const SCANNER_CHECK_INTERVAL: Duration = Duration::from_secs(15);

/// No discovery for this long (measured from the later of the last discovery
/// and the current state's start) triggers an adapter reset.
pub const NO_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on the `hciconfig reset` shell command.
const RESET_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after the hardware reset before re-initializing driver bindings.
const RESET_SETTLE_DELAY: Duration = Duration::from_secs(5);

/// A discovery arriving this soon after a reset started is treated as an
/// implicit scan start. Heuristic: the driver can deliver a discovery from
/// the scan that was active just before the reset began.
const RESET_DISCOVERY_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle state of one physical adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// Idle; neither scanning nor locked.
    Inactive,
    /// Continuous passive discovery is running.
    Scanning,
    /// Exclusively claimed for an on-demand inquiry.
    InquiryLocked,
    /// A hardware reset is in progress.
    Resetting,
}

/// Per-adapter record. Every transition stamps `started_at`.
#[derive(Debug, Clone, Copy)]
pub struct AdapterRecord {
    /// Current lifecycle state.
    pub state: AdapterState,
    /// When the current state was entered.
    pub started_at: Instant,
}

impl AdapterRecord {
    fn new(state: AdapterState) -> Self {
        Self {
            state,
            started_at: Instant::now(),
        }
    }
}

/// Arbitrates all physical radios for this node.
///
/// One instance is constructed at startup and handed by `Arc` to the engines;
/// the state table is never a process-global.
pub struct AdapterManager<D, C> {
    driver: D,
    commands: C,
    le_adapter: u16,
    records: Mutex<HashMap<u16, AdapterRecord>>,
    last_discovery: Mutex<Option<Instant>>,
    powered_on: AtomicBool,
    discoveries: AtomicU64,
}

impl<D, C> AdapterManager<D, C>
where
    D: RadioDriver,
    C: CommandRunner,
{
    /// Create a manager for the given low-energy adapter index.
    pub fn new(driver: D, commands: C, le_adapter: u16) -> Self {
        Self {
            driver,
            commands,
            le_adapter,
            records: Mutex::new(HashMap::new()),
            last_discovery: Mutex::new(None),
            powered_on: AtomicBool::new(false),
            discoveries: AtomicU64::new(0),
        }
    }

    /// The adapter index used for low-energy scanning.
    #[must_use]
    pub fn le_adapter(&self) -> u16 {
        self.le_adapter
    }

    /// Current state of an adapter. Unknown adapters report `Inactive`.
    #[must_use]
    pub fn state_of(&self, adapter: u16) -> AdapterState {
        self.records
            .lock()
            .expect("adapter table poisoned")
            .get(&adapter)
            .map_or(AdapterState::Inactive, |r| r.state)
    }

    /// Total raw discovery events observed since startup.
    #[must_use]
    pub fn discovery_count(&self) -> u64 {
        self.discoveries.load(Ordering::Relaxed)
    }

    fn set_state(&self, adapter: u16, state: AdapterState) {
        self.records
            .lock()
            .expect("adapter table poisoned")
            .insert(adapter, AdapterRecord::new(state));
    }

    /// Claim an adapter for an exclusive inquiry.
    ///
    /// Stops active scanning first when the adapter is mid-scan.
    ///
    /// # Errors
    ///
    /// - [`RoomsenseError::AdapterAlreadyLocked`] if another inquiry holds it
    /// - [`RoomsenseError::AdapterResetting`] if a reset is in progress
    pub async fn lock(&self, adapter: u16) -> Result<()> {
        let was_scanning = {
            let mut records = self.records.lock().expect("adapter table poisoned");
            let state = records.get(&adapter).map_or(AdapterState::Inactive, |r| r.state);
            match state {
                AdapterState::InquiryLocked => {
                    return Err(RoomsenseError::AdapterAlreadyLocked(adapter))
                }
                AdapterState::Resetting => return Err(RoomsenseError::AdapterResetting(adapter)),
                AdapterState::Scanning | AdapterState::Inactive => {
                    // Claim under the table lock so a racing locker fails.
                    records.insert(adapter, AdapterRecord::new(AdapterState::InquiryLocked));
                    state == AdapterState::Scanning
                }
            }
        };

        if was_scanning {
            if let Err(e) = self.driver.stop_scanning().await {
                warn!(adapter, error = %e, "failed to stop scanning before inquiry");
            }
        }

        debug!(adapter, "adapter locked for inquiry");
        Ok(())
    }

    /// Release an inquiry lock. No-op unless the adapter is currently locked.
    ///
    /// Releasing the low-energy adapter re-evaluates its state so passive
    /// scanning resumes when the radio is powered on.
    pub async fn unlock(&self, adapter: u16) {
        {
            let mut records = self.records.lock().expect("adapter table poisoned");
            match records.get(&adapter) {
                Some(r) if r.state == AdapterState::InquiryLocked => {
                    records.insert(adapter, AdapterRecord::new(AdapterState::Inactive));
                }
                _ => return,
            }
        }

        debug!(adapter, "adapter unlocked");
        if adapter == self.le_adapter {
            self.evaluate_state().await;
        }
    }

    /// Reset a wedged adapter.
    ///
    /// For the low-energy adapter: stop scanning, issue a bounded hardware
    /// reset, wait for the radio to settle, re-initialize driver bindings,
    /// and return to `Inactive` only if no concurrent caller moved the state
    /// elsewhere. Other adapters get the hardware command only.
    ///
    /// # Errors
    ///
    /// [`RoomsenseError::AdapterAlreadyResetting`] if a reset is in flight.
    pub async fn reset(&self, adapter: u16) -> Result<()> {
        {
            let mut records = self.records.lock().expect("adapter table poisoned");
            if records.get(&adapter).map(|r| r.state) == Some(AdapterState::Resetting) {
                return Err(RoomsenseError::AdapterAlreadyResetting(adapter));
            }
            records.insert(adapter, AdapterRecord::new(AdapterState::Resetting));
        }
        info!(adapter, "resetting adapter");

        if adapter == self.le_adapter {
            if let Err(e) = self.driver.stop_scanning().await {
                debug!(adapter, error = %e, "stop scanning during reset failed");
            }
            self.run_hardware_reset(adapter).await;
            tokio::time::sleep(RESET_SETTLE_DELAY).await;
            if let Err(e) = self.driver.reset_bindings().await {
                warn!(adapter, error = %e, "re-initializing driver bindings failed");
            }

            {
                let mut records = self.records.lock().expect("adapter table poisoned");
                // A discovery inside the grace window may have already moved
                // the state to Scanning; leave it alone in that case.
                if records.get(&adapter).map(|r| r.state) == Some(AdapterState::Resetting) {
                    records.insert(adapter, AdapterRecord::new(AdapterState::Inactive));
                }
            }
            self.evaluate_state().await;
        } else {
            self.run_hardware_reset(adapter).await;
            self.set_state(adapter, AdapterState::Inactive);
        }

        Ok(())
    }

    async fn run_hardware_reset(&self, adapter: u16) {
        let hci = format!("hci{adapter}");
        if let Err(e) = self
            .commands
            .run("hciconfig", &[hci.as_str(), "reset"], RESET_COMMAND_TIMEOUT)
            .await
        {
            warn!(adapter, error = %e, "hciconfig reset failed");
        }
    }

    /// Resume passive scanning when the low-energy adapter is idle and the
    /// radio reports powered on. The driver's scan-start callback drives the
    /// state to `Scanning`.
    async fn evaluate_state(&self) {
        if !self.powered_on.load(Ordering::SeqCst) {
            return;
        }
        if self.state_of(self.le_adapter) != AdapterState::Inactive {
            return;
        }
        if let Err(e) = self.driver.start_scanning(true).await {
            warn!(error = %e, "failed to resume scanning");
        }
    }

    /// Feed a radio driver event into the state machine.
    pub async fn handle_event(&self, event: RadioEvent) {
        match event {
            RadioEvent::PoweredOn => {
                self.powered_on.store(true, Ordering::SeqCst);
                let state = self.state_of(self.le_adapter);
                if matches!(state, AdapterState::Inactive | AdapterState::Resetting) {
                    if let Err(e) = self.driver.start_scanning(true).await {
                        warn!(error = %e, "failed to start scanning on power on");
                    }
                }
            }
            RadioEvent::PoweredOff => {
                self.powered_on.store(false, Ordering::SeqCst);
            }
            RadioEvent::ScanStarted => {
                self.set_state(self.le_adapter, AdapterState::Scanning);
            }
            RadioEvent::ScanStopped => {
                let mut records = self.records.lock().expect("adapter table poisoned");
                if records.get(&self.le_adapter).map(|r| r.state) == Some(AdapterState::Scanning) {
                    records.insert(self.le_adapter, AdapterRecord::new(AdapterState::Inactive));
                }
            }
            RadioEvent::Discovered(_) => {
                *self.last_discovery.lock().expect("discovery stamp poisoned") =
                    Some(Instant::now());
                self.discoveries.fetch_add(1, Ordering::Relaxed);

                let mut records = self.records.lock().expect("adapter table poisoned");
                let record = records
                    .get(&self.le_adapter)
                    .copied()
                    .unwrap_or_else(|| AdapterRecord::new(AdapterState::Inactive));
                let implicit_scan_start = match record.state {
                    AdapterState::Inactive => true,
                    AdapterState::Resetting => {
                        record.started_at.elapsed() <= RESET_DISCOVERY_GRACE
                    }
                    _ => false,
                };
                if implicit_scan_start {
                    records.insert(self.le_adapter, AdapterRecord::new(AdapterState::Scanning));
                }
            }
            RadioEvent::Warning(message) => {
                warn!(adapter = self.le_adapter, message, "radio driver warning");
            }
        }
    }

    /// Force-release inquiry locks held past [`DEADLOCK_TIMEOUT`].
    ///
    /// Safety valve against callers that fail to unlock on an unhandled code
    /// path.
    pub async fn unlock_deadlocked(&self) {
        let stuck: Vec<u16> = {
            let records = self.records.lock().expect("adapter table poisoned");
            records
                .iter()
                .filter(|(_, r)| {
                    r.state == AdapterState::InquiryLocked
                        && r.started_at.elapsed() > DEADLOCK_TIMEOUT
                })
                .map(|(id, _)| *id)
                .collect()
        };

        for adapter in stuck {
            warn!(
                adapter,
                timeout_secs = DEADLOCK_TIMEOUT.as_secs(),
                "force-unlocking deadlocked adapter"
            );
            self.unlock(adapter).await;
        }
    }

    /// Reset the low-energy adapter when no discovery has been observed for
    /// [`NO_ACTIVITY_TIMEOUT`], measured from the later of the last discovery
    /// and the current state's start.
    pub async fn verify_scanner(&self) {
        let reference = {
            let records = self.records.lock().expect("adapter table poisoned");
            let Some(record) = records.get(&self.le_adapter) else {
                return;
            };
            let last = *self.last_discovery.lock().expect("discovery stamp poisoned");
            last.map_or(record.started_at, |d| d.max(record.started_at))
        };

        if reference.elapsed() > NO_ACTIVITY_TIMEOUT {
            info!(
                adapter = self.le_adapter,
                idle_secs = reference.elapsed().as_secs(),
                "no scanner activity, resetting adapter"
            );
            if let Err(e) = self.reset(self.le_adapter).await {
                debug!(error = %e, "scanner reset skipped");
            }
        }
    }

    /// Spawn the two periodic watchdog tasks. They run independently of any
    /// in-flight operation and tolerate active locks.
    pub fn spawn_watchdogs(self: Arc<Self>) -> (JoinHandle<()>, JoinHandle<()>) {
        let sweeper = Arc::clone(&self);
        let deadlock = tokio::spawn(async move {
            let mut tick = tokio::time::interval(DEADLOCK_SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                sweeper.unlock_deadlocked().await;
            }
        });

        let checker = self;
        let scanner = tokio::spawn(async move {
            let mut tick = tokio::time::interval(SCANNER_CHECK_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                checker.verify_scanner().await;
            }
        });

        (deadlock, scanner)
    }

    /// Stop scanning on shutdown unless the adapter is mid-inquiry.
    pub async fn shutdown(&self) {
        if self.state_of(self.le_adapter) != AdapterState::InquiryLocked {
            if let Err(e) = self.driver.stop_scanning().await {
                debug!(error = %e, "stop scanning on shutdown failed");
            }
        }
    }
}
