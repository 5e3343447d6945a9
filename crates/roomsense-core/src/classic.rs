//! Bluetooth Classic inquiries via `hcitool`.
//!
//! Classic devices cannot be observed passively; RSSI and device info come
//! from on-demand shell queries that page the device. Commands run behind the
//! [`CommandRunner`] port so the engine logic is testable without an OS
//! shell. Shell noise is expected: kill-timeouts and I/O-class errors are
//! swallowed quietly, while other failures feed a successive-error counter
//! for external alerting.

use std::future::Future;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::adapter::AdapterManager;
use crate::ble::RadioDriver;
use crate::error::Result;

/// Bound on the `hcitool info` command.
const INFO_TIMEOUT: Duration = Duration::from_secs(6);

/// Bound on the cancel-inquiry command issued after a kill-timeout.
const CANCEL_INQUIRY_TIMEOUT: Duration = Duration::from_secs(2);

static RSSI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"RSSI return value: (-?\d+)").expect("rssi regex is valid")
});
static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)Device Name: (.+)$").expect("name regex is valid"));
static OUI_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)OUI Company: ([^(\n]+)").expect("oui regex is valid"));

/// Captured output of a completed shell command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Standard output, lossily decoded.
    pub stdout: String,
    /// Standard error, lossily decoded.
    pub stderr: String,
}

/// Failure modes of a shell execution.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The command did not finish before the timeout and was killed.
    #[error("command timed out and was killed")]
    Timeout,

    /// The command could not be spawned or its pipes failed.
    #[error("I/O error running command: {0}")]
    Io(#[from] std::io::Error),

    /// The command ran but exited unsuccessfully.
    #[error("command exited with status {status}: {stderr}")]
    Failed {
        /// Process exit code (`-1` when terminated by signal).
        status: i32,
        /// Captured standard error.
        stderr: String,
    },
}

/// Port over shell command execution.
pub trait CommandRunner: Send + Sync + 'static {
    /// Run `program` with `args`, killing it after `timeout`.
    fn run(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> impl Future<Output = std::result::Result<CommandOutput, ExecError>> + Send;
}

/// Production [`CommandRunner`] over `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellCommandRunner;

impl CommandRunner for ShellCommandRunner {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> std::result::Result<CommandOutput, ExecError> {
        let child = tokio::process::Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the timed-out wait future kills the child.
            .kill_on_drop(true)
            .spawn()?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                if output.status.success() {
                    Ok(CommandOutput { stdout, stderr })
                } else {
                    Err(ExecError::Failed {
                        status: output.status.code().unwrap_or(-1),
                        stderr,
                    })
                }
            }
            Ok(Err(e)) => Err(ExecError::Io(e)),
            Err(_) => Err(ExecError::Timeout),
        }
    }
}

/// Name and manufacturer of a Classic device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// Bluetooth address.
    pub address: String,
    /// Device name; falls back to the address when unparseable.
    pub name: String,
    /// OUI company, when the radio reports one.
    pub manufacturer: Option<String>,
}

impl DeviceInfo {
    fn address_only(address: &str) -> Self {
        Self {
            address: address.to_owned(),
            name: address.to_owned(),
            manufacturer: None,
        }
    }
}

/// Drives on-demand Classic RSSI and info queries through the adapter lock.
pub struct ClassicEngine<D, C> {
    adapters: Arc<AdapterManager<D, C>>,
    commands: C,
    scan_time_limit: Duration,
    successive_errors: AtomicU32,
}

impl<D, C> ClassicEngine<D, C>
where
    D: RadioDriver,
    C: CommandRunner,
{
    /// Create an engine over the shared adapter manager.
    pub fn new(adapters: Arc<AdapterManager<D, C>>, commands: C, scan_time_limit: Duration) -> Self {
        Self {
            adapters,
            commands,
            scan_time_limit,
            successive_errors: AtomicU32::new(0),
        }
    }

    /// Consecutive hard command failures since the last successful inquiry.
    #[must_use]
    pub fn successive_errors(&self) -> u32 {
        self.successive_errors.load(Ordering::SeqCst)
    }

    /// Page a device and read its RSSI.
    ///
    /// The shell command is bounded by twice the configured scan time limit
    /// as an outer safety bound. Kill-timeouts cancel the inquiry and I/O
    /// errors are logged quietly; neither counts as a hard failure. Any other
    /// command error increments the successive-error counter, and only a
    /// successfully parsed reading resets it. The adapter is always unlocked
    /// on the way out.
    ///
    /// # Errors
    ///
    /// Adapter lock contention from [`AdapterManager::lock`]; hardware noise
    /// never propagates and yields `Ok(None)` instead.
    pub async fn inquire_rssi(&self, adapter: u16, address: &str) -> Result<Option<i16>> {
        self.adapters.lock(adapter).await?;

        let hci = format!("hci{adapter}");
        let command = format!("hcitool -i {hci} cc {address} && hcitool -i {hci} rssi {address}");
        let outcome = self
            .commands
            .run("sh", &["-c", command.as_str()], self.scan_time_limit * 2)
            .await;

        let rssi = match outcome {
            Ok(output) => {
                let rssi = parse_rssi(&output.stdout);
                // Only a reading we could actually parse counts as recovery.
                if rssi.is_some() {
                    self.successive_errors.store(0, Ordering::SeqCst);
                }
                rssi
            }
            Err(ExecError::Timeout) => {
                debug!(adapter, address, "rssi inquiry killed, cancelling inquiry");
                if let Err(e) = self
                    .commands
                    .run(
                        "hcitool",
                        &["-i", hci.as_str(), "cmd", "0x01", "0x0008"],
                        CANCEL_INQUIRY_TIMEOUT,
                    )
                    .await
                {
                    debug!(adapter, error = %e, "cancel inquiry failed");
                }
                None
            }
            Err(ExecError::Io(e)) => {
                debug!(adapter, address, error = %e, "rssi inquiry I/O error");
                None
            }
            Err(e) => {
                let errors = self.successive_errors.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(adapter, address, error = %e, errors, "rssi inquiry failed");
                None
            }
        };

        self.adapters.unlock(adapter).await;
        Ok(rssi)
    }

    /// Read a device's name and manufacturer.
    ///
    /// Falls back to an address-only record on any failure. The adapter is
    /// always unlocked on the way out.
    ///
    /// # Errors
    ///
    /// Adapter lock contention from [`AdapterManager::lock`].
    pub async fn inquire_device_info(&self, adapter: u16, address: &str) -> Result<DeviceInfo> {
        self.adapters.lock(adapter).await?;

        let hci = format!("hci{adapter}");
        let outcome = self
            .commands
            .run("hcitool", &["-i", hci.as_str(), "info", address], INFO_TIMEOUT)
            .await;

        let info = match outcome {
            Ok(output) => parse_device_info(address, &output.stdout),
            Err(e) => {
                debug!(adapter, address, error = %e, "device info inquiry failed");
                DeviceInfo::address_only(address)
            }
        };

        self.adapters.unlock(adapter).await;
        Ok(info)
    }
}

fn parse_rssi(stdout: &str) -> Option<i16> {
    RSSI_RE
        .captures(stdout)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn parse_device_info(address: &str, stdout: &str) -> DeviceInfo {
    let name = NAME_RE
        .captures(stdout)
        .and_then(|c| c.get(1))
        .map_or_else(|| address.to_owned(), |m| m.as_str().trim().to_owned());
    let manufacturer = OUI_RE
        .captures(stdout)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_owned());

    DeviceInfo {
        address: address.to_owned(),
        name,
        manufacturer,
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{out, MockRunner};
    use super::*;
    use crate::adapter::AdapterState;
    use crate::error::RoomsenseError;
    use crate::testing::MockDriver;

    const RSSI_OUTPUT: &str = "RSSI return value: -42\n";
    const INFO_OUTPUT: &str = "\
Requesting information ...
\tBD Address:  F0:99:B6:00:00:01
\tDevice Name: Dana's Phone
\tLMP Version: 5.0 (0x9) LMP Subversion: 0x4307
\tManufacturer: Broadcom Corporation (15)
\tOUI Company: Apple, Inc. (F0-99-B6)
";

    fn engine(
        runner: MockRunner,
    ) -> ClassicEngine<MockDriver, MockRunner> {
        let adapters = Arc::new(AdapterManager::new(
            MockDriver::new(),
            MockRunner::ok(""),
            0,
        ));
        ClassicEngine::new(adapters, runner, Duration::from_secs(6))
    }

    #[tokio::test(start_paused = true)]
    async fn test_rssi_parsed_and_counter_reset() {
        let eng = engine(MockRunner::script(vec![out(RSSI_OUTPUT)]));
        eng.successive_errors.store(3, Ordering::SeqCst);

        let rssi = eng.inquire_rssi(0, "f0:99:b6:00:00:01").await.unwrap();
        assert_eq!(rssi, Some(-42));
        assert_eq!(eng.successive_errors(), 0);
        assert_eq!(eng.adapters.state_of(0), AdapterState::Inactive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rssi_command_line_shape() {
        let runner = MockRunner::ok(RSSI_OUTPUT);
        let eng = {
            let adapters = Arc::new(AdapterManager::new(
                MockDriver::new(),
                MockRunner::ok(""),
                0,
            ));
            ClassicEngine::new(adapters, runner, Duration::from_secs(6))
        };

        eng.inquire_rssi(1, "f0:99:b6:00:00:01").await.unwrap();
        let calls = eng.commands.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("sh -c"));
        assert!(calls[0].contains("hcitool -i hci1 cc f0:99:b6:00:00:01"));
        assert!(calls[0].contains("&& hcitool -i hci1 rssi f0:99:b6:00:00:01"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kill_timeout_cancels_inquiry_without_counting() {
        let eng = engine(MockRunner::script(vec![Err(ExecError::Timeout)]));

        let rssi = eng.inquire_rssi(0, "f0:99:b6:00:00:01").await.unwrap();
        assert_eq!(rssi, None);
        assert_eq!(eng.successive_errors(), 0);

        let calls = eng.commands.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1], "hcitool -i hci0 cmd 0x01 0x0008");
        assert_eq!(eng.adapters.state_of(0), AdapterState::Inactive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_io_error_not_counted() {
        let eng = engine(MockRunner::script(vec![Err(ExecError::Io(
            std::io::Error::new(std::io::ErrorKind::Other, "hci device busy"),
        ))]));

        let rssi = eng.inquire_rssi(0, "f0:99:b6:00:00:01").await.unwrap();
        assert_eq!(rssi, None);
        assert_eq!(eng.successive_errors(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_errors_count_until_success() {
        let eng = engine(MockRunner::script(vec![
            Err(ExecError::Failed {
                status: 1,
                stderr: "Can't create connection".into(),
            }),
            Err(ExecError::Failed {
                status: 1,
                stderr: "Can't create connection".into(),
            }),
            out(RSSI_OUTPUT),
        ]));

        assert_eq!(eng.inquire_rssi(0, "aa").await.unwrap(), None);
        assert_eq!(eng.successive_errors(), 1);
        assert_eq!(eng.inquire_rssi(0, "aa").await.unwrap(), None);
        assert_eq!(eng.successive_errors(), 2);
        assert_eq!(eng.inquire_rssi(0, "aa").await.unwrap(), Some(-42));
        assert_eq!(eng.successive_errors(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unparseable_output_does_not_reset_counter() {
        let eng = engine(MockRunner::script(vec![
            Err(ExecError::Failed {
                status: 1,
                stderr: "Can't create connection".into(),
            }),
            // Zero exit but no RSSI line: not a recovery.
            out("Not connected.\n"),
            out(RSSI_OUTPUT),
        ]));

        assert_eq!(eng.inquire_rssi(0, "aa").await.unwrap(), None);
        assert_eq!(eng.successive_errors(), 1);
        assert_eq!(eng.inquire_rssi(0, "aa").await.unwrap(), None);
        assert_eq!(eng.successive_errors(), 1);
        assert_eq!(eng.inquire_rssi(0, "aa").await.unwrap(), Some(-42));
        assert_eq!(eng.successive_errors(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_contention_propagates() {
        let eng = engine(MockRunner::ok(RSSI_OUTPUT));
        eng.adapters.lock(0).await.unwrap();

        let err = eng.inquire_rssi(0, "aa").await.unwrap_err();
        assert!(matches!(err, RoomsenseError::AdapterAlreadyLocked(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_info_parsed() {
        let eng = engine(MockRunner::script(vec![out(INFO_OUTPUT)]));

        let info = eng
            .inquire_device_info(0, "F0:99:B6:00:00:01")
            .await
            .unwrap();
        assert_eq!(info.name, "Dana's Phone");
        assert_eq!(info.manufacturer.as_deref(), Some("Apple, Inc."));
        assert_eq!(eng.adapters.state_of(0), AdapterState::Inactive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_info_falls_back_to_address() {
        let eng = engine(MockRunner::script(vec![out("Requesting information ...\n")]));

        let info = eng.inquire_device_info(0, "aa:bb:cc:dd:ee:ff").await.unwrap();
        assert_eq!(info.name, "aa:bb:cc:dd:ee:ff");
        assert_eq!(info.manufacturer, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_info_error_yields_address_only() {
        let eng = engine(MockRunner::script(vec![Err(ExecError::Failed {
            status: 1,
            stderr: "Request timed out".into(),
        })]));

        let info = eng.inquire_device_info(0, "aa:bb:cc:dd:ee:ff").await.unwrap();
        assert_eq!(info, DeviceInfo::address_only("aa:bb:cc:dd:ee:ff"));
        assert_eq!(eng.adapters.state_of(0), AdapterState::Inactive);
    }

    #[test]
    fn test_parse_rssi_variants() {
        assert_eq!(parse_rssi("RSSI return value: -7\n"), Some(-7));
        assert_eq!(parse_rssi("RSSI return value: 0\n"), Some(0));
        assert_eq!(parse_rssi("Not connected.\n"), None);
    }
}
