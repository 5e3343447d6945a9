//! Shared test doubles.

use std::sync::{Arc, Mutex};

use crate::ble::RadioDriver;
use crate::error::Result;

/// Radio driver that records calls and always succeeds.
#[derive(Clone, Default)]
pub(crate) struct MockDriver {
    calls: Arc<Mutex<Vec<&'static str>>>,
}

impl MockDriver {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn record(&self, name: &'static str) {
        self.calls.lock().unwrap().push(name);
    }

    /// Number of recorded calls with this name.
    pub(crate) fn calls_named(&self, name: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == name).count()
    }
}

impl RadioDriver for MockDriver {
    fn start_scanning(&self, _allow_duplicates: bool) -> impl std::future::Future<Output = Result<()>> + Send {
        self.record("start_scanning");
        async { Ok(()) }
    }

    fn stop_scanning(&self) -> impl std::future::Future<Output = Result<()>> + Send {
        self.record("stop_scanning");
        async { Ok(()) }
    }

    fn reset_bindings(&self) -> impl std::future::Future<Output = Result<()>> + Send {
        self.record("reset_bindings");
        async { Ok(()) }
    }
}
