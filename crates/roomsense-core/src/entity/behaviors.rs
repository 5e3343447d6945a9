//! Time-based transforms between raw property writes and committed values.
//!
//! Behaviors are configured per property path as an ordered chain; each
//! stage's commit becomes the next stage's input write, and only the final
//! commit reaches the entity's change log. Timers are plain tokio tasks held
//! per stage, aborted and replaced on re-write, so paused-clock tests drive
//! them deterministically.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Recompute cadence for rolling averages.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// A committed-value consumer; the tail of every chain feeds the entity's
/// change log.
pub(crate) type Sink = Arc<dyn Fn(Value) + Send + Sync>;

/// One stage of a behavior chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageSpec {
    /// Delay commitment until the value settles.
    Debounce {
        /// Quiet period required before (or after, in leading mode) a commit.
        delay: Duration,
        /// Commit the first value of a burst instead of the last.
        leading: bool,
    },
    /// Time-weighted smoothing of numeric samples over a trailing window.
    RollingAverage {
        /// Trailing window length.
        window: Duration,
    },
}

/// Behavior chain configuration for one property path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BehaviorSpec {
    /// Slash-delimited property path, e.g. `/state` or `/attributes/rssi`.
    pub path: String,
    /// Stages in application order.
    pub stages: Vec<StageSpec>,
}

impl BehaviorSpec {
    /// Behavior chain for the entity's state property.
    #[must_use]
    pub fn state(stages: Vec<StageSpec>) -> Self {
        Self {
            path: "/state".into(),
            stages,
        }
    }

    /// Behavior chain for a named attribute.
    #[must_use]
    pub fn attribute(key: &str, stages: Vec<StageSpec>) -> Self {
        Self {
            path: format!("/attributes/{key}"),
            stages,
        }
    }
}

/// Compose stages back-to-front so writes traverse them in configured order.
pub(crate) fn build_chain(stages: Vec<StageSpec>, commit: Sink) -> Sink {
    let mut sink = commit;
    for spec in stages.into_iter().rev() {
        sink = match spec {
            StageSpec::Debounce { delay, leading } => Debounce::new(delay, leading, sink).into_sink(),
            StageSpec::RollingAverage { window } => RollingAverage::new(window, sink).into_sink(),
        };
    }
    sink
}

// =============================================================================
// DEBOUNCE
// =============================================================================

struct DebounceInner {
    pending: Option<Value>,
    timer: Option<JoinHandle<()>>,
    /// Leading mode: a burst is active and further writes are suppressed.
    suppressing: bool,
}

struct Debounce {
    delay: Duration,
    leading: bool,
    next: Sink,
    inner: Mutex<DebounceInner>,
}

impl Debounce {
    fn new(delay: Duration, leading: bool, next: Sink) -> Self {
        Self {
            delay,
            leading,
            next,
            inner: Mutex::new(DebounceInner {
                pending: None,
                timer: None,
                suppressing: false,
            }),
        }
    }

    fn into_sink(self) -> Sink {
        let stage = Arc::new(self);
        Arc::new(move |value| Self::write(&stage, value))
    }

    fn write(this: &Arc<Self>, value: Value) {
        if this.leading {
            Self::write_leading(this, value);
        } else {
            Self::write_trailing(this, value);
        }
    }

    /// Trailing: every write resets the timer; only the last value of a
    /// quiet-terminated burst commits.
    fn write_trailing(this: &Arc<Self>, value: Value) {
        let mut inner = this.inner.lock().expect("debounce state poisoned");
        inner.pending = Some(value);
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }

        let stage = Arc::clone(this);
        inner.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(stage.delay).await;
            let pending = {
                let mut inner = stage.inner.lock().expect("debounce state poisoned");
                inner.timer = None;
                inner.pending.take()
            };
            if let Some(value) = pending {
                (stage.next)(value);
            }
        }));
    }

    /// Leading: the first write of a burst commits immediately; later writes
    /// are dropped until the burst goes quiet for `delay`.
    fn write_leading(this: &Arc<Self>, value: Value) {
        let commit_now = {
            let mut inner = this.inner.lock().expect("debounce state poisoned");
            if let Some(timer) = inner.timer.take() {
                timer.abort();
            }
            let first_of_burst = !inner.suppressing;
            inner.suppressing = true;

            let stage = Arc::clone(this);
            inner.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(stage.delay).await;
                let mut inner = stage.inner.lock().expect("debounce state poisoned");
                inner.suppressing = false;
                inner.timer = None;
            }));

            first_of_burst
        };

        if commit_now {
            (this.next)(value);
        }
    }
}

// =============================================================================
// ROLLING AVERAGE
// =============================================================================

struct RollingInner {
    samples: VecDeque<(Instant, f64)>,
    tick: Option<JoinHandle<()>>,
    /// Non-numeric fallback state (debounce semantics).
    pending: Option<Value>,
    pending_timer: Option<JoinHandle<()>>,
}

struct RollingAverage {
    window: Duration,
    next: Sink,
    inner: Mutex<RollingInner>,
}

impl RollingAverage {
    fn new(window: Duration, next: Sink) -> Self {
        Self {
            window,
            next,
            inner: Mutex::new(RollingInner {
                samples: VecDeque::new(),
                tick: None,
                pending: None,
                pending_timer: None,
            }),
        }
    }

    fn into_sink(self) -> Sink {
        let stage = Arc::new(self);
        Arc::new(move |value| Self::write(&stage, value))
    }

    fn write(this: &Arc<Self>, value: Value) {
        match value.as_f64() {
            Some(sample) => Self::write_numeric(this, sample),
            None => Self::write_non_numeric(this, value),
        }
    }

    fn write_numeric(this: &Arc<Self>, sample: f64) {
        let mut inner = this.inner.lock().expect("rolling state poisoned");
        // Numeric samples supersede any pending non-numeric value.
        inner.pending = None;
        if let Some(timer) = inner.pending_timer.take() {
            timer.abort();
        }

        inner.samples.push_back((Instant::now(), sample));

        if inner.tick.is_none() {
            let stage = Arc::clone(this);
            inner.tick = Some(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(TICK_INTERVAL).await;
                    let (mean, stabilized) = {
                        let mut inner = stage.inner.lock().expect("rolling state poisoned");
                        let now = Instant::now();
                        prune(&mut inner.samples, now, stage.window);
                        let Some(mean) = time_weighted_mean(&inner.samples, now, stage.window)
                        else {
                            inner.tick = None;
                            return;
                        };
                        // One sample fully aged out of the window cannot
                        // change the mean any further.
                        let stabilized = inner.samples.len() == 1
                            && now.duration_since(inner.samples[0].0) >= stage.window;
                        (mean, stabilized)
                    };

                    (stage.next)(json_number(mean));

                    if stabilized {
                        stage
                            .inner
                            .lock()
                            .expect("rolling state poisoned")
                            .tick = None;
                        return;
                    }
                }
            }));
        }
    }

    /// Averaging is undefined for non-numeric domains; commit the latest
    /// value once the window has elapsed undisturbed.
    fn write_non_numeric(this: &Arc<Self>, value: Value) {
        let mut inner = this.inner.lock().expect("rolling state poisoned");
        inner.samples.clear();
        if let Some(tick) = inner.tick.take() {
            tick.abort();
        }

        inner.pending = Some(value);
        if let Some(timer) = inner.pending_timer.take() {
            timer.abort();
        }

        let stage = Arc::clone(this);
        inner.pending_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(stage.window).await;
            let pending = {
                let mut inner = stage.inner.lock().expect("rolling state poisoned");
                inner.pending_timer = None;
                inner.pending.take()
            };
            if let Some(value) = pending {
                (stage.next)(value);
            }
        }));
    }
}

/// Drop leading samples once a newer sample is itself older than the window.
/// The newest pre-window sample stays to anchor the weighting.
fn prune(samples: &mut VecDeque<(Instant, f64)>, now: Instant, window: Duration) {
    while samples.len() > 1 && now.duration_since(samples[1].0) > window {
        samples.pop_front();
    }
}

/// Linear time-weighted mean: each sample weighs `min(age, window)`.
pub(crate) fn time_weighted_mean(
    samples: &VecDeque<(Instant, f64)>,
    now: Instant,
    window: Duration,
) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }

    let mut weighted = 0.0;
    let mut total = 0.0;
    for &(at, value) in samples {
        let weight = now.duration_since(at).min(window).as_secs_f64();
        weighted += value * weight;
        total += weight;
    }

    if total == 0.0 {
        // All samples arrived just now; fall back to the latest.
        return samples.back().map(|&(_, v)| v);
    }
    Some(weighted / total)
}

fn json_number(value: f64) -> Value {
    serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number)
}
