//! HardwareMonitor - periodic device-health sampling with edge-triggered events
//!
//! The monitor owns one background task that reads a [`SensorSource`] every
//! interval, appends the sample to a bounded history, publishes it on a
//! `watch` channel and notifies subscribers whose filter matches an axis
//! whose tier changed since the previous sample.
//!
//! # Example
//!
//! ```rust,no_run
//! use kiln_foundation::hardware::SystemSensors;
//! use kiln_foundation::monitor::{HardwareMonitor, MonitorConfig};
//! use kiln_kernel::hardware::EventFilter;
//!
//! #[tokio::main]
//! async fn main() {
//!     let monitor = HardwareMonitor::new(MonitorConfig::default(), Box::new(SystemSensors::new(None)))
//!         .expect("valid config");
//!     monitor.subscribe(EventFilter::Thermal, |event| println!("thermal: {}", event.current.thermal));
//!     monitor.start().unwrap();
//! }
//! ```

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use kiln_kernel::hardware::{
    EventFilter, HardwareEvent, HardwareSample, MemoryReading, SensorSource, ThermalReading,
    TierSnapshot, TierThresholds,
};
use kiln_kernel::{RuntimeError, RuntimeResult, SensorError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Configuration for [`HardwareMonitor`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Sampling interval in milliseconds; must be positive
    pub interval_ms: u64,
    /// Samples kept in the history ring buffer
    pub history_capacity: usize,
    /// How long `stop` waits for the loop to exit
    pub join_timeout_ms: u64,
    pub thresholds: TierThresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            history_capacity: 300, // five minutes at the default interval
            join_timeout_ms: 2_000,
            thresholds: TierThresholds::default(),
        }
    }
}

impl MonitorConfig {
    pub fn with_interval(mut self, interval: Duration) -> Result<Self, &'static str> {
        if interval.is_zero() {
            return Err("monitor interval must be > 0");
        }
        self.interval_ms = interval.as_millis().max(1) as u64;
        Ok(self)
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Result<Self, &'static str> {
        if capacity == 0 {
            return Err("history_capacity must be > 0");
        }
        self.history_capacity = capacity;
        Ok(self)
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_thresholds(mut self, thresholds: TierThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.interval_ms == 0 {
            return Err("monitor interval must be > 0");
        }
        if self.history_capacity == 0 {
            return Err("history_capacity must be > 0");
        }
        let t = &self.thresholds;
        if !(t.memory_warning < t.memory_urgent && t.memory_urgent < t.memory_critical) {
            return Err("memory thresholds must be strictly increasing");
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

/// Token returned by [`HardwareMonitor::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type EventCallback = Arc<dyn Fn(&HardwareEvent) + Send + Sync>;

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    filter: EventFilter,
    callback: EventCallback,
}

/// Lifecycle state of the sampling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Stopped,
    Running,
}

/// Liveness report from [`HardwareMonitor::health`]
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorHealth {
    pub state: MonitorState,
    pub interval: Duration,
    pub last_sample_age: Option<Duration>,
    /// Running, but no sample within twice the interval
    pub stalled: bool,
}

enum LoopState {
    Stopped,
    Running {
        cancel: CancellationToken,
        handle: JoinHandle<()>,
        started_at: Instant,
    },
}

struct MonitorInner {
    config: MonitorConfig,
    sensors: Arc<Mutex<Box<dyn SensorSource>>>,
    history: Mutex<VecDeque<HardwareSample>>,
    subscribers: Mutex<Vec<Subscriber>>,
    /// Held for the whole of one publish so subscribers see samples in order
    tiers: Mutex<TierSnapshot>,
    latest_tx: watch::Sender<Option<HardwareSample>>,
    last_sample_at: Mutex<Option<Instant>>,
    state: Mutex<LoopState>,
    next_subscription: AtomicU64,
}

/// Background device-health sampler
#[derive(Clone)]
pub struct HardwareMonitor {
    inner: Arc<MonitorInner>,
}

impl HardwareMonitor {
    pub fn new(config: MonitorConfig, sensors: Box<dyn SensorSource>) -> Result<Self, &'static str> {
        config.validate()?;
        let (latest_tx, _) = watch::channel(None);
        let history = VecDeque::with_capacity(config.history_capacity);
        Ok(Self {
            inner: Arc::new(MonitorInner {
                config,
                sensors: Arc::new(Mutex::new(sensors)),
                history: Mutex::new(history),
                subscribers: Mutex::new(Vec::new()),
                tiers: Mutex::new(TierSnapshot::default()),
                latest_tx,
                last_sample_at: Mutex::new(None),
                state: Mutex::new(LoopState::Stopped),
                next_subscription: AtomicU64::new(1),
            }),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    /// Spawn the sampling loop. Calling it while running is a no-op.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> RuntimeResult<()> {
        let mut state = self.inner.state.lock();
        if matches!(*state, LoopState::Running { .. }) {
            debug!("hardware monitor already running");
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let monitor = self.clone();
        let token = cancel.clone();
        let interval = self.inner.config.interval();
        let handle = tokio::spawn(async move { monitor.run(token, interval).await });

        *state = LoopState::Running {
            cancel,
            handle,
            started_at: Instant::now(),
        };
        info!(interval_ms = interval.as_millis() as u64, "hardware monitor started");
        Ok(())
    }

    /// Stop the loop and join it, bounded by the configured join timeout.
    ///
    /// A loop that does not exit in time is aborted and reported as
    /// [`RuntimeError::MonitorJoinTimeout`]; a loop that panicked is reported
    /// as [`RuntimeError::MonitorFailed`]. Stopping a stopped monitor is a no-op.
    pub async fn stop(&self) -> RuntimeResult<()> {
        let previous = std::mem::replace(&mut *self.inner.state.lock(), LoopState::Stopped);
        let LoopState::Running { cancel, mut handle, .. } = previous else {
            return Ok(());
        };

        cancel.cancel();
        let timeout = self.inner.config.join_timeout();
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => {
                info!("hardware monitor stopped");
                Ok(())
            }
            Ok(Err(join_err)) => {
                error!(error = %join_err, "hardware monitor task failed");
                Err(RuntimeError::MonitorFailed(join_err.to_string()))
            }
            Err(_) => {
                handle.abort();
                warn!(timeout_ms = timeout.as_millis() as u64, "hardware monitor did not stop in time");
                Err(RuntimeError::MonitorJoinTimeout(timeout))
            }
        }
    }

    pub fn state(&self) -> MonitorState {
        match *self.inner.state.lock() {
            LoopState::Stopped => MonitorState::Stopped,
            LoopState::Running { .. } => MonitorState::Running,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == MonitorState::Running
    }

    async fn run(self, cancel: CancellationToken, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.read_sample().await {
                Ok(sample) => self.publish(sample),
                Err(e) => warn!(error = %e, "hardware sample failed"),
            }
        }
        debug!("hardware monitor loop exited");
    }

    /// Take a sample immediately and publish it like a scheduled tick.
    pub async fn sample_now(&self) -> RuntimeResult<HardwareSample> {
        let sample = self.read_sample().await?;
        self.publish(sample.clone());
        Ok(sample)
    }

    /// Publish an externally produced sample through the normal history and
    /// dispatch path.
    pub fn ingest(&self, sample: HardwareSample) {
        self.publish(sample);
    }

    async fn read_sample(&self) -> RuntimeResult<HardwareSample> {
        let sensors = Arc::clone(&self.inner.sensors);
        let thresholds = self.inner.config.thresholds.clone();
        tokio::task::spawn_blocking(move || {
            let mut sensors = sensors.lock();
            read_counters(sensors.as_mut(), &thresholds)
        })
        .await
        .map_err(|e| RuntimeError::HardwareUnavailable(SensorError::read_failed("monitor", e.to_string())))
    }

    fn publish(&self, sample: HardwareSample) {
        // Serializes publishers; released only after every callback returned.
        let mut tiers = self.inner.tiers.lock();

        {
            let mut history = self.inner.history.lock();
            if history.len() == self.inner.config.history_capacity {
                history.pop_front();
            }
            history.push_back(sample.clone());
        }
        *self.inner.last_sample_at.lock() = Some(Instant::now());
        self.inner.latest_tx.send_replace(Some(sample.clone()));

        let previous = *tiers;
        let current = previous.advance(&sample);
        let changed = previous.changes(&current);
        *tiers = current;

        if changed.is_empty() {
            trace!("no tier change");
            return;
        }

        debug!(
            thermal = %current.thermal,
            power = %current.power,
            memory = %current.memory,
            changed = ?changed,
            "hardware tier transition"
        );

        let event = HardwareEvent {
            changed,
            previous,
            current,
            sample,
        };
        let subscribers: Vec<Subscriber> = self.inner.subscribers.lock().clone();
        for sub in subscribers
            .iter()
            .filter(|s| event.changed.iter().any(|k| s.filter.matches(*k)))
        {
            let callback = Arc::clone(&sub.callback);
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                error!(subscription = sub.id.0, "hardware event subscriber panicked");
            }
        }
    }

    /// Register a callback for tier transitions on the axes `filter` selects.
    ///
    /// Callbacks run synchronously on the publishing task, one sample at a
    /// time. They must not block or publish samples themselves.
    pub fn subscribe<F>(&self, filter: EventFilter, callback: F) -> SubscriptionId
    where
        F: Fn(&HardwareEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.inner.subscribers.lock().push(Subscriber {
            id,
            filter,
            callback: Arc::new(callback),
        });
        debug!(subscription = id.0, ?filter, "hardware subscriber added");
        id
    }

    /// Remove a subscription. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.inner.subscribers.lock();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        before != subs.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Copies of the samples taken within `window` of now, oldest first.
    pub fn history(&self, window: Duration) -> Vec<HardwareSample> {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now().checked_sub_signed(window);
        self.inner
            .history
            .lock()
            .iter()
            .filter(|s| cutoff.is_none_or(|c| s.timestamp >= c))
            .cloned()
            .collect()
    }

    pub fn latest(&self) -> Option<HardwareSample> {
        self.inner.latest_tx.borrow().clone()
    }

    /// Receiver that observes every newly published sample.
    pub fn watch(&self) -> watch::Receiver<Option<HardwareSample>> {
        self.inner.latest_tx.subscribe()
    }

    /// Current tier of every axis.
    pub fn tiers(&self) -> TierSnapshot {
        *self.inner.tiers.lock()
    }

    pub fn health(&self) -> MonitorHealth {
        let interval = self.inner.config.interval();
        let last_sample_age = self.inner.last_sample_at.lock().map(|t| t.elapsed());
        let (state, stalled) = match &*self.inner.state.lock() {
            LoopState::Stopped => (MonitorState::Stopped, false),
            LoopState::Running { started_at, .. } => {
                let since = last_sample_age
                    .map(|age| age.min(started_at.elapsed()))
                    .unwrap_or_else(|| started_at.elapsed());
                (MonitorState::Running, since > interval * 2)
            }
        };
        if stalled {
            warn!(age = ?last_sample_age, interval = ?interval, "hardware monitor stalled");
        }
        MonitorHealth {
            state,
            interval,
            last_sample_age,
            stalled,
        }
    }

    /// Like [`health`](Self::health) but fails with [`RuntimeError::MonitorStalled`].
    pub fn ensure_healthy(&self) -> RuntimeResult<MonitorHealth> {
        let health = self.health();
        if health.stalled {
            return Err(RuntimeError::MonitorStalled {
                elapsed: health.last_sample_age.unwrap_or_default(),
                interval: health.interval,
            });
        }
        Ok(health)
    }
}

/// Read every counter, omitting the ones that fail.
fn read_counters(sensors: &mut dyn SensorSource, thresholds: &TierThresholds) -> HardwareSample {
    sensors.refresh();
    let mut sample = HardwareSample::new();

    sample.cpu_utilization = absorb(sensors.cpu_utilization());
    sample.memory = absorb(sensors.memory()).map(|(used, total)| {
        let reading = MemoryReading {
            used_bytes: used,
            total_bytes: total,
            pressure: Default::default(),
        };
        MemoryReading {
            pressure: thresholds.memory_tier(reading.utilization()),
            ..reading
        }
    });
    sample.thermal = absorb(sensors.thermal()).map(|reading| match reading {
        ThermalReading::Celsius(c) => thresholds.thermal_tier(c),
        ThermalReading::State(s) => s,
    });
    sample.power = absorb(sensors.power()).map(|r| thresholds.power_tier(r));
    sample.accelerator_utilization = absorb(sensors.accelerator_utilization());
    sample.gpu_utilization = absorb(sensors.gpu_utilization());
    sample
}

fn absorb<T>(result: Result<T, SensorError>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(SensorError::Unsupported(sensor)) => {
            trace!(sensor, "sensor unsupported on this platform");
            None
        }
        Err(e) => {
            warn!(error = %e, "sensor read failed; field omitted");
            None
        }
    }
}
