//! Scripted sensor source.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use kiln_kernel::SensorError;
use kiln_kernel::hardware::{PowerReading, SensorSource, ThermalReading, ThermalState};
use parking_lot::Mutex;

/// What the sensors report for one tick. `None` fields fail to read.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Reading {
    pub cpu: Option<f32>,
    pub memory: Option<(u64, u64)>,
    pub thermal: Option<ThermalReading>,
    pub power: Option<PowerReading>,
}

impl Reading {
    /// Idle machine on AC power with `total` bytes of memory, 10% used.
    pub fn idle(total: u64) -> Self {
        Self {
            cpu: Some(0.05),
            memory: Some((total / 10, total)),
            thermal: Some(ThermalReading::State(ThermalState::Normal)),
            power: Some(PowerReading {
                on_ac: true,
                battery_percent: None,
            }),
        }
    }

    pub fn with_thermal(mut self, state: ThermalState) -> Self {
        self.thermal = Some(ThermalReading::State(state));
        self
    }

    pub fn with_celsius(mut self, celsius: f32) -> Self {
        self.thermal = Some(ThermalReading::Celsius(celsius));
        self
    }

    pub fn with_memory(mut self, used: u64, total: u64) -> Self {
        self.memory = Some((used, total));
        self
    }

    pub fn on_battery(mut self, percent: f32) -> Self {
        self.power = Some(PowerReading {
            on_ac: false,
            battery_percent: Some(percent),
        });
        self
    }
}

/// A [`SensorSource`] that replays queued readings, one per refresh.
///
/// Once the queue runs dry the last reading repeats. Push more readings at
/// any time through the paired [`SensorScript`].
pub struct ScriptedSensors {
    script: SensorScript,
    current: Reading,
}

/// Handle for feeding a [`ScriptedSensors`] after it moved into a monitor.
#[derive(Clone, Default)]
pub struct SensorScript {
    queue: Arc<Mutex<VecDeque<Reading>>>,
    refreshes: Arc<AtomicUsize>,
    read_delay_ms: Arc<AtomicU64>,
}

impl SensorScript {
    pub fn push(&self, reading: Reading) {
        self.queue.lock().push_back(reading);
    }

    pub fn extend(&self, readings: impl IntoIterator<Item = Reading>) {
        self.queue.lock().extend(readings);
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Ticks the monitor has taken so far.
    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// Block every following refresh for `delay`, like a wedged sensor
    /// driver. Takes effect from the next refresh.
    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

impl ScriptedSensors {
    pub fn new(initial: Reading) -> (Self, SensorScript) {
        let script = SensorScript::default();
        let sensors = Self {
            script: script.clone(),
            current: initial,
        };
        (sensors, script)
    }
}

impl SensorSource for ScriptedSensors {
    fn name(&self) -> &str {
        "scripted"
    }

    fn refresh(&mut self) {
        let delay = self.script.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        self.script.refreshes.fetch_add(1, Ordering::SeqCst);
        if let Some(next) = self.script.queue.lock().pop_front() {
            self.current = next;
        }
    }

    fn cpu_utilization(&mut self) -> Result<f32, SensorError> {
        self.current.cpu.ok_or(SensorError::Unsupported("cpu"))
    }

    fn memory(&mut self) -> Result<(u64, u64), SensorError> {
        self.current.memory.ok_or(SensorError::Unsupported("memory"))
    }

    fn thermal(&mut self) -> Result<ThermalReading, SensorError> {
        self.current.thermal.ok_or(SensorError::Unsupported("thermal"))
    }

    fn power(&mut self) -> Result<PowerReading, SensorError> {
        self.current.power.ok_or(SensorError::Unsupported("power"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_then_repeats_last() {
        let (mut sensors, script) = ScriptedSensors::new(Reading::idle(100));
        script.push(Reading::idle(100).with_thermal(ThermalState::Hot));

        sensors.refresh();
        assert_eq!(sensors.thermal().unwrap(), ThermalReading::State(ThermalState::Hot));
        sensors.refresh();
        assert_eq!(sensors.thermal().unwrap(), ThermalReading::State(ThermalState::Hot));
        assert_eq!(script.refreshes(), 2);
        assert_eq!(script.pending(), 0);
    }

    #[test]
    fn missing_fields_fail_to_read() {
        let (mut sensors, _script) = ScriptedSensors::new(Reading::default());
        sensors.refresh();
        assert!(sensors.cpu_utilization().is_err());
        assert!(sensors.memory().is_err());
    }
}
