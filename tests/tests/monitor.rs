use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use kiln_foundation::{HardwareMonitor, MonitorConfig};
use kiln_kernel::RuntimeError;
use kiln_kernel::hardware::{EventFilter, HardwareSample, MemoryPressure, PowerSource, ThermalState};
use kiln_testing::{GIB, Reading, ScriptedSensors, SensorScript, assert_runtime_err};

fn scripted_monitor(interval: Duration) -> (HardwareMonitor, SensorScript) {
    let (sensors, script) = ScriptedSensors::new(Reading::idle(16 * GIB));
    let config = MonitorConfig::default().with_interval(interval).unwrap();
    let monitor = HardwareMonitor::new(config, Box::new(sensors)).unwrap();
    (monitor, script)
}

fn counting(monitor: &HardwareMonitor, filter: EventFilter) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    monitor.subscribe(filter, move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    count
}

#[tokio::test]
async fn repeated_tier_fires_one_callback() {
    let (monitor, _script) = scripted_monitor(Duration::from_secs(1));
    let thermal = counting(&monitor, EventFilter::Thermal);
    let memory = counting(&monitor, EventFilter::Memory);

    monitor.ingest(HardwareSample::new().with_thermal(ThermalState::Normal));
    for _ in 0..10 {
        monitor.ingest(HardwareSample::new().with_thermal(ThermalState::Hot));
    }
    assert_eq!(thermal.load(Ordering::SeqCst), 1);
    assert_eq!(memory.load(Ordering::SeqCst), 0);
    assert_eq!(monitor.tiers().thermal, ThermalState::Hot);
    assert_eq!(monitor.history(Duration::from_secs(60)).len(), 11);
}

#[tokio::test]
async fn omitted_axes_keep_their_tier() {
    let (monitor, _script) = scripted_monitor(Duration::from_secs(1));
    let all = counting(&monitor, EventFilter::All);

    monitor.ingest(HardwareSample::new().with_power(PowerSource::Battery));
    monitor.ingest(HardwareSample::new().with_memory(9 * GIB, 10 * GIB, MemoryPressure::Urgent));
    monitor.ingest(HardwareSample::new().with_cpu(0.4));

    let tiers = monitor.tiers();
    assert_eq!(tiers.power, PowerSource::Battery);
    assert_eq!(tiers.memory, MemoryPressure::Urgent);
    assert_eq!(tiers.thermal, ThermalState::Normal);
    assert_eq!(all.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn panicking_subscriber_does_not_starve_the_rest() {
    let (monitor, _script) = scripted_monitor(Duration::from_secs(1));
    monitor.subscribe(EventFilter::All, |_| panic!("subscriber bug"));
    let thermal = counting(&monitor, EventFilter::Thermal);

    monitor.ingest(HardwareSample::new().with_thermal(ThermalState::Throttled));
    monitor.ingest(HardwareSample::new().with_thermal(ThermalState::Normal));
    assert_eq!(thermal.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unsubscribed_callbacks_stop_firing() {
    let (monitor, _script) = scripted_monitor(Duration::from_secs(1));
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    let id = monitor.subscribe(EventFilter::Thermal, move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    monitor.ingest(HardwareSample::new().with_thermal(ThermalState::Warm));
    assert!(monitor.unsubscribe(id));
    assert!(!monitor.unsubscribe(id));
    monitor.ingest(HardwareSample::new().with_thermal(ThermalState::Critical));
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(monitor.subscriber_count(), 0);
}

#[tokio::test]
async fn sample_now_reads_and_publishes() {
    let (monitor, script) = scripted_monitor(Duration::from_secs(1));
    script.push(Reading::idle(16 * GIB).with_celsius(85.0).on_battery(10.0));

    let sample = monitor.sample_now().await.unwrap();
    assert_eq!(sample.thermal, Some(ThermalState::Hot));
    assert_eq!(sample.power, Some(PowerSource::LowBattery));
    assert_eq!(sample.memory_pressure(), Some(MemoryPressure::Normal));
    assert_eq!(monitor.latest().unwrap().timestamp, sample.timestamp);
    assert_eq!(script.refreshes(), 1);
}

#[tokio::test]
async fn running_monitor_follows_the_sensors() {
    let (monitor, script) = scripted_monitor(Duration::from_millis(5));
    let thermal = counting(&monitor, EventFilter::Thermal);
    let mut samples = monitor.watch();

    script.extend([
        Reading::idle(16 * GIB),
        Reading::idle(16 * GIB).with_celsius(92.0),
    ]);
    monitor.start().unwrap();
    assert!(monitor.is_running());
    // Starting twice is a no-op.
    monitor.start().unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            samples.changed().await.unwrap();
            let throttled = samples
                .borrow_and_update()
                .as_ref()
                .is_some_and(|s| s.thermal == Some(ThermalState::Throttled));
            if throttled {
                break;
            }
        }
    })
    .await
    .expect("monitor never reported the throttled reading");

    tokio::time::timeout(Duration::from_secs(5), async {
        while script.refreshes() < 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("monitor stopped sampling");

    monitor.stop().await.unwrap();
    assert!(!monitor.is_running());
    // The last reading repeats, so the tier changed exactly once.
    assert_eq!(thermal.load(Ordering::SeqCst), 1);
    assert!(monitor.ensure_healthy().is_ok());
}

#[tokio::test]
async fn wedged_sensors_report_a_stall() {
    let (monitor, script) = scripted_monitor(Duration::from_millis(10));
    script.set_read_delay(Duration::from_millis(300));
    monitor.start().unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    let health = monitor.health();
    assert!(health.stalled);
    assert!(health.last_sample_age.is_none());
    let result = monitor.ensure_healthy();
    assert_runtime_err!(result, RuntimeError::MonitorStalled { .. });
    let err = result.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.status_hint(), 503);

    script.set_read_delay(Duration::ZERO);
    monitor.stop().await.unwrap();
    assert!(!monitor.health().stalled);
    assert!(monitor.ensure_healthy().is_ok());
}

#[tokio::test]
async fn stop_gives_up_on_a_wedged_loop() {
    let (sensors, script) = ScriptedSensors::new(Reading::idle(16 * GIB));
    script.set_read_delay(Duration::from_millis(500));
    let config = MonitorConfig::default()
        .with_interval(Duration::from_millis(10))
        .unwrap()
        .with_join_timeout(Duration::from_millis(20));
    let monitor = HardwareMonitor::new(config, Box::new(sensors)).unwrap();
    monitor.start().unwrap();
    // The first tick fires at once, so a read is in flight by now.
    tokio::time::sleep(Duration::from_millis(30)).await;

    let result = monitor.stop().await;
    assert_runtime_err!(result, RuntimeError::MonitorJoinTimeout(_));
    assert!(matches!(result, Err(RuntimeError::MonitorJoinTimeout(t)) if t == Duration::from_millis(20)));
    assert!(!monitor.is_running());
}
