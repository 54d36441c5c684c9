//! Energy accountant: attributes battery joule-seconds to the currently
//! foreground application, self-trims to bounded cardinality, and
//! self-calibrates its unit exponent.
//!
//! Grounded on `MonitorModule.hpp`'s `PowerMonitorTarget`: sensor files are
//! opened once at thread start; the worker loop parks on a condvar while the
//! screen is off; trim-and-merge and unit auto-calibration both run under
//! the data mutex at `read()` time, not on a timer.

use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read as _;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

const RESERVED_OTHER_KEY: &str = "_other_";
const TRIM_THRESHOLD: usize = 30;
const TRIM_KEEP_TOP: usize = 20;
const CALIBRATION_MAX_CYCLES: u32 = 5;
const TOO_LARGE_WATTS: f32 = 40.0;
const TOO_SMALL_WATTS: f32 = 0.041;
const MIN_ATTRIBUTION_SECONDS: f32 = 0.01;

const CURRENT_NOW_PATH: &str = "/sys/class/power_supply/battery/current_now";
const VOLTAGE_NOW_PATH: &str = "/sys/class/power_supply/battery/voltage_now";
const STATUS_PATH: &str = "/sys/class/power_supply/battery/status";

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AppPower {
    pub time_sec: f32,
    pub power_joules: f32,
}

pub type PowerMap = HashMap<String, AppPower>;

struct SharedState {
    map: Mutex<PowerMap>,
    unit_exponent: AtomicI32,
    running: AtomicBool,
    stop: AtomicBool,
    screen_on: AtomicBool,
    control: Mutex<()>,
    cv: Condvar,
}

pub struct EnergyAccountant {
    shared: Arc<SharedState>,
    dual_battery: Arc<AtomicBool>,
    current_app: Arc<Mutex<String>>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl EnergyAccountant {
    pub fn new(current_app: Arc<Mutex<String>>, dual_battery: Arc<AtomicBool>) -> Self {
        Self {
            shared: Arc::new(SharedState {
                map: Mutex::new(PowerMap::new()),
                unit_exponent: AtomicI32::new(12),
                running: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                screen_on: AtomicBool::new(true),
                control: Mutex::new(()),
                cv: Condvar::new(),
            }),
            dual_battery,
            current_app,
            thread: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }

    pub fn start(&self) -> bool {
        self.shared.stop.store(false, Ordering::Relaxed);
        if self.shared.running.swap(true, Ordering::Relaxed) {
            return false;
        }
        let shared = Arc::clone(&self.shared);
        let dual_battery = Arc::clone(&self.dual_battery);
        let current_app = Arc::clone(&self.current_app);
        log::info!("starting energy accountant");
        *self.thread.lock().unwrap() = Some(std::thread::spawn(move || worker_loop(shared, dual_battery, current_app)));
        true
    }

    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::Relaxed) {
            return;
        }
        self.shared.cv.notify_all();
        log::info!("stopping energy accountant");
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }

    /// Updates the screen-on hint; unparks the worker if it was parked and
    /// the screen just turned on.
    pub fn set_screen_status(&self, screen_on: bool) {
        if !self.is_running() {
            return;
        }
        self.shared.screen_on.store(screen_on, Ordering::Relaxed);
        if self.shared.stop.load(Ordering::Relaxed) && screen_on {
            self.shared.stop.store(false, Ordering::Relaxed);
            self.shared.cv.notify_all();
        }
    }

    pub fn clear_stats(&self) {
        let mut map = self.shared.map.lock().unwrap();
        map.clear();
        log::info!("power consumption records cleared");
    }

    /// Runs trim-and-merge then unit auto-calibration, then serializes.
    pub fn read_snapshot(&self) -> Value {
        let mut map = self.shared.map.lock().unwrap();
        trim_and_merge(&mut map);
        calibrate(&mut map, &self.shared.unit_exponent, 0);
        let entries: Vec<Value> = map
            .iter()
            .map(|(name, stats)| json!({"name": name, "power_joules": stats.power_joules, "time_sec": stats.time_sec}))
            .collect();
        Value::Array(entries)
    }
}

impl Drop for EnergyAccountant {
    fn drop(&mut self) {
        self.stop();
    }
}

struct SensorFds {
    current: File,
    voltage: File,
    status: Option<File>,
}

fn open_sensors() -> Option<SensorFds> {
    // CLOEXEC by default: std::fs::File sets FD_CLOEXEC on open on all
    // platforms this daemon targets, matching the source's explicit
    // O_CLOEXEC flag without needing a raw libc flag here.
    let open = |path: &str| std::fs::OpenOptions::new().read(true).open(path);
    let current = match open(CURRENT_NOW_PATH) {
        Ok(f) => f,
        Err(err) => {
            log::error!("unable to open {CURRENT_NOW_PATH}: {err}");
            return None;
        }
    };
    let voltage = match open(VOLTAGE_NOW_PATH) {
        Ok(f) => f,
        Err(err) => {
            log::error!("unable to open {VOLTAGE_NOW_PATH}: {err}");
            return None;
        }
    };
    let status = open(STATUS_PATH).ok();
    Some(SensorFds { current, voltage, status })
}

fn read_trimmed(file: &mut File) -> Option<String> {
    let mut buf = [0u8; 32];
    use std::io::Seek;
    file.seek(std::io::SeekFrom::Start(0)).ok()?;
    let n = file.read(&mut buf).ok()?;
    if n == 0 {
        return None;
    }
    Some(String::from_utf8_lossy(&buf[..n]).trim().to_string())
}

/// `P(W) = I(µA) × V(µV) × 10^(-unit_exponent)`, doubled when dual-battery.
fn read_power_w(sensors: &mut SensorFds, dual_battery: bool, unit_exponent: i32) -> f32 {
    let Some(current_str) = read_trimmed(&mut sensors.current) else {
        return 0.0;
    };
    let Ok(current_ua) = current_str.parse::<i64>() else {
        return 0.0;
    };
    if current_ua <= 0 {
        return 0.0;
    }
    let Some(voltage_str) = read_trimmed(&mut sensors.voltage) else {
        return 0.0;
    };
    let Ok(voltage_uv) = voltage_str.parse::<i64>() else {
        return 0.0;
    };
    let power = (current_ua as f64) * (voltage_uv as f64) * 10f64.powi(-unit_exponent);
    (power as f32) * if dual_battery { 2.0 } else { 1.0 }
}

fn read_battery_status(sensors: &mut SensorFds) -> Option<char> {
    let file = sensors.status.as_mut()?;
    let mut buf = [0u8; 1];
    use std::io::Seek;
    file.seek(std::io::SeekFrom::Start(0)).ok()?;
    let n = file.read(&mut buf).ok()?;
    if n == 0 { None } else { Some(buf[0] as char) }
}

fn worker_loop(shared: Arc<SharedState>, dual_battery: Arc<AtomicBool>, current_app: Arc<Mutex<String>>) {
    let Some(mut sensors) = open_sensors() else {
        shared.running.store(false, Ordering::Relaxed);
        return;
    };

    let mut last_time = Instant::now();

    while shared.running.load(Ordering::Relaxed) {
        {
            let guard = shared.control.lock().unwrap();
            if shared.stop.load(Ordering::Relaxed) {
                log::debug!("screen off, power monitor parked");
                let _guard = shared
                    .cv
                    .wait_while(guard, |_| {
                        shared.running.load(Ordering::Relaxed) && shared.stop.load(Ordering::Relaxed)
                    })
                    .unwrap();
                log::debug!("screen on, power monitor resumed");
                last_time = Instant::now();
            } else {
                let (_guard, _timeout) = shared
                    .cv
                    .wait_timeout_while(guard, Duration::from_secs(1), |_| {
                        shared.running.load(Ordering::Relaxed)
                    })
                    .unwrap();
            }

            if !shared.running.load(Ordering::Relaxed) {
                break;
            }
        }

        if !shared.screen_on.load(Ordering::Relaxed) {
            shared.stop.store(true, Ordering::Relaxed);
            continue;
        }

        let app_name = current_app.lock().unwrap().clone();
        if app_name.is_empty() {
            last_time = Instant::now();
            continue;
        }

        if let Some(status) = read_battery_status(&mut sensors)
            && (status == 'C' || status == 'F')
        {
            last_time = Instant::now();
            continue;
        }

        let unit_exponent = shared.unit_exponent.load(Ordering::Relaxed);
        let power_w = read_power_w(&mut sensors, dual_battery.load(Ordering::Relaxed), unit_exponent);
        if power_w <= 1e-12 {
            last_time = Instant::now();
            continue;
        }

        let now = Instant::now();
        let delta_t = now.duration_since(last_time).as_secs_f32();
        last_time = now;

        let mut map = shared.map.lock().unwrap();
        let stats = map.entry(app_name).or_default();
        stats.time_sec += delta_t;
        stats.power_joules += power_w * delta_t;
    }
}

/// If the map has more than 30 entries, keeps the top 20 by joules and
/// merges everything else (including any existing `_other_`) into a fresh
/// `_other_` bucket.
pub fn trim_and_merge(map: &mut PowerMap) {
    if map.len() <= TRIM_THRESHOLD {
        return;
    }

    let mut other = AppPower::default();
    let mut normal: Vec<(String, AppPower)> = Vec::with_capacity(map.len());
    for (name, stats) in map.drain() {
        if name == RESERVED_OTHER_KEY {
            other.time_sec += stats.time_sec;
            other.power_joules += stats.power_joules;
        } else {
            normal.push((name, stats));
        }
    }

    if normal.len() <= TRIM_KEEP_TOP {
        for (name, stats) in normal {
            map.insert(name, stats);
        }
        map.insert(RESERVED_OTHER_KEY.to_string(), other);
        return;
    }

    normal.sort_by(|a, b| b.1.power_joules.partial_cmp(&a.1.power_joules).unwrap());
    for (name, stats) in normal.iter().take(TRIM_KEEP_TOP) {
        map.insert(name.clone(), *stats);
    }
    for (_, stats) in normal.iter().skip(TRIM_KEEP_TOP) {
        other.time_sec += stats.time_sec;
        other.power_joules += stats.power_joules;
    }
    map.insert(RESERVED_OTHER_KEY.to_string(), other);
}

/// Recursive unit auto-calibration over the watt-equivalent of each app.
/// Never calibrates with fewer than 2 apps present.
pub fn calibrate(map: &mut PowerMap, unit_exponent: &AtomicI32, cycle: u32) {
    if cycle >= CALIBRATION_MAX_CYCLES {
        log::error!("power monitor: cannot calibrate data after {CALIBRATION_MAX_CYCLES} cycles, manual calibration required");
        return;
    }
    if map.len() <= 1 {
        return;
    }

    let mut too_large = 0;
    let mut too_small = 0;
    let mut normal = 0;
    for stats in map.values() {
        if stats.time_sec < MIN_ATTRIBUTION_SECONDS {
            continue;
        }
        let watt = stats.power_joules / stats.time_sec;
        if watt > TOO_LARGE_WATTS {
            too_large += 1;
        } else if watt < TOO_SMALL_WATTS {
            too_small += 1;
        } else {
            normal += 1;
        }
    }

    if normal > (too_small + too_large) {
        return;
    }

    if too_small > too_large {
        for stats in map.values_mut() {
            stats.power_joules *= 1000.0;
        }
        let current = unit_exponent.load(Ordering::Relaxed);
        if current - 3 < 0 {
            log::error!("power monitor: cannot calibrate data, unit_exponent would go negative");
            return;
        }
        unit_exponent.store(current - 3, Ordering::Relaxed);
        log::debug!("power monitor: data too small, amplifying; unit_exponent={}", current - 3);
        calibrate(map, unit_exponent, cycle + 1);
    } else if too_small < too_large {
        for stats in map.values_mut() {
            stats.power_joules /= 1000.0;
        }
        let current = unit_exponent.load(Ordering::Relaxed);
        unit_exponent.store(current + 3, Ordering::Relaxed);
        log::debug!("power monitor: data too large, reducing; unit_exponent={}", current + 3);
        calibrate(map, unit_exponent, cycle + 1);
    } else {
        log::error!("power monitor: cannot calibrate data, too_small == too_large tie");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(time_sec: f32, power_joules: f32) -> AppPower {
        AppPower { time_sec, power_joules }
    }

    #[test]
    fn trim_noop_under_threshold() {
        let mut map = PowerMap::new();
        for i in 0..10 {
            map.insert(format!("app{i}"), app(10.0, 1.0));
        }
        trim_and_merge(&mut map);
        assert_eq!(map.len(), 10);
    }

    #[test]
    fn trim_keeps_top_20_and_merges_rest() {
        let mut map = PowerMap::new();
        for i in 0..35 {
            map.insert(format!("app{i}"), app(10.0, i as f32));
        }
        trim_and_merge(&mut map);
        assert!(map.len() <= 21);
        assert!(map.contains_key(RESERVED_OTHER_KEY));
        // the 20 highest-joule apps (15..=34) must all survive
        for i in 15..35 {
            assert!(map.contains_key(&format!("app{i}")), "app{i} should survive trim");
        }
    }

    #[test]
    fn trim_merges_existing_other_bucket() {
        let mut map = PowerMap::new();
        map.insert(RESERVED_OTHER_KEY.to_string(), app(5.0, 5.0));
        for i in 0..31 {
            map.insert(format!("app{i}"), app(1.0, i as f32));
        }
        trim_and_merge(&mut map);
        let other = map.get(RESERVED_OTHER_KEY).unwrap();
        assert!(other.time_sec >= 5.0);
    }

    #[test]
    fn calibrate_skips_single_app() {
        let mut map = PowerMap::new();
        map.insert("only".to_string(), app(100.0, 0.0001));
        let unit = AtomicI32::new(12);
        calibrate(&mut map, &unit, 0);
        assert_eq!(unit.load(Ordering::Relaxed), 12);
    }

    #[test]
    fn calibrate_amplifies_when_too_small_dominates() {
        let mut map = PowerMap::new();
        map.insert("a".to_string(), app(10.0, 0.0001));
        map.insert("b".to_string(), app(10.0, 0.0002));
        let unit = AtomicI32::new(12);
        calibrate(&mut map, &unit, 0);
        assert_eq!(unit.load(Ordering::Relaxed), 9);
        assert!(map["a"].power_joules > 0.0001);
    }

    #[test]
    fn calibrate_reduces_when_too_large_dominates() {
        let mut map = PowerMap::new();
        map.insert("a".to_string(), app(10.0, 500.0));
        map.insert("b".to_string(), app(10.0, 600.0));
        let unit = AtomicI32::new(12);
        calibrate(&mut map, &unit, 0);
        assert_eq!(unit.load(Ordering::Relaxed), 15);
    }

    #[test]
    fn calibrate_stops_when_normal_majority() {
        let mut map = PowerMap::new();
        map.insert("a".to_string(), app(10.0, 10.0));
        map.insert("b".to_string(), app(10.0, 50.0));
        map.insert("c".to_string(), app(10.0, 0.001));
        let unit = AtomicI32::new(12);
        calibrate(&mut map, &unit, 0);
        assert_eq!(unit.load(Ordering::Relaxed), 12);
    }
}
