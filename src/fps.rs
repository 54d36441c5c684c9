//! Dynamic-fps controller: raises refresh rate on input activity, drops it
//! back after an idle interval, via one of two writer backends.
//!
//! Grounded on `DynamicFps.hpp`: the timer thread is a transient one-shot
//! that re-reads its published deadline before firing (SPEC_FULL.md §9), and
//! commanded fps is memoized with a periodic re-force every 10th activation.

use crate::shell::ShellCommand;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// (id, width, height, fps)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayModeRecord {
    pub id: i32,
    pub width: i32,
    pub height: i32,
    pub fps: i32,
}

/// Ordered fps -> display-mode-id mapping for one resolution.
pub type FpsMap = BTreeMap<i32, i32>;

/// Exact match wins; otherwise the neighbor with the closer fps, ties going
/// to the lower neighbor; an empty map returns 0 (see SPEC_FULL.md §9 for
/// the documented discrepancy against one historical source revision).
pub fn nearest_fps_id(map: &FpsMap, target_fps: i32) -> i32 {
    if let Some(id) = map.get(&target_fps) {
        return *id;
    }
    if map.is_empty() {
        return 0;
    }

    let lower = map.range(..target_fps).next_back();
    let upper = map.range(target_fps..).next();

    match (lower, upper) {
        (Some((lf, lid)), Some((uf, uid))) => {
            let lower_dist = target_fps - lf;
            let upper_dist = uf - target_fps;
            if upper_dist < lower_dist { *uid } else { *lid }
        }
        (Some((_, lid)), None) => *lid,
        (None, Some((_, uid))) => *uid,
        (None, None) => 0,
    }
}

pub fn group_by_resolution(records: &[DisplayModeRecord]) -> BTreeMap<String, Vec<DisplayModeRecord>> {
    let mut groups: BTreeMap<String, Vec<DisplayModeRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(format!("{}x{}", record.width, record.height)).or_default().push(*record);
    }
    groups
}

/// Picks the boot resolution: the configured one if present, else the
/// largest fps-group (tie -> largest pixel count); `None` if no resolutions.
pub fn choose_boot_resolution<'a>(
    groups: &'a BTreeMap<String, Vec<DisplayModeRecord>>,
    configured: &str,
) -> Option<&'a str> {
    if groups.is_empty() {
        return None;
    }
    if groups.len() == 1 {
        return groups.keys().next().map(String::as_str);
    }
    if !configured.is_empty() && groups.contains_key(configured) {
        return groups.get_key_value(configured).map(|(k, _)| k.as_str());
    }
    groups
        .iter()
        .max_by_key(|(_, records)| {
            let pixels = records.first().map(|r| (r.width as i64) * (r.height as i64)).unwrap_or(0);
            (records.len(), pixels)
        })
        .map(|(k, _)| k.as_str())
}

/// Parses `dumpsys display | grep DisplayModeRecord` lines of the shape
/// `DisplayModeRecord{id=1, width=1800, height=2880, fps=120.0}`.
pub fn parse_display_modes(output: &str) -> Vec<DisplayModeRecord> {
    let mut records = Vec::new();
    for line in output.lines() {
        let Some(id) = extract_int(line, "id=") else { continue };
        let Some(width) = extract_int(line, "width=") else { continue };
        let Some(height) = extract_int(line, "height=") else { continue };
        let Some(fps) = extract_fps(line) else { continue };
        records.push(DisplayModeRecord { id, width, height, fps });
    }
    records
}

fn extract_int(line: &str, marker: &str) -> Option<i32> {
    let idx = line.find(marker)? + marker.len();
    let rest = &line[idx..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn extract_fps(line: &str) -> Option<i32> {
    let idx = line.find("fps=")? + "fps=".len();
    let rest = &line[idx..];
    let token: String = rest.chars().take_while(|c| c.is_ascii_digit() || *c == '.').collect();
    let value: f64 = token.parse().ok()?;
    if !(1.0..=512.0).contains(&value) {
        return None;
    }
    Some(value.round() as i32)
}

const SETTINGS_KEYS: &[(&str, &str)] = &[
    ("system", "peak_refresh_rate"),
    ("system", "min_refresh_rate"),
    ("secure", "miui_refresh_rate"),
    ("system", "miui_refresh_rate"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FpsState {
    Idle,
    ActiveWait,
}

pub struct DynamicFpsController {
    pub up_fps: AtomicU32,
    pub down_fps: AtomicU32,
    pub idle_ms: AtomicU64,
    pub backdoor_id: AtomicU32,
    pub using_backdoor: AtomicBool,
    enabled: AtomicBool,
    current_fps: AtomicU32,
    target_time_ms: AtomicI64,
    timer_running: AtomicBool,
    activation_count: AtomicU32,
    fps_map: Mutex<FpsMap>,
    state: Mutex<FpsState>,
}

impl Default for DynamicFpsController {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamicFpsController {
    pub fn new() -> Self {
        Self {
            up_fps: AtomicU32::new(120),
            down_fps: AtomicU32::new(60),
            idle_ms: AtomicU64::new(2500),
            backdoor_id: AtomicU32::new(1035),
            using_backdoor: AtomicBool::new(false),
            enabled: AtomicBool::new(false),
            current_fps: AtomicU32::new(0),
            target_time_ms: AtomicI64::new(0),
            timer_running: AtomicBool::new(false),
            activation_count: AtomicU32::new(0),
            fps_map: Mutex::new(FpsMap::new()),
            state: Mutex::new(FpsState::Idle),
        }
    }

    pub fn set_fps_map(&self, map: FpsMap) {
        *self.fps_map.lock().unwrap() = map;
    }

    /// Enables or disables the controller entirely. Disabled per
    /// SPEC_FULL.md §8 whenever the boot resolution map turns out empty,
    /// regardless of the `dynamic_fps` config flag.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Called on every path-watcher wake for the input-activity watcher.
    /// Applies `up_fps` on the idle->active transition (or extends the
    /// timer if already active), and arms/re-arms the one-shot timer.
    pub fn on_activity(self: &Arc<Self>) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if *state == FpsState::Idle {
            let count = self.activation_count.fetch_add(1, Ordering::Relaxed) + 1;
            let force = count % 10 == 0;
            self.apply_fps(self.up_fps.load(Ordering::Relaxed), force);
            *state = FpsState::ActiveWait;
        }
        drop(state);

        let idle_ms = self.idle_ms.load(Ordering::Relaxed);
        let deadline = now_ms() + idle_ms as i64;
        self.target_time_ms.store(deadline, Ordering::Relaxed);

        if !self.timer_running.swap(true, Ordering::Relaxed) {
            let this = Arc::clone(self);
            std::thread::spawn(move || this.run_timer());
        }
    }

    fn run_timer(self: Arc<Self>) {
        loop {
            let deadline = self.target_time_ms.load(Ordering::Relaxed);
            let remaining = deadline - now_ms();
            if remaining > 0 {
                std::thread::sleep(Duration::from_millis(remaining as u64));
                continue;
            }
            // Deadline reached without being pushed further out; apply down_fps.
            if self.target_time_ms.load(Ordering::Relaxed) == deadline {
                self.apply_fps(self.down_fps.load(Ordering::Relaxed), false);
                *self.state.lock().unwrap() = FpsState::Idle;
                break;
            }
        }
        self.timer_running.store(false, Ordering::Relaxed);
    }

    fn apply_fps(&self, fps: u32, force: bool) {
        let changed = self.current_fps.swap(fps, Ordering::Relaxed) != fps;
        if !changed && !force {
            return;
        }
        if self.using_backdoor.load(Ordering::Relaxed) {
            let map = self.fps_map.lock().unwrap();
            let id = nearest_fps_id(&map, fps as i32);
            drop(map);
            let code = self.backdoor_id.load(Ordering::Relaxed);
            let arg = (id - 1).max(0);
            ShellCommand::new(format!("service call SurfaceFlinger {code} i32 {arg}")).run();
        } else {
            for (namespace, key) in SETTINGS_KEYS {
                ShellCommand::new(format!("cmd settings put {namespace} {key} {fps}")).run();
            }
        }
    }
}

fn now_ms() -> i64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    start.elapsed().as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_exact_match() {
        let mut map = FpsMap::new();
        map.insert(60, 1);
        map.insert(120, 2);
        assert_eq!(nearest_fps_id(&map, 120), 2);
    }

    #[test]
    fn nearest_ties_go_lower() {
        let mut map = FpsMap::new();
        map.insert(60, 1);
        map.insert(90, 2);
        // |90-75| == |75-60| == 15, tie -> lower (60 -> id 1)
        assert_eq!(nearest_fps_id(&map, 75), 1);
    }

    #[test]
    fn nearest_empty_map_returns_zero() {
        let map = FpsMap::new();
        assert_eq!(nearest_fps_id(&map, 90), 0);
    }

    #[test]
    fn nearest_below_range_clamps_to_lowest() {
        let mut map = FpsMap::new();
        map.insert(60, 1);
        map.insert(120, 2);
        assert_eq!(nearest_fps_id(&map, 10), 1);
    }

    #[test]
    fn parse_display_modes_extracts_fields() {
        let dump = "  DisplayModeRecord{id=0, width=1800, height=2880, fps=60.0}\n  DisplayModeRecord{id=1, width=1800, height=2880, fps=120.0}";
        let records = parse_display_modes(dump);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].fps, 120);
        assert_eq!(records[1].id, 1);
    }

    #[test]
    fn choose_boot_resolution_picks_configured_when_present() {
        let records = vec![
            DisplayModeRecord { id: 0, width: 1080, height: 2400, fps: 60 },
            DisplayModeRecord { id: 1, width: 1800, height: 2880, fps: 120 },
        ];
        let groups = group_by_resolution(&records);
        assert_eq!(choose_boot_resolution(&groups, "1080x2400"), Some("1080x2400"));
    }

    #[test]
    fn choose_boot_resolution_empty_is_none() {
        let groups = BTreeMap::new();
        assert_eq!(choose_boot_resolution(&groups, ""), None);
    }

    #[test]
    fn activation_memoizes_identical_fps() {
        let controller = Arc::new(DynamicFpsController::new());
        controller.current_fps.store(120, Ordering::Relaxed);
        // Applying the same fps without force should be a no-op (checked
        // indirectly: current_fps stays unchanged and no panic occurs).
        controller.apply_fps(120, false);
        assert_eq!(controller.current_fps.load(Ordering::Relaxed), 120);
    }
}
