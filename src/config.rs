//! File-backed, mtime-gated, mutex-protected config stores.
//!
//! Grounded on `ConfigModule.hpp`'s `FileConfigTarget`/`MainConfigTarget`/
//! `SchedulerConfigTarget`: writes merge only the keys present in the
//! incoming JSON into the in-memory record (unknown incoming keys are
//! ignored; known-but-absent keys keep their prior in-memory value, not the
//! type default), then the whole record is re-serialized.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MainConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval: i64,
    #[serde(default = "default_low_battery_threshold")]
    pub low_battery_threshold: i64,
    #[serde(default = "default_true")]
    pub scene: bool,
    #[serde(default = "default_true")]
    pub enable_dynamic: bool,
    #[serde(default)]
    pub mode_file: String,
    #[serde(default = "default_screen_off")]
    pub screen_off: String,
    #[serde(default)]
    pub scene_strict: bool,
    #[serde(default = "default_true")]
    pub power_monitoring: bool,
    #[serde(default = "default_true")]
    pub using_inotify: bool,
    #[serde(default)]
    pub dual_battery: bool,
    #[serde(default)]
    pub custom_mode: String,
    #[serde(default)]
    pub dynamic_fps: bool,
    #[serde(default = "default_fps_idle_time")]
    pub fps_idle_time: i64,
    #[serde(default = "default_down_fps")]
    pub down_fps: i64,
    #[serde(default = "default_up_fps")]
    pub up_fps: i64,
    #[serde(default)]
    pub fps_backdoor: bool,
    #[serde(default = "default_fps_backdoor_id")]
    pub fps_backdoor_id: i64,
    #[serde(default)]
    pub screen_resolution: String,
}

fn default_poll_interval() -> i64 {
    2
}
fn default_low_battery_threshold() -> i64 {
    15
}
fn default_true() -> bool {
    true
}
fn default_screen_off() -> String {
    "powersave".to_string()
}
fn default_fps_idle_time() -> i64 {
    2500
}
fn default_down_fps() -> i64 {
    60
}
fn default_up_fps() -> i64 {
    120
}
fn default_fps_backdoor_id() -> i64 {
    1035
}

impl Default for MainConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            low_battery_threshold: default_low_battery_threshold(),
            scene: true,
            enable_dynamic: true,
            mode_file: String::new(),
            screen_off: default_screen_off(),
            scene_strict: false,
            power_monitoring: true,
            using_inotify: true,
            dual_battery: false,
            custom_mode: String::new(),
            dynamic_fps: false,
            fps_idle_time: default_fps_idle_time(),
            down_fps: default_down_fps(),
            up_fps: default_up_fps(),
            fps_backdoor: false,
            fps_backdoor_id: default_fps_backdoor_id(),
            screen_resolution: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SchedulerRule {
    #[serde(rename = "appPackage", default)]
    pub app_package: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default = "minus_one")]
    pub up_fps: i64,
    #[serde(default = "minus_one")]
    pub down_fps: i64,
}

fn minus_one() -> i64 {
    -1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SchedulerConfig {
    #[serde(rename = "defaultMode", default)]
    pub default_mode: String,
    #[serde(default)]
    pub rules: Vec<SchedulerRule>,
}

impl SchedulerConfig {
    fn drop_incomplete_rules(&mut self) {
        self.rules.retain(|r| !r.app_package.is_empty() && !r.mode.is_empty());
    }
}

/// Lenient coercion: a known field may arrive as a real JSON number/bool, or
/// as a string encoding one (`"25"`, `"true"/"1"/"yes"`).
fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        _ => None,
    }
}

fn coerce_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn coerce_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

macro_rules! merge_bool {
    ($record:expr, $incoming:expr, $key:literal, $field:ident) => {
        if let Some(v) = $incoming.get($key).and_then(coerce_bool) {
            $record.$field = v;
        }
    };
}
macro_rules! merge_i64 {
    ($record:expr, $incoming:expr, $key:literal, $field:ident) => {
        if let Some(v) = $incoming.get($key).and_then(coerce_i64) {
            $record.$field = v;
        }
    };
}
macro_rules! merge_string {
    ($record:expr, $incoming:expr, $key:literal, $field:ident) => {
        if let Some(v) = $incoming.get($key).and_then(coerce_string) {
            $record.$field = v;
        }
    };
}

fn merge_main_config(record: &mut MainConfig, incoming: &Value) {
    merge_i64!(record, incoming, "poll_interval", poll_interval);
    merge_i64!(record, incoming, "low_battery_threshold", low_battery_threshold);
    merge_bool!(record, incoming, "scene", scene);
    merge_bool!(record, incoming, "enable_dynamic", enable_dynamic);
    merge_string!(record, incoming, "mode_file", mode_file);
    merge_string!(record, incoming, "screen_off", screen_off);
    merge_bool!(record, incoming, "scene_strict", scene_strict);
    merge_bool!(record, incoming, "power_monitoring", power_monitoring);
    merge_bool!(record, incoming, "using_inotify", using_inotify);
    merge_bool!(record, incoming, "dual_battery", dual_battery);
    merge_string!(record, incoming, "custom_mode", custom_mode);
    merge_bool!(record, incoming, "dynamic_fps", dynamic_fps);
    merge_i64!(record, incoming, "fps_idle_time", fps_idle_time);
    merge_i64!(record, incoming, "down_fps", down_fps);
    merge_i64!(record, incoming, "up_fps", up_fps);
    merge_bool!(record, incoming, "fps_backdoor", fps_backdoor);
    merge_i64!(record, incoming, "fps_backdoor_id", fps_backdoor_id);
    merge_string!(record, incoming, "screen_resolution", screen_resolution);
}

struct FileBacked<T> {
    path: PathBuf,
    record: Mutex<T>,
    last_mtime: Mutex<Option<SystemTime>>,
}

impl<T> FileBacked<T>
where
    T: Default + Clone + Serialize + for<'de> Deserialize<'de>,
{
    fn new(path: PathBuf) -> Self {
        Self { path, record: Mutex::new(T::default()), last_mtime: Mutex::new(None) }
    }

    fn mtime(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).ok()?.modified().ok()
    }

    /// Reloads from disk if mtime advanced (or on first call). Returns
    /// `true` if a reload happened.
    fn reload_if_stale(&self) -> bool {
        let current_mtime = self.mtime();
        let mut last = self.last_mtime.lock().unwrap();
        if *last == current_mtime && last.is_some() {
            return false;
        }
        let loaded = fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| serde_json::from_str::<T>(&s).ok())
            .unwrap_or_default();
        *self.record.lock().unwrap() = loaded;
        *last = current_mtime;
        true
    }

    fn write_to_disk(&self) -> std::io::Result<()> {
        let record = self.record.lock().unwrap();
        let text = serde_json::to_string_pretty(&*record).unwrap_or_default();
        fs::write(&self.path, text)?;
        *self.last_mtime.lock().unwrap() = self.mtime();
        Ok(())
    }
}

pub struct MainConfigStore {
    backing: FileBacked<MainConfig>,
    modified: Mutex<bool>,
}

impl MainConfigStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let store = Self { backing: FileBacked::new(path.as_ref().to_path_buf()), modified: Mutex::new(true) };
        store.backing.reload_if_stale();
        store
    }

    /// `stat`s the file and reloads if mtime changed since last load,
    /// setting `modified`.
    pub fn poll_mtime(&self) {
        if self.backing.reload_if_stale() {
            *self.modified.lock().unwrap() = true;
        }
    }

    pub fn take_modified(&self) -> bool {
        let mut guard = self.modified.lock().unwrap();
        let was = *guard;
        *guard = false;
        was
    }

    pub fn read(&self) -> Value {
        self.poll_mtime();
        serde_json::to_value(&*self.backing.record.lock().unwrap()).unwrap()
    }

    pub fn write(&self, incoming: &Value) -> Result<Value, String> {
        {
            let mut record = self.backing.record.lock().unwrap();
            merge_main_config(&mut record, incoming);
        }
        self.backing.write_to_disk().map_err(|e| e.to_string())?;
        *self.modified.lock().unwrap() = true;
        Ok(self.read())
    }

    pub fn snapshot(&self) -> MainConfig {
        self.backing.record.lock().unwrap().clone()
    }
}

pub struct SchedulerConfigStore {
    backing: FileBacked<SchedulerConfig>,
}

impl SchedulerConfigStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let store = Self { backing: FileBacked::new(path.as_ref().to_path_buf()) };
        store.backing.reload_if_stale();
        store.backing.record.lock().unwrap().drop_incomplete_rules();
        store
    }

    pub fn read(&self) -> Value {
        self.backing.reload_if_stale();
        serde_json::to_value(&*self.backing.record.lock().unwrap()).unwrap()
    }

    pub fn write(&self, incoming: &Value) -> Result<Value, String> {
        {
            let mut record = self.backing.record.lock().unwrap();
            if let Some(default_mode) = incoming.get("defaultMode").and_then(coerce_string) {
                record.default_mode = default_mode;
            }
            if let Some(rules) = incoming.get("rules").and_then(|v| v.as_array()) {
                let parsed: Vec<SchedulerRule> =
                    rules.iter().filter_map(|r| serde_json::from_value(r.clone()).ok()).collect();
                record.rules = parsed;
            }
            record.drop_incomplete_rules();
        }
        self.backing.write_to_disk().map_err(|e| e.to_string())?;
        Ok(self.read())
    }

    pub fn snapshot(&self) -> SchedulerConfig {
        self.backing.record.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_path(name: &str) -> PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("bswitcherd-test-{name}-{n}-{}.json", std::process::id()))
    }

    #[test]
    fn main_config_defaults() {
        let cfg = MainConfig::default();
        assert_eq!(cfg.poll_interval, 2);
        assert_eq!(cfg.low_battery_threshold, 15);
        assert!(cfg.scene);
        assert_eq!(cfg.up_fps, 120);
    }

    #[test]
    fn write_then_read_reflects_merged_state() {
        let path = temp_path("main");
        let store = MainConfigStore::new(&path);
        let result = store.write(&json!({"low_battery_threshold": 25})).unwrap();
        assert_eq!(result["low_battery_threshold"], 25);
        // other fields keep prior (default) values, not reset
        assert_eq!(result["poll_interval"], 2);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn lenient_coercion_accepts_string_number_and_yes() {
        let path = temp_path("coerce");
        let store = MainConfigStore::new(&path);
        store.write(&json!({"low_battery_threshold": "30", "scene": "yes"})).unwrap();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.low_battery_threshold, 30);
        assert!(snapshot.scene);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let path = temp_path("unknown");
        let store = MainConfigStore::new(&path);
        let result = store.write(&json!({"not_a_real_key": 99})).unwrap();
        assert!(!result.as_object().unwrap().contains_key("not_a_real_key"));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn repeated_reads_without_write_are_stable() {
        let path = temp_path("stable");
        let store = MainConfigStore::new(&path);
        let a = store.read();
        let b = store.read();
        assert_eq!(a, b);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn scheduler_drops_incomplete_rules_on_write() {
        let path = temp_path("sched");
        let store = SchedulerConfigStore::new(&path);
        store
            .write(&json!({
                "defaultMode": "balance",
                "rules": [
                    {"appPackage": "com.x.y", "mode": "performance"},
                    {"appPackage": "", "mode": "performance"},
                    {"appPackage": "com.z", "mode": ""}
                ]
            }))
            .unwrap();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.rules.len(), 1);
        assert_eq!(snapshot.rules[0].app_package, "com.x.y");
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn initial_load_marks_modified_even_without_file() {
        let path = temp_path("missing");
        let store = MainConfigStore::new(&path);
        assert!(store.take_modified());
        let _ = fs::remove_file(&path);
    }
}
