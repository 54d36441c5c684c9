//! Named target registry: a tagged set of variants (SPEC_FULL.md §9 "
//! Polymorphic target registry"), populated once at boot, rather than trait
//! objects — mirroring the ConfigTarget hierarchy's capability set
//! {getName, read, write} from `ConfigModule.hpp`/`MonitorModule.hpp`
//! without dynamic dispatch.

use crate::config::{MainConfigStore, SchedulerConfigStore};
use crate::error::DaemonError;
use crate::power::EnergyAccountant;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};

pub struct StaticInfo {
    pub name: String,
    pub author: String,
    pub version: String,
}

pub struct Registry {
    pub main_config: Arc<MainConfigStore>,
    pub scheduler_config: Arc<SchedulerConfigStore>,
    pub info: StaticInfo,
    pub available_modes: Arc<Mutex<Vec<String>>>,
    pub power: Arc<EnergyAccountant>,
    pub dynamic_fps_list: Arc<Mutex<Vec<i32>>>,
    pub configlist: Value,
    /// Set when a complete, enabled `static_data.json` locks the scheduler
    /// down to read-only, hiding its fields from front-end editing
    /// (SPEC_FULL.md §3's StaticData / §9 static-data bootstrap).
    pub scheduler_locked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
}

impl Registry {
    /// Dispatches by target name + mode, returning the target's JSON
    /// verbatim, or a structured `DaemonError` for invalid targets/modes.
    pub fn dispatch(&self, target: &str, mode: Mode, data: Option<&Value>) -> Result<Value, DaemonError> {
        match target {
            "config" => self.config_target(mode, data),
            "scheduler" => self.scheduler_target(mode, data),
            "info" => self.read_only(mode, target, || {
                json!({"name": self.info.name, "author": self.info.author, "version": self.info.version})
            }),
            "applist" => self.read_only(mode, target, || {
                // Enumerating installed packages is external to the core
                // (SPEC_FULL.md §9); a live implementation would shell out
                // to `pm list packages` / `aapt`, cached per SPEC_FULL.md's
                // documented-but-peripheral strategy.
                json!([])
            }),
            "configlist" => self.read_only(mode, target, || self.configlist.clone()),
            "availableModes" => {
                self.read_only(mode, target, || json!(self.available_modes.lock().unwrap().clone()))
            }
            "powerdata" => self.read_only(mode, target, || self.power.read_snapshot()),
            "command" => self.command_target(mode, data),
            "dynamicFps" => {
                self.read_only(mode, target, || json!(self.dynamic_fps_list.lock().unwrap().clone()))
            }
            other => Err(DaemonError::InvalidTarget { target: other.to_string() }),
        }
    }

    fn read_only(&self, mode: Mode, name: &str, read: impl FnOnce() -> Value) -> Result<Value, DaemonError> {
        match mode {
            Mode::Read => Ok(read()),
            Mode::Write => Err(DaemonError::ReadOnlyTarget { name: name.to_string() }),
        }
    }

    fn config_target(&self, mode: Mode, data: Option<&Value>) -> Result<Value, DaemonError> {
        match mode {
            Mode::Read => Ok(self.main_config.read()),
            Mode::Write => {
                let data = data.ok_or(DaemonError::MissingWriteData)?;
                self.main_config.write(data).map_err(|message| DaemonError::Io { message })
            }
        }
    }

    fn scheduler_target(&self, mode: Mode, data: Option<&Value>) -> Result<Value, DaemonError> {
        match mode {
            Mode::Read => Ok(self.scheduler_config.read()),
            Mode::Write if self.scheduler_locked => {
                Err(DaemonError::ReadOnlyTarget { name: "scheduler".to_string() })
            }
            Mode::Write => {
                let data = data.ok_or(DaemonError::MissingWriteData)?;
                self.scheduler_config.write(data).map_err(|message| DaemonError::Io { message })
            }
        }
    }

    /// `command`'s value is an array whose first element is a command key
    /// string. The only recognized key is `clear_monitoring`; anything else
    /// returns a non-error `{message: "Unknown command: ..."}`.
    fn command_target(&self, mode: Mode, data: Option<&Value>) -> Result<Value, DaemonError> {
        if mode != Mode::Write {
            return Err(DaemonError::WriteOnlyTarget { name: "command".to_string() });
        }
        let data = data.ok_or(DaemonError::MissingWriteData)?;
        let Some(key) = data.as_array().and_then(|a| a.first()).and_then(Value::as_str) else {
            return Err(DaemonError::MissingWriteData);
        };
        match key {
            "clear_monitoring" => {
                self.power.clear_stats();
                Ok(json!({"message": "Power stats cleared"}))
            }
            other => Ok(json!({"message": format!("Unknown command: {other}")})),
        }
    }
}

/// Builds the availableModes vocabulary: the fixed set plus an optional
/// custom mode appended.
pub fn available_modes_with_custom(custom_mode: &str) -> Vec<String> {
    let mut modes: Vec<String> =
        ["powersave", "balance", "performance", "fast"].iter().map(|s| s.to_string()).collect();
    if !custom_mode.is_empty() {
        modes.push(custom_mode.to_string());
    }
    modes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_modes_appends_custom() {
        let modes = available_modes_with_custom("turbo");
        assert_eq!(modes, vec!["powersave", "balance", "performance", "fast", "turbo"]);
    }

    #[test]
    fn available_modes_omits_empty_custom() {
        let modes = available_modes_with_custom("");
        assert_eq!(modes, vec!["powersave", "balance", "performance", "fast"]);
    }

    #[test]
    fn scheduler_locked_rejects_write() {
        use crate::config::{MainConfigStore, SchedulerConfigStore};
        use crate::power::EnergyAccountant;
        use std::sync::atomic::AtomicBool;

        let dir = std::env::temp_dir().join(format!("bswitcherd-targets-test-{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        let registry = Registry {
            main_config: Arc::new(MainConfigStore::new(dir.join("config.json"))),
            scheduler_config: Arc::new(SchedulerConfigStore::new(dir.join("scheduler_config.json"))),
            info: StaticInfo { name: "x".into(), author: "y".into(), version: "1".into() },
            available_modes: Arc::new(Mutex::new(vec![])),
            power: Arc::new(EnergyAccountant::new(Arc::new(Mutex::new(String::new())), Arc::new(AtomicBool::new(false)))),
            dynamic_fps_list: Arc::new(Mutex::new(vec![])),
            configlist: json!({}),
            scheduler_locked: true,
        };
        let err = registry
            .dispatch("scheduler", Mode::Write, Some(&json!({"defaultMode": "balance"})))
            .unwrap_err();
        assert_eq!(err.to_response()["message"], "scheduler target is read-only");
    }
}
