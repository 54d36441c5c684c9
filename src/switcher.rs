//! Switcher core: the main decision loop that turns screen/battery/foreground
//! state into a mode, plus the independent dynamic-fps input-activity watcher.
//!
//! Grounded on `BSwitcher.cpp`'s `main_loop()`/`load_config()`: a `modified`
//! flag gates an expensive reconfiguration pass (path-watcher re-init,
//! availableModes refresh, energy accountant/fps controller start-stop, scene
//! bootstrap resolution); each iteration sleeps, waits on the path watcher,
//! then settles for 1s before classifying state under the main-config mutex.

use crate::config::{MainConfigStore, SchedulerConfigStore};
use crate::foreground::ForegroundDetector;
use crate::fps::{self, DynamicFpsController};
use crate::modes::{self, ModeWriter, SceneBootstrap};
use crate::power::EnergyAccountant;
use crate::shell::ShellCommand;
use nix::sys::inotify::AddWatchFlags;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SCREEN_STATUS_PATH: &str = "/dev/cpuset/restricted/cgroup.procs";
const BATTERY_CAPACITY_PATH: &str = "/sys/class/power_supply/battery/capacity";
const SCREEN_OFF_LINE_THRESHOLD: usize = 5;

const SETTLE_DELAY_MS: u64 = 1000;
const NORMAL_WAIT_MS: u64 = 40_000;
const SCREEN_OFF_WAIT_MS: u64 = 180_000;
const INITIAL_WAIT_MS: u64 = 10_000;

const TOP_APP_PROCS: &str = "/dev/cpuset/top-app/cgroup.procs";
const TOP_APP_TASKS: &str = "/dev/cpuset/top-app/tasks";
const RESTRICTED_PROCS: &str = "/dev/cpuset/restricted/cgroup.procs";
const RESTRICTED_TASKS: &str = "/dev/cpuset/restricted/tasks";

pub struct SwitcherCore {
    main_config: Arc<MainConfigStore>,
    scheduler_config: Arc<SchedulerConfigStore>,
    current_app: Arc<Mutex<String>>,
    dual_battery: Arc<AtomicBool>,
    power: Arc<EnergyAccountant>,
    fps_controller: Arc<DynamicFpsController>,
    available_modes: Arc<Mutex<Vec<String>>>,
    dynamic_fps_list: Arc<Mutex<Vec<i32>>>,
    static_entry: Option<PathBuf>,
    running: Arc<AtomicBool>,
}

impl SwitcherCore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        main_config: Arc<MainConfigStore>,
        scheduler_config: Arc<SchedulerConfigStore>,
        current_app: Arc<Mutex<String>>,
        dual_battery: Arc<AtomicBool>,
        power: Arc<EnergyAccountant>,
        fps_controller: Arc<DynamicFpsController>,
        available_modes: Arc<Mutex<Vec<String>>>,
        dynamic_fps_list: Arc<Mutex<Vec<i32>>>,
        static_entry: Option<PathBuf>,
    ) -> Self {
        Self {
            main_config,
            scheduler_config,
            current_app,
            dual_battery,
            power,
            fps_controller,
            available_modes,
            dynamic_fps_list,
            static_entry,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Spawns the dedicated `/dev/input` activity watcher that drives the
    /// fps controller's up/down transitions, independent of the main loop.
    pub fn spawn_fps_activity_watcher(&self) {
        let controller = Arc::clone(&self.fps_controller);
        let running = Arc::clone(&self.running);
        std::thread::spawn(move || fps_activity_loop(controller, running));
    }

    /// Runs the main decision loop until `stop()` is called. Never returns
    /// under normal operation.
    pub fn run(&mut self) {
        let mut watcher: Option<crate::watcher::PathWatcher> = None;
        let mut scene = SceneBootstrap { writer: ModeWriter::Dummy };
        let mut last_mode = String::new();
        let mut last_app = String::new();
        let mut poll_wait_ms: u64 = 100;
        let mut wait_timeout_ms: u64 = INITIAL_WAIT_MS;
        let mut foreground = ForegroundDetector::new();

        log::info!("switcher core ready, entering main loop");
        while self.running.load(Ordering::SeqCst) {
            if self.main_config.take_modified() {
                let snapshot = self.main_config.snapshot();
                poll_wait_ms = if snapshot.poll_interval <= 1 { 100 } else { ((snapshot.poll_interval - 1) * 1000) as u64 };

                self.dual_battery.store(snapshot.dual_battery, Ordering::Relaxed);

                if snapshot.power_monitoring {
                    self.power.start();
                } else {
                    self.power.stop();
                }

                self.fps_controller.idle_ms.store(snapshot.fps_idle_time.max(0) as u64, Ordering::Relaxed);
                self.fps_controller.backdoor_id.store(snapshot.fps_backdoor_id.max(0) as u32, Ordering::Relaxed);
                self.fps_controller.using_backdoor.store(snapshot.fps_backdoor, Ordering::Relaxed);
                if snapshot.dynamic_fps {
                    let fps_list = bootstrap_fps_map(&self.fps_controller, &snapshot.screen_resolution);
                    // Resolution map empty: dynamic-fps stays disabled
                    // regardless of the config flag (SPEC_FULL.md §8).
                    self.fps_controller.set_enabled(!fps_list.is_empty());
                    *self.dynamic_fps_list.lock().unwrap() = fps_list;
                } else {
                    self.fps_controller.set_enabled(false);
                }

                if snapshot.using_inotify {
                    let mut new_watcher = crate::watcher::PathWatcher::new(
                        vec![
                            PathBuf::from(TOP_APP_PROCS),
                            PathBuf::from(TOP_APP_TASKS),
                            PathBuf::from(RESTRICTED_PROCS),
                            PathBuf::from(RESTRICTED_TASKS),
                        ],
                        AddWatchFlags::IN_MODIFY,
                    );
                    new_watcher.initialize();
                    watcher = Some(new_watcher);
                } else {
                    watcher = None;
                }

                {
                    let mut modes = self.available_modes.lock().unwrap();
                    *modes = crate::rpc::targets::available_modes_with_custom(&snapshot.custom_mode);
                }

                scene = modes::resolve_scene_bootstrap(
                    snapshot.scene,
                    snapshot.scene_strict,
                    &snapshot.mode_file,
                    snapshot.enable_dynamic,
                    self.static_entry.as_deref(),
                );

                last_mode.clear();
                log::debug!("config reloaded");
            }

            std::thread::sleep(Duration::from_millis(poll_wait_ms));
            if let Some(w) = &watcher {
                w.wait(wait_timeout_ms, SETTLE_DELAY_MS);
            } else {
                std::thread::sleep(Duration::from_millis(SETTLE_DELAY_MS.min(wait_timeout_ms)));
            }

            let snapshot = self.main_config.snapshot();
            if !(snapshot.dynamic_fps || snapshot.power_monitoring || snapshot.enable_dynamic) {
                continue;
            }

            let mut up_fps = if snapshot.up_fps > 0 { snapshot.up_fps as u32 } else { 120 };
            let mut down_fps = if snapshot.down_fps > 0 { snapshot.down_fps as u32 } else { 60 };

            let new_mode;
            if !screen_on() {
                self.power.set_screen_status(false);
                new_mode = if scene_strict(&scene) { "standby".to_string() } else { snapshot.screen_off.clone() };
                up_fps = 60;
                down_fps = 60;
                wait_timeout_ms = SCREEN_OFF_WAIT_MS;
                *self.current_app.lock().unwrap() = String::new();
                log::debug!("screen off, backing off poll cadence");
            } else {
                self.power.set_screen_status(true);
                wait_timeout_ms = NORMAL_WAIT_MS;

                if battery_level() < snapshot.low_battery_threshold {
                    new_mode = "powersave".to_string();
                    up_fps = 60;
                    down_fps = 60;
                } else {
                    let scheduler = self.scheduler_config.snapshot();
                    let mut mode = scheduler.default_mode.clone();
                    let app = foreground.get_foreground_app();
                    *self.current_app.lock().unwrap() = app.clone();
                    log::debug!("current foreground app: {app}");

                    if !app.is_empty() {
                        for rule in &scheduler.rules {
                            if rule.app_package == app {
                                mode = rule.mode.clone();
                                if rule.down_fps > 0 {
                                    down_fps = rule.down_fps as u32;
                                }
                                if rule.up_fps > 0 {
                                    up_fps = rule.up_fps as u32;
                                }
                                break;
                            }
                            std::thread::sleep(Duration::from_millis(1));
                        }
                    }
                    new_mode = mode;
                }
            }

            self.fps_controller.up_fps.store(up_fps, Ordering::Relaxed);
            self.fps_controller.down_fps.store(down_fps, Ordering::Relaxed);

            let current_app = self.current_app.lock().unwrap().clone();
            if scene_strict(&scene) {
                if current_app != last_app {
                    modes::emit_mode(&scene.writer, &new_mode, &current_app);
                    last_app = current_app;
                    log::info!("updated to: {new_mode}");
                }
            } else if last_mode != new_mode {
                modes::emit_mode(&scene.writer, &new_mode, &current_app);
                last_mode = new_mode;
                log::info!("updated to: {}", last_mode);
            }
        }
    }
}

fn scene_strict(scene: &SceneBootstrap) -> bool {
    matches!(&scene.writer, ModeWriter::Scene { strict, .. } if *strict)
}

/// Fewer than 5 newlines in the restricted cgroup's procs file, or an
/// unreadable file, means the screen is considered on (the conservative
/// default preserved from the source).
fn screen_on() -> bool {
    match std::fs::read(SCREEN_STATUS_PATH) {
        Ok(bytes) => bytes.iter().filter(|b| **b == b'\n').count() < SCREEN_OFF_LINE_THRESHOLD,
        Err(_) => true,
    }
}

/// Battery percentage, defaulting to 100 (never triggers low-battery mode)
/// if the sysfs node can't be read.
fn battery_level() -> i64 {
    std::fs::read_to_string(BATTERY_CAPACITY_PATH)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(100)
}

fn fps_activity_loop(controller: Arc<DynamicFpsController>, running: Arc<AtomicBool>) {
    let Ok(entries) = std::fs::read_dir("/dev/input") else {
        log::warn!("failed to enumerate /dev/input, dynamic fps activity watcher disabled");
        return;
    };
    let paths: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
    if paths.is_empty() {
        return;
    }

    let mut watcher = crate::watcher::PathWatcher::new(paths, AddWatchFlags::IN_ACCESS)
        .with_min_poll(Duration::from_millis(300));
    if !watcher.initialize() {
        log::warn!("dynamic fps activity watcher failed to initialize");
        return;
    }

    while running.load(Ordering::SeqCst) {
        if watcher.wait(u64::MAX, 0) {
            controller.on_activity();
        }
    }
    watcher.cleanup();
}

/// Discovers display modes via `dumpsys display` and populates the fps
/// controller's map for the chosen boot resolution.
pub fn bootstrap_fps_map(controller: &DynamicFpsController, configured_resolution: &str) -> Vec<i32> {
    let output = ShellCommand::new("dumpsys display | grep DisplayModeRecord").run();
    let records = fps::parse_display_modes(&output.stdout);
    let groups = fps::group_by_resolution(&records);
    let Some(resolution) = fps::choose_boot_resolution(&groups, configured_resolution) else {
        return Vec::new();
    };
    let Some(group) = groups.get(resolution) else {
        return Vec::new();
    };
    let map: fps::FpsMap = group.iter().map(|r| (r.fps, r.id)).collect();
    let fps_list: Vec<i32> = map.keys().copied().collect();
    controller.set_fps_map(map);
    fps_list
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scene_strict_false_for_dummy_writer() {
        let scene = SceneBootstrap { writer: ModeWriter::Dummy };
        assert!(!scene_strict(&scene));
    }

    #[test]
    fn scene_strict_reflects_writer_flag() {
        let scene = SceneBootstrap { writer: ModeWriter::Scene { entry: PathBuf::from("/data/powercfg.sh"), strict: true } };
        assert!(scene_strict(&scene));
    }

    #[test]
    fn screen_on_is_conservative_default_on_missing_file() {
        assert!(screen_on());
    }

    #[test]
    fn battery_level_defaults_to_100_on_missing_file() {
        assert_eq!(battery_level(), 100);
    }
}
