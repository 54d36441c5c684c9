//! Entry point: parses the CLI, installs the logger, loads the optional
//! static-data override, wires the shared state between the RPC server and
//! the switcher core, and hands the whole thing to the daemonizing
//! supervisor.
//!
//! Grounded on `main.cpp`'s `main()`: resolve the working directory, load
//! config, construct the switcher, double-fork, bind cpu affinity, then loop
//! forever respawning the worker. No root/privilege check is performed here:
//! the process is launched already-privileged by its caller, not by an
//! interactive login shell (see DESIGN.md).

mod config;
mod error;
mod foreground;
mod fps;
mod logger;
mod modes;
mod power;
mod rpc;
mod shell;
mod static_data;
mod supervisor;
mod switcher;
mod watcher;

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use fps::DynamicFpsController;
use power::EnergyAccountant;
use rpc::RpcServer;
use rpc::targets::{Registry, StaticInfo, available_modes_with_custom};
use static_data::StaticData;
use switcher::SwitcherCore;

const DEFAULT_SOCKET_PATH: &str = "/dev/BSwitcher";
const MAIN_CONFIG_FILE: &str = "config.json";
const SCHEDULER_CONFIG_FILE: &str = "scheduler_config.json";
const STATIC_DATA_FILE: &str = "static_data.json";
const CONFIGLIST_FILE: &str = "configlist.json";

/// Android userspace power/performance mode-switching daemon.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Runtime working directory holding config.json, scheduler_config.json
    /// and static_data.json. Defaults to the executable's own directory.
    #[clap(long, short = 'p')]
    path: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logger::init(false);

    let working_dir = resolve_working_dir(args.path);
    supervisor::daemonize(Some(&working_dir)).context("failed to daemonize")?;
    supervisor::bind_to_little_cores();

    let static_data = StaticData::load(Path::new(STATIC_DATA_FILE)).filter(StaticData::is_complete);
    let info = static_info_from(static_data.as_ref());
    let static_entry = static_data.as_ref().map(|data| PathBuf::from(&data.entry_path));
    let scheduler_locked = static_data.is_some();

    let main_config = Arc::new(config::MainConfigStore::new(MAIN_CONFIG_FILE));
    let scheduler_config = Arc::new(config::SchedulerConfigStore::new(SCHEDULER_CONFIG_FILE));

    let current_app = Arc::new(Mutex::new(String::new()));
    let dual_battery = Arc::new(AtomicBool::new(false));
    let power = Arc::new(EnergyAccountant::new(Arc::clone(&current_app), Arc::clone(&dual_battery)));
    let fps_controller = Arc::new(DynamicFpsController::new());
    let available_modes = Arc::new(Mutex::new(available_modes_with_custom("")));
    let dynamic_fps_list = Arc::new(Mutex::new(Vec::new()));
    let configlist = load_configlist();

    let registry = Arc::new(Registry {
        main_config: Arc::clone(&main_config),
        scheduler_config: Arc::clone(&scheduler_config),
        info,
        available_modes: Arc::clone(&available_modes),
        power: Arc::clone(&power),
        dynamic_fps_list: Arc::clone(&dynamic_fps_list),
        configlist,
        scheduler_locked,
    });

    let _rpc_server = RpcServer::start(Path::new(DEFAULT_SOCKET_PATH), Arc::clone(&registry));

    let mut switcher = SwitcherCore::new(
        main_config,
        scheduler_config,
        current_app,
        dual_battery,
        power,
        Arc::clone(&fps_controller),
        available_modes,
        dynamic_fps_list,
        static_entry,
    );
    switcher.spawn_fps_activity_watcher();

    supervisor::supervise_worker(|| {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| switcher.run()));
        if let Err(payload) = result {
            log::error!("switcher core panicked: {}", panic_message(&payload));
        }
    });
}

fn resolve_working_dir(path: Option<PathBuf>) -> PathBuf {
    path.unwrap_or_else(|| {
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("/"))
    })
}

fn static_info_from(static_data: Option<&StaticData>) -> StaticInfo {
    match static_data {
        Some(data) => StaticInfo { name: data.name.clone(), author: data.author.clone(), version: data.version.clone() },
        None => StaticInfo {
            name: env!("CARGO_PKG_NAME").to_string(),
            author: env!("CARGO_PKG_AUTHORS").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    }
}

/// The opaque front-end schema pass-through. Absent or unparsable is not an
/// error: the `configlist` target simply answers with an empty object.
fn load_configlist() -> serde_json::Value {
    std::fs::read_to_string(CONFIGLIST_FILE)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_else(|| serde_json::json!({}))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}
