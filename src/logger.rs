//! Process-wide logger installation.
//!
//! Mirrors the dual-backend pattern used throughout the daemon's ecosystem:
//! when the process is launched under systemd with its stdout/stderr wired to
//! the journal, structured fields are emitted directly to the journal;
//! otherwise a conventional line-oriented logger writes to stdout. The
//! environment variable name intentionally matches `env_logger`'s own
//! convention so operators already familiar with it need nothing new.

use log::LevelFilter;
use std::sync::OnceLock;

/// Environment variable read for the default log level, e.g. `RUST_LOG=debug`.
const LOG_ENV: &str = "BSWITCHERD_LOG";

static LOGGER_INIT: OnceLock<()> = OnceLock::new();

/// Installs the process-wide logger. Idempotent: later calls are no-ops.
pub fn init(debug: bool) {
    LOGGER_INIT.get_or_init(|| install(debug));
}

fn install(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };

    if systemd_journal_logger::connected_to_journal() {
        systemd_journal_logger::JournalLog::new()
            .expect("failed to initialize systemd journal logger")
            .install()
            .expect("failed to install journal logger");
        let level = std::env::var(LOG_ENV)
            .ok()
            .and_then(|v| v.parse::<LevelFilter>().ok())
            .unwrap_or(if debug {
                LevelFilter::Debug
            } else {
                LevelFilter::Info
            });
        log::set_max_level(level);
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().filter_or(LOG_ENV, default_level))
            .format_timestamp_millis()
            .init();
    }

    // Third-party crates in this dependency set are quiet by default; no
    // module filters are needed the way the donor logger silences its much
    // larger async/web stack.
    log::info!("logger initialized (journal={})", systemd_journal_logger::connected_to_journal());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init(false);
        init(true); // second call must not panic
    }
}
