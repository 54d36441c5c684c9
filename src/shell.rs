//! Synchronous subprocess invocation helper.
//!
//! Every subprocess named in SPEC_FULL.md §6 (`dumpsys`, `cmd settings put`,
//! `service call SurfaceFlinger`, `sh <entry> <mode>`, `pm`/`aapt`) is spawned
//! through this one choke point, adapted from the donor crate's
//! `ShellCommand` (`repositories/utils.rs`) to blocking `std::process::Command`.
//! Environment variables are always attached to the single `Command` being
//! spawned, never to the daemon's own process environment, which is what
//! keeps the scene-strict env leakage note in SPEC_FULL.md §9 trivially true.

use std::collections::HashMap;
use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Default per-command timeout; long enough for `dumpsys` on a loaded
/// device, short enough that a wedged subprocess can't stall the main loop.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ShellCommand {
    command: String,
    timeout: Duration,
    env: HashMap<String, String>,
}

/// Output captured from a completed (or forcibly killed) subprocess.
pub struct ShellOutput {
    pub status_success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl ShellCommand {
    pub fn new(command: impl Into<String>) -> Self {
        let mut env = HashMap::new();
        env.insert("LC_ALL".to_string(), "C".to_string());
        Self { command: command.into(), timeout: DEFAULT_TIMEOUT, env }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Attaches an environment variable to this single invocation only.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Runs `sh -c <command>`, waiting up to the configured timeout. A
    /// timed-out child is killed and reported as a non-success status with
    /// empty output, matching the "external command failed" error kind in
    /// SPEC_FULL.md §7. Stdout/stderr are drained on their own threads
    /// concurrently with the wait, not read back after exit: a child that
    /// fills its pipe buffer (e.g. the unfiltered `dumpsys activity
    /// activities` scan) would otherwise block on write and never exit.
    pub fn run(self) -> ShellOutput {
        let mut child = match Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                log::warn!("failed to spawn '{}': {err}", self.command);
                return ShellOutput { status_success: false, stdout: String::new(), stderr: String::new() };
            }
        };

        let stdout_reader = child.stdout.take().map(spawn_drain);
        let stderr_reader = child.stderr.take().map(spawn_drain);

        let deadline = Instant::now() + self.timeout;
        let success = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status.success(),
                Ok(None) => {
                    if Instant::now() >= deadline {
                        log::warn!("'{}' timed out after {:?}, killing", self.command, self.timeout);
                        let _ = child.kill();
                        let _ = child.wait();
                        break false;
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(err) => {
                    log::warn!("failed to poll '{}': {err}", self.command);
                    break false;
                }
            }
        };

        let stdout = stdout_reader.and_then(|handle| handle.join().ok()).unwrap_or_default();
        let stderr = stderr_reader.and_then(|handle| handle.join().ok()).unwrap_or_default();
        ShellOutput { status_success: success, stdout, stderr }
    }
}

fn spawn_drain(mut pipe: impl Read + Send + 'static) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = String::new();
        let _ = pipe.read_to_string(&mut buf);
        buf
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout() {
        let out = ShellCommand::new("echo hello").run();
        assert!(out.status_success);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn per_call_env_does_not_leak_to_parent() {
        assert!(std::env::var("BSWITCHERD_TEST_VAR").is_err());
        let out = ShellCommand::new("printf \"%s\" \"$BSWITCHERD_TEST_VAR\"")
            .env("BSWITCHERD_TEST_VAR", "marker")
            .run();
        assert_eq!(out.stdout, "marker");
        assert!(std::env::var("BSWITCHERD_TEST_VAR").is_err());
    }

    #[test]
    fn timeout_kills_child() {
        let out = ShellCommand::new("sleep 5").timeout(Duration::from_millis(100)).run();
        assert!(!out.status_success);
    }

    #[test]
    fn large_output_does_not_deadlock() {
        // Bigger than a typical pipe buffer: would block the child on write
        // (and thus never exit) if stdout weren't drained concurrently.
        let out = ShellCommand::new("yes x | head -c 200000")
            .timeout(Duration::from_secs(5))
            .run();
        assert!(out.status_success);
        assert_eq!(out.stdout.len(), 200_000);
    }
}
