//! Unix-domain-socket JSON line-protocol RPC server.
//!
//! Grounded on `UnixSocketServer.cpp`: one request/response per connection;
//! a shutdown pipe is polled alongside the listening socket so shutdown is a
//! single cooperative wakeup; per-client reads use a poll timeout capped at
//! 100 ms per call, computed from the remaining per-connection inactivity
//! budget; JSON parse error id 101 ("unexpected end of input") means "keep
//! buffering", any other parse error sends `{"error": "Invalid JSON format"}`
//! and disconnects.

pub mod targets;

use crate::error::DaemonError;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::unistd::{pipe, write};
use serde_json::Value;
use std::io::{Read, Write as _};
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use targets::{Mode, Registry};

const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_SLICE_MS: u32 = 100;

pub struct RpcServer {
    listener_thread: Option<std::thread::JoinHandle<()>>,
    shutdown_write: Option<OwnedFd>,
    running: Arc<AtomicBool>,
}

impl RpcServer {
    /// Unlinks any stale socket file, binds, and starts the listening
    /// thread. Returns `None` on bind failure (logged).
    pub fn start(path: &Path, registry: Arc<Registry>) -> Option<Self> {
        let _ = std::fs::remove_file(path);
        let listener = match UnixListener::bind(path) {
            Ok(listener) => listener,
            Err(err) => {
                log::error!("failed to bind rpc socket at {}: {err}", path.display());
                return None;
            }
        };
        listener.set_nonblocking(true).ok();

        let (shutdown_read, shutdown_write) = match pipe() {
            Ok(pair) => pair,
            Err(err) => {
                log::error!("failed to create rpc shutdown pipe: {err}");
                return None;
            }
        };

        let running = Arc::new(AtomicBool::new(true));
        let running_clone = Arc::clone(&running);
        let thread = std::thread::spawn(move || accept_loop(listener, shutdown_read, running_clone, registry));

        log::info!("rpc server listening on {}", path.display());
        Some(Self { listener_thread: Some(thread), shutdown_write: Some(shutdown_write), running })
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(fd) = self.shutdown_write.take() {
            let _ = write(&fd, &[1u8]);
        }
        if let Some(thread) = self.listener_thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        if self.listener_thread.is_some() {
            self.stop();
        }
    }
}

fn accept_loop(listener: UnixListener, shutdown_read: OwnedFd, running: Arc<AtomicBool>, registry: Arc<Registry>) {
    loop {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let mut fds = [
            PollFd::new(listener.as_fd(), PollFlags::POLLIN),
            PollFd::new(shutdown_read.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(err) => {
                log::error!("rpc listener poll failed: {err}");
                break;
            }
        }

        if let Some(flags) = fds[1].revents()
            && flags.contains(PollFlags::POLLIN)
        {
            break;
        }

        if let Some(flags) = fds[0].revents()
            && flags.contains(PollFlags::POLLIN)
        {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    let registry = Arc::clone(&registry);
                    std::thread::spawn(move || handle_client(stream, registry));
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => log::warn!("rpc accept failed: {err}"),
            }
        }
    }
}

fn handle_client(mut stream: UnixStream, registry: Arc<Registry>) {
    stream.set_nonblocking(true).ok();
    let fd = stream.as_fd();
    let deadline = Instant::now() + DEFAULT_INACTIVITY_TIMEOUT;
    let mut buffer = Vec::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            log::debug!("rpc client inactivity timeout");
            return;
        }
        let slice_ms = remaining.as_millis().min(POLL_SLICE_MS as u128) as u32;
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(slice_ms as u16)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(err) => {
                log::warn!("rpc client poll failed: {err}");
                return;
            }
        }

        let mut chunk = [0u8; 4096];
        match stream.read(&mut chunk) {
            Ok(0) => return,
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(err) => {
                log::warn!("rpc client read failed: {err}");
                return;
            }
        }

        match try_process(&buffer, &registry) {
            ProcessOutcome::NeedMoreData => continue,
            ProcessOutcome::InvalidJson => {
                send_response(&mut stream, &invalid_json_response());
                return;
            }
            ProcessOutcome::Response(response) => {
                send_response(&mut stream, &response);
                return;
            }
        }
    }
}

enum ProcessOutcome {
    NeedMoreData,
    InvalidJson,
    Response(Value),
}

fn invalid_json_response() -> Value {
    serde_json::json!({"error": "Invalid JSON format"})
}

fn try_process(buffer: &[u8], registry: &Registry) -> ProcessOutcome {
    let text = String::from_utf8_lossy(buffer);
    let trimmed = text.trim_start();
    if trimmed.is_empty() {
        return ProcessOutcome::NeedMoreData;
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(request) => ProcessOutcome::Response(dispatch_request(&request, registry)),
        Err(err) => {
            if is_unexpected_eof(&err) {
                ProcessOutcome::NeedMoreData
            } else {
                ProcessOutcome::InvalidJson
            }
        }
    }
}

/// `serde_json`'s analogue of nlohmann's parse-error id 101: the input
/// parsed as a valid JSON prefix but ended before a value was complete.
fn is_unexpected_eof(err: &serde_json::Error) -> bool {
    use serde_json::error::Category;
    matches!(err.classify(), Category::Eof)
}

fn dispatch_request(request: &Value, registry: &Registry) -> Value {
    let target = request.get("target").and_then(Value::as_str);
    let mode = request.get("mode").and_then(Value::as_str);

    let (Some(target), Some(mode_str)) = (target, mode) else {
        return DaemonError::MissingFields.to_response();
    };

    let mode = match mode_str {
        "read" => Mode::Read,
        "write" => Mode::Write,
        other => return DaemonError::InvalidMode { mode: other.to_string() }.to_response(),
    };

    if mode == Mode::Write && request.get("data").is_none() {
        return DaemonError::MissingWriteData.to_response();
    }

    match registry.dispatch(target, mode, request.get("data")) {
        Ok(value) => value,
        Err(err) => err.to_response(),
    }
}

fn send_response(stream: &mut UnixStream, response: &Value) {
    let mut text = response.to_string();
    if !text.ends_with('\n') {
        text.push('\n');
    }
    let bytes = text.into_bytes();
    let mut written = 0;
    stream.set_nonblocking(false).ok();
    while written < bytes.len() {
        match stream.write(&bytes[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(err) => {
                log::warn!("rpc send failed: {err}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_fields_error_shape() {
        let registry = test_registry();
        let response = dispatch_request(&json!({}), &registry);
        assert_eq!(response["status"], "error");
        assert_eq!(response["message"], "Missing required fields: target and mode");
    }

    #[test]
    fn unknown_target_error_shape() {
        let registry = test_registry();
        let response = dispatch_request(&json!({"target": "bogus", "mode": "read"}), &registry);
        assert_eq!(response["message"], "Invalid target: bogus");
    }

    #[test]
    fn write_without_data_errors() {
        let registry = test_registry();
        let response = dispatch_request(&json!({"target": "config", "mode": "write"}), &registry);
        assert_eq!(response["status"], "error");
    }

    #[test]
    fn invalid_mode_errors() {
        let registry = test_registry();
        let response = dispatch_request(&json!({"target": "config", "mode": "delete"}), &registry);
        assert_eq!(response["status"], "error");
    }

    fn test_registry() -> Registry {
        use crate::config::{MainConfigStore, SchedulerConfigStore};
        use crate::power::EnergyAccountant;
        use std::sync::atomic::AtomicBool as StdAtomicBool;
        use std::sync::Mutex as StdMutex;

        let dir = std::env::temp_dir().join(format!("bswitcherd-rpc-test-{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        Registry {
            main_config: Arc::new(MainConfigStore::new(dir.join("config.json"))),
            scheduler_config: Arc::new(SchedulerConfigStore::new(dir.join("scheduler_config.json"))),
            info: targets::StaticInfo {
                name: "bswitcherd".into(),
                author: "test".into(),
                version: "1.0.0".into(),
            },
            available_modes: Arc::new(StdMutex::new(vec!["balance".into()])),
            power: Arc::new(EnergyAccountant::new(
                Arc::new(StdMutex::new(String::new())),
                Arc::new(StdAtomicBool::new(false)),
            )),
            dynamic_fps_list: Arc::new(StdMutex::new(vec![])),
            configlist: json!({}),
            scheduler_locked: false,
        }
    }
}
