//! Path watcher: coalesces kernel file-change notifications over a set of
//! paths into a single wakeup signal for one consumer thread.
//!
//! Grounded on `inotifywatcher.hpp`'s `FileWatcher`, generalized per
//! SPEC_FULL.md §9's combined-demultiplexer note: rather than `select()` on
//! just the inotify fd, a self-pipe is polled alongside it so that
//! `cleanup()` has a single, immediate wakeup path instead of relying on the
//! settle/timeout cadence to notice shutdown.

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::inotify::{AddWatchFlags, Inotify, InitFlags};
use nix::unistd::{close, pipe, read, write};
use std::os::fd::{AsFd, OwnedFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Default minimum gap the internal thread leaves between successive
/// inotify-queue drains, matching the source's 300 ms pacing.
pub const DEFAULT_MIN_POLL_MS: u64 = 300;

struct Inner {
    pending: Mutex<bool>,
    cv: Condvar,
}

pub struct PathWatcher {
    paths: Vec<PathBuf>,
    mask: AddWatchFlags,
    min_poll: Duration,
    inner: Arc<Inner>,
    running: Arc<AtomicBool>,
    wakeup_write: Option<OwnedFd>,
    thread: Option<JoinHandle<()>>,
}

impl PathWatcher {
    pub fn new(paths: Vec<PathBuf>, mask: AddWatchFlags) -> Self {
        Self {
            paths,
            mask,
            min_poll: Duration::from_millis(DEFAULT_MIN_POLL_MS),
            inner: Arc::new(Inner { pending: Mutex::new(false), cv: Condvar::new() }),
            running: Arc::new(AtomicBool::new(false)),
            wakeup_write: None,
            thread: None,
        }
    }

    pub fn with_min_poll(mut self, min_poll: Duration) -> Self {
        self.min_poll = min_poll;
        self
    }

    /// Registers watches on every configured path and starts the internal
    /// thread. Returns `false` (not an error) if not a single path could be
    /// watched, matching the source's "partial success accepted" policy.
    pub fn initialize(&mut self) -> bool {
        let inotify = match Inotify::init(InitFlags::IN_NONBLOCK) {
            Ok(inotify) => inotify,
            Err(err) => {
                log::error!("inotify_init1 failed: {err}");
                return false;
            }
        };

        let mut watched = 0usize;
        for path in &self.paths {
            match inotify.add_watch(path, self.mask) {
                Ok(_) => watched += 1,
                Err(err) => log::warn!("failed to watch {}: {err}", path.display()),
            }
        }
        if watched == 0 {
            log::error!("no path could be watched, aborting watcher init");
            return false;
        }

        let (read_fd, write_fd) = match pipe() {
            Ok(pair) => pair,
            Err(err) => {
                log::error!("failed to create wakeup pipe: {err}");
                return false;
            }
        };

        self.running.store(true, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let running = Arc::clone(&self.running);
        let min_poll = self.min_poll;

        self.thread = Some(std::thread::spawn(move || {
            run_loop(inotify, read_fd, running, inner, min_poll);
        }));
        self.wakeup_write = Some(write_fd);
        true
    }

    /// Blocks until either the pending flag is set or `timeout_ms` elapses;
    /// on wake, sleeps `settle_delay_ms` to coalesce tightly-spaced events
    /// before clearing the flag.
    pub fn wait(&self, timeout_ms: u64, settle_delay_ms: u64) -> bool {
        let guard = self.inner.pending.lock().unwrap();
        let (mut guard, wait_result) = self
            .inner
            .cv
            .wait_timeout_while(guard, Duration::from_millis(timeout_ms), |pending| !*pending)
            .unwrap();
        let fired = *guard;
        if fired {
            *guard = false;
        }
        drop(guard);
        if fired && settle_delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(settle_delay_ms));
            // A fresh burst during the settle window is folded into this
            // wake rather than triggering a second one.
            let mut guard = self.inner.pending.lock().unwrap();
            *guard = false;
        }
        fired || !wait_result.timed_out()
    }

    /// Invalidates the watches and signals the internal thread to exit.
    pub fn cleanup(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(write_fd) = self.wakeup_write.take() {
            let _ = write(&write_fd, &[1u8]);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        // Unblock any caller still parked in `wait`.
        let mut guard = self.inner.pending.lock().unwrap();
        *guard = true;
        self.inner.cv.notify_all();
    }
}

impl Drop for PathWatcher {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.cleanup();
        }
    }
}

fn run_loop(
    inotify: Inotify,
    wakeup_read: OwnedFd,
    running: Arc<AtomicBool>,
    inner: Arc<Inner>,
    min_poll: Duration,
) {
    let inotify_fd = inotify.as_fd();
    loop {
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let mut fds = [
            PollFd::new(inotify_fd, PollFlags::POLLIN),
            PollFd::new(wakeup_read.as_fd(), PollFlags::POLLIN),
        ];
        let timeout = PollTimeout::try_from(min_poll.as_millis() as u32).unwrap_or(PollTimeout::MAX);
        match poll(&mut fds, timeout) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(err) => {
                log::error!("poll failed in path watcher: {err}");
                break;
            }
        }

        if !running.load(Ordering::SeqCst) {
            break;
        }

        if let Some(flags) = fds[1].revents()
            && flags.contains(PollFlags::POLLIN)
        {
            let mut buf = [0u8; 64];
            let _ = read(&wakeup_read, &mut buf);
            continue;
        }

        if let Some(flags) = fds[0].revents()
            && flags.contains(PollFlags::POLLIN)
        {
            drain_events(&inotify);
            let mut guard = inner.pending.lock().unwrap();
            *guard = true;
            inner.cv.notify_all();
        }
    }
    let _ = close(wakeup_read);
}

fn drain_events(inotify: &Inotify) {
    loop {
        match inotify.read_events() {
            Ok(events) => {
                let count = events.len();
                log::trace!("drained {count} inotify events");
                if count == 0 {
                    break;
                }
            }
            Err(nix::errno::Errno::EAGAIN) => break,
            Err(err) => {
                log::warn!("inotify read failed: {err}");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn wait_times_out_without_event() {
        let dir = std::env::temp_dir().join(format!("bswitcherd-watch-test-{}", std::process::id()));
        let _ = fs::create_dir_all(&dir);
        let file = dir.join("watched");
        fs::write(&file, b"init").unwrap();

        let mut watcher = PathWatcher::new(vec![file.clone()], AddWatchFlags::IN_MODIFY);
        assert!(watcher.initialize());
        let fired = watcher.wait(50, 0);
        assert!(!fired);
        watcher.cleanup();
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn initialize_fails_with_no_valid_paths() {
        let mut watcher = PathWatcher::new(
            vec![PathBuf::from("/nonexistent/path/for/bswitcherd/test")],
            AddWatchFlags::IN_MODIFY,
        );
        assert!(!watcher.initialize());
    }
}
