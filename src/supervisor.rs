//! Daemonization: double-fork, detach from the controlling terminal, pin the
//! worker to the little cores, and keep it alive across crashes.
//!
//! Grounded on `main.cpp`'s `main()` top half and `bind_to_core()`: two
//! forks (the first to exit the parent, `setsid()`, then a second to
//! prevent ever reacquiring a controlling terminal), followed by
//! `sched_setaffinity` binding to CPU 0 and 1. The respawn loop's
//! logging style follows the restart-loop idiom in `process.rs`'s
//! `run_supervised` (see DESIGN.md), though the daemonization mechanism
//! itself is the literal double-fork above, not that file's `daemonize_me`
//! crate (not in this project's dependency stack).

use nix::sched::{CpuSet, sched_setaffinity};
use nix::sys::stat::{Mode, umask};
use nix::unistd::{ForkResult, Pid, chdir, dup2, fork, setsid};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::time::Duration;

const LITTLE_CORES: [usize; 2] = [0, 1];
const WORKER_RESTART_DELAY: Duration = Duration::from_secs(3);

/// Double-forks the current process so the caller's shell can exit
/// immediately; the returned value is only ever observed `true` in the
/// final grandchild, which is the process that should continue running as
/// the daemon. Parent and intermediate child both `exit(0)` internally and
/// never return.
pub fn daemonize(working_dir: Option<&Path>) -> nix::Result<()> {
    match unsafe { fork() }? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    setsid()?;

    match unsafe { fork() }? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    umask(Mode::empty());
    if let Some(dir) = working_dir {
        chdir(dir)?;
    } else {
        chdir("/")?;
    }
    redirect_stdio_to_null()?;
    Ok(())
}

fn redirect_stdio_to_null() -> nix::Result<()> {
    use nix::fcntl::{OFlag, open};
    use nix::sys::stat::Mode as FileMode;

    // `devnull` is closed automatically when it drops at the end of this
    // function; dup2 leaves independent copies on fds 0/1/2.
    let devnull = open("/dev/null", OFlag::O_RDWR, FileMode::empty())?;
    let devnull_fd = devnull.as_raw_fd();
    dup2(devnull_fd, 0)?;
    dup2(devnull_fd, 1)?;
    dup2(devnull_fd, 2)?;
    Ok(())
}

/// Binds the calling thread's process to the two little cores, matching
/// `bind_to_core()`'s affinity mask.
pub fn bind_to_little_cores() {
    let mut cpu_set = CpuSet::new();
    for core in LITTLE_CORES {
        if let Err(err) = cpu_set.set(core) {
            log::warn!("failed to add cpu {core} to affinity mask: {err}");
        }
    }
    if let Err(err) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
        log::warn!("sched_setaffinity failed, continuing unpinned: {err}");
    }
}

/// Runs `worker` repeatedly, restarting it after a short delay if it ever
/// returns (which only happens on an unrecoverable internal error, since the
/// switcher core's own loop is otherwise infinite).
pub fn supervise_worker(mut worker: impl FnMut()) -> ! {
    loop {
        log::info!("starting worker");
        worker();
        log::error!("worker exited unexpectedly, restarting in {WORKER_RESTART_DELAY:?}");
        std::thread::sleep(WORKER_RESTART_DELAY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_core_set_has_two_members() {
        let mut cpu_set = CpuSet::new();
        for core in LITTLE_CORES {
            cpu_set.set(core).unwrap();
        }
        assert!(cpu_set.is_set(0).unwrap());
        assert!(cpu_set.is_set(1).unwrap());
    }
}
