//! Release of the external processes and temporary files of running minimizations
//! when the program is terminated by a signal.
//!
//! Delegated minimizations register their MUSer2 process and GCNF file here for the duration
//! of the call. The first of them installs a `ctrlc` handler (SIGINT, SIGTERM and SIGHUP) that
//! kills every registered process group, removes every registered file and exits with
//! [`INTERRUPTED_EXIT_CODE`]. Applications that install their own handler should call
//! [`cleanup`] from it.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, Once, PoisonError};

use tracing::{debug, warn};

/// Exit code of a program terminated while a delegated minimization was running.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

static CHILDREN: Mutex<Vec<u32>> = Mutex::new(Vec::new());
static TEMP_FILES: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());
static HANDLER: Once = Once::new();

fn lock<T>(registry: &Mutex<T>) -> MutexGuard<'_, T> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Installs the termination handler, unless it already was.
pub fn install_handler() {
    HANDLER.call_once(|| {
        let installed = ctrlc::set_handler(|| {
            cleanup();
            std::process::exit(INTERRUPTED_EXIT_CODE);
        });
        match installed {
            Ok(()) => debug!("termination handler installed"),
            Err(err) => warn!(%err, "no termination handler, MUSer2 may outlive an interruption"),
        }
    });
}

/// Kills and reaps all registered processes (with their descendants) and removes all registered files.
pub fn cleanup() {
    for pid in lock(&CHILDREN).drain(..) {
        kill_process_group(pid);
        reap(pid);
    }
    for path in lock(&TEMP_FILES).drain(..) {
        let _ = std::fs::remove_file(path);
    }
}

pub(crate) fn register_child(pid: u32) {
    lock(&CHILDREN).push(pid);
}

pub(crate) fn unregister_child(pid: u32) {
    lock(&CHILDREN).retain(|&p| p != pid);
}

/// Keeps a file registered for removal on termination while alive.
pub(crate) struct TrackedFile {
    path: PathBuf,
}

impl TrackedFile {
    pub fn new(path: &Path) -> Self {
        lock(&TEMP_FILES).push(path.to_path_buf());
        TrackedFile {
            path: path.to_path_buf(),
        }
    }
}

impl Drop for TrackedFile {
    fn drop(&mut self) {
        lock(&TEMP_FILES).retain(|p| p != &self.path);
    }
}

/// Sends SIGKILL to the process group led by `pid`.
#[cfg(unix)]
pub(crate) fn kill_process_group(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    // fails harmlessly once every member of the group has exited
    let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[cfg(not(unix))]
pub(crate) fn kill_process_group(_pid: u32) {}

#[cfg(unix)]
fn reap(pid: u32) {
    use nix::sys::wait::waitpid;
    use nix::unistd::Pid;

    let _ = waitpid(Pid::from_raw(pid as i32), None);
}

#[cfg(not(unix))]
fn reap(_pid: u32) {}
