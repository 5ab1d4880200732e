use log::{debug, info};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// External hide policy and action. The monitor hands over pids it has
/// already stopped; the backend owns resuming them.
pub trait HideBackend: Send + Sync {
    /// Reload the uid -> package mapping after the package metadata
    /// file has been rewritten.
    fn refresh_uid_map(&self);

    /// Hide decision for a (uid, command name) pair, with a match
    /// confidence threshold in percent.
    fn is_target(&self, uid: u32, command: &str, threshold: u8) -> bool;

    /// Takes ownership of a stopped pid. Eventually resumes it.
    fn dispatch(&self, pid: i32);
}

/// Name-list matcher so the binary is runnable on its own. A real
/// deployment implements [`HideBackend`] with the actual unmounting
/// daemon behind `dispatch`.
#[derive(Debug, Default)]
pub struct StaticBackend {
    targets: Vec<String>,
}

impl StaticBackend {
    pub fn new(targets: Vec<String>) -> Self {
        Self { targets }
    }
}

impl HideBackend for StaticBackend {
    fn refresh_uid_map(&self) {
        debug!("package metadata changed, static backend has nothing to refresh");
    }

    fn is_target(&self, _uid: u32, command: &str, _threshold: u8) -> bool {
        !command.is_empty() && self.targets.iter().any(|t| t == command)
    }

    fn dispatch(&self, pid: i32) {
        // nothing to unmount here, resume right away
        info!("hide dispatch pid={pid}");
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGCONT) {
            debug!("pid={pid} resume after dispatch failed: {e}");
        }
    }
}
