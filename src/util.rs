use std::collections::HashMap;
use std::io::Error as IoError;
use std::path::Path;
use std::sync::{Arc, Mutex};

use libc::{c_int, pid_t, syscall, SYS_gettid, SYS_tgkill};
use nix::sys::stat::stat;

#[inline]
pub fn gettid() -> pid_t {
    unsafe { syscall(SYS_gettid) as pid_t }
}

pub fn tgkill(tgid: pid_t, tid: pid_t, sig: c_int) -> Result<(), IoError> {
    let rc = unsafe { syscall(SYS_tgkill, tgid, tid, sig) };

    if rc < 0 {
        return Err(IoError::last_os_error());
    }

    Ok(())
}

pub fn get_current_uid() -> libc::uid_t {
    unsafe { libc::getuid() }
}

/// Identity of a mount namespace: the (device, inode) pair of its
/// `ns/mnt` file. Two processes share a mount namespace iff their
/// identities are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MntNsId {
    pub dev: u64,
    pub ino: u64,
}

impl MntNsId {
    /// `None` means the process backing `path` is gone.
    pub fn of_path<P: AsRef<Path>>(path: P) -> Option<Self> {
        let st = stat(path.as_ref()).ok()?;
        Some(Self {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
        })
    }
}

/// Spawner pid -> mount-namespace identity. Written by the controller,
/// read by classifier threads.
pub type SpawnerMap = Arc<Mutex<HashMap<i32, MntNsId>>>;
