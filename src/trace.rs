use log::debug;
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;

/// Wait on all children, including ones from other threads' clones,
/// but never on other threads of this process.
#[inline]
pub fn wait_flags() -> WaitPidFlag {
    WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD
}

/// Attach to a discovered spawner: attach, swallow the initial stop,
/// ask for fork/vfork/exit events, resume. Any step failing means the
/// spawner vanished under us.
pub fn attach_spawner(pid: i32) -> Result<(), Errno> {
    let pid = Pid::from_raw(pid);
    ptrace::attach(pid)?;
    waitpid(pid, Some(wait_flags()))?;
    ptrace::setoptions(
        pid,
        Options::PTRACE_O_TRACEFORK | Options::PTRACE_O_TRACEVFORK | Options::PTRACE_O_TRACEEXIT,
    )?;
    ptrace::cont(pid, None)?;
    Ok(())
}

/// Promote a confirmed child process to candidate tracking.
pub fn trace_candidate(pid: i32) -> Result<(), Errno> {
    let pid = Pid::from_raw(pid);
    ptrace::setoptions(
        pid,
        Options::PTRACE_O_TRACECLONE | Options::PTRACE_O_TRACEEXEC | Options::PTRACE_O_TRACEEXIT,
    )?;
    ptrace::cont(pid, None)?;
    Ok(())
}

pub fn detach(pid: i32) {
    match ptrace::detach(Pid::from_raw(pid), None) {
        Ok(_) => debug!("pid={pid} detach"),
        Err(e) => debug!("pid={pid} detach failed: {e}"),
    }
}

pub fn resume(pid: i32) {
    if let Err(e) = ptrace::cont(Pid::from_raw(pid), None) {
        debug!("pid={pid} continue failed: {e}");
    }
}

/// Re-deliver a signal the monitor did not generate itself.
pub fn forward(pid: i32, sig: Signal) {
    if let Err(e) = ptrace::cont(Pid::from_raw(pid), sig) {
        debug!("pid={pid} signal {sig} forward failed: {e}");
    }
}

/// Child pid carried by a fork/vfork stop. `None` if the spawner is
/// gone before we could read the event message.
pub fn fork_child(pid: i32) -> Option<i32> {
    ptrace::getevent(Pid::from_raw(pid))
        .map(|msg| msg as i32)
        .ok()
}
