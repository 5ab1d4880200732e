use std::collections::HashMap;
use std::ffi::OsStr;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use thiserror::Error;

use crate::classify::{Classifier, ProcSource};
use crate::config::Config;
use crate::hide::HideBackend;
use crate::trace;
use crate::util::{self, SpawnerMap};

/// Bound on wakeups sent while waiting for the controller to drain the
/// mailbox or to acknowledge a shutdown. Each wakeup interrupts the
/// blocking wait, so consumption normally happens on the first one.
const ACK_KICKS: usize = 100;
const ACK_KICK_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum Error {
    #[error("wakeup signal setup failed: {0}")]
    Wakeup(#[from] Errno),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Re-run spawner discovery.
    Scan,
    /// The package metadata file was rewritten.
    PackagesChanged,
    /// Clean shutdown request. The controller is not restartable.
    Shutdown,
}

/// Sending side of the controller mailbox. A wakeup signal landing
/// while the controller is between its mailbox check and the blocking
/// wait would be lost, so `send` keeps kicking until the controller
/// has picked the event up.
#[derive(Clone)]
struct ControlTx {
    tx: Sender<ControlEvent>,
    /// controller thread id, 0 when not running
    tid: Arc<AtomicI32>,
    /// events sent but not yet picked out of the mailbox
    pending: Arc<AtomicUsize>,
}

impl ControlTx {
    fn new(tx: Sender<ControlEvent>) -> Self {
        Self {
            tx,
            tid: Arc::new(AtomicI32::new(0)),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// False when the controller side is gone.
    fn send(&self, ev: ControlEvent) -> bool {
        if self.tx.send(ev).is_err() {
            return false;
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        for _ in 0..ACK_KICKS {
            if self.pending.load(Ordering::SeqCst) == 0 {
                break;
            }
            if !self.kick() {
                break;
            }
            thread::sleep(ACK_KICK_INTERVAL);
        }
        true
    }

    /// Controller side: an event was picked out of the mailbox.
    fn ack(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    }

    fn kick(&self) -> bool {
        let tid = self.tid.load(Ordering::SeqCst);
        if tid == 0 {
            return false;
        }
        util::tgkill(process::id() as i32, tid, libc::SIGUSR1).is_ok()
    }
}

/// Shutdown side of the monitor, safe to use from any thread.
#[derive(Clone)]
pub struct MonitorHandle {
    ctl: ControlTx,
}

impl MonitorHandle {
    pub fn shutdown(&self) {
        if !self.ctl.send(ControlEvent::Shutdown) {
            return;
        }
        // wait for the controller to acknowledge by clearing its
        // published thread id
        for _ in 0..ACK_KICKS {
            if self.ctl.tid.load(Ordering::SeqCst) == 0 {
                break;
            }
            self.ctl.kick();
            thread::sleep(ACK_KICK_INTERVAL);
        }
    }
}

// the handler only exists to make the blocking wait return EINTR
extern "C" fn wakeup(_: libc::c_int) {}

/// The single controller owning the trace-event wait loop. Listener
/// threads (timer, filesystem watcher, shutdown handle) push control
/// events into the mailbox and wake the controller with SIGUSR1.
pub struct Monitor {
    config: Arc<Config>,
    source: ProcSource,
    classifier: Classifier,
    backend: Arc<dyn HideBackend>,
    /// pid -> recorded process-or-thread verdict; absence means not
    /// tracked
    registry: HashMap<i32, bool>,
    spawners: SpawnerMap,
    ctl: ControlTx,
    rx: Receiver<ControlEvent>,
    scanning: Arc<AtomicBool>,
}

impl Monitor {
    pub fn new(config: Config, backend: Arc<dyn HideBackend>) -> Self {
        Self::with_source(config, backend, ProcSource::default())
    }

    pub fn with_source(config: Config, backend: Arc<dyn HideBackend>, source: ProcSource) -> Self {
        let (tx, rx) = mpsc::channel();
        let config = Arc::new(config);
        let spawners = SpawnerMap::default();
        let classifier = Classifier::new(
            source.clone(),
            config.clone(),
            spawners.clone(),
            backend.clone(),
        );

        Self {
            config,
            source,
            classifier,
            backend,
            registry: HashMap::new(),
            spawners,
            ctl: ControlTx::new(tx),
            rx,
            scanning: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            ctl: self.ctl.clone(),
        }
    }

    /// Runs the controller until a shutdown request. Blocks the
    /// calling thread; all tracing requests are issued from here.
    pub fn run(&mut self) -> Result<(), Error> {
        let old_action = self.install_wakeup()?;
        self.ctl.tid.store(util::gettid(), Ordering::SeqCst);

        self.spawn_watcher();

        self.scan();
        if !self.discovery_done() {
            self.scanning.store(true, Ordering::SeqCst);
            self.spawn_timer();
        }

        loop {
            // at most one control event per wait cycle
            match self.rx.try_recv() {
                Ok(ev) => {
                    self.ctl.ack();
                    if self.handle_control(ev) {
                        break;
                    }
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => break,
            }

            match waitpid(None::<Pid>, Some(trace::wait_flags())) {
                Ok(status) => self.handle_status(status),
                Err(Errno::EINTR) => {}
                Err(Errno::ECHILD) => {
                    // no tracees: park on the mailbox instead of
                    // busy-polling
                    debug!("nothing to monitor, waiting for a control event");
                    match self.rx.recv() {
                        Ok(ev) => {
                            self.ctl.ack();
                            if self.handle_control(ev) {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                Err(e) => warn!("wait failed: {e}"),
            }
        }

        self.teardown(old_action);
        Ok(())
    }

    /// Returns true on a shutdown request.
    fn handle_control(&mut self, ev: ControlEvent) -> bool {
        match ev {
            ControlEvent::Shutdown => true,
            ControlEvent::PackagesChanged => {
                self.backend.refresh_uid_map();
                self.scan();
                false
            }
            ControlEvent::Scan => {
                self.scan();
                false
            }
        }
    }

    /// Find spawner instances: processes running under a spawner name
    /// whose parent is init. Transient per-pid read failures mean the
    /// process is gone and are skipped.
    pub fn scan(&mut self) {
        let procs = match procfs::process::all_processes() {
            Ok(procs) => procs,
            Err(e) => {
                warn!("process table enumeration failed: {e}");
                return;
            }
        };

        // flatten takes only the Ok() values of processes
        for p in procs.flatten() {
            let pid = p.pid;
            let Some(name) = self.source.command(pid) else {
                continue;
            };
            if !self.config.spawner.is_spawner_name(&name) {
                continue;
            }
            if self.source.ppid(pid) != Some(1) {
                continue;
            }
            self.register_spawner(pid);
        }

        self.finish_scan();
    }

    fn finish_scan(&self) {
        if self.discovery_done() && self.scanning.swap(false, Ordering::SeqCst) {
            debug!("expected spawner count reached, periodic scan disabled");
        }
    }

    fn discovery_done(&self) -> bool {
        let spawners = self.spawners.lock().expect("spawner map lock poisoned");
        spawners.len() >= self.config.spawner.expected_count
    }

    fn register_spawner(&mut self, pid: i32) {
        let Some(ns) = self.source.mnt_ns(pid) else {
            return;
        };

        {
            let mut spawners = self.spawners.lock().expect("spawner map lock poisoned");
            if let Some(known) = spawners.get_mut(&pid) {
                // seen again after separating its namespace, refresh
                *known = ns;
                return;
            }
            info!("tracing spawner pid={pid}");
            spawners.insert(pid, ns);
        }

        if let Err(e) = trace::attach_spawner(pid) {
            warn!("spawner pid={pid} attach failed: {e}");
            self.spawners
                .lock()
                .expect("spawner map lock poisoned")
                .remove(&pid);
        }
    }

    fn handle_status(&mut self, status: WaitStatus) {
        match status {
            WaitStatus::PtraceEvent(pid, _, event) => self.handle_ptrace_event(pid.as_raw(), event),
            WaitStatus::Stopped(pid, Signal::SIGSTOP) => self.handle_self_stop(pid.as_raw()),
            WaitStatus::Stopped(pid, sig) => {
                // not caused by us, re-deliver
                let pid = pid.as_raw();
                debug!("pid={pid} forwarding signal {sig}");
                trace::forward(pid, sig);
            }
            WaitStatus::Exited(pid, code) => {
                let pid = pid.as_raw();
                debug!("pid={pid} exited with code {code}");
                self.drop_pid(pid);
            }
            WaitStatus::Signaled(pid, sig, _) => {
                let pid = pid.as_raw();
                debug!("pid={pid} killed by {sig}");
                self.drop_pid(pid);
            }
            _ => {}
        }
    }

    fn handle_ptrace_event(&mut self, pid: i32, event: i32) {
        let is_spawner = self
            .spawners
            .lock()
            .expect("spawner map lock poisoned")
            .contains_key(&pid);

        if !is_spawner {
            // candidate clone/exec/exit, nothing more to learn from it
            self.registry.remove(&pid);
            trace::detach(pid);
            return;
        }

        match event {
            libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK => {
                if let Some(child) = trace::fork_child(pid) {
                    debug!("pid={pid} spawner forked child={child}");
                    self.registry.remove(&child);
                    self.hand_off(child);
                }
                trace::resume(pid);
            }
            _ => {
                // exit or anything unexpected from a spawner
                debug!("pid={pid} spawner gone (event={event})");
                self.spawners
                    .lock()
                    .expect("spawner map lock poisoned")
                    .remove(&pid);
                self.registry.remove(&pid);
                trace::detach(pid);
            }
        }
    }

    /// Detach first: classification is slow and must never run while
    /// the kernel trace lock is still held on the child.
    fn hand_off(&self, child: i32) {
        trace::detach(child);
        self.spawn_classifier(child);
    }

    fn handle_self_stop(&mut self, pid: i32) {
        // first observation records the verdict, repeated stops reuse it
        let confirmed = match self.registry.get(&pid).copied() {
            Some(confirmed) => confirmed,
            None => {
                let confirmed = self.source.is_process(pid);
                self.registry.insert(pid, confirmed);
                confirmed
            }
        };

        if !confirmed {
            debug!("pid={pid} self-stop from a thread, dropping");
            self.registry.remove(&pid);
            trace::detach(pid);
            return;
        }

        debug!("pid={pid} self-stop from a process, tracking as candidate");
        if let Err(e) = trace::trace_candidate(pid) {
            debug!("pid={pid} candidate setup failed: {e}");
            self.registry.remove(&pid);
        }
    }

    fn drop_pid(&mut self, pid: i32) {
        self.registry.remove(&pid);
        self.spawners
            .lock()
            .expect("spawner map lock poisoned")
            .remove(&pid);
    }

    fn spawn_classifier(&self, pid: i32) {
        let classifier = self.classifier.clone();
        let res = thread::Builder::new()
            .name(format!("classify-{pid}"))
            .spawn(move || classifier.classify_and_gate(pid));
        if let Err(e) = res {
            warn!("pid={pid} failed to spawn classifier: {e}");
        }
    }

    fn install_wakeup(&self) -> Result<SigAction, Error> {
        // no SA_RESTART: a kick must make the blocking wait return EINTR
        let act = SigAction::new(
            SigHandler::Handler(wakeup),
            SaFlags::empty(),
            SigSet::empty(),
        );
        let old = unsafe { sigaction(Signal::SIGUSR1, &act) }?;

        let mut set = SigSet::empty();
        set.add(Signal::SIGUSR1);
        set.thread_unblock().map_err(Error::Wakeup)?;

        Ok(old)
    }

    fn teardown(&mut self, old_action: SigAction) {
        for (pid, _) in self.registry.drain() {
            trace::detach(pid);
        }
        {
            let mut spawners = self.spawners.lock().expect("spawner map lock poisoned");
            for (pid, _) in spawners.drain() {
                trace::detach(pid);
            }
        }
        self.scanning.store(false, Ordering::SeqCst);

        // block the wakeup signal on this thread so a late kick stays
        // pending instead of hitting the restored disposition
        let mut set = SigSet::empty();
        set.add(Signal::SIGUSR1);
        let _ = set.thread_block();
        let _ = unsafe { sigaction(Signal::SIGUSR1, &old_action) };

        self.ctl.tid.store(0, Ordering::SeqCst);
        info!("monitor terminated");
    }

    fn spawn_timer(&self) {
        let scanning = self.scanning.clone();
        let ctl = self.ctl.clone();
        let interval = self.config.poll.scan_interval();

        let res = thread::Builder::new()
            .name("zygomon-timer".into())
            .spawn(move || {
                while scanning.load(Ordering::SeqCst) {
                    thread::sleep(interval);
                    if !scanning.load(Ordering::SeqCst) {
                        break;
                    }
                    if !ctl.send(ControlEvent::Scan) {
                        break;
                    }
                }
                debug!("periodic spawner scan stopped");
            });
        if let Err(e) = res {
            warn!("periodic scan timer setup failed: {e}");
        }
    }

    fn spawn_watcher(&self) {
        let config = self.config.clone();
        let ctl = self.ctl.clone();

        let res = thread::Builder::new()
            .name("zygomon-watch".into())
            .spawn(move || watch_loop(config, ctl));
        if let Err(e) = res {
            warn!("filesystem watcher setup failed: {e}");
        }
    }
}

/// Watches the package metadata directory for rewrites and the spawner
/// executables for execution. Setup failures degrade discovery to
/// periodic scanning only.
fn watch_loop(config: Arc<Config>, ctl: ControlTx) {
    let inotify = match Inotify::init(InitFlags::IN_CLOEXEC) {
        Ok(i) => i,
        Err(e) => {
            warn!("inotify unavailable, discovery degrades to periodic scan: {e}");
            return;
        }
    };

    if let Err(e) = inotify.add_watch(&config.watch.packages_dir, AddWatchFlags::IN_CLOSE_WRITE) {
        warn!(
            "cannot watch {}: {e}",
            config.watch.packages_dir.display()
        );
    }
    for exe in config.spawner.existing_executables() {
        if let Err(e) = inotify.add_watch(exe.as_path(), AddWatchFlags::IN_ACCESS) {
            warn!("cannot watch {}: {e}", exe.display());
        }
    }

    loop {
        let events = match inotify.read_events() {
            Ok(events) => events,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!("inotify read failed: {e}");
                return;
            }
        };

        for ev in events {
            let ev = if ev.mask.contains(AddWatchFlags::IN_CLOSE_WRITE)
                && ev.name.as_deref() == Some(OsStr::new(config.watch.packages_file.as_str()))
            {
                ControlEvent::PackagesChanged
            } else {
                ControlEvent::Scan
            };
            if !ctl.send(ev) {
                return;
            }
        }
    }
}
