use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use log::{debug, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::config::Config;
use crate::hide::HideBackend;
use crate::util::{MntNsId, SpawnerMap};

const SUPERUSER_UID: u32 = 0;

/// Bounded-retry-safe access to per-process files. Every accessor
/// returns `None` when the process is gone, which callers always treat
/// as "nothing to do". The proc root is configurable so tests can run
/// against a fake tree.
#[derive(Debug, Clone)]
pub struct ProcSource {
    root: PathBuf,
}

impl Default for ProcSource {
    fn default() -> Self {
        Self {
            root: "/proc".into(),
        }
    }
}

impl ProcSource {
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    #[inline]
    fn entry(&self, pid: i32, name: &str) -> PathBuf {
        self.root.join(pid.to_string()).join(name)
    }

    fn status_field(&self, pid: i32, key: &str) -> Option<String> {
        let status = fs::read_to_string(self.entry(pid, "status")).ok()?;
        status
            .lines()
            .find_map(|l| l.strip_prefix(key))
            .and_then(|v| v.split_whitespace().next().map(String::from))
    }

    /// Real uid of the owning user.
    pub fn uid(&self, pid: i32) -> Option<u32> {
        self.status_field(pid, "Uid:")?.parse().ok()
    }

    pub fn tgid(&self, pid: i32) -> Option<i32> {
        self.status_field(pid, "Tgid:")?.parse().ok()
    }

    /// True iff `pid` is a thread-group leader, i.e. a process and not
    /// a secondary thread. A vanished pid is not a process.
    pub fn is_process(&self, pid: i32) -> bool {
        self.tgid(pid) == Some(pid)
    }

    /// First NUL-separated command-line argument.
    pub fn command(&self, pid: i32) -> Option<String> {
        let raw = fs::read(self.entry(pid, "cmdline")).ok()?;
        let first = raw.split(|b| *b == 0).next().unwrap_or(&[]);
        Some(String::from_utf8_lossy(first).into_owned())
    }

    /// Security context, `attr/current`.
    pub fn context(&self, pid: i32) -> Option<String> {
        let raw = fs::read(self.entry(pid, "attr/current")).ok()?;
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        Some(String::from_utf8_lossy(&raw[..end]).trim_end().to_string())
    }

    /// Parent pid, field 4 of the stat record. The command field may
    /// itself contain parentheses, hence the rsplit.
    pub fn ppid(&self, pid: i32) -> Option<i32> {
        let stat = fs::read_to_string(self.entry(pid, "stat")).ok()?;
        let rest = stat.rsplit_once(')')?.1;
        rest.split_whitespace().nth(1)?.parse().ok()
    }

    pub fn mnt_ns(&self, pid: i32) -> Option<MntNsId> {
        MntNsId::of_path(self.entry(pid, "ns/mnt"))
    }
}

enum Settled {
    Reached(String),
    Exhausted(String),
    Gone,
}

/// Per-fork target determination, run on its own short-lived thread so
/// the bounded polling below never blocks the trace-event loop.
#[derive(Clone)]
pub struct Classifier {
    source: ProcSource,
    config: Arc<Config>,
    spawners: SpawnerMap,
    backend: Arc<dyn HideBackend>,
}

impl Classifier {
    pub fn new(
        source: ProcSource,
        config: Arc<Config>,
        spawners: SpawnerMap,
        backend: Arc<dyn HideBackend>,
    ) -> Self {
        Self {
            source,
            config,
            spawners,
            backend,
        }
    }

    /// Decide whether a freshly forked child is a hide target and
    /// either hand it over stopped, resume it, or drop it because it
    /// died mid-check.
    pub fn classify_and_gate(&self, pid: i32) {
        let sp = &self.config.spawner;

        // reads ordered so a vanished pid is caught before anything is sent
        let Some(uid) = self.source.uid(pid) else {
            return;
        };
        let Some(context) = self.source.context(pid) else {
            return;
        };
        let Some(mut name) = self.source.command(pid) else {
            return;
        };

        debug!("pid={pid} forked child name=[{name}] uid={uid} context={context}");

        if sp.is_spawner_name(&name) && context != sp.context {
            // the spawner is relaunching this child into an application
            if context.contains(&sp.app_spawner_marker) {
                debug!("pid={pid} pre-warmed application spawner");
            } else {
                match self.settle(pid, |n| n == sp.sentinel) {
                    Settled::Reached(n) => name = n,
                    // relaunch never completed, give up without touching it
                    Settled::Exhausted(_) | Settled::Gone => return,
                }
            }
        }

        if name == sp.sentinel {
            // initialization should finish shortly
            match self.settle(pid, |n| n != sp.sentinel) {
                Settled::Reached(n) => name = n,
                Settled::Exhausted(n) => return self.not_target(pid, &n, uid),
                Settled::Gone => return,
            }
        }

        // final reads: the name for certainty, the uid because it drops
        // when the child leaves the spawner's privileges
        let Some(name) = self.source.command(pid) else {
            return;
        };
        let Some(uid) = self.source.uid(pid) else {
            return;
        };

        if uid == SUPERUSER_UID || sp.is_spawner_family(&name) {
            return self.not_target(pid, &name, uid);
        }

        // stop before any further I/O, the child must not reach
        // untrusted code while we decide
        self.stop(pid);

        if !self
            .backend
            .is_target(uid, &name, self.config.hide.threshold)
        {
            return self.not_target(pid, &name, uid);
        }

        let Some(ns) = self.source.mnt_ns(pid) else {
            return self.not_target(pid, &name, uid);
        };
        let shared = {
            let spawners = self.spawners.lock().expect("spawner map lock poisoned");
            spawners.values().any(|s| *s == ns)
        };
        if shared {
            // unmounting inside a spawner's own namespace would corrupt it
            warn!("skip [{name}] pid={pid} uid={uid}: mount namespace not separated");
            return self.not_target(pid, &name, uid);
        }

        info!("target [{name}] pid={pid} uid={uid}");
        self.backend.dispatch(pid);
    }

    /// Poll the command name until `done`, within the configured budget.
    fn settle<F>(&self, pid: i32, done: F) -> Settled
    where
        F: Fn(&str) -> bool,
    {
        let poll = &self.config.poll;
        let deadline = Instant::now() + poll.settle_budget();

        loop {
            let Some(name) = self.source.command(pid) else {
                return Settled::Gone;
            };
            if done(&name) {
                return Settled::Reached(name);
            }
            if Instant::now() >= deadline {
                return Settled::Exhausted(name);
            }
            thread::sleep(poll.poll_interval());
        }
    }

    fn not_target(&self, pid: i32, name: &str, uid: u32) {
        debug!("not a target [{name}] pid={pid} uid={uid}");
        self.resume(pid);
    }

    fn stop(&self, pid: i32) {
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGSTOP) {
            debug!("pid={pid} stop failed: {e}");
        }
    }

    fn resume(&self, pid: i32) {
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGCONT) {
            debug!("pid={pid} resume failed: {e}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use std::process::{Child, Command};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    const SPAWNER_CTX: &str = "u:r:zygote:s0";
    const APP_CTX: &str = "u:r:untrusted_app:s0:c512,c768";

    #[derive(Default)]
    struct RecordingBackend {
        target: bool,
        queries: Mutex<Vec<(u32, String)>>,
        dispatched: Mutex<Vec<i32>>,
    }

    impl RecordingBackend {
        fn matching() -> Self {
            Self {
                target: true,
                ..Default::default()
            }
        }

        fn queries(&self) -> Vec<(u32, String)> {
            self.queries.lock().unwrap().clone()
        }

        fn dispatched(&self) -> Vec<i32> {
            self.dispatched.lock().unwrap().clone()
        }
    }

    impl HideBackend for RecordingBackend {
        fn refresh_uid_map(&self) {}

        fn is_target(&self, uid: u32, command: &str, _threshold: u8) -> bool {
            self.queries.lock().unwrap().push((uid, command.into()));
            self.target
        }

        fn dispatch(&self, pid: i32) {
            self.dispatched.lock().unwrap().push(pid);
        }
    }

    struct FakeProc {
        dir: TempDir,
    }

    impl FakeProc {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
            }
        }

        fn source(&self) -> ProcSource {
            ProcSource::with_root(self.dir.path())
        }

        fn add(&self, pid: i32, uid: u32, name: &str, context: &str) {
            let d = self.dir.path().join(pid.to_string());
            fs::create_dir_all(d.join("ns")).unwrap();
            fs::create_dir_all(d.join("attr")).unwrap();
            fs::write(
                d.join("status"),
                format!("Name:\t{name}\nTgid:\t{pid}\nPid:\t{pid}\nUid:\t{uid}\t{uid}\t{uid}\t{uid}\n"),
            )
            .unwrap();
            fs::write(d.join("stat"), format!("{pid} ({name}) S 1 {pid} {pid}")).unwrap();
            fs::write(d.join("cmdline"), format!("{name}\0")).unwrap();
            fs::write(d.join("attr/current"), format!("{context}\0")).unwrap();
            // a regular file is identity enough for tests
            fs::write(d.join("ns/mnt"), pid.to_string()).unwrap();
        }

        fn set_cmdline(&self, pid: i32, name: &str) {
            let d = self.dir.path().join(pid.to_string());
            fs::write(d.join("cmdline"), format!("{name}\0")).unwrap();
        }

        fn ns_of(&self, pid: i32) -> MntNsId {
            MntNsId::of_path(self.dir.path().join(pid.to_string()).join("ns/mnt")).unwrap()
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.poll.settle_budget_ms = 500;
        config.poll.poll_interval_us = 1000;
        config
    }

    fn classifier(
        fake: &FakeProc,
        backend: Arc<RecordingBackend>,
    ) -> (Classifier, SpawnerMap) {
        let spawners = SpawnerMap::default();
        let c = Classifier::new(
            fake.source(),
            Arc::new(test_config()),
            spawners.clone(),
            backend,
        );
        (c, spawners)
    }

    fn sleeper() -> Child {
        Command::new("sleep").arg("30").spawn().unwrap()
    }

    fn state_of(pid: i32) -> char {
        let stat = fs::read_to_string(format!("/proc/{pid}/stat")).unwrap();
        let rest = stat.rsplit_once(')').unwrap().1;
        rest.split_whitespace().next().unwrap().chars().next().unwrap()
    }

    /// Signal delivery is asynchronous, poll the state instead of
    /// asserting a single read.
    fn wait_state<F: Fn(char) -> bool>(pid: i32, ok: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let st = state_of(pid);
            if ok(st) {
                return;
            }
            assert!(Instant::now() < deadline, "pid {pid} stuck in state {st}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn reap(mut child: Child) {
        let _ = child.kill();
        let _ = child.wait();
    }

    #[test]
    fn test_target_is_stopped_and_dispatched() {
        let fake = FakeProc::new();
        let child = sleeper();
        let pid = child.id() as i32;

        fake.add(pid, 10123, "com.example.app", APP_CTX);
        fake.add(500, 0, "zygote64", SPAWNER_CTX);

        let backend = Arc::new(RecordingBackend::matching());
        let (c, spawners) = classifier(&fake, backend.clone());
        spawners.lock().unwrap().insert(500, fake.ns_of(500));

        c.classify_and_gate(pid);

        assert_eq!(backend.queries(), vec![(10123, "com.example.app".into())]);
        assert_eq!(backend.dispatched(), vec![pid]);
        // handed over stopped, never resumed by the classifier
        wait_state(pid, |s| s == 'T');

        reap(child);
    }

    #[test]
    fn test_superuser_child_is_resumed_not_dispatched() {
        let fake = FakeProc::new();
        let child = sleeper();
        let pid = child.id() as i32;

        // relaunch in progress: sentinel name first, then the real one
        fake.add(pid, 0, "<pre-initialized>", SPAWNER_CTX);

        let backend = Arc::new(RecordingBackend::matching());
        let (c, _) = classifier(&fake, backend.clone());

        let renamer = thread::spawn({
            let fake_pid = pid;
            let dir = fake.dir.path().to_path_buf();
            move || {
                thread::sleep(Duration::from_millis(100));
                fs::write(
                    dir.join(fake_pid.to_string()).join("cmdline"),
                    b"zygote\0" as &[u8],
                )
                .unwrap();
            }
        });

        c.classify_and_gate(pid);
        renamer.join().unwrap();

        assert!(backend.queries().is_empty());
        assert!(backend.dispatched().is_empty());
        wait_state(pid, |s| s != 'T');

        reap(child);
    }

    #[test]
    fn test_death_between_uid_and_context_reads() {
        let fake = FakeProc::new();
        let child = sleeper();
        let pid = child.id() as i32;

        fake.add(pid, 10123, "com.example.app", APP_CTX);
        fs::remove_file(fake.dir.path().join(pid.to_string()).join("attr/current")).unwrap();

        let backend = Arc::new(RecordingBackend::matching());
        let (c, _) = classifier(&fake, backend.clone());

        c.classify_and_gate(pid);

        assert!(backend.queries().is_empty());
        assert!(backend.dispatched().is_empty());
        // no signal was ever sent
        wait_state(pid, |s| s != 'T');

        reap(child);
    }

    #[test]
    fn test_non_target_is_resumed() {
        let fake = FakeProc::new();
        let child = sleeper();
        let pid = child.id() as i32;

        fake.add(pid, 10123, "com.example.app", APP_CTX);

        let backend = Arc::new(RecordingBackend::default());
        let (c, _) = classifier(&fake, backend.clone());

        c.classify_and_gate(pid);

        assert_eq!(backend.queries(), vec![(10123, "com.example.app".into())]);
        assert!(backend.dispatched().is_empty());
        // stopped for the gate check, then resumed
        wait_state(pid, |s| s != 'T');

        reap(child);
    }

    #[test]
    fn test_unseparated_namespace_is_skipped() {
        let fake = FakeProc::new();
        let child = sleeper();
        let pid = child.id() as i32;

        fake.add(pid, 10123, "com.example.app", APP_CTX);

        let backend = Arc::new(RecordingBackend::matching());
        let (c, spawners) = classifier(&fake, backend.clone());
        // spawner entry sharing the child's namespace identity
        spawners.lock().unwrap().insert(500, fake.ns_of(pid));

        c.classify_and_gate(pid);

        assert!(backend.dispatched().is_empty());
        wait_state(pid, |s| s != 'T');

        reap(child);
    }

    #[test]
    fn test_app_spawner_marker_skips_relaunch_wait() {
        let fake = FakeProc::new();
        let child = sleeper();
        let pid = child.id() as i32;

        // spawner name with an app-spawner context: no sentinel wait,
        // but still spawner-family, so never a target
        fake.add(pid, 10123, "zygote", "u:r:app_zygote:s0:c512,c768");

        let backend = Arc::new(RecordingBackend::matching());
        let (c, _) = classifier(&fake, backend.clone());

        let start = Instant::now();
        c.classify_and_gate(pid);
        assert!(start.elapsed() < Duration::from_millis(400));

        assert!(backend.queries().is_empty());
        assert!(backend.dispatched().is_empty());

        reap(child);
    }

    #[test]
    fn test_sentinel_budget_exhausted_is_non_target() {
        let fake = FakeProc::new();
        let child = sleeper();
        let pid = child.id() as i32;

        // stuck pre-initialized, never settles
        fake.add(pid, 10123, "<pre-initialized>", APP_CTX);

        let backend = Arc::new(RecordingBackend::matching());
        let (c, _) = classifier(&fake, backend.clone());

        c.classify_and_gate(pid);

        assert!(backend.dispatched().is_empty());
        wait_state(pid, |s| s != 'T');

        reap(child);
    }

    #[test]
    fn test_is_process() {
        let fake = FakeProc::new();
        fake.add(42, 0, "some", SPAWNER_CTX);
        let source = fake.source();

        assert!(source.is_process(42));
        assert!(!source.is_process(43));

        // secondary thread: tgid differs from pid
        let d = fake.dir.path().join("43");
        fs::create_dir_all(&d).unwrap();
        fs::write(d.join("status"), "Name:\tsome\nTgid:\t42\nPid:\t43\n").unwrap();
        assert!(!source.is_process(43));
        assert_eq!(source.tgid(43), Some(42));
    }

    #[test]
    fn test_proc_source_reads() {
        let fake = FakeProc::new();
        fake.add(42, 10001, "com.example.app", APP_CTX);
        fake.set_cmdline(42, "com.example.app");
        let source = fake.source();

        assert_eq!(source.uid(42), Some(10001));
        assert_eq!(source.command(42), Some("com.example.app".into()));
        assert_eq!(source.context(42), Some(APP_CTX.into()));
        assert_eq!(source.ppid(42), Some(1));
        assert!(source.mnt_ns(42).is_some());

        assert_eq!(source.uid(4242), None);
        assert_eq!(source.command(4242), None);
        assert_eq!(source.context(4242), None);
        assert_eq!(source.mnt_ns(4242), None);
    }
}
