use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use libn2n::{
    Backends, Child, CommandSpec, EdgeConfig, LinkObserver, NetProbe, Phase, ProcessKind,
    Spawner, Supervisor, SupervisorConfig,
};
use nix::sys::signal::Signal;
use tempfile::TempDir;
use tokio::sync::watch;

/// Everything the fake OS saw, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record {
    Spawn(ProcessKind),
    Signal(ProcessKind, Signal),
}

/// Lets a test end a fake child as if it crashed.
pub struct Control {
    done: watch::Sender<Option<ExitStatus>>,
}

impl Control {
    fn new() -> Arc<Self> {
        let (done, _) = watch::channel(None);
        Arc::new(Self { done })
    }

    pub fn exit(&self, code: i32) {
        self.finish(ExitStatus::from_raw(code << 8));
    }

    fn finish(&self, status: ExitStatus) {
        self.done.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(status);
            true
        });
    }
}

struct MockChild {
    kind: ProcessKind,
    pid: u32,
    control: Arc<Control>,
    log: Arc<Mutex<Vec<Record>>>,
    /// Ignores SIGINT and SIGTERM, like a wedged process.
    stubborn: bool,
}

#[async_trait]
impl Child for MockChild {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn signal(&self, signal: Signal) -> io::Result<()> {
        self.log.lock().unwrap().push(Record::Signal(self.kind, signal));
        match signal {
            Signal::SIGKILL => self.control.finish(ExitStatus::from_raw(signal as i32)),
            Signal::SIGINT | Signal::SIGTERM if !self.stubborn => {
                self.control.finish(ExitStatus::from_raw(signal as i32))
            }
            _ => {}
        }
        Ok(())
    }

    async fn wait(&self) -> io::Result<ExitStatus> {
        let mut rx = self.control.done.subscribe();
        let status = *rx
            .wait_for(|status| status.is_some())
            .await
            .map_err(|_| io::Error::other("control dropped"))?;
        Ok(status.unwrap_or_else(|| ExitStatus::from_raw(0)))
    }
}

#[derive(Default)]
pub struct MockSpawner {
    log: Arc<Mutex<Vec<Record>>>,
    children: Mutex<Vec<(ProcessKind, Arc<Control>)>>,
    specs: Mutex<Vec<CommandSpec>>,
    next_pid: AtomicU32,
    fail: Mutex<Option<ProcessKind>>,
    stubborn: Mutex<Option<ProcessKind>>,
}

impl MockSpawner {
    pub fn records(&self) -> Vec<Record> {
        self.log.lock().unwrap().clone()
    }

    pub fn spawned(&self, kind: ProcessKind) -> usize {
        self.records()
            .iter()
            .filter(|r| **r == Record::Spawn(kind))
            .count()
    }

    pub fn specs(&self) -> Vec<CommandSpec> {
        self.specs.lock().unwrap().clone()
    }

    /// The most recent child of this kind.
    pub fn child(&self, kind: ProcessKind) -> Arc<Control> {
        self.children
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(k, _)| *k == kind)
            .map(|(_, c)| c.clone())
            .unwrap()
    }

    pub fn fail_spawning(&self, kind: ProcessKind) {
        *self.fail.lock().unwrap() = Some(kind);
    }

    pub fn ignore_polite_signals(&self, kind: ProcessKind) {
        *self.stubborn.lock().unwrap() = Some(kind);
    }
}

impl Spawner for MockSpawner {
    fn spawn(&self, spec: &CommandSpec) -> io::Result<Box<dyn Child>> {
        if *self.fail.lock().unwrap() == Some(spec.kind) {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }
        self.log.lock().unwrap().push(Record::Spawn(spec.kind));
        self.specs.lock().unwrap().push(spec.clone());

        let control = Control::new();
        // a release runs to completion on its own
        if spec.kind == ProcessKind::Release {
            control.exit(0);
        }
        self.children
            .lock()
            .unwrap()
            .push((spec.kind, control.clone()));
        Ok(Box::new(MockChild {
            kind: spec.kind,
            pid: 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst),
            control,
            log: self.log.clone(),
            stubborn: *self.stubborn.lock().unwrap() == Some(spec.kind),
        }))
    }
}

/// The interface shows up after `missing_polls` lookups; the address is
/// whatever the test last set.
pub struct MockProbe {
    missing_polls: u32,
    interface_calls: AtomicU32,
    address: Mutex<Option<Ipv4Network>>,
}

impl MockProbe {
    pub fn new(missing_polls: u32, address: Option<&str>) -> Self {
        Self {
            missing_polls,
            interface_calls: AtomicU32::new(0),
            address: Mutex::new(address.map(|a| a.parse().unwrap())),
        }
    }

    pub fn interface_calls(&self) -> u32 {
        self.interface_calls.load(Ordering::SeqCst)
    }

    pub fn set_address(&self, address: Option<&str>) {
        *self.address.lock().unwrap() = address.map(|a| a.parse().unwrap());
    }
}

#[async_trait]
impl NetProbe for MockProbe {
    async fn interface_exists(&self, _name: &str) -> anyhow::Result<bool> {
        let calls = self.interface_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(calls > self.missing_polls)
    }

    async fn ipv4_address(&self, _name: &str) -> anyhow::Result<Option<Ipv4Network>> {
        Ok(*self.address.lock().unwrap())
    }
}

#[derive(Default)]
pub struct TestObserver {
    ups: AtomicU32,
    downs: AtomicU32,
    reject: AtomicBool,
}

impl TestObserver {
    pub fn ups(&self) -> u32 {
        self.ups.load(Ordering::SeqCst)
    }

    pub fn downs(&self) -> u32 {
        self.downs.load(Ordering::SeqCst)
    }

    pub fn reject_up(&self) {
        self.reject.store(true, Ordering::SeqCst);
    }
}

impl LinkObserver for TestObserver {
    fn on_up(&self) -> anyhow::Result<()> {
        self.ups.fetch_add(1, Ordering::SeqCst);
        if self.reject.load(Ordering::SeqCst) {
            anyhow::bail!("routes could not be installed");
        }
        Ok(())
    }

    fn on_down(&self) {
        self.downs.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Harness {
    pub supervisor: Supervisor,
    pub spawner: Arc<MockSpawner>,
    pub probe: Arc<MockProbe>,
    pub observer: Arc<TestObserver>,
    _work_dir: TempDir,
}

impl Harness {
    pub fn new(missing_polls: u32, address: Option<&str>) -> Self {
        Self::with_spawner(MockSpawner::default(), missing_polls, address)
    }

    pub fn with_spawner(spawner: MockSpawner, missing_polls: u32, address: Option<&str>) -> Self {
        let work_dir = tempfile::tempdir().unwrap();
        let spawner = Arc::new(spawner);
        let probe = Arc::new(MockProbe::new(missing_polls, address));
        let observer = Arc::new(TestObserver::default());

        let mut cfg = SupervisorConfig::new(EdgeConfig {
            binary: PathBuf::from("/usr/sbin/edge"),
            supernode: "sn.example.org:7654".to_string(),
            community: "office".to_string(),
            key: "s3cret".to_string(),
            uid: 65534,
            gid: 65534,
        });
        cfg.work_dir = work_dir.path().join("n2nd");
        cfg.helper_program = PathBuf::from("/usr/bin/n2nd");

        let backends = Backends {
            spawner: spawner.clone(),
            probe: probe.clone(),
        };
        let supervisor = Supervisor::new(cfg, backends, observer.clone());
        Self {
            supervisor,
            spawner,
            probe,
            observer,
            _work_dir: work_dir,
        }
    }

    /// Checks that the published state is self-consistent.
    pub fn assert_consistent(&self) {
        let snapshot = self.supervisor.snapshot();
        assert_eq!(snapshot.phase == Phase::Connected, snapshot.lease.is_some());
        let sup = &self.supervisor;
        let all_set = sup.local_ip().is_some() && sup.remote_ip().is_some() && sup.netmask().is_some();
        assert_eq!(sup.is_connected(), all_set);
    }

    /// Lets virtual time run until `cond` holds, checking state consistency
    /// along the way.
    pub async fn eventually(&self, cond: impl Fn(&Self) -> bool) {
        for _ in 0..2000 {
            self.assert_consistent();
            if cond(self) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("condition not reached, supervisor is {}", self.supervisor.phase());
    }
}
