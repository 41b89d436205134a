//! Shared fakes and harness for integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cinder_cluster::{
    DirectoryConfig, DurableLog, Error, MasterRecovery, MembershipDirectory, MemoryLog,
    PingTransport, Result, ServerChange, ServerEntry, ServerId, ServerListMessage, ServerStatus,
    ServerTracker, UpdateRpc, UpdateTransport,
};

/// How fake update RPCs behave.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpcBehavior {
    /// Acknowledge the pushed version on the first poll.
    Ack,
    /// Complete with `ServerNotUp`.
    NotUp,
    /// Never complete; only a cancel (drop) ends the RPC.
    Pending,
}

pub struct SentUpdate {
    pub target: ServerId,
    pub message: ServerListMessage,
}

/// Transport that records every started push and counts cancellations.
pub struct RecordingTransport {
    behavior: RpcBehavior,
    pub sent: Mutex<Vec<SentUpdate>>,
    pub cancelled: Arc<AtomicUsize>,
}

impl RecordingTransport {
    pub fn new(behavior: RpcBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            sent: Mutex::new(Vec::new()),
            cancelled: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Messages pushed toward one member, in send order.
    pub fn sent_to(&self, target: ServerId) -> Vec<ServerListMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|sent| sent.target == target)
            .map(|sent| sent.message.clone())
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

struct FakeRpc {
    behavior: RpcBehavior,
    version: u64,
    finished: bool,
    cancelled: Arc<AtomicUsize>,
}

impl UpdateRpc for FakeRpc {
    fn poll(&mut self) -> Option<Result<u64>> {
        match self.behavior {
            RpcBehavior::Ack => {
                self.finished = true;
                Some(Ok(self.version))
            }
            RpcBehavior::NotUp => {
                self.finished = true;
                Some(Err(Error::ServerNotUp))
            }
            RpcBehavior::Pending => None,
        }
    }
}

impl Drop for FakeRpc {
    fn drop(&mut self) {
        if !self.finished {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl UpdateTransport for RecordingTransport {
    fn start_update(
        &self,
        target: ServerId,
        _locator: &str,
        message: ServerListMessage,
    ) -> Box<dyn UpdateRpc> {
        let version = message.version;
        self.sent.lock().unwrap().push(SentUpdate { target, message });
        Box::new(FakeRpc {
            behavior: self.behavior,
            version,
            finished: false,
            cancelled: Arc::clone(&self.cancelled),
        })
    }
}

/// Ping service that never hears back: every suspect verifies as dead.
pub struct DeadPing;

impl PingTransport for DeadPing {
    fn ping(&self, _target: ServerId, _locator: &str, _timeout: Duration) -> bool {
        false
    }
}

/// Ping service whose targets always answer.
pub struct AlivePing;

impl PingTransport for AlivePing {
    fn ping(&self, _target: ServerId, _locator: &str, _timeout: Duration) -> bool {
        true
    }
}

/// Records every recovery start.
#[derive(Default)]
pub struct RecordingRecovery {
    pub starts: Mutex<Vec<ServerEntry>>,
}

impl MasterRecovery for RecordingRecovery {
    fn start_master_recovery(&self, crashed: &ServerEntry) {
        self.starts.lock().unwrap().push(crashed.clone());
    }
}

/// Records change events in notification order.
#[derive(Default)]
pub struct RecordingTracker {
    pub events: Mutex<Vec<(ServerChange, ServerId, ServerStatus)>>,
}

impl ServerTracker for RecordingTracker {
    fn server_changed(&self, entry: &ServerEntry, change: ServerChange) {
        self.events
            .lock()
            .unwrap()
            .push((change, entry.server_id, entry.status));
    }
}

/// Install a test subscriber once so tracing output lands in the
/// per-test capture buffer.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Poll `condition` until it holds or `deadline` elapses.
pub fn wait_until(deadline: Duration, condition: impl Fn() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

pub struct Harness {
    pub directory: MembershipDirectory,
    pub transport: Arc<RecordingTransport>,
    pub log: Arc<MemoryLog>,
    pub recovery: Arc<RecordingRecovery>,
}

/// Directory wired to recording fakes. Pings fail (suspects verify dead)
/// unless the caller builds its own directory.
pub fn harness(config: DirectoryConfig, behavior: RpcBehavior) -> Harness {
    init_tracing();
    let transport = RecordingTransport::new(behavior);
    let log = Arc::new(MemoryLog::new());
    let recovery = Arc::new(RecordingRecovery::default());
    let directory = MembershipDirectory::new(
        config,
        Arc::clone(&log) as Arc<dyn DurableLog>,
        Arc::clone(&transport) as Arc<dyn UpdateTransport>,
        Arc::new(DeadPing),
        Arc::clone(&recovery) as Arc<dyn MasterRecovery>,
    );
    Harness {
        directory,
        transport,
        log,
        recovery,
    }
}
