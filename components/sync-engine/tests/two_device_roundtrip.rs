//! End-to-end coverage across two `SyncEngine`s sharing one in-process
//! relay in place of a real backend, the way the unit tests' scripted
//! providers stand in for one but shared between two devices instead of
//! wired to a single engine. Exercises capture -> outbox push -> resolver
//! apply -> echo suppression and clock-based conflict resolution without
//! any of the engine's internals being reached into directly.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sync_engine::provider::direct::{DirectBackend, DirectProvider};
use sync_engine::provider::{PullResult, PushOutcome};
use sync_engine::types::{PendingOp, Scope, SyncChange};
use sync_engine::{Result, SyncEngine};

/// Assigns every pushed op the next server version and fans it out to
/// every other registered device's provider, synchronously, the way a
/// websocket-backed gateway would deliver to other connected sessions.
struct Relay {
    next_version: Mutex<u64>,
    peers: Mutex<Vec<(String, Arc<dyn Fn(Vec<SyncChange>, u64) + Send + Sync>)>>,
}

impl Relay {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next_version: Mutex::new(0),
            peers: Mutex::new(Vec::new()),
        })
    }

    fn register(&self, device: &str, notify: Arc<dyn Fn(Vec<SyncChange>, u64) + Send + Sync>) {
        self.peers.lock().unwrap().push((device.to_string(), notify));
    }

    fn broadcast(&self, from: &str, changes: Vec<SyncChange>, cursor: u64) {
        for (device, notify) in self.peers.lock().unwrap().iter() {
            if device != from {
                notify(changes.clone(), cursor);
            }
        }
    }
}

struct RelayBackend {
    relay: Arc<Relay>,
    device: String,
}

impl DirectBackend for RelayBackend {
    fn pull(&self, _scope: &Scope, cursor: u64, _limit: usize) -> Result<PullResult> {
        Ok(PullResult {
            changes: vec![],
            next_cursor: cursor,
            has_more: false,
        })
    }

    fn push(&self, _scope: &Scope, ops: &[PendingOp]) -> Result<PushOutcome> {
        let mut version = self.relay.next_version.lock().unwrap();
        let mut changes = Vec::with_capacity(ops.len());
        let mut acked = Vec::with_capacity(ops.len());
        for op in ops {
            *version += 1;
            changes.push(SyncChange {
                server_version: *version,
                table: op.table.clone(),
                pk: op.pk.clone(),
                operation: op.operation.clone(),
                stamp: op.stamp.clone(),
            });
            acked.push(op.id.as_str().to_string());
        }
        let cursor = *version;
        drop(version);
        self.relay.broadcast(&self.device, changes, cursor);
        Ok(PushOutcome { acked, rejected: vec![] })
    }
}

fn spawn_engine(relay: &Arc<Relay>, device: &str, scope: &Scope) -> Arc<SyncEngine> {
    let backend = RelayBackend {
        relay: relay.clone(),
        device: device.to_string(),
    };
    let provider = DirectProvider::new(backend);
    relay.register(device, {
        let provider = provider.clone();
        Arc::new(move |changes, cursor| provider.notify(changes, cursor))
    });
    let engine = Arc::new(
        SyncEngine::open_in_memory(scope.clone(), "relay", provider).expect("engine should open"),
    );
    engine.start().expect("engine should start");
    engine
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    loop {
        if check() {
            return true;
        }
        if start.elapsed() >= timeout {
            return check();
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

const WAIT: Duration = Duration::from_secs(3);

#[test]
fn test_put_on_one_device_reaches_the_other() {
    let relay = Relay::new();
    let scope = Scope::new("ws1");
    let a = spawn_engine(&relay, "device-a", &scope);
    let b = spawn_engine(&relay, "device-b", &scope);

    a.put("threads", "t1", 1, serde_json::json!({"title": "from a"}), |_| Ok(()))
        .unwrap();

    assert!(wait_until(WAIT, || {
        b.get_record("threads", "t1")
            .unwrap()
            .map(|r| r.payload["title"] == "from a")
            .unwrap_or(false)
    }));
    assert!(wait_until(WAIT, || a.pending_count().unwrap() == 0));

    // The applied remote change never went through b's own capture path,
    // so it never entered b's outbox either.
    assert_eq!(b.pending_count().unwrap(), 0);

    a.stop();
    b.stop();
}

#[test]
fn test_delete_propagates_as_tombstone() {
    let relay = Relay::new();
    let scope = Scope::new("ws1");
    let a = spawn_engine(&relay, "device-a", &scope);
    let b = spawn_engine(&relay, "device-b", &scope);

    a.put("threads", "t1", 1, serde_json::json!({}), |_| Ok(())).unwrap();
    assert!(wait_until(WAIT, || b.get_record("threads", "t1").unwrap().is_some()));

    a.delete("threads", "t1", |_| Ok(())).unwrap();
    assert!(wait_until(WAIT, || {
        b.get_record("threads", "t1")
            .unwrap()
            .map(|r| r.meta.deleted)
            .unwrap_or(false)
    }));

    a.stop();
    b.stop();
}

#[test]
fn test_concurrent_writes_resolve_to_the_higher_clock_on_both_devices() {
    let relay = Relay::new();
    let scope = Scope::new("ws1");
    let a = spawn_engine(&relay, "device-a", &scope);
    let b = spawn_engine(&relay, "device-b", &scope);

    // Both devices write the same record before either has seen the
    // other's change - a's write carries the lower clock and should lose
    // once both sides have exchanged changes, regardless of which push
    // lands first.
    a.put("threads", "t1", 1, serde_json::json!({"title": "from a"}), |_| Ok(()))
        .unwrap();
    b.put("threads", "t1", 2, serde_json::json!({"title": "from b"}), |_| Ok(()))
        .unwrap();

    let winner = serde_json::Value::from("from b");
    assert!(wait_until(WAIT, || {
        let on_a = a.get_record("threads", "t1").unwrap().map(|r| r.payload["title"].clone());
        let on_b = b.get_record("threads", "t1").unwrap().map(|r| r.payload["title"].clone());
        on_a.as_ref() == Some(&winner) && on_b.as_ref() == Some(&winner)
    }));

    a.stop();
    b.stop();
}
