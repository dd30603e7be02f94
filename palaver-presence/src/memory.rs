//! In-process [`SessionStore`] honouring the full store contract.
//!
//! Besides serving the demo binary, `MemoryStore` exposes the knobs the
//! tests need to drive interleavings deterministically:
//!
//! - [`MemoryStore::connect`] / [`MemoryStore::drop_connection`] simulate
//!   transport changes. A drop first executes the deferred writes armed on
//!   the dying connection, then pushes `false` on the sentinel.
//! - [`MemoryStore::hold_acks`] parks every arm/write/update until the test
//!   releases or fails it. Acknowledgments may be released in any order,
//!   but writes take effect in the order they were issued.
//! - Every call is journaled ([`MemoryStore::calls`]).

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::error::StoreError;
use crate::path::StorePath;
use crate::record::{resolve_server_values, SERVER_VALUE_KEY, SERVER_VALUE_TIMESTAMP};
use crate::store::{SessionStore, Subscription, SubscriptionId};

/// Identity of one physical transport connection.
pub type ConnectionId = Uuid;

/// Journal entry for a call made against the store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    Subscribe { id: SubscriptionId, path: StorePath },
    Unsubscribe { id: SubscriptionId, path: StorePath },
    ArmDeferredWrite { path: StorePath, value: Value },
    Write { path: StorePath, value: Value },
    Update { paths: Vec<StorePath> },
    Read { path: StorePath },
}

impl StoreCall {
    pub fn is_arm(&self) -> bool {
        matches!(self, StoreCall::ArmDeferredWrite { .. })
    }

    pub fn is_write(&self) -> bool {
        matches!(self, StoreCall::Write { .. })
    }
}

struct Listener {
    path: StorePath,
    tx: mpsc::UnboundedSender<Option<Value>>,
    last: Option<Value>,
}

#[derive(Default)]
struct AckGate {
    holding: bool,
    pending: VecDeque<oneshot::Sender<Result<(), StoreError>>>,
    scripted: VecDeque<StoreError>,
}

enum Admission {
    Now(Result<(), StoreError>),
    Wait(oneshot::Receiver<Result<(), StoreError>>),
}

struct Inner {
    root: Value,
    sentinel: StorePath,
    connection: ConnectionId,
    connected: bool,
    deferred: HashMap<ConnectionId, BTreeMap<StorePath, (u64, Value)>>,
    /// Latest applied write per path, with its issue sequence.
    applied: BTreeMap<StorePath, (u64, Value)>,
    next_seq: u64,
    listeners: BTreeMap<SubscriptionId, Listener>,
    next_subscription: u64,
    last_clock_ms: u64,
    denied: Vec<StorePath>,
    gate: AckGate,
}

impl Inner {
    fn now_ms(&mut self) -> u64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.last_clock_ms = wall.max(self.last_clock_ms + 1);
        self.last_clock_ms
    }

    fn value_at(&self, path: &StorePath) -> Option<Value> {
        if *path == self.sentinel {
            return Some(Value::Bool(self.connected));
        }
        get_at(&self.root, path).cloned()
    }

    fn ensure_connection(&self, issued_on: ConnectionId) -> Result<(), StoreError> {
        if !self.connected || self.connection != issued_on {
            return Err(StoreError::Transport(format!(
                "connection {issued_on} is no longer live"
            )));
        }
        Ok(())
    }

    fn check_writable(&self, path: &StorePath, value: &Value) -> Result<(), StoreError> {
        if self.sentinel.overlaps(path) {
            return Err(StoreError::PermissionDenied(path.clone()));
        }
        if self.denied.iter().any(|d| d.overlaps(path)) {
            return Err(StoreError::PermissionDenied(path.clone()));
        }
        validate_payload(path, value)
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Apply a write issued with sequence `seq`. A later write already
    /// applied at or above `path` wins; later writes below it are replayed
    /// on top.
    fn apply(&mut self, path: &StorePath, mut value: Value, seq: u64) {
        if self
            .applied
            .iter()
            .any(|(at, (applied_seq, _))| *applied_seq > seq && at.contains(path))
        {
            log::debug!("memory store: write at {path} (seq {seq}) superseded");
            return;
        }
        let now = self.now_ms();
        resolve_server_values(&mut value, now);
        self.set(path, value.clone());

        let newer: Vec<(StorePath, Value)> = self
            .applied
            .iter()
            .filter(|(at, (applied_seq, _))| *applied_seq > seq && path.contains(at))
            .map(|(at, (_, v))| (at.clone(), v.clone()))
            .collect();
        self.applied
            .retain(|at, (applied_seq, _)| !(path.contains(at) && *applied_seq < seq));
        self.applied.insert(path.clone(), (seq, value));
        for (at, v) in newer {
            self.set(&at, v);
        }
    }

    fn set(&mut self, path: &StorePath, value: Value) {
        let segments: Vec<&str> = path.segments().collect();
        set_at(&mut self.root, &segments, value);
        if self.root.is_null() {
            self.root = Value::Object(Map::new());
        }
    }

    /// Push the current value to every listener whose view changed.
    fn notify(&mut self) {
        let mut closed = Vec::new();
        let ids: Vec<SubscriptionId> = self.listeners.keys().copied().collect();
        for id in ids {
            let current = match self.listeners.get(&id) {
                Some(listener) => self.value_at(&listener.path),
                None => continue,
            };
            if let Some(listener) = self.listeners.get_mut(&id) {
                if listener.last == current {
                    continue;
                }
                listener.last = current.clone();
                if listener.tx.send(current).is_err() {
                    closed.push(id);
                }
            }
        }
        for id in closed {
            self.listeners.remove(&id);
        }
    }
}

/// In-memory session store.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    calls: watch::Sender<Vec<StoreCall>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// A disconnected store using `/.info/connected` as sentinel.
    pub fn new() -> Self {
        Self::with_sentinel(StorePath::new("/.info/connected"))
    }

    pub fn with_sentinel(sentinel: StorePath) -> Self {
        let (calls, _) = watch::channel(Vec::new());
        Self {
            inner: Mutex::new(Inner {
                root: Value::Object(Map::new()),
                sentinel,
                connection: Uuid::new_v4(),
                connected: false,
                deferred: HashMap::new(),
                applied: BTreeMap::new(),
                next_seq: 0,
                listeners: BTreeMap::new(),
                next_subscription: 1,
                last_clock_ms: 0,
                denied: Vec::new(),
                gate: AckGate::default(),
            }),
            calls,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: StoreCall) {
        self.calls.send_modify(|calls| calls.push(call));
    }

    // ─── Transport simulation ───────────────────────────────────────

    /// Open a fresh physical connection and push `true` on the sentinel.
    pub fn connect(&self) -> ConnectionId {
        let mut inner = self.lock();
        if !inner.connected {
            inner.connection = Uuid::new_v4();
            inner.connected = true;
            log::debug!("memory store: connection {} up", inner.connection);
            inner.notify();
        }
        inner.connection
    }

    /// Kill the current connection. Deferred writes armed on it run exactly
    /// once, before the sentinel listeners see `false`.
    pub fn drop_connection(&self) {
        let mut inner = self.lock();
        if !inner.connected {
            return;
        }
        let dead = inner.connection;
        let armed = inner.deferred.remove(&dead).unwrap_or_default();
        log::debug!(
            "memory store: connection {dead} dropped, executing {} deferred write(s)",
            armed.len()
        );
        // Executed now, so they order after everything issued so far.
        for (path, (_, value)) in armed {
            let seq = inner.next_seq();
            inner.apply(&path, value, seq);
        }
        inner.notify();
        inner.connected = false;
        inner.notify();
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.lock().connection
    }

    // ─── Acknowledgment control ─────────────────────────────────────

    /// Park acknowledgments of arm/write/update calls until released.
    pub fn hold_acks(&self) {
        self.lock().gate.holding = true;
    }

    /// Stop holding and acknowledge everything parked so far.
    pub fn resume_acks(&self) {
        let pending: Vec<_> = {
            let mut inner = self.lock();
            inner.gate.holding = false;
            inner.gate.pending.drain(..).collect()
        };
        for tx in pending {
            let _ = tx.send(Ok(()));
        }
    }

    /// Acknowledge the oldest parked call. Returns `false` if none is parked.
    pub fn release_next(&self) -> bool {
        self.settle_next(Ok(()))
    }

    /// Acknowledge the most recently parked call. Returns `false` if none is
    /// parked.
    pub fn release_latest(&self) -> bool {
        let latest = self.lock().gate.pending.pop_back();
        match latest {
            Some(tx) => {
                let _ = tx.send(Ok(()));
                true
            }
            None => false,
        }
    }

    /// Fail the oldest parked call. Returns `false` if none is parked.
    pub fn fail_next_pending(&self, err: StoreError) -> bool {
        self.settle_next(Err(err))
    }

    fn settle_next(&self, result: Result<(), StoreError>) -> bool {
        let next = self.lock().gate.pending.pop_front();
        match next {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Number of parked acknowledgments.
    pub fn pending_acks(&self) -> usize {
        self.lock().gate.pending.len()
    }

    /// Fail the next non-held arm/write/update with `err`.
    pub fn fail_next_ack(&self, err: StoreError) {
        self.lock().gate.scripted.push_back(err);
    }

    /// Reject every write touching `path` with `PermissionDenied`.
    pub fn deny_writes_under(&self, path: StorePath) {
        self.lock().denied.push(path);
    }

    fn admit(&self) -> Admission {
        let mut inner = self.lock();
        if inner.gate.holding {
            let (tx, rx) = oneshot::channel();
            inner.gate.pending.push_back(tx);
            return Admission::Wait(rx);
        }
        match inner.gate.scripted.pop_front() {
            Some(err) => Admission::Now(Err(err)),
            None => Admission::Now(Ok(())),
        }
    }

    async fn acknowledge(&self) -> Result<(), StoreError> {
        match self.admit() {
            Admission::Now(result) => result,
            Admission::Wait(rx) => rx
                .await
                .unwrap_or_else(|_| Err(StoreError::Transport("store shut down".into()))),
        }
    }

    /// Capture the connection an operation is issued on and its position in
    /// issue order.
    fn issue(&self) -> Result<(ConnectionId, u64), StoreError> {
        let mut inner = self.lock();
        if !inner.connected {
            return Err(StoreError::Transport("not connected".into()));
        }
        let seq = inner.next_seq();
        Ok((inner.connection, seq))
    }

    // ─── Inspection ─────────────────────────────────────────────────

    /// Current value at `path`, without journaling.
    pub fn value(&self, path: &StorePath) -> Option<Value> {
        self.lock().value_at(path)
    }

    /// Write a fixture directly, bypassing connection and journal.
    pub fn seed(&self, path: &StorePath, value: Value) {
        let mut inner = self.lock();
        let seq = inner.next_seq();
        inner.apply(path, value, seq);
        inner.notify();
    }

    /// Deferred writes currently armed on the live connection.
    pub fn armed_on_current(&self) -> BTreeMap<StorePath, Value> {
        let inner = self.lock();
        inner
            .deferred
            .get(&inner.connection)
            .map(|armed| {
                armed
                    .iter()
                    .map(|(path, (_, value))| (path.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    pub fn listener_count_at(&self, path: &StorePath) -> usize {
        self.lock()
            .listeners
            .values()
            .filter(|l| l.path == *path)
            .count()
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.borrow().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.send_modify(|calls| calls.clear());
    }

    /// Wait until the journal satisfies `pred`.
    pub async fn wait_for_calls(&self, pred: impl FnMut(&Vec<StoreCall>) -> bool) {
        let mut rx = self.calls.subscribe();
        let _ = rx.wait_for(pred).await;
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    fn subscribe(&self, path: &StorePath) -> Result<Subscription, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = self.lock();
            let id = SubscriptionId(inner.next_subscription);
            inner.next_subscription += 1;
            let current = inner.value_at(path);
            // Initial push.
            let _ = tx.send(current.clone());
            inner.listeners.insert(
                id,
                Listener {
                    path: path.clone(),
                    tx,
                    last: current,
                },
            );
            id
        };
        self.record(StoreCall::Subscribe {
            id,
            path: path.clone(),
        });

        let events = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|value| (value, rx))
        })
        .boxed();

        Ok(Subscription {
            id,
            path: path.clone(),
            events,
        })
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.lock().listeners.remove(&id);
        match removed {
            Some(listener) => {
                self.record(StoreCall::Unsubscribe {
                    id,
                    path: listener.path,
                });
                true
            }
            None => false,
        }
    }

    async fn arm_deferred_write(&self, path: &StorePath, value: Value) -> Result<(), StoreError> {
        self.record(StoreCall::ArmDeferredWrite {
            path: path.clone(),
            value: value.clone(),
        });
        let (conn, seq) = self.issue()?;
        self.acknowledge().await?;

        let mut inner = self.lock();
        inner.ensure_connection(conn)?;
        inner.check_writable(path, &value)?;
        let armed = inner.deferred.entry(conn).or_default();
        match armed.get(path) {
            Some((armed_seq, _)) if *armed_seq > seq => {}
            _ => {
                armed.insert(path.clone(), (seq, value));
            }
        }
        Ok(())
    }

    async fn write(&self, path: &StorePath, value: Value) -> Result<(), StoreError> {
        self.record(StoreCall::Write {
            path: path.clone(),
            value: value.clone(),
        });
        let (conn, seq) = self.issue()?;
        self.acknowledge().await?;

        let mut inner = self.lock();
        inner.ensure_connection(conn)?;
        inner.check_writable(path, &value)?;
        inner.apply(path, value, seq);
        inner.notify();
        Ok(())
    }

    async fn update(&self, updates: BTreeMap<StorePath, Value>) -> Result<(), StoreError> {
        self.record(StoreCall::Update {
            paths: updates.keys().cloned().collect(),
        });
        let (conn, seq) = self.issue()?;
        self.acknowledge().await?;

        let mut inner = self.lock();
        inner.ensure_connection(conn)?;
        for (path, value) in &updates {
            inner.check_writable(path, value)?;
        }
        for (path, value) in updates {
            inner.apply(&path, value, seq);
        }
        inner.notify();
        Ok(())
    }

    async fn read(&self, path: &StorePath) -> Result<Option<Value>, StoreError> {
        self.record(StoreCall::Read { path: path.clone() });
        self.issue()?;
        Ok(self.lock().value_at(path))
    }
}

/// Only the timestamp server value is understood.
fn validate_payload(path: &StorePath, value: &Value) -> Result<(), StoreError> {
    match value {
        Value::Object(map) => {
            if let Some(sv) = map.get(SERVER_VALUE_KEY) {
                if map.len() != 1 || sv.as_str() != Some(SERVER_VALUE_TIMESTAMP) {
                    return Err(StoreError::Malformed {
                        path: path.clone(),
                        reason: format!("unsupported server value {sv}"),
                    });
                }
            }
            map.values().try_for_each(|v| validate_payload(path, v))
        }
        Value::Array(items) => items.iter().try_for_each(|v| validate_payload(path, v)),
        _ => Ok(()),
    }
}

fn get_at<'a>(root: &'a Value, path: &StorePath) -> Option<&'a Value> {
    let mut node = root;
    for segment in path.segments() {
        node = node.get(segment)?;
    }
    match node {
        Value::Null => None,
        Value::Object(map) if map.is_empty() => None,
        other => Some(other),
    }
}

/// Set `value` below `node`, pruning empty parents. `Null` deletes.
fn set_at(node: &mut Value, segments: &[&str], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *node = value;
        return;
    };
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    let Value::Object(map) = node else {
        return;
    };
    if rest.is_empty() {
        if value.is_null() {
            map.remove(*head);
        } else {
            map.insert((*head).to_string(), value);
        }
        return;
    }
    let child = map.entry((*head).to_string()).or_insert(Value::Null);
    set_at(child, rest, value);
    let empty = match child {
        Value::Null => true,
        Value::Object(m) => m.is_empty(),
        _ => false,
    };
    if empty {
        map.remove(*head);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::time::{timeout, Duration};

    fn p(raw: &str) -> StorePath {
        StorePath::new(raw)
    }

    async fn next(sub: &mut Subscription) -> Option<Value> {
        timeout(Duration::from_secs(1), sub.events.next())
            .await
            .expect("timed out waiting for push")
            .expect("stream ended")
    }

    #[tokio::test]
    async fn test_subscribe_pushes_initial_value() {
        let store = MemoryStore::new();
        store.seed(&p("/profiles/u1"), json!({"name": "Ada"}));

        let mut sub = store.subscribe(&p("/profiles/u1")).unwrap();
        assert_eq!(next(&mut sub).await, Some(json!({"name": "Ada"})));

        let mut missing = store.subscribe(&p("/profiles/u2")).unwrap();
        assert_eq!(next(&mut missing).await, None);
    }

    #[tokio::test]
    async fn test_sentinel_follows_connection() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe(&p("/.info/connected")).unwrap();
        assert_eq!(next(&mut sub).await, Some(json!(false)));

        store.connect();
        assert_eq!(next(&mut sub).await, Some(json!(true)));

        store.drop_connection();
        assert_eq!(next(&mut sub).await, Some(json!(false)));
    }

    #[tokio::test]
    async fn test_write_requires_connection() {
        let store = MemoryStore::new();
        let err = store.write(&p("/status/u1"), json!({"state": "online"})).await.unwrap_err();
        assert!(matches!(err, StoreError::Transport(_)));
        assert_eq!(store.value(&p("/status/u1")), None);
    }

    #[tokio::test]
    async fn test_write_resolves_server_timestamp() {
        let store = MemoryStore::new();
        store.connect();
        store
            .write(&p("/status/u1"), json!({"state": "online", "last_changed": {".sv": "timestamp"}}))
            .await
            .unwrap();
        let stored = store.value(&p("/status/u1")).unwrap();
        assert!(stored["last_changed"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_deferred_write_runs_once_before_sentinel_drop() {
        let store = MemoryStore::new();
        store.connect();
        let mut status = store.subscribe(&p("/status/u1")).unwrap();
        let mut sentinel = store.subscribe(&p("/.info/connected")).unwrap();
        assert_eq!(next(&mut status).await, None);
        assert_eq!(next(&mut sentinel).await, Some(json!(true)));

        store
            .arm_deferred_write(&p("/status/u1"), json!({"state": "offline"}))
            .await
            .unwrap();
        assert_eq!(store.value(&p("/status/u1")), None);

        store.drop_connection();
        assert_eq!(store.value(&p("/status/u1")), Some(json!({"state": "offline"})));
        assert_eq!(next(&mut status).await, Some(json!({"state": "offline"})));
        assert_eq!(next(&mut sentinel).await, Some(json!(false)));

        // Consumed: a second drop cycle must not replay it.
        store.seed(&p("/status/u1"), json!({"state": "online"}));
        store.connect();
        store.drop_connection();
        assert_eq!(store.value(&p("/status/u1")), Some(json!({"state": "online"})));
    }

    #[tokio::test]
    async fn test_rearm_overwrites_on_same_connection() {
        let store = MemoryStore::new();
        store.connect();
        store.arm_deferred_write(&p("/status/u1"), json!({"v": 1})).await.unwrap();
        store.arm_deferred_write(&p("/status/u1"), json!({"v": 2})).await.unwrap();
        assert_eq!(store.armed_on_current().len(), 1);

        store.drop_connection();
        assert_eq!(store.value(&p("/status/u1")), Some(json!({"v": 2})));
    }

    #[tokio::test]
    async fn test_held_ack_fails_if_connection_died() {
        let store = Arc::new(MemoryStore::new());
        store.connect();
        store.hold_acks();

        let s = store.clone();
        let pending = tokio::spawn(async move {
            s.arm_deferred_write(&p("/status/u1"), json!({"state": "offline"})).await
        });
        store.wait_for_calls(|c| c.iter().any(StoreCall::is_arm)).await;
        while store.pending_acks() == 0 {
            tokio::task::yield_now().await;
        }

        store.drop_connection();
        store.connect();
        assert!(store.release_next());

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(StoreError::Transport(_))));
        assert!(store.armed_on_current().is_empty());
    }

    #[tokio::test]
    async fn test_scripted_failure_and_permission() {
        let store = MemoryStore::new();
        store.connect();
        store.fail_next_ack(StoreError::Transport("flaky".into()));
        assert!(store.write(&p("/a"), json!(1)).await.is_err());
        assert!(store.write(&p("/a"), json!(1)).await.is_ok());

        store.deny_writes_under(p("/locked"));
        let err = store.write(&p("/locked/x"), json!(1)).await.unwrap_err();
        assert_eq!(err, StoreError::PermissionDenied(p("/locked/x")));

        let err = store.write(&p("/.info/connected"), json!(false)).await.unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_malformed_server_value_rejected() {
        let store = MemoryStore::new();
        store.connect();
        let err = store
            .write(&p("/a"), json!({"t": {".sv": "increment"}}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }));
    }

    #[tokio::test]
    async fn test_update_is_atomic() {
        let store = MemoryStore::new();
        store.connect();
        store.deny_writes_under(p("/rooms"));

        let mut updates = BTreeMap::new();
        updates.insert(p("/profiles/u1/avatar"), json!("url"));
        updates.insert(p("/rooms/r1/x"), json!("url"));
        assert!(store.update(updates).await.is_err());
        assert_eq!(store.value(&p("/profiles/u1/avatar")), None);
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_stream() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe(&p("/x")).unwrap();
        assert_eq!(next(&mut sub).await, None);

        assert!(store.unsubscribe(sub.id));
        assert!(!store.unsubscribe(sub.id));
        assert!(sub.events.next().await.is_none());
        assert_eq!(store.listener_count(), 0);
    }

    #[test]
    fn test_connection_identity() {
        let store = MemoryStore::new();
        assert!(!store.is_connected());

        let first = store.connect();
        assert!(store.is_connected());
        assert_eq!(store.connection_id(), first);
        assert_eq!(store.connect(), first);

        store.drop_connection();
        assert!(!store.is_connected());
        let second = store.connect();
        assert_ne!(first, second);
        assert_eq!(store.connection_id(), second);
    }

    /// Start a write and wait until its acknowledgment is parked.
    async fn spawn_held_write(
        store: &Arc<MemoryStore>,
        path: &str,
        value: Value,
        parked: usize,
    ) -> tokio::task::JoinHandle<Result<(), StoreError>> {
        let s = store.clone();
        let path = p(path);
        let task = tokio::spawn(async move { s.write(&path, value).await });
        while store.pending_acks() < parked {
            tokio::task::yield_now().await;
        }
        task
    }

    #[tokio::test]
    async fn test_writes_apply_in_issue_order() {
        let store = Arc::new(MemoryStore::new());
        store.connect();
        store.hold_acks();

        let online = spawn_held_write(&store, "/status/u1", json!({"state": "online"}), 1).await;
        let offline = spawn_held_write(&store, "/status/u1", json!({"state": "offline"}), 2).await;

        assert!(store.release_latest());
        offline.await.unwrap().unwrap();
        assert_eq!(store.value(&p("/status/u1")), Some(json!({"state": "offline"})));

        // The earlier write is acknowledged but does not overwrite the later one.
        assert!(store.release_next());
        online.await.unwrap().unwrap();
        assert_eq!(store.value(&p("/status/u1")), Some(json!({"state": "offline"})));
    }

    #[tokio::test]
    async fn test_late_parent_write_keeps_newer_child() {
        let store = Arc::new(MemoryStore::new());
        store.connect();
        store.hold_acks();

        let parent = spawn_held_write(&store, "/status/u1", json!({"state": "online", "device": "web"}), 1).await;
        let child = spawn_held_write(&store, "/status/u1/state", json!("offline"), 2).await;

        assert!(store.release_latest());
        child.await.unwrap().unwrap();
        assert!(store.release_next());
        parent.await.unwrap().unwrap();

        assert_eq!(
            store.value(&p("/status/u1")),
            Some(json!({"state": "offline", "device": "web"}))
        );
    }

    #[tokio::test]
    async fn test_deferred_write_orders_after_earlier_writes() {
        let store = MemoryStore::new();
        store.connect();
        store
            .arm_deferred_write(&p("/status/u1"), json!({"state": "offline"}))
            .await
            .unwrap();
        store.write(&p("/status/u1"), json!({"state": "online"})).await.unwrap();

        store.drop_connection();
        assert_eq!(store.value(&p("/status/u1")), Some(json!({"state": "offline"})));
    }

    #[tokio::test]
    async fn test_null_write_prunes() {
        let store = MemoryStore::new();
        store.connect();
        store.write(&p("/a/b/c"), json!(1)).await.unwrap();
        store.write(&p("/a/b/c"), Value::Null).await.unwrap();
        assert_eq!(store.value(&p("/a")), None);
        assert_eq!(store.value(&StorePath::root()), None);
    }
}
