//! Presence engine: drives [`PresenceMachine`] against a [`SessionStore`].
//!
//! Provides:
//! - One event loop per engine (a single tokio task); nothing runs in parallel
//! - Per-subscription forwarder tasks tagging pushes with their generation
//! - Spawned store operations reporting back tagged with their epoch
//! - A read-only [`SessionSnapshot`] for UI consumers
//!
//! ```text
//! IdentitySession ──watch──┐
//!                          ▼
//! store listeners ──► forwarders ──EngineEvent──► run loop ──► PresenceMachine
//!                                                   │  ▲             │
//!                                    spawn arm/write│  │ack (epoch)  │ commands
//!                                                   ▼  │             ▼
//!                                               SessionStore    SessionSnapshot
//! ```

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::PresenceConfig;
use crate::error::{ErrorClass, IdentityError, PresenceError, StoreError};
use crate::identity::{AuthState, IdentitySession};
use crate::machine::{Command, Operation, PresenceMachine, PresenceState};
use crate::path::{validate_key, StorePath};
use crate::record::{PresenceRecord, Profile, ProfileRecord, SessionIdentity};
use crate::registry::{ActiveSubscription, Channel, SubscriptionRegistry};
use crate::store::{SessionStore, Subscription};

/// What UI consumers read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub state: PresenceState,
    pub identity: Option<SessionIdentity>,
    pub profile: Option<Profile>,
    pub presence: Option<PresenceRecord>,
    pub is_loading: bool,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: PresenceState::LoggedOut,
            identity: None,
            profile: None,
            presence: None,
            is_loading: true,
        }
    }
}

/// Warning-level report of a failed store acknowledgment.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceNotice {
    pub operation: Operation,
    pub identity: String,
    pub path: Option<StorePath>,
    pub error: StoreError,
}

impl PresenceNotice {
    pub fn class(&self) -> ErrorClass {
        self.error.class()
    }
}

/// Inbound events of the run loop.
#[derive(Debug)]
enum EngineEvent {
    Connectivity { generation: u64, connected: bool },
    Profile { generation: u64, value: Option<Value> },
    Status { generation: u64, value: Option<Value> },
    ArmAcked { epoch: u64, result: Result<(), StoreError> },
    OnlineAcked { epoch: u64, result: Result<(), StoreError> },
}

impl EngineEvent {
    fn from_push(channel: Channel, generation: u64, value: Option<Value>) -> Self {
        match channel {
            Channel::Connectivity => EngineEvent::Connectivity {
                generation,
                // Anything but a literal `true` counts as disconnected.
                connected: value.as_ref().and_then(Value::as_bool).unwrap_or(false),
            },
            Channel::Profile => EngineEvent::Profile { generation, value },
            Channel::Status => EngineEvent::Status { generation, value },
        }
    }
}

/// The presence engine. Construct with [`PresenceEngine::spawn`].
pub struct PresenceEngine {
    store: Arc<dyn SessionStore>,
    config: PresenceConfig,
    machine: PresenceMachine,
    registry: SubscriptionRegistry,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<EngineEvent>>,
    snapshot: watch::Sender<SessionSnapshot>,
    notices: broadcast::Sender<PresenceNotice>,
}

impl PresenceEngine {
    fn new(store: Arc<dyn SessionStore>, config: PresenceConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot, _) = watch::channel(SessionSnapshot::default());
        let (notices, _) = broadcast::channel(config.notice_capacity.max(1));
        Self {
            store,
            config,
            machine: PresenceMachine::new(),
            registry: SubscriptionRegistry::new(),
            events_tx,
            events_rx: Some(events_rx),
            snapshot,
            notices,
        }
    }

    /// Start an engine on the current tokio runtime.
    pub fn spawn(
        store: Arc<dyn SessionStore>,
        identity: Arc<dyn IdentitySession>,
        config: PresenceConfig,
    ) -> PresenceHandle {
        let engine = Self::new(store.clone(), config.clone());
        let snapshot = engine.snapshot.subscribe();
        let notices = engine.notices.clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(engine.run(identity.watch(), shutdown_rx));

        PresenceHandle {
            store,
            identity,
            config,
            snapshot,
            notices,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    async fn run(
        mut self,
        mut identity_rx: watch::Receiver<AuthState>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let Some(mut events_rx) = self.events_rx.take() else {
            return;
        };

        let initial = identity_rx.borrow_and_update().clone();
        self.apply_identity(initial);

        let mut identity_open = true;
        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => break,

                changed = identity_rx.changed(), if identity_open => {
                    if changed.is_err() {
                        log::warn!("presence: identity provider went away, logging out");
                        identity_open = false;
                        self.apply_identity(AuthState {
                            session: self.machine.session(),
                            identity: None,
                        });
                        continue;
                    }
                    let next = identity_rx.borrow_and_update().clone();
                    self.apply_identity(next);
                }

                Some(event) = events_rx.recv() => {
                    // An identity change queued behind this event wins.
                    if identity_open && identity_rx.has_changed().unwrap_or(false) {
                        let next = identity_rx.borrow_and_update().clone();
                        self.apply_identity(next);
                    }
                    self.handle_event(event);
                }
            }
        }

        let released = self.registry.teardown_all(self.store.as_ref());
        log::info!("presence: engine stopped, released {released} listener(s)");
    }

    // ─── Identity reconciliation ────────────────────────────────────

    fn apply_identity(&mut self, auth: AuthState) {
        let next = match auth.identity {
            Some(identity) => match validate_key(&identity.id) {
                Ok(()) => Some(identity),
                Err(e) => {
                    log::error!("presence: rejecting identity '{}': {e}", identity.id);
                    None
                }
            },
            None => None,
        };

        let before = self.machine.state();
        let commands = self.machine.on_session(auth.session, next);
        if commands.is_empty() {
            if self.machine.identity().is_none() {
                // Provider confirmed nobody is signed in.
                self.snapshot.send_if_modified(|snap| std::mem::replace(&mut snap.is_loading, false));
            }
            return;
        }
        self.execute(commands);

        let identity = self.machine.identity().cloned();
        let state = self.machine.state();
        self.snapshot.send_modify(|snap| {
            snap.is_loading = identity.is_some();
            snap.identity = identity;
            snap.profile = None;
            snap.presence = None;
            snap.state = state;
        });
        log::info!("presence: {before:?} -> {state:?} (identity change)");
    }

    fn attach(&mut self, identity: &str, generation: u64, channel: Channel, path: StorePath) {
        let Subscription { id, path, events } = match self.store.subscribe(&path) {
            Ok(subscription) => subscription,
            Err(e) => {
                log::warn!("presence: subscribe {path} failed: {e}");
                return;
            }
        };

        let tx = self.events_tx.clone();
        let forwarder = tokio::spawn(async move {
            let mut events = events;
            while let Some(value) = events.next().await {
                if tx.send(EngineEvent::from_push(channel, generation, value)).is_err() {
                    break;
                }
            }
        });

        log::debug!("presence: {id} {channel:?} at {path} (generation {generation})");
        self.registry
            .insert(identity, ActiveSubscription::new(channel, id, path).with_forwarder(forwarder));
    }

    fn subscribe_identity(&mut self, identity: &SessionIdentity, generation: u64) {
        if let Err(leak) = self.registry.ensure_clear_for(&identity.id) {
            debug_assert!(false, "{leak}");
            log::error!("presence: {leak}; force-unsubscribing everything");
            self.registry.teardown_all(self.store.as_ref());
        }

        let paths = &self.config.paths;
        let (profile, status) = match (paths.profile(&identity.id), paths.status(&identity.id)) {
            (Ok(profile), Ok(status)) => (profile, status),
            (Err(e), _) | (_, Err(e)) => {
                log::error!("presence: no paths for '{}': {e}", identity.id);
                return;
            }
        };
        let connected = paths.connected();

        self.attach(&identity.id, generation, Channel::Profile, profile);
        self.attach(&identity.id, generation, Channel::Status, status);
        self.attach(&identity.id, generation, Channel::Connectivity, connected);
    }

    // ─── Event handling ─────────────────────────────────────────────

    fn handle_event(&mut self, event: EngineEvent) {
        let before = self.machine.state();
        let commands = match event {
            EngineEvent::Connectivity {
                generation,
                connected,
            } => {
                log::debug!("presence: connectivity {connected} (generation {generation})");
                self.machine.on_connectivity(generation, connected)
            }
            EngineEvent::ArmAcked { epoch, result } => self.machine.on_arm_ack(epoch, result),
            EngineEvent::OnlineAcked { epoch, result } => self.machine.on_online_ack(epoch, result),
            EngineEvent::Profile { generation, value } => {
                self.apply_profile(generation, value);
                Vec::new()
            }
            EngineEvent::Status { generation, value } => {
                self.apply_status(generation, value);
                Vec::new()
            }
        };
        self.execute(commands);

        let after = self.machine.state();
        if after != before {
            log::info!("presence: {before:?} -> {after:?}");
            self.snapshot.send_modify(|snap| snap.state = after);
        }
    }

    fn apply_profile(&mut self, generation: u64, value: Option<Value>) {
        if !self.machine.accepts(generation) {
            log::debug!("presence: dropping stale profile push (generation {generation})");
            return;
        }
        let Some(identity) = self.machine.identity().cloned() else {
            return;
        };
        let profile = match value.map(serde_json::from_value::<ProfileRecord>) {
            Some(Ok(record)) => Some(Profile::from_record(&identity, record)),
            Some(Err(e)) => {
                // Keep the previous profile; the push still ends loading.
                log::warn!("presence: malformed profile for '{}': {e}", identity.id);
                self.snapshot.send_if_modified(|snap| std::mem::replace(&mut snap.is_loading, false));
                return;
            }
            None => {
                log::warn!("presence: no profile stored for '{}'", identity.id);
                None
            }
        };
        self.snapshot.send_modify(|snap| {
            snap.profile = profile;
            snap.is_loading = false;
        });
    }

    fn apply_status(&mut self, generation: u64, value: Option<Value>) {
        if !self.machine.accepts(generation) {
            log::debug!("presence: dropping stale status push (generation {generation})");
            return;
        }
        let presence = match value.as_ref().map(PresenceRecord::from_value) {
            Some(Ok(record)) => Some(record),
            Some(Err(e)) => {
                log::warn!("presence: malformed status record: {e}");
                return;
            }
            None => None,
        };
        self.snapshot.send_modify(|snap| snap.presence = presence);
    }

    // ─── Commands ───────────────────────────────────────────────────

    fn execute(&mut self, commands: Vec<Command>) {
        for command in commands {
            match command {
                Command::Teardown { identity } => {
                    let released = self.registry.teardown(&identity, self.store.as_ref());
                    log::debug!("presence: released {released} listener(s) of '{identity}'");
                }
                Command::Subscribe {
                    identity,
                    generation,
                } => self.subscribe_identity(&identity, generation),
                Command::ArmOffline { identity, epoch } => {
                    let Some(path) = self.status_path(&identity) else {
                        continue;
                    };
                    let store = self.store.clone();
                    let tx = self.events_tx.clone();
                    tokio::spawn(async move {
                        let result = store
                            .arm_deferred_write(&path, PresenceRecord::offline().to_value())
                            .await;
                        let _ = tx.send(EngineEvent::ArmAcked { epoch, result });
                    });
                }
                Command::WriteOnline { identity, epoch } => {
                    let Some(path) = self.status_path(&identity) else {
                        continue;
                    };
                    let store = self.store.clone();
                    let tx = self.events_tx.clone();
                    tokio::spawn(async move {
                        let result = store.write(&path, PresenceRecord::online().to_value()).await;
                        let _ = tx.send(EngineEvent::OnlineAcked { epoch, result });
                    });
                }
                Command::Report {
                    identity,
                    operation,
                    error,
                } => {
                    let path = self.status_path(&identity);
                    report(&self.notices, operation, identity, path, error);
                }
            }
        }
    }

    fn status_path(&self, identity: &str) -> Option<StorePath> {
        match self.config.paths.status(identity) {
            Ok(path) => Some(path),
            Err(e) => {
                log::error!("presence: no status path for '{identity}': {e}");
                None
            }
        }
    }
}

fn report(
    notices: &broadcast::Sender<PresenceNotice>,
    operation: Operation,
    identity: String,
    path: Option<StorePath>,
    error: StoreError,
) {
    match error.class() {
        ErrorClass::Transport => {
            log::warn!("presence: {operation:?} for '{identity}' lost transport: {error}")
        }
        ErrorClass::WriteAcknowledgment => {
            log::warn!("presence: {operation:?} for '{identity}' rejected: {error}")
        }
    }
    // No receivers is fine.
    let _ = notices.send(PresenceNotice {
        operation,
        identity,
        path,
        error,
    });
}

/// Caller-side handle to a running engine.
pub struct PresenceHandle {
    store: Arc<dyn SessionStore>,
    identity: Arc<dyn IdentitySession>,
    config: PresenceConfig,
    snapshot: watch::Receiver<SessionSnapshot>,
    notices: broadcast::Sender<PresenceNotice>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PresenceHandle {
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> PresenceState {
        self.snapshot.borrow().state
    }

    /// Change notifications for the snapshot.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Warning-level notices about failed acknowledgments.
    pub fn notices(&self) -> broadcast::Receiver<PresenceNotice> {
        self.notices.subscribe()
    }

    /// Wait until the snapshot satisfies `pred`.
    pub async fn wait_until(
        &self,
        pred: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot, PresenceError> {
        let mut rx = self.snapshot.clone();
        let snap = rx
            .wait_for(pred)
            .await
            .map_err(|_| PresenceError::EngineStopped)?;
        Ok(snap.clone())
    }

    pub async fn wait_for_state(&self, state: PresenceState) -> Result<SessionSnapshot, PresenceError> {
        self.wait_until(|snap| snap.state == state).await
    }

    /// Clean sign-out: best-effort "offline" write, then identity sign-out.
    ///
    /// The deferred write armed for this connection still covers the case
    /// where the proactive write is lost.
    pub async fn sign_out(&self) -> Result<(), PresenceError> {
        let identity = self.identity.current().ok_or(IdentityError::NotSignedIn)?;

        if self.config.proactive_offline_on_sign_out {
            let path = self.config.paths.status(&identity.id)?;
            if let Err(error) = self
                .store
                .write(&path, PresenceRecord::offline().to_value())
                .await
            {
                report(
                    &self.notices,
                    Operation::SignOutOffline,
                    identity.id.clone(),
                    Some(path),
                    error,
                );
            }
        }

        self.identity.sign_out().await?;
        log::info!("presence: '{}' signed out", identity.id);
        Ok(())
    }

    /// Stop the engine and release its listeners.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PresenceHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}
