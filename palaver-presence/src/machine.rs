//! Presence state machine.
//!
//! Pure and synchronous: every input returns the commands the driver must
//! carry out. Nothing here touches the store, which keeps every
//! interleaving of acknowledgments reproducible in unit tests.
//!
//! ```text
//!              identity                 connected=true
//!  LoggedOut ───────────► Awaiting ─────────────────────► ArmedOffline
//!      ▲                  Connectivity ◄───────────────┐       │ arm ack
//!      │ logout             ▲   ▲  connected=false     │       ▼
//!      └──── (any) ─────────┘   └────────────────────── Online
//! ```
//!
//! Two counters guard against stale callbacks:
//!
//! - `epoch` tags in-flight store operations; bumped on login, logout,
//!   connectivity drop and every re-arm.
//! - `generation` tags subscription events; bumped on every identity change.
//!
//! The provider's session counter is tracked as well: a new session for the
//! account already held is a logout and a fresh login, not a re-announcement.

use serde::Serialize;

use crate::error::StoreError;
use crate::record::SessionIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PresenceState {
    LoggedOut,
    AwaitingConnectivity,
    ArmedOffline,
    Online,
}

/// Store operation a report refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Operation {
    ArmOffline,
    WriteOnline,
    SignOutOffline,
}

/// Work the driver must perform, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Unsubscribe every listener registered for `identity`.
    Teardown { identity: String },
    /// Register connectivity, profile and status listeners.
    Subscribe {
        identity: SessionIdentity,
        generation: u64,
    },
    /// Arm the deferred "offline" write for the live connection.
    ArmOffline { identity: String, epoch: u64 },
    /// Write "online" now.
    WriteOnline { identity: String, epoch: u64 },
    /// Surface a failed acknowledgment.
    Report {
        identity: String,
        operation: Operation,
        error: StoreError,
    },
}

#[derive(Debug, Clone)]
pub struct PresenceMachine {
    state: PresenceState,
    identity: Option<SessionIdentity>,
    session: u64,
    epoch: u64,
    generation: u64,
}

impl Default for PresenceMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceMachine {
    pub fn new() -> Self {
        Self {
            state: PresenceState::LoggedOut,
            identity: None,
            session: 0,
            epoch: 0,
            generation: 0,
        }
    }

    pub fn state(&self) -> PresenceState {
        self.state
    }

    pub fn identity(&self) -> Option<&SessionIdentity> {
        self.identity.as_ref()
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a subscription event tagged `generation` may still be applied.
    pub fn accepts(&self, generation: u64) -> bool {
        self.identity.is_some() && generation == self.generation
    }

    fn identity_id(&self) -> Option<String> {
        self.identity.as_ref().map(|i| i.id.clone())
    }

    /// Login, logout or account switch.
    ///
    /// Teardown of the previous identity always precedes the new
    /// subscriptions.
    pub fn on_identity(&mut self, next: Option<SessionIdentity>) -> Vec<Command> {
        let same = match (&self.identity, &next) {
            (Some(current), Some(next)) => current.id == next.id,
            (None, None) => true,
            _ => false,
        };
        if same {
            // Same account re-announced; keep subscriptions and connection state.
            if next.is_some() {
                self.identity = next;
            }
            return Vec::new();
        }

        let mut commands = Vec::new();
        if let Some(previous) = self.identity.take() {
            commands.push(Command::Teardown {
                identity: previous.id,
            });
        }

        self.generation += 1;
        self.epoch += 1;

        match next {
            Some(identity) => {
                self.state = PresenceState::AwaitingConnectivity;
                self.identity = Some(identity.clone());
                commands.push(Command::Subscribe {
                    identity,
                    generation: self.generation,
                });
            }
            None => {
                self.state = PresenceState::LoggedOut;
            }
        }
        commands
    }

    /// Identity update tagged with the provider's session counter.
    pub fn on_session(&mut self, session: u64, next: Option<SessionIdentity>) -> Vec<Command> {
        let same_account = match (&self.identity, &next) {
            (Some(current), Some(next)) => current.id == next.id,
            _ => false,
        };
        let missed_logout = same_account && session != self.session;
        self.session = session;

        let mut commands = Vec::new();
        if missed_logout {
            commands.extend(self.on_identity(None));
        }
        commands.extend(self.on_identity(next));
        commands
    }

    /// A push on the connectivity sentinel.
    pub fn on_connectivity(&mut self, generation: u64, connected: bool) -> Vec<Command> {
        if !self.accepts(generation) {
            return Vec::new();
        }
        let Some(identity) = self.identity_id() else {
            return Vec::new();
        };

        match (self.state, connected) {
            (PresenceState::AwaitingConnectivity, true) => {
                self.epoch += 1;
                self.state = PresenceState::ArmedOffline;
                vec![Command::ArmOffline {
                    identity,
                    epoch: self.epoch,
                }]
            }
            (PresenceState::ArmedOffline | PresenceState::Online, false) => {
                // The registration belongs to the dead socket; re-arm on reconnect.
                self.epoch += 1;
                self.state = PresenceState::AwaitingConnectivity;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Acknowledgment (or failure) of the deferred-write registration.
    pub fn on_arm_ack(&mut self, epoch: u64, result: Result<(), StoreError>) -> Vec<Command> {
        if epoch != self.epoch || self.state != PresenceState::ArmedOffline {
            return Vec::new();
        }
        let Some(identity) = self.identity_id() else {
            return Vec::new();
        };

        match result {
            Ok(()) => {
                self.state = PresenceState::Online;
                vec![Command::WriteOnline { identity, epoch }]
            }
            Err(error) => {
                self.epoch += 1;
                self.state = PresenceState::AwaitingConnectivity;
                vec![Command::Report {
                    identity,
                    operation: Operation::ArmOffline,
                    error,
                }]
            }
        }
    }

    /// Acknowledgment of the "online" write. Never changes state.
    pub fn on_online_ack(&mut self, epoch: u64, result: Result<(), StoreError>) -> Vec<Command> {
        if epoch != self.epoch {
            return Vec::new();
        }
        match (result, self.identity_id()) {
            (Err(error), Some(identity)) => vec![Command::Report {
                identity,
                operation: Operation::WriteOnline,
                error,
            }],
            _ => Vec::new(),
        }
    }
}
