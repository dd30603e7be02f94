//! Per-identity listener bookkeeping.
//!
//! The engine owns one registry; nothing is kept in module-level state, so
//! independent engines never share listeners.

use std::collections::HashMap;
use tokio::task::JoinHandle;

use crate::error::PresenceError;
use crate::path::StorePath;
use crate::store::{SessionStore, SubscriptionId};

/// What a listener feeds into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Connectivity,
    Profile,
    Status,
}

/// One registered listener and the task forwarding its pushes.
#[derive(Debug)]
pub struct ActiveSubscription {
    pub channel: Channel,
    pub id: SubscriptionId,
    pub path: StorePath,
    forwarder: Option<JoinHandle<()>>,
}

impl ActiveSubscription {
    pub fn new(channel: Channel, id: SubscriptionId, path: StorePath) -> Self {
        Self {
            channel,
            id,
            path,
            forwarder: None,
        }
    }

    pub fn with_forwarder(mut self, forwarder: JoinHandle<()>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    fn cancel(self, store: &dyn SessionStore) {
        if !store.unsubscribe(self.id) {
            log::debug!("{} at {} was already gone", self.id, self.path);
        }
        if let Some(forwarder) = self.forwarder {
            forwarder.abort();
        }
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    by_identity: HashMap<String, Vec<ActiveSubscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, identity: &str, subscription: ActiveSubscription) {
        self.by_identity
            .entry(identity.to_string())
            .or_default()
            .push(subscription);
    }

    /// Total listeners across identities.
    pub fn len(&self) -> usize {
        self.by_identity.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count_for(&self, identity: &str) -> usize {
        self.by_identity.get(identity).map_or(0, Vec::len)
    }

    pub fn channels_for(&self, identity: &str) -> Vec<Channel> {
        self.by_identity
            .get(identity)
            .map(|subs| subs.iter().map(|s| s.channel).collect())
            .unwrap_or_default()
    }

    /// Fails if listeners of any other identity are still registered.
    pub fn ensure_clear_for(&self, identity: &str) -> Result<(), PresenceError> {
        match self
            .by_identity
            .iter()
            .find(|(owner, subs)| owner.as_str() != identity && !subs.is_empty())
        {
            Some((owner, subs)) => Err(PresenceError::SubscriptionLeak {
                identity: owner.clone(),
                count: subs.len(),
            }),
            None => Ok(()),
        }
    }

    /// Unsubscribe every listener of `identity`, each exactly once.
    pub fn teardown(&mut self, identity: &str, store: &dyn SessionStore) -> usize {
        let subs = self.by_identity.remove(identity).unwrap_or_default();
        let count = subs.len();
        for sub in subs {
            sub.cancel(store);
        }
        count
    }

    pub fn teardown_all(&mut self, store: &dyn SessionStore) -> usize {
        let owners: Vec<String> = self.by_identity.keys().cloned().collect();
        owners
            .iter()
            .map(|owner| self.teardown(owner, store))
            .sum()
    }
}
