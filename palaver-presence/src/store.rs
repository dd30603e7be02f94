//! Contract with the remote session store.
//!
//! The presence engine only ever talks to the store through
//! [`SessionStore`]. The one hard requirement beyond plain reads and
//! writes is the deferred write:
//!
//! ```text
//! client ── arm_deferred_write(P, W) ──► server keeps W for this connection
//!        ◄────────── ack ─────────────
//!          … transport drops …
//!                                        server writes W at P (exactly once)
//!                                        then listeners observe the drop
//! ```

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::StoreError;
use crate::path::StorePath;

/// Handle identifying one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// A registered listener and its inbound event stream.
///
/// The stream yields the value at `path` (or `None` when absent) once on
/// registration and then after every change. It ends after unsubscribe.
pub struct Subscription {
    pub id: SubscriptionId,
    pub path: StorePath,
    pub events: BoxStream<'static, Option<Value>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Hierarchical key-value store with push subscriptions and per-connection
/// deferred writes.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Register a listener. Registration is local and does not wait for the
    /// server; every call returns an independent subscription.
    fn subscribe(&self, path: &StorePath) -> Result<Subscription, StoreError>;

    /// Remove a listener. Returns `false` for unknown or already removed ids.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    /// Ask the server to write `value` at `path` once the connection issuing
    /// this call is detected dead. Re-arming the same path on the same
    /// connection replaces the earlier instruction.
    async fn arm_deferred_write(&self, path: &StorePath, value: Value) -> Result<(), StoreError>;

    /// Immediate write. No client-side retry.
    async fn write(&self, path: &StorePath, value: Value) -> Result<(), StoreError>;

    /// Atomic multi-path write.
    async fn update(&self, updates: BTreeMap<StorePath, Value>) -> Result<(), StoreError>;

    /// One-shot read.
    async fn read(&self, path: &StorePath) -> Result<Option<Value>, StoreError>;
}
