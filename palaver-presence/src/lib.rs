//! # palaver-presence: Session presence for the Palaver chat client
//!
//! Decides, per connected client, whether its session is reported
//! "online" or "offline", and guarantees the offline transition when the
//! client vanishes without a goodbye (crash, lost network, closed tab).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐  login/logout   ┌──────────────────┐
//! │ IdentitySession │ ──────────────► │  PresenceEngine  │
//! └─────────────────┘                 │  (run loop)      │
//!                                     └───┬─────────▲────┘
//!                      arm / write / sub  │         │ pushes, acks
//!                                         ▼         │
//!                                     ┌──────────────────┐
//!                                     │  SessionStore    │
//!                                     │  deferred writes │
//!                                     └────────┬─────────┘
//!                                              │ fan-out
//!                                              ▼
//!                                     other clients / UI snapshot
//! ```
//!
//! ## Modules
//!
//! - [`machine`]: Pure presence state machine (epoch/generation guarded)
//! - [`engine`]: Async driver, snapshot and notices for UI consumers
//! - [`store`]: Store contract (`subscribe`, `arm_deferred_write`, `write`)
//! - [`memory`]: In-memory store honouring the contract, with test controls
//! - [`registry`]: Per-identity listener bookkeeping
//! - [`identity`]: Identity provider boundary
//! - [`avatar`]: Avatar upload and fan-out update
//!
//! ## Ordering guarantee
//!
//! For every connection the deferred "offline" write is acknowledged by
//! the store before the "online" write is issued. A disconnect between the
//! two can therefore never leave a ghost "online" record behind.

pub mod path;
pub mod record;
pub mod error;
pub mod config;
pub mod store;
pub mod memory;
pub mod identity;
pub mod machine;
pub mod registry;
pub mod engine;
pub mod avatar;

// Re-exports for convenience
pub use path::{PathError, StorePath};
pub use record::{
    Liveness, PresenceRecord, Profile, ProfileRecord, ServerTimestamp, SessionIdentity,
};
pub use error::{ErrorClass, IdentityError, PresenceError, StoreError};
pub use config::{AvatarConfig, PathLayout, PresenceConfig};
pub use store::{SessionStore, Subscription, SubscriptionId};
pub use memory::{ConnectionId, MemoryStore, StoreCall};
pub use identity::{AuthState, IdentitySession, MemoryIdentity};
pub use machine::{Command, Operation, PresenceMachine, PresenceState};
pub use registry::{ActiveSubscription, Channel, SubscriptionRegistry};
pub use engine::{PresenceEngine, PresenceHandle, PresenceNotice, SessionSnapshot};
pub use avatar::{
    AvatarError, AvatarFile, AvatarUploader, BlobError, BlobStore, MemoryBlobStore,
    UploadMetadata,
};
