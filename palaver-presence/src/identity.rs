//! Identity provider boundary.

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::IdentityError;
use crate::record::SessionIdentity;

/// What an identity provider publishes.
///
/// `session` changes on every sign-in and sign-out, so a sign-out followed
/// by a sign-in of the same account stays visible to a watcher that only
/// sees the latest value. Re-announcing the signed-in account keeps it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthState {
    pub session: u64,
    pub identity: Option<SessionIdentity>,
}

/// Source of the signed-in identity.
#[async_trait]
pub trait IdentitySession: Send + Sync {
    fn watch(&self) -> watch::Receiver<AuthState>;

    fn current(&self) -> Option<SessionIdentity> {
        self.watch().borrow().identity.clone()
    }

    async fn sign_out(&self) -> Result<(), IdentityError>;
}

/// In-process identity provider.
pub struct MemoryIdentity {
    tx: watch::Sender<AuthState>,
}

impl Default for MemoryIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIdentity {
    /// Starts signed out.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(AuthState::default());
        Self { tx }
    }

    /// Sign in (or switch to) `identity`.
    pub fn sign_in(&self, identity: SessionIdentity) {
        log::info!("identity: signed in as {}", identity.id);
        self.tx.send_modify(|auth| {
            let same = auth.identity.as_ref().map(|i| &i.id) == Some(&identity.id);
            if !same {
                auth.session += 1;
            }
            auth.identity = Some(identity);
        });
    }
}

#[async_trait]
impl IdentitySession for MemoryIdentity {
    fn watch(&self) -> watch::Receiver<AuthState> {
        self.tx.subscribe()
    }

    async fn sign_out(&self) -> Result<(), IdentityError> {
        if self.tx.borrow().identity.is_none() {
            return Err(IdentityError::NotSignedIn);
        }
        log::info!("identity: signed out");
        self.tx.send_modify(|auth| {
            auth.session += 1;
            auth.identity = None;
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u1() -> SessionIdentity {
        SessionIdentity::new("u1", "a@example.com")
    }

    #[tokio::test]
    async fn test_sign_in_out() {
        let identity = MemoryIdentity::new();
        let mut rx = identity.watch();
        assert!(identity.current().is_none());

        identity.sign_in(u1());
        rx.changed().await.unwrap();
        assert_eq!(
            rx.borrow().identity.as_ref().map(|i| i.id.as_str()),
            Some("u1")
        );

        identity.sign_out().await.unwrap();
        rx.changed().await.unwrap();
        assert!(rx.borrow().identity.is_none());

        assert_eq!(identity.sign_out().await, Err(IdentityError::NotSignedIn));
    }

    #[tokio::test]
    async fn test_session_counter() {
        let identity = MemoryIdentity::new();
        let rx = identity.watch();

        identity.sign_in(u1());
        let first = rx.borrow().session;
        identity.sign_in(u1());
        assert_eq!(rx.borrow().session, first);

        // Out and back in again before anyone looks.
        identity.sign_out().await.unwrap();
        identity.sign_in(u1());
        let auth = rx.borrow().clone();
        assert_eq!(auth.identity, Some(u1()));
        assert!(auth.session > first);
    }
}
