//! Shared per-container session holding the logged-in identity.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::InjectionProvider;
use crate::container::{Injected, WorkerInfo};

/// Identity state shared by every worker of one container.
///
/// Reads and writes go through these methods only; the lock is never exposed.
#[derive(Debug, Default)]
pub struct Session {
    identity: RwLock<Option<String>>,
}

impl Session {
    /// A session nobody has logged into yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the identity.
    ///
    /// There is no logout. Calling this twice overwrites the first identity;
    /// callers check `is_logged_in` first.
    pub fn login(&self, identity: impl Into<String>) {
        let identity = identity.into();
        debug!(%identity, "session login");
        *self.identity.write() = Some(identity);
    }

    /// Whether an identity has been set.
    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        self.identity.read().is_some()
    }

    /// The current identity, if any.
    #[must_use]
    pub fn identity(&self) -> Option<String> {
        self.identity.read().clone()
    }
}

/// Hands the same `Session` to every worker.
pub struct SessionProvider {
    name: &'static str,
    session: Arc<Session>,
}

impl SessionProvider {
    /// Creates a provider owning a fresh session.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            session: Arc::new(Session::new()),
        }
    }

    /// The session this provider hands out.
    #[must_use]
    pub fn session(&self) -> Arc<Session> {
        Arc::clone(&self.session)
    }
}

#[async_trait]
impl InjectionProvider for SessionProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn acquire(&self, _worker: &WorkerInfo) -> anyhow::Result<Injected> {
        Ok(self.session() as Injected)
    }
}
