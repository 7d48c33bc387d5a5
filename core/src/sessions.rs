//! Registry of per-party sessions.
//!
//! Registration is fail-fast: a batch either registers every identity or none of them.
//! It runs in two steps. [`IdentitySessionManager::open`] connects without touching
//! the registry, and [`IdentitySessionManager::commit`] swaps the opened sessions in.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use futures_util::future::try_join_all;
use tokio::sync::RwLock;

use escrow_transport::{Session, Transport};
use escrow_types::{Identity, PartyName};

use crate::errors::{EscrowError, InitializationError};

/// A session pushed out of the registry by re-registration or release.
///
/// Sessions are not closed automatically; dropping the last handle releases it.
pub struct DisplacedSession {
    pub name: PartyName,
    pub session: Arc<dyn Session>,
}

impl fmt::Debug for DisplacedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplacedSession")
            .field("name", &self.name)
            .field("account", &self.session.account())
            .finish()
    }
}

/// An identity with a live session, not yet visible in the registry.
pub struct OpenedSession {
    identity: Identity,
    session: Arc<dyn Session>,
}

impl OpenedSession {
    #[must_use]
    pub fn name(&self) -> &PartyName {
        self.identity.name()
    }

    #[must_use]
    pub fn session(&self) -> Arc<dyn Session> {
        Arc::clone(&self.session)
    }
}

pub struct IdentitySessionManager {
    transport: Arc<dyn Transport>,
    sessions: RwLock<HashMap<PartyName, OpenedSession>>,
}

impl IdentitySessionManager {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Open one session per identity, concurrently, then insert them all at once.
    ///
    /// The first failure aborts the batch and nothing is inserted. Names already
    /// registered are overwritten; their previous sessions are returned.
    pub async fn register(
        &self,
        identities: Vec<Identity>,
    ) -> Result<Vec<DisplacedSession>, InitializationError> {
        let opened = self.open(identities).await?;
        Ok(self.commit(opened).await)
    }

    /// Open sessions for a batch without registering them. Fails on the first
    /// duplicate name or session error.
    pub async fn open(
        &self,
        identities: Vec<Identity>,
    ) -> Result<Vec<OpenedSession>, InitializationError> {
        let mut seen = HashSet::new();
        for identity in &identities {
            if !seen.insert(identity.name().clone()) {
                return Err(InitializationError::DuplicateName {
                    name: identity.name().clone(),
                });
            }
        }

        try_join_all(identities.into_iter().map(|identity| async move {
            match self.transport.open_session(identity.credential()).await {
                Ok(session) => {
                    tracing::info!(
                        party = %identity.name(),
                        role = %identity.role(),
                        account = %session.account(),
                        "Session established"
                    );
                    Ok(OpenedSession { identity, session })
                }
                Err(source) => {
                    tracing::error!(party = %identity.name(), error = %source, "Session failed");
                    Err(InitializationError::Session {
                        name: identity.name().clone(),
                        source,
                    })
                }
            }
        }))
        .await
    }

    /// Insert opened sessions, returning the ones they replace.
    pub async fn commit(&self, opened: Vec<OpenedSession>) -> Vec<DisplacedSession> {
        let mut sessions = self.sessions.write().await;
        opened
            .into_iter()
            .filter_map(|registered| {
                let name = registered.identity.name().clone();
                sessions
                    .insert(name.clone(), registered)
                    .map(|previous| DisplacedSession {
                        name,
                        session: previous.session,
                    })
            })
            .collect()
    }

    pub async fn lookup(&self, name: &str) -> Result<Arc<dyn Session>, EscrowError> {
        self.with_registered(name, |registered| Arc::clone(&registered.session))
            .await
    }

    pub async fn identity(&self, name: &str) -> Result<Identity, EscrowError> {
        self.with_registered(name, |registered| registered.identity.clone())
            .await
    }

    /// Registered names in sorted order.
    pub async fn names(&self) -> Vec<PartyName> {
        let mut names: Vec<PartyName> = self.sessions.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Remove a party, handing its session back to the caller.
    pub async fn release(&self, name: &str) -> Option<DisplacedSession> {
        let key = PartyName::new(name).ok()?;
        let registered = self.sessions.write().await.remove(&key)?;
        tracing::info!(party = %key, "Session released");
        Some(DisplacedSession {
            name: key,
            session: registered.session,
        })
    }

    async fn with_registered<T>(
        &self,
        name: &str,
        f: impl FnOnce(&OpenedSession) -> T,
    ) -> Result<T, EscrowError> {
        let unknown = || EscrowError::UnknownIdentity {
            name: name.to_string(),
        };
        let key = PartyName::new(name).map_err(|_| unknown())?;
        let sessions = self.sessions.read().await;
        sessions.get(&key).map(f).ok_or_else(unknown)
    }
}
