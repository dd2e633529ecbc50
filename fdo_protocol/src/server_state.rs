//! Server-side session state: opaque tokens, per-session state records, and
//! the session store contract with an in-memory implementation. Sessions are
//! read at the start of a protocol turn and committed atomically at its end.

use std::{fmt::Display, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::{task::JoinHandle, time};

use fdo_common::utils::random_string;

pub const CLEANUP_INTERVAL_SECONDS: u64 = 10;

/// After this period of inactivity an active session is expired.
pub const SESSION_EXPIRY_SECONDS: u64 = 300;

/// Finished or expired sessions are kept around this long for status queries.
pub const SESSION_RETENTION_SECONDS: u64 = 60;

#[derive(thiserror::Error, Debug)]
pub enum SessionStoreError {
    #[error("session token already in use")]
    DuplicateToken,
    #[error("session store failure: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// Opaque session token, issued by the server on the first response of a
/// session and echoed by the client on every subsequent request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new_random() -> Self {
        SessionToken(random_string(32))
    }
}

impl From<String> for SessionToken {
    fn from(value: String) -> Self {
        SessionToken(value)
    }
}

impl From<SessionToken> for String {
    fn from(value: SessionToken) -> Self {
        value.0
    }
}

impl Display for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct SessionState<T> {
    pub data: T,
    pub token: SessionToken,
    pub last_active: DateTime<Utc>,
}

impl<T> SessionState<T> {
    pub fn new(token: SessionToken, data: T) -> Self {
        SessionState {
            data,
            token,
            last_active: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Active,
    Finished { has_succeeded: bool },
}

pub trait HasProgress {
    fn progress(&self) -> Progress;
}

pub trait Expirable {
    fn is_expired(&self) -> bool;
    fn expire(&mut self);
}

#[async_trait]
pub trait SessionStore<T>: Send + Sync {
    async fn get(&self, token: &SessionToken) -> Result<Option<SessionState<T>>, SessionStoreError>;

    /// Commits a session atomically. With `is_new`, writing over an existing
    /// token is an error: tokens are issued once.
    async fn write(&self, session: SessionState<T>, is_new: bool) -> Result<(), SessionStoreError>;

    /// Expires idle sessions and evicts finished ones past retention.
    async fn cleanup(&self) -> Result<(), SessionStoreError>;
}

/// Spawns the periodic cleanup for a session store. Abort the handle to stop.
pub fn start_cleanup_task<T, S>(store: Arc<S>, interval: Duration) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
    S: SessionStore<T> + 'static,
{
    let mut interval = time::interval(interval);
    tokio::spawn(async move {
        loop {
            interval.tick().await;
            if let Err(error) = store.cleanup().await {
                tracing::warn!("session cleanup failed: {error}");
            }
        }
    })
}

/// In-memory session store, for tests and single-process deployments.
pub struct MemorySessionStore<T> {
    sessions: DashMap<SessionToken, SessionState<T>>,
}

impl<T> MemorySessionStore<T> {
    pub fn new() -> Self {
        MemorySessionStore {
            sessions: DashMap::new(),
        }
    }
}

impl<T> Default for MemorySessionStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> SessionStore<T> for MemorySessionStore<T>
where
    T: HasProgress + Expirable + Clone + Send + Sync,
{
    async fn get(&self, token: &SessionToken) -> Result<Option<SessionState<T>>, SessionStoreError> {
        Ok(self.sessions.get(token).map(|session| session.clone()))
    }

    async fn write(&self, session: SessionState<T>, is_new: bool) -> Result<(), SessionStoreError> {
        if is_new && self.sessions.contains_key(&session.token) {
            return Err(SessionStoreError::DuplicateToken);
        }
        self.sessions.insert(session.token.clone(), session);
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), SessionStoreError> {
        let now = Utc::now();
        let expiry = chrono::Duration::seconds(SESSION_EXPIRY_SECONDS as i64);
        let retention = chrono::Duration::seconds(SESSION_RETENTION_SECONDS as i64);

        self.sessions.retain(|_, session| {
            let idle = now - session.last_active;
            match session.data.progress() {
                Progress::Active => true,
                Progress::Finished { .. } => idle <= retention,
            }
        });

        for mut entry in self.sessions.iter_mut() {
            let idle = now - entry.last_active;
            if matches!(entry.data.progress(), Progress::Active) && idle > expiry && !entry.data.is_expired() {
                entry.data.expire();
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum TestData {
        Active,
        Expired,
    }

    impl HasProgress for TestData {
        fn progress(&self) -> Progress {
            Progress::Active
        }
    }

    impl Expirable for TestData {
        fn is_expired(&self) -> bool {
            matches!(self, TestData::Expired)
        }

        fn expire(&mut self) {
            *self = TestData::Expired;
        }
    }

    #[tokio::test]
    async fn write_and_get() {
        let store = MemorySessionStore::new();
        let token = SessionToken::new_random();

        store
            .write(SessionState::new(token.clone(), TestData::Active), true)
            .await
            .unwrap();

        let session = store.get(&token).await.unwrap().unwrap();
        assert_eq!(session.data, TestData::Active);
        assert!(store.get(&SessionToken::new_random()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_token_is_rejected() {
        let store = MemorySessionStore::new();
        let token = SessionToken::new_random();

        store
            .write(SessionState::new(token.clone(), TestData::Active), true)
            .await
            .unwrap();
        assert_matches!(
            store.write(SessionState::new(token.clone(), TestData::Active), true).await,
            Err(SessionStoreError::DuplicateToken)
        );
        // Overwriting as a state transition is fine.
        store
            .write(SessionState::new(token, TestData::Active), false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cleanup_expires_idle_sessions() {
        let store = MemorySessionStore::new();
        let token = SessionToken::new_random();

        let mut session = SessionState::new(token.clone(), TestData::Active);
        session.last_active = Utc::now() - chrono::Duration::seconds(SESSION_EXPIRY_SECONDS as i64 + 1);
        store.write(session, true).await.unwrap();

        store.cleanup().await.unwrap();
        let session = store.get(&token).await.unwrap().unwrap();
        assert_eq!(session.data, TestData::Expired);
    }
}
