//! Per-request unit of work shared by every resolver of one GraphQL request.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use learning_progress_store_sqlite::UnitOfWork;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{label} timed out after {timeout_ms} ms")]
    Timeout { label: &'static str, timeout_ms: u128 },
    #[error("{label} join failure: {message}")]
    Join { label: &'static str, message: String },
    #[error("request session is already closed")]
    Closed,
    #[error("request session lock is poisoned")]
    Poisoned,
}

/// Owns the unit of work for one request. Resolvers borrow it through
/// [`RequestSession::run`]; the handler ends it with [`RequestSession::finish`].
/// If the session is dropped without finishing, the unit of work rolls back.
#[derive(Clone)]
pub struct RequestSession {
    unit: Arc<Mutex<Option<UnitOfWork>>>,
    timeout: Duration,
}

impl RequestSession {
    pub fn new(unit: UnitOfWork, timeout: Duration) -> Self {
        Self {
            unit: Arc::new(Mutex::new(Some(unit))),
            timeout,
        }
    }

    /// Runs a blocking store operation against the open unit of work.
    pub async fn run<T, F>(&self, label: &'static str, op: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&UnitOfWork) -> anyhow::Result<T> + Send + 'static,
    {
        let unit = Arc::clone(&self.unit);
        let handle = tokio::task::spawn_blocking(move || {
            let guard = unit.lock().map_err(|_| SessionError::Poisoned)?;
            let active = guard.as_ref().ok_or(SessionError::Closed)?;
            op(active)
        });

        let joined = tokio::time::timeout(self.timeout, handle)
            .await
            .map_err(|_| SessionError::Timeout {
                label,
                timeout_ms: self.timeout.as_millis(),
            })?;

        joined.map_err(|err| SessionError::Join {
            label,
            message: err.to_string(),
        })?
    }

    /// Commits or rolls back the unit of work. A lock poisoned by a panicking
    /// resolver always rolls back, whatever `commit` says.
    pub async fn finish(&self, commit: bool) -> anyhow::Result<()> {
        let unit = Arc::clone(&self.unit);
        let handle = tokio::task::spawn_blocking(move || {
            let (taken, poisoned) = match unit.lock() {
                Ok(mut guard) => (guard.take(), false),
                Err(poison) => (PoisonError::into_inner(poison).take(), true),
            };
            match taken {
                Some(active) if commit && !poisoned => active.commit().map(drop),
                Some(active) => {
                    if poisoned {
                        tracing::warn!("request session poisoned by a panic, rolling back");
                    }
                    active.rollback().map(drop)
                }
                None => Ok(()),
            }
        });

        handle.await.map_err(|err| SessionError::Join {
            label: "finish",
            message: err.to_string(),
        })?
    }
}
