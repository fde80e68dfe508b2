// src/engine/registry.rs

use std::{collections::HashMap, sync::Arc};

use tokio::sync::{Mutex, OnceCell};

use crate::{
    config::EngineConfig,
    engine::{
        error::EngineError,
        runtime::{self, SessionHandle},
        session::{SessionController, SessionDeps},
    },
};

/// Filled once the session has loaded. Openers of the same attempt wait on
/// the cell, not on the registry lock.
type Slot = Arc<OnceCell<SessionHandle>>;

/// Live sessions keyed by attempt id. One session per attempt.
///
/// An entry is released when its session task stops: after the result is
/// stored, or after a dispose outside of submission.
pub struct SessionRegistry {
    deps: SessionDeps,
    config: EngineConfig,
    sessions: Arc<Mutex<HashMap<i64, Slot>>>,
}

impl SessionRegistry {
    pub fn new(deps: SessionDeps, config: EngineConfig) -> Self {
        Self {
            deps,
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn deps(&self) -> &SessionDeps {
        &self.deps
    }

    /// Returns the running session for the attempt, loading it if needed.
    ///
    /// A session that is still submitting is returned as is, even after a
    /// dispose, so the attempt can never be reloaded into `Active`.
    pub async fn open(&self, attempt_id: i64, user_id: i64) -> Result<SessionHandle, EngineError> {
        let slot = {
            let mut sessions = self.sessions.lock().await;
            let slot = sessions.entry(attempt_id).or_default();
            if slot.get().is_some_and(SessionHandle::is_closed) {
                *slot = Slot::default();
            }
            Arc::clone(slot)
        };

        let watched = Arc::clone(&slot);
        let opened = slot
            .get_or_try_init(|| self.start(attempt_id, user_id, watched))
            .await;

        match opened {
            Ok(handle) => {
                check_owner(handle, user_id)?;
                Ok(handle.clone())
            }
            Err(e) => {
                let mut sessions = self.sessions.lock().await;
                let unused = sessions.get(&attempt_id).is_some_and(|current| {
                    Arc::ptr_eq(current, &slot)
                        && current.get().is_none()
                        && Arc::strong_count(current) <= 2
                });
                if unused {
                    sessions.remove(&attempt_id);
                }
                Err(e)
            }
        }
    }

    /// An already open session.
    ///
    /// Without one, the store decides the error: `InvalidState` once the
    /// attempt is submitted, `NotFound` otherwise.
    pub async fn get(&self, attempt_id: i64, user_id: i64) -> Result<SessionHandle, EngineError> {
        let live = {
            let sessions = self.sessions.lock().await;
            sessions
                .get(&attempt_id)
                .and_then(|slot| slot.get().cloned())
                .filter(|handle| !handle.is_closed())
        };

        match live {
            Some(handle) => {
                check_owner(&handle, user_id)?;
                Ok(handle)
            }
            None => Err(self.missing(attempt_id, user_id).await),
        }
    }

    /// Stops the session's timers and monitors and forgets it. Answers
    /// already saved stay in the store and the shadow cache.
    ///
    /// A session that is still submitting keeps running until its result is
    /// stored and is released then.
    pub async fn dispose(&self, attempt_id: i64, user_id: i64) -> Result<(), EngineError> {
        let (slot, handle) = {
            let sessions = self.sessions.lock().await;
            let found = sessions
                .get(&attempt_id)
                .and_then(|slot| slot.get().cloned().map(|handle| (Arc::clone(slot), handle)));
            found.ok_or_else(|| {
                EngineError::NotFound(format!("no open session for attempt {}", attempt_id))
            })?
        };
        check_owner(&handle, user_id)?;

        handle.shutdown().await;
        if handle.is_closed() {
            release(&self.sessions, attempt_id, &slot).await;
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    async fn start(
        &self,
        attempt_id: i64,
        user_id: i64,
        slot: Slot,
    ) -> Result<SessionHandle, EngineError> {
        let controller =
            SessionController::open(attempt_id, user_id, &self.deps, self.config.clone()).await?;
        let handle = runtime::spawn(controller, &self.config);

        let sessions = Arc::clone(&self.sessions);
        let watched = handle.clone();
        tokio::spawn(async move {
            watched.closed().await;
            release(&sessions, attempt_id, &slot).await;
        });

        Ok(handle)
    }

    async fn missing(&self, attempt_id: i64, user_id: i64) -> EngineError {
        let attempt = match self.deps.store.load_attempt(attempt_id).await {
            Ok(attempt) => attempt,
            Err(e) => return e.into(),
        };
        if attempt.user_id != user_id {
            return EngineError::Forbidden(format!(
                "attempt {} belongs to another learner",
                attempt_id
            ));
        }
        if attempt.is_submitted {
            return EngineError::InvalidState(format!(
                "attempt {} is already submitted",
                attempt_id
            ));
        }
        EngineError::NotFound(format!("no open session for attempt {}", attempt_id))
    }
}

/// Drops the entry if it still holds `slot`; a newer session is left alone.
async fn release(sessions: &Mutex<HashMap<i64, Slot>>, attempt_id: i64, slot: &Slot) {
    let mut sessions = sessions.lock().await;
    if sessions
        .get(&attempt_id)
        .is_some_and(|current| Arc::ptr_eq(current, slot))
    {
        sessions.remove(&attempt_id);
        tracing::debug!("Released session slot for attempt {}", attempt_id);
    }
}

fn check_owner(handle: &SessionHandle, user_id: i64) -> Result<(), EngineError> {
    if handle.user_id() != user_id {
        return Err(EngineError::Forbidden(format!(
            "attempt {} belongs to another learner",
            handle.attempt_id()
        )));
    }
    Ok(())
}
