// src/state.rs

use std::sync::Arc;

use axum::extract::FromRef;

use crate::{
    config::Config,
    engine::{SessionDeps, SessionRegistry},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub sessions: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(config: Config, deps: SessionDeps) -> Self {
        let sessions = Arc::new(SessionRegistry::new(deps, config.engine.clone()));
        Self { config, sessions }
    }

    pub fn deps(&self) -> &SessionDeps {
        self.sessions.deps()
    }
}

impl FromRef<AppState> for Config {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}
