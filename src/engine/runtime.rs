// src/engine/runtime.rs

//! Runs a `SessionController` on its own task.
//!
//! All operations on a session go through one command channel, so they are
//! applied in arrival order and never interleave. Timers (deadline tick,
//! reconcile, finalize retry) are folded into the same loop.

use std::future;

use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    time::{Instant, MissedTickBehavior},
};

use crate::{
    config::EngineConfig,
    engine::{
        error::EngineError,
        events::SessionEvent,
        retry::Backoff,
        session::{Phase, SessionController, SessionSnapshot},
        violation::{MonitorOutcome, Signal},
    },
    models::attempt::QuestionStatus,
};

const COMMAND_BUFFER: usize = 32;

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

enum Command {
    Visit {
        question_id: i64,
        reply: Reply<QuestionStatus>,
    },
    SetAnswer {
        question_id: i64,
        selection: Vec<i64>,
        reply: Reply<QuestionStatus>,
    },
    ResetAnswer {
        question_id: i64,
        reply: Reply<QuestionStatus>,
    },
    ToggleReview {
        question_id: i64,
        reply: Reply<QuestionStatus>,
    },
    Signal {
        signal: Signal,
        reply: Reply<MonitorOutcome>,
    },
    DismissWarning {
        reply: Reply<()>,
    },
    Submit {
        reply: Reply<SessionSnapshot>,
    },
    Refresh {
        reply: Reply<SessionSnapshot>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Cheap, cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    attempt_id: i64,
    user_id: i64,
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    pub fn attempt_id(&self) -> i64 {
        self.attempt_id
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    /// Last published snapshot. Still readable after the session task exits.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Resolves once the session task has stopped.
    pub async fn closed(&self) {
        self.commands.closed().await
    }

    pub async fn visit(&self, question_id: i64) -> Result<QuestionStatus, EngineError> {
        self.request(|reply| Command::Visit { question_id, reply })
            .await
    }

    pub async fn set_answer(
        &self,
        question_id: i64,
        selection: Vec<i64>,
    ) -> Result<QuestionStatus, EngineError> {
        self.request(|reply| Command::SetAnswer {
            question_id,
            selection,
            reply,
        })
        .await
    }

    pub async fn reset_answer(&self, question_id: i64) -> Result<QuestionStatus, EngineError> {
        self.request(|reply| Command::ResetAnswer { question_id, reply })
            .await
    }

    pub async fn toggle_review(&self, question_id: i64) -> Result<QuestionStatus, EngineError> {
        self.request(|reply| Command::ToggleReview { question_id, reply })
            .await
    }

    pub async fn observe(&self, signal: Signal) -> Result<MonitorOutcome, EngineError> {
        self.request(|reply| Command::Signal { signal, reply }).await
    }

    pub async fn dismiss_warning(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::DismissWarning { reply }).await
    }

    /// Requests submission and waits for the first finalize attempt.
    ///
    /// The returned snapshot is `Submitted` on success and `Submitting` when
    /// the store is down (the session keeps retrying on its own).
    pub async fn submit(&self) -> Result<SessionSnapshot, EngineError> {
        match self.request(|reply| Command::Submit { reply }).await {
            Err(EngineError::InvalidState(_)) if self.is_closed() => Ok(self.snapshot()),
            other => other,
        }
    }

    /// Fresh snapshot with the deadline re-checked. Falls back to the last
    /// published one once the session has finished.
    pub async fn refresh(&self) -> SessionSnapshot {
        match self.request(|reply| Command::Refresh { reply }).await {
            Ok(snapshot) => snapshot,
            Err(_) => self.snapshot(),
        }
    }

    /// Stops the session. A session that is still submitting ignores this
    /// and keeps retrying until its result is stored.
    pub async fn shutdown(&self) {
        if self
            .request(|reply| Command::Shutdown { reply })
            .await
            .is_err()
        {
            tracing::debug!("Session {} already stopped", self.attempt_id);
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| closed(self.attempt_id))?;
        rx.await.map_err(|_| closed(self.attempt_id))?
    }
}

fn closed(attempt_id: i64) -> EngineError {
    EngineError::InvalidState(format!("session for attempt {} is closed", attempt_id))
}

/// Moves the controller onto a task and returns its handle.
pub fn spawn(controller: SessionController, config: &EngineConfig) -> SessionHandle {
    let (commands, receiver) = mpsc::channel(COMMAND_BUFFER);
    let (publisher, snapshots) = watch::channel(controller.snapshot());

    let handle = SessionHandle {
        attempt_id: controller.attempt_id(),
        user_id: controller.user_id(),
        commands,
        snapshots,
        events: controller.event_sender(),
    };

    tokio::spawn(run(controller, receiver, publisher, config.clone()));
    handle
}

struct Finalizer {
    backoff: Backoff,
    retry_at: Option<Instant>,
}

impl Finalizer {
    /// Attempts finalization if one is due. Failures schedule the next try.
    async fn drive(&mut self, controller: &mut SessionController) {
        if controller.phase() != Phase::Submitting {
            return;
        }
        if let Some(at) = self.retry_at {
            if Instant::now() < at {
                return;
            }
        }

        match controller.finalize().await {
            Ok(_) => self.retry_at = None,
            Err(e) => {
                let delay = self
                    .backoff
                    .delay(controller.finalize_failures().saturating_sub(1));
                tracing::warn!(
                    "Attempt {} still submitting, next finalize in {:?}: {}",
                    controller.attempt_id(),
                    delay,
                    e
                );
                self.retry_at = Some(Instant::now() + delay);
            }
        }
    }
}

async fn run(
    mut controller: SessionController,
    mut commands: mpsc::Receiver<Command>,
    publisher: watch::Sender<SessionSnapshot>,
    config: EngineConfig,
) {
    let attempt_id = controller.attempt_id();
    let mut ticker = tokio::time::interval(config.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut reconcile = tokio::time::interval(config.reconcile_interval);
    reconcile.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut finalizer = Finalizer {
        backoff: Backoff::from_config(&config),
        retry_at: None,
    };
    // Cleared once every handle is gone; a submission still in flight keeps
    // the task alive until the result is stored.
    let mut listening = true;

    finalizer.drive(&mut controller).await;
    publisher.send_replace(controller.snapshot());

    loop {
        if controller.phase() == Phase::Submitted {
            tracing::info!("Session for attempt {} finished", attempt_id);
            break;
        }

        let retry_at = finalizer.retry_at;
        let retry = async move {
            match retry_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => future::pending::<()>().await,
            }
        };

        tokio::select! {
            command = commands.recv(), if listening => match command {
                Some(Command::Shutdown { reply }) => {
                    if controller.phase() == Phase::Submitting {
                        tracing::info!(
                            "Attempt {} is still submitting; dispose deferred until stored",
                            attempt_id
                        );
                        let _ = reply.send(Ok(()));
                    } else {
                        controller.teardown();
                        publisher.send_replace(controller.snapshot());
                        commands.close();
                        let _ = reply.send(Ok(()));
                        tracing::info!("Session for attempt {} disposed", attempt_id);
                        return;
                    }
                }
                Some(command) => {
                    handle(&mut controller, &mut finalizer, &publisher, command).await;
                }
                None => {
                    if controller.phase() != Phase::Submitting {
                        controller.teardown();
                        tracing::info!("All handles for attempt {} dropped", attempt_id);
                        return;
                    }
                    tracing::info!(
                        "All handles for attempt {} dropped while submitting; finishing",
                        attempt_id
                    );
                    listening = false;
                }
            },
            _ = ticker.tick() => {
                controller.tick();
            }
            _ = reconcile.tick() => {
                if controller.reconcile() {
                    tracing::debug!("Reconciled session for attempt {}", attempt_id);
                }
            }
            _ = retry => {}
        }

        finalizer.drive(&mut controller).await;
        publisher.send_replace(controller.snapshot());
    }
}

async fn handle(
    controller: &mut SessionController,
    finalizer: &mut Finalizer,
    publisher: &watch::Sender<SessionSnapshot>,
    command: Command,
) {
    match command {
        Command::Visit { question_id, reply } => {
            let result = controller.visit(question_id).await;
            let _ = reply.send(result);
        }
        Command::SetAnswer {
            question_id,
            selection,
            reply,
        } => {
            let result = controller.set_answer(question_id, selection).await;
            let _ = reply.send(result);
        }
        Command::ResetAnswer { question_id, reply } => {
            let result = controller.reset_answer(question_id).await;
            let _ = reply.send(result);
        }
        Command::ToggleReview { question_id, reply } => {
            let result = controller.toggle_review(question_id).await;
            let _ = reply.send(result);
        }
        Command::Signal { signal, reply } => {
            let outcome = controller.observe_signal(signal).await;
            let _ = reply.send(Ok(outcome));
        }
        Command::DismissWarning { reply } => {
            controller.dismiss_warning();
            let _ = reply.send(Ok(()));
        }
        Command::Submit { reply } => {
            let result = match controller.request_submit() {
                Ok(_) => {
                    finalizer.drive(controller).await;
                    let snapshot = controller.snapshot();
                    publisher.send_replace(snapshot.clone());
                    Ok(snapshot)
                }
                Err(e) => Err(e),
            };
            let _ = reply.send(result);
        }
        Command::Refresh { reply } => {
            controller.tick();
            finalizer.drive(controller).await;
            let _ = reply.send(Ok(controller.snapshot()));
        }
        Command::Shutdown { reply } => {
            let _ = reply.send(Ok(()));
        }
    }
}
