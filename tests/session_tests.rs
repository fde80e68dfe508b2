// tests/session_tests.rs

mod common;

use std::time::Duration;

use common::{Backends, LEARNER, engine_config};
use exam_session::{
    config::EngineConfig,
    engine::{
        EngineError, Phase, SessionController, SessionRegistry,
        events::SessionEvent,
        runtime,
        violation::{MonitorOutcome, Signal},
    },
    models::{
        attempt::{Attempt, QuestionStatus, ViolationKind},
        exam_record::SubmissionCause,
    },
    store::{ShadowEntry, ShadowRecord},
};
use tokio::sync::broadcast;

async fn open(backends: &Backends, attempt_id: i64) -> SessionController {
    SessionController::open(attempt_id, LEARNER, &backends.deps(), engine_config())
        .await
        .expect("session should open")
}

fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn cached(selection: Vec<i64>) -> ShadowEntry {
    ShadowEntry {
        selection,
        visited: true,
        review: false,
        retained: None,
    }
}

#[tokio::test]
async fn open_derives_remaining_time_from_start() {
    // Arrange
    let backends = Backends::new();
    let id = backends.seed_attempt(1, LEARNER);
    backends.advance_secs(600);

    // Act
    let session = open(&backends, id).await;

    // Assert
    assert_eq!(session.phase(), Phase::Active);
    assert_eq!(session.remaining_seconds(), 3000);
    let snapshot = session.snapshot();
    assert!(snapshot.affordances.can_edit);
    assert!(snapshot.affordances.navigation_locked);
}

#[tokio::test]
async fn deadline_expires_exactly_once() {
    // Arrange
    let backends = Backends::new();
    let id = backends.seed_attempt(1, LEARNER);
    let mut session = open(&backends, id).await;
    let mut events = session.subscribe();

    // Act
    backends.advance_secs(3599);
    assert!(!session.tick());
    backends.advance_secs(1);
    let fired = session.tick();
    let fired_again = session.tick();

    // Assert
    assert!(fired);
    assert!(!fired_again);
    assert_eq!(session.remaining_seconds(), 0);
    assert_eq!(session.phase(), Phase::Submitting);

    let expirations = drain(&mut events)
        .into_iter()
        .filter(|e| *e == SessionEvent::DeadlineExpired)
        .count();
    assert_eq!(expirations, 1);

    let result = session.finalize().await.unwrap();
    assert_eq!(result.cause, SubmissionCause::Deadline);
    assert_eq!(session.phase(), Phase::Submitted);
}

#[tokio::test]
async fn resuming_past_deadline_submits_at_load() {
    // Arrange
    let backends = Backends::new();
    let id = backends.seed_attempt(1, LEARNER);
    backends.advance_secs(4000);

    // Act
    let session = open(&backends, id).await;

    // Assert
    let snapshot = session.snapshot();
    assert_eq!(snapshot.phase, Phase::Submitting);
    assert_eq!(snapshot.cause, Some(SubmissionCause::Deadline));
    assert_eq!(snapshot.remaining_seconds, 0);
    assert!(!snapshot.affordances.can_edit);
}

#[tokio::test]
async fn recovery_replays_cache_holding_more_answers() {
    // Arrange
    let backends = Backends::new();
    let mut attempt = Attempt::new(1, common::EXAM_ID, LEARNER, common::exam_start());
    attempt.answers.insert(1, vec![2]);
    attempt.answers.insert(2, vec![0]);
    attempt.question_status.insert(1, QuestionStatus::Answered);
    attempt.question_status.insert(2, QuestionStatus::Answered);
    backends.store.insert_attempt(attempt);

    let record: ShadowRecord = [
        (1, cached(vec![2])),
        (2, cached(vec![0, 2])),
        (3, cached(vec![42])),
        (4, cached(vec![1])),
        (5, cached(vec![3])),
    ]
    .into_iter()
    .collect();
    backends.cache.seed(1, record);

    // Act
    let session = open(&backends, 1).await;

    // Assert
    let stored = backends.store.attempt(1).unwrap();
    assert_eq!(stored.answered_count(), 5);
    assert_eq!(stored.answers.get(&2), Some(&vec![0, 2]));
    assert_eq!(session.status(5), QuestionStatus::Answered);
    assert_eq!(session.stored_answer(3), &[42]);
}

#[tokio::test]
async fn status_follows_precedence_through_review() {
    // Arrange
    let backends = Backends::new();
    let id = backends.seed_attempt(1, LEARNER);
    let mut session = open(&backends, id).await;

    // Act & Assert
    assert_eq!(session.visit(1).await, Ok(QuestionStatus::Visited));
    assert_eq!(
        session.set_answer(1, vec![1]).await,
        Ok(QuestionStatus::Answered)
    );
    assert_eq!(
        session.toggle_review(1).await,
        Ok(QuestionStatus::MarkedReview)
    );
    assert!(session.stored_answer(1).is_empty());
    assert_eq!(session.display_selection(1), Some(&[1][..]));

    assert_eq!(
        session.toggle_review(1).await,
        Ok(QuestionStatus::Answered)
    );
    assert_eq!(session.stored_answer(1), &[1]);
}

#[tokio::test]
async fn review_marked_answer_scores_zero() {
    // Arrange
    let backends = Backends::new();
    let id = backends.seed_attempt(1, LEARNER);
    let mut session = open(&backends, id).await;
    session.set_answer(1, vec![2]).await.unwrap();
    session.toggle_review(1).await.unwrap();

    // Act
    assert_eq!(session.request_submit(), Ok(true));
    let result = session.finalize().await.unwrap();

    // Assert
    assert_eq!(result.earned_marks, 0.0);
    assert_eq!(result.total_marks, 20.0);
    let physics = &result.subjects[0];
    assert_eq!(physics.review, 1);
    assert_eq!(physics.correct, 0);
}

#[tokio::test]
async fn partial_credit_and_negative_marking_add_up() {
    // Arrange
    let backends = Backends::new();
    let id = backends.seed_attempt(1, LEARNER);
    let mut session = open(&backends, id).await;

    session.set_answer(1, vec![2]).await.unwrap(); // +4
    session.set_answer(2, vec![2]).await.unwrap(); // +2
    session.set_answer(3, vec![41]).await.unwrap(); // -1
    session.set_answer(5, vec![3, 1]).await.unwrap(); // +4

    // Act
    session.request_submit().unwrap();
    let result = session.finalize().await.unwrap();

    // Assert
    assert_eq!(result.earned_marks, 9.0);
    assert!((result.score - 45.0).abs() < 1e-9);
    assert_eq!(result.subjects[0].earned_marks, 5.0);
    assert_eq!(result.subjects[0].partial, 1);
    assert_eq!(result.subjects[0].incorrect, 1);
    assert_eq!(result.subjects[1].correct, 1);
    assert_eq!(result.subjects[1].unanswered, 1);
}

#[tokio::test]
async fn submission_triggers_finalize_once() {
    // Arrange
    let backends = Backends::new();
    let id = backends.seed_attempt(1, LEARNER);
    let mut session = open(&backends, id).await;
    session.set_answer(1, vec![2]).await.unwrap();

    // Act
    assert_eq!(session.request_submit(), Ok(true));
    assert_eq!(session.request_submit(), Ok(false));
    assert!(!session.begin_submission(SubmissionCause::Deadline));
    for _ in 0..3 {
        session.observe_signal(Signal::VisibilityHidden).await;
    }
    backends.advance_secs(3601);
    assert!(!session.tick());

    let first = session.finalize().await.unwrap();
    let second = session.finalize().await.unwrap();

    // Assert
    assert_eq!(first, second);
    assert_eq!(first.cause, SubmissionCause::Learner);
    assert_eq!(backends.store.finalize_calls(), 1);
}

#[tokio::test]
async fn concurrent_submissions_through_runtime_finalize_once() {
    // Arrange
    let backends = Backends::new();
    let id = backends.seed_attempt(1, LEARNER);
    let session = open(&backends, id).await;
    let handle = runtime::spawn(session, &engine_config());

    // Act
    let (a, b, _) = tokio::join!(handle.submit(), handle.submit(), async {
        for _ in 0..3 {
            let _ = handle.observe(Signal::VisibilityHidden).await;
        }
    });

    // Assert
    assert_eq!(a.unwrap().phase, Phase::Submitted);
    assert_eq!(b.unwrap().phase, Phase::Submitted);
    assert_eq!(backends.store.finalize_calls(), 1);
    assert!(backends.store.attempt(id).unwrap().is_submitted);
}

#[tokio::test]
async fn failed_finalize_keeps_submitting_until_it_lands() {
    // Arrange
    let backends = Backends::new();
    let id = backends.seed_attempt(1, LEARNER);
    let mut session = open(&backends, id).await;
    session.set_answer(4, vec![1]).await.unwrap();
    backends.store.fail_next_finalizes(2);

    // Act
    session.request_submit().unwrap();
    let first = session.finalize().await;

    // Assert
    assert!(matches!(first, Err(EngineError::TransientStore(_))));
    assert_eq!(session.phase(), Phase::Submitting);
    assert!(session.snapshot().result.is_none());
    assert!(matches!(
        session.set_answer(4, vec![0]).await,
        Err(EngineError::InvalidState(_))
    ));

    assert!(session.finalize().await.is_err());
    let result = session.finalize().await.unwrap();

    assert_eq!(session.phase(), Phase::Submitted);
    assert_eq!(result.earned_marks, 4.0);
    assert_eq!(backends.store.finalize_calls(), 3);
    assert_eq!(backends.store.attempt(id).unwrap().result, Some(result));
    assert!(backends.cache.record(id).is_none());
}

#[tokio::test(start_paused = true)]
async fn runtime_retries_finalize_in_background() {
    // Arrange
    let backends = Backends::new();
    let id = backends.seed_attempt(1, LEARNER);
    let session = open(&backends, id).await;
    let handle = runtime::spawn(session, &engine_config());
    backends.store.fail_next_finalizes(3);

    // Act
    let snapshot = handle.submit().await.unwrap();
    assert_eq!(snapshot.phase, Phase::Submitting);

    for _ in 0..50 {
        if handle.snapshot().phase == Phase::Submitted {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Assert
    assert_eq!(handle.snapshot().phase, Phase::Submitted);
    assert_eq!(backends.store.finalize_calls(), 4);
    assert!(backends.store.attempt(id).unwrap().is_submitted);
}

#[tokio::test(start_paused = true)]
async fn failed_save_rolls_back_and_flags_question() {
    // Arrange
    let backends = Backends::new();
    let id = backends.seed_attempt(1, LEARNER);
    let mut session = open(&backends, id).await;
    let mut events = session.subscribe();
    backends.store.fail_next_saves(3);

    // Act
    let failed = session.set_answer(1, vec![2]).await;

    // Assert
    assert!(matches!(failed, Err(EngineError::TransientStore(_))));
    assert_eq!(session.status(1), QuestionStatus::NotVisited);
    assert_eq!(session.snapshot().unsaved_question, Some(1));
    assert!(
        drain(&mut events)
            .iter()
            .any(|e| matches!(e, SessionEvent::SaveFailed { question_id: 1, .. }))
    );

    assert_eq!(
        session.set_answer(1, vec![2]).await,
        Ok(QuestionStatus::Answered)
    );
    assert_eq!(session.snapshot().unsaved_question, None);
}

#[tokio::test]
async fn third_tab_switch_forces_submission() {
    // Arrange
    let backends = Backends::new();
    let id = backends.seed_attempt(1, LEARNER);
    let mut session = open(&backends, id).await;

    // Act
    let first = session.observe_signal(Signal::VisibilityHidden).await;
    let second = session.observe_signal(Signal::VisibilityHidden).await;
    let third = session.observe_signal(Signal::VisibilityHidden).await;
    let fourth = session.observe_signal(Signal::VisibilityHidden).await;

    // Assert
    assert_eq!(first.warning.map(|w| w.count), Some(1));
    assert_eq!(first.force_submit, None);
    assert_eq!(second.warning.map(|w| w.count), Some(2));
    assert_eq!(third.force_submit, Some(ViolationKind::TabSwitch));
    assert_eq!(fourth, MonitorOutcome::default());

    let snapshot = session.snapshot();
    assert_eq!(snapshot.phase, Phase::Submitting);
    assert_eq!(
        snapshot.cause,
        Some(SubmissionCause::Violation {
            kind: ViolationKind::TabSwitch
        })
    );
    assert_eq!(snapshot.violation_counts.tab_switch, 3);
    assert!(snapshot.flags.violation_warning_visible);

    let stored = backends.store.attempt(id).unwrap();
    assert_eq!(stored.violation_counts.tab_switch, 3);
}

#[tokio::test]
async fn rotation_on_handheld_is_not_a_tab_switch() {
    // Arrange
    let backends = Backends::new();
    let id = backends.seed_attempt(1, LEARNER);
    let mut session = open(&backends, id).await;

    // Act
    session
        .observe_signal(Signal::OrientationChanged { handheld: true })
        .await;
    let outcome = session.observe_signal(Signal::VisibilityHidden).await;

    // Assert
    assert_eq!(outcome.warning, None);
    assert_eq!(session.violation_counts().tab_switch, 0);
}

#[tokio::test]
async fn leaving_fullscreen_asks_to_restore_it() {
    // Arrange
    let backends = Backends::new();
    let id = backends.seed_attempt(1, LEARNER);
    let mut session = open(&backends, id).await;
    session.observe_signal(Signal::FullscreenEntered).await;
    assert!(session.snapshot().flags.within_distraction_free_mode);

    // Act
    let outcome = session
        .observe_signal(Signal::FullscreenExited {
            user_initiated: false,
        })
        .await;

    // Assert
    assert!(outcome.restore_distraction_free_mode);
    assert_eq!(outcome.warning.map(|w| w.kind), Some(ViolationKind::Escape));
    let snapshot = session.snapshot();
    assert!(!snapshot.flags.within_distraction_free_mode);
    assert!(snapshot.affordances.prompt_fullscreen);

    session.dismiss_warning();
    assert!(!session.snapshot().flags.violation_warning_visible);
}

#[tokio::test]
async fn breached_counts_on_resume_force_submission() {
    // Arrange
    let backends = Backends::new();
    let mut attempt = Attempt::new(1, common::EXAM_ID, LEARNER, common::exam_start());
    attempt.violation_counts.navigation = 3;
    backends.store.insert_attempt(attempt);

    // Act
    let session = open(&backends, 1).await;

    // Assert
    assert_eq!(session.phase(), Phase::Submitting);
    assert_eq!(
        session.snapshot().cause,
        Some(SubmissionCause::Violation {
            kind: ViolationKind::Navigation
        })
    );
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    // Arrange
    let backends = Backends::new();
    let id = backends.seed_attempt(1, LEARNER);
    let mut session = open(&backends, id).await;

    // Act & Assert
    assert!(matches!(
        session.set_answer(1, vec![0, 1]).await,
        Err(EngineError::BadRequest(_))
    ));
    assert!(matches!(
        session.set_answer(2, vec![9]).await,
        Err(EngineError::BadRequest(_))
    ));
    assert!(matches!(
        session.visit(99).await,
        Err(EngineError::NotFound(_))
    ));
    assert_eq!(backends.store.save_calls(), 0);
}

#[tokio::test]
async fn open_checks_owner_and_submission() {
    // Arrange
    let backends = Backends::new();
    let id = backends.seed_attempt(1, LEARNER);

    // Act
    let stranger =
        SessionController::open(id, LEARNER + 1, &backends.deps(), engine_config()).await;

    let mut session = open(&backends, id).await;
    session.request_submit().unwrap();
    session.finalize().await.unwrap();
    let reopened = SessionController::open(id, LEARNER, &backends.deps(), engine_config()).await;

    // Assert
    assert!(matches!(stranger, Err(EngineError::Forbidden(_))));
    assert!(matches!(reopened, Err(EngineError::InvalidState(_))));
}

#[tokio::test]
async fn registry_keeps_one_session_per_attempt() {
    // Arrange
    let backends = Backends::new();
    let id = backends.seed_attempt(1, LEARNER);
    let registry = SessionRegistry::new(backends.deps(), engine_config());

    // Act
    let first = registry.open(id, LEARNER).await.unwrap();
    first.set_answer(1, vec![2]).await.unwrap();
    let second = registry.open(id, LEARNER).await.unwrap();
    let stranger = registry.get(id, LEARNER + 1).await;

    // Assert
    assert_eq!(second.refresh().await.selections.get(&1), Some(&vec![2]));
    assert_eq!(registry.len().await, 1);
    assert!(matches!(stranger, Err(EngineError::Forbidden(_))));

    registry.dispose(id, LEARNER).await.unwrap();
    assert_eq!(registry.len().await, 0);
    assert!(matches!(
        first.set_answer(1, vec![1]).await,
        Err(EngineError::InvalidState(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn dispose_while_submitting_keeps_score_and_blocks_reentry() {
    // Arrange
    let backends = Backends::new();
    let id = backends.seed_attempt(1, LEARNER);
    let registry = SessionRegistry::new(backends.deps(), engine_config());
    let handle = registry.open(id, LEARNER).await.unwrap();
    handle.set_answer(1, vec![2]).await.unwrap();
    backends.store.fail_next_finalizes(5);
    assert_eq!(handle.submit().await.unwrap().phase, Phase::Submitting);

    // Act
    registry.dispose(id, LEARNER).await.unwrap();
    let reopened = registry.open(id, LEARNER).await.unwrap();

    // Assert: same submission, still retrying, nothing editable
    let snapshot = reopened.snapshot();
    assert_eq!(snapshot.phase, Phase::Submitting);
    assert_eq!(snapshot.cause, Some(SubmissionCause::Learner));
    assert!(!snapshot.affordances.can_edit);
    assert!(matches!(
        reopened.set_answer(1, vec![0]).await,
        Err(EngineError::InvalidState(_))
    ));

    for _ in 0..100 {
        if registry.len().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let stored = backends.store.attempt(id).unwrap();
    assert!(stored.is_submitted);
    assert_eq!(stored.result.map(|r| r.earned_marks), Some(4.0));
    assert_eq!(backends.store.finalize_calls(), 6);
    assert_eq!(registry.len().await, 0);
    assert!(matches!(
        registry.open(id, LEARNER).await,
        Err(EngineError::InvalidState(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn dropped_handles_do_not_abandon_a_submission() {
    // Arrange
    let backends = Backends::new();
    let id = backends.seed_attempt(1, LEARNER);
    let session = open(&backends, id).await;
    let handle = runtime::spawn(session, &engine_config());
    backends.store.fail_next_finalizes(2);
    assert_eq!(handle.submit().await.unwrap().phase, Phase::Submitting);

    // Act
    drop(handle);
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Assert
    assert!(backends.store.attempt(id).unwrap().is_submitted);
    assert_eq!(backends.store.finalize_calls(), 3);
}

#[tokio::test]
async fn registry_releases_sessions_once_submitted() {
    // Arrange
    let backends = Backends::new();
    let id = backends.seed_attempt(1, LEARNER);
    let registry = SessionRegistry::new(backends.deps(), engine_config());
    let handle = registry.open(id, LEARNER).await.unwrap();

    // Act
    let snapshot = handle.submit().await.unwrap();
    handle.closed().await;
    for _ in 0..50 {
        if registry.len().await == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }

    // Assert
    assert_eq!(snapshot.phase, Phase::Submitted);
    assert_eq!(registry.len().await, 0);
    assert!(matches!(
        registry.get(id, LEARNER).await,
        Err(EngineError::InvalidState(_))
    ));
    assert!(matches!(
        registry.get(id, LEARNER + 1).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        registry.open(id, LEARNER).await,
        Err(EngineError::InvalidState(_))
    ));
}

#[tokio::test]
async fn concurrent_opens_share_one_session() {
    // Arrange
    let backends = Backends::new();
    let id = backends.seed_attempt(1, LEARNER);
    let other = backends.seed_attempt(2, LEARNER + 1);
    let registry = SessionRegistry::new(backends.deps(), engine_config());

    // Act
    let (a, b, c) = tokio::join!(
        registry.open(id, LEARNER),
        registry.open(id, LEARNER),
        registry.open(other, LEARNER + 1)
    );
    a.unwrap().set_answer(1, vec![2]).await.unwrap();

    // Assert
    assert_eq!(b.unwrap().refresh().await.selections.get(&1), Some(&vec![2]));
    assert_eq!(c.unwrap().snapshot().phase, Phase::Active);
    assert_eq!(registry.len().await, 2);
}

#[tokio::test]
async fn failed_open_leaves_no_entry_behind() {
    // Arrange
    let backends = Backends::new();
    let registry = SessionRegistry::new(backends.deps(), engine_config());

    // Act
    let missing = registry.open(404, LEARNER).await;

    // Assert
    assert!(matches!(missing, Err(EngineError::NotFound(_))));
    assert_eq!(registry.len().await, 0);
}

#[tokio::test]
async fn reconcile_reasserts_deadline_and_sealed_state() {
    // Arrange
    let backends = Backends::new();
    let id = backends.seed_attempt(1, LEARNER);
    let mut session = open(&backends, id).await;
    assert!(!session.reconcile());

    // Act
    backends.advance_secs(3600);
    let expired = session.reconcile();

    // Assert
    assert!(expired);
    assert_eq!(session.phase(), Phase::Submitting);
    assert_eq!(session.snapshot().cause, Some(SubmissionCause::Deadline));
    assert!(!session.reconcile());
}

#[tokio::test(start_paused = true)]
async fn reconcile_interval_submits_on_deadline_between_ticks() {
    // Arrange
    let backends = Backends::new();
    let id = backends.seed_attempt(1, LEARNER);
    let config = EngineConfig {
        tick_interval: Duration::from_secs(3600),
        reconcile_interval: Duration::from_millis(50),
        ..engine_config()
    };
    let session = SessionController::open(id, LEARNER, &backends.deps(), config.clone())
        .await
        .unwrap();
    let handle = runtime::spawn(session, &config);
    // Both intervals fire once at start.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(handle.snapshot().phase, Phase::Active);

    // Act
    backends.advance_secs(3600);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Assert
    let snapshot = handle.snapshot();
    assert_eq!(snapshot.phase, Phase::Submitted);
    assert_eq!(snapshot.cause, Some(SubmissionCause::Deadline));
    assert_eq!(backends.store.finalize_calls(), 1);
}
