// src/engine/ledger.rs

//! In-memory answer sheet of one attempt, mirrored to the durable store and
//! the shadow cache.
//!
//! Every mutation works on a single question: the new entry is applied in
//! memory, shadowed locally, then persisted. If persistence fails the entry
//! is restored to exactly what it was before the call. The shadow keeps the
//! new value so a later session can resync it.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use crate::{
    config::EngineConfig,
    engine::{
        error::EngineError,
        retry::{Backoff, with_retry},
    },
    models::attempt::{Attempt, QuestionStatus},
    store::{AnswerStore, ShadowCache, ShadowEntry, ShadowRecord, shadow_answer_count},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Entry {
    /// Score-bearing selection. Always empty while under review.
    answer: Vec<i64>,
    visited: bool,
    review: bool,
    /// Selection hidden by a review mark, restored on unmark.
    retained: Option<Vec<i64>>,
}

impl Entry {
    fn status(&self) -> QuestionStatus {
        if self.review {
            QuestionStatus::MarkedReview
        } else if !self.answer.is_empty() {
            QuestionStatus::Answered
        } else if self.visited {
            QuestionStatus::Visited
        } else {
            QuestionStatus::NotVisited
        }
    }

    fn shadow(&self) -> ShadowEntry {
        ShadowEntry {
            selection: self.answer.clone(),
            visited: self.visited,
            review: self.review,
            retained: self.retained.clone(),
        }
    }

    fn display(&self) -> Option<&[i64]> {
        let shown = if self.review {
            self.retained.as_deref()?
        } else {
            self.answer.as_slice()
        };
        (!shown.is_empty()).then_some(shown)
    }
}

/// Outcome of reconciling the shadow cache against the store on (re)start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub store_answers: usize,
    pub cached_answers: usize,
    /// Whether the cache held more answers and was replayed.
    pub cache_won: bool,
    pub replayed: usize,
    pub failed: usize,
}

pub struct AnswerLedger {
    attempt_id: i64,
    entries: HashMap<i64, Entry>,
    store: Arc<dyn AnswerStore>,
    cache: Arc<dyn ShadowCache>,
    retries: u32,
    backoff: Backoff,
    timeout: Duration,
    sealed: bool,
}

impl AnswerLedger {
    pub fn new(
        attempt_id: i64,
        store: Arc<dyn AnswerStore>,
        cache: Arc<dyn ShadowCache>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            attempt_id,
            entries: HashMap::new(),
            store,
            cache,
            retries: config.save_retries,
            backoff: Backoff::from_config(config),
            timeout: config.store_timeout,
            sealed: false,
        }
    }

    /// Derived with precedence marked-review > answered > visited > not-visited.
    pub fn status(&self, question_id: i64) -> QuestionStatus {
        self.entries
            .get(&question_id)
            .map(Entry::status)
            .unwrap_or(QuestionStatus::NotVisited)
    }

    /// The score-bearing selection (empty when unanswered or under review).
    pub fn stored_answer(&self, question_id: i64) -> &[i64] {
        self.entries
            .get(&question_id)
            .map(|e| e.answer.as_slice())
            .unwrap_or(&[])
    }

    /// What the learner last selected, including selections hidden by review.
    pub fn display_selection(&self, question_id: i64) -> Option<&[i64]> {
        self.entries.get(&question_id).and_then(Entry::display)
    }

    /// Non-empty stored answers.
    pub fn answers(&self) -> HashMap<i64, Vec<i64>> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.answer.is_empty())
            .map(|(&q, e)| (q, e.answer.clone()))
            .collect()
    }

    pub fn statuses(&self) -> HashMap<i64, QuestionStatus> {
        self.entries.iter().map(|(&q, e)| (q, e.status())).collect()
    }

    pub fn display_selections(&self) -> HashMap<i64, Vec<i64>> {
        self.entries
            .iter()
            .filter_map(|(&q, e)| e.display().map(|s| (q, s.to_vec())))
            .collect()
    }

    pub fn answered_count(&self) -> usize {
        self.entries.values().filter(|e| !e.answer.is_empty()).count()
    }

    /// Refuses all further mutation. Called when submission starts.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub async fn visit(&mut self, question_id: i64) -> Result<QuestionStatus, EngineError> {
        let mut next = self.entry(question_id);
        if next.visited {
            return Ok(next.status());
        }
        next.visited = true;
        self.commit(question_id, next).await
    }

    /// Stores a selection. While the question is marked for review the
    /// selection is only retained for redisplay and the stored answer stays
    /// empty.
    pub async fn set_answer(
        &mut self,
        question_id: i64,
        selection: Vec<i64>,
    ) -> Result<QuestionStatus, EngineError> {
        let mut next = self.entry(question_id);
        next.visited = true;
        if next.review {
            next.retained = (!selection.is_empty()).then_some(selection);
            next.answer.clear();
        } else {
            next.answer = selection;
        }
        self.commit(question_id, next).await
    }

    /// Clears the selection. A review mark survives the reset.
    pub async fn reset_answer(&mut self, question_id: i64) -> Result<QuestionStatus, EngineError> {
        let mut next = self.entry(question_id);
        next.visited = true;
        next.answer.clear();
        next.retained = None;
        self.commit(question_id, next).await
    }

    pub async fn toggle_review(&mut self, question_id: i64) -> Result<QuestionStatus, EngineError> {
        let mut next = self.entry(question_id);
        next.visited = true;

        if next.review {
            next.review = false;
            if let Some(selection) = next.retained.take() {
                next.answer = selection;
            }
        } else {
            next.review = true;
            if !next.answer.is_empty() {
                next.retained = Some(std::mem::take(&mut next.answer));
            }
        }

        self.commit(question_id, next).await
    }

    /// Loads the store's copy, then reconciles it with the shadow cache.
    ///
    /// When the cache holds strictly more answers than the store, every
    /// cached answer is replayed through `set_answer` so the store catches
    /// up. Otherwise the store's copy stands. Questions rejected by
    /// `is_known` are ignored.
    pub async fn recover(
        &mut self,
        attempt: &Attempt,
        is_known: impl Fn(i64) -> bool,
    ) -> RecoveryReport {
        self.entries.clear();

        for (&question_id, &status) in &attempt.question_status {
            if !is_known(question_id) {
                continue;
            }
            let entry = self.entries.entry(question_id).or_default();
            entry.visited = status != QuestionStatus::NotVisited;
            entry.review = status == QuestionStatus::MarkedReview;
        }
        for (&question_id, selection) in &attempt.answers {
            if selection.is_empty() || !is_known(question_id) {
                continue;
            }
            let entry = self.entries.entry(question_id).or_default();
            entry.visited = true;
            if entry.review {
                entry.retained = Some(selection.clone());
            } else {
                entry.answer = selection.clone();
            }
        }

        let shadow = match self.cache.read_shadow(self.attempt_id) {
            Ok(shadow) => shadow,
            Err(e) => {
                tracing::warn!(
                    "Shadow cache unreadable for attempt {}, continuing without it: {}",
                    self.attempt_id,
                    e
                );
                Default::default()
            }
        };
        let shadow: ShadowRecord = shadow
            .into_iter()
            .filter(|(q, _)| is_known(*q))
            .collect();

        for (&question_id, cached) in &shadow {
            let entry = self.entries.entry(question_id).or_default();
            entry.visited |= cached.visited;
            if entry.review && entry.retained.is_none() {
                entry.retained = cached.retained.clone();
            }
        }

        let mut report = RecoveryReport {
            store_answers: self.answered_count(),
            cached_answers: shadow_answer_count(&shadow),
            ..Default::default()
        };

        if report.cached_answers <= report.store_answers {
            if report.cached_answers != 0 || report.store_answers != 0 {
                tracing::debug!(
                    "Attempt {}: store holds {} answers, cache {}; keeping store copy",
                    self.attempt_id,
                    report.store_answers,
                    report.cached_answers
                );
            }
            return report;
        }

        tracing::warn!(
            "Attempt {}: cache holds {} answers but store only {}; replaying cache",
            self.attempt_id,
            report.cached_answers,
            report.store_answers
        );
        report.cache_won = true;

        let ordered: BTreeMap<i64, ShadowEntry> = shadow.into_iter().collect();
        for (question_id, cached) in ordered {
            if cached.selection.is_empty() {
                continue;
            }
            match self.set_answer(question_id, cached.selection).await {
                Ok(_) => report.replayed += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        "Attempt {}: replay of question {} failed: {}",
                        self.attempt_id,
                        question_id,
                        e
                    );
                }
            }
        }

        report
    }

    fn entry(&self, question_id: i64) -> Entry {
        self.entries.get(&question_id).cloned().unwrap_or_default()
    }

    async fn commit(
        &mut self,
        question_id: i64,
        next: Entry,
    ) -> Result<QuestionStatus, EngineError> {
        if self.sealed {
            return Err(EngineError::InvalidState(
                "attempt is being submitted".to_string(),
            ));
        }

        let previous = self.entries.insert(question_id, next.clone());
        let status = next.status();

        if let Err(e) = self
            .cache
            .write_shadow(self.attempt_id, question_id, &next.shadow())
        {
            tracing::warn!(
                "Shadow write failed for attempt {} question {}: {}",
                self.attempt_id,
                question_id,
                e
            );
        }

        let attempt_id = self.attempt_id;
        let store = &self.store;
        let selection = &next.answer;
        let saved = with_retry(
            "save answer",
            self.retries,
            self.backoff,
            self.timeout,
            || store.save_answer(attempt_id, question_id, selection, status),
        )
        .await;

        match saved {
            Ok(()) => Ok(status),
            Err(e) => {
                tracing::error!(
                    "Answer save failed for attempt {} question {}, rolled back: {}",
                    attempt_id,
                    question_id,
                    e
                );
                match previous {
                    Some(previous) => self.entries.insert(question_id, previous),
                    None => self.entries.remove(&question_id),
                };
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryAnswerStore, MemoryShadowCache};
    use chrono::Utc;

    struct Fixture {
        store: Arc<MemoryAnswerStore>,
        cache: Arc<MemoryShadowCache>,
        ledger: AnswerLedger,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryAnswerStore::new());
        store.insert_attempt(Attempt::new(1, 1, 7, Utc::now()));
        let cache = Arc::new(MemoryShadowCache::new());
        let config = EngineConfig {
            retry_base: Duration::from_millis(10),
            ..Default::default()
        };
        let ledger = AnswerLedger::new(1, store.clone(), cache.clone(), &config);
        Fixture {
            store,
            cache,
            ledger,
        }
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
    async fn test_status_follows_precedence() {
        let mut f = fixture();

        assert_eq!(f.ledger.status(10), QuestionStatus::NotVisited);
        assert_eq!(f.ledger.visit(10).await, Ok(QuestionStatus::Visited));
        assert_eq!(
            f.ledger.set_answer(10, vec![1]).await,
            Ok(QuestionStatus::Answered)
        );
        assert_eq!(
            f.ledger.toggle_review(10).await,
            Ok(QuestionStatus::MarkedReview)
        );
        assert!(f.ledger.stored_answer(10).is_empty());
        assert_eq!(f.ledger.display_selection(10), Some(&[1][..]));

        assert_eq!(
            f.ledger.toggle_review(10).await,
            Ok(QuestionStatus::Answered)
        );
        assert_eq!(f.ledger.stored_answer(10), &[1]);

        let stored = f.store.attempt(1).unwrap();
        assert_eq!(stored.answers.get(&10), Some(&vec![1]));
        assert_eq!(
            stored.question_status.get(&10),
            Some(&QuestionStatus::Answered)
        );
    }

    #[tokio::test]
    async fn test_answer_under_review_is_only_retained() {
        let mut f = fixture();

        f.ledger.toggle_review(4).await.unwrap();
        let status = f.ledger.set_answer(4, vec![2]).await.unwrap();

        assert_eq!(status, QuestionStatus::MarkedReview);
        assert!(f.ledger.answers().is_empty());
        assert_eq!(f.ledger.display_selection(4), Some(&[2][..]));
        assert_eq!(f.store.attempt(1).unwrap().answers.get(&4), Some(&vec![]));
    }

    #[tokio::test]
    async fn test_reset_keeps_review_mark() {
        let mut f = fixture();

        f.ledger.set_answer(4, vec![2]).await.unwrap();
        f.ledger.toggle_review(4).await.unwrap();
        assert_eq!(
            f.ledger.reset_answer(4).await,
            Ok(QuestionStatus::MarkedReview)
        );
        assert_eq!(f.ledger.display_selection(4), None);

        assert_eq!(f.ledger.toggle_review(4).await, Ok(QuestionStatus::Visited));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_save_rolls_back() {
        let mut f = fixture();
        f.ledger.set_answer(3, vec![0]).await.unwrap();

        f.store.fail_next_saves(3);
        let result = f.ledger.set_answer(3, vec![1]).await;

        assert!(matches!(result, Err(EngineError::TransientStore(_))));
        assert_eq!(f.ledger.stored_answer(3), &[0]);
        assert_eq!(f.ledger.status(3), QuestionStatus::Answered);
        assert_eq!(f.store.attempt(1).unwrap().answers.get(&3), Some(&vec![0]));

        // The shadow keeps the newer value for a later resync.
        let shadow = f.cache.record(1).unwrap();
        assert_eq!(shadow.get(&3).map(|e| e.selection.clone()), Some(vec![1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_first_touch_leaves_no_entry() {
        let mut f = fixture();
        f.store.fail_next_saves(3);

        assert!(f.ledger.visit(8).await.is_err());
        assert_eq!(f.ledger.status(8), QuestionStatus::NotVisited);
        assert!(f.ledger.statuses().is_empty());
    }

    #[tokio::test]
    async fn test_cache_with_more_answers_is_replayed() {
        let f = fixture();
        let mut attempt = f.store.attempt(1).unwrap();
        attempt.answers.insert(1, vec![0]);
        attempt.answers.insert(2, vec![1]);
        attempt.question_status.insert(1, QuestionStatus::Answered);
        attempt.question_status.insert(2, QuestionStatus::Answered);
        f.store.insert_attempt(attempt.clone());

        let record: ShadowRecord = (1..=5).map(|q| (q, cached(vec![q % 4]))).collect();
        f.cache.seed(1, record);

        let mut ledger = f.ledger;
        let report = ledger.recover(&attempt, |_| true).await;

        assert!(report.cache_won);
        assert_eq!(report.store_answers, 2);
        assert_eq!(report.cached_answers, 5);
        assert_eq!(report.replayed, 5);
        assert_eq!(ledger.answered_count(), 5);
        assert_eq!(f.store.attempt(1).unwrap().answered_count(), 5);
    }

    #[tokio::test]
    async fn test_store_wins_when_cache_is_not_ahead() {
        let f = fixture();
        let mut attempt = f.store.attempt(1).unwrap();
        attempt.answers.insert(1, vec![0]);
        attempt.answers.insert(2, vec![1]);
        f.store.insert_attempt(attempt.clone());
        f.cache.seed(1, [(1, cached(vec![3]))].into_iter().collect());

        let mut ledger = f.ledger;
        let report = ledger.recover(&attempt, |_| true).await;

        assert!(!report.cache_won);
        assert_eq!(ledger.stored_answer(1), &[0]);
        assert_eq!(f.store.save_calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_questions_are_ignored_on_recovery() {
        let f = fixture();
        let attempt = f.store.attempt(1).unwrap();
        f.cache.seed(1, [(99, cached(vec![1]))].into_iter().collect());

        let mut ledger = f.ledger;
        let report = ledger.recover(&attempt, |q| q != 99).await;

        assert_eq!(report.cached_answers, 0);
        assert_eq!(ledger.status(99), QuestionStatus::NotVisited);
    }

    #[tokio::test]
    async fn test_sealed_ledger_rejects_mutation() {
        let mut f = fixture();
        f.ledger.seal();

        let result = f.ledger.set_answer(1, vec![0]).await;
        assert!(matches!(result, Err(EngineError::InvalidState(_))));
        assert_eq!(f.store.save_calls(), 0);
    }
}
