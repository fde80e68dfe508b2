// src/engine/violation.rs

//! Advisory anti-cheating monitor.
//!
//! Every signal here comes from an environment the learner controls, so the
//! monitor is a deterrent and not a security boundary: it counts what the
//! client reports and feeds threshold breaches into the same forced
//! submission path as the deadline.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::attempt::{ViolationCounts, ViolationKind};

/// Environment event reported by the exam client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    /// The exam page became hidden (tab or window switch).
    VisibilityHidden,
    /// Back/forward navigation was attempted.
    NavigationAttempt,
    FullscreenEntered,
    FullscreenExited {
        /// Set when the learner used the exam's own toggle.
        #[serde(default)]
        user_initiated: bool,
    },
    KeyPressed {
        key: String,
        #[serde(default)]
        ctrl: bool,
        #[serde(default)]
        alt: bool,
        #[serde(default)]
        meta: bool,
        /// Focus is in a text input, where Backspace edits instead of
        /// navigating back.
        #[serde(default)]
        editing: bool,
    },
    OrientationChanged {
        #[serde(default)]
        handheld: bool,
    },
}

/// Maps a key chord on the denylist to the counter it feeds.
pub fn classify_key(
    key: &str,
    ctrl: bool,
    alt: bool,
    meta: bool,
    editing: bool,
) -> Option<ViolationKind> {
    let key = key.to_ascii_lowercase();
    match key.as_str() {
        "escape" | "esc" | "f11" => Some(ViolationKind::Escape),
        "f5" | "browserback" | "browserforward" => Some(ViolationKind::Navigation),
        "backspace" if !editing => Some(ViolationKind::Navigation),
        "r" if ctrl || meta => Some(ViolationKind::Navigation),
        "arrowleft" | "arrowright" if alt => Some(ViolationKind::Navigation),
        "tab" if alt || meta => Some(ViolationKind::TabSwitch),
        "meta" | "os" => Some(ViolationKind::TabSwitch),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationWarning {
    pub kind: ViolationKind,
    pub count: u32,
    pub threshold: u32,
}

/// What the caller should do after a signal was observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MonitorOutcome {
    pub warning: Option<ViolationWarning>,
    /// Set on the single signal that first reaches a threshold.
    pub force_submit: Option<ViolationKind>,
    /// Best-effort request to re-enter fullscreen / undo the navigation.
    pub restore_distraction_free_mode: bool,
    /// New fullscreen state, when the signal reports one.
    pub fullscreen: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ViolationMonitor {
    counts: ViolationCounts,
    threshold: u32,
    orientation_grace: Duration,
    last_rotation: Option<DateTime<Utc>>,
    forced: bool,
    armed: bool,
}

impl ViolationMonitor {
    /// `counts` carries over from a resumed attempt; they are only ever
    /// zeroed when the attempt is created.
    pub fn new(counts: ViolationCounts, threshold: u32, orientation_grace: Duration) -> Self {
        Self {
            counts,
            threshold: threshold.max(1),
            orientation_grace,
            last_rotation: None,
            forced: false,
            armed: true,
        }
    }

    pub fn counts(&self) -> ViolationCounts {
        self.counts
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Stops counting. Called once the session leaves the active state.
    pub fn disarm(&mut self) {
        self.armed = false;
    }

    /// A counter already at its threshold, e.g. after a crash between the
    /// breach and the submission.
    pub fn breached(&self) -> Option<ViolationKind> {
        ViolationKind::ALL
            .into_iter()
            .find(|&kind| self.counts.get(kind) >= self.threshold)
    }

    /// Claims the forced submission for an already-breached counter.
    pub fn take_breach(&mut self) -> Option<ViolationKind> {
        if self.forced {
            return None;
        }
        let kind = self.breached()?;
        self.forced = true;
        Some(kind)
    }

    pub fn observe(&mut self, signal: &Signal, now: DateTime<Utc>) -> MonitorOutcome {
        let mut outcome = MonitorOutcome::default();

        let kind = match signal {
            Signal::OrientationChanged { handheld } => {
                if *handheld {
                    self.last_rotation = Some(now);
                }
                return outcome;
            }
            Signal::FullscreenEntered => {
                outcome.fullscreen = Some(true);
                return outcome;
            }
            Signal::FullscreenExited { user_initiated } => {
                outcome.fullscreen = Some(false);
                if *user_initiated {
                    return outcome;
                }
                ViolationKind::Escape
            }
            Signal::VisibilityHidden => {
                if self.within_rotation_grace(now) {
                    tracing::debug!("Ignoring visibility loss caused by device rotation");
                    return outcome;
                }
                ViolationKind::TabSwitch
            }
            Signal::NavigationAttempt => ViolationKind::Navigation,
            Signal::KeyPressed {
                key,
                ctrl,
                alt,
                meta,
                editing,
            } => match classify_key(key, *ctrl, *alt, *meta, *editing) {
                Some(kind) => kind,
                None => return outcome,
            },
        };

        if !self.armed {
            return outcome;
        }

        outcome.restore_distraction_free_mode =
            matches!(kind, ViolationKind::Escape | ViolationKind::Navigation);

        let count = self.counts.increment(kind);
        outcome.warning = Some(ViolationWarning {
            kind,
            count,
            threshold: self.threshold,
        });

        if count >= self.threshold && !self.forced {
            self.forced = true;
            outcome.force_submit = Some(kind);
        }

        outcome
    }

    fn within_rotation_grace(&self, now: DateTime<Utc>) -> bool {
        match self.last_rotation {
            Some(at) => now >= at && now - at <= self.orientation_grace,
            None => false,
        }
    }
}
