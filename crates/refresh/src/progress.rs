//! Progress record of a refresh run and its transition rules.
//!
//! ```text
//! None -> Scheduled -> Processing -> Saving -> Completed
//!            \             \           \
//!             `-------------`-----------`----> Failed
//! ```
//!
//! `Processing` and `Saving` accept repeated running-total updates. Terminal
//! records never change again.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use refsync_core::{CorrelationId, MessageId, Subject};

use crate::error::RefreshError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    None,
    Scheduled,
    Processing,
    Saving,
    Completed,
    Failed,
}

impl RefreshStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RefreshStatus::None => "none",
            RefreshStatus::Scheduled => "scheduled",
            RefreshStatus::Processing => "processing",
            RefreshStatus::Saving => "saving",
            RefreshStatus::Completed => "completed",
            RefreshStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RefreshStatus::Completed | RefreshStatus::Failed)
    }

    /// No work is expected to happen in this status.
    pub fn is_quiescent(self) -> bool {
        matches!(self, RefreshStatus::None) || self.is_terminal()
    }
}

impl core::fmt::Display for RefreshStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A requested change to a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Schedule,
    Process,
    /// Running total of rows downloaded.
    Download { count: u64 },
    /// Running total of rows saved.
    Save { count: u64 },
    Complete { affected: u64 },
    Fail { error: String },
}

impl Transition {
    /// Status the record is in after the transition.
    pub fn target(&self) -> RefreshStatus {
        match self {
            Transition::Schedule => RefreshStatus::Scheduled,
            Transition::Process | Transition::Download { .. } => RefreshStatus::Processing,
            Transition::Save { .. } => RefreshStatus::Saving,
            Transition::Complete { .. } => RefreshStatus::Completed,
            Transition::Fail { .. } => RefreshStatus::Failed,
        }
    }
}

/// Result of applying a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Updated(RefreshProgress),
    /// Same transition delivered again by the same message.
    Replayed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshProgress {
    correlation_id: CorrelationId,
    subject: Subject,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message_id: Option<MessageId>,
    status: RefreshStatus,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    downloaded_count: u64,
    saved_count: u64,
    #[serde(default)]
    error_message: String,
}

impl RefreshProgress {
    /// Fresh record in `None`.
    pub fn new(subject: Subject, correlation_id: CorrelationId, now: DateTime<Utc>) -> Self {
        Self {
            correlation_id,
            subject,
            message_id: None,
            status: RefreshStatus::None,
            started_at: now,
            updated_at: now,
            downloaded_count: 0,
            saved_count: 0,
            error_message: String::new(),
        }
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    /// Message that produced the current state.
    pub fn message_id(&self) -> Option<MessageId> {
        self.message_id
    }

    pub fn status(&self) -> RefreshStatus {
        self.status
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn downloaded_count(&self) -> u64 {
        self.downloaded_count
    }

    pub fn saved_count(&self) -> u64 {
        self.saved_count
    }

    /// Empty unless the run failed.
    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    /// `updated_at - started_at`; frozen once terminal.
    pub fn duration(&self) -> chrono::Duration {
        self.updated_at - self.started_at
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// A non-terminal run that made no progress within `expiry`.
    pub fn is_expired(&self, now: DateTime<Utc>, expiry: Duration) -> bool {
        if self.is_terminal() {
            return false;
        }
        let expiry = chrono::Duration::from_std(expiry).unwrap_or(chrono::Duration::MAX);
        now - self.updated_at > expiry
    }

    /// Non-terminal and not expired: holds its subject.
    pub fn is_live(&self, now: DateTime<Utc>, expiry: Duration) -> bool {
        !self.is_terminal() && !self.is_expired(now, expiry)
    }

    /// Apply `transition`, caused by `message_id`, at `now`.
    ///
    /// Running totals keep their maximum. A transition into the current status
    /// from the message that produced it is reported as [`Applied::Replayed`].
    pub fn apply(
        &self,
        transition: Transition,
        message_id: MessageId,
        now: DateTime<Utc>,
    ) -> Result<Applied, RefreshError> {
        use RefreshStatus as S;

        let target = transition.target();
        let mut next = self.clone();

        match (self.status, transition) {
            (S::None, Transition::Schedule) | (S::Scheduled, Transition::Process) => {}
            (S::Processing, Transition::Download { count }) => {
                next.downloaded_count = next.downloaded_count.max(count);
            }
            (S::Processing | S::Saving, Transition::Save { count }) => {
                next.saved_count = next.saved_count.max(count);
            }
            (S::Saving, Transition::Complete { affected }) => {
                next.saved_count = next.saved_count.max(affected);
            }
            (S::Scheduled | S::Processing | S::Saving, Transition::Fail { error }) => {
                next.error_message = error;
            }
            (from, _) if from == target && self.message_id == Some(message_id) => {
                return Ok(Applied::Replayed);
            }
            (from, _) => return Err(RefreshError::InvalidTransition { from, to: target }),
        }

        next.status = target;
        next.message_id = Some(message_id);
        next.updated_at = now.max(self.updated_at);
        Ok(Applied::Updated(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fresh(now: DateTime<Utc>) -> RefreshProgress {
        RefreshProgress::new(
            Subject::new("securities").unwrap(),
            CorrelationId::parse("r1").unwrap(),
            now,
        )
    }

    fn updated(applied: Applied) -> RefreshProgress {
        match applied {
            Applied::Updated(p) => p,
            Applied::Replayed => panic!("expected an update"),
        }
    }

    #[test]
    fn happy_path_reaches_completed_with_running_totals() {
        let t0 = Utc::now();
        let m = MessageId::new();
        let step = |p: &RefreshProgress, t: Transition, secs: i64| {
            updated(p.apply(t, m, t0 + chrono::Duration::seconds(secs)).unwrap())
        };

        let p = fresh(t0);
        let p = step(&p, Transition::Schedule, 1);
        let p = step(&p, Transition::Process, 2);
        let p = step(&p, Transition::Download { count: 50 }, 3);
        let p = step(&p, Transition::Download { count: 100 }, 4);
        let p = step(&p, Transition::Save { count: 100 }, 5);
        let p = step(&p, Transition::Complete { affected: 100 }, 6);

        assert_eq!(p.status(), RefreshStatus::Completed);
        assert_eq!(p.downloaded_count(), 100);
        assert_eq!(p.saved_count(), 100);
        assert_eq!(p.duration(), chrono::Duration::seconds(6));
        assert_eq!(p.duration(), p.updated_at() - p.started_at());
        assert!(p.error_message().is_empty());
    }

    #[test]
    fn saving_from_none_is_rejected() {
        let err = fresh(Utc::now())
            .apply(Transition::Save { count: 1 }, MessageId::new(), Utc::now())
            .unwrap_err();
        assert!(matches!(
            err,
            RefreshError::InvalidTransition {
                from: RefreshStatus::None,
                to: RefreshStatus::Saving
            }
        ));
    }

    #[test]
    fn lower_running_total_is_ignored() {
        let now = Utc::now();
        let m = MessageId::new();
        let p = updated(fresh(now).apply(Transition::Schedule, m, now).unwrap());
        let p = updated(p.apply(Transition::Process, m, now).unwrap());
        let p = updated(p.apply(Transition::Download { count: 80 }, m, now).unwrap());
        let p = updated(p.apply(Transition::Download { count: 30 }, m, now).unwrap());
        assert_eq!(p.downloaded_count(), 80);
    }

    #[test]
    fn redelivered_transition_is_a_replay() {
        let now = Utc::now();
        let m = MessageId::new();
        let p = updated(fresh(now).apply(Transition::Schedule, m, now).unwrap());
        assert_eq!(p.apply(Transition::Schedule, m, now).unwrap(), Applied::Replayed);

        // Same transition from a different message is not a replay.
        assert!(p.apply(Transition::Schedule, MessageId::new(), now).is_err());
    }

    #[test]
    fn terminal_records_reject_new_transitions() {
        let now = Utc::now();
        let m = MessageId::new();
        let p = updated(fresh(now).apply(Transition::Schedule, m, now).unwrap());
        let failed = updated(
            p.apply(Transition::Fail { error: "boom".into() }, m, now)
                .unwrap(),
        );
        assert_eq!(failed.error_message(), "boom");

        let later = now + chrono::Duration::seconds(10);
        for t in [
            Transition::Schedule,
            Transition::Process,
            Transition::Save { count: 1 },
            Transition::Complete { affected: 1 },
        ] {
            assert!(failed.apply(t, MessageId::new(), later).is_err());
        }
        assert_eq!(
            failed
                .apply(Transition::Fail { error: "again".into() }, m, later)
                .unwrap(),
            Applied::Replayed
        );
        assert_eq!(failed.duration(), chrono::Duration::zero());
    }

    #[test]
    fn expiry_only_applies_to_unfinished_runs() {
        let t0 = Utc::now();
        let expiry = Duration::from_secs(60);
        let p = fresh(t0);
        assert!(!p.is_expired(t0 + chrono::Duration::seconds(60), expiry));
        assert!(p.is_expired(t0 + chrono::Duration::seconds(61), expiry));

        let m = MessageId::new();
        let p = updated(p.apply(Transition::Schedule, m, t0).unwrap());
        let p = updated(p.apply(Transition::Fail { error: "x".into() }, m, t0).unwrap());
        assert!(!p.is_expired(t0 + chrono::Duration::days(1), expiry));
        assert!(!p.is_live(t0, expiry));
    }

    #[test]
    fn serializes_status_in_snake_case() {
        let value = serde_json::to_value(fresh(Utc::now())).unwrap();
        assert_eq!(value["status"], serde_json::json!("none"));
        assert_eq!(value["correlation_id"], serde_json::json!("r1"));
        assert!(value.get("message_id").is_none());
    }

    fn transition() -> impl Strategy<Value = Transition> {
        prop_oneof![
            Just(Transition::Schedule),
            Just(Transition::Process),
            (0u64..1_000).prop_map(|count| Transition::Download { count }),
            (0u64..1_000).prop_map(|count| Transition::Save { count }),
            (0u64..1_000).prop_map(|affected| Transition::Complete { affected }),
            Just(Transition::Fail {
                error: "failed".into()
            }),
        ]
    }

    proptest! {
        #[test]
        fn any_sequence_keeps_counters_and_time_monotonic(
            steps in proptest::collection::vec((transition(), 0i64..3_600, any::<bool>()), 0..40)
        ) {
            let t0 = Utc::now();
            let mut p = fresh(t0);
            let mut last_message = MessageId::new();

            for (t, offset, reuse_message) in steps {
                let message = if reuse_message { last_message } else { MessageId::new() };
                // Clock may jump backwards: updated_at must not.
                let now = t0 + chrono::Duration::seconds(offset);
                let before = p.clone();

                match p.apply(t, message, now) {
                    Ok(Applied::Updated(next)) => {
                        prop_assert!(!before.is_terminal());
                        prop_assert!(next.updated_at() >= before.updated_at());
                        prop_assert!(next.downloaded_count() >= before.downloaded_count());
                        prop_assert!(next.saved_count() >= before.saved_count());
                        prop_assert_eq!(next.started_at(), t0);
                        prop_assert_eq!(next.message_id(), Some(message));
                        p = next;
                        last_message = message;
                    }
                    Ok(Applied::Replayed) => {
                        prop_assert_eq!(before.message_id(), Some(message));
                    }
                    Err(RefreshError::InvalidTransition { from, .. }) => {
                        prop_assert_eq!(from, before.status());
                    }
                    Err(other) => prop_assert!(false, "unexpected error {other}"),
                }
            }
        }

        #[test]
        fn only_adjacent_edges_leave_none(t in transition()) {
            let now = Utc::now();
            let result = fresh(now).apply(t.clone(), MessageId::new(), now);
            prop_assert_eq!(result.is_ok(), t == Transition::Schedule);
        }
    }
}
