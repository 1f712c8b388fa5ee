//! Exchange and routing-key layout.
//!
//! - one topic exchange per event family: the subject exchange (e.g.
//!   `securities`) carries the `refresh` command and `refreshing` progress,
//!   the `notification` exchange carries `start`, `complete` and `error`
//! - routing keys are `{subject}.{kind}`
//! - messages exceeding the redelivery limit go to the dead-letter exchange
//!   under their original routing key

use refsync_core::Subject;

use crate::message::MessageKind;

pub const DEFAULT_NOTIFICATION_EXCHANGE: &str = "notification";
pub const DEFAULT_DEAD_LETTER_EXCHANGE: &str = "refsync.dead-letter";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    subject: Subject,
    subject_exchange: String,
    notification_exchange: String,
    dead_letter_exchange: String,
}

impl Topology {
    pub fn new(subject: Subject) -> Self {
        Self {
            subject_exchange: subject.as_str().to_string(),
            subject,
            notification_exchange: DEFAULT_NOTIFICATION_EXCHANGE.to_string(),
            dead_letter_exchange: DEFAULT_DEAD_LETTER_EXCHANGE.to_string(),
        }
    }

    pub fn with_notification_exchange(mut self, name: impl Into<String>) -> Self {
        self.notification_exchange = name.into();
        self
    }

    pub fn with_dead_letter_exchange(mut self, name: impl Into<String>) -> Self {
        self.dead_letter_exchange = name.into();
        self
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn subject_exchange(&self) -> &str {
        &self.subject_exchange
    }

    pub fn notification_exchange(&self) -> &str {
        &self.notification_exchange
    }

    pub fn dead_letter_exchange(&self) -> &str {
        &self.dead_letter_exchange
    }

    /// All exchanges a process needs declared.
    pub fn exchanges(&self) -> [&str; 3] {
        [
            &self.subject_exchange,
            &self.notification_exchange,
            &self.dead_letter_exchange,
        ]
    }

    pub fn exchange_for(&self, kind: MessageKind) -> &str {
        match kind {
            MessageKind::Refresh | MessageKind::Refreshing => &self.subject_exchange,
            MessageKind::Start | MessageKind::Complete | MessageKind::Error => {
                &self.notification_exchange
            }
        }
    }

    pub fn routing_key(&self, kind: MessageKind) -> String {
        format!("{}.{}", self.subject, kind.as_str())
    }

    /// Durable queue name for a consumer of this subject.
    pub fn queue_name(&self, consumer: &str) -> String {
        format!("{}.{}", self.subject, consumer)
    }

    /// Parking queue that keeps everything the dead-letter exchange receives
    /// for inspection and replay.
    pub fn dead_letter_binding(&self) -> Binding {
        Binding::new(self.queue_name("dead-letter"), &self.dead_letter_exchange).key("#")
    }
}

/// Queue-to-exchange binding requested by a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_keys: Vec<String>,
}

impl Binding {
    pub fn new(queue: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_keys: Vec::new(),
        }
    }

    pub fn key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_keys.push(routing_key.into());
        self
    }
}

/// Topic-exchange routing-key match.
///
/// Words are `.`-separated; `*` matches exactly one word, `#` matches zero or
/// more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&k, key_rest)) if word == "*" || word == k => match_words(rest, key_rest),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology() -> Topology {
        Topology::new(Subject::new("securities").unwrap())
    }

    #[test]
    fn routing_keys_are_subject_scoped() {
        let t = topology();
        assert_eq!(t.routing_key(MessageKind::Refresh), "securities.refresh");
        assert_eq!(t.routing_key(MessageKind::Refreshing), "securities.refreshing");
        assert_eq!(t.routing_key(MessageKind::Complete), "securities.complete");
    }

    #[test]
    fn progress_stays_on_subject_exchange_and_outcomes_go_to_notification() {
        let t = topology();
        assert_eq!(t.exchange_for(MessageKind::Refresh), "securities");
        assert_eq!(t.exchange_for(MessageKind::Refreshing), "securities");
        assert_eq!(t.exchange_for(MessageKind::Start), "notification");
        assert_eq!(t.exchange_for(MessageKind::Error), "notification");
    }

    #[test]
    fn dead_letter_queue_catches_every_key_on_the_configured_exchange() {
        let binding = topology().with_dead_letter_exchange("ops.dlx").dead_letter_binding();
        assert_eq!(binding.queue, "securities.dead-letter");
        assert_eq!(binding.exchange, "ops.dlx");
        assert_eq!(binding.routing_keys, ["#"]);
    }

    #[test]
    fn topic_wildcards() {
        assert!(topic_matches("securities.refresh", "securities.refresh"));
        assert!(!topic_matches("securities.refresh", "securities.refreshing"));
        assert!(topic_matches("securities.*", "securities.complete"));
        assert!(!topic_matches("securities.*", "securities.complete.late"));
        assert!(topic_matches("#", "securities.error"));
        assert!(topic_matches("securities.#", "securities"));
        assert!(topic_matches("*.error", "bonds.error"));
        assert!(!topic_matches("*.error", "error"));
    }
}
