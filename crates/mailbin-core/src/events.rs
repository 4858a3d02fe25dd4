use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::config::StoreConfig;
use crate::model::MessageSummary;

/// Mutation broadcast to subscribers after a change is committed.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum MailboxEvent {
    New(MessageSummary),
    Delete {
        mailbox: String,
        ids: Vec<String>,
    },
    Prune {
        mailbox: String,
        deleted: u64,
    },
    Update {
        mailbox: String,
        id: String,
        tags: Vec<String>,
    },
}

impl MailboxEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            MailboxEvent::New(_) => "new",
            MailboxEvent::Delete { .. } => "delete",
            MailboxEvent::Prune { .. } => "prune",
            MailboxEvent::Update { .. } => "update",
        }
    }
}

/// Fire-and-forget sink. Implementations must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: MailboxEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _event: MailboxEvent) {}
}

/// Bounded channel sink; events are dropped when the queue is full or the
/// receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<MailboxEvent>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<MailboxEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue sized by `event_queue_capacity`.
    pub fn for_config(config: &StoreConfig) -> (Self, mpsc::Receiver<MailboxEvent>) {
        Self::new(config.event_queue_capacity)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, event: MailboxEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                debug!("[events] queue full, dropping {} event", event.kind());
            }
            Err(TrySendError::Closed(event)) => {
                debug!("[events] no subscriber, dropping {} event", event.kind());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ChannelNotifier, MailboxEvent, Notifier};
    use crate::config::StoreConfig;

    fn prune(mailbox: &str) -> MailboxEvent {
        MailboxEvent::Prune {
            mailbox: mailbox.to_string(),
            deleted: 1,
        }
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let (notifier, mut rx) = ChannelNotifier::new(1);
        notifier.notify(prune("a"));
        notifier.notify(prune("b"));

        let first = rx.try_recv().unwrap();
        assert!(matches!(first, MailboxEvent::Prune { ref mailbox, .. } if mailbox == "a"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn config_sizes_the_queue() {
        let config = StoreConfig {
            event_queue_capacity: 2,
            ..StoreConfig::default()
        };
        let (notifier, mut rx) = ChannelNotifier::for_config(&config);
        for mailbox in ["a", "b", "c"] {
            notifier.notify(prune(mailbox));
        }
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_queue_is_ignored() {
        let (notifier, rx) = ChannelNotifier::new(4);
        drop(rx);
        notifier.notify(prune("a"));
    }

    #[test]
    fn events_serialize_with_kind_tag() {
        let json = serde_json::to_value(MailboxEvent::Delete {
            mailbox: "default".into(),
            ids: vec!["x".into()],
        })
        .unwrap();
        assert_eq!(json["type"], "delete");
        assert_eq!(json["data"]["ids"][0], "x");
    }
}
