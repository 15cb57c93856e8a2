use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

use crate::pubsub::PushKind;

/// A subscribe or unsubscribe acknowledgement.
#[derive(Clone, Debug, PartialEq)]
pub struct SubscriptionChanged {
    pub kind: PushKind,
    /// Set for `subscribe`/`unsubscribe`.
    pub channel: Option<String>,
    /// Set for `psubscribe`/`punsubscribe`.
    pub pattern: Option<String>,
    /// Number of channels and patterns still subscribed after this acknowledgement.
    pub count: i64,
}

/// A message published to a subscribed channel or matching a subscribed pattern.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub channel: String,
    pub pattern: Option<String>,
    pub payload: Bytes,
}

/// Notifications drained from the bounded channel returned by
/// [`crate::Connection::events`] and [`crate::Subscriber::spawn`].
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    SubscriptionChanged(SubscriptionChanged),
    MessageReceived(Message),
    /// A command was queued inside MULTI; carries the server's status (`QUEUED`).
    TransactionQueued(String),
}

/// Hands `event` to the receiver without waiting. A full channel drops the event, so a
/// consumer that stops draining never stalls the connection; a closed one is ignored.
pub(crate) fn deliver(events: &mpsc::Sender<Event>, event: Event) {
    match events.try_send(event) {
        Ok(()) | Err(TrySendError::Closed(_)) => {}
        Err(TrySendError::Full(event)) => warn!(?event, "event channel full, dropping event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deliver_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);

        deliver(&tx, Event::TransactionQueued("first".to_string()));
        deliver(&tx, Event::TransactionQueued("second".to_string()));

        assert_eq!(rx.recv().await, Some(Event::TransactionQueued("first".to_string())));
        assert!(rx.try_recv().is_err());

        drop(rx);
        deliver(&tx, Event::TransactionQueued("closed".to_string()));
    }
}
