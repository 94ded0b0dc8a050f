//! Fire-and-forget notifications for stream creation and appends.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::NotifyError;
use crate::identity::StreamIdentity;

/// Receives a callback after every committed append.
///
/// Notifications are best-effort: the store logs and discards any error,
/// and never rolls back or fails an append because of one.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync + 'static {
    /// Called once, after the first event of a stream is committed.
    async fn notify_stream_created(&self, identity: &StreamIdentity) -> Result<(), NotifyError>;

    /// Called after every committed event.
    async fn notify_event_appended(
        &self,
        identity: &StreamIdentity,
        event_type: &str,
        sequence_number: u64,
    ) -> Result<(), NotifyError>;
}

/// Dispatcher that does nothing. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDispatcher;

#[async_trait]
impl NotificationDispatcher for NoopDispatcher {
    async fn notify_stream_created(&self, _identity: &StreamIdentity) -> Result<(), NotifyError> {
        Ok(())
    }

    async fn notify_event_appended(
        &self,
        _identity: &StreamIdentity,
        _event_type: &str,
        _sequence_number: u64,
    ) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// A notification as published by [`BroadcastDispatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamNotification {
    /// The first event of a stream was committed.
    StreamCreated {
        /// The new stream.
        identity: StreamIdentity,
    },
    /// An event was committed.
    EventAppended {
        /// The stream written to.
        identity: StreamIdentity,
        /// Type of the committed event.
        event_type: String,
        /// Sequence number assigned to it.
        sequence_number: u64,
    },
}

/// Publishes notifications on a `tokio::sync::broadcast` channel.
///
/// Subscribers that lag behind lose the oldest notifications. Sending with
/// no subscribers reports [`NotifyError::NoSubscribers`], which the store
/// only logs.
#[derive(Debug, Clone)]
pub struct BroadcastDispatcher {
    tx: broadcast::Sender<StreamNotification>,
}

impl BroadcastDispatcher {
    /// Create a dispatcher buffering up to `capacity` notifications per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to notifications published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamNotification> {
        self.tx.subscribe()
    }

    fn publish(&self, notification: StreamNotification) -> Result<(), NotifyError> {
        self.tx
            .send(notification)
            .map(|_| ())
            .map_err(|_| NotifyError::NoSubscribers)
    }
}

#[async_trait]
impl NotificationDispatcher for BroadcastDispatcher {
    async fn notify_stream_created(&self, identity: &StreamIdentity) -> Result<(), NotifyError> {
        self.publish(StreamNotification::StreamCreated {
            identity: identity.clone(),
        })
    }

    async fn notify_event_appended(
        &self,
        identity: &StreamIdentity,
        event_type: &str,
        sequence_number: u64,
    ) -> Result<(), NotifyError> {
        self.publish(StreamNotification::EventAppended {
            identity: identity.clone(),
            event_type: event_type.to_owned(),
            sequence_number,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> StreamIdentity {
        StreamIdentity::new("bank", "account", "A-1")
    }

    #[tokio::test]
    async fn noop_always_succeeds() {
        let noop = NoopDispatcher;
        assert!(noop.notify_stream_created(&identity()).await.is_ok());
        assert!(noop.notify_event_appended(&identity(), "Opened", 1).await.is_ok());
    }

    #[tokio::test]
    async fn broadcast_delivers_in_order() {
        let dispatcher = BroadcastDispatcher::new(8);
        let mut rx = dispatcher.subscribe();

        dispatcher.notify_stream_created(&identity()).await.unwrap();
        dispatcher.notify_event_appended(&identity(), "Opened", 1).await.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            StreamNotification::StreamCreated {
                identity: identity()
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            StreamNotification::EventAppended {
                identity: identity(),
                event_type: "Opened".to_string(),
                sequence_number: 1,
            }
        );
    }

    #[tokio::test]
    async fn broadcast_without_subscribers_reports_error() {
        let dispatcher = BroadcastDispatcher::new(8);
        let err = dispatcher
            .notify_event_appended(&identity(), "Opened", 1)
            .await
            .expect_err("nobody is listening");
        assert!(matches!(err, NotifyError::NoSubscribers));
    }
}
