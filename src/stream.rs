//! Append-only event stream handles.
//!
//! An [`EventStream`] addresses one identity and funnels every write through
//! the backend's compare-and-append. It is cheap to clone and holds no
//! cached state, so concurrent handles to the same identity are safe.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::Instrument;

use crate::backend::{BackendError, StreamBackend};
use crate::context::EventContext;
use crate::error::StreamError;
use crate::event::{EventEnvelope, ProposedEvent, encode_domain_event};
use crate::identity::StreamIdentity;
use crate::notify::NotificationDispatcher;

/// Optimistic concurrency check applied to an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppendConstraint {
    /// Append at whatever the current tail is.
    #[default]
    None,
    /// The stream must not exist yet (first write).
    MustBeNew,
    /// The last committed sequence number must be exactly this value.
    ExpectedSequence(u64),
}

impl AppendConstraint {
    /// Constraint that pins the tail read earlier: `MustBeNew` for an empty
    /// stream, `ExpectedSequence(tail)` otherwise.
    pub fn at_tail(tail: u64) -> Self {
        if tail == 0 {
            Self::MustBeNew
        } else {
            Self::ExpectedSequence(tail)
        }
    }

    fn expected_tail(self) -> Option<u64> {
        match self {
            Self::None => None,
            Self::MustBeNew => Some(0),
            Self::ExpectedSequence(n) => Some(n),
        }
    }
}

/// Handle to the event stream of one entity instance.
#[derive(Clone)]
pub struct EventStream {
    identity: StreamIdentity,
    backend: Arc<dyn StreamBackend>,
    notifier: Arc<dyn NotificationDispatcher>,
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("identity", &self.identity)
            .finish()
    }
}

impl EventStream {
    pub(crate) fn new(
        identity: StreamIdentity,
        backend: Arc<dyn StreamBackend>,
        notifier: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self {
            identity,
            backend,
            notifier,
        }
    }

    /// The identity this handle addresses.
    pub fn identity(&self) -> &StreamIdentity {
        &self.identity
    }

    /// `true` iff at least one event has been committed.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Unavailable`] if the backend read fails.
    pub async fn exists(&self) -> Result<bool, StreamError> {
        Ok(self.tail().await? > 0)
    }

    /// Sequence number of the last committed event, 0 for an empty stream.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Unavailable`] if the backend read fails.
    pub async fn tail(&self) -> Result<u64, StreamError> {
        self.backend
            .tail(&self.identity)
            .await
            .map_err(|e| stream_error(&self.identity, e, AppendConstraint::None))
    }

    /// Every committed event, in sequence order.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Unavailable`] if the backend read fails.
    pub async fn read_all(&self) -> Result<Vec<EventEnvelope>, StreamError> {
        self.read_from(1).await
    }

    /// Committed events with `sequence_number >= from_sequence`.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Unavailable`] if the backend read fails.
    pub async fn read_from(&self, from_sequence: u64) -> Result<Vec<EventEnvelope>, StreamError> {
        self.backend
            .read_from(&self.identity, from_sequence)
            .await
            .map_err(|e| stream_error(&self.identity, e, AppendConstraint::None))
    }

    /// Append one event under `constraint`, returning its sequence number.
    ///
    /// On success the notification dispatcher is told about the append
    /// (and about the stream's creation when this was its first event).
    /// Dispatch failures are logged and do not affect the result.
    ///
    /// # Errors
    ///
    /// - [`StreamError::AlreadyExists`] when `MustBeNew` finds events.
    /// - [`StreamError::ConcurrencyConflict`] when `ExpectedSequence` does
    ///   not match the tail at commit time.
    /// - [`StreamError::Unavailable`] for backend failures.
    pub async fn append(
        &self,
        event: ProposedEvent,
        constraint: AppendConstraint,
    ) -> Result<u64, StreamError> {
        let span = tracing::info_span!(
            "append",
            stream = %self.identity,
            event_type = %event.event_type,
        );
        async move {
            let envelope = self
                .backend
                .append(&self.identity, constraint.expected_tail(), event, Utc::now())
                .await
                .map_err(|e| stream_error(&self.identity, e, constraint))?;

            tracing::info!(
                sequence_number = envelope.sequence_number,
                "event appended"
            );
            self.dispatch(&envelope).await;
            Ok(envelope.sequence_number)
        }
        .instrument(span)
        .await
    }

    /// Encode an adjacently tagged domain event and append it.
    ///
    /// # Errors
    ///
    /// [`StreamError::Encode`] if the event cannot be encoded, otherwise as
    /// [`append`](Self::append).
    pub async fn append_event<E: Serialize>(
        &self,
        event: &E,
        ctx: &EventContext,
        constraint: AppendConstraint,
    ) -> Result<u64, StreamError> {
        let proposed = encode_domain_event(event, ctx).map_err(StreamError::Encode)?;
        self.append(proposed, constraint).await
    }

    async fn dispatch(&self, envelope: &EventEnvelope) {
        if envelope.sequence_number == 1
            && let Err(e) = self.notifier.notify_stream_created(&self.identity).await
        {
            tracing::warn!(error = %e, "stream created notification dropped");
        }
        if let Err(e) = self
            .notifier
            .notify_event_appended(
                &self.identity,
                &envelope.event_type,
                envelope.sequence_number,
            )
            .await
        {
            tracing::warn!(
                error = %e,
                sequence_number = envelope.sequence_number,
                "event appended notification dropped"
            );
        }
    }
}

/// Translate a backend failure on `identity` into the public error type.
///
/// A tail mismatch under `MustBeNew` means the stream already existed.
pub(crate) fn stream_error(
    identity: &StreamIdentity,
    err: BackendError,
    constraint: AppendConstraint,
) -> StreamError {
    match err {
        BackendError::TailMismatch { .. } if constraint == AppendConstraint::MustBeNew => {
            StreamError::AlreadyExists {
                identity: identity.clone(),
            }
        }
        BackendError::TailMismatch { actual } => StreamError::ConcurrencyConflict {
            identity: identity.clone(),
            expected: constraint.expected_tail().unwrap_or(actual),
            actual,
        },
        BackendError::InvalidIdentity(reason) => StreamError::InvalidIdentity(reason),
        BackendError::Io(e) => StreamError::Unavailable(e),
    }
}
