//! Backing store trait and the in-memory backend.
//!
//! A backend provides the two primitives the stream store relies on: a
//! compare-and-append on the stream tail and a sequential read. It also
//! enumerates the instances of an entity type for registry scans.

use std::collections::HashMap;
use std::io;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::event::{EventEnvelope, ProposedEvent};
use crate::identity::StreamIdentity;

/// Error reported by a [`StreamBackend`].
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The stream tail did not match the expected sequence number.
    #[error("stream tail is at {actual}")]
    TailMismatch {
        /// Sequence number actually at the tail.
        actual: u64,
    },

    /// The identity cannot be stored by this backend.
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Durable (or not) storage for event streams.
///
/// # Contract
///
/// - [`append`](StreamBackend::append) must check `expected_tail` and write
///   the envelope as one atomic step per identity: two concurrent appends
///   with the same expectation cannot both commit.
/// - The committed envelope gets `tail + 1` as its sequence number.
/// - A commit either fully happens or not at all. Readers never observe a
///   partially written envelope.
#[async_trait]
pub trait StreamBackend: Send + Sync + 'static {
    /// Last committed sequence number, or 0 for an empty/absent stream.
    async fn tail(&self, identity: &StreamIdentity) -> Result<u64, BackendError>;

    /// All envelopes with `sequence_number >= from_sequence`, ascending.
    async fn read_from(
        &self,
        identity: &StreamIdentity,
        from_sequence: u64,
    ) -> Result<Vec<EventEnvelope>, BackendError>;

    /// Compare-and-append a single event.
    ///
    /// With `expected_tail = None` the event is appended at whatever the
    /// tail is when the write lock is held.
    async fn append(
        &self,
        identity: &StreamIdentity,
        expected_tail: Option<u64>,
        event: ProposedEvent,
        logged_at: DateTime<Utc>,
    ) -> Result<EventEnvelope, BackendError>;

    /// Instance keys of every stream of `(domain, entity_type)` that holds
    /// at least one event, sorted.
    async fn list_instances(
        &self,
        domain: &str,
        entity_type: &str,
    ) -> Result<Vec<String>, BackendError>;
}

/// Process-local backend keeping every stream in a `HashMap`.
///
/// Useful for tests and for hosts that do not need durability.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    streams: RwLock<HashMap<StreamIdentity, Vec<EventEnvelope>>>,
}

impl InMemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> BackendError {
    BackendError::Io(io::Error::other("in-memory stream lock poisoned"))
}

#[async_trait]
impl StreamBackend for InMemoryBackend {
    async fn tail(&self, identity: &StreamIdentity) -> Result<u64, BackendError> {
        let streams = self.streams.read().map_err(|_| poisoned())?;
        Ok(streams
            .get(identity)
            .and_then(|events| events.last())
            .map_or(0, |e| e.sequence_number))
    }

    async fn read_from(
        &self,
        identity: &StreamIdentity,
        from_sequence: u64,
    ) -> Result<Vec<EventEnvelope>, BackendError> {
        let streams = self.streams.read().map_err(|_| poisoned())?;
        let Some(events) = streams.get(identity) else {
            return Ok(Vec::new());
        };
        // Sequence numbers are contiguous from 1, so they index the vector.
        let start = usize::try_from(from_sequence.saturating_sub(1)).unwrap_or(usize::MAX);
        Ok(events.get(start..).map(<[_]>::to_vec).unwrap_or_default())
    }

    async fn append(
        &self,
        identity: &StreamIdentity,
        expected_tail: Option<u64>,
        event: ProposedEvent,
        logged_at: DateTime<Utc>,
    ) -> Result<EventEnvelope, BackendError> {
        let mut streams = self.streams.write().map_err(|_| poisoned())?;
        let actual = streams.get(identity).map_or(0, |events| events.len() as u64);
        if let Some(expected) = expected_tail
            && expected != actual
        {
            return Err(BackendError::TailMismatch { actual });
        }
        // The entry is created only by a committing append.
        let envelope = EventEnvelope::commit(event, actual + 1, logged_at);
        streams
            .entry(identity.clone())
            .or_default()
            .push(envelope.clone());
        Ok(envelope)
    }

    async fn list_instances(
        &self,
        domain: &str,
        entity_type: &str,
    ) -> Result<Vec<String>, BackendError> {
        let streams = self.streams.read().map_err(|_| poisoned())?;
        let mut keys: Vec<String> = streams
            .iter()
            .filter(|(id, events)| {
                id.domain == domain && id.entity_type == entity_type && !events.is_empty()
            })
            .map(|(id, _)| id.instance_key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
