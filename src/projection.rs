//! Projections: deterministic folds of one stream into a typed snapshot.
//!
//! Projection types are registered by name at startup
//! ([`EventStoreBuilder::projection`](crate::EventStoreBuilder::projection)).
//! Replays look the fold up by name, so an unregistered name fails with
//! [`ProjectionError::NotConfigured`] instead of silently producing a
//! default state.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProjectionError;
use crate::event::EventEnvelope;
use crate::stream::EventStream;

/// A read model folded from a single entity's event stream.
///
/// # Contract
///
/// - [`apply`](Projection::apply) must be deterministic and free of side
///   effects: the same events always produce the same state.
/// - Only event types listed in [`HANDLES`](Projection::HANDLES) reach
///   `apply`. Other types are skipped, so new event types never break
///   existing projections.
pub trait Projection:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Projection type name used for registry lookups.
    const NAME: &'static str;

    /// Event types this projection folds.
    const HANDLES: &'static [&'static str];

    /// Fold one handled event into the state.
    fn apply(&mut self, event: &EventEnvelope);
}

/// The result of folding a stream prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionSnapshot<T> {
    /// The folded state.
    pub state: T,
    /// Sequence number of the last event read into this snapshot, handled
    /// or not. 0 when no event fell inside the as-of bound.
    pub current_sequence_number: u64,
    /// The as-of bound the snapshot was taken at, if any.
    pub as_of_date: Option<DateTime<Utc>>,
}

impl<T> ProjectionSnapshot<T> {
    /// Convert the state while keeping the position fields.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ProjectionSnapshot<U> {
        ProjectionSnapshot {
            state: f(self.state),
            current_sequence_number: self.current_sequence_number,
            as_of_date: self.as_of_date,
        }
    }
}

/// Fold `events` into a `P` snapshot.
///
/// Events later than `as_of` (by [`EventEnvelope::as_of_date`]) are left
/// out wherever they sit in the stream, so a backdated correction appended
/// afterwards is still included. Returns `None` for an empty stream.
pub fn fold<P: Projection>(
    events: &[EventEnvelope],
    as_of: Option<DateTime<Utc>>,
) -> Option<ProjectionSnapshot<P>> {
    if events.is_empty() {
        return None;
    }

    let mut state = P::default();
    let mut current_sequence_number = 0;
    for event in events.iter().filter(|e| e.within(as_of)) {
        if P::HANDLES.contains(&event.event_type.as_str()) {
            state.apply(event);
        }
        current_sequence_number = event.sequence_number;
    }

    Some(ProjectionSnapshot {
        state,
        current_sequence_number,
        as_of_date: as_of,
    })
}

// --- Type-erased processors for name-based lookup ---

/// Type-erased interface over a registered [`Projection`].
pub(crate) trait ProjectionProcessor: Send + Sync {
    /// Fold and return the state as JSON.
    fn fold_json(
        &self,
        events: &[EventEnvelope],
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Option<ProjectionSnapshot<serde_json::Value>>, serde_json::Error>;

    /// Fold and return the state boxed; callers downcast to the concrete
    /// projection type.
    fn fold_any(
        &self,
        events: &[EventEnvelope],
        as_of: Option<DateTime<Utc>>,
    ) -> Option<ProjectionSnapshot<Box<dyn Any + Send>>>;
}

struct TypedProcessor<P> {
    _marker: PhantomData<fn() -> P>,
}

impl<P: Projection> ProjectionProcessor for TypedProcessor<P> {
    fn fold_json(
        &self,
        events: &[EventEnvelope],
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Option<ProjectionSnapshot<serde_json::Value>>, serde_json::Error> {
        fold::<P>(events, as_of)
            .map(|snapshot| {
                let state = serde_json::to_value(&snapshot.state)?;
                Ok(snapshot.map(|_| state))
            })
            .transpose()
    }

    fn fold_any(
        &self,
        events: &[EventEnvelope],
        as_of: Option<DateTime<Utc>>,
    ) -> Option<ProjectionSnapshot<Box<dyn Any + Send>>> {
        fold::<P>(events, as_of).map(|s| s.map(|state| Box::new(state) as Box<dyn Any + Send>))
    }
}

/// Projection folds keyed by projection type name.
#[derive(Default)]
pub struct ProjectionRegistry {
    processors: HashMap<&'static str, Box<dyn ProjectionProcessor>>,
}

impl fmt::Debug for ProjectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.processors.keys().collect();
        names.sort();
        f.debug_struct("ProjectionRegistry")
            .field("projections", &names)
            .finish()
    }
}

impl ProjectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `P` under [`Projection::NAME`], replacing any earlier
    /// registration of that name.
    pub fn register<P: Projection>(&mut self) {
        let previous = self.processors.insert(
            P::NAME,
            Box::new(TypedProcessor::<P> {
                _marker: PhantomData,
            }),
        );
        if previous.is_some() {
            tracing::warn!(projection = P::NAME, "projection registered twice, replacing");
        }
    }

    /// Whether a projection is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.processors.contains_key(name)
    }

    fn processor(&self, name: &str) -> Result<&dyn ProjectionProcessor, ProjectionError> {
        self.processors
            .get(name)
            .map(Box::as_ref)
            .ok_or_else(|| ProjectionError::NotConfigured(name.to_owned()))
    }
}

/// Replay a stream through the registered projection `P`.
pub(crate) async fn process_typed<P: Projection>(
    stream: &EventStream,
    registry: &ProjectionRegistry,
    as_of: Option<DateTime<Utc>>,
) -> Result<Option<ProjectionSnapshot<P>>, ProjectionError> {
    let processor = registry.processor(P::NAME)?;
    let events = stream.read_all().await?;
    let Some(snapshot) = processor.fold_any(&events, as_of) else {
        return Ok(None);
    };
    tracing::debug!(
        projection = P::NAME,
        stream = %stream.identity(),
        sequence_number = snapshot.current_sequence_number,
        "projection replayed"
    );
    let current_sequence_number = snapshot.current_sequence_number;
    let state = snapshot
        .state
        .downcast::<P>()
        .map_err(|_| ProjectionError::NotConfigured(P::NAME.to_owned()))?;
    Ok(Some(ProjectionSnapshot {
        state: *state,
        current_sequence_number,
        as_of_date: as_of,
    }))
}

/// A projection type bound to one stream, resolved by name.
///
/// Created per request by [`EventStore::projection`](crate::EventStore::projection)
/// and discarded afterwards; it holds no state between calls.
#[derive(Debug, Clone)]
pub struct ProjectionHandle {
    stream: EventStream,
    projection_type: String,
    registry: Arc<ProjectionRegistry>,
}

impl ProjectionHandle {
    pub(crate) fn new(
        stream: EventStream,
        projection_type: String,
        registry: Arc<ProjectionRegistry>,
    ) -> Self {
        Self {
            stream,
            projection_type,
            registry,
        }
    }

    /// The projection type name this handle replays.
    pub fn projection_type(&self) -> &str {
        &self.projection_type
    }

    /// The stream this handle reads.
    pub fn stream(&self) -> &EventStream {
        &self.stream
    }

    /// Replay the stream, optionally bounded by an as-of date.
    ///
    /// Returns `Ok(None)` if the stream does not exist.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::NotConfigured`] if no projection is registered
    ///   under this name.
    /// - [`ProjectionError::Stream`] if reading the stream fails.
    pub async fn process(
        &self,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Option<ProjectionSnapshot<serde_json::Value>>, ProjectionError> {
        let processor = self.registry.processor(&self.projection_type)?;
        let events = self.stream.read_all().await?;
        let snapshot = processor.fold_json(&events, as_of)?;
        tracing::debug!(
            projection = %self.projection_type,
            stream = %self.stream.identity(),
            found = snapshot.is_some(),
            "projection replayed"
        );
        Ok(snapshot)
    }
}
