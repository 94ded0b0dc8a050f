//! Classifications: projections that decide set membership.
//!
//! A classification folds a stream into an [`ClassificationResult`]. The
//! registry scan [`instance_keys`] walks every instance of an entity type
//! and yields the keys currently classified `Include`.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};

use crate::backend::StreamBackend;
use crate::error::ProjectionError;
use crate::event::EventEnvelope;
use crate::identity::StreamIdentity;
use crate::notify::NotificationDispatcher;
use crate::stream::{AppendConstraint, EventStream, stream_error};

/// Membership verdict of a classification.
///
/// `Unknown` means no handled event decided either way. Registry scans
/// treat it as "not a member", but it is distinct from `Exclude`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClassificationResult {
    /// The last deciding event included the instance.
    Include,
    /// The last deciding event excluded the instance.
    Exclude,
    /// Nothing decided membership.
    Unknown,
}

/// Outcome of evaluating one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationStep {
    /// The instance is a member from this event on.
    Include,
    /// The instance is not a member from this event on.
    Exclude,
    /// This event does not change membership.
    Unchanged,
}

/// A membership rule folded from a single entity's event stream.
///
/// Like [`Projection`](crate::Projection), evaluation must be deterministic
/// and only event types in [`HANDLES`](Classification::HANDLES) are
/// evaluated. `self` may carry intermediate state between events.
pub trait Classification: Default + Send + Sync + 'static {
    /// Classification type name used for registry lookups.
    const NAME: &'static str;

    /// Event types this classification evaluates.
    const HANDLES: &'static [&'static str];

    /// Evaluate one handled event.
    fn evaluate(&mut self, event: &EventEnvelope) -> ClassificationStep;
}

/// The result of classifying a stream prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationVerdict {
    /// Membership after folding the prefix.
    pub result: ClassificationResult,
    /// Sequence number of the last event read, 0 if none.
    pub as_of_sequence: u64,
    /// The as-of bound the prefix was cut at, `None` for the full stream.
    pub as_of_date: Option<DateTime<Utc>>,
}

impl ClassificationVerdict {
    /// Whether the verdict is `Include`.
    pub fn is_included(&self) -> bool {
        self.result == ClassificationResult::Include
    }
}

/// Classify `events` with `C`, honouring the same as-of rule as
/// [`fold`](crate::projection::fold). An empty stream is `Unknown`.
pub fn classify_events<C: Classification>(
    events: &[EventEnvelope],
    as_of: Option<DateTime<Utc>>,
) -> ClassificationVerdict {
    let mut classification = C::default();
    let mut result = ClassificationResult::Unknown;
    let mut as_of_sequence = 0;

    for event in events.iter().filter(|e| e.within(as_of)) {
        if C::HANDLES.contains(&event.event_type.as_str()) {
            match classification.evaluate(event) {
                ClassificationStep::Include => result = ClassificationResult::Include,
                ClassificationStep::Exclude => result = ClassificationResult::Exclude,
                ClassificationStep::Unchanged => {}
            }
        }
        as_of_sequence = event.sequence_number;
    }

    ClassificationVerdict {
        result,
        as_of_sequence,
        as_of_date: as_of,
    }
}

pub(crate) trait ClassificationProcessor: Send + Sync {
    fn classify(
        &self,
        events: &[EventEnvelope],
        as_of: Option<DateTime<Utc>>,
    ) -> ClassificationVerdict;
}

struct TypedClassifier<C> {
    _marker: PhantomData<fn() -> C>,
}

impl<C: Classification> ClassificationProcessor for TypedClassifier<C> {
    fn classify(
        &self,
        events: &[EventEnvelope],
        as_of: Option<DateTime<Utc>>,
    ) -> ClassificationVerdict {
        classify_events::<C>(events, as_of)
    }
}

/// Classification rules keyed by name.
#[derive(Default)]
pub struct ClassificationRegistry {
    processors: HashMap<&'static str, Arc<dyn ClassificationProcessor>>,
}

impl fmt::Debug for ClassificationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.processors.keys().collect();
        names.sort();
        f.debug_struct("ClassificationRegistry")
            .field("classifications", &names)
            .finish()
    }
}

impl ClassificationRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `C` under [`Classification::NAME`].
    pub fn register<C: Classification>(&mut self) {
        let previous = self.processors.insert(
            C::NAME,
            Arc::new(TypedClassifier::<C> {
                _marker: PhantomData,
            }),
        );
        if previous.is_some() {
            tracing::warn!(
                classification = C::NAME,
                "classification registered twice, replacing"
            );
        }
    }

    /// Whether a classification is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.processors.contains_key(name)
    }

    fn processor(&self, name: &str) -> Result<Arc<dyn ClassificationProcessor>, ProjectionError> {
        self.processors
            .get(name)
            .cloned()
            .ok_or_else(|| ProjectionError::NotConfigured(name.to_owned()))
    }
}

/// A classification bound to one stream, resolved by name.
#[derive(Debug, Clone)]
pub struct ClassificationHandle {
    stream: EventStream,
    classification: String,
    registry: Arc<ClassificationRegistry>,
}

impl ClassificationHandle {
    pub(crate) fn new(
        stream: EventStream,
        classification: String,
        registry: Arc<ClassificationRegistry>,
    ) -> Self {
        Self {
            stream,
            classification,
            registry,
        }
    }

    /// Registered name this handle resolves on every call.
    pub fn classification(&self) -> &str {
        &self.classification
    }

    /// Classify the stream, optionally as of a date.
    ///
    /// # Errors
    ///
    /// [`ProjectionError::NotConfigured`] for an unregistered name, or
    /// [`ProjectionError::Stream`] if the read fails.
    pub async fn classify(
        &self,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<ClassificationVerdict, ProjectionError> {
        let processor = self.registry.processor(&self.classification)?;
        let events = self.stream.read_all().await?;
        let verdict = processor.classify(&events, as_of);
        tracing::debug!(
            classification = %self.classification,
            stream = %self.stream.identity(),
            result = ?verdict.result,
            "classification replayed"
        );
        Ok(verdict)
    }
}

/// Stream of instance keys of `(domain, entity_type)` classified `Include`.
///
/// The instance list is taken once up front. Each instance is then
/// classified lazily as the stream is polled, so the scan is finite and
/// reflects each instance's state at the moment it is reached.
pub(crate) async fn instance_keys(
    backend: Arc<dyn StreamBackend>,
    notifier: Arc<dyn NotificationDispatcher>,
    registry: &ClassificationRegistry,
    domain: &str,
    entity_type: &str,
    classification: &str,
) -> Result<BoxStream<'static, Result<String, ProjectionError>>, ProjectionError> {
    let processor = registry.processor(classification)?;
    let keys = backend
        .list_instances(domain, entity_type)
        .await
        .map_err(|e| {
            let scope = StreamIdentity::new(domain, entity_type, "*");
            stream_error(&scope, e, AppendConstraint::None)
        })?;
    tracing::debug!(
        domain,
        entity_type,
        classification,
        instances = keys.len(),
        "registry scan started"
    );

    let domain = domain.to_owned();
    let entity_type = entity_type.to_owned();
    let scan = stream::iter(keys)
        .then(move |key| {
            let stream = EventStream::new(
                StreamIdentity::new(domain.as_str(), entity_type.as_str(), key.as_str()),
                backend.clone(),
                notifier.clone(),
            );
            let processor = processor.clone();
            async move {
                let events = stream.read_all().await?;
                let verdict = processor.classify(&events, None);
                Ok::<_, ProjectionError>(verdict.is_included().then_some(key))
            }
        })
        .try_filter_map(|included| async move { Ok(included) })
        .boxed();
    Ok(scan)
}
