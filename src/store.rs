//! Top-level entry point that wires a backend, a notification dispatcher
//! and the projection/classification registries into a single
//! [`EventStore`].
//!
//! The store is opened via [`EventStoreBuilder`]. It holds no per-stream
//! state: every handle it returns reads through to the backend.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::backend::{InMemoryBackend, StreamBackend};
use crate::classification::{
    Classification, ClassificationHandle, ClassificationRegistry, ClassificationVerdict,
};
use crate::error::ProjectionError;
use crate::identity::{CommandIdentity, StreamIdentity};
use crate::notify::{NoopDispatcher, NotificationDispatcher};
use crate::projection::{self, Projection, ProjectionHandle, ProjectionRegistry, ProjectionSnapshot};
use crate::step::CommandTracker;
use crate::storage::FileBackend;
use crate::stream::EventStream;

/// Default number of counted step races before `StepError::Contended`.
const DEFAULT_MAX_STEP_ATTEMPTS: u32 = 3;

/// Factory for event streams, projections, classifications and command
/// trackers over one backend.
///
/// `Clone` is cheap -- all internal state is `Arc`-wrapped.
#[derive(Clone)]
pub struct EventStore {
    backend: Arc<dyn StreamBackend>,
    notifier: Arc<dyn NotificationDispatcher>,
    projections: Arc<ProjectionRegistry>,
    classifications: Arc<ClassificationRegistry>,
    max_step_attempts: u32,
}

impl fmt::Debug for EventStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStore")
            .field("projections", &self.projections)
            .field("classifications", &self.classifications)
            .field("max_step_attempts", &self.max_step_attempts)
            .finish_non_exhaustive()
    }
}

impl EventStore {
    /// Shorthand for [`EventStoreBuilder::new`].
    pub fn builder() -> EventStoreBuilder {
        EventStoreBuilder::new()
    }

    /// The backend every handle reads and writes through.
    pub fn backend(&self) -> &Arc<dyn StreamBackend> {
        &self.backend
    }

    /// Handle to the stream of one entity instance.
    pub fn stream(&self, identity: StreamIdentity) -> EventStream {
        EventStream::new(identity, self.backend.clone(), self.notifier.clone())
    }

    /// Name-resolved projection over one stream.
    ///
    /// The name is looked up when the handle is processed, so an
    /// unregistered name fails there with
    /// [`ProjectionError::NotConfigured`].
    pub fn projection(
        &self,
        identity: StreamIdentity,
        projection_type: impl Into<String>,
    ) -> ProjectionHandle {
        ProjectionHandle::new(
            self.stream(identity),
            projection_type.into(),
            self.projections.clone(),
        )
    }

    /// Replay the registered projection `P` over one stream.
    ///
    /// Returns `Ok(None)` when the stream does not exist.
    ///
    /// # Errors
    ///
    /// [`ProjectionError::NotConfigured`] if `P` was not registered on the
    /// builder, [`ProjectionError::Stream`] if the read fails.
    pub async fn process<P: Projection>(
        &self,
        identity: StreamIdentity,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Option<ProjectionSnapshot<P>>, ProjectionError> {
        projection::process_typed::<P>(&self.stream(identity), &self.projections, as_of).await
    }

    /// Name-resolved classification over one stream.
    pub fn classification(
        &self,
        identity: StreamIdentity,
        classification: impl Into<String>,
    ) -> ClassificationHandle {
        ClassificationHandle::new(
            self.stream(identity),
            classification.into(),
            self.classifications.clone(),
        )
    }

    /// Classify one stream with the registered classification `C`.
    ///
    /// # Errors
    ///
    /// As [`ClassificationHandle::classify`].
    pub async fn classify<C: Classification>(
        &self,
        identity: StreamIdentity,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<ClassificationVerdict, ProjectionError> {
        self.classification(identity, C::NAME).classify(as_of).await
    }

    /// Every instance key of `(domain, entity_type)` currently classified
    /// `Include` by `classification`.
    ///
    /// # Errors
    ///
    /// Fails before scanning with [`ProjectionError::NotConfigured`] for an
    /// unregistered name, or [`ProjectionError::Stream`] if the instance
    /// listing fails. Per-instance read failures are yielded as stream
    /// items.
    pub async fn get_all_instance_keys(
        &self,
        domain: &str,
        entity_type: &str,
        classification: &str,
    ) -> Result<BoxStream<'static, Result<String, ProjectionError>>, ProjectionError> {
        crate::classification::instance_keys(
            self.backend.clone(),
            self.notifier.clone(),
            &self.classifications,
            domain,
            entity_type,
            classification,
        )
        .await
    }

    /// Step tracker for one command instance.
    pub fn command(&self, identity: CommandIdentity) -> CommandTracker {
        let stream = self.stream(identity.stream_identity());
        CommandTracker::new(identity, stream, self.max_step_attempts)
    }
}

/// Builder for configuring and opening an [`EventStore`].
///
/// Without [`base_dir`](EventStoreBuilder::base_dir) or
/// [`backend`](EventStoreBuilder::backend) the store keeps everything in
/// memory.
///
/// # Examples
///
/// ```no_run
/// use streamfold_es::EventStoreBuilder;
///
/// # fn example() -> std::io::Result<()> {
/// let store = EventStoreBuilder::new()
///     .base_dir("/tmp/my-app")
///     .max_step_attempts(5)
///     .open()?;
/// # Ok(())
/// # }
/// ```
pub struct EventStoreBuilder {
    base_dir: Option<PathBuf>,
    backend: Option<Arc<dyn StreamBackend>>,
    notifier: Arc<dyn NotificationDispatcher>,
    projections: ProjectionRegistry,
    classifications: ClassificationRegistry,
    max_step_attempts: u32,
}

impl EventStoreBuilder {
    /// Create a builder with an in-memory backend and no-op notifications.
    pub fn new() -> Self {
        Self {
            base_dir: None,
            backend: None,
            notifier: Arc::new(NoopDispatcher),
            projections: ProjectionRegistry::new(),
            classifications: ClassificationRegistry::new(),
            max_step_attempts: DEFAULT_MAX_STEP_ATTEMPTS,
        }
    }

    /// Store streams as JSONL files under `path`.
    ///
    /// The directory is created by [`open`](EventStoreBuilder::open).
    pub fn base_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.base_dir = Some(path.as_ref().to_owned());
        self
    }

    /// Use a custom backend. Takes precedence over
    /// [`base_dir`](EventStoreBuilder::base_dir).
    pub fn backend(mut self, backend: Arc<dyn StreamBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Notify `notifier` after every committed append.
    pub fn notifier(mut self, notifier: Arc<dyn NotificationDispatcher>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Register a projection type for name-based and typed replay.
    pub fn projection<P: Projection>(mut self) -> Self {
        self.projections.register::<P>();
        self
    }

    /// Register a classification type.
    pub fn classification<C: Classification>(mut self) -> Self {
        self.classifications.register::<C>();
        self
    }

    /// How many contended races a step transition tolerates before giving
    /// up with [`StepError::Contended`](crate::StepError::Contended).
    ///
    /// Races lost to writes on other steps are retried without being
    /// counted, so workers on distinct steps never exhaust this budget.
    ///
    /// Defaults to 3. Values below 1 are treated as 1.
    pub fn max_step_attempts(mut self, attempts: u32) -> Self {
        self.max_step_attempts = attempts.max(1);
        self
    }

    /// Build the [`EventStore`].
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the base directory cannot be created.
    pub fn open(self) -> io::Result<EventStore> {
        let backend: Arc<dyn StreamBackend> = match (self.backend, self.base_dir) {
            (Some(backend), _) => backend,
            (None, Some(dir)) => {
                std::fs::create_dir_all(&dir)?;
                tracing::info!(base_dir = %dir.display(), "opened file-backed event store");
                Arc::new(FileBackend::new(dir))
            }
            (None, None) => {
                tracing::debug!("opened in-memory event store");
                Arc::new(InMemoryBackend::new())
            }
        };

        Ok(EventStore {
            backend,
            notifier: self.notifier,
            projections: Arc::new(self.projections),
            classifications: Arc::new(self.classifications),
            max_step_attempts: self.max_step_attempts,
        })
    }
}

impl Default for EventStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}
