//! Event-sourcing primitives: append-only streams with optimistic
//! concurrency, as-of projections, classifications and command step
//! tracking.
//!
//! Start with [`EventStoreBuilder`] to open an [`EventStore`], then obtain
//! [`EventStream`] handles, projections, classifications and
//! [`CommandTracker`]s from it.

mod backend;
mod classification;
mod context;
mod error;
mod event;
mod identity;
mod notify;
pub mod projection;
mod step;
mod storage;
mod store;
mod stream;

pub use backend::{BackendError, InMemoryBackend, StreamBackend};
pub use classification::{
    Classification, ClassificationHandle, ClassificationRegistry, ClassificationResult,
    ClassificationStep, ClassificationVerdict, classify_events,
};
pub use context::EventContext;
pub use error::{NotifyError, ProjectionError, StepError, StreamError};
pub use event::{EventEnvelope, ProposedEvent, encode_domain_event};
pub use identity::{CommandIdentity, StepTarget, StreamIdentity};
pub use notify::{BroadcastDispatcher, NoopDispatcher, NotificationDispatcher, StreamNotification};
pub use projection::{Projection, ProjectionHandle, ProjectionRegistry, ProjectionSnapshot};
pub use step::{CommandState, CommandStatus, CommandStepRecord, CommandTracker, StepStatus};
pub use storage::{FileBackend, StreamLayout};
pub use store::{EventStore, EventStoreBuilder};
pub use stream::{AppendConstraint, EventStream};
