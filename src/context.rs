//! Cross-cutting metadata attached to appended events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata carried alongside a domain event when it is appended.
///
/// Keeps audit and dating information out of the domain event types.
/// Fields are copied onto the resulting [`EventEnvelope`](crate::EventEnvelope).
///
/// # Examples
///
/// ```
/// use streamfold_es::EventContext;
///
/// let ctx = EventContext::default()
///     .with_source("teller-7")
///     .with_commentary("cash deposit")
///     .with_correlation_id("req-abc-123");
///
/// assert_eq!(ctx.source.as_deref(), Some("teller-7"));
/// assert_eq!(ctx.commentary.as_deref(), Some("cash deposit"));
/// assert!(ctx.effective_date.is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventContext {
    /// Date the event takes business effect, if different from the
    /// time it is logged (e.g. a backdated correction).
    pub effective_date: Option<DateTime<Utc>>,
    /// Free-text note recorded with the event.
    pub commentary: Option<String>,
    /// Who or what caused the event (user id, service name).
    pub source: Option<String>,
    /// Correlation ID for tracing a request across streams.
    pub correlation_id: Option<String>,
}

impl EventContext {
    /// Set the effective date.
    pub fn with_effective_date(mut self, date: DateTime<Utc>) -> Self {
        self.effective_date = Some(date);
        self
    }

    /// Set the commentary.
    pub fn with_commentary(mut self, commentary: impl Into<String>) -> Self {
        self.commentary = Some(commentary.into());
        self
    }

    /// Set the source.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}
