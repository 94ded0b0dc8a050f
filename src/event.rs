//! Event envelopes and the encoding of domain events into them.
//!
//! Domain events are adjacently tagged serde enums
//! (`#[serde(tag = "type", content = "data")]`). The `"type"` tag becomes
//! the envelope's `event_type` and the `"data"` part its `payload`. No I/O
//! happens here.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::EventContext;

/// One immutable, sequenced entry of an event stream.
///
/// Serialized as a single JSON line by the file backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Position within the stream, starting at 1 with no gaps.
    pub sequence_number: u64,
    /// Unique id of this event.
    pub event_id: Uuid,
    /// Event type discriminator (e.g. `"MoneyDeposited"`).
    pub event_type: String,
    /// Event-specific data. `Null` for fieldless events.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Time the store committed the event.
    pub logged_at: DateTime<Utc>,
    /// Business effective date, when it differs from `logged_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_date: Option<DateTime<Utc>>,
    /// Free-text note recorded with the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commentary: Option<String>,
    /// Who or what caused the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Correlation ID of the request that produced the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl EventEnvelope {
    /// The date used for as-of filtering: the effective date if present,
    /// otherwise the logged time.
    pub fn as_of_date(&self) -> DateTime<Utc> {
        self.effective_date.unwrap_or(self.logged_at)
    }

    /// Whether this event falls inside an optional as-of bound.
    pub(crate) fn within(&self, as_of: Option<DateTime<Utc>>) -> bool {
        as_of.is_none_or(|bound| self.as_of_date() <= bound)
    }

    /// Decode the envelope back into an adjacently tagged domain event.
    ///
    /// Returns `None` when the event type is unknown to `E` or the payload
    /// does not match, so folds can skip events they do not understand.
    pub fn decode<E: DeserializeOwned>(&self) -> Option<E> {
        let tagged = if self.payload.is_null() {
            serde_json::json!({ "type": self.event_type })
        } else {
            serde_json::json!({
                "type": self.event_type,
                "data": self.payload,
            })
        };
        serde_json::from_value(tagged).ok()
    }

    /// Build the committed envelope from a proposal.
    pub(crate) fn commit(
        proposed: ProposedEvent,
        sequence_number: u64,
        logged_at: DateTime<Utc>,
    ) -> Self {
        Self {
            sequence_number,
            event_id: proposed.event_id,
            event_type: proposed.event_type,
            payload: proposed.payload,
            logged_at,
            effective_date: proposed.context.effective_date,
            commentary: proposed.context.commentary,
            source: proposed.context.source,
            correlation_id: proposed.context.correlation_id,
        }
    }
}

/// An event that has not been appended yet.
///
/// The store assigns the sequence number and logged time on commit.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedEvent {
    /// Freshly generated event id.
    pub event_id: Uuid,
    /// Event type discriminator.
    pub event_type: String,
    /// Event-specific data.
    pub payload: serde_json::Value,
    /// Dating and audit metadata.
    pub context: EventContext,
}

impl ProposedEvent {
    /// Create a proposal from a raw type tag and payload.
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload,
            context: EventContext::default(),
        }
    }

    /// Attach dating and audit metadata.
    pub fn with_context(mut self, context: EventContext) -> Self {
        self.context = context;
        self
    }
}

/// Encode an adjacently tagged domain event into a [`ProposedEvent`].
///
/// # Errors
///
/// Returns `serde_json::Error` if the event cannot be serialized, or does
/// not serialize to an object with a string `"type"` field.
pub fn encode_domain_event<E: Serialize>(
    event: &E,
    ctx: &EventContext,
) -> serde_json::Result<ProposedEvent> {
    use serde::ser::Error as _;

    let value = serde_json::to_value(event)?;
    let serde_json::Value::Object(mut obj) = value else {
        return Err(serde_json::Error::custom(
            "domain event must serialize to a JSON object",
        ));
    };
    let Some(serde_json::Value::String(event_type)) = obj.remove("type") else {
        return Err(serde_json::Error::custom(
            "domain event must carry a string 'type' tag",
        ));
    };
    let payload = obj.remove("data").unwrap_or(serde_json::Value::Null);

    Ok(ProposedEvent::new(event_type, payload).with_context(ctx.clone()))
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use serde::{Deserialize, Serialize};

    /// Domain events of a minimal counter stream.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    pub(crate) enum CounterEvent {
        Incremented,
        Added { amount: u64 },
    }
}

#[cfg(test)]
mod tests {
    use super::test_fixtures::CounterEvent;
    use super::*;
    use chrono::TimeZone;

    fn committed(event: &CounterEvent, ctx: &EventContext) -> EventEnvelope {
        let proposed = encode_domain_event(event, ctx).expect("encode should succeed");
        let logged = Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap();
        EventEnvelope::commit(proposed, 1, logged)
    }

    #[test]
    fn encode_variant_with_data_includes_payload() {
        let proposed =
            encode_domain_event(&CounterEvent::Added { amount: 42 }, &EventContext::default())
                .expect("encode should succeed");
        assert_eq!(proposed.event_type, "Added");
        assert_eq!(proposed.payload["amount"], 42);
        assert_eq!(proposed.event_id.get_version(), Some(uuid::Version::Random));
    }

    #[test]
    fn encode_fieldless_variant_has_null_payload() {
        let proposed = encode_domain_event(&CounterEvent::Incremented, &EventContext::default())
            .expect("encode should succeed");
        assert_eq!(proposed.event_type, "Incremented");
        assert!(proposed.payload.is_null());
    }

    #[test]
    fn encode_rejects_non_object_values() {
        let err = encode_domain_event(&42u32, &EventContext::default())
            .expect_err("a number is not a tagged event");
        assert!(err.to_string().contains("JSON object"));
    }

    #[test]
    fn encode_rejects_untagged_objects() {
        #[derive(Serialize)]
        struct Untagged {
            amount: u64,
        }
        let err = encode_domain_event(&Untagged { amount: 1 }, &EventContext::default())
            .expect_err("missing type tag");
        assert!(err.to_string().contains("'type'"));
    }

    #[test]
    fn decode_reverses_encode() {
        let ctx = EventContext::default();
        let envelope = committed(&CounterEvent::Added { amount: 5 }, &ctx);
        assert_eq!(
            envelope.decode::<CounterEvent>(),
            Some(CounterEvent::Added { amount: 5 })
        );

        let envelope = committed(&CounterEvent::Incremented, &ctx);
        assert_eq!(envelope.decode::<CounterEvent>(), Some(CounterEvent::Incremented));
    }

    #[test]
    fn decode_unknown_type_returns_none() {
        let mut envelope = committed(&CounterEvent::Incremented, &EventContext::default());
        envelope.event_type = "Renamed".to_string();
        assert_eq!(envelope.decode::<CounterEvent>(), None);
    }

    #[test]
    fn commit_copies_context_fields() {
        let effective = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let ctx = EventContext::default()
            .with_effective_date(effective)
            .with_commentary("opening balance")
            .with_source("migration")
            .with_correlation_id("corr-1");
        let envelope = committed(&CounterEvent::Incremented, &ctx);

        assert_eq!(envelope.sequence_number, 1);
        assert_eq!(envelope.effective_date, Some(effective));
        assert_eq!(envelope.commentary.as_deref(), Some("opening balance"));
        assert_eq!(envelope.source.as_deref(), Some("migration"));
        assert_eq!(envelope.correlation_id.as_deref(), Some("corr-1"));
    }

    #[test]
    fn as_of_date_prefers_effective_date() {
        let ctx = EventContext::default();
        let mut envelope = committed(&CounterEvent::Incremented, &ctx);
        assert_eq!(envelope.as_of_date(), envelope.logged_at);

        let backdated = Utc.with_ymd_and_hms(2023, 12, 31, 0, 0, 0).unwrap();
        envelope.effective_date = Some(backdated);
        assert_eq!(envelope.as_of_date(), backdated);
        assert!(envelope.within(Some(backdated)));
        assert!(envelope.within(None));
        assert!(!envelope.within(Some(backdated - chrono::Duration::seconds(1))));
    }

    #[test]
    fn envelope_json_omits_absent_metadata() {
        let envelope = committed(&CounterEvent::Incremented, &EventContext::default());
        let json = serde_json::to_string(&envelope).expect("serialize should succeed");
        assert!(!json.contains("commentary"));
        assert!(!json.contains("effective_date"));
        assert!(json.contains("\"sequence_number\":1"));
    }
}
