//! Compound keys addressing event streams and command instances.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed namespace UUID for deterministic stream ID derivation.
///
/// Stream IDs are UUID v5 values derived from this namespace and the
/// `"{domain}/{entity_type}/{instance_key}"` string, so the same identity
/// maps to the same UUID in every process.
const STREAM_NAMESPACE: Uuid = Uuid::from_bytes([
    0x5c, 0x0e, 0x21, 0x8f, 0x93, 0x6a, 0x4b, 0x17, 0xa2, 0x4d, 0xe8, 0x1b, 0x70, 0x3c, 0x9f, 0x06,
]);

/// Entity type prefix reserved for command step streams.
pub(crate) const COMMAND_ENTITY_PREFIX: &str = "$command-";

/// The `(domain, entity_type, instance_key)` triple addressing exactly one
/// append-only event stream.
///
/// # Examples
///
/// ```
/// use streamfold_es::StreamIdentity;
///
/// let id = StreamIdentity::new("bank", "account", "A-100");
/// assert_eq!(id.to_string(), "bank/account/A-100");
/// assert_eq!(id.stream_id(), StreamIdentity::new("bank", "account", "A-100").stream_id());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamIdentity {
    /// Top-level business domain (e.g. `"bank"`).
    pub domain: String,
    /// Entity type within the domain (e.g. `"account"`).
    pub entity_type: String,
    /// Unique key of the entity instance.
    pub instance_key: String,
}

impl StreamIdentity {
    /// Build an identity from its three components.
    pub fn new(
        domain: impl Into<String>,
        entity_type: impl Into<String>,
        instance_key: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            entity_type: entity_type.into(),
            instance_key: instance_key.into(),
        }
    }

    /// Deterministic UUID v5 for this identity.
    ///
    /// Used to correlate log lines and notifications without carrying
    /// the three string components around.
    pub fn stream_id(&self) -> Uuid {
        Uuid::new_v5(&STREAM_NAMESPACE, self.to_string().as_bytes())
    }

    /// Check that every component is usable as a single path segment.
    ///
    /// Components must be non-empty, must not be `.` or `..`, and must not
    /// contain `/`, `\` or NUL.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason naming the offending component.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("domain", &self.domain),
            ("entity_type", &self.entity_type),
            ("instance_key", &self.instance_key),
        ] {
            validate_segment(name, value)?;
        }
        Ok(())
    }
}

impl fmt::Display for StreamIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.domain, self.entity_type, self.instance_key)
    }
}

/// Reject values that would escape or collapse a directory layout.
pub(crate) fn validate_segment(name: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{name} must not be empty"));
    }
    if value == "." || value == ".." {
        return Err(format!("{name} must not be '{value}'"));
    }
    if value.contains(['/', '\\', '\0']) {
        return Err(format!("{name} contains a path separator: {value:?}"));
    }
    Ok(())
}

/// The `(domain, command_name, instance_id)` triple addressing one
/// orchestrated command instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandIdentity {
    /// Business domain the command belongs to.
    pub domain: String,
    /// Command name (e.g. `"accrue-interest"`).
    pub command_name: String,
    /// Unique id of this run of the command.
    pub instance_id: String,
}

impl CommandIdentity {
    /// Build a command identity from its three components.
    pub fn new(
        domain: impl Into<String>,
        command_name: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            command_name: command_name.into(),
            instance_id: instance_id.into(),
        }
    }

    /// Build a command identity with a fresh random instance id.
    pub fn new_instance(domain: impl Into<String>, command_name: impl Into<String>) -> Self {
        Self::new(domain, command_name, Uuid::new_v4().to_string())
    }

    /// The stream that records this command's step facts.
    ///
    /// Command streams live under a reserved entity type so they never
    /// collide with entity streams of the same domain.
    pub fn stream_identity(&self) -> StreamIdentity {
        StreamIdentity::new(
            self.domain.clone(),
            format!("{COMMAND_ENTITY_PREFIX}{}", self.command_name),
            self.instance_id.clone(),
        )
    }
}

impl fmt::Display for CommandIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.domain, self.command_name, self.instance_id)
    }
}

/// The entity a command step acted upon.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StepTarget {
    /// Domain of the target entity.
    pub domain: String,
    /// Entity type of the target entity.
    pub entity_type: String,
    /// Instance key of the target entity.
    pub instance_key: String,
}

impl From<&StreamIdentity> for StepTarget {
    fn from(id: &StreamIdentity) -> Self {
        Self {
            domain: id.domain.clone(),
            entity_type: id.entity_type.clone(),
            instance_key: id.instance_key.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_is_deterministic() {
        let a = StreamIdentity::new("bank", "account", "A-1").stream_id();
        let b = StreamIdentity::new("bank", "account", "A-1").stream_id();
        assert_eq!(a, b, "same inputs must produce the same UUID");
    }

    #[test]
    fn stream_id_differs_by_each_component() {
        let base = StreamIdentity::new("bank", "account", "A-1").stream_id();
        assert_ne!(base, StreamIdentity::new("loans", "account", "A-1").stream_id());
        assert_ne!(base, StreamIdentity::new("bank", "customer", "A-1").stream_id());
        assert_ne!(base, StreamIdentity::new("bank", "account", "A-2").stream_id());
    }

    #[test]
    fn validate_accepts_plain_segments() {
        let id = StreamIdentity::new("bank", "account", "A-100_x.y");
        assert!(id.validate().is_ok());
    }

    #[test]
    fn validate_rejects_traversal_and_separators() {
        for key in ["", ".", "..", "a/b", "a\\b"] {
            let id = StreamIdentity::new("bank", "account", key);
            let err = id.validate().expect_err("should reject");
            assert!(err.contains("instance_key"), "unexpected message: {err}");
        }
    }

    #[test]
    fn command_stream_uses_reserved_entity_type() {
        let cmd = CommandIdentity::new("bank", "accrue-interest", "run-1");
        let stream = cmd.stream_identity();
        assert_eq!(stream.domain, "bank");
        assert_eq!(stream.entity_type, "$command-accrue-interest");
        assert_eq!(stream.instance_key, "run-1");
        assert!(stream.validate().is_ok());
    }

    #[test]
    fn new_instance_generates_distinct_ids() {
        let a = CommandIdentity::new_instance("bank", "accrue-interest");
        let b = CommandIdentity::new_instance("bank", "accrue-interest");
        assert_ne!(a.instance_id, b.instance_id);
    }

    #[test]
    fn step_target_from_identity() {
        let id = StreamIdentity::new("bank", "account", "A-1");
        let target = StepTarget::from(&id);
        assert_eq!(target.domain, "bank");
        assert_eq!(target.entity_type, "account");
        assert_eq!(target.instance_key, "A-1");
    }
}
