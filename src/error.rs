//! Crate-level error types for stream writes, replays and step tracking.

use crate::identity::StreamIdentity;
use crate::step::StepStatus;

/// Error returned by event stream operations.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// A `MustBeNew` append found the stream already populated.
    #[error("stream {identity} already exists")]
    AlreadyExists {
        /// The stream that already had events.
        identity: StreamIdentity,
    },

    /// An `ExpectedSequence` append found a different tail.
    ///
    /// Callers re-read the stream and retry with the fresh sequence
    /// number, or abort.
    #[error(
        "concurrency conflict on stream {identity}: expected sequence {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        /// The stream that moved.
        identity: StreamIdentity,
        /// Sequence number the caller expected at the tail.
        expected: u64,
        /// Sequence number actually at the tail.
        actual: u64,
    },

    /// The backing store failed (I/O, lock contention, corrupt data).
    ///
    /// Transient: the caller may retry.
    #[error("stream store unavailable: {0}")]
    Unavailable(#[from] std::io::Error),

    /// The identity cannot address a stream in this backend.
    #[error("invalid stream identity: {0}")]
    InvalidIdentity(String),

    /// A domain event could not be encoded for appending.
    #[error("event encoding failed: {0}")]
    Encode(#[source] serde_json::Error),
}

impl StreamError {
    /// Whether retrying the same operation later might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Error returned when replaying a projection or classification.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// No processor is registered under the requested name.
    #[error("no projection processor configured for '{0}'")]
    NotConfigured(String),

    /// Reading the stream failed.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// The folded state could not be converted to JSON.
    #[error("projection serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error returned by command step tracking.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The step was already initiated for this command instance.
    #[error("step '{step}' already initiated")]
    AlreadyInitiated {
        /// Step name.
        step: String,
    },

    /// No initiated record exists for the step.
    #[error("step '{step}' has not been initiated")]
    NotInitiated {
        /// Step name.
        step: String,
    },

    /// The step (or the command) already reached a terminal status.
    #[error("'{step}' already finished as {status:?}")]
    AlreadyTerminal {
        /// Step name, or the command name for command-level transitions.
        step: String,
        /// The terminal status reached.
        status: StepStatus,
    },

    /// Concurrent writers kept moving the command stream.
    #[error("command stream contended: gave up after {attempts} attempts")]
    Contended {
        /// Number of attempts made.
        attempts: u32,
    },

    /// Reading or writing the command stream failed.
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Error a notification dispatcher may report.
///
/// Never propagated to appenders; logged and dropped by the store.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// Nobody is listening on the channel.
    #[error("no notification subscribers")]
    NoSubscribers,

    /// Dispatcher-specific failure.
    #[error("notification failed: {0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> StreamIdentity {
        StreamIdentity::new("bank", "account", "A-1")
    }

    #[test]
    fn already_exists_display_names_stream() {
        let err = StreamError::AlreadyExists {
            identity: identity(),
        };
        assert_eq!(err.to_string(), "stream bank/account/A-1 already exists");
    }

    #[test]
    fn conflict_display_includes_both_sequences() {
        let err = StreamError::ConcurrencyConflict {
            identity: identity(),
            expected: 2,
            actual: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("expected sequence 2"));
        assert!(msg.contains("found 3"));
    }

    #[test]
    fn unavailable_from_io_is_transient() {
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "throttled");
        let err = StreamError::from(io_err);
        assert!(err.is_transient());
        assert!(err.to_string().contains("throttled"));

        let conflict = StreamError::ConcurrencyConflict {
            identity: identity(),
            expected: 0,
            actual: 1,
        };
        assert!(!conflict.is_transient());
    }

    #[test]
    fn projection_error_wraps_stream_error_transparently() {
        let io_err = std::io::Error::other("disk gone");
        let err = ProjectionError::from(StreamError::from(io_err));
        assert!(err.to_string().contains("disk gone"));
    }

    #[test]
    fn not_configured_display() {
        let err = ProjectionError::NotConfigured("balance".to_string());
        assert_eq!(
            err.to_string(),
            "no projection processor configured for 'balance'"
        );
    }

    #[test]
    fn step_error_display() {
        let err = StepError::AlreadyInitiated {
            step: "debit".to_string(),
        };
        assert_eq!(err.to_string(), "step 'debit' already initiated");

        let err = StepError::AlreadyTerminal {
            step: "debit".to_string(),
            status: StepStatus::Completed,
        };
        assert_eq!(err.to_string(), "'debit' already finished as Completed");
    }

    // Errors must cross task boundaries.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<StreamError>();
            assert_send_sync::<ProjectionError>();
            assert_send_sync::<StepError>();
            assert_send_sync::<NotifyError>();
        }
    };
}
