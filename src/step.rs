//! Command step tracking for multi-step sagas.
//!
//! Step facts for one command instance are events on the command's own
//! stream (see [`CommandIdentity::stream_identity`]). Every transition is
//! validated against the folded state and then appended with an
//! optimistic concurrency check, so two workers racing on the same step
//! cannot both win.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::context::EventContext;
use crate::error::{StepError, StreamError};
use crate::event::EventEnvelope;
use crate::identity::{CommandIdentity, StepTarget};
use crate::stream::{AppendConstraint, EventStream};

/// Status of a recorded step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    /// Started, no outcome yet.
    Initiated,
    Completed,
    Failed,
}

impl StepStatus {
    /// Completed and Failed are final.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Initiated)
    }
}

/// The audit record of one step of one command instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandStepRecord {
    /// Domain of the owning command.
    pub domain: String,
    /// Name of the owning command.
    pub command_name: String,
    /// Instance id of the owning command.
    pub command_instance_id: String,
    /// Step name, unique within the command instance.
    pub step_name: String,
    pub status: StepStatus,
    /// Result text on completion, failure reason on failure.
    pub result_text: Option<String>,
    /// The entity the step acts on.
    pub target: StepTarget,
    /// When the initiation was logged.
    pub initiated_at: DateTime<Utc>,
    /// When the step completed or failed, `None` while initiated.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Overall status of a command instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    /// Nothing recorded yet.
    NotStarted,
    /// At least one step recorded, no command-level outcome.
    InProgress,
    /// The command recorded its successful outcome.
    Completed,
    /// The command recorded its failure.
    Failed,
}

/// Facts appended to a command stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum StepEvent {
    StepInitiated { step: String, target: StepTarget },
    StepCompleted { step: String, result: Option<String> },
    StepFailed { step: String, reason: String },
    StepReset { step: String },
    CommandCompleted { result: Option<String> },
    CommandFailed { reason: String },
}

impl StepEvent {
    fn step_name(&self) -> Option<&str> {
        match self {
            Self::StepInitiated { step, .. }
            | Self::StepCompleted { step, .. }
            | Self::StepFailed { step, .. }
            | Self::StepReset { step } => Some(step),
            Self::CommandCompleted { .. } | Self::CommandFailed { .. } => None,
        }
    }

    /// Whether a committed fact could change the validity of `self`.
    ///
    /// Facts about a different step never do. Command-level outcomes on
    /// either side always do. Events this tracker did not write are
    /// ignored.
    fn overlaps(&self, committed: &EventEnvelope) -> bool {
        let Some(other) = committed.decode::<StepEvent>() else {
            return false;
        };
        match (self.step_name(), other.step_name()) {
            (Some(mine), Some(theirs)) => mine == theirs,
            _ => true,
        }
    }
}

/// Folded state of a command stream.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandState {
    identity: CommandIdentity,
    /// Step records in initiation order.
    steps: Vec<CommandStepRecord>,
    status: CommandStatus,
    result_text: Option<String>,
    sequence_number: u64,
}

impl CommandState {
    fn new(identity: CommandIdentity) -> Self {
        Self {
            identity,
            steps: Vec::new(),
            status: CommandStatus::NotStarted,
            result_text: None,
            sequence_number: 0,
        }
    }

    fn fold(identity: &CommandIdentity, events: &[EventEnvelope]) -> Self {
        let mut state = Self::new(identity.clone());
        for envelope in events {
            if let Some(event) = envelope.decode::<StepEvent>() {
                state.apply(envelope, event);
            }
            state.sequence_number = envelope.sequence_number;
        }
        state
    }

    fn apply(&mut self, envelope: &EventEnvelope, event: StepEvent) {
        if self.status == CommandStatus::NotStarted {
            self.status = CommandStatus::InProgress;
        }
        match event {
            StepEvent::StepInitiated { step, target } => {
                self.steps.push(CommandStepRecord {
                    domain: self.identity.domain.clone(),
                    command_name: self.identity.command_name.clone(),
                    command_instance_id: self.identity.instance_id.clone(),
                    step_name: step,
                    status: StepStatus::Initiated,
                    result_text: None,
                    target,
                    initiated_at: envelope.logged_at,
                    finished_at: None,
                });
            }
            StepEvent::StepCompleted { step, result } => {
                self.finish(&step, StepStatus::Completed, result, envelope.logged_at);
            }
            StepEvent::StepFailed { step, reason } => {
                self.finish(&step, StepStatus::Failed, Some(reason), envelope.logged_at);
            }
            StepEvent::StepReset { step } => {
                self.steps.retain(|r| r.step_name != step);
            }
            StepEvent::CommandCompleted { result } => {
                self.status = CommandStatus::Completed;
                self.result_text = result;
            }
            StepEvent::CommandFailed { reason } => {
                self.status = CommandStatus::Failed;
                self.result_text = Some(reason);
            }
        }
    }

    fn finish(
        &mut self,
        step: &str,
        status: StepStatus,
        result_text: Option<String>,
        at: DateTime<Utc>,
    ) {
        if let Some(record) = self.steps.iter_mut().find(|r| r.step_name == step) {
            record.status = status;
            record.result_text = result_text;
            record.finished_at = Some(at);
        }
    }

    /// Reject transitions the current state does not allow.
    fn check(&self, event: &StepEvent) -> Result<(), StepError> {
        if let Some(status) = self.terminal_status() {
            return Err(StepError::AlreadyTerminal {
                step: self.identity.command_name.clone(),
                status,
            });
        }
        let Some(name) = event.step_name() else {
            return Ok(());
        };
        let record = self.step(name);
        match (event, record) {
            (StepEvent::StepInitiated { .. }, Some(_)) => Err(StepError::AlreadyInitiated {
                step: name.to_owned(),
            }),
            (StepEvent::StepInitiated { .. }, None) => Ok(()),
            (_, None) => Err(StepError::NotInitiated {
                step: name.to_owned(),
            }),
            (_, Some(r)) if r.status.is_terminal() => Err(StepError::AlreadyTerminal {
                step: name.to_owned(),
                status: r.status,
            }),
            (_, Some(_)) => Ok(()),
        }
    }

    fn terminal_status(&self) -> Option<StepStatus> {
        match self.status {
            CommandStatus::Completed => Some(StepStatus::Completed),
            CommandStatus::Failed => Some(StepStatus::Failed),
            CommandStatus::NotStarted | CommandStatus::InProgress => None,
        }
    }

    /// The command instance this state belongs to.
    pub fn identity(&self) -> &CommandIdentity {
        &self.identity
    }

    /// Recorded steps in initiation order. Reset steps are absent.
    pub fn steps(&self) -> &[CommandStepRecord] {
        &self.steps
    }

    /// The record of `name`, if initiated and not reset.
    pub fn step(&self, name: &str) -> Option<&CommandStepRecord> {
        self.steps.iter().find(|r| r.step_name == name)
    }

    /// Overall command status.
    pub fn status(&self) -> CommandStatus {
        self.status
    }

    /// Command-level result text or failure reason.
    pub fn result_text(&self) -> Option<&str> {
        self.result_text.as_deref()
    }

    /// Sequence number of the last fact folded.
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }
}

/// Records step transitions for one command instance.
#[derive(Debug, Clone)]
pub struct CommandTracker {
    identity: CommandIdentity,
    stream: EventStream,
    max_attempts: u32,
}

impl CommandTracker {
    pub(crate) fn new(identity: CommandIdentity, stream: EventStream, max_attempts: u32) -> Self {
        Self {
            identity,
            stream,
            max_attempts: max_attempts.max(1),
        }
    }

    /// The tracked command instance.
    pub fn identity(&self) -> &CommandIdentity {
        &self.identity
    }

    /// Mark `step` as initiated against `target`.
    ///
    /// # Errors
    ///
    /// [`StepError::AlreadyInitiated`] if the step has a record that was
    /// not reset, [`StepError::AlreadyTerminal`] if the command finished.
    pub async fn initiate_step(
        &self,
        step: impl Into<String>,
        target: StepTarget,
    ) -> Result<(), StepError> {
        self.record(StepEvent::StepInitiated {
            step: step.into(),
            target,
        })
        .await
    }

    /// Mark an initiated step as completed.
    ///
    /// # Errors
    ///
    /// [`StepError::NotInitiated`] without an initiated record,
    /// [`StepError::AlreadyTerminal`] if it already finished.
    pub async fn step_completed(
        &self,
        step: impl Into<String>,
        result_text: Option<String>,
    ) -> Result<(), StepError> {
        self.record(StepEvent::StepCompleted {
            step: step.into(),
            result: result_text,
        })
        .await
    }

    /// Mark an initiated step as failed. Errors as [`step_completed`](Self::step_completed).
    pub async fn step_failed(
        &self,
        step: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<(), StepError> {
        self.record(StepEvent::StepFailed {
            step: step.into(),
            reason: reason.into(),
        })
        .await
    }

    /// Return an initiated (but unfinished) step to not-started, so it can
    /// be initiated again.
    pub async fn reset_step(&self, step: impl Into<String>) -> Result<(), StepError> {
        self.record(StepEvent::StepReset { step: step.into() }).await
    }

    /// Record the command's successful outcome. At most once.
    pub async fn complete(&self, result_text: Option<String>) -> Result<(), StepError> {
        self.record(StepEvent::CommandCompleted {
            result: result_text,
        })
        .await
    }

    /// Record the command's failure. At most once.
    pub async fn fail(&self, reason: impl Into<String>) -> Result<(), StepError> {
        self.record(StepEvent::CommandFailed {
            reason: reason.into(),
        })
        .await
    }

    /// Fold the command stream.
    pub async fn state(&self) -> Result<CommandState, StepError> {
        let events = self.stream.read_all().await?;
        Ok(CommandState::fold(&self.identity, &events))
    }

    /// Current step records, in initiation order.
    pub async fn steps(&self) -> Result<Vec<CommandStepRecord>, StepError> {
        Ok(self.state().await?.steps)
    }

    /// Current record of one step.
    pub async fn step(&self, name: &str) -> Result<Option<CommandStepRecord>, StepError> {
        Ok(self.state().await?.step(name).cloned())
    }

    /// Current overall status.
    pub async fn status(&self) -> Result<CommandStatus, StepError> {
        Ok(self.state().await?.status)
    }

    /// Read, validate and append `event`, retrying on concurrency
    /// conflicts.
    ///
    /// A conflict caused only by facts about other steps is retried
    /// without limit. A conflict that touches the same step or the command
    /// outcome counts towards `max_attempts`, as does one that shows no
    /// new facts on re-read.
    async fn record(&self, event: StepEvent) -> Result<(), StepError> {
        let span = tracing::info_span!(
            "command_step",
            command = %self.identity,
            step = event.step_name().unwrap_or("*"),
        );
        async move {
            let ctx =
                EventContext::default().with_correlation_id(self.identity.instance_id.clone());
            let mut contended = 0u32;
            let mut lost_at: Option<u64> = None;
            loop {
                let events = self.stream.read_all().await?;
                let state = CommandState::fold(&self.identity, &events);
                state.check(&event)?;

                if let Some(seen) = lost_at {
                    let newer = events.iter().filter(|e| e.sequence_number > seen);
                    let mut newer = newer.peekable();
                    let overlapping =
                        newer.peek().is_none() || newer.any(|e| event.overlaps(e));
                    if overlapping {
                        contended += 1;
                        if contended >= self.max_attempts {
                            return Err(StepError::Contended {
                                attempts: contended,
                            });
                        }
                    }
                }

                let constraint = AppendConstraint::at_tail(state.sequence_number);
                match self.stream.append_event(&event, &ctx, constraint).await {
                    Ok(sequence_number) => {
                        tracing::info!(sequence_number, transition = ?event, "step recorded");
                        return Ok(());
                    }
                    Err(
                        StreamError::ConcurrencyConflict { .. } | StreamError::AlreadyExists { .. },
                    ) => {
                        tracing::debug!(contended, "command stream moved, re-validating");
                        lost_at = Some(state.sequence_number);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        .instrument(span)
        .await
    }
}
