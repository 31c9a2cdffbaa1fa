//! Command envelopes, idempotency keys and the execution status machine.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CommandIdError;

/// Idempotency key identifying one logical command across retries.
///
/// Ids are opaque to the system. They are validated only to keep them usable
/// as store keys and header values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommandId(String);

impl CommandId {
    /// Longest accepted id, in bytes.
    pub const MAX_LEN: usize = 256;

    /// Validate and wrap a caller-supplied id.
    ///
    /// # Errors
    ///
    /// Returns `CommandIdError` if the id is empty or whitespace, longer than
    /// [`CommandId::MAX_LEN`] bytes, or contains control characters.
    pub fn parse(raw: impl Into<String>) -> Result<Self, CommandIdError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(CommandIdError::Empty);
        }
        if raw.len() > Self::MAX_LEN {
            return Err(CommandIdError::TooLong { max: Self::MAX_LEN });
        }
        if raw.chars().any(char::is_control) {
            return Err(CommandIdError::ControlCharacter);
        }
        Ok(Self(raw))
    }

    /// Server-generated id (UUID v4).
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CommandId {
    type Error = CommandIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl TryFrom<&str> for CommandId {
    type Error = CommandIdError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<CommandId> for String {
    fn from(id: CommandId) -> Self {
        id.0
    }
}

/// Request envelope carrying an optional idempotency key and payload.
///
/// A command without an id is untracked: it runs on every submission and the
/// idempotency store is never consulted for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command<T = ()> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<CommandId>,
    #[serde(default = "Option::default")]
    value: Option<T>,
}

impl<T> Command<T> {
    /// Tracked command with a caller-supplied id.
    #[must_use]
    pub fn with_id(id: CommandId, value: T) -> Self {
        Self {
            id: Some(id),
            value: Some(value),
        }
    }

    /// Untracked command; idempotency is skipped for it.
    #[must_use]
    pub fn untracked(value: T) -> Self {
        Self {
            id: None,
            value: Some(value),
        }
    }

    /// Tracked command with a freshly generated id.
    #[must_use]
    pub fn tracked(value: T) -> Self {
        Self::with_id(CommandId::generate(), value)
    }

    #[must_use]
    pub fn id(&self) -> Option<&CommandId> {
        self.id.as_ref()
    }

    #[must_use]
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    #[must_use]
    pub fn is_tracked(&self) -> bool {
        self.id.is_some()
    }

    /// Replace the id (used when a transport supplies the key out of band).
    #[must_use]
    pub fn with_command_id(mut self, id: Option<CommandId>) -> Self {
        self.id = id;
        self
    }

    /// Assign a generated id when none is present and `generate_missing` is set.
    #[must_use]
    pub fn ensure_id(mut self, generate_missing: bool) -> Self {
        if self.id.is_none() && generate_missing {
            self.id = Some(CommandId::generate());
        }
        self
    }

    /// Split into id and payload.
    #[must_use]
    pub fn into_parts(self) -> (Option<CommandId>, Option<T>) {
        (self.id, self.value)
    }

    #[must_use]
    pub fn into_value(self) -> Option<T> {
        self.value
    }
}

impl<T> Default for Command<T> {
    fn default() -> Self {
        Self {
            id: None,
            value: None,
        }
    }
}

/// Execution state of a tracked command.
///
/// `NotStarted -> InProgress -> {Completed | Failed}`. Terminal states never
/// change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CommandExecutionStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl CommandExecutionStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is a forward-legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted, Self::InProgress)
                | (Self::InProgress, Self::Completed | Self::Failed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_unusable_ids() {
        assert_eq!(CommandId::parse(""), Err(CommandIdError::Empty));
        assert_eq!(CommandId::parse("   "), Err(CommandIdError::Empty));
        assert_eq!(
            CommandId::parse("a\nb"),
            Err(CommandIdError::ControlCharacter)
        );
        assert_eq!(
            CommandId::parse("x".repeat(CommandId::MAX_LEN + 1)),
            Err(CommandIdError::TooLong {
                max: CommandId::MAX_LEN
            })
        );
        assert_eq!(CommandId::parse("cmd-1").unwrap().as_str(), "cmd-1");
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(CommandId::generate(), CommandId::generate());
    }

    #[test]
    fn command_json_shape() {
        let cmd = Command::with_id(CommandId::parse("cmd-1").unwrap(), 42);
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json, serde_json::json!({"id": "cmd-1", "value": 42}));

        let untracked = Command::untracked("hi");
        let json = serde_json::to_value(&untracked).unwrap();
        assert_eq!(json, serde_json::json!({"value": "hi"}));
    }

    #[test]
    fn command_deserializes_with_missing_fields() {
        let cmd: Command<i32> = serde_json::from_str("{}").unwrap();
        assert!(!cmd.is_tracked());
        assert!(cmd.value().is_none());

        let bad = serde_json::from_str::<Command<i32>>(r#"{"id": ""}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn ensure_id_only_generates_when_asked() {
        let cmd = Command::untracked(1).ensure_id(false);
        assert!(!cmd.is_tracked());
        let cmd = cmd.ensure_id(true);
        assert!(cmd.is_tracked());

        let id = CommandId::parse("keep").unwrap();
        let cmd = Command::with_id(id.clone(), 1).ensure_id(true);
        assert_eq!(cmd.id(), Some(&id));
    }

    #[test]
    fn status_machine_allows_only_forward_transitions() {
        use CommandExecutionStatus::{Completed, Failed, InProgress, NotStarted};

        assert!(NotStarted.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Failed));

        assert!(!NotStarted.can_transition_to(Completed));
        assert!(!InProgress.can_transition_to(NotStarted));
        assert!(!Completed.can_transition_to(InProgress));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Completed));

        assert!(Completed.is_terminal());
        assert!(Failed.is_terminal());
        assert!(!InProgress.is_terminal());
        assert_eq!(CommandExecutionStatus::default(), NotStarted);
    }
}
