use thiserror::Error;

/// Conflicts that the caller resolves by re-fetching the scope and retrying
#[derive(Debug, Clone, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum ConflictKind {
    /// Client already belongs to a group of the same instance
    #[strum(serialize = "already_member")]
    AlreadyMember,
    /// Two rules in one scope share an order value
    #[strum(serialize = "duplicate_order")]
    DuplicateOrder,
    /// Reorder id list is not a permutation of the scope's rule ids
    #[strum(serialize = "incomplete_set")]
    IncompleteSet,
    /// A group with the same identifier exists for the instance
    #[strum(serialize = "group_exists")]
    GroupExists,
}

/// Core error types for the policy engine
#[derive(Debug, Error)]
pub enum Error {
    /// Input validation failed (malformed destination, port, chain, ...)
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Referenced group, rule or instance does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Mutation conflicts with the current state of the scope
    #[error("Conflict ({kind}): {message}")]
    Conflict { kind: ConflictKind, message: String },

    /// Scope lock could not be acquired in time
    #[error("Scope '{scope}' is busy, try again")]
    Busy { scope: String },

    /// IP allocator or enforcement driver failed or timed out
    #[error("{collaborator} unavailable: {message}")]
    CollaboratorUnavailable {
        collaborator: &'static str,
        message: String,
    },

    /// The change was committed, but a collaborator step after the commit
    /// failed. Resubmitting would apply the change twice.
    #[error("Change committed, but {collaborator} failed: {message}")]
    Committed {
        collaborator: &'static str,
        message: String,
    },

    /// Scope state violates an engine invariant; resolution fails closed
    #[error("Corrupted scope '{scope}': {message}")]
    Corruption { scope: String, message: String },

    /// Persisted store could not be used
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Store-specific errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Store format version mismatch: found v{found}, expected v{expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("Store location unavailable")]
    LocationUnavailable,
}

/// Error classes of the engine's error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum ErrorCategory {
    #[strum(serialize = "validation")]
    Validation,
    #[strum(serialize = "not_found")]
    NotFound,
    #[strum(serialize = "conflict")]
    Conflict,
    #[strum(serialize = "busy")]
    Busy,
    #[strum(serialize = "collaborator_unavailable")]
    CollaboratorUnavailable,
    #[strum(serialize = "corruption")]
    Corruption,
    #[strum(serialize = "internal")]
    Internal,
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn conflict(kind: ConflictKind, message: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            message: message.into(),
        }
    }

    pub fn corruption(scope: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Corruption {
            scope: scope.into(),
            message: message.into(),
        }
    }

    pub fn collaborator(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self::CollaboratorUnavailable {
            collaborator,
            message: message.into(),
        }
    }

    pub fn committed(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self::Committed {
            collaborator,
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Validation { .. } => ErrorCategory::Validation,
            Error::NotFound { .. } => ErrorCategory::NotFound,
            Error::Conflict { .. } => ErrorCategory::Conflict,
            Error::Busy { .. } => ErrorCategory::Busy,
            Error::CollaboratorUnavailable { .. } | Error::Committed { .. } => {
                ErrorCategory::CollaboratorUnavailable
            }
            Error::Corruption { .. } => ErrorCategory::Corruption,
            Error::Store(StoreError::ChecksumMismatch { .. }) => ErrorCategory::Corruption,
            Error::Store(_) | Error::Io(_) | Error::Serialization(_) => ErrorCategory::Internal,
        }
    }

    /// Returns `true` when re-fetching the scope and retrying can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Conflict { kind, .. } => matches!(
                kind,
                ConflictKind::IncompleteSet | ConflictKind::DuplicateOrder
            ),
            Error::Busy { .. } | Error::CollaboratorUnavailable { .. } => true,
            _ => false,
        }
    }

    pub fn conflict_kind(&self) -> Option<&ConflictKind> {
        match self {
            Error::Conflict { kind, .. } => Some(kind),
            _ => None,
        }
    }

    /// Builds the caller-facing explanation for this error.
    pub fn translate(&self) -> ErrorTranslation {
        match self {
            Error::Validation { field, message } => {
                ErrorTranslation::new(format!("Invalid {field}: {message}"))
                    .with_suggestion("Correct the field and submit again")
            }
            Error::NotFound { kind, id } => ErrorTranslation::new(format!("{kind} '{id}' not found"))
                .with_suggestion("Refresh the list, it may have been deleted"),
            Error::Conflict { kind, message } => {
                let translation = ErrorTranslation::new(message.clone());
                match kind {
                    ConflictKind::AlreadyMember => translation
                        .with_suggestion("Remove the client from its current group first"),
                    ConflictKind::GroupExists => {
                        translation.with_suggestion("Choose a different group name")
                    }
                    ConflictKind::IncompleteSet | ConflictKind::DuplicateOrder => translation
                        .with_suggestion("Re-fetch the rule list")
                        .with_suggestion("Submit the complete ordered list of rule ids"),
                }
            }
            Error::Busy { scope } => {
                ErrorTranslation::new(format!("Another change to '{scope}' is in progress"))
                    .with_suggestion("Re-fetch the rule list and retry")
            }
            Error::CollaboratorUnavailable {
                collaborator,
                message,
            } => ErrorTranslation::new(format!("{collaborator} unavailable: {message}"))
                .with_suggestion("Retry with backoff")
                .with_suggestion("Check that the service is running"),
            Error::Committed {
                collaborator,
                message,
            } => ErrorTranslation::new(format!(
                "The change was saved, but {collaborator} failed: {message}"
            ))
            .with_suggestion("Do not submit the change again")
            .with_suggestion("Reapply the instance policy once the service is back"),
            Error::Corruption { scope, message } => {
                ErrorTranslation::new(format!("Policy for '{scope}' is inconsistent: {message}"))
                    .with_suggestion("Traffic for this scope is denied until it is repaired")
                    .with_suggestion("Submit a full reorder of the scope to repair it")
            }
            other => ErrorTranslation::new(other.to_string())
                .with_suggestion("Check the service log for details"),
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            Error::validation("port", "bad").category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            Error::not_found("group", "g1").category(),
            ErrorCategory::NotFound
        );
        assert_eq!(
            Error::corruption("group g1", "dup").category(),
            ErrorCategory::Corruption
        );
        assert_eq!(
            Error::Store(StoreError::ChecksumMismatch {
                expected: "a".into(),
                actual: "b".into()
            })
            .category(),
            ErrorCategory::Corruption
        );
    }

    #[test]
    fn test_retryable() {
        assert!(Error::conflict(ConflictKind::IncompleteSet, "x").is_retryable());
        assert!(!Error::conflict(ConflictKind::AlreadyMember, "x").is_retryable());
        assert!(
            Error::Busy {
                scope: "machine".into()
            }
            .is_retryable()
        );
        assert!(Error::collaborator("IP allocator", "down").is_retryable());
        assert!(!Error::validation("destination", "bad").is_retryable());
        assert!(!Error::committed("enforcement driver", "down").is_retryable());
    }

    #[test]
    fn test_committed_translation_warns_against_resubmit() {
        let err = Error::committed("enforcement driver", "iptables-restore failed");
        assert_eq!(err.category(), ErrorCategory::CollaboratorUnavailable);
        let translation = err.translate();
        assert!(translation.user_message.contains("saved"));
        assert!(translation.suggestions.iter().any(|s| s.contains("Do not submit")));
    }

    #[test]
    fn test_incomplete_set_translation_asks_for_refetch() {
        let translation = Error::conflict(ConflictKind::IncompleteSet, "missing ids").translate();
        assert_eq!(translation.user_message, "missing ids");
        assert!(translation.suggestions.iter().any(|s| s.contains("Re-fetch")));
    }

    #[test]
    fn test_corruption_translation_mentions_deny() {
        let translation = Error::corruption("group g1", "duplicate order 2").translate();
        assert!(translation.user_message.contains("g1"));
        assert!(translation.suggestions.iter().any(|s| s.contains("denied")));
    }
}
