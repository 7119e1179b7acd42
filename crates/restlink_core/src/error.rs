//! Core error taxonomy surfaced to entity operation continuations.
//!
//! # Responsibility
//! - Classify failures into backend, lookup, validation and configuration
//!   kinds.
//! - Stay cheap to clone, since one backend failure fans out to every
//!   coalesced waiter.

use crate::backend::BackendError;
use crate::model::entity_id::EntityId;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Clone)]
pub enum CoreError {
    /// Transport or storage failure reported by the backend.
    BackendUnavailable(Arc<BackendError>),
    NotFound {
        kind: String,
        id: EntityId,
    },
    /// Caller supplied arguments the operation cannot accept.
    Validation(String),
    /// Schema or registry mismatch; raised while building a factory.
    Configuration(String),
    /// A pending load was abandoned because its id was deleted or the cache
    /// was cleared before the backend answered.
    Evicted {
        kind: String,
        id: EntityId,
    },
    /// The instance outlived the session that owns it.
    SessionClosed,
}

impl Display for CoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BackendUnavailable(err) => write!(f, "backend unavailable: {err}"),
            Self::NotFound { kind, id } => write!(f, "{kind} not found: {id}"),
            Self::Validation(message) => write!(f, "validation failed: {message}"),
            Self::Configuration(message) => write!(f, "invalid configuration: {message}"),
            Self::Evicted { kind, id } => {
                write!(f, "{kind} {id} was evicted before its load completed")
            }
            Self::SessionClosed => write!(f, "owning session has been dropped"),
        }
    }
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::BackendUnavailable(err) => Some(err.as_ref()),
            Self::NotFound { .. }
            | Self::Validation(_)
            | Self::Configuration(_)
            | Self::Evicted { .. }
            | Self::SessionClosed => None,
        }
    }
}

impl From<BackendError> for CoreError {
    fn from(value: BackendError) -> Self {
        Self::BackendUnavailable(Arc::new(value))
    }
}
