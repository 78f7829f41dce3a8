//! Error taxonomy for backend requests.

use std::time::Duration;

/// Errors returned by a [`Transport`](crate::sync::Transport).
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
  /// HTTP 429. A scheduling signal rather than a failure.
  #[error("rate limited by backend")]
  RateLimited {
    /// Server-provided `Retry-After`, if any
    retry_after: Option<Duration>,
  },

  /// HTTP 403. Permanent for the session.
  #[error("no permission: {0}")]
  Forbidden(String),

  /// Any other 4xx, typically from a mutation.
  #[error("request rejected ({status}): {message}")]
  Validation { status: u16, message: String },

  /// Network failure, timeout, 5xx or undecodable payload.
  #[error("transient error: {0}")]
  Transient(String),
}

impl FetchError {
  /// Classify a non-success HTTP status.
  pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
    let message = message.into();
    match status {
      429 => Self::RateLimited { retry_after },
      403 => Self::Forbidden(message),
      400..=499 => Self::Validation { status, message },
      _ => Self::Transient(format!("HTTP {}: {}", status, message)),
    }
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::RateLimited { .. } => ErrorKind::RateLimited,
      Self::Forbidden(_) => ErrorKind::Forbidden,
      Self::Validation { .. } => ErrorKind::Validation,
      Self::Transient(_) => ErrorKind::Transient,
    }
  }
}

/// Category of an error stored in query state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  RateLimited,
  Forbidden,
  Validation,
  Transient,
}

impl std::fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::RateLimited => write!(f, "rate limited"),
      Self::Forbidden => write!(f, "no permission"),
      Self::Validation => write!(f, "validation"),
      Self::Transient => write!(f, "transient"),
    }
  }
}
