//! Error types shared by the cache, the remote clients and the mutation layer.

use std::fmt;

use thiserror::Error;

/// Failure reported by a Remote Data Client call.
///
/// Errors are `Clone` so a failed fetch can be stored in its cache entry and
/// handed to every observer of that key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
  /// Backend unreachable or the request could not be completed
  #[error("transport error: {0}")]
  Transport(String),
  /// Malformed input, e.g. empty comment text
  #[error("validation error: {0}")]
  Validation(String),
  /// Target document does not exist
  #[error("{entity} {id} not found")]
  NotFound { entity: &'static str, id: String },
  /// An optimistic assumption was invalidated by a server-side change
  #[error("conflict: {0}")]
  Conflict(String),
}

impl RemoteError {
  pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
    Self::NotFound {
      entity,
      id: id.into(),
    }
  }
}

impl From<reqwest::Error> for RemoteError {
  fn from(err: reqwest::Error) -> Self {
    Self::Transport(err.to_string())
  }
}

/// Write operations that can fail at the mutation boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
  CreateAccount,
  SignIn,
  SignOut,
  CreatePost,
  UpdatePost,
  DeletePost,
  LikePost,
  SavePost,
  DeleteSavedPost,
  UpdateUser,
  CreateComment,
  ToggleCommentLike,
}

impl Operation {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::CreateAccount => "create account",
      Self::SignIn => "sign in",
      Self::SignOut => "sign out",
      Self::CreatePost => "create post",
      Self::UpdatePost => "update post",
      Self::DeletePost => "delete post",
      Self::LikePost => "like post",
      Self::SavePost => "save post",
      Self::DeleteSavedPost => "delete saved post",
      Self::UpdateUser => "update user",
      Self::CreateComment => "create comment",
      Self::ToggleCommentLike => "toggle comment like",
    }
  }
}

impl fmt::Display for Operation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A failed write, surfaced to the view layer after any rollback has run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} failed for {target}: {source}")]
pub struct MutationError {
  pub operation: Operation,
  /// Id of the entity the write targeted (comment id, post id, ...)
  pub target: String,
  #[source]
  pub source: RemoteError,
}

impl MutationError {
  pub fn new(operation: Operation, target: impl Into<String>, source: RemoteError) -> Self {
    Self {
      operation,
      target: target.into(),
      source,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_mutation_error_names_operation_and_target() {
    let err = MutationError::new(
      Operation::ToggleCommentLike,
      "c1",
      RemoteError::Transport("connection reset".to_string()),
    );

    let message = err.to_string();
    assert!(message.contains("toggle comment like"));
    assert!(message.contains("c1"));
    assert!(message.contains("connection reset"));
  }

  #[test]
  fn test_not_found_display() {
    let err = RemoteError::not_found("comment", "c9");
    assert_eq!(err.to_string(), "comment c9 not found");
  }
}
