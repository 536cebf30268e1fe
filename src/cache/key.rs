//! Query keys: the identity of a cached result set.

use std::fmt;

// ============================================================================
// Operation names
// ============================================================================

pub const GET_RECENT_POSTS: &str = "getRecentPosts";
pub const GET_INFINITE_POSTS: &str = "getInfinitePosts";
pub const SEARCH_POSTS: &str = "searchPosts";
pub const GET_POST_BY_ID: &str = "getPostById";
pub const GET_USER_POSTS: &str = "getUserPosts";
pub const GET_POSTS: &str = "getPosts";
pub const GET_CURRENT_USER: &str = "getCurrentUser";
pub const GET_USERS: &str = "getUsers";
pub const GET_USER_BY_ID: &str = "getUserById";
pub const GET_COMMENTS: &str = "getComments";

// ============================================================================
// Query key
// ============================================================================

/// Ordered tuple of (operation, parameter...).
///
/// Two keys are equal iff every element is equal in order. A key is also a
/// prefix for invalidation: `[getPostById]` matches `[getPostById, "p1"]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
  parts: Vec<String>,
}

impl QueryKey {
  /// Key with just an operation name.
  pub fn new(operation: impl Into<String>) -> Self {
    Self {
      parts: vec![operation.into()],
    }
  }

  /// Append a parameter.
  pub fn with(mut self, param: impl Into<String>) -> Self {
    self.parts.push(param.into());
    self
  }

  pub fn operation(&self) -> &str {
    &self.parts[0]
  }

  pub fn params(&self) -> &[String] {
    &self.parts[1..]
  }

  /// True if every element of `prefix` equals the element at the same
  /// position in this key.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    self.parts.len() >= prefix.parts.len()
      && self.parts.iter().zip(&prefix.parts).all(|(a, b)| a == b)
  }

  pub fn comments(post_id: &str) -> Self {
    Self::new(GET_COMMENTS).with(post_id)
  }

  pub fn recent_posts() -> Self {
    Self::new(GET_RECENT_POSTS)
  }

  pub fn infinite_posts() -> Self {
    Self::new(GET_INFINITE_POSTS)
  }

  pub fn posts() -> Self {
    Self::new(GET_POSTS)
  }

  pub fn search_posts(term: &str) -> Self {
    Self::new(SEARCH_POSTS).with(term)
  }

  pub fn post_by_id(post_id: &str) -> Self {
    Self::new(GET_POST_BY_ID).with(post_id)
  }

  pub fn user_posts(user_id: &str) -> Self {
    Self::new(GET_USER_POSTS).with(user_id)
  }

  pub fn current_user() -> Self {
    Self::new(GET_CURRENT_USER)
  }

  pub fn users() -> Self {
    Self::new(GET_USERS)
  }

  pub fn user_by_id(user_id: &str) -> Self {
    Self::new(GET_USER_BY_ID).with(user_id)
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.operation())?;
    if !self.params().is_empty() {
      write!(f, "[{}]", self.params().join(", "))?;
    }
    Ok(())
  }
}
