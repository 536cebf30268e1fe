//! Remote Data Client: the network boundary to the managed backend.
//!
//! Everything behind [`RemoteClient`] is opaque to the cache and mutation
//! layers; they only see documents or a [`RemoteError`].

pub mod api_types;
mod http;
mod memory;
pub mod types;

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::RemoteError;

pub use http::HttpRemote;
pub use memory::{Hold, LikeRequest, MemoryRemote, RemoteOp};
pub use types::{
  Account, Author, Comment, NewPost, NewUser, Post, PostPages, SavedPost, Session, UpdatePost,
  UpdateUser, User, PROVISIONAL_PREFIX,
};

/// Data-access functions consumed by the cache and mutation layers.
#[async_trait]
pub trait RemoteClient: Send + Sync {
  // Accounts
  async fn create_account(&self, user: &NewUser) -> Result<User, RemoteError>;
  async fn sign_in(&self, email: &str, password: &str) -> Result<Session, RemoteError>;
  async fn sign_out(&self) -> Result<(), RemoteError>;
  async fn get_current_user(&self) -> Result<User, RemoteError>;

  // Posts
  async fn create_post(&self, post: &NewPost) -> Result<Post, RemoteError>;
  async fn get_post_by_id(&self, post_id: &str) -> Result<Post, RemoteError>;
  async fn update_post(&self, post: &UpdatePost) -> Result<Post, RemoteError>;
  async fn delete_post(&self, post_id: &str) -> Result<(), RemoteError>;
  async fn get_recent_posts(&self) -> Result<Vec<Post>, RemoteError>;
  /// One page of the feed, starting after the post with id `cursor`.
  async fn get_infinite_posts(&self, cursor: Option<&str>) -> Result<Vec<Post>, RemoteError>;
  async fn search_posts(&self, term: &str) -> Result<Vec<Post>, RemoteError>;
  async fn get_user_posts(&self, user_id: &str) -> Result<Vec<Post>, RemoteError>;
  /// Replace the post's likes with `likes`.
  async fn like_post(&self, post_id: &str, likes: &BTreeSet<String>) -> Result<Post, RemoteError>;
  async fn save_post(&self, user_id: &str, post_id: &str) -> Result<SavedPost, RemoteError>;
  async fn delete_saved_post(&self, saved_id: &str) -> Result<(), RemoteError>;

  // Users
  async fn get_users(&self, limit: Option<u32>) -> Result<Vec<User>, RemoteError>;
  async fn get_user_by_id(&self, user_id: &str) -> Result<User, RemoteError>;
  async fn update_user(&self, user: &UpdateUser) -> Result<User, RemoteError>;

  // Comments
  /// Comments on a post, newest first.
  async fn get_comments(&self, post_id: &str) -> Result<Vec<Comment>, RemoteError>;
  async fn create_comment(
    &self,
    post_id: &str,
    text: &str,
    author_id: &str,
  ) -> Result<Comment, RemoteError>;
  /// Toggle `user_id` in the comment's likes. `previous_liked_by` is the
  /// set the caller saw before toggling, so the request fully describes the
  /// intended result.
  async fn toggle_comment_like(
    &self,
    comment_id: &str,
    user_id: &str,
    previous_liked_by: &BTreeSet<String>,
    post_id: &str,
  ) -> Result<Comment, RemoteError>;
}

/// `liked_by` with `user_id` removed if present, added otherwise.
pub fn toggled(liked_by: &BTreeSet<String>, user_id: &str) -> BTreeSet<String> {
  let mut next = liked_by.clone();
  if !next.remove(user_id) {
    next.insert(user_id.to_string());
  }
  next
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_toggled_adds_then_removes() {
    let empty = BTreeSet::new();
    let liked = toggled(&empty, "u1");
    assert!(liked.contains("u1"));

    let unliked = toggled(&liked, "u1");
    assert_eq!(unliked, empty);
  }

  #[test]
  fn test_toggled_keeps_other_users() {
    let liked: BTreeSet<String> = ["u2".to_string()].into_iter().collect();
    let next = toggled(&liked, "u1");
    assert_eq!(next.len(), 2);
    assert!(next.contains("u2"));
  }
}
