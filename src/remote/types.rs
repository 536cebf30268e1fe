use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

/// Prefix reserved for locally generated comment ids. Backend document ids
/// never contain `:`, so provisional ids cannot collide with server ids.
pub const PROVISIONAL_PREFIX: &str = "optimistic:";

/// Public profile attached to posts and comments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
  pub id: String,
  pub name: String,
  pub username: String,
  pub image_url: Option<String>,
}

/// A comment on a post. Lists are ordered newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
  pub id: String,
  pub post_id: String,
  pub author_id: String,
  pub author: Option<Author>,
  pub text: String,
  pub liked_by: BTreeSet<String>,
  pub created_at: DateTime<Utc>,
  /// Created locally, not yet confirmed by the backend
  pub pending: bool,
}

impl Comment {
  /// Build a not-yet-confirmed comment with a locally unique id.
  pub fn provisional(
    seq: u64,
    post_id: &str,
    author_id: &str,
    text: &str,
    author: Option<Author>,
  ) -> Self {
    Self {
      id: format!("{}{}", PROVISIONAL_PREFIX, seq),
      post_id: post_id.to_string(),
      author_id: author_id.to_string(),
      author,
      text: text.to_string(),
      liked_by: BTreeSet::new(),
      created_at: Utc::now(),
      pending: true,
    }
  }

  pub fn is_provisional(&self) -> bool {
    self.pending || self.id.starts_with(PROVISIONAL_PREFIX)
  }

  pub fn is_liked_by(&self, user_id: &str) -> bool {
    self.liked_by.contains(user_id)
  }

  pub fn like_count(&self) -> usize {
    self.liked_by.len()
  }
}

/// A post in the feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
  pub id: String,
  pub creator_id: String,
  pub creator: Option<Author>,
  pub caption: String,
  pub image_id: Option<String>,
  pub image_url: Option<String>,
  pub location: Option<String>,
  pub tags: Vec<String>,
  /// Ids of users who liked the post
  pub likes: BTreeSet<String>,
  pub created_at: DateTime<Utc>,
}

/// A saved-post record linking a user to a post
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedPost {
  pub id: String,
  pub user_id: String,
  pub post_id: String,
}

/// Full user profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
  pub id: String,
  pub account_id: String,
  pub name: String,
  pub username: String,
  pub email: String,
  pub bio: Option<String>,
  pub image_url: Option<String>,
  pub liked_post_ids: Vec<String>,
  pub saves: Vec<SavedPost>,
}

impl User {
  pub fn author(&self) -> Author {
    Author {
      id: self.id.clone(),
      name: self.name.clone(),
      username: self.username.clone(),
      image_url: self.image_url.clone(),
    }
  }
}

/// Auth account as returned by account creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
  pub id: String,
  pub name: String,
  pub email: String,
}

/// Active login session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
  pub id: String,
  pub account_id: String,
  /// Session secret, sent back on later requests when present
  pub secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
  pub name: String,
  pub username: String,
  pub email: String,
  pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPost {
  pub creator_id: String,
  pub caption: String,
  pub image_id: Option<String>,
  pub image_url: Option<String>,
  pub location: Option<String>,
  pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePost {
  pub post_id: String,
  pub caption: String,
  pub image_id: Option<String>,
  pub image_url: Option<String>,
  pub location: Option<String>,
  pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateUser {
  pub user_id: String,
  pub name: String,
  pub bio: Option<String>,
  pub image_url: Option<String>,
}

/// Pages of the infinite feed, oldest page first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PostPages {
  pub pages: Vec<Vec<Post>>,
  /// Set once a fetched page came back empty
  pub exhausted: bool,
}

impl PostPages {
  /// Cursor for the next page: id of the last post of the last page.
  pub fn next_cursor(&self) -> Option<&str> {
    self
      .pages
      .last()
      .and_then(|page| page.last())
      .map(|post| post.id.as_str())
  }

  pub fn has_next_page(&self) -> bool {
    !self.exhausted
  }

  pub fn posts(&self) -> impl Iterator<Item = &Post> {
    self.pages.iter().flatten()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_provisional_ids_are_tagged() {
    let comment = Comment::provisional(7, "p1", "u1", "hello", None);

    assert_eq!(comment.id, "optimistic:7");
    assert!(comment.is_provisional());
    assert!(comment.liked_by.is_empty());
  }

  #[test]
  fn test_next_cursor_is_last_post_of_last_page() {
    let post = |id: &str| Post {
      id: id.to_string(),
      creator_id: "u1".to_string(),
      creator: None,
      caption: String::new(),
      image_id: None,
      image_url: None,
      location: None,
      tags: Vec::new(),
      likes: BTreeSet::new(),
      created_at: Utc::now(),
    };

    let mut pages = PostPages::default();
    assert_eq!(pages.next_cursor(), None);

    pages.pages.push(vec![post("a"), post("b")]);
    pages.pages.push(vec![post("c")]);
    assert_eq!(pages.next_cursor(), Some("c"));
    assert_eq!(pages.posts().count(), 3);
  }
}
