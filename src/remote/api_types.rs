//! Serde types matching the backend's document JSON.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on application needs. Relationship
//! fields may arrive expanded (a nested document) or as a bare id.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{Account, Author, Comment, Post, SavedPost, Session, User};

/// Id placeholder asking the backend to generate a document id
pub const UNIQUE_ID: &str = "unique()";

// ============================================================================
// Common nested types
// ============================================================================

/// Anything that carries a document id
pub trait DocumentId {
  fn document_id(&self) -> &str;
}

/// A relationship field: either the expanded document or its id.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ApiLink<T> {
  Expanded(T),
  Id(String),
}

impl<T: DocumentId> ApiLink<T> {
  pub fn id(&self) -> &str {
    match self {
      ApiLink::Expanded(doc) => doc.document_id(),
      ApiLink::Id(id) => id,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiRef {
  #[serde(rename = "$id")]
  pub id: String,
}

impl DocumentId for ApiRef {
  fn document_id(&self) -> &str {
    &self.id
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiUserRef {
  #[serde(rename = "$id")]
  pub id: String,
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub username: String,
  #[serde(rename = "imageUrl")]
  pub image_url: Option<String>,
}

impl DocumentId for ApiUserRef {
  fn document_id(&self) -> &str {
    &self.id
  }
}

impl ApiLink<ApiUserRef> {
  fn author(&self) -> Option<Author> {
    match self {
      ApiLink::Expanded(user) => Some(Author {
        id: user.id.clone(),
        name: user.name.clone(),
        username: user.username.clone(),
        image_url: user.image_url.clone(),
      }),
      ApiLink::Id(_) => None,
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiDocumentList<T> {
  #[serde(default)]
  pub total: u64,
  pub documents: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
  #[serde(default)]
  pub message: String,
  #[serde(default)]
  pub code: u16,
  #[serde(rename = "type", default)]
  pub kind: String,
}

// ============================================================================
// Documents
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiComment {
  #[serde(rename = "$id")]
  pub id: String,
  #[serde(rename = "$createdAt")]
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub comment: String,
  #[serde(rename = "likesArray", default)]
  pub likes_array: Vec<String>,
  pub users: Option<ApiLink<ApiUserRef>>,
  pub posts: Option<ApiLink<ApiRef>>,
}

impl ApiComment {
  /// Convert to a domain comment. `post_id` is used when the document does
  /// not carry its post relationship.
  pub fn into_comment(self, post_id: &str) -> Comment {
    Comment {
      post_id: self
        .posts
        .as_ref()
        .map(|link| link.id().to_string())
        .unwrap_or_else(|| post_id.to_string()),
      author_id: self
        .users
        .as_ref()
        .map(|link| link.id().to_string())
        .unwrap_or_default(),
      author: self.users.as_ref().and_then(ApiLink::author),
      id: self.id,
      text: self.comment,
      liked_by: self.likes_array.into_iter().collect(),
      created_at: self.created_at,
      pending: false,
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiPost {
  #[serde(rename = "$id")]
  pub id: String,
  #[serde(rename = "$createdAt")]
  pub created_at: DateTime<Utc>,
  pub creator: Option<ApiLink<ApiUserRef>>,
  #[serde(default)]
  pub caption: String,
  #[serde(rename = "imageUrl")]
  pub image_url: Option<String>,
  #[serde(rename = "imageId")]
  pub image_id: Option<String>,
  pub location: Option<String>,
  #[serde(default)]
  pub tags: Vec<String>,
  #[serde(default)]
  pub likes: Vec<ApiLink<ApiUserRef>>,
}

impl DocumentId for ApiPost {
  fn document_id(&self) -> &str {
    &self.id
  }
}

impl From<ApiPost> for Post {
  fn from(post: ApiPost) -> Self {
    Post {
      creator_id: post
        .creator
        .as_ref()
        .map(|link| link.id().to_string())
        .unwrap_or_default(),
      creator: post.creator.as_ref().and_then(ApiLink::author),
      likes: post
        .likes
        .iter()
        .map(|link| link.id().to_string())
        .collect::<BTreeSet<_>>(),
      id: post.id,
      caption: post.caption,
      image_id: post.image_id,
      image_url: post.image_url,
      location: post.location,
      tags: post.tags,
      created_at: post.created_at,
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiSave {
  #[serde(rename = "$id")]
  pub id: String,
  pub user: Option<ApiLink<ApiRef>>,
  pub post: Option<ApiLink<ApiRef>>,
}

impl ApiSave {
  pub fn into_saved(self, user_id: &str) -> SavedPost {
    SavedPost {
      user_id: self
        .user
        .as_ref()
        .map(|link| link.id().to_string())
        .unwrap_or_else(|| user_id.to_string()),
      post_id: self
        .post
        .as_ref()
        .map(|link| link.id().to_string())
        .unwrap_or_default(),
      id: self.id,
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiUser {
  #[serde(rename = "$id")]
  pub id: String,
  #[serde(rename = "accountId", default)]
  pub account_id: String,
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub username: String,
  #[serde(default)]
  pub email: String,
  pub bio: Option<String>,
  #[serde(rename = "imageUrl")]
  pub image_url: Option<String>,
  #[serde(default)]
  pub liked: Vec<ApiLink<ApiRef>>,
  #[serde(default)]
  pub save: Vec<ApiSave>,
}

impl From<ApiUser> for User {
  fn from(user: ApiUser) -> Self {
    let saves = user
      .save
      .into_iter()
      .map(|save| save.into_saved(&user.id))
      .collect();

    User {
      liked_post_ids: user
        .liked
        .iter()
        .map(|link| link.id().to_string())
        .collect(),
      saves,
      id: user.id,
      account_id: user.account_id,
      name: user.name,
      username: user.username,
      email: user.email,
      bio: user.bio,
      image_url: user.image_url,
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiAccount {
  #[serde(rename = "$id")]
  pub id: String,
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub email: String,
}

impl From<ApiAccount> for Account {
  fn from(account: ApiAccount) -> Self {
    Account {
      id: account.id,
      name: account.name,
      email: account.email,
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiSession {
  #[serde(rename = "$id")]
  pub id: String,
  #[serde(rename = "userId")]
  pub user_id: String,
  #[serde(default)]
  pub secret: Option<String>,
}

impl From<ApiSession> for Session {
  fn from(session: ApiSession) -> Self {
    Session {
      id: session.id,
      account_id: session.user_id,
      secret: session.secret.filter(|secret| !secret.is_empty()),
    }
  }
}

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ApiCreateDocument<T> {
  #[serde(rename = "documentId")]
  pub document_id: &'static str,
  pub data: T,
}

impl<T> ApiCreateDocument<T> {
  pub fn new(data: T) -> Self {
    Self {
      document_id: UNIQUE_ID,
      data,
    }
  }
}

#[derive(Debug, Serialize)]
pub struct ApiUpdateDocument<T> {
  pub data: T,
}

#[derive(Debug, Serialize)]
pub struct ApiCreateAccount<'a> {
  #[serde(rename = "userId")]
  pub user_id: &'static str,
  pub email: &'a str,
  pub password: &'a str,
  pub name: &'a str,
}

#[derive(Debug, Serialize)]
pub struct ApiCredentials<'a> {
  pub email: &'a str,
  pub password: &'a str,
}

#[derive(Debug, Serialize)]
pub struct ApiUserData<'a> {
  #[serde(rename = "accountId")]
  pub account_id: &'a str,
  pub name: &'a str,
  pub username: &'a str,
  pub email: &'a str,
}

#[derive(Debug, Serialize)]
pub struct ApiUserPatch<'a> {
  pub name: &'a str,
  pub bio: Option<&'a str>,
  #[serde(rename = "imageUrl")]
  pub image_url: Option<&'a str>,
}

#[derive(Debug, Serialize)]
pub struct ApiPostData<'a> {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub creator: Option<&'a str>,
  pub caption: &'a str,
  #[serde(rename = "imageUrl")]
  pub image_url: Option<&'a str>,
  #[serde(rename = "imageId")]
  pub image_id: Option<&'a str>,
  pub location: Option<&'a str>,
  pub tags: &'a [String],
}

#[derive(Debug, Serialize)]
pub struct ApiPostLikes<'a> {
  pub likes: Vec<&'a str>,
}

#[derive(Debug, Serialize)]
pub struct ApiSaveData<'a> {
  pub user: &'a str,
  pub post: &'a str,
}

#[derive(Debug, Serialize)]
pub struct ApiCommentData<'a> {
  pub comment: &'a str,
  pub posts: &'a str,
  pub users: &'a str,
  #[serde(rename = "likesArray")]
  pub likes_array: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ApiCommentLikes {
  #[serde(rename = "likesArray")]
  pub likes_array: Vec<String>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_comment_with_expanded_relations() {
    let json = r#"{
      "$id": "c1",
      "$createdAt": "2024-03-01T10:00:00.000+00:00",
      "comment": "nice shot",
      "likesArray": ["u2", "u3"],
      "users": { "$id": "u1", "name": "Ada", "username": "ada", "imageUrl": null },
      "posts": { "$id": "p1" }
    }"#;

    let comment = serde_json::from_str::<ApiComment>(json)
      .unwrap()
      .into_comment("ignored");

    assert_eq!(comment.id, "c1");
    assert_eq!(comment.post_id, "p1");
    assert_eq!(comment.author_id, "u1");
    assert_eq!(comment.author.unwrap().name, "Ada");
    assert_eq!(comment.liked_by.len(), 2);
    assert!(!comment.pending);
  }

  #[test]
  fn test_comment_with_bare_ids_and_missing_post() {
    let json = r#"{
      "$id": "c2",
      "$createdAt": "2024-03-01T10:00:00.000+00:00",
      "comment": "hi",
      "users": "u9"
    }"#;

    let comment = serde_json::from_str::<ApiComment>(json)
      .unwrap()
      .into_comment("p7");

    assert_eq!(comment.post_id, "p7");
    assert_eq!(comment.author_id, "u9");
    assert!(comment.author.is_none());
    assert!(comment.liked_by.is_empty());
  }

  #[test]
  fn test_post_likes_become_user_ids() {
    let json = r#"{
      "$id": "p1",
      "$createdAt": "2024-03-01T10:00:00.000+00:00",
      "creator": { "$id": "u1", "name": "Ada", "username": "ada" },
      "caption": "sunset",
      "tags": ["sky"],
      "likes": [{ "$id": "u2" }, "u3"]
    }"#;

    let post: Post = serde_json::from_str::<ApiPost>(json).unwrap().into();

    assert_eq!(post.creator_id, "u1");
    assert!(post.likes.contains("u2"));
    assert!(post.likes.contains("u3"));
    assert_eq!(post.tags, vec!["sky".to_string()]);
  }

  #[test]
  fn test_user_saves() {
    let json = r#"{
      "$id": "u1",
      "accountId": "acc1",
      "name": "Ada",
      "username": "ada",
      "email": "ada@example.com",
      "save": [{ "$id": "s1", "post": { "$id": "p1" } }]
    }"#;

    let user: User = serde_json::from_str::<ApiUser>(json).unwrap().into();

    assert_eq!(user.saves.len(), 1);
    assert_eq!(user.saves[0].user_id, "u1");
    assert_eq!(user.saves[0].post_id, "p1");
  }

  #[test]
  fn test_create_document_body() {
    let body = ApiCreateDocument::new(ApiSaveData {
      user: "u1",
      post: "p1",
    });

    let value = serde_json::to_value(&body).unwrap();
    assert_eq!(value["documentId"], "unique()");
    assert_eq!(value["data"]["post"], "p1");
  }
}
