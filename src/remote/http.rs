//! REST client for the managed backend.
//!
//! Documents live under `/databases/{db}/collections/{collection}/documents`;
//! filters, ordering and paging are passed as JSON-encoded `queries[]`
//! parameters.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

use crate::config::{CollectionsConfig, Config};
use crate::error::RemoteError;

use super::api_types::{
  ApiAccount, ApiComment, ApiCommentData, ApiCommentLikes, ApiCreateAccount, ApiCreateDocument,
  ApiCredentials, ApiDocumentList, ApiErrorBody, ApiPost, ApiPostData, ApiPostLikes, ApiSave,
  ApiSaveData, ApiSession, ApiUpdateDocument, ApiUser, ApiUserData, ApiUserPatch, UNIQUE_ID,
};
use super::types::{Comment, NewPost, NewUser, Post, SavedPost, Session, UpdatePost, UpdateUser, User};
use super::{toggled, RemoteClient};

/// Number of posts returned by the recent-posts query
const RECENT_POSTS_LIMIT: u32 = 20;

/// Query builders for the `queries[]` parameter
mod query {
  use serde_json::json;

  pub fn equal(attribute: &str, value: &str) -> String {
    json!({ "method": "equal", "attribute": attribute, "values": [value] }).to_string()
  }

  pub fn order_desc(attribute: &str) -> String {
    json!({ "method": "orderDesc", "attribute": attribute }).to_string()
  }

  pub fn limit(n: u32) -> String {
    json!({ "method": "limit", "values": [n] }).to_string()
  }

  pub fn cursor_after(id: &str) -> String {
    json!({ "method": "cursorAfter", "values": [id] }).to_string()
  }

  pub fn search(attribute: &str, term: &str) -> String {
    json!({ "method": "search", "attribute": attribute, "values": [term] }).to_string()
  }
}

/// URL layout of the backend
#[derive(Debug, Clone)]
struct Endpoints {
  base: Url,
  database_id: String,
}

impl Endpoints {
  fn new(endpoint: &str, database_id: &str) -> Result<Self> {
    let base = Url::parse(endpoint).map_err(|e| eyre!("Invalid backend endpoint {}: {}", endpoint, e))?;
    if base.cannot_be_a_base() {
      return Err(eyre!("Invalid backend endpoint {}", endpoint));
    }

    Ok(Self {
      base,
      database_id: database_id.to_string(),
    })
  }

  fn url(&self, segments: &[&str], queries: &[String]) -> Url {
    let mut url = self.base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
      path.pop_if_empty().extend(segments);
    }
    if !queries.is_empty() {
      let mut pairs = url.query_pairs_mut();
      for q in queries {
        pairs.append_pair("queries[]", q);
      }
    }
    url
  }

  fn documents(&self, collection: &str, queries: &[String]) -> Url {
    self.url(
      &["databases", &self.database_id, "collections", collection, "documents"],
      queries,
    )
  }

  fn document(&self, collection: &str, id: &str) -> Url {
    self.url(
      &["databases", &self.database_id, "collections", collection, "documents", id],
      &[],
    )
  }
}

/// Map a non-success response to a [`RemoteError`].
fn error_for_status(status: StatusCode, body: &str, entity: &'static str, id: &str) -> RemoteError {
  let message = serde_json::from_str::<ApiErrorBody>(body)
    .ok()
    .map(|b| b.message)
    .filter(|m| !m.is_empty())
    .unwrap_or_else(|| status.to_string());

  match status.as_u16() {
    400 | 422 => RemoteError::Validation(message),
    404 => RemoteError::not_found(entity, id),
    409 => RemoteError::Conflict(message),
    _ => RemoteError::Transport(message),
  }
}

/// Remote Data Client backed by the REST API
#[derive(Clone)]
pub struct HttpRemote {
  http: reqwest::Client,
  endpoints: Endpoints,
  collections: CollectionsConfig,
  project_id: String,
  api_key: Option<String>,
  page_size: u32,
  /// Session secret from the last sign-in
  session: Arc<RwLock<Option<String>>>,
}

impl HttpRemote {
  pub fn new(config: &Config) -> Result<Self> {
    let backend = &config.backend;
    let endpoints = Endpoints::new(&backend.endpoint, &backend.database_id)?;

    let http = reqwest::Client::builder()
      .user_agent(concat!("murmur/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      endpoints,
      collections: backend.collections.clone(),
      project_id: backend.project_id.clone(),
      api_key: Config::get_api_key(),
      page_size: backend.page_size,
      session: Arc::new(RwLock::new(None)),
    })
  }

  async fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
    let mut request = request.header("X-Appwrite-Project", &self.project_id);
    if let Some(key) = &self.api_key {
      request = request.header("X-Appwrite-Key", key);
    }
    if let Some(secret) = self.session.read().await.as_deref() {
      request = request.header("X-Appwrite-Session", secret);
    }
    request
  }

  async fn execute(&self, request: RequestBuilder, entity: &'static str, id: &str) -> Result<Response, RemoteError> {
    let response = self.authorize(request).await.send().await?;
    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let err = error_for_status(status, &body, entity, id);
    warn!(entity, id, status = status.as_u16(), error = %err, "Request failed");
    Err(err)
  }

  async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, entity: &'static str, id: &str) -> Result<T, RemoteError> {
    let response = self.execute(request, entity, id).await?;
    response
      .json::<T>()
      .await
      .map_err(|e| RemoteError::Transport(format!("failed to parse {} response: {}", entity, e)))
  }

  async fn list<T: DeserializeOwned>(&self, collection: &str, entity: &'static str, queries: &[String]) -> Result<Vec<T>, RemoteError> {
    let url = self.endpoints.documents(collection, queries);
    debug!(%url, "Listing documents");
    let list: ApiDocumentList<T> = self.send(self.http.get(url), entity, collection).await?;
    Ok(list.documents)
  }

  async fn get_document<T: DeserializeOwned>(&self, collection: &str, entity: &'static str, id: &str) -> Result<T, RemoteError> {
    require_id(entity, id)?;
    self.send(self.http.get(self.endpoints.document(collection, id)), entity, id).await
  }

  async fn posts(&self, queries: &[String]) -> Result<Vec<Post>, RemoteError> {
    let posts: Vec<ApiPost> = self.list(&self.collections.posts, "post", queries).await?;
    Ok(posts.into_iter().map(Post::from).collect())
  }
}

fn require_id(entity: &'static str, id: &str) -> Result<(), RemoteError> {
  if id.trim().is_empty() {
    return Err(RemoteError::Validation(format!("{} id is empty", entity)));
  }
  Ok(())
}

#[async_trait]
impl RemoteClient for HttpRemote {
  async fn create_account(&self, user: &NewUser) -> Result<User, RemoteError> {
    let body = ApiCreateAccount {
      user_id: UNIQUE_ID,
      email: &user.email,
      password: &user.password,
      name: &user.name,
    };
    let account: ApiAccount = self
      .send(self.http.post(self.endpoints.url(&["account"], &[])).json(&body), "account", &user.email)
      .await?;

    let data = ApiCreateDocument::new(ApiUserData {
      account_id: &account.id,
      name: &account.name,
      username: &user.username,
      email: &account.email,
    });
    let created: ApiUser = self
      .send(
        self.http.post(self.endpoints.documents(&self.collections.users, &[])).json(&data),
        "user",
        &account.id,
      )
      .await?;
    Ok(created.into())
  }

  async fn sign_in(&self, email: &str, password: &str) -> Result<Session, RemoteError> {
    let url = self.endpoints.url(&["account", "sessions", "email"], &[]);
    let session: Session = self
      .send::<ApiSession>(self.http.post(url).json(&ApiCredentials { email, password }), "session", email)
      .await?
      .into();

    *self.session.write().await = session.secret.clone();
    Ok(session)
  }

  async fn sign_out(&self) -> Result<(), RemoteError> {
    let url = self.endpoints.url(&["account", "sessions", "current"], &[]);
    self.execute(self.http.delete(url), "session", "current").await?;
    *self.session.write().await = None;
    Ok(())
  }

  async fn get_current_user(&self) -> Result<User, RemoteError> {
    let account: ApiAccount = self
      .send(self.http.get(self.endpoints.url(&["account"], &[])), "account", "current")
      .await?;

    let users: Vec<ApiUser> = self
      .list(&self.collections.users, "user", &[query::equal("accountId", &account.id)])
      .await?;
    users
      .into_iter()
      .next()
      .map(User::from)
      .ok_or_else(|| RemoteError::not_found("user", account.id))
  }

  async fn create_post(&self, post: &NewPost) -> Result<Post, RemoteError> {
    let data = ApiCreateDocument::new(ApiPostData {
      creator: Some(&post.creator_id),
      caption: &post.caption,
      image_url: post.image_url.as_deref(),
      image_id: post.image_id.as_deref(),
      location: post.location.as_deref(),
      tags: &post.tags,
    });
    let created: ApiPost = self
      .send(
        self.http.post(self.endpoints.documents(&self.collections.posts, &[])).json(&data),
        "post",
        &post.creator_id,
      )
      .await?;
    Ok(created.into())
  }

  async fn get_post_by_id(&self, post_id: &str) -> Result<Post, RemoteError> {
    let post: ApiPost = self.get_document(&self.collections.posts, "post", post_id).await?;
    Ok(post.into())
  }

  async fn update_post(&self, post: &UpdatePost) -> Result<Post, RemoteError> {
    require_id("post", &post.post_id)?;
    let data = ApiUpdateDocument {
      data: ApiPostData {
        creator: None,
        caption: &post.caption,
        image_url: post.image_url.as_deref(),
        image_id: post.image_id.as_deref(),
        location: post.location.as_deref(),
        tags: &post.tags,
      },
    };
    let url = self.endpoints.document(&self.collections.posts, &post.post_id);
    let updated: ApiPost = self.send(self.http.patch(url).json(&data), "post", &post.post_id).await?;
    Ok(updated.into())
  }

  async fn delete_post(&self, post_id: &str) -> Result<(), RemoteError> {
    require_id("post", post_id)?;
    let url = self.endpoints.document(&self.collections.posts, post_id);
    self.execute(self.http.delete(url), "post", post_id).await?;
    Ok(())
  }

  async fn get_recent_posts(&self) -> Result<Vec<Post>, RemoteError> {
    self
      .posts(&[query::order_desc("$createdAt"), query::limit(RECENT_POSTS_LIMIT)])
      .await
  }

  async fn get_infinite_posts(&self, cursor: Option<&str>) -> Result<Vec<Post>, RemoteError> {
    let mut queries = vec![query::order_desc("$updatedAt"), query::limit(self.page_size)];
    if let Some(cursor) = cursor {
      queries.push(query::cursor_after(cursor));
    }
    self.posts(&queries).await
  }

  async fn search_posts(&self, term: &str) -> Result<Vec<Post>, RemoteError> {
    self.posts(&[query::search("caption", term)]).await
  }

  async fn get_user_posts(&self, user_id: &str) -> Result<Vec<Post>, RemoteError> {
    require_id("user", user_id)?;
    self
      .posts(&[query::equal("creator", user_id), query::order_desc("$createdAt")])
      .await
  }

  async fn like_post(&self, post_id: &str, likes: &BTreeSet<String>) -> Result<Post, RemoteError> {
    require_id("post", post_id)?;
    let data = ApiUpdateDocument {
      data: ApiPostLikes {
        likes: likes.iter().map(String::as_str).collect(),
      },
    };
    let url = self.endpoints.document(&self.collections.posts, post_id);
    let post: ApiPost = self.send(self.http.patch(url).json(&data), "post", post_id).await?;
    Ok(post.into())
  }

  async fn save_post(&self, user_id: &str, post_id: &str) -> Result<SavedPost, RemoteError> {
    require_id("post", post_id)?;
    let data = ApiCreateDocument::new(ApiSaveData {
      user: user_id,
      post: post_id,
    });
    let save: ApiSave = self
      .send(
        self.http.post(self.endpoints.documents(&self.collections.saves, &[])).json(&data),
        "post",
        post_id,
      )
      .await?;
    Ok(save.into_saved(user_id))
  }

  async fn delete_saved_post(&self, saved_id: &str) -> Result<(), RemoteError> {
    require_id("save", saved_id)?;
    let url = self.endpoints.document(&self.collections.saves, saved_id);
    self.execute(self.http.delete(url), "save", saved_id).await?;
    Ok(())
  }

  async fn get_users(&self, limit: Option<u32>) -> Result<Vec<User>, RemoteError> {
    let mut queries = vec![query::order_desc("$createdAt")];
    if let Some(limit) = limit {
      queries.push(query::limit(limit));
    }
    let users: Vec<ApiUser> = self.list(&self.collections.users, "user", &queries).await?;
    Ok(users.into_iter().map(User::from).collect())
  }

  async fn get_user_by_id(&self, user_id: &str) -> Result<User, RemoteError> {
    let user: ApiUser = self.get_document(&self.collections.users, "user", user_id).await?;
    Ok(user.into())
  }

  async fn update_user(&self, user: &UpdateUser) -> Result<User, RemoteError> {
    require_id("user", &user.user_id)?;
    let data = ApiUpdateDocument {
      data: ApiUserPatch {
        name: &user.name,
        bio: user.bio.as_deref(),
        image_url: user.image_url.as_deref(),
      },
    };
    let url = self.endpoints.document(&self.collections.users, &user.user_id);
    let updated: ApiUser = self.send(self.http.patch(url).json(&data), "user", &user.user_id).await?;
    Ok(updated.into())
  }

  async fn get_comments(&self, post_id: &str) -> Result<Vec<Comment>, RemoteError> {
    require_id("post", post_id)?;
    let comments: Vec<ApiComment> = self
      .list(
        &self.collections.comments,
        "comment",
        &[query::equal("posts", post_id), query::order_desc("$createdAt")],
      )
      .await?;
    Ok(comments.into_iter().map(|c| c.into_comment(post_id)).collect())
  }

  async fn create_comment(&self, post_id: &str, text: &str, author_id: &str) -> Result<Comment, RemoteError> {
    require_id("post", post_id)?;
    if text.trim().is_empty() {
      return Err(RemoteError::Validation("comment text is empty".to_string()));
    }

    let data = ApiCreateDocument::new(ApiCommentData {
      comment: text,
      posts: post_id,
      users: author_id,
      likes_array: Vec::new(),
    });
    let created: ApiComment = self
      .send(
        self.http.post(self.endpoints.documents(&self.collections.comments, &[])).json(&data),
        "post",
        post_id,
      )
      .await?;
    Ok(created.into_comment(post_id))
  }

  async fn toggle_comment_like(
    &self,
    comment_id: &str,
    user_id: &str,
    previous_liked_by: &BTreeSet<String>,
    post_id: &str,
  ) -> Result<Comment, RemoteError> {
    require_id("comment", comment_id)?;
    let data = ApiUpdateDocument {
      data: ApiCommentLikes {
        likes_array: toggled(previous_liked_by, user_id).into_iter().collect(),
      },
    };
    let url = self.endpoints.document(&self.collections.comments, comment_id);
    let updated: ApiComment = self.send(self.http.patch(url).json(&data), "comment", comment_id).await?;
    Ok(updated.into_comment(post_id))
  }
}

impl std::fmt::Debug for HttpRemote {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("HttpRemote")
      .field("base", &self.endpoints.base.as_str())
      .field("project_id", &self.project_id)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn endpoints() -> Endpoints {
    Endpoints::new("https://cloud.example.com/v1", "main").unwrap()
  }

  #[test]
  fn test_document_urls() {
    let endpoints = endpoints();

    assert_eq!(
      endpoints.document("comments", "c1").as_str(),
      "https://cloud.example.com/v1/databases/main/collections/comments/documents/c1"
    );
  }

  #[test]
  fn test_trailing_slash_in_endpoint() {
    let endpoints = Endpoints::new("https://cloud.example.com/v1/", "main").unwrap();
    assert_eq!(
      endpoints.url(&["account"], &[]).as_str(),
      "https://cloud.example.com/v1/account"
    );
  }

  #[test]
  fn test_queries_are_encoded_as_array_params() {
    let url = endpoints().documents("posts", &[query::equal("creator", "u1"), query::limit(9)]);

    let queries: Vec<String> = url
      .query_pairs()
      .filter(|(name, _)| name == "queries[]")
      .map(|(_, value)| value.into_owned())
      .collect();
    assert_eq!(queries.len(), 2);

    let first: serde_json::Value = serde_json::from_str(&queries[0]).unwrap();
    assert_eq!(first["method"], "equal");
    assert_eq!(first["attribute"], "creator");
    assert_eq!(first["values"][0], "u1");
  }

  #[test]
  fn test_invalid_endpoint() {
    assert!(Endpoints::new("not a url", "main").is_err());
  }

  #[test]
  fn test_status_mapping() {
    let body = r#"{"message":"Invalid document structure","code":400,"type":"document_invalid_structure"}"#;

    assert_eq!(
      error_for_status(StatusCode::BAD_REQUEST, body, "comment", "c1"),
      RemoteError::Validation("Invalid document structure".to_string())
    );
    assert_eq!(
      error_for_status(StatusCode::NOT_FOUND, "", "comment", "c1"),
      RemoteError::not_found("comment", "c1")
    );
    assert!(matches!(
      error_for_status(StatusCode::CONFLICT, "", "comment", "c1"),
      RemoteError::Conflict(_)
    ));
    assert!(matches!(
      error_for_status(StatusCode::BAD_GATEWAY, "", "comment", "c1"),
      RemoteError::Transport(_)
    ));
  }

  #[test]
  fn test_require_id() {
    assert!(require_id("post", "p1").is_ok());
    assert!(matches!(require_id("post", "  "), Err(RemoteError::Validation(_))));
  }
}
