//! Cached social client: the API the view layer talks to.
//!
//! Reads go through the query cache (`get_*` resolves once, `use_*` returns a
//! subscribed observer). Writes go straight to the backend and invalidate
//! the queries they affect; comment writes use the optimistic protocol in
//! [`crate::mutation`].

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use color_eyre::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, info};

use crate::cache::{QueryCache, QueryKey, QueryObserver, Write};
use crate::config::Config;
use crate::error::{MutationError, Operation, RemoteError};
use crate::mutation::CommentMutations;
use crate::remote::{
  Comment, HttpRemote, NewPost, NewUser, Post, PostPages, RemoteClient, SavedPost, Session,
  UpdatePost, UpdateUser, User,
};

type Fetch<T> = BoxFuture<'static, Result<T, RemoteError>>;

/// Backend client with a shared query cache in front of it.
#[derive(Clone)]
pub struct SocialClient {
  remote: Arc<dyn RemoteClient>,
  cache: QueryCache,
  comments: CommentMutations,
}

impl SocialClient {
  pub fn new(remote: Arc<dyn RemoteClient>, cache: QueryCache) -> Self {
    let comments = CommentMutations::new(cache.clone(), remote.clone());
    Self {
      remote,
      cache,
      comments,
    }
  }

  /// Client for the configured REST backend.
  pub fn from_config(config: &Config) -> Result<Self> {
    let remote = HttpRemote::new(config)?;
    let cache = QueryCache::new(config.cache.settings());
    Ok(Self::new(Arc::new(remote), cache))
  }

  pub fn cache(&self) -> &QueryCache {
    &self.cache
  }

  /// Comment mutations, including their status receivers.
  pub fn comment_mutations(&self) -> &CommentMutations {
    &self.comments
  }

  /// Build a cache fetcher from a remote call.
  fn fetcher<T, F, Fut>(&self, call: F) -> impl Fn() -> Fetch<T> + Send + Sync + 'static
  where
    T: Send + 'static,
    F: Fn(Arc<dyn RemoteClient>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, RemoteError>> + Send + 'static,
  {
    let remote = self.remote.clone();
    move || call(remote.clone()).boxed()
  }

  /// Invalidate `keys` after a successful write.
  fn settle(&self, operation: Operation, keys: &[QueryKey]) {
    for key in keys {
      self.cache.invalidate(key);
    }
    debug!(%operation, invalidated = keys.len(), "Write settled");
  }

  // ==========================================================================
  // Comments
  // ==========================================================================

  fn comments_fetcher(&self, post_id: &str) -> impl Fn() -> Fetch<Vec<Comment>> + Send + Sync + 'static {
    let post_id = post_id.to_string();
    self.fetcher(move |remote| {
      let post_id = post_id.clone();
      async move { remote.get_comments(&post_id).await }
    })
  }

  /// Comments on a post, newest first.
  pub async fn get_comments(&self, post_id: &str) -> Result<Vec<Comment>, RemoteError> {
    self
      .cache
      .fetch_query(&QueryKey::comments(post_id), self.comments_fetcher(post_id))
      .await
  }

  /// Observe a post's comment list. Disabled for an empty post id.
  pub fn use_comments(&self, post_id: &str) -> QueryObserver<Vec<Comment>> {
    QueryObserver::new(
      self.cache.clone(),
      QueryKey::comments(post_id),
      self.comments_fetcher(post_id),
      !post_id.is_empty(),
    )
  }

  pub async fn create_comment(
    &self,
    post_id: &str,
    text: &str,
    author_id: &str,
  ) -> Result<Comment, MutationError> {
    self.comments.create_comment(post_id, text, author_id).await
  }

  /// Toggle a like on a comment; `Ok(None)` if the comment is not cached.
  pub async fn toggle_like(
    &self,
    post_id: &str,
    comment_id: &str,
    user_id: &str,
  ) -> Result<Option<Comment>, MutationError> {
    self.comments.toggle_like(post_id, comment_id, user_id).await
  }

  // ==========================================================================
  // Posts
  // ==========================================================================

  fn recent_posts_fetcher(&self) -> impl Fn() -> Fetch<Vec<Post>> + Send + Sync + 'static {
    self.fetcher(|remote| async move { remote.get_recent_posts().await })
  }

  pub async fn get_recent_posts(&self) -> Result<Vec<Post>, RemoteError> {
    self
      .cache
      .fetch_query(&QueryKey::recent_posts(), self.recent_posts_fetcher())
      .await
  }

  pub fn use_recent_posts(&self) -> QueryObserver<Vec<Post>> {
    QueryObserver::new(
      self.cache.clone(),
      QueryKey::recent_posts(),
      self.recent_posts_fetcher(),
      true,
    )
  }

  fn post_fetcher(&self, post_id: &str) -> impl Fn() -> Fetch<Post> + Send + Sync + 'static {
    let post_id = post_id.to_string();
    self.fetcher(move |remote| {
      let post_id = post_id.clone();
      async move { remote.get_post_by_id(&post_id).await }
    })
  }

  pub async fn get_post_by_id(&self, post_id: &str) -> Result<Post, RemoteError> {
    self
      .cache
      .fetch_query(&QueryKey::post_by_id(post_id), self.post_fetcher(post_id))
      .await
  }

  pub fn use_post_by_id(&self, post_id: &str) -> QueryObserver<Post> {
    QueryObserver::new(
      self.cache.clone(),
      QueryKey::post_by_id(post_id),
      self.post_fetcher(post_id),
      !post_id.is_empty(),
    )
  }

  fn user_posts_fetcher(&self, user_id: &str) -> impl Fn() -> Fetch<Vec<Post>> + Send + Sync + 'static {
    let user_id = user_id.to_string();
    self.fetcher(move |remote| {
      let user_id = user_id.clone();
      async move { remote.get_user_posts(&user_id).await }
    })
  }

  pub async fn get_user_posts(&self, user_id: &str) -> Result<Vec<Post>, RemoteError> {
    self
      .cache
      .fetch_query(&QueryKey::user_posts(user_id), self.user_posts_fetcher(user_id))
      .await
  }

  pub fn use_user_posts(&self, user_id: &str) -> QueryObserver<Vec<Post>> {
    QueryObserver::new(
      self.cache.clone(),
      QueryKey::user_posts(user_id),
      self.user_posts_fetcher(user_id),
      !user_id.is_empty(),
    )
  }

  fn search_fetcher(&self, term: &str) -> impl Fn() -> Fetch<Vec<Post>> + Send + Sync + 'static {
    let term = term.to_string();
    self.fetcher(move |remote| {
      let term = term.clone();
      async move { remote.search_posts(&term).await }
    })
  }

  /// Search post captions. An empty term matches nothing and is not sent.
  pub async fn search_posts(&self, term: &str) -> Result<Vec<Post>, RemoteError> {
    if term.is_empty() {
      return Ok(Vec::new());
    }
    self
      .cache
      .fetch_query(&QueryKey::search_posts(term), self.search_fetcher(term))
      .await
  }

  /// Observe search results. Disabled for an empty term.
  pub fn use_search_posts(&self, term: &str) -> QueryObserver<Vec<Post>> {
    QueryObserver::new(
      self.cache.clone(),
      QueryKey::search_posts(term),
      self.search_fetcher(term),
      !term.is_empty(),
    )
  }

  /// Fetcher for the infinite feed; refetching restarts at the first page.
  fn infinite_fetcher(&self) -> impl Fn() -> Fetch<PostPages> + Send + Sync + 'static {
    self.fetcher(|remote| async move {
      let first = remote.get_infinite_posts(None).await?;
      Ok::<_, RemoteError>(PostPages {
        exhausted: first.is_empty(),
        pages: vec![first],
      })
    })
  }

  /// Loaded pages of the feed, fetching the first page if none are cached.
  pub async fn get_infinite_posts(&self) -> Result<PostPages, RemoteError> {
    self
      .cache
      .fetch_query(&QueryKey::infinite_posts(), self.infinite_fetcher())
      .await
  }

  pub fn use_infinite_posts(&self) -> QueryObserver<PostPages> {
    QueryObserver::new(
      self.cache.clone(),
      QueryKey::infinite_posts(),
      self.infinite_fetcher(),
      true,
    )
  }

  /// Load the page after the last loaded post and append it.
  ///
  /// An empty page marks the feed exhausted; once exhausted nothing more is
  /// requested. If the pages changed while the request was in flight (e.g.
  /// a refetch restarted the feed) the late page is dropped.
  pub async fn fetch_next_page(&self) -> Result<PostPages, RemoteError> {
    let key = QueryKey::infinite_posts();
    let current = match self.cache.get_data::<PostPages>(&key) {
      Some(pages) => pages,
      None => return self.get_infinite_posts().await,
    };
    if current.exhausted {
      return Ok(current);
    }

    let cursor = current.next_cursor().map(str::to_string);
    let page = self.remote.get_infinite_posts(cursor.as_deref()).await?;
    debug!(cursor = ?cursor, posts = page.len(), "Fetched feed page");

    let transition = self.cache.write_with::<PostPages, _>(&key, |pages| match pages {
      Some(pages) if pages.next_cursor() == cursor.as_deref() && !pages.exhausted => {
        let mut next = pages.clone();
        if page.is_empty() {
          next.exhausted = true;
        } else {
          next.pages.push(page);
        }
        Write::Set(next)
      }
      _ => Write::Skip,
    });

    Ok(
      transition
        .and_then(|t| t.current)
        .or_else(|| self.cache.get_data::<PostPages>(&key))
        .unwrap_or_default(),
    )
  }

  pub async fn create_post(&self, post: &NewPost) -> Result<Post, MutationError> {
    let created = self
      .remote
      .create_post(post)
      .await
      .map_err(|e| MutationError::new(Operation::CreatePost, &post.creator_id, e))?;
    self.settle(Operation::CreatePost, &[QueryKey::recent_posts()]);
    info!(post_id = %created.id, "Created post");
    Ok(created)
  }

  pub async fn update_post(&self, post: &UpdatePost) -> Result<Post, MutationError> {
    let updated = self
      .remote
      .update_post(post)
      .await
      .map_err(|e| MutationError::new(Operation::UpdatePost, &post.post_id, e))?;
    self.settle(Operation::UpdatePost, &[QueryKey::post_by_id(&updated.id)]);
    Ok(updated)
  }

  pub async fn delete_post(&self, post_id: &str) -> Result<(), MutationError> {
    self
      .remote
      .delete_post(post_id)
      .await
      .map_err(|e| MutationError::new(Operation::DeletePost, post_id, e))?;
    self.settle(Operation::DeletePost, &[QueryKey::recent_posts()]);
    Ok(())
  }

  /// Replace a post's likes.
  pub async fn like_post(
    &self,
    post_id: &str,
    likes: &BTreeSet<String>,
  ) -> Result<Post, MutationError> {
    let post = self
      .remote
      .like_post(post_id, likes)
      .await
      .map_err(|e| MutationError::new(Operation::LikePost, post_id, e))?;
    self.settle(
      Operation::LikePost,
      &[
        QueryKey::post_by_id(&post.id),
        QueryKey::recent_posts(),
        QueryKey::posts(),
        QueryKey::infinite_posts(),
        QueryKey::current_user(),
      ],
    );
    Ok(post)
  }

  pub async fn save_post(&self, user_id: &str, post_id: &str) -> Result<SavedPost, MutationError> {
    let saved = self
      .remote
      .save_post(user_id, post_id)
      .await
      .map_err(|e| MutationError::new(Operation::SavePost, post_id, e))?;
    self.settle(Operation::SavePost, &Self::saved_keys());
    Ok(saved)
  }

  pub async fn delete_saved_post(&self, saved_id: &str) -> Result<(), MutationError> {
    self
      .remote
      .delete_saved_post(saved_id)
      .await
      .map_err(|e| MutationError::new(Operation::DeleteSavedPost, saved_id, e))?;
    self.settle(Operation::DeleteSavedPost, &Self::saved_keys());
    Ok(())
  }

  fn saved_keys() -> [QueryKey; 4] {
    [
      QueryKey::recent_posts(),
      QueryKey::posts(),
      QueryKey::infinite_posts(),
      QueryKey::current_user(),
    ]
  }

  // ==========================================================================
  // Users and accounts
  // ==========================================================================

  fn current_user_fetcher(&self) -> impl Fn() -> Fetch<User> + Send + Sync + 'static {
    self.fetcher(|remote| async move { remote.get_current_user().await })
  }

  pub async fn get_current_user(&self) -> Result<User, RemoteError> {
    self
      .cache
      .fetch_query(&QueryKey::current_user(), self.current_user_fetcher())
      .await
  }

  pub fn use_current_user(&self) -> QueryObserver<User> {
    QueryObserver::new(
      self.cache.clone(),
      QueryKey::current_user(),
      self.current_user_fetcher(),
      true,
    )
  }

  fn users_fetcher(&self, limit: Option<u32>) -> impl Fn() -> Fetch<Vec<User>> + Send + Sync + 'static {
    self.fetcher(move |remote| async move { remote.get_users(limit).await })
  }

  pub async fn get_users(&self, limit: Option<u32>) -> Result<Vec<User>, RemoteError> {
    self
      .cache
      .fetch_query(&QueryKey::users(), self.users_fetcher(limit))
      .await
  }

  pub fn use_users(&self, limit: Option<u32>) -> QueryObserver<Vec<User>> {
    QueryObserver::new(
      self.cache.clone(),
      QueryKey::users(),
      self.users_fetcher(limit),
      true,
    )
  }

  fn user_fetcher(&self, user_id: &str) -> impl Fn() -> Fetch<User> + Send + Sync + 'static {
    let user_id = user_id.to_string();
    self.fetcher(move |remote| {
      let user_id = user_id.clone();
      async move { remote.get_user_by_id(&user_id).await }
    })
  }

  pub async fn get_user_by_id(&self, user_id: &str) -> Result<User, RemoteError> {
    self
      .cache
      .fetch_query(&QueryKey::user_by_id(user_id), self.user_fetcher(user_id))
      .await
  }

  pub fn use_user_by_id(&self, user_id: &str) -> QueryObserver<User> {
    QueryObserver::new(
      self.cache.clone(),
      QueryKey::user_by_id(user_id),
      self.user_fetcher(user_id),
      !user_id.is_empty(),
    )
  }

  pub async fn update_user(&self, user: &UpdateUser) -> Result<User, MutationError> {
    let updated = self
      .remote
      .update_user(user)
      .await
      .map_err(|e| MutationError::new(Operation::UpdateUser, &user.user_id, e))?;
    self.settle(
      Operation::UpdateUser,
      &[QueryKey::current_user(), QueryKey::user_by_id(&updated.id)],
    );
    Ok(updated)
  }

  pub async fn create_account(&self, user: &NewUser) -> Result<User, MutationError> {
    self
      .remote
      .create_account(user)
      .await
      .map_err(|e| MutationError::new(Operation::CreateAccount, &user.email, e))
  }

  pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, MutationError> {
    self
      .remote
      .sign_in(email, password)
      .await
      .map_err(|e| MutationError::new(Operation::SignIn, email, e))
  }

  pub async fn sign_out(&self) -> Result<(), MutationError> {
    self
      .remote
      .sign_out()
      .await
      .map_err(|e| MutationError::new(Operation::SignOut, "current", e))
  }
}

impl std::fmt::Debug for SocialClient {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SocialClient")
      .field("cached_keys", &self.cache.keys().len())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::QueryStatus;
  use crate::remote::{MemoryRemote, RemoteOp};
  use chrono::Utc;
  use std::time::Duration;

  fn post(id: &str, creator: &str) -> Post {
    Post {
      id: id.to_string(),
      creator_id: creator.to_string(),
      creator: None,
      caption: format!("caption {}", id),
      image_id: None,
      image_url: None,
      location: None,
      tags: Vec::new(),
      likes: BTreeSet::new(),
      created_at: Utc::now(),
    }
  }

  fn user(id: &str) -> User {
    User {
      id: id.to_string(),
      account_id: format!("acc-{}", id),
      name: id.to_uppercase(),
      username: id.to_string(),
      email: format!("{}@example.com", id),
      bio: None,
      image_url: None,
      liked_post_ids: Vec::new(),
      saves: Vec::new(),
    }
  }

  fn setup() -> (SocialClient, MemoryRemote) {
    let remote = MemoryRemote::new();
    let client = SocialClient::new(Arc::new(remote.clone()), QueryCache::default());
    (client, remote)
  }

  #[tokio::test]
  async fn test_reads_are_served_from_cache() {
    let (client, remote) = setup();
    remote.insert_post(post("p1", "u1"));

    client.get_recent_posts().await.unwrap();
    let posts = client.get_recent_posts().await.unwrap();

    assert_eq!(posts.len(), 1);
    assert_eq!(remote.calls(RemoteOp::GetRecentPosts), 1);
  }

  #[tokio::test]
  async fn test_create_post_invalidates_recent_posts() {
    let (client, remote) = setup();
    remote.insert_user(user("u1"));
    let observer = client.use_recent_posts();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(observer.data(), Some(Vec::new()));

    client
      .create_post(&NewPost {
        creator_id: "u1".to_string(),
        caption: "hello".to_string(),
        image_id: None,
        image_url: None,
        location: None,
        tags: Vec::new(),
      })
      .await
      .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(observer.data().unwrap().len(), 1);
    assert_eq!(remote.calls(RemoteOp::GetRecentPosts), 2);
  }

  #[tokio::test]
  async fn test_like_post_invalidates_related_queries() {
    let (client, remote) = setup();
    remote.insert_post(post("p1", "u1"));
    client.get_post_by_id("p1").await.unwrap();
    client.get_recent_posts().await.unwrap();

    let likes: BTreeSet<String> = ["u2".to_string()].into_iter().collect();
    client.like_post("p1", &likes).await.unwrap();

    let cache = client.cache();
    assert!(cache.get::<Post>(&QueryKey::post_by_id("p1")).unwrap().is_stale);
    assert!(cache.get::<Vec<Post>>(&QueryKey::recent_posts()).unwrap().is_stale);

    let refreshed = client.get_post_by_id("p1").await.unwrap();
    assert_eq!(refreshed.likes, likes);
  }

  #[tokio::test]
  async fn test_update_user_invalidates_profile_queries() {
    let (client, remote) = setup();
    remote.insert_user(user("u1"));
    remote.set_session_user("u1");
    client.get_current_user().await.unwrap();
    client.get_user_by_id("u1").await.unwrap();

    client
      .update_user(&UpdateUser {
        user_id: "u1".to_string(),
        name: "Ada".to_string(),
        bio: Some("hi".to_string()),
        image_url: None,
      })
      .await
      .unwrap();

    assert_eq!(client.get_current_user().await.unwrap().name, "Ada");
    assert_eq!(client.get_user_by_id("u1").await.unwrap().bio, Some("hi".to_string()));
  }

  #[tokio::test]
  async fn test_failed_write_names_operation_and_target() {
    let (client, remote) = setup();
    remote.fail_next(RemoteOp::DeletePost, RemoteError::Transport("offline".to_string()));

    let err = client.delete_post("p1").await.unwrap_err();

    assert_eq!(err.operation, Operation::DeletePost);
    assert_eq!(err.target, "p1");
  }

  #[tokio::test]
  async fn test_empty_search_is_disabled() {
    let (client, remote) = setup();

    let observer = client.use_search_posts("");
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(observer.status(), QueryStatus::Idle);
    assert!(client.search_posts("").await.unwrap().is_empty());
    assert_eq!(remote.calls(RemoteOp::SearchPosts), 0);
  }

  #[tokio::test]
  async fn test_infinite_posts_pagination() {
    let (client, remote) = setup();
    remote.set_page_size(2);
    for id in ["a", "b", "c"] {
      remote.insert_post(post(id, "u1"));
    }

    let first = client.get_infinite_posts().await.unwrap();
    assert_eq!(first.pages.len(), 1);
    assert_eq!(first.next_cursor(), Some("b"));

    let second = client.fetch_next_page().await.unwrap();
    assert_eq!(second.pages.len(), 2);
    assert!(second.has_next_page());

    let done = client.fetch_next_page().await.unwrap();
    assert!(!done.has_next_page());
    assert_eq!(done.posts().count(), 3);

    let again = client.fetch_next_page().await.unwrap();
    assert_eq!(again, done);
    assert_eq!(remote.calls(RemoteOp::GetInfinitePosts), 3);
  }

  #[tokio::test]
  async fn test_use_comments_and_optimistic_create() {
    let (client, remote) = setup();
    let hold = remote.hold(RemoteOp::CreateComment);
    let mut comments = client.use_comments("post1");
    tokio::time::sleep(Duration::from_millis(10)).await;
    comments.poll();
    assert_eq!(comments.data(), Some(Vec::new()));

    let creating = {
      let client = client.clone();
      tokio::spawn(async move { client.create_comment("post1", "first!", "u1").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(comments.poll());
    assert!(comments.data().unwrap()[0].is_provisional());

    hold.open();
    let created = creating.await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(comments.data(), Some(vec![created]));
  }

  #[tokio::test]
  async fn test_sign_in_is_pass_through() {
    let (client, remote) = setup();
    client
      .create_account(&NewUser {
        name: "Ada".to_string(),
        username: "ada".to_string(),
        email: "ada@example.com".to_string(),
        password: "secret".to_string(),
      })
      .await
      .unwrap();

    client.sign_in("ada@example.com", "secret").await.unwrap();

    assert!(client.cache().keys().is_empty());
    assert_eq!(remote.calls(RemoteOp::SignIn), 1);
  }
}
