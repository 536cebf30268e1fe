//! In-process backend with the same contract as the REST client.
//!
//! Used by tests and demos. Individual operations can be slowed down, made to
//! fail, or held at a gate until the test releases them.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::RemoteError;

use super::types::{
  Comment, NewPost, NewUser, Post, SavedPost, Session, UpdatePost, UpdateUser, User,
};
use super::{toggled, RemoteClient};

/// Remote operations that can be delayed, failed or held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
  CreateAccount,
  SignIn,
  SignOut,
  GetCurrentUser,
  CreatePost,
  GetPostById,
  UpdatePost,
  DeletePost,
  GetRecentPosts,
  GetInfinitePosts,
  SearchPosts,
  GetUserPosts,
  LikePost,
  SavePost,
  DeleteSavedPost,
  GetUsers,
  GetUserById,
  UpdateUser,
  GetComments,
  CreateComment,
  ToggleCommentLike,
}

/// Gate holding calls of one operation until released.
#[derive(Debug, Clone)]
pub struct Hold {
  op: RemoteOp,
  gate: Arc<Semaphore>,
}

impl Hold {
  pub fn op(&self) -> RemoteOp {
    self.op
  }

  /// Let one waiting (or future) call through.
  pub fn release(&self) {
    self.gate.add_permits(1);
  }

  /// Let every current and future call through.
  pub fn open(&self) {
    self.gate.close();
  }
}

/// A like-toggle request as the backend received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LikeRequest {
  pub comment_id: String,
  pub user_id: String,
  pub previous_liked_by: BTreeSet<String>,
}

#[derive(Default)]
struct State {
  users: Vec<User>,
  /// email -> (password, user id)
  credentials: HashMap<String, (String, String)>,
  /// Oldest first
  posts: Vec<Post>,
  /// Oldest first
  comments: Vec<Comment>,
  saves: Vec<SavedPost>,
  session_user: Option<String>,
  next_id: u64,
  page_size: usize,
  failures: HashMap<RemoteOp, VecDeque<RemoteError>>,
  latency: HashMap<RemoteOp, Duration>,
  holds: HashMap<RemoteOp, Arc<Semaphore>>,
  calls: Vec<RemoteOp>,
  like_requests: Vec<LikeRequest>,
}

impl State {
  fn next_id(&mut self, prefix: &str) -> String {
    self.next_id += 1;
    format!("{}{}", prefix, self.next_id)
  }

  fn user(&self, user_id: &str) -> Result<&User, RemoteError> {
    self
      .users
      .iter()
      .find(|u| u.id == user_id)
      .ok_or_else(|| RemoteError::not_found("user", user_id))
  }

  fn post_mut(&mut self, post_id: &str) -> Result<&mut Post, RemoteError> {
    self
      .posts
      .iter_mut()
      .find(|p| p.id == post_id)
      .ok_or_else(|| RemoteError::not_found("post", post_id))
  }

  fn newest_posts(&self) -> impl Iterator<Item = &Post> {
    self.posts.iter().rev()
  }
}

/// In-memory Remote Data Client
#[derive(Clone)]
pub struct MemoryRemote {
  state: Arc<Mutex<State>>,
}

impl Default for MemoryRemote {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryRemote {
  pub fn new() -> Self {
    Self {
      state: Arc::new(Mutex::new(State {
        page_size: 9,
        ..State::default()
      })),
    }
  }

  fn lock(&self) -> MutexGuard<'_, State> {
    match self.state.lock() {
      Ok(guard) => guard,
      Err(poisoned) => {
        warn!("Recovered from poisoned memory backend lock");
        poisoned.into_inner()
      }
    }
  }

  // ==========================================================================
  // Fault injection
  // ==========================================================================

  /// Make the next call of `op` fail with `err`. Queued failures are consumed
  /// in call order.
  pub fn fail_next(&self, op: RemoteOp, err: RemoteError) {
    self.lock().failures.entry(op).or_default().push_back(err);
  }

  /// Delay every call of `op` by `latency`.
  pub fn with_latency(&self, op: RemoteOp, latency: Duration) {
    self.lock().latency.insert(op, latency);
  }

  /// Hold every call of `op` until the returned gate releases it.
  pub fn hold(&self, op: RemoteOp) -> Hold {
    let gate = Arc::new(Semaphore::new(0));
    self.lock().holds.insert(op, gate.clone());
    Hold { op, gate }
  }

  pub fn set_page_size(&self, page_size: usize) {
    self.lock().page_size = page_size.max(1);
  }

  /// Number of calls of `op` received so far.
  pub fn calls(&self, op: RemoteOp) -> usize {
    self.lock().calls.iter().filter(|c| **c == op).count()
  }

  pub fn like_requests(&self) -> Vec<LikeRequest> {
    self.lock().like_requests.clone()
  }

  /// Record the call, wait out latency and gates, and return any injected
  /// failure. The failure is picked when the call arrives so concurrent calls
  /// consume failures in arrival order.
  async fn enter(&self, op: RemoteOp) -> Result<(), RemoteError> {
    let (failure, latency, gate) = {
      let mut state = self.lock();
      state.calls.push(op);
      let failure = state.failures.get_mut(&op).and_then(VecDeque::pop_front);
      (
        failure,
        state.latency.get(&op).copied(),
        state.holds.get(&op).cloned(),
      )
    };

    if let Some(latency) = latency {
      tokio::time::sleep(latency).await;
    }
    if let Some(gate) = gate {
      // A closed gate lets everything through
      if let Ok(permit) = gate.acquire().await {
        permit.forget();
      }
    }

    match failure {
      Some(err) => {
        debug!(?op, error = %err, "Injected failure");
        Err(err)
      }
      None => Ok(()),
    }
  }

  // ==========================================================================
  // Seeding and inspection
  // ==========================================================================

  pub fn insert_user(&self, user: User) {
    self.lock().users.push(user);
  }

  pub fn insert_post(&self, post: Post) {
    self.lock().posts.push(post);
  }

  /// Add a comment; later inserts are newer.
  pub fn insert_comment(&self, comment: Comment) {
    self.lock().comments.push(comment);
  }

  /// Current server-side copy of a comment.
  pub fn comment(&self, comment_id: &str) -> Option<Comment> {
    self
      .lock()
      .comments
      .iter()
      .find(|c| c.id == comment_id)
      .cloned()
  }

  pub fn post(&self, post_id: &str) -> Option<Post> {
    self.lock().posts.iter().find(|p| p.id == post_id).cloned()
  }

  /// Sign `user_id` in without credentials.
  pub fn set_session_user(&self, user_id: &str) {
    self.lock().session_user = Some(user_id.to_string());
  }
}

fn require(entity: &'static str, id: &str) -> Result<(), RemoteError> {
  if id.trim().is_empty() {
    return Err(RemoteError::Validation(format!("{} id is empty", entity)));
  }
  Ok(())
}

#[async_trait]
impl RemoteClient for MemoryRemote {
  async fn create_account(&self, user: &NewUser) -> Result<User, RemoteError> {
    self.enter(RemoteOp::CreateAccount).await?;
    if user.email.trim().is_empty() || user.password.is_empty() {
      return Err(RemoteError::Validation("email and password are required".to_string()));
    }

    let mut state = self.lock();
    if state.credentials.contains_key(&user.email) {
      return Err(RemoteError::Conflict(format!("account {} already exists", user.email)));
    }

    let account_id = state.next_id("account");
    let id = state.next_id("user");
    let created = User {
      id: id.clone(),
      account_id,
      name: user.name.clone(),
      username: user.username.clone(),
      email: user.email.clone(),
      bio: None,
      image_url: None,
      liked_post_ids: Vec::new(),
      saves: Vec::new(),
    };
    state
      .credentials
      .insert(user.email.clone(), (user.password.clone(), id));
    state.users.push(created.clone());
    Ok(created)
  }

  async fn sign_in(&self, email: &str, password: &str) -> Result<Session, RemoteError> {
    self.enter(RemoteOp::SignIn).await?;
    let mut state = self.lock();
    let user_id = match state.credentials.get(email) {
      Some((stored, user_id)) if stored == password => user_id.clone(),
      _ => return Err(RemoteError::Validation("invalid credentials".to_string())),
    };
    let account_id = state.user(&user_id)?.account_id.clone();

    let id = state.next_id("session");
    state.session_user = Some(user_id);
    Ok(Session {
      id,
      account_id,
      secret: None,
    })
  }

  async fn sign_out(&self) -> Result<(), RemoteError> {
    self.enter(RemoteOp::SignOut).await?;
    self.lock().session_user = None;
    Ok(())
  }

  async fn get_current_user(&self) -> Result<User, RemoteError> {
    self.enter(RemoteOp::GetCurrentUser).await?;
    let state = self.lock();
    let user_id = state
      .session_user
      .clone()
      .ok_or_else(|| RemoteError::not_found("session", "current"))?;
    state.user(&user_id).cloned()
  }

  async fn create_post(&self, post: &NewPost) -> Result<Post, RemoteError> {
    self.enter(RemoteOp::CreatePost).await?;
    require("user", &post.creator_id)?;

    let mut state = self.lock();
    let creator = state.user(&post.creator_id).ok().map(User::author);
    let id = state.next_id("post");
    let created = Post {
      id,
      creator_id: post.creator_id.clone(),
      creator,
      caption: post.caption.clone(),
      image_id: post.image_id.clone(),
      image_url: post.image_url.clone(),
      location: post.location.clone(),
      tags: post.tags.clone(),
      likes: BTreeSet::new(),
      created_at: Utc::now(),
    };
    state.posts.push(created.clone());
    Ok(created)
  }

  async fn get_post_by_id(&self, post_id: &str) -> Result<Post, RemoteError> {
    self.enter(RemoteOp::GetPostById).await?;
    require("post", post_id)?;
    self
      .post(post_id)
      .ok_or_else(|| RemoteError::not_found("post", post_id))
  }

  async fn update_post(&self, post: &UpdatePost) -> Result<Post, RemoteError> {
    self.enter(RemoteOp::UpdatePost).await?;
    require("post", &post.post_id)?;

    let mut state = self.lock();
    let stored = state.post_mut(&post.post_id)?;
    stored.caption = post.caption.clone();
    stored.image_id = post.image_id.clone();
    stored.image_url = post.image_url.clone();
    stored.location = post.location.clone();
    stored.tags = post.tags.clone();
    Ok(stored.clone())
  }

  async fn delete_post(&self, post_id: &str) -> Result<(), RemoteError> {
    self.enter(RemoteOp::DeletePost).await?;
    require("post", post_id)?;

    let mut state = self.lock();
    let before = state.posts.len();
    state.posts.retain(|p| p.id != post_id);
    if state.posts.len() == before {
      return Err(RemoteError::not_found("post", post_id));
    }
    state.comments.retain(|c| c.post_id != post_id);
    Ok(())
  }

  async fn get_recent_posts(&self) -> Result<Vec<Post>, RemoteError> {
    self.enter(RemoteOp::GetRecentPosts).await?;
    Ok(self.lock().newest_posts().take(20).cloned().collect())
  }

  async fn get_infinite_posts(&self, cursor: Option<&str>) -> Result<Vec<Post>, RemoteError> {
    self.enter(RemoteOp::GetInfinitePosts).await?;
    let state = self.lock();
    let page_size = state.page_size;
    let mut posts = state.newest_posts();

    if let Some(cursor) = cursor {
      if !state.posts.iter().any(|p| p.id == cursor) {
        return Err(RemoteError::not_found("post", cursor));
      }
      for post in posts.by_ref() {
        if post.id == cursor {
          break;
        }
      }
    }
    Ok(posts.take(page_size).cloned().collect())
  }

  async fn search_posts(&self, term: &str) -> Result<Vec<Post>, RemoteError> {
    self.enter(RemoteOp::SearchPosts).await?;
    let term = term.to_lowercase();
    Ok(
      self
        .lock()
        .newest_posts()
        .filter(|p| p.caption.to_lowercase().contains(&term))
        .cloned()
        .collect(),
    )
  }

  async fn get_user_posts(&self, user_id: &str) -> Result<Vec<Post>, RemoteError> {
    self.enter(RemoteOp::GetUserPosts).await?;
    require("user", user_id)?;
    Ok(
      self
        .lock()
        .newest_posts()
        .filter(|p| p.creator_id == user_id)
        .cloned()
        .collect(),
    )
  }

  async fn like_post(&self, post_id: &str, likes: &BTreeSet<String>) -> Result<Post, RemoteError> {
    self.enter(RemoteOp::LikePost).await?;
    require("post", post_id)?;

    let mut state = self.lock();
    let post = state.post_mut(post_id)?;
    post.likes = likes.clone();
    let post = post.clone();

    for user in state.users.iter_mut() {
      let liked = post.likes.contains(&user.id);
      let listed = user.liked_post_ids.iter().any(|id| *id == post.id);
      if liked && !listed {
        user.liked_post_ids.push(post.id.clone());
      } else if !liked && listed {
        user.liked_post_ids.retain(|id| *id != post.id);
      }
    }
    Ok(post)
  }

  async fn save_post(&self, user_id: &str, post_id: &str) -> Result<SavedPost, RemoteError> {
    self.enter(RemoteOp::SavePost).await?;
    require("user", user_id)?;
    require("post", post_id)?;

    let mut state = self.lock();
    state.post_mut(post_id)?;
    let id = state.next_id("save");
    let saved = SavedPost {
      id,
      user_id: user_id.to_string(),
      post_id: post_id.to_string(),
    };
    state.saves.push(saved.clone());
    if let Some(user) = state.users.iter_mut().find(|u| u.id == user_id) {
      user.saves.push(saved.clone());
    }
    Ok(saved)
  }

  async fn delete_saved_post(&self, saved_id: &str) -> Result<(), RemoteError> {
    self.enter(RemoteOp::DeleteSavedPost).await?;
    require("save", saved_id)?;

    let mut state = self.lock();
    let before = state.saves.len();
    state.saves.retain(|s| s.id != saved_id);
    if state.saves.len() == before {
      return Err(RemoteError::not_found("save", saved_id));
    }
    for user in state.users.iter_mut() {
      user.saves.retain(|s| s.id != saved_id);
    }
    Ok(())
  }

  async fn get_users(&self, limit: Option<u32>) -> Result<Vec<User>, RemoteError> {
    self.enter(RemoteOp::GetUsers).await?;
    let state = self.lock();
    let users = state.users.iter().rev().cloned();
    Ok(match limit {
      Some(limit) => users.take(limit as usize).collect(),
      None => users.collect(),
    })
  }

  async fn get_user_by_id(&self, user_id: &str) -> Result<User, RemoteError> {
    self.enter(RemoteOp::GetUserById).await?;
    require("user", user_id)?;
    self.lock().user(user_id).cloned()
  }

  async fn update_user(&self, user: &UpdateUser) -> Result<User, RemoteError> {
    self.enter(RemoteOp::UpdateUser).await?;
    require("user", &user.user_id)?;

    let mut state = self.lock();
    let stored = state
      .users
      .iter_mut()
      .find(|u| u.id == user.user_id)
      .ok_or_else(|| RemoteError::not_found("user", &user.user_id))?;
    stored.name = user.name.clone();
    stored.bio = user.bio.clone();
    stored.image_url = user.image_url.clone();
    Ok(stored.clone())
  }

  async fn get_comments(&self, post_id: &str) -> Result<Vec<Comment>, RemoteError> {
    self.enter(RemoteOp::GetComments).await?;
    require("post", post_id)?;
    Ok(
      self
        .lock()
        .comments
        .iter()
        .rev()
        .filter(|c| c.post_id == post_id)
        .cloned()
        .collect(),
    )
  }

  async fn create_comment(&self, post_id: &str, text: &str, author_id: &str) -> Result<Comment, RemoteError> {
    self.enter(RemoteOp::CreateComment).await?;
    require("post", post_id)?;
    if text.trim().is_empty() {
      return Err(RemoteError::Validation("comment text is empty".to_string()));
    }

    let mut state = self.lock();
    let author = state.user(author_id).ok().map(User::author);
    let id = state.next_id("comment");
    let created = Comment {
      id,
      post_id: post_id.to_string(),
      author_id: author_id.to_string(),
      author,
      text: text.to_string(),
      liked_by: BTreeSet::new(),
      created_at: Utc::now(),
      pending: false,
    };
    state.comments.push(created.clone());
    Ok(created)
  }

  async fn toggle_comment_like(
    &self,
    comment_id: &str,
    user_id: &str,
    previous_liked_by: &BTreeSet<String>,
    post_id: &str,
  ) -> Result<Comment, RemoteError> {
    self.enter(RemoteOp::ToggleCommentLike).await?;
    require("comment", comment_id)?;

    let mut state = self.lock();
    state.like_requests.push(LikeRequest {
      comment_id: comment_id.to_string(),
      user_id: user_id.to_string(),
      previous_liked_by: previous_liked_by.clone(),
    });

    let comment = state
      .comments
      .iter_mut()
      .find(|c| c.id == comment_id && c.post_id == post_id)
      .ok_or_else(|| RemoteError::not_found("comment", comment_id))?;

    // Compare-and-set: the caller's view must match what is stored
    if comment.liked_by != *previous_liked_by {
      return Err(RemoteError::Conflict(format!(
        "likes of comment {} changed since they were read",
        comment_id
      )));
    }

    comment.liked_by = toggled(previous_liked_by, user_id);
    Ok(comment.clone())
  }
}

impl std::fmt::Debug for MemoryRemote {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let state = self.lock();
    f.debug_struct("MemoryRemote")
      .field("users", &state.users.len())
      .field("posts", &state.posts.len())
      .field("comments", &state.comments.len())
      .finish_non_exhaustive()
  }
}
