//! Optimistic comment creation and comment-like toggling.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::{QueryCache, QueryKey};
use crate::error::{MutationError, Operation, RemoteError};
use crate::remote::{toggled, Comment, RemoteClient, User};

use super::{MutationLanes, MutationRun, MutationStatus, OptimisticUpdate};

/// Inserts a provisional comment at the head of a post's comment list.
#[derive(Debug, Clone)]
pub struct NewComment {
  key: QueryKey,
  comment: Comment,
}

impl NewComment {
  pub fn new(comment: Comment) -> Self {
    Self {
      key: QueryKey::comments(&comment.post_id),
      comment,
    }
  }

  pub fn comment(&self) -> &Comment {
    &self.comment
  }
}

impl OptimisticUpdate for NewComment {
  type Data = Vec<Comment>;

  fn key(&self) -> &QueryKey {
    &self.key
  }

  fn apply(&self, current: Option<&Vec<Comment>>) -> Option<Vec<Comment>> {
    let mut next = Vec::with_capacity(current.map_or(0, Vec::len) + 1);
    next.push(self.comment.clone());
    if let Some(current) = current {
      next.extend(current.iter().cloned());
    }
    Some(next)
  }

  fn revert(&self, current: &Vec<Comment>, _snapshot: Option<&Vec<Comment>>) -> Vec<Comment> {
    current
      .iter()
      .filter(|c| c.id != self.comment.id)
      .cloned()
      .collect()
  }
}

/// Flips one user's like on one comment of a post's comment list.
#[derive(Debug, Clone)]
pub struct LikeToggle {
  key: QueryKey,
  comment_id: String,
  user_id: String,
}

impl LikeToggle {
  pub fn new(post_id: &str, comment_id: &str, user_id: &str) -> Self {
    Self {
      key: QueryKey::comments(post_id),
      comment_id: comment_id.to_string(),
      user_id: user_id.to_string(),
    }
  }

  fn liked_by_in<'a>(&self, list: Option<&'a Vec<Comment>>) -> Option<&'a BTreeSet<String>> {
    list?
      .iter()
      .find(|c| c.id == self.comment_id)
      .map(|c| &c.liked_by)
  }
}

impl OptimisticUpdate for LikeToggle {
  type Data = Vec<Comment>;

  fn key(&self) -> &QueryKey {
    &self.key
  }

  /// Aborts when the list or the comment is absent, or the comment is still
  /// provisional and unknown to the backend.
  fn apply(&self, current: Option<&Vec<Comment>>) -> Option<Vec<Comment>> {
    let current = current?;
    let index = current.iter().position(|c| c.id == self.comment_id)?;
    if current[index].is_provisional() {
      return None;
    }

    let mut next = current.clone();
    next[index].liked_by = toggled(&next[index].liked_by, &self.user_id);
    Some(next)
  }

  /// Put the user's membership back to what it was in the snapshot.
  fn revert(&self, current: &Vec<Comment>, snapshot: Option<&Vec<Comment>>) -> Vec<Comment> {
    let was_liked = snapshot
      .and_then(|list| list.iter().find(|c| c.id == self.comment_id))
      .is_some_and(|c| c.is_liked_by(&self.user_id));

    let mut next = current.clone();
    if let Some(comment) = next.iter_mut().find(|c| c.id == self.comment_id) {
      if was_liked {
        comment.liked_by.insert(self.user_id.clone());
      } else {
        comment.liked_by.remove(&self.user_id);
      }
    }
    next
  }
}

/// Entry point for comment writes from the view.
#[derive(Clone)]
pub struct CommentMutations {
  cache: QueryCache,
  remote: Arc<dyn RemoteClient>,
  lanes: Arc<MutationLanes>,
  next_provisional: Arc<AtomicU64>,
  create_status: Arc<watch::Sender<MutationStatus>>,
  toggle_status: Arc<watch::Sender<MutationStatus>>,
}

impl CommentMutations {
  pub fn new(cache: QueryCache, remote: Arc<dyn RemoteClient>) -> Self {
    let (create_status, _) = watch::channel(MutationStatus::Idle);
    let (toggle_status, _) = watch::channel(MutationStatus::Idle);

    Self {
      cache,
      remote,
      lanes: Arc::new(MutationLanes::new()),
      next_provisional: Arc::new(AtomicU64::new(1)),
      create_status: Arc::new(create_status),
      toggle_status: Arc::new(toggle_status),
    }
  }

  /// Status of the latest comment creation.
  pub fn create_status(&self) -> watch::Receiver<MutationStatus> {
    self.create_status.subscribe()
  }

  /// Status of the latest like toggle.
  pub fn toggle_status(&self) -> watch::Receiver<MutationStatus> {
    self.toggle_status.subscribe()
  }

  /// Create a comment, showing it at the head of the post's comment list
  /// before the backend confirms it.
  ///
  /// On success the provisional comment is replaced by the server's. On
  /// failure the list is rolled back and the error returned; nothing is
  /// retried. The list is invalidated either way.
  pub async fn create_comment(
    &self,
    post_id: &str,
    text: &str,
    author_id: &str,
  ) -> Result<Comment, MutationError> {
    let fail = |err: RemoteError| {
      let err = MutationError::new(Operation::CreateComment, post_id, err);
      self.create_status.send_replace(MutationStatus::Error(err.clone()));
      err
    };

    if post_id.trim().is_empty() {
      return Err(fail(RemoteError::Validation("post id is empty".to_string())));
    }
    if text.trim().is_empty() {
      return Err(fail(RemoteError::Validation("comment text is empty".to_string())));
    }

    let author = self
      .cache
      .get_data::<User>(&QueryKey::current_user())
      .filter(|user| user.id == author_id)
      .map(|user| user.author());
    let seq = self.next_provisional.fetch_add(1, Ordering::Relaxed);
    let provisional = Comment::provisional(seq, post_id, author_id, text, author);
    let provisional_id = provisional.id.clone();
    let key = QueryKey::comments(post_id);

    let mut run = MutationRun::new(self.cache.clone(), NewComment::new(provisional));
    run.apply();
    self.create_status.send_replace(MutationStatus::Pending);
    debug!(post_id, comment_id = %provisional_id, "Creating comment");

    match self.remote.create_comment(post_id, text, author_id).await {
      Ok(created) => {
        run.commit_with(|list| {
          let index = list.iter().position(|c| c.id == provisional_id)?;
          let mut next = list.clone();
          if next.iter().any(|c| c.id == created.id) {
            next.remove(index);
          } else {
            next[index] = created.clone();
          }
          Some(next)
        });
        self.cache.invalidate(&key);
        self.create_status.send_replace(MutationStatus::Success);
        info!(post_id, comment_id = %created.id, "Created comment");
        Ok(created)
      }
      Err(err) => {
        let outcome = run.rollback();
        warn!(post_id, error = %err, ?outcome, "Create comment failed, rolled back");
        self.cache.invalidate(&key);
        Err(fail(err))
      }
    }
  }

  /// Toggle `user_id`'s like on a comment.
  ///
  /// Returns `Ok(None)` without touching the cache or the backend when the
  /// comment is not in the cached list. Toggles on the same comment run one
  /// at a time; each takes its snapshot right before its own apply. The
  /// list is invalidated once the backend answers, whatever the answer.
  pub async fn toggle_like(
    &self,
    post_id: &str,
    comment_id: &str,
    user_id: &str,
  ) -> Result<Option<Comment>, MutationError> {
    let _lane = self.lanes.acquire(comment_id).await;

    let key = QueryKey::comments(post_id);
    let toggle = LikeToggle::new(post_id, comment_id, user_id);
    let mut run = MutationRun::new(self.cache.clone(), toggle);
    if !run.apply() {
      debug!(post_id, comment_id, "Comment not in cache, toggle skipped");
      return Ok(None);
    }

    let previous = run
      .update()
      .liked_by_in(run.snapshot().and_then(|s| s.value.as_ref()))
      .cloned()
      .unwrap_or_default();
    self.toggle_status.send_replace(MutationStatus::Pending);
    debug!(post_id, comment_id, user_id, "Toggling comment like");

    let result = self
      .remote
      .toggle_comment_like(comment_id, user_id, &previous, post_id)
      .await;

    let outcome = match result {
      Ok(server) => {
        let expected = toggled(&previous, user_id);
        if server.liked_by == expected {
          run.commit();
        } else {
          warn!(
            comment_id,
            expected = ?expected,
            actual = ?server.liked_by,
            "Server likes differ from optimistic value, taking server's"
          );
          run.commit_with(|list| {
            let index = list.iter().position(|c| c.id == server.id)?;
            let mut next = list.clone();
            next[index].liked_by = server.liked_by.clone();
            Some(next)
          });
        }
        self.toggle_status.send_replace(MutationStatus::Success);
        Ok(Some(server))
      }
      Err(err) => {
        let rollback = run.rollback();
        warn!(comment_id, error = %err, outcome = ?rollback, "Toggle like failed, rolled back");
        let err = MutationError::new(Operation::ToggleCommentLike, comment_id, err);
        self.toggle_status.send_replace(MutationStatus::Error(err.clone()));
        Err(err)
      }
    };

    self.cache.invalidate(&key);
    outcome
  }
}

impl std::fmt::Debug for CommentMutations {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CommentMutations")
      .field("lanes", &self.lanes)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::Subscription;
  use crate::remote::{MemoryRemote, RemoteOp};
  use chrono::{TimeZone, Utc};
  use std::time::Duration;

  fn comment(id: &str, liked_by: &[&str]) -> Comment {
    Comment {
      id: id.to_string(),
      post_id: "post1".to_string(),
      author_id: "author".to_string(),
      author: None,
      text: format!("comment {}", id),
      liked_by: liked_by.iter().map(|u| u.to_string()).collect(),
      created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
      pending: false,
    }
  }

  /// Cache and backend both holding `comments` for post1, oldest last.
  fn setup(comments: Vec<Comment>) -> (QueryCache, MemoryRemote, CommentMutations) {
    let cache = QueryCache::default();
    let remote = MemoryRemote::new();
    for c in comments.iter().rev() {
      remote.insert_comment(c.clone());
    }
    cache.set(&key(), comments);
    let mutations = CommentMutations::new(cache.clone(), Arc::new(remote.clone()));
    (cache, remote, mutations)
  }

  fn key() -> QueryKey {
    QueryKey::comments("post1")
  }

  fn cached(cache: &QueryCache) -> Vec<Comment> {
    cache.get_data::<Vec<Comment>>(&key()).unwrap_or_default()
  }

  fn likes(cache: &QueryCache, comment_id: &str) -> BTreeSet<String> {
    cached(cache)
      .into_iter()
      .find(|c| c.id == comment_id)
      .map(|c| c.liked_by)
      .unwrap_or_default()
  }

  fn set(users: &[&str]) -> BTreeSet<String> {
    users.iter().map(|u| u.to_string()).collect()
  }

  fn transport() -> RemoteError {
    RemoteError::Transport("connection reset".to_string())
  }

  /// Subscribe to post1's list with a fetcher reading from `remote`.
  fn observe(cache: &QueryCache, remote: &MemoryRemote) -> Subscription {
    let fetcher = {
      let remote = remote.clone();
      move || {
        let remote = remote.clone();
        async move { remote.get_comments("post1").await }
      }
    };
    cache.set_fetcher(&key(), fetcher);
    cache.subscribe(&key())
  }

  #[tokio::test]
  async fn test_failed_toggle_scenario() {
    let (cache, remote, mutations) = setup(vec![comment("c1", &[])]);
    remote.fail_next(RemoteOp::ToggleCommentLike, transport());
    let hold = remote.hold(RemoteOp::ToggleCommentLike);

    let toggling = {
      let mutations = mutations.clone();
      tokio::spawn(async move { mutations.toggle_like("post1", "c1", "u1").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(likes(&cache, "c1"), set(&["u1"]));

    hold.release();
    let err = toggling.await.unwrap().unwrap_err();

    assert_eq!(err.target, "c1");
    assert_eq!(err.operation, Operation::ToggleCommentLike);
    assert_eq!(cached(&cache), vec![comment("c1", &[])]);
  }

  #[tokio::test]
  async fn test_two_toggles_restore_original_likes() {
    let (cache, remote, mutations) = setup(vec![comment("c1", &["u2"])]);

    mutations.toggle_like("post1", "c1", "u1").await.unwrap();
    assert_eq!(likes(&cache, "c1"), set(&["u1", "u2"]));
    mutations.toggle_like("post1", "c1", "u1").await.unwrap();

    assert_eq!(likes(&cache, "c1"), set(&["u2"]));
    assert_eq!(remote.comment("c1").unwrap().liked_by, set(&["u2"]));
  }

  #[tokio::test]
  async fn test_toggle_sends_previous_likes() {
    let (_cache, remote, mutations) = setup(vec![comment("c1", &["u2"])]);

    mutations.toggle_like("post1", "c1", "u1").await.unwrap();

    let requests = remote.like_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].previous_liked_by, set(&["u2"]));
    assert_eq!(requests[0].user_id, "u1");
  }

  #[tokio::test]
  async fn test_toggle_absent_comment_is_noop() {
    let (cache, remote, mutations) = setup(vec![comment("c1", &[])]);

    let result = mutations.toggle_like("post1", "c9", "u1").await;

    assert_eq!(result, Ok(None));
    assert_eq!(cached(&cache), vec![comment("c1", &[])]);
    assert_eq!(remote.calls(RemoteOp::ToggleCommentLike), 0);
  }

  #[tokio::test]
  async fn test_toggle_with_no_cached_list_creates_nothing() {
    let cache = QueryCache::default();
    let remote = MemoryRemote::new();
    let mutations = CommentMutations::new(cache.clone(), Arc::new(remote.clone()));

    let result = mutations.toggle_like("post1", "c1", "u1").await;

    assert_eq!(result, Ok(None));
    assert!(!cache.contains(&key()));
  }

  #[tokio::test]
  async fn test_concurrent_toggles_compose() {
    let (cache, remote, mutations) = setup(vec![comment("c1", &[])]);
    let hold = remote.hold(RemoteOp::ToggleCommentLike);

    let first = {
      let mutations = mutations.clone();
      tokio::spawn(async move { mutations.toggle_like("post1", "c1", "A").await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = {
      let mutations = mutations.clone();
      tokio::spawn(async move { mutations.toggle_like("post1", "c1", "B").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    // The second toggle waits for the first to settle
    assert_eq!(remote.calls(RemoteOp::ToggleCommentLike), 1);
    assert_eq!(likes(&cache, "c1"), set(&["A"]));

    hold.open();
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    assert_eq!(likes(&cache, "c1"), set(&["A", "B"]));
    assert_eq!(remote.comment("c1").unwrap().liked_by, set(&["A", "B"]));
  }

  #[tokio::test]
  async fn test_concurrent_toggles_compose_with_slow_remote() {
    let (cache, remote, mutations) = setup(vec![comment("c1", &[])]);
    remote.with_latency(RemoteOp::ToggleCommentLike, Duration::from_millis(20));

    let (a, b) = tokio::join!(
      mutations.toggle_like("post1", "c1", "B"),
      mutations.toggle_like("post1", "c1", "A"),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(likes(&cache, "c1"), set(&["A", "B"]));
  }

  #[tokio::test]
  async fn test_first_toggle_fails_second_succeeds() {
    let (cache, remote, mutations) = setup(vec![comment("c1", &[])]);
    remote.fail_next(RemoteOp::ToggleCommentLike, transport());
    let hold = remote.hold(RemoteOp::ToggleCommentLike);

    let first = {
      let mutations = mutations.clone();
      tokio::spawn(async move { mutations.toggle_like("post1", "c1", "A").await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = {
      let mutations = mutations.clone();
      tokio::spawn(async move { mutations.toggle_like("post1", "c1", "B").await })
    };

    hold.open();
    assert!(first.await.unwrap().is_err());
    assert!(second.await.unwrap().unwrap().is_some());

    assert_eq!(likes(&cache, "c1"), set(&["B"]));
    assert_eq!(remote.comment("c1").unwrap().liked_by, set(&["B"]));
  }

  #[tokio::test]
  async fn test_conflict_rolls_back() {
    let (cache, remote, mutations) = setup(vec![comment("c1", &[])]);
    // Someone else liked the comment on the server
    remote
      .toggle_comment_like("c1", "u9", &BTreeSet::new(), "post1")
      .await
      .unwrap();

    let err = mutations.toggle_like("post1", "c1", "u1").await.unwrap_err();

    assert!(matches!(err.source, RemoteError::Conflict(_)));
    assert_eq!(likes(&cache, "c1"), BTreeSet::new());
  }

  #[tokio::test]
  async fn test_toggle_settle_refetches_observed_list() {
    let (cache, remote, mutations) = setup(vec![comment("c1", &[])]);
    let _subscription = observe(&cache, &remote);

    mutations.toggle_like("post1", "c1", "u1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(remote.calls(RemoteOp::GetComments), 1);
    assert_eq!(likes(&cache, "c1"), set(&["u1"]));
  }

  #[tokio::test]
  async fn test_skipped_toggle_keeps_refetch_running() {
    let (cache, remote, mutations) = setup(vec![comment("c1", &[])]);
    let _subscription = observe(&cache, &remote);
    remote.insert_comment(comment("c2", &[]));
    let hold = remote.hold(RemoteOp::GetComments);

    assert!(cache.invalidate(&key()));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let result = mutations.toggle_like("post1", "c9", "u1").await;
    assert_eq!(result, Ok(None));
    assert!(cache.get::<Vec<Comment>>(&key()).unwrap().is_loading());

    hold.release();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let entry = cache.get::<Vec<Comment>>(&key()).unwrap();
    assert_eq!(entry.data().map(Vec::len), Some(2));
    assert!(!entry.is_stale);
    assert_eq!(remote.calls(RemoteOp::GetComments), 1);
    assert_eq!(remote.calls(RemoteOp::ToggleCommentLike), 0);
  }

  #[tokio::test]
  async fn test_toggle_on_provisional_comment_is_noop() {
    let provisional = Comment::provisional(1, "post1", "u1", "hi", None);
    let (cache, remote, mutations) = setup(vec![provisional.clone()]);

    let result = mutations.toggle_like("post1", &provisional.id, "u2").await;

    assert_eq!(result, Ok(None));
    assert_eq!(remote.calls(RemoteOp::ToggleCommentLike), 0);
    assert!(likes(&cache, &provisional.id).is_empty());
  }

  #[tokio::test]
  async fn test_created_comment_visible_before_remote_resolves() {
    let (cache, remote, mutations) = setup(vec![comment("c1", &[])]);
    let hold = remote.hold(RemoteOp::CreateComment);

    let creating = {
      let mutations = mutations.clone();
      tokio::spawn(async move { mutations.create_comment("post1", "hello", "u1").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let list = cached(&cache);
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].text, "hello");
    assert!(list[0].is_provisional());
    assert!(list[0].liked_by.is_empty());
    assert_eq!(list[1].id, "c1");
    assert!(mutations.create_status().borrow().is_pending());

    hold.release();
    let created = creating.await.unwrap().unwrap();

    let list = cached(&cache);
    assert_eq!(list[0], created);
    assert!(!list[0].is_provisional());
    assert_eq!(list.len(), 2);
    assert_eq!(*mutations.create_status().borrow(), MutationStatus::Success);
  }

  #[tokio::test]
  async fn test_failed_create_restores_list_exactly() {
    let before = vec![comment("c2", &["u3"]), comment("c1", &[])];
    let (cache, remote, mutations) = setup(before.clone());
    remote.fail_next(RemoteOp::CreateComment, transport());

    let err = mutations
      .create_comment("post1", "hello", "u1")
      .await
      .unwrap_err();

    assert_eq!(err.operation, Operation::CreateComment);
    assert_eq!(err.target, "post1");
    assert_eq!(cached(&cache), before);
    assert!(matches!(
      *mutations.create_status().borrow(),
      MutationStatus::Error(_)
    ));
  }

  #[tokio::test]
  async fn test_failed_create_refetches_invalidated_list() {
    let (cache, remote, mutations) = setup(vec![comment("c1", &[])]);
    let _subscription = observe(&cache, &remote);
    remote.insert_comment(comment("c2", &[]));
    remote.fail_next(RemoteOp::CreateComment, transport());
    let hold = remote.hold(RemoteOp::GetComments);

    assert!(cache.invalidate(&key()));
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(mutations.create_comment("post1", "hello", "u1").await.is_err());

    let entry = cache.get::<Vec<Comment>>(&key()).unwrap();
    assert_eq!(entry.data(), Some(&vec![comment("c1", &[])]));
    assert!(entry.is_stale);

    hold.open();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let entry = cache.get::<Vec<Comment>>(&key()).unwrap();
    assert_eq!(entry.data(), Some(&vec![comment("c2", &[]), comment("c1", &[])]));
    assert!(!entry.is_stale);
    assert_eq!(remote.calls(RemoteOp::GetComments), 2);
  }

  #[tokio::test]
  async fn test_create_on_uncached_list_seeds_then_rolls_back() {
    let cache = QueryCache::default();
    let remote = MemoryRemote::new();
    remote.fail_next(RemoteOp::CreateComment, transport());
    let hold = remote.hold(RemoteOp::CreateComment);
    let mutations = CommentMutations::new(cache.clone(), Arc::new(remote.clone()));

    let creating = {
      let mutations = mutations.clone();
      tokio::spawn(async move { mutations.create_comment("post1", "first", "u1").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(cached(&cache).len(), 1);

    hold.release();
    assert!(creating.await.unwrap().is_err());
    assert!(!cache.contains(&key()));
  }

  #[tokio::test]
  async fn test_create_rollback_keeps_concurrent_toggle() {
    let (cache, remote, mutations) = setup(vec![comment("c1", &[])]);
    remote.fail_next(RemoteOp::CreateComment, transport());
    let hold = remote.hold(RemoteOp::CreateComment);

    let creating = {
      let mutations = mutations.clone();
      tokio::spawn(async move { mutations.create_comment("post1", "hello", "u1").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    mutations.toggle_like("post1", "c1", "u2").await.unwrap();

    hold.release();
    assert!(creating.await.unwrap().is_err());

    assert_eq!(cached(&cache), vec![comment("c1", &["u2"])]);
  }

  #[tokio::test]
  async fn test_create_rollback_after_eviction_is_noop() {
    let (cache, remote, mutations) = setup(vec![comment("c1", &[])]);
    remote.fail_next(RemoteOp::CreateComment, transport());
    let hold = remote.hold(RemoteOp::CreateComment);

    let creating = {
      let mutations = mutations.clone();
      tokio::spawn(async move { mutations.create_comment("post1", "hello", "u1").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    cache.remove(&key());

    hold.release();
    assert!(creating.await.unwrap().is_err());
    assert!(!cache.contains(&key()));
  }

  #[tokio::test]
  async fn test_create_rejects_empty_text_before_any_write() {
    let (cache, remote, mutations) = setup(vec![comment("c1", &[])]);

    let err = mutations.create_comment("post1", "  ", "u1").await.unwrap_err();

    assert!(matches!(err.source, RemoteError::Validation(_)));
    assert_eq!(cached(&cache), vec![comment("c1", &[])]);
    assert_eq!(remote.calls(RemoteOp::CreateComment), 0);
  }

  #[tokio::test]
  async fn test_provisional_comment_carries_cached_author() {
    let (cache, remote, mutations) = setup(Vec::new());
    let user = User {
      id: "u1".to_string(),
      account_id: "acc1".to_string(),
      name: "Ada".to_string(),
      username: "ada".to_string(),
      email: "ada@example.com".to_string(),
      bio: None,
      image_url: None,
      liked_post_ids: Vec::new(),
      saves: Vec::new(),
    };
    cache.set(&QueryKey::current_user(), user.clone());
    let hold = remote.hold(RemoteOp::CreateComment);

    let creating = {
      let mutations = mutations.clone();
      tokio::spawn(async move { mutations.create_comment("post1", "hello", "u1").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(cached(&cache)[0].author, Some(user.author()));

    hold.release();
    creating.await.unwrap().unwrap();
  }

  #[test]
  fn test_like_toggle_revert_uses_snapshot_membership() {
    let toggle = LikeToggle::new("post1", "c1", "u1");
    let snapshot = vec![comment("c1", &[])];
    // Another write landed after the optimistic toggle
    let diverged = vec![comment("c2", &[]), comment("c1", &["u1"])];

    let reverted = toggle.revert(&diverged, Some(&snapshot));

    assert_eq!(reverted, vec![comment("c2", &[]), comment("c1", &[])]);
  }
}
