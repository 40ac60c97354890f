//! The action surface abstraction.
//!
//! Every side effect against the social graph goes through
//! [`ActionSurface`]. The engine core never talks to a network or a
//! browser directly; a production surface adapter implements this
//! trait, and tests drive the engine with [`StaticSurface`].

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use thiserror::Error;

use crate::store::{CachedProfile, MemberKind};

/// Errors a surface can report. `RateLimited` is the signal the
/// execution loop reacts to with cooldown-and-retry; everything else
/// fails the current item.
#[derive(Debug, Error)]
pub enum SurfaceError {
    /// The surface cannot accept actions yet (not logged in, page not
    /// loaded, connection down).
    #[error("surface not ready: {0}")]
    NotReady(String),

    /// The platform is throttling us. Retryable after cooldown.
    #[error("rate limited by platform")]
    RateLimited,

    /// Anything else; fails the current item.
    #[error("{0}")]
    Other(String),
}

/// The set of graph operations the engine needs.
#[async_trait]
pub trait ActionSurface: Send + Sync {
    /// Whether the surface can accept actions right now.
    async fn is_ready(&self) -> bool;

    /// Bring the surface to a user's profile. Called before the
    /// per-user operations; non-mutating, so it runs even in dry-run.
    async fn navigate_to_profile(&self, username: &str) -> Result<(), SurfaceError>;

    /// Follow a user.
    async fn follow(&self, username: &str) -> Result<(), SurfaceError>;

    /// Unfollow a user.
    async fn unfollow(&self, username: &str) -> Result<(), SurfaceError>;

    /// Whether the operating account currently follows this user,
    /// according to the surface.
    async fn is_following(&self, username: &str) -> Result<bool, SurfaceError>;

    /// Fetch a user's profile, if the surface can see it.
    async fn fetch_profile(&self, username: &str) -> Result<Option<CachedProfile>, SurfaceError>;

    /// Enumerate a membership set (followers or following) of a
    /// subject account, up to `limit` members.
    async fn list_members(
        &self,
        subject: &str,
        kind: MemberKind,
        limit: usize,
    ) -> Result<Vec<String>, SurfaceError>;
}

/// A performed call, recorded by [`StaticSurface`] for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceCall {
    Follow(String),
    Unfollow(String),
}

#[derive(Default)]
struct StaticState {
    ready: bool,
    members: HashMap<(String, MemberKind), Vec<String>>,
    profiles: HashMap<String, CachedProfile>,
    following: Vec<String>,
    /// Per-username queues of scripted errors, consumed in order. An
    /// empty queue means the call succeeds.
    scripted: HashMap<String, VecDeque<SurfaceError>>,
    calls: Vec<SurfaceCall>,
}

/// In-memory surface with preloaded data and scripted outcomes.
///
/// Used by the engine's tests, and by the CLI when member lists come
/// from files rather than a live platform adapter.
pub struct StaticSurface {
    state: Mutex<StaticState>,
}

impl Default for StaticSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticSurface {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StaticState {
                ready: true,
                ..Default::default()
            }),
        }
    }

    /// Preload a membership set for `list_members`.
    pub fn set_members(&self, subject: &str, kind: MemberKind, members: Vec<String>) {
        let mut state = self.state.lock().unwrap();
        state.members.insert((subject.to_string(), kind), members);
    }

    /// Preload a profile for `fetch_profile`.
    pub fn set_profile(&self, profile: CachedProfile) {
        let mut state = self.state.lock().unwrap();
        state.profiles.insert(profile.username.clone(), profile);
    }

    /// Mark the account as already following a user.
    pub fn set_following(&self, username: &str) {
        let mut state = self.state.lock().unwrap();
        state.following.push(username.to_string());
    }

    pub fn set_ready(&self, ready: bool) {
        self.state.lock().unwrap().ready = ready;
    }

    /// Script an error for the next action against `username`. Queued
    /// errors are consumed in order; once the queue drains, actions
    /// succeed again.
    pub fn script_error(&self, username: &str, error: SurfaceError) {
        let mut state = self.state.lock().unwrap();
        state
            .scripted
            .entry(username.to_string())
            .or_default()
            .push_back(error);
    }

    /// All follow/unfollow calls performed so far, in order.
    pub fn calls(&self) -> Vec<SurfaceCall> {
        self.state.lock().unwrap().calls.clone()
    }

    fn take_scripted(state: &mut StaticState, username: &str) -> Option<SurfaceError> {
        state.scripted.get_mut(username).and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl ActionSurface for StaticSurface {
    async fn is_ready(&self) -> bool {
        self.state.lock().unwrap().ready
    }

    async fn navigate_to_profile(&self, username: &str) -> Result<(), SurfaceError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = Self::take_scripted(&mut state, username) {
            return Err(err);
        }
        Ok(())
    }

    async fn follow(&self, username: &str) -> Result<(), SurfaceError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = Self::take_scripted(&mut state, username) {
            return Err(err);
        }
        state.calls.push(SurfaceCall::Follow(username.to_string()));
        if !state.following.iter().any(|u| u == username) {
            state.following.push(username.to_string());
        }
        Ok(())
    }

    async fn unfollow(&self, username: &str) -> Result<(), SurfaceError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = Self::take_scripted(&mut state, username) {
            return Err(err);
        }
        state.calls.push(SurfaceCall::Unfollow(username.to_string()));
        state.following.retain(|u| u != username);
        Ok(())
    }

    async fn is_following(&self, username: &str) -> Result<bool, SurfaceError> {
        let state = self.state.lock().unwrap();
        Ok(state.following.iter().any(|u| u == username))
    }

    async fn fetch_profile(&self, username: &str) -> Result<Option<CachedProfile>, SurfaceError> {
        let state = self.state.lock().unwrap();
        Ok(state.profiles.get(username).cloned())
    }

    async fn list_members(
        &self,
        subject: &str,
        kind: MemberKind,
        limit: usize,
    ) -> Result<Vec<String>, SurfaceError> {
        let state = self.state.lock().unwrap();
        let members = state
            .members
            .get(&(subject.to_string(), kind))
            .cloned()
            .unwrap_or_default();
        Ok(members.into_iter().take(limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_follow_and_unfollow_tracked() {
        let surface = StaticSurface::new();

        surface.follow("alice").await.unwrap();
        assert!(surface.is_following("alice").await.unwrap());

        surface.unfollow("alice").await.unwrap();
        assert!(!surface.is_following("alice").await.unwrap());

        assert_eq!(
            surface.calls(),
            vec![
                SurfaceCall::Follow("alice".into()),
                SurfaceCall::Unfollow("alice".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_scripted_errors_consumed_in_order() {
        let surface = StaticSurface::new();
        surface.script_error("bob", SurfaceError::RateLimited);
        surface.script_error("bob", SurfaceError::Other("gone".into()));

        assert!(matches!(
            surface.follow("bob").await,
            Err(SurfaceError::RateLimited)
        ));
        assert!(matches!(
            surface.follow("bob").await,
            Err(SurfaceError::Other(_))
        ));
        // Queue drained, next call succeeds
        surface.follow("bob").await.unwrap();
        assert_eq!(surface.calls(), vec![SurfaceCall::Follow("bob".into())]);
    }

    #[tokio::test]
    async fn test_list_members_respects_limit() {
        let surface = StaticSurface::new();
        surface.set_members(
            "target",
            MemberKind::Followers,
            vec!["a".into(), "b".into(), "c".into()],
        );

        let members = surface
            .list_members("target", MemberKind::Followers, 2)
            .await
            .unwrap();
        assert_eq!(members, vec!["a".to_string(), "b".to_string()]);

        let empty = surface
            .list_members("unknown", MemberKind::Followers, 10)
            .await
            .unwrap();
        assert!(empty.is_empty());
    }
}
