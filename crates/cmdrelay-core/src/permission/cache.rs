//! Per-session permission cache.
//!
//! The cache mirrors the permission set of one authenticated browser
//! session. It is populated by a single identity fetch and cleared on
//! sign-out, and it is the only source the [`gate`](super::gate) consults.
//!
//! # State Machine
//!
//! ```text
//! Uninitialized --refresh--> Loading --ok / 401--> Ready(set)
//!                               |
//!                               +--other failure--> Errored(message)
//!
//! Ready | Errored --refresh--> Loading
//! any state      --clear----> Ready(empty)
//! ```
//!
//! # Single-Flight
//!
//! Refreshes are serialized by an async mutex and counted by a generation
//! number. A caller that had to wait for the mutex while another refresh
//! completed returns that refresh's result instead of fetching again.
//!
//! # Sign-Out Races
//!
//! Every [`PermissionCache::clear`] bumps an epoch. A refresh records the
//! epoch when it enters `Loading` and discards its result if the epoch has
//! moved by the time the fetch returns, so a late response can never
//! repopulate a signed-out cache.
//!
//! # Cancellation
//!
//! A refresh whose future is dropped mid-fetch restores the state it
//! replaced with `Loading`. The cache is never left `Loading` without a
//! fetch in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, warn};

use super::gate::{self, GateDecision, Requirement};
use super::identity::{IdentityClient, IdentityError};
use super::set::PermissionSet;

/// Materialized state of a [`PermissionCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionState {
    /// No fetch has been attempted yet.
    Uninitialized,
    /// A fetch is in flight.
    Loading,
    /// The last fetch concluded; the set may be empty.
    Ready(PermissionSet),
    /// The last fetch failed; nothing is granted.
    Errored {
        /// Description of the failure.
        message: String,
    },
}

impl PermissionState {
    /// The granted set, if the state is [`PermissionState::Ready`].
    #[must_use]
    pub const fn permissions(&self) -> Option<&PermissionSet> {
        match self {
            Self::Ready(set) => Some(set),
            _ => None,
        }
    }

    /// Returns `true` while the outcome of a fetch is not yet known.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Uninitialized | Self::Loading)
    }

    /// Short label for logs and CLI output.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Loading => "loading",
            Self::Ready(_) => "ready",
            Self::Errored { .. } => "errored",
        }
    }
}

struct Inner {
    state: PermissionState,
    epoch: u64,
}

/// One refresh between entering `Loading` and writing its result.
///
/// Dropping an unfinished flight puts back the state it displaced, unless a
/// `clear()` has moved the epoch in the meantime.
struct Flight<'a> {
    inner: &'a RwLock<Inner>,
    epoch: u64,
    displaced: Option<PermissionState>,
}

impl<'a> Flight<'a> {
    fn begin(lock: &'a RwLock<Inner>) -> Self {
        let mut inner = lock.write().unwrap_or_else(PoisonError::into_inner);
        let displaced = std::mem::replace(&mut inner.state, PermissionState::Loading);
        Self {
            inner: lock,
            epoch: inner.epoch,
            displaced: Some(displaced),
        }
    }

    /// Writes `next` unless the epoch moved, and returns the current state.
    fn finish(mut self, next: PermissionState) -> PermissionState {
        self.displaced = None;
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.epoch == self.epoch {
            inner.state = next;
        } else {
            debug!("discarding permission refresh that raced with sign-out");
        }
        inner.state.clone()
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        let Some(displaced) = self.displaced.take() else {
            return;
        };
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.epoch == self.epoch && inner.state == PermissionState::Loading {
            debug!(restored = displaced.label(), "permission refresh cancelled");
            inner.state = displaced;
        }
    }
}

/// Single-flight cache of the current session's permissions.
pub struct PermissionCache {
    client: Arc<dyn IdentityClient>,
    inner: RwLock<Inner>,
    refresh_lock: tokio::sync::Mutex<()>,
    generation: AtomicU64,
}

impl PermissionCache {
    /// Creates an uninitialized cache backed by `client`.
    #[must_use]
    pub fn new(client: Arc<dyn IdentityClient>) -> Self {
        Self {
            client,
            inner: RwLock::new(Inner {
                state: PermissionState::Uninitialized,
                epoch: 0,
            }),
            refresh_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Fetches the permission set and returns the resulting state.
    ///
    /// A 401 from the identity endpoint yields `Ready` with an empty set.
    /// Any other failure yields `Errored`. Concurrent callers share one
    /// fetch.
    pub async fn refresh(&self) -> PermissionState {
        let observed = self.generation.load(Ordering::Acquire);
        let _serialized = self.refresh_lock.lock().await;
        if self.generation.load(Ordering::Acquire) != observed {
            debug!("permission refresh joined a completed flight");
            return self.state();
        }

        let flight = Flight::begin(&self.inner);

        let next = match self.client.fetch_identity().await {
            Ok(identity) => {
                let set: PermissionSet = identity.permissions.into_iter().collect();
                debug!(count = set.len(), "permissions loaded");
                PermissionState::Ready(set)
            },
            Err(IdentityError::Unauthenticated) => {
                debug!("identity endpoint reports no session; no permissions granted");
                PermissionState::Ready(PermissionSet::new())
            },
            Err(error) => {
                warn!(error = %error, "permission refresh failed");
                PermissionState::Errored {
                    message: error.to_string(),
                }
            },
        };

        let state = flight.finish(next);
        self.generation.fetch_add(1, Ordering::AcqRel);
        state
    }

    /// Performs the initial fetch if none has happened yet.
    ///
    /// Intended to run once when the owning scope mounts; later reloads
    /// (e.g. after sign-in) go through [`PermissionCache::refresh`].
    pub async fn ensure_loaded(&self) -> PermissionState {
        match self.state() {
            PermissionState::Uninitialized => self.refresh().await,
            state => state,
        }
    }

    /// Resets the cache to an empty, ready set without fetching.
    ///
    /// Called on sign-out. Any refresh still in flight is made stale.
    pub fn clear(&self) {
        let mut inner = self.write();
        inner.epoch = inner.epoch.wrapping_add(1);
        inner.state = PermissionState::Ready(PermissionSet::new());
    }

    /// Returns a copy of the current state.
    #[must_use]
    pub fn state(&self) -> PermissionState {
        self.read(|state| state.clone())
    }

    /// Returns `true` iff `name` is granted. `false` in every non-ready
    /// state.
    #[must_use]
    pub fn has_permission(&self, name: &str) -> bool {
        self.read(|state| state.permissions().is_some_and(|set| set.contains(name)))
    }

    /// Returns `true` iff at least one of `names` is granted.
    #[must_use]
    pub fn has_any_permission<S: AsRef<str>>(&self, names: &[S]) -> bool {
        self.read(|state| {
            state
                .permissions()
                .is_some_and(|set| set.contains_any(names.iter().map(AsRef::as_ref)))
        })
    }

    /// Returns `true` iff every one of `names` is granted.
    ///
    /// An empty list returns `false`.
    #[must_use]
    pub fn has_all_permissions<S: AsRef<str>>(&self, names: &[S]) -> bool {
        self.read(|state| {
            state
                .permissions()
                .is_some_and(|set| set.contains_all(names.iter().map(AsRef::as_ref)))
        })
    }

    /// Evaluates `requirement` against the current state.
    #[must_use]
    pub fn check(&self, requirement: &Requirement) -> GateDecision {
        self.read(|state| gate::evaluate(requirement, state))
    }

    fn read<T>(&self, f: impl FnOnce(&PermissionState) -> T) -> T {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&inner.state)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::permission::identity::Identity;

    /// Identity client that can hold a fetch open until released.
    struct FakeIdentity {
        outcome: std::sync::Mutex<Result<Identity, IdentityError>>,
        calls: AtomicUsize,
        hold: bool,
        started: Notify,
        release: Notify,
    }

    impl FakeIdentity {
        fn new(outcome: Result<Identity, IdentityError>) -> Arc<Self> {
            Arc::new(Self {
                outcome: std::sync::Mutex::new(outcome),
                calls: AtomicUsize::new(0),
                hold: false,
                started: Notify::new(),
                release: Notify::new(),
            })
        }

        fn held(outcome: Result<Identity, IdentityError>) -> Arc<Self> {
            Arc::new(Self {
                outcome: std::sync::Mutex::new(outcome),
                calls: AtomicUsize::new(0),
                hold: true,
                started: Notify::new(),
                release: Notify::new(),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl IdentityClient for FakeIdentity {
        async fn fetch_identity(&self) -> Result<Identity, IdentityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hold {
                self.started.notify_one();
                self.release.notified().await;
            }
            self.outcome.lock().unwrap().clone()
        }
    }

    fn identity(perms: &[&str]) -> Identity {
        Identity {
            permissions: perms.iter().map(ToString::to_string).collect(),
            profile: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn membership_queries_after_refresh() {
        let fake = FakeIdentity::new(Ok(identity(&["stock:create"])));
        let cache = PermissionCache::new(fake.clone());

        let state = cache.refresh().await;
        assert!(matches!(state, PermissionState::Ready(_)));
        assert!(cache.has_permission("stock:create"));
        assert!(!cache.has_permission("stock:delete"));
        assert!(cache.has_any_permission(&["stock:delete", "stock:create"]));
        assert!(!cache.has_all_permissions(&["stock:delete", "stock:create"]));
        assert!(cache.has_all_permissions(&["stock:create"]));
        assert_eq!(fake.calls(), 1);
    }

    #[tokio::test]
    async fn queries_are_false_before_and_during_loading() {
        let fake = FakeIdentity::held(Ok(identity(&["stock:create"])));
        let cache = Arc::new(PermissionCache::new(fake.clone()));
        assert_eq!(cache.state(), PermissionState::Uninitialized);
        assert!(!cache.has_permission("stock:create"));

        let refreshing = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.refresh().await })
        };
        fake.started.notified().await;

        assert_eq!(cache.state(), PermissionState::Loading);
        assert!(!cache.has_permission("stock:create"));
        assert!(!cache.has_any_permission(&["stock:create"]));
        assert!(!cache.has_all_permissions(&["stock:create"]));
        assert!(
            cache
                .check(&Requirement::single("stock:create"))
                .is_indeterminate()
        );

        fake.release.notify_one();
        refreshing.await.unwrap();
        assert!(cache.has_permission("stock:create"));
    }

    #[tokio::test]
    async fn unauthorized_yields_ready_empty() {
        let fake = FakeIdentity::new(Err(IdentityError::Unauthenticated));
        let cache = PermissionCache::new(fake);
        let state = cache.refresh().await;
        assert_eq!(state, PermissionState::Ready(PermissionSet::new()));
        assert!(!cache.has_permission("stock:create"));
    }

    #[tokio::test]
    async fn other_failures_yield_errored() {
        for error in [
            IdentityError::Status { status: 500 },
            IdentityError::Transport("connection refused".into()),
            IdentityError::Decode("missing field".into()),
        ] {
            let cache = PermissionCache::new(FakeIdentity::new(Err(error.clone())));
            let state = cache.refresh().await;
            assert_eq!(
                state,
                PermissionState::Errored {
                    message: error.to_string()
                }
            );
            assert!(!cache.has_permission("stock:create"));
            assert!(!cache.has_any_permission(&["stock:create"]));
        }
    }

    #[tokio::test]
    async fn errored_cache_recovers_on_refresh() {
        let fake = FakeIdentity::new(Err(IdentityError::Status { status: 503 }));
        let cache = PermissionCache::new(fake.clone());
        assert_eq!(cache.refresh().await.label(), "errored");

        *fake.outcome.lock().unwrap() = Ok(identity(&["orders:read"]));
        assert_eq!(cache.refresh().await.label(), "ready");
        assert!(cache.has_permission("orders:read"));
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_fetch() {
        let fake = FakeIdentity::held(Ok(identity(&["stock:create"])));
        let cache = Arc::new(PermissionCache::new(fake.clone()));

        let first = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.refresh().await })
        };
        fake.started.notified().await;

        let followers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.refresh().await })
            })
            .collect();
        tokio::task::yield_now().await;

        fake.release.notify_one();
        let leader = first.await.unwrap();
        for follower in followers {
            assert_eq!(follower.await.unwrap(), leader);
        }
        assert_eq!(fake.calls(), 1);
    }

    #[tokio::test]
    async fn clear_during_flight_discards_late_result() {
        let fake = FakeIdentity::held(Ok(identity(&["stock:create"])));
        let cache = Arc::new(PermissionCache::new(fake.clone()));

        let refreshing = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.refresh().await })
        };
        fake.started.notified().await;

        cache.clear();
        fake.release.notify_one();
        let state = refreshing.await.unwrap();

        assert_eq!(state, PermissionState::Ready(PermissionSet::new()));
        assert!(!cache.has_permission("stock:create"));
    }

    #[tokio::test]
    async fn cancelled_initial_load_can_be_retried() {
        let fake = FakeIdentity::held(Ok(identity(&["stock:create"])));
        let cache = Arc::new(PermissionCache::new(fake.clone()));

        let loading = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.ensure_loaded().await })
        };
        fake.started.notified().await;
        assert_eq!(cache.state(), PermissionState::Loading);

        loading.abort();
        assert!(loading.await.unwrap_err().is_cancelled());
        assert_eq!(cache.state(), PermissionState::Uninitialized);

        // Permit for the retried fetch.
        fake.release.notify_one();
        let state = cache.ensure_loaded().await;
        assert!(matches!(state, PermissionState::Ready(_)));
        assert!(cache.has_permission("stock:create"));
        assert_eq!(fake.calls(), 2);
    }

    #[tokio::test]
    async fn cancelled_reload_keeps_previous_set() {
        let fake = FakeIdentity::held(Ok(identity(&["orders:read"])));
        let cache = Arc::new(PermissionCache::new(fake.clone()));
        fake.release.notify_one();
        cache.refresh().await;
        fake.started.notified().await;
        assert!(cache.has_permission("orders:read"));

        let reloading = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.refresh().await })
        };
        fake.started.notified().await;
        reloading.abort();
        assert!(reloading.await.unwrap_err().is_cancelled());

        assert!(cache.has_permission("orders:read"));
        assert_eq!(cache.state().label(), "ready");
    }

    #[tokio::test]
    async fn cancelled_flight_after_clear_stays_cleared() {
        let fake = FakeIdentity::held(Ok(identity(&["stock:create"])));
        let cache = Arc::new(PermissionCache::new(fake.clone()));

        let refreshing = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.refresh().await })
        };
        fake.started.notified().await;
        cache.clear();
        refreshing.abort();
        assert!(refreshing.await.unwrap_err().is_cancelled());

        assert_eq!(cache.state(), PermissionState::Ready(PermissionSet::new()));
    }

    #[tokio::test]
    async fn ensure_loaded_fetches_once() {
        let fake = FakeIdentity::new(Ok(identity(&["stock:create"])));
        let cache = PermissionCache::new(fake.clone());
        cache.ensure_loaded().await;
        cache.ensure_loaded().await;
        assert_eq!(fake.calls(), 1);

        cache.refresh().await;
        assert_eq!(fake.calls(), 2);
    }

    #[tokio::test]
    async fn clear_resets_without_fetching() {
        let fake = FakeIdentity::new(Ok(identity(&["stock:create"])));
        let cache = PermissionCache::new(fake.clone());
        cache.refresh().await;
        cache.clear();
        assert_eq!(cache.state(), PermissionState::Ready(PermissionSet::new()));
        assert!(!cache.has_permission("stock:create"));
        assert_eq!(fake.calls(), 1);
    }

    #[tokio::test]
    async fn empty_all_query_is_false() {
        let cache = PermissionCache::new(FakeIdentity::new(Ok(identity(&["stock:create"]))));
        cache.refresh().await;
        assert!(!cache.has_all_permissions::<&str>(&[]));
        assert!(!cache.has_any_permission::<&str>(&[]));
    }
}
