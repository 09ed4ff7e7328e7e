use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::{ApiError, AuthBackend};
use crate::models::UserProfile;

use super::storage::{SessionStorage, TOKEN_KEY, USER_KEY};

/// Default delay before the first hydration retry
const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

/// The current authenticated identity as seen by the rest of the app.
///
/// `user` is present iff the caller is signed in. A missing `token` implies
/// a missing `user`; the reverse does not hold while hydrating.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub user: Option<UserProfile>,
    pub token: Option<String>,
    pub is_loading: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Startup, nothing decided yet
    Unhydrated,
    /// Stored token found, profile fetch in flight
    Hydrating,
    Unauthenticated,
    Authenticated,
}

impl Session {
    fn unhydrated() -> Self {
        Self {
            user: None,
            token: None,
            is_loading: true,
        }
    }

    fn hydrating(token: String) -> Self {
        Self {
            user: None,
            token: Some(token),
            is_loading: true,
        }
    }

    fn unauthenticated() -> Self {
        Self {
            user: None,
            token: None,
            is_loading: false,
        }
    }

    fn authenticated(user: UserProfile, token: String) -> Self {
        Self {
            user: Some(user),
            token: Some(token),
            is_loading: false,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    pub fn phase(&self) -> SessionPhase {
        if self.user.is_some() {
            SessionPhase::Authenticated
        } else if !self.is_loading {
            SessionPhase::Unauthenticated
        } else if self.token.is_some() {
            SessionPhase::Hydrating
        } else {
            SessionPhase::Unhydrated
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::unhydrated()
    }
}

/// How hard hydration tries before giving up on a stored token.
///
/// With `transient_retries = 0` any failure signs the user out. Otherwise
/// transport failures (network, 5xx, 429) are retried with exponential
/// backoff; a rejected token always signs out straight away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HydrationPolicy {
    pub transient_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for HydrationPolicy {
    fn default() -> Self {
        Self {
            transient_retries: 0,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
        }
    }
}

/// Owns the session lifecycle: durable entries, hydration, login and logout.
///
/// Every transition goes through the watch channel's write lock, which also
/// guards the epoch. Login and logout bump the epoch; a hydration response
/// is only committed if the epoch it started under is still current.
pub struct SessionManager {
    storage: Arc<dyn SessionStorage>,
    backend: Arc<dyn AuthBackend>,
    policy: HydrationPolicy,
    state: watch::Sender<Session>,
    epoch: AtomicU64,
    initialized: AtomicBool,
}

impl SessionManager {
    pub fn new(storage: Arc<dyn SessionStorage>, backend: Arc<dyn AuthBackend>) -> Self {
        let (state, _) = watch::channel(Session::default());
        Self {
            storage,
            backend,
            policy: HydrationPolicy::default(),
            state,
            epoch: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn with_policy(mut self, policy: HydrationPolicy) -> Self {
        self.policy = policy;
        self
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Turn a stored token into a signed-in session.
    ///
    /// Runs once per manager; later calls return immediately, as does a call
    /// after `login`/`logout`. Never fails: any problem ends in
    /// `Unauthenticated` with storage cleared.
    pub async fn initialize(&self) {
        if self.initialized.swap(true, Ordering::SeqCst) {
            debug!("Session already initialized");
            return;
        }

        // A login or logout already decided the session.
        let epoch = self.epoch.load(Ordering::SeqCst);
        if epoch != 0 {
            debug!("Session decided before initialize, skipping hydration");
            return;
        }

        let token = match self.storage.get(TOKEN_KEY) {
            Ok(Some(token)) if !token.trim().is_empty() => token,
            Ok(_) => {
                debug!("No stored token");
                self.commit_if_current(epoch, |s| {
                    self.clear_storage();
                    *s = Session::unauthenticated();
                });
                return;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read stored token");
                self.commit_if_current(epoch, |s| {
                    self.clear_storage();
                    *s = Session::unauthenticated();
                });
                return;
            }
        };

        let started = self.commit_if_current(epoch, |s| *s = Session::hydrating(token.clone()));
        if !started {
            debug!("Session changed before hydration started");
            return;
        }
        info!("Hydrating session from stored token");

        match self.fetch_profile(&token, epoch).await {
            Ok(user) => {
                let committed = self.commit_if_current(epoch, |s| {
                    self.persist_user(&user);
                    *s = Session::authenticated(user, token);
                });
                if committed {
                    info!("Session restored");
                } else {
                    debug!("Discarding stale hydration response");
                }
            }
            Err(e) => {
                let committed = self.commit_if_current(epoch, |s| {
                    self.clear_storage();
                    *s = Session::unauthenticated();
                });
                if committed {
                    warn!(error = %e, kind = ?e.kind(), "Session hydration failed, signing out");
                } else {
                    debug!(error = %e, "Discarding stale hydration failure");
                }
            }
        }
    }

    /// Commit a completed sign-in. No network call.
    pub fn login(&self, user: UserProfile, token: String) {
        self.state.send_modify(|s| {
            self.epoch.fetch_add(1, Ordering::SeqCst);
            self.persist_token(&token);
            self.persist_user(&user);
            *s = Session::authenticated(user, token);
        });
        info!("Signed in");
    }

    /// Drop the session everywhere. Safe to call when already signed out.
    pub fn logout(&self) {
        let changed = self.state.send_if_modified(|s| {
            self.epoch.fetch_add(1, Ordering::SeqCst);
            self.clear_storage();
            let next = Session::unauthenticated();
            let changed = *s != next;
            *s = next;
            changed
        });
        if changed {
            info!("Signed out");
        }
    }

    /// Replace the profile after an edit elsewhere in the app. Token untouched.
    pub fn update_current_user(&self, user: UserProfile) {
        let updated = self.state.send_if_modified(|s| {
            if !s.is_authenticated() {
                return false;
            }
            self.persist_user(&user);
            s.user = Some(user);
            true
        });
        if !updated {
            warn!("Ignoring profile update without a signed-in user");
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn session(&self) -> Session {
        self.state.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated()
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.borrow().phase()
    }

    pub fn token(&self) -> Option<String> {
        self.state.borrow().token.clone()
    }

    pub fn current_user(&self) -> Option<UserProfile> {
        self.state.borrow().user.clone()
    }

    /// Two-factor flag of the signed-in user, if any
    pub fn two_factor_enabled(&self) -> Option<bool> {
        self.state
            .borrow()
            .user
            .as_ref()
            .map(UserProfile::has_two_factor)
    }

    /// Receiver that is notified on every session change
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.state.subscribe()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Apply `f` only if no login/logout happened since `epoch` was read.
    fn commit_if_current<F>(&self, epoch: u64, f: F) -> bool
    where
        F: FnOnce(&mut Session),
    {
        self.state.send_if_modified(|s| {
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return false;
            }
            f(s);
            true
        })
    }

    async fn fetch_profile(&self, token: &str, epoch: u64) -> Result<UserProfile, ApiError> {
        let mut attempt = 0;
        let mut backoff = Duration::from_millis(self.policy.retry_backoff_ms);

        loop {
            match self.backend.fetch_current_user(token).await {
                Ok(user) => return Ok(user),
                Err(e)
                    if e.is_transient()
                        && attempt < self.policy.transient_retries
                        && self.epoch.load(Ordering::SeqCst) == epoch =>
                {
                    attempt += 1;
                    warn!(error = %e, attempt, backoff_ms = backoff.as_millis() as u64, "Profile fetch failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    if self.epoch.load(Ordering::SeqCst) != epoch {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn persist_token(&self, token: &str) {
        if let Err(e) = self.storage.set(TOKEN_KEY, token) {
            warn!(error = %e, "Failed to save token");
        }
    }

    fn persist_user(&self, user: &UserProfile) {
        let serialized = match serde_json::to_string(user) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Failed to serialize user profile");
                return;
            }
        };
        if let Err(e) = self.storage.set(USER_KEY, &serialized) {
            warn!(error = %e, "Failed to save user profile");
        }
    }

    fn clear_storage(&self) {
        for key in [TOKEN_KEY, USER_KEY] {
            if let Err(e) = self.storage.remove(key) {
                warn!(error = %e, key, "Failed to remove session entry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::storage::MemoryStorage;
    use crate::test_utils::{profile, stored_user, Canned, FakeBackend};
    use tokio::sync::Notify;

    fn manager(storage: &Arc<MemoryStorage>, backend: &Arc<FakeBackend>) -> SessionManager {
        SessionManager::new(storage.clone(), backend.clone())
    }

    // -------------------------------------------------------------------------
    // Session phase
    // -------------------------------------------------------------------------

    #[test]
    fn test_phase_derivation() {
        assert_eq!(Session::default().phase(), SessionPhase::Unhydrated);
        assert_eq!(
            Session::hydrating("t".to_string()).phase(),
            SessionPhase::Hydrating
        );
        assert_eq!(
            Session::unauthenticated().phase(),
            SessionPhase::Unauthenticated
        );
        assert_eq!(
            Session::authenticated(profile(1), "t".to_string()).phase(),
            SessionPhase::Authenticated
        );
    }

    // -------------------------------------------------------------------------
    // login / logout / update
    // -------------------------------------------------------------------------

    #[test]
    fn test_login_persists_token_and_user() {
        let storage = Arc::new(MemoryStorage::new());
        let backend = Arc::new(FakeBackend::new());
        let sessions = manager(&storage, &backend);

        sessions.login(profile(1), "tok123".to_string());

        assert!(sessions.is_authenticated());
        assert_eq!(sessions.token().as_deref(), Some("tok123"));
        assert_eq!(storage.get(TOKEN_KEY).unwrap().as_deref(), Some("tok123"));
        assert_eq!(stored_user(&*storage), Some(profile(1)));
        assert_eq!(storage.len(), 2);
        assert_eq!(backend.total_calls(), 0);
    }

    #[test]
    fn test_logout_clears_everything_and_is_idempotent() {
        let storage = Arc::new(MemoryStorage::new());
        let backend = Arc::new(FakeBackend::new());
        let sessions = manager(&storage, &backend);

        sessions.login(profile(1), "tok123".to_string());
        sessions.logout();

        assert!(!sessions.is_authenticated());
        assert_eq!(sessions.phase(), SessionPhase::Unauthenticated);
        assert!(storage.is_empty());

        sessions.logout();
        assert_eq!(sessions.session(), Session::unauthenticated());
        assert!(storage.is_empty());
    }

    #[test]
    fn test_logout_from_fresh_manager() {
        let storage = Arc::new(MemoryStorage::new());
        let backend = Arc::new(FakeBackend::new());
        let sessions = manager(&storage, &backend);

        sessions.logout();
        assert_eq!(sessions.phase(), SessionPhase::Unauthenticated);
        assert!(storage.is_empty());
    }

    #[test]
    fn test_update_current_user_keeps_token() {
        let storage = Arc::new(MemoryStorage::new());
        let backend = Arc::new(FakeBackend::new());
        let sessions = manager(&storage, &backend);
        sessions.login(profile(1), "tok123".to_string());

        let mut edited = profile(1);
        edited.name = Some("Renamed".to_string());
        sessions.update_current_user(edited.clone());

        assert_eq!(sessions.current_user(), Some(edited.clone()));
        assert_eq!(sessions.phase(), SessionPhase::Authenticated);
        assert_eq!(stored_user(&*storage), Some(edited));
        assert_eq!(storage.get(TOKEN_KEY).unwrap().as_deref(), Some("tok123"));
    }

    #[test]
    fn test_update_current_user_ignored_when_signed_out() {
        let storage = Arc::new(MemoryStorage::new());
        let backend = Arc::new(FakeBackend::new());
        let sessions = manager(&storage, &backend);
        sessions.logout();

        sessions.update_current_user(profile(2));

        assert!(!sessions.is_authenticated());
        assert!(storage.is_empty());
    }

    #[test]
    fn test_two_factor_flag_read_from_profile() {
        let storage = Arc::new(MemoryStorage::new());
        let backend = Arc::new(FakeBackend::new());
        let sessions = manager(&storage, &backend);
        assert_eq!(sessions.two_factor_enabled(), None);

        let mut user = profile(1);
        user.two_factor_enabled = Some(true);
        sessions.login(user, "tok".to_string());
        assert_eq!(sessions.two_factor_enabled(), Some(true));
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let storage = Arc::new(MemoryStorage::new());
        let backend = Arc::new(FakeBackend::new());
        let sessions = manager(&storage, &backend);
        let mut rx = sessions.subscribe();

        sessions.login(profile(1), "tok".to_string());
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_authenticated());

        sessions.logout();
        rx.changed().await.unwrap();
        assert!(!rx.borrow_and_update().is_authenticated());

        // Second logout changes nothing and does not notify
        sessions.logout();
        assert!(!rx.has_changed().unwrap());
    }

    // -------------------------------------------------------------------------
    // initialize
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_initialize_without_token_skips_network() {
        let storage = Arc::new(MemoryStorage::new());
        let backend = Arc::new(FakeBackend::new());
        let sessions = manager(&storage, &backend);
        assert_eq!(sessions.phase(), SessionPhase::Unhydrated);

        sessions.initialize().await;

        assert_eq!(sessions.phase(), SessionPhase::Unauthenticated);
        assert_eq!(backend.me_calls(), 0);
    }

    #[tokio::test]
    async fn test_initialize_clears_orphan_user_entry() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(USER_KEY, r#"{"id":1}"#).unwrap();
        let backend = Arc::new(FakeBackend::new());
        let sessions = manager(&storage, &backend);

        sessions.initialize().await;

        assert_eq!(sessions.phase(), SessionPhase::Unauthenticated);
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_initialize_with_rejected_token() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(TOKEN_KEY, "expired").unwrap();
        storage.set(USER_KEY, r#"{"id":1}"#).unwrap();
        let backend = Arc::new(FakeBackend::new().with_me(Canned::Unauthorized));
        let sessions = manager(&storage, &backend);

        sessions.initialize().await;

        assert_eq!(sessions.phase(), SessionPhase::Unauthenticated);
        assert!(storage.is_empty());
        assert_eq!(backend.me_calls(), 1);
        assert_eq!(backend.last_me_token().as_deref(), Some("expired"));
    }

    #[tokio::test]
    async fn test_initialize_with_accepted_token_refreshes_user() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(TOKEN_KEY, "tok123").unwrap();
        storage.set(USER_KEY, r#"{"id":1,"name":"Old name"}"#).unwrap();

        let mut fresh = profile(1);
        fresh.name = Some("New name".to_string());
        let backend = Arc::new(FakeBackend::new().with_me(Canned::Ok(fresh.clone())));
        let sessions = manager(&storage, &backend);

        sessions.initialize().await;

        assert_eq!(sessions.phase(), SessionPhase::Authenticated);
        assert_eq!(sessions.current_user(), Some(fresh.clone()));
        assert_eq!(sessions.token().as_deref(), Some("tok123"));
        assert_eq!(stored_user(&*storage), Some(fresh));
    }

    #[tokio::test]
    async fn test_initialize_runs_once() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(TOKEN_KEY, "tok123").unwrap();
        let backend = Arc::new(FakeBackend::new().with_me(Canned::Ok(profile(1))));
        let sessions = manager(&storage, &backend);

        sessions.initialize().await;
        sessions.logout();
        storage.set(TOKEN_KEY, "tok456").unwrap();
        sessions.initialize().await;

        assert_eq!(backend.me_calls(), 1);
        assert_eq!(sessions.phase(), SessionPhase::Unauthenticated);
    }

    #[tokio::test]
    async fn test_initialize_after_login_keeps_session() {
        let storage = Arc::new(MemoryStorage::new());
        let backend = Arc::new(FakeBackend::new().with_me(Canned::Unauthorized));
        let sessions = manager(&storage, &backend);

        sessions.login(profile(1), "fresh".to_string());
        sessions.initialize().await;

        assert_eq!(sessions.phase(), SessionPhase::Authenticated);
        assert_eq!(backend.me_calls(), 0);
        assert_eq!(storage.get(TOKEN_KEY).unwrap().as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_initialize_after_logout_stays_signed_out() {
        let storage = Arc::new(MemoryStorage::new());
        let backend = Arc::new(FakeBackend::new().with_me(Canned::Ok(profile(1))));
        let sessions = manager(&storage, &backend);

        sessions.logout();
        // Written by another process after the logout
        storage.set(TOKEN_KEY, "tok123").unwrap();
        sessions.initialize().await;

        assert_eq!(sessions.phase(), SessionPhase::Unauthenticated);
        assert_eq!(backend.me_calls(), 0);
    }

    #[tokio::test]
    async fn test_network_failure_signs_out_by_default() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(TOKEN_KEY, "tok123").unwrap();
        let backend = Arc::new(
            FakeBackend::new()
                .with_me(Canned::ServerDown)
                .with_me(Canned::Ok(profile(1))),
        );
        let sessions = manager(&storage, &backend);

        sessions.initialize().await;

        assert_eq!(sessions.phase(), SessionPhase::Unauthenticated);
        assert_eq!(backend.me_calls(), 1);
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_retried_with_policy() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(TOKEN_KEY, "tok123").unwrap();
        let backend = Arc::new(
            FakeBackend::new()
                .with_me(Canned::ServerDown)
                .with_me(Canned::Ok(profile(1))),
        );
        let sessions = manager(&storage, &backend).with_policy(HydrationPolicy {
            transient_retries: 2,
            retry_backoff_ms: 1,
        });

        sessions.initialize().await;

        assert_eq!(sessions.phase(), SessionPhase::Authenticated);
        assert_eq!(backend.me_calls(), 2);
    }

    #[tokio::test]
    async fn test_rejected_token_not_retried() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(TOKEN_KEY, "tok123").unwrap();
        let backend = Arc::new(
            FakeBackend::new()
                .with_me(Canned::Unauthorized)
                .with_me(Canned::Ok(profile(1))),
        );
        let sessions = manager(&storage, &backend).with_policy(HydrationPolicy {
            transient_retries: 3,
            retry_backoff_ms: 1,
        });

        sessions.initialize().await;

        assert_eq!(sessions.phase(), SessionPhase::Unauthenticated);
        assert_eq!(backend.me_calls(), 1);
    }

    #[tokio::test]
    async fn test_logout_during_hydration_is_not_undone() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(TOKEN_KEY, "tok123").unwrap();
        let gate = Arc::new(Notify::new());
        let backend = Arc::new(
            FakeBackend::new()
                .with_me(Canned::Ok(profile(1)))
                .with_gate(gate.clone()),
        );
        let sessions = manager(&storage, &backend);

        let user_action = async {
            // Hydration is parked on the gate by now
            assert_eq!(sessions.phase(), SessionPhase::Hydrating);
            sessions.logout();
            gate.notify_one();
        };
        tokio::join!(sessions.initialize(), user_action);

        assert_eq!(backend.me_calls(), 1);
        assert_eq!(sessions.phase(), SessionPhase::Unauthenticated);
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_logout_during_retry_backoff_stops_retries() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(TOKEN_KEY, "tok123").unwrap();
        let backend = Arc::new(
            FakeBackend::new()
                .with_me(Canned::ServerDown)
                .with_me(Canned::ServerDown)
                .with_me(Canned::Ok(profile(1))),
        );
        let sessions = manager(&storage, &backend).with_policy(HydrationPolicy {
            transient_retries: 3,
            retry_backoff_ms: 50,
        });

        let user_action = async {
            // First fetch failed, hydration is sleeping before the retry
            assert_eq!(backend.me_calls(), 1);
            assert_eq!(sessions.phase(), SessionPhase::Hydrating);
            sessions.logout();
        };
        tokio::join!(sessions.initialize(), user_action);

        assert_eq!(backend.me_calls(), 1);
        assert_eq!(sessions.phase(), SessionPhase::Unauthenticated);
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_login_during_hydration_wins() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(TOKEN_KEY, "old").unwrap();
        let gate = Arc::new(Notify::new());
        let backend = Arc::new(
            FakeBackend::new()
                .with_me(Canned::Unauthorized)
                .with_gate(gate.clone()),
        );
        let sessions = manager(&storage, &backend);

        let user_action = async {
            sessions.login(profile(2), "new".to_string());
            gate.notify_one();
        };
        tokio::join!(sessions.initialize(), user_action);

        // The stale rejection of "old" must not sign out the fresh login
        assert_eq!(sessions.current_user(), Some(profile(2)));
        assert_eq!(storage.get(TOKEN_KEY).unwrap().as_deref(), Some("new"));
    }
}
