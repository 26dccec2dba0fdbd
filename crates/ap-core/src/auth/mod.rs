//! Auth session coordinator.
//!
//! Owns the single current [`Session`], coalesces concurrent token refreshes
//! into one HTTP call, and implements the soft/hard failure split:
//!
//! - **soft**: a failed refresh leaves the session untouched and returns `None`
//! - **hard**: a failed refresh clears the session and the persisted device
//!   token, then notifies subscribers with [`AuthSessionEvent::SessionCleared`]
//!
//! A hard caller that joins a soft refresh which then fails starts one fresh
//! hard refresh of its own instead of accepting the soft result.

mod session;
pub mod store;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use rand::Rng;
use serde_json::json;
use tokio::sync::broadcast;

pub use session::{FALLBACK_VALIDITY_MS, Session, resolve_expiry};
pub use store::{DeviceTokenStore, FileDeviceTokenStore, MemoryDeviceTokenStore, StoredDeviceToken};

use crate::http::{self, ApiError, ApiRequest, ApiResult};
use crate::time::now_millis;

pub const LOGIN_PATH: &str = "/api/auth/login";
pub const REFRESH_PATH: &str = "/api/auth/refresh";
pub const LOGOUT_PATH: &str = "/api/auth/logout";

/// Cached tokens with less validity than this are refreshed by
/// [`AuthCoordinator::get_access_token`].
pub const ACCESS_TOKEN_SKEW_MS: i64 = 30_000;

const EVENT_CAPACITY: usize = 16;

/// How a failed refresh affects the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    /// Keep the session; the caller degrades on its own.
    #[default]
    Soft,
    /// Clear the session and the persisted device token.
    Hard,
}

/// Options for [`AuthCoordinator::ensure_fresh_access_token`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FreshTokenOptions {
    pub min_validity_ms: u64,
    pub jitter_ms: u64,
    pub force_refresh: bool,
    pub failure_mode: FailureMode,
}

/// Fan-out notification of session changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthSessionEvent {
    SessionUpdated(Session),
    SessionCleared,
}

type RefreshFuture = Shared<BoxFuture<'static, Option<Session>>>;

struct Flight {
    id: u64,
    mode: FailureMode,
    future: RefreshFuture,
}

#[derive(Default)]
struct State {
    base_url: Option<String>,
    session: Option<Session>,
    flight: Option<Flight>,
    /// Bumped by login, logout and base URL switches. A refresh started
    /// under an older generation must not write its result.
    generation: u64,
    next_flight_id: u64,
}

struct Inner {
    http: reqwest::Client,
    store: Arc<dyn DeviceTokenStore>,
    state: Mutex<State>,
    events: broadcast::Sender<AuthSessionEvent>,
}

/// Injectable owner of the current session. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct AuthCoordinator {
    inner: Arc<Inner>,
}

impl fmt::Debug for AuthCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthCoordinator").finish_non_exhaustive()
    }
}

impl AuthCoordinator {
    pub fn new(store: Arc<dyn DeviceTokenStore>) -> Self {
        Self::with_client(reqwest::Client::new(), store)
    }

    pub fn with_client(http: reqwest::Client, store: Arc<dyn DeviceTokenStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                http,
                store,
                state: Mutex::new(State::default()),
                events,
            }),
        }
    }

    /// The shared HTTP client, for callers that build their own requests.
    pub fn http_client(&self) -> &reqwest::Client {
        &self.inner.http
    }

    /// Subscribes to session notifications. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<AuthSessionEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot of the current session.
    pub fn current_session(&self) -> Option<Session> {
        self.inner.lock().session.clone()
    }

    /// Logs in and replaces the current session.
    ///
    /// # Errors
    /// Returns the server-supplied message, or `HTTP <status>`, on failure.
    pub async fn login(
        &self,
        base_url: &str,
        master_password: &str,
        device_name: &str,
    ) -> ApiResult<Session> {
        let base_url = normalize(base_url);
        {
            let mut state = self.inner.lock();
            let cleared = self.inner.bind_base_url(&mut state, &base_url);
            state.generation += 1;
            state.flight = None;
            drop(state);
            if cleared {
                self.inner.emit(AuthSessionEvent::SessionCleared);
            }
        }

        let request = ApiRequest::post(json!({
            "masterPassword": master_password,
            "deviceName": device_name,
        }));
        let response = request
            .build(&self.inner.http, &http::join_url(&base_url, LOGIN_PATH), None)
            .send()
            .await
            .map_err(|e| ApiError::transport(&e))?;
        let data = http::read_envelope(response).await?;
        let session = Session::from_login(&base_url, &data, now_millis())?;

        {
            let mut state = self.inner.lock();
            self.inner.bind_base_url(&mut state, &base_url);
            state.session = Some(session.clone());
            state.generation += 1;
            state.flight = None;
        }
        self.inner.persist(&session);
        tracing::debug!(user = %session.username, "login succeeded");
        self.inner
            .emit(AuthSessionEvent::SessionUpdated(session.clone()));
        Ok(session)
    }

    /// Logs out: best-effort server call, then clears everything locally.
    pub async fn logout(&self, base_url: &str) {
        let base_url = normalize(base_url);
        let token = {
            let state = self.inner.lock();
            state
                .session
                .as_ref()
                .filter(|s| s.base_url == base_url && !s.access_token.is_empty())
                .map(|s| s.access_token.clone())
        };
        if let Some(token) = token {
            let url = http::join_url(&base_url, LOGOUT_PATH);
            let result = ApiRequest::post(json!({}))
                .build(&self.inner.http, &url, Some(&token))
                .send()
                .await;
            if let Err(e) = result {
                tracing::debug!("logout request failed (ignored): {e}");
            }
        }
        {
            let mut state = self.inner.lock();
            state.session = None;
            state.flight = None;
            state.generation += 1;
        }
        self.inner.clear_store();
        self.inner.emit(AuthSessionEvent::SessionCleared);
    }

    /// Returns a usable access token, refreshing in **hard** mode when the
    /// cached one is missing, near expiry, or `force_refresh` is set.
    pub async fn get_access_token(&self, base_url: &str, force_refresh: bool) -> Option<String> {
        let base_url = normalize(base_url);
        if !force_refresh
            && let Some(token) = self.valid_token(&base_url, ACCESS_TOKEN_SKEW_MS)
        {
            return Some(token);
        }
        self.refresh(&base_url, FailureMode::Hard)
            .await
            .map(|s| s.access_token)
    }

    /// Opportunistic refresh, **soft** by default.
    ///
    /// Skips the refresh while the token's remaining validity exceeds
    /// `min_validity_ms + random(0..=jitter_ms)`.
    pub async fn ensure_fresh_access_token(
        &self,
        base_url: &str,
        opts: FreshTokenOptions,
    ) -> Option<String> {
        let base_url = normalize(base_url);
        if !opts.force_refresh {
            let jitter = if opts.jitter_ms == 0 {
                0
            } else {
                rand::rng().random_range(0..=opts.jitter_ms)
            };
            let threshold = i64::try_from(opts.min_validity_ms.saturating_add(jitter))
                .unwrap_or(i64::MAX);
            if let Some(token) = self.valid_token(&base_url, threshold) {
                return Some(token);
            }
        }
        self.refresh(&base_url, opts.failure_mode)
            .await
            .map(|s| s.access_token)
    }

    /// Restores the session at startup from the persisted device token.
    /// Always hard mode.
    pub async fn restore_session(&self, base_url: &str) -> Option<Session> {
        let base_url = normalize(base_url);
        if self.valid_token(&base_url, ACCESS_TOKEN_SKEW_MS).is_some() {
            return self.current_session();
        }
        self.refresh(&base_url, FailureMode::Hard).await
    }

    /// Sends `request` to `path` with a bearer token.
    ///
    /// On a 401 response, performs exactly one hard refresh and one retry.
    /// If that refresh fails the original 401 response is returned.
    ///
    /// # Errors
    /// Returns [`crate::http::ApiErrorKind::MissingAccessToken`] if no token
    /// can be obtained, or a transport error if the request cannot be sent.
    pub async fn authorized_fetch(
        &self,
        base_url: &str,
        path: &str,
        request: &ApiRequest,
    ) -> ApiResult<reqwest::Response> {
        let base_url = normalize(base_url);
        let Some(token) = self.get_access_token(&base_url, false).await else {
            return Err(ApiError::missing_access_token());
        };
        let url = http::join_url(&base_url, path);

        let response = request
            .build(&self.inner.http, &url, Some(&token))
            .send()
            .await
            .map_err(|e| ApiError::transport(&e))?;
        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        tracing::debug!(path, "401 from backend; refreshing once");
        let Some(fresh) = self.get_access_token(&base_url, true).await else {
            return Ok(response);
        };
        request
            .build(&self.inner.http, &url, Some(&fresh))
            .send()
            .await
            .map_err(|e| ApiError::transport(&e))
    }

    fn valid_token(&self, base_url: &str, min_remaining_ms: i64) -> Option<String> {
        let state = self.inner.lock();
        if state.base_url.as_deref() != Some(base_url) {
            return None;
        }
        let session = state.session.as_ref()?;
        (!session.access_token.is_empty()
            && session.remaining_ms(now_millis()) > min_remaining_ms)
            .then(|| session.access_token.clone())
    }

    async fn refresh(&self, base_url: &str, mode: FailureMode) -> Option<Session> {
        let (future, joined_mode) = self.join_or_start(base_url, mode, false);
        let result = future.await;
        if result.is_some() || mode == FailureMode::Soft || joined_mode == FailureMode::Hard {
            return result;
        }
        tracing::debug!("soft refresh failed under a hard caller; escalating");
        let (future, _) = self.join_or_start(base_url, FailureMode::Hard, true);
        future.await
    }

    /// Joins the in-flight refresh or starts one.
    ///
    /// With `escalate`, a soft flight that is joined is upgraded to hard so
    /// its failure clears the session.
    fn join_or_start(
        &self,
        base_url: &str,
        mode: FailureMode,
        escalate: bool,
    ) -> (RefreshFuture, FailureMode) {
        let mut state = self.inner.lock();
        let cleared = self.inner.bind_base_url(&mut state, base_url);

        let joined = match state.flight.as_mut() {
            Some(flight) if !escalate => Some((flight.future.clone(), flight.mode)),
            Some(flight) => {
                flight.mode = FailureMode::Hard;
                Some((flight.future.clone(), FailureMode::Hard))
            }
            None => None,
        };
        let out = joined.unwrap_or_else(|| {
            state.next_flight_id += 1;
            let id = state.next_flight_id;
            let generation = state.generation;
            let seed = state.session.clone();
            let inner = Arc::clone(&self.inner);
            let base_url = base_url.to_string();
            let future = async move { inner.run_refresh(id, generation, base_url, seed, mode).await }
                .boxed()
                .shared();
            state.flight = Some(Flight {
                id,
                mode,
                future: future.clone(),
            });
            (future, mode)
        });
        drop(state);
        if cleared {
            self.inner.emit(AuthSessionEvent::SessionCleared);
        }
        out
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: AuthSessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Points the coordinator at `base_url`. Returns true if a session was
    /// dropped because the backend changed.
    fn bind_base_url(&self, state: &mut State, base_url: &str) -> bool {
        if state.base_url.as_deref() == Some(base_url) {
            return false;
        }
        tracing::debug!(base_url, "switching backend; clearing session");
        state.base_url = Some(base_url.to_string());
        state.flight = None;
        state.generation += 1;
        state.session.take().is_some()
    }

    fn persist(&self, session: &Session) {
        let token = StoredDeviceToken {
            base_url: session.base_url.clone(),
            device_token: session.device_token.clone(),
        };
        if let Err(e) = self.store.save(&token) {
            tracing::warn!("Failed to persist device token: {e:#}");
        }
    }

    fn clear_store(&self) {
        if let Err(e) = self.store.clear() {
            tracing::warn!("Failed to clear device token: {e:#}");
        }
    }

    fn stored_seed(&self, base_url: &str) -> Option<Session> {
        match self.store.load() {
            Ok(Some(stored)) if stored.base_url == base_url => {
                Some(Session::from_device_token(base_url, &stored.device_token))
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("Failed to load device token: {e:#}");
                None
            }
        }
    }

    async fn run_refresh(
        self: Arc<Self>,
        id: u64,
        generation: u64,
        base_url: String,
        seed: Option<Session>,
        mode: FailureMode,
    ) -> Option<Session> {
        let Some(prev) = seed.or_else(|| self.stored_seed(&base_url)) else {
            tracing::debug!("no device token available; nothing to refresh");
            self.finish_flight(id);
            return None;
        };

        let outcome = self.call_refresh(&base_url, &prev).await;

        let mut state = self.lock();
        let current = state.generation == generation;
        let mode = state
            .flight
            .as_ref()
            .filter(|f| f.id == id)
            .map_or(mode, |f| f.mode);
        if state.flight.as_ref().is_some_and(|f| f.id == id) {
            state.flight = None;
        }
        if !current {
            tracing::debug!("discarding refresh result from a superseded session");
            return None;
        }

        match outcome {
            Ok(session) => {
                state.session = Some(session.clone());
                drop(state);
                self.persist(&session);
                self.emit(AuthSessionEvent::SessionUpdated(session.clone()));
                Some(session)
            }
            Err(e) => {
                tracing::warn!(?mode, "token refresh failed: {e}");
                if mode == FailureMode::Hard {
                    state.session = None;
                    state.generation += 1;
                    drop(state);
                    self.clear_store();
                    self.emit(AuthSessionEvent::SessionCleared);
                }
                None
            }
        }
    }

    async fn call_refresh(&self, base_url: &str, prev: &Session) -> ApiResult<Session> {
        let url = http::join_url(base_url, REFRESH_PATH);
        let response = ApiRequest::post(json!({ "deviceToken": prev.device_token }))
            .build(&self.http, &url, None)
            .send()
            .await
            .map_err(|e| ApiError::transport(&e))?;
        let data = http::read_envelope(response).await?;
        Session::from_refresh(prev, &data, now_millis())
    }

    fn finish_flight(&self, id: u64) {
        let mut state = self.lock();
        if state.flight.as_ref().is_some_and(|f| f.id == id) {
            state.flight = None;
        }
    }
}

fn normalize(base_url: &str) -> String {
    base_url.trim().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> (AuthCoordinator, Arc<MemoryDeviceTokenStore>) {
        let store = Arc::new(MemoryDeviceTokenStore::new());
        let coord = AuthCoordinator::new(Arc::clone(&store) as Arc<dyn DeviceTokenStore>);
        (coord, store)
    }

    fn seed(coord: &AuthCoordinator, base_url: &str, token: &str, expires_in_ms: i64) {
        let mut state = coord.inner.lock();
        state.base_url = Some(base_url.to_string());
        let mut session = Session::from_device_token(base_url, "dt");
        session.access_token = token.to_string();
        session.access_expire_at_ms = now_millis() + expires_in_ms;
        state.session = Some(session);
    }

    #[tokio::test]
    async fn test_valid_cached_token_skips_refresh() {
        let (coord, _) = coordinator();
        seed(&coord, "http://127.0.0.1:9", "cached", 3_600_000);
        assert_eq!(
            coord.get_access_token("http://127.0.0.1:9/", false).await.as_deref(),
            Some("cached")
        );
    }

    #[tokio::test]
    async fn test_ensure_fresh_skips_within_validity_window() {
        let (coord, store) = coordinator();
        seed(&coord, "http://127.0.0.1:9", "cached", 600_000);
        let token = coord
            .ensure_fresh_access_token(
                "http://127.0.0.1:9",
                FreshTokenOptions {
                    min_validity_ms: 60_000,
                    jitter_ms: 10_000,
                    ..FreshTokenOptions::default()
                },
            )
            .await;
        assert_eq!(token.as_deref(), Some("cached"));
        assert_eq!(store.clear_count(), 0);
    }

    #[tokio::test]
    async fn test_base_url_switch_clears_session() {
        let (coord, _) = coordinator();
        seed(&coord, "http://127.0.0.1:9", "cached", 3_600_000);
        let mut rx = coord.subscribe();
        // No stored device token for the new backend, so no network call.
        assert_eq!(coord.get_access_token("http://127.0.0.1:10", false).await, None);
        assert!(coord.current_session().is_none());
        assert_eq!(rx.try_recv().unwrap(), AuthSessionEvent::SessionCleared);
    }

    #[tokio::test]
    async fn test_authorized_fetch_without_token_errors() {
        let (coord, _) = coordinator();
        let err = coord
            .authorized_fetch("http://127.0.0.1:9", "/api/ap/chats", &ApiRequest::get())
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::http::ApiErrorKind::MissingAccessToken);
    }
}
