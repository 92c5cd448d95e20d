//! Single-flight coordination of token refreshes.
//!
//! A [`Coordinator`] owns the access token of one middleware instance and at
//! most one in-flight refresh. Every request that needs a token while a
//! refresh is running subscribes to that refresh instead of starting its own:
//!
//! ```text
//!          begin_authentication()                 refresh task
//! Idle ───────────────────────────▶ Refreshing ──────────────────▶ Idle
//!   ▲   (clears token, spawns task)      │  service → ticket → token   │
//!   │                                    │                             │
//!   └──── every RefreshHandle::wait() resolves with the same outcome ──┘
//! ```
//!
//! The refresh runs as a spawned tokio task so it completes even when every
//! waiting request is dropped. Its outcome is published on a `watch` channel
//! after the state has been updated, so a resumed request always sees the
//! new token.
//!
//! Token store calls may block (keychain, file system). They run on the
//! blocking pool and never while the state lock is held.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response};
use http_body::Body;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, watch};
use tower::Service;
use tracing::{debug, info, warn};

use crate::config::{ACCESS_TOKEN_KEY, CasAuthConfig, Endpoint, Settings};
use crate::store::{TokenStore, TokenStoreError};

use super::cas::{self, ExchangeError};
use super::error::{ErrorCode, RefreshError};
use super::oauth::{self, UserAgent};

type RefreshOutcome = Option<Result<String, RefreshError>>;
type SharedTokenStore = Arc<Mutex<Box<dyn TokenStore>>>;

/// A subscription to one refresh. Clones observe the same outcome.
#[derive(Clone, Debug)]
pub struct RefreshHandle {
    receiver: watch::Receiver<RefreshOutcome>,
}

impl RefreshHandle {
    /// Wait for the refresh to settle and return the access token it produced.
    pub async fn wait(mut self) -> Result<String, RefreshError> {
        let outcome = self
            .receiver
            .wait_for(Option::is_some)
            .await
            .map(|outcome| (*outcome).clone());

        match outcome {
            Ok(Some(result)) => result,
            _ => Err(RefreshError::Aborted),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.receiver.borrow().is_some()
    }

    /// The task went away without publishing an outcome.
    fn is_abandoned(&self) -> bool {
        self.receiver.has_changed().is_err() && !self.is_settled()
    }
}

#[derive(Default)]
struct CoordinatorState {
    access_token: Option<String>,
    active_refresh: Option<RefreshHandle>,
    /// Bumped each time a refresh starts.
    generation: u64,
}

impl CoordinatorState {
    fn active_refresh(&self) -> Option<RefreshHandle> {
        self.active_refresh
            .as_ref()
            .filter(|handle| !handle.is_abandoned())
            .cloned()
    }
}

/// Owner of the access token and the refresh protocol of one middleware instance.
///
/// Cloning is cheap and every clone shares the same state.
#[derive(Clone)]
pub struct Coordinator {
    settings: Settings,
    user_agent: Option<Arc<dyn UserAgent>>,
    state: Arc<RwLock<CoordinatorState>>,
    token_store: Option<SharedTokenStore>,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("settings", &self.settings)
            .field("has_user_agent", &self.user_agent.is_some())
            .field("has_token_store", &self.token_store.is_some())
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    pub fn new(settings: Settings) -> Self {
        Coordinator {
            settings,
            user_agent: None,
            state: Arc::new(RwLock::new(CoordinatorState::default())),
            token_store: None,
        }
    }

    /// Persist tokens in `store` when `cache_access_token` is enabled.
    pub fn with_token_store(mut self, store: Box<dyn TokenStore>) -> Self {
        self.token_store = Some(Arc::new(Mutex::new(store)));
        self
    }

    /// Navigation context for OAuth redirect mode.
    pub fn with_user_agent(mut self, user_agent: Arc<dyn UserAgent>) -> Self {
        self.user_agent = Some(user_agent);
        self
    }

    pub fn settings(&self) -> Arc<CasAuthConfig> {
        self.settings.get()
    }

    /// The token currently held in memory.
    pub async fn access_token(&self) -> Option<String> {
        self.state.read().await.access_token.clone()
    }

    pub async fn is_refreshing(&self) -> bool {
        self.state.read().await.active_refresh().is_some()
    }

    /// Subscribe to the refresh in flight, if any.
    pub async fn await_authentication(&self) -> Option<RefreshHandle> {
        self.state.read().await.active_refresh()
    }

    /// Start a refresh, or join the one already in flight.
    ///
    /// Starting clears the held token and the persisted copy, then spawns the
    /// service → ticket → token sequence on `inner`. Must be called from
    /// within a tokio runtime.
    pub async fn begin_authentication<S, ReqBody, ResBody>(&self, inner: S) -> RefreshHandle
    where
        S: Service<Request<ReqBody>, Response = Response<ResBody>> + Send + 'static,
        S::Future: Send,
        S::Error: fmt::Debug + Send,
        ReqBody: From<Bytes> + Send + 'static,
        ResBody: Body + Send + 'static,
        ResBody::Data: Send,
        ResBody::Error: fmt::Debug + Send,
    {
        let config = self.settings.get();

        let (sender, handle) = {
            let mut state = self.state.write().await;
            if let Some(active) = state.active_refresh() {
                debug!("joining in-flight refresh");
                return active;
            }

            state.access_token = None;
            state.generation += 1;

            let (sender, receiver) = watch::channel(None);
            let handle = RefreshHandle { receiver };
            state.active_refresh = Some(handle.clone());
            (sender, handle)
        };

        if config.cache_access_token
            && let Some(store) = self.lock_store().await
            && let Err(e) = run_store_op(store, |store| store.remove(ACCESS_TOKEN_KEY)).await
        {
            warn!(error = %e, "failed to invalidate persisted access token");
        }

        info!("starting authentication refresh");

        let coordinator = self.clone();
        tokio::spawn(async move {
            let user_agent = coordinator.user_agent.clone();
            let refresh = run_refresh(&config, user_agent.as_deref(), inner);
            let outcome = match config.refresh_timeout_secs.map(Duration::from_secs) {
                Some(limit) => tokio::time::timeout(limit, refresh)
                    .await
                    .unwrap_or(Err(RefreshError::TimedOut(limit))),
                None => refresh.await,
            };
            coordinator.finish_refresh(&config, outcome, sender).await;
        });

        handle
    }

    /// Store the outcome, report failures, then wake every waiter.
    async fn finish_refresh(
        &self,
        config: &CasAuthConfig,
        outcome: Result<String, RefreshError>,
        sender: watch::Sender<RefreshOutcome>,
    ) {
        {
            let mut state = self.state.write().await;
            if let Ok(token) = &outcome {
                state.access_token = Some(token.clone());
            }
            state.active_refresh = None;
        }

        match &outcome {
            Ok(token) => info!(token_len = token.len(), "authentication refresh succeeded"),
            Err(e) => {
                warn!(error = %e, "authentication refresh failed");
                if let (RefreshError::Step { code, message }, Some(callback)) =
                    (e, &config.error_callback)
                {
                    callback.call(*code, message);
                }
            }
        }

        sender.send_replace(Some(outcome));
    }

    /// Pre-send step for a managed request: the token to attach, if any.
    ///
    /// Waits for the refresh in flight, or starts one on `inner` when a token
    /// is required and none is held. A failed refresh fails the request.
    ///
    /// Takes an owned clone of the inner service so that `S: Sync` is not
    /// required.
    pub(crate) async fn prepare_request<S, ReqBody, ResBody>(
        &self,
        inner: S,
    ) -> Result<Option<String>, RefreshError>
    where
        S: Service<Request<ReqBody>, Response = Response<ResBody>> + Send + 'static,
        S::Future: Send,
        S::Error: fmt::Debug + Send,
        ReqBody: From<Bytes> + Send + 'static,
        ResBody: Body + Send + 'static,
        ResBody::Data: Send,
        ResBody::Error: fmt::Debug + Send,
    {
        let config = self.settings.get();
        if config.cache_access_token {
            self.load_persisted_token().await;
        }

        let (access_token, active_refresh) = {
            let state = self.state.read().await;
            (state.access_token.clone(), state.active_refresh())
        };

        let pending = match active_refresh {
            Some(active) => {
                debug!("refresh in flight, deferring request");
                Some(active)
            }
            None if config.require_access_token && access_token.is_none() => {
                debug!("no access token held, authenticating before sending");
                Some(
                    self.begin_authentication::<S, ReqBody, ResBody>(inner)
                        .await,
                )
            }
            None => None,
        };

        match pending {
            Some(handle) => handle.wait().await.map(Some),
            None => Ok(access_token),
        }
    }

    /// Success step for a managed request: persist the held token.
    pub(crate) async fn persist_token(&self) {
        let config = self.settings.get();
        if !config.cache_access_token {
            return;
        }

        // Holding the store across the read orders this write before the
        // removal of a refresh that clears the token.
        let Some(store) = self.lock_store().await else {
            return;
        };
        let Some(token) = self.access_token().await else {
            return;
        };

        let ttl = config.cache_ttl();
        match run_store_op(store, move |store| store.set(ACCESS_TOKEN_KEY, &token, ttl)).await {
            Ok(()) => debug!(ttl = ?ttl, "persisted access token"),
            Err(e) => warn!(error = %e, "failed to persist access token"),
        }
    }

    async fn load_persisted_token(&self) {
        // Skip when a token is held or a refresh cleared it on purpose.
        let generation = {
            let state = self.state.read().await;
            if state.access_token.is_some() || state.active_refresh().is_some() {
                return;
            }
            state.generation
        };
        let Some(store) = self.lock_store().await else {
            return;
        };

        let token = match run_store_op(store, |store| store.get(ACCESS_TOKEN_KEY)).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!("no persisted access token");
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to read token store");
                return;
            }
        };

        let mut state = self.state.write().await;
        if state.access_token.is_some() || state.generation != generation {
            debug!("refresh started while reading token store, discarding persisted token");
            return;
        }
        debug!(token_len = token.len(), "loaded access token from token store");
        state.access_token = Some(token);
    }

    async fn lock_store(&self) -> Option<OwnedMutexGuard<Box<dyn TokenStore>>> {
        Some(self.token_store.clone()?.lock_owned().await)
    }
}

/// Run a token store call on the blocking pool.
async fn run_store_op<T, F>(
    mut store: OwnedMutexGuard<Box<dyn TokenStore>>,
    op: F,
) -> Result<T, TokenStoreError>
where
    T: Send + 'static,
    F: FnOnce(&mut Box<dyn TokenStore>) -> Result<T, TokenStoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || op(&mut store))
        .await
        .unwrap_or_else(|e| {
            Err(TokenStoreError::StoreUnavailable {
                reason: format!("token store task failed: {e}"),
            })
        })
}

/// The refresh sequence: optional OAuth fragment token, then service, ticket and token.
async fn run_refresh<S, ReqBody, ResBody>(
    config: &CasAuthConfig,
    user_agent: Option<&dyn UserAgent>,
    mut inner: S,
) -> Result<String, RefreshError>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Error: fmt::Debug,
    ReqBody: From<Bytes>,
    ResBody: Body,
    ResBody::Error: fmt::Debug,
{
    let oauth_token = if config.oauth {
        Some(oauth_fragment_token(config, user_agent)?)
    } else {
        None
    };

    let service_id = cas::fetch_service(&mut inner, &config.api_url(Endpoint::Service))
        .await
        .map_err(|e| step_failure(ErrorCode::Service, "Failed to fetch service", e))?;

    let ticket_id = cas::fetch_ticket(
        &mut inner,
        &config.resolved_ticket_url(),
        &service_id,
        oauth_token.as_deref(),
    )
    .await
    .map_err(|e| step_failure(ErrorCode::Ticket, "Failed to fetch ticket", e))?;

    cas::fetch_token(&mut inner, &config.api_url(Endpoint::Token), &ticket_id)
        .await
        .map_err(|e| step_failure(ErrorCode::Token, "Failed to fetch token", e))
}

/// The token handed back by the identity provider, or a redirect to its login page.
fn oauth_fragment_token(
    config: &CasAuthConfig,
    user_agent: Option<&dyn UserAgent>,
) -> Result<String, RefreshError> {
    let user_agent = user_agent.ok_or(RefreshError::MissingUserAgent)?;

    if let Some(token) = user_agent
        .fragment()
        .as_deref()
        .and_then(oauth::fragment_access_token)
    {
        debug!(token_len = token.len(), "using OAuth token from URL fragment");
        return Ok(token);
    }

    let login_url = oauth::login_redirect_url(config).ok_or_else(|| RefreshError::Step {
        code: ErrorCode::Config,
        message: "cannot build OAuth login URL".to_string(),
    })?;

    info!(url = %login_url, "redirecting to identity provider");
    user_agent.redirect(&login_url);
    Err(RefreshError::Redirected)
}

fn step_failure(code: ErrorCode, context: &str, error: ExchangeError) -> RefreshError {
    warn!(code = %code, error = %error, "{context}");
    RefreshError::Step {
        code,
        message: format!("{context}: {error}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;
    use std::sync::Mutex;

    use crate::client::testing::{MockCasService, test_config};
    use crate::store::{MemoryTokenStore, MockTokenStore};

    fn coordinator(config: CasAuthConfig) -> Coordinator {
        Coordinator::new(Settings::with_config(config).unwrap())
    }

    #[tokio::test]
    async fn concurrent_begins_share_one_refresh() {
        let coordinator = coordinator(test_config().build().unwrap());
        let mock = MockCasService::new_ok();

        let first = coordinator
            .begin_authentication::<_, Full<Bytes>, Full<Bytes>>(mock.clone())
            .await;
        let second = coordinator
            .begin_authentication::<_, Full<Bytes>, Full<Bytes>>(mock.clone())
            .await;
        assert!(coordinator.is_refreshing().await);

        let (first, second) = tokio::join!(first.wait(), second.wait());
        assert_eq!(first.unwrap(), "tok1");
        assert_eq!(second.unwrap(), "tok1");

        assert_eq!(mock.count("/v1/service"), 1);
        assert_eq!(mock.count("/ticket"), 1);
        assert_eq!(mock.count("/v1/token/new"), 1);
        assert_eq!(coordinator.access_token().await.as_deref(), Some("tok1"));
        assert!(!coordinator.is_refreshing().await);
    }

    #[tokio::test]
    async fn await_authentication_follows_the_active_refresh() {
        let coordinator = coordinator(test_config().build().unwrap());
        assert!(coordinator.await_authentication().await.is_none());

        let mock = MockCasService::new_ok();
        let started = coordinator
            .begin_authentication::<_, Full<Bytes>, Full<Bytes>>(mock)
            .await;
        let awaited = coordinator
            .await_authentication()
            .await
            .expect("refresh should be active");

        assert_eq!(awaited.wait().await.unwrap(), "tok1");
        assert!(started.is_settled());
        assert_eq!(started.wait().await.unwrap(), "tok1");
        assert!(coordinator.await_authentication().await.is_none());
    }

    #[tokio::test]
    async fn failed_refresh_returns_to_idle_and_can_be_retried() {
        let coordinator = coordinator(test_config().build().unwrap());
        let mock = MockCasService::new_ok().fail("/v1/token/new", 1);

        let failed = coordinator
            .begin_authentication::<_, Full<Bytes>, Full<Bytes>>(mock.clone())
            .await;
        let err = failed.wait().await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::Token));
        assert!(!coordinator.is_refreshing().await);
        assert!(coordinator.access_token().await.is_none());

        let retried = coordinator
            .begin_authentication::<_, Full<Bytes>, Full<Bytes>>(mock.clone())
            .await;
        assert_eq!(retried.wait().await.unwrap(), "tok1");
        assert_eq!(mock.count("/v1/service"), 2);
    }

    #[tokio::test]
    async fn each_failing_step_is_classified() {
        for (path, code) in [
            ("/v1/service", ErrorCode::Service),
            ("/ticket", ErrorCode::Ticket),
            ("/v1/token/new", ErrorCode::Token),
        ] {
            let reported = Arc::new(Mutex::new(Vec::new()));
            let sink = reported.clone();
            let config = test_config()
                .error_callback(move |code, message| {
                    sink.lock().unwrap().push((code, message.to_string()))
                })
                .build()
                .unwrap();
            let coordinator = coordinator(config);

            let mock = MockCasService::new_ok().fail(path, 1);
            let err = coordinator
                .begin_authentication::<_, Full<Bytes>, Full<Bytes>>(mock)
                .await
                .wait()
                .await
                .unwrap_err();

            assert_eq!(err.code(), Some(code), "failing {path}");
            let reported = reported.lock().unwrap();
            assert_eq!(reported.len(), 1, "callback should fire once for {path}");
            assert_eq!(reported[0].0, code);
        }
    }

    #[tokio::test]
    async fn beginning_a_refresh_clears_held_and_persisted_tokens() {
        let mut store = MockTokenStore::new();
        store
            .expect_remove()
            .withf(|key| key == ACCESS_TOKEN_KEY)
            .times(1)
            .returning(|_| Ok(()));
        store
            .expect_get()
            .returning(|_| Ok(Some("stale".to_string())));

        let config = test_config().cache_access_token(true).build().unwrap();
        let coordinator = coordinator(config).with_token_store(Box::new(store));
        let mock = MockCasService::new_ok().hang("/v1/service");

        coordinator.load_persisted_token().await;
        assert_eq!(coordinator.access_token().await.as_deref(), Some("stale"));

        let _handle = coordinator
            .begin_authentication::<_, Full<Bytes>, Full<Bytes>>(mock)
            .await;
        assert!(coordinator.access_token().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_timeout_fails_waiters() {
        let config = test_config().refresh_timeout_secs(5).build().unwrap();
        let coordinator = coordinator(config);
        let mock = MockCasService::new_ok().hang("/ticket");

        let err = coordinator
            .begin_authentication::<_, Full<Bytes>, Full<Bytes>>(mock)
            .await
            .wait()
            .await
            .unwrap_err();

        assert_eq!(err, RefreshError::TimedOut(Duration::from_secs(5)));
        assert!(!coordinator.is_refreshing().await);
    }

    /// Blocks in `get` until released.
    struct GatedStore {
        entered: Arc<tokio::sync::Notify>,
        gate: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl TokenStore for GatedStore {
        fn get(&self, _key: &str) -> Result<Option<String>, TokenStoreError> {
            self.entered.notify_one();
            self.gate.lock().unwrap().recv().unwrap();
            Ok(Some("slow1".to_string()))
        }

        fn set(&mut self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), TokenStoreError> {
            Ok(())
        }

        fn remove(&mut self, _key: &str) -> Result<(), TokenStoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn slow_token_store_does_not_block_state_reads() {
        let entered = Arc::new(tokio::sync::Notify::new());
        let (release, gate) = std::sync::mpsc::channel();
        let store = GatedStore {
            entered: entered.clone(),
            gate: Mutex::new(gate),
        };
        let config = test_config().cache_access_token(true).build().unwrap();
        let coordinator = coordinator(config).with_token_store(Box::new(store));

        let loading = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.load_persisted_token().await }
        });
        entered.notified().await;

        assert!(coordinator.access_token().await.is_none());
        assert!(!coordinator.is_refreshing().await);

        release.send(()).unwrap();
        loading.await.unwrap();
        assert_eq!(coordinator.access_token().await.as_deref(), Some("slow1"));
    }

    #[tokio::test]
    async fn persisted_token_read_during_a_refresh_is_discarded() {
        let entered = Arc::new(tokio::sync::Notify::new());
        let (release, gate) = std::sync::mpsc::channel();
        let store = GatedStore {
            entered: entered.clone(),
            gate: Mutex::new(gate),
        };
        let config = test_config().cache_access_token(true).build().unwrap();
        let coordinator = coordinator(config).with_token_store(Box::new(store));

        let loading = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.load_persisted_token().await }
        });
        entered.notified().await;

        let refreshing = tokio::spawn({
            let coordinator = coordinator.clone();
            async move {
                coordinator
                    .begin_authentication::<_, Full<Bytes>, Full<Bytes>>(
                        MockCasService::new_ok().hang("/v1/service"),
                    )
                    .await
            }
        });
        while !coordinator.is_refreshing().await {
            tokio::task::yield_now().await;
        }

        release.send(()).unwrap();
        loading.await.unwrap();
        let _handle = refreshing.await.unwrap();

        assert!(coordinator.is_refreshing().await);
        assert!(coordinator.access_token().await.is_none());
    }

    #[tokio::test]
    async fn persisted_token_is_not_loaded_when_caching_is_off() {
        let mut store = MemoryTokenStore::new();
        store
            .set(ACCESS_TOKEN_KEY, "cached1", Duration::from_secs(60))
            .unwrap();
        let coordinator =
            coordinator(test_config().build().unwrap()).with_token_store(Box::new(store));

        let token = coordinator
            .prepare_request::<_, Full<Bytes>, Full<Bytes>>(MockCasService::new_ok())
            .await
            .unwrap();
        assert!(token.is_none());
    }
}
