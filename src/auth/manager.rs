use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use url::Url;

use super::clock::{Clock, SystemClock};
use super::events::{AuthEvent, AuthListener, EventBus};
use super::transport::AuthTransport;
use super::types::{token_preview, AuthRequest, AuthorizationHeader, Grant, TokenState};
use crate::error::{Result, TokenError};
use crate::store::CredentialStore;

/// Store key holding the serialized token state
pub const STORAGE_KEY: &str = "__oauth2";

/// Default token endpoint path
pub const DEFAULT_TOKEN_PATH: &str = "/oauth/token";

/// Client registration and endpoint settings
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub access_url: String,
    pub refresh_url: String,
    pub revoke_url: String,
    pub storage_key: String,
}

impl ClientSettings {
    /// Settings with every endpoint at `<base_url>/oauth/token`
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_paths(base_url, DEFAULT_TOKEN_PATH, DEFAULT_TOKEN_PATH, DEFAULT_TOKEN_PATH)
    }

    pub fn with_paths(
        base_url: &str,
        access_path: &str,
        refresh_path: &str,
        revoke_path: &str,
    ) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| TokenError::Config(format!("invalid base URL {}: {}", base_url, e)))?;
        let join = |path: &str| {
            base.join(path)
                .map(String::from)
                .map_err(|e| TokenError::Config(format!("invalid endpoint path {}: {}", path, e)))
        };

        Ok(Self {
            client_id: None,
            client_secret: None,
            access_url: join(access_path)?,
            refresh_url: join(refresh_path)?,
            revoke_url: join(revoke_path)?,
            storage_key: STORAGE_KEY.to_string(),
        })
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn client_secret(mut self, client_secret: impl Into<String>) -> Self {
        self.client_secret = Some(client_secret.into());
        self
    }

    pub fn storage_key(mut self, storage_key: impl Into<String>) -> Self {
        self.storage_key = storage_key.into();
        self
    }
}

/// Token manager
/// Owns the credential state machine, keeps the store in sync with memory
/// and notifies listeners of every transition
pub struct TokenManager {
    settings: RwLock<ClientSettings>,

    /// Durable persistence, authoritative on every check
    store: Arc<dyn CredentialStore>,

    /// Authorization server exchanges
    transport: Arc<dyn AuthTransport>,

    clock: Arc<dyn Clock>,

    /// In-memory copy of the last loaded or saved state
    state: RwLock<Option<TokenState>>,

    /// Latest issued exchange; bumped by every access/refresh and by clear
    generation: AtomicU64,

    /// Newest generation whose result (or clear) reached the state; only
    /// written under the `state` write lock
    applied: AtomicU64,

    /// Authenticated flag, recomputed on every save/clear
    auth: watch::Sender<bool>,

    events: EventBus,
}

impl TokenManager {
    /// Create a manager on the wall clock
    pub fn new(
        settings: ClientSettings,
        store: Arc<dyn CredentialStore>,
        transport: Arc<dyn AuthTransport>,
    ) -> Self {
        Self::with_clock(settings, store, transport, Arc::new(SystemClock))
    }

    /// Create a manager with an explicit clock
    pub fn with_clock(
        settings: ClientSettings,
        store: Arc<dyn CredentialStore>,
        transport: Arc<dyn AuthTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let initial = read_store(store.as_ref(), &settings.storage_key).unwrap_or_else(|e| {
            tracing::warn!("Failed to load stored token state: {:#}", e);
            None
        });
        let authenticated = initial
            .as_ref()
            .is_some_and(|s| s.is_authenticated_at(clock.now_ms()));
        let (auth, _) = watch::channel(authenticated);

        tracing::debug!(authenticated, "Token manager initialized");

        Self {
            settings: RwLock::new(settings),
            store,
            transport,
            clock,
            state: RwLock::new(initial),
            generation: AtomicU64::new(0),
            applied: AtomicU64::new(0),
            auth,
            events: EventBus::new(),
        }
    }

    pub async fn set_client_id(&self, client_id: impl Into<String>) {
        self.settings.write().await.client_id = Some(client_id.into());
    }

    pub async fn set_client_secret(&self, client_secret: impl Into<String>) {
        self.settings.write().await.client_secret = Some(client_secret.into());
    }

    /// Register an event listener
    pub fn subscribe(&self, listener: Arc<dyn AuthListener>) {
        self.events.subscribe(listener);
    }

    /// Receive all subsequent events on a channel
    pub fn events(&self) -> mpsc::UnboundedReceiver<AuthEvent> {
        self.events.channel()
    }

    /// Watch the authenticated flag; every recompute marks it changed
    pub fn watch_auth(&self) -> watch::Receiver<bool> {
        self.auth.subscribe()
    }

    /// Last computed authenticated flag (no reload)
    pub fn auth(&self) -> bool {
        *self.auth.borrow()
    }

    /// Current in-memory state (no reload)
    pub async fn state(&self) -> Option<TokenState> {
        self.state.read().await.clone()
    }

    /// Reload state from the store
    ///
    /// An unavailable store keeps the in-memory state.
    pub async fn load(&self) -> Option<TokenState> {
        let key = self.settings.read().await.storage_key.clone();
        let mut state = self.state.write().await;

        match read_store(self.store.as_ref(), &key) {
            Ok(loaded) => *state = loaded,
            Err(e) => tracing::warn!("Credential store unavailable, using in-memory state: {:#}", e),
        }

        state.clone()
    }

    /// Reload and evaluate `time + expires_in > now`
    pub async fn is_authenticated(&self) -> bool {
        let state = self.load().await;
        state.is_some_and(|s| s.is_authenticated_at(self.clock.now_ms()))
    }

    /// Milliseconds until the current token expires, 0 if not authenticated
    pub async fn expires_in(&self) -> u64 {
        let state = self.load().await;
        state.map_or(0, |s| s.expires_in_at(self.clock.now_ms()).max(0) as u64)
    }

    /// Whether a refresh token is on record
    pub async fn can_refresh(&self) -> bool {
        self.load()
            .await
            .is_some_and(|s| s.refresh_token.is_some())
    }

    /// Build the authorization header for outbound requests
    pub async fn authorization_header(&self) -> Result<AuthorizationHeader> {
        let state = self.load().await;
        match state.and_then(|s| s.authorization_header_at(self.clock.now_ms())) {
            Some(header) => Ok(header),
            None => {
                let err = TokenError::Unauthorized;
                self.events.emit(AuthEvent::Error(err.to_payload()));
                Err(err)
            }
        }
    }

    /// Emit `access` with the current state if authenticated, `error` otherwise
    pub async fn auth_check(&self) -> bool {
        let state = self.load().await;
        match state {
            Some(state) if state.is_authenticated_at(self.clock.now_ms()) => {
                self.events.emit(AuthEvent::Access(state));
                true
            }
            other => {
                let payload = serde_json::to_value(&other).unwrap_or(Value::Null);
                self.events.emit(AuthEvent::Error(payload));
                false
            }
        }
    }

    /// Replace the state in memory and in the store
    pub async fn save(&self, state: TokenState) {
        let key = self.settings.read().await.storage_key.clone();
        {
            let mut current = self.state.write().await;
            self.persist(&key, &state);
            *current = Some(state);
        }
        self.recompute_auth().await;
    }

    /// Forget the state in memory and in the store
    ///
    /// In-flight exchanges issued before the clear are discarded on completion.
    pub async fn clear(&self) {
        let key = self.settings.read().await.storage_key.clone();
        {
            let mut current = self.state.write().await;
            let generation = self.begin_exchange();
            self.applied.store(generation, Ordering::SeqCst);
            *current = None;
            if let Err(e) = self.store.remove(&key) {
                tracing::warn!("Failed to remove stored token state: {:#}", e);
            }
        }
        self.recompute_auth().await;
    }

    /// Authorization code grant
    ///
    /// No request is made while already authenticated.
    pub async fn access(&self, code: &str, redirect_uri: &str) -> Result<TokenState> {
        if self.is_authenticated().await {
            let state = self.state().await.unwrap_or_default();
            tracing::debug!("Already authenticated, skipping authorization code exchange");
            self.events.emit(AuthEvent::Success(state.clone()));
            return Ok(state);
        }

        let settings = self.settings.read().await.clone();

        // Captured before the request so latency never extends the lifetime
        let time = self.clock.now_ms();
        let generation = self.begin_exchange();

        let request = AuthRequest::grant(
            &settings.access_url,
            Grant::AuthorizationCode,
            vec![
                ("client_id", settings.client_id),
                ("client_secret", settings.client_secret),
                ("code", Some(code.to_string())),
                ("redirect_uri", Some(redirect_uri.to_string())),
            ],
        );

        tracing::info!("Requesting access token via authorization_code grant...");

        let payload = match self.transport.send(request).await {
            Ok(payload) => payload,
            Err(failure) => {
                tracing::error!("Authorization code exchange failed: {}", failure);
                self.events.emit(AuthEvent::Error(failure.to_payload()));
                return Err(failure.into());
            }
        };

        let state = match TokenState::from_response(&payload, time) {
            Ok(state) => state,
            Err(e) => {
                tracing::error!("{}", e);
                self.events.emit(AuthEvent::Error(payload));
                return Err(e);
            }
        };

        self.apply(generation, state.clone()).await?;

        tracing::info!(
            "Access token acquired (token: {}), expires in {}ms",
            state.access_token.as_deref().map(token_preview).unwrap_or_default(),
            state.expires_in.unwrap_or(0)
        );
        self.events.emit(AuthEvent::Success(state.clone()));
        Ok(state)
    }

    /// Refresh token grant
    ///
    /// Fails fast without a request when no refresh token is on record. A
    /// response without a new refresh token keeps the previous one.
    pub async fn refresh(&self) -> Result<TokenState> {
        tracing::info!("A new access token has been requested");

        let current = self.load().await.unwrap_or_default();
        let Some(refresh_token) = current.refresh_token.clone() else {
            let err = TokenError::NoRefreshToken;
            tracing::warn!("{}", err);
            self.events.emit(AuthEvent::Error(err.to_payload()));
            return Err(err);
        };

        let settings = self.settings.read().await.clone();
        let time = self.clock.now_ms();
        let generation = self.begin_exchange();

        let mut request = AuthRequest::grant(
            &settings.refresh_url,
            Grant::RefreshToken,
            vec![
                ("client_id", settings.client_id),
                ("client_secret", settings.client_secret),
                ("refresh_token", Some(refresh_token.clone())),
            ],
        );
        if let Some(header) = current.authorization_header_at(time) {
            request = request.with_authorization(&header);
        }

        let payload = match self.transport.send(request).await {
            Ok(payload) => payload,
            Err(failure) => {
                tracing::error!("Token refresh failed: {}", failure);
                self.events.emit(AuthEvent::Failure(failure.to_payload()));
                return Err(failure.into());
            }
        };

        let mut state = match TokenState::from_response(&payload, time) {
            Ok(state) => state,
            Err(e) => {
                tracing::error!("{}", e);
                self.events.emit(AuthEvent::Failure(payload));
                return Err(e);
            }
        };
        if state.refresh_token.is_none() {
            state.refresh_token = Some(refresh_token);
        }

        self.apply(generation, state.clone()).await?;

        tracing::info!(
            "Token refreshed, expires in {}ms",
            state.expires_in.unwrap_or(0)
        );
        self.events.emit(AuthEvent::Refresh(state.clone()));
        Ok(state)
    }

    /// Revoke the current access token
    ///
    /// Unauthenticated state is cleared locally without a request. A failed
    /// remote revocation leaves local state untouched.
    pub async fn revoke(&self) -> Result<Option<Value>> {
        let now = self.clock.now_ms();
        let state = self.load().await.filter(|s| s.is_authenticated_at(now));

        match state {
            Some(state) => self.revoke_remote(&state, true).await,
            None => {
                self.clear().await;
                self.events.emit(AuthEvent::Revoke(None));
                Ok(None)
            }
        }
    }

    /// Sign in with an authorization code
    pub async fn sign_in(&self, code: &str, redirect_uri: &str) -> Result<TokenState> {
        self.access(code, redirect_uri).await
    }

    /// Sign out locally, then revoke the previous token remotely
    ///
    /// Local state is cleared even if the revocation fails, so the server may
    /// still consider the token live.
    pub async fn sign_out(&self) -> Result<Option<Value>> {
        let now = self.clock.now_ms();
        let previous = self.load().await.filter(|s| s.is_authenticated_at(now));

        self.clear().await;

        match previous {
            Some(state) => self.revoke_remote(&state, false).await,
            None => {
                self.events.emit(AuthEvent::Revoke(None));
                Ok(None)
            }
        }
    }

    async fn revoke_remote(&self, state: &TokenState, clear_on_success: bool) -> Result<Option<Value>> {
        let now = self.clock.now_ms();
        let (Some(header), Some(access_token)) = (
            state.authorization_header_at(now),
            state.access_token.as_deref(),
        ) else {
            let err = TokenError::Unauthorized;
            self.events.emit(AuthEvent::Error(err.to_payload()));
            return Err(err);
        };

        let revoke_url = self.settings.read().await.revoke_url.clone();
        let request = AuthRequest::revocation(&revoke_url, access_token, &header);

        tracing::info!("Revoking access token (token: {})", token_preview(access_token));

        match self.transport.send(request).await {
            Ok(response) => {
                if clear_on_success {
                    self.clear().await;
                }
                self.events.emit(AuthEvent::Revoke(Some(response.clone())));
                Ok(Some(response))
            }
            Err(failure) => {
                tracing::error!("Token revocation failed: {}", failure);
                self.events.emit(AuthEvent::Error(failure.to_payload()));
                Err(failure.into())
            }
        }
    }

    fn begin_exchange(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Save the result of an exchange unless a newer exchange already applied
    /// or a clear happened after it was issued
    ///
    /// Newer exchanges that fail do not invalidate older in-flight ones.
    async fn apply(&self, generation: u64, state: TokenState) -> Result<()> {
        let key = self.settings.read().await.storage_key.clone();
        {
            let mut current = self.state.write().await;
            let applied = self.applied.load(Ordering::SeqCst);
            if generation <= applied {
                tracing::warn!(
                    generation,
                    applied,
                    "Discarding token response superseded by a newer request"
                );
                return Err(TokenError::Superseded);
            }
            self.applied.store(generation, Ordering::SeqCst);
            self.persist(&key, &state);
            *current = Some(state);
        }
        self.recompute_auth().await;
        Ok(())
    }

    fn persist(&self, key: &str, state: &TokenState) {
        let result = serde_json::to_string(state)
            .map_err(anyhow::Error::from)
            .and_then(|raw| self.store.set(key, &raw));

        if let Err(e) = result {
            tracing::warn!("Failed to persist token state, keeping it in memory: {:#}", e);
        }
    }

    async fn recompute_auth(&self) {
        let authenticated = self.is_authenticated().await;
        self.auth.send_replace(authenticated);
        self.events.emit(AuthEvent::Auth(authenticated));
    }
}

/// Read and decode the stored state; malformed data counts as absent
fn read_store(store: &dyn CredentialStore, key: &str) -> anyhow::Result<Option<TokenState>> {
    let Some(raw) = store.get(key)? else {
        return Ok(None);
    };

    match serde_json::from_str::<Option<TokenState>>(&raw) {
        Ok(state) => Ok(state),
        Err(e) => {
            tracing::warn!("Stored token state is malformed, treating as signed out: {}", e);
            Ok(None)
        }
    }
}
