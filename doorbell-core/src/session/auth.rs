use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::retry::{retry_async, Backoff};

use super::credential::{Credential, LoginGrant};
use super::error::{AuthError, AuthResult};
use super::store::SessionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginMode {
    Password,
    QrCode,
}

#[derive(Clone)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    pub mode: LoginMode,
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username", &self.username)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// One login exchange with the account service.
#[async_trait]
pub trait LoginProvider: Send + Sync {
    async fn login(&self, request: &LoginRequest) -> AuthResult<LoginGrant>;
}

/// Hands out valid credentials, logging in at most once at a time.
pub struct Authenticator {
    store: Arc<SessionStore>,
    provider: Arc<dyn LoginProvider>,
    request: LoginRequest,
    backoff: Backoff,
    login_lock: Mutex<()>,
    logins: AtomicU64,
}

impl Authenticator {
    pub fn new(
        store: Arc<SessionStore>,
        provider: Arc<dyn LoginProvider>,
        request: LoginRequest,
        backoff: Backoff,
    ) -> Self {
        Self {
            store,
            provider,
            request,
            backoff,
            login_lock: Mutex::new(()),
            logins: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn username(&self) -> &str {
        &self.request.username
    }

    /// Number of login exchanges that completed since construction.
    pub fn login_count(&self) -> u64 {
        self.logins.load(Ordering::SeqCst)
    }

    pub async fn get_credential(&self) -> AuthResult<Credential> {
        if let Some(credential) = self.store.load_valid(&self.request.username)? {
            return Ok(credential);
        }

        let _guard = self.login_lock.lock().await;
        if let Some(credential) = self.store.load_valid(&self.request.username)? {
            debug!("session refreshed while waiting for login lock");
            return Ok(credential);
        }

        info!(username = %self.request.username, mode = ?self.request.mode, "logging in");
        let grant = retry_async(&self.backoff, "login", |_attempt| {
            self.provider.login(&self.request)
        })
        .await?;
        let credential = Credential::from_grant(&self.request.username, grant, self.store.now());
        self.store.save(&credential)?;
        self.logins.fetch_add(1, Ordering::SeqCst);
        info!(
            username = %credential.username,
            expires_at = %self.store.policy().expires_at(&credential),
            "login succeeded, session cached"
        );
        Ok(credential)
    }

    /// Called when the remote side rejected `credential`; the next call logs in again.
    pub fn invalidate(&self, credential: &Credential) -> AuthResult<()> {
        if self.store.invalidate_if_matches(&credential.service_token)? {
            warn!(username = %credential.username, "session rejected by service");
        }
        Ok(())
    }

    pub async fn force_relogin(&self) -> AuthResult<Credential> {
        {
            let _guard = self.login_lock.lock().await;
            self.store.clear()?;
        }
        self.get_credential().await
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("request", &self.request)
            .field("store", &self.store)
            .field("logins", &self.login_count())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QrStart {
    login_url: String,
    poll_token: String,
}

#[derive(Debug, Clone)]
struct PendingQr {
    login_url: String,
    poll_token: String,
}

/// Talks to the account gateway over JSON.
pub struct HttpLoginProvider {
    client: Client,
    base_url: String,
    pending_qr: Mutex<Option<PendingQr>>,
}

impl HttpLoginProvider {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> AuthResult<Self> {
        let client = Client::builder()
            .user_agent(concat!("doorbell-archiver/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|err| AuthError::Protocol(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            pending_qr: Mutex::new(None),
        })
    }

    async fn password_login(&self, request: &LoginRequest) -> AuthResult<LoginGrant> {
        let response = self
            .client
            .post(format!("{}/login", self.base_url))
            .json(&json!({ "user": request.username, "password": request.password }))
            .send()
            .await
            .map_err(classify_transport)?;
        match response.status() {
            status if status.is_success() => response
                .json::<LoginGrant>()
                .await
                .map_err(|err| AuthError::Protocol(err.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(AuthError::InvalidCredentials {
                    username: request.username.clone(),
                    reason: response.text().await.unwrap_or_default(),
                })
            }
            status => Err(classify_status(status)),
        }
    }

    async fn qr_login(&self) -> AuthResult<LoginGrant> {
        let mut pending = self.pending_qr.lock().await;
        if let Some(current) = pending.clone() {
            let response = self
                .client
                .post(format!("{}/qr/poll", self.base_url))
                .json(&json!({ "pollToken": current.poll_token }))
                .send()
                .await
                .map_err(classify_transport)?;
            match response.status() {
                StatusCode::OK => {
                    *pending = None;
                    return response
                        .json::<LoginGrant>()
                        .await
                        .map_err(|err| AuthError::Protocol(err.to_string()));
                }
                StatusCode::ACCEPTED => {
                    return Err(AuthError::InteractionRequired {
                        message: "waiting for the QR code to be scanned".into(),
                        login_url: Some(current.login_url),
                    });
                }
                StatusCode::GONE => {
                    debug!("QR login expired, requesting a new code");
                    *pending = None;
                }
                status => return Err(classify_status(status)),
            }
        }

        let response = self
            .client
            .post(format!("{}/qr/start", self.base_url))
            .send()
            .await
            .map_err(classify_transport)?;
        if !response.status().is_success() {
            return Err(classify_status(response.status()));
        }
        let start: QrStart = response
            .json()
            .await
            .map_err(|err| AuthError::Protocol(err.to_string()))?;
        warn!(login_url = %start.login_url, "scan the QR code to finish logging in");
        *pending = Some(PendingQr {
            login_url: start.login_url.clone(),
            poll_token: start.poll_token,
        });
        Err(AuthError::InteractionRequired {
            message: "scan the QR code with the vendor app".into(),
            login_url: Some(start.login_url),
        })
    }
}

#[async_trait]
impl LoginProvider for HttpLoginProvider {
    async fn login(&self, request: &LoginRequest) -> AuthResult<LoginGrant> {
        match request.mode {
            LoginMode::Password => self.password_login(request).await,
            LoginMode::QrCode => self.qr_login().await,
        }
    }
}

fn classify_transport(err: reqwest::Error) -> AuthError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        AuthError::TransientNetwork(err.to_string())
    } else {
        AuthError::Protocol(err.to_string())
    }
}

fn classify_status(status: StatusCode) -> AuthError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        AuthError::TransientNetwork(format!("account service returned {status}"))
    } else {
        AuthError::Protocol(format!("account service returned {status}"))
    }
}
