//! OAuth 2.0 device-authorization flow and proactive token refresh

use std::sync::Arc;
use std::time::Duration;

use devlink_mcu::{NVS_NAMESPACE, keys};
use log::*;
use serde::Deserialize;
use tokio::time::Instant;

use crate::context::DeviceContext;
use crate::error::{AuthError, TransportError};
use crate::http::{HttpClient, HttpResponse};

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Artifacts of a device-authorization request
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceCode {
    pub device_code: String,
    pub user_code: String,
    #[serde(rename = "verification_uri_complete")]
    pub verification_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: u64,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
}

/// True once `now` is past `expires_in / 1.1` seconds after `last`
///
/// A zero lifetime means the server never told us one; nothing is scheduled.
pub fn refresh_due(last: Instant, expires_in: u64, now: Instant) -> bool {
    if expires_in == 0 {
        return false;
    }
    let threshold = Duration::from_secs_f64(expires_in as f64 / 1.1);
    now.saturating_duration_since(last) >= threshold
}

/// Runs the device flow and refresh cycle against the authorization server
///
/// The only writer of the OAuth session in [`DeviceContext`].
#[derive(Clone)]
pub struct OAuthManager {
    ctx: Arc<DeviceContext>,
    http: Arc<dyn HttpClient>,
}

impl OAuthManager {
    pub fn new(ctx: Arc<DeviceContext>, http: Arc<dyn HttpClient>) -> Self {
        Self { ctx, http }
    }

    async fn post(&self, what: &'static str, url: &str, form: &[(&str, &str)]) -> Result<HttpResponse, AuthError> {
        if url.is_empty() {
            return Err(AuthError::Missing(what));
        }
        if !self.ctx.connection().wifi_up {
            return Err(TransportError::WifiDown.into());
        }
        self.ctx
            .auth_limiter()
            .try_acquire()
            .map_err(AuthError::RateLimited)?;

        debug!("POST {} ({})", url, what);
        Ok(self.http.post_form(url, form).await?)
    }

    /// Start the device flow; stores the codes in the session on success
    pub async fn request_device_code(&self, auth_url: &str) -> Result<DeviceCode, AuthError> {
        let config = self.ctx.config();
        let form = [("client_id", config.client_id.as_str()), ("scope", config.scope.as_str())];

        let resp = self.post("authUrl", auth_url, &form).await?;
        if resp.status != 200 {
            warn!("Device code request failed with status {}", resp.status);
            return Err(AuthError::Rejected(resp.status));
        }

        let code: DeviceCode = resp.json().await?;
        info!("Received user code {} ({})", code.user_code, code.verification_url);

        self.ctx.update_session(|s| {
            s.device_code = code.device_code.clone();
            s.user_code = code.user_code.clone();
            s.verification_url = code.verification_url.clone();
        });
        Ok(code)
    }

    /// Exchange the device code for tokens once the user has approved
    pub async fn poll_for_token(&self, token_url: &str, device_code: &str) -> Result<TokenSet, AuthError> {
        let config = self.ctx.config();
        let form = [
            ("client_id", config.client_id.as_str()),
            ("grant_type", DEVICE_CODE_GRANT),
            ("scopes", config.scope.as_str()),
            ("device_code", device_code),
        ];

        let resp = self.post("tokenUrl", token_url, &form).await?;
        if resp.status != 200 {
            let status = resp.status;
            let body: ErrorBody = resp.json().await.unwrap_or_default();
            if body.error == "expired_token" {
                info!("Device code expired, requesting a new one");
                self.ctx.update_session(|s| {
                    s.device_code.clear();
                    s.user_code.clear();
                    s.verification_url.clear();
                });
            } else {
                debug!("Token not ready: status {} {}", status, body.error);
            }
            return Err(AuthError::Rejected(status));
        }

        let tokens: TokenSet = resp.json().await?;
        let prefs = self.ctx.prefs();
        if !tokens.refresh_token.is_empty() {
            prefs.set_if_changed(NVS_NAMESPACE, keys::REFRESH_TOKEN, &tokens.refresh_token)?;
        }
        prefs.set(NVS_NAMESPACE, keys::ACCESS_TOKEN, &tokens.access_token)?;
        prefs.set(NVS_NAMESPACE, keys::EXPIRES_IN, &tokens.expires_in.to_string())?;

        info!("Device authorized, token expires in {}s", tokens.expires_in);
        self.store_tokens(&tokens);
        Ok(tokens)
    }

    /// Trade the refresh token for a new token set
    pub async fn refresh_token(&self, token_url: &str, refresh_token: &str) -> Result<TokenSet, AuthError> {
        if refresh_token.is_empty() {
            return Err(AuthError::Missing("refresh token"));
        }
        let config = self.ctx.config();
        let form = [
            ("client_id", config.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];

        let resp = self.post("tokenUrl", token_url, &form).await;
        // any attempt that reached the server restarts the refresh period
        if matches!(
            resp,
            Ok(_) | Err(AuthError::Transport(TransportError::Http(_) | TransportError::Timeout { .. }))
        ) {
            self.ctx.update_session(|s| s.last_refresh_at = Some(Instant::now()));
        }
        let resp = resp?;
        if resp.status != 200 {
            warn!("Token refresh failed with status {}", resp.status);
            return Err(AuthError::Rejected(resp.status));
        }

        let mut tokens: TokenSet = resp.json().await?;
        if tokens.refresh_token.is_empty() {
            tokens.refresh_token = refresh_token.to_string();
        }
        let prefs = self.ctx.prefs();
        prefs.set(NVS_NAMESPACE, keys::ACCESS_TOKEN, &tokens.access_token)?;
        prefs.set(NVS_NAMESPACE, keys::REFRESH_TOKEN, &tokens.refresh_token)?;
        prefs.set(NVS_NAMESPACE, keys::EXPIRES_IN, &tokens.expires_in.to_string())?;

        info!("Token refreshed, expires in {}s", tokens.expires_in);
        self.store_tokens(&tokens);
        Ok(tokens)
    }

    fn store_tokens(&self, tokens: &TokenSet) {
        self.ctx.update_session(|s| {
            s.access_token = tokens.access_token.clone();
            s.refresh_token = tokens.refresh_token.clone();
            s.expires_in = tokens.expires_in;
            s.last_refresh_at = Some(Instant::now());
        });
    }

    /// Refresh with whatever is in the session
    pub async fn refresh_now(&self) -> Result<TokenSet, AuthError> {
        let session = self.ctx.session();
        let endpoints = self.ctx.endpoints();
        self.refresh_token(&endpoints.token_url, &session.refresh_token).await
    }

    /// One step of the unauthenticated schedule: ask for a device code once,
    /// then poll for the token until it arrives
    pub async fn drive_device_flow(&self) -> Result<(), AuthError> {
        let session = self.ctx.session();
        if session.is_authenticated() || !self.ctx.connection().wifi_up {
            return Ok(());
        }

        let endpoints = self.ctx.endpoints();
        if session.device_code.is_empty() {
            self.request_device_code(&endpoints.auth_url).await?;
        } else {
            self.poll_for_token(&endpoints.token_url, &session.device_code).await?;
        }
        Ok(())
    }

    /// Refresh ahead of expiry; returns whether a refresh was performed
    pub async fn refresh_if_due(&self) -> Result<bool, AuthError> {
        let session = self.ctx.session();
        if !session.is_authenticated() || session.refresh_token.is_empty() {
            return Ok(false);
        }

        let last = match session.last_refresh_at {
            Some(t) => t,
            None => {
                // tokens restored from storage: count the period from boot
                let now = Instant::now();
                self.ctx.update_session(|s| s.last_refresh_at = Some(now));
                now
            }
        };

        if !refresh_due(last, session.expires_in, Instant::now()) {
            return Ok(false);
        }

        info!("Access token is due for refresh");
        self.refresh_now().await?;
        Ok(true)
    }
}
