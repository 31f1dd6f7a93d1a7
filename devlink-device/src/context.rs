//! Shared device context
//!
//! Endpoint URLs, the OAuth session and connection flags are read by every
//! task but written by exactly one component each:
//!
//! | state | writer |
//! |---|---|
//! | [`EndpointConfig`] | provisioning (`SERVER_DATA`) and the config-document fetch |
//! | [`OAuthSession`] | [`crate::oauth::OAuthManager`] |
//! | [`ConnectionState`] | [`crate::broker::BrokerManager`] |
//!
//! Writers go through the `pub(crate)` mutators below; everything else gets
//! snapshots or a `watch` receiver to wait on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use devlink_mcu::{NVS_NAMESPACE, keys};
use devlink_proto::{ServerData, Topics};
use log::*;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;

use crate::config::DeviceConfig;
use crate::error::StorageError;
use crate::identity::DeviceIdentity;
use crate::store::Preferences;

/// Why the device is about to restart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// The companion app dropped the provisioning link
    ProvisioningDisconnected,
    /// `reboot` command from the broker
    RebootCommand,
    /// `reset` command or pairing/reset sequence; storage already erased
    FactoryReset,
    /// New image committed
    UpdateApplied,
    /// Every update try failed
    UpdateFailed,
    /// Management loop stopped ticking
    LoopStalled,
}

/// Service endpoints received during provisioning
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointConfig {
    pub auth_url: String,
    pub token_url: String,
    pub mqtt_url: String,
    pub cloud_api_url: String,
    pub config_url: String,
}

impl EndpointConfig {
    pub fn load(prefs: &Preferences) -> Result<Self, StorageError> {
        Ok(Self {
            auth_url: prefs.get_string(NVS_NAMESPACE, keys::AUTH_URL)?,
            token_url: prefs.get_string(NVS_NAMESPACE, keys::TOKEN_URL)?,
            mqtt_url: prefs.get_string(NVS_NAMESPACE, keys::MQTT_URL)?,
            cloud_api_url: prefs.get_string(NVS_NAMESPACE, keys::CLOUD_API_URL)?,
            config_url: prefs.get_string(NVS_NAMESPACE, keys::CONFIG_URL)?,
        })
    }

    /// Overlay the fields present in `data`
    pub fn merge(&mut self, data: &ServerData) {
        let pairs = [
            (&mut self.auth_url, &data.auth_url),
            (&mut self.token_url, &data.token_url),
            (&mut self.mqtt_url, &data.mqtt_url),
            (&mut self.cloud_api_url, &data.cloud_api_url),
            (&mut self.config_url, &data.config_url),
        ];
        for (field, value) in pairs {
            if let Some(v) = value {
                *field = v.clone();
            }
        }
    }

    /// Persist every field, skipping ones already stored with the same value
    pub fn persist(&self, prefs: &Preferences) -> Result<usize, StorageError> {
        let mut written = 0;
        for (key, value) in [
            (keys::AUTH_URL, &self.auth_url),
            (keys::TOKEN_URL, &self.token_url),
            (keys::MQTT_URL, &self.mqtt_url),
            (keys::CLOUD_API_URL, &self.cloud_api_url),
            (keys::CONFIG_URL, &self.config_url),
        ] {
            if prefs.set_if_changed(NVS_NAMESPACE, key, value)? {
                written += 1;
            }
        }
        Ok(written)
    }
}

/// OAuth device-flow state
///
/// An empty access token means the device is unauthenticated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OAuthSession {
    pub device_code: String,
    pub user_code: String,
    pub verification_url: String,
    pub access_token: String,
    pub refresh_token: String,
    /// Token lifetime in seconds
    pub expires_in: u64,
    pub last_refresh_at: Option<Instant>,
}

impl OAuthSession {
    pub fn load(prefs: &Preferences) -> Result<Self, StorageError> {
        Ok(Self {
            access_token: prefs.get_string(NVS_NAMESPACE, keys::ACCESS_TOKEN)?,
            refresh_token: prefs.get_string(NVS_NAMESPACE, keys::REFRESH_TOKEN)?,
            expires_in: prefs
                .get_string(NVS_NAMESPACE, keys::EXPIRES_IN)?
                .parse()
                .unwrap_or(0),
            ..Default::default()
        })
    }

    pub fn is_authenticated(&self) -> bool {
        !self.access_token.is_empty()
    }

    pub fn has_pairing_code(&self) -> bool {
        !self.user_code.is_empty() && !self.verification_url.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub wifi_up: bool,
    pub broker_up: bool,
    pub consecutive_reconnect_failures: u32,
    pub last_health_check_at: Option<Instant>,
}

/// Process-wide spacing for authorization-server requests
///
/// Device-code, token and refresh requests all share one timestamp.
#[derive(Debug)]
pub struct RequestLimiter {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RequestLimiter {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: Mutex::new(None) }
    }

    /// Claim the slot, or report how long until it frees up
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let Ok(mut last) = self.last.lock() else {
            return Ok(());
        };
        if let Some(prev) = *last {
            let elapsed = now.duration_since(prev);
            if elapsed < self.interval {
                return Err(self.interval - elapsed);
            }
        }
        *last = Some(now);
        Ok(())
    }
}

/// State shared by the provisioning handler, management loop and update task
pub struct DeviceContext {
    identity: DeviceIdentity,
    topics: Topics,
    config: DeviceConfig,
    prefs: Preferences,
    endpoints: RwLock<EndpointConfig>,
    session: watch::Sender<OAuthSession>,
    connection: watch::Sender<ConnectionState>,
    restart: watch::Sender<Option<RestartReason>>,
    update_in_flight: AtomicBool,
    broker_init: Notify,
    heartbeat: Mutex<Instant>,
    booted_at: Instant,
    auth_limiter: RequestLimiter,
}

impl DeviceContext {
    /// Build the context, restoring endpoints and tokens from storage
    pub fn load(identity: DeviceIdentity, config: DeviceConfig, prefs: Preferences) -> Result<Self, StorageError> {
        let endpoints = EndpointConfig::load(&prefs)?;
        let session = OAuthSession::load(&prefs)?;

        info!(
            "Loaded state: authUrl={:?} mqttUrl={:?} authenticated={}",
            endpoints.auth_url,
            endpoints.mqtt_url,
            session.is_authenticated()
        );

        Ok(Self::with_state(identity, config, prefs, endpoints, session))
    }

    pub fn with_state(
        identity: DeviceIdentity,
        config: DeviceConfig,
        prefs: Preferences,
        endpoints: EndpointConfig,
        session: OAuthSession,
    ) -> Self {
        let topics = Topics::new(identity.chip_id());
        let auth_limiter = RequestLimiter::new(config.auth_request_interval());
        Self {
            identity,
            topics,
            config,
            prefs,
            endpoints: RwLock::new(endpoints),
            session: watch::channel(session).0,
            connection: watch::channel(ConnectionState::default()).0,
            restart: watch::channel(None).0,
            update_in_flight: AtomicBool::new(false),
            broker_init: Notify::new(),
            heartbeat: Mutex::new(Instant::now()),
            booted_at: Instant::now(),
            auth_limiter,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn prefs(&self) -> &Preferences {
        &self.prefs
    }

    pub fn auth_limiter(&self) -> &RequestLimiter {
        &self.auth_limiter
    }

    // --- endpoints

    pub fn endpoints(&self) -> EndpointConfig {
        self.endpoints.read().map(|e| e.clone()).unwrap_or_default()
    }

    pub(crate) fn update_endpoints(&self, f: impl FnOnce(&mut EndpointConfig)) -> EndpointConfig {
        match self.endpoints.write() {
            Ok(mut guard) => {
                f(&mut guard);
                guard.clone()
            }
            Err(_) => EndpointConfig::default(),
        }
    }

    // --- oauth session

    pub fn session(&self) -> OAuthSession {
        self.session.borrow().clone()
    }

    pub fn watch_session(&self) -> watch::Receiver<OAuthSession> {
        self.session.subscribe()
    }

    pub(crate) fn update_session(&self, f: impl FnOnce(&mut OAuthSession)) {
        self.session.send_modify(f);
    }

    // --- connection

    pub fn connection(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    pub(crate) fn update_connection(&self, f: impl FnOnce(&mut ConnectionState)) {
        self.connection.send_modify(f);
    }

    // --- broker start request from CHECK_AUTH

    pub fn request_broker_init(&self) {
        self.broker_init.notify_one();
    }

    pub async fn broker_init_requested(&self) {
        self.broker_init.notified().await
    }

    // --- update exclusivity

    pub fn update_in_flight(&self) -> bool {
        self.update_in_flight.load(Ordering::SeqCst)
    }

    /// Mark an update as started; false if one is already running
    pub fn begin_update(&self) -> bool {
        self.update_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn end_update(&self) {
        self.update_in_flight.store(false, Ordering::SeqCst);
    }

    // --- liveness

    pub fn uptime(&self) -> Duration {
        self.booted_at.elapsed()
    }

    pub fn beat(&self) {
        if let Ok(mut hb) = self.heartbeat.lock() {
            *hb = Instant::now();
        }
    }

    pub fn since_last_beat(&self) -> Duration {
        self.heartbeat
            .lock()
            .map(|hb| hb.elapsed())
            .unwrap_or_default()
    }

    // --- recovery

    /// Ask the runtime to restart; the first reason wins
    pub fn request_restart(&self, reason: RestartReason) {
        let accepted = self.restart.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if accepted {
            warn!("Restart requested: {:?}", reason);
        }
    }

    pub fn restart_reason(&self) -> Option<RestartReason> {
        *self.restart.borrow()
    }

    pub async fn restart_requested(&self) -> RestartReason {
        let mut rx = self.restart.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            // the sender is owned by self, so changed() cannot fail here
            let _ = rx.changed().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_context;

    #[tokio::test(start_paused = true)]
    async fn limiter_spaces_requests() {
        let limiter = RequestLimiter::new(Duration::from_secs(3));
        assert!(limiter.try_acquire().is_ok());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.try_acquire(), Err(Duration::from_secs(2)));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(limiter.try_acquire().is_ok());
    }

    #[test]
    fn first_restart_reason_wins() {
        let ctx = test_context();
        ctx.request_restart(RestartReason::RebootCommand);
        ctx.request_restart(RestartReason::LoopStalled);
        assert_eq!(ctx.restart_reason(), Some(RestartReason::RebootCommand));
    }

    #[test]
    fn only_one_update_at_a_time() {
        let ctx = test_context();
        assert!(ctx.begin_update());
        assert!(!ctx.begin_update());
        ctx.end_update();
        assert!(ctx.begin_update());
    }

    #[test]
    fn merge_keeps_fields_absent_from_document() {
        let mut ep = EndpointConfig { auth_url: "a".into(), token_url: "t".into(), ..Default::default() };
        ep.merge(&ServerData { token_url: Some("t2".into()), ..Default::default() });
        assert_eq!(ep.auth_url, "a");
        assert_eq!(ep.token_url, "t2");
    }
}
