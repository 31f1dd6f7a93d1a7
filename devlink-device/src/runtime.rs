//! Management loop and the auxiliary tasks around it
//!
//! One loop owns the broker session and the OAuth schedule. Everything else
//! (the update download, the stall monitor, the first Wi-Fi join) runs as a
//! spawned task; all but the update stop when the auxiliary token is cancelled.

use std::sync::Arc;
use std::time::Duration;

use devlink_proto::ServerData;
use log::*;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerManager, BrokerState, InboundMessage};
use crate::clock;
use crate::context::{DeviceContext, RestartReason};
use crate::error::{AuthError, DeviceError, ProtocolError, TransportError};
use crate::http::HttpClient;
use crate::oauth::OAuthManager;
use crate::ota::{UpdateManager, UpdateRequest, run_update_task};
use crate::queue::OutboundQueue;
use crate::telemetry::TelemetryAggregator;
use crate::wifi::{WifiLink, load_credentials};

/// How long one loop iteration waits on the broker before servicing timers
const POLL_WAIT: Duration = Duration::from_millis(200);

/// Builds a fresh [`UpdateManager`] for each upgrade command
pub type UpdaterFactory = Box<dyn Fn() -> UpdateManager + Send + Sync>;

/// Channel the RSSI sample is reported on
pub const RSSI_METHOD: &str = "sensor-data";
pub const RSSI_PARAMETER: &str = "wifi";

/// GET `configUrl` and merge the endpoints it lists
///
/// Returns how many stored fields changed.
pub async fn fetch_config(ctx: &DeviceContext, http: &dyn HttpClient) -> Result<usize, DeviceError> {
    let url = ctx.endpoints().config_url;
    if url.is_empty() {
        return Err(TransportError::EmptyUrl.into());
    }

    info!("Fetching config document from {}", url);
    let resp = http.get(&url, None, ctx.config().ota_timeout()).await?;
    if !resp.is_success() {
        return Err(TransportError::Status(resp.status).into());
    }
    let body = resp.bytes().await?;
    let data: ServerData = serde_json::from_slice(&body).map_err(ProtocolError::Json)?;

    let endpoints = ctx.update_endpoints(|e| e.merge(&data));
    let written = endpoints.persist(ctx.prefs())?;
    info!("Config document applied, {} field(s) changed", written);
    Ok(written)
}

/// Restart the device when the management loop stops beating
pub fn spawn_stall_monitor(ctx: Arc<DeviceContext>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let threshold = ctx.config().stall_threshold();
        let period = (threshold / 10).max(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(period) => {}
            }
            let silent = ctx.since_last_beat();
            if silent > threshold {
                error!("Management loop silent for {:?}, restarting", silent);
                ctx.request_restart(RestartReason::LoopStalled);
                return;
            }
        }
    })
}

pub(crate) struct Runtime {
    pub(crate) ctx: Arc<DeviceContext>,
    pub(crate) http: Arc<dyn HttpClient>,
    pub(crate) wifi: WifiLink,
    pub(crate) broker: BrokerManager,
    pub(crate) oauth: OAuthManager,
    pub(crate) queue: Arc<OutboundQueue>,
    pub(crate) telemetry: Arc<TelemetryAggregator>,
    pub(crate) updater: UpdaterFactory,
    pub(crate) aux: CancellationToken,
    pub(crate) config_fetched: bool,
}

impl Runtime {
    /// Drive the device until a restart is requested or `shutdown` fires
    ///
    /// `None` means a clean shutdown.
    pub(crate) async fn run(mut self, shutdown: CancellationToken) -> Option<RestartReason> {
        let ctx = self.ctx.clone();
        let config = ctx.config().clone();

        match clock::restore_time(ctx.prefs(), ctx.uptime()) {
            Ok(Some(now)) => info!("Wall clock restored to {}", now),
            Ok(None) => {}
            Err(e) => warn!("Could not read time snapshot: {}", e),
        }
        self.spawn_wifi_join();
        spawn_stall_monitor(ctx.clone(), self.aux.clone());

        let mut health = tokio::time::interval(config.health_check_interval());
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let period = config.telemetry_interval();
        let mut telemetry = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        telemetry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Management loop started for {}", ctx.topics().device_id());
        let reason = loop {
            tokio::select! {
                reason = ctx.restart_requested() => break Some(reason),
                _ = shutdown.cancelled() => break None,
                _ = health.tick() => self.health_tick().await,
                _ = telemetry.tick() => self.telemetry_tick(),
                _ = ctx.broker_init_requested() => {
                    info!("Broker start requested by provisioning");
                    self.broker.health_check(&self.oauth).await;
                }
                msg = self.broker.poll(POLL_WAIT) => {
                    if let Some(msg) = msg {
                        self.on_message(msg);
                    }
                }
            }
            self.broker.drain_one().await;
        };

        self.aux.cancel();
        self.broker.shutdown().await;
        info!("Management loop stopped: {:?}", reason);
        reason
    }

    async fn health_tick(&mut self) {
        self.ctx.beat();
        let wifi_up = self.broker.observe_wifi();

        if wifi_up && !self.config_fetched && !self.ctx.endpoints().config_url.is_empty() {
            self.config_fetched = true;
            if let Err(e) = fetch_config(&self.ctx, self.http.as_ref()).await {
                warn!("Config document fetch failed: {}", e);
            }
        }

        if !self.ctx.update_in_flight() {
            log_auth(self.oauth.drive_device_flow().await);
            log_auth(self.oauth.refresh_if_due().await.map(|_| ()));
        }

        self.broker.health_check(&self.oauth).await;
        self.broker.watchdog().await;
    }

    /// Sample RSSI and flush; nothing happens without a token or during an
    /// update, and samples stay pending until the broker is connected
    fn telemetry_tick(&self) {
        if !self.ctx.session().is_authenticated() || self.ctx.update_in_flight() {
            return;
        }
        if let Some(rssi) = self.wifi.rssi() {
            self.telemetry.submit(RSSI_METHOD, RSSI_PARAMETER, f64::from(rssi));
        }
        if self.broker.state() != BrokerState::Connected {
            debug!("Broker down, holding {} telemetry sample(s)", self.telemetry.pending_len());
            return;
        }
        let queued = self.telemetry.flush(&self.queue);
        if queued > 0 {
            debug!("Telemetry flush queued {} message(s)", queued);
        }
    }

    fn on_message(&mut self, msg: InboundMessage) {
        if let Some(request) = self.broker.dispatch(msg) {
            self.start_update(request);
        }
    }

    fn start_update(&self, request: UpdateRequest) {
        if !self.ctx.begin_update() {
            warn!("Update already running, ignoring {}", request.url);
            return;
        }
        let manager = (self.updater)();
        tokio::spawn(run_update_task(self.ctx.clone(), manager, request));
    }

    fn spawn_wifi_join(&self) {
        let credentials = match load_credentials(self.ctx.prefs()) {
            Ok(Some(c)) => c,
            Ok(None) => {
                info!("No stored WiFi credentials, waiting for provisioning");
                return;
            }
            Err(e) => {
                warn!("Could not read WiFi credentials: {}", e);
                return;
            }
        };
        if self.wifi.is_connected() {
            return;
        }

        let wifi = self.wifi.clone();
        let cancel = self.aux.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                res = wifi.connect(&credentials) => {
                    if let Err(e) = res {
                        warn!("Initial WiFi join failed: {}", e);
                    }
                }
            }
        });
    }
}

fn log_auth(result: Result<(), AuthError>) {
    match result {
        Ok(()) => {}
        Err(AuthError::RateLimited(wait)) => debug!("Authorization request deferred by {:?}", wait),
        Err(e) => warn!("Authorization step failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerTransport;
    use crate::commands::CommandRegistry;
    use crate::testing::{FakeHttp, FakeTarget, FakeTransport, FakeWifi, test_context};
    use devlink_mcu::{NVS_NAMESPACE, keys};
    use serde_json::json;

    struct Harness {
        ctx: Arc<DeviceContext>,
        http: FakeHttp,
        transport: FakeTransport,
        runtime: Runtime,
    }

    fn harness() -> Harness {
        let ctx = Arc::new(test_context());
        ctx.update_endpoints(|e| e.mqtt_url = "mqtts://broker.example".into());
        ctx.update_session(|s| s.access_token = "at1".into());

        let http = FakeHttp::new();
        let client: Arc<dyn HttpClient> = Arc::new(http.clone());
        let wifi = WifiLink::new(FakeWifi::connected(), 3, Duration::from_millis(100));
        let transport = FakeTransport::new();
        let queue = Arc::new(OutboundQueue::new(10));
        let broker = BrokerManager::new(ctx.clone(), transport.clone(), queue.clone(), wifi.clone(), CommandRegistry::new());

        let factory_http = client.clone();
        let factory_config = ctx.config().clone();
        let runtime = Runtime {
            ctx: ctx.clone(),
            http: client.clone(),
            wifi,
            broker,
            oauth: OAuthManager::new(ctx.clone(), client),
            queue,
            telemetry: Arc::new(TelemetryAggregator::new(ctx.topics().rpc_out())),
            updater: Box::new(move || UpdateManager::new(factory_http.clone(), FakeTarget::new(), &factory_config)),
            aux: CancellationToken::new(),
            config_fetched: false,
        };
        Harness { ctx, http, transport, runtime }
    }

    #[tokio::test(start_paused = true)]
    async fn config_document_only_rewrites_changes() {
        let ctx = test_context();
        ctx.update_endpoints(|e| e.config_url = "https://cfg/device.json".into());
        let http = FakeHttp::new();
        let doc = json!({"authUrl": "https://auth/code", "tokenUrl": "https://auth/token", "configUrl": "https://cfg/device.json"});
        http.respond_json(200, doc.clone());
        http.respond_json(200, doc);

        assert!(fetch_config(&ctx, &http).await.unwrap() > 0);
        assert_eq!(ctx.endpoints().auth_url, "https://auth/code");
        assert_eq!(ctx.prefs().get_string(NVS_NAMESPACE, keys::TOKEN_URL).unwrap(), "https://auth/token");

        assert_eq!(fetch_config(&ctx, &http).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn config_document_needs_url_and_success() {
        let ctx = test_context();
        let http = FakeHttp::new();
        assert!(fetch_config(&ctx, &http).await.is_err());

        ctx.update_endpoints(|e| e.config_url = "https://cfg/device.json".into());
        http.respond_body(404, Vec::new());
        assert!(matches!(
            fetch_config(&ctx, &http).await,
            Err(DeviceError::Transport(TransportError::Status(404)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_loop_triggers_restart() {
        let ctx = Arc::new(test_context());
        let cancel = CancellationToken::new();
        let monitor = spawn_stall_monitor(ctx.clone(), cancel.clone());

        tokio::time::sleep(Duration::from_secs(290)).await;
        ctx.beat();
        tokio::time::sleep(Duration::from_secs(290)).await;
        assert_eq!(ctx.restart_reason(), None);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(ctx.restart_reason(), Some(RestartReason::LoopStalled));
        monitor.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_monitor_stays_quiet() {
        let ctx = Arc::new(test_context());
        let cancel = CancellationToken::new();
        let monitor = spawn_stall_monitor(ctx.clone(), cancel.clone());
        cancel.cancel();
        monitor.await.unwrap();

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(ctx.restart_reason(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_connects_and_publishes() {
        let h = harness();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(h.runtime.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.transport.connects().len(), 1);
        assert!(h.ctx.connection().broker_up);
        assert_eq!(h.transport.published()[0].topic, "stream/010203040506/version");

        tokio::time::sleep(Duration::from_secs(11)).await;
        let rssi = h
            .transport
            .published()
            .into_iter()
            .find(|m| m.topic == "stream/010203040506/rpcout")
            .unwrap();
        let v: serde_json::Value = serde_json::from_slice(&rssi.payload).unwrap();
        assert_eq!(v["method"], "sensor-data");

        shutdown.cancel();
        assert_eq!(task.await.unwrap(), None);
        assert!(!h.transport.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_waits_for_a_token() {
        let mut h = harness();
        h.runtime.broker.health_check(&h.runtime.oauth).await;
        h.runtime.queue.clear();
        h.ctx.update_session(|s| s.access_token.clear());

        h.runtime.telemetry_tick();
        assert_eq!(h.runtime.telemetry.pending_len(), 0);
        assert!(h.runtime.queue.is_empty());
        assert_eq!(h.runtime.telemetry.last_sent(RSSI_PARAMETER), None);
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_pauses_during_update() {
        let mut h = harness();
        h.runtime.broker.health_check(&h.runtime.oauth).await;
        h.runtime.queue.clear();
        assert!(h.ctx.begin_update());

        h.runtime.telemetry_tick();
        assert!(h.runtime.queue.is_empty());
        assert_eq!(h.runtime.telemetry.last_sent(RSSI_PARAMETER), None);

        h.ctx.end_update();
        h.runtime.telemetry_tick();
        assert_eq!(h.runtime.queue.len(), 1);
        assert_eq!(h.runtime.telemetry.last_sent(RSSI_PARAMETER), Some(-61.0));
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_is_held_while_broker_is_down() {
        let mut h = harness();
        h.transport.fail_connects(1);
        h.runtime.broker.health_check(&h.runtime.oauth).await;
        assert_eq!(h.runtime.broker.state(), BrokerState::Disconnected);

        h.runtime.telemetry_tick();
        assert!(h.runtime.queue.is_empty());
        assert_eq!(h.runtime.telemetry.pending_len(), 1);
        assert_eq!(h.runtime.telemetry.last_sent(RSSI_PARAMETER), None);

        h.runtime.broker.health_check(&h.runtime.oauth).await;
        h.runtime.queue.clear();
        h.runtime.telemetry_tick();
        let msg = h.runtime.queue.dequeue().unwrap();
        assert_eq!(msg.topic, "stream/010203040506/rpcout");
        assert_eq!(h.runtime.telemetry.last_sent(RSSI_PARAMETER), Some(-61.0));
    }

    #[tokio::test(start_paused = true)]
    async fn reboot_command_ends_the_loop() {
        let h = harness();
        h.transport.push_inbound("command/010203040506/reboot", b"");
        let reason = h.runtime.run(CancellationToken::new()).await;
        assert_eq!(reason, Some(RestartReason::RebootCommand));
    }

    #[tokio::test(start_paused = true)]
    async fn upgrade_without_new_image_releases_the_flag() {
        let h = harness();
        h.http.respond_body(304, Vec::new());
        h.transport.push_inbound("command/010203040506/upgrade", b"https://fw/app.bin");

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(h.runtime.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(h.http.requests().iter().any(|r| r.url == "https://fw/app.bin"));
        assert!(!h.ctx.update_in_flight());
        assert_eq!(h.ctx.restart_reason(), None);

        shutdown.cancel();
        task.await.unwrap();
    }
}
