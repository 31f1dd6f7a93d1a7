//! Broker session: reconnect policy, command subscriptions and dispatch
//!
//! [`BrokerManager`] is owned by the management loop and is the only
//! writer of [`ConnectionState`](crate::context::ConnectionState).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devlink_mcu::ALL_NAMESPACES;
use devlink_proto::topics::CommandTopic;
use log::*;
use tokio::time::Instant;

use crate::clock;
use crate::commands::CommandRegistry;
use crate::context::{DeviceContext, RestartReason};
use crate::error::TransportError;
use crate::oauth::OAuthManager;
use crate::ota::UpdateRequest;
use crate::queue::{OutboundMessage, OutboundQueue, QoS};
use crate::wifi::WifiLink;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// As stored in `mqttUrl`
    pub url: String,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub keep_alive: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// A broker client connection
///
/// Sessions are not persistent: after every `connect` all subscriptions
/// have to be made again.
#[async_trait]
pub trait BrokerTransport: Send {
    /// Connect and wait for the broker to accept the session
    async fn connect(&mut self, options: &ConnectOptions) -> Result<(), TransportError>;

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    async fn publish(&mut self, message: &OutboundMessage) -> Result<(), TransportError>;

    /// Next inbound publish, waiting at most `wait`; an error means the session is gone
    async fn poll(&mut self, wait: Duration) -> Result<Option<InboundMessage>, TransportError>;

    fn is_connected(&self) -> bool;

    async fn disconnect(&mut self);

    /// Drop the TLS context so the next `connect` builds a fresh one
    fn reset_secure_context(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrokerState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// QoS each command topic is subscribed with
fn command_qos(topic: CommandTopic) -> QoS {
    match topic {
        CommandTopic::Time => QoS::ExactlyOnce,
        CommandTopic::Upgrade | CommandTopic::Reboot | CommandTopic::Reset | CommandTopic::Rpc => QoS::AtLeastOnce,
    }
}

pub struct BrokerManager {
    ctx: Arc<DeviceContext>,
    transport: Box<dyn BrokerTransport>,
    queue: Arc<OutboundQueue>,
    wifi: WifiLink,
    commands: CommandRegistry,
    routes: BTreeMap<String, CommandTopic>,
    state: BrokerState,
    down_since: Option<Instant>,
}

impl BrokerManager {
    pub fn new<T: BrokerTransport + 'static>(
        ctx: Arc<DeviceContext>,
        transport: T,
        queue: Arc<OutboundQueue>,
        wifi: WifiLink,
        commands: CommandRegistry,
    ) -> Self {
        let routes = CommandTopic::ALL
            .into_iter()
            .map(|t| (ctx.topics().command(t), t))
            .collect();
        Self {
            ctx,
            transport: Box::new(transport),
            queue,
            wifi,
            commands,
            routes,
            state: BrokerState::Disconnected,
            down_since: None,
        }
    }

    pub fn state(&self) -> BrokerState {
        self.state
    }

    /// Handlers behind `command/<id>/rpc`
    pub fn commands_mut(&mut self) -> &mut CommandRegistry {
        &mut self.commands
    }

    fn set_state(&mut self, state: BrokerState) {
        if self.state != state {
            debug!("Broker {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        let up = state == BrokerState::Connected;
        self.ctx.update_connection(|c| c.broker_up = up);
    }

    /// Copy the station status into the shared connection state
    pub fn observe_wifi(&self) -> bool {
        let up = self.wifi.is_connected();
        self.ctx.update_connection(|c| {
            if c.wifi_up != up {
                info!("WiFi {}", if up { "up" } else { "down" });
            }
            c.wifi_up = up;
        });
        up
    }

    /// Periodic check: reconnect when the session is gone
    ///
    /// Skipped without an access token or while an update is running. After
    /// `refresh_after_failures` failed connects the token is refreshed once
    /// before the next try.
    pub async fn health_check(&mut self, oauth: &OAuthManager) {
        self.ctx.update_connection(|c| c.last_health_check_at = Some(Instant::now()));
        let wifi_up = self.observe_wifi();

        if self.ctx.update_in_flight() || !self.ctx.session().is_authenticated() {
            return;
        }
        if self.state == BrokerState::Connected && self.transport.is_connected() {
            return;
        }
        self.set_state(BrokerState::Disconnected);
        if !wifi_up {
            return;
        }

        let failures = self.ctx.connection().consecutive_reconnect_failures;
        if failures >= self.ctx.config().refresh_after_failures {
            info!("{} failed reconnects, refreshing token first", failures);
            match oauth.refresh_now().await {
                Ok(_) => self.ctx.update_connection(|c| c.consecutive_reconnect_failures = 0),
                Err(e) => warn!("Token refresh before reconnect failed: {}", e),
            }
        }

        info!("Broker disconnected, reconnecting...");
        match self.connect().await {
            Ok(()) => {
                info!("Broker connected");
                self.ctx.update_connection(|c| c.consecutive_reconnect_failures = 0);
            }
            Err(e) => {
                warn!("Broker connect failed: {}", e);
                self.transport.disconnect().await;
                self.set_state(BrokerState::Disconnected);
                self.ctx.update_connection(|c| c.consecutive_reconnect_failures += 1);
            }
        }
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let endpoints = self.ctx.endpoints();
        if endpoints.mqtt_url.is_empty() {
            return Err(TransportError::EmptyUrl);
        }
        let config = self.ctx.config();
        let options = ConnectOptions {
            url: endpoints.mqtt_url,
            client_id: format!("{}{}", config.client_id_prefix, self.ctx.topics().device_id()),
            username: config.broker_username.clone(),
            password: self.ctx.session().access_token,
            keep_alive: config.keep_alive(),
        };

        self.set_state(BrokerState::Connecting);
        self.transport.connect(&options).await?;

        let version = OutboundMessage::new(self.ctx.topics().version(), self.ctx.identity().firmware_version.as_str());
        self.queue.enqueue(version);

        for (topic, command) in &self.routes {
            self.transport.subscribe(topic, command_qos(*command)).await?;
        }
        self.set_state(BrokerState::Connected);
        Ok(())
    }

    /// Tear everything down when WiFi or the broker stayed down too long
    ///
    /// Broker downtime only counts once there is a token to connect with.
    /// Nothing is counted while an update is running.
    /// Returns whether a teardown happened.
    pub async fn watchdog(&mut self) -> bool {
        if self.ctx.update_in_flight() {
            self.down_since = None;
            return false;
        }
        let wifi_up = self.observe_wifi();
        let broker_expected = self.ctx.session().is_authenticated();
        let healthy = wifi_up && (self.state == BrokerState::Connected || !broker_expected);

        if healthy {
            self.down_since = None;
            return false;
        }
        let since = *self.down_since.get_or_insert_with(Instant::now);
        let threshold = self.ctx.config().watchdog_threshold();
        if since.elapsed() <= threshold {
            return false;
        }

        warn!("WiFi or broker down for more than {:?}, reinitializing", threshold);
        self.transport.disconnect().await;
        self.transport.reset_secure_context();
        self.set_state(BrokerState::Disconnected);

        if let Err(e) = self.wifi.reinitialize(self.ctx.prefs()).await {
            warn!("WiFi reinitialization failed: {}", e);
        }
        self.observe_wifi();
        self.down_since = Some(Instant::now());
        true
    }

    async fn on_transport_error(&mut self, e: TransportError) {
        warn!("Broker session lost: {}", e);
        self.transport.disconnect().await;
        self.set_state(BrokerState::Disconnected);
    }

    /// Publish the oldest queued message; a failed publish goes back to the tail
    pub async fn drain_one(&mut self) -> bool {
        if self.state != BrokerState::Connected || self.ctx.update_in_flight() {
            return false;
        }
        let Some(message) = self.queue.dequeue() else {
            return false;
        };
        match self.transport.publish(&message).await {
            Ok(()) => {
                debug!("Published {} ({} bytes)", message.topic, message.payload.len());
                true
            }
            Err(e) => {
                self.queue.requeue(message);
                self.on_transport_error(e).await;
                false
            }
        }
    }

    /// Wait up to `wait` for an inbound message
    pub async fn poll(&mut self, wait: Duration) -> Option<InboundMessage> {
        if self.state != BrokerState::Connected {
            tokio::time::sleep(wait).await;
            return None;
        }
        match self.transport.poll(wait).await {
            Ok(msg) => msg,
            Err(e) => {
                self.on_transport_error(e).await;
                None
            }
        }
    }

    /// Route an inbound message; an upgrade request is handed back to the caller
    pub fn dispatch(&mut self, msg: InboundMessage) -> Option<UpdateRequest> {
        let Some(command) = self.routes.get(&msg.topic).copied() else {
            debug!("No route for {}", msg.topic);
            return None;
        };
        info!("Command {:?} received", command);

        match command {
            CommandTopic::Upgrade => match UpdateRequest::parse(&msg.payload) {
                Ok(req) => return Some(req),
                Err(e) => warn!("Invalid upgrade payload: {}", e),
            },
            CommandTopic::Reboot => self.restart_after_grace(RestartReason::RebootCommand),
            CommandTopic::Reset => {
                if let Err(e) = self.ctx.prefs().clear_all(&ALL_NAMESPACES) {
                    error!("Factory reset could not clear storage: {}", e);
                }
                self.restart_after_grace(RestartReason::FactoryReset);
            }
            CommandTopic::Time => self.handle_time(&msg.payload),
            CommandTopic::Rpc => {
                let device_id = self.ctx.topics().device_id().to_string();
                if let Some(reply) = self.commands.handle(&device_id, &msg.payload) {
                    self.queue
                        .enqueue(OutboundMessage::new(self.ctx.topics().rpc_out(), reply.to_bytes()));
                }
            }
        }
        None
    }

    fn handle_time(&self, payload: &[u8]) {
        self.queue
            .enqueue(OutboundMessage::new(self.ctx.topics().time_echo(), payload.to_vec()));

        let text = String::from_utf8_lossy(payload);
        if let Ok(unix_time) = text.trim().parse::<u64>() {
            if unix_time > 0 {
                if let Err(e) = clock::save_snapshot(self.ctx.prefs(), unix_time, self.ctx.uptime()) {
                    warn!("Failed to save time snapshot: {}", e);
                }
            }
        }
    }

    fn restart_after_grace(&self, reason: RestartReason) {
        let ctx = self.ctx.clone();
        let grace = ctx.config().reboot_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            ctx.request_restart(reason);
        });
    }

    pub async fn shutdown(&mut self) {
        self.transport.disconnect().await;
        self.set_state(BrokerState::Disconnected);
    }
}
