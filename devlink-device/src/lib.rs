//! Devlink Device Library
//!
//! The connectivity core of a provisioned IoT device: pairing over a framed
//! link, OAuth device flow, a self-healing broker session with command
//! dispatch, resumable firmware updates and dead-banded telemetry.
//!
//! # Example
//!
//! ```ignore
//! use devlink_device::{Device, DeviceConfig, DeviceContext, ReqwestClient, MqttTransport, json};
//!
//! #[tokio::main]
//! async fn main() {
//!     let ctx = DeviceContext::load(identity, DeviceConfig::default(), prefs).unwrap();
//!     let mut device = Device::new(ctx, ReqwestClient::default(), wifi, MqttTransport::new(None), make_target);
//!
//!     // Answered on command/<chip-id>/rpc, replies on stream/<chip-id>/rpcout
//!     device.command("relay/get", |_ctx, _params| Ok(json!({ "on": false })));
//!
//!     device.telemetry().submit("sensor-data", "t0", 21.5);
//!
//!     let reason = device.run(tokio_util::sync::CancellationToken::new()).await;
//!     println!("restart: {:?}", reason);
//! }
//! ```

pub mod broker;
pub mod clock;
pub mod commands;
pub mod config;
pub mod context;
pub mod error;
pub mod http;
pub mod identity;
pub mod mqtt;
pub mod oauth;
pub mod ota;
pub mod provisioning;
pub mod queue;
pub mod runtime;
pub mod store;
pub mod telemetry;
pub mod wifi;

#[cfg(test)]
pub(crate) mod testing;

pub use broker::{BrokerManager, BrokerState, BrokerTransport, ConnectOptions, InboundMessage};
pub use commands::{CommandContext, CommandHandler, CommandRegistry};
pub use config::{DeviceConfig, devlink_home};
pub use context::{ConnectionState, DeviceContext, EndpointConfig, OAuthSession, RestartReason};
pub use error::{AuthError, DeviceError, ProtocolError, Result, StorageError, TransportError};
pub use http::{HttpClient, HttpResponse, ReqwestClient};
pub use identity::{DeviceIdentity, load_or_create_mac};
pub use mqtt::{BrokerEndpoint, MqttTransport, parse_broker_url};
pub use oauth::OAuthManager;
pub use ota::{FileFirmware, OtaPhase, OtaState, UpdateManager, UpdateOutcome, UpdateRequest};
pub use provisioning::{FramedLink, PolledBleLink, ProvisioningHandler, ProvisioningLink};
pub use queue::{OutboundMessage, OutboundQueue, QoS};
pub use serde_json::{Value as JsonValue, json};
pub use store::{FileStorage, MemoryStorage, Preferences};
pub use telemetry::TelemetryAggregator;
pub use tokio_util::sync::CancellationToken;
pub use wifi::WifiLink;

use std::sync::Arc;

use devlink_mcu::{ALL_NAMESPACES, FirmwareTarget, Wifi};
use log::*;

use crate::runtime::{Runtime, UpdaterFactory};

/// Cloneable handle for code running beside the management loop
#[derive(Clone)]
pub struct DeviceHandle {
    ctx: Arc<DeviceContext>,
    telemetry: Arc<TelemetryAggregator>,
    aux: CancellationToken,
}

impl DeviceHandle {
    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    pub fn telemetry(&self) -> &Arc<TelemetryAggregator> {
        &self.telemetry
    }

    /// Token for a task that must stop on factory reset or shutdown
    pub fn aux_token(&self) -> CancellationToken {
        self.aux.child_token()
    }

    /// Pairing/reset sequence: stop auxiliary tasks, erase every namespace,
    /// then ask for a restart
    pub fn factory_reset(&self) -> Result<()> {
        warn!("Factory reset");
        self.aux.cancel();
        self.ctx.prefs().clear_all(&ALL_NAMESPACES)?;
        self.ctx.request_restart(RestartReason::FactoryReset);
        Ok(())
    }
}

/// A device wired to its platform: Wi-Fi driver, broker transport and
/// firmware partition
pub struct Device {
    ctx: Arc<DeviceContext>,
    http: Arc<dyn HttpClient>,
    wifi: WifiLink,
    broker: BrokerManager,
    queue: Arc<OutboundQueue>,
    telemetry: Arc<TelemetryAggregator>,
    updater: UpdaterFactory,
    aux: CancellationToken,
}

impl Device {
    /// `make_target` is called once per upgrade command
    pub fn new<H, W, T, F, M>(ctx: DeviceContext, http: H, wifi: W, transport: T, make_target: M) -> Self
    where
        H: HttpClient + 'static,
        W: Wifi + Send + 'static,
        T: BrokerTransport + 'static,
        F: FirmwareTarget + Send + 'static,
        M: Fn() -> F + Send + Sync + 'static,
    {
        let ctx = Arc::new(ctx);
        let config = ctx.config().clone();
        let http: Arc<dyn HttpClient> = Arc::new(http);

        let wifi = WifiLink::new(wifi, config.wifi_join_retries, config.wifi_join_backoff());
        let queue = Arc::new(OutboundQueue::new(config.queue_capacity));
        let telemetry = Arc::new(TelemetryAggregator::new(ctx.topics().rpc_out()));
        let broker = BrokerManager::new(ctx.clone(), transport, queue.clone(), wifi.clone(), CommandRegistry::new());

        let updater_http = http.clone();
        let updater: UpdaterFactory = Box::new(move || UpdateManager::new(updater_http.clone(), make_target(), &config));

        Self {
            ctx,
            http,
            wifi,
            broker,
            queue,
            telemetry,
            updater,
            aux: CancellationToken::new(),
        }
    }

    /// Chip id used in topics and the broker client id
    pub fn id(&self) -> &str {
        self.ctx.topics().device_id()
    }

    /// Register a command handler, reachable through JSON-RPC
    pub fn command<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&CommandContext, JsonValue) -> std::result::Result<JsonValue, String> + Send + Sync + 'static,
    {
        self.broker.commands_mut().register(name, handler);
    }

    pub fn telemetry(&self) -> &Arc<TelemetryAggregator> {
        &self.telemetry
    }

    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    /// Handler for the pairing link; serve it on every companion connection
    pub fn provisioning(&self) -> ProvisioningHandler {
        ProvisioningHandler::new(self.ctx.clone(), self.wifi.clone())
    }

    pub fn handle(&self) -> DeviceHandle {
        DeviceHandle {
            ctx: self.ctx.clone(),
            telemetry: self.telemetry.clone(),
            aux: self.aux.clone(),
        }
    }

    pub fn factory_reset(&self) -> Result<()> {
        self.handle().factory_reset()
    }

    /// Run the management loop until a restart is due or `shutdown` fires
    ///
    /// Returns the restart reason; the platform performs the restart. `None`
    /// means the loop was shut down.
    pub async fn run(self, shutdown: CancellationToken) -> Option<RestartReason> {
        let oauth = OAuthManager::new(self.ctx.clone(), self.http.clone());
        let runtime = Runtime {
            ctx: self.ctx,
            http: self.http,
            wifi: self.wifi,
            broker: self.broker,
            oauth,
            queue: self.queue,
            telemetry: self.telemetry,
            updater: self.updater,
            aux: self.aux,
            config_fetched: false,
        };
        runtime.run(shutdown).await
    }
}
