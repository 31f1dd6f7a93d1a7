//! Provisioning channel: JSON commands from the companion app
//!
//! Every message gets exactly one response on the same link, except
//! malformed input, which is logged and dropped. Losing the companion
//! mid-session restarts the device.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devlink_mcu::{BleEvent, BleServer, WifiCredentials};
use devlink_proto::async_io::{read_frame, write_frame};
use devlink_proto::ble::commands;
use devlink_proto::{Frame, MSG_COMMAND, ProvisionRequest, ProvisionResponse, ServerData, TokenData};
use log::*;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;

use crate::context::{DeviceContext, RestartReason};
use crate::error::ProtocolError;
use crate::wifi::{WifiLink, save_credentials};

/// Bidirectional message link to the companion app
#[async_trait]
pub trait ProvisioningLink: Send {
    /// Next link event; `None` once the link is gone for good
    async fn next_event(&mut self) -> Option<BleEvent>;

    /// Send one response
    async fn send(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Length-prefixed frames over any byte stream
///
/// Used on hosts in place of BLE, and in tests over `tokio::io::duplex`.
pub struct FramedLink<T> {
    io: T,
    announced: bool,
    closed: bool,
}

impl<T> FramedLink<T> {
    pub fn new(io: T) -> Self {
        Self { io, announced: false, closed: false }
    }
}

#[async_trait]
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProvisioningLink for FramedLink<T> {
    async fn next_event(&mut self) -> Option<BleEvent> {
        if self.closed {
            return None;
        }
        if !self.announced {
            self.announced = true;
            return Some(BleEvent::Connected);
        }
        loop {
            match read_frame(&mut self.io).await {
                Ok(frame) if frame.msg_type == MSG_COMMAND => return Some(BleEvent::Data(frame.payload)),
                Ok(frame) => warn!("Ignoring frame type {:#06x}", frame.msg_type),
                Err(e) => {
                    if e.kind() != io::ErrorKind::UnexpectedEof {
                        warn!("Provisioning link error: {}", e);
                    }
                    self.closed = true;
                    return Some(BleEvent::Disconnected);
                }
            }
        }
    }

    async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let frame = Frame::new(devlink_proto::MSG_RESPONSE, data.to_vec());
        write_frame(&mut self.io, &frame).await
    }
}

/// Async adapter over a polled [`BleServer`]
pub struct PolledBleLink<B> {
    server: B,
    interval: Duration,
}

impl<B: BleServer> PolledBleLink<B> {
    /// Starts advertising under the provisioning device name
    pub fn start(mut server: B, interval: Duration) -> io::Result<Self> {
        server
            .start_advertising(devlink_proto::ble::DEVICE_NAME)
            .map_err(|e| io::Error::other(e.to_string()))?;
        info!("BLE advertising as {}", devlink_proto::ble::DEVICE_NAME);
        Ok(Self { server, interval })
    }
}

#[async_trait]
impl<B: BleServer + Send> ProvisioningLink for PolledBleLink<B> {
    async fn next_event(&mut self) -> Option<BleEvent> {
        loop {
            if let Some(event) = self.server.poll_event() {
                return Some(event);
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.server.notify(data).map_err(|e| io::Error::other(e.to_string()))
    }
}

/// Answers provisioning commands
#[derive(Clone)]
pub struct ProvisioningHandler {
    ctx: Arc<DeviceContext>,
    wifi: WifiLink,
}

impl ProvisioningHandler {
    pub fn new(ctx: Arc<DeviceContext>, wifi: WifiLink) -> Self {
        Self { ctx, wifi }
    }

    /// Handle one raw message; `None` means nothing is sent back
    pub async fn handle_message(&self, data: &[u8]) -> Option<ProvisionResponse> {
        match self.parse(data) {
            Ok(Message::Json(req)) => Some(self.handle_command(req, data.len()).await),
            Ok(Message::Legacy(text)) => Some(self.handle_legacy(&text, data.len()).await),
            Err(e) => {
                warn!("Dropping provisioning message: {}", e);
                None
            }
        }
    }

    fn parse(&self, data: &[u8]) -> Result<Message, ProtocolError> {
        let text = String::from_utf8_lossy(data);
        let trimmed = text.trim();

        if trimmed.starts_with('{') {
            let value: serde_json::Value = serde_json::from_str(trimmed)?;
            if !value.get("command").is_some_and(|c| c.is_string()) {
                info!("Unknown JSON format");
                return Err(ProtocolError::MissingCommand);
            }
            return Ok(Message::Json(serde_json::from_value(value)?));
        }

        if trimmed.contains(':') {
            return Ok(Message::Legacy(trimmed.to_string()));
        }

        Err(ProtocolError::UnknownFormat)
    }

    pub async fn handle_command(&self, req: ProvisionRequest, byte_received: usize) -> ProvisionResponse {
        info!("Command received: {}", req.command);

        match req.command.as_str() {
            commands::SERVER_DATA => self.server_data(&req, byte_received),
            commands::GET_TOKEN => self.get_token(byte_received).await,
            commands::CHECK_AUTH => self.check_auth(byte_received).await,
            other => ProvisionResponse::err(other, byte_received, "Unknown command"),
        }
    }

    fn server_data(&self, req: &ProvisionRequest, byte_received: usize) -> ProvisionResponse {
        let cmd = commands::SERVER_DATA;
        let data: ServerData = match serde_json::from_value(req.data.clone()) {
            Ok(d) => d,
            Err(e) => return ProvisionResponse::err(cmd, byte_received, format!("Invalid data: {}", e)),
        };
        if let Some(field) = data.missing_field() {
            return ProvisionResponse::err(cmd, byte_received, format!("Missing {}", field));
        }

        let endpoints = self.ctx.update_endpoints(|e| e.merge(&data));
        match endpoints.persist(self.ctx.prefs()) {
            Ok(written) => {
                info!("Server data stored ({} field(s) changed)", written);
                ProvisionResponse::ok(cmd, byte_received)
            }
            Err(e) => {
                error!("Failed to store server data: {}", e);
                ProvisionResponse::err(cmd, byte_received, "Failed to store server data")
            }
        }
    }

    async fn get_token(&self, byte_received: usize) -> ProvisionResponse {
        let cmd = commands::GET_TOKEN;
        let mut rx = self.ctx.watch_session();
        let wait = self.ctx.config().provisioning_wait();

        let ready = matches!(timeout(wait, rx.wait_for(|s| s.has_pairing_code())).await, Ok(Ok(_)));
        if !ready {
            return ProvisionResponse::err(cmd, byte_received, "Timeout waiting for data!");
        }

        let session = self.ctx.session();
        let identity = self.ctx.identity();
        ProvisionResponse::ok(cmd, byte_received).with_data(TokenData {
            chip_id: identity.chip_id(),
            mac_address: identity.mac_address(),
            user_code: session.user_code,
            verification_uri: session.verification_url,
            model_code: identity.model_code.clone(),
            vendor_code: identity.vendor_code.clone(),
            version_code: identity.firmware_version.clone(),
            hw_code: identity.hw_code.clone(),
        })
    }

    async fn check_auth(&self, byte_received: usize) -> ProvisionResponse {
        let cmd = commands::CHECK_AUTH;
        let mut rx = self.ctx.watch_session();
        let wait = self.ctx.config().provisioning_wait();

        let ready = matches!(timeout(wait, rx.wait_for(|s| s.is_authenticated())).await, Ok(Ok(_)));
        if !ready {
            return ProvisionResponse::err(cmd, byte_received, "Timeout waiting for access token!");
        }

        self.ctx.request_broker_init();
        ProvisionResponse::ok(cmd, byte_received)
    }

    async fn handle_legacy(&self, text: &str, byte_received: usize) -> ProvisionResponse {
        let cmd = commands::LEGACY_WIFI_REPLY;
        let credentials = match WifiCredentials::parse_legacy(text) {
            Some(Ok(c)) => c,
            Some(Err(e)) => return ProvisionResponse::err(cmd, byte_received, e.to_string()),
            None => return ProvisionResponse::err(cmd, byte_received, "Invalid credentials"),
        };

        if let Err(e) = save_credentials(self.ctx.prefs(), &credentials) {
            error!("Failed to save WiFi credentials: {}", e);
        }

        match self.wifi.connect(&credentials).await {
            Ok(()) => ProvisionResponse::ok(cmd, byte_received),
            Err(_) => ProvisionResponse::err(cmd, byte_received, "Failed to connect to WiFi"),
        }
    }

    /// Serve one companion session; returns once the link is gone
    ///
    /// A disconnect after a companion connected requests a restart.
    pub async fn serve<L: ProvisioningLink>(&self, mut link: L) {
        let mut connected = false;
        while let Some(event) = link.next_event().await {
            match event {
                BleEvent::Connected => {
                    info!("Companion connected");
                    connected = true;
                }
                BleEvent::Data(data) => {
                    debug!("Provisioning message: {}", String::from_utf8_lossy(&data));
                    let Some(response) = self.handle_message(&data).await else {
                        continue;
                    };
                    if let Err(e) = link.send(&response.to_bytes()).await {
                        warn!("Failed to send provisioning response: {}", e);
                    }
                }
                BleEvent::Disconnected => {
                    info!("Companion disconnected");
                    if connected {
                        self.ctx.request_restart(RestartReason::ProvisioningDisconnected);
                    }
                    return;
                }
            }
        }
    }
}

enum Message {
    Json(ProvisionRequest),
    Legacy(String),
}
