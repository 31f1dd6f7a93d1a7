//! In-memory stand-ins for every platform and network seam

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use devlink_mcu::{FirmwareTarget, Wifi, WifiCredentials, WifiStatus};
use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};

use crate::broker::{BrokerTransport, ConnectOptions, InboundMessage};
use crate::config::DeviceConfig;
use crate::context::{DeviceContext, EndpointConfig, OAuthSession};
use crate::error::TransportError;
use crate::http::{HttpClient, HttpResponse};
use crate::identity::DeviceIdentity;
use crate::queue::{OutboundMessage, QoS};
use crate::store::{MemoryStorage, Preferences};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Fresh context with default config, chip id `010203040506` and empty storage
pub(crate) fn test_context() -> DeviceContext {
    let config = DeviceConfig::default();
    let identity = DeviceIdentity::new([1, 2, 3, 4, 5, 6], &config);
    DeviceContext::with_state(
        identity,
        config,
        Preferences::new(MemoryStorage::new()),
        EndpointConfig::default(),
        OAuthSession::default(),
    )
}

// --- http

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Req {
    pub url: String,
    pub form: Vec<(String, String)>,
    pub range_from: Option<u64>,
}

struct Canned {
    status: u16,
    content_length: Option<u64>,
    body: Vec<u8>,
    /// Body ends with an error after this many bytes
    cut_at: Option<usize>,
}

#[derive(Default)]
struct HttpInner {
    responses: VecDeque<Canned>,
    requests: Vec<Req>,
}

/// Replays queued responses in order; an empty queue answers with an error
#[derive(Clone, Default)]
pub(crate) struct FakeHttp {
    inner: Arc<Mutex<HttpInner>>,
}

impl FakeHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond_json(&self, status: u16, body: serde_json::Value) {
        self.respond_body(status, serde_json::to_vec(&body).unwrap());
    }

    pub fn respond_body(&self, status: u16, body: Vec<u8>) {
        let content_length = Some(body.len() as u64);
        lock(&self.inner).responses.push_back(Canned { status, content_length, body, cut_at: None });
    }

    /// Announce the whole body but drop the connection after `cut_at` bytes
    pub fn respond_cut(&self, status: u16, body: Vec<u8>, cut_at: usize) {
        let content_length = Some(body.len() as u64);
        lock(&self.inner)
            .responses
            .push_back(Canned { status, content_length, body, cut_at: Some(cut_at) });
    }

    pub fn requests(&self) -> Vec<Req> {
        lock(&self.inner).requests.clone()
    }

    fn answer(&self, req: Req) -> Result<HttpResponse, TransportError> {
        let mut inner = lock(&self.inner);
        let url = req.url.clone();
        inner.requests.push(req);
        let Some(canned) = inner.responses.pop_front() else {
            return Err(TransportError::Timeout { url, timeout: Duration::from_secs(30) });
        };

        let end = canned.cut_at.unwrap_or(canned.body.len()).min(canned.body.len());
        let mut chunks: Vec<Result<Vec<u8>, TransportError>> =
            canned.body[..end].chunks(512).map(|c| Ok(c.to_vec())).collect();
        if canned.cut_at.is_some() {
            chunks.push(Err(TransportError::Timeout { url, timeout: Duration::from_secs(30) }));
        }

        Ok(HttpResponse {
            status: canned.status,
            content_length: canned.content_length,
            body: stream::iter(chunks).boxed(),
        })
    }
}

#[async_trait]
impl HttpClient for FakeHttp {
    async fn post_form(&self, url: &str, form: &[(&str, &str)]) -> Result<HttpResponse, TransportError> {
        self.answer(Req {
            url: url.to_string(),
            form: form.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            range_from: None,
        })
    }

    async fn get(&self, url: &str, range_from: Option<u64>, _timeout: Duration) -> Result<HttpResponse, TransportError> {
        self.answer(Req { url: url.to_string(), form: Vec::new(), range_from })
    }
}

// --- wifi

struct WifiInner {
    joins: bool,
    status: WifiStatus,
    joined: Option<String>,
}

/// Station that comes up on `connect` unless told otherwise
#[derive(Clone)]
pub(crate) struct FakeWifi {
    inner: Arc<Mutex<WifiInner>>,
}

impl FakeWifi {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(WifiInner { joins: true, status: WifiStatus::Disconnected, joined: None })),
        }
    }

    /// Already associated
    pub fn connected() -> Self {
        let wifi = Self::new();
        lock(&wifi.inner).status = WifiStatus::Connected;
        wifi
    }

    pub fn set_joins(&self, joins: bool) {
        lock(&self.inner).joins = joins;
    }

    pub fn drop_link(&self) {
        lock(&self.inner).status = WifiStatus::Disconnected;
    }

    /// SSID of the last connect call
    pub fn joined(&self) -> Option<String> {
        lock(&self.inner).joined.clone()
    }
}

impl Wifi for FakeWifi {
    type Error = String;

    fn connect(&mut self, credentials: &WifiCredentials) -> Result<(), String> {
        let mut inner = lock(&self.inner);
        inner.joined = Some(credentials.ssid.to_string());
        inner.status = if inner.joins { WifiStatus::Connected } else { WifiStatus::Connecting };
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), String> {
        lock(&self.inner).status = WifiStatus::Disconnected;
        Ok(())
    }

    fn status(&self) -> WifiStatus {
        lock(&self.inner).status
    }

    fn rssi(&self) -> Option<i8> {
        (lock(&self.inner).status == WifiStatus::Connected).then_some(-61)
    }
}

// --- broker

#[derive(Default)]
struct TransportInner {
    connected: bool,
    fail_connects: usize,
    fail_publishes: usize,
    fail_subscribes: usize,
    connects: Vec<ConnectOptions>,
    subscriptions: Vec<(String, QoS)>,
    published: Vec<OutboundMessage>,
    inbound: VecDeque<InboundMessage>,
    resets: usize,
}

#[derive(Clone, Default)]
pub(crate) struct FakeTransport {
    inner: Arc<Mutex<TransportInner>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_connects(&self, n: usize) {
        lock(&self.inner).fail_connects = n;
    }

    pub fn fail_publishes(&self, n: usize) {
        lock(&self.inner).fail_publishes = n;
    }

    pub fn fail_subscribes(&self, n: usize) {
        lock(&self.inner).fail_subscribes = n;
    }

    pub fn drop_connection(&self) {
        lock(&self.inner).connected = false;
    }

    pub fn push_inbound(&self, topic: &str, payload: &[u8]) {
        lock(&self.inner)
            .inbound
            .push_back(InboundMessage { topic: topic.to_string(), payload: payload.to_vec() });
    }

    pub fn connects(&self) -> Vec<ConnectOptions> {
        lock(&self.inner).connects.clone()
    }

    pub fn subscriptions(&self) -> Vec<(String, QoS)> {
        lock(&self.inner).subscriptions.clone()
    }

    pub fn published(&self) -> Vec<OutboundMessage> {
        lock(&self.inner).published.clone()
    }

    pub fn resets(&self) -> usize {
        lock(&self.inner).resets
    }
}

#[async_trait]
impl BrokerTransport for FakeTransport {
    async fn connect(&mut self, options: &ConnectOptions) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        inner.connects.push(options.clone());
        if inner.fail_connects > 0 {
            inner.fail_connects -= 1;
            return Err(TransportError::Broker("connection refused".to_string()));
        }
        inner.connected = true;
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        if inner.fail_subscribes > 0 {
            inner.fail_subscribes -= 1;
            return Err(TransportError::Broker("subscribe failed".to_string()));
        }
        inner.subscriptions.push((topic.to_string(), qos));
        Ok(())
    }

    async fn publish(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        if inner.fail_publishes > 0 {
            inner.fail_publishes -= 1;
            return Err(TransportError::Broker("publish failed".to_string()));
        }
        inner.published.push(message.clone());
        Ok(())
    }

    async fn poll(&mut self, wait: Duration) -> Result<Option<InboundMessage>, TransportError> {
        let next = {
            let mut inner = lock(&self.inner);
            if !inner.connected {
                return Err(TransportError::NotConnected);
            }
            inner.inbound.pop_front()
        };
        if next.is_none() {
            tokio::time::sleep(wait).await;
        }
        Ok(next)
    }

    fn is_connected(&self) -> bool {
        lock(&self.inner).connected
    }

    async fn disconnect(&mut self) {
        lock(&self.inner).connected = false;
    }

    fn reset_secure_context(&mut self) {
        lock(&self.inner).resets += 1;
    }
}

// --- firmware

#[derive(Default)]
struct TargetInner {
    capacity: Option<u64>,
    data: Vec<u8>,
    short_write: Option<(usize, usize)>,
    over_report: Option<(usize, usize)>,
    finalized: bool,
}

/// Flash partition in memory
#[derive(Clone, Default)]
pub(crate) struct FakeTarget {
    inner: Arc<Mutex<TargetInner>>,
}

impl FakeTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: u64) -> Self {
        let target = Self::new();
        lock(&target.inner).capacity = Some(capacity);
        target
    }

    /// Bytes already on flash from an earlier attempt
    pub fn preload(&self, bytes: &[u8]) {
        lock(&self.inner).data.extend_from_slice(bytes);
    }

    /// The write starting at `offset` only stores `n` bytes, once
    pub fn short_write_once(&self, offset: usize, n: usize) {
        lock(&self.inner).short_write = Some((offset, n));
    }

    /// The write starting at `offset` stores everything but reports `n`, once
    pub fn over_report_once(&self, offset: usize, n: usize) {
        lock(&self.inner).over_report = Some((offset, n));
    }

    pub fn data(&self) -> Vec<u8> {
        lock(&self.inner).data.clone()
    }

    pub fn finalized(&self) -> bool {
        lock(&self.inner).finalized
    }
}

impl FirmwareTarget for FakeTarget {
    type Error = String;

    fn begin(&mut self, total_len: u64) -> Result<(), String> {
        let mut inner = lock(&self.inner);
        if inner.capacity.is_some_and(|c| total_len > c) {
            return Err(format!("{} bytes do not fit", total_len));
        }
        inner.data.clear();
        inner.finalized = false;
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<usize, String> {
        let mut inner = lock(&self.inner);
        if let Some((offset, reported)) = inner.over_report {
            if offset == inner.data.len() {
                inner.over_report = None;
                inner.data.extend_from_slice(chunk);
                return Ok(reported);
            }
        }
        let n = match inner.short_write {
            Some((offset, n)) if offset == inner.data.len() => {
                inner.short_write = None;
                n.min(chunk.len())
            }
            _ => chunk.len(),
        };
        inner.data.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    fn finalize(&mut self, sha256: Option<&[u8; 32]>) -> Result<(), String> {
        let mut inner = lock(&self.inner);
        if let Some(expected) = sha256 {
            let digest: [u8; 32] = Sha256::digest(&inner.data).into();
            if &digest != expected {
                return Err("sha256 mismatch".to_string());
            }
        }
        inner.finalized = true;
        Ok(())
    }

    fn abort(&mut self) {
        lock(&self.inner).data.clear();
    }
}
