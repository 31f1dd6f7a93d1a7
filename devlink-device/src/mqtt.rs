//! [`BrokerTransport`] over rumqttc

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use log::*;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, TlsConfiguration, Transport};

use crate::broker::{BrokerTransport, ConnectOptions, InboundMessage};
use crate::error::TransportError;
use crate::queue::{OutboundMessage, QoS};

/// Where and how to reach the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEndpoint {
    Tcp { host: String, port: u16 },
    Tls { host: String, port: u16 },
    Ws { url: String, port: u16 },
    Wss { url: String, port: u16 },
}

/// Accepts `wss://host/path`, `ws://`, `mqtts://host:port`, `mqtt://` (or
/// `tcp://`) and a bare `host[:port]`, which means TLS on 8883.
pub fn parse_broker_url(url: &str) -> Result<BrokerEndpoint, TransportError> {
    let url = url.trim();
    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
        None => ("mqtts".to_string(), url),
    };

    let authority = rest.split('/').next().unwrap_or_default();
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| TransportError::BrokerUrl(url.to_string()))?;
            (host, Some(port))
        }
        None => (authority, None),
    };
    if host.is_empty() {
        return Err(TransportError::BrokerUrl(url.to_string()));
    }

    let endpoint = match scheme.as_str() {
        "mqtt" | "tcp" => BrokerEndpoint::Tcp { host: host.to_string(), port: port.unwrap_or(1883) },
        "mqtts" | "ssl" => BrokerEndpoint::Tls { host: host.to_string(), port: port.unwrap_or(8883) },
        "ws" => BrokerEndpoint::Ws { url: url.to_string(), port: port.unwrap_or(80) },
        "wss" => BrokerEndpoint::Wss { url: url.to_string(), port: port.unwrap_or(443) },
        _ => return Err(TransportError::BrokerUrl(url.to_string())),
    };
    Ok(endpoint)
}

fn to_rumqttc(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

struct Session {
    client: AsyncClient,
    eventloop: EventLoop,
    connected: bool,
}

/// MQTT 3.1.1 client, over TLS or secure websockets
pub struct MqttTransport {
    ca_bundle: Option<PathBuf>,
    tls: Option<TlsConfiguration>,
    session: Option<Session>,
    connect_timeout: Duration,
}

impl MqttTransport {
    /// `ca_bundle` is a PEM file; the system roots are used without one
    pub fn new(ca_bundle: Option<PathBuf>) -> Self {
        Self { ca_bundle, tls: None, session: None, connect_timeout: Duration::from_secs(10) }
    }

    fn tls(&mut self) -> Result<Option<TlsConfiguration>, TransportError> {
        if self.tls.is_none() {
            if let Some(path) = &self.ca_bundle {
                let ca = std::fs::read(path)?;
                debug!("Loaded broker CA bundle from {}", path.display());
                self.tls = Some(TlsConfiguration::Simple { ca, alpn: None, client_auth: None });
            }
        }
        Ok(self.tls.clone())
    }

    fn options(&mut self, opts: &ConnectOptions) -> Result<MqttOptions, TransportError> {
        let endpoint = parse_broker_url(&opts.url)?;
        let tls = self.tls()?;

        let mut options = match &endpoint {
            BrokerEndpoint::Tcp { host, port } | BrokerEndpoint::Tls { host, port } => {
                MqttOptions::new(&opts.client_id, host.as_str(), *port)
            }
            BrokerEndpoint::Ws { url, port } | BrokerEndpoint::Wss { url, port } => {
                MqttOptions::new(&opts.client_id, url.as_str(), *port)
            }
        };

        let transport = match (endpoint, tls) {
            (BrokerEndpoint::Tcp { .. }, _) => Transport::Tcp,
            (BrokerEndpoint::Ws { .. }, _) => Transport::Ws,
            (BrokerEndpoint::Tls { .. }, Some(tls)) => Transport::Tls(tls),
            (BrokerEndpoint::Tls { .. }, None) => Transport::tls_with_default_config(),
            (BrokerEndpoint::Wss { .. }, Some(tls)) => Transport::Wss(tls),
            (BrokerEndpoint::Wss { .. }, None) => Transport::wss_with_default_config(),
        };

        options
            .set_transport(transport)
            .set_keep_alive(opts.keep_alive)
            .set_clean_session(true)
            .set_credentials(opts.username.as_str(), opts.password.as_str());
        Ok(options)
    }

    fn session(&mut self) -> Result<&mut Session, TransportError> {
        match self.session.as_mut() {
            Some(s) if s.connected => Ok(s),
            _ => Err(TransportError::NotConnected),
        }
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), TransportError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(TransportError::Broker(format!("connection refused: {:?}", ack.code)))
                };
            }
            Ok(_) => {}
            Err(e) => return Err(TransportError::Broker(e.to_string())),
        }
    }
}

#[async_trait]
impl BrokerTransport for MqttTransport {
    async fn connect(&mut self, opts: &ConnectOptions) -> Result<(), TransportError> {
        self.session = None;
        let options = self.options(opts)?;
        info!("Connecting to broker {} as {}", opts.url, opts.client_id);

        let (client, mut eventloop) = AsyncClient::new(options, 32);
        match tokio::time::timeout(self.connect_timeout, wait_for_connack(&mut eventloop)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(TransportError::Timeout { url: opts.url.clone(), timeout: self.connect_timeout });
            }
        }

        self.session = Some(Session { client, eventloop, connected: true });
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        let session = self.session()?;
        session
            .client
            .subscribe(topic, to_rumqttc(qos))
            .await
            .map_err(|e| TransportError::Broker(e.to_string()))?;
        debug!("Subscribed to {}", topic);
        Ok(())
    }

    async fn publish(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
        let session = self.session()?;
        session
            .client
            .publish(message.topic.as_str(), to_rumqttc(message.qos), message.retain, message.payload.clone())
            .await
            .map_err(|e| TransportError::Broker(e.to_string()))
    }

    async fn poll(&mut self, wait: Duration) -> Result<Option<InboundMessage>, TransportError> {
        let session = self.session()?;
        let event = match tokio::time::timeout(wait, session.eventloop.poll()).await {
            Err(_) => return Ok(None),
            Ok(event) => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => Ok(Some(InboundMessage {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            })),
            Ok(Event::Incoming(Packet::Disconnect)) => {
                session.connected = false;
                Err(TransportError::Broker("broker closed the session".to_string()))
            }
            Ok(_) => Ok(None),
            Err(e) => {
                session.connected = false;
                Err(TransportError::Broker(e.to_string()))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.connected)
    }

    async fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.client.disconnect().await {
                debug!("Broker disconnect: {}", e);
            }
        }
    }

    fn reset_secure_context(&mut self) {
        self.tls = None;
        self.session = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_url_forms() {
        assert_eq!(
            parse_broker_url("wss://broker.example/broker").unwrap(),
            BrokerEndpoint::Wss { url: "wss://broker.example/broker".into(), port: 443 }
        );
        assert_eq!(
            parse_broker_url("mqtts://broker.example:9883").unwrap(),
            BrokerEndpoint::Tls { host: "broker.example".into(), port: 9883 }
        );
        assert_eq!(
            parse_broker_url("mqtt://localhost").unwrap(),
            BrokerEndpoint::Tcp { host: "localhost".into(), port: 1883 }
        );
        assert_eq!(
            parse_broker_url("broker.example").unwrap(),
            BrokerEndpoint::Tls { host: "broker.example".into(), port: 8883 }
        );
    }

    #[test]
    fn bad_broker_urls() {
        assert!(parse_broker_url("").is_err());
        assert!(parse_broker_url("mqtt://host:notaport").is_err());
        assert!(parse_broker_url("http://host").is_err());
    }

    #[test]
    fn publish_without_session_fails() {
        let mut t = MqttTransport::new(None);
        assert!(!t.is_connected());
        assert!(matches!(t.session(), Err(TransportError::NotConnected)));
    }
}
