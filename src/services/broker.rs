//! Long-lived MQTT subscription that forwards every publish to the work queue.
//!
//! - Blocking `rumqttc` client; the connection iterator is the network loop and
//!   publishes are handled synchronously on it, so forwarding must never block.
//! - Any connection error tears the session down. After a fixed delay a fresh
//!   session is built; there is no retry limit.

use crate::config::MqttConfig;
use crate::services::queue::{QueueMessage, WorkQueue};
use chrono::Utc;
use core::fmt;
use log::{debug, error, info, warn};
use rumqttc::{
    Client, ClientError, Connection, ConnectionError, Event, MqttOptions, Packet, Publish, SubscribeReasonCode,
    TlsConfiguration, Transport,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::thread;

/// Capacity of rumqttc's request channel (subscribe/disconnect requests).
const REQUEST_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Subscribed,
    Streaming,
}

#[derive(Debug)]
pub enum BrokerError {
    /// A request could not be queued on the client
    Client(ClientError),
    /// Network, TLS or protocol failure on the connection
    Connection(ConnectionError),
    /// The event loop stopped yielding notifications
    Closed,
}

impl Display for BrokerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Client(e) => write!(f, "client request failed: {}", e),
            BrokerError::Connection(e) => write!(f, "connection error: {}", e),
            BrokerError::Closed => write!(f, "event loop closed"),
        }
    }
}

impl Error for BrokerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BrokerError::Client(e) => Some(e),
            BrokerError::Connection(e) => Some(e),
            BrokerError::Closed => None,
        }
    }
}

impl From<ClientError> for BrokerError {
    fn from(value: ClientError) -> Self {
        BrokerError::Client(value)
    }
}

impl From<ConnectionError> for BrokerError {
    fn from(value: ConnectionError) -> Self {
        BrokerError::Connection(value)
    }
}

pub struct BrokerClient<Q: WorkQueue> {
    cfg: MqttConfig,
    queue: Q,
    state: SessionState,
}

impl<Q: WorkQueue> BrokerClient<Q> {
    pub fn new(cfg: MqttConfig, queue: Q) -> Self {
        BrokerClient {
            cfg,
            queue,
            state: SessionState::Disconnected,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Keep a session alive for the lifetime of the process.
    pub fn run_forever(&mut self) -> ! {
        info!(
            "Starting MQTT consumer (host={}, port={}, topics={}, tls={}, client_id={}, qos={:?})",
            self.cfg.host,
            self.cfg.port,
            self.cfg.topics.join(","),
            self.cfg.tls,
            self.cfg.client_id,
            self.cfg.qos
        );
        loop {
            if let Err(e) = self.run_session() {
                error!(
                    "MQTT consumer error, will retry in {}s: {}",
                    self.cfg.reconnect_delay.as_secs(),
                    e
                );
            }
            self.state = SessionState::Disconnected;
            thread::sleep(self.cfg.reconnect_delay);
        }
    }

    /// One connect/subscribe/stream cycle. Only returns on failure.
    fn run_session(&mut self) -> Result<(), BrokerError> {
        self.state = SessionState::Connecting;
        let (client, mut connection) = Client::new(mqtt_options(&self.cfg), REQUEST_CHANNEL_CAPACITY);

        // requests are buffered and sent right after CONNACK
        let result = self.subscribe_all(&client).and_then(|_| self.stream(&mut connection));

        if let Err(e) = client.disconnect() {
            debug!("MQTT disconnect failed (ignored): {}", e);
        }
        result
    }

    fn subscribe_all(&self, client: &Client) -> Result<(), BrokerError> {
        for topic in &self.cfg.topics {
            client.subscribe(topic.as_str(), self.cfg.qos)?;
        }
        Ok(())
    }

    fn stream(&mut self, connection: &mut Connection) -> Result<(), BrokerError> {
        for notification in connection.iter() {
            match notification? {
                Event::Incoming(Packet::ConnAck(ack)) => {
                    info!(
                        "Connected to MQTT broker {}:{} (session_present={})",
                        self.cfg.host, self.cfg.port, ack.session_present
                    );
                    self.state = SessionState::Subscribed;
                }
                Event::Incoming(Packet::SubAck(ack)) => {
                    if ack.return_codes.iter().any(|c| matches!(c, SubscribeReasonCode::Failure)) {
                        error!("Broker rejected subscription (pkid={})", ack.pkid);
                    }
                    if self.state == SessionState::Subscribed {
                        info!("Subscribed to {} filter(s), entering loop", self.cfg.topics.len());
                        self.state = SessionState::Streaming;
                    }
                }
                Event::Incoming(Packet::Publish(publish)) => self.forward(&publish),
                Event::Incoming(Packet::Disconnect) => {
                    warn!("Broker sent DISCONNECT");
                }
                _ => {}
            }
        }
        Err(BrokerError::Closed)
    }

    /// Hand one publish to the work queue. Failures are logged and the session continues.
    fn forward(&self, publish: &Publish) {
        let msg = QueueMessage {
            topic: publish.topic.clone(),
            payload: String::from_utf8_lossy(&publish.payload).into_owned(),
            retained: publish.retain,
            received_at: Utc::now(),
        };
        if let Err(e) = self.queue.enqueue(msg) {
            error!("Dispatch error for topic {}: {}", publish.topic, e);
        }
    }
}

pub fn mqtt_options(cfg: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(cfg.client_id.as_str(), cfg.host.as_str(), cfg.port);
    options.set_keep_alive(cfg.keep_alive);
    options.set_clean_session(true);
    // rumqttc's 10 KiB default drops the session on any larger publish
    options.set_max_packet_size(cfg.max_packet_size, cfg.max_packet_size);
    if let Some(creds) = &cfg.credentials {
        options.set_credentials(creds.username.as_str(), creds.password.as_str());
    }
    if cfg.tls {
        let tls = TlsConfiguration::Rustls(Arc::new(insecure_tls_config()));
        options.set_transport(Transport::tls_with_config(tls));
    }
    options
}

/// TLS client config that accepts any server certificate, self-signed included.
fn insecure_tls_config() -> ClientConfig {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth()
}

#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}
