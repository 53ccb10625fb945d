//! Broker connection used by the publish bridge.
//!
//! [`BrokerLink`] is the seam between the bridge and the broker. The
//! production implementation, [`MqttLink`], wraps one rumqttc client per
//! connection: the client's event loop runs in its own task and forwards
//! events over a channel. When the connection fails the whole client is
//! discarded together with its in-flight state, so a job is never replayed by
//! the client behind the bridge's back.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::MqttConfig;
use crate::queue::PublishJob;

/// Capacity of the rumqttc request channel.
const REQUEST_CAPACITY: usize = 100;

/// How long to wait for the broker to flush a DISCONNECT.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Broker failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum BrokerError {
    /// Network failure or the broker closed the connection.
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    /// The broker refused the credentials or client id.
    #[error("Broker rejected connection: {0}")]
    AuthRejected(String),

    /// No acknowledgement arrived in time.
    #[error("Broker did not respond in time")]
    Timeout,

    /// The client could not accept the request.
    #[error("MQTT client error: {0}")]
    Client(String),
}

impl BrokerError {
    /// Whether retrying with the same credentials is pointless until the
    /// broker configuration changes.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthRejected(_))
    }
}

impl From<ConnectionError> for BrokerError {
    fn from(error: ConnectionError) -> Self {
        match error {
            ConnectionError::ConnectionRefused(code) => refused(code),
            ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => Self::Timeout,
            other => Self::Unreachable(other.to_string()),
        }
    }
}

fn refused(code: ConnectReturnCode) -> BrokerError {
    match code {
        ConnectReturnCode::BadUserNamePassword
        | ConnectReturnCode::NotAuthorized
        | ConnectReturnCode::BadClientId => BrokerError::AuthRejected(format!("{:?}", code)),
        other => BrokerError::Unreachable(format!("connection refused: {:?}", other)),
    }
}

/// A connection to one broker, driven exclusively by the bridge task.
#[async_trait]
pub trait BrokerLink: Send {
    /// Establish a fresh connection, replacing any previous one.
    async fn connect(&mut self) -> Result<(), BrokerError>;

    /// Send one job and wait until its delivery is confirmed: PubAck for
    /// QoS 1, PubComp for QoS 2, the packet written for QoS 0.
    async fn publish(&mut self, job: &PublishJob) -> Result<(), BrokerError>;

    /// Keep the idle connection alive. Resolves only when it fails.
    async fn idle(&mut self) -> BrokerError;

    /// Disconnect cleanly, best effort.
    async fn disconnect(&mut self);

    /// Discard the connection and anything it still holds.
    fn reset(&mut self);
}

/// [`BrokerLink`] over rumqttc.
pub struct MqttLink {
    options: MqttOptions,
    connect_timeout: Duration,
    ack_timeout: Duration,
    session: Option<ClientSession>,
}

impl std::fmt::Debug for MqttLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (host, port) = self.options.broker_address();
        f.debug_struct("MqttLink")
            .field("broker", &format!("{}:{}", host, port))
            .field("client_id", &self.options.client_id())
            .field("connected", &self.session.is_some())
            .finish()
    }
}

impl MqttLink {
    /// Create a link from prepared client options.
    pub fn new(options: MqttOptions) -> Self {
        Self {
            options,
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            session: None,
        }
    }

    /// Create a link from the `[mqtt]` configuration.
    pub fn from_config(config: &MqttConfig) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive));
        options.set_clean_session(true);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        if config.tls {
            // Requires the broker to present a certificate trusted by the system store
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }

        Self::new(options)
            .connect_timeout(Duration::from_secs(config.connect_timeout))
            .ack_timeout(Duration::from_secs(config.ack_timeout))
    }

    /// Set how long a connection attempt may take.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set how long to wait for a delivery confirmation.
    #[must_use]
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    fn session(&mut self) -> Result<&mut ClientSession, BrokerError> {
        self.session
            .as_mut()
            .ok_or_else(|| BrokerError::Client("not connected".to_string()))
    }
}

#[async_trait]
impl BrokerLink for MqttLink {
    async fn connect(&mut self) -> Result<(), BrokerError> {
        self.reset();

        let (client, eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);
        let mut session = ClientSession::start(client, eventloop);

        timeout(self.connect_timeout, session.wait_connack())
            .await
            .map_err(|_| BrokerError::Timeout)??;

        let (host, port) = self.options.broker_address();
        info!("MQTT connected to {}:{}", host, port);
        self.session = Some(session);
        Ok(())
    }

    async fn publish(&mut self, job: &PublishJob) -> Result<(), BrokerError> {
        let ack_timeout = self.ack_timeout;
        let session = self.session()?;

        session
            .client
            .publish(job.topic.clone(), job.qos, job.retain, job.payload.clone())
            .await
            .map_err(|e| BrokerError::Client(e.to_string()))?;

        timeout(ack_timeout, session.wait_confirmation(job.qos))
            .await
            .map_err(|_| BrokerError::Timeout)?
    }

    async fn idle(&mut self) -> BrokerError {
        match self.session() {
            Ok(session) => session.wait_failure().await,
            Err(e) => e,
        }
    }

    async fn disconnect(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if let Err(e) = session.client.disconnect().await {
            debug!("Error disconnecting MQTT client: {}", e);
            return;
        }
        let _ = timeout(DISCONNECT_GRACE, session.wait_disconnect_sent()).await;
    }

    fn reset(&mut self) {
        self.session = None;
    }
}

/// One rumqttc client and the task polling its event loop.
struct ClientSession {
    client: AsyncClient,
    events: mpsc::UnboundedReceiver<Result<Event, BrokerError>>,
    cancel: CancellationToken,
    poller: JoinHandle<()>,
}

impl ClientSession {
    fn start(client: AsyncClient, eventloop: EventLoop) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let poller = tokio::spawn(poll_events(eventloop, tx, cancel.clone()));
        Self {
            client,
            events,
            cancel,
            poller,
        }
    }

    async fn next_event(&mut self) -> Result<Event, BrokerError> {
        match self.events.recv().await {
            Some(event) => event,
            None => Err(BrokerError::Unreachable("event loop stopped".to_string())),
        }
    }

    async fn wait_connack(&mut self) -> Result<(), BrokerError> {
        loop {
            if let Event::Incoming(Packet::ConnAck(ack)) = self.next_event().await? {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(refused(code)),
                };
            }
        }
    }

    async fn wait_confirmation(&mut self, qos: QoS) -> Result<(), BrokerError> {
        loop {
            let confirmed = match (qos, self.next_event().await?) {
                (QoS::AtMostOnce, Event::Outgoing(Outgoing::Publish(_))) => true,
                (QoS::AtLeastOnce, Event::Incoming(Packet::PubAck(_))) => true,
                (QoS::ExactlyOnce, Event::Incoming(Packet::PubComp(_))) => true,
                (_, Event::Incoming(Packet::PingResp)) => {
                    debug!("MQTT ping response received");
                    false
                }
                _ => false,
            };
            if confirmed {
                return Ok(());
            }
        }
    }

    async fn wait_failure(&mut self) -> BrokerError {
        loop {
            match self.next_event().await {
                Ok(Event::Incoming(Packet::PingResp)) => {
                    debug!("MQTT ping response received");
                }
                Ok(_) => {}
                Err(e) => return e,
            }
        }
    }

    async fn wait_disconnect_sent(&mut self) {
        while let Ok(event) = self.next_event().await {
            if matches!(event, Event::Outgoing(Outgoing::Disconnect)) {
                return;
            }
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.poller.abort();
    }
}

/// Forward event loop output until the first error.
///
/// rumqttc reconnects on the next poll after an error; stopping here leaves
/// reconnection to the bridge, which builds a new client instead.
async fn poll_events(
    mut eventloop: EventLoop,
    tx: mpsc::UnboundedSender<Result<Event, BrokerError>>,
    cancel: CancellationToken,
) {
    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => return,
            polled = eventloop.poll() => polled,
        };
        match polled {
            Ok(event) => {
                if tx.send(Ok(event)).is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!("MQTT event loop stopped: {}", e);
                let _ = tx.send(Err(BrokerError::from(e)));
                return;
            }
        }
    }
}

/// Parse an MQTT broker URL into (host, port, use_tls).
///
/// Accepts `mqtt://host[:port]` and `mqtts://host[:port]`; the port defaults
/// to 1883 and 8883 respectively.
pub fn parse_broker_url(url: &str) -> Result<(String, u16, bool), String> {
    let (scheme, rest) = if let Some(stripped) = url.strip_prefix("mqtt://") {
        ("mqtt", stripped)
    } else if let Some(stripped) = url.strip_prefix("mqtts://") {
        ("mqtts", stripped)
    } else {
        return Err("Invalid scheme: URL must start with mqtt:// or mqtts://".to_string());
    };

    let use_tls = scheme == "mqtts";
    let default_port = if use_tls { 8883 } else { 1883 };

    let (host, port) = if let Some((h, p)) = rest.rsplit_once(':') {
        let port = p
            .parse::<u16>()
            .map_err(|_| format!("Invalid port: {}", p))?;
        (h.to_string(), port)
    } else {
        (rest.to_string(), default_port)
    };

    if host.is_empty() {
        return Err("Host cannot be empty".to_string());
    }

    Ok((host, port, use_tls))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_broker_url_mqtt() {
        let (host, port, tls) = parse_broker_url("mqtt://localhost:1883").unwrap();
        assert_eq!(host, "localhost");
        assert_eq!(port, 1883);
        assert!(!tls);
    }

    #[test]
    fn test_parse_broker_url_mqtts() {
        let (host, port, tls) = parse_broker_url("mqtts://broker.example.com:8884").unwrap();
        assert_eq!(host, "broker.example.com");
        assert_eq!(port, 8884);
        assert!(tls);
    }

    #[test]
    fn test_parse_broker_url_default_port() {
        let (_, port, _) = parse_broker_url("mqtt://localhost").unwrap();
        assert_eq!(port, 1883);

        let (host, port, tls) = parse_broker_url("mqtts://secure.example.com").unwrap();
        assert_eq!(host, "secure.example.com");
        assert_eq!(port, 8883);
        assert!(tls);
    }

    #[test]
    fn test_parse_broker_url_invalid() {
        assert!(parse_broker_url("http://localhost:1883").is_err());
        assert!(parse_broker_url("localhost:1883").is_err());
        assert!(parse_broker_url("mqtt://:1883").is_err());
        assert!(parse_broker_url("mqtt://host:port").is_err());
    }

    #[test]
    fn test_refused_codes() {
        assert!(refused(ConnectReturnCode::BadUserNamePassword).is_auth());
        assert!(refused(ConnectReturnCode::NotAuthorized).is_auth());
        assert!(!refused(ConnectReturnCode::ServiceUnavailable).is_auth());
    }

    #[test]
    fn test_connection_error_mapping() {
        assert_eq!(
            BrokerError::from(ConnectionError::NetworkTimeout),
            BrokerError::Timeout
        );
        let io = ConnectionError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(matches!(BrokerError::from(io), BrokerError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_publish_without_connection_fails() {
        let mut link = MqttLink::new(MqttOptions::new("test", "localhost", 1883));
        let job = PublishJob {
            topic: "t".to_string(),
            payload: Vec::new(),
            qos: QoS::AtLeastOnce,
            retain: false,
        };
        assert!(matches!(
            link.publish(&job).await,
            Err(BrokerError::Client(_))
        ));
        assert!(matches!(link.idle().await, BrokerError::Client(_)));
    }
}
