//! AWS IoT classic shadow channel over MQTT.
//!
//! [`MqttShadowChannel`] implements [`ShadowChannel`] on top of `rumqttc`
//! with mutual TLS.
//!
//! # Topic Structure
//!
//! For a thing named `{thing}`:
//!
//! - `$aws/things/{thing}/shadow/update` - update requests (published)
//! - `$aws/things/{thing}/shadow/update/accepted` - acknowledgements
//! - `$aws/things/{thing}/shadow/update/rejected` - rejections
//! - `$aws/things/{thing}/shadow/update/delta` - desired-state deltas
//!
//! Every update carries a fresh `clientToken`; responses are routed back to
//! the handler registered for that token. A request that gets no response
//! within its timeout is resolved with [`ResponseStatus::Timeout`].
//!
//! # Reconnection
//!
//! The event loop reconnects with exponential backoff (see
//! [`crate::backoff`]) and re-subscribes every topic after each CONNACK.
//! Requests in flight during an outage simply time out.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubAck, SubscribeReasonCode,
    Transport,
};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use thingy_core::{ResponseStatus, ShadowChannel, ShadowHandler, ShadowResponse};
use thingy_types::shadow::client_token;

use crate::backoff::{Backoff, BackoffConfig};
use crate::config::Config;

/// Capacity of the client request queue.
const REQUEST_CAPACITY: usize = 64;

/// How long a graceful disconnect may take before the event loop is stopped.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Errors raised by the shadow channel.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ChannelError {
    /// The endpoint could not be parsed.
    #[error("Invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// A certificate or key path was not configured.
    #[error("Missing credentials for authentication.")]
    MissingCredentials,

    /// A certificate or key file could not be read.
    #[error("Failed to read {path}: {source}")]
    Credentials {
        path: PathBuf,
        source: std::io::Error,
    },

    /// No CONNACK arrived in time.
    #[error("No connection to {endpoint} within {timeout:?}{}", last_error_suffix(.last_error))]
    ConnectTimeout {
        endpoint: String,
        timeout: Duration,
        last_error: Option<String>,
    },

    /// Subscriptions were not acknowledged in time.
    #[error("Subscription to {topics} not acknowledged")]
    SubscribeTimeout { topics: String },

    /// The broker answered a subscription with a failure code.
    #[error("Subscription to {topics} rejected by the broker")]
    SubscribeRejected { topics: String },

    /// The update document is not a JSON object.
    #[error("Invalid update document: {0}")]
    Payload(String),

    /// The client request queue is closed.
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    match last_error {
        Some(e) => format!(" (last error: {})", e),
        None => String::new(),
    }
}

impl From<ChannelError> for thingy_core::Error {
    fn from(err: ChannelError) -> Self {
        thingy_core::Error::channel(err.to_string())
    }
}

/// Topic a thing's update requests are published to.
pub fn update_topic(thing_name: &str) -> String {
    format!("$aws/things/{}/shadow/update", thing_name)
}

/// Topic carrying acknowledgements.
pub fn accepted_topic(thing_name: &str) -> String {
    format!("$aws/things/{}/shadow/update/accepted", thing_name)
}

/// Topic carrying rejections.
pub fn rejected_topic(thing_name: &str) -> String {
    format!("$aws/things/{}/shadow/update/rejected", thing_name)
}

/// Topic carrying desired-state deltas.
pub fn delta_topic(thing_name: &str) -> String {
    format!("$aws/things/{}/shadow/update/delta", thing_name)
}

/// An incoming shadow response topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowTopic<'a> {
    Accepted(&'a str),
    Rejected(&'a str),
    Delta(&'a str),
}

impl<'a> ShadowTopic<'a> {
    /// Classify a topic, returning `None` for anything but update responses.
    pub fn parse(topic: &'a str) -> Option<Self> {
        let rest = topic.strip_prefix("$aws/things/")?;
        let (thing, suffix) = rest.split_once("/shadow/")?;
        if thing.is_empty() {
            return None;
        }
        match suffix {
            "update/accepted" => Some(Self::Accepted(thing)),
            "update/rejected" => Some(Self::Rejected(thing)),
            "update/delta" => Some(Self::Delta(thing)),
            _ => None,
        }
    }
}

/// Add `clientToken` to an update document.
pub fn with_client_token(payload: &str, token: &str) -> Result<String, ChannelError> {
    let mut document: Value =
        serde_json::from_str(payload).map_err(|e| ChannelError::Payload(e.to_string()))?;
    let object = document
        .as_object_mut()
        .ok_or_else(|| ChannelError::Payload("expected a JSON object".to_string()))?;
    object.insert("clientToken".to_string(), Value::String(token.to_string()));
    Ok(document.to_string())
}

/// Split `host[:port]` (optionally prefixed with `mqtts://`).
pub fn parse_endpoint(endpoint: &str, default_port: u16) -> Result<(String, u16), ChannelError> {
    let invalid = |reason: &str| ChannelError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: reason.to_string(),
    };

    let rest = endpoint.trim();
    let rest = rest.strip_prefix("mqtts://").unwrap_or(rest);
    let rest = rest.trim_end_matches('/');

    let (host, port) = match rest.rsplit_once(':') {
        Some((h, p)) => {
            let port = p
                .parse::<u16>()
                .map_err(|_| invalid(&format!("invalid port '{}'", p)))?;
            (h, port)
        }
        None => (rest, default_port),
    };

    if host.is_empty() {
        return Err(invalid("host cannot be empty"));
    }
    if port == 0 {
        return Err(invalid("port must be non-zero"));
    }
    Ok((host.to_string(), port))
}

/// PEM material for mutual TLS.
#[derive(Clone)]
pub struct Credentials {
    pub root_ca: Vec<u8>,
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("root_ca", &format_args!("{} bytes", self.root_ca.len()))
            .field("cert", &format_args!("{} bytes", self.cert.len()))
            .field("key", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Read the three PEM files.
    pub fn load(root_ca: &Path, cert: &Path, key: &Path) -> Result<Self, ChannelError> {
        let read = |path: &Path| {
            std::fs::read(path).map_err(|e| ChannelError::Credentials {
                path: path.to_path_buf(),
                source: e,
            })
        };
        Ok(Self {
            root_ca: read(root_ca)?,
            cert: read(cert)?,
            key: read(key)?,
        })
    }
}

/// Connection parameters for [`MqttShadowChannel::connect`].
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Endpoint host, optionally with `:port`.
    pub endpoint: String,
    /// Port used when the endpoint carries none.
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    /// Bound on the first CONNACK and on subscription acknowledgements.
    pub connect_timeout: Duration,
    pub backoff: BackoffConfig,
    pub credentials: Credentials,
}

impl ChannelOptions {
    /// Build options from a validated configuration, reading the PEM files.
    pub fn from_config(config: &Config) -> Result<Self, ChannelError> {
        let shadow = &config.shadow;
        let (Some(root_ca), Some(cert), Some(key)) = (&shadow.root_ca, &shadow.cert, &shadow.key)
        else {
            return Err(ChannelError::MissingCredentials);
        };

        Ok(Self {
            endpoint: shadow.endpoint.clone(),
            port: shadow.port,
            client_id: shadow.client_id.clone(),
            keep_alive: Duration::from_secs(config.mqtt.keep_alive_secs),
            connect_timeout: Duration::from_secs(config.mqtt.connect_timeout_secs),
            backoff: config.backoff(),
            credentials: Credentials::load(root_ca, cert, key)?,
        })
    }
}

struct InFlight {
    handler: ShadowHandler,
    deadline: AbortHandle,
}

/// Running count of SUBACK return codes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SubackTally {
    acked: u64,
    rejected: u64,
}

impl SubackTally {
    fn total(&self) -> u64 {
        self.acked + self.rejected
    }
}

/// State shared between the channel handle, its event loop and timers.
struct Shared {
    requests: Mutex<HashMap<String, InFlight>>,
    deltas: Mutex<HashMap<String, Vec<ShadowHandler>>>,
    topics: Mutex<BTreeSet<String>>,
    connected: AtomicBool,
    last_error: Mutex<Option<String>>,
    connacks: watch::Sender<u64>,
    subacks: watch::Sender<SubackTally>,
}

impl Shared {
    fn new() -> Self {
        Self {
            requests: Mutex::new(HashMap::new()),
            deltas: Mutex::new(HashMap::new()),
            topics: Mutex::new(BTreeSet::new()),
            connected: AtomicBool::new(false),
            last_error: Mutex::new(None),
            connacks: watch::Sender::new(0),
            subacks: watch::Sender::new(SubackTally::default()),
        }
    }

    /// Register a request and arm its timeout.
    fn track(self: &Arc<Self>, token: &str, handler: ShadowHandler, limit: Duration) {
        let shared = Arc::clone(self);
        let timer_token = token.to_string();
        let deadline = tokio::spawn(async move {
            sleep(limit).await;
            shared.expire(&timer_token);
        })
        .abort_handle();

        self.requests
            .lock()
            .insert(token.to_string(), InFlight { handler, deadline });
    }

    /// Drop a request without resolving it.
    fn forget(&self, token: &str) {
        if let Some(in_flight) = self.requests.lock().remove(token) {
            in_flight.deadline.abort();
        }
    }

    fn expire(&self, token: &str) {
        let Some(in_flight) = self.requests.lock().remove(token) else {
            return;
        };
        warn!(token, "Shadow update got no response in time");
        (in_flight.handler)(ShadowResponse::timeout(token));
    }

    fn outstanding(&self) -> usize {
        self.requests.lock().len()
    }

    fn add_delta_handler(&self, thing_name: &str, handler: ShadowHandler) {
        self.deltas
            .lock()
            .entry(thing_name.to_string())
            .or_default()
            .push(handler);
    }

    /// Route an incoming publish to the handler it belongs to.
    fn dispatch(&self, topic: &str, payload: &[u8]) {
        let Some(kind) = ShadowTopic::parse(topic) else {
            debug!(topic, "Ignoring publish on unexpected topic");
            return;
        };
        let body = String::from_utf8_lossy(payload).into_owned();

        let (thing, status) = match kind {
            ShadowTopic::Accepted(thing) => (thing, ResponseStatus::Accepted),
            ShadowTopic::Rejected(thing) => (thing, ResponseStatus::Rejected),
            ShadowTopic::Delta(thing) => {
                let handlers = self.deltas.lock().get(thing).cloned().unwrap_or_default();
                debug!(thing, handlers = handlers.len(), "Delta publish");
                let token = client_token(payload).unwrap_or_default();
                for handler in handlers {
                    handler(ShadowResponse::new(body.clone(), ResponseStatus::Delta, token.clone()));
                }
                return;
            }
        };

        let Some(token) = client_token(payload) else {
            debug!(thing, %status, "Response carries no clientToken");
            return;
        };
        let Some(in_flight) = self.requests.lock().remove(&token) else {
            // Another client's update, or one that already timed out.
            debug!(thing, %status, token, "No pending request for response");
            return;
        };
        in_flight.deadline.abort();
        (in_flight.handler)(ShadowResponse::new(body, status, token));
    }

    fn resubscribe(&self, client: &AsyncClient) {
        let topics: Vec<String> = self.topics.lock().iter().cloned().collect();
        for topic in topics {
            if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                warn!(topic, error = %e, "Failed to queue re-subscription");
            }
        }
    }

    /// Count the return codes of one SUBACK.
    fn on_suback(&self, ack: &SubAck) {
        let rejected = ack
            .return_codes
            .iter()
            .filter(|code| matches!(code, SubscribeReasonCode::Failure))
            .count() as u64;
        let acked = ack.return_codes.len() as u64 - rejected;

        if rejected > 0 {
            warn!(pkid = ack.pkid, rejected, "Subscription rejected by broker");
            *self.last_error.lock() = Some(format!("subscription rejected (pkid {})", ack.pkid));
        } else {
            debug!(pkid = ack.pkid, "Subscription acknowledged");
        }
        self.subacks.send_modify(|tally| {
            tally.acked += acked;
            tally.rejected += rejected;
        });
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }
}

/// Shadow channel backed by an MQTT session to AWS IoT.
pub struct MqttShadowChannel {
    client: AsyncClient,
    shared: Arc<Shared>,
    endpoint: String,
    ack_timeout: Duration,
    subscribe_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MqttShadowChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttShadowChannel")
            .field("endpoint", &self.endpoint)
            .field("connected", &self.is_connected())
            .field("outstanding", &self.shared.outstanding())
            .finish()
    }
}

impl MqttShadowChannel {
    /// Open the MQTT session and wait for the first CONNACK.
    #[tracing::instrument(skip_all, fields(endpoint = %options.endpoint, client_id = %options.client_id))]
    pub async fn connect(options: ChannelOptions) -> Result<Self, ChannelError> {
        let (host, port) = parse_endpoint(&options.endpoint, options.port)?;
        let endpoint = format!("{}:{}", host, port);

        let mut mqtt_options = MqttOptions::new(options.client_id.clone(), host, port);
        mqtt_options.set_keep_alive(options.keep_alive);
        let credentials = options.credentials;
        mqtt_options.set_transport(Transport::tls(
            credentials.root_ca,
            Some((credentials.cert, credentials.key)),
            None,
        ));

        let (client, eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
        let shared = Arc::new(Shared::new());
        let cancel = CancellationToken::new();
        let mut connacks = shared.connacks.subscribe();

        info!("Connecting to shadow service");
        let handle = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            Arc::clone(&shared),
            Backoff::new(options.backoff),
            cancel.clone(),
        ));

        let connected = matches!(
            timeout(options.connect_timeout, connacks.wait_for(|n| *n > 0)).await,
            Ok(Ok(_))
        );
        if !connected {
            cancel.cancel();
            handle.abort();
            return Err(ChannelError::ConnectTimeout {
                endpoint,
                timeout: options.connect_timeout,
                last_error: shared.last_error(),
            });
        }

        Ok(Self {
            client,
            shared,
            endpoint,
            ack_timeout: options.connect_timeout,
            subscribe_lock: tokio::sync::Mutex::new(()),
            cancel,
            event_loop: Mutex::new(Some(handle)),
        })
    }

    /// Whether the session is currently up.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Number of updates awaiting a response.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding()
    }

    /// Subscribe to the accepted and rejected topics for `thing_name`.
    ///
    /// Called implicitly by the first update; calling it up front avoids
    /// losing the first acknowledgement to a slow SUBACK.
    pub async fn subscribe_responses(&self, thing_name: &str) -> Result<(), ChannelError> {
        self.subscribe_topics(vec![accepted_topic(thing_name), rejected_topic(thing_name)])
            .await
    }

    async fn subscribe_topics(&self, topics: Vec<String>) -> Result<(), ChannelError> {
        let _guard = self.subscribe_lock.lock().await;

        // Topics join the re-subscription set only once the broker accepts them.
        let fresh: Vec<String> = {
            let known = self.shared.topics.lock();
            topics.into_iter().filter(|t| !known.contains(t)).collect()
        };
        if fresh.is_empty() {
            return Ok(());
        }

        let mut acks = self.shared.subacks.subscribe();
        let start = *acks.borrow_and_update();
        let target = start.total() + fresh.len() as u64;
        for topic in &fresh {
            self.client.subscribe(topic.as_str(), QoS::AtLeastOnce).await?;
        }

        let tally = match timeout(self.ack_timeout, acks.wait_for(|t| t.total() >= target)).await {
            Ok(Ok(tally)) => *tally,
            _ => {
                return Err(ChannelError::SubscribeTimeout {
                    topics: fresh.join(", "),
                });
            }
        };
        if tally.rejected > start.rejected {
            return Err(ChannelError::SubscribeRejected {
                topics: fresh.join(", "),
            });
        }

        self.shared.topics.lock().extend(fresh.iter().cloned());
        debug!(topics = ?fresh, "Subscribed");
        Ok(())
    }

    async fn publish_update(
        &self,
        thing_name: &str,
        payload: &str,
        handler: ShadowHandler,
        limit: Duration,
    ) -> Result<String, ChannelError> {
        self.subscribe_responses(thing_name).await?;

        let token = Uuid::new_v4().to_string();
        let body = with_client_token(payload, &token)?;

        self.shared.track(&token, handler, limit);
        if let Err(e) = self
            .client
            .publish(update_topic(thing_name), QoS::AtLeastOnce, false, body)
            .await
        {
            self.shared.forget(&token);
            return Err(e.into());
        }

        debug!(thing = thing_name, token, "Update published");
        Ok(token)
    }

    /// Send DISCONNECT and stop the event loop.
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "Disconnect request not queued");
        }

        let handle = self.event_loop.lock().take();
        if let Some(handle) = handle
            && timeout(DISCONNECT_GRACE, handle).await.is_err()
        {
            debug!("Event loop did not stop in time");
        }
        self.cancel.cancel();
        self.shared.connected.store(false, Ordering::Release);
        info!(endpoint = %self.endpoint, "Shadow connection closed");
    }
}

impl Drop for MqttShadowChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl ShadowChannel for MqttShadowChannel {
    async fn subscribe_delta(
        &self,
        thing_name: &str,
        handler: ShadowHandler,
    ) -> thingy_core::Result<()> {
        self.shared.add_delta_handler(thing_name, handler);
        self.subscribe_topics(vec![delta_topic(thing_name)]).await?;
        Ok(())
    }

    async fn update(
        &self,
        thing_name: &str,
        payload: &str,
        handler: ShadowHandler,
        timeout: Duration,
    ) -> thingy_core::Result<String> {
        Ok(self
            .publish_update(thing_name, payload, handler, timeout)
            .await?)
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    shared: Arc<Shared>,
    mut backoff: Backoff,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!(code = ?ack.code, session_present = ack.session_present, "Shadow service connected");
                backoff.on_connected();
                shared.connected.store(true, Ordering::Release);
                shared.resubscribe(&client);
                shared.connacks.send_modify(|n| *n += 1);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let topic: &[u8] = publish.topic.as_ref();
                shared.dispatch(&String::from_utf8_lossy(topic), &publish.payload);
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => shared.on_suback(&ack),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                shared.connected.store(false, Ordering::Release);
                *shared.last_error.lock() = Some(e.to_string());
                let delay = backoff.on_failure();
                warn!(
                    error = %e,
                    attempt = backoff.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "Shadow connection error, reconnecting"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(delay) => {}
                }
            }
        }
    }

    shared.connected.store(false, Ordering::Release);
    debug!("Shadow event loop stopped");
}
