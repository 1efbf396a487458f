//! Mock collaborators for testing.
//!
//! This module provides in-memory stand-ins for the sensor link and the
//! shadow channel so the reconciliation loop can be exercised without BLE
//! hardware or a network connection.
//!
//! - [`MockSensorLink`] implements [`SensorLink`]: tests queue raw frames and
//!   the next [`wait_for_events`](SensorLink::wait_for_events) dispatches them.
//! - [`MockShadowChannel`] implements [`ShadowChannel`]: it records every
//!   update and lets tests deliver `accepted`, `rejected` or `timeout` for a
//!   token whenever they choose, in any order.
//!
//! # Features
//!
//! - **Failure injection**: make waits or updates fail
//! - **Early acknowledgement**: accept updates before `update` returns
//! - **Delta pushes**: deliver desired-state deltas to subscribers

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use thingy_types::{NotificationKind, ShadowDocument};

use crate::error::{Error, Result};
use crate::traits::{
    RawNotification, ResponseStatus, SensorLink, ShadowChannel, ShadowHandler, ShadowResponse,
};

/// A mock Thingy:52 link for testing.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use thingy_core::{MockSensorLink, RawNotification, SensorLink};
///
/// #[tokio::main]
/// async fn main() {
///     let link = MockSensorLink::new("C8:2E:11:22:33:44");
///     link.push_temperature(21, 50);
///
///     let count = link
///         .wait_for_events(Duration::from_secs(1), &|n: RawNotification| println!("{n:?}"))
///         .await
///         .unwrap();
///     assert_eq!(count, 1);
/// }
/// ```
pub struct MockSensorLink {
    address: String,
    queue: Mutex<VecDeque<RawNotification>>,
    notify: Notify,
    enabled: Mutex<Vec<NotificationKind>>,
    connected: AtomicBool,
    should_fail: AtomicBool,
    fail_message: Mutex<String>,
    wait_count: AtomicU32,
}

impl std::fmt::Debug for MockSensorLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSensorLink")
            .field("address", &self.address)
            .field("queued", &self.queue.lock().len())
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish()
    }
}

impl MockSensorLink {
    /// Create a connected mock link with an empty queue.
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            enabled: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            should_fail: AtomicBool::new(false),
            fail_message: Mutex::new("Mock failure".to_string()),
            wait_count: AtomicU32::new(0),
        }
    }

    /// Queue a raw frame.
    pub fn push_raw(&self, kind: NotificationKind, data: impl Into<Vec<u8>>) {
        self.queue.lock().push_back(RawNotification::new(kind, data));
        self.notify.notify_one();
    }

    /// Queue a well-formed temperature frame.
    pub fn push_temperature(&self, temperature: i8, decimal: u8) {
        self.push_raw(
            NotificationKind::Temperature,
            vec![temperature as u8, decimal],
        );
    }

    /// Queue a button frame.
    pub fn push_button(&self, pressed: bool) {
        self.push_raw(NotificationKind::Button, vec![u8::from(pressed)]);
    }

    /// Number of frames waiting to be dispatched.
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Kinds passed to the last [`enable_notifications`](SensorLink::enable_notifications).
    pub fn enabled_kinds(&self) -> Vec<NotificationKind> {
        self.enabled.lock().clone()
    }

    /// Number of completed or failed waits.
    pub fn wait_count(&self) -> u32 {
        self.wait_count.load(Ordering::Relaxed)
    }

    /// Whether the link is still connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Make subsequent waits and subscriptions fail.
    pub fn set_should_fail(&self, fail: bool, message: Option<&str>) {
        self.should_fail.store(fail, Ordering::Relaxed);
        if let Some(msg) = message {
            *self.fail_message.lock() = msg.to_string();
        }
    }

    fn check_ready(&self) -> Result<()> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(Error::NotConnected);
        }
        if self.should_fail.load(Ordering::Relaxed) {
            return Err(Error::InvalidData(self.fail_message.lock().clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl SensorLink for MockSensorLink {
    fn address(&self) -> &str {
        &self.address
    }

    async fn enable_notifications(&self, kinds: &[NotificationKind]) -> Result<()> {
        self.check_ready()?;
        *self.enabled.lock() = kinds.to_vec();
        Ok(())
    }

    async fn wait_for_events(
        &self,
        timeout: Duration,
        handler: &(dyn Fn(RawNotification) + Send + Sync),
    ) -> Result<usize> {
        self.wait_count.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + timeout;

        loop {
            self.check_ready()?;
            if !self.queue.lock().is_empty() {
                break;
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(0);
            }
        }

        let drained: Vec<RawNotification> = self.queue.lock().drain(..).collect();
        let count = drained.len();
        for notification in drained {
            handler(notification);
        }
        Ok(count)
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);
        self.notify.notify_waiters();
        Ok(())
    }
}

/// An update recorded by [`MockShadowChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedUpdate {
    /// Token returned to the caller.
    pub token: String,
    /// Thing the update targeted.
    pub thing_name: String,
    /// Document sent.
    pub payload: String,
    /// Timeout budget requested.
    pub timeout: Duration,
}

/// A mock shadow service connection for testing.
///
/// Responses are only delivered when the test asks for them, so any
/// interleaving of acknowledgements can be reproduced.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use thingy_core::{MockShadowChannel, ShadowChannel, ShadowResponse};
///
/// #[tokio::main]
/// async fn main() {
///     let channel = MockShadowChannel::new();
///     let token = channel
///         .update("Bot", r#"{"state":{"reported":{"temperature":"21"}}}"#,
///                 Arc::new(|r: ShadowResponse| println!("{r:?}")), Duration::from_secs(5))
///         .await
///         .unwrap();
///     assert!(channel.accept(&token));
/// }
/// ```
#[derive(Default)]
pub struct MockShadowChannel {
    updates: Mutex<Vec<RecordedUpdate>>,
    handlers: Mutex<HashMap<String, ShadowHandler>>,
    delta_handlers: Mutex<Vec<(String, ShadowHandler)>>,
    next_token: AtomicU64,
    version: AtomicU64,
    fail_updates: AtomicBool,
    accept_immediately: AtomicBool,
}

impl std::fmt::Debug for MockShadowChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockShadowChannel")
            .field("updates", &self.updates.lock().len())
            .field("outstanding", &self.handlers.lock().len())
            .field("version", &self.version.load(Ordering::Relaxed))
            .finish()
    }
}

impl MockShadowChannel {
    /// Create a channel with no recorded updates.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every update sent so far, oldest first.
    pub fn updates(&self) -> Vec<RecordedUpdate> {
        self.updates.lock().clone()
    }

    /// Number of updates sent so far.
    pub fn update_count(&self) -> usize {
        self.updates.lock().len()
    }

    /// The most recent update, if any.
    pub fn last_update(&self) -> Option<RecordedUpdate> {
        self.updates.lock().last().cloned()
    }

    /// Tokens whose handler has not been invoked yet.
    pub fn outstanding_tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self.handlers.lock().keys().cloned().collect();
        tokens.sort();
        tokens
    }

    /// Shadow version the next acceptance will carry, minus one.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Make subsequent updates fail to send.
    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::Relaxed);
    }

    /// Accept each update before `update` returns its token.
    pub fn set_accept_immediately(&self, accept: bool) {
        self.accept_immediately.store(accept, Ordering::Relaxed);
    }

    /// Deliver a response for `token`.
    ///
    /// Returns `false` if the token is unknown or was already answered.
    pub fn respond(&self, token: &str, status: ResponseStatus, payload: &str) -> bool {
        let handler = self.handlers.lock().remove(token);
        match handler {
            Some(handler) => {
                handler(ShadowResponse::new(payload, status, token));
                true
            }
            None => false,
        }
    }

    /// Accept `token`, echoing its document with the next shadow version.
    pub fn accept(&self, token: &str) -> bool {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        self.accept_with_version(token, version)
    }

    /// Accept `token` with an explicit shadow version.
    pub fn accept_with_version(&self, token: &str, version: u64) -> bool {
        let Some(update) = self.find_update(token) else {
            return false;
        };
        let payload = match ShadowDocument::from_json(&update.payload) {
            Ok(mut document) => {
                document.client_token = Some(token.to_string());
                document.version = Some(version);
                document.timestamp = Some(1_700_000_000 + version as i64);
                document.to_json().unwrap_or(update.payload)
            }
            Err(_) => update.payload,
        };
        self.respond(token, ResponseStatus::Accepted, &payload)
    }

    /// Reject `token` with an error code and message.
    pub fn reject(&self, token: &str, code: u16, message: &str) -> bool {
        let payload = serde_json::json!({
            "code": code,
            "message": message,
            "clientToken": token,
        })
        .to_string();
        self.respond(token, ResponseStatus::Rejected, &payload)
    }

    /// Report a timeout for `token`.
    pub fn time_out(&self, token: &str) -> bool {
        self.respond(token, ResponseStatus::Timeout, "")
    }

    /// Push a delta payload to every subscriber of `thing_name`.
    ///
    /// Returns the number of handlers invoked.
    pub fn push_delta(&self, thing_name: &str, payload: &str) -> usize {
        let handlers: Vec<ShadowHandler> = self
            .delta_handlers
            .lock()
            .iter()
            .filter(|(thing, _)| thing == thing_name)
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in &handlers {
            handler(ShadowResponse::new(payload, ResponseStatus::Delta, ""));
        }
        handlers.len()
    }

    fn find_update(&self, token: &str) -> Option<RecordedUpdate> {
        self.updates
            .lock()
            .iter()
            .find(|update| update.token == token)
            .cloned()
    }
}

#[async_trait]
impl ShadowChannel for MockShadowChannel {
    async fn subscribe_delta(&self, thing_name: &str, handler: ShadowHandler) -> Result<()> {
        self.delta_handlers
            .lock()
            .push((thing_name.to_string(), handler));
        Ok(())
    }

    async fn update(
        &self,
        thing_name: &str,
        payload: &str,
        handler: ShadowHandler,
        timeout: Duration,
    ) -> Result<String> {
        if self.fail_updates.load(Ordering::Relaxed) {
            return Err(Error::channel("mock channel refused the update"));
        }

        let token = format!(
            "mock-token-{}",
            self.next_token.fetch_add(1, Ordering::SeqCst) + 1
        );
        self.updates.lock().push(RecordedUpdate {
            token: token.clone(),
            thing_name: thing_name.to_string(),
            payload: payload.to_string(),
            timeout,
        });
        self.handlers.lock().insert(token.clone(), handler);

        if self.accept_immediately.load(Ordering::Relaxed) {
            self.accept(&token);
        }
        Ok(token)
    }
}
