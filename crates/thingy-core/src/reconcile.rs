//! Reconciliation of the sensor value with the remote shadow.
//!
//! The [`Reconciler`] owns the wake loop. Each cycle it waits on the sensor
//! link, compares `observed` with `reported`, and when they differ sends an
//! update through the shadow channel. `reported` only moves when the channel
//! later delivers an `accepted` response for that update.
//!
//! ```text
//! Idle --divergence--> UpdatePending --accepted--> Idle (reported advanced)
//!                                    --rejected--> Idle (retried next cycle)
//!                                    --timeout---> Idle (retried next cycle)
//! ```
//!
//! Overlapping divergences are coalesced to the latest value: a cycle always
//! asserts the current `observed` value, unless an update for that same
//! value is already outstanding.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use thingy_core::{ReconcileOptions, Reconciler};
//!
//! let reconciler = Reconciler::new(link, channel, "Bot", ReconcileOptions::default());
//! let cancel = CancellationToken::new();
//! reconciler.run(cancel.clone()).await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use thingy_types::{
    ButtonState, NotificationKind, RejectedPayload, ShadowDocument, TemperatureReading,
};

use crate::error::{Error, Result};
use crate::pending::{PendingUpdate, PendingUpdates};
use crate::store::{CommitOutcome, ShadowStateStore};
use crate::traits::{
    RawNotification, ResponseStatus, SensorLink, ShadowChannel, ShadowHandler, ShadowResponse,
};

/// Timing options for the reconciliation loop.
///
/// ```ignore
/// let options = ReconcileOptions::builder()
///     .wake_interval(Duration::from_secs(10))
///     .update_timeout(Duration::from_secs(5))
///     .build();
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Bound on each sensor wait. Also the retry cadence after a rejected or
    /// timed-out update. Default: 10 seconds.
    pub wake_interval: Duration,
    /// Timeout budget handed to the channel with every update.
    /// Default: 5 seconds.
    pub update_timeout: Duration,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            wake_interval: Duration::from_secs(10),
            update_timeout: Duration::from_secs(5),
        }
    }
}

impl ReconcileOptions {
    /// Create a new builder.
    pub fn builder() -> ReconcileOptionsBuilder {
        ReconcileOptionsBuilder::default()
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        if self.wake_interval.is_zero() {
            return Err(Error::invalid_config("wake_interval must be > 0"));
        }
        if self.update_timeout.is_zero() {
            return Err(Error::invalid_config("update_timeout must be > 0"));
        }
        Ok(())
    }
}

/// Builder for [`ReconcileOptions`].
#[derive(Debug, Clone, Default)]
pub struct ReconcileOptionsBuilder {
    options: ReconcileOptions,
}

impl ReconcileOptionsBuilder {
    /// Set the wake interval.
    #[must_use]
    pub fn wake_interval(mut self, interval: Duration) -> Self {
        self.options.wake_interval = interval;
        self
    }

    /// Set the per-update timeout.
    #[must_use]
    pub fn update_timeout(mut self, timeout: Duration) -> Self {
        self.options.update_timeout = timeout;
        self
    }

    /// Build the options.
    #[must_use]
    pub fn build(self) -> ReconcileOptions {
        self.options
    }
}

/// What a single reconciliation step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// `observed` equals `reported`; nothing sent.
    InSync {
        /// The shared value.
        value: i32,
    },
    /// An update was sent.
    UpdateIssued {
        /// Correlation token returned by the channel.
        token: String,
        /// Value the update asserts.
        value: i32,
    },
    /// An update for this value is still outstanding; nothing sent.
    AlreadyPending {
        /// The outstanding value.
        value: i32,
    },
    /// The channel refused to send the update.
    UpdateFailed {
        /// Value that could not be sent.
        value: i32,
    },
}

/// What the acknowledgement path did with a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// `reported` advanced to the acknowledged value.
    Committed {
        /// Acknowledged value.
        value: i32,
    },
    /// Accepted, but older than a version already committed.
    Stale {
        /// Acknowledged value that was not applied.
        value: i32,
    },
    /// Accepted, but the payload carried no usable temperature.
    Malformed,
    /// The update was rejected.
    Rejected,
    /// The update timed out.
    TimedOut,
    /// Not an update acknowledgement.
    Ignored,
}

/// Apply one sensor notification to the store.
///
/// Temperature frames overwrite `observed`; button frames are logged.
/// Frames that fail to decode are logged and dropped.
pub fn handle_notification(store: &ShadowStateStore, notification: RawNotification) {
    match notification.kind {
        NotificationKind::Temperature => match TemperatureReading::from_bytes(&notification.data) {
            Ok(reading) => {
                debug!(temperature = %reading, "Temperature notification");
                store.set_observed(reading.celsius());
            }
            Err(e) => {
                warn!(error = %e, data = ?notification.data, "Discarding temperature frame");
            }
        },
        NotificationKind::Button => match ButtonState::from_bytes(&notification.data) {
            Ok(state) => info!(button = %state, "Button notification"),
            Err(e) => {
                warn!(error = %e, data = ?notification.data, "Discarding button frame");
            }
        },
        _ => {}
    }
}

/// Process an acknowledgement for an update request.
///
/// Only `accepted` responses touch the store, and the value committed is
/// the one carried in the response payload, so each acceptance resolves to
/// its own request regardless of what else is in flight.
pub fn handle_update_response(
    store: &ShadowStateStore,
    pending: &PendingUpdates,
    response: &ShadowResponse,
) -> AckOutcome {
    let token = response.token.as_str();

    match response.status {
        ResponseStatus::Accepted => {
            let settled = pending.settle(token);
            let document = match ShadowDocument::from_json(&response.payload) {
                Ok(document) => document,
                Err(e) => {
                    warn!(token, error = %e, "Malformed update acknowledgement");
                    return AckOutcome::Malformed;
                }
            };
            let value = match document.reported_temperature_value() {
                Ok(value) => value,
                Err(e) => {
                    warn!(token, error = %e, "Update acknowledgement has no temperature");
                    return AckOutcome::Malformed;
                }
            };
            if let Some(update) = settled
                && update.value != value
            {
                debug!(token, sent = update.value, acknowledged = value, "Acknowledged value differs from sent value");
            }

            match store.commit_reported(value, document.version) {
                CommitOutcome::Applied { previous } => {
                    info!(
                        token,
                        value,
                        previous,
                        version = ?document.version,
                        accepted_at = ?document.timestamp_utc(),
                        "Update accepted"
                    );
                    AckOutcome::Committed { value }
                }
                CommitOutcome::Stale { current_version } => {
                    info!(
                        token,
                        value,
                        version = ?document.version,
                        current_version,
                        "Ignoring acceptance older than the committed version"
                    );
                    AckOutcome::Stale { value }
                }
            }
        }
        ResponseStatus::Rejected => {
            let settled = pending.settle(token);
            let value = settled.map(|update| update.value);
            match RejectedPayload::from_json(&response.payload) {
                Ok(rejected) => warn!(
                    token,
                    value = ?value,
                    code = ?rejected.code,
                    message = rejected.message.as_deref().unwrap_or(""),
                    "Update rejected"
                ),
                Err(_) => warn!(token, value = ?value, payload = %response.payload, "Update rejected"),
            }
            AckOutcome::Rejected
        }
        ResponseStatus::Timeout => {
            let settled = pending.settle(token);
            warn!(token, value = ?settled.map(|update| update.value), "Update timed out");
            AckOutcome::TimedOut
        }
        ResponseStatus::Delta => {
            debug!(token, "Delta delivered to update handler, ignoring");
            AckOutcome::Ignored
        }
    }
}

/// Drives the reconciliation loop for one thing.
pub struct Reconciler<L, C> {
    link: Arc<L>,
    channel: Arc<C>,
    thing_name: String,
    options: ReconcileOptions,
    store: Arc<ShadowStateStore>,
    pending: Arc<PendingUpdates>,
}

impl<L, C> std::fmt::Debug for Reconciler<L, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("thing_name", &self.thing_name)
            .field("options", &self.options)
            .field("store", &self.store.snapshot())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl<L: SensorLink, C: ShadowChannel> Reconciler<L, C> {
    /// Create a reconciler with a fresh store.
    pub fn new(
        link: Arc<L>,
        channel: Arc<C>,
        thing_name: impl Into<String>,
        options: ReconcileOptions,
    ) -> Self {
        Self::with_store(link, channel, thing_name, options, Arc::new(ShadowStateStore::new()))
    }

    /// Create a reconciler around an existing store.
    pub fn with_store(
        link: Arc<L>,
        channel: Arc<C>,
        thing_name: impl Into<String>,
        options: ReconcileOptions,
        store: Arc<ShadowStateStore>,
    ) -> Self {
        Self {
            link,
            channel,
            thing_name: thing_name.into(),
            options,
            store,
            pending: Arc::new(PendingUpdates::new()),
        }
    }

    /// The shared state store.
    pub fn store(&self) -> &Arc<ShadowStateStore> {
        &self.store
    }

    /// The outstanding-update table.
    pub fn pending(&self) -> &Arc<PendingUpdates> {
        &self.pending
    }

    /// The loop's timing options.
    pub fn options(&self) -> &ReconcileOptions {
        &self.options
    }

    /// Build the acknowledgement handler passed with every update.
    fn ack_handler(&self) -> ShadowHandler {
        let store = Arc::clone(&self.store);
        let pending = Arc::clone(&self.pending);
        Arc::new(move |response: ShadowResponse| {
            handle_update_response(&store, &pending, &response);
        })
    }

    /// Wait for sensor events, then reconcile once.
    ///
    /// A failing wait is logged and followed by a pause of one wake interval
    /// before reconciling, so a lost link does not spin.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let store = Arc::clone(&self.store);
        let handler = move |notification: RawNotification| handle_notification(&store, notification);

        match self
            .link
            .wait_for_events(self.options.wake_interval, &handler)
            .await
        {
            Ok(0) => debug!("Wake interval elapsed without notifications"),
            Ok(count) => debug!(count, "Dispatched notifications"),
            Err(e) => {
                warn!(address = self.link.address(), error = %e, "Sensor wait failed");
                tokio::time::sleep(self.options.wake_interval).await;
            }
        }

        self.reconcile().await
    }

    /// Compare `observed` with `reported` and send an update if they differ.
    pub async fn reconcile(&self) -> CycleOutcome {
        let expired = self.pending.sweep_expired(self.options.update_timeout);
        if !expired.is_empty() {
            warn!(tokens = ?expired, "Dropped updates the channel never resolved");
        }

        let observed = self.store.observed();
        let reported = self.store.reported();

        if observed == reported {
            debug!(value = observed, "In sync");
            return CycleOutcome::InSync { value: observed };
        }
        if self.pending.contains_value(observed) {
            debug!(value = observed, "Update already outstanding");
            return CycleOutcome::AlreadyPending { value: observed };
        }

        let payload = match ShadowDocument::reported_temperature(observed).to_json() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(value = observed, error = %e, "Failed to encode update");
                return CycleOutcome::UpdateFailed { value: observed };
            }
        };

        match self
            .channel
            .update(
                &self.thing_name,
                &payload,
                self.ack_handler(),
                self.options.update_timeout,
            )
            .await
        {
            Ok(token) => {
                let update = PendingUpdate::new(observed, self.options.update_timeout);
                if self.pending.insert(token.clone(), update) {
                    info!(token = %token, value = observed, reported, "Update issued");
                } else {
                    debug!(token = %token, value = observed, "Update resolved before issue returned");
                }
                CycleOutcome::UpdateIssued {
                    token,
                    value: observed,
                }
            }
            Err(e) => {
                warn!(value = observed, error = %e, "Failed to send update");
                CycleOutcome::UpdateFailed { value: observed }
            }
        }
    }

    /// Run cycles until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            thing = %self.thing_name,
            address = self.link.address(),
            wake_interval = ?self.options.wake_interval,
            update_timeout = ?self.options.update_timeout,
            "Reconciliation loop started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.run_cycle() => {}
            }
        }

        info!(
            pending = self.pending.len(),
            store = ?self.store.snapshot(),
            "Reconciliation loop stopped"
        );
    }
}
