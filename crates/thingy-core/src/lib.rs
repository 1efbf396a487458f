//! BLE sensor link and shadow reconciliation core for the Nordic Thingy:52.
//!
//! This crate connects to a Thingy:52 over Bluetooth Low Energy, keeps the
//! latest temperature it reports, and reconciles that value with a remote
//! device shadow through any [`ShadowChannel`] implementation.
//!
//! # Components
//!
//! - **Sensor link**: [`ThingyDevice`] implements [`SensorLink`] on top of
//!   `btleplug`; temperature and button notifications are queued and handed
//!   to the reconciliation loop on each wake.
//! - **State store**: [`ShadowStateStore`] holds `observed` (latest sensor
//!   value) and `reported` (latest value the shadow service accepted).
//! - **Reconciliation loop**: [`Reconciler`] sends an update whenever the two
//!   diverge, and advances `reported` only on acceptance.
//! - **Delta handler**: [`DeltaHandler`] logs desired-state pushes and
//!   forwards them to an optional [`DesiredStateSink`].
//!
//! # Platform Differences
//!
//! On Linux and Windows the sensor is identified by its MAC address. On
//! macOS CoreBluetooth hides MAC addresses, so the peripheral UUID assigned
//! by the OS is used instead.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use thingy_core::{
//!     MockShadowChannel, ReconcileOptions, Reconciler, SensorLink, ThingyDevice,
//! };
//! use thingy_types::NotificationKind;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let device = Arc::new(ThingyDevice::connect("C8:2E:11:22:33:44").await?);
//!     device
//!         .enable_notifications(&[NotificationKind::Temperature, NotificationKind::Button])
//!         .await?;
//!
//!     let channel = Arc::new(MockShadowChannel::new());
//!     let reconciler = Reconciler::new(device.clone(), channel, "Bot", ReconcileOptions::default());
//!     reconciler.run(CancellationToken::new()).await;
//!
//!     device.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod delta;
pub mod device;
pub mod error;
pub mod mock;
pub mod pending;
pub mod reconcile;
pub mod scan;
pub mod store;
pub mod traits;
pub mod util;

pub use delta::{DeltaHandler, DeltaOutcome, DesiredStateSink, DesiredTemperature};
pub use device::{ConnectionConfig, ThingyDevice};
pub use error::{ConnectionFailureReason, DeviceNotFoundReason, Error, Result};
pub use mock::{MockSensorLink, MockShadowChannel, RecordedUpdate};
pub use pending::{PendingUpdate, PendingUpdates};
pub use reconcile::{
    AckOutcome, CycleOutcome, ReconcileOptions, ReconcileOptionsBuilder, Reconciler,
    handle_notification, handle_update_response,
};
pub use scan::ScanOptions;
pub use store::{CommitOutcome, NO_READING, ReportedState, ShadowStateStore, StoreSnapshot};
pub use traits::{
    RawNotification, ResponseStatus, SensorLink, ShadowChannel, ShadowHandler, ShadowResponse,
};
pub use util::{create_identifier, format_peripheral_id};

/// Shared device reference.
pub type SharedDevice = std::sync::Arc<ThingyDevice>;

// Re-export from thingy-types
pub use thingy_types::uuids;
pub use thingy_types::{ButtonState, NotificationKind, TemperatureReading};
