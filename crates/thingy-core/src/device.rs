//! Thingy:52 connection and notification handling.
//!
//! [`ThingyDevice`] owns the BLE connection to one sensor. Notifications from
//! the temperature and button characteristics are forwarded by a background
//! task into a queue, and handed to the caller in
//! [`SensorLink::wait_for_events`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Characteristic, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use futures::{Stream, StreamExt};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use thingy_types::NotificationKind;
use thingy_types::uuids::{
    ENVIRONMENT_CONFIG, ENVIRONMENT_SERVICE, MAX_TEMPERATURE_INTERVAL_MS,
    MIN_TEMPERATURE_INTERVAL_MS, TEMPERATURE_INTERVAL_OFFSET,
};

use crate::error::{ConnectionFailureReason, Error, Result};
use crate::scan::{ScanOptions, find_device};
use crate::traits::{RawNotification, SensorLink};
use crate::util::{create_identifier, format_peripheral_id};

/// Default timeout for BLE characteristic read operations.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for BLE characteristic write operations.
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for BLE connection operations.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default timeout for service discovery.
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default temperature sampling interval.
pub const DEFAULT_TEMPERATURE_INTERVAL_MS: u16 = 5000;

/// Configuration for BLE connection timeouts and sensor setup.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use thingy_core::device::ConnectionConfig;
///
/// let config = ConnectionConfig::default()
///     .connection_timeout(Duration::from_secs(20))
///     .temperature_interval_ms(2000);
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for establishing a BLE connection.
    pub connection_timeout: Duration,
    /// Timeout for BLE read operations.
    pub read_timeout: Duration,
    /// Timeout for BLE write operations.
    pub write_timeout: Duration,
    /// Timeout for service discovery after connection.
    pub discovery_timeout: Duration,
    /// Temperature sampling interval written to the sensor when temperature
    /// notifications are enabled.
    pub temperature_interval_ms: u16,
    /// How to locate the sensor before connecting.
    pub scan: ScanOptions,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            temperature_interval_ms: DEFAULT_TEMPERATURE_INTERVAL_MS,
            scan: ScanOptions::default(),
        }
    }
}

impl ConnectionConfig {
    /// Create a new connection config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the read timeout.
    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the write timeout.
    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the service discovery timeout.
    #[must_use]
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Set the temperature sampling interval.
    #[must_use]
    pub fn temperature_interval_ms(mut self, interval: u16) -> Self {
        self.temperature_interval_ms = interval;
        self
    }

    /// Set the scan options.
    #[must_use]
    pub fn scan(mut self, scan: ScanOptions) -> Self {
        self.scan = scan;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validate_temperature_interval(self.temperature_interval_ms)?;
        for (name, value) in [
            ("connection_timeout", self.connection_timeout),
            ("read_timeout", self.read_timeout),
            ("write_timeout", self.write_timeout),
            ("discovery_timeout", self.discovery_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::invalid_config(format!("{name} must be > 0")));
            }
        }
        Ok(())
    }
}

fn validate_temperature_interval(interval_ms: u16) -> Result<()> {
    if !(MIN_TEMPERATURE_INTERVAL_MS..=MAX_TEMPERATURE_INTERVAL_MS).contains(&interval_ms) {
        return Err(Error::invalid_config(format!(
            "temperature interval {interval_ms} ms outside {MIN_TEMPERATURE_INTERVAL_MS}..={MAX_TEMPERATURE_INTERVAL_MS} ms"
        )));
    }
    Ok(())
}

/// Patch the temperature interval into an environment configuration block.
pub fn patch_temperature_interval(config: &mut [u8], interval_ms: u16) -> Result<()> {
    let end = TEMPERATURE_INTERVAL_OFFSET + 2;
    let len = config.len();
    let slot = config.get_mut(TEMPERATURE_INTERVAL_OFFSET..end).ok_or_else(|| {
        Error::InvalidData(format!(
            "environment configuration is {len} bytes, need at least {end}"
        ))
    })?;
    slot.copy_from_slice(&interval_ms.to_le_bytes());
    Ok(())
}

/// A connected Thingy:52.
///
/// Share it across tasks with `Arc<ThingyDevice>`.
///
/// # Cleanup
///
/// Call [`ThingyDevice::disconnect`] before dropping the device. Dropping a
/// connected device logs a warning and disconnects in the background.
pub struct ThingyDevice {
    /// Kept alive for the lifetime of the peripheral connection.
    #[allow(dead_code)]
    adapter: Adapter,
    peripheral: Peripheral,
    name: Option<String>,
    /// MAC address on Linux/Windows, peripheral UUID on macOS.
    address: String,
    characteristics_cache: RwLock<HashMap<Uuid, Characteristic>>,
    /// Handed to the forwarder on first use; the queue closes when it exits.
    notification_tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<RawNotification>>>,
    notification_rx: Mutex<mpsc::UnboundedReceiver<RawNotification>>,
    forwarder: Mutex<Option<tokio::task::JoinHandle<()>>>,
    disconnected: AtomicBool,
    /// Set by the forwarder when the peripheral's notification stream ends.
    link_lost: Arc<AtomicBool>,
    config: ConnectionConfig,
}

impl std::fmt::Debug for ThingyDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThingyDevice")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("disconnected", &self.disconnected.load(Ordering::Relaxed))
            .field("link_lost", &self.link_lost.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ThingyDevice {
    /// Connect to a Thingy:52 by MAC address.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use thingy_core::ThingyDevice;
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let device = ThingyDevice::connect("C8:2E:11:22:33:44").await?;
    ///     println!("Connected to {:?}", device);
    ///     device.disconnect().await?;
    ///     Ok(())
    /// }
    /// ```
    #[tracing::instrument(level = "info", skip_all, fields(address = %address))]
    pub async fn connect(address: &str) -> Result<Self> {
        Self::connect_with_config(address, ConnectionConfig::default()).await
    }

    /// Connect with custom timeouts and sensor settings.
    #[tracing::instrument(level = "info", skip_all, fields(address = %address))]
    pub async fn connect_with_config(address: &str, config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        let (adapter, peripheral) = find_device(address, &config.scan).await?;
        Self::from_peripheral_with_config(adapter, peripheral, config).await
    }

    /// Create a device from an already-discovered peripheral.
    #[tracing::instrument(level = "info", skip_all, fields(connect_timeout = ?config.connection_timeout))]
    pub async fn from_peripheral_with_config(
        adapter: Adapter,
        peripheral: Peripheral,
        config: ConnectionConfig,
    ) -> Result<Self> {
        info!("Connecting to device...");
        timeout(config.connection_timeout, peripheral.connect())
            .await
            .map_err(|_| Error::timeout("connect to device", config.connection_timeout))??;
        info!("Connected");

        timeout(config.discovery_timeout, peripheral.discover_services())
            .await
            .map_err(|_| Error::timeout("discover services", config.discovery_timeout))??;

        let services = peripheral.services();
        debug!("Found {} services", services.len());

        let mut characteristics_cache = HashMap::new();
        for service in &services {
            debug!("  Service: {}", service.uuid);
            for char in &service.characteristics {
                debug!("    Characteristic: {}", char.uuid);
                characteristics_cache.insert(char.uuid, char.clone());
            }
        }

        let properties = peripheral.properties().await?;
        let name = properties.as_ref().and_then(|p| p.local_name.clone());
        let address = properties
            .as_ref()
            .map(|p| create_identifier(&p.address.to_string(), &peripheral.id()))
            .unwrap_or_else(|| format_peripheral_id(&peripheral.id()));

        if !services.iter().any(|s| s.uuid == ENVIRONMENT_SERVICE) {
            warn!(%address, "Environment service missing, disconnecting");
            if let Err(e) = peripheral.disconnect().await {
                debug!(error = %e, "Disconnect after failed validation failed");
            }
            return Err(Error::connection_failed(
                Some(address),
                ConnectionFailureReason::NotAThingy,
            ));
        }

        let (notification_tx, notification_rx) = mpsc::unbounded_channel();

        Ok(Self {
            adapter,
            peripheral,
            name,
            address,
            characteristics_cache: RwLock::new(characteristics_cache),
            notification_tx: parking_lot::Mutex::new(Some(notification_tx)),
            notification_rx: Mutex::new(notification_rx),
            forwarder: Mutex::new(None),
            disconnected: AtomicBool::new(false),
            link_lost: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    /// Check if the device is connected (queries BLE stack state).
    pub async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    /// Get the current connection configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Get the device name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Get the device address or identifier.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Disconnect from the device.
    ///
    /// Stops the notification forwarder, then disconnects the peripheral.
    #[tracing::instrument(level = "info", skip(self), fields(address = %self.address))]
    pub async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting from device...");
        self.disconnected.store(true, Ordering::SeqCst);

        if let Some(handle) = self.forwarder.lock().await.take() {
            handle.abort();
        }

        self.peripheral.disconnect().await?;
        Ok(())
    }

    async fn find_characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        let cache = self.characteristics_cache.read().await;
        cache.get(&uuid).cloned().ok_or_else(|| {
            Error::characteristic_not_found(uuid.to_string(), self.peripheral.services().len())
        })
    }

    /// Read a characteristic value by UUID.
    pub async fn read_characteristic(&self, uuid: Uuid) -> Result<Vec<u8>> {
        let characteristic = self.find_characteristic(uuid).await?;
        let data = timeout(self.config.read_timeout, self.peripheral.read(&characteristic))
            .await
            .map_err(|_| {
                Error::timeout(format!("read characteristic {}", uuid), self.config.read_timeout)
            })??;
        Ok(data)
    }

    /// Write a value to a characteristic.
    pub async fn write_characteristic(&self, uuid: Uuid, data: &[u8]) -> Result<()> {
        let characteristic = self.find_characteristic(uuid).await?;
        timeout(
            self.config.write_timeout,
            self.peripheral
                .write(&characteristic, data, WriteType::WithResponse),
        )
        .await
        .map_err(|_| {
            Error::timeout(format!("write characteristic {}", uuid), self.config.write_timeout)
        })??;
        Ok(())
    }

    /// Set how often the sensor samples temperature.
    ///
    /// Reads the environment configuration block, replaces the temperature
    /// interval and writes the block back so the other intervals are kept.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn configure_temperature_interval(&self, interval_ms: u16) -> Result<()> {
        validate_temperature_interval(interval_ms)?;
        let mut block = self.read_characteristic(ENVIRONMENT_CONFIG).await?;
        patch_temperature_interval(&mut block, interval_ms)?;
        self.write_characteristic(ENVIRONMENT_CONFIG, &block).await?;
        info!(interval_ms, "Temperature interval configured");
        Ok(())
    }

    /// Start the task that moves BLE notifications into the queue.
    async fn ensure_forwarder(&self) -> Result<()> {
        let mut forwarder = self.forwarder.lock().await;
        if forwarder.is_some() {
            return Ok(());
        }

        let Some(tx) = self.notification_tx.lock().take() else {
            return Err(Error::NotConnected);
        };
        let stream = self
            .peripheral
            .notifications()
            .await?
            .map(|notification| (notification.uuid, notification.value));
        let handle = tokio::spawn(forward_notifications(
            stream,
            tx,
            Arc::clone(&self.link_lost),
            self.address.clone(),
        ));
        *forwarder = Some(handle);
        Ok(())
    }

    fn is_usable(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst) && !self.link_lost.load(Ordering::SeqCst)
    }
}

/// Move `(characteristic, value)` pairs into the queue until the stream ends.
///
/// The end of the stream means the peripheral dropped the connection: the
/// link is flagged as lost and `tx` is dropped, closing the queue.
async fn forward_notifications<S>(
    mut stream: S,
    tx: mpsc::UnboundedSender<RawNotification>,
    link_lost: Arc<AtomicBool>,
    address: String,
) where
    S: Stream<Item = (Uuid, Vec<u8>)> + Unpin,
{
    while let Some((uuid, value)) = stream.next().await {
        let Some(kind) = NotificationKind::from_characteristic(uuid) else {
            debug!(%uuid, "Notification from unexpected characteristic");
            continue;
        };
        if tx.send(RawNotification::new(kind, value)).is_err() {
            break;
        }
    }
    link_lost.store(true, Ordering::SeqCst);
    warn!(%address, "Notification stream ended, sensor link lost");
}

/// Wait up to `wait` for the first queued notification, then drain the rest.
async fn drain_notifications(
    rx: &mut mpsc::UnboundedReceiver<RawNotification>,
    wait: Duration,
    handler: &(dyn Fn(RawNotification) + Send + Sync),
) -> Result<usize> {
    let first = match timeout(wait, rx.recv()).await {
        Err(_) => return Ok(0),
        Ok(None) => return Err(Error::NotConnected),
        Ok(Some(notification)) => notification,
    };

    handler(first);
    let mut count = 1;
    while let Ok(notification) = rx.try_recv() {
        handler(notification);
        count += 1;
    }
    Ok(count)
}

#[async_trait]
impl SensorLink for ThingyDevice {
    fn address(&self) -> &str {
        ThingyDevice::address(self)
    }

    async fn enable_notifications(&self, kinds: &[NotificationKind]) -> Result<()> {
        if !self.is_usable() {
            return Err(Error::NotConnected);
        }

        self.ensure_forwarder().await?;
        for kind in kinds {
            if *kind == NotificationKind::Temperature {
                self.configure_temperature_interval(self.config.temperature_interval_ms)
                    .await?;
            }
            let characteristic = self.find_characteristic(kind.characteristic()).await?;
            self.peripheral.subscribe(&characteristic).await?;
            info!(kind = %kind, "Notifications enabled");
        }
        Ok(())
    }

    async fn wait_for_events(
        &self,
        wait: Duration,
        handler: &(dyn Fn(RawNotification) + Send + Sync),
    ) -> Result<usize> {
        if !self.is_usable() {
            return Err(Error::NotConnected);
        }

        let mut rx = self.notification_rx.lock().await;
        drain_notifications(&mut rx, wait, handler).await
    }

    async fn disconnect(&self) -> Result<()> {
        ThingyDevice::disconnect(self).await
    }
}

impl Drop for ThingyDevice {
    fn drop(&mut self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }

        warn!(
            device_address = %self.address,
            "Device dropped without calling disconnect() - performing best-effort cleanup"
        );

        if let Ok(mut forwarder) = self.forwarder.try_lock()
            && let Some(handle) = forwarder.take()
        {
            handle.abort();
        }

        let peripheral = self.peripheral.clone();
        let address = self.address.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = peripheral.disconnect().await {
                    debug!(device_address = %address, error = %e, "Best-effort disconnect failed");
                }
            });
        }
    }
}
