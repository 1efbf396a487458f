//! Device lookup by address.
//!
//! The sensor is addressed by its Bluetooth MAC address (or, on macOS, by
//! the peripheral UUID the OS assigns). Lookup first checks peripherals the
//! adapter already knows about, then scans with increasing durations.

use std::time::Duration;

use btleplug::api::{Central, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use thingy_types::uuids::{ENVIRONMENT_SERVICE, UI_SERVICE};

use crate::error::{DeviceNotFoundReason, Error, Result};
use crate::util::{format_peripheral_id, normalize_address};

/// Options for locating the sensor.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Duration of the first scan attempt; attempt `n` scans `n` times as long.
    pub duration: Duration,
    /// Number of scan attempts before giving up.
    pub max_attempts: u32,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(5),
            max_attempts: 3,
        }
    }
}

impl ScanOptions {
    /// Create new scan options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base scan duration.
    #[must_use]
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Set the number of scan attempts.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Scan duration for a 1-based attempt number.
    pub fn attempt_duration(&self, attempt: u32) -> Duration {
        self.duration * attempt.max(1)
    }
}

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    adapters
        .into_iter()
        .next()
        .ok_or(Error::DeviceNotFound(DeviceNotFoundReason::NoAdapter))
}

/// Find the sensor with the given address.
#[tracing::instrument(level = "info", skip(options), fields(attempts = options.max_attempts))]
pub async fn find_device(address: &str, options: &ScanOptions) -> Result<(Adapter, Peripheral)> {
    let adapter = get_adapter().await?;
    let wanted = normalize_address(address);

    if let Some(peripheral) = find_known_peripheral(&adapter, &wanted).await? {
        info!("Found device without scanning");
        return Ok((adapter, peripheral));
    }

    for attempt in 1..=options.max_attempts {
        let scan_duration = options.attempt_duration(attempt);
        info!(
            attempt,
            total = options.max_attempts,
            duration_secs = scan_duration.as_secs(),
            "Scanning for device"
        );

        adapter.start_scan(ScanFilter::default()).await?;
        sleep(scan_duration).await;
        adapter.stop_scan().await?;

        if let Some(peripheral) = find_known_peripheral(&adapter, &wanted).await? {
            info!(attempt, "Found device");
            return Ok((adapter, peripheral));
        }

        if attempt < options.max_attempts {
            warn!(attempt, "Device not found, retrying");
        }
    }

    warn!(attempts = options.max_attempts, "Device not found");
    Err(Error::device_not_found(address))
}

/// Search the adapter's known peripherals for one matching `wanted`.
async fn find_known_peripheral(adapter: &Adapter, wanted: &str) -> Result<Option<Peripheral>> {
    for peripheral in adapter.peripherals().await? {
        let Ok(Some(props)) = peripheral.properties().await else {
            continue;
        };
        let peripheral_id = format_peripheral_id(&peripheral.id());
        if matches_address(&props.address.to_string(), &peripheral_id, wanted) {
            debug!(
                address = %props.address,
                name = ?props.local_name,
                thingy = advertises_thingy(&props),
                "Matched peripheral"
            );
            return Ok(Some(peripheral));
        }
    }
    Ok(None)
}

/// Whether a peripheral's address or platform identifier matches `wanted`.
///
/// `wanted` must already be normalized with [`normalize_address`]. The
/// all-zero address macOS reports is never matched.
pub fn matches_address(address: &str, peripheral_id: &str, wanted: &str) -> bool {
    if wanted.is_empty() {
        return false;
    }
    let address = normalize_address(address);
    if address != "000000000000" && address == wanted {
        return true;
    }
    normalize_address(peripheral_id) == wanted
}

/// Whether the advertisement looks like a Thingy:52.
pub fn advertises_thingy(properties: &PeripheralProperties) -> bool {
    if properties
        .services
        .iter()
        .any(|uuid| *uuid == ENVIRONMENT_SERVICE || *uuid == UI_SERVICE)
    {
        return true;
    }
    properties
        .local_name
        .as_deref()
        .is_some_and(|name| name.to_lowercase().contains("thingy"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_options() {
        let options = ScanOptions::new()
            .duration(Duration::from_secs(2))
            .max_attempts(0);
        assert_eq!(options.max_attempts, 1);
        assert_eq!(options.attempt_duration(1), Duration::from_secs(2));
        assert_eq!(options.attempt_duration(3), Duration::from_secs(6));
    }

    #[test]
    fn test_matches_address() {
        let wanted = normalize_address("C8:2E:11:22:33:44");
        assert!(matches_address("c8:2e:11:22:33:44", "hci0/dev_C8_2E", &wanted));
        assert!(matches_address("C8-2E-11-22-33-44", "", &wanted));
        assert!(!matches_address("C8:2E:11:22:33:45", "", &wanted));
    }

    #[test]
    fn test_matches_zero_address_never() {
        let wanted = normalize_address("00:00:00:00:00:00");
        assert!(!matches_address("00:00:00:00:00:00", "abc", &wanted));
    }

    #[test]
    fn test_matches_peripheral_uuid() {
        let id = "5B5E4F3A-0C9B-4B0E-9F00-1D2C3B4A5F6E";
        let wanted = normalize_address(id);
        assert!(matches_address("00:00:00:00:00:00", id, &wanted));
    }

    #[test]
    fn test_advertises_thingy() {
        let mut props = PeripheralProperties::default();
        assert!(!advertises_thingy(&props));

        props.local_name = Some("Thingy".to_string());
        assert!(advertises_thingy(&props));

        props.local_name = None;
        props.services = vec![ENVIRONMENT_SERVICE];
        assert!(advertises_thingy(&props));
    }
}
