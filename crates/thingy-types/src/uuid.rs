//! Bluetooth UUIDs for the Nordic Thingy:52.
//!
//! All Thingy services share the vendor base UUID
//! `EF68xxxx-9B35-4933-9B10-52FFA9740042`.

use uuid::{Uuid, uuid};

// --- Environment service ---

/// Environment service (temperature, pressure, humidity, gas, color).
pub const ENVIRONMENT_SERVICE: Uuid = uuid!("ef680200-9b35-4933-9b10-52ffa9740042");

/// Temperature characteristic: `int8` whole degrees followed by `uint8` hundredths.
pub const TEMPERATURE: Uuid = uuid!("ef680201-9b35-4933-9b10-52ffa9740042");

/// Environment configuration characteristic.
///
/// The first two bytes hold the temperature sampling interval in
/// milliseconds (little-endian `u16`).
pub const ENVIRONMENT_CONFIG: Uuid = uuid!("ef680206-9b35-4933-9b10-52ffa9740042");

// --- User interface service ---

/// User interface service (LED, button).
pub const UI_SERVICE: Uuid = uuid!("ef680300-9b35-4933-9b10-52ffa9740042");

/// Button characteristic: one byte, `1` pressed, `0` released.
pub const BUTTON: Uuid = uuid!("ef680302-9b35-4933-9b10-52ffa9740042");

/// Byte offset of the temperature interval inside the environment configuration.
pub const TEMPERATURE_INTERVAL_OFFSET: usize = 0;

/// Smallest temperature sampling interval the firmware accepts, in milliseconds.
pub const MIN_TEMPERATURE_INTERVAL_MS: u16 = 100;

/// Largest temperature sampling interval the firmware accepts, in milliseconds.
pub const MAX_TEMPERATURE_INTERVAL_MS: u16 = 60_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuids_share_vendor_base() {
        for id in [ENVIRONMENT_SERVICE, TEMPERATURE, ENVIRONMENT_CONFIG, UI_SERVICE, BUTTON] {
            let s = id.to_string();
            assert!(s.starts_with("ef68"), "{s}");
            assert!(s.ends_with("-9b35-4933-9b10-52ffa9740042"), "{s}");
        }
    }

    #[test]
    fn test_characteristics_belong_to_their_service() {
        assert_eq!(&TEMPERATURE.to_string()[..6], &ENVIRONMENT_SERVICE.to_string()[..6]);
        assert_eq!(&BUTTON.to_string()[..6], &UI_SERVICE.to_string()[..6]);
    }
}
