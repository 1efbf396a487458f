//! Core types for Thingy:52 notification frames.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ParseError, ParseResult};

/// Length of a temperature notification frame.
pub const TEMPERATURE_FRAME_LEN: usize = 2;

/// Length of a button notification frame.
pub const BUTTON_FRAME_LEN: usize = 1;

/// Kind of notification a sensor link can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum NotificationKind {
    /// Temperature readings from the environment service.
    Temperature,
    /// Button presses from the user interface service.
    Button,
}

impl NotificationKind {
    /// Returns the BLE characteristic that carries this kind of notification.
    ///
    /// # Examples
    ///
    /// ```
    /// use thingy_types::{NotificationKind, uuid};
    ///
    /// assert_eq!(NotificationKind::Temperature.characteristic(), uuid::TEMPERATURE);
    /// assert_eq!(NotificationKind::Button.characteristic(), uuid::BUTTON);
    /// ```
    #[must_use]
    pub fn characteristic(&self) -> uuid::Uuid {
        match self {
            NotificationKind::Temperature => crate::uuid::TEMPERATURE,
            NotificationKind::Button => crate::uuid::BUTTON,
        }
    }

    /// Map a characteristic UUID back to the notification kind it carries.
    #[must_use]
    pub fn from_characteristic(uuid: uuid::Uuid) -> Option<Self> {
        if uuid == crate::uuid::TEMPERATURE {
            Some(NotificationKind::Temperature)
        } else if uuid == crate::uuid::BUTTON {
            Some(NotificationKind::Button)
        } else {
            None
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationKind::Temperature => write!(f, "temperature"),
            NotificationKind::Button => write!(f, "button"),
        }
    }
}

/// Decode the whole-degree byte of a temperature frame.
///
/// The byte is an 8-bit two's-complement integer: values of 128 and above
/// are negative.
///
/// # Examples
///
/// ```
/// use thingy_types::decode_temperature_byte;
///
/// assert_eq!(decode_temperature_byte(0xFF), -1);
/// assert_eq!(decode_temperature_byte(0x7F), 127);
/// assert_eq!(decode_temperature_byte(0x80), -128);
/// assert_eq!(decode_temperature_byte(0x05), 5);
/// ```
#[must_use]
pub fn decode_temperature_byte(raw: u8) -> i8 {
    raw as i8
}

/// A temperature reading decoded from a Thingy notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemperatureReading {
    /// Whole degrees Celsius.
    pub temperature: i8,
    /// Fractional part in hundredths of a degree (0-99).
    pub decimal: u8,
}

impl TemperatureReading {
    /// Parse a temperature frame.
    ///
    /// The frame is exactly two bytes: a signed whole-degree byte followed by
    /// an unsigned fractional byte.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidLength`] for any other frame size.
    pub fn from_bytes(data: &[u8]) -> ParseResult<Self> {
        match data {
            [whole, decimal] => Ok(Self {
                temperature: decode_temperature_byte(*whole),
                decimal: *decimal,
            }),
            _ => Err(ParseError::invalid_length(TEMPERATURE_FRAME_LEN, data.len())),
        }
    }

    /// Whole-degree value as stored in the shadow state.
    #[must_use]
    pub fn celsius(&self) -> i32 {
        i32::from(self.temperature)
    }
}

impl fmt::Display for TemperatureReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02} °C", self.temperature, self.decimal)
    }
}

/// Button state reported by the user interface service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonState {
    /// Button released.
    Released,
    /// Button pressed.
    Pressed,
}

impl ButtonState {
    /// Parse a button frame.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidLength`] if the frame is not one byte, or
    /// [`ParseError::InvalidValue`] for a byte other than `0` or `1`.
    pub fn from_bytes(data: &[u8]) -> ParseResult<Self> {
        match data {
            [0] => Ok(ButtonState::Released),
            [1] => Ok(ButtonState::Pressed),
            [other] => Err(ParseError::InvalidValue(format!(
                "unknown button state 0x{other:02X}"
            ))),
            _ => Err(ParseError::invalid_length(BUTTON_FRAME_LEN, data.len())),
        }
    }
}

impl fmt::Display for ButtonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ButtonState::Released => write!(f, "released"),
            ButtonState::Pressed => write!(f, "pressed"),
        }
    }
}
