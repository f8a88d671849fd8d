//! Controller command topics
//!
//! Inbound bus messages are plain text payloads on fixed topics. They decode
//! into a typed [`Command`] and go to whatever executes actuators.

use std::fmt;

use thiserror::Error;

pub const FIRST_SWITCH_COMMAND: &str = "firstSwitchCommand";
pub const SECOND_SWITCH_COMMAND: &str = "secondSwitchCommand";
pub const THIRD_SWITCH_COMMAND: &str = "thirdSwitchCommand";
pub const PUMP_COMMAND: &str = "pumpCommand";
pub const FIRST_LIGHT_COMMAND: &str = "firstLightCommand";
pub const SECOND_LIGHT_COMMAND: &str = "secondLightCommand";
pub const FIRST_BRIGHTNESS_COMMAND: &str = "firstBrightnessCommand";
pub const SECOND_BRIGHTNESS_COMMAND: &str = "secondBrightnessCommand";
pub const FIRST_RGB_COMMAND: &str = "firstRgbCommand";
pub const SECOND_RGB_COMMAND: &str = "secondRgbCommand";
pub const FAN_COMMAND: &str = "fanCommand";
pub const FAN_SPEED_COMMAND: &str = "fanSpeedCommand";

/// Every topic the bus client subscribes to after connecting
pub const COMMAND_TOPICS: [&str; 12] = [
    FIRST_SWITCH_COMMAND,
    SECOND_SWITCH_COMMAND,
    THIRD_SWITCH_COMMAND,
    PUMP_COMMAND,
    FIRST_LIGHT_COMMAND,
    SECOND_LIGHT_COMMAND,
    FIRST_BRIGHTNESS_COMMAND,
    SECOND_BRIGHTNESS_COMMAND,
    FIRST_RGB_COMMAND,
    SECOND_RGB_COMMAND,
    FAN_COMMAND,
    FAN_SPEED_COMMAND,
];

/// State published once per bus connection so dashboards start from a
/// known baseline: everything off, lights at full white, sensors zeroed.
pub const DEFAULT_STATE: [(&str, &str); 19] = [
    ("firstSwitchState", "off"),
    ("secondSwitchState", "off"),
    ("thirdSwitchState", "off"),
    ("pumpState", "off"),
    ("firstLightState", "off"),
    ("secondLightState", "off"),
    ("firstBrightnessState", "255"),
    ("secondBrightnessState", "255"),
    ("firstRgbState", "255,255,255"),
    ("secondRgbState", "255,255,255"),
    ("fanState", "off"),
    ("fanSpeedState", "100"),
    ("firstSoilMoisture", "0.0"),
    ("secondSoilMoisture", "0.0"),
    ("thirdSoilMoisture", "0.0"),
    ("environmentMoisture", "0.0"),
    ("environmentTemp", "0.0"),
    ("atmos", "0.0"),
    ("tds", "0.0"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Switch {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Switch valve 1..=3
    Valve { index: u8, state: Switch },
    Pump(Switch),
    /// LED strip 1..=2
    Light { index: u8, state: Switch },
    Brightness { index: u8, level: u8 },
    Color { index: u8, rgb: Rgb },
    Fan(Switch),
    /// Percent, 0..=100
    FanSpeed(u8),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command topic {0}")]
    UnknownTopic(String),
    #[error("invalid payload {payload:?} on {topic}")]
    InvalidPayload { topic: String, payload: String },
}

/// Executes decoded commands against the actuators
pub trait CommandSink: Send + Sync {
    fn execute(&self, command: Command) -> anyhow::Result<()>;
}

impl Command {
    pub fn decode(topic: &str, payload: &[u8]) -> Result<Command, CommandError> {
        let invalid = || CommandError::InvalidPayload {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
        };
        let text = std::str::from_utf8(payload).map_err(|_| invalid())?.trim();

        let switch = || match text {
            "on" => Ok(Switch::On),
            "off" => Ok(Switch::Off),
            _ => Err(invalid()),
        };
        let level = || text.parse::<u8>().map_err(|_| invalid());

        let command = match topic {
            FIRST_SWITCH_COMMAND => Command::Valve { index: 1, state: switch()? },
            SECOND_SWITCH_COMMAND => Command::Valve { index: 2, state: switch()? },
            THIRD_SWITCH_COMMAND => Command::Valve { index: 3, state: switch()? },
            PUMP_COMMAND => Command::Pump(switch()?),
            FIRST_LIGHT_COMMAND => Command::Light { index: 1, state: switch()? },
            SECOND_LIGHT_COMMAND => Command::Light { index: 2, state: switch()? },
            FIRST_BRIGHTNESS_COMMAND => Command::Brightness { index: 1, level: level()? },
            SECOND_BRIGHTNESS_COMMAND => Command::Brightness { index: 2, level: level()? },
            FIRST_RGB_COMMAND => Command::Color {
                index: 1,
                rgb: parse_rgb(text).ok_or_else(invalid)?,
            },
            SECOND_RGB_COMMAND => Command::Color {
                index: 2,
                rgb: parse_rgb(text).ok_or_else(invalid)?,
            },
            FAN_COMMAND => Command::Fan(switch()?),
            FAN_SPEED_COMMAND => {
                let speed = level()?;
                if speed > 100 {
                    return Err(invalid());
                }
                Command::FanSpeed(speed)
            }
            other => return Err(CommandError::UnknownTopic(other.to_string())),
        };
        Ok(command)
    }
}

// "r,g,b" with each channel 0..=255
fn parse_rgb(text: &str) -> Option<Rgb> {
    let mut channels = text.split(',').map(|c| c.trim().parse::<u8>());
    let rgb = Rgb {
        r: channels.next()?.ok()?,
        g: channels.next()?.ok()?,
        b: channels.next()?.ok()?,
    };
    channels.next().is_none().then_some(rgb)
}

impl fmt::Display for Switch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Switch::On => write!(f, "on"),
            Switch::Off => write!(f, "off"),
        }
    }
}
