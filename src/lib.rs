/*!
 # Zebra-Scent Diffuser Controller Library

 Schedule and output control for an eight-channel scent diffuser driven
 through a 74HC595-style shift register.

 ## Features

 * Up to 16 weekly time-window rules, including windows that wrap past midnight
 * Manual per-channel and all-channel overrides that release on the next
   schedule edge
 * Change-only register writes with per-channel change notifications
 * JSON persistence of rules and settings
 * Home Assistant integration over MQTT with discovery
 * A line-oriented operator console

 ## Example

 ```rust
 use zebra_scent::*;
 use chrono::Weekday;

 fn main() -> Result<()> {
     let clock = ManualClock::default();
     let mut controller = Controller::new(
         clock.clone(),
         SimulatedRegister::new(),
         MemoryStore::new(),
         SharedLink::default(),
     );

     // Channel 1, weekdays 08:00-09:00
     controller.replace_rules(&[RuleRecord {
         en: true,
         ch: 1,
         s: 8 * 60,
         e: 9 * 60,
         d: Days::WEEK_DAYS.bits(),
     }])?;

     clock.set(MinuteOfDay::from_hm(8, 30)?, Weekday::Tue);
     assert_eq!(controller.tick().bits(), 0b0000_0001);

     // Manual override until the schedule changes its mind
     controller.set_channel(1, false)?;
     assert_eq!(controller.applied().bits(), 0);

     Ok(())
 }
 ```
*/

use thiserror::Error;

pub use schedule::RuleError;

/// Custom error types for the Zebra-Scent controller library
#[derive(Error, Debug)]
pub enum Error {
    /// Channel number outside 1..=8
    #[error("Invalid channel {0} (expected 1..8)")]
    InvalidChannel(u8),

    /// A rule in a replacement table was refused
    #[error("Rule {index} invalid: {reason}")]
    InvalidRule { index: usize, reason: RuleError },

    /// More entries or bytes than the device keeps
    #[error("Too many {what} (limit {limit})")]
    Capacity { what: &'static str, limit: usize },

    /// Value out of range
    #[error("Value {0} out of range ({1}..{2})")]
    ValueOutOfRange(u32, u32, u32),

    /// Malformed text input
    #[error("{0}")]
    Parse(String),

    /// General error
    #[error("Error: {0}")]
    General(String),

    /// Filesystem error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Malformed or unserializable JSON
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Error from the MQTT client
    #[error(transparent)]
    Mqtt(#[from] rumqttc::ClientError),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod arbiter;
pub mod channel;
pub mod clock;
pub mod config;
pub mod console;
pub mod controller;
pub mod driver;
pub mod mqtt;
pub mod notify;
pub mod schedule;
pub mod store;

// Re-export key types
pub use arbiter::{ChannelState, OverrideArbiter};
pub use channel::{Aggregate, Channel, OutputMask, Target, CHANNEL_COUNT};
pub use clock::{ClockReading, ClockSource, ManualClock, SystemClock};
pub use config::{ChannelNames, Config, MqttSettings, MqttUpdate};
pub use controller::{Command, Controller, Link, Reply, Request, SharedLink, StateSnapshot};
pub use driver::{OutputDriver, ShiftRegisterPins, SimulatedRegister};
pub use mqtt::MqttBridge;
pub use notify::{ChangeNotifier, ChangeObserver, Notification};
pub use schedule::{evaluate, Days, MinuteOfDay, RuleRecord, RuleSet, ScheduleRule, MAX_RULES};
pub use store::{FileStore, MemoryStore, Persistence};
