/*!
 # Scheduling for the diffuser outputs

 Rules switch a channel on inside a daily time window on selected weekdays.
 [`evaluate`] turns the rule table and the current time into the mask the
 schedule wants on the outputs.
*/

use std::fmt;
use std::str::FromStr;

use chrono::Weekday;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::channel::{Channel, OutputMask};
use crate::clock::ClockReading;
use crate::{Error, Result};

/// Number of rule slots the controller keeps
pub const MAX_RULES: usize = 16;

/// Minutes in one day; valid minute-of-day values are below this
pub const MINUTES_PER_DAY: u16 = 1440;

/// Set of weekdays a rule is active on, bit 0 = Monday .. bit 6 = Sunday
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Days(u8);

impl Days {
    /// Monday (0x01)
    pub const MONDAY: Days = Days(0x01);
    /// Tuesday (0x02)
    pub const TUESDAY: Days = Days(0x02);
    /// Wednesday (0x04)
    pub const WEDNESDAY: Days = Days(0x04);
    /// Thursday (0x08)
    pub const THURSDAY: Days = Days(0x08);
    /// Friday (0x10)
    pub const FRIDAY: Days = Days(0x10);
    /// Saturday (0x20)
    pub const SATURDAY: Days = Days(0x20);
    /// Sunday (0x40)
    pub const SUNDAY: Days = Days(0x40);
    /// All days (0x7F)
    pub const ALL: Days = Days(0x7F);
    /// Week days (Monday-Friday, 0x1F)
    pub const WEEK_DAYS: Days = Days(0x1F);
    /// Weekend days (Saturday-Sunday, 0x60)
    pub const WEEKEND: Days = Days(0x60);
    /// No days (0x00)
    pub const NONE: Days = Days(0x00);

    /// Builds a day set from its raw bits, rejecting anything above bit 6
    pub fn from_bits(bits: u8) -> std::result::Result<Self, RuleError> {
        if bits & !Self::ALL.0 != 0 {
            return Err(RuleError::DaysOutOfRange(bits));
        }
        Ok(Self(bits))
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn of(day: Weekday) -> Self {
        Self(1 << day.num_days_from_monday())
    }

    pub fn contains(self, day: Weekday) -> bool {
        self.0 & Self::of(day).0 != 0
    }

    #[must_use]
    pub fn union(self, other: Days) -> Self {
        Self(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl Default for Days {
    fn default() -> Self {
        Days::ALL
    }
}

impl fmt::Display for Days {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 7] = ["Mo", "Tu", "We", "Th", "Fr", "Sa", "Su"];
        if self.is_empty() {
            return write!(f, "-");
        }
        let mut first = true;
        for (bit, name) in NAMES.iter().enumerate() {
            if self.0 & (1 << bit) != 0 {
                if !first {
                    write!(f, ",")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        Ok(())
    }
}

impl FromStr for Days {
    type Err = Error;

    /// Accepts day names, `all`, `weekdays`, `weekend`, `none`, or a
    /// comma-separated combination of them
    fn from_str(s: &str) -> Result<Self> {
        let mut combined = Days::NONE;
        for token in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let day = match token.to_lowercase().as_str() {
                "mo" | "mon" | "monday" => Days::MONDAY,
                "tu" | "tue" | "tuesday" => Days::TUESDAY,
                "we" | "wed" | "wednesday" => Days::WEDNESDAY,
                "th" | "thu" | "thursday" => Days::THURSDAY,
                "fr" | "fri" | "friday" => Days::FRIDAY,
                "sa" | "sat" | "saturday" => Days::SATURDAY,
                "su" | "sun" | "sunday" => Days::SUNDAY,
                "all" => Days::ALL,
                "weekdays" => Days::WEEK_DAYS,
                "weekend" => Days::WEEKEND,
                "none" => Days::NONE,
                other => return Err(Error::Parse(format!("unknown day '{other}'"))),
            };
            combined = combined.union(day);
        }
        trace!("Days '{}' parsed to bitmask: {:#04x}", s, combined.0);
        Ok(combined)
    }
}

/// A minute of the day, 0 (00:00) to 1439 (23:59)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MinuteOfDay(u16);

impl MinuteOfDay {
    pub const MIDNIGHT: MinuteOfDay = MinuteOfDay(0);

    pub fn new(minute: u32) -> std::result::Result<Self, RuleError> {
        if minute < MINUTES_PER_DAY as u32 {
            Ok(Self(minute as u16))
        } else {
            Err(RuleError::MinuteOutOfRange(minute))
        }
    }

    /// Builds a minute from hour and minute, both range checked
    pub fn from_hm(hour: u8, minute: u8) -> Result<Self> {
        if hour > 23 {
            return Err(Error::ValueOutOfRange(hour as u32, 0, 23));
        }
        if minute > 59 {
            return Err(Error::ValueOutOfRange(minute as u32, 0, 59));
        }
        Ok(Self(hour as u16 * 60 + minute as u16))
    }

    pub fn get(self) -> u16 {
        self.0
    }

    pub fn hour(self) -> u8 {
        (self.0 / 60) as u8
    }

    pub fn minute(self) -> u8 {
        (self.0 % 60) as u8
    }
}

impl fmt::Display for MinuteOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl FromStr for MinuteOfDay {
    type Err = Error;

    /// Parses `HH:MM`
    fn from_str(s: &str) -> Result<Self> {
        let (h, m) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| Error::Parse(format!("expected HH:MM, got '{s}'")))?;
        let hour: u8 = h
            .parse()
            .map_err(|_| Error::Parse(format!("invalid hour '{h}'")))?;
        let minute: u8 = m
            .parse()
            .map_err(|_| Error::Parse(format!("invalid minute '{m}'")))?;
        Self::from_hm(hour, minute)
    }
}

/// Why a single rule was refused
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("channel {0} out of range (1..8)")]
    ChannelOutOfRange(u8),

    #[error("minute {0} out of range (0..1439)")]
    MinuteOutOfRange(u32),

    #[error("day mask {0:#04x} has bits beyond Sunday")]
    DaysOutOfRange(u8),
}

/// One time window that claims an output as on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleRule {
    pub enabled: bool,
    pub channel: Channel,
    pub start: MinuteOfDay,
    pub end: MinuteOfDay,
    pub days: Days,
}

impl Default for ScheduleRule {
    fn default() -> Self {
        Self {
            enabled: false,
            channel: Channel::FIRST,
            start: MinuteOfDay::MIDNIGHT,
            end: MinuteOfDay::MIDNIGHT,
            days: Days::ALL,
        }
    }
}

impl ScheduleRule {
    /// Whether this rule claims its channel at `now` on `weekday`.
    ///
    /// The window is `[start, end)`. `start == end` never matches. When
    /// `end < start` the window runs past midnight and the whole window,
    /// including the part after midnight, belongs to the weekday it starts on.
    pub fn matches(&self, now: MinuteOfDay, weekday: Weekday) -> bool {
        if !self.enabled {
            return false;
        }
        let (start, end) = (self.start, self.end);
        if start == end {
            false
        } else if start < end {
            self.days.contains(weekday) && start <= now && now < end
        } else {
            (now >= start && self.days.contains(weekday))
                || (now < end && self.days.contains(weekday.pred()))
        }
    }
}

/// Persisted and wire representation of a rule.
///
/// Field names follow the JSON the web UI exchanges:
/// `{"en":true,"ch":3,"s":480,"e":540,"d":127}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleRecord {
    pub en: bool,
    pub ch: u8,
    pub s: u32,
    pub e: u32,
    pub d: u8,
}

impl Default for RuleRecord {
    fn default() -> Self {
        ScheduleRule::default().into()
    }
}

impl From<ScheduleRule> for RuleRecord {
    fn from(rule: ScheduleRule) -> Self {
        Self {
            en: rule.enabled,
            ch: rule.channel.number(),
            s: rule.start.get() as u32,
            e: rule.end.get() as u32,
            d: rule.days.bits(),
        }
    }
}

impl TryFrom<RuleRecord> for ScheduleRule {
    type Error = RuleError;

    fn try_from(rec: RuleRecord) -> std::result::Result<Self, RuleError> {
        let channel = Channel::new(rec.ch).map_err(|_| RuleError::ChannelOutOfRange(rec.ch))?;
        Ok(Self {
            enabled: rec.en,
            channel,
            start: MinuteOfDay::new(rec.s)?,
            end: MinuteOfDay::new(rec.e)?,
            days: Days::from_bits(rec.d)?,
        })
    }
}

/// The full, fixed-size rule table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuleSet {
    slots: [ScheduleRule; MAX_RULES],
}

impl RuleSet {
    /// Validates a bulk replacement.
    ///
    /// Either every record is valid and the table is built (unused slots
    /// padded with disabled rules), or nothing is built at all.
    pub fn from_records(records: &[RuleRecord]) -> Result<Self> {
        if records.len() > MAX_RULES {
            return Err(Error::Capacity {
                what: "rules",
                limit: MAX_RULES,
            });
        }
        let mut slots = [ScheduleRule::default(); MAX_RULES];
        for (index, (slot, rec)) in slots.iter_mut().zip(records).enumerate() {
            *slot = ScheduleRule::try_from(*rec)
                .map_err(|reason| Error::InvalidRule { index, reason })?;
        }
        Ok(Self { slots })
    }

    /// All slots in display order, disabled ones included
    pub fn to_records(&self) -> Vec<RuleRecord> {
        self.slots.iter().copied().map(RuleRecord::from).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScheduleRule> {
        self.slots.iter()
    }

    pub fn enabled_count(&self) -> usize {
        self.slots.iter().filter(|r| r.enabled).count()
    }
}

/// Computes the mask the schedule asks for at `now` on `weekday`.
///
/// A channel is on when any enabled rule for it matches. Slot order plays
/// no part.
pub fn evaluate(rules: &RuleSet, now: MinuteOfDay, weekday: Weekday) -> OutputMask {
    let mut mask = OutputMask::ALL_OFF;
    for rule in rules.iter().filter(|r| r.matches(now, weekday)) {
        mask.set(rule.channel, true);
    }
    mask
}

/// Like [`evaluate`], but keeps every output off until the clock is trusted
pub fn evaluate_reading(rules: &RuleSet, reading: &ClockReading) -> OutputMask {
    if !reading.synchronized {
        return OutputMask::ALL_OFF;
    }
    evaluate(rules, reading.minute, reading.weekday)
}
