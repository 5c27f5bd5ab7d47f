/*!
 # Output channels

 The diffuser has eight outputs. The public API addresses them 1-based
 ([`Channel`]), the hardware mask stores them 0-based ([`OutputMask`]).
*/

use std::fmt;

use crate::{Error, Result};

/// Number of switchable outputs on the board
pub const CHANNEL_COUNT: usize = 8;

/// A validated 1-based output index (1..=8)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Channel(u8);

impl Channel {
    pub const FIRST: Channel = Channel(1);

    /// Creates a channel from its 1-based number
    pub fn new(number: u8) -> Result<Self> {
        if (1..=CHANNEL_COUNT as u8).contains(&number) {
            Ok(Self(number))
        } else {
            Err(Error::InvalidChannel(number))
        }
    }

    /// 1-based channel number as shown to users
    pub fn number(self) -> u8 {
        self.0
    }

    /// 0-based position in an [`OutputMask`]
    pub fn index(self) -> usize {
        (self.0 - 1) as usize
    }

    /// All eight channels in ascending order
    pub fn all() -> impl Iterator<Item = Channel> {
        (1..=CHANNEL_COUNT as u8).map(Channel)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Target of a manual command: a single channel or all of them at once.
///
/// On the wire channel `0` means "all".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    All,
    One(Channel),
}

impl Target {
    /// Parses the wire form where 0 selects every channel
    pub fn from_wire(ch: u8) -> Result<Self> {
        match ch {
            0 => Ok(Target::All),
            n => Channel::new(n).map(Target::One),
        }
    }

    pub fn includes(self, channel: Channel) -> bool {
        match self {
            Target::All => true,
            Target::One(c) => c == channel,
        }
    }
}

/// On/off state of all eight outputs, bit `ch - 1` per channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct OutputMask(u8);

impl OutputMask {
    /// Every output off
    pub const ALL_OFF: OutputMask = OutputMask(0x00);
    /// Every output on
    pub const ALL_ON: OutputMask = OutputMask(0xFF);

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_on(self, channel: Channel) -> bool {
        self.0 & (1 << channel.index()) != 0
    }

    /// Returns a copy with `channel` switched to `on`
    #[must_use]
    pub fn with(self, channel: Channel, on: bool) -> Self {
        let bit = 1 << channel.index();
        if on {
            Self(self.0 | bit)
        } else {
            Self(self.0 & !bit)
        }
    }

    pub fn set(&mut self, channel: Channel, on: bool) {
        *self = self.with(channel, on);
    }

    /// Channels whose state differs between `self` and `other`
    pub fn changed_channels(self, other: OutputMask) -> impl Iterator<Item = Channel> {
        let diff = self.0 ^ other.0;
        Channel::all().filter(move |c| diff & (1 << c.index()) != 0)
    }

    pub fn all_on(self) -> bool {
        self == Self::ALL_ON
    }

    pub fn any_on(self) -> bool {
        self.0 != 0
    }

    pub fn aggregate(self) -> Aggregate {
        match self.0 {
            0x00 => Aggregate::AllOff,
            0xFF => Aggregate::AllOn,
            _ => Aggregate::Mixed,
        }
    }
}

impl fmt::Display for OutputMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010b}", self.0)
    }
}

/// Summary of the whole board
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    AllOn,
    AllOff,
    Mixed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ch(n: u8) -> Channel {
        Channel::new(n).unwrap()
    }

    #[test]
    fn channel_range_is_enforced() {
        assert!(matches!(Channel::new(0), Err(Error::InvalidChannel(0))));
        assert!(matches!(Channel::new(9), Err(Error::InvalidChannel(9))));
        assert_eq!(ch(1).index(), 0);
        assert_eq!(ch(8).index(), 7);
    }

    #[test]
    fn channel_one_is_least_significant_bit() {
        let mask = OutputMask::ALL_OFF.with(ch(1), true);
        assert_eq!(mask.bits(), 0x01);
        let mask = mask.with(ch(8), true);
        assert_eq!(mask.bits(), 0x81);
        assert!(mask.is_on(ch(8)));
        assert!(!mask.is_on(ch(2)));
    }

    #[test]
    fn changed_channels_lists_differing_bits() {
        let old = OutputMask::from_bits(0b0000_0101);
        let new = OutputMask::from_bits(0b0000_0110);
        let changed: Vec<u8> = old.changed_channels(new).map(Channel::number).collect();
        assert_eq!(changed, vec![1, 2]);
    }

    #[test]
    fn aggregate_summary() {
        assert_eq!(OutputMask::ALL_OFF.aggregate(), Aggregate::AllOff);
        assert_eq!(OutputMask::ALL_ON.aggregate(), Aggregate::AllOn);
        assert_eq!(OutputMask::from_bits(0x10).aggregate(), Aggregate::Mixed);
    }

    #[test]
    fn wire_target_zero_means_all() {
        assert_eq!(Target::from_wire(0).unwrap(), Target::All);
        assert_eq!(Target::from_wire(3).unwrap(), Target::One(ch(3)));
        assert!(Target::from_wire(9).is_err());
    }
}
