//! Channel identifiers

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::protocol::ProtocolError;

/// Number of actuator channels on the hand
pub const CHANNEL_COUNT: usize = 9;

/// One of the nine actuator channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    ThumbFlexion = 0,
    ThumbOpposition = 1,
    IndexFingerDistal = 2,
    IndexFingerProximal = 3,
    MiddleFingerDistal = 4,
    MiddleFingerProximal = 5,
    RingFinger = 6,
    Pinky = 7,
    FingerSpread = 8,
}

/// Order in which channels are homed and enabled.
///
/// Mechanically coupled channels are sequenced so they do not push against
/// each other while one of them searches for its hard stop.
pub const RESET_ORDER: [Channel; CHANNEL_COUNT] = [
    Channel::IndexFingerProximal,
    Channel::MiddleFingerProximal,
    Channel::ThumbOpposition,
    Channel::ThumbFlexion,
    Channel::FingerSpread,
    Channel::MiddleFingerDistal,
    Channel::IndexFingerDistal,
    Channel::RingFinger,
    Channel::Pinky,
];

impl Channel {
    /// All channels in index order
    pub const ALL: [Channel; CHANNEL_COUNT] = [
        Channel::ThumbFlexion,
        Channel::ThumbOpposition,
        Channel::IndexFingerDistal,
        Channel::IndexFingerProximal,
        Channel::MiddleFingerDistal,
        Channel::MiddleFingerProximal,
        Channel::RingFinger,
        Channel::Pinky,
        Channel::FingerSpread,
    ];

    /// Channel index in `[0, 9)`
    pub fn index(self) -> usize {
        self as usize
    }

    /// Bit of this channel in enable masks
    pub fn mask(self) -> u16 {
        1 << self.index()
    }

    /// Look up a channel by index
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Human-readable name
    pub fn name(self) -> &'static str {
        match self {
            Channel::ThumbFlexion => "thumb_flexion",
            Channel::ThumbOpposition => "thumb_opposition",
            Channel::IndexFingerDistal => "index_finger_distal",
            Channel::IndexFingerProximal => "index_finger_proximal",
            Channel::MiddleFingerDistal => "middle_finger_distal",
            Channel::MiddleFingerProximal => "middle_finger_proximal",
            Channel::RingFinger => "ring_finger",
            Channel::Pinky => "pinky",
            Channel::FingerSpread => "finger_spread",
        }
    }
}

impl TryFrom<u8> for Channel {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_index(value as usize).ok_or(ProtocolError::InvalidChannel(value))
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Target of a channel operation: one channel or all of them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSelect {
    /// A single channel
    One(Channel),
    /// Every channel
    All,
}

impl From<Channel> for ChannelSelect {
    fn from(channel: Channel) -> Self {
        ChannelSelect::One(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_roundtrip() {
        for (i, channel) in Channel::ALL.iter().enumerate() {
            assert_eq!(channel.index(), i);
            assert_eq!(Channel::try_from(i as u8).unwrap(), *channel);
        }
        assert!(matches!(
            Channel::try_from(9),
            Err(ProtocolError::InvalidChannel(9))
        ));
    }

    #[test]
    fn test_reset_order_covers_every_channel_once() {
        let mut seen = [false; CHANNEL_COUNT];
        for channel in RESET_ORDER {
            assert!(!seen[channel.index()]);
            seen[channel.index()] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&Channel::IndexFingerProximal).unwrap();
        assert_eq!(json, "\"index_finger_proximal\"");
        assert_eq!(json.trim_matches('"'), Channel::IndexFingerProximal.name());
    }
}
