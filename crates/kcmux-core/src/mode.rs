//! Socket mode selector for multiplexor groups.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Socket type of a multiplexor group.
///
/// There is deliberately no `Default`: every caller must pick one. Raw
/// values convert fallibly, with `0` reserved as "unset".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Each read returns one classified message (`SOCK_DGRAM`).
    Datagram = 1,
    /// Classified messages with preserved record boundaries (`SOCK_SEQPACKET`).
    SequencedPacket = 2,
}

impl Mode {
    pub const ALL: [Self; 2] = [Self::Datagram, Self::SequencedPacket];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Datagram => "datagram",
            Self::SequencedPacket => "sequenced-packet",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<i32> for Mode {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Datagram),
            2 => Ok(Self::SequencedPacket),
            0 => Err(Error::InvalidMode("mode must be specified".to_string())),
            other => Err(Error::InvalidMode(format!("unknown mode value {other}"))),
        }
    }
}

impl TryFrom<Option<Self>> for Mode {
    type Error = Error;

    fn try_from(value: Option<Self>) -> Result<Self, Self::Error> {
        value.ok_or_else(|| Error::InvalidMode("mode must be specified".to_string()))
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "datagram" | "dgram" => Ok(Self::Datagram),
            "sequenced-packet" | "seqpacket" => Ok(Self::SequencedPacket),
            "" => Err(Error::InvalidMode("mode must be specified".to_string())),
            other => Err(Error::InvalidMode(format!("unknown mode {other:?}"))),
        }
    }
}

impl TryFrom<&str> for Mode {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_unset() {
        let err = Mode::try_from(0).unwrap_err();
        assert!(matches!(err, Error::InvalidMode(_)));
    }

    #[test]
    fn raw_values_round_trip_through_discriminant() {
        for mode in Mode::ALL {
            assert_eq!(Mode::try_from(mode as i32).unwrap(), mode);
        }
        assert!(Mode::try_from(3).is_err());
        assert!(Mode::try_from(-1).is_err());
    }

    #[test]
    fn parses_names_and_aliases() {
        assert_eq!("datagram".parse::<Mode>().unwrap(), Mode::Datagram);
        assert_eq!("SEQPACKET".parse::<Mode>().unwrap(), Mode::SequencedPacket);
        assert!("stream".parse::<Mode>().is_err());
        assert!("".parse::<Mode>().is_err());
    }

    #[test]
    fn missing_option_is_invalid() {
        assert!(matches!(Mode::try_from(None), Err(Error::InvalidMode(_))));
        assert_eq!(Mode::try_from(Some(Mode::Datagram)).unwrap(), Mode::Datagram);
    }
}
