//! 6-byte Ethernet MAC address.
//!
//! Rendered as colon-separated lowercase hex at every external boundary
//! (config file, datalog, UI) and carried as a plain `[u8; 6]` internally.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Errors parsing a colon-hex MAC address string.
#[derive(Error, Debug)]
pub enum MacParseError {
    /// The string did not split into exactly 6 colon-separated groups.
    #[error("expected 6 colon-separated hex bytes, got {0}")]
    WrongGroupCount(usize),

    /// One of the groups was not a valid hex byte.
    #[error("invalid hex byte {0:?}")]
    BadHexByte(String),
}

/// A 6-byte Ethernet MAC address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Mac(pub [u8; 6]);

impl Mac {
    /// Build a `Mac` from a raw 6-byte slice.
    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        Mac(bytes)
    }

    /// The underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl FromStr for Mac {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(MacParseError::WrongGroupCount(parts.len()));
        }

        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            bytes[i] = u8::from_str_radix(part, 16)
                .map_err(|_| MacParseError::BadHexByte(part.to_string()))?;
        }

        Ok(Mac(bytes))
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Debug for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mac({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lowercase_colon_hex() {
        let mac: Mac = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(mac.as_bytes(), &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    }

    #[test]
    fn parses_uppercase() {
        let mac: Mac = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert_eq!(mac.as_bytes(), &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    }

    #[test]
    fn rejects_wrong_group_count() {
        assert!("aa:bb:cc".parse::<Mac>().is_err());
    }

    #[test]
    fn rejects_bad_hex() {
        assert!("zz:bb:cc:dd:ee:ff".parse::<Mac>().is_err());
    }

    #[test]
    fn display_round_trips() {
        let mac = Mac([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);
        assert_eq!(mac.to_string(), "de:ad:be:ef:00:01");
        let parsed: Mac = mac.to_string().parse().unwrap();
        assert_eq!(parsed, mac);
    }
}
