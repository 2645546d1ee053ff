//! 802.11 link-layer addressing and management reason codes

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// 6-byte IEEE 802 MAC address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = anyhow::Error;

    /// Accepts `aa:bb:cc:dd:ee:ff`, `aa-bb-...` or bare `aabbccddeeff`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        let bytes = hex::decode(&digits)
            .map_err(|e| anyhow::anyhow!("Invalid MAC address '{}': {}", s, e))?;
        let octets: [u8; 6] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("MAC address '{}' must be 6 bytes", s))?;
        Ok(MacAddr(octets))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Deauthentication / disassociation reason codes (IEEE 802.11 Table 9-49)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u16)]
pub enum ReasonCode {
    PrevAuthNotValid = 2,
}

impl ReasonCode {
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let mac: MacAddr = "00:1A:2b:3c:4d:5e".parse().unwrap();
        assert_eq!(mac.octets(), [0x00, 0x1a, 0x2b, 0x3c, 0x4d, 0x5e]);
        assert_eq!(mac.to_string(), "00:1a:2b:3c:4d:5e");

        let bare: MacAddr = "001a2b3c4d5e".parse().unwrap();
        assert_eq!(bare, mac);
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        assert!("00:11:22".parse::<MacAddr>().is_err());
        assert!("zz:11:22:33:44:55".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_prev_auth_not_valid_reason() {
        assert_eq!(ReasonCode::PrevAuthNotValid.as_u16(), 2);
    }
}
