//! Key material and MLM key requests
//!
//! - `hal`: request/response messages exchanged with the control-plane device
//! - `install`: builds and posts those requests, reconciles the replies

pub mod hal;
pub mod install;

use serde::Serialize;
use std::fmt;

use crate::error::{LimError, Result};
use crate::mac::MacAddr;

/// Number of default key slots (key index 0-3)
pub const MAX_NUM_DEFAULT_KEYS: usize = 4;
/// Longest key the control plane accepts (TKIP: 16 TK + 2 × 8 MIC)
pub const MAX_KEY_LEN: usize = 32;

/// Encryption type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdType {
    None,
    Wep40,
    Wep104,
    Tkip,
    Ccmp,
    /// Vendor cipher (WAPI WPI)
    Wpi,
}

impl EdType {
    pub fn is_wep(self) -> bool {
        matches!(self, EdType::Wep40 | EdType::Wep104)
    }
}

impl fmt::Display for EdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Where a legacy WEP key comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WepType {
    /// Device reads the default keys from its own configuration
    Static,
    /// Key bytes are carried in the request
    Dynamic,
}

/// One key record
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct SirKey {
    pub key_id: u8,
    pub unicast: bool,
    #[serde(skip)]
    pub key: Vec<u8>,
}

impl SirKey {
    pub fn new(key_id: u8, unicast: bool, key: &[u8]) -> Result<Self> {
        if key_id as usize >= MAX_NUM_DEFAULT_KEYS {
            return Err(LimError::invalid(format!("key id {} out of range 0..=3", key_id)));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(LimError::invalid(format!(
                "key length {} exceeds {}",
                key.len(),
                MAX_KEY_LEN
            )));
        }
        Ok(Self {
            key_id,
            unicast,
            key: key.to_vec(),
        })
    }
}

// Key bytes never reach the logs
impl fmt::Debug for SirKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SirKey")
            .field("key_id", &self.key_id)
            .field("unicast", &self.unicast)
            .field("key_len", &self.key.len())
            .finish()
    }
}

/// Ordered key records sharing one encryption type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub ed_type: EdType,
    pub keys: Vec<SirKey>,
}

impl KeyMaterial {
    pub fn new(ed_type: EdType, keys: Vec<SirKey>) -> Self {
        Self { ed_type, keys }
    }

    /// A single WEP default key
    pub fn wep(key_id: u8, unicast: bool, key: &[u8]) -> Result<Self> {
        let ed_type = match key.len() {
            5 => EdType::Wep40,
            13 => EdType::Wep104,
            n => {
                return Err(LimError::invalid(format!(
                    "WEP key must be 5 or 13 bytes, got {}",
                    n
                )))
            }
        };
        Ok(Self::new(ed_type, vec![SirKey::new(key_id, unicast, key)?]))
    }

    pub fn num_keys(&self) -> usize {
        self.keys.len()
    }
}

/// MLM-SETKEYS.request
#[derive(Debug, Clone)]
pub struct SetKeysReq {
    pub peer_mac: MacAddr,
    /// Association id of the peer, reported back in the confirmation
    pub aid: u16,
    pub session_id: u8,
    pub material: KeyMaterial,
}

/// MLM-REMOVEKEY.request
#[derive(Debug, Clone)]
pub struct RemoveKeyReq {
    pub peer_mac: MacAddr,
    pub session_id: u8,
    pub ed_type: EdType,
    pub key_id: u8,
    pub wep_type: WepType,
    pub unicast: bool,
}
