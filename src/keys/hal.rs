//! Control-plane key messages
//!
//! Requests are posted to the device fire-and-forget: a successful post only
//! means the message was accepted for delivery. The device answers later
//! with a [`HalResponse`] carrying the same dialog token.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

use super::{EdType, SirKey, WepType};

/// Key material carried in a per-peer set-key request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", content = "key", rename_all = "lowercase")]
pub enum StaKeyMaterial {
    /// Legacy WEP; the device sources the default keys from its own configuration
    Static,
    /// Key bytes travel with the request
    Dynamic(SirKey),
    /// No cipher configured for the link
    Clear,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetBssKeyParams {
    pub bss_idx: u8,
    pub enc_type: EdType,
    pub keys: Vec<SirKey>,
    pub single_tid_rc: u8,
    pub session_id: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetStaKeyParams {
    pub sta_idx: u16,
    pub enc_type: EdType,
    pub material: StaKeyMaterial,
    /// Default WEP key used for transmit; 0 for every other cipher
    pub def_wep_idx: u8,
    pub single_tid_rc: u8,
    pub session_id: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoveBssKeyParams {
    pub bss_idx: u8,
    pub enc_type: EdType,
    pub key_id: u8,
    pub wep_type: WepType,
    pub session_id: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoveStaKeyParams {
    pub sta_idx: u16,
    pub enc_type: EdType,
    pub key_id: u8,
    pub unicast: bool,
    pub session_id: u8,
}

/// Typed request body
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "params", rename_all = "kebab-case")]
pub enum CtrlMsgBody {
    SetBssKey(SetBssKeyParams),
    SetStaKey(SetStaKeyParams),
    /// Broadcast key of an IBSS peer
    SetStaBcastKey(SetStaKeyParams),
    RemoveBssKey(RemoveBssKeyParams),
    RemoveStaKey(RemoveStaKeyParams),
}

impl CtrlMsgBody {
    pub fn name(&self) -> &'static str {
        match self {
            CtrlMsgBody::SetBssKey(_) => "SET_BSSKEY_REQ",
            CtrlMsgBody::SetStaKey(_) => "SET_STAKEY_REQ",
            CtrlMsgBody::SetStaBcastKey(_) => "SET_STA_BCASTKEY_REQ",
            CtrlMsgBody::RemoveBssKey(_) => "REMOVE_BSSKEY_REQ",
            CtrlMsgBody::RemoveStaKey(_) => "REMOVE_STAKEY_REQ",
        }
    }
}

/// Request envelope handed to the outbound channel
#[derive(Debug, Clone, Serialize)]
pub struct CtrlMsg {
    pub dialog_token: u16,
    #[serde(flatten)]
    pub body: CtrlMsgBody,
}

impl fmt::Display for CtrlMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (token {})", self.body.name(), self.dialog_token)
    }
}

/// Device reply; status 0 means the keys were installed/removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HalResponse {
    pub dialog_token: u16,
    pub status: u32,
}

impl HalResponse {
    pub const SUCCESS: u32 = 0;

    pub fn success(dialog_token: u16) -> Self {
        Self {
            dialog_token,
            status: Self::SUCCESS,
        }
    }
}

/// The outbound channel refused a request; `status` is surfaced verbatim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("control-plane post failed with status 0x{status:x}")]
pub struct TransportError {
    pub status: u32,
}

/// Outbound control-plane message channel
pub trait ControlPlane {
    /// Hand `msg` over for delivery. Ownership passes to the channel either way.
    fn post(&mut self, msg: CtrlMsg) -> Result<(), TransportError>;
}
