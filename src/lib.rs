//! WLAN MAC authentication and key installation core
//!
//! - `preauth`: peers part-way through authentication, with periodic eviction
//! - `wep`: RC4 / CRC-32 protection of shared-key authentication frames
//! - `keys`: key install and removal requests to the control-plane device
//! - `dispatch`: confirmations delivered back to the SME
//! - `mlm`: the event loop tying these together

pub mod config;
pub mod dispatch;
pub mod error;
pub mod keys;
pub mod mac;
pub mod mlm;
pub mod preauth;
pub mod session;
pub mod timer;
pub mod wep;

pub use error::{LimError, Result, ResultCode};
