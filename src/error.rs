//! Error kinds and outward result codes

use serde::Serialize;
use thiserror::Error;

use crate::config::CfgItem;

pub type Result<T> = std::result::Result<T, LimError>;

/// Failures surfaced by the pre-auth, cipher and key install paths
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimError {
    /// No room for another outstanding request or timer
    #[error("resources unavailable")]
    ResourcesUnavailable,

    /// Out-of-range key count, bad key length, or invalid scope/type combination
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// Outbound control-plane channel refused the request
    #[error("control-plane channel rejected request (status 0x{0:x})")]
    TransportFailure(u32),

    /// Decrypted ICV does not match the recomputed CRC-32
    #[error("ICV mismatch on decrypted auth frame body")]
    IntegrityCheckFailed,

    /// Configuration store lookup failed
    #[error("could not retrieve {0} from configuration")]
    ConfigurationUnavailable(CfgItem),
}

impl LimError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        LimError::InvalidParameters(msg.into())
    }
}

/// Result code carried in every confirmation delivered to the SME
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "code", rename_all = "kebab-case")]
pub enum ResultCode {
    Success,
    ResourcesUnavailable,
    InvalidParameters,
    IntegrityCheckFailed,
    ConfigurationUnavailable,
    /// Outbound channel rejected the request; status is passed through verbatim
    TransportFailure { status: u32 },
    /// Control-plane device replied with a non-zero status
    DeviceFailure { status: u32 },
    /// Peer answered the authentication with a non-zero status code
    AuthRefused { status: u16 },
    Timeout,
}

impl ResultCode {
    pub fn is_success(&self) -> bool {
        matches!(self, ResultCode::Success)
    }
}

impl From<&LimError> for ResultCode {
    fn from(e: &LimError) -> Self {
        match e {
            LimError::ResourcesUnavailable => ResultCode::ResourcesUnavailable,
            LimError::InvalidParameters(_) => ResultCode::InvalidParameters,
            LimError::TransportFailure(status) => ResultCode::TransportFailure { status: *status },
            LimError::IntegrityCheckFailed => ResultCode::IntegrityCheckFailed,
            LimError::ConfigurationUnavailable(_) => ResultCode::ConfigurationUnavailable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_status_passes_through() {
        let code = ResultCode::from(&LimError::TransportFailure(0x2a));
        assert_eq!(code, ResultCode::TransportFailure { status: 0x2a });
        assert!(!code.is_success());
    }

    #[test]
    fn test_result_code_json_shape() {
        let json = serde_json::to_value(ResultCode::TransportFailure { status: 7 }).unwrap();
        assert_eq!(json["code"], "transport-failure");
        assert_eq!(json["status"], 7);
    }

    #[test]
    fn test_error_messages() {
        let e = LimError::ConfigurationUnavailable(CfgItem::SingleTidRc);
        assert_eq!(e.to_string(), "could not retrieve SingleTidRc from configuration");
        assert_eq!(
            LimError::invalid("numKeys = 5").to_string(),
            "invalid parameters: numKeys = 5"
        );
    }
}
