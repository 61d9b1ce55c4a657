//! Common types for connectivity module

use super::faults::FaultCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// A structured fault returned by the gateway inside a SOAP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolFault {
    /// Numeric UPnP error code (`errorCode`)
    pub code: u16,
    /// Vendor supplied message (`errorDescription`)
    pub description: String,
}

impl ProtocolFault {
    /// Create a new protocol fault
    pub fn new(code: u16, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    /// Known fault kind for this code, if any
    pub fn kind(&self) -> Option<FaultCode> {
        FaultCode::from_u16(self.code)
    }
}

impl fmt::Display for ProtocolFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Some(kind) => write!(
                f,
                "{} {} ({})",
                self.code,
                kind.to_error_message(),
                self.description
            ),
            None => write!(f, "{} ({})", self.code, self.description),
        }
    }
}

/// Errors that can occur while talking to a gateway
#[derive(Debug, Error)]
pub enum NatError {
    /// Malformed caller input, never retried
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Device rejected request with a SOAP fault
    #[error("Device rejected request: {0}")]
    Fault(ProtocolFault),

    /// Device did not answer within the timeout budget
    #[error("Device unreachable: no response within {0:?}")]
    Timeout(Duration),

    /// Transport failure before any response was received
    #[error("Device unreachable: {0}")]
    Unreachable(String),

    /// Response could not be interpreted
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Discovery header lookup failed
    #[error("Header not found: {0}")]
    HeaderNotFound(String),

    /// Description document lists no usable WAN connection service
    #[error("No valid control service found in {0}")]
    NoControlService(String),

    /// IO error (configuration files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NatError {
    /// Whether this failure means the device could not be reached at all
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Unreachable(_))
    }

    /// The numeric fault code when the device rejected the request
    pub fn fault_code(&self) -> Option<u16> {
        match self {
            Self::Fault(fault) => Some(fault.code),
            _ => None,
        }
    }

    /// The known fault kind when the device rejected the request
    pub fn fault_kind(&self) -> Option<FaultCode> {
        match self {
            Self::Fault(fault) => fault.kind(),
            _ => None,
        }
    }
}

/// Transport protocol of a port mapping
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// TCP protocol
    TCP,
    /// UDP protocol
    UDP,
}

impl Protocol {
    /// Wire representation used in `NewProtocol`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TCP => "TCP",
            Self::UDP => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = NatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TCP" => Ok(Self::TCP),
            "UDP" => Ok(Self::UDP),
            other => Err(NatError::InvalidArgument(format!(
                "protocol must be TCP or UDP, got '{}'",
                other
            ))),
        }
    }
}
