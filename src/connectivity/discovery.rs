//! Discovery response header parsing
//!
//! The SSDP transport that produces these responses lives outside this
//! crate; this module only turns the raw header block into a lookup table
//! and exposes the fields needed to build a [`DeviceDescription`].
//!
//! [`DeviceDescription`]: super::description::DeviceDescription

use super::types::NatError;
use std::collections::HashMap;

/// Service types this client can drive
pub const SUPPORTED_SERVICE_TYPES: &[&str] = &[
    "urn:schemas-upnp-org:service:WANIPConnection:1",
    "urn:schemas-upnp-org:service:WANIPConnection:2",
    "urn:schemas-upnp-org:service:WANPPPConnection:1",
];

/// Whether a service type URN names a WAN connection service we support
pub fn is_supported_service_type(service_type: &str) -> bool {
    SUPPORTED_SERVICE_TYPES
        .iter()
        .any(|supported| supported.eq_ignore_ascii_case(service_type.trim()))
}

/// Case-insensitive header map of one discovery response
#[derive(Debug, Clone, Default)]
pub struct DiscoveryResponseHeaders {
    headers: HashMap<String, String>,
}

impl DiscoveryResponseHeaders {
    /// Parse a CRLF separated header block. The first line (status line)
    /// is skipped and a line without a colon yields an empty value.
    pub fn parse(response: &str) -> Self {
        let headers = response
            .split("\r\n")
            .skip(1)
            .filter(|line| !line.trim().is_empty())
            .map(|line| match line.split_once(':') {
                Some((key, value)) => (key.trim().to_ascii_uppercase(), value.trim().to_string()),
                None => (line.trim().to_ascii_uppercase(), String::new()),
            })
            .collect();

        Self { headers }
    }

    /// Look up a header by name, ignoring case
    pub fn get(&self, key: &str) -> Result<&str, NatError> {
        self.headers
            .get(&key.trim().to_ascii_uppercase())
            .map(String::as_str)
            .ok_or_else(|| NatError::HeaderNotFound(key.to_string()))
    }

    /// Device description URL (`LOCATION`)
    pub fn location(&self) -> Result<&str, NatError> {
        self.get("LOCATION")
    }

    /// Search target (`ST`)
    pub fn search_target(&self) -> Result<&str, NatError> {
        self.get("ST")
    }
}
