//! upnp-nat - inbound connectivity through UPnP Internet Gateway Devices
//!
//! This library lets a peer behind a consumer router forward ports on the
//! router: it resolves the gateway's control endpoint, speaks the IGD SOAP
//! control protocol, keeps track of the mappings it created, renews session
//! mappings and releases them on shutdown.

#![warn(clippy::all)]

pub mod config;
pub mod connectivity;

pub use config::NatConfig;
pub use connectivity::{
    DeviceDescription, Mapping, MappingKind, NatDevice, NatError, ProcessTeardownGuard, Protocol,
    RenewalScheduler, UpnpNatDevice,
};

/// Result type alias for upnp-nat operations
pub type Result<T> = std::result::Result<T, NatError>;

/// Initialize logging for binaries and examples.
///
/// Honors `RUST_LOG`, defaulting to `info`.
pub fn init() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests;
