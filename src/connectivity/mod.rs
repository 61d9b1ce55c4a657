//! Connectivity module for NAT traversal through UPnP gateways
//!
//! This module drives a UPnP Internet Gateway Device found by an external
//! discovery step:
//! - `discovery` / `description` - from a discovery response to a control URL
//! - `soap` / `transport` - SOAP envelopes over HTTP
//! - `device` / `upnp` - owned mappings, renewal and the IGD operations
//! - `teardown` - best-effort release when the process exits

// Submodules
pub mod description;
pub mod device;
pub mod discovery;
pub mod faults;
pub mod logger;
pub mod mapping;
pub mod soap;
pub mod teardown;
pub mod transport;
pub mod types;
pub mod upnp;

// Re-export commonly used types
pub use description::DeviceDescription;
pub use device::{MappingSet, NatDevice, ReleaseReport, RenewalScheduler};
pub use discovery::{DiscoveryResponseHeaders, is_supported_service_type};
pub use faults::{FaultCode, FaultPolicy};
pub use logger::{NatLogger, SharedLogger, TracingLogger};
pub use mapping::{Mapping, MappingKind, SESSION_LEASE_SECS};
pub use soap::{SoapClient, XmlElement};
pub use teardown::ProcessTeardownGuard;
pub use transport::{HttpReply, HyperTransport, SoapTransport};
pub use types::{NatError, Protocol, ProtocolFault};
pub use upnp::UpnpNatDevice;
