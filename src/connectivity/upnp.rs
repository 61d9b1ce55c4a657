//! UPnP IGD (Internet Gateway Device) control point
//!
//! Translates mapping operations into WANIPConnection / WANPPPConnection
//! SOAP actions and applies the per-operation fault tables from
//! [`super::faults`]. Router firmwares are not uniform: the same condition
//! is reported with different fault codes, and some only accept a narrow
//! subset of requests, so every mutating call may rewrite its request and
//! try again a bounded number of times.

use super::description::DeviceDescription;
use super::device::{MappingSet, NatDevice};
use super::faults::{
    CREATE_POLICIES, DELETE_POLICIES, ENUMERATE_POLICIES, FaultCode, FaultPolicy,
    LOOKUP_POLICIES, policy_for,
};
use super::logger::{NatLogger, SharedLogger, tracing_logger};
use super::mapping::Mapping;
use super::soap::{SoapArgs, SoapClient, XmlElement, response_node};
use super::transport::{HyperTransport, SoapTransport};
use super::types::{NatError, Protocol, ProtocolFault};
use crate::config::NatConfig;
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

pub(crate) const ADD_PORT_MAPPING: &str = "AddPortMapping";
pub(crate) const DELETE_PORT_MAPPING: &str = "DeletePortMapping";
pub(crate) const GET_EXTERNAL_IP: &str = "GetExternalIPAddress";
pub(crate) const GET_GENERIC_ENTRY: &str = "GetGenericPortMappingEntry";
pub(crate) const GET_SPECIFIC_ENTRY: &str = "GetSpecificPortMappingEntry";

/// Arguments of `AddPortMapping`; a wildcard remote host is sent empty
pub(crate) fn add_port_mapping_args(mapping: &Mapping, local_address: IpAddr) -> SoapArgs {
    vec![
        ("NewRemoteHost", remote_host_arg(mapping.public_ip())),
        ("NewExternalPort", mapping.public_port().to_string()),
        ("NewProtocol", mapping.protocol().as_str().to_string()),
        ("NewInternalPort", mapping.private_port().to_string()),
        (
            "NewInternalClient",
            mapping.private_ip().unwrap_or(local_address).to_string(),
        ),
        ("NewEnabled", "1".to_string()),
        ("NewPortMappingDescription", mapping.description().to_string()),
        ("NewLeaseDuration", mapping.lifetime_secs().to_string()),
    ]
}

pub(crate) fn delete_port_mapping_args(mapping: &Mapping) -> SoapArgs {
    vec![
        ("NewRemoteHost", remote_host_arg(mapping.public_ip())),
        ("NewExternalPort", mapping.public_port().to_string()),
        ("NewProtocol", mapping.protocol().as_str().to_string()),
    ]
}

pub(crate) fn get_generic_entry_args(index: u32) -> SoapArgs {
    vec![("NewPortMappingIndex", index.to_string())]
}

pub(crate) fn get_specific_entry_args(protocol: Protocol, public_port: u16) -> SoapArgs {
    vec![
        ("NewRemoteHost", String::new()),
        ("NewExternalPort", public_port.to_string()),
        ("NewProtocol", protocol.as_str().to_string()),
    ]
}

fn remote_host_arg(public_ip: Option<IpAddr>) -> String {
    public_ip.map(|ip| ip.to_string()).unwrap_or_default()
}

/// Raw fields of a `Get*PortMappingEntry` response
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PortMappingEntry<'a> {
    pub remote_host: &'a str,
    pub external_port: Option<&'a str>,
    pub protocol: Option<&'a str>,
    pub internal_port: &'a str,
    pub internal_client: &'a str,
    pub description: &'a str,
    pub lease_duration: &'a str,
}

impl<'a> PortMappingEntry<'a> {
    pub(crate) fn from_node(node: &'a XmlElement) -> Self {
        Self {
            remote_host: node.child_text("NewRemoteHost").unwrap_or_default(),
            external_port: node.child_text("NewExternalPort"),
            protocol: node.child_text("NewProtocol"),
            internal_port: node.child_text("NewInternalPort").unwrap_or_default(),
            internal_client: node.child_text("NewInternalClient").unwrap_or_default(),
            description: node
                .child_text("NewPortMappingDescription")
                .unwrap_or_default(),
            lease_duration: node.child_text("NewLeaseDuration").unwrap_or("0"),
        }
    }

    pub(crate) fn internal_client_ip(&self) -> Result<IpAddr, NatError> {
        self.internal_client.parse().map_err(|_| {
            NatError::InvalidResponse(format!(
                "NewInternalClient '{}' is not an IP address",
                self.internal_client
            ))
        })
    }

    /// Build a mapping, taking protocol and public port from the caller
    /// when given (the router's echo is not trusted for those)
    pub(crate) fn to_mapping(
        &self,
        protocol: Option<Protocol>,
        public_port: Option<u16>,
    ) -> Result<Mapping, NatError> {
        let private_ip = self.internal_client_ip()?;
        let protocol = match protocol {
            Some(protocol) => protocol.as_str(),
            None => self.protocol.unwrap_or_default(),
        };
        let public_port = match public_port {
            Some(port) => port as i64,
            None => parse_number("NewExternalPort", self.external_port.unwrap_or_default())?,
        };

        let mapping = Mapping::from_raw(
            protocol,
            Some(private_ip),
            parse_number("NewInternalPort", self.internal_port)?,
            public_port,
            parse_number("NewLeaseDuration", self.lease_duration)?,
            self.description,
        )?;

        Ok(mapping.with_public_ip(self.remote_host.parse().ok()))
    }
}

fn parse_number(field: &str, value: &str) -> Result<i64, NatError> {
    value.trim().parse::<i64>().map_err(|_| {
        NatError::InvalidResponse(format!("{} '{}' is not a number", field, value))
    })
}

/// Gateway reached through the UPnP IGD control protocol
pub struct UpnpNatDevice {
    description: DeviceDescription,
    soap: SoapClient,
    owned: MappingSet,
    logger: SharedLogger,
    max_create_retries: u32,
    max_enumerated_entries: u32,
}

impl UpnpNatDevice {
    /// Device using the hyper HTTP transport and the tracing logger
    pub fn new(description: DeviceDescription, config: &NatConfig) -> Self {
        Self::with_transport(
            description,
            Arc::new(HyperTransport::new()),
            tracing_logger(),
            config,
        )
    }

    pub fn with_transport(
        description: DeviceDescription,
        transport: Arc<dyn SoapTransport>,
        logger: SharedLogger,
        config: &NatConfig,
    ) -> Self {
        let soap = SoapClient::new(transport, &description, config.request_timeout());
        Self {
            description,
            soap,
            owned: MappingSet::new(),
            logger,
            max_create_retries: config.max_create_retries,
            max_enumerated_entries: config.max_enumerated_entries,
        }
    }

    pub fn description(&self) -> &DeviceDescription {
        &self.description
    }

    fn fatal_create_fault(&self, fault: ProtocolFault, mapping: &Mapping) -> NatError {
        match fault.kind() {
            Some(FaultCode::ExternalPortOnlySupportsWildcard) => self.logger.warn(&format!(
                "Gateway only supports wildcard external ports, cannot create {}",
                mapping
            )),
            Some(FaultCode::ConflictInMappingEntry) => self.logger.warn(&format!(
                "{} conflicts with an existing mapping on the gateway",
                mapping
            )),
            _ => self
                .logger
                .error(&format!("Creating {} failed: {}", mapping, fault)),
        }
        NatError::Fault(fault)
    }
}

impl fmt::Display for UpnpNatDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "UPnP gateway {} ({})",
            self.description.host_endpoint(),
            self.description.service_type()
        )
    }
}

#[async_trait]
impl NatDevice for UpnpNatDevice {
    fn local_address(&self) -> IpAddr {
        self.description.local_address()
    }

    fn owned(&self) -> &MappingSet {
        &self.owned
    }

    fn logger(&self) -> &dyn NatLogger {
        self.logger.as_ref()
    }

    async fn get_external_ip(&self) -> Result<IpAddr, NatError> {
        let document = self.soap.invoke(GET_EXTERNAL_IP, &[]).await?;
        let node = response_node(&document, GET_EXTERNAL_IP)?;
        let text = node.child_text("NewExternalIPAddress").unwrap_or_default();

        text.parse().map_err(|_| {
            NatError::InvalidResponse(format!("NewExternalIPAddress '{}' is not an IP address", text))
        })
    }

    /// Send `AddPortMapping`, adjusting the request after recoverable
    /// faults per [`CREATE_POLICIES`]
    async fn request_port_map(&self, mapping: Mapping) -> Result<Mapping, NatError> {
        let mut attempt = match mapping.private_ip() {
            Some(_) => mapping,
            None => mapping.with_private_ip(self.local_address()),
        };
        let mut recovered: Vec<u16> = Vec::new();

        loop {
            let args = add_port_mapping_args(&attempt, self.local_address());
            let fault = match self.soap.invoke(ADD_PORT_MAPPING, &args).await {
                Ok(_) => return Ok(attempt),
                Err(NatError::Fault(fault)) => fault,
                Err(e) => return Err(e),
            };

            match policy_for(CREATE_POLICIES, fault.code) {
                FaultPolicy::RetryWithMutation(mutate) => {
                    if recovered.contains(&fault.code) {
                        self.logger.warn(&format!(
                            "Gateway repeated fault {} after the request was adjusted",
                            fault.code
                        ));
                        return Err(self.fatal_create_fault(fault, &attempt));
                    }
                    if recovered.len() as u32 >= self.max_create_retries {
                        self.logger.warn(&format!(
                            "Giving up on {} after {} adjusted retries",
                            attempt,
                            recovered.len()
                        ));
                        return Err(self.fatal_create_fault(fault, &attempt));
                    }
                    if fault.kind() == Some(FaultCode::OnlyPermanentLeasesSupported) {
                        self.logger.warn(
                            "Gateway only supports permanent leases; the mapping is not guaranteed to be removed",
                        );
                    } else {
                        self.logger
                            .warn(&format!("{} while creating {}, retrying", fault, attempt));
                    }
                    recovered.push(fault.code);
                    attempt = mutate(&attempt);
                }
                FaultPolicy::TreatAsSuccess => return Ok(attempt),
                FaultPolicy::Fatal | FaultPolicy::TreatAsNotFound => {
                    return Err(self.fatal_create_fault(fault, &attempt));
                }
            }
        }
    }

    async fn delete_port_map(&self, mapping: &Mapping) -> Result<(), NatError> {
        let args = delete_port_mapping_args(mapping);
        match self.soap.invoke(DELETE_PORT_MAPPING, &args).await {
            Ok(_) => {}
            Err(NatError::Fault(fault)) => match policy_for(DELETE_POLICIES, fault.code) {
                FaultPolicy::TreatAsSuccess => {
                    self.logger.info(&format!(
                        "Gateway has no entry for {}, treating as deleted",
                        mapping
                    ));
                }
                _ => return Err(NatError::Fault(fault)),
            },
            Err(e) => return Err(e),
        }

        self.owned.unregister(mapping).await;
        Ok(())
    }

    async fn get_all_mappings(&self) -> Result<Vec<Mapping>, NatError> {
        let mut mappings = Vec::new();
        let mut seen = HashSet::new();

        for index in 0..self.max_enumerated_entries {
            let args = get_generic_entry_args(index);
            let document = match self.soap.invoke(GET_GENERIC_ENTRY, &args).await {
                Ok(document) => document,
                Err(NatError::Fault(fault)) => match policy_for(ENUMERATE_POLICIES, fault.code) {
                    FaultPolicy::TreatAsNotFound => return Ok(mappings),
                    _ => return Err(NatError::Fault(fault)),
                },
                Err(e) => return Err(e),
            };

            let node = response_node(&document, GET_GENERIC_ENTRY)?;
            let entry = PortMappingEntry::from_node(node);
            match entry.to_mapping(None, None) {
                Ok(mapping) => {
                    if seen.insert((mapping.protocol(), mapping.key())) {
                        mappings.push(mapping);
                    }
                }
                Err(e) => {
                    self.logger
                        .warn(&format!("Ignoring port mapping entry {}: {}", index, e));
                }
            }
        }

        self.logger.warn(&format!(
            "Stopped listing mappings after {} entries",
            self.max_enumerated_entries
        ));
        Ok(mappings)
    }

    async fn get_specific_mapping(
        &self,
        protocol: Protocol,
        public_port: u16,
    ) -> Result<Option<Mapping>, NatError> {
        let args = get_specific_entry_args(protocol, public_port);
        let document = match self.soap.invoke(GET_SPECIFIC_ENTRY, &args).await {
            Ok(document) => document,
            Err(NatError::Fault(fault)) => match policy_for(LOOKUP_POLICIES, fault.code) {
                FaultPolicy::TreatAsNotFound => return Ok(None),
                _ => return Err(NatError::Fault(fault)),
            },
            Err(e) => return Err(e),
        };

        let node = response_node(&document, GET_SPECIFIC_ENTRY)?;
        let entry = PortMappingEntry::from_node(node);
        if let Some(echoed) = entry.protocol {
            if !echoed.eq_ignore_ascii_case(protocol.as_str()) {
                self.logger.warn(&format!(
                    "Gateway answered a {} query with a {} entry, using {}",
                    protocol, echoed, protocol
                ));
            }
        }

        entry.to_mapping(Some(protocol), Some(public_port)).map(Some)
    }
}
