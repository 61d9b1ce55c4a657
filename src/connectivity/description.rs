//! Control endpoint resolution for a discovered gateway

use super::discovery::is_supported_service_type;
use super::soap::XmlElement;
use super::types::NatError;
use reqwest::Url;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where and how to reach one gateway's WAN connection service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescription {
    local_address: IpAddr,
    host_endpoint: SocketAddr,
    control_url: Url,
    service_type: String,
}

impl DeviceDescription {
    /// Resolve the control endpoint.
    ///
    /// The discovery location's host and port are authoritative. If
    /// `control_url` is an absolute URL only its path and query are kept,
    /// since some firmwares advertise a fully-qualified URL pointing at a
    /// different interface.
    pub fn new(
        local_address: IpAddr,
        location: &str,
        control_url: &str,
        service_type: &str,
    ) -> Result<Self, NatError> {
        let location = Url::parse(location).map_err(|e| {
            NatError::InvalidArgument(format!("invalid location '{}': {}", location, e))
        })?;
        let host = location
            .host_str()
            .ok_or_else(|| NatError::InvalidArgument(format!("location '{}' has no host", location)))?;
        let host_ip: IpAddr = host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .map_err(|_| {
                NatError::InvalidArgument(format!("location host '{}' is not an IP address", host))
            })?;
        let port = location.port_or_known_default().unwrap_or(80);
        let host_endpoint = SocketAddr::new(host_ip, port);

        let path = match Url::parse(control_url) {
            Ok(absolute) if absolute.has_host() => {
                let mut path = absolute.path().to_string();
                if let Some(query) = absolute.query() {
                    path.push('?');
                    path.push_str(query);
                }
                if absolute.host_str() != Some(host) || absolute.port_or_known_default() != Some(port) {
                    info!(
                        "Control URL {} points away from {}, using path {} on the discovered host",
                        control_url, host_endpoint, path
                    );
                }
                path
            }
            _ => control_url.trim().to_string(),
        };

        let base = Url::parse(&format!("http://{}/", host_endpoint)).map_err(|e| {
            NatError::InvalidArgument(format!("cannot build base URL for {}: {}", host_endpoint, e))
        })?;
        let control_url = base.join(&path).map_err(|e| {
            NatError::InvalidArgument(format!("invalid control URL '{}': {}", path, e))
        })?;

        Ok(Self {
            local_address,
            host_endpoint,
            control_url,
            service_type: service_type.trim().to_string(),
        })
    }

    /// Download the device description at `location` and pick the first
    /// supported WAN connection service.
    pub async fn fetch(
        local_address: IpAddr,
        location: &str,
        timeout: Duration,
    ) -> Result<Self, NatError> {
        debug!("Fetching device description from {}", location);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| NatError::Unreachable(format!("Failed to create HTTP client: {}", e)))?;

        let response = client.get(location).send().await.map_err(|e| {
            if e.is_timeout() {
                NatError::Timeout(timeout)
            } else {
                NatError::Unreachable(format!("GET {} failed: {}", location, e))
            }
        })?;

        if !response.status().is_success() {
            return Err(NatError::InvalidResponse(format!(
                "description request returned HTTP {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| NatError::Unreachable(format!("Failed to read description: {}", e)))?;

        Self::from_description_xml(local_address, location, &body)
    }

    /// Select the control service from an already downloaded description
    pub fn from_description_xml(
        local_address: IpAddr,
        location: &str,
        xml: &str,
    ) -> Result<Self, NatError> {
        let document = XmlElement::parse(xml)?;
        let mut services = Vec::new();
        document.find_all("service", &mut services);

        for service in services {
            let Some(service_type) = service.child_text("serviceType") else {
                continue;
            };
            if !is_supported_service_type(service_type) {
                debug!("Skipping service {}", service_type);
                continue;
            }
            let Some(control_url) = service.child_text("controlURL") else {
                warn!("Service {} has no controlURL", service_type);
                continue;
            };
            return Self::new(local_address, location, control_url, service_type);
        }

        Err(NatError::NoControlService(location.to_string()))
    }

    /// Local interface address used to reach the gateway
    pub fn local_address(&self) -> IpAddr {
        self.local_address
    }

    pub fn host_endpoint(&self) -> SocketAddr {
        self.host_endpoint
    }

    pub fn control_url(&self) -> &Url {
        &self.control_url
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }
}

impl fmt::Display for DeviceDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at {} (local {})",
            self.service_type, self.control_url, self.local_address
        )
    }
}
