//! SOAP 1.1 envelope codec for IGD control actions
//!
//! Only the narrow shapes IGD control needs are supported: a request is one
//! `u:<action>` element whose children are the arguments, a response is
//! either a `<action>Response` element or a `UPnPError` fault.

use super::description::DeviceDescription;
use super::transport::SoapTransport;
use super::types::{NatError, ProtocolFault};
use quick_xml::NsReader;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{Namespace, ResolveResult};
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Namespace of the `UPnPError` fault detail
pub const CONTROL_NAMESPACE: &str = "urn:schemas-upnp-org:control-1-0";

const ENVELOPE_NAMESPACE: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const ENCODING_STYLE: &str = "http://schemas.xmlsoap.org/soap/encoding/";

/// Ordered action arguments
pub type SoapArgs = Vec<(&'static str, String)>;

/// Minimal owned XML tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    /// Resolved namespace URI, if the element is bound to one
    pub namespace: Option<String>,
    /// Local name without prefix
    pub name: String,
    /// Concatenated text content
    pub text: String,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    /// Parse a document and return its root element
    pub fn parse(xml: &str) -> Result<Self, NatError> {
        let mut reader = NsReader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root: Option<XmlElement> = None;

        loop {
            match reader.read_resolved_event() {
                Ok((ns, Event::Start(start))) => stack.push(Self::open(ns, &start)),
                Ok((ns, Event::Empty(start))) => {
                    let element = Self::open(ns, &start);
                    Self::attach(&mut stack, &mut root, element);
                }
                Ok((_, Event::End(_))) => {
                    let element = stack.pop().ok_or_else(|| {
                        NatError::InvalidResponse("unbalanced closing tag".to_string())
                    })?;
                    Self::attach(&mut stack, &mut root, element);
                }
                Ok((_, Event::Text(text))) => {
                    if let Some(top) = stack.last_mut() {
                        let text = text.unescape().map_err(|e| {
                            NatError::InvalidResponse(format!("bad text content: {}", e))
                        })?;
                        top.text.push_str(&text);
                    }
                }
                Ok((_, Event::CData(data))) => {
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                    }
                }
                Ok((_, Event::Eof)) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(NatError::InvalidResponse(format!("malformed XML: {}", e)));
                }
            }
        }

        if !stack.is_empty() {
            return Err(NatError::InvalidResponse(
                "document ended inside an element".to_string(),
            ));
        }

        root.ok_or_else(|| NatError::InvalidResponse("empty XML document".to_string()))
    }

    fn open(ns: ResolveResult<'_>, start: &BytesStart<'_>) -> Self {
        let namespace = match ns {
            ResolveResult::Bound(Namespace(uri)) => Some(String::from_utf8_lossy(uri).into_owned()),
            _ => None,
        };

        Self {
            namespace,
            name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
            text: String::new(),
            children: Vec::new(),
        }
    }

    fn attach(stack: &mut [XmlElement], root: &mut Option<XmlElement>, element: XmlElement) {
        match stack.last_mut() {
            Some(parent) => parent.children.push(element),
            None => {
                if root.is_none() {
                    *root = Some(element);
                }
            }
        }
    }

    /// Depth-first search (self included) by local name and, optionally,
    /// namespace
    pub fn find(&self, name: &str, namespace: Option<&str>) -> Option<&XmlElement> {
        let matches = self.name == name
            && namespace.is_none_or(|ns| self.namespace.as_deref() == Some(ns));
        if matches {
            return Some(self);
        }
        self.children
            .iter()
            .find_map(|child| child.find(name, namespace))
    }

    /// All descendants (self included) with the given local name, in
    /// document order
    pub fn find_all<'a>(&'a self, name: &str, out: &mut Vec<&'a XmlElement>) {
        if self.name == name {
            out.push(self);
        }
        for child in &self.children {
            child.find_all(name, out);
        }
    }

    /// Trimmed text of the first direct child with this local name
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.children
            .iter()
            .find(|child| child.name == name)
            .map(|child| child.text.trim())
    }
}

/// Serialize an action request envelope
pub fn build_envelope(service_type: &str, action: &str, args: &[(&'static str, String)]) -> String {
    let mut body = String::with_capacity(256 + args.len() * 48);
    body.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>");
    body.push_str(&format!(
        "<s:Envelope xmlns:s=\"{}\" s:encodingStyle=\"{}\"><s:Body>",
        ENVELOPE_NAMESPACE, ENCODING_STYLE
    ));
    body.push_str(&format!(
        "<u:{} xmlns:u=\"{}\">",
        action,
        escape(service_type)
    ));
    for (name, value) in args {
        body.push_str(&format!("<{0}>{1}</{0}>", name, escape(value.as_str())));
    }
    body.push_str(&format!("</u:{}></s:Body></s:Envelope>", action));
    body
}

/// Parse a response body and turn a `UPnPError` node into a fault
pub fn decode_response(body: &str) -> Result<XmlElement, NatError> {
    let document = XmlElement::parse(body)?;

    if let Some(error) = document.find("UPnPError", Some(CONTROL_NAMESPACE)) {
        let code_text = error.child_text("errorCode").unwrap_or_default();
        let code = code_text.parse::<u16>().map_err(|_| {
            NatError::InvalidResponse(format!("fault carries a non-numeric errorCode '{}'", code_text))
        })?;
        let description = error.child_text("errorDescription").unwrap_or_default();
        return Err(NatError::Fault(ProtocolFault::new(code, description)));
    }

    Ok(document)
}

/// Locate the `<action>Response` element of a decoded document
pub fn response_node<'a>(document: &'a XmlElement, action: &str) -> Result<&'a XmlElement, NatError> {
    let expected = format!("{}Response", action);
    document
        .find(&expected, None)
        .ok_or_else(|| NatError::InvalidResponse(format!("missing {} element", expected)))
}

/// Sends control actions to one device service
#[derive(Clone)]
pub struct SoapClient {
    transport: Arc<dyn SoapTransport>,
    control_url: Url,
    service_type: String,
    timeout: Duration,
}

impl SoapClient {
    pub fn new(
        transport: Arc<dyn SoapTransport>,
        description: &DeviceDescription,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            control_url: description.control_url().clone(),
            service_type: description.service_type().to_string(),
            timeout,
        }
    }

    /// Invoke `action` and return the decoded response document.
    ///
    /// Exceeding the timeout yields [`NatError::Timeout`]; a fault node
    /// yields [`NatError::Fault`]. Neither is retried here.
    pub async fn invoke(&self, action: &str, args: &[(&'static str, String)]) -> Result<XmlElement, NatError> {
        let body = build_envelope(&self.service_type, action, args);
        let headers = [
            ("SOAPACTION", format!("\"{}#{}\"", self.service_type, action)),
            ("Content-Type", "text/xml; charset=\"utf-8\"".to_string()),
        ];

        debug!("SOAP {} -> {}: {}", action, self.control_url, body);

        let reply = tokio::time::timeout(
            self.timeout,
            self.transport.post(&self.control_url, &headers, body),
        )
        .await
        .map_err(|_| NatError::Timeout(self.timeout))??;

        debug!("SOAP {} <- HTTP {}: {}", action, reply.status, reply.body);

        if reply.body.trim().is_empty() {
            if reply.is_success() {
                return Err(NatError::InvalidResponse(format!("{} returned an empty body", action)));
            }
            return Err(NatError::InvalidResponse(format!(
                "{} failed with HTTP {} and no body",
                action, reply.status
            )));
        }

        let document = decode_response(&reply.body)?;
        if !reply.is_success() {
            return Err(NatError::InvalidResponse(format!(
                "{} failed with HTTP {} without a fault",
                action, reply.status
            )));
        }

        Ok(document)
    }
}
