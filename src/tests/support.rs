// Shared fixtures: a scripted fake gateway and a capturing logger

use crate::config::NatConfig;
use crate::connectivity::soap::{CONTROL_NAMESPACE, XmlElement};
use crate::connectivity::upnp::GET_GENERIC_ENTRY;
use crate::connectivity::*;
use async_trait::async_trait;
use quick_xml::escape::escape;
use reqwest::Url;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const WAN_IP_SERVICE: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";
pub const LOCATION: &str = "http://192.168.1.1:5000/rootDesc.xml";

pub fn local_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50))
}

pub fn description() -> DeviceDescription {
    DeviceDescription::new(local_ip(), LOCATION, "/ctl/IPConn", WAN_IP_SERVICE).unwrap()
}

pub fn test_config() -> NatConfig {
    NatConfig {
        request_timeout_ms: 200,
        ..NatConfig::default()
    }
}

/// One SOAP request as the fake gateway saw it
#[derive(Debug, Clone)]
pub struct SoapCall {
    pub action: String,
    /// Position of this request among all requests to the router
    pub nth: usize,
    pub soap_action_header: String,
    pub content_type: String,
    pub body: String,
    pub args: Vec<(String, String)>,
}

impl SoapCall {
    pub fn arg(&self, name: &str) -> Option<&str> {
        self.args
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// What the fake gateway does with a request
#[derive(Debug, Clone)]
pub enum Scripted {
    Reply(HttpReply),
    Delayed(Duration, HttpReply),
    /// Never answers
    Hang,
    /// Connection refused
    Refuse,
}

type Responder = Box<dyn Fn(&SoapCall) -> Scripted + Send + Sync>;

/// In-memory gateway answering according to a script
pub struct FakeRouter {
    responder: Responder,
    calls: Mutex<Vec<SoapCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeRouter {
    pub fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&SoapCall) -> Scripted + Send + Sync + 'static,
    {
        Arc::new(Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    /// Answers every action with an empty success response
    pub fn accepting() -> Arc<Self> {
        Self::new(|call| ok(&call.action, &[]))
    }

    pub fn calls(&self) -> Vec<SoapCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, action: &str) -> Vec<SoapCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.action == action)
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, headers: &[(&'static str, String)], body: String) -> SoapCall {
        let header = |name: &str| {
            headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.clone())
                .unwrap_or_default()
        };

        let document = XmlElement::parse(&body).unwrap();
        let request = document
            .find("Body", None)
            .and_then(|soap_body| soap_body.children.first())
            .expect("envelope without an action element");

        let mut calls = self.calls.lock().unwrap();
        let call = SoapCall {
            action: request.name.clone(),
            nth: calls.len(),
            soap_action_header: header("SOAPACTION"),
            content_type: header("Content-Type"),
            args: request
                .children
                .iter()
                .map(|arg| (arg.name.clone(), arg.text.clone()))
                .collect(),
            body,
        };
        calls.push(call.clone());
        call
    }
}

#[async_trait]
impl SoapTransport for FakeRouter {
    async fn post(
        &self,
        _url: &Url,
        headers: &[(&'static str, String)],
        body: String,
    ) -> Result<HttpReply, NatError> {
        let call = self.record(headers, body);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = match (self.responder)(&call) {
            Scripted::Reply(reply) => Ok(reply),
            Scripted::Delayed(delay, reply) => {
                tokio::time::sleep(delay).await;
                Ok(reply)
            }
            Scripted::Hang => std::future::pending().await,
            Scripted::Refuse => Err(NatError::Unreachable("connection refused".to_string())),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn envelope(inner: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\
         <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
         s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\
         <s:Body>{}</s:Body></s:Envelope>",
        inner
    )
}

/// Successful `<action>Response` envelope; values are escaped
pub fn ok_body(action: &str, args: &[(&str, &str)]) -> String {
    let mut inner = format!("<u:{}Response xmlns:u=\"{}\">", action, WAN_IP_SERVICE);
    for (name, value) in args {
        inner.push_str(&format!("<{0}>{1}</{0}>", name, escape(*value)));
    }
    inner.push_str(&format!("</u:{}Response>", action));
    envelope(&inner)
}

/// Fault envelope carrying a `UPnPError` detail
pub fn fault_body(code: u16, description: &str) -> String {
    envelope(&format!(
        "<s:Fault><faultcode>s:Client</faultcode><faultstring>UPnPError</faultstring>\
         <detail><UPnPError xmlns=\"{}\"><errorCode>{}</errorCode>\
         <errorDescription>{}</errorDescription></UPnPError></detail></s:Fault>",
        CONTROL_NAMESPACE, code, description
    ))
}

pub fn ok(action: &str, args: &[(&str, &str)]) -> Scripted {
    Scripted::Reply(HttpReply {
        status: 200,
        body: ok_body(action, args),
    })
}

/// Routers send faults with HTTP 500
pub fn fault(code: FaultCode) -> Scripted {
    Scripted::Reply(HttpReply {
        status: 500,
        body: fault_body(code.code(), &format!("{:?}", code)),
    })
}

/// One `GetGenericPortMappingEntry` answer
pub fn entry(client: &str, external_port: u16, internal_port: u16, protocol: &str) -> Scripted {
    let external_port = external_port.to_string();
    let internal_port = internal_port.to_string();
    ok(
        GET_GENERIC_ENTRY,
        &[
            ("NewRemoteHost", ""),
            ("NewExternalPort", &external_port),
            ("NewProtocol", protocol),
            ("NewInternalPort", &internal_port),
            ("NewInternalClient", client),
            ("NewEnabled", "1"),
            ("NewPortMappingDescription", "entry"),
            ("NewLeaseDuration", "0"),
        ],
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

/// Logger recording every message for assertions
#[derive(Default)]
pub struct CapturingLogger {
    records: Mutex<Vec<(Level, String)>>,
}

impl CapturingLogger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<(Level, String)> {
        self.records.lock().unwrap().clone()
    }

    pub fn has(&self, level: Level, needle: &str) -> bool {
        self.records()
            .iter()
            .any(|(l, message)| *l == level && message.contains(needle))
    }

    fn push(&self, level: Level, message: &str) {
        self.records.lock().unwrap().push((level, message.to_string()));
    }
}

impl NatLogger for CapturingLogger {
    fn info(&self, message: &str) {
        self.push(Level::Info, message);
    }

    fn warn(&self, message: &str) {
        self.push(Level::Warn, message);
    }

    fn error(&self, message: &str) {
        self.push(Level::Error, message);
    }
}

pub fn device_with(
    router: Arc<FakeRouter>,
    logger: Arc<CapturingLogger>,
    config: &NatConfig,
) -> UpnpNatDevice {
    UpnpNatDevice::with_transport(description(), router, logger, config)
}

/// TCP mapping towards the local test address
pub fn tcp(private_port: u16, public_port: u16, lifetime: i32) -> Mapping {
    Mapping::new(
        Protocol::TCP,
        Some(local_ip()),
        private_port,
        public_port,
        lifetime,
        "test",
    )
    .unwrap()
}
