//! Attributes and measurements for HTTP servers, following the OpenTelemetry
//! semantic conventions.
//!
//! Everything here is derived from values the middleware has already
//! captured; nothing performs I/O.

use std::borrow::Cow;
use std::net::SocketAddr;

use http::header::{CONTENT_LENGTH, HOST, USER_AGENT};
use http::uri::Authority;
use http::{Method, Request, StatusCode, Version};
use opentelemetry::metrics::{Histogram, Meter, MeterProvider, Unit};
use opentelemetry::trace::Status;
use opentelemetry::{Context, KeyValue};

use crate::error::CapturedError;

/// If anything was read from the request body, the total number of bytes read.
pub const READ_BYTES_KEY: &str = "http.read_bytes";
/// If reading the request body failed, the error message. End of stream is
/// not an error.
pub const READ_ERROR_KEY: &str = "http.read_error";
/// If anything was written to the response, the total number of bytes written.
pub const WROTE_BYTES_KEY: &str = "http.wrote_bytes";
/// If writing the response failed, the error message.
pub const WRITE_ERROR_KEY: &str = "http.write_error";

pub use opentelemetry_semantic_conventions::trace::{
    CLIENT_ADDRESS, HTTP_REQUEST_BODY_SIZE, HTTP_REQUEST_METHOD, HTTP_REQUEST_METHOD_ORIGINAL,
    HTTP_RESPONSE_STATUS_CODE, HTTP_ROUTE, NETWORK_PROTOCOL_VERSION, SERVER_ADDRESS, SERVER_PORT,
    URL_PATH, URL_QUERY, URL_SCHEME, USER_AGENT_ORIGINAL,
};

/// Peer of the connection, which is the client unless a proxy sits between.
pub const NETWORK_PEER_ADDRESS: &str = "network.peer.address";
pub const NETWORK_PEER_PORT: &str = "network.peer.port";

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// The attributes of a server span that are known before the handler runs.
///
/// `server_name`, when set, takes precedence over the `Host` header. The peer
/// address is read from a [`SocketAddr`] request extension.
pub fn request_trace_attrs<B>(
    request: &Request<B>,
    server_name: Option<&str>,
    route: &str,
) -> Vec<KeyValue> {
    let mut attributes = Vec::with_capacity(12);
    push_method(&mut attributes, request.method());
    attributes.push(KeyValue::new(URL_SCHEME, scheme(request).to_owned()));
    push_server(&mut attributes, request, server_name);

    if let Some(peer) = request.extensions().get::<SocketAddr>() {
        attributes.push(KeyValue::new(NETWORK_PEER_ADDRESS, peer.ip().to_string()));
        attributes.push(KeyValue::new(NETWORK_PEER_PORT, i64::from(peer.port())));
    }
    if let Some(client) = client_address(request) {
        attributes.push(KeyValue::new(CLIENT_ADDRESS, client));
    }

    attributes.push(KeyValue::new(URL_PATH, request.uri().path().to_owned()));
    if let Some(query) = request.uri().query() {
        attributes.push(KeyValue::new(URL_QUERY, query.to_owned()));
    }
    if !route.is_empty() {
        attributes.push(KeyValue::new(HTTP_ROUTE, route.to_owned()));
    }
    if let Some(user_agent) = header_str(request, USER_AGENT.as_str()) {
        attributes.push(KeyValue::new(USER_AGENT_ORIGINAL, user_agent.to_owned()));
    }
    if let Some(length) = content_length(request).filter(|length| *length > 0) {
        attributes.push(KeyValue::new(HTTP_REQUEST_BODY_SIZE, saturating_i64(length)));
    }
    if let Some(version) = protocol_version(request.version()) {
        attributes.push(KeyValue::new(NETWORK_PROTOCOL_VERSION, version));
    }
    attributes
}

/// What the byte-counting wrappers observed over one request.
#[derive(Clone, Debug, Default)]
pub struct ResponseTelemetry {
    pub status_code: Option<StatusCode>,
    pub read_bytes: u64,
    pub read_error: Option<CapturedError>,
    pub write_bytes: u64,
    pub write_error: Option<CapturedError>,
}

/// The attributes of a server span that are known once the handler returns.
///
/// Byte counts are only reported when non-zero, errors only when present.
pub fn response_trace_attrs(telemetry: &ResponseTelemetry) -> Vec<KeyValue> {
    let mut attributes = Vec::with_capacity(5);
    if telemetry.read_bytes > 0 {
        attributes.push(KeyValue::new(
            READ_BYTES_KEY,
            saturating_i64(telemetry.read_bytes),
        ));
    }
    if let Some(error) = &telemetry.read_error {
        attributes.push(KeyValue::new(READ_ERROR_KEY, error.to_string()));
    }
    if telemetry.write_bytes > 0 {
        attributes.push(KeyValue::new(
            WROTE_BYTES_KEY,
            saturating_i64(telemetry.write_bytes),
        ));
    }
    if let Some(error) = &telemetry.write_error {
        attributes.push(KeyValue::new(WRITE_ERROR_KEY, error.to_string()));
    }
    if let Some(status) = telemetry.status_code {
        attributes.push(KeyValue::new(
            HTTP_RESPONSE_STATUS_CODE,
            i64::from(status.as_u16()),
        ));
    }
    attributes
}

/// The span status for a server response.
///
/// Servers only mark 5xx responses as errors: a 4xx is the client's fault,
/// not a failure of the span. Codes outside 100..=599 are errors.
pub fn span_status(code: u16) -> Status {
    if !(100..600).contains(&code) {
        Status::Error {
            description: Cow::Owned(format!("Invalid HTTP status code {code}")),
        }
    } else if code >= 500 {
        Status::Error {
            description: Cow::Borrowed(""),
        }
    } else {
        Status::Unset
    }
}

/// The request-derived part of the metric attributes, and the extra
/// attributes contributed by the caller.
#[derive(Clone, Debug)]
pub struct MetricAttributes {
    pub method: Method,
    pub scheme: String,
    pub server_port: Option<u16>,
    pub protocol_version: Option<&'static str>,
    pub status_code: Option<StatusCode>,
    /// Labeler entries followed by the output of the metric attributes
    /// function, concatenated as-is. Duplicate keys are not merged.
    pub additional: Vec<KeyValue>,
}

impl MetricAttributes {
    pub fn from_request<B>(request: &Request<B>) -> Self {
        Self {
            method: request.method().clone(),
            scheme: scheme(request).to_owned(),
            server_port: host_and_port(request).and_then(|(_, port)| port),
            protocol_version: protocol_version(request.version()),
            status_code: None,
            additional: Vec::new(),
        }
    }
}

/// Everything recorded about one request once it has been served.
#[derive(Clone, Debug)]
pub struct ServerMetricData {
    pub server_name: String,
    pub route: String,
    pub request_size: u64,
    pub response_size: u64,
    /// Time since the request started, in milliseconds.
    pub elapsed_ms: f64,
    pub metric_attributes: MetricAttributes,
}

impl ServerMetricData {
    /// The attributes to tag every measurement with: the base set, then the
    /// additional attributes in order.
    pub fn attributes(&self) -> Vec<KeyValue> {
        let metric = &self.metric_attributes;
        let mut attributes = Vec::with_capacity(7 + metric.additional.len());
        push_method(&mut attributes, &metric.method);
        attributes.push(KeyValue::new(URL_SCHEME, metric.scheme.clone()));
        if !self.server_name.is_empty() {
            attributes.push(KeyValue::new(SERVER_ADDRESS, self.server_name.clone()));
        }
        if let Some(port) = metric.server_port {
            attributes.push(KeyValue::new(SERVER_PORT, i64::from(port)));
        }
        if let Some(version) = metric.protocol_version {
            attributes.push(KeyValue::new(NETWORK_PROTOCOL_VERSION, version));
        }
        if !self.route.is_empty() {
            attributes.push(KeyValue::new(HTTP_ROUTE, self.route.clone()));
        }
        if let Some(status) = metric.status_code {
            attributes.push(KeyValue::new(
                HTTP_RESPONSE_STATUS_CODE,
                i64::from(status.as_u16()),
            ));
        }
        attributes.extend(metric.additional.iter().cloned());
        attributes
    }
}

/// Somewhere to send per-request measurements.
///
/// Implementations must be safe to call from many requests at once.
pub trait MetricsRecorder: Send + Sync {
    fn record_metrics(&self, cx: &Context, data: &ServerMetricData);
}

/// Records request measurements as OpenTelemetry histograms.
#[derive(Clone, Debug)]
pub struct OtelMetrics {
    request_size: Histogram<u64>,
    response_size: Histogram<u64>,
    duration: Histogram<f64>,
}

impl OtelMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            request_size: meter
                .u64_histogram("http.server.request.size")
                .with_description("Measures the size of HTTP request messages.")
                .with_unit(Unit::new("By"))
                .init(),
            response_size: meter
                .u64_histogram("http.server.response.size")
                .with_description("Measures the size of HTTP response messages.")
                .with_unit(Unit::new("By"))
                .init(),
            duration: meter
                .f64_histogram("http.server.duration")
                .with_description("Measures the duration of inbound HTTP requests.")
                .with_unit(Unit::new("ms"))
                .init(),
        }
    }

    /// Builds the instruments on this crate's meter from `provider`.
    pub fn from_provider<P: MeterProvider>(provider: &P) -> Self {
        let meter = provider.versioned_meter(
            crate::SCOPE_NAME,
            Some(env!("CARGO_PKG_VERSION")),
            None::<&'static str>,
            None,
        );
        Self::new(&meter)
    }

    /// Builds the instruments from whatever meter provider is installed
    /// globally right now.
    pub fn global() -> Self {
        Self::from_provider(&opentelemetry::global::meter_provider())
    }
}

impl MetricsRecorder for OtelMetrics {
    fn record_metrics(&self, _cx: &Context, data: &ServerMetricData) {
        let attributes = data.attributes();
        self.request_size.record(data.request_size, &attributes);
        self.response_size.record(data.response_size, &attributes);
        self.duration.record(data.elapsed_ms, &attributes);
    }
}

/// The name the request was addressed to: the configured server name if there
/// is one, otherwise the host from the `Host` header or the URI.
pub(crate) fn server_address<B>(
    request: &Request<B>,
    server_name: Option<&str>,
) -> Option<String> {
    match server_name.filter(|name| !name.is_empty()) {
        Some(name) => Some(name.to_owned()),
        None => host_and_port(request).map(|(host, _)| host),
    }
}

fn push_method(attributes: &mut Vec<KeyValue>, method: &Method) {
    if is_known_method(method) {
        attributes.push(KeyValue::new(HTTP_REQUEST_METHOD, method.as_str().to_owned()));
    } else {
        attributes.push(KeyValue::new(HTTP_REQUEST_METHOD, "_OTHER"));
        attributes.push(KeyValue::new(
            HTTP_REQUEST_METHOD_ORIGINAL,
            method.as_str().to_owned(),
        ));
    }
}

fn push_server<B>(
    attributes: &mut Vec<KeyValue>,
    request: &Request<B>,
    server_name: Option<&str>,
) {
    if let Some(address) = server_address(request, server_name) {
        attributes.push(KeyValue::new(SERVER_ADDRESS, address));
    }
    if let Some(port) = host_and_port(request).and_then(|(_, port)| port) {
        attributes.push(KeyValue::new(SERVER_PORT, i64::from(port)));
    }
}

fn is_known_method(method: &Method) -> bool {
    [
        Method::CONNECT,
        Method::DELETE,
        Method::GET,
        Method::HEAD,
        Method::OPTIONS,
        Method::PATCH,
        Method::POST,
        Method::PUT,
        Method::TRACE,
    ]
    .contains(method)
}

fn scheme<B>(request: &Request<B>) -> &str {
    request.uri().scheme_str().unwrap_or("http")
}

fn header_str<'r, B>(request: &'r Request<B>, name: &str) -> Option<&'r str> {
    request
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
}

/// The host and port the request was addressed to, from the `Host` header or
/// the URI authority. IPv6 literals are returned without their brackets.
fn host_and_port<B>(request: &Request<B>) -> Option<(String, Option<u16>)> {
    let authority = match header_str(request, HOST.as_str()) {
        Some(host) => host.parse::<Authority>().ok()?,
        None => request.uri().authority()?.clone(),
    };
    let host = authority
        .host()
        .trim_start_matches('[')
        .trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host.to_owned(), authority.port_u16()))
}

fn client_address<B>(request: &Request<B>) -> Option<String> {
    if let Some(forwarded) = header_str(request, X_FORWARDED_FOR) {
        if let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty()) {
            return Some(first.to_owned());
        }
    }
    request
        .extensions()
        .get::<SocketAddr>()
        .map(|peer| peer.ip().to_string())
}

fn content_length<B>(request: &Request<B>) -> Option<u64> {
    header_str(request, CONTENT_LENGTH.as_str())?.parse().ok()
}

fn protocol_version(version: Version) -> Option<&'static str> {
    match version {
        Version::HTTP_09 => Some("0.9"),
        Version::HTTP_10 => Some("1.0"),
        Version::HTTP_11 => Some("1.1"),
        Version::HTTP_2 => Some("2"),
        Version::HTTP_3 => Some("3"),
        _ => None,
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
