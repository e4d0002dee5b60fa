//! Functions to assist in propagating the trace when a handler calls another
//! service.

use http::HeaderMap;
use opentelemetry::{global, Context};
use opentelemetry_http::HeaderInjector;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// The headers required to propagate `cx` to another service, as produced by
/// the global propagator.
///
/// Inside an instrumented handler, pass
/// [`request_context`](crate::request_context) to make the server span the
/// parent of the downstream one.
pub fn trace_headers(cx: &Context) -> HeaderMap {
    let mut headers = HeaderMap::new();
    inject_trace_headers(cx, &mut headers);
    headers
}

/// Adds the propagation headers for `cx` to an existing set of headers,
/// replacing any previous values.
pub fn inject_trace_headers(cx: &Context, headers: &mut HeaderMap) {
    let mut injector = HeaderInjector(headers);
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(cx, &mut injector);
    });
}

// Same as `trace_headers`, for callers that work with a `Span` from the
// `tracing` crate rather than an OpenTelemetry context.
pub fn trace_headers_for_span(span: &tracing::Span) -> HeaderMap {
    trace_headers(&span.context())
}
