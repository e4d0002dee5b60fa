//! Middleware that traces and measures every request served by a gateway
//! handler.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Instant, SystemTime};

use http::{HeaderMap, Request};
use opentelemetry::trace::{Link, SpanBuilder, Status, TraceContextExt};
use opentelemetry::{global, Context, KeyValue};
use opentelemetry_http::HeaderExtractor;

use crate::body::{Body, BodyWrapper, ByteEvent, ReadStats};
use crate::config::{Config, ScopedTracer};
use crate::labeler::{context_with_labeler, labeler_from_context, Labeler};
use crate::response::{ResponseWrapper, ResponseWriter, WriteStats};
use crate::semconv::{
    self, MetricAttributes, MetricsRecorder, OtelMetrics, ResponseTelemetry, ServerMetricData,
    READ_BYTES_KEY, WROTE_BYTES_KEY,
};
use crate::start_time::start_time_from_context;

/// Path parameters captured by the router, passed through untouched.
pub type PathParams = HashMap<String, String>;

/// A gateway request handler.
pub type HandlerFunc =
    Arc<dyn Fn(&mut dyn ResponseWriter, Request<Body>, PathParams) + Send + Sync>;

/// Wraps a handler into another handler with the same signature.
pub type Middleware = Arc<dyn Fn(HandlerFunc) -> HandlerFunc + Send + Sync>;

/// The route template that matched a request, inserted into the request
/// extensions by the router. Without it, the operation name is used.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpRoute(pub String);

/// The OpenTelemetry context of a request.
///
/// This is the context stored in the request extensions, or the one attached
/// to the current thread if there is none. Inside an instrumented handler it
/// carries the server span.
pub fn request_context<B>(request: &Request<B>) -> Context {
    request
        .extensions()
        .get::<Context>()
        .cloned()
        .unwrap_or_else(Context::current)
}

/// Replaces the OpenTelemetry context of a request.
pub fn set_request_context<B>(request: &mut Request<B>, cx: Context) {
    request.extensions_mut().insert(cx);
}

/// Instruments `handler` as `operation`.
pub fn new_handler(
    handler: HandlerFunc,
    operation: impl Into<String>,
    config: Config,
) -> HandlerFunc {
    new_middleware(operation, config)(handler)
}

/// Builds a middleware that instruments handlers as `operation`.
///
/// Each request that passes the configured filters gets one server span,
/// which is ended once the handler returns (or panics), followed by one set
/// of measurements. Requests rejected by a filter are answered with the
/// configured filtered status and never reach the handler.
pub fn new_middleware(operation: impl Into<String>, config: Config) -> Middleware {
    let instrumentation = Arc::new(Instrumentation {
        operation: operation.into(),
        config,
    });
    Arc::new(move |next: HandlerFunc| -> HandlerFunc {
        let instrumentation = Arc::clone(&instrumentation);
        Arc::new(
            move |writer: &mut dyn ResponseWriter,
                  request: Request<Body>,
                  path_params: PathParams| {
                instrumentation.serve(writer, request, &next, path_params);
            },
        )
    })
}

struct Instrumentation {
    operation: String,
    config: Config,
}

impl Instrumentation {
    fn serve(
        &self,
        writer: &mut dyn ResponseWriter,
        mut request: Request<Body>,
        next: &HandlerFunc,
        path_params: PathParams,
    ) {
        let started = Instant::now();

        if !self.config.filters.iter().all(|filter| filter(&request)) {
            tracing::debug!(
                operation = %self.operation,
                method = %request.method(),
                path = request.uri().path(),
                status = %self.config.filtered_status,
                "request rejected by filter",
            );
            writer.write_header(self.config.filtered_status);
            return;
        }

        let inbound = request_context(&request);
        let extracted = self.extract(&inbound, request.headers());
        set_request_context(&mut request, extracted.clone());

        let route = request
            .extensions()
            .get::<HttpRoute>()
            .map_or_else(|| self.operation.clone(), |route| route.0.clone());
        let start_override = start_time_from_context(&extracted);
        let tracer = self.tracer(&inbound);
        let mut cx = self
            .start_span(&tracer, &extracted, &request, &route)
            .with_value(tracer);

        let (labeler, found) = labeler_from_context(&cx);
        if !found {
            cx = context_with_labeler(&cx, labeler.clone());
        }
        if let Some(client_trace) = &self.config.client_trace {
            cx = client_trace(&cx);
        }

        // The handler owns the request, so take everything the metrics need now.
        let server_name = semconv::server_address(&request, self.config.server_name.as_deref())
            .unwrap_or_default();
        let metric_attributes = MetricAttributes::from_request(&request);
        let custom_attributes = self
            .config
            .metric_attributes_fn
            .as_ref()
            .map(|metric_attributes_fn| metric_attributes_fn(&request))
            .unwrap_or_default();

        let (mut parts, body) = request.into_parts();
        parts.extensions.insert(cx.clone());
        let (body, read_stats) = if body.is_empty() {
            (body, None)
        } else {
            let mut wrapper = BodyWrapper::new(body);
            if self.config.read_event {
                wrapper = wrapper.with_read_event(byte_event(&cx, "read", READ_BYTES_KEY));
            }
            let stats = wrapper.stats();
            (Body::from_reader(wrapper), Some(stats))
        };
        let request = Request::from_parts(parts, body);

        let mut writer = ResponseWrapper::new(writer);
        if self.config.write_event {
            writer = writer.with_write_event(byte_event(&cx, "write", WROTE_BYTES_KEY));
        }

        let finalizer = Finalizer {
            cx: cx.clone(),
            read_stats,
            write_stats: writer.stats(),
            started,
            start_override,
            labeler,
            custom_attributes,
            metric_attributes,
            server_name,
            route,
            recorder: self.recorder(),
        };
        {
            let _attached = cx.attach();
            next(&mut writer, request, path_params);
        }
        drop(finalizer);
    }

    /// The inbound context with the remote span context from `headers`.
    ///
    /// The inbound context is current while extracting: some propagators,
    /// the global no-op one among them, build on the current context rather
    /// than the one passed in.
    fn extract(&self, inbound: &Context, headers: &HeaderMap) -> Context {
        let _inbound = inbound.clone().attach();
        let extractor = HeaderExtractor(headers);
        match &self.config.propagators {
            Some(propagator) => propagator.extract_with_context(inbound, &extractor),
            None => global::get_text_map_propagator(|propagator| {
                propagator.extract_with_context(inbound, &extractor)
            }),
        }
    }

    /// The configured tracer, else the one that started the span already in
    /// the inbound context, else the global one.
    fn tracer(&self, inbound: &Context) -> ScopedTracer {
        if let Some(tracer) = &self.config.tracer {
            return tracer.clone();
        }
        if inbound.span().span_context().is_valid() {
            if let Some(tracer) = inbound.get::<ScopedTracer>() {
                return tracer.clone();
            }
        }
        ScopedTracer::global()
    }

    fn recorder(&self) -> Arc<dyn MetricsRecorder> {
        match &self.config.metrics {
            Some(recorder) => Arc::clone(recorder),
            None => Arc::new(OtelMetrics::global()),
        }
    }

    /// Starts the server span and returns `extracted` with the span active.
    fn start_span(
        &self,
        tracer: &ScopedTracer,
        extracted: &Context,
        request: &Request<Body>,
        route: &str,
    ) -> Context {
        let (kind, mut attributes, mut links) = self.config.span_start_parts();
        attributes.extend(semconv::request_trace_attrs(
            request,
            self.config.server_name.as_deref(),
            route,
        ));

        let name = (self.config.span_name_formatter)(self.operation.as_str(), request);
        let mut builder = SpanBuilder::from_name(name).with_kind(kind);
        if let Some(start) = start_time_from_context(extracted) {
            builder = builder.with_start_time(start);
        }

        let public = self.config.public_endpoint
            || self
                .config
                .public_endpoint_fn
                .as_ref()
                .is_some_and(|public_endpoint_fn| public_endpoint_fn(request));
        let parent = if public {
            // A caller outside the trust boundary does not get to parent our
            // trace, but its context is kept as a link.
            let remote = extracted.span().span_context().clone();
            if remote.is_valid() && remote.is_remote() {
                links.push(Link::new(remote, Vec::new()));
            }
            Context::new()
        } else {
            extracted.clone()
        };

        tracing::trace!(
            operation = %self.operation,
            route,
            public,
            "starting server span",
        );
        tracer.start(
            builder.with_attributes(attributes).with_links(links),
            &parent,
            extracted,
        )
    }
}

/// Ends the span and records the metrics of one request when dropped, which
/// also happens while a panicking handler unwinds.
struct Finalizer {
    cx: Context,
    read_stats: Option<Arc<ReadStats>>,
    write_stats: Arc<WriteStats>,
    started: Instant,
    start_override: Option<SystemTime>,
    labeler: Labeler,
    custom_attributes: Vec<KeyValue>,
    metric_attributes: MetricAttributes,
    server_name: String,
    route: String,
    recorder: Arc<dyn MetricsRecorder>,
}

impl Finalizer {
    fn telemetry(&self) -> ResponseTelemetry {
        let (read_bytes, read_error) = match &self.read_stats {
            Some(stats) => (stats.bytes_read(), stats.error().cloned()),
            None => (0, None),
        };
        ResponseTelemetry {
            status_code: Some(self.write_stats.status_code()),
            read_bytes,
            read_error,
            write_bytes: self.write_stats.bytes_written(),
            write_error: self.write_stats.error().cloned(),
        }
    }

    fn end_span(&self, telemetry: &ResponseTelemetry) {
        let span = self.cx.span();
        if thread::panicking() {
            tracing::warn!(route = %self.route, "handler panicked");
            span.set_status(Status::Error {
                description: Cow::Borrowed("handler panicked"),
            });
        } else if let Some(status_code) = telemetry.status_code {
            span.set_status(semconv::span_status(status_code.as_u16()));
        }
        span.set_attributes(semconv::response_trace_attrs(telemetry));
        span.end();
    }

    fn record_metrics(&self, telemetry: &ResponseTelemetry) {
        let elapsed = match self.start_override {
            Some(start) => SystemTime::now().duration_since(start).unwrap_or_default(),
            None => self.started.elapsed(),
        };
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;

        let mut metric_attributes = self.metric_attributes.clone();
        metric_attributes.status_code = telemetry.status_code;
        metric_attributes.additional = self.labeler.get();
        metric_attributes
            .additional
            .extend(self.custom_attributes.iter().cloned());

        self.recorder.record_metrics(
            &self.cx,
            &ServerMetricData {
                server_name: self.server_name.clone(),
                route: self.route.clone(),
                request_size: telemetry.read_bytes,
                response_size: telemetry.write_bytes,
                elapsed_ms,
                metric_attributes,
            },
        );
    }
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        let telemetry = self.telemetry();
        self.end_span(&telemetry);
        self.record_metrics(&telemetry);
    }
}

fn byte_event(cx: &Context, name: &'static str, key: &'static str) -> ByteEvent {
    let cx = cx.clone();
    Box::new(move |total| {
        cx.span().add_event(
            name,
            vec![KeyValue::new(key, i64::try_from(total).unwrap_or(i64::MAX))],
        );
    })
}
