//! Options for the gateway middleware.

use std::fmt;
use std::sync::Arc;

use http::{Request, StatusCode};
use opentelemetry::metrics::MeterProvider;
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{Link, SpanBuilder, SpanKind, TraceContextExt, Tracer, TracerProvider};
use opentelemetry::{global, Context, KeyValue};

use crate::body::Body;
use crate::semconv::{MetricsRecorder, OtelMetrics};

/// Decides whether a request is served. Must return `true` to let it through.
pub type Filter = Arc<dyn Fn(&Request<Body>) -> bool + Send + Sync>;

type SpanNameFormatter = Arc<dyn Fn(&str, &Request<Body>) -> String + Send + Sync>;
type RequestPredicate = Arc<dyn Fn(&Request<Body>) -> bool + Send + Sync>;
type MetricAttributesFn = Arc<dyn Fn(&Request<Body>) -> Vec<KeyValue> + Send + Sync>;
type ClientTraceFn = Arc<dyn Fn(&Context) -> Context + Send + Sync>;
type StartSpan = dyn Fn(SpanBuilder, &Context, &Context) -> Context + Send + Sync;

/// Applied to every span when it is started.
#[derive(Clone, Debug)]
pub enum SpanStartOption {
    /// The span kind. The last one given wins.
    Kind(SpanKind),
    Attributes(Vec<KeyValue>),
    Link(Link),
}

/// Span events that can be recorded for body I/O.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageEvent {
    /// A `read` event after each successful read of the request body.
    Read,
    /// A `write` event after each successful write of the response body.
    Write,
}

/// A tracer whose concrete type has been erased.
#[derive(Clone)]
pub(crate) struct ScopedTracer(Arc<StartSpan>);

impl ScopedTracer {
    pub fn from_provider<P>(provider: &P) -> Self
    where
        P: TracerProvider,
        P::Tracer: Send + Sync + 'static,
        <P::Tracer as Tracer>::Span: Send + Sync + 'static,
    {
        let tracer = provider.versioned_tracer(
            crate::SCOPE_NAME,
            Some(env!("CARGO_PKG_VERSION")),
            None::<&'static str>,
            None,
        );
        Self(Arc::new(
            move |builder: SpanBuilder, parent: &Context, base: &Context| {
                base.with_span(tracer.build_with_context(builder, parent))
            },
        ))
    }

    /// A tracer from whatever provider is installed globally right now.
    pub fn global() -> Self {
        Self::from_provider(&global::tracer_provider())
    }

    /// Starts a span as a child of the active span of `parent`, if there is
    /// one, and returns `base` with the new span active.
    pub fn start(&self, builder: SpanBuilder, parent: &Context, base: &Context) -> Context {
        (self.0)(builder, parent, base)
    }
}

/// Configuration for [`new_middleware`](crate::new_middleware).
///
/// Anything left unset falls back to the global OpenTelemetry registry, which
/// is consulted on every request, so providers installed after the middleware
/// is built are still picked up.
#[derive(Clone)]
pub struct Config {
    pub(crate) tracer: Option<ScopedTracer>,
    pub(crate) metrics: Option<Arc<dyn MetricsRecorder>>,
    pub(crate) propagators: Option<Arc<dyn TextMapPropagator + Send + Sync>>,
    pub(crate) span_start_options: Vec<SpanStartOption>,
    pub(crate) public_endpoint: bool,
    pub(crate) public_endpoint_fn: Option<RequestPredicate>,
    pub(crate) filters: Vec<Filter>,
    pub(crate) span_name_formatter: SpanNameFormatter,
    pub(crate) server_name: Option<String>,
    pub(crate) metric_attributes_fn: Option<MetricAttributesFn>,
    pub(crate) read_event: bool,
    pub(crate) write_event: bool,
    pub(crate) client_trace: Option<ClientTraceFn>,
    pub(crate) filtered_status: StatusCode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tracer: None,
            metrics: None,
            propagators: None,
            span_start_options: vec![SpanStartOption::Kind(SpanKind::Server)],
            public_endpoint: false,
            public_endpoint_fn: None,
            filters: Vec::new(),
            span_name_formatter: Arc::new(|operation: &str, _: &Request<Body>| {
                operation.to_owned()
            }),
            server_name: None,
            metric_attributes_fn: None,
            read_event: false,
            write_event: false,
            client_trace: None,
            filtered_status: StatusCode::FORBIDDEN,
        }
    }
}

impl Config {
    /// Creates spans with a tracer from `provider` instead of the global one.
    #[must_use]
    pub fn with_tracer_provider<P>(mut self, provider: &P) -> Self
    where
        P: TracerProvider,
        P::Tracer: Send + Sync + 'static,
        <P::Tracer as Tracer>::Span: Send + Sync + 'static,
    {
        self.tracer = Some(ScopedTracer::from_provider(provider));
        self
    }

    /// Records metrics with a meter from `provider` instead of the global one.
    #[must_use]
    pub fn with_meter_provider<P: MeterProvider>(mut self, provider: &P) -> Self {
        self.metrics = Some(Arc::new(OtelMetrics::from_provider(provider)));
        self
    }

    /// Sends metrics to `recorder` instead of OpenTelemetry instruments.
    #[must_use]
    pub fn with_metrics_recorder(mut self, recorder: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = Some(recorder);
        self
    }

    /// Treats every request as coming from outside the trust boundary.
    ///
    /// Spans then start a new trace. A valid remote parent in the request
    /// headers is kept as a link instead of becoming the parent.
    #[must_use]
    pub fn with_public_endpoint(mut self) -> Self {
        self.public_endpoint = true;
        self
    }

    /// Decides per request whether it is public, as in
    /// [`with_public_endpoint`](Self::with_public_endpoint). The request
    /// already carries the extracted trace context.
    #[must_use]
    pub fn with_public_endpoint_fn(
        mut self,
        public_endpoint_fn: impl Fn(&Request<Body>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.public_endpoint_fn = Some(Arc::new(public_endpoint_fn));
        self
    }

    /// Extracts trace context with `propagator` instead of the global one.
    #[must_use]
    pub fn with_propagators(
        mut self,
        propagator: impl TextMapPropagator + Send + Sync + 'static,
    ) -> Self {
        self.propagators = Some(Arc::new(propagator));
        self
    }

    /// Adds options applied to every span. The span kind defaults to server.
    #[must_use]
    pub fn with_span_options(mut self, options: impl IntoIterator<Item = SpanStartOption>) -> Self {
        self.span_start_options.extend(options);
        self
    }

    /// Adds a filter. Filters run in the order they were added; a request is
    /// only traced and forwarded if all of them accept it.
    #[must_use]
    pub fn with_filter(
        mut self,
        filter: impl Fn(&Request<Body>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    /// Names spans from the operation and the request. By default the span is
    /// named after the operation.
    #[must_use]
    pub fn with_span_name_formatter(
        mut self,
        formatter: impl Fn(&str, &Request<Body>) -> String + Send + Sync + 'static,
    ) -> Self {
        self.span_name_formatter = Arc::new(formatter);
        self
    }

    /// The name of the (virtual) server handling requests, reported instead
    /// of the `Host` header.
    #[must_use]
    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }

    /// Adds attributes derived from the request to every metric. They come
    /// after anything added through the request's [`Labeler`](crate::Labeler).
    #[must_use]
    pub fn with_metric_attributes_fn(
        mut self,
        metric_attributes_fn: impl Fn(&Request<Body>) -> Vec<KeyValue> + Send + Sync + 'static,
    ) -> Self {
        self.metric_attributes_fn = Some(Arc::new(metric_attributes_fn));
        self
    }

    /// Records span events for body reads and writes. This can produce a lot
    /// of events for streaming bodies.
    #[must_use]
    pub fn with_message_events(mut self, events: impl IntoIterator<Item = MessageEvent>) -> Self {
        for event in events {
            match event {
                MessageEvent::Read => self.read_event = true,
                MessageEvent::Write => self.write_event = true,
            }
        }
        self
    }

    /// Decorates the context handed to the handler, e.g. with hooks that its
    /// outbound clients look up.
    #[must_use]
    pub fn with_client_trace(
        mut self,
        client_trace: impl Fn(&Context) -> Context + Send + Sync + 'static,
    ) -> Self {
        self.client_trace = Some(Arc::new(client_trace));
        self
    }

    /// The status sent for requests a filter rejects. Defaults to `403 Forbidden`.
    #[must_use]
    pub fn with_filtered_status(mut self, status: StatusCode) -> Self {
        self.filtered_status = status;
        self
    }

    /// Folds the span start options into a kind, attributes and links.
    pub(crate) fn span_start_parts(&self) -> (SpanKind, Vec<KeyValue>, Vec<Link>) {
        let mut kind = SpanKind::Server;
        let mut attributes = Vec::new();
        let mut links = Vec::new();
        for option in &self.span_start_options {
            match option {
                SpanStartOption::Kind(option_kind) => kind = option_kind.clone(),
                SpanStartOption::Attributes(option_attributes) => {
                    attributes.extend(option_attributes.iter().cloned());
                }
                SpanStartOption::Link(link) => links.push(link.clone()),
            }
        }
        (kind, attributes, links)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("span_start_options", &self.span_start_options)
            .field("public_endpoint", &self.public_endpoint)
            .field("filters", &self.filters.len())
            .field("server_name", &self.server_name)
            .field("read_event", &self.read_event)
            .field("write_event", &self.write_event)
            .field("filtered_status", &self.filtered_status)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use opentelemetry::trace::{SpanContext, SpanId, TraceFlags, TraceId, TraceState};

    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        let request = Request::new(Body::empty());

        assert_eq!((config.span_name_formatter)("/v1/hello", &request), "/v1/hello");
        assert_eq!(config.filtered_status, StatusCode::FORBIDDEN);
        assert!(!config.read_event && !config.write_event);
        let (kind, attributes, links) = config.span_start_parts();
        assert_eq!(kind, SpanKind::Server);
        assert!(attributes.is_empty() && links.is_empty());
    }

    #[test]
    fn span_options_accumulate() {
        let linked = SpanContext::new(
            TraceId::from_u128(7),
            SpanId::from_u64(9),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        );
        let config = Config::default()
            .with_span_options([SpanStartOption::Attributes(vec![KeyValue::new("a", 1i64)])])
            .with_span_options([
                SpanStartOption::Kind(SpanKind::Internal),
                SpanStartOption::Attributes(vec![KeyValue::new("b", 2i64)]),
                SpanStartOption::Link(Link::new(linked.clone(), Vec::new())),
            ]);

        let (kind, attributes, links) = config.span_start_parts();

        assert_eq!(kind, SpanKind::Internal);
        assert_eq!(
            attributes,
            vec![KeyValue::new("a", 1i64), KeyValue::new("b", 2i64)]
        );
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].span_context, linked);
    }

    #[test]
    fn message_events_are_independent() {
        let config = Config::default().with_message_events([MessageEvent::Write]);

        assert!(!config.read_event);
        assert!(config.write_event);
    }
}
