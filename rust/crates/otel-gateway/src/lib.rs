//! OpenTelemetry instrumentation for gateway handlers.
//!
//! [`new_middleware`] wraps a [`HandlerFunc`] so that every request gets a
//! server span, built from the trace context in its headers, and one set of
//! request size, response size and duration measurements.

pub mod body;
pub mod config;
mod error;
pub mod handler;
pub mod http_client;
pub mod labeler;
pub mod response;
pub mod semconv;
pub mod setup;
pub mod start_time;

/// The instrumentation scope of the tracer and meter used by the middleware.
pub const SCOPE_NAME: &str = "otel-gateway";

pub use body::{Body, BodyWrapper};
pub use config::{Config, Filter, MessageEvent, SpanStartOption};
pub use error::CapturedError;
pub use handler::{
    new_handler, new_middleware, request_context, set_request_context, HandlerFunc, HttpRoute,
    Middleware, PathParams,
};
pub use labeler::{context_with_labeler, labeler_from_context, Labeler};
pub use response::{BufferedResponse, ResponseWrapper, ResponseWriter};
pub use semconv::{MetricsRecorder, OtelMetrics, ServerMetricData};
pub use start_time::{context_with_start_time, start_time_from_context};

// Re-export [`tracing`] so clients don't have to add it separately.
pub use tracing;
