use std::sync::Arc;

use http::{HeaderMap, Request, StatusCode};
use opentelemetry::global;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::testing::trace::InMemorySpanExporter;
use opentelemetry_sdk::trace::TracerProvider;

use otel_gateway::http_client::{inject_trace_headers, trace_headers};
use otel_gateway::{new_handler, request_context, Body, BufferedResponse, Config, PathParams};

#[test]
fn outbound_headers_carry_the_server_span() -> anyhow::Result<()> {
    global::set_text_map_propagator(TraceContextPropagator::new());
    let exporter = InMemorySpanExporter::default();
    let provider = TracerProvider::builder()
        .with_simple_exporter(exporter.clone())
        .build();

    let outbound = Arc::new(std::sync::Mutex::new(HeaderMap::new()));
    let traced = new_handler(
        Arc::new({
            let outbound = Arc::clone(&outbound);
            move |writer: &mut dyn otel_gateway::ResponseWriter,
                  request: Request<Body>,
                  _path_params: PathParams| {
                let mut headers = outbound.lock().unwrap();
                inject_trace_headers(&request_context(&request), &mut headers);
                writer.write_header(StatusCode::NO_CONTENT);
            }
        }),
        "proxy",
        Config::default().with_tracer_provider(&provider),
    );

    let mut response = BufferedResponse::new();
    traced(
        &mut response,
        Request::get("/proxy").body(Body::empty())?,
        PathParams::new(),
    );

    for result in provider.force_flush() {
        result?;
    }
    let spans = exporter.get_finished_spans()?;
    let span_context = &spans[0].span_context;
    let expected = format!(
        "00-{}-{}-01",
        span_context.trace_id(),
        span_context.span_id()
    );
    let outbound = outbound.lock().unwrap();
    assert_eq!(
        outbound.get("traceparent").map(|value| value.to_str()).transpose()?,
        Some(expected.as_str())
    );
    Ok(())
}

#[test]
fn empty_context_produces_no_headers() {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let headers = trace_headers(&opentelemetry::Context::new());

    assert!(headers.is_empty());
}
