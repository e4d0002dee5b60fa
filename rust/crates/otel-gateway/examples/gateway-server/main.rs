//! A small gateway that greets callers.
//!
//! Requests to `/greet/{name}` go through the instrumented handler and
//! publish traces and metrics over OTLP. `/health` bypasses instrumentation.

use std::convert::Infallible;
use std::env;
use std::future;
use std::net;
use std::sync::Arc;

use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use opentelemetry::KeyValue;
use otel_gateway::tracing;
use otel_gateway::{
    labeler_from_context, new_handler, request_context, Body, BufferedResponse, Config,
    HandlerFunc, HttpRoute, PathParams, ResponseWriter,
};

const DEFAULT_PORT: u16 = 9001;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let host = net::IpAddr::V6(net::Ipv6Addr::LOCALHOST);
    let port = env::var("PORT")
        .map(|s| s.parse())
        .unwrap_or(Ok(DEFAULT_PORT))?;
    let address = net::SocketAddr::new(host, port);

    let service_name = env!("CARGO_BIN_NAME");
    let service_version = env!("CARGO_PKG_VERSION");
    let _global_tracing = otel_gateway::setup::init_tracing(None, service_name, service_version)
        .map_err(|e| anyhow::anyhow!(e))?;

    let gateway = new_handler(
        Arc::new(greet),
        "greet",
        Config::default()
            .with_public_endpoint_fn(|request| !request.headers().contains_key("x-internal"))
            .with_filter(|request| request.method() == http::Method::GET)
            .with_filtered_status(StatusCode::METHOD_NOT_ALLOWED),
    );

    let make_service = make_service_fn(move |conn: &AddrStream| {
        let peer = conn.remote_addr();
        let gateway = Arc::clone(&gateway);
        async move {
            Ok::<_, Infallible>(service_fn(move |request| {
                serve(Arc::clone(&gateway), peer, request)
            }))
        }
    });

    let server = hyper::Server::bind(&address).serve(make_service);
    let address = server.local_addr();
    tracing::info!(
        server.address = %address.ip(),
        server.port = address.port(),
       "started",
    );
    server
        .with_graceful_shutdown(wait_for_termination())
        .await?;

    Ok(())
}

async fn serve(
    gateway: HandlerFunc,
    peer: net::SocketAddr,
    request: hyper::Request<hyper::Body>,
) -> anyhow::Result<hyper::Response<hyper::Body>> {
    let path = request.uri().path();
    if path == "/health" {
        return Ok(hyper::Response::new(hyper::Body::from("OK")));
    }
    let Some(name) = path.strip_prefix("/greet/").map(str::to_owned) else {
        let mut response = hyper::Response::new(hyper::Body::empty());
        *response.status_mut() = StatusCode::NOT_FOUND;
        return Ok(response);
    };

    let (mut parts, body) = request.into_parts();
    let body = hyper::body::to_bytes(body).await?;
    parts.extensions.insert(peer);
    parts
        .extensions
        .insert(HttpRoute("/greet/{name}".to_owned()));
    let request = http::Request::from_parts(parts, Body::from(body.to_vec()));
    let path_params = PathParams::from([("name".to_owned(), name)]);

    // Gateway handlers block, so keep them off the async workers.
    let response = tokio::task::spawn_blocking(move || {
        let mut response = BufferedResponse::new();
        gateway(&mut response, request, path_params);
        response.into_response()
    })
    .await?;
    Ok(response.map(hyper::Body::from))
}

fn greet(writer: &mut dyn ResponseWriter, request: http::Request<Body>, path_params: PathParams) {
    let name = path_params.get("name").map_or("world", String::as_str);
    let (labeler, _) = labeler_from_context(&request_context(&request));
    labeler.add([KeyValue::new("greeting.shouted", name.ends_with('!'))]);
    tracing::info!(name, "greeting");

    writer
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    if let Err(error) = writer.write_all(format!("Hello, {name}\n").as_bytes()) {
        tracing::warn!(%error, "failed to write the greeting");
    }
}

/// Resolves on Ctrl+C, or on SIGTERM where the platform has it. A signal that
/// cannot be listened for never fires.
async fn wait_for_termination() {
    let interrupt = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(%error, "cannot listen for Ctrl+C");
            future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(error) => {
                tracing::warn!(%error, "cannot listen for SIGTERM");
                future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = future::pending::<()>();

    tokio::select! {
        () = interrupt => tracing::info!("interrupted, shutting down"),
        () = terminate => tracing::info!("terminated, shutting down"),
    }
}
