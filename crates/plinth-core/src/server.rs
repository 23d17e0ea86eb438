use std::{
    convert::Infallible,
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};

use anyhow::{Context as _, Result};
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use plinth_plugin_sdk::{
    routes::{ApiRequest, HttpResponse},
    ApiError,
};
use tokio::{net::TcpListener, sync::watch, task::JoinSet};
use tower::{Layer, Service, ServiceExt};
use tower_http::cors::{Cors, CorsLayer};
use tracing::Instrument;

use crate::{config::Config, normalize, router::Router};

/// HTTP/1 front end serving an immutable route table.
pub struct Server {
    addr: SocketAddr,
    max_body_bytes: usize,
    app: Cors<App>,
}

#[derive(Clone)]
pub struct App {
    router: Arc<Router>,
}

impl App {
    pub fn new(router: Router) -> Self {
        Self {
            router: Arc::new(router),
        }
    }
}

impl Service<ApiRequest> for App {
    type Response = HttpResponse;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<HttpResponse, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ApiRequest) -> Self::Future {
        let router = self.router.clone();
        Box::pin(async move { Ok(router.dispatch(req).await) })
    }
}

impl Server {
    pub fn new(config: &Config, router: Router) -> Result<Self> {
        let addr = config.server.parse_bind_addr()?;
        Ok(Self {
            addr,
            max_body_bytes: config.server.max_body_bytes,
            app: CorsLayer::permissive().layer(App::new(router)),
        })
    }

    pub async fn run(self) -> Result<()> {
        let tcp = TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("failed to bind {}", self.addr))?;
        tracing::info!(addr = %self.addr, "server listening; awaiting shutdown signal (Ctrl+C)");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                biased;
                signal = &mut ctrl_c => {
                    signal.context("failed to install ctrl-c handler")?;
                    tracing::info!("shutdown signal received; draining connections");
                    break;
                }
                accept = tcp.accept() => {
                    let (stream, peer_addr) = accept?;
                    let app = self.app.clone();
                    let rx = shutdown_rx.clone();
                    let limit = self.max_body_bytes;
                    connections.spawn(async move {
                        if let Err(err) = handle_connection(app, stream, peer_addr, limit, rx).await {
                            tracing::warn!(error = %err, "connection closed with error");
                        }
                    });
                }
            }
        }

        shutdown_tx.send(true).ok();
        while let Some(result) = connections.join_next().await {
            if let Err(err) = result {
                tracing::error!(error = %err, "connection task aborted");
            }
        }
        Ok(())
    }
}

async fn handle_connection(
    app: Cors<App>,
    stream: tokio::net::TcpStream,
    peer_addr: SocketAddr,
    max_body_bytes: usize,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let service = service_fn(move |req| {
        let app = app.clone();
        async move { Ok::<_, Infallible>(handle_request(app, req, max_body_bytes).await) }
    });
    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            result.with_context(|| format!("connection from {peer_addr} failed"))?;
        }
        _ = shutdown.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.await
                .with_context(|| format!("connection from {peer_addr} failed during shutdown"))?;
        }
    }
    Ok(())
}

async fn handle_request(
    app: Cors<App>,
    req: Request<Incoming>,
    max_body_bytes: usize,
) -> Response<Full<Bytes>> {
    let start = Instant::now();
    let span = tracing::info_span!(
        "request",
        method = %req.method(),
        path = %req.uri().path(),
        status = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    );

    async move {
        let response = match read_body(req, max_body_bytes).await {
            Ok(req) => match app.oneshot(req).await {
                Ok(response) => response,
                Err(never) => match never {},
            },
            Err(rejection) => rejection,
        };

        let status = response.status();
        let span = tracing::Span::current();
        span.record("status", status.as_u16());
        span.record("duration_ms", start.elapsed().as_millis() as u64);
        metrics::counter!("plinth_requests_total", "outcome" => outcome(status)).increment(1);
        if status.is_server_error() {
            tracing::warn!("request failed");
        } else {
            tracing::debug!("request served");
        }
        response.map(Full::new)
    }
    .instrument(span)
    .await
}

async fn read_body(req: Request<Incoming>, limit: usize) -> Result<ApiRequest, HttpResponse> {
    let path = req.uri().path().to_string();
    let (parts, body) = req.into_parts();
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(Request::from_parts(parts, collected.to_bytes())),
        Err(err) => {
            let rejection = if err.downcast_ref::<LengthLimitError>().is_some() {
                ApiError::new(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    format!("request body exceeds {limit} bytes"),
                )
                .with_code("PAYLOAD_TOO_LARGE")
            } else {
                ApiError::bad_request("failed to read request body").with_details(err.to_string())
            };
            let envelope = normalize::classify(rejection.into(), Some(&path));
            Err(normalize::render_envelope(&envelope))
        }
    }
}

fn outcome(status: StatusCode) -> &'static str {
    if status.is_server_error() {
        "error"
    } else if status.is_client_error() {
        "rejected"
    } else {
        "ok"
    }
}
