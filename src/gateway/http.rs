//! HTTP surface: the WebSocket session endpoint, a liveness check and the
//! Prometheus scrape endpoint.
//!
//! Admission runs before the upgrade, so a busy gateway answers a plain
//! `429 Too Many Requests` and never starts a session.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, warn};

use super::Gateway;
use crate::backend::Dialer;

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

pub const SESSION_PATH: &str = "/";
pub const HEALTH_PATH: &str = "/api/healthz";
pub const METRICS_PATH: &str = "/metrics";

const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

// -----------------------------------------------------------------------------
// ----- Public ----------------------------------------------------------------

/// Serves one accepted client connection (plain or TLS) until it closes.
pub async fn serve_connection<D, I>(io: I, peer: SocketAddr, gateway: Arc<Gateway<D>>)
where
    D: Dialer,
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| {
        let gateway = Arc::clone(&gateway);
        async move { Ok::<_, Infallible>(route(gateway, peer, req).await) }
    });

    if let Err(err) = http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades()
        .await
    {
        debug!(%peer, "connection closed with error: {err}");
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Routing -----------------------------------------------------

async fn route<D: Dialer>(
    gateway: Arc<Gateway<D>>,
    peer: SocketAddr,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let label = path_label(req.uri().path());
    let metrics = gateway.metrics().clone();

    let response = dispatch(gateway, peer, req).await;
    metrics.record_request(label, response.status().as_u16());
    response
}

async fn dispatch<D: Dialer>(
    gateway: Arc<Gateway<D>>,
    peer: SocketAddr,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let path = req.uri().path();

    if path == HEALTH_PATH && matches!(*req.method(), Method::GET | Method::POST) {
        return status(StatusCode::OK);
    }

    if path == METRICS_PATH && *req.method() == Method::GET {
        return metrics(&gateway);
    }

    if path == SESSION_PATH && *req.method() == Method::GET {
        return open_session(gateway, peer, req).await;
    }

    status(StatusCode::NOT_FOUND)
}

/// Unknown paths share one label so clients cannot grow the series set.
fn path_label(path: &str) -> &'static str {
    match path {
        SESSION_PATH => SESSION_PATH,
        HEALTH_PATH => HEALTH_PATH,
        METRICS_PATH => METRICS_PATH,
        _ => "other",
    }
}

fn metrics<D: Dialer>(gateway: &Gateway<D>) -> Response<Full<Bytes>> {
    match gateway.render_metrics() {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(METRICS_CONTENT_TYPE));
            response
        }
        Err(err) => {
            error!("metrics encoding failed: {err}");
            status(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn open_session<D: Dialer>(
    gateway: Arc<Gateway<D>>,
    peer: SocketAddr,
    mut req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    if !hyper_tungstenite::is_upgrade_request(&req) {
        return text(StatusCode::BAD_REQUEST, "expected a websocket upgrade");
    }

    let admission = match gateway.admit().await {
        Ok(admission) => admission,
        Err(err) => {
            warn!(%peer, "session rejected: {err}");
            return status(err.status_code());
        }
    };

    let (response, websocket) = match hyper_tungstenite::upgrade(&mut req, None) {
        Ok(upgrade) => upgrade,
        Err(err) => {
            warn!(%peer, "websocket upgrade refused: {err}");
            return text(StatusCode::BAD_REQUEST, "websocket upgrade failed");
        }
    };

    debug!(%peer, slot = %admission.slot(), "session admitted");

    tokio::spawn(async move {
        match websocket.await {
            Ok(ws) => {
                gateway.run_session(admission, ws).await;
            }
            Err(err) => error!(%peer, "websocket handshake failed: {err}"),
        }
    });

    let (parts, _) = response.into_parts();
    Response::from_parts(parts, Full::new(Bytes::new()))
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

fn status(code: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = code;
    response
}

fn text(code: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = code;
    response
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
