//! HTTP surface: WHEP signaling, status, HLS artifacts, the Icecast
//! stream, metrics, and the static frontend.
//!
//! Routing and TLS termination are deliberately thin — every interesting
//! decision lives in the engine components; handlers translate failures
//! into status codes and never take the broadcast down.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{ConnectInfo, Host, Path as UrlPath, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::services::{ServeDir, ServeFile};
use tracing::info;

use crate::broadcast::{Broadcaster, ClientId};
use crate::engine::Engine;
use crate::icecast::{MP3_BITRATE_KBPS, MP3_CHANNELS, MP3_SAMPLE_RATE};
use crate::status::stream_statuses;
use crate::viewers::{client_ip, ConnectionGuard, Protocol};
use crate::webrtc;

/// Builds the main application router.
pub fn router(engine: Arc<Engine>) -> Router {
    let mut app = Router::new()
        .route("/api/whep", post(whep_handler))
        .route("/api/status", get(status_handler))
        .route("/api/hls/*path", get(hls_handler))
        .route("/api/icecast.mp3", get(icecast_stream_handler))
        .route("/api/icecast.m3u8", get(icecast_playlist_handler))
        .route("/metrics", get(metrics_handler));

    let frontend = engine.config.frontend_dir.clone();
    if !engine.config.disable_frontend {
        // Client-side routing: unknown paths fall back to the index page.
        let index = frontend.join("index.html");
        app = app.fallback_service(ServeDir::new(&frontend).not_found_service(ServeFile::new(index)));
    }

    app.layer(middleware::from_fn(cors_middleware))
        .with_state(engine)
}

/// Serves the router, with TLS when a cert/key pair is configured, plus
/// the optional HTTP→HTTPS redirect listener.
pub async fn serve(engine: Arc<Engine>) -> Result<()> {
    let addr: SocketAddr = engine
        .config
        .bind_address()
        .parse()
        .with_context(|| format!("parse HTTP_ADDRESS {:?}", engine.config.http_address))?;

    if engine.config.enable_http_redirect {
        spawn_redirect_server(engine.config.https_redirect_port);
    }

    let app = router(Arc::clone(&engine));
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    match engine.config.tls_pair() {
        Some((cert, key)) => {
            let tls = RustlsConfig::from_pem_file(&cert, &key)
                .await
                .with_context(|| format!("load TLS pair {} / {}", cert.display(), key.display()))?;

            info!("Running HTTPS server at {addr}");
            axum_server::bind_rustls(addr, tls)
                .serve(make_service)
                .await
                .context("HTTPS server terminated")
        }
        None => {
            info!("Running HTTP server at {addr}");
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("bind {addr}"))?;
            axum::serve(listener, make_service)
                .await
                .context("HTTP server terminated")
        }
    }
}

/// Permanent-redirect listener pointing plain HTTP at the HTTPS origin.
fn spawn_redirect_server(port: u16) {
    tokio::spawn(async move {
        let app = Router::new().fallback(redirect_handler);
        let addr = SocketAddr::from(([0, 0, 0, 0], port));

        info!("Running HTTP->HTTPS redirect server at {addr}");
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                    tracing::error!("redirect server terminated: {e}");
                }
            }
            Err(e) => tracing::error!("redirect server bind failed: {e}"),
        }
    });
}

async fn redirect_handler(Host(host): Host, uri: Uri) -> Redirect {
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Redirect::permanent(&format!("https://{host}{path}"))
}

/// Wide-open CORS, answering preflights with 204 and stamping every other
/// response.
async fn cors_middleware(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors(response.headers_mut());
        return response;
    }

    let mut response = next.run(req).await;
    apply_cors(response.headers_mut());
    response
}

fn apply_cors(headers: &mut HeaderMap) {
    let any = HeaderValue::from_static("*");
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, any.clone());
    headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, any.clone());
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, any.clone());
    headers.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, any);
}

/// `POST /api/whep` — SDP offer in, SDP answer out.
async fn whep_handler(State(engine): State<Arc<Engine>>, offer: String) -> Response {
    if offer.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "empty SDP offer").into_response();
    }

    match webrtc::negotiate(
        &engine.api,
        &engine.stream,
        &engine.config,
        &engine.metrics,
        offer,
    )
    .await
    {
        Ok((answer, _session_id)) => (
            StatusCode::CREATED,
            [
                (header::CONTENT_TYPE, "application/sdp"),
                (header::LOCATION, "/api/whep"),
            ],
            answer,
        )
            .into_response(),
        Err(e) => {
            tracing::warn!("whep negotiation failed: {e:#}");
            (StatusCode::BAD_REQUEST, format!("{e:#}")).into_response()
        }
    }
}

/// `GET /api/status` — one-element stream status array.
async fn status_handler(State(engine): State<Arc<Engine>>) -> Response {
    if engine.config.disable_status {
        return (StatusCode::SERVICE_UNAVAILABLE, "status disabled").into_response();
    }

    axum::Json(stream_statuses(&engine)).into_response()
}

/// `GET /metrics` — Prometheus text exposition.
async fn metrics_handler(State(engine): State<Arc<Engine>>) -> Response {
    match engine.metrics.render() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("metrics render failed: {e:#}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// `GET /api/hls/*` — playlists and fMP4 segments off disk.
async fn hls_handler(
    State(engine): State<Arc<Engine>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    UrlPath(path): UrlPath<String>,
) -> Response {
    engine
        .viewers
        .track_request(Protocol::Hls, client_ip(&headers, remote));

    // The output dir holds only generated artifacts; still, never step
    // outside it.
    if path.split('/').any(|part| part == ".." || part.is_empty()) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let full = engine.hls.output_dir().join(&path);
    let bytes = match tokio::fs::read(&full).await {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };

    let (content_type, cache_control) = engine.hls.headers_for(&path);
    let mut response = Bytes::from(bytes).into_response();
    if let Some(content_type) = content_type {
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    }
    if let Ok(value) = HeaderValue::from_str(cache_control) {
        response.headers_mut().insert(header::CACHE_CONTROL, value);
    }
    response
}

/// `GET|HEAD /api/icecast.mp3` — the continuous MP3 stream.
async fn icecast_stream_handler(
    State(engine): State<Arc<Engine>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let streamer = &engine.icecast;
    if streamer.is_closed() {
        return (StatusCode::SERVICE_UNAVAILABLE, "icecast unavailable").into_response();
    }

    let icy_headers = |response: &mut Response| {
        let h = response.headers_mut();
        insert_static(h, "content-type", "audio/mpeg");
        insert_static(h, "cache-control", "no-cache, no-store, must-revalidate");
        insert_static(h, "pragma", "no-cache");
        insert_value(h, "icy-name", streamer.station_name());
        insert_value(h, "icy-description", streamer.station_name());
        insert_value(h, "icy-br", &MP3_BITRATE_KBPS.to_string());
        insert_static(h, "icy-pub", "1");
        insert_value(
            h,
            "ice-audio-info",
            &format!(
                "bitrate={MP3_BITRATE_KBPS};channels={MP3_CHANNELS};samplerate={MP3_SAMPLE_RATE}"
            ),
        );
        insert_static(h, "x-accel-buffering", "no");
    };

    if method == Method::HEAD {
        let mut response = StatusCode::OK.into_response();
        icy_headers(&mut response);
        return response;
    }

    let guard = engine
        .viewers
        .track_connection(Protocol::Icecast, client_ip(&headers, remote));

    // Warm-start with the recent ring, then follow the live channel until
    // the client goes away, the listener is evicted, or the broadcaster
    // closes.
    let output = Arc::clone(streamer.output());
    let snapshot = output.snapshot();
    let (client_id, rx) = output.add_client();

    let warm = futures::stream::iter(snapshot.into_iter().map(Ok::<Bytes, io::Error>));
    let live = ReceiverStream::new(rx).map(Ok::<Bytes, io::Error>);
    let stream = ListenerStream {
        inner: warm.chain(live),
        broadcaster: output,
        client_id,
        _guard: guard,
    };

    let mut response = Body::from_stream(stream).into_response();
    icy_headers(&mut response);
    response
}

/// `GET|HEAD /api/icecast.m3u8` — one-line playlist for the stream.
async fn icecast_playlist_handler(
    State(engine): State<Arc<Engine>>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let streamer = &engine.icecast;
    if streamer.is_closed() {
        return (StatusCode::SERVICE_UNAVAILABLE, "icecast unavailable").into_response();
    }

    let body = streamer.playlist_body(
        header_str(&headers, "x-forwarded-host"),
        header_str(&headers, "x-forwarded-proto"),
        header_str(&headers, "host"),
        engine.config.tls_pair().is_some(),
    );

    let mut response = if method == Method::HEAD {
        StatusCode::OK.into_response()
    } else {
        body.into_response()
    };

    let h = response.headers_mut();
    insert_static(h, "content-type", "application/x-mpegURL");
    insert_static(h, "cache-control", "no-store, max-age=0");
    response
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name)?.to_str().ok()
}

fn insert_static(headers: &mut HeaderMap, name: &'static str, value: &'static str) {
    headers.insert(name, HeaderValue::from_static(value));
}

fn insert_value(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Body stream for one Icecast listener. Dropping it (client disconnect,
/// eviction, broadcaster close) unregisters the client and releases the
/// viewer-tracker guard.
struct ListenerStream<S> {
    inner: S,
    broadcaster: Arc<Broadcaster>,
    client_id: ClientId,
    _guard: Option<ConnectionGuard>,
}

impl<S> Stream for ListenerStream<S>
where
    S: Stream<Item = Result<Bytes, io::Error>> + Unpin,
{
    type Item = Result<Bytes, io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

impl<S> Drop for ListenerStream<S> {
    fn drop(&mut self) {
        self.broadcaster.remove_client(self.client_id);
    }
}
