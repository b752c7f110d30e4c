//! Cluster request proxy
//!
//! `ANY /clusters/{cluster}/{*api}` is relayed to the cluster's API server.
//! Plain requests go through the cluster's pooled `reqwest` client and the
//! response body is streamed back untouched. WebSocket upgrades (exec,
//! attach, port-forward, watch) are bridged frame by frame to an upstream
//! `tokio-tungstenite` connection using the cluster's TLS material.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{
        FromRequestParts, Path, Request, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use futures::{SinkExt, StreamExt, TryStreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{
    self, client::IntoClientRequest, protocol::CloseFrame as UpstreamCloseFrame,
};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::{Position, Url};

use super::AppState;
use crate::auth::mismatch::{
    MISMATCH_HEADER, MISMATCH_HEADER_VALUE, MismatchDetector, has_bearer_token, mismatch_response,
};
use crate::auth::token_from_cookie;
use crate::context::{ClusterContext, ContextSource};
use crate::kubeconfig;
use crate::{Error, Result};

/// `Sec-WebSocket-Protocol` entry prefix carrying a base64url bearer token
pub const BEARER_PROTOCOL_PREFIX: &str = "base64url.bearer.authorization.k8s.io.";

/// Header with base64 kubeconfigs for stateless clusters
const KUBECONFIG_HEADER: &str = "kubeconfig";

/// Header identifying the user owning stateless clusters
const USER_ID_HEADER: &str = "x-headlamp-user-id";

/// Lifetime of a context loaded from request headers
const STATELESS_CONTEXT_TTL: Duration = Duration::from_secs(5 * 60);

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Token obtained by the refresh middleware for this request
#[derive(Debug, Clone)]
pub struct RefreshedToken(pub String);

/// Relay one request to the cluster named in the path
pub(super) async fn cluster_request(
    State(state): State<Arc<AppState>>,
    Path((cluster, _)): Path<(String, String)>,
    req: Request,
) -> Response {
    match forward(&state, &cluster, req).await {
        Ok(response) => response,
        Err(e) => super::error_response(&e),
    }
}

async fn forward(state: &Arc<AppState>, cluster: &str, req: Request) -> Result<Response> {
    let ctx = resolve_context(state, cluster, req.headers())?;
    if let Some(err) = &ctx.error {
        return Err(Error::ClusterSetup(err.clone()));
    }
    let server =
        Url::parse(&ctx.server).map_err(|_| Error::ClusterNotFound(cluster.to_string()))?;

    let (mut parts, body) = req.into_parts();
    let api = api_path(parts.uri.path()).unwrap_or_default().to_string();
    let websocket = is_websocket_upgrade(&parts.headers);

    let refreshed = parts.extensions.get::<RefreshedToken>();
    let headers = outbound_headers(&parts.headers, &server, &ctx, cluster, websocket, refreshed);
    let had_bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(has_bearer_token);
    let detector = MismatchDetector::new(ctx.oidc.is_some(), ctx.name.clone());
    let upstream_url = upstream_url(&server, &api, parts.uri.query());

    if websocket {
        let ws = WebSocketUpgrade::from_request_parts(&mut parts, state)
            .await
            .map_err(|e| Error::BadRequest(e.body_text()))?;
        return upgrade(state, &ctx, ws, &upstream_url, headers, &detector, had_bearer).await;
    }

    let body = axum::body::to_bytes(body, state.config.server.max_body_size)
        .await
        .map_err(|e| Error::BadRequest(format!("failed to read request body: {e}")))?;

    let client = state.store.client(&ctx.name)?;
    let mut request = client
        .request(parts.method.clone(), upstream_url.as_str())
        .headers(headers);
    if !body.is_empty() {
        request = request.body(body);
    }

    debug!(cluster = %ctx.name, method = %parts.method, path = %api, "Proxying request");
    let upstream = request.send().await.map_err(|e| {
        warn!(cluster = %ctx.name, error = %e, "Upstream request failed");
        Error::ProxyForwarding(e.to_string())
    })?;

    let status = upstream.status();
    if let Some(response) = mismatch_diagnostic(state, &detector, status, had_bearer) {
        return Ok(response);
    }

    let upstream_headers = upstream.headers().clone();
    let mut response = Response::new(Body::from_stream(
        upstream.bytes_stream().map_err(std::io::Error::other),
    ));
    *response.status_mut() = status;
    copy_response_headers(&upstream_headers, response.headers_mut());
    if detector.detect(status, had_bearer) {
        response.headers_mut().insert(
            MISMATCH_HEADER,
            HeaderValue::from_static(MISMATCH_HEADER_VALUE),
        );
    }
    Ok(response)
}

/// Context serving `cluster` for a request with `headers`
///
/// Requests carrying both a base64 kubeconfig and a user ID address a
/// per-user context keyed `{cluster}{user}`. It is loaded from the header
/// on first use and expires after a few minutes.
pub(super) fn resolve_context(
    state: &AppState,
    cluster: &str,
    headers: &HeaderMap,
) -> Result<Arc<ClusterContext>> {
    let (Some(kubeconfigs), Some(user_id)) = (
        header_str(headers, KUBECONFIG_HEADER),
        header_str(headers, USER_ID_HEADER),
    )
    else {
        return state.store.get(cluster);
    };

    let key = format!("{cluster}{user_id}");
    if let Ok(ctx) = state.store.get(&key) {
        return Ok(ctx);
    }

    for encoded in kubeconfigs.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let config = match kubeconfig::load_base64(encoded) {
            Ok(config) => config,
            Err(e) => {
                debug!(cluster = %cluster, error = %e, "Ignoring unreadable kubeconfig header");
                continue;
            }
        };
        let (contexts, _) = kubeconfig::to_contexts(&config, ContextSource::DynamicCluster, None, &[]);
        if let Some(mut ctx) = contexts
            .into_iter()
            .find(|c| c.name == cluster || c.original_name == cluster)
        {
            ctx.name.clone_from(&key);
            ctx.internal = true;
            ctx.expires_at = Some(Instant::now() + STATELESS_CONTEXT_TTL);
            state.store.add(ctx)?;
            debug!(cluster = %cluster, "Loaded stateless context from request headers");
            return state.store.get(&key);
        }
    }

    Err(Error::ClusterNotFound(cluster.to_string()))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// API path below `/clusters/{cluster}/`, still percent-encoded
fn api_path(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("/clusters/")?;
    rest.split_once('/').map(|(_, api)| api)
}

fn upstream_url(server: &Url, api: &str, query: Option<&str>) -> String {
    let mut url = format!(
        "{}/{}",
        server.as_str().trim_end_matches('/'),
        api.trim_start_matches('/')
    );
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

/// Whether the request asks for a WebSocket upgrade
fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case("upgrade"));
    let upgrade_websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    connection_upgrade && upgrade_websocket
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Headers sent to the API server
///
/// Credential precedence: a token refreshed for this request, the cluster's
/// auth cookie, the caller's `Authorization` header, a token embedded in the
/// WebSocket protocol list, the context's static token.
fn outbound_headers(
    inbound: &HeaderMap,
    server: &Url,
    ctx: &ClusterContext,
    cluster: &str,
    websocket: bool,
    refreshed: Option<&RefreshedToken>,
) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        let skip = is_hop_by_hop(name)
            || name == header::HOST
            || name == header::COOKIE
            || name == header::CONTENT_LENGTH
            || name.as_str() == KUBECONFIG_HEADER
            || name.as_str() == USER_ID_HEADER
            || (websocket
                && (name == header::USER_AGENT || name.as_str().starts_with("sec-websocket-")));
        if !skip {
            headers.append(name.clone(), value.clone());
        }
    }

    if let Ok(authority) = HeaderValue::from_str(&server[Position::BeforeHost..Position::AfterPort]) {
        headers.insert(header::HOST, authority.clone());
        headers.insert("x-forwarded-host", authority);
    }

    let token = refreshed
        .map(|t| t.0.clone())
        .or_else(|| token_from_cookie(inbound, cluster));
    if let Some(token) = token {
        set_bearer(&mut headers, &token);
    }

    if websocket {
        let offered = inbound
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let (token, remaining) = process_websocket_protocols(offered);
        if let Some(token) = token.filter(|_| !headers.contains_key(header::AUTHORIZATION)) {
            set_bearer(&mut headers, &token);
        }
        if let Some(value) = remaining.and_then(|r| HeaderValue::from_str(&r).ok()) {
            headers.insert(header::SEC_WEBSOCKET_PROTOCOL, value);
        }
    }

    if !headers.contains_key(header::AUTHORIZATION) {
        if let Some(token) = &ctx.credentials.token {
            set_bearer(&mut headers, token);
        }
    }

    headers
}

fn set_bearer(headers: &mut HeaderMap, token: &str) {
    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
        headers.insert(header::AUTHORIZATION, value);
    }
}

/// Split a `Sec-WebSocket-Protocol` value into the embedded bearer token
/// and the remaining protocols
///
/// Returns `None` for the remaining list when only the token entry was
/// offered, meaning the header should be dropped.
#[must_use]
pub fn process_websocket_protocols(value: &str) -> (Option<String>, Option<String>) {
    let mut token = None;
    let mut remaining = Vec::new();

    for protocol in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match protocol.strip_prefix(BEARER_PROTOCOL_PREFIX) {
            Some(encoded) => {
                if token.is_none() {
                    token = decode_protocol_token(encoded);
                }
            }
            None => remaining.push(protocol),
        }
    }

    (token, (!remaining.is_empty()).then(|| remaining.join(", ")))
}

/// Base64 token from the protocol entry; undecodable values are used as-is
fn decode_protocol_token(encoded: &str) -> Option<String> {
    let decoded = URL_SAFE
        .decode(encoded)
        .or_else(|_| URL_SAFE_NO_PAD.decode(encoded))
        .or_else(|_| STANDARD_NO_PAD.decode(encoded))
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok());
    Some(decoded.unwrap_or_else(|| encoded.to_string())).filter(|t| !t.is_empty())
}

fn copy_response_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        if !is_hop_by_hop(name) {
            to.append(name.clone(), value.clone());
        }
    }
}

/// Diagnostic body replacing an upstream 401/403, when enabled
fn mismatch_diagnostic(
    state: &AppState,
    detector: &MismatchDetector,
    status: StatusCode,
    had_bearer: bool,
) -> Option<Response> {
    if !detector.detect(status, had_bearer) {
        return None;
    }
    warn!(
        cluster = %detector.cluster(),
        status = status.as_u16(),
        "API server rejected the OIDC token; its OIDC settings may not match"
    );
    state
        .config
        .oidc
        .mismatch_diagnostic_body
        .then(|| mismatch_response(status))
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket
// ─────────────────────────────────────────────────────────────────────────────

async fn upgrade(
    state: &AppState,
    ctx: &ClusterContext,
    ws: WebSocketUpgrade,
    upstream_url: &str,
    headers: HeaderMap,
    detector: &MismatchDetector,
    had_bearer: bool,
) -> Result<Response> {
    let ws_url = websocket_url(upstream_url)?;
    let mut request = ws_url
        .as_str()
        .into_client_request()
        .map_err(|e| Error::ProxyForwarding(e.to_string()))?;
    for (name, value) in &headers {
        if name != header::HOST {
            request.headers_mut().append(name.clone(), value.clone());
        }
    }

    let connector = state.store.websocket_tls(&ctx.name)?.map(Connector::Rustls);
    let (upstream, handshake) =
        match tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector)
            .await
        {
            Ok(connected) => connected,
            Err(tungstenite::Error::Http(rejected)) => {
                let status = rejected.status();
                if let Some(response) = mismatch_diagnostic(state, detector, status, had_bearer) {
                    return Ok(response);
                }
                let body = rejected.body().clone().unwrap_or_default();
                let mut response = (status, Body::from(body)).into_response();
                copy_response_headers(rejected.headers(), response.headers_mut());
                if detector.detect(status, had_bearer) {
                    response.headers_mut().insert(
                        MISMATCH_HEADER,
                        HeaderValue::from_static(MISMATCH_HEADER_VALUE),
                    );
                }
                return Ok(response);
            }
            Err(e) => {
                warn!(cluster = %ctx.name, error = %e, "Upstream WebSocket connect failed");
                return Err(Error::ProxyForwarding(e.to_string()));
            }
        };

    let selected = handshake
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let ws = match selected {
        Some(protocol) => ws.protocols([protocol]),
        None => ws,
    };

    let cluster = ctx.name.clone();
    debug!(cluster = %cluster, "WebSocket upgraded");
    Ok(ws.on_upgrade(move |socket| bridge(socket, upstream, cluster)))
}

fn websocket_url(http_url: &str) -> Result<Url> {
    let mut url = Url::parse(http_url).map_err(|e| Error::ProxyForwarding(e.to_string()))?;
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|()| Error::ProxyForwarding(format!("cannot use {scheme} for {http_url}")))?;
    Ok(url)
}

/// Relay frames until either side closes
async fn bridge(client: WebSocket, upstream: UpstreamSocket, cluster: String) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    loop {
        tokio::select! {
            msg = client_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                let Some(msg) = to_upstream(msg) else { continue };
                let closing = matches!(msg, tungstenite::Message::Close(_));
                if upstream_tx.send(msg).await.is_err() || closing {
                    break;
                }
            }
            msg = upstream_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                let Some(msg) = to_client(msg) else { continue };
                let closing = matches!(msg, Message::Close(_));
                if client_tx.send(msg).await.is_err() || closing {
                    break;
                }
            }
        }
    }

    let _ = upstream_tx.close().await;
    let _ = client_tx.close().await;
    debug!(cluster = %cluster, "WebSocket session closed");
}

// Pings are answered by each side's own socket, so they are not relayed.
fn to_upstream(msg: Message) -> Option<tungstenite::Message> {
    match msg {
        Message::Text(text) => Some(tungstenite::Message::Text(text.as_str().to_owned().into())),
        Message::Binary(data) => Some(tungstenite::Message::Binary(data)),
        Message::Close(frame) => Some(tungstenite::Message::Close(frame.map(|f| {
            UpstreamCloseFrame {
                code: f.code.into(),
                reason: f.reason.as_str().to_owned().into(),
            }
        }))),
        Message::Ping(_) | Message::Pong(_) => None,
    }
}

fn to_client(msg: tungstenite::Message) -> Option<Message> {
    match msg {
        tungstenite::Message::Text(text) => Some(Message::Text(text.as_str().to_owned().into())),
        tungstenite::Message::Binary(data) => Some(Message::Binary(data)),
        tungstenite::Message::Close(frame) => Some(Message::Close(frame.map(|f| CloseFrame {
            code: f.code.into(),
            reason: f.reason.as_str().to_owned().into(),
        }))),
        tungstenite::Message::Ping(_)
        | tungstenite::Message::Pong(_)
        | tungstenite::Message::Frame(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::cookie_name;

    fn encode(token: &str) -> String {
        URL_SAFE_NO_PAD.encode(token)
    }

    #[test]
    fn protocol_token_is_extracted_and_stripped() {
        let offered = format!("{BEARER_PROTOCOL_PREFIX}{}, v4.channel.k8s.io", encode("tok"));
        let (token, remaining) = process_websocket_protocols(&offered);
        assert_eq!(token.as_deref(), Some("tok"));
        assert_eq!(remaining.as_deref(), Some("v4.channel.k8s.io"));
    }

    #[test]
    fn protocol_header_dropped_when_only_token_offered() {
        let offered = format!("{BEARER_PROTOCOL_PREFIX}{}", URL_SAFE.encode("secret"));
        let (token, remaining) = process_websocket_protocols(&offered);
        assert_eq!(token.as_deref(), Some("secret"));
        assert!(remaining.is_none());
    }

    #[test]
    fn undecodable_protocol_token_is_forwarded_raw() {
        let offered = format!("{BEARER_PROTOCOL_PREFIX}raw.token!value, v4.channel.k8s.io");
        let (token, remaining) = process_websocket_protocols(&offered);
        assert_eq!(token.as_deref(), Some("raw.token!value"));
        assert_eq!(remaining.as_deref(), Some("v4.channel.k8s.io"));
    }

    #[test]
    fn other_protocols_are_kept_in_order() {
        let (token, remaining) = process_websocket_protocols("a , b,c");
        assert!(token.is_none());
        assert_eq!(remaining.as_deref(), Some("a, b, c"));
    }

    #[test]
    fn api_path_keeps_encoding() {
        assert_eq!(
            api_path("/clusters/dev/api/v1/namespaces/a%2Fb"),
            Some("api/v1/namespaces/a%2Fb")
        );
        assert_eq!(api_path("/clusters/dev"), None);
        assert_eq!(api_path("/config"), None);
    }

    #[test]
    fn upstream_url_joins_server_path() {
        let server = Url::parse("https://rancher.example/k8s/clusters/c-1/").unwrap();
        assert_eq!(
            upstream_url(&server, "api/v1/pods", Some("watch=1")),
            "https://rancher.example/k8s/clusters/c-1/api/v1/pods?watch=1"
        );
        let server = Url::parse("https://10.0.0.1:6443").unwrap();
        assert_eq!(upstream_url(&server, "version", None), "https://10.0.0.1:6443/version");
    }

    #[test]
    fn websocket_url_switches_scheme() {
        assert_eq!(websocket_url("https://k8s:6443/api").unwrap().as_str(), "wss://k8s:6443/api");
        assert_eq!(websocket_url("http://k8s/api").unwrap().as_str(), "ws://k8s/api");
    }

    #[test]
    fn detects_websocket_upgrade() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        assert!(is_websocket_upgrade(&headers));

        headers.remove(header::UPGRADE);
        assert!(!is_websocket_upgrade(&headers));
    }

    #[test]
    fn cookie_beats_inbound_bearer() {
        // GIVEN: a request with both an auth cookie and an Authorization header
        let ctx = ClusterContext::new("dev", "https://k8s:6443", ContextSource::KubeConfig);
        let server = Url::parse(&ctx.server).unwrap();
        let mut inbound = HeaderMap::new();
        inbound.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer header-token"));
        inbound.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("{}=cookie-token; other=1", cookie_name("dev"))).unwrap(),
        );

        // WHEN: outbound headers are built
        let out = outbound_headers(&inbound, &server, &ctx, "dev", false, None);

        // THEN: the cookie token is sent and cookies never reach the cluster
        assert_eq!(out[header::AUTHORIZATION], "Bearer cookie-token");
        assert!(out.get(header::COOKIE).is_none());
        assert_eq!(out[header::HOST], "k8s:6443");
        assert_eq!(out["x-forwarded-host"], "k8s:6443");
    }

    #[test]
    fn refreshed_token_beats_cookie() {
        let ctx = ClusterContext::new("dev", "https://k8s", ContextSource::KubeConfig);
        let server = Url::parse(&ctx.server).unwrap();
        let mut inbound = HeaderMap::new();
        inbound.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("{}=old", cookie_name("dev"))).unwrap(),
        );

        let refreshed = RefreshedToken("new".into());
        let out = outbound_headers(&inbound, &server, &ctx, "dev", false, Some(&refreshed));
        assert_eq!(out[header::AUTHORIZATION], "Bearer new");
    }

    #[test]
    fn static_token_only_without_caller_credentials() {
        let mut ctx = ClusterContext::new("dev", "https://k8s", ContextSource::KubeConfig);
        ctx.credentials.token = Some("static".into());
        let server = Url::parse(&ctx.server).unwrap();

        let out = outbound_headers(&HeaderMap::new(), &server, &ctx, "dev", false, None);
        assert_eq!(out[header::AUTHORIZATION], "Bearer static");

        let mut inbound = HeaderMap::new();
        inbound.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer mine"));
        let out = outbound_headers(&inbound, &server, &ctx, "dev", false, None);
        assert_eq!(out[header::AUTHORIZATION], "Bearer mine");
    }

    #[test]
    fn websocket_headers_are_rewritten() {
        // GIVEN: an upgrade offering a token protocol and a channel protocol
        let ctx = ClusterContext::new("dev", "https://k8s", ContextSource::KubeConfig);
        let server = Url::parse(&ctx.server).unwrap();
        let mut inbound = HeaderMap::new();
        inbound.insert(header::USER_AGENT, HeaderValue::from_static("browser"));
        inbound.insert(header::SEC_WEBSOCKET_KEY, HeaderValue::from_static("abc=="));
        inbound.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(&format!(
                "{BEARER_PROTOCOL_PREFIX}{}, v5.channel.k8s.io",
                encode("ws-token")
            ))
            .unwrap(),
        );

        // WHEN: outbound headers are built for the upgrade
        let out = outbound_headers(&inbound, &server, &ctx, "dev", true, None);

        // THEN: the token moves to Authorization and handshake headers are left to the client
        assert_eq!(out[header::AUTHORIZATION], "Bearer ws-token");
        assert_eq!(out[header::SEC_WEBSOCKET_PROTOCOL], "v5.channel.k8s.io");
        assert!(out.get(header::USER_AGENT).is_none());
        assert!(out.get(header::SEC_WEBSOCKET_KEY).is_none());
    }

    #[test]
    fn websocket_protocol_token_does_not_override_cookie() {
        let ctx = ClusterContext::new("dev", "https://k8s", ContextSource::KubeConfig);
        let server = Url::parse(&ctx.server).unwrap();
        let mut inbound = HeaderMap::new();
        inbound.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("{}=cookie", cookie_name("dev"))).unwrap(),
        );
        inbound.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(&format!("{BEARER_PROTOCOL_PREFIX}{}", encode("proto"))).unwrap(),
        );

        let out = outbound_headers(&inbound, &server, &ctx, "dev", true, None);
        assert_eq!(out[header::AUTHORIZATION], "Bearer cookie");
        assert!(out.get(header::SEC_WEBSOCKET_PROTOCOL).is_none());
    }
}
