use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::header::{CONNECTION, HOST, HeaderMap, HeaderName, HeaderValue};
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{Request, Response, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tower::Service;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type Body = http_body_util::combinators::BoxBody<Bytes, BoxError>;
pub type HttpService = tower::util::BoxService<Request<Body>, Response<Body>, BoxError>;

pub fn full_body(data: impl Into<Bytes>) -> Body {
    http_body_util::Full::new(data.into())
        .map_err(|e| match e {})
        .boxed()
}

pub fn empty_body() -> Body {
    http_body_util::Empty::new().map_err(|e| match e {}).boxed()
}

/// Convert a hyper `Incoming` body into our boxed body type.
pub fn incoming_to_body(incoming: Incoming) -> Body {
    incoming.map_err(|e| -> BoxError { Box::new(e) }).boxed()
}

/// Buffer a whole body, failing once it grows past `limit` bytes.
pub async fn collect_body(mut body: Body, limit: usize) -> Result<Bytes, BoxError> {
    let mut buf = BytesMut::new();
    while let Some(frame) = body.frame().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => return Err(e),
        };
        let Ok(data) = frame.into_data() else {
            continue;
        };
        if buf.len() + data.len() > limit {
            return Err(format!("body exceeds {limit} bytes").into());
        }
        buf.extend_from_slice(&data);
    }
    Ok(buf.freeze())
}

/// Plain-text response with the given status.
pub fn text_response(status: StatusCode, text: &'static str) -> Response<Body> {
    let mut resp = Response::new(full_body(text));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn connection_tokens(headers: &HeaderMap) -> impl Iterator<Item = &str> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Whether `name` only applies to a single hop, either by definition or
/// because the `Connection` header in `headers` lists it.
pub fn is_hop_by_hop(name: &HeaderName, headers: &HeaderMap) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
        || connection_tokens(headers).any(|t| t.eq_ignore_ascii_case(name.as_str()))
}

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = connection_tokens(headers)
        .filter_map(|t| HeaderName::from_bytes(t.as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Opens a fresh connection per request to whatever origin the request URI
/// names, over TCP or TLS, and sends it as HTTP/1.1.
///
/// No retries: a failed exchange is reported once to the caller.
#[derive(Clone)]
pub struct UpstreamClient {
    tls: TlsConnector,
    connect_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(tls: Arc<ClientConfig>, connect_timeout: Duration) -> Self {
        Self {
            tls: TlsConnector::from(tls),
            connect_timeout,
        }
    }

    /// Send an absolute-form request upstream and return the response head
    /// with a streaming body.
    pub async fn send(&self, mut req: Request<Body>) -> Result<Response<Body>, BoxError> {
        let uri = req.uri().clone();
        let host = uri.host().ok_or("request URI has no host")?.to_string();
        let tls = match uri.scheme() {
            Some(s) if *s == Scheme::HTTPS => true,
            Some(s) if *s == Scheme::HTTP => false,
            None => false,
            Some(other) => return Err(format!("unsupported scheme {other}").into()),
        };
        let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });

        strip_hop_by_hop(req.headers_mut());
        if !req.headers().contains_key(HOST) {
            let authority = uri.authority().ok_or("request URI has no authority")?;
            req.headers_mut()
                .insert(HOST, HeaderValue::from_str(authority.as_str())?);
        }
        let path = uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        *req.uri_mut() = Uri::from(path);

        // Bracketed IPv6 literals connect without their brackets.
        let dial_host = host.trim_start_matches('[').trim_end_matches(']');
        let tcp = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((dial_host, port)),
        )
        .await
        .map_err(|_| format!("connect to {host}:{port} timed out"))??;
        tcp.set_nodelay(true).ok();

        let resp = if tls {
            let server_name = ServerName::try_from(dial_host.to_string())?;
            let stream = self.tls.connect(server_name, tcp).await?;
            send_on(TokioIo::new(stream), req).await?
        } else {
            send_on(TokioIo::new(tcp), req).await?
        };

        let mut resp = resp.map(incoming_to_body);
        strip_hop_by_hop(resp.headers_mut());
        Ok(resp)
    }
}

async fn send_on<T>(io: T, req: Request<Body>) -> Result<Response<Incoming>, BoxError>
where
    T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, "upstream connection closed with error");
        }
    });
    Ok(sender.send_request(req).await?)
}

/// Tower service at the bottom of every layer stack: forwards the request to
/// its destination.
///
/// With a base URI (reverse role) every request is rebased onto it first;
/// otherwise the request URI must already be absolute.
pub struct UpstreamService {
    client: UpstreamClient,
    base: Option<Uri>,
}

impl UpstreamService {
    pub fn new(client: UpstreamClient) -> Self {
        Self { client, base: None }
    }

    pub fn with_base(client: UpstreamClient, base: Uri) -> Self {
        Self {
            client,
            base: Some(base),
        }
    }
}

impl Service<Request<Body>> for UpstreamService {
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, BoxError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let client = self.client.clone();
        let base = self.base.clone();
        Box::pin(async move {
            if let Some(base) = base {
                let target = rebase_uri(&base, req.uri())?;
                if let Some(authority) = target.authority() {
                    req.headers_mut()
                        .insert(HOST, HeaderValue::from_str(authority.as_str())?);
                }
                *req.uri_mut() = target;
            }
            client.send(req).await
        })
    }
}

/// Join `uri`'s path and query onto `base`'s scheme, authority and path prefix.
pub fn rebase_uri(base: &Uri, uri: &Uri) -> Result<Uri, BoxError> {
    let scheme = base.scheme().cloned().unwrap_or(Scheme::HTTP);
    let authority: Authority = base
        .authority()
        .cloned()
        .ok_or("upstream URL has no authority")?;
    let prefix = base.path().trim_end_matches('/');
    let path = uri.path();
    let joined = match uri.query() {
        Some(q) => format!("{prefix}{path}?{q}"),
        None => format!("{prefix}{path}"),
    };
    Ok(Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(joined)
        .build()?)
}
