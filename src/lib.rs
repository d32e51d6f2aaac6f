pub mod ca;
pub mod config;
pub mod credential;
pub mod error;
pub mod handler;
pub mod http;
pub mod middleware;
pub mod signature;

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ::http::uri::{Authority, PathAndQuery, Scheme};
use ::http::header::{CONNECTION, HeaderValue};
use ::http::{Method, Request, Response, StatusCode, Uri};
use anyhow::Context as _;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::{Service, ServiceExt};
use tracing::Instrument;

pub use ca::CertificateAuthority;
pub use error::{Error, Result};

use ca::{DEFAULT_LEAF_CACHE_CAPACITY, LeafCache};
use handler::{HandlerLayer, RequestHandler};
use crate::http::{
    Body, BoxError, HttpService, UpstreamClient, UpstreamService, empty_body, incoming_to_body,
    text_response,
};

/// Default timeout for opening upstream TCP connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time open connections get to finish after shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Install the process-wide rustls crypto provider. Safe to call repeatedly.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// A `ServerCertVerifier` that accepts any certificate. Used when
/// `danger_accept_invalid_upstream_certs` is enabled on the builder.
#[derive(Debug)]
struct NoCertVerifier;

impl rustls::client::danger::ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Which side of the exchange the proxy sits on.
#[derive(Clone, Debug)]
pub enum Mode {
    /// Explicit forward proxy: clients send absolute-form requests or
    /// `CONNECT` tunnels.
    Forward,
    /// Reverse proxy: every request is sent to `upstream`.
    Reverse { upstream: Uri },
}

type LayerFn = Box<dyn Fn(HttpService) -> HttpService + Send + Sync>;

/// Builder for configuring a [`Proxy`].
pub struct ProxyBuilder {
    ca: Option<CertificateAuthority>,
    layers: Vec<LayerFn>,
    mode: Mode,
    tls_identity: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
    plaintext_hosts: Vec<String>,
    accept_invalid_upstream_certs: bool,
    connect_timeout: Duration,
    handshake_timeout: Option<Duration>,
    shutdown_timeout: Duration,
    leaf_cache_capacity: usize,
    span: tracing::Span,
}

impl ProxyBuilder {
    /// Set the CA from PEM-encoded strings.
    pub fn ca_pem(mut self, cert_pem: &str, key_pem: &str) -> anyhow::Result<Self> {
        self.ca = Some(CertificateAuthority::from_pem(cert_pem, key_pem)?);
        Ok(self)
    }

    /// Set the CA from PEM files on disk.
    pub fn ca_pem_files(
        mut self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> anyhow::Result<Self> {
        self.ca = Some(CertificateAuthority::from_pem_files(cert_path, key_path)?);
        Ok(self)
    }

    /// Set the CA directly.
    pub fn ca(mut self, ca: CertificateAuthority) -> Self {
        self.ca = Some(ca);
        self
    }

    /// Add a tower HTTP layer. Layers added first run first.
    pub fn http_layer<L>(mut self, layer: L) -> Self
    where
        L: tower::Layer<HttpService> + Send + Sync + 'static,
        L::Service: Service<Request<Body>, Response = Response<Body>, Error = BoxError> + Send + 'static,
        <L::Service as Service<Request<Body>>>::Future: Send,
    {
        self.layers
            .push(Box::new(move |inner| tower::util::BoxService::new(layer.layer(inner))));
        self
    }

    /// Run `handler` on every request before it is forwarded.
    pub fn handler(self, handler: impl RequestHandler) -> Self {
        self.http_layer(HandlerLayer::new(handler))
    }

    /// Switch to reverse proxy mode, sending every request to `upstream`
    /// (an `http://` or `https://` URL, optionally with a path prefix).
    pub fn reverse_proxy(mut self, upstream: &str) -> anyhow::Result<Self> {
        let uri: Uri = upstream
            .parse()
            .with_context(|| format!("invalid upstream URL {upstream:?}"))?;
        match uri.scheme() {
            Some(s) if *s == Scheme::HTTP || *s == Scheme::HTTPS => {}
            _ => anyhow::bail!("upstream URL {upstream:?} must use http or https"),
        }
        if uri.authority().is_none() {
            anyhow::bail!("upstream URL {upstream:?} has no host");
        }
        self.mode = Mode::Reverse { upstream: uri };
        Ok(self)
    }

    /// Terminate TLS on the listener with this PEM certificate chain and key.
    /// Reverse proxy mode only.
    pub fn tls_identity_pem(self, cert_pem: &[u8], key_pem: &[u8]) -> anyhow::Result<Self> {
        let chain = CertificateDer::pem_slice_iter(cert_pem)
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("invalid TLS certificate PEM")?;
        if chain.is_empty() {
            anyhow::bail!("TLS certificate PEM contains no certificates");
        }
        let key = PrivateKeyDer::from_pem_slice(key_pem).context("invalid TLS key PEM")?;
        Ok(self.tls_identity(chain, key))
    }

    /// Terminate TLS on the listener with this DER certificate chain and key.
    pub fn tls_identity(
        mut self,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Self {
        self.tls_identity = Some((chain, key));
        self
    }

    /// Load the listener's TLS identity from PEM files on disk.
    pub fn tls_identity_files(
        self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> anyhow::Result<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();
        let cert = std::fs::read(cert_path)
            .with_context(|| format!("reading {}", cert_path.display()))?;
        let key =
            std::fs::read(key_path).with_context(|| format!("reading {}", key_path.display()))?;
        self.tls_identity_pem(&cert, &key)
    }

    /// Glob patterns over `host:port` for `CONNECT` targets that carry plain
    /// HTTP. Matching tunnels are parsed and handled without TLS.
    /// Default: `["*:80"]`.
    pub fn plaintext_hosts<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plaintext_hosts = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Disable upstream TLS certificate verification. Useful for testing with
    /// self-signed upstream servers.
    pub fn danger_accept_invalid_upstream_certs(mut self) -> Self {
        self.accept_invalid_upstream_certs = true;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Abort client TLS handshakes that take longer than `timeout`.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// How long connections still open at shutdown may keep running before
    /// [`Proxy::listen_with_shutdown`] returns anyway.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Maximum number of minted leaf certificates kept in memory.
    pub fn leaf_cache_capacity(mut self, capacity: usize) -> Self {
        self.leaf_cache_capacity = capacity;
        self
    }

    /// Parent span for everything this proxy logs.
    pub fn span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn build(self) -> anyhow::Result<Proxy> {
        install_crypto_provider();
        let span = self.span;

        let mut plaintext = GlobSetBuilder::new();
        for pattern in &self.plaintext_hosts {
            let glob = GlobBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .with_context(|| format!("invalid plaintext host pattern {pattern:?}"))?;
            plaintext.add(glob);
        }
        let plaintext = plaintext.build()?;

        let client_config = upstream_tls_config(self.accept_invalid_upstream_certs)?;
        let upstream = UpstreamClient::new(Arc::new(client_config), self.connect_timeout);

        let acceptor = match (&self.mode, self.tls_identity) {
            (Mode::Reverse { .. }, Some((chain, key))) => {
                let mut config = ServerConfig::builder_with_provider(crypto_provider())
                    .with_safe_default_protocol_versions()?
                    .with_no_client_auth()
                    .with_single_cert(chain, key)?;
                config.alpn_protocols = vec![b"http/1.1".to_vec()];
                Some(TlsAcceptor::from(Arc::new(config)))
            }
            (Mode::Forward, Some(_)) => {
                anyhow::bail!("a listener TLS identity is only used in reverse proxy mode")
            }
            (_, None) => None,
        };

        let leaves = match (&self.mode, self.ca) {
            (Mode::Forward, Some(ca)) => Some(LeafCache::new(ca, self.leaf_cache_capacity)),
            (Mode::Forward, None) => {
                tracing::warn!(
                    parent: &span,
                    "no certificate authority configured; HTTPS tunnels are relayed without signing"
                );
                None
            }
            (Mode::Reverse { .. }, _) => None,
        };

        Ok(Proxy {
            inner: Arc::new(Shared {
                mode: self.mode,
                leaves,
                layers: self.layers,
                upstream,
                acceptor,
                plaintext,
                connect_timeout: self.connect_timeout,
                handshake_timeout: self.handshake_timeout,
                shutdown_timeout: self.shutdown_timeout,
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                span,
            }),
        })
    }
}

fn upstream_tls_config(accept_invalid: bool) -> anyhow::Result<ClientConfig> {
    let builder =
        ClientConfig::builder_with_provider(crypto_provider()).with_safe_default_protocol_versions()?;
    let mut config = if accept_invalid {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertVerifier))
            .with_no_client_auth()
    } else {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

struct Shared {
    mode: Mode,
    leaves: Option<LeafCache>,
    layers: Vec<LayerFn>,
    upstream: UpstreamClient,
    acceptor: Option<TlsAcceptor>,
    plaintext: GlobSet,
    connect_timeout: Duration,
    handshake_timeout: Option<Duration>,
    shutdown_timeout: Duration,
    /// Connection and tunnel tasks, drained on shutdown.
    tasks: TaskTracker,
    /// Tells open connections to finish their current request and close.
    shutdown: CancellationToken,
    span: tracing::Span,
}

/// Source of accepted client connections.
trait Accept: Send + Sync {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Accept for TcpListener {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Errors that only concern the connection being accepted.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// Where the requests on one HTTP connection come from, which decides how
/// their URIs are interpreted.
#[derive(Clone)]
enum Scope {
    /// Client talking to the forward proxy directly.
    Forward,
    /// Inside a `CONNECT` tunnel to `authority`.
    Tunnel { scheme: Scheme, authority: Authority },
    /// Client talking to the reverse proxy.
    Reverse,
}

enum Tunnel {
    Plaintext,
    Intercept,
    Blind(TcpStream),
}

type SharedService = Arc<tokio::sync::Mutex<HttpService>>;

/// A configured signing or verifying proxy.
///
/// Cheaply cloneable via an internal `Arc`.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<Shared>,
}

impl Proxy {
    /// Create a new builder. Forward mode, no CA, no layers.
    pub fn builder() -> ProxyBuilder {
        ProxyBuilder {
            ca: None,
            layers: Vec::new(),
            mode: Mode::Forward,
            tls_identity: None,
            plaintext_hosts: vec!["*:80".to_string()],
            accept_invalid_upstream_certs: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            leaf_cache_capacity: DEFAULT_LEAF_CACHE_CAPACITY,
            span: tracing::info_span!("proxy"),
        }
    }

    pub fn mode(&self) -> &Mode {
        &self.inner.mode
    }

    /// Bind to `addr` and run the accept loop.
    pub async fn listen(&self, addr: impl ToSocketAddrs) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.listen_on(listener).await
    }

    /// Run the accept loop on an already-bound listener.
    pub async fn listen_on(&self, listener: TcpListener) -> anyhow::Result<()> {
        self.listen_with_shutdown(listener, std::future::pending()).await
    }

    /// Run the accept loop until `shutdown` resolves.
    ///
    /// Failed accepts are logged and the loop keeps going. After `shutdown`,
    /// open connections finish their current request and close; this returns
    /// once they are done or the shutdown timeout elapses.
    pub async fn listen_with_shutdown(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> anyhow::Result<()> {
        self.serve(listener, shutdown).await
    }

    async fn serve<A: Accept>(
        &self,
        listener: A,
        shutdown: impl Future<Output = ()>,
    ) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!(parent: &self.inner.span, addr = %local_addr, "listening");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => {
                    let (stream, client_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) if is_connection_error(&e) => {
                            tracing::debug!(parent: &self.inner.span, error = %e, "accept failed");
                            continue;
                        }
                        Err(e) => {
                            tracing::warn!(parent: &self.inner.span, error = %e, "accept failed");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                            continue;
                        }
                    };
                    let proxy = self.clone();
                    let span = tracing::debug_span!(parent: &self.inner.span, "conn", client = %client_addr);
                    self.inner.tasks.spawn(
                        async move {
                            if let Err(e) = proxy.handle_connection(stream, client_addr).await {
                                tracing::debug!(error = %e, "connection closed with error");
                            }
                        }
                        .instrument(span),
                    );
                }
            }
        }

        tracing::info!(
            parent: &self.inner.span,
            open = self.inner.tasks.len(),
            "stopped accepting connections"
        );
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        if tokio::time::timeout(self.inner.shutdown_timeout, self.inner.tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                parent: &self.inner.span,
                open = self.inner.tasks.len(),
                "shutdown timeout elapsed with connections still open"
            );
        }
        Ok(())
    }

    /// Serve one accepted client connection to completion.
    pub async fn handle_connection(
        &self,
        stream: TcpStream,
        client_addr: SocketAddr,
    ) -> anyhow::Result<()> {
        stream.set_nodelay(true).ok();
        tracing::trace!(client = %client_addr, "accepted connection");
        match &self.inner.mode {
            Mode::Forward => self.serve_http(stream, Scope::Forward).await,
            Mode::Reverse { .. } => match &self.inner.acceptor {
                Some(acceptor) => {
                    let tls = self.accept_tls(acceptor.clone(), stream).await?;
                    self.serve_http(tls, Scope::Reverse).await
                }
                None => self.serve_http(stream, Scope::Reverse).await,
            },
        }
    }

    /// Fresh layer stack for one client connection.
    fn http_service(&self) -> HttpService {
        let bottom = match &self.inner.mode {
            Mode::Forward => UpstreamService::new(self.inner.upstream.clone()),
            Mode::Reverse { upstream } => {
                UpstreamService::with_base(self.inner.upstream.clone(), upstream.clone())
            }
        };
        let mut service = tower::util::BoxService::new(bottom);
        for layer in self.inner.layers.iter().rev() {
            service = layer(service);
        }
        service
    }

    async fn serve_http<I>(&self, io: I, scope: Scope) -> anyhow::Result<()>
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let service: SharedService = Arc::new(tokio::sync::Mutex::new(self.http_service()));
        let proxy = self.clone();
        let hyper_service = hyper::service::service_fn(move |req: Request<Incoming>| {
            let proxy = proxy.clone();
            let service = service.clone();
            let scope = scope.clone();
            async move {
                let resp = proxy
                    .dispatch(req.map(incoming_to_body), &scope, &service)
                    .await;
                Ok::<_, Infallible>(resp)
            }
        });

        let conn = hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(io), hyper_service)
            .with_upgrades();
        tokio::pin!(conn);
        tokio::select! {
            res = conn.as_mut() => res?,
            _ = self.inner.shutdown.cancelled() => {
                conn.as_mut().graceful_shutdown();
                conn.await?;
            }
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        req: Request<Body>,
        scope: &Scope,
        service: &SharedService,
    ) -> Response<Body> {
        if req.method() == Method::CONNECT {
            return match scope {
                Scope::Forward => self.connect(req).await,
                _ => text_response(StatusCode::BAD_REQUEST, "CONNECT is not supported here\n"),
            };
        }

        let req = match scope {
            Scope::Forward if req.uri().authority().is_none() => {
                return text_response(
                    StatusCode::BAD_REQUEST,
                    "proxy requests need an absolute URI\n",
                );
            }
            Scope::Tunnel { scheme, authority } => match absolutize(req, scheme, authority) {
                Ok(req) => req,
                Err(e) => {
                    tracing::debug!(error = %e, "cannot resolve tunneled request URI");
                    return text_response(StatusCode::BAD_REQUEST, "invalid request URI\n");
                }
            },
            _ => req,
        };

        let resp = call_service(service, req).await;
        match (scope, resp) {
            // A tunnel is pinned to one upstream; close it once that fails.
            (Scope::Tunnel { .. }, Err(mut resp)) => {
                resp.headers_mut().insert(CONNECTION, HeaderValue::from_static("close"));
                resp
            }
            (_, Ok(resp) | Err(resp)) => resp,
        }
    }

    async fn connect(&self, req: Request<Body>) -> Response<Body> {
        let Some(authority) = req.uri().authority().cloned() else {
            return text_response(StatusCode::BAD_REQUEST, "CONNECT needs host:port\n");
        };
        let host = authority.host();
        let port = authority.port_u16().unwrap_or(443);

        let tunnel = if self.inner.plaintext.is_match(format!("{host}:{port}")) {
            Tunnel::Plaintext
        } else if self.inner.leaves.is_some() {
            Tunnel::Intercept
        } else {
            let dial_host = host.trim_start_matches('[').trim_end_matches(']');
            let connect = TcpStream::connect((dial_host, port));
            match tokio::time::timeout(self.inner.connect_timeout, connect).await {
                Ok(Ok(upstream)) => Tunnel::Blind(upstream),
                Ok(Err(e)) => {
                    tracing::warn!(authority = %authority, error = %e, "tunnel connect failed");
                    return text_response(StatusCode::BAD_GATEWAY, "upstream connect failed\n");
                }
                Err(_) => {
                    tracing::warn!(authority = %authority, "tunnel connect timed out");
                    return text_response(StatusCode::BAD_GATEWAY, "upstream connect failed\n");
                }
            }
        };

        self.spawn_tunnel(req, tunnel, authority);
        Response::new(empty_body())
    }

    fn spawn_tunnel(&self, req: Request<Body>, tunnel: Tunnel, authority: Authority) {
        let proxy = self.clone();
        let span = tracing::debug_span!("tunnel", authority = %authority);
        self.inner.tasks.spawn(
            async move {
                let upgraded = match hyper::upgrade::on(req).await {
                    Ok(upgraded) => TokioIo::new(upgraded),
                    Err(e) => {
                        tracing::debug!(error = %e, "CONNECT upgrade failed");
                        return;
                    }
                };
                if let Err(e) = proxy.run_tunnel(upgraded, tunnel, authority).await {
                    tracing::debug!(error = %e, "tunnel closed with error");
                }
            }
            .instrument(span),
        );
    }

    async fn run_tunnel(
        &self,
        mut io: TokioIo<hyper::upgrade::Upgraded>,
        tunnel: Tunnel,
        authority: Authority,
    ) -> anyhow::Result<()> {
        match tunnel {
            Tunnel::Plaintext => {
                let scope = Scope::Tunnel {
                    scheme: Scheme::HTTP,
                    authority,
                };
                self.serve_http(io, scope).await
            }
            Tunnel::Intercept => {
                let leaves = self
                    .inner
                    .leaves
                    .as_ref()
                    .context("no certificate authority configured")?;
                let host = authority.host().trim_start_matches('[').trim_end_matches(']');
                let leaf = leaves.leaf_for(host).await?;
                let tls = self
                    .accept_tls(TlsAcceptor::from(leaf.server_config.clone()), io)
                    .await?;
                let scope = Scope::Tunnel {
                    scheme: Scheme::HTTPS,
                    authority,
                };
                self.serve_http(tls, scope).await
            }
            Tunnel::Blind(mut upstream) => {
                let (up, down) = tokio::io::copy_bidirectional(&mut io, &mut upstream).await?;
                tracing::debug!(bytes_up = up, bytes_down = down, "tunnel closed");
                Ok(())
            }
        }
    }

    async fn accept_tls<IO>(&self, acceptor: TlsAcceptor, io: IO) -> anyhow::Result<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let accept = acceptor.accept(io);
        let stream = match self.inner.handshake_timeout {
            Some(limit) => tokio::time::timeout(limit, accept)
                .await
                .context("TLS handshake timed out")??,
            None => accept.await?,
        };
        Ok(stream)
    }
}

/// Turn an origin-form request received inside a tunnel into an absolute one.
fn absolutize(
    mut req: Request<Body>,
    scheme: &Scheme,
    authority: &Authority,
) -> std::result::Result<Request<Body>, ::http::Error> {
    if req.uri().authority().is_some() {
        return Ok(req);
    }
    let path = req
        .uri()
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    *req.uri_mut() = Uri::builder()
        .scheme(scheme.clone())
        .authority(authority.clone())
        .path_and_query(path)
        .build()?;
    Ok(req)
}

/// Send `req` through the connection's layer stack. Upstream failures come
/// back as `Err` holding the `502` to send.
async fn call_service(
    service: &SharedService,
    req: Request<Body>,
) -> std::result::Result<Response<Body>, Response<Body>> {
    let method = req.method().clone();
    let uri = req.uri().clone();

    let fut = {
        let mut service = service.lock().await;
        match ServiceExt::<Request<Body>>::ready(&mut *service).await {
            Ok(ready) => ready.call(req),
            Err(e) => {
                tracing::warn!(%method, %uri, error = %e, "service not ready");
                return Err(text_response(StatusCode::BAD_GATEWAY, "upstream request failed\n"));
            }
        }
    };

    match fut.await {
        Ok(resp) => {
            tracing::debug!(%method, %uri, status = resp.status().as_u16(), "proxied request");
            Ok(resp)
        }
        Err(e) => {
            tracing::warn!(%method, %uri, error = %e, "upstream request failed");
            Err(text_response(StatusCode::BAD_GATEWAY, "upstream request failed\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(empty_body()).unwrap()
    }

    #[test]
    fn absolutize_fills_scheme_and_authority() {
        let authority: Authority = "example.com:8443".parse().unwrap();
        let req = absolutize(request("/a/b?c=d"), &Scheme::HTTPS, &authority).unwrap();
        assert_eq!(req.uri().to_string(), "https://example.com:8443/a/b?c=d");
    }

    #[test]
    fn absolutize_keeps_absolute_uri() {
        let authority: Authority = "example.com:80".parse().unwrap();
        let req = absolutize(request("http://other.test/x"), &Scheme::HTTP, &authority).unwrap();
        assert_eq!(req.uri().to_string(), "http://other.test/x");
    }

    #[test]
    fn reverse_proxy_requires_http_url() {
        assert!(Proxy::builder().reverse_proxy("ftp://origin").is_err());
        assert!(Proxy::builder().reverse_proxy("/just/a/path").is_err());
        let proxy = Proxy::builder()
            .reverse_proxy("http://127.0.0.1:9000/api")
            .unwrap()
            .build()
            .unwrap();
        assert!(matches!(proxy.mode(), Mode::Reverse { upstream } if upstream.path() == "/api"));
    }

    #[test]
    fn tls_identity_is_rejected_in_forward_mode() {
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        let builder = Proxy::builder()
            .tls_identity_pem(cert.pem().as_bytes(), key.serialize_pem().as_bytes())
            .unwrap();
        assert!(builder.build().is_err());
    }

    #[test]
    fn bad_plaintext_pattern_fails_build() {
        assert!(Proxy::builder().plaintext_hosts(["[unclosed"]).build().is_err());
    }

    /// Listener that fails the first accepts with queued errors.
    struct FailingFirst {
        inner: TcpListener,
        errors: std::sync::Mutex<Vec<io::Error>>,
    }

    impl Accept for FailingFirst {
        fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
            let injected = self.errors.lock().unwrap().pop();
            async move {
                match injected {
                    Some(e) => Err(e),
                    None => self.inner.accept().await,
                }
            }
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            self.inner.local_addr()
        }
    }

    #[tokio::test]
    async fn accept_errors_do_not_stop_the_listener() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let inner = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = inner.local_addr().unwrap();
        let listener = FailingFirst {
            inner,
            errors: std::sync::Mutex::new(vec![
                io::Error::from(io::ErrorKind::ConnectionAborted),
                io::Error::from_raw_os_error(24),
                io::Error::other("too many open files in system"),
            ]),
        };
        let proxy = Proxy::builder().build().unwrap();
        let server = {
            let proxy = proxy.clone();
            tokio::spawn(async move { proxy.serve(listener, std::future::pending()).await })
        };

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /relative HTTP/1.1\r\nHost: example.com\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 400"));
        assert!(!server.is_finished());
        server.abort();
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_requests() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let answered = Arc::new(AtomicBool::new(false));
        {
            let answered = answered.clone();
            tokio::spawn(async move {
                let (mut conn, _) = upstream.accept().await.unwrap();
                let mut buf = [0u8; 1024];
                let _ = conn.read(&mut buf).await.unwrap();
                tokio::time::sleep(Duration::from_millis(200)).await;
                conn.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                    .await
                    .unwrap();
                answered.store(true, Ordering::SeqCst);
            });
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let proxy = Proxy::builder().build().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            proxy
                .listen_with_shutdown(listener, async {
                    rx.await.ok();
                })
                .await
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(
                format!("GET http://{upstream_addr}/slow HTTP/1.1\r\nHost: {upstream_addr}\r\n\r\n")
                    .as_bytes(),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
        assert!(answered.load(Ordering::SeqCst));

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.ends_with("ok"), "{response}");
    }

    #[test]
    fn empty_tls_identity_is_rejected() {
        assert!(Proxy::builder().tls_identity_pem(b"", b"").is_err());
    }
}
