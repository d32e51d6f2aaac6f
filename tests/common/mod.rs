#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum_server::tls_rustls::RustlsConfig;
use bytes::Bytes;
use hmacproxy::credential::Credential;
use hmacproxy::signature::SignedClaim;
use hmacproxy::{CertificateAuthority, Proxy, ProxyBuilder};
use http::{HeaderMap, Method, StatusCode, Uri};
use rcgen::{CertificateParams, KeyPair};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const KEY_ID: &str = "AKIDEXAMPLE";
pub const SECRET: &str = "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY";
pub const SERVICE: &str = "s3";
pub const REGION: &str = "us-east-1";

pub fn install_crypto_provider() {
    hmacproxy::install_crypto_provider();
}

pub fn credential() -> Credential {
    Credential::new(KEY_ID, SECRET, SERVICE, REGION)
}

/// One request as seen by a test upstream.
#[derive(Clone, Debug)]
pub struct Recorded {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Recorded {
    /// Recompute the signature the way an origin holding the secret would.
    pub fn verify_with(&self, credential: &Credential) -> Result<(), hmacproxy::error::VerifyError> {
        let mut parts = http::Request::builder()
            .method(self.method.clone())
            .uri(self.uri.clone())
            .body(())
            .unwrap()
            .into_parts()
            .0;
        parts.headers = self.headers.clone();
        SignedClaim::from_headers(&parts.headers)?.verify(&parts, &self.body, credential)
    }
}

/// Shared log of the requests an upstream received.
#[derive(Clone, Default)]
pub struct Recorder {
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl Recorder {
    pub fn hits(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last(&self) -> Recorded {
        self.requests
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("upstream received no requests")
    }
}

/// Path on every test upstream that answers `404` with [`MISSING_BODY`] and
/// an `x-upstream: kept` header.
pub const MISSING_PATH: &str = "/missing";
pub const MISSING_BODY: &str = "no such object\n";

async fn record(State(recorder): State<Recorder>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    let missing = parts.uri.path() == MISSING_PATH;
    recorder.requests.lock().unwrap().push(Recorded {
        method: parts.method,
        uri: parts.uri,
        headers: parts.headers,
        body,
    });
    if missing {
        (
            StatusCode::NOT_FOUND,
            [("x-upstream", "kept"), ("cache-control", "no-store")],
            MISSING_BODY,
        )
            .into_response()
    } else {
        "upstream ok".into_response()
    }
}

fn recording_app(recorder: Recorder) -> Router {
    Router::new().fallback(record).with_state(recorder)
}

/// Start a plain HTTP upstream that records every request.
pub async fn start_http_upstream() -> (SocketAddr, Recorder) {
    let recorder = Recorder::default();
    let app = recording_app(recorder.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, recorder)
}

/// Start an HTTPS upstream with a self-signed cert for `localhost` that
/// records every request.
pub async fn start_https_upstream() -> (SocketAddr, Recorder) {
    install_crypto_provider();
    let key_pair = KeyPair::generate().unwrap();
    let params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    let cert = params.self_signed(&key_pair).unwrap();
    let config = RustlsConfig::from_der(vec![cert.der().to_vec()], key_pair.serialize_der())
        .await
        .unwrap();

    let recorder = Recorder::default();
    let app = recording_app(recorder.clone());
    let handle = axum_server::Handle::new();
    let listener_handle = handle.clone();
    tokio::spawn(async move {
        axum_server::bind_rustls("127.0.0.1:0".parse().unwrap(), config)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .unwrap();
    });

    (listener_handle.listening().await.unwrap(), recorder)
}

/// Build the proxy and spawn its accept loop on an ephemeral port.
pub async fn start_proxy(builder: ProxyBuilder) -> SocketAddr {
    install_crypto_provider();
    let proxy = builder.build().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        proxy.listen_on(listener).await.unwrap();
    });
    addr
}

/// A port with nothing listening on it.
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Freshly generated CA, as both the proxy-side authority and its PEM.
pub fn test_ca() -> (CertificateAuthority, String) {
    let ca = CertificateAuthority::generate("hmacproxy test CA").unwrap();
    let pem = ca.cert_pem();
    (ca, pem)
}

/// Client that sends everything through `proxy_addr`.
pub fn proxied_client(proxy_addr: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(format!("http://{proxy_addr}")).unwrap())
        .build()
        .unwrap()
}

/// Client that goes through `proxy_addr` and trusts only `ca_pem`.
pub fn proxied_client_trusting(proxy_addr: SocketAddr, ca_pem: &str) -> reqwest::Client {
    let ca_cert = reqwest::Certificate::from_pem(ca_pem.as_bytes()).unwrap();
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(format!("http://{proxy_addr}")).unwrap())
        .tls_built_in_root_certs(false)
        .add_root_certificate(ca_cert)
        .build()
        .unwrap()
}

pub fn direct_client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

/// Open a CONNECT tunnel to `target` and return the stream once the proxy
/// has answered, along with the status line.
pub async fn connect_tunnel(proxy_addr: SocketAddr, target: &str) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
    stream
        .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let head = read_head(&mut stream).await;
    let status = head.lines().next().unwrap_or_default().to_string();
    (stream, status)
}

/// Read bytes up to and including the blank line ending a response head.
pub async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "connection closed before response head");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

/// Send a raw request and read the full response until the peer closes.
pub async fn raw_exchange(stream: &mut TcpStream, request: &str) -> String {
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    String::from_utf8_lossy(&buf).into_owned()
}
