mod common;

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use common::*;
use hmacproxy::credential::{Credential, KeyMapStore};
use hmacproxy::middleware::{REJECTION_BODY, Signer, Verifier};
use hmacproxy::{CertificateAuthority, Proxy, signature};
use http::HeaderMap;
use http::header::AUTHORIZATION;

fn verifying_proxy(upstream: SocketAddr) -> hmacproxy::ProxyBuilder {
    Proxy::builder()
        .reverse_proxy(&format!("http://{upstream}"))
        .unwrap()
        .handler(Verifier::new(hmacproxy::credential::SingleKeyStore::new(credential())))
}

/// Headers a client holding `credential` would send for a request to
/// `proxy_addr`.
fn signed_headers(
    proxy_addr: SocketAddr,
    method: &str,
    path: &str,
    body: &[u8],
    credential: &Credential,
    at: DateTime<Utc>,
) -> HeaderMap {
    let mut parts = http::Request::builder()
        .method(method)
        .uri(path)
        .header("host", proxy_addr.to_string())
        .body(())
        .unwrap()
        .into_parts()
        .0;
    signature::sign(&mut parts, body, credential, at).unwrap();
    parts.headers
}

#[tokio::test]
async fn valid_signature_is_forwarded_without_auth_headers() {
    let (upstream_addr, recorder) = start_http_upstream().await;
    let proxy_addr = start_proxy(verifying_proxy(upstream_addr)).await;

    let headers = signed_headers(proxy_addr, "POST", "/items?id=7", b"{}", &credential(), Utc::now());
    let resp = direct_client()
        .post(format!("http://{proxy_addr}/items?id=7"))
        .headers(headers)
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "upstream ok");

    assert_eq!(recorder.hits(), 1);
    let seen = recorder.last();
    assert_eq!(seen.uri, "/items?id=7");
    assert_eq!(&seen.body[..], b"{}");
    assert!(!seen.headers.contains_key(AUTHORIZATION));
    assert!(!seen.headers.contains_key("x-amz-date"));
    assert!(!seen.headers.contains_key("x-amz-content-sha256"));
    assert_eq!(seen.headers.get("host").unwrap(), &upstream_addr.to_string());
}

#[tokio::test]
async fn upstream_status_headers_and_body_are_relayed() {
    let (upstream_addr, recorder) = start_http_upstream().await;
    let proxy_addr = start_proxy(verifying_proxy(upstream_addr)).await;

    let headers = signed_headers(proxy_addr, "GET", MISSING_PATH, b"", &credential(), Utc::now());
    let resp = direct_client()
        .get(format!("http://{proxy_addr}{MISSING_PATH}"))
        .headers(headers)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    assert_eq!(resp.headers().get("x-upstream").unwrap(), "kept");
    assert_eq!(resp.headers().get("cache-control").unwrap(), "no-store");
    assert_eq!(resp.text().await.unwrap(), MISSING_BODY);
    assert_eq!(recorder.hits(), 1);
}

#[tokio::test]
async fn wrong_secret_is_rejected_before_upstream() {
    let (upstream_addr, recorder) = start_http_upstream().await;
    let proxy_addr = start_proxy(verifying_proxy(upstream_addr)).await;

    let forged = Credential::new(KEY_ID, "guessed-secret", SERVICE, REGION);
    let headers = signed_headers(proxy_addr, "GET", "/", b"", &forged, Utc::now());
    let resp = direct_client()
        .get(format!("http://{proxy_addr}/"))
        .headers(headers)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    assert_eq!(resp.text().await.unwrap(), REJECTION_BODY);
    assert_eq!(recorder.hits(), 0);
}

#[tokio::test]
async fn stale_signature_is_rejected() {
    let (upstream_addr, recorder) = start_http_upstream().await;
    let proxy_addr = start_proxy(verifying_proxy(upstream_addr)).await;

    let twenty_minutes_ago = Utc::now() - chrono::Duration::minutes(20);
    let headers = signed_headers(proxy_addr, "GET", "/", b"", &credential(), twenty_minutes_ago);
    let resp = direct_client()
        .get(format!("http://{proxy_addr}/"))
        .headers(headers)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    assert_eq!(recorder.hits(), 0);
}

#[tokio::test]
async fn rejections_are_indistinguishable() {
    let (upstream_addr, recorder) = start_http_upstream().await;
    let proxy_addr = start_proxy(verifying_proxy(upstream_addr)).await;
    let client = direct_client();

    let unknown = Credential::new("AKIDUNKNOWN", SECRET, SERVICE, REGION);
    let unknown_resp = client
        .get(format!("http://{proxy_addr}/"))
        .headers(signed_headers(proxy_addr, "GET", "/", b"", &unknown, Utc::now()))
        .send()
        .await
        .unwrap();

    let forged = Credential::new(KEY_ID, "guessed-secret", SERVICE, REGION);
    let mismatch_resp = client
        .get(format!("http://{proxy_addr}/"))
        .headers(signed_headers(proxy_addr, "GET", "/", b"", &forged, Utc::now()))
        .send()
        .await
        .unwrap();

    let unsigned_resp = client
        .get(format!("http://{proxy_addr}/"))
        .send()
        .await
        .unwrap();

    assert_eq!(unknown_resp.status(), 403);
    assert_eq!(mismatch_resp.status(), 403);
    assert_eq!(unsigned_resp.status(), 403);
    let bodies = [
        unknown_resp.text().await.unwrap(),
        mismatch_resp.text().await.unwrap(),
        unsigned_resp.text().await.unwrap(),
    ];
    assert!(bodies.iter().all(|b| b == REJECTION_BODY));
    assert_eq!(recorder.hits(), 0);
}

#[tokio::test]
async fn tampered_body_is_rejected() {
    let (upstream_addr, recorder) = start_http_upstream().await;
    let proxy_addr = start_proxy(verifying_proxy(upstream_addr)).await;

    let headers = signed_headers(proxy_addr, "PUT", "/doc", b"original", &credential(), Utc::now());
    let resp = direct_client()
        .put(format!("http://{proxy_addr}/doc"))
        .headers(headers)
        .body("modified")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    assert_eq!(recorder.hits(), 0);
}

#[tokio::test]
async fn signing_proxy_chains_into_verifying_proxy() {
    let (upstream_addr, recorder) = start_http_upstream().await;
    let verifier_addr = start_proxy(verifying_proxy(upstream_addr)).await;
    let signer_addr = start_proxy(Proxy::builder().handler(Signer::new(credential()))).await;

    let resp = proxied_client(signer_addr)
        .post(format!("http://{verifier_addr}/chain?x=1"))
        .body("end to end")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let seen = recorder.last();
    assert_eq!(seen.uri, "/chain?x=1");
    assert_eq!(&seen.body[..], b"end to end");
    assert!(!seen.headers.contains_key(AUTHORIZATION));
}

#[tokio::test]
async fn key_map_store_accepts_each_key() {
    let (upstream_addr, recorder) = start_http_upstream().await;
    let alice = Credential::new("alice", "alice-secret", SERVICE, REGION);
    let bob = Credential::new("bob", "bob-secret", SERVICE, REGION);
    let store = KeyMapStore::new([
        Credential::new("alice", "alice-secret", SERVICE, REGION),
        Credential::new("bob", "bob-secret", SERVICE, REGION),
    ]);
    let proxy_addr = start_proxy(
        Proxy::builder()
            .reverse_proxy(&format!("http://{upstream_addr}"))
            .unwrap()
            .handler(Verifier::new(store)),
    )
    .await;

    for cred in [&alice, &bob] {
        let resp = direct_client()
            .get(format!("http://{proxy_addr}/"))
            .headers(signed_headers(proxy_addr, "GET", "/", b"", cred, Utc::now()))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }
    assert_eq!(recorder.hits(), 2);
}

#[tokio::test]
async fn keep_auth_headers_forwards_signature() {
    let (upstream_addr, recorder) = start_http_upstream().await;
    let proxy_addr = start_proxy(
        Proxy::builder()
            .reverse_proxy(&format!("http://{upstream_addr}"))
            .unwrap()
            .handler(
                Verifier::new(hmacproxy::credential::SingleKeyStore::new(credential()))
                    .keep_auth_headers(),
            ),
    )
    .await;

    let resp = direct_client()
        .get(format!("http://{proxy_addr}/"))
        .headers(signed_headers(proxy_addr, "GET", "/", b"", &credential(), Utc::now()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(recorder.last().headers.contains_key(AUTHORIZATION));
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway() {
    let upstream: SocketAddr = format!("127.0.0.1:{}", closed_port()).parse().unwrap();
    let proxy_addr = start_proxy(verifying_proxy(upstream)).await;

    let resp = direct_client()
        .get(format!("http://{proxy_addr}/"))
        .headers(signed_headers(proxy_addr, "GET", "/", b"", &credential(), Utc::now()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
}

#[tokio::test]
async fn terminates_tls_with_configured_identity() {
    install_crypto_provider();
    let (upstream_addr, recorder) = start_http_upstream().await;

    let ca = CertificateAuthority::generate("verifier test CA").unwrap();
    let (cert_der, key_der) = ca.generate_cert("localhost").unwrap();
    let proxy_addr =
        start_proxy(verifying_proxy(upstream_addr).tls_identity(vec![cert_der], key_der)).await;

    let client = reqwest::Client::builder()
        .no_proxy()
        .tls_built_in_root_certs(false)
        .add_root_certificate(reqwest::Certificate::from_pem(ca.cert_pem().as_bytes()).unwrap())
        .build()
        .unwrap();
    let host = format!("localhost:{}", proxy_addr.port());
    let mut parts = http::Request::builder()
        .uri("/secure")
        .header("host", &host)
        .body(())
        .unwrap()
        .into_parts()
        .0;
    signature::sign(&mut parts, b"", &credential(), Utc::now()).unwrap();

    let resp = client
        .get(format!("https://{host}/secure"))
        .headers(parts.headers)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(recorder.last().uri, "/secure");
}
