//! HMAC request signatures in the AWS Signature Version 4 layout.
//!
//! Signer and verifier share every function in this module, which is what
//! keeps the two sides agreeing byte-for-byte on what was signed:
//!
//! ```text
//! Authorization: AWS4-HMAC-SHA256 Credential=<id>/<date>/<region>/<service>/aws4_request,
//!                SignedHeaders=<h1;h2;...>, Signature=<hex>
//! X-Amz-Date: <YYYYMMDDTHHMMSSZ>
//! X-Amz-Content-Sha256: <hex sha256 of body>
//! ```

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use hmac::{Hmac, Mac};
use http::header::{AUTHORIZATION, HOST, HeaderMap, HeaderName, HeaderValue};
use http::request::Parts;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::credential::Credential;
use crate::error::{SignError, VerifyError};
use crate::http::is_hop_by_hop;

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";
pub const SCOPE_TERMINATOR: &str = "aws4_request";
pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";
pub const DATE_FORMAT: &str = "%Y%m%d";

pub const X_AMZ_DATE: HeaderName = HeaderName::from_static("x-amz-date");
pub const X_AMZ_CONTENT_SHA256: HeaderName = HeaderName::from_static("x-amz-content-sha256");

/// Headers written by the signer. Stripped by the verifier after success.
pub const AUTH_HEADERS: [HeaderName; 3] = [AUTHORIZATION, X_AMZ_DATE, X_AMZ_CONTENT_SHA256];

/// Parsed form of the `Authorization` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub credential_id: String,
    pub date: String,
    pub region: String,
    pub service: String,
    pub signed_headers: Vec<String>,
    pub signature: String,
}

impl Authorization {
    pub fn parse(value: &str) -> Result<Self, VerifyError> {
        let rest = value
            .strip_prefix(ALGORITHM)
            .and_then(|r| r.strip_prefix(' '))
            .ok_or_else(|| VerifyError::malformed("unsupported algorithm"))?;

        let mut credential = None;
        let mut signed_headers = None;
        let mut signature = None;
        for field in rest.split(',') {
            let (key, val) = field
                .trim()
                .split_once('=')
                .ok_or_else(|| VerifyError::malformed("authorization field without '='"))?;
            let slot = match key {
                "Credential" => &mut credential,
                "SignedHeaders" => &mut signed_headers,
                "Signature" => &mut signature,
                _ => return Err(VerifyError::malformed(format!("unexpected field {key}"))),
            };
            if slot.replace(val).is_some() {
                return Err(VerifyError::malformed(format!("duplicate field {key}")));
            }
        }

        let credential = credential.ok_or_else(|| VerifyError::malformed("missing Credential"))?;
        let signed_headers =
            signed_headers.ok_or_else(|| VerifyError::malformed("missing SignedHeaders"))?;
        let signature = signature.ok_or_else(|| VerifyError::malformed("missing Signature"))?;

        let scope: Vec<&str> = credential.split('/').collect();
        let [id, date, region, service, terminator] = scope[..] else {
            return Err(VerifyError::malformed("credential scope has wrong arity"));
        };
        if id.is_empty() || terminator != SCOPE_TERMINATOR {
            return Err(VerifyError::malformed("invalid credential scope"));
        }

        let signed_headers: Vec<String> = signed_headers.split(';').map(str::to_string).collect();
        if signed_headers.iter().any(|h| h.is_empty()) {
            return Err(VerifyError::malformed("empty signed header name"));
        }
        if signed_headers.windows(2).any(|w| w[0] >= w[1]) {
            return Err(VerifyError::malformed("signed headers not sorted"));
        }

        Ok(Self {
            credential_id: id.to_string(),
            date: date.to_string(),
            region: region.to_string(),
            service: service.to_string(),
            signed_headers,
            signature: signature.to_string(),
        })
    }

    /// `<date>/<region>/<service>/aws4_request`
    pub fn scope(&self) -> String {
        credential_scope(&self.date, &self.region, &self.service)
    }
}

impl fmt::Display for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{ALGORITHM} Credential={}/{}, SignedHeaders={}, Signature={}",
            self.credential_id,
            self.scope(),
            self.signed_headers.join(";"),
            self.signature
        )
    }
}

pub fn credential_scope(date: &str, region: &str, service: &str) -> String {
    format!("{date}/{region}/{service}/{SCOPE_TERMINATOR}")
}

pub fn format_timestamp(time: DateTime<Utc>) -> String {
    time.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, VerifyError> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .map(|t| t.and_utc())
        .map_err(|_| VerifyError::malformed("invalid timestamp"))
}

/// Lowercase hex SHA-256 of the payload.
pub fn payload_hash(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

fn hmac(key: &[u8], msg: &[u8]) -> [u8; 32] {
    // HMAC accepts keys of any length.
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac key of any size");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// Derive the per-day, per-scope signing key from a credential secret.
pub fn derive_signing_key(secret: &[u8], date: &str, region: &str, service: &str) -> [u8; 32] {
    let mut seed = Vec::with_capacity(4 + secret.len());
    seed.extend_from_slice(b"AWS4");
    seed.extend_from_slice(secret);
    let k_date = hmac(&seed, date.as_bytes());
    let k_region = hmac(&k_date, region.as_bytes());
    let k_service = hmac(&k_region, service.as_bytes());
    hmac(&k_service, SCOPE_TERMINATOR.as_bytes())
}

fn encode_component(raw: &str) -> String {
    let decoded = urlencoding::decode(raw).unwrap_or(std::borrow::Cow::Borrowed(raw));
    urlencoding::encode(&decoded).into_owned()
}

fn canonical_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    path.split('/')
        .map(encode_component)
        .collect::<Vec<_>>()
        .join("/")
}

fn canonical_query(query: Option<&str>) -> String {
    let Some(query) = query else {
        return String::new();
    };
    let mut pairs: Vec<(String, String)> = query
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|p| {
            let (k, v) = p.split_once('=').unwrap_or((p, ""));
            (encode_component(k), encode_component(v))
        })
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn canonical_header_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get_all(name)
        .iter()
        .map(|v| {
            String::from_utf8_lossy(v.as_bytes())
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Build the canonical request over the given (sorted, lowercase) header names.
pub fn canonical_request(parts: &Parts, signed_headers: &[String], payload_hash: &str) -> String {
    let mut out = String::new();
    out.push_str(parts.method.as_str());
    out.push('\n');
    out.push_str(&canonical_path(parts.uri.path()));
    out.push('\n');
    out.push_str(&canonical_query(parts.uri.query()));
    out.push('\n');
    for name in signed_headers {
        out.push_str(name);
        out.push(':');
        out.push_str(&canonical_header_value(&parts.headers, name));
        out.push('\n');
    }
    out.push('\n');
    out.push_str(&signed_headers.join(";"));
    out.push('\n');
    out.push_str(payload_hash);
    out
}

pub fn string_to_sign(timestamp: &str, scope: &str, canonical_request: &str) -> String {
    format!(
        "{ALGORITHM}\n{timestamp}\n{scope}\n{}",
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    )
}

/// Raw signature bytes for a request, given everything that goes into it.
pub fn compute_signature(
    parts: &Parts,
    signed_headers: &[String],
    payload_hash: &str,
    credential: &Credential,
    time: DateTime<Utc>,
) -> [u8; 32] {
    let date = time.format(DATE_FORMAT).to_string();
    let scope = credential_scope(&date, credential.region(), credential.service());
    let canonical = canonical_request(parts, signed_headers, payload_hash);
    let to_sign = string_to_sign(&format_timestamp(time), &scope, &canonical);
    let key = derive_signing_key(
        credential.secret(),
        &date,
        credential.region(),
        credential.service(),
    );
    hmac(&key, to_sign.as_bytes())
}

/// Header names the signer covers: everything except hop-by-hop headers and
/// `Authorization`, lowercase and sorted.
pub fn signable_headers(headers: &HeaderMap) -> Vec<String> {
    let mut names: Vec<String> = headers
        .keys()
        .filter(|name| **name != AUTHORIZATION && !is_hop_by_hop(name, headers))
        .map(|name| name.as_str().to_string())
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Sign a request in place: sets `Host` if missing, replaces any previous
/// auth headers, and adds `X-Amz-Date`, `X-Amz-Content-Sha256` and
/// `Authorization`. Nothing else about the request changes.
pub fn sign(
    parts: &mut Parts,
    body: &[u8],
    credential: &Credential,
    time: DateTime<Utc>,
) -> Result<(), SignError> {
    if !parts.headers.contains_key(HOST) {
        let authority = parts.uri.authority().ok_or(SignError::MissingHost)?;
        let host = HeaderValue::from_str(authority.as_str())?;
        parts.headers.insert(HOST, host);
    }
    for name in AUTH_HEADERS {
        parts.headers.remove(name);
    }

    let timestamp = format_timestamp(time);
    let body_hash = payload_hash(body);
    parts
        .headers
        .insert(X_AMZ_DATE, HeaderValue::from_str(&timestamp)?);
    parts
        .headers
        .insert(X_AMZ_CONTENT_SHA256, HeaderValue::from_str(&body_hash)?);

    let signed_headers = signable_headers(&parts.headers);
    let signature = compute_signature(parts, &signed_headers, &body_hash, credential, time);

    let authorization = Authorization {
        credential_id: credential.id().to_string(),
        date: time.format(DATE_FORMAT).to_string(),
        region: credential.region().to_string(),
        service: credential.service().to_string(),
        signed_headers,
        signature: hex::encode(signature),
    };
    parts
        .headers
        .insert(AUTHORIZATION, HeaderValue::from_str(&authorization.to_string())?);
    Ok(())
}

/// Claimed identity and signature extracted from a request, before the
/// credential is known.
#[derive(Debug, Clone)]
pub struct SignedClaim {
    pub authorization: Authorization,
    pub timestamp: DateTime<Utc>,
}

impl SignedClaim {
    /// Pull the `Authorization` and `X-Amz-Date` headers out of a request.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, VerifyError> {
        let authorization = headers
            .get(AUTHORIZATION)
            .ok_or_else(|| VerifyError::malformed("missing authorization header"))?
            .to_str()
            .map_err(|_| VerifyError::malformed("non-ascii authorization header"))?;
        let authorization = Authorization::parse(authorization)?;

        let timestamp = headers
            .get(X_AMZ_DATE)
            .ok_or_else(|| VerifyError::malformed("missing timestamp header"))?
            .to_str()
            .map_err(|_| VerifyError::malformed("non-ascii timestamp header"))?;
        let timestamp = parse_timestamp(timestamp)?;

        Ok(Self {
            authorization,
            timestamp,
        })
    }

    /// Check the claim against the looked-up credential and the received
    /// body. Freshness is checked separately by the caller, who owns the clock.
    pub fn verify(
        &self,
        parts: &Parts,
        body: &[u8],
        credential: &Credential,
    ) -> Result<(), VerifyError> {
        let auth = &self.authorization;

        for required in ["host", "x-amz-date"] {
            if !auth.signed_headers.iter().any(|h| h == required) {
                return Err(VerifyError::malformed(format!("{required} is not signed")));
            }
        }
        for name in &auth.signed_headers {
            if !parts.headers.contains_key(name.as_str()) {
                return Err(VerifyError::malformed(format!("signed header {name} is absent")));
            }
        }

        if auth.date != self.timestamp.format(DATE_FORMAT).to_string()
            || auth.region != credential.region()
            || auth.service != credential.service()
        {
            return Err(VerifyError::SignatureMismatch);
        }

        let provided =
            hex::decode(&auth.signature).map_err(|_| VerifyError::malformed("signature is not hex"))?;
        let expected = compute_signature(
            parts,
            &auth.signed_headers,
            &payload_hash(body),
            credential,
            self.timestamp,
        );

        if bool::from(expected.as_slice().ct_eq(provided.as_slice())) {
            Ok(())
        } else {
            Err(VerifyError::SignatureMismatch)
        }
    }
}
