use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use http::request::Parts;
use http::{Request, StatusCode};

use super::{Clock, DEFAULT_MAX_BODY_BYTES, system_clock};
use crate::credential::{Credential, CredentialStore};
use crate::error::VerifyError;
use crate::handler::{Outcome, RequestHandler};
use crate::http::{Body, collect_body, full_body, text_response};
use crate::signature::{AUTH_HEADERS, SignedClaim};

/// Body of every rejection. Identical for all failure reasons so a client
/// cannot tell an unknown identifier from a bad signature.
pub const REJECTION_BODY: &str = "request signature could not be verified\n";

const DEFAULT_MAX_CLOCK_SKEW: Duration = Duration::from_secs(5 * 60);

/// Request handler that admits only requests carrying a valid signature from
/// a credential known to the store.
///
/// Every rejection is a `403 Forbidden` with [`REJECTION_BODY`]; the precise
/// reason is only logged. Accepted requests lose their auth headers (unless
/// [`keep_auth_headers`](Self::keep_auth_headers) is set) and continue
/// otherwise unchanged.
pub struct Verifier<S> {
    store: S,
    max_clock_skew: Duration,
    strip_auth_headers: bool,
    max_body_bytes: usize,
    clock: Clock,
}

impl<S: CredentialStore> Verifier<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            max_clock_skew: DEFAULT_MAX_CLOCK_SKEW,
            strip_auth_headers: true,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            clock: system_clock(),
        }
    }

    /// Largest allowed distance between the request timestamp and now, in
    /// either direction. Default: 5 minutes.
    pub fn max_clock_skew(mut self, skew: Duration) -> Self {
        self.max_clock_skew = skew;
        self
    }

    /// Forward the auth headers upstream instead of stripping them.
    pub fn keep_auth_headers(mut self) -> Self {
        self.strip_auth_headers = false;
        self
    }

    pub fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    pub fn clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Check a request head and its complete body. Returns the credential
    /// that signed it.
    pub async fn verify(&self, parts: &Parts, body: &[u8]) -> Result<Arc<Credential>, VerifyError> {
        let claim = SignedClaim::from_headers(&parts.headers)?;

        let credential = self
            .store
            .lookup(&claim.authorization.credential_id)
            .await
            .ok_or(VerifyError::UnknownCredential)?;

        let skew = (self.clock)().signed_duration_since(claim.timestamp);
        let allowed = i64::try_from(self.max_clock_skew.as_secs()).unwrap_or(i64::MAX);
        if skew.num_seconds().abs() > allowed {
            return Err(VerifyError::Expired {
                skew_secs: skew.num_seconds(),
            });
        }

        claim.verify(parts, body, &credential)?;
        Ok(credential)
    }
}

fn reject() -> Outcome {
    Outcome::Respond(text_response(StatusCode::FORBIDDEN, REJECTION_BODY))
}

impl<S: CredentialStore> RequestHandler for Verifier<S> {
    async fn handle(&self, req: Request<Body>) -> Outcome {
        let (mut parts, body) = req.into_parts();

        let bytes = match collect_body(body, self.max_body_bytes).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::info!(
                    method = %parts.method,
                    uri = %parts.uri,
                    reason = "malformed",
                    error = %e,
                    "rejected request"
                );
                return reject();
            }
        };

        match self.verify(&parts, &bytes).await {
            Ok(credential) => {
                tracing::debug!(
                    method = %parts.method,
                    uri = %parts.uri,
                    credential = credential.id(),
                    "verified request"
                );
                if self.strip_auth_headers {
                    for name in AUTH_HEADERS {
                        parts.headers.remove(name);
                    }
                }
                Outcome::Forward(Request::from_parts(parts, full_body(bytes)))
            }
            Err(e) => {
                tracing::info!(
                    method = %parts.method,
                    uri = %parts.uri,
                    reason = e.kind(),
                    detail = %e,
                    "rejected request"
                );
                reject()
            }
        }
    }
}
