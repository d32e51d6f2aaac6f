use std::sync::Arc;

use chrono::{DateTime, Utc};
use http::{Request, StatusCode};

use super::{Clock, DEFAULT_MAX_BODY_BYTES, system_clock};
use crate::credential::Credential;
use crate::error::SignError;
use crate::handler::{Outcome, RequestHandler};
use crate::http::{Body, collect_body, full_body, text_response};
use crate::signature;

/// Request handler that signs every request with one fixed credential.
///
/// The body is buffered to compute its hash and re-attached unchanged.
/// Signing is mandatory: if the body cannot be read, the client receives a
/// `500` and nothing is forwarded.
///
/// # Examples
///
/// ```rust,no_run
/// use hmacproxy::{Proxy, credential::Credential, middleware::Signer};
///
/// # fn main() -> anyhow::Result<()> {
/// let signer = Signer::new(Credential::new("AKIDEXAMPLE", "secret", "s3", "us-east-1"));
/// let proxy = Proxy::builder()
///     .ca_pem_files("ca-cert.pem", "ca-key.pem")?
///     .handler(signer)
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Signer {
    credential: Arc<Credential>,
    max_body_bytes: usize,
    clock: Clock,
}

impl Signer {
    pub fn new(credential: Credential) -> Self {
        Self {
            credential: Arc::new(credential),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            clock: system_clock(),
        }
    }

    /// Largest body that will be buffered for signing.
    pub fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Replace the time source used for the signature timestamp.
    pub fn clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }
}

impl RequestHandler for Signer {
    async fn handle(&self, req: Request<Body>) -> Outcome {
        let (mut parts, body) = req.into_parts();

        let signed = match collect_body(body, self.max_body_bytes).await {
            Ok(bytes) => signature::sign(&mut parts, &bytes, &self.credential, (self.clock)())
                .map(|()| bytes),
            Err(e) => Err(SignError::Body(e.to_string())),
        };
        let bytes = match signed {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(method = %parts.method, uri = %parts.uri, error = %e, "signing failed");
                return Outcome::Respond(text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "request could not be signed\n",
                ));
            }
        };

        tracing::debug!(
            method = %parts.method,
            uri = %parts.uri,
            credential = self.credential.id(),
            "signed request"
        );
        Outcome::Forward(Request::from_parts(parts, full_body(bytes)))
    }
}
