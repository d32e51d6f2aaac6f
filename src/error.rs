//! Error types for hmacproxy.

use thiserror::Error;

/// Errors raised while configuring or running a proxy.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or inconsistent configuration. Fatal at startup.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// The certificate authority could not be loaded or could not mint a leaf.
    #[error("certificate authority error: {0}")]
    Certificate(#[from] rcgen::Error),

    /// TLS setup or handshake failure.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// A credential store backend failed to build.
    #[error("credential store '{kind}': {message}")]
    Store { kind: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

/// Failure to sign an outbound request. Surfaced to the client as a 5xx.
#[derive(Error, Debug)]
pub enum SignError {
    #[error("failed to read request body: {0}")]
    Body(String),

    #[error("request has no host to sign")]
    MissingHost,

    #[error("computed header value is not valid: {0}")]
    HeaderValue(#[from] http::header::InvalidHeaderValue),
}

/// Reason an inbound request failed verification.
///
/// The variants are distinct for logging and tests only. Clients always see
/// the same rejection response regardless of the variant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("malformed signature: {0}")]
    Malformed(String),

    #[error("unknown credential")]
    UnknownCredential,

    #[error("request expired: skew of {skew_secs}s exceeds the allowed window")]
    Expired { skew_secs: i64 },

    #[error("signature mismatch")]
    SignatureMismatch,
}

impl VerifyError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed(reason.into())
    }

    /// Short machine-readable reason, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::UnknownCredential => "unknown_credential",
            Self::Expired { .. } => "expired",
            Self::SignatureMismatch => "signature_mismatch",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
