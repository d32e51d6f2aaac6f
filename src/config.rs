use std::path::Path;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};

use crate::credential::{Credential, StoreRegistry};
use crate::error::Error;
use crate::middleware::{Signer, Verifier};

/// Top-level configuration file. Exactly one role section must be present.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub signer: Option<SignerConfig>,
    pub verifier: Option<VerifierConfig>,
}

/// The role a process runs, resolved from [`Config`].
#[derive(Debug)]
pub enum Role {
    Signer(SignerConfig),
    Verifier(VerifierConfig),
}

/// Forward proxy that signs outbound requests.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignerConfig {
    /// Listen address. Default: "127.0.0.1:8080".
    #[serde(default = "default_signer_listen")]
    pub listen: String,

    /// `host:port` globs whose CONNECT tunnels carry plain HTTP. Default: `["*:80"]`.
    pub plaintext_hosts: Option<Vec<String>>,

    /// Accept invalid upstream TLS certificates.
    #[serde(default)]
    pub accept_invalid_upstream_certs: bool,

    /// Maximum number of cached leaf certificates. Default: 1024.
    pub leaf_cache_capacity: Option<usize>,

    /// Largest request body buffered for signing. Default: 10 MiB.
    pub max_body_bytes: Option<usize>,

    /// Upstream connect timeout, e.g. "10s".
    pub connect_timeout: Option<DurationValue>,

    /// Client TLS handshake timeout, e.g. "10s".
    pub handshake_timeout: Option<DurationValue>,

    /// How long open connections may keep running after shutdown. Default: "30s".
    pub shutdown_timeout: Option<DurationValue>,

    /// CA used to intercept HTTPS. Without it HTTPS tunnels are relayed unsigned.
    pub ca: Option<PemPairConfig>,

    /// The credential every request is signed with.
    pub key: KeyConfig,
}

/// Reverse proxy that verifies inbound requests.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifierConfig {
    /// Listen address. Default: "127.0.0.1:8081".
    #[serde(default = "default_verifier_listen")]
    pub listen: String,

    /// Where verified requests are sent, e.g. "http://127.0.0.1:9000".
    pub upstream: String,

    /// Allowed distance between request timestamp and now. Default: "5m".
    pub max_clock_skew: Option<DurationValue>,

    /// Remove the auth headers before forwarding. Default: true.
    #[serde(default = "default_true")]
    pub strip_auth_headers: bool,

    /// Largest request body buffered for verification. Default: 10 MiB.
    pub max_body_bytes: Option<usize>,

    #[serde(default)]
    pub accept_invalid_upstream_certs: bool,

    pub connect_timeout: Option<DurationValue>,

    pub handshake_timeout: Option<DurationValue>,

    pub shutdown_timeout: Option<DurationValue>,

    /// Serve HTTPS with this certificate chain and key.
    pub tls: Option<PemPairConfig>,

    pub credential_source: CredentialSourceConfig,
}

/// Paths to a PEM certificate and its private key.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PemPairConfig {
    pub cert: String,
    pub key: String,
}

/// One credential as written in a config file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyConfig {
    #[serde(deserialize_with = "scope_component")]
    pub id: String,
    #[serde(deserialize_with = "secret_string")]
    pub secret: SecretString,
    #[serde(deserialize_with = "scope_component")]
    pub service: String,
    #[serde(deserialize_with = "scope_component")]
    pub region: String,
}

impl KeyConfig {
    pub fn into_credential(self) -> Credential {
        Credential::new(
            self.id,
            self.secret.expose_secret().as_bytes(),
            self.service,
            self.region,
        )
    }
}

/// A credential backend: `type` names the backend, the remaining keys are
/// its options.
#[derive(Debug, Deserialize)]
pub struct CredentialSourceConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub options: toml::Table,
}

fn secret_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SecretString, D::Error> {
    String::deserialize(deserializer).map(SecretString::from)
}

/// Identifiers and scope tags are joined with `/` in the `Authorization`
/// header, so they cannot contain separators of that header.
fn scope_component<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = String::deserialize(deserializer)?;
    let bad = |c: char| matches!(c, '/' | ',' | '=') || c.is_whitespace();
    if value.is_empty() || value.contains(bad) {
        return Err(serde::de::Error::custom(format!(
            "{value:?} must be non-empty and contain no '/', ',', '=' or whitespace"
        )));
    }
    Ok(value)
}

fn default_signer_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_verifier_listen() -> String {
    "127.0.0.1:8081".to_string()
}

fn default_true() -> bool {
    true
}

/// A single duration, deserialized from a string like `"10s"`, `"200ms"` or `"5m"`.
#[derive(Debug, Clone, Copy)]
pub struct DurationValue(pub Duration);

impl<'de> Deserialize<'de> for DurationValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s)
            .map(DurationValue)
            .map_err(serde::de::Error::custom)
    }
}

pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        let n: u64 = ms.parse().map_err(|e| format!("invalid duration: {e}"))?;
        Ok(Duration::from_millis(n))
    } else if let Some(secs) = s.strip_suffix('s') {
        let n: f64 = secs.parse().map_err(|e| format!("invalid duration: {e}"))?;
        Duration::try_from_secs_f64(n).map_err(|e| format!("invalid duration: {e}"))
    } else if let Some(mins) = s.strip_suffix('m') {
        let n: f64 = mins.parse().map_err(|e| format!("invalid duration: {e}"))?;
        Duration::try_from_secs_f64(n * 60.0).map_err(|e| format!("invalid duration: {e}"))
    } else {
        Err(format!("expected duration like '200ms', '1s' or '5m', got '{s}'"))
    }
}

impl Config {
    /// Parse config from a TOML string.
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load config from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// The single role this config describes.
    pub fn into_role(self) -> Result<Role, Error> {
        match (self.signer, self.verifier) {
            (Some(signer), None) => Ok(Role::Signer(signer)),
            (None, Some(verifier)) => Ok(Role::Verifier(verifier)),
            (Some(_), Some(_)) => Err(Error::config(
                "both [signer] and [verifier] are set; run one role per process",
            )),
            (None, None) => Err(Error::config("one of [signer] or [verifier] is required")),
        }
    }
}

impl SignerConfig {
    /// Build a [`ProxyBuilder`](crate::ProxyBuilder) from this config.
    pub fn into_builder(self) -> anyhow::Result<crate::ProxyBuilder> {
        let mut builder = crate::Proxy::builder();

        if let Some(ca) = &self.ca {
            builder = builder.ca_pem_files(&ca.cert, &ca.key)?;
        }
        if let Some(patterns) = self.plaintext_hosts {
            builder = builder.plaintext_hosts(patterns);
        }
        if self.accept_invalid_upstream_certs {
            builder = builder.danger_accept_invalid_upstream_certs();
        }
        if let Some(capacity) = self.leaf_cache_capacity {
            builder = builder.leaf_cache_capacity(capacity);
        }
        if let Some(timeout) = self.connect_timeout {
            builder = builder.connect_timeout(timeout.0);
        }
        if let Some(timeout) = self.handshake_timeout {
            builder = builder.handshake_timeout(timeout.0);
        }
        if let Some(timeout) = self.shutdown_timeout {
            builder = builder.shutdown_timeout(timeout.0);
        }

        let mut signer = Signer::new(self.key.into_credential());
        if let Some(limit) = self.max_body_bytes {
            signer = signer.max_body_bytes(limit);
        }
        Ok(builder.handler(signer))
    }
}

impl VerifierConfig {
    /// Build a [`ProxyBuilder`](crate::ProxyBuilder) from this config,
    /// resolving the credential source through `registry`.
    pub fn into_builder(self, registry: &StoreRegistry) -> anyhow::Result<crate::ProxyBuilder> {
        let mut builder = crate::Proxy::builder().reverse_proxy(&self.upstream)?;

        if let Some(tls) = &self.tls {
            builder = builder.tls_identity_files(&tls.cert, &tls.key)?;
        }
        if self.accept_invalid_upstream_certs {
            builder = builder.danger_accept_invalid_upstream_certs();
        }
        if let Some(timeout) = self.connect_timeout {
            builder = builder.connect_timeout(timeout.0);
        }
        if let Some(timeout) = self.handshake_timeout {
            builder = builder.handshake_timeout(timeout.0);
        }
        if let Some(timeout) = self.shutdown_timeout {
            builder = builder.shutdown_timeout(timeout.0);
        }

        let store = registry.build(
            &self.credential_source.kind,
            &self.credential_source.options,
        )?;
        let mut verifier = Verifier::new(store);
        if let Some(skew) = self.max_clock_skew {
            verifier = verifier.max_clock_skew(skew.0);
        }
        if let Some(limit) = self.max_body_bytes {
            verifier = verifier.max_body_bytes(limit);
        }
        if !self.strip_auth_headers {
            verifier = verifier.keep_auth_headers();
        }
        Ok(builder.handler(verifier))
    }
}
