//! Certificate authority and per-host leaf certificates for TLS interception.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, RwLock};

use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::Result;

/// Default number of leaf certificates kept in a [`LeafCache`].
pub const DEFAULT_LEAF_CACHE_CAPACITY: usize = 1024;

/// Wraps a CA certificate and key pair used to sign per-host certificates.
pub struct CertificateAuthority {
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl CertificateAuthority {
    /// Create from PEM-encoded strings.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem)?;
        let cert = params.self_signed(&key)?;
        Ok(Self { cert, key })
    }

    /// Create from PEM files on disk.
    pub fn from_pem_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path)?;
        let key_pem = std::fs::read_to_string(key_path)?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Generate a fresh self-signed CA.
    pub fn generate(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);

        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;
        Ok(Self { cert, key })
    }

    pub fn cert_pem(&self) -> String {
        self.cert.pem()
    }

    pub fn key_pem(&self) -> String {
        self.key.serialize_pem()
    }

    /// Write the certificate and private key as PEM files.
    pub fn to_pem_files(&self, cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(cert_path, self.cert_pem())?;
        std::fs::write(key_path, self.key_pem())?;
        Ok(())
    }

    /// Generate a leaf certificate for the given hostname, signed by this CA.
    pub fn generate_cert(
        &self,
        hostname: &str,
    ) -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
        let mut params = CertificateParams::new(vec![hostname.to_string()])?;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.distinguished_name.push(DnType::CommonName, hostname);

        let key_pair = KeyPair::generate()?;
        let key_der = PrivateKeyDer::Pkcs8(key_pair.serialize_der().into());
        let cert = params.signed_by(&key_pair, &self.cert, &self.key)?;
        let cert_der = cert.der().clone();

        Ok((cert_der, key_der))
    }
}

/// A minted leaf certificate and the TLS server config presenting it.
pub struct Leaf {
    pub cert_der: CertificateDer<'static>,
    pub server_config: Arc<ServerConfig>,
}

#[derive(Default)]
struct Entries {
    leaves: HashMap<String, Arc<Leaf>>,
    order: VecDeque<String>,
}

/// Bounded cache of leaf certificates keyed by host.
///
/// Hosts are looked up under a read lock. Misses mint on the blocking pool
/// and insert under a write lock; if two tasks race on the same host the
/// first insert wins and both get the same leaf. When full, the oldest
/// inserted host is evicted.
pub struct LeafCache {
    ca: Arc<CertificateAuthority>,
    capacity: usize,
    entries: RwLock<Entries>,
}

impl LeafCache {
    pub fn new(ca: CertificateAuthority, capacity: usize) -> Self {
        Self {
            ca: Arc::new(ca),
            capacity: capacity.max(1),
            entries: RwLock::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.read().leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the leaf for `host`, minting and caching it on first use.
    pub async fn leaf_for(&self, host: &str) -> Result<Arc<Leaf>> {
        if let Some(leaf) = self.read().leaves.get(host) {
            return Ok(leaf.clone());
        }

        let ca = self.ca.clone();
        let name = host.to_string();
        let minted = tokio::task::spawn_blocking(move || mint(&ca, &name))
            .await
            .map_err(std::io::Error::other)??;

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = entries.leaves.get(host) {
            return Ok(existing.clone());
        }
        let leaf = Arc::new(minted);
        entries.leaves.insert(host.to_string(), leaf.clone());
        entries.order.push_back(host.to_string());
        while entries.order.len() > self.capacity {
            if let Some(oldest) = entries.order.pop_front() {
                entries.leaves.remove(&oldest);
                tracing::trace!(host = %oldest, "evicted leaf certificate");
            }
        }
        tracing::debug!(host, "minted leaf certificate");
        Ok(leaf)
    }
}

fn mint(ca: &CertificateAuthority, host: &str) -> Result<Leaf> {
    let (cert_der, key_der) = ca.generate_cert(host)?;
    let mut server_config =
        ServerConfig::builder_with_provider(crate::crypto_provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(vec![cert_der.clone()], key_der)?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Leaf {
        cert_der,
        server_config: Arc::new(server_config),
    })
}
