//! Credentials and the stores that resolve them by identifier.

mod key_map;
mod registry;
mod single_key;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretSlice};

pub use key_map::KeyMapStore;
pub use registry::{DynStore, StoreFactory, StoreRegistry};
pub use single_key::SingleKeyStore;

/// A shared signing secret together with its public identifier and scope.
///
/// Immutable once built. The secret is zeroized on drop and redacted from
/// `Debug` output.
pub struct Credential {
    id: String,
    secret: SecretSlice<u8>,
    service: String,
    region: String,
}

impl Credential {
    pub fn new(
        id: impl Into<String>,
        secret: impl Into<Vec<u8>>,
        service: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            secret: SecretSlice::from(secret.into()),
            service: service.into(),
            region: region.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub(crate) fn secret(&self) -> &[u8] {
        self.secret.expose_secret()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("secret", &"[REDACTED]")
            .field("service", &self.service)
            .field("region", &self.region)
            .finish()
    }
}

/// Lookup of a credential by its public identifier.
///
/// A returned credential is a complete snapshot: a concurrent refresh of the
/// store never yields a credential with fields from two different versions.
/// The verifier depends on nothing but this capability, so new backends
/// (remote key services, key files) plug in without touching it.
pub trait CredentialStore: Send + Sync + 'static {
    fn lookup(&self, id: &str) -> impl Future<Output = Option<Arc<Credential>>> + Send;
}

impl<S: CredentialStore> CredentialStore for Arc<S> {
    fn lookup(&self, id: &str) -> impl Future<Output = Option<Arc<Credential>>> + Send {
        (**self).lookup(id)
    }
}
