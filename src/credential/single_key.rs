use std::sync::{Arc, RwLock};

use super::{Credential, CredentialStore};

/// Store holding exactly one credential. Suited to simple deployments.
///
/// The credential can be swapped at runtime with [`replace`](Self::replace);
/// lookups see either the old or the new credential, never a mix.
pub struct SingleKeyStore {
    credential: RwLock<Arc<Credential>>,
}

impl SingleKeyStore {
    pub fn new(credential: Credential) -> Self {
        Self {
            credential: RwLock::new(Arc::new(credential)),
        }
    }

    /// Atomically swap the stored credential.
    pub fn replace(&self, credential: Credential) {
        let credential = Arc::new(credential);
        let mut guard = match self.credential.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = credential;
    }

    fn current(&self) -> Arc<Credential> {
        match self.credential.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl CredentialStore for SingleKeyStore {
    async fn lookup(&self, id: &str) -> Option<Arc<Credential>> {
        let credential = self.current();
        (credential.id() == id).then_some(credential)
    }
}
