use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::{Credential, CredentialStore};

type KeyMap = HashMap<String, Arc<Credential>>;

/// Store holding any number of credentials keyed by identifier.
///
/// [`replace_all`](Self::replace_all) swaps the whole map at once, so an
/// external reload never exposes a half-applied key set.
pub struct KeyMapStore {
    keys: RwLock<Arc<KeyMap>>,
}

impl KeyMapStore {
    pub fn new(credentials: impl IntoIterator<Item = Credential>) -> Self {
        Self {
            keys: RwLock::new(Arc::new(build_map(credentials))),
        }
    }

    /// Atomically replace every credential in the store.
    pub fn replace_all(&self, credentials: impl IntoIterator<Item = Credential>) {
        let next = Arc::new(build_map(credentials));
        let mut guard = match self.keys.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = next;
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Arc<KeyMap> {
        match self.keys.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

fn build_map(credentials: impl IntoIterator<Item = Credential>) -> KeyMap {
    credentials
        .into_iter()
        .map(|c| (c.id().to_string(), Arc::new(c)))
        .collect()
}

impl CredentialStore for KeyMapStore {
    async fn lookup(&self, id: &str) -> Option<Arc<Credential>> {
        self.snapshot().get(id).cloned()
    }
}
