use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{Credential, CredentialStore, KeyMapStore, SingleKeyStore};
use crate::config::KeyConfig;
use crate::error::Error;

type LookupFuture<'a> = Pin<Box<dyn Future<Output = Option<Arc<Credential>>> + Send + 'a>>;

/// Object-safe mirror of [`CredentialStore`], so backends chosen at runtime
/// can sit behind one type.
trait ErasedStore: Send + Sync {
    fn lookup_boxed<'a>(&'a self, id: &'a str) -> LookupFuture<'a>;
}

impl<S: CredentialStore> ErasedStore for S {
    fn lookup_boxed<'a>(&'a self, id: &'a str) -> LookupFuture<'a> {
        Box::pin(self.lookup(id))
    }
}

/// A credential store whose backend was selected at runtime.
#[derive(Clone)]
pub struct DynStore(Arc<dyn ErasedStore>);

impl DynStore {
    pub fn new(store: impl CredentialStore) -> Self {
        Self(Arc::new(store))
    }
}

impl CredentialStore for DynStore {
    fn lookup(&self, id: &str) -> impl Future<Output = Option<Arc<Credential>>> + Send {
        let store = Arc::clone(&self.0);
        let id = id.to_owned();
        async move { store.lookup_boxed(&id).await }
    }
}

/// Builds a store from the backend-specific options of a credential source.
pub type StoreFactory = fn(&toml::Table) -> Result<DynStore, Error>;

/// Maps backend kind names to the factories that build them.
///
/// Backends are registered explicitly; [`builtin`](Self::builtin) lists every
/// backend linked into this crate.
#[derive(Default)]
pub struct StoreRegistry {
    factories: BTreeMap<String, StoreFactory>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry containing `single_key` and `key_map`.
    pub fn builtin() -> Self {
        Self::new()
            .register("single_key", single_key_factory)
            .register("key_map", key_map_factory)
    }

    /// Register (or replace) the factory for `kind`.
    pub fn register(mut self, kind: impl Into<String>, factory: StoreFactory) -> Self {
        self.factories.insert(kind.into(), factory);
        self
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Resolve a backend kind and its options into a store.
    pub fn build(&self, kind: &str, options: &toml::Table) -> Result<DynStore, Error> {
        let factory = self.factories.get(kind).ok_or_else(|| Error::Store {
            kind: kind.to_string(),
            message: format!(
                "unknown backend, expected one of: {}",
                self.kinds().collect::<Vec<_>>().join(", ")
            ),
        })?;
        factory(options)
    }
}

fn parse_options<T: DeserializeOwned>(kind: &str, options: &toml::Table) -> Result<T, Error> {
    toml::Value::Table(options.clone())
        .try_into()
        .map_err(|e| Error::Store {
            kind: kind.to_string(),
            message: e.to_string(),
        })
}

fn single_key_factory(options: &toml::Table) -> Result<DynStore, Error> {
    let key: KeyConfig = parse_options("single_key", options)?;
    Ok(DynStore::new(SingleKeyStore::new(key.into_credential())))
}

#[derive(Deserialize)]
struct KeyMapOptions {
    keys: Vec<KeyConfig>,
}

fn key_map_factory(options: &toml::Table) -> Result<DynStore, Error> {
    let opts: KeyMapOptions = parse_options("key_map", options)?;
    Ok(DynStore::new(KeyMapStore::new(
        opts.keys.into_iter().map(KeyConfig::into_credential),
    )))
}
