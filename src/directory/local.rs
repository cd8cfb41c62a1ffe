//! In-process attribute stores.
//!
//! A [`LocalDirectory`] maps `host:port` endpoints to [`Registry`] stores.
//! Connecting to an endpoint with no store behaves like a refused TCP
//! connection. Stores are filled from the configuration file and by the
//! server itself, which publishes its statistics object.

use super::{Directory, DirectoryConnection, DirectoryError, ObjectName};
use crate::config::DirectoryConfig;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

type ComputeFn = Arc<dyn Fn() -> Result<String, String> + Send + Sync>;

/// Source of an attribute's value
#[derive(Clone)]
enum AttributeValue {
    Static(String),
    /// Evaluated on every read; an `Err` is reported as the failure message
    Computed(ComputeFn),
}

impl AttributeValue {
    fn read(&self) -> Result<String, DirectoryError> {
        match self {
            AttributeValue::Static(value) => Ok(value.clone()),
            AttributeValue::Computed(compute) => compute().map_err(DirectoryError::AttributeFailure),
        }
    }
}

impl fmt::Debug for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Static(value) => f.debug_tuple("Static").field(value).finish(),
            AttributeValue::Computed(_) => f.write_str("Computed"),
        }
    }
}

/// A named object with attributes in declared order
#[derive(Debug, Clone)]
pub struct ManagedObject {
    name: ObjectName,
    attributes: Vec<(String, AttributeValue)>,
}

impl ManagedObject {
    pub fn new(name: ObjectName) -> Self {
        Self {
            name,
            attributes: Vec::new(),
        }
    }

    /// Add a fixed attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes
            .push((name.into(), AttributeValue::Static(value.into())));
        self
    }

    /// Add an attribute computed on each read.
    pub fn with_computed<F>(mut self, name: impl Into<String>, compute: F) -> Self
    where
        F: Fn() -> Result<String, String> + Send + Sync + 'static,
    {
        self.attributes
            .push((name.into(), AttributeValue::Computed(Arc::new(compute))));
        self
    }

    fn attribute(&self, attribute: &str) -> Option<&AttributeValue> {
        self.attributes
            .iter()
            .find(|(name, _)| name == attribute)
            .map(|(_, value)| value)
    }
}

/// Thread-safe store of managed objects, keyed by canonical name
#[derive(Debug, Default)]
pub struct Registry {
    objects: RwLock<BTreeMap<String, ManagedObject>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an object, returning the one it replaced.
    pub fn register(&self, object: ManagedObject) -> Option<ManagedObject> {
        debug!(object = %object.name, "Registering managed object");
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        objects.insert(object.name.canonical().to_string(), object)
    }

    pub fn len(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Registered names as they were written.
    pub fn object_names(&self) -> Vec<String> {
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        objects.values().map(|o| o.name.to_string()).collect()
    }

    pub fn attribute_names(&self, object: &str) -> Result<Vec<String>, DirectoryError> {
        self.with_object(object, |o| {
            o.attributes.iter().map(|(name, _)| name.clone()).collect()
        })
    }

    pub fn attribute(&self, object: &str, attribute: &str) -> Result<String, DirectoryError> {
        let value = self.with_object(object, |o| o.attribute(attribute).cloned())?;

        // Computed values run outside the lock.
        value
            .ok_or_else(|| DirectoryError::AttributeNotFound {
                object: object.to_string(),
                attribute: attribute.to_string(),
            })?
            .read()
    }

    fn with_object<T>(
        &self,
        object: &str,
        f: impl FnOnce(&ManagedObject) -> T,
    ) -> Result<T, DirectoryError> {
        let name = ObjectName::parse(object)?;
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        objects
            .get(name.canonical())
            .map(f)
            .ok_or_else(|| DirectoryError::InstanceNotFound(object.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.trim().to_ascii_lowercase(),
            port,
        }
    }
}

/// Directory of in-process stores addressed by `host:port`
#[derive(Debug, Default)]
pub struct LocalDirectory {
    stores: HashMap<Endpoint, Arc<Registry>>,
}

impl LocalDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the stores declared in the configuration file.
    pub fn from_config(config: &DirectoryConfig) -> Result<Self, DirectoryError> {
        let mut directory = Self::new();

        for store in &config.stores {
            let registry = directory.store_or_insert(&store.host, store.port);
            for object in &store.objects {
                let managed = object.attributes.iter().fold(
                    ManagedObject::new(ObjectName::parse(&object.name)?),
                    |managed, attr| managed.with_attribute(&attr.name, &attr.value),
                );
                registry.register(managed);
            }
            debug!(
                host = %store.host,
                port = store.port,
                objects = registry.len(),
                "Configured directory store"
            );
        }

        Ok(directory)
    }

    /// The store at `host:port`, created empty if missing.
    pub fn store_or_insert(&mut self, host: &str, port: u16) -> Arc<Registry> {
        Arc::clone(
            self.stores
                .entry(Endpoint::new(host, port))
                .or_insert_with(Registry::new),
        )
    }
}

impl Directory for LocalDirectory {
    fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn DirectoryConnection>, DirectoryError> {
        match self.stores.get(&Endpoint::new(host, port)) {
            Some(registry) => Ok(Box::new(LocalConnection {
                registry: Some(Arc::clone(registry)),
            })),
            None => Err(DirectoryError::ConnectionRefused {
                host: host.to_string(),
                port,
                source: io::Error::from(io::ErrorKind::ConnectionRefused),
            }),
        }
    }
}

struct LocalConnection {
    registry: Option<Arc<Registry>>,
}

impl LocalConnection {
    fn registry(&self) -> Result<&Registry, DirectoryError> {
        self.registry.as_deref().ok_or(DirectoryError::Closed)
    }
}

impl DirectoryConnection for LocalConnection {
    fn object_names(&self) -> Result<Vec<String>, DirectoryError> {
        Ok(self.registry()?.object_names())
    }

    fn attribute_names(&self, object: &str) -> Result<Vec<String>, DirectoryError> {
        self.registry()?.attribute_names(object)
    }

    fn attribute(&self, object: &str, attribute: &str) -> Result<String, DirectoryError> {
        self.registry()?.attribute(object, attribute)
    }

    fn close(&mut self) -> Result<(), DirectoryError> {
        self.registry = None;
        Ok(())
    }
}
