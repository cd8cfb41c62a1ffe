//! Management attribute directory.
//!
//! The backend only depends on the [`Directory`] capability: connect to a
//! store at `host:port`, enumerate its objects, and read their attributes.
//! How a store is reached is up to the implementation; [`LocalDirectory`]
//! serves in-process stores.

mod local;
mod object_name;

pub use local::{LocalDirectory, ManagedObject};
#[cfg(test)]
pub use local::Registry;
pub use object_name::ObjectName;

use std::num::ParseIntError;
use thiserror::Error;

/// Errors raised while talking to a directory
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Connection refused to host: {host}:{port}")]
    ConnectionRefused {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid port in directory address '{address}'")]
    InvalidPort {
        address: String,
        #[source]
        source: ParseIntError,
    },

    #[error("Malformed object name '{name}': {reason}")]
    MalformedObjectName { name: String, reason: &'static str },

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("No such attribute {attribute} on {object}")]
    AttributeNotFound { object: String, attribute: String },

    /// Reading an attribute failed; the message is the whole text
    #[error("{0}")]
    AttributeFailure(String),

    #[error("Directory connection is closed")]
    Closed,
}

/// A reachable set of attribute stores
pub trait Directory: Send + Sync {
    /// Open a connection to the store at `host:port`.
    fn connect(&self, host: &str, port: u16)
        -> Result<Box<dyn DirectoryConnection>, DirectoryError>;
}

/// An open connection to one attribute store
pub trait DirectoryConnection: Send {
    /// Names of every object in the store, in no particular order.
    fn object_names(&self) -> Result<Vec<String>, DirectoryError>;

    /// Attribute names of `object`, in declared order.
    fn attribute_names(&self, object: &str) -> Result<Vec<String>, DirectoryError>;

    /// Current value of one attribute, rendered as text.
    fn attribute(&self, object: &str, attribute: &str) -> Result<String, DirectoryError>;

    /// Release the connection. Closing twice is not an error.
    fn close(&mut self) -> Result<(), DirectoryError>;
}
