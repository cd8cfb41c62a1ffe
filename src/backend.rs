//! Query backends.
//!
//! A [`Backend`] turns a parsed [`Request`] into response lines. The
//! dispatcher calls it once per connection on a blocking worker thread and
//! hands over the connection's [`Response`]; the backend must finish it.
//! Backend failures never propagate: they are written to the client.

use crate::directory::{Directory, DirectoryConnection, DirectoryError};
use crate::protocol::Request;
use crate::response::Response;
use std::error::Error;
use std::sync::Arc;
use tracing::{debug, warn};

/// Port used when the host hint carries none
pub const DEFAULT_DIRECTORY_PORT: u16 = 8989;

/// Separates an object name from a single attribute in the target
const ATTRIBUTE_DELIMITER: char = '#';

/// Resolves one request per connection
pub trait Backend: Send + Sync {
    fn lookup(&self, request: &Request, response: Response);
}

/// Backend answering from a management attribute [`Directory`]
///
/// | target          | output                                   |
/// |-----------------|------------------------------------------|
/// | (empty)         | every object name, sorted                |
/// | `name`          | `attr: value` for each attribute of name |
/// | `name#attr`     | `attr: value`                            |
pub struct DirectoryBackend {
    directory: Arc<dyn Directory>,
    default_host: String,
    default_port: u16,
}

impl DirectoryBackend {
    pub fn new(directory: Arc<dyn Directory>, default_host: impl Into<String>) -> Self {
        Self {
            directory,
            default_host: default_host.into(),
            default_port: DEFAULT_DIRECTORY_PORT,
        }
    }

    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    /// Resolve `host[:port]` or `[v6-host][:port]`, filling in the defaults.
    fn endpoint(&self, remote_host: &str) -> Result<(String, u16), DirectoryError> {
        let (host, port) = match split_host_port(remote_host) {
            (host, Some(port)) => {
                let port = port.parse().map_err(|source| DirectoryError::InvalidPort {
                    address: remote_host.to_string(),
                    source,
                })?;
                (host, port)
            }
            (host, None) => (host, self.default_port),
        };

        let host = if host.is_empty() {
            self.default_host.clone()
        } else {
            host.to_string()
        };
        Ok((host, port))
    }

    fn connect(&self, request: &Request) -> Result<Box<dyn DirectoryConnection>, DirectoryError> {
        let (host, port) = self.endpoint(request.remote_host())?;
        debug!(%host, port, "Connecting to directory");
        self.directory.connect(&host, port)
    }
}

impl Backend for DirectoryBackend {
    fn lookup(&self, request: &Request, mut response: Response) {
        let result = self.connect(request).and_then(|mut connection| {
            let result = write_lookup(connection.as_ref(), request, &mut response);
            if let Err(e) = connection.close() {
                warn!(error = %e, "Failed to close directory connection");
            }
            result
        });

        if let Err(e) = result {
            warn!(error = %e, %request, "Directory lookup failed");
            write_diagnostics(&mut response, &e);
        }

        response.finish();
    }
}

fn write_lookup(
    connection: &dyn DirectoryConnection,
    request: &Request,
    response: &mut Response,
) -> Result<(), DirectoryError> {
    let (name, attribute) = split_target(request.target());

    if request.is_verbose() {
        response.send_line(name);
    }

    match attribute {
        Some(attribute) => {
            let value = connection.attribute(name, attribute)?;
            response.send(attribute, &value);
        }
        None if name.is_empty() => {
            let mut names = connection.object_names()?;
            names.sort();
            for name in &names {
                response.send_line(name);
            }
        }
        None => {
            for attribute in connection.attribute_names(name)? {
                // One unreadable attribute must not hide the rest.
                match connection.attribute(name, &attribute) {
                    Ok(value) => response.send(&attribute, &value),
                    Err(e) => response.send(&attribute, &e.to_string()),
                }
            }
        }
    }

    Ok(())
}

/// Split off an optional port. A bracketed host may contain `:`;
/// otherwise the first `:` starts the port.
fn split_host_port(address: &str) -> (&str, Option<&str>) {
    if let Some((host, tail)) = address
        .strip_prefix('[')
        .and_then(|rest| rest.split_once(']'))
    {
        return (host, tail.strip_prefix(':'));
    }
    match address.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (address, None),
    }
}

/// Split `name#attribute`. An empty attribute counts as none.
fn split_target(target: &str) -> (&str, Option<&str>) {
    match target.split_once(ATTRIBUTE_DELIMITER) {
        Some((name, attribute)) if !attribute.is_empty() => (name, Some(attribute)),
        Some((name, _)) => (name, None),
        None => (target, None),
    }
}

/// Error message followed by one line per cause.
fn write_diagnostics(response: &mut Response, error: &DirectoryError) {
    response.send_line(&error.to_string());
    let mut source = error.source();
    while let Some(cause) = source {
        response.send_line(&format!("  caused by: {cause}"));
        source = cause.source();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{LocalDirectory, ManagedObject, ObjectName};
    use crate::protocol::parse;
    use crate::response::Session;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Store with free-form names, recording connects and closes.
    #[derive(Default)]
    struct FakeDirectory {
        objects: Vec<(String, Vec<(String, Result<String, String>)>)>,
        endpoints: HashSet<(String, u16)>,
        connects: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl FakeDirectory {
        fn at(host: &str, port: u16) -> Self {
            let mut directory = Self::default();
            directory.endpoints.insert((host.to_string(), port));
            directory
        }

        fn object(mut self, name: &str, attributes: &[(&str, Result<&str, &str>)]) -> Self {
            let attributes = attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.map(str::to_string).map_err(str::to_string)))
                .collect();
            self.objects.push((name.to_string(), attributes));
            self
        }
    }

    struct FakeConnection {
        objects: Vec<(String, Vec<(String, Result<String, String>)>)>,
        closes: Arc<AtomicUsize>,
    }

    impl FakeConnection {
        fn find(&self, object: &str) -> Result<&[(String, Result<String, String>)], DirectoryError> {
            self.objects
                .iter()
                .find(|(name, _)| name == object)
                .map(|(_, attributes)| attributes.as_slice())
                .ok_or_else(|| DirectoryError::InstanceNotFound(object.to_string()))
        }
    }

    impl Directory for FakeDirectory {
        fn connect(
            &self,
            host: &str,
            port: u16,
        ) -> Result<Box<dyn DirectoryConnection>, DirectoryError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if !self.endpoints.contains(&(host.to_string(), port)) {
                return Err(DirectoryError::ConnectionRefused {
                    host: host.to_string(),
                    port,
                    source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
                });
            }
            Ok(Box::new(FakeConnection {
                objects: self.objects.clone(),
                closes: Arc::clone(&self.closes),
            }))
        }
    }

    impl DirectoryConnection for FakeConnection {
        fn object_names(&self) -> Result<Vec<String>, DirectoryError> {
            Ok(self.objects.iter().map(|(name, _)| name.clone()).collect())
        }

        fn attribute_names(&self, object: &str) -> Result<Vec<String>, DirectoryError> {
            Ok(self.find(object)?.iter().map(|(k, _)| k.clone()).collect())
        }

        fn attribute(&self, object: &str, attribute: &str) -> Result<String, DirectoryError> {
            self.find(object)?
                .iter()
                .find(|(k, _)| k == attribute)
                .ok_or_else(|| DirectoryError::AttributeNotFound {
                    object: object.to_string(),
                    attribute: attribute.to_string(),
                })?
                .1
                .clone()
                .map_err(DirectoryError::AttributeFailure)
        }

        fn close(&mut self) -> Result<(), DirectoryError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn run(directory: impl Directory + 'static, line: &str) -> String {
        let backend = DirectoryBackend::new(Arc::new(directory), "localhost");
        let (session, mut rx) = Session::new();

        backend.lookup(&parse(line), Response::new(session));

        let frame = rx.try_recv().expect("response was not finished");
        assert!(rx.try_recv().is_err(), "response flushed twice");
        String::from_utf8(frame.payload.to_vec()).unwrap()
    }

    #[test]
    fn test_empty_target_lists_sorted_names() {
        let directory = FakeDirectory::at("localhost", 8989)
            .object("b", &[])
            .object("a", &[])
            .object("c", &[]);

        assert_eq!(run(directory, ""), "a\r\nb\r\nc");
    }

    #[test]
    fn test_single_attribute() {
        let directory = FakeDirectory::at("localhost", 8989).object("bean1", &[("attrX", Ok("42"))]);

        assert_eq!(run(directory, "bean1#attrX"), "attrX: 42");
    }

    #[test]
    fn test_listing_continues_past_failed_attribute() {
        let directory = FakeDirectory::at("localhost", 8989).object(
            "bean1",
            &[("p", Ok("1")), ("q", Err("boom")), ("r", Ok("3"))],
        );

        assert_eq!(run(directory, "bean1"), "p: 1\r\nq: boom\r\nr: 3");
    }

    #[test]
    fn test_connection_failure_dumps_diagnostics() {
        let directory = FakeDirectory::at("localhost", 8989);
        let connects = Arc::clone(&directory.connects);
        let closes = Arc::clone(&directory.closes);

        let output = run(directory, "bean1@nowhere");
        let lines: Vec<&str> = output.split("\r\n").collect();

        assert_eq!(lines[0], "Connection refused to host: nowhere:8989");
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("  caused by: "));
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_connection_closed_after_lookup() {
        let directory = FakeDirectory::at("localhost", 8989).object("bean1", &[]);
        let closes = Arc::clone(&directory.closes);

        run(directory, "missing");
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_object_reported() {
        let directory = FakeDirectory::at("localhost", 8989);
        assert_eq!(run(directory, "missing"), "Instance not found: missing");
    }

    #[test]
    fn test_verbose_echoes_name_first() {
        let directory = FakeDirectory::at("localhost", 8989).object("bean1", &[("attrX", Ok("42"))]);

        assert_eq!(run(directory, "/W bean1#attrX"), "bean1\r\nattrX: 42");
    }

    #[test]
    fn test_host_and_port_from_request() {
        let directory = FakeDirectory::at("jmx1", 9000).object("bean1", &[("a", Ok("1"))]);

        assert_eq!(run(directory, "bean1#a@jmx1:9000"), "a: 1");
    }

    #[test]
    fn test_host_without_port_uses_default_port() {
        let directory = FakeDirectory::at("jmx1", 8989).object("bean1", &[("a", Ok("1"))]);

        assert_eq!(run(directory, "bean1#a@jmx1"), "a: 1");
    }

    #[test]
    fn test_invalid_port() {
        let directory = FakeDirectory::at("localhost", 8989);
        let output = run(directory, "bean1@jmx1:http");

        assert!(output.starts_with("Invalid port in directory address 'jmx1:http'\r\n  caused by: "));
    }

    #[test]
    fn test_split_target() {
        assert_eq!(split_target(""), ("", None));
        assert_eq!(split_target("bean"), ("bean", None));
        assert_eq!(split_target("bean#"), ("bean", None));
        assert_eq!(split_target("bean#attr"), ("bean", Some("attr")));
        assert_eq!(split_target("bean#a#b"), ("bean", Some("a#b")));
    }

    #[test]
    fn test_endpoint_defaults() {
        let backend = DirectoryBackend::new(Arc::new(LocalDirectory::new()), "jmx0")
            .with_default_port(9100);

        assert_eq!(backend.endpoint("").unwrap(), ("jmx0".to_string(), 9100));
        assert_eq!(backend.endpoint("h").unwrap(), ("h".to_string(), 9100));
        assert_eq!(backend.endpoint(":9200").unwrap(), ("jmx0".to_string(), 9200));
        assert!(backend.endpoint("h:99999").is_err());
    }

    #[test]
    fn test_endpoint_bracketed_ipv6() {
        let backend = DirectoryBackend::new(Arc::new(LocalDirectory::new()), "jmx0");

        assert_eq!(backend.endpoint("[::1]:9200").unwrap(), ("::1".to_string(), 9200));
        assert_eq!(backend.endpoint("[::1]").unwrap(), ("::1".to_string(), 8989));
        assert!(backend.endpoint("[::1]:").is_err());
    }

    #[test]
    fn test_against_local_directory() {
        let mut directory = LocalDirectory::new();
        directory.store_or_insert("localhost", 8989).register(
            ManagedObject::new(ObjectName::parse("app:type=Cache").unwrap())
                .with_attribute("Size", "10")
                .with_computed("Hits", || Err("unavailable".to_string())),
        );

        assert_eq!(
            run(directory, "app:type=Cache"),
            "Size: 10\r\nHits: unavailable"
        );
    }

    #[test]
    fn test_panicking_directory_still_finishes() {
        struct Exploding;

        impl Directory for Exploding {
            fn connect(
                &self,
                _host: &str,
                _port: u16,
            ) -> Result<Box<dyn DirectoryConnection>, DirectoryError> {
                panic!("directory exploded");
            }
        }

        let backend = DirectoryBackend::new(Arc::new(Exploding), "localhost");
        let (session, mut rx) = Session::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            backend.lookup(&parse("x"), Response::new(session));
        }));

        assert!(result.is_err());
        assert!(rx.try_recv().unwrap().payload.is_empty());
    }
}
