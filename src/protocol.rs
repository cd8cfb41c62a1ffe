//! Finger query line parser.
//!
//! A query is a single line of text:
//!
//! ```text
//! [/W ]target[@host[:port]]
//! ```
//!
//! - `/W` followed by a separator requests verbose output
//! - `@host` selects the directory to query; only the first `@` splits the
//!   line, everything after it is kept verbatim as the host hint
//!
//! Parsing never fails. What an empty or odd-looking target means is up to
//! the backend.

use std::fmt;

/// Verbose-mode marker at the start of a query
const VERBOSE_MARKER: &str = "/W";

/// Delimiter between the target and the remote host hint
const HOST_DELIMITER: char = '@';

/// A parsed finger query
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Request {
    target: String,
    remote_host: String,
    verbose: bool,
}

impl Request {
    pub fn new(target: impl Into<String>, remote_host: impl Into<String>, verbose: bool) -> Self {
        Self {
            target: target.into(),
            remote_host: remote_host.into(),
            verbose,
        }
    }

    /// The name being looked up (the protocol's "username" field)
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Host hint from the `@host[:port]` suffix, empty if none was given
    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.verbose {
            write!(f, "{VERBOSE_MARKER} ")?;
        }
        f.write_str(&self.target)?;
        if !self.remote_host.is_empty() {
            write!(f, "{HOST_DELIMITER}{}", self.remote_host)?;
        }
        Ok(())
    }
}

/// Parse a raw query line into a [`Request`].
pub fn parse(line: &str) -> Request {
    let (verbose, query) = strip_verbose_marker(line.trim());

    match query.split_once(HOST_DELIMITER) {
        Some((target, host)) => Request::new(target, host, verbose),
        None => Request::new(query, "", verbose),
    }
}

/// Strip `/W` plus exactly one separator character.
///
/// A bare `/W` is verbose with nothing left to look up. `/Wfoo` is not a
/// marker at all and is returned untouched.
fn strip_verbose_marker(query: &str) -> (bool, &str) {
    let Some(rest) = query.strip_prefix(VERBOSE_MARKER) else {
        return (false, query);
    };

    let mut chars = rest.chars();
    match chars.next() {
        None => (true, ""),
        Some(c) if c.is_whitespace() => (true, chars.as_str()),
        Some(_) => (false, query),
    }
}
