//! Sender authorization
//!
//! Messages from senders outside the whitelist are ignored entirely: no
//! reply, no session, no error. The predicate is injected into the
//! multiplexer so tests can substitute their own policy.

use std::collections::HashSet;
use std::path::Path;
use tracing::warn;

/// Authorization predicate for incoming senders.
pub trait Authorize: Send + Sync + 'static {
    fn is_authorized(&self, sender: i64) -> bool;
}

/// Whitelist of numeric sender identifiers, one per line on disk.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    allowed: HashSet<i64>,
}

impl Whitelist {
    /// Load from a newline-delimited file. A missing file is a warning, not
    /// an error, and yields the deny-all empty list.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => {
                warn!("whitelist {} not present, denying all senders", path.display());
                return Self::default();
            }
        };
        Self::from_lines(&content)
    }

    fn from_lines(content: &str) -> Self {
        let allowed = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter_map(|line| line.parse().ok())
            .collect();
        Self { allowed }
    }

    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}

impl Authorize for Whitelist {
    fn is_authorized(&self, sender: i64) -> bool {
        self.allowed.contains(&sender)
    }
}
