//! Peer identity as seen through the transport.

use std::fmt;
use std::hash::{Hash, Hasher};

/// Remote endpoint: stable `id` plus a human-readable display name.
/// Two peers are equal iff their ids match; the name is only used for lookup.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: String,
    pub display_name: String,
}

impl Peer {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }

    /// New peer with a random v4 UUID as id.
    pub fn generate(display_name: impl Into<String>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), display_name)
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.id)
    }
}
