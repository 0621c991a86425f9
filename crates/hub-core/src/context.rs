//! Causal context carried by events and trigger firings

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Identifies the origin of an event and links it to whatever caused it
///
/// A trigger firing creates a fresh context. Anything it sets in motion
/// (a nested automation run, a characteristic write) carries a child
/// context whose `parent_id` points back at it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    /// Unique identifier for this context (ULID)
    pub id: String,

    /// Context that caused this one, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl Context {
    /// Create a root context with a fresh ULID
    pub fn new() -> Self {
        Self {
            id: Ulid::new().to_string(),
            parent_id: None,
        }
    }

    /// Create a context with a specific id
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
        }
    }

    /// Create a child context caused by this one
    pub fn child(&self) -> Self {
        Self {
            id: Ulid::new().to_string(),
            parent_id: Some(self.id.clone()),
        }
    }

    /// Whether this context was caused by another
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_links_to_parent() {
        let root = Context::new();
        let child = root.child();

        assert!(root.is_root());
        assert_eq!(child.parent_id.as_deref(), Some(root.id.as_str()));
        assert_ne!(child.id, root.id);
    }

    #[test]
    fn test_ulid_length() {
        assert_eq!(Context::new().id.len(), 26);
    }
}
