//! Managed object references.

use std::fmt;

use serde::Serialize;

use crate::soap::XmlNode;

/// Opaque `(type, id)` handle of a hypervisor object.
///
/// The value is only ever used as a lookup key; it is never dereferenced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ManagedObjectRef {
    /// Object type, e.g. `VirtualMachine` or `Datastore`.
    pub kind: String,
    /// Server-side identifier, e.g. `12` or `datastore-1`.
    pub value: String,
}

impl ManagedObjectRef {
    /// Create a reference from its parts.
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }

    /// Encode as a request argument element named `name`.
    pub fn to_node(&self, name: &str) -> XmlNode {
        XmlNode::new(name)
            .with_attr("type", &self.kind)
            .with_text(&self.value)
    }

    /// Decode from an element carrying a `type` attribute.
    pub fn from_node(node: &XmlNode) -> Option<Self> {
        let kind = node.attr("type")?;
        if node.text.is_empty() {
            return None;
        }
        Some(Self::new(kind, node.text.clone()))
    }
}

impl fmt::Display for ManagedObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}
