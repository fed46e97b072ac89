//! Document identities and the connection target scheme.
//!
//! A connection target is a two-segment path `/{kind}/{id}` where `kind` is
//! `space` (graph documents) or `note` (rich-text update logs). The same pair
//! rendered as `{kind}:{id}` is the cache and registry key.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Which document shape an identity names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentKind {
    /// Spatial graph of nodes and edges (`space`).
    Graph,
    /// Rich-text CRDT update log (`note`).
    Log,
}

impl DocumentKind {
    /// Scheme segment used in connection targets and storage keys.
    pub fn scheme(self) -> &'static str {
        match self {
            DocumentKind::Graph => "space",
            DocumentKind::Log => "note",
        }
    }

    pub fn from_scheme(segment: &str) -> Option<Self> {
        match segment {
            "space" => Some(DocumentKind::Graph),
            "note" => Some(DocumentKind::Log),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// `(kind, id)` pair naming one collaborative document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentIdentity {
    pub kind: DocumentKind,
    pub id: String,
}

impl DocumentIdentity {
    pub fn new(kind: DocumentKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn graph(id: impl Into<String>) -> Self {
        Self::new(DocumentKind::Graph, id)
    }

    pub fn log(id: impl Into<String>) -> Self {
        Self::new(DocumentKind::Log, id)
    }

    /// Parse a raw connection target (`/space/abc`, `note/xyz?token=..`).
    ///
    /// Exactly two non-empty segments are accepted; the query string and a
    /// single trailing slash are ignored.
    pub fn parse_target(raw: &str) -> Result<Self, GatewayError> {
        let path = raw.split(['?', '#']).next().unwrap_or_default();
        let path = path.strip_prefix('/').unwrap_or(path);
        let path = path.strip_suffix('/').unwrap_or(path);

        let mut segments = path.split('/');
        let (kind, id) = match (segments.next(), segments.next(), segments.next()) {
            (Some(kind), Some(id), None) if !id.is_empty() => (kind, id),
            _ => return Err(GatewayError::InvalidTarget(raw.to_string())),
        };

        let kind = DocumentKind::from_scheme(kind)
            .ok_or_else(|| GatewayError::InvalidTarget(raw.to_string()))?;
        Ok(Self::new(kind, id))
    }

    /// Cache / registry key: `{kind}:{id}`.
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.kind.scheme(), self.id)
    }
}

impl fmt::Display for DocumentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.scheme(), self.id)
    }
}
