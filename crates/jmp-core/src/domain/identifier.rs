//! Controller resource identifiers of the form `namespaces/<ns>/<kind>/<name>`.

use thiserror::Error;

/// Resource kinds addressed by the controller API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Lease,
    Client,
    Exporter,
}

impl ResourceKind {
    /// The plural path segment used on the wire.
    pub fn segment(self) -> &'static str {
        match self {
            ResourceKind::Lease => "leases",
            ResourceKind::Client => "clients",
            ResourceKind::Exporter => "exporters",
        }
    }
}

/// Error returned for identifiers that do not follow the expected layout.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("incorrect number of segments in identifier, expecting 4, got {0}")]
    SegmentCount(usize),
    #[error("incorrect first segment in identifier, expecting namespaces, got {0}")]
    Prefix(String),
    #[error("incorrect third segment in identifier, expecting {expected}, got {actual}")]
    Kind {
        expected: &'static str,
        actual: String,
    },
}

/// Splits an identifier into `(namespace, name)`.
///
/// # Errors
///
/// Returns [`IdentifierError`] when the identifier is not exactly
/// `namespaces/<ns>/<kind>/<name>` for the requested kind.
pub fn parse(identifier: &str, kind: ResourceKind) -> Result<(String, String), IdentifierError> {
    let segments: Vec<&str> = identifier.split('/').collect();
    if segments.len() != 4 {
        return Err(IdentifierError::SegmentCount(segments.len()));
    }
    if segments[0] != "namespaces" {
        return Err(IdentifierError::Prefix(segments[0].to_string()));
    }
    if segments[2] != kind.segment() {
        return Err(IdentifierError::Kind {
            expected: kind.segment(),
            actual: segments[2].to_string(),
        });
    }
    Ok((segments[1].to_string(), segments[3].to_string()))
}

/// Builds the identifier for `name` in `namespace`.
pub fn format(namespace: &str, kind: ResourceKind, name: &str) -> String {
    format!("namespaces/{namespace}/{}/{name}", kind.segment())
}

/// Builds the parent identifier used by list and create requests.
pub fn parent(namespace: &str) -> String {
    format!("namespaces/{namespace}")
}
