//! Capability reports and the order in which a report tree is rebuilt.
//!
//! An exporter describes its composed driver tree through `GetReport` as a
//! *flat* list of [`Report`] records.  Each record names its parent by UUID;
//! the root has no parent.  The wire list is **not** guaranteed to be
//! parent-before-child, so [`topological_order`] computes an order in which
//! every parent is visited strictly before its children.
//!
//! ```text
//! wire:   [ C(parent A), A(root), B(parent A) ]
//! order:  [ A, C, B ]
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Label carrying the client class path declared by the exporter.
pub const LABEL_CLIENT: &str = "jumpstarter.dev/client";
/// Label carrying the node's name within its parent.
pub const LABEL_NAME: &str = "jumpstarter.dev/name";

/// One node of an exporter's capability tree, as sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub uuid: Uuid,
    /// Parent node; an empty string on the wire means "root".
    #[serde(default, deserialize_with = "empty_as_none")]
    pub parent_uuid: Option<Uuid>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub methods_description: BTreeMap<String, String>,
}

impl Report {
    /// Declared name of this node within its parent, or `""` when missing.
    pub fn name(&self) -> &str {
        self.labels.get(LABEL_NAME).map(String::as_str).unwrap_or("")
    }

    /// Declared client class path, if the exporter sent one.
    pub fn client_class(&self) -> Option<&str> {
        self.labels.get(LABEL_CLIENT).map(String::as_str)
    }

    /// True for the node without a parent.
    pub fn is_root(&self) -> bool {
        self.parent_uuid.is_none()
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<Uuid>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => Uuid::parse_str(s)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Structural problems that prevent a report list from forming a tree.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReportOrderError {
    #[error("report uuid {0} appears more than once")]
    DuplicateUuid(Uuid),
    #[error("report {uuid} names parent {parent}, which is not in the report")]
    MissingParent { uuid: Uuid, parent: Uuid },
    #[error("reports form a cycle; {unordered} node(s) could not be ordered")]
    Cycle { unordered: usize },
}

/// Returns indices into `reports` such that every parent precedes its children.
///
/// Roots are visited in wire order, and siblings keep their relative wire
/// order, so the result is deterministic for a given input.
///
/// # Errors
///
/// Returns [`ReportOrderError`] on duplicate UUIDs, dangling parent
/// references, or parent cycles.
pub fn topological_order(reports: &[Report]) -> Result<Vec<usize>, ReportOrderError> {
    let mut index_of: HashMap<Uuid, usize> = HashMap::with_capacity(reports.len());
    for (idx, report) in reports.iter().enumerate() {
        if index_of.insert(report.uuid, idx).is_some() {
            return Err(ReportOrderError::DuplicateUuid(report.uuid));
        }
    }

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); reports.len()];
    let mut queue = VecDeque::new();
    for (idx, report) in reports.iter().enumerate() {
        match report.parent_uuid {
            None => queue.push_back(idx),
            Some(parent) => {
                let Some(&parent_idx) = index_of.get(&parent) else {
                    return Err(ReportOrderError::MissingParent {
                        uuid: report.uuid,
                        parent,
                    });
                };
                children[parent_idx].push(idx);
            }
        }
    }

    let mut order = Vec::with_capacity(reports.len());
    while let Some(idx) = queue.pop_front() {
        order.push(idx);
        queue.extend(children[idx].iter().copied());
    }

    if order.len() != reports.len() {
        return Err(ReportOrderError::Cycle {
            unordered: reports.len() - order.len(),
        });
    }
    Ok(order)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn report(uuid: u128, parent: Option<u128>, name: &str) -> Report {
        Report {
            uuid: Uuid::from_u128(uuid),
            parent_uuid: parent.map(Uuid::from_u128),
            labels: [(LABEL_NAME.to_string(), name.to_string())].into(),
            description: None,
            methods_description: BTreeMap::new(),
        }
    }

    fn names(reports: &[Report], order: &[usize]) -> Vec<String> {
        order.iter().map(|&i| reports[i].name().to_string()).collect()
    }

    #[test]
    fn test_order_puts_parent_before_child_when_wire_order_is_reversed() {
        // Arrange: child C arrives before its parent A
        let reports = vec![
            report(3, Some(1), "serial"),
            report(1, None, "root"),
            report(2, Some(1), "power"),
        ];

        // Act
        let order = topological_order(&reports).unwrap();

        // Assert
        assert_eq!(names(&reports, &order), ["root", "serial", "power"]);
    }

    #[test]
    fn test_order_handles_deep_chains_in_any_order() {
        let reports = vec![
            report(4, Some(3), "d"),
            report(3, Some(2), "c"),
            report(2, Some(1), "b"),
            report(1, None, "a"),
        ];
        let order = topological_order(&reports).unwrap();
        assert_eq!(names(&reports, &order), ["a", "b", "c", "d"]);
    }

    #[test]
    fn test_order_empty_input_is_empty() {
        assert_eq!(topological_order(&[]).unwrap(), Vec::<usize>::new());
    }

    #[test]
    fn test_order_rejects_duplicate_uuid() {
        let reports = vec![report(1, None, "a"), report(1, None, "b")];
        assert_eq!(
            topological_order(&reports),
            Err(ReportOrderError::DuplicateUuid(Uuid::from_u128(1)))
        );
    }

    #[test]
    fn test_order_rejects_missing_parent() {
        let reports = vec![report(1, None, "a"), report(2, Some(9), "b")];
        assert!(matches!(
            topological_order(&reports),
            Err(ReportOrderError::MissingParent { .. })
        ));
    }

    #[test]
    fn test_order_rejects_cycles() {
        let reports = vec![
            report(1, None, "root"),
            report(2, Some(3), "x"),
            report(3, Some(2), "y"),
        ];
        assert_eq!(
            topological_order(&reports),
            Err(ReportOrderError::Cycle { unordered: 2 })
        );
    }

    #[test]
    fn test_deserialize_empty_parent_as_root() {
        let json = r#"{
            "uuid": "00000000-0000-0000-0000-000000000001",
            "parent_uuid": "",
            "labels": {"jumpstarter.dev/name": "root", "jumpstarter.dev/client": "jumpstarter.client.DriverClient"}
        }"#;
        let report: Report = serde_json::from_str(json).unwrap();
        assert!(report.is_root());
        assert_eq!(report.name(), "root");
        assert_eq!(report.client_class(), Some("jumpstarter.client.DriverClient"));
    }
}
