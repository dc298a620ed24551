//! The controller's view of a registered exporter.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::selector::Selector;

/// An exporter as listed by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exporter {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Exporter {
    /// Returns true when the exporter's labels satisfy `selector`.
    pub fn matches(&self, selector: &Selector) -> bool {
        selector.matches(&self.labels)
    }
}

/// One page of a `ListExporters` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExporterList {
    pub exporters: Vec<Exporter>,
    /// Token for the next page; `None` on the last page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}
