//! Controller service contract: lease and exporter CRUD.
//!
//! Resource names passed to these methods are full identifiers built with
//! [`crate::domain::identifier::format`], e.g. `namespaces/lab/leases/abc`.
//! List and create requests take the parent, `namespaces/lab`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::exporter::{Exporter, ExporterList};
use crate::domain::lease::Lease;
use crate::protocol::error::RpcError;

/// Body of a `CreateLease` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateLeaseRequest {
    pub parent: String,
    pub selector: String,
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub begin_time: Option<DateTime<Utc>>,
}

/// Body of an `UpdateLease` call.  Only the `Some` fields are updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateLeaseRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub begin_time: Option<DateTime<Utc>>,
}

impl UpdateLeaseRequest {
    /// Field mask paths for the fields this request changes.
    pub fn update_mask(&self) -> Vec<&'static str> {
        let mut mask = Vec::new();
        if self.duration.is_some() {
            mask.push("duration");
        }
        if self.begin_time.is_some() {
            mask.push("begin_time");
        }
        mask
    }
}

/// Paging and filtering for list calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRequest {
    pub parent: String,
    /// Label filter in selector syntax.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_token: Option<String>,
}

/// One page of a `ListLeases` response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseList {
    pub leases: Vec<Lease>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

/// The controller's client-facing service.
#[async_trait]
pub trait ControllerService: Send + Sync {
    async fn create_lease(&self, request: CreateLeaseRequest) -> Result<Lease, RpcError>;

    async fn get_lease(&self, name: String) -> Result<Lease, RpcError>;

    async fn list_leases(&self, request: ListRequest) -> Result<LeaseList, RpcError>;

    async fn update_lease(&self, request: UpdateLeaseRequest) -> Result<Lease, RpcError>;

    async fn delete_lease(&self, name: String) -> Result<(), RpcError>;

    async fn list_exporters(&self, request: ListRequest) -> Result<ExporterList, RpcError>;

    async fn get_exporter(&self, name: String) -> Result<Exporter, RpcError>;
}
