//! Exporter service contract: capability report, status, and driver calls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::report::Report;
use crate::domain::status::ExporterStatus;
use crate::protocol::error::RpcError;

/// Response of `GetStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: ExporterStatus,
    /// Incremented by the exporter on every status change.
    pub status_version: u64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<ExporterStatus>,
}

/// The exporter's client-facing service.
///
/// Older exporters do not implement `get_status`; they answer with
/// [`crate::RpcCode::Unimplemented`].
#[async_trait]
pub trait ExporterService: Send + Sync {
    /// Returns the flat capability report, in arbitrary order.
    async fn get_report(&self) -> Result<Vec<Report>, RpcError>;

    async fn get_status(&self) -> Result<StatusResponse, RpcError>;

    /// Invokes `method` on the driver identified by `uuid`.
    async fn driver_call(
        &self,
        uuid: Uuid,
        method: String,
        args: Vec<Value>,
    ) -> Result<Value, RpcError>;
}
