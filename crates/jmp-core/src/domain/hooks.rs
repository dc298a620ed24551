//! Identifiers handed to the external hook executor.
//!
//! Hooks are scripts an exporter runs before and after each lease.  This
//! core never runs them.  It only assembles the identifiers the executor
//! exposes to the scripts as environment variables.

use std::collections::BTreeMap;
use std::time::Duration;

/// Environment variable carrying the local session endpoint.
pub const ENV_HOST: &str = "JUMPSTARTER_HOST";
pub const ENV_LEASE_NAME: &str = "LEASE_NAME";
pub const ENV_CLIENT_NAME: &str = "CLIENT_NAME";
pub const ENV_LEASE_DURATION: &str = "LEASE_DURATION";
pub const ENV_EXPORTER_NAME: &str = "EXPORTER_NAME";
pub const ENV_EXPORTER_NAMESPACE: &str = "EXPORTER_NAMESPACE";

/// Everything a hook needs to know about the lease it runs for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookContext {
    pub lease_name: String,
    pub client_name: String,
    pub lease_duration: Duration,
    pub exporter_name: String,
    pub exporter_namespace: String,
    /// Local endpoint of the session (e.g. a unix socket path).
    pub session_endpoint: String,
}

impl HookContext {
    /// Renders the context as environment variables.
    ///
    /// The lease duration is rendered in whole seconds.
    pub fn to_env(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (ENV_HOST.to_string(), self.session_endpoint.clone()),
            (ENV_LEASE_NAME.to_string(), self.lease_name.clone()),
            (ENV_CLIENT_NAME.to_string(), self.client_name.clone()),
            (
                ENV_LEASE_DURATION.to_string(),
                self.lease_duration.as_secs().to_string(),
            ),
            (ENV_EXPORTER_NAME.to_string(), self.exporter_name.clone()),
            (
                ENV_EXPORTER_NAMESPACE.to_string(),
                self.exporter_namespace.clone(),
            ),
        ])
    }
}
