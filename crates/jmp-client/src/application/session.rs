//! Session tree reconstruction from an exporter's flat capability report.
//!
//! An exporter composes its drivers into a tree (a board with a power
//! switch and a serial console, say) but reports it as a flat list of
//! [`Report`] records, each naming its parent.  [`SessionBuilder`] turns that
//! list back into a tree of [`DriverClientNode`]s:
//!
//! 1. Order the reports so every parent precedes its children.
//! 2. Resolve each report's declared client class through the
//!    [`CapabilityRegistry`].  A known class yields a resolved node backed
//!    by a [`DriverClient`]; an unknown one yields a stub node in the same
//!    position that rejects calls.
//! 3. Attach children to their parents by declared name and return the root.
//!
//! Missing client classes are logged once per registry.  The registry is
//! built at start-up and shared by every session of the process.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use jmp_core::{topological_order, ExporterService, Report, ReportOrderError, RpcError};

/// Class path of the generic client every exporter driver can be driven with.
pub const GENERIC_CLIENT: &str = "jumpstarter.client.DriverClient";
/// Class path of composite (grouping) drivers.
pub const COMPOSITE_CLIENT: &str = "jumpstarter_driver_composite.client.CompositeClient";

/// Errors that prevent a session tree from being built.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("exporter reported no capabilities")]
    Empty,
    #[error("report uuid {0} appears more than once")]
    DuplicateUuid(Uuid),
    #[error("report {uuid} names parent {parent}, which is not in the report")]
    MissingParent { uuid: Uuid, parent: Uuid },
    #[error("reports form a cycle; {unordered} node(s) could not be ordered")]
    Cycle { unordered: usize },
    #[error("expected exactly one root report, found {0}")]
    MultipleRoots(usize),
    #[error("failed to fetch capability report: {0}")]
    Rpc(#[from] RpcError),
}

impl From<ReportOrderError> for SessionError {
    fn from(e: ReportOrderError) -> Self {
        match e {
            ReportOrderError::DuplicateUuid(uuid) => SessionError::DuplicateUuid(uuid),
            ReportOrderError::MissingParent { uuid, parent } => {
                SessionError::MissingParent { uuid, parent }
            }
            ReportOrderError::Cycle { unordered } => SessionError::Cycle { unordered },
        }
    }
}

/// Errors from calling a capability.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DriverCallError {
    #[error(
        "cannot call `{method}` on `{name}`: client class `{class_path}` is not available \
         locally; install the package that provides it"
    )]
    MissingClient {
        name: String,
        class_path: String,
        method: String,
    },
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// A local client for one exporter driver.
#[async_trait]
pub trait DriverClient: Send + Sync {
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, DriverCallError>;
}

/// Everything a factory gets to build a client for one report.
#[derive(Clone)]
pub struct DriverContext {
    pub report: Report,
    pub stub: Arc<dyn ExporterService>,
}

/// Builds a client for one report.
pub type DriverFactory = Arc<dyn Fn(DriverContext) -> Box<dyn DriverClient> + Send + Sync>;

/// Forwards every call to the exporter as a driver call.
pub struct RemoteDriverClient {
    uuid: Uuid,
    stub: Arc<dyn ExporterService>,
}

impl RemoteDriverClient {
    pub fn new(context: DriverContext) -> Self {
        Self {
            uuid: context.report.uuid,
            stub: context.stub,
        }
    }
}

#[async_trait]
impl DriverClient for RemoteDriverClient {
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, DriverCallError> {
        Ok(self
            .stub
            .driver_call(self.uuid, method.to_string(), args)
            .await?)
    }
}

/// Result of looking up a class path.
pub enum Resolution {
    Found(DriverFactory),
    NotFound,
}

/// Maps client class paths to factories.
pub struct CapabilityRegistry {
    factories: HashMap<String, DriverFactory>,
    warned: Mutex<HashSet<String>>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            warned: Mutex::new(HashSet::new()),
        }
    }

    /// A registry with the generic and composite clients registered.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for class_path in [GENERIC_CLIENT, COMPOSITE_CLIENT] {
            registry.register(class_path, |ctx| Box::new(RemoteDriverClient::new(ctx)));
        }
        registry
    }

    /// Registers `factory` for `class_path`, replacing any previous one.
    pub fn register<F>(&mut self, class_path: &str, factory: F)
    where
        F: Fn(DriverContext) -> Box<dyn DriverClient> + Send + Sync + 'static,
    {
        self.factories
            .insert(class_path.to_string(), Arc::new(factory));
    }

    pub fn resolve(&self, class_path: &str) -> Resolution {
        match self.factories.get(class_path) {
            Some(factory) => Resolution::Found(Arc::clone(factory)),
            None => Resolution::NotFound,
        }
    }

    /// Class paths that have been reported missing so far.
    pub fn missing_classes(&self) -> Vec<String> {
        let mut missing: Vec<String> = self.warned_set().iter().cloned().collect();
        missing.sort();
        missing
    }

    fn warn_missing(&self, class_path: &str) {
        if self.warned_set().insert(class_path.to_string()) {
            warn!(
                class_path,
                "client class not available locally, using a stub; calls to it will fail"
            );
        }
    }

    fn warned_set(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        match self.warned.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// How a node handles capability calls.
pub enum NodeKind {
    Resolved(Box<dyn DriverClient>),
    /// Placeholder for a client class that is not available locally.
    Stub { class_path: String },
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Resolved(_) => f.write_str("Resolved"),
            NodeKind::Stub { class_path } => {
                f.debug_struct("Stub").field("class_path", class_path).finish()
            }
        }
    }
}

/// One node of a reconstructed capability tree.  Owns its children.
#[derive(Debug)]
pub struct DriverClientNode {
    pub uuid: Uuid,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub description: Option<String>,
    pub methods_description: BTreeMap<String, String>,
    pub children: BTreeMap<String, DriverClientNode>,
    pub kind: NodeKind,
}

impl DriverClientNode {
    pub fn is_stub(&self) -> bool {
        matches!(self.kind, NodeKind::Stub { .. })
    }

    pub fn child(&self, name: &str) -> Option<&DriverClientNode> {
        self.children.get(name)
    }

    /// Looks up a descendant by dotted path, e.g. `"dut.power"`.
    pub fn find(&self, path: &str) -> Option<&DriverClientNode> {
        path.split('.')
            .filter(|segment| !segment.is_empty())
            .try_fold(self, |node, segment| node.child(segment))
    }

    /// Invokes `method` on this node's driver.
    ///
    /// # Errors
    ///
    /// Stub nodes return [`DriverCallError::MissingClient`] naming the
    /// missing class path.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, DriverCallError> {
        match &self.kind {
            NodeKind::Resolved(client) => client.call(method, args).await,
            NodeKind::Stub { class_path } => Err(DriverCallError::MissingClient {
                name: self.name.clone(),
                class_path: class_path.clone(),
                method: method.to_string(),
            }),
        }
    }

    /// Number of nodes in this subtree, including this one.
    pub fn node_count(&self) -> usize {
        1 + self
            .children
            .values()
            .map(DriverClientNode::node_count)
            .sum::<usize>()
    }
}

/// Builds session trees using a shared [`CapabilityRegistry`].
#[derive(Clone)]
pub struct SessionBuilder {
    registry: Arc<CapabilityRegistry>,
}

impl SessionBuilder {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Fetches the report from `stub` and builds the tree.
    pub async fn connect(
        &self,
        stub: Arc<dyn ExporterService>,
    ) -> Result<DriverClientNode, SessionError> {
        let reports = stub.get_report().await?;
        self.build(&reports, stub)
    }

    /// Builds the tree for `reports`, which may arrive in any order.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] when the reports do not form a single tree.
    pub fn build(
        &self,
        reports: &[Report],
        stub: Arc<dyn ExporterService>,
    ) -> Result<DriverClientNode, SessionError> {
        if reports.is_empty() {
            return Err(SessionError::Empty);
        }
        let roots = reports.iter().filter(|r| r.is_root()).count();
        if roots != 1 {
            return Err(SessionError::MultipleRoots(roots));
        }

        let order = topological_order(reports)?;
        let mut nodes: Vec<Option<DriverClientNode>> = reports.iter().map(|_| None).collect();
        for &idx in &order {
            nodes[idx] = Some(self.instantiate(&reports[idx], &stub));
        }

        let index_of: HashMap<Uuid, usize> = reports
            .iter()
            .enumerate()
            .map(|(idx, r)| (r.uuid, idx))
            .collect();

        // Children are attached deepest-first, so a node is complete before
        // it is moved into its parent.  Walking backwards also means the
        // sibling registered last keeps a contested name.
        let mut root = None;
        for &idx in order.iter().rev() {
            let Some(node) = nodes[idx].take() else {
                continue;
            };
            let parent_idx = reports[idx].parent_uuid.and_then(|p| index_of.get(&p).copied());
            match parent_idx.and_then(|p| nodes[p].as_mut()) {
                Some(parent) => {
                    if parent.children.contains_key(&node.name) {
                        warn!(
                            parent = %parent.name,
                            name = %node.name,
                            "duplicate child name, keeping the later sibling"
                        );
                        continue;
                    }
                    parent.children.insert(node.name.clone(), node);
                }
                None => root = Some(node),
            }
        }

        let root = root.ok_or(SessionError::MultipleRoots(0))?;
        debug!(nodes = root.node_count(), root = %root.name, "session tree built");
        Ok(root)
    }

    fn instantiate(&self, report: &Report, stub: &Arc<dyn ExporterService>) -> DriverClientNode {
        let class_path = report.client_class().unwrap_or("");
        let kind = match self.registry.resolve(class_path) {
            Resolution::Found(factory) => NodeKind::Resolved(factory(DriverContext {
                report: report.clone(),
                stub: Arc::clone(stub),
            })),
            Resolution::NotFound => {
                self.registry.warn_missing(class_path);
                NodeKind::Stub {
                    class_path: class_path.to_string(),
                }
            }
        };
        DriverClientNode {
            uuid: report.uuid,
            name: report.name().to_string(),
            labels: report.labels.clone(),
            description: report.description.clone(),
            methods_description: report.methods_description.clone(),
            children: BTreeMap::new(),
            kind,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
