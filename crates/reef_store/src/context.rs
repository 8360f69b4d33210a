//! Cluster context and per-request runtime environments.
//!
//! One `Context` lives for the life of the node. Each request builds a
//! `RuntimeEnvironment` from it: metadata snapshots for the worker thread,
//! a fresh scripting runner, and an interrupt signal derived from the
//! request interruptor.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::ql::Scopes;

/// Stable identifier of the local machine within the cluster.
pub type MachineId = u64;

/// Raised when the interrupt signal fires during a blocking operation.
/// Carried inside `anyhow::Error`; callers downcast to distinguish it from
/// ordinary failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation interrupted")
    }
}

impl std::error::Error for Interrupted {}

/// Per-namespace metadata the dispatch layer consults.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceMetadata {
    pub name: String,
    pub primary_key: String,
}

/// Metadata for every namespace in the cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespacesMetadata {
    pub namespaces: BTreeMap<String, NamespaceMetadata>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseMetadata {
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabasesMetadata {
    pub databases: BTreeMap<String, DatabaseMetadata>,
}

/// Full cluster metadata, shared by handle.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClusterMetadata {
    pub epoch: u64,
    pub machines: BTreeMap<MachineId, String>,
}

/// Publishes immutable metadata snapshots. Readers take an `Arc` clone of
/// the current snapshot in O(1); publishers swap the pointer.
pub struct MetadataView<T> {
    current: RwLock<Arc<T>>,
}

impl<T> MetadataView<T> {
    pub fn new(initial: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    /// Current snapshot. The returned `Arc` stays valid across later
    /// publishes.
    pub fn snapshot(&self) -> Arc<T> {
        self.current.read().expect("metadata view poisoned").clone()
    }

    /// Replace the snapshot seen by subsequent readers.
    pub fn publish(&self, next: T) {
        *self.current.write().expect("metadata view poisoned") = Arc::new(next);
    }
}

/// Handle to the pool of external worker processes backing the scripting
/// runtime. Opaque to this core; it only hands out runners.
pub struct ExtprocPool {
    runner_seq: AtomicU64,
}

impl ExtprocPool {
    pub fn new() -> Self {
        Self {
            runner_seq: AtomicU64::new(1),
        }
    }

    /// A freshly constructed scripting runner. One per request environment;
    /// never shared across requests.
    pub fn runner(self: &Arc<Self>) -> ScriptRunner {
        ScriptRunner {
            id: self.runner_seq.fetch_add(1, Ordering::Relaxed),
            pool: Arc::clone(self),
        }
    }
}

impl Default for ExtprocPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Owned handle to one scripting-runtime instance.
pub struct ScriptRunner {
    id: u64,
    #[allow(dead_code)]
    pool: Arc<ExtprocPool>,
}

impl fmt::Debug for ScriptRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptRunner").field("id", &self.id).finish()
    }
}

/// Lookup handle over the namespace metadata view.
pub struct NamespaceRepo {
    namespaces: Arc<MetadataView<NamespacesMetadata>>,
}

impl NamespaceRepo {
    pub fn new(namespaces: Arc<MetadataView<NamespacesMetadata>>) -> Self {
        Self { namespaces }
    }

    pub fn namespace(&self, name: &str) -> Option<NamespaceMetadata> {
        self.namespaces.snapshot().namespaces.get(name).cloned()
    }
}

/// Node-lifetime context threaded into every store.
pub struct Context {
    pub extproc_pool: Arc<ExtprocPool>,
    pub ns_repo: Arc<NamespaceRepo>,
    pub namespaces: Arc<MetadataView<NamespacesMetadata>>,
    pub databases: Arc<MetadataView<DatabasesMetadata>>,
    pub cluster_metadata: Arc<RwLock<ClusterMetadata>>,
    pub interruptor: CancellationToken,
    pub machine_id: MachineId,
}

impl Context {
    pub fn new(machine_id: MachineId) -> Self {
        let namespaces = Arc::new(MetadataView::new(NamespacesMetadata::default()));
        Self {
            extproc_pool: Arc::new(ExtprocPool::new()),
            ns_repo: Arc::new(NamespaceRepo::new(Arc::clone(&namespaces))),
            namespaces,
            databases: Arc::new(MetadataView::new(DatabasesMetadata::default())),
            cluster_metadata: Arc::new(RwLock::new(ClusterMetadata::default())),
            interruptor: CancellationToken::new(),
            machine_id,
        }
    }

    /// Build the evaluation environment for one request. Bound to the
    /// calling worker thread: the metadata snapshots are that thread's
    /// projections and must not be shared across threads mid-request.
    pub fn runtime_environment(&self) -> RuntimeEnvironment {
        RuntimeEnvironment {
            scopes: Scopes::new(),
            extproc_pool: Arc::clone(&self.extproc_pool),
            ns_repo: Arc::clone(&self.ns_repo),
            namespaces: self.namespaces.snapshot(),
            databases: self.databases.snapshot(),
            cluster_metadata: Arc::clone(&self.cluster_metadata),
            script: self.extproc_pool.runner(),
            interruptor: self.interruptor.child_token(),
            machine_id: self.machine_id,
        }
    }
}

/// Per-request evaluation context, torn down when the request completes.
pub struct RuntimeEnvironment {
    pub scopes: Scopes,
    pub extproc_pool: Arc<ExtprocPool>,
    pub ns_repo: Arc<NamespaceRepo>,
    pub namespaces: Arc<NamespacesMetadata>,
    pub databases: Arc<DatabasesMetadata>,
    pub cluster_metadata: Arc<RwLock<ClusterMetadata>>,
    pub script: ScriptRunner,
    pub interruptor: CancellationToken,
    pub machine_id: MachineId,
}
