//! Kernel supervisor: the Core-side owner of kernels.
//!
//! Builds kernels against the shared [`ResourceLedger`], tracks them by id,
//! records completed runs in the VM database, replaces poisoned kernels and
//! retires a kernel on its own once its VM link closes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{SourceUnit, Value};
use crate::kernel::{
    CallOptions, ExecutionResult, KernelConfig, KernelError, KernelHealth, KernelState,
    OutputRecord, SandboxKernel,
};
use crate::ledger::{CoreHandle, ResourceLedger};
use crate::link::{LinkPayload, LinkRequest, VmLink};
use crate::types::KernelId;
use crate::vmdb::{VmDbEntry, VmStore, VmStoreError};

/// Supervisor failures.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The kernel reported an error.
    #[error(transparent)]
    Kernel(#[from] KernelError),
    /// The VM database failed.
    #[error(transparent)]
    Store(#[from] VmStoreError),
    /// No live kernel has this id.
    #[error("no live kernel {0}")]
    UnknownKernel(KernelId),
}

/// Outcome of replacing one poisoned kernel.
#[derive(Debug)]
pub struct Replacement {
    /// Kernel that was retired.
    pub retired: KernelId,
    /// New kernel on the same link, or why it could not be built.
    pub replacement: Result<KernelId, SupervisorError>,
}

/// Owner of every live kernel on this host.
pub struct KernelSupervisor {
    config: KernelConfig,
    ledger: Arc<ResourceLedger>,
    store: Arc<dyn VmStore>,
    kernels: RwLock<HashMap<KernelId, Arc<SandboxKernel>>>,
    watchers: Mutex<HashMap<KernelId, JoinHandle<()>>>,
}

impl std::fmt::Debug for KernelSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelSupervisor")
            .field("modules", &self.config.modules)
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl KernelSupervisor {
    /// Create a supervisor. Every kernel it builds uses `config`.
    pub fn new(
        config: KernelConfig,
        ledger: Arc<ResourceLedger>,
        store: Arc<dyn VmStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            ledger,
            store,
            kernels: RwLock::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
        })
    }

    /// Shared resource ledger.
    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    /// Build a kernel for the VM behind `link`, registering the VM in the
    /// database on first sight.
    ///
    /// # Errors
    ///
    /// Returns the kernel construction error or a database error.
    pub async fn spawn(
        self: &Arc<Self>,
        link: Arc<dyn VmLink>,
    ) -> Result<Arc<SandboxKernel>, SupervisorError> {
        let entry = self.vm_entry(link.vm_id()).await?;
        let core: Arc<dyn CoreHandle> = Arc::clone(&self.ledger) as Arc<dyn CoreHandle>;
        let kernel = SandboxKernel::new(self.config.clone(), core, link)?
            .with_db_entry(Arc::new(entry));
        let kernel = Arc::new(kernel);

        self.kernels
            .write()
            .await
            .insert(kernel.id(), Arc::clone(&kernel));
        self.watch_link(&kernel);
        notify(&kernel, &KernelState::Ready);
        info!(kernel = %kernel.id(), vm = kernel.link().vm_id(), "kernel spawned");
        Ok(kernel)
    }

    /// Live kernel by id.
    pub async fn get(&self, id: KernelId) -> Option<Arc<SandboxKernel>> {
        self.kernels.read().await.get(&id).cloned()
    }

    /// Number of live kernels.
    pub async fn len(&self) -> usize {
        self.kernels.read().await.len()
    }

    /// Whether no kernel is live.
    pub async fn is_empty(&self) -> bool {
        self.kernels.read().await.is_empty()
    }

    /// Evaluate `unit` in a kernel and count the run on success.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::UnknownKernel`] or the kernel's error.
    pub async fn run(
        &self,
        id: KernelId,
        unit: SourceUnit,
        opts: CallOptions,
    ) -> Result<ExecutionResult, SupervisorError> {
        let kernel = self.get(id).await.ok_or(SupervisorError::UnknownKernel(id))?;
        let outcome = kernel.run_with(unit, opts).await;
        self.account(&kernel, outcome).await
    }

    /// Call a guest entry point in a kernel and count the run on success.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::UnknownKernel`] or the kernel's error.
    pub async fn call(
        &self,
        id: KernelId,
        entry: &str,
        args: Vec<Value>,
        opts: CallOptions,
    ) -> Result<ExecutionResult, SupervisorError> {
        let kernel = self.get(id).await.ok_or(SupervisorError::UnknownKernel(id))?;
        let outcome = kernel.call(entry, args, opts).await;
        self.account(&kernel, outcome).await
    }

    /// Shut a kernel down and return its remaining output.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::UnknownKernel`] or the shutdown error.
    pub async fn retire(&self, id: KernelId) -> Result<Vec<OutputRecord>, SupervisorError> {
        let kernel = self
            .kernels
            .write()
            .await
            .remove(&id)
            .ok_or(SupervisorError::UnknownKernel(id))?;
        let watcher = self.watchers().remove(&id);
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        let output = kernel.shutdown().await?;
        notify(&kernel, &KernelState::Retired);
        info!(kernel = %id, records = output.len(), "kernel retired");
        Ok(output)
    }

    /// Retire every live kernel.
    pub async fn retire_all(&self) -> Vec<(KernelId, Result<Vec<OutputRecord>, SupervisorError>)> {
        let ids: Vec<KernelId> = self.kernels.read().await.keys().copied().collect();
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let outcome = self.retire(id).await;
            results.push((id, outcome));
        }
        results
    }

    /// Health of every live kernel.
    pub async fn health(&self) -> Vec<KernelHealth> {
        let kernels: Vec<Arc<SandboxKernel>> = self.kernels.read().await.values().cloned().collect();
        kernels.iter().map(|k| k.health()).collect()
    }

    /// Retire every poisoned kernel and build a fresh one on the same link.
    pub async fn replace_poisoned(self: &Arc<Self>) -> Vec<Replacement> {
        let poisoned: Vec<Arc<SandboxKernel>> = self
            .kernels
            .read()
            .await
            .values()
            .filter(|k| k.is_poisoned())
            .cloned()
            .collect();

        let mut report = Vec::with_capacity(poisoned.len());
        for kernel in poisoned {
            let retired = kernel.id();
            let link = Arc::clone(kernel.link());
            drop(kernel);
            if let Err(e) = self.retire(retired).await {
                warn!(kernel = %retired, error = %e, "retiring poisoned kernel failed");
            }
            let replacement = self.spawn(link).await.map(|k| k.id());
            match &replacement {
                Ok(new) => info!(old = %retired, new = %new, "poisoned kernel replaced"),
                Err(e) => warn!(old = %retired, error = %e, "poisoned kernel could not be replaced"),
            }
            report.push(Replacement {
                retired,
                replacement,
            });
        }
        report
    }

    async fn vm_entry(&self, vm_id: &str) -> Result<VmDbEntry, SupervisorError> {
        if let Some(entry) = self.store.get(vm_id).await? {
            return Ok(entry);
        }
        let entry = VmDbEntry::new(vm_id, vm_id);
        match self.store.insert(&entry).await {
            Ok(()) => {
                debug!(vm = vm_id, "vm registered");
                Ok(entry)
            }
            // Another spawn registered it concurrently.
            Err(VmStoreError::Duplicate(_)) => self
                .store
                .get(vm_id)
                .await?
                .ok_or_else(|| VmStoreError::NotFound(vm_id.to_owned()).into()),
            Err(e) => Err(e.into()),
        }
    }

    async fn account(
        &self,
        kernel: &SandboxKernel,
        outcome: Result<ExecutionResult, KernelError>,
    ) -> Result<ExecutionResult, SupervisorError> {
        match outcome {
            Ok(result) => {
                if let Some(entry) = kernel.db_entry() {
                    if let Err(e) = self.store.record_run(&entry.id, Utc::now()).await {
                        warn!(kernel = %kernel.id(), vm = %entry.id, error = %e, "failed to record run");
                    }
                }
                Ok(result)
            }
            Err(e) => {
                if e.is_terminal() {
                    warn!(kernel = %kernel.id(), error = %e, "kernel needs replacement");
                }
                Err(e.into())
            }
        }
    }

    fn watch_link(self: &Arc<Self>, kernel: &Arc<SandboxKernel>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let link = Arc::clone(kernel.link());
        let id = kernel.id();
        // Hold the map lock across spawn so the watcher cannot detach itself
        // before its handle is stored.
        let mut watchers = self.watchers();
        let handle = tokio::spawn(async move {
            link.closed().await;
            let Some(supervisor) = weak.upgrade() else {
                return;
            };
            supervisor.watchers().remove(&id);
            info!(kernel = %id, vm = link.vm_id(), "vm link closed, retiring kernel");
            if let Err(e) = supervisor.retire(id).await {
                debug!(kernel = %id, error = %e, "auto-retire skipped");
            }
        });
        watchers.insert(id, handle);
    }

    fn watchers(&self) -> MutexGuard<'_, HashMap<KernelId, JoinHandle<()>>> {
        self.watchers.lock().unwrap_or_else(|poisoned| {
            warn!("watcher map lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl Drop for KernelSupervisor {
    fn drop(&mut self) {
        for (_, watcher) in self.watchers().drain() {
            watcher.abort();
        }
    }
}

/// Tell the outer process about a lifecycle change. Best effort.
fn notify(kernel: &SandboxKernel, state: &KernelState) {
    let link = Arc::clone(kernel.link());
    if !link.is_connected() {
        return;
    }
    let request = LinkRequest::new(
        kernel.id(),
        LinkPayload::Lifecycle {
            state: state.label().to_owned(),
        },
    );
    tokio::spawn(async move {
        if let Err(e) = link.request(request).await {
            debug!(error = %e, "lifecycle notification not delivered");
        }
    });
}
