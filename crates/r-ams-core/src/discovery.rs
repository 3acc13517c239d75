//! ---
//! ams_section: "05-linking-core"
//! ams_subsection: "module"
//! ams_type: "source"
//! ams_scope: "code"
//! ams_description: "Agent linking and update routing."
//! ams_version: "v0.0.0-prealpha"
//! ams_owner: "tbd"
//! ---
//! Background tasks for asset discovery, asset import and instance discovery.
//!
//! At most one discovery or import task runs per agent. The busy marker is owned by
//! the spawned task, so it is released on completion, failure, timeout or abort.
//! Cancelling an agent's task frees its slot immediately.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use r_ams_metrics::LinkingMetrics;
use tokio::runtime::Handle;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::error::DiscoveryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    AssetDiscovery,
    AssetImport,
    InstanceDiscovery,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::AssetDiscovery => "asset_discovery",
            TaskKind::AssetImport => "asset_import",
            TaskKind::InstanceDiscovery => "instance_discovery",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

impl TaskOutcome {
    fn label(&self) -> &'static str {
        match self {
            TaskOutcome::Completed => "completed",
            TaskOutcome::Failed(_) => "failed",
            TaskOutcome::Cancelled => "cancelled",
        }
    }
}

/// Handle to a running discovery task. Dropping it leaves the task running.
#[derive(Debug)]
pub struct TaskHandle {
    target: String,
    kind: TaskKind,
    handle: JoinHandle<TaskOutcome>,
}

impl TaskHandle {
    /// Agent id, or parent asset id for instance discovery.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn join(self) -> TaskOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(err) if err.is_cancelled() => TaskOutcome::Cancelled,
            Err(err) => TaskOutcome::Failed(err.to_string()),
        }
    }
}

type BusyMap = Arc<Mutex<HashMap<String, BusyEntry>>>;

struct BusyEntry {
    token: u64,
    abort: Option<AbortHandle>,
}

/// Releases the agent's slot when the task ends, unless the slot was already
/// cancelled and handed on.
struct BusyGuard {
    busy: BusyMap,
    agent_id: String,
    token: u64,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let mut busy = self.busy.lock();
        if busy.get(&self.agent_id).is_some_and(|entry| entry.token == self.token) {
            busy.remove(&self.agent_id);
            debug!(agent_id = %self.agent_id, "discovery slot released");
        }
    }
}

/// Records a cancellation when the task future is dropped before producing an outcome.
struct CancelGuard {
    target: String,
    kind: TaskKind,
    metrics: Option<LinkingMetrics>,
    armed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        info!(target_id = %self.target, kind = %self.kind, "discovery task cancelled");
        if let Some(metrics) = &self.metrics {
            metrics.record_discovery(self.kind.as_str(), TaskOutcome::Cancelled.label());
        }
    }
}

pub struct DiscoveryRunner {
    busy: BusyMap,
    detached: Mutex<Vec<AbortHandle>>,
    next_token: AtomicU64,
    timeout: Option<Duration>,
    metrics: Option<LinkingMetrics>,
}

impl DiscoveryRunner {
    pub fn new(timeout: Option<Duration>, metrics: Option<LinkingMetrics>) -> Self {
        Self {
            busy: Arc::new(Mutex::new(HashMap::new())),
            detached: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(1),
            timeout,
            metrics,
        }
    }

    pub fn is_busy(&self, agent_id: &str) -> bool {
        self.busy.lock().contains_key(agent_id)
    }

    /// Spawn `task` for `agent_id`, refusing when a task is already running for it.
    pub fn run_exclusive<F>(
        &self,
        agent_id: &str,
        kind: TaskKind,
        task: F,
    ) -> Result<TaskHandle, DiscoveryError>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| DiscoveryError::NoRuntime)?;
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        {
            let mut busy = self.busy.lock();
            if busy.contains_key(agent_id) {
                return Err(DiscoveryError::AlreadyRunning(agent_id.to_owned()));
            }
            busy.insert(agent_id.to_owned(), BusyEntry { token, abort: None });
        }
        let guard = BusyGuard {
            busy: self.busy.clone(),
            agent_id: agent_id.to_owned(),
            token,
        };
        let wrapped = self.instrument(agent_id, kind, task);
        let handle = runtime.spawn(async move {
            let _guard = guard;
            wrapped.await
        });
        if let Some(entry) = self.busy.lock().get_mut(agent_id) {
            if entry.token == token {
                entry.abort = Some(handle.abort_handle());
            }
        }
        Ok(TaskHandle {
            target: agent_id.to_owned(),
            kind,
            handle,
        })
    }

    /// Spawn `task` without taking the per-agent slot.
    pub fn run_detached<F>(
        &self,
        target: &str,
        kind: TaskKind,
        task: F,
    ) -> Result<TaskHandle, DiscoveryError>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| DiscoveryError::NoRuntime)?;
        let handle = runtime.spawn(self.instrument(target, kind, task));
        let mut detached = self.detached.lock();
        detached.retain(|abort| !abort.is_finished());
        detached.push(handle.abort_handle());
        Ok(TaskHandle {
            target: target.to_owned(),
            kind,
            handle,
        })
    }

    /// Abort the discovery or import task running for `agent_id` and free its slot.
    ///
    /// Returns whether a task was running.
    pub fn cancel(&self, agent_id: &str) -> bool {
        let Some(entry) = self.busy.lock().remove(agent_id) else {
            return false;
        };
        if let Some(abort) = entry.abort {
            abort.abort();
        }
        debug!(agent_id, "discovery task aborted");
        true
    }

    /// Abort every task this runner spawned.
    pub fn cancel_all(&self) {
        let entries: Vec<BusyEntry> = self.busy.lock().drain().map(|(_, entry)| entry).collect();
        for abort in entries.into_iter().filter_map(|entry| entry.abort) {
            abort.abort();
        }
        for abort in self.detached.lock().drain(..) {
            abort.abort();
        }
    }

    fn instrument<F>(
        &self,
        target: &str,
        kind: TaskKind,
        task: F,
    ) -> impl Future<Output = TaskOutcome> + Send + 'static
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let target = target.to_owned();
        let timeout = self.timeout;
        let metrics = self.metrics.clone();
        let mut cancel = CancelGuard {
            target: target.clone(),
            kind,
            metrics: metrics.clone(),
            armed: true,
        };
        async move {
            info!(target_id = %target, %kind, "discovery task started");
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, task).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("timed out after {}s", limit.as_secs_f64())),
                },
                None => task.await,
            };
            cancel.armed = false;
            let outcome = match result {
                Ok(()) => {
                    info!(target_id = %target, %kind, "discovery task completed");
                    TaskOutcome::Completed
                }
                Err(err) => {
                    warn!(target_id = %target, %kind, error = %err, "discovery task failed");
                    TaskOutcome::Failed(err.to_string())
                }
            };
            if let Some(metrics) = &metrics {
                metrics.record_discovery(kind.as_str(), outcome.label());
            }
            outcome
        }
    }
}
