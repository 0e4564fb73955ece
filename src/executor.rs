//! Per-resource action serialization.
//!
//! Hardware that cannot perform two things at once (a motor controller, a camera SDK
//! handle) gets one [`ResourceWorker`]: a dedicated task draining a FIFO queue, so that
//! actions submitted to the same resource never overlap and run in submission order.
//!
//! # Design
//!
//! - One queue task per resource, fed through a bounded `mpsc` channel
//! - Actions cancelled while queued are skipped; their bodies never run
//! - `stop()` cancels everything outstanding (queued and running)
//! - `shutdown()` closes the queue, stops, waits for the task with a timeout and aborts
//!   whatever is left
//!
//! Several components may share a resource (e.g. two axes behind one controller). The
//! [`ExecutorPool`] hands out one worker per resource name and tracks which components
//! are bound to which resource.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::action::{Action, ActionFuture, ActionHandle, ActionOutput, ActionState};
use crate::error::{DaqError, DaqResult};

/// Capacity of a resource queue before `submit` waits.
pub const QUEUE_CAPACITY: usize = 64;

/// Queued unit: drives one action to a terminal state.
struct QueuedAction {
    name: String,
    job: BoxFuture<'static, ()>,
}

/// Serializes the actions of one resource.
pub struct ResourceWorker {
    resource: String,
    job_tx: Mutex<Option<mpsc::Sender<QueuedAction>>>,
    outstanding: Mutex<Vec<Arc<dyn ActionHandle>>>,
    queue_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ResourceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceWorker")
            .field("resource", &self.resource)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ResourceWorker {
    /// Spawn the queue task for `resource`. Must be called within a Tokio runtime.
    pub fn spawn(resource: impl Into<String>) -> Arc<Self> {
        let resource = resource.into();
        let (job_tx, job_rx) = mpsc::channel(QUEUE_CAPACITY);
        let queue_task = tokio::spawn(Self::run_queue(resource.clone(), job_rx));
        debug!(resource = %resource, "Created resource worker");
        Arc::new(Self {
            resource,
            job_tx: Mutex::new(Some(job_tx)),
            outstanding: Mutex::new(Vec::new()),
            queue_task: Mutex::new(Some(queue_task)),
        })
    }

    /// Resource name.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// True once the worker was shut down.
    pub fn is_closed(&self) -> bool {
        self.job_tx.lock().is_none()
    }

    /// Queue an action. The returned handle is `Pending` until the worker reaches it.
    ///
    /// # Errors
    /// [`DaqError::ComponentTerminated`] if the worker was shut down.
    pub async fn submit<T: ActionOutput>(&self, action: Action<T>) -> DaqResult<ActionFuture<T>> {
        let (future, body) = action.into_parts(Some(self.resource.clone()));
        let driver = future.clone();
        let queued = QueuedAction {
            name: future.name().to_string(),
            job: async move { driver.drive(body).await }.boxed(),
        };

        // registered under the sender lock: once `shutdown` took the sender, every action
        // that got through is visible to its `stop`
        let job_tx = {
            let job_tx = self.job_tx.lock();
            let job_tx = job_tx
                .clone()
                .ok_or_else(|| DaqError::ComponentTerminated(self.resource.clone()))?;
            let mut outstanding = self.outstanding.lock();
            outstanding.retain(|a| !a.state().is_terminal());
            outstanding.push(Arc::new(future.clone()));
            job_tx
        };

        trace!(resource = %self.resource, action = %future.name(), id = %future.id(), "Queued action");
        if job_tx.send(queued).await.is_err() {
            let reason = DaqError::ComponentTerminated(self.resource.clone());
            future.abort(reason.clone());
            return Err(reason);
        }
        Ok(future)
    }

    /// Number of queued or running actions.
    pub fn outstanding(&self) -> usize {
        let mut outstanding = self.outstanding.lock();
        outstanding.retain(|a| !a.state().is_terminal());
        outstanding.len()
    }

    /// Cancel every queued and running action. Returns how many ended cancelled.
    ///
    /// Running actions without a cancel hook keep going; the queue stays open.
    pub async fn stop(&self) -> usize {
        let actions: Vec<_> = std::mem::take(&mut *self.outstanding.lock());
        // newest first, so queued actions are gone before the running one is interrupted
        let mut cancelled = 0;
        let mut survivors = Vec::new();
        for action in actions.into_iter().rev() {
            if action.state().is_terminal() {
                continue;
            }
            if action.cancel_boxed().await {
                cancelled += 1;
            } else if action.state() == ActionState::Running {
                warn!(resource = %self.resource, action = %action.name(), "Running action ignored stop");
                survivors.push(action);
            }
        }
        self.outstanding.lock().extend(survivors);
        if cancelled > 0 {
            info!(resource = %self.resource, cancelled, "Stopped resource");
        }
        cancelled
    }

    /// Force every outstanding action into a terminal state, aborting running bodies.
    /// Returns how many actions were still outstanding.
    pub fn abort_outstanding(&self) -> usize {
        let actions: Vec<_> = std::mem::take(&mut *self.outstanding.lock());
        let reason = DaqError::ComponentTerminated(self.resource.clone());
        let aborted = actions
            .iter()
            .filter(|action| action.abort(reason.clone()))
            .count();
        if aborted > 0 {
            warn!(resource = %self.resource, aborted, "Aborted outstanding actions");
        }
        aborted
    }

    /// Close the queue, stop all actions and wait for the queue task.
    ///
    /// Whatever is still outstanding when the task ends (or the timeout expires) is
    /// aborted, so every submitted action ends in a terminal state.
    ///
    /// # Errors
    /// [`DaqError::Timeout`] if the task did not finish in time (it is then aborted).
    pub async fn shutdown(&self, timeout: Duration) -> DaqResult<()> {
        // closed first, so no submit can slip in behind `stop`
        self.job_tx.lock().take();
        self.stop().await;
        let task = self.queue_task.lock().take();

        let mut result = Ok(());
        if let Some(mut task) = task {
            match tokio::time::timeout(timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    result = Err(DaqError::Hardware(format!(
                        "queue task for {} failed: {e}",
                        self.resource
                    )))
                }
                Err(_) => {
                    task.abort();
                    result = Err(DaqError::Timeout(format!(
                        "queue task for {} did not shut down within {:?}",
                        self.resource, timeout
                    )));
                }
            }
        }
        self.abort_outstanding();
        if result.is_ok() {
            debug!(resource = %self.resource, "Resource worker shut down");
        }
        result
    }

    async fn run_queue(resource: String, mut job_rx: mpsc::Receiver<QueuedAction>) {
        debug!(resource = %resource, "Starting resource queue task");

        while let Some(queued) = job_rx.recv().await {
            trace!(resource = %resource, action = %queued.name, "Processing action");
            queued.job.await;
        }

        debug!(resource = %resource, "Resource queue task ended");
    }
}

/// Components bound to one resource.
#[derive(Debug, Default)]
struct Binding {
    owners: Vec<String>,
    shared: bool,
}

/// Hands out one worker per resource and tracks resource ownership.
#[derive(Default)]
pub struct ExecutorPool {
    workers: Mutex<HashMap<String, Arc<ResourceWorker>>>,
    bindings: Mutex<HashMap<String, Binding>>,
}

impl ExecutorPool {
    /// Empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Worker for `resource`, created on first use.
    pub fn worker(&self, resource: &str) -> Arc<ResourceWorker> {
        let mut workers = self.workers.lock();
        if let Some(worker) = workers.get(resource) {
            if !worker.is_closed() {
                return Arc::clone(worker);
            }
        }
        let worker = ResourceWorker::spawn(resource);
        workers.insert(resource.to_string(), Arc::clone(&worker));
        worker
    }

    /// Bind `component` as the single owner of `resource` and return its worker.
    ///
    /// # Errors
    /// [`DaqError::Configuration`] if another component already holds the resource.
    pub fn bind(&self, resource: &str, component: &str) -> DaqResult<Arc<ResourceWorker>> {
        self.add_owner(resource, component, false)
    }

    /// Bind `component` to a resource that is explicitly coordinated between several
    /// components (two axes behind one controller). All owners share one worker.
    ///
    /// # Errors
    /// [`DaqError::Configuration`] if the resource is held exclusively.
    pub fn bind_shared(&self, resource: &str, component: &str) -> DaqResult<Arc<ResourceWorker>> {
        self.add_owner(resource, component, true)
    }

    fn add_owner(
        &self,
        resource: &str,
        component: &str,
        shared: bool,
    ) -> DaqResult<Arc<ResourceWorker>> {
        {
            let mut bindings = self.bindings.lock();
            let binding = bindings.entry(resource.to_string()).or_default();
            let already_bound = binding.owners.iter().any(|o| o == component);
            if !already_bound {
                if let Some(other) = binding.owners.first() {
                    if !(shared && binding.shared) {
                        return Err(DaqError::Configuration(format!(
                            "resource '{resource}' is already bound to '{other}'"
                        )));
                    }
                } else {
                    binding.shared = shared;
                }
                binding.owners.push(component.to_string());
            }
        }
        debug!(resource, component, shared, "Bound component to resource");
        Ok(self.worker(resource))
    }

    /// Release the binding of `component`. The worker stays available for other owners.
    pub fn unbind(&self, resource: &str, component: &str) {
        let mut bindings = self.bindings.lock();
        if let Some(binding) = bindings.get_mut(resource) {
            binding.owners.retain(|o| o != component);
            if binding.owners.is_empty() {
                bindings.remove(resource);
            }
        }
    }

    /// Components bound to `resource`.
    pub fn owners(&self, resource: &str) -> Vec<String> {
        self.bindings
            .lock()
            .get(resource)
            .map(|b| b.owners.clone())
            .unwrap_or_default()
    }

    /// Shut down every worker, collecting failures.
    pub async fn shutdown_all(&self, timeout: Duration) -> DaqResult<()> {
        let workers: Vec<_> = self.workers.lock().drain().map(|(_, w)| w).collect();
        let mut errors = Vec::new();
        for worker in workers {
            if let Err(e) = worker.shutdown(timeout).await {
                warn!(resource = %worker.resource(), error = %e, "Worker shutdown failed");
                errors.push(e);
            }
        }
        self.bindings.lock().clear();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionContext;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_actions_run_in_submission_order() {
        let worker = ResourceWorker::spawn("stage-controller");
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut futures = Vec::new();
        for i in 0..5 {
            let log = Arc::clone(&log);
            let action = Action::new(format!("step{i}"), move |_| async move {
                log.lock().push(format!("start{i}"));
                tokio::time::sleep(Duration::from_millis(2)).await;
                log.lock().push(format!("end{i}"));
                Ok(i)
            });
            futures.push(worker.submit(action).await.unwrap());
        }

        for (i, f) in futures.into_iter().enumerate() {
            assert_eq!(f.result(None).await.unwrap(), i);
        }

        let expected: Vec<String> = (0..5)
            .flat_map(|i| [format!("start{i}"), format!("end{i}")])
            .collect();
        assert_eq!(*log.lock(), expected);
    }

    #[tokio::test]
    async fn test_cancelled_pending_action_is_skipped() {
        let worker = ResourceWorker::spawn("camera");
        let release = Arc::new(tokio::sync::Notify::new());
        let gate = Arc::clone(&release);

        let first = worker
            .submit(Action::new("blocker", move |_| async move {
                gate.notified().await;
                Ok(())
            }))
            .await
            .unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let second = worker
            .submit(Action::new("skipped", move |_| async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }))
            .await
            .unwrap();

        assert_eq!(second.state(), ActionState::Pending);
        assert!(second.cancel().await);

        let mut rx = first.watch_state();
        rx.wait_for(|s| *s == ActionState::Running).await.unwrap();
        release.notify_one();
        first.result(None).await.unwrap();

        // the worker must have moved past the cancelled entry
        worker.submit(Action::ready("after", ())).await.unwrap().await.unwrap();
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(second.state(), ActionState::Cancelled);
    }

    #[tokio::test]
    async fn test_stop_cancels_queued_and_running() {
        let worker = ResourceWorker::spawn("stage");
        let running = worker
            .submit(
                Action::new("long_move", |ctx: ActionContext| async move {
                    ctx.cancelled().await;
                    Err::<(), _>(DaqError::Cancelled("long_move".into()))
                })
                .cooperative(),
            )
            .await
            .unwrap();
        let queued = worker.submit(Action::ready("next", ())).await.unwrap();

        let mut rx = running.watch_state();
        rx.wait_for(|s| *s == ActionState::Running).await.unwrap();

        assert_eq!(worker.stop().await, 2);
        assert_eq!(running.state(), ActionState::Cancelled);
        assert_eq!(queued.state(), ActionState::Cancelled);
        assert_eq!(worker.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let worker = ResourceWorker::spawn("laser");
        worker.shutdown(Duration::from_secs(1)).await.unwrap();

        let err = worker.submit(Action::ready("on", ())).await.unwrap_err();
        assert_eq!(err, DaqError::ComponentTerminated("laser".into()));
    }

    #[tokio::test]
    async fn test_shutdown_leaves_no_action_behind() {
        let worker = ResourceWorker::spawn("spectrometer");
        let stuck = worker
            .submit(Action::new("integrate", |_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            }))
            .await
            .unwrap();
        let mut rx = stuck.watch_state();
        rx.wait_for(|s| *s == ActionState::Running).await.unwrap();

        let mut queued = Vec::new();
        for i in 0..3 {
            queued.push(worker.submit(Action::ready(format!("read{i}"), i)).await.unwrap());
        }

        let err = worker.shutdown(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, DaqError::Timeout(_)));

        assert_eq!(stuck.state(), ActionState::Failed);
        assert_eq!(
            stuck.result(Some(Duration::from_millis(500))).await.unwrap_err(),
            DaqError::ComponentTerminated("spectrometer".into())
        );
        for future in queued {
            assert_eq!(future.state(), ActionState::Cancelled);
        }
        assert_eq!(worker.outstanding(), 0);
        assert!(worker.is_closed());
    }

    #[tokio::test]
    async fn test_abort_outstanding_keeps_worker_serving() {
        let worker = ResourceWorker::spawn("filter-wheel");
        let spins = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&spins);
        let stuck = worker
            .submit(Action::new("spin", move |_| async move {
                while counter.fetch_add(1, Ordering::SeqCst) < usize::MAX {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                Ok(())
            }))
            .await
            .unwrap();
        let mut rx = stuck.watch_state();
        rx.wait_for(|s| *s == ActionState::Running).await.unwrap();

        assert_eq!(worker.abort_outstanding(), 1);
        assert_eq!(stuck.state(), ActionState::Failed);

        // the aborted body no longer occupies the queue
        let next = worker.submit(Action::ready("home", 7)).await.unwrap();
        assert_eq!(next.result(Some(Duration::from_secs(1))).await.unwrap(), 7);
        let after = spins.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(spins.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn test_pool_shares_workers_and_enforces_single_owner() {
        let pool = ExecutorPool::new();
        let x = pool.bind_shared("COM3", "stage_x").unwrap();
        let y = pool.bind_shared("COM3", "stage_y").unwrap();
        assert!(Arc::ptr_eq(&x, &y));
        assert_eq!(pool.owners("COM3"), vec!["stage_x", "stage_y"]);

        let err = pool.bind("COM3", "camera").unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));

        pool.bind("USB0", "camera").unwrap();
        assert!(pool.bind_shared("USB0", "spectrometer").is_err());
        // rebinding the owner is harmless
        assert!(pool.bind("USB0", "camera").is_ok());

        // serialized across both axes
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let mut futures = Vec::new();
        for worker in [&x, &y, &x, &y] {
            let concurrent = Arc::clone(&concurrent);
            let max_seen = Arc::clone(&max_seen);
            futures.push(
                worker
                    .submit(Action::new("move", move |_| async move {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }))
                    .await
                    .unwrap(),
            );
        }
        for f in futures {
            f.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);

        pool.shutdown_all(Duration::from_secs(1)).await.unwrap();
    }
}
