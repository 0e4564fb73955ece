//! Asynchronous actions and their handles.
//!
//! An [`Action`] is a named unit of work a component can perform (move a stage, acquire a
//! frame). Submitting an action yields an [`ActionFuture`], a cloneable handle that tracks
//! the lifecycle
//!
//! ```text
//! Pending -> Running -> Done | Failed | Cancelled
//! Pending -> Cancelled
//! ```
//!
//! and is the only way callers observe the outcome. A terminal state is never left, and
//! every done-callback runs exactly once, including callbacks registered after completion.
//!
//! Cancellation of a running action is delegated to the action's cancel hook. Bodies that
//! honour cancellation poll [`ActionContext::is_cancelled`] or await
//! [`ActionContext::cancelled`]; [`Action::cooperative`] installs the standard hook that trips
//! the context token.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{DaqError, DaqResult};

/// Bound for action results. Outcomes are stored once and handed to every waiter.
pub trait ActionOutput: Clone + Send + Sync + 'static {}

impl<T> ActionOutput for T where T: Clone + Send + Sync + 'static {}

/// Lifecycle state of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    /// Queued, not started.
    Pending,
    /// Body is executing.
    Running,
    /// Completed with a value.
    Done,
    /// Cancelled before or during execution.
    Cancelled,
    /// Body returned an error or panicked.
    Failed,
}

impl ActionState {
    /// Done, Cancelled and Failed are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ActionState::Done | ActionState::Cancelled | ActionState::Failed
        )
    }
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionState::Pending => "pending",
            ActionState::Running => "running",
            ActionState::Done => "done",
            ActionState::Cancelled => "cancelled",
            ActionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Progress of an action: start time, estimated (then actual) end time and an optional
/// completed fraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// When the body started.
    pub start: Option<DateTime<Utc>>,
    /// Estimated end while running, actual end once terminal.
    pub end: Option<DateTime<Utc>>,
    /// Completed fraction in `[0, 1]`.
    pub fraction: Option<f64>,
}

/// State + progress snapshot delivered to update callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActionUpdate {
    /// Current state.
    pub state: ActionState,
    /// Current progress.
    pub progress: Progress,
}

// =============================================================================
// Cancellation token and context
// =============================================================================

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cancellation flag shared between an action handle and its running body.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    /// Fresh, untripped token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the token and wake every waiter.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// True once tripped.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is tripped.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

trait ProgressSink: Send + Sync {
    fn report(&self, progress: Progress);
    fn current(&self) -> Progress;
}

/// Handed to a running action body.
#[derive(Clone)]
pub struct ActionContext {
    token: CancelToken,
    sink: Arc<dyn ProgressSink>,
}

impl ActionContext {
    /// True once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once cancellation was requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Cancellation token (cloneable into sub-tasks).
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Replace the progress. The start time is kept when the new value has none.
    pub fn set_progress(&self, progress: Progress) {
        self.sink.report(progress);
    }

    /// Update only the completed fraction.
    pub fn set_fraction(&self, fraction: f64) {
        let mut progress = self.sink.current();
        progress.fraction = Some(fraction.clamp(0.0, 1.0));
        self.sink.report(progress);
    }

    /// Update only the estimated end time.
    pub fn set_estimated_end(&self, end: DateTime<Utc>) {
        let mut progress = self.sink.current();
        progress.end = Some(end);
        self.sink.report(progress);
    }

    /// Fail with `Cancelled` if cancellation was requested. Handy as `ctx.checkpoint()?`.
    pub fn checkpoint(&self) -> DaqResult<()> {
        if self.is_cancelled() {
            Err(DaqError::Cancelled("checkpoint".into()))
        } else {
            Ok(())
        }
    }
}

// =============================================================================
// Action
// =============================================================================

pub(crate) type ActionBody<T> =
    Box<dyn FnOnce(ActionContext) -> BoxFuture<'static, DaqResult<T>> + Send>;

/// Cancel hook: asked to stop a running body, answers whether it will stop.
pub type CancelHook = Arc<dyn Fn(CancelToken) -> BoxFuture<'static, bool> + Send + Sync>;

/// A named unit of work, not yet started.
pub struct Action<T> {
    name: String,
    body: ActionBody<T>,
    cancel_hook: Option<CancelHook>,
}

impl<T> fmt::Debug for Action<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("name", &self.name)
            .field("cancellable", &self.cancel_hook.is_some())
            .finish()
    }
}

impl<T: ActionOutput> Action<T> {
    /// Create an action from an async body. Without a cancel hook the action can only be
    /// cancelled while pending.
    pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(ActionContext) -> Fut + Send + 'static,
        Fut: Future<Output = DaqResult<T>> + Send + 'static,
    {
        Self {
            name: name.into(),
            body: Box::new(move |ctx| body(ctx).boxed()),
            cancel_hook: None,
        }
    }

    /// Action that completes immediately with `value`.
    pub fn ready(name: impl Into<String>, value: T) -> Self {
        Self::new(name, move |_| async move { Ok(value) })
    }

    /// Install the standard hook: trip the context token and accept.
    pub fn cooperative(self) -> Self {
        self.with_cancel_hook(|token| async move {
            token.cancel();
            true
        })
    }

    /// Install a custom cancel hook (for instance one that also sends a stop command to
    /// the hardware).
    pub fn with_cancel_hook<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.cancel_hook = Some(Arc::new(move |token| hook(token).boxed()));
        self
    }

    /// Action name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True if the action can be cancelled while running.
    pub fn is_cancellable(&self) -> bool {
        self.cancel_hook.is_some()
    }

    /// Transform the result, keeping name and cancel hook.
    pub fn map<U, F>(self, f: F) -> Action<U>
    where
        U: ActionOutput,
        F: FnOnce(T) -> DaqResult<U> + Send + 'static,
    {
        let body = self.body;
        Action {
            name: self.name,
            body: Box::new(move |ctx| {
                let inner = body(ctx);
                async move { f(inner.await?) }.boxed()
            }),
            cancel_hook: self.cancel_hook,
        }
    }

    /// Start the body right away on the current runtime, outside any resource queue.
    pub fn spawn(self) -> ActionFuture<T> {
        let (future, body) = self.into_parts(None);
        let driver = future.clone();
        tokio::spawn(async move { driver.drive(body).await });
        future
    }

    /// Split into a pending handle and the body that will drive it.
    pub(crate) fn into_parts(self, resource: Option<String>) -> (ActionFuture<T>, ActionBody<T>) {
        let future = ActionFuture::pending(self.name, resource, self.cancel_hook, false);
        (future, self.body)
    }
}

// =============================================================================
// ActionFuture
// =============================================================================

type DoneCallback<T> = Box<dyn FnOnce(&ActionFuture<T>) + Send>;
type UpdateCallback = Arc<dyn Fn(&ActionUpdate) + Send + Sync>;

struct Inner<T> {
    state: ActionState,
    progress: Progress,
    outcome: Option<DaqResult<T>>,
    done_callbacks: Vec<DoneCallback<T>>,
    update_callbacks: Vec<UpdateCallback>,
}

struct Shared<T> {
    id: Uuid,
    name: String,
    resource: Option<String>,
    token: CancelToken,
    cancel_hook: Option<CancelHook>,
    /// Mirrors an action executing elsewhere; state is driven by remote updates.
    mirrored: bool,
    /// Keeps update notifications in transition order.
    ordering: ReentrantMutex<()>,
    inner: Mutex<Inner<T>>,
    state_tx: watch::Sender<ActionState>,
    /// Task running the body, once started.
    body_task: Mutex<Option<AbortHandle>>,
}

impl<T: ActionOutput> ProgressSink for Shared<T> {
    fn report(&self, progress: Progress) {
        let _order = self.ordering.lock();
        let (update, callbacks) = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            let start = progress.start.or(inner.progress.start);
            inner.progress = Progress { start, ..progress };
            (
                ActionUpdate {
                    state: inner.state,
                    progress: inner.progress,
                },
                inner.update_callbacks.clone(),
            )
        };
        notify_updates(&self.name, &callbacks, &update);
    }

    fn current(&self) -> Progress {
        self.inner.lock().progress
    }
}

fn notify_updates(action: &str, callbacks: &[UpdateCallback], update: &ActionUpdate) {
    for callback in callbacks {
        if catch_unwind(AssertUnwindSafe(|| callback(update))).is_err() {
            error!(action, "Action update callback panicked");
        }
    }
}

/// Handle to a submitted action.
///
/// Cloning shares the same action. `.await`ing the handle waits for the result.
pub struct ActionFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ActionFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: ActionOutput> fmt::Debug for ActionFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionFuture")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

impl<T: ActionOutput> ActionFuture<T> {
    pub(crate) fn pending(
        name: String,
        resource: Option<String>,
        cancel_hook: Option<CancelHook>,
        mirrored: bool,
    ) -> Self {
        let (state_tx, _) = watch::channel(ActionState::Pending);
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                name,
                resource,
                token: CancelToken::new(),
                cancel_hook,
                mirrored,
                ordering: ReentrantMutex::new(()),
                inner: Mutex::new(Inner {
                    state: ActionState::Pending,
                    progress: Progress::default(),
                    outcome: None,
                    done_callbacks: Vec::new(),
                    update_callbacks: Vec::new(),
                }),
                state_tx,
                body_task: Mutex::new(None),
            }),
        }
    }

    /// Handle for an action executing on a remote backend. Its state is driven by
    /// [`ActionFuture::apply_update`] and [`ActionFuture::complete`]; cancellation is
    /// forwarded through `cancel_hook`.
    pub(crate) fn mirrored(name: String, cancel_hook: CancelHook) -> Self {
        Self::pending(name, None, Some(cancel_hook), true)
    }

    /// Unique id of this action.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Action name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Resource queue the action was submitted to.
    pub fn resource(&self) -> Option<&str> {
        self.shared.resource.as_deref()
    }

    /// Current state.
    pub fn state(&self) -> ActionState {
        self.shared.inner.lock().state
    }

    /// Current progress.
    pub fn progress(&self) -> Progress {
        self.shared.inner.lock().progress
    }

    /// True once terminal.
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Receiver observing state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ActionState> {
        self.shared.state_tx.subscribe()
    }

    /// Request cancellation.
    ///
    /// Returns `true` iff the action will not complete normally: a pending action is
    /// cancelled at once and its body never runs; a running action is cancelled if its
    /// hook accepts. An already terminal action answers whether it ended cancelled.
    pub async fn cancel(&self) -> bool {
        if !self.shared.mirrored
            && self.complete_if(
                Some(ActionState::Pending),
                Err(DaqError::Cancelled(self.shared.name.clone())),
            )
        {
            info!(action = %self.shared.name, id = %self.shared.id, "Cancelled pending action");
            return true;
        }

        let state = self.state();
        if state.is_terminal() {
            return state == ActionState::Cancelled;
        }

        let Some(hook) = self.shared.cancel_hook.clone() else {
            debug!(action = %self.shared.name, "Running action is not cancellable");
            return false;
        };

        if hook(self.shared.token.clone()).await {
            self.complete(Err(DaqError::Cancelled(self.shared.name.clone())));
        }
        self.state() == ActionState::Cancelled
    }

    /// Force the action into a terminal state with `reason`, whether it is pending or
    /// running. A running body is aborted at its next await point.
    ///
    /// Returns false if the action already was terminal. Used when the resource or
    /// component goes away and the action ignored the regular cancellation.
    pub fn abort(&self, reason: DaqError) -> bool {
        let ended = self.complete(Err(reason));
        if let Some(task) = self.shared.body_task.lock().take() {
            task.abort();
        }
        if ended {
            warn!(action = %self.shared.name, id = %self.shared.id, "Action aborted");
        }
        ended
    }

    /// Wait for the outcome.
    ///
    /// With a timeout, fails with [`DaqError::Timeout`] if the action is not terminal in
    /// time (the action itself keeps going). A cancelled action yields
    /// [`DaqError::Cancelled`]; a failed one its stored error.
    pub async fn result(&self, timeout: Option<Duration>) -> DaqResult<T> {
        let mut rx = self.shared.state_tx.subscribe();
        let terminal = async move {
            // the sender lives in `shared`, which we hold
            let _ = rx.wait_for(|s| s.is_terminal()).await;
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, terminal).await.map_err(|_| {
                DaqError::Timeout(format!(
                    "action '{}' did not finish within {:?}",
                    self.shared.name, limit
                ))
            })?,
            None => terminal.await,
        }

        self.try_result().unwrap_or_else(|| {
            Err(DaqError::Hardware(format!(
                "action '{}' finished without outcome",
                self.shared.name
            )))
        })
    }

    /// Outcome if terminal, without waiting.
    pub fn try_result(&self) -> Option<DaqResult<T>> {
        self.shared.inner.lock().outcome.clone()
    }

    /// Run `callback` once the action is terminal (immediately if it already is).
    pub fn add_done_callback<F>(&self, callback: F)
    where
        F: FnOnce(&ActionFuture<T>) + Send + 'static,
    {
        {
            let mut inner = self.shared.inner.lock();
            if !inner.state.is_terminal() {
                inner.done_callbacks.push(Box::new(callback));
                return;
            }
        }
        self.run_done_callback(Box::new(callback));
    }

    /// Run `callback` on every state or progress change.
    pub fn add_update_callback<F>(&self, callback: F)
    where
        F: Fn(&ActionUpdate) + Send + Sync + 'static,
    {
        self.shared
            .inner
            .lock()
            .update_callbacks
            .push(Arc::new(callback));
    }

    fn run_done_callback(&self, callback: DoneCallback<T>) {
        if catch_unwind(AssertUnwindSafe(|| callback(self))).is_err() {
            error!(action = %self.shared.name, "Action done callback panicked");
        }
    }

    /// Pending -> Running. False if the action was cancelled while queued.
    pub(crate) fn try_start(&self) -> bool {
        let _order = self.shared.ordering.lock();
        let (update, callbacks) = {
            let mut inner = self.shared.inner.lock();
            if inner.state != ActionState::Pending {
                return false;
            }
            inner.state = ActionState::Running;
            inner.progress.start.get_or_insert_with(Utc::now);
            (
                ActionUpdate {
                    state: inner.state,
                    progress: inner.progress,
                },
                inner.update_callbacks.clone(),
            )
        };
        self.shared.state_tx.send_replace(ActionState::Running);
        debug!(action = %self.shared.name, id = %self.shared.id, "Action started");
        notify_updates(&self.shared.name, &callbacks, &update);
        true
    }

    /// Apply a non-terminal update received from a remote peer.
    pub(crate) fn apply_update(&self, update: ActionUpdate) {
        if update.state == ActionState::Running {
            self.try_start();
        }
        self.shared.report(update.progress);
    }

    /// Store the outcome and enter the matching terminal state.
    /// Returns false if the action already was terminal.
    pub(crate) fn complete(&self, outcome: DaqResult<T>) -> bool {
        self.complete_if(None, outcome)
    }

    fn complete_if(&self, required: Option<ActionState>, outcome: DaqResult<T>) -> bool {
        let order = self.shared.ordering.lock();
        let (update, callbacks, done) = {
            let mut inner = self.shared.inner.lock();
            if inner.state.is_terminal() || required.is_some_and(|r| r != inner.state) {
                return false;
            }
            let state = match &outcome {
                Ok(_) => ActionState::Done,
                Err(DaqError::Cancelled(_)) => ActionState::Cancelled,
                Err(_) => ActionState::Failed,
            };
            if let Err(e) = &outcome {
                if state == ActionState::Failed {
                    warn!(action = %self.shared.name, id = %self.shared.id, error = %e, "Action failed");
                }
            }
            inner.state = state;
            inner.progress.end = Some(Utc::now());
            if state == ActionState::Done {
                inner.progress.fraction = Some(1.0);
            }
            inner.outcome = Some(outcome);
            (
                ActionUpdate {
                    state,
                    progress: inner.progress,
                },
                inner.update_callbacks.clone(),
                std::mem::take(&mut inner.done_callbacks),
            )
        };
        debug!(action = %self.shared.name, id = %self.shared.id, state = %update.state, "Action finished");
        notify_updates(&self.shared.name, &callbacks, &update);
        drop(order);

        for callback in done {
            self.run_done_callback(callback);
        }
        // waiters wake after every done callback ran
        self.shared.state_tx.send_replace(update.state);
        true
    }

    /// Run `body` to completion on behalf of this handle. A body cancelled while pending
    /// never runs.
    pub(crate) async fn drive(&self, body: ActionBody<T>) {
        if !self.try_start() {
            return;
        }

        let ctx = ActionContext {
            token: self.shared.token.clone(),
            sink: self.shared.clone() as Arc<dyn ProgressSink>,
        };

        // spawned so that a panicking body is reported through the JoinError
        let task = tokio::spawn(body(ctx));
        *self.shared.body_task.lock() = Some(task.abort_handle());
        if self.state().is_terminal() {
            // aborted between start and spawn
            task.abort();
        }
        let outcome = match task.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(DaqError::Cancelled(_))) if self.shared.token.is_cancelled() => {
                Err(DaqError::Cancelled(self.shared.name.clone()))
            }
            Ok(Err(e)) => Err(DaqError::action_failed(self.shared.name.clone(), e)),
            Err(join) if join.is_cancelled() => Err(DaqError::ComponentTerminated(
                self.shared.resource.clone().unwrap_or_else(|| self.shared.name.clone()),
            )),
            Err(join) => Err(DaqError::action_failed(
                self.shared.name.clone(),
                DaqError::Hardware(format!("action body panicked: {join}")),
            )),
        };
        self.shared.body_task.lock().take();
        self.complete(outcome);
    }
}

impl<T: ActionOutput> IntoFuture for ActionFuture<T> {
    type Output = DaqResult<T>;
    type IntoFuture = BoxFuture<'static, DaqResult<T>>;

    fn into_future(self) -> Self::IntoFuture {
        async move { self.result(None).await }.boxed()
    }
}

/// Type-erased view of an action, used where the result type does not matter.
pub trait ActionHandle: Send + Sync {
    /// Unique id.
    fn id(&self) -> Uuid;
    /// Action name.
    fn name(&self) -> &str;
    /// Current state.
    fn state(&self) -> ActionState;
    /// Request cancellation (see [`ActionFuture::cancel`]).
    fn cancel_boxed(&self) -> BoxFuture<'static, bool>;
    /// Resolves once the action is terminal, whatever the outcome.
    fn wait_boxed(&self) -> BoxFuture<'static, ()>;
    /// Force a terminal state (see [`ActionFuture::abort`]).
    fn abort(&self, reason: DaqError) -> bool;
}

impl<T: ActionOutput> ActionHandle for ActionFuture<T> {
    fn id(&self) -> Uuid {
        self.shared.id
    }

    fn name(&self) -> &str {
        &self.shared.name
    }

    fn state(&self) -> ActionState {
        ActionFuture::state(self)
    }

    fn cancel_boxed(&self) -> BoxFuture<'static, bool> {
        let this = self.clone();
        async move { this.cancel().await }.boxed()
    }

    fn wait_boxed(&self) -> BoxFuture<'static, ()> {
        let this = self.clone();
        async move {
            let _ = this.result(None).await;
        }
        .boxed()
    }

    fn abort(&self, reason: DaqError) -> bool {
        ActionFuture::abort(self, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_spawned_action_completes() {
        let future = Action::new("add", |_| async { Ok(2 + 2) }).spawn();
        assert_eq!(future.clone().await.unwrap(), 4);
        assert_eq!(future.state(), ActionState::Done);
        assert_eq!(future.progress().fraction, Some(1.0));
        assert!(future.progress().end.is_some());
    }

    #[tokio::test]
    async fn test_failure_is_wrapped() {
        let future: ActionFuture<()> =
            Action::new("home", |_| async { Err::<(), _>(DaqError::Hardware("limit switch".into())) })
                .spawn();
        let err = future.result(None).await.unwrap_err();
        assert!(matches!(err, DaqError::ActionFailed { ref action, .. } if action == "home"));
        assert_eq!(future.state(), ActionState::Failed);
    }

    #[tokio::test]
    async fn test_panicking_body_fails() {
        let future: ActionFuture<()> =
            Action::new("boom", |_| async {
                if true {
                    panic!("driver bug");
                }
                Ok(())
            })
            .spawn();
        let err = future.result(None).await.unwrap_err();
        assert!(err.to_string().contains("panicked"));
        assert_eq!(future.state(), ActionState::Failed);
    }

    #[tokio::test]
    async fn test_cancel_pending_never_runs() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let (future, body) = Action::new("never", move |_| async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
        .into_parts(None);

        assert!(future.cancel().await);
        future.drive(body).await;

        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(future.state(), ActionState::Cancelled);
        assert!(matches!(
            future.result(None).await,
            Err(DaqError::Cancelled(_))
        ));
        // idempotent
        assert!(future.cancel().await);
    }

    #[tokio::test]
    async fn test_cooperative_cancel_of_running_action() {
        let future = Action::new("wait", |ctx: ActionContext| async move {
            ctx.cancelled().await;
            Err::<(), _>(DaqError::Cancelled("wait".into()))
        })
        .cooperative()
        .spawn();

        let mut rx = future.watch_state();
        rx.wait_for(|s| *s == ActionState::Running).await.unwrap();

        assert!(future.cancel().await);
        assert_eq!(future.state(), ActionState::Cancelled);
    }

    #[tokio::test]
    async fn test_running_action_without_hook_is_not_cancellable() {
        let future = Action::new("sleep", |_| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(7)
        })
        .spawn();
        let mut rx = future.watch_state();
        rx.wait_for(|s| *s == ActionState::Running).await.unwrap();

        assert!(!future.cancel().await);
        assert_eq!(future.result(None).await.unwrap(), 7);
        // finished normally: still not cancelled
        assert!(!future.cancel().await);
    }

    #[tokio::test]
    async fn test_result_timeout() {
        let future = Action::new("slow", |ctx: ActionContext| async move {
            ctx.cancelled().await;
            Ok(())
        })
        .cooperative()
        .spawn();

        let err = future
            .result(Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Timeout(_)));
        assert!(!future.is_finished());
        future.cancel().await;
    }

    #[tokio::test]
    async fn test_done_callback_runs_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let future = Action::ready("now", 1).spawn();

        let c = Arc::clone(&calls);
        future.add_done_callback(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        future.result(None).await.unwrap();

        // registered after completion: runs immediately
        let c = Arc::clone(&calls);
        future.add_done_callback(move |f| {
            assert_eq!(f.state(), ActionState::Done);
            c.fetch_add(1, Ordering::SeqCst);
        });

        // completing again is refused
        assert!(!future.complete(Ok(5)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(future.result(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_progress_updates_are_reported() {
        let updates = Arc::new(Mutex::new(Vec::new()));
        let (future, body) = Action::new("scan", |ctx: ActionContext| async move {
            ctx.set_fraction(0.5);
            Ok(())
        })
        .into_parts(None);
        let sink = Arc::clone(&updates);
        future.add_update_callback(move |u| sink.lock().push((u.state, u.progress.fraction)));

        future.drive(body).await;

        assert_eq!(
            *updates.lock(),
            vec![
                (ActionState::Running, None),
                (ActionState::Running, Some(0.5)),
                (ActionState::Done, Some(1.0)),
            ]
        );
    }

    #[tokio::test]
    async fn test_map_keeps_name() {
        let action = Action::ready("count", 3_u32).map(|n| Ok(serde_json::json!(n)));
        assert_eq!(action.name(), "count");
        assert_eq!(action.spawn().await.unwrap(), serde_json::json!(3));
    }
}
