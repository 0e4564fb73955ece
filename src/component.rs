//! Components: addressable entities exposing attributes, metadata and actions.
//!
//! [`Component`] is the one interface every caller programs against. A
//! [`LocalComponent`] lives in this process; a remote proxy
//! ([`crate::remote::ComponentProxy`]) forwards to a backend process. Generic tooling,
//! the metadata propagator and the backend server only ever see `dyn Component`, so the
//! two are interchangeable.
//!
//! ## Lifecycle
//!
//! 1. **Build**: a driver assembles attributes, action factories and static metadata with
//!    [`ComponentBuilder`].
//! 2. **Use**: callers read/write attributes, call `execute` to obtain an
//!    [`ActionFuture`], read metadata.
//! 3. **Terminate**: `terminate()` cancels (or waits for) the component's outstanding
//!    actions, releases the driver resource and closes every attribute. Afterwards attribute
//!    writes, JSON reads and action calls fail with `ComponentTerminated`. Terminating twice is
//!    a no-op.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::action::{Action, ActionFuture, ActionHandle, ActionOutput};
use crate::attribute::{Attribute, AttributeHandle, AttributeInfo, AttributeSet, AttributeValue};
use crate::error::{DaqError, DaqResult};
use crate::executor::ResourceWorker;
use crate::metadata::{Metadata, RawMetadata, VOCABULARY_VERSION};

/// Name of the read-only lifecycle attribute every local component carries.
pub const STATE_ATTRIBUTE: &str = "state";

/// Default time `terminate()` waits for outstanding actions.
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle state published through the `state` attribute.
#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum ComponentState {
    /// Operational.
    Running,
    /// Terminated.
    Stopped,
    /// Driver reported an unrecoverable problem.
    Error(String),
}

/// Self-description exchanged during the remote handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDescriptor {
    /// Unique component name.
    pub name: String,
    /// Category tag ("stage", "ccd", ...).
    pub role: String,
    /// Every attribute, in name order.
    pub attributes: Vec<AttributeInfo>,
    /// Action names.
    pub actions: Vec<String>,
    /// Components whose interpretation depends on this one.
    pub affects: Vec<String>,
    /// Components this one wraps, in precedence order.
    pub dependencies: Vec<String>,
    /// Metadata vocabulary the component was built against.
    pub vocabulary_version: u32,
}

impl ComponentDescriptor {
    /// Look up one attribute record.
    pub fn attribute(&self, name: &str) -> Option<&AttributeInfo> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

/// Common interface of local components, composites and remote proxies.
#[async_trait]
pub trait Component: Send + Sync {
    /// Unique, immutable name.
    fn name(&self) -> &str;

    /// Category tag.
    fn role(&self) -> &str;

    /// Names of every attribute, in name order.
    fn attribute_names(&self) -> Vec<String>;

    /// Type-erased attribute by name.
    ///
    /// # Errors
    /// [`DaqError::UnknownAttribute`] if there is no such attribute.
    fn attribute(&self, name: &str) -> DaqResult<Arc<dyn AttributeHandle>>;

    /// Names of every action.
    fn action_names(&self) -> Vec<String>;

    /// Start an action. `args` is the JSON argument of the action (`null` for none).
    ///
    /// # Errors
    /// `UnknownAction`, `Validation` for malformed arguments, `ComponentTerminated`.
    async fn execute(&self, action: &str, args: Value) -> DaqResult<ActionFuture<Value>>;

    /// Current metadata mapping.
    async fn metadata(&self) -> DaqResult<Metadata>;

    /// Merge `partial` into the metadata mapping.
    async fn update_metadata(&self, partial: Metadata) -> DaqResult<()>;

    /// Receiver notified when this component's metadata changes, if the component can
    /// offer one. Remote proxies return `None`.
    fn metadata_receiver(&self) -> Option<watch::Receiver<Metadata>> {
        None
    }

    /// Merge a string-keyed mapping, rejecting keys outside the vocabulary.
    async fn update_metadata_raw(&self, partial: RawMetadata) -> DaqResult<()> {
        let partial = Metadata::try_from_raw(partial).inspect_err(|e| {
            warn!(component = %self.name(), error = %e, "Rejected metadata update");
        })?;
        self.update_metadata(partial).await
    }

    /// Names of the components this one affects.
    fn affects(&self) -> Vec<String>;

    /// Names of the components this one wraps.
    fn dependencies(&self) -> Vec<String>;

    /// Release resources. Idempotent.
    async fn terminate(&self) -> DaqResult<()>;

    /// True once terminated.
    fn is_terminated(&self) -> bool;

    /// Self-description used for introspection and the remote handshake.
    fn describe(&self) -> ComponentDescriptor {
        ComponentDescriptor {
            name: self.name().to_string(),
            role: self.role().to_string(),
            attributes: self
                .attribute_names()
                .iter()
                .filter_map(|n| self.attribute(n).ok())
                .map(|a| a.info())
                .collect(),
            actions: self.action_names(),
            affects: self.affects(),
            dependencies: self.dependencies(),
            vocabulary_version: VOCABULARY_VERSION,
        }
    }
}

impl dyn Component {
    /// Read an attribute as JSON.
    pub async fn get(&self, attribute: &str) -> DaqResult<Value> {
        self.attribute(attribute)?.get_value().await
    }

    /// Write an attribute from any serializable value.
    pub async fn set(&self, attribute: &str, value: impl Serialize) -> DaqResult<()> {
        let value = serde_json::to_value(value)?;
        self.attribute(attribute)?.set_value(value).await
    }

    /// Read an attribute and decode it.
    pub async fn get_as<T: DeserializeOwned>(&self, attribute: &str) -> DaqResult<T> {
        Ok(serde_json::from_value(self.get(attribute).await?)?)
    }

    /// Typed access to a local attribute (fails for remote proxies and wrong types).
    pub fn typed_attribute<T: AttributeValue>(&self, name: &str) -> DaqResult<Attribute<T>> {
        let handle = self.attribute(name)?;
        handle
            .as_any()
            .downcast_ref::<Attribute<T>>()
            .cloned()
            .ok_or_else(|| {
                DaqError::validation(
                    name,
                    format!("attribute is not a local {}", std::any::type_name::<T>()),
                )
            })
    }
}

impl fmt::Debug for dyn Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("name", &self.name())
            .field("role", &self.role())
            .finish()
    }
}

// =============================================================================
// LocalComponent
// =============================================================================

type ActionFactory = Arc<dyn Fn(Value) -> DaqResult<Action<Value>> + Send + Sync>;
type Closer = Box<dyn Fn(&str) + Send + Sync>;
type TerminateHook = Box<dyn FnOnce() -> BoxFuture<'static, DaqResult<()>> + Send>;

/// A component living in this process.
pub struct LocalComponent {
    name: String,
    role: String,
    attributes: AttributeSet,
    closers: Vec<Closer>,
    state: Attribute<ComponentState>,
    actions: BTreeMap<String, ActionFactory>,
    metadata: watch::Sender<Metadata>,
    affects: Vec<String>,
    dependencies: Vec<String>,
    /// Shared worker handed in by the builder; not shut down on terminate.
    shared_worker: Option<Arc<ResourceWorker>>,
    /// Worker created on first `execute` when none was handed in.
    own_worker: Mutex<Option<Arc<ResourceWorker>>>,
    outstanding: Mutex<Vec<Arc<dyn ActionHandle>>>,
    on_terminate: Mutex<Option<TerminateHook>>,
    terminate_timeout: Duration,
    terminated: AtomicBool,
}

impl fmt::Debug for LocalComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalComponent")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("attributes", &self.attributes.names())
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl LocalComponent {
    /// Start building a component.
    pub fn builder(name: impl Into<String>, role: impl Into<String>) -> ComponentBuilder {
        ComponentBuilder::new(name, role)
    }

    /// Lifecycle attribute.
    pub fn state(&self) -> &Attribute<ComponentState> {
        &self.state
    }

    /// Report a driver fault through the `state` attribute.
    pub fn report_error(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(component = %self.name, %message, "Component entered error state");
        let _ = self.state.publish(ComponentState::Error(message));
    }

    /// Typed attribute by name.
    pub fn typed<T: AttributeValue>(&self, name: &str) -> DaqResult<Attribute<T>> {
        self.attributes
            .get_typed::<T>(name)
            .ok_or_else(|| DaqError::UnknownAttribute {
                component: self.name.clone(),
                attribute: name.to_string(),
            })
    }

    /// Receiver notified on every effective metadata change.
    pub fn watch_metadata(&self) -> watch::Receiver<Metadata> {
        self.metadata.subscribe()
    }

    /// Metadata snapshot without going through the async trait.
    pub fn metadata_snapshot(&self) -> Metadata {
        self.metadata.borrow().clone()
    }

    /// Worker executing this component's actions.
    pub fn worker(&self) -> Arc<ResourceWorker> {
        if let Some(worker) = &self.shared_worker {
            return Arc::clone(worker);
        }
        let mut own = self.own_worker.lock();
        match &*own {
            Some(worker) => Arc::clone(worker),
            None => {
                let worker = ResourceWorker::spawn(self.name.clone());
                *own = Some(Arc::clone(&worker));
                worker
            }
        }
    }

    fn ensure_running(&self) -> DaqResult<()> {
        if self.is_terminated() {
            Err(DaqError::ComponentTerminated(self.name.clone()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Component for LocalComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> &str {
        &self.role
    }

    fn attribute_names(&self) -> Vec<String> {
        self.attributes.names()
    }

    fn attribute(&self, name: &str) -> DaqResult<Arc<dyn AttributeHandle>> {
        self.attributes
            .get(name)
            .cloned()
            .ok_or_else(|| DaqError::UnknownAttribute {
                component: self.name.clone(),
                attribute: name.to_string(),
            })
    }

    fn action_names(&self) -> Vec<String> {
        self.actions.keys().cloned().collect()
    }

    async fn execute(&self, action: &str, args: Value) -> DaqResult<ActionFuture<Value>> {
        self.ensure_running()?;
        let factory = self
            .actions
            .get(action)
            .ok_or_else(|| DaqError::UnknownAction {
                component: self.name.clone(),
                action: action.to_string(),
            })?;

        let action = factory(args).inspect_err(|e| {
            warn!(component = %self.name, action, error = %e, "Rejected action arguments");
        })?;
        let future = self.worker().submit(action).await?;

        {
            let mut outstanding = self.outstanding.lock();
            outstanding.retain(|a| !a.state().is_terminal());
            outstanding.push(Arc::new(future.clone()));
        }
        if self.is_terminated() {
            // raced with terminate, which may already have drained `outstanding`
            let reason = DaqError::ComponentTerminated(self.name.clone());
            future.abort(reason.clone());
            return Err(reason);
        }
        debug!(component = %self.name, action = %future.name(), id = %future.id(), "Submitted action");
        Ok(future)
    }

    async fn metadata(&self) -> DaqResult<Metadata> {
        Ok(self.metadata_snapshot())
    }

    fn metadata_receiver(&self) -> Option<watch::Receiver<Metadata>> {
        Some(self.watch_metadata())
    }

    async fn update_metadata(&self, partial: Metadata) -> DaqResult<()> {
        self.ensure_running()?;
        let changed = self.metadata.send_if_modified(|current| current.merge(&partial));
        if changed {
            debug!(component = %self.name, keys = partial.len(), "Metadata updated");
        }
        Ok(())
    }

    fn affects(&self) -> Vec<String> {
        self.affects.clone()
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    async fn terminate(&self) -> DaqResult<()> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(component = %self.name, "Terminating component");
        let mut errors = Vec::new();

        let actions: Vec<_> = std::mem::take(&mut *self.outstanding.lock());
        errors.extend(settle_actions(&self.name, &actions, self.terminate_timeout).await);

        let own_worker = self.own_worker.lock().take();
        if let Some(worker) = own_worker {
            if let Err(e) = worker.shutdown(self.terminate_timeout).await {
                errors.push(e);
            }
        }

        let hook = self.on_terminate.lock().take();
        if let Some(hook) = hook {
            if let Err(e) = hook().await {
                warn!(component = %self.name, error = %e, "Driver release failed");
                errors.push(e);
            }
        }

        let _ = self.state.publish(ComponentState::Stopped);
        for close in &self.closers {
            close(&self.name);
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(DaqError::ShutdownFailed(errors)),
        }
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

/// Cancel `actions` newest first, then wait up to `timeout` for each. Actions that do
/// not finish are aborted with `ComponentTerminated(owner)` and reported as timeouts.
pub(crate) async fn settle_actions(
    owner: &str,
    actions: &[Arc<dyn ActionHandle>],
    timeout: Duration,
) -> Vec<DaqError> {
    let mut errors = Vec::new();
    for action in actions.iter().rev() {
        if !action.state().is_terminal() {
            action.cancel_boxed().await;
        }
    }
    for action in actions {
        if tokio::time::timeout(timeout, action.wait_boxed()).await.is_err() {
            warn!(component = %owner, action = %action.name(), "Action still running at terminate");
            errors.push(DaqError::Timeout(format!(
                "action '{}' of '{owner}' did not finish within {timeout:?}",
                action.name(),
            )));
            // the worker may be shared and outlive this component
            action.abort(DaqError::ComponentTerminated(owner.to_string()));
        }
    }
    errors
}

// =============================================================================
// ComponentBuilder
// =============================================================================

/// Builder for [`LocalComponent`].
///
/// ```rust,ignore
/// let exposure = Attribute::builder("exposureTime", 0.1).unit("s").range(0.001, 10.0).build();
/// let sensor = LocalComponent::builder("sensor", "ccd")
///     .attribute(&exposure)
///     .action("acquire", move |_: ()| Ok(Action::new("acquire", |_| async { Ok(42_u64) })))
///     .build()?;
/// ```
pub struct ComponentBuilder {
    name: String,
    role: String,
    attributes: AttributeSet,
    closers: Vec<Closer>,
    actions: BTreeMap<String, ActionFactory>,
    metadata: Metadata,
    affects: Vec<String>,
    dependencies: Vec<String>,
    worker: Option<Arc<ResourceWorker>>,
    on_terminate: Option<TerminateHook>,
    terminate_timeout: Duration,
    duplicates: Vec<String>,
}

impl ComponentBuilder {
    /// Create a builder.
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            attributes: AttributeSet::new(),
            closers: Vec::new(),
            actions: BTreeMap::new(),
            metadata: Metadata::new(),
            affects: Vec::new(),
            dependencies: Vec::new(),
            worker: None,
            on_terminate: None,
            terminate_timeout: DEFAULT_TERMINATE_TIMEOUT,
            duplicates: Vec::new(),
        }
    }

    /// Expose an attribute. The component shares it with the caller.
    pub fn attribute<T: AttributeValue>(mut self, attribute: &Attribute<T>) -> Self {
        if self.attributes.register(attribute).is_some() {
            self.duplicates.push(attribute.name().to_string());
        }
        let attribute = attribute.clone();
        self.closers
            .push(Box::new(move |owner: &str| attribute.close(owner)));
        self
    }

    /// Register an action. `factory` receives the decoded arguments (use `()` for none)
    /// and returns the action to run.
    pub fn action<A, T, F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        A: DeserializeOwned + 'static,
        T: ActionOutput + Serialize,
        F: Fn(A) -> DaqResult<Action<T>> + Send + Sync + 'static,
    {
        let name = name.into();
        let label = name.clone();
        let factory: ActionFactory = Arc::new(move |args: Value| {
            let args: A = serde_json::from_value(args).map_err(|e| {
                DaqError::validation(format!("{label}(args)"), e.to_string())
            })?;
            Ok(factory(args)?.map(|value| Ok(serde_json::to_value(value)?)))
        });
        self.actions.insert(name, factory);
        self
    }

    /// Static metadata.
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata.merge(&metadata);
        self
    }

    /// Components whose metadata depends on this one.
    pub fn affects<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.affects.extend(names.into_iter().map(Into::into));
        self
    }

    /// Declare a wrapped component.
    pub fn dependency(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    /// Run actions on a worker shared with other components (see
    /// [`crate::executor::ExecutorPool::bind`]). Without it the component gets its own.
    pub fn worker(mut self, worker: Arc<ResourceWorker>) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Driver hook releasing the hardware at terminate.
    pub fn on_terminate<F, Fut>(mut self, hook: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = DaqResult<()>> + Send + 'static,
    {
        self.on_terminate = Some(Box::new(move || hook().boxed()));
        self
    }

    /// How long terminate waits for outstanding actions.
    pub fn terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    /// Build the component.
    ///
    /// # Errors
    /// [`DaqError::Configuration`] for an empty name, an attribute named `state`, or two
    /// attributes with the same name.
    pub fn build(mut self) -> DaqResult<LocalComponent> {
        if self.name.trim().is_empty() {
            return Err(DaqError::Configuration("component name is empty".into()));
        }
        crate::limits::validate_name("component", &self.name)?;
        if !self.duplicates.is_empty() {
            return Err(DaqError::Configuration(format!(
                "component '{}' declares attribute(s) {:?} more than once",
                self.name, self.duplicates
            )));
        }
        if self.attributes.get(STATE_ATTRIBUTE).is_some() {
            return Err(DaqError::Configuration(format!(
                "component '{}': attribute name '{STATE_ATTRIBUTE}' is reserved",
                self.name
            )));
        }

        let state = Attribute::builder(STATE_ATTRIBUTE, ComponentState::Running)
            .description("Component lifecycle state")
            .read_only()
            .hidden()
            .build();
        self.attributes.register(&state);

        let (metadata, _) = watch::channel(self.metadata);
        debug!(component = %self.name, role = %self.role, "Built component");

        Ok(LocalComponent {
            name: self.name,
            role: self.role,
            attributes: self.attributes,
            closers: self.closers,
            state,
            actions: self.actions,
            metadata,
            affects: self.affects,
            dependencies: self.dependencies,
            shared_worker: self.worker,
            own_worker: Mutex::new(None),
            outstanding: Mutex::new(Vec::new()),
            on_terminate: Mutex::new(self.on_terminate),
            terminate_timeout: self.terminate_timeout,
            terminated: AtomicBool::new(false),
        })
    }
}
