//! Components composed from other components.
//!
//! A [`CompositeComponent`] wraps an ordered list of `(role, component)` dependencies and
//! exposes the union of their non-hidden attributes and actions. The schema (which
//! dependency serves which attribute) is computed once, at construction:
//!
//! - **First wins.** When two dependencies expose the same attribute, the earlier one
//!   serves it.
//! - **Explicit routes.** The alternative policy exists only as the named capability
//!   [`CompositeBuilder::route`], which pins one attribute to one dependency role.
//!
//! Metadata reads return the primary (first) dependency's metadata with the composite's
//! own overrides merged on top. Terminating a composite cancels the actions it forwarded
//! and silences the subscriptions made through it, but does not terminate its
//! dependencies; they are owned by the registry like any other component.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::action::{ActionFuture, ActionHandle};
use crate::attribute::{
    Attribute, AttributeEvent, AttributeHandle, AttributeInfo, EventListener, Subscription,
};
use crate::component::{
    settle_actions, Component, ComponentState, DEFAULT_TERMINATE_TIMEOUT, STATE_ATTRIBUTE,
};
use crate::error::{DaqError, DaqResult};
use crate::metadata::Metadata;

/// Attribute of a dependency, guarded by the composite's lifecycle.
struct RoutedAttribute {
    owner: String,
    terminated: Arc<AtomicBool>,
    inner: Arc<dyn AttributeHandle>,
}

impl RoutedAttribute {
    fn ensure_running(&self) -> DaqResult<()> {
        if self.terminated.load(Ordering::SeqCst) {
            Err(DaqError::ComponentTerminated(self.owner.clone()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AttributeHandle for RoutedAttribute {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn info(&self) -> AttributeInfo {
        self.inner.info()
    }

    async fn get_value(&self) -> DaqResult<Value> {
        self.ensure_running()?;
        self.inner.get_value().await
    }

    async fn set_value(&self, value: Value) -> DaqResult<()> {
        self.ensure_running()?;
        self.inner.set_value(value).await
    }

    async fn subscribe_events(
        &self,
        listener: EventListener,
        deliver_initial: bool,
    ) -> DaqResult<Subscription> {
        self.ensure_running()?;
        let terminated = Arc::clone(&self.terminated);
        let gated: EventListener = Arc::new(move |event: &AttributeEvent| {
            if !terminated.load(Ordering::SeqCst) {
                listener(event);
            }
        });
        self.inner.subscribe_events(gated, deliver_initial).await
    }

    fn as_any(&self) -> &dyn Any {
        self.inner.as_any()
    }
}

/// A component exposing the union of its dependencies.
pub struct CompositeComponent {
    name: String,
    role: String,
    dependencies: Vec<(String, Arc<dyn Component>)>,
    attributes: BTreeMap<String, (usize, Arc<dyn AttributeHandle>)>,
    actions: BTreeMap<String, usize>,
    state: Attribute<ComponentState>,
    overrides: Mutex<Metadata>,
    affects: Vec<String>,
    /// Actions forwarded to dependencies, settled at terminate.
    outstanding: Mutex<Vec<Arc<dyn ActionHandle>>>,
    terminate_timeout: Duration,
    terminated: Arc<AtomicBool>,
}

impl fmt::Debug for CompositeComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeComponent")
            .field("name", &self.name)
            .field("role", &self.role)
            .field(
                "dependencies",
                &self.dependencies.iter().map(|(r, _)| r).collect::<Vec<_>>(),
            )
            .field("attributes", &self.attributes.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CompositeComponent {
    /// Start building a composite.
    pub fn builder(name: impl Into<String>, role: impl Into<String>) -> CompositeBuilder {
        CompositeBuilder::new(name, role)
    }

    /// Dependency registered under `role`.
    pub fn dependency(&self, role: &str) -> Option<&Arc<dyn Component>> {
        self.dependencies
            .iter()
            .find(|(r, _)| r == role)
            .map(|(_, c)| c)
    }

    /// Role of the dependency serving `attribute`.
    pub fn source_of(&self, attribute: &str) -> Option<&str> {
        self.attributes
            .get(attribute)
            .map(|(idx, _)| self.dependencies[*idx].0.as_str())
    }

    /// Lifecycle attribute.
    pub fn state(&self) -> &Attribute<ComponentState> {
        &self.state
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
impl Component for CompositeComponent {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> &str {
        &self.role
    }

    fn attribute_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.attributes.keys().cloned().collect();
        names.push(STATE_ATTRIBUTE.to_string());
        names.sort();
        names
    }

    fn attribute(&self, name: &str) -> DaqResult<Arc<dyn AttributeHandle>> {
        if name == STATE_ATTRIBUTE {
            return Ok(self.state.handle());
        }
        self.attributes
            .get(name)
            .map(|(_, handle)| Arc::clone(handle))
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
        let idx = *self
            .actions
            .get(action)
            .ok_or_else(|| DaqError::UnknownAction {
                component: self.name.clone(),
                action: action.to_string(),
            })?;
        let future = self.dependencies[idx].1.execute(action, args).await?;
        {
            let mut outstanding = self.outstanding.lock();
            outstanding.retain(|a| !a.state().is_terminal());
            outstanding.push(Arc::new(future.clone()));
        }
        if self.is_terminated() {
            // raced with terminate
            future.cancel().await;
            return Err(DaqError::ComponentTerminated(self.name.clone()));
        }
        Ok(future)
    }

    async fn metadata(&self) -> DaqResult<Metadata> {
        let (_, primary) = &self.dependencies[0];
        let mut metadata = primary.metadata().await?;
        metadata.merge(&self.overrides.lock());
        Ok(metadata)
    }

    fn metadata_receiver(&self) -> Option<tokio::sync::watch::Receiver<Metadata>> {
        self.dependencies[0].1.metadata_receiver()
    }

    async fn update_metadata(&self, partial: Metadata) -> DaqResult<()> {
        self.ensure_running()?;
        if self.overrides.lock().merge(&partial) {
            debug!(component = %self.name, keys = partial.len(), "Composite metadata overridden");
        }
        Ok(())
    }

    fn affects(&self) -> Vec<String> {
        self.affects.clone()
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies
            .iter()
            .map(|(_, c)| c.name().to_string())
            .collect()
    }

    async fn terminate(&self) -> DaqResult<()> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(component = %self.name, "Terminating composite");
        let actions: Vec<_> = std::mem::take(&mut *self.outstanding.lock());
        let mut errors = settle_actions(&self.name, &actions, self.terminate_timeout).await;

        let _ = self.state.publish(ComponentState::Stopped);
        self.state.close(&self.name);

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

/// Builder for [`CompositeComponent`].
pub struct CompositeBuilder {
    name: String,
    role: String,
    dependencies: Vec<(String, Arc<dyn Component>)>,
    routes: Vec<(String, String)>,
    metadata: Metadata,
    affects: Vec<String>,
    terminate_timeout: Duration,
}

impl CompositeBuilder {
    /// Create a builder.
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            dependencies: Vec::new(),
            routes: Vec::new(),
            metadata: Metadata::new(),
            affects: Vec::new(),
            terminate_timeout: DEFAULT_TERMINATE_TIMEOUT,
        }
    }

    /// Append a dependency. Earlier dependencies take precedence.
    pub fn dependency(mut self, role: impl Into<String>, component: Arc<dyn Component>) -> Self {
        self.dependencies.push((role.into(), component));
        self
    }

    /// Serve `attribute` from the dependency registered under `role`, overriding the
    /// first-wins rule for that one attribute.
    pub fn route(mut self, attribute: impl Into<String>, role: impl Into<String>) -> Self {
        self.routes.push((attribute.into(), role.into()));
        self
    }

    /// Metadata overrides applied on top of the primary dependency's metadata.
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata.merge(&metadata);
        self
    }

    /// Components whose metadata depends on this composite.
    pub fn affects<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.affects.extend(names.into_iter().map(Into::into));
        self
    }

    /// How long terminate waits for forwarded actions.
    pub fn terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    /// Build the schema.
    ///
    /// # Errors
    /// [`DaqError::Configuration`] for zero dependencies, duplicate roles, a terminated
    /// dependency, or a route naming an unknown role or attribute.
    pub fn build(self) -> DaqResult<CompositeComponent> {
        if self.dependencies.is_empty() {
            return Err(DaqError::Configuration(format!(
                "composite '{}' has no dependencies",
                self.name
            )));
        }

        let mut roles = HashSet::new();
        for (role, component) in &self.dependencies {
            if !roles.insert(role.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "composite '{}' lists role '{role}' twice",
                    self.name
                )));
            }
            if component.is_terminated() {
                return Err(DaqError::Configuration(format!(
                    "composite '{}': dependency '{}' is terminated",
                    self.name,
                    component.name()
                )));
            }
        }

        let terminated = Arc::new(AtomicBool::new(false));
        let guard = |handle: Arc<dyn AttributeHandle>| -> Arc<dyn AttributeHandle> {
            Arc::new(RoutedAttribute {
                owner: self.name.clone(),
                terminated: Arc::clone(&terminated),
                inner: handle,
            })
        };

        let mut attributes = BTreeMap::new();
        let mut actions = BTreeMap::new();
        for (idx, (role, component)) in self.dependencies.iter().enumerate() {
            for name in component.attribute_names() {
                let handle = component.attribute(&name)?;
                if handle.info().hidden || attributes.contains_key(&name) {
                    continue;
                }
                debug!(composite = %self.name, attribute = %name, role = %role, "Attribute source");
                attributes.insert(name, (idx, guard(handle)));
            }
            for action in component.action_names() {
                actions.entry(action).or_insert(idx);
            }
        }

        for (attribute, role) in &self.routes {
            let idx = self
                .dependencies
                .iter()
                .position(|(r, _)| r == role)
                .ok_or_else(|| {
                    DaqError::Configuration(format!(
                        "composite '{}': route for '{attribute}' names unknown role '{role}'",
                        self.name
                    ))
                })?;
            let handle = self.dependencies[idx]
                .1
                .attribute(attribute)
                .map_err(|_| {
                    DaqError::Configuration(format!(
                        "composite '{}': dependency '{role}' has no attribute '{attribute}'",
                        self.name
                    ))
                })?;
            if let Some((previous, _)) = attributes.get(attribute) {
                if *previous != idx {
                    warn!(
                        composite = %self.name,
                        attribute = %attribute,
                        role = %role,
                        "Explicit route overrides first-wins source"
                    );
                }
            }
            attributes.insert(attribute.clone(), (idx, guard(handle)));
        }

        let state = Attribute::builder(STATE_ATTRIBUTE, ComponentState::Running)
            .description("Component lifecycle state")
            .read_only()
            .hidden()
            .build();

        info!(
            composite = %self.name,
            dependencies = self.dependencies.len(),
            attributes = attributes.len(),
            "Built composite component"
        );

        Ok(CompositeComponent {
            name: self.name,
            role: self.role,
            dependencies: self.dependencies,
            attributes,
            actions,
            state,
            overrides: Mutex::new(self.metadata),
            affects: self.affects,
            outstanding: Mutex::new(Vec::new()),
            terminate_timeout: self.terminate_timeout,
            terminated,
        })
    }
}
