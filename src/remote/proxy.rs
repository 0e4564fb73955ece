//! Local stand-ins for components hosted by a backend.
//!
//! A [`ComponentProxy`] is built from the descriptor returned by the handshake and
//! implements [`Component`], so callers cannot tell it from a local component. Each remote
//! attribute is an [`AttributeProxy`]:
//!
//! - reads are served from the push cache while the attribute is subscribed, and by a round
//!   trip otherwise;
//! - writes are always forwarded; backend errors come back as the same [`DaqError`] variant;
//! - the first local listener opens one push subscription, shared by every later listener,
//!   and the last one to go closes it.

use async_trait::async_trait;
use parking_lot::{Mutex, ReentrantMutex};
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use super::connection::{unexpected, Connection, PushEvent, PushSink};
use super::protocol::{Reply, Request, SubscriptionId};
use crate::action::ActionFuture;
use crate::attribute::{
    dispatch, AttributeEvent, AttributeHandle, AttributeInfo, Callback, EventListener,
    ListenerSet, Subscription, NEXT_ATTRIBUTE_ID,
};
use crate::component::{Component, ComponentDescriptor};
use crate::config::RemoteConfig;
use crate::error::{DaqError, DaqResult};
use crate::metadata::{Metadata, VOCABULARY_VERSION};
use crate::registry::ComponentRegistry;

fn check_vocabulary(descriptor: &ComponentDescriptor) -> DaqResult<()> {
    if descriptor.vocabulary_version != VOCABULARY_VERSION {
        return Err(DaqError::Configuration(format!(
            "component '{}' speaks metadata vocabulary v{}, this client v{VOCABULARY_VERSION}",
            descriptor.name, descriptor.vocabulary_version
        )));
    }
    Ok(())
}

// =============================================================================
// AttributeProxy
// =============================================================================

#[derive(Default)]
struct ProxyState {
    listeners: ListenerSet<AttributeEvent>,
    /// Listeners registered with `deliver_initial` that still wait for a value.
    awaiting_initial: HashSet<u64>,
    /// Latest pushed value; only valid while the push channel is up.
    cache: Option<Value>,
    /// Last value handed to listeners, kept across disconnects.
    last_delivered: Option<Value>,
    /// Set by a disconnect, cleared by the next initial push.
    resyncing: bool,
    remote: Option<SubscriptionId>,
}

/// Remote attribute.
pub struct AttributeProxy {
    id: u64,
    component: String,
    info: AttributeInfo,
    connection: Arc<Connection>,
    terminated: Arc<AtomicBool>,
    state: Mutex<ProxyState>,
    /// Serializes opening the push subscription.
    channel: tokio::sync::Mutex<()>,
    /// Held while listeners run, so a cached initial value never overtakes a push.
    delivery: ReentrantMutex<()>,
    me: Weak<AttributeProxy>,
}

impl std::fmt::Debug for AttributeProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeProxy")
            .field("component", &self.component)
            .field("attribute", &self.info.name)
            .field("subscribed", &self.is_subscribed())
            .finish()
    }
}

impl AttributeProxy {
    fn new(
        component: &str,
        info: AttributeInfo,
        connection: Arc<Connection>,
        terminated: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id: NEXT_ATTRIBUTE_ID.fetch_add(1, Ordering::Relaxed),
            component: component.to_string(),
            info,
            connection,
            terminated,
            state: Mutex::new(ProxyState::default()),
            channel: tokio::sync::Mutex::new(()),
            delivery: ReentrantMutex::new(()),
            me: me.clone(),
        })
    }

    /// Owning component name.
    pub fn component(&self) -> &str {
        &self.component
    }

    /// True while a push subscription is open.
    pub fn is_subscribed(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    /// Value currently served from the push cache, if any.
    pub fn cached(&self) -> Option<Value> {
        self.state.lock().cache.clone()
    }

    /// Number of local listeners.
    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    fn ensure_open(&self) -> DaqResult<()> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(DaqError::ComponentTerminated(self.component.clone()));
        }
        Ok(())
    }

    fn on_push(&self, event: &PushEvent) {
        let _delivery = self.delivery.lock();
        match event {
            PushEvent::Value { value, initial } => {
                let targets: Vec<Arc<Callback<AttributeEvent>>> = {
                    let mut state = self.state.lock();
                    state.cache = Some(value.clone());
                    let entries = state.listeners.entries();
                    let targets = if *initial {
                        let awaiting = std::mem::take(&mut state.awaiting_initial);
                        let resync = std::mem::take(&mut state.resyncing)
                            && state.last_delivered.as_ref() != Some(value);
                        entries
                            .into_iter()
                            .filter(|(id, _)| resync || awaiting.contains(id))
                            .map(|(_, callback)| callback)
                            .collect()
                    } else {
                        entries.into_iter().map(|(_, callback)| callback).collect()
                    };
                    state.last_delivered = Some(value.clone());
                    targets
                };
                dispatch(
                    &self.info.name,
                    &targets,
                    &AttributeEvent::Changed(value.clone()),
                );
            }
            PushEvent::ConnectionLost => {
                let listeners = {
                    let mut state = self.state.lock();
                    state.cache = None;
                    state.resyncing = true;
                    state.listeners.snapshot()
                };
                debug!(
                    component = %self.component,
                    attribute = %self.info.name,
                    listeners = listeners.len(),
                    "Notifying connection loss"
                );
                dispatch(&self.info.name, &listeners, &AttributeEvent::ConnectionLost);
            }
        }
    }

    fn release(&self, listener: u64) {
        let remote = {
            let mut state = self.state.lock();
            state.listeners.remove(listener);
            state.awaiting_initial.remove(&listener);
            if state.listeners.len() == 0 {
                state.cache = None;
                state.last_delivered = None;
                state.resyncing = false;
                state.remote.take()
            } else {
                None
            }
        };
        if let Some(subscription) = remote {
            self.close_remote(subscription);
        }
    }

    fn close_remote(&self, subscription: SubscriptionId) {
        let Some(proxy) = self.me.upgrade() else {
            return;
        };
        // without a runtime the connection is going away with it
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                proxy.connection.unsubscribe(subscription).await;
            });
        }
    }

    /// Drop every listener and the push subscription.
    fn detach(&self) {
        let remote = {
            let mut state = self.state.lock();
            let remote = state.remote.take();
            *state = ProxyState::default();
            remote
        };
        if let Some(subscription) = remote {
            self.close_remote(subscription);
        }
    }
}

#[async_trait]
impl AttributeHandle for AttributeProxy {
    fn name(&self) -> &str {
        &self.info.name
    }

    fn info(&self) -> AttributeInfo {
        self.info.clone()
    }

    async fn get_value(&self) -> DaqResult<Value> {
        self.ensure_open()?;
        if let Some(value) = self.cached() {
            return Ok(value);
        }
        let request = Request::GetAttribute {
            component: self.component.clone(),
            attribute: self.info.name.clone(),
        };
        match self.connection.call(request).await? {
            Reply::Value { value } => Ok(value),
            other => Err(unexpected("get_attribute", &other)),
        }
    }

    async fn set_value(&self, value: Value) -> DaqResult<()> {
        self.ensure_open()?;
        let request = Request::SetAttribute {
            component: self.component.clone(),
            attribute: self.info.name.clone(),
            value,
        };
        match self.connection.call(request).await {
            Ok(Reply::Ok) => Ok(()),
            Ok(other) => Err(unexpected("set_attribute", &other)),
            Err(e) => {
                debug!(component = %self.component, attribute = %self.info.name, error = %e, "Remote set failed");
                Err(e)
            }
        }
    }

    async fn subscribe_events(
        &self,
        listener: EventListener,
        deliver_initial: bool,
    ) -> DaqResult<Subscription> {
        self.ensure_open()?;
        let callback: Arc<Callback<AttributeEvent>> = listener;

        let channel = self.channel.lock().await;
        let open_remote = self.state.lock().remote.is_none();
        let id = if open_remote {
            let id = {
                let mut state = self.state.lock();
                let id = state.listeners.insert(&callback);
                if deliver_initial {
                    state.awaiting_initial.insert(id);
                }
                id
            };
            let weak = self.me.clone();
            let sink: PushSink = Arc::new(move |event: &PushEvent| {
                if let Some(proxy) = weak.upgrade() {
                    proxy.on_push(event);
                }
            });
            let opened = self
                .connection
                .subscribe(&self.component, &self.info.name, sink)
                .await;
            let mut state = self.state.lock();
            match opened {
                Ok(subscription) => state.remote = Some(subscription),
                Err(e) => {
                    state.listeners.remove(id);
                    state.awaiting_initial.remove(&id);
                    return Err(e);
                }
            }
            id
        } else {
            let _delivery = self.delivery.lock();
            let (id, cached) = {
                let mut state = self.state.lock();
                let id = state.listeners.insert(&callback);
                let cached = if deliver_initial { state.cache.clone() } else { None };
                if deliver_initial && cached.is_none() {
                    state.awaiting_initial.insert(id);
                }
                (id, cached)
            };
            if let Some(value) = cached {
                dispatch(
                    &self.info.name,
                    std::slice::from_ref(&callback),
                    &AttributeEvent::Changed(value),
                );
            }
            id
        };
        drop(channel);

        let weak = self.me.clone();
        Ok(Subscription::new(
            self.id,
            self.info.name.clone(),
            Box::new(move || {
                if let Some(proxy) = weak.upgrade() {
                    proxy.release(id);
                }
            }),
            Box::new(callback),
        ))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// =============================================================================
// ComponentProxy
// =============================================================================

/// Remote component.
pub struct ComponentProxy {
    connection: Arc<Connection>,
    descriptor: ComponentDescriptor,
    attributes: BTreeMap<String, Arc<AttributeProxy>>,
    terminated: Arc<AtomicBool>,
}

impl std::fmt::Debug for ComponentProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentProxy")
            .field("name", &self.descriptor.name)
            .field("address", &self.connection.address())
            .finish()
    }
}

impl ComponentProxy {
    /// Open a dedicated connection to `address` and attach to `component`.
    ///
    /// # Errors
    /// [`DaqError::RemoteCommunication`] if the backend is unreachable,
    /// [`DaqError::UnknownComponent`] if it does not host `component`,
    /// [`DaqError::Configuration`] on a metadata vocabulary mismatch.
    pub async fn connect(address: &str, component: &str, config: RemoteConfig) -> DaqResult<Self> {
        let connection = Arc::new(Connection::open(address, config).await?);
        Self::attach(connection, component).await
    }

    /// Attach to `component` over an existing connection (schema handshake).
    pub async fn attach(connection: Arc<Connection>, component: &str) -> DaqResult<Self> {
        let request = Request::Describe {
            component: component.to_string(),
        };
        match connection.call(request).await? {
            Reply::Descriptor { descriptor } => Self::from_descriptor(connection, descriptor),
            other => Err(unexpected("describe", &other)),
        }
    }

    fn from_descriptor(
        connection: Arc<Connection>,
        descriptor: ComponentDescriptor,
    ) -> DaqResult<Self> {
        check_vocabulary(&descriptor)?;
        let terminated = Arc::new(AtomicBool::new(false));
        let attributes = descriptor
            .attributes
            .iter()
            .map(|info| {
                let proxy = AttributeProxy::new(
                    &descriptor.name,
                    info.clone(),
                    Arc::clone(&connection),
                    Arc::clone(&terminated),
                );
                (info.name.clone(), proxy)
            })
            .collect();
        debug!(
            component = %descriptor.name,
            address = %connection.address(),
            attributes = descriptor.attributes.len(),
            actions = descriptor.actions.len(),
            "Attached component proxy"
        );
        Ok(Self {
            connection,
            descriptor,
            attributes,
            terminated,
        })
    }

    /// Schema received during the handshake.
    pub fn descriptor(&self) -> &ComponentDescriptor {
        &self.descriptor
    }

    /// Underlying connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Concrete proxy of one attribute.
    pub fn attribute_proxy(&self, name: &str) -> DaqResult<Arc<AttributeProxy>> {
        self.attributes
            .get(name)
            .cloned()
            .ok_or_else(|| DaqError::UnknownAttribute {
                component: self.descriptor.name.clone(),
                attribute: name.to_string(),
            })
    }

    /// Terminate the component on the backend, then detach this proxy.
    pub async fn terminate_remote(&self) -> DaqResult<()> {
        self.ensure_open()?;
        let request = Request::Terminate {
            component: self.descriptor.name.clone(),
        };
        match self.connection.call(request).await? {
            Reply::Ok => self.terminate().await,
            other => Err(unexpected("terminate", &other)),
        }
    }

    fn ensure_open(&self) -> DaqResult<()> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(DaqError::ComponentTerminated(self.descriptor.name.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl Component for ComponentProxy {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn role(&self) -> &str {
        &self.descriptor.role
    }

    fn attribute_names(&self) -> Vec<String> {
        self.attributes.keys().cloned().collect()
    }

    fn attribute(&self, name: &str) -> DaqResult<Arc<dyn AttributeHandle>> {
        Ok(self.attribute_proxy(name)? as Arc<dyn AttributeHandle>)
    }

    fn action_names(&self) -> Vec<String> {
        self.descriptor.actions.clone()
    }

    async fn execute(&self, action: &str, args: Value) -> DaqResult<ActionFuture<Value>> {
        self.ensure_open()?;
        if !self.descriptor.actions.iter().any(|a| a == action) {
            return Err(DaqError::UnknownAction {
                component: self.descriptor.name.clone(),
                action: action.to_string(),
            });
        }
        self.connection
            .execute(&self.descriptor.name, action, args)
            .await
    }

    async fn metadata(&self) -> DaqResult<Metadata> {
        self.ensure_open()?;
        let request = Request::GetMetadata {
            component: self.descriptor.name.clone(),
        };
        match self.connection.call(request).await? {
            Reply::Metadata { metadata } => Metadata::try_from_raw(metadata),
            other => Err(unexpected("get_metadata", &other)),
        }
    }

    async fn update_metadata(&self, partial: Metadata) -> DaqResult<()> {
        self.ensure_open()?;
        let request = Request::UpdateMetadata {
            component: self.descriptor.name.clone(),
            metadata: partial.to_raw(),
        };
        match self.connection.call(request).await? {
            Reply::Ok => Ok(()),
            other => Err(unexpected("update_metadata", &other)),
        }
    }

    fn affects(&self) -> Vec<String> {
        self.descriptor.affects.clone()
    }

    fn dependencies(&self) -> Vec<String> {
        self.descriptor.dependencies.clone()
    }

    /// Detach locally: listeners are dropped and later calls fail. The backend component
    /// keeps running; see [`ComponentProxy::terminate_remote`].
    async fn terminate(&self) -> DaqResult<()> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for attribute in self.attributes.values() {
            attribute.detach();
        }
        info!(component = %self.descriptor.name, "Detached component proxy");
        Ok(())
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn describe(&self) -> ComponentDescriptor {
        self.descriptor.clone()
    }
}

// =============================================================================
// RemoteBackend
// =============================================================================

/// Every component of one backend, sharing a single connection.
#[derive(Debug)]
pub struct RemoteBackend {
    connection: Arc<Connection>,
    components: Vec<Arc<ComponentProxy>>,
}

impl RemoteBackend {
    /// Connect, check the vocabulary version and attach to every hosted component.
    pub async fn connect(address: &str, config: RemoteConfig) -> DaqResult<Self> {
        let connection = Arc::new(Connection::open(address, config).await?);

        match connection.call(Request::Ping).await? {
            Reply::Pong { vocabulary_version } if vocabulary_version == VOCABULARY_VERSION => {}
            Reply::Pong { vocabulary_version } => {
                let err = DaqError::Configuration(format!(
                    "backend speaks metadata vocabulary v{vocabulary_version}, this client v{VOCABULARY_VERSION}"
                ));
                warn!(address, error = %err, "Handshake failed");
                return Err(err);
            }
            other => return Err(unexpected("ping", &other)),
        }

        let descriptors = match connection.call(Request::ListComponents).await? {
            Reply::Components { descriptors } => descriptors,
            other => return Err(unexpected("list_components", &other)),
        };
        let components = descriptors
            .into_iter()
            .map(|d| ComponentProxy::from_descriptor(Arc::clone(&connection), d).map(Arc::new))
            .collect::<DaqResult<Vec<_>>>()?;
        info!(address, components = components.len(), "Attached to backend");

        Ok(Self {
            connection,
            components,
        })
    }

    /// Shared connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Every proxy, in backend registration order.
    pub fn components(&self) -> &[Arc<ComponentProxy>] {
        &self.components
    }

    /// Proxy by component name.
    pub fn get(&self, name: &str) -> DaqResult<Arc<ComponentProxy>> {
        self.components
            .iter()
            .find(|c| c.name() == name)
            .cloned()
            .ok_or_else(|| DaqError::UnknownComponent(name.to_string()))
    }

    /// Register every proxy into a local registry.
    pub fn register_into(&self, registry: &ComponentRegistry) -> DaqResult<()> {
        for component in &self.components {
            registry.register(Arc::clone(component) as Arc<dyn Component>)?;
        }
        Ok(())
    }
}
