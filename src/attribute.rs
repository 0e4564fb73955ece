//! Reactive attributes
//!
//! A typed, validated, observable value holder. Inspired by ScopeFoundry's LoggedQuantity
//! and QCodes parameters, an [`Attribute<T>`] keeps one value and notifies listeners on
//! every *effective* change.
//!
//! # Features
//!
//! - Validation through a [`Constraint`] (range, choices or custom function) and an
//!   optional driver setter that may adjust the accepted value
//! - Synchronous listeners, invoked on the thread that called `set()`, in mutation order
//! - Async observation through `tokio::sync::watch` (see [`Attribute::watch`])
//! - No notification for a no-op assignment (equality, not identity)
//! - A failed validation leaves the previous value untouched
//! - Type-erased JSON access through [`AttributeHandle`], shared with remote proxies
//!
//! # Listener ownership
//!
//! The attribute holds only a weak reference to each listener. The strong reference lives
//! in the returned [`Subscription`]: dropping the subscription unregisters the listener, and
//! the subscription itself only holds a weak reference back to the attribute, so neither
//! side keeps the other alive.
//!
//! # Example
//!
//! ```rust,ignore
//! let exposure = Attribute::builder("exposureTime", 0.1)
//!     .unit("s")
//!     .range(0.001, 10.0)
//!     .build();
//!
//! let _sub = exposure.subscribe(|v| println!("exposure now {v}"), false);
//! exposure.set(0.05)?;           // notifies
//! exposure.set(0.05)?;           // no-op, no notification
//! assert!(exposure.set(50.0).is_err());
//! assert_eq!(exposure.get(), 0.05);
//! ```

use async_trait::async_trait;
use parking_lot::{Mutex, ReentrantMutex};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, error, trace, warn};

use crate::error::{DaqError, DaqResult};

pub(crate) static NEXT_ATTRIBUTE_ID: AtomicU64 = AtomicU64::new(1);

/// Bound for attribute values. Every value type is declared once, at attribute creation,
/// and that type is its canonical representation.
pub trait AttributeValue:
    Clone + PartialEq + PartialOrd + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> AttributeValue for T where
    T: Clone + PartialEq + PartialOrd + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

// =============================================================================
// Constraints
// =============================================================================

/// Validity constraint of an attribute.
#[derive(Clone, Default)]
pub enum Constraint<T> {
    /// No constraints - all values accepted.
    #[default]
    None,

    /// Inclusive numeric range: `min <= value <= max`.
    Range {
        /// Minimum allowed value (inclusive).
        min: T,
        /// Maximum allowed value (inclusive).
        max: T,
    },

    /// Value must equal one of the choices.
    Choices(Vec<T>),

    /// Custom validation function returning a human-readable reason on failure.
    Custom(Arc<dyn Fn(&T) -> Result<(), String> + Send + Sync>),
}

impl<T: AttributeValue> Constraint<T> {
    /// Validate `value`, describing the violated constraint on failure.
    pub fn check(&self, value: &T) -> Result<(), String> {
        match self {
            Constraint::None => Ok(()),
            Constraint::Range { min, max } => {
                // written so that unordered values (NaN) are rejected
                if value >= min && value <= max {
                    Ok(())
                } else {
                    Err(format!("Value {value:?} out of range [{min:?}, {max:?}]"))
                }
            }
            Constraint::Choices(choices) => {
                if choices.iter().any(|c| c == value) {
                    Ok(())
                } else {
                    Err(format!("Value {value:?} not in choices {choices:?}"))
                }
            }
            Constraint::Custom(validator) => validator(value),
        }
    }

    /// Serializable description used for introspection and the remote handshake.
    pub fn info(&self) -> ConstraintInfo {
        let to_json = |v: &T| serde_json::to_value(v).unwrap_or(Value::Null);
        match self {
            Constraint::None => ConstraintInfo::None,
            Constraint::Range { min, max } => ConstraintInfo::Range {
                min: to_json(min),
                max: to_json(max),
            },
            Constraint::Choices(choices) => ConstraintInfo::Choices {
                values: choices.iter().map(to_json).collect(),
            },
            Constraint::Custom(_) => ConstraintInfo::Custom,
        }
    }
}

impl<T: Debug> Debug for Constraint<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constraint::None => write!(f, "None"),
            Constraint::Range { min, max } => f
                .debug_struct("Range")
                .field("min", min)
                .field("max", max)
                .finish(),
            Constraint::Choices(choices) => f.debug_tuple("Choices").field(choices).finish(),
            Constraint::Custom(_) => write!(f, "Custom(<function>)"),
        }
    }
}

/// JSON rendering of a [`Constraint`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum ConstraintInfo {
    None,
    Range { min: Value, max: Value },
    Choices { values: Vec<Value> },
    Custom,
}

/// Introspection record of one attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeInfo {
    /// Attribute name, unique within its component.
    pub name: String,
    /// Rust type of the value.
    pub type_name: String,
    /// Physical unit, informational only.
    pub unit: Option<String>,
    /// Human-readable description.
    pub description: Option<String>,
    /// Read-only attributes reject `set()`.
    pub read_only: bool,
    /// Hidden attributes are not exported by composites.
    pub hidden: bool,
    /// Validity constraint.
    pub constraint: ConstraintInfo,
}

// =============================================================================
// Listeners and subscriptions
// =============================================================================

pub(crate) type Callback<E> = dyn Fn(&E) + Send + Sync;

/// Weakly held listener registrations, in registration order.
pub(crate) struct ListenerSet<E: ?Sized + 'static> {
    next_id: u64,
    entries: Vec<(u64, Weak<Callback<E>>)>,
}

impl<E: ?Sized + 'static> Default for ListenerSet<E> {
    fn default() -> Self {
        Self {
            next_id: 1,
            entries: Vec::new(),
        }
    }
}

impl<E: ?Sized + 'static> ListenerSet<E> {
    pub(crate) fn insert(&mut self, callback: &Arc<Callback<E>>) -> u64 {
        self.prune();
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push((id, Arc::downgrade(callback)));
        id
    }

    pub(crate) fn remove(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        before != self.entries.len()
    }

    /// Live listeners, dropping registrations whose owner went away.
    pub(crate) fn snapshot(&mut self) -> Vec<Arc<Callback<E>>> {
        self.prune();
        self.entries.iter().filter_map(|(_, w)| w.upgrade()).collect()
    }

    /// Live listeners with their registration ids.
    pub(crate) fn entries(&mut self) -> Vec<(u64, Arc<Callback<E>>)> {
        self.prune();
        self.entries
            .iter()
            .filter_map(|(id, w)| w.upgrade().map(|callback| (*id, callback)))
            .collect()
    }

    pub(crate) fn len(&mut self) -> usize {
        self.prune();
        self.entries.len()
    }

    fn prune(&mut self) {
        self.entries.retain(|(_, w)| w.strong_count() > 0);
    }
}

/// Invoke every listener, isolating failures: a panicking listener is logged and skipped.
pub(crate) fn dispatch<E: ?Sized>(attribute: &str, listeners: &[Arc<Callback<E>>], event: &E) {
    dispatch_while(attribute, listeners, event, || true);
}

/// Like [`dispatch`], but stops as soon as `current` reports that `event` was superseded.
pub(crate) fn dispatch_while<E: ?Sized>(
    attribute: &str,
    listeners: &[Arc<Callback<E>>],
    event: &E,
    current: impl Fn() -> bool,
) {
    for listener in listeners {
        if !current() {
            trace!(attribute, "Notification superseded by a newer value");
            break;
        }
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(event))) {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "<non-string panic>".to_string());
            error!(attribute, %reason, "Attribute listener failed");
        }
    }
}

/// Registration token returned by `subscribe`.
///
/// Owns the listener. Dropping it (or calling [`Subscription::unsubscribe`]) removes the
/// listener; removal is idempotent.
pub struct Subscription {
    source: u64,
    attribute: String,
    release: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    _listener: Box<dyn Any + Send + Sync>,
}

impl Subscription {
    pub(crate) fn new(
        source: u64,
        attribute: impl Into<String>,
        release: Box<dyn FnOnce() + Send>,
        listener: Box<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            source,
            attribute: attribute.into(),
            release: Mutex::new(Some(release)),
            _listener: listener,
        }
    }

    /// Name of the observed attribute.
    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    /// True until `unsubscribe` ran.
    pub fn is_active(&self) -> bool {
        self.release.lock().is_some()
    }

    /// Remove the listener. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        let release = self.release.lock().take();
        if let Some(release) = release {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("attribute", &self.attribute)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Event delivered to type-erased listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeEvent {
    /// The value changed (or the initial value, when requested).
    Changed(Value),
    /// The push channel to a remote component dropped. Delivered once per drop.
    ConnectionLost,
}

/// Listener for type-erased subscriptions.
pub type EventListener = Arc<dyn Fn(&AttributeEvent) + Send + Sync>;

// =============================================================================
// Attribute<T>
// =============================================================================

type Setter<T> = Arc<dyn Fn(T) -> DaqResult<T> + Send + Sync>;

struct AttributeInner<T: AttributeValue> {
    id: u64,
    name: String,
    description: Option<String>,
    unit: Option<String>,
    read_only: bool,
    hidden: bool,
    constraint: Constraint<T>,
    setter: Option<Setter<T>>,
    /// Serializes store + notify so listeners see changes in mutation order.
    /// Reentrant: a listener may set the attribute that notified it.
    mutation: ReentrantMutex<()>,
    /// Bumped on every stored change; a nested change supersedes the outer notification.
    generation: AtomicU64,
    value: Mutex<T>,
    listeners: Mutex<ListenerSet<T>>,
    sender: watch::Sender<T>,
    /// Owner name once the owning component was terminated.
    closed: Mutex<Option<String>>,
}

/// A thread-safe, validated, observable value.
///
/// Cloning shares the same underlying value and listener set (like cloning a watch sender).
pub struct Attribute<T: AttributeValue> {
    inner: Arc<AttributeInner<T>>,
}

impl<T: AttributeValue> Clone for Attribute<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: AttributeValue> Debug for Attribute<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attribute")
            .field("name", &self.inner.name)
            .field("value", &*self.inner.value.lock())
            .field("constraint", &self.inner.constraint)
            .field("read_only", &self.inner.read_only)
            .finish()
    }
}

impl<T: AttributeValue> Attribute<T> {
    /// Create an unconstrained, writable attribute.
    pub fn new(name: impl Into<String>, initial: T) -> Self {
        AttributeBuilder::new(name, initial).build()
    }

    /// Start building an attribute.
    pub fn builder(name: impl Into<String>, initial: T) -> AttributeBuilder<T> {
        AttributeBuilder::new(name, initial)
    }

    /// Attribute name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Physical unit.
    pub fn unit(&self) -> Option<&str> {
        self.inner.unit.as_deref()
    }

    /// Description.
    pub fn description(&self) -> Option<&str> {
        self.inner.description.as_deref()
    }

    /// Read-only flag.
    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    /// Hidden flag.
    pub fn is_hidden(&self) -> bool {
        self.inner.hidden
    }

    /// Validity constraint.
    pub fn constraint(&self) -> &Constraint<T> {
        &self.inner.constraint
    }

    /// Current value. No side effects.
    ///
    /// Keeps answering after the owning component terminated, so a driver can still read
    /// its last state; the JSON handle ([`AttributeHandle::get_value`]) reports
    /// `ComponentTerminated` instead. Use [`Attribute::is_closed`] to tell the two apart.
    pub fn get(&self) -> T {
        self.inner.value.lock().clone()
    }

    /// Validate and assign a new value.
    ///
    /// Fails with `ReadOnly` or `Validation` without touching the current value. A valid
    /// value equal to the current one is accepted silently; otherwise the value is stored
    /// and every live listener is invoked before this call returns.
    pub fn set(&self, value: T) -> DaqResult<()> {
        self.ensure_open()?;

        if self.inner.read_only {
            warn!(attribute = %self.inner.name, "Rejected write to read-only attribute");
            return Err(DaqError::ReadOnly {
                attribute: self.inner.name.clone(),
            });
        }

        if let Err(reason) = self.inner.constraint.check(&value) {
            warn!(attribute = %self.inner.name, %reason, "Rejected invalid value");
            return Err(DaqError::validation(self.inner.name.clone(), reason));
        }

        let value = match &self.inner.setter {
            Some(setter) => setter(value).inspect_err(|e| {
                warn!(attribute = %self.inner.name, error = %e, "Setter rejected value");
            })?,
            None => value,
        };

        self.store(value);
        Ok(())
    }

    /// Driver-side update: bypasses the read-only flag and the constraint (the hardware is
    /// the source of truth). No-op assignments are still not notified.
    pub fn publish(&self, value: T) -> DaqResult<()> {
        self.ensure_open()?;
        self.store(value);
        Ok(())
    }

    fn store(&self, value: T) {
        let _guard = self.inner.mutation.lock();
        {
            let mut current = self.inner.value.lock();
            if *current == value {
                return;
            }
            *current = value.clone();
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.sender.send_replace(value.clone());

        let listeners = self.inner.listeners.lock().snapshot();
        debug!(
            attribute = %self.inner.name,
            value = ?value,
            listeners = listeners.len(),
            "Attribute changed"
        );
        // a listener that sets this attribute again has already notified everyone of the
        // newer value; the rest of this round must not overwrite it with the old one
        dispatch_while(&self.inner.name, &listeners, &value, || {
            self.inner.generation.load(Ordering::SeqCst) == generation
        });
    }

    /// Register a listener. With `deliver_initial`, the listener is called once with the
    /// current value before this returns, and then once per effective change.
    pub fn subscribe<F>(&self, listener: F, deliver_initial: bool) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let callback: Arc<Callback<T>> = Arc::new(listener);

        let guard = self.inner.mutation.lock();
        let id = self.inner.listeners.lock().insert(&callback);
        if deliver_initial {
            let current = self.get();
            dispatch(&self.inner.name, std::slice::from_ref(&callback), &current);
        }
        drop(guard);

        let weak = Arc::downgrade(&self.inner);
        Subscription::new(
            self.inner.id,
            self.inner.name.clone(),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.listeners.lock().remove(id);
                }
            }),
            Box::new(callback),
        )
    }

    /// Remove a listener registered on this attribute. Idempotent; subscriptions of other
    /// attributes are ignored.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        if subscription.source == self.inner.id {
            subscription.unsubscribe();
        }
    }

    /// Number of live listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// Async receiver that observes the latest value.
    pub fn watch(&self) -> watch::Receiver<T> {
        self.inner.sender.subscribe()
    }

    /// Stream of values, starting with the current one.
    pub fn stream(&self) -> WatchStream<T> {
        WatchStream::new(self.watch())
    }

    /// Introspection record.
    pub fn info(&self) -> AttributeInfo {
        AttributeInfo {
            name: self.inner.name.clone(),
            type_name: std::any::type_name::<T>().to_string(),
            unit: self.inner.unit.clone(),
            description: self.inner.description.clone(),
            read_only: self.inner.read_only,
            hidden: self.inner.hidden,
            constraint: self.inner.constraint.info(),
        }
    }

    /// True once the owning component was terminated.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.lock().is_some()
    }

    /// Mark the attribute as belonging to a terminated component.
    pub(crate) fn close(&self, owner: &str) {
        *self.inner.closed.lock() = Some(owner.to_string());
    }

    fn ensure_open(&self) -> DaqResult<()> {
        match &*self.inner.closed.lock() {
            Some(owner) => Err(DaqError::ComponentTerminated(owner.clone())),
            None => Ok(()),
        }
    }

    /// Parse a JSON value into the declared type. This is the single coercion point
    /// between the wire representation and the attribute's canonical type.
    fn coerce(&self, value: Value) -> DaqResult<T> {
        serde_json::from_value::<T>(value.clone()).map_err(|e| {
            DaqError::validation(
                self.inner.name.clone(),
                format!(
                    "cannot convert {value} to {}: {e}",
                    std::any::type_name::<T>()
                ),
            )
        })
    }

    /// Type-erased handle sharing this attribute.
    pub fn handle(&self) -> Arc<dyn AttributeHandle> {
        Arc::new(self.clone())
    }
}

// =============================================================================
// AttributeBuilder
// =============================================================================

/// Builder for attributes with a fluent API.
///
/// ```rust,ignore
/// let binning = AttributeBuilder::new("binning", 1_u32)
///     .description("Sensor binning")
///     .choices(vec![1, 2, 4])
///     .build();
/// ```
pub struct AttributeBuilder<T: AttributeValue> {
    name: String,
    initial: T,
    description: Option<String>,
    unit: Option<String>,
    read_only: bool,
    hidden: bool,
    constraint: Constraint<T>,
    setter: Option<Setter<T>>,
}

impl<T: AttributeValue> AttributeBuilder<T> {
    /// Create a new builder.
    pub fn new(name: impl Into<String>, initial: T) -> Self {
        Self {
            name: name.into(),
            initial,
            description: None,
            unit: None,
            read_only: false,
            hidden: false,
            constraint: Constraint::None,
            setter: None,
        }
    }

    /// Human-readable description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Physical unit (e.g. "s", "m", "W").
    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Inclusive range constraint.
    pub fn range(mut self, min: T, max: T) -> Self {
        self.constraint = Constraint::Range { min, max };
        self
    }

    /// Discrete choices constraint.
    pub fn choices(mut self, choices: Vec<T>) -> Self {
        self.constraint = Constraint::Choices(choices);
        self
    }

    /// Custom validation function.
    pub fn validator(
        mut self,
        validator: impl Fn(&T) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.constraint = Constraint::Custom(Arc::new(validator));
        self
    }

    /// Driver hook run after validation. It may adjust the value (the adjusted value is
    /// stored and notified) or reject it.
    pub fn setter(mut self, setter: impl Fn(T) -> DaqResult<T> + Send + Sync + 'static) -> Self {
        self.setter = Some(Arc::new(setter));
        self
    }

    /// Reject `set()`; drivers update the value with `publish()`.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Do not export from composites.
    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    /// Build the attribute.
    pub fn build(self) -> Attribute<T> {
        if let Err(reason) = self.constraint.check(&self.initial) {
            // the initial value is the driver's own statement; keep it but make it visible
            warn!(attribute = %self.name, %reason, "Initial value violates constraint");
        }
        let (sender, _) = watch::channel(self.initial.clone());
        Attribute {
            inner: Arc::new(AttributeInner {
                id: NEXT_ATTRIBUTE_ID.fetch_add(1, Ordering::Relaxed),
                name: self.name,
                description: self.description,
                unit: self.unit,
                read_only: self.read_only,
                hidden: self.hidden,
                constraint: self.constraint,
                setter: self.setter,
                mutation: ReentrantMutex::new(()),
                generation: AtomicU64::new(0),
                value: Mutex::new(self.initial),
                listeners: Mutex::new(ListenerSet::default()),
                sender,
                closed: Mutex::new(None),
            }),
        }
    }
}

// =============================================================================
// AttributeHandle - type-erased access
// =============================================================================

/// Type-erased attribute access shared by local attributes and remote proxies.
///
/// Generic tooling, the metadata propagator and the backend server work exclusively
/// through this trait, so a proxy is indistinguishable from a local attribute.
#[async_trait]
pub trait AttributeHandle: Send + Sync {
    /// Attribute name.
    fn name(&self) -> &str;

    /// Introspection record.
    fn info(&self) -> AttributeInfo;

    /// Current value as JSON.
    async fn get_value(&self) -> DaqResult<Value>;

    /// Validate and assign a JSON value.
    async fn set_value(&self, value: Value) -> DaqResult<()>;

    /// Register an event listener.
    async fn subscribe_events(
        &self,
        listener: EventListener,
        deliver_initial: bool,
    ) -> DaqResult<Subscription>;

    /// Downcasting support for typed access.
    fn as_any(&self) -> &dyn Any;
}

impl std::fmt::Debug for dyn AttributeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeHandle")
            .field("name", &self.name())
            .finish()
    }
}

#[async_trait]
impl<T: AttributeValue> AttributeHandle for Attribute<T> {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn info(&self) -> AttributeInfo {
        Attribute::info(self)
    }

    async fn get_value(&self) -> DaqResult<Value> {
        self.ensure_open()?;
        Ok(serde_json::to_value(self.get())?)
    }

    async fn set_value(&self, value: Value) -> DaqResult<()> {
        self.ensure_open()?;
        let typed = self.coerce(value).inspect_err(|e| {
            warn!(attribute = %self.inner.name, error = %e, "Rejected JSON value");
        })?;
        self.set(typed)
    }

    async fn subscribe_events(
        &self,
        listener: EventListener,
        deliver_initial: bool,
    ) -> DaqResult<Subscription> {
        self.ensure_open()?;
        let name = self.inner.name.clone();
        Ok(self.subscribe(
            move |value: &T| match serde_json::to_value(value) {
                Ok(json) => listener(&AttributeEvent::Changed(json)),
                Err(e) => error!(attribute = %name, error = %e, "Cannot serialize value"),
            },
            deliver_initial,
        ))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// =============================================================================
// AttributeSet - named collection
// =============================================================================

/// Ordered collection of type-erased attributes, keyed by name.
#[derive(Default, Clone)]
pub struct AttributeSet {
    attributes: BTreeMap<String, Arc<dyn AttributeHandle>>,
}

impl Debug for AttributeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeSet")
            .field("names", &self.names())
            .finish()
    }
}

impl AttributeSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an attribute. A previous attribute with the same name is replaced and
    /// returned.
    pub fn register<T: AttributeValue>(
        &mut self,
        attribute: &Attribute<T>,
    ) -> Option<Arc<dyn AttributeHandle>> {
        self.insert(attribute.handle())
    }

    /// Register a type-erased attribute.
    pub fn insert(&mut self, handle: Arc<dyn AttributeHandle>) -> Option<Arc<dyn AttributeHandle>> {
        self.attributes.insert(handle.name().to_string(), handle)
    }

    /// Look up by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn AttributeHandle>> {
        self.attributes.get(name)
    }

    /// Typed access (requires the exact value type).
    pub fn get_typed<T: AttributeValue>(&self, name: &str) -> Option<Attribute<T>> {
        self.attributes
            .get(name)
            .and_then(|h| h.as_any().downcast_ref::<Attribute<T>>())
            .cloned()
    }

    /// Names in order.
    pub fn names(&self) -> Vec<String> {
        self.attributes.keys().cloned().collect()
    }

    /// Iterate in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn AttributeHandle>)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// True if empty.
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn recorder<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |v: &T| sink.lock().push(v.clone()))
    }

    #[test]
    fn test_attribute_basic() {
        let attr = Attribute::new("test", 42);
        assert_eq!(attr.get(), 42);
        assert_eq!(attr.name(), "test");

        attr.set(100).unwrap();
        assert_eq!(attr.get(), 100);
    }

    #[test]
    fn test_range_validation_keeps_previous_value() {
        let attr = Attribute::builder("exposureTime", 0.1)
            .unit("s")
            .range(0.001, 10.0)
            .build();

        attr.set(0.05).unwrap();
        let err = attr.set(50.0).unwrap_err();
        assert!(matches!(err, DaqError::Validation { .. }));
        assert!(err.to_string().contains("out of range"));
        assert_eq!(attr.get(), 0.05);
    }

    #[test]
    fn test_nan_is_out_of_range() {
        let attr = Attribute::builder("power", 0.0).range(0.0, 1.0).build();
        assert!(attr.set(f64::NAN).is_err());
        assert_eq!(attr.get(), 0.0);
    }

    #[test]
    fn test_choices() {
        let attr = Attribute::builder("mode", "auto".to_string())
            .choices(vec!["auto".to_string(), "manual".to_string()])
            .build();

        assert!(attr.set("manual".to_string()).is_ok());
        assert!(attr.set("invalid".to_string()).is_err());
        assert_eq!(attr.get(), "manual");
    }

    #[test]
    fn test_custom_validator() {
        let attr = Attribute::builder("binning", 1_u32)
            .validator(|v| {
                if v.is_power_of_two() {
                    Ok(())
                } else {
                    Err(format!("{v} is not a power of two"))
                }
            })
            .build();

        assert!(attr.set(4).is_ok());
        let err = attr.set(3).unwrap_err();
        assert!(err.to_string().contains("power of two"));
    }

    #[test]
    fn test_read_only_and_publish() {
        let attr = Attribute::builder("position", 0.0).read_only().build();
        let (seen, listener) = recorder();
        let _sub = attr.subscribe(listener, false);

        assert_eq!(
            attr.set(1.0).unwrap_err(),
            DaqError::ReadOnly {
                attribute: "position".into()
            }
        );
        attr.publish(2.5).unwrap();
        assert_eq!(attr.get(), 2.5);
        assert_eq!(*seen.lock(), vec![2.5]);
    }

    #[test]
    fn test_setter_adjusts_value() {
        let attr = Attribute::builder("speed", 1.0)
            .range(0.0, 100.0)
            .setter(|v: f64| Ok((v * 10.0).round() / 10.0))
            .build();
        let (seen, listener) = recorder();
        let _sub = attr.subscribe(listener, false);

        attr.set(2.34).unwrap();
        assert_eq!(attr.get(), 2.3);
        // rounds to the stored value: no-op
        attr.set(2.31).unwrap();
        assert_eq!(*seen.lock(), vec![2.3]);
    }

    #[test]
    fn test_no_notification_for_equal_value() {
        let attr = Attribute::new("gain", 1.0);
        let (seen, listener) = recorder();
        let _sub = attr.subscribe(listener, true);

        attr.set(2.0).unwrap();
        attr.set(2.0).unwrap();
        attr.set(3.0).unwrap();

        assert_eq!(*seen.lock(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_dropping_subscription_unregisters() {
        let attr = Attribute::new("gain", 1);
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let sub = attr.subscribe(
            move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
        assert_eq!(attr.listener_count(), 1);

        attr.set(2).unwrap();
        drop(sub);
        attr.set(3).unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(attr.listener_count(), 0);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let attr = Attribute::new("gain", 1);
        let other = Attribute::new("other", 1);
        let sub = attr.subscribe(|_| {}, false);

        other.unsubscribe(&sub);
        assert!(sub.is_active());

        attr.unsubscribe(&sub);
        attr.unsubscribe(&sub);
        sub.unsubscribe();
        assert!(!sub.is_active());
        assert_eq!(attr.listener_count(), 0);
    }

    #[test]
    fn test_subscription_does_not_keep_attribute_alive() {
        let attr = Attribute::new("gain", 1);
        let weak = Arc::downgrade(&attr.inner);
        let sub = attr.subscribe(|_| {}, false);
        drop(attr);
        assert!(weak.upgrade().is_none());
        // releasing after the attribute is gone is harmless
        sub.unsubscribe();
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_faulty_listener_does_not_block_others() {
        let attr = Attribute::new("gain", 1);
        let _bad = attr.subscribe(|_| panic!("listener exploded"), false);
        let (seen, listener) = recorder();
        let _good = attr.subscribe(listener, false);

        assert!(attr.set(5).is_ok());
        assert_eq!(*seen.lock(), vec![5]);
        assert_eq!(attr.get(), 5);
        assert!(logs_contain("Attribute listener failed"));
        assert!(logs_contain("listener exploded"));
    }

    #[test]
    fn test_listener_may_set_its_own_attribute() {
        let attr = Attribute::builder("value", 0_i64).range(0, 10).build();
        let clamp = attr.clone();
        let _sub = attr.subscribe(
            move |v| {
                if *v > 5 {
                    let _ = clamp.set(5);
                }
            },
            false,
        );
        let (seen, listener) = recorder();
        let _later = attr.subscribe(listener, false);

        attr.set(8).unwrap();
        assert_eq!(attr.get(), 5);
        // the later listener only ever sees the value that stuck
        assert_eq!(*seen.lock(), vec![5]);
        assert_eq!(*attr.watch().borrow(), 5);
    }

    #[test]
    fn test_nested_change_reaches_earlier_listeners_in_order() {
        let attr = Attribute::builder("value", 0_i64).range(0, 10).build();
        let (first_seen, first) = recorder();
        let _first = attr.subscribe(first, false);
        let clamp = attr.clone();
        let _clamp = attr.subscribe(
            move |v| {
                if *v > 5 {
                    let _ = clamp.set(5);
                }
            },
            false,
        );
        let (last_seen, last) = recorder();
        let _last = attr.subscribe(last, false);

        attr.set(9).unwrap();
        assert_eq!(*first_seen.lock(), vec![9, 5]);
        assert_eq!(*last_seen.lock(), vec![5]);

        attr.set(3).unwrap();
        assert_eq!(*first_seen.lock(), vec![9, 5, 3]);
        assert_eq!(*last_seen.lock(), vec![5, 3]);
    }

    #[test]
    fn test_closed_attribute_rejects_writes() {
        let attr = Attribute::new("gain", 1);
        attr.close("camera");
        assert_eq!(
            attr.set(2).unwrap_err(),
            DaqError::ComponentTerminated("camera".into())
        );
        assert_eq!(attr.get(), 1);
        assert!(attr.is_closed());
    }

    #[tokio::test]
    async fn test_closed_attribute_typed_read_differs_from_json_read() {
        let attr = Attribute::new("gain", 4);
        attr.close("camera");
        assert_eq!(attr.get(), 4);
        let handle = attr.handle();
        assert_eq!(
            handle.get_value().await.unwrap_err(),
            DaqError::ComponentTerminated("camera".into())
        );
    }

    #[tokio::test]
    async fn test_watch_receiver() {
        let attr = Attribute::new("value", 0);
        let mut rx = attr.watch();
        assert_eq!(*rx.borrow(), 0);

        attr.set(42).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 42);
    }

    #[tokio::test]
    async fn test_json_access_coerces_once() {
        let attr = Attribute::builder("exposureTime", 0.5).range(0.001, 10.0).build();
        let handle = attr.handle();

        // integer JSON accepted for an f64 attribute
        handle.set_value(json!(2)).await.unwrap();
        assert_eq!(attr.get(), 2.0);
        assert_eq!(handle.get_value().await.unwrap(), json!(2.0));

        let count = Attribute::new("frames", 3_u32).handle();
        let err = count.set_value(json!(2.5)).await.unwrap_err();
        assert!(matches!(err, DaqError::Validation { .. }));

        let err = handle.set_value(json!(50.0)).await.unwrap_err();
        assert!(matches!(err, DaqError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_event_subscription() {
        let attr = Attribute::new("gain", 1.5);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _sub = attr
            .handle()
            .subscribe_events(Arc::new(move |e| sink.lock().push(e.clone())), true)
            .await
            .unwrap();

        attr.set(2.5).unwrap();
        assert_eq!(
            *events.lock(),
            vec![
                AttributeEvent::Changed(json!(1.5)),
                AttributeEvent::Changed(json!(2.5))
            ]
        );
    }

    #[test]
    fn test_info() {
        let attr = Attribute::builder("binning", 1_u32)
            .description("Sensor binning")
            .choices(vec![1, 2, 4])
            .hidden()
            .build();
        let info = attr.info();
        assert_eq!(info.name, "binning");
        assert_eq!(info.type_name, "u32");
        assert!(info.hidden);
        assert_eq!(
            info.constraint,
            ConstraintInfo::Choices {
                values: vec![json!(1), json!(2), json!(4)]
            }
        );
    }

    #[test]
    fn test_attribute_set_typed_access() {
        let mut set = AttributeSet::new();
        let wavelength = Attribute::builder("wavelength", 850.0).unit("nm").build();
        set.register(&wavelength);
        set.register(&Attribute::new("enabled", true));

        assert!(set.get_typed::<f64>("wavelength").is_some());
        assert!(set.get_typed::<bool>("wavelength").is_none());
        assert_eq!(set.names(), vec!["enabled".to_string(), "wavelength".to_string()]);

        // typed copy shares the value
        set.get_typed::<f64>("wavelength").unwrap().set(900.0).unwrap();
        assert_eq!(wavelength.get(), 900.0);
    }
}
