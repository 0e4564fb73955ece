//! Metadata propagation between components.
//!
//! When component A declares that it *affects* component B (a lens affecting a camera),
//! some attributes of A determine metadata of B: the lens magnification sets the camera's
//! `PIXEL_SIZE_SCALE`. A [`RuleSet`] lists these relations as [`MetadataRule`]s
//! (attribute name → metadata key, with a transform and an optional scaling attribute read
//! on B, such as its binning).
//!
//! [`MetadataPropagator::start`] runs once at startup. It walks every affects-link of the
//! registry, subscribes to each relevant attribute of A (and to the scaling attributes of
//! B) and recomputes B's derived keys whenever one of them changes. B's own metadata is a
//! trigger too when B can report its changes: the pixel size follows the sensor's pixel
//! size.
//!
//! # Design
//!
//! - Listeners only enqueue the new value; a single background task recomputes, so
//!   `set()` on the upstream attribute never waits for B
//! - Recomputation is idempotent: a key is written only when its derived value differs
//!   from the last value this propagator wrote
//! - All keys derived from one upstream change are merged into a single `update_metadata`
//! - Keys are [`MetadataKey`]s, so a rule cannot name a key outside the vocabulary

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::attribute::{AttributeEvent, EventListener, Subscription};
use crate::component::Component;
use crate::error::{DaqError, DaqResult};
use crate::metadata::{Metadata, MetadataKey};
use crate::registry::ComponentRegistry;

/// Everything a transform may look at.
pub struct RuleInput<'a> {
    /// New value of the upstream attribute.
    pub value: &'a Value,
    /// Current value of the downstream scaling attribute, if the rule has one.
    pub scale: Option<&'a Value>,
    /// Current metadata of the downstream component.
    pub downstream: &'a Metadata,
}

type Transform = Arc<dyn Fn(&RuleInput<'_>) -> Option<Value> + Send + Sync>;

/// One attribute → metadata key relation.
#[derive(Clone)]
pub struct MetadataRule {
    attribute: String,
    key: MetadataKey,
    scale_by: Option<String>,
    transform: Transform,
}

impl fmt::Debug for MetadataRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataRule")
            .field("attribute", &self.attribute)
            .field("key", &self.key)
            .field("scale_by", &self.scale_by)
            .finish()
    }
}

impl MetadataRule {
    /// Copy the attribute value into `key` unchanged.
    pub fn identity(attribute: impl Into<String>, key: MetadataKey) -> Self {
        Self::new(attribute, key, |input| Some(input.value.clone()))
    }

    /// Derive `key` with a custom transform. Returning `None` leaves the key untouched.
    pub fn new<F>(attribute: impl Into<String>, key: MetadataKey, transform: F) -> Self
    where
        F: Fn(&RuleInput<'_>) -> Option<Value> + Send + Sync + 'static,
    {
        Self {
            attribute: attribute.into(),
            key,
            scale_by: None,
            transform: Arc::new(transform),
        }
    }

    /// Also recompute when `attribute` of the downstream component changes, and pass its
    /// value to the transform.
    pub fn scaled_by(mut self, attribute: impl Into<String>) -> Self {
        self.scale_by = Some(attribute.into());
        self
    }

    /// Upstream attribute name.
    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    /// Derived key.
    pub fn key(&self) -> MetadataKey {
        self.key
    }

    /// Downstream scaling attribute.
    pub fn scale_by(&self) -> Option<&str> {
        self.scale_by.as_deref()
    }

    /// Apply the transform.
    pub fn derive(&self, input: &RuleInput<'_>) -> Option<Value> {
        (self.transform)(input)
    }
}

/// Validated collection of rules.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<MetadataRule>,
}

impl RuleSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule.
    ///
    /// # Errors
    /// [`DaqError::Configuration`] if a rule for the same attribute and key exists.
    pub fn add(&mut self, rule: MetadataRule) -> DaqResult<()> {
        if self
            .rules
            .iter()
            .any(|r| r.attribute == rule.attribute && r.key == rule.key)
        {
            return Err(DaqError::Configuration(format!(
                "duplicate metadata rule {} -> {}",
                rule.attribute, rule.key
            )));
        }
        self.rules.push(rule);
        Ok(())
    }

    /// Builder-style [`RuleSet::add`].
    pub fn with(mut self, rule: MetadataRule) -> DaqResult<Self> {
        self.add(rule)?;
        Ok(self)
    }

    /// The standard optical/motion table.
    ///
    /// | attribute             | key                 | transform                                 |
    /// |-----------------------|---------------------|-------------------------------------------|
    /// | `magnification`       | `PIXEL_SIZE_SCALE`  | identity                                  |
    /// | `magnification`       | `PIXEL_SIZE`        | sensor pixel size × binning ÷ magnification |
    /// | `position`            | `POSITION`          | identity                                  |
    /// | `emission_wavelength` | `INPUT_WAVELENGTH`  | identity                                  |
    /// | `band`                | `OUTPUT_WAVELENGTH` | identity                                  |
    /// | `power`               | `LIGHT_POWER`       | identity                                  |
    pub fn standard() -> Self {
        let rules = vec![
            MetadataRule::identity("magnification", MetadataKey::PixelSizeScale),
            MetadataRule::new("magnification", MetadataKey::PixelSize, pixel_size)
                .scaled_by("binning"),
            MetadataRule::identity("position", MetadataKey::Position),
            MetadataRule::identity("emission_wavelength", MetadataKey::InputWavelength),
            MetadataRule::identity("band", MetadataKey::OutputWavelength),
            MetadataRule::identity("power", MetadataKey::LightPower),
        ];
        Self { rules }
    }

    /// Rules reading `attribute`.
    pub fn for_attribute<'a>(&'a self, attribute: &'a str) -> impl Iterator<Item = &'a MetadataRule> {
        self.rules.iter().filter(move |r| r.attribute == attribute)
    }

    /// Iterate over every rule.
    pub fn iter(&self) -> impl Iterator<Item = &MetadataRule> {
        self.rules.iter()
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True if empty.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Pixel size in the sample plane: sensor pixel × binning ÷ magnification.
fn pixel_size(input: &RuleInput<'_>) -> Option<Value> {
    let sensor = input.downstream.get_f64(MetadataKey::SensorPixelSize)?;
    let magnification = input.value.as_f64().filter(|m| *m > 0.0)?;
    let binning = match input.scale {
        Some(Value::Array(axes)) => axes.first().and_then(Value::as_f64),
        Some(other) => other.as_f64(),
        None => None,
    }
    .unwrap_or(1.0);
    Some(json!(sensor * binning / magnification))
}

// =============================================================================
// Propagator
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Upstream,
    Scale(String),
}

enum Message {
    Changed {
        binding: usize,
        slot: Slot,
        value: Value,
    },
    /// Downstream metadata changed; inputs stay as they were.
    Downstream(usize),
    Flush(oneshot::Sender<()>),
}

/// One (upstream attribute, downstream component) pair and its rules.
struct Binding {
    upstream: String,
    attribute: String,
    downstream: Arc<dyn Component>,
    rules: Vec<MetadataRule>,
    value: Option<Value>,
    scales: BTreeMap<String, Value>,
    written: BTreeMap<MetadataKey, Value>,
}

/// Description of one active propagation link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagationLink {
    /// Upstream component.
    pub upstream: String,
    /// Upstream attribute.
    pub attribute: String,
    /// Downstream component.
    pub downstream: String,
    /// Keys derived on the downstream component.
    pub keys: Vec<MetadataKey>,
}

/// Background observer deriving downstream metadata from upstream attributes.
pub struct MetadataPropagator {
    links: Vec<PropagationLink>,
    sender: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    subscriptions: Mutex<Vec<Subscription>>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    updates: Arc<AtomicUsize>,
}

impl fmt::Debug for MetadataPropagator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataPropagator")
            .field("links", &self.links)
            .field("updates", &self.update_count())
            .finish()
    }
}

impl MetadataPropagator {
    /// Wire every affects-link of `registry` according to `rules` and propagate the
    /// current values once.
    ///
    /// A link naming an unregistered component is skipped with a warning. Subscription
    /// failures (e.g. an unreachable remote component) abort startup.
    pub async fn start(registry: &ComponentRegistry, rules: RuleSet) -> DaqResult<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut bindings = Vec::new();
        let mut links = Vec::new();
        let mut subscriptions = Vec::new();
        let mut watchers = Vec::new();

        for upstream in registry.list() {
            for target in upstream.affects() {
                let downstream = match registry.get(&target) {
                    Ok(component) => component,
                    Err(_) => {
                        warn!(upstream = %upstream.name(), downstream = %target, "Affected component is not registered");
                        continue;
                    }
                };

                for attribute in upstream.attribute_names() {
                    let matching: Vec<MetadataRule> =
                        rules.for_attribute(&attribute).cloned().collect();
                    if matching.is_empty() {
                        continue;
                    }

                    let id = bindings.len();
                    links.push(PropagationLink {
                        upstream: upstream.name().to_string(),
                        attribute: attribute.clone(),
                        downstream: downstream.name().to_string(),
                        keys: matching.iter().map(|r| r.key).collect(),
                    });

                    let mut scale_attributes: Vec<&str> =
                        matching.iter().filter_map(|r| r.scale_by()).collect();
                    scale_attributes.sort_unstable();
                    scale_attributes.dedup();
                    for scale in scale_attributes {
                        match downstream.attribute(scale) {
                            Ok(handle) => {
                                let listener = forward(&sender, id, Slot::Scale(scale.to_string()));
                                subscriptions.push(handle.subscribe_events(listener, true).await?);
                            }
                            Err(_) => trace!(
                                downstream = %downstream.name(),
                                attribute = scale,
                                "No scaling attribute; using default"
                            ),
                        }
                    }

                    bindings.push(Binding {
                        upstream: upstream.name().to_string(),
                        attribute: attribute.clone(),
                        downstream: Arc::clone(&downstream),
                        rules: matching,
                        value: None,
                        scales: BTreeMap::new(),
                        written: BTreeMap::new(),
                    });

                    let handle = upstream.attribute(&attribute)?;
                    let listener = forward(&sender, id, Slot::Upstream);
                    subscriptions.push(handle.subscribe_events(listener, true).await?);

                    if let Some(receiver) = downstream.metadata_receiver() {
                        watchers.push(tokio::spawn(watch_downstream(receiver, sender.clone(), id)));
                    }

                    debug!(
                        upstream = %upstream.name(),
                        attribute = %attribute,
                        downstream = %downstream.name(),
                        "Wired metadata propagation"
                    );
                }
            }
        }

        info!(links = links.len(), "Metadata propagator started");
        let updates = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn(run(bindings, receiver, Arc::clone(&updates)));

        Ok(Self {
            links,
            sender: Mutex::new(Some(sender)),
            subscriptions: Mutex::new(subscriptions),
            watchers: Mutex::new(watchers),
            task: Mutex::new(Some(task)),
            updates,
        })
    }

    /// Active links.
    pub fn links(&self) -> &[PropagationLink] {
        &self.links
    }

    /// Number of `update_metadata` calls issued so far.
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// Wait until every change observed before this call was propagated.
    pub async fn flush(&self) -> DaqResult<()> {
        let sender = self.sender.lock().clone();
        let Some(sender) = sender else {
            return Ok(());
        };
        let (done_tx, done_rx) = oneshot::channel();
        sender
            .send(Message::Flush(done_tx))
            .map_err(|_| DaqError::Hardware("metadata propagator task ended".into()))?;
        done_rx
            .await
            .map_err(|_| DaqError::Hardware("metadata propagator task ended".into()))
    }

    /// Drop every subscription and wait for pending recomputations to finish.
    pub async fn stop(&self) {
        self.subscriptions.lock().clear();
        for watcher in self.watchers.lock().drain(..) {
            watcher.abort();
        }
        self.sender.lock().take();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("Metadata propagator did not stop in time");
            }
        }
        info!("Metadata propagator stopped");
    }
}

impl Drop for MetadataPropagator {
    fn drop(&mut self) {
        for watcher in self.watchers.get_mut().drain(..) {
            watcher.abort();
        }
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

fn forward(sender: &mpsc::UnboundedSender<Message>, binding: usize, slot: Slot) -> EventListener {
    let sender = sender.clone();
    Arc::new(move |event: &AttributeEvent| match event {
        AttributeEvent::Changed(value) => {
            let _ = sender.send(Message::Changed {
                binding,
                slot: slot.clone(),
                value: value.clone(),
            });
        }
        AttributeEvent::ConnectionLost => {
            debug!(binding, "Upstream connection lost; keeping last metadata")
        }
    })
}

async fn watch_downstream(
    mut receiver: watch::Receiver<Metadata>,
    sender: mpsc::UnboundedSender<Message>,
    binding: usize,
) {
    // a fresh receiver has already seen the current value, which the initial
    // propagation covers
    while receiver.changed().await.is_ok() {
        if sender.send(Message::Downstream(binding)).is_err() {
            break;
        }
    }
}

async fn run(
    mut bindings: Vec<Binding>,
    mut receiver: mpsc::UnboundedReceiver<Message>,
    updates: Arc<AtomicUsize>,
) {
    while let Some(message) = receiver.recv().await {
        match message {
            Message::Changed {
                binding,
                slot,
                value,
            } => {
                let Some(binding) = bindings.get_mut(binding) else {
                    continue;
                };
                match slot {
                    Slot::Upstream => binding.value = Some(value),
                    Slot::Scale(name) => {
                        binding.scales.insert(name, value);
                    }
                }
                if recompute(binding).await {
                    updates.fetch_add(1, Ordering::SeqCst);
                }
            }
            Message::Downstream(binding) => {
                let Some(binding) = bindings.get_mut(binding) else {
                    continue;
                };
                if recompute(binding).await {
                    updates.fetch_add(1, Ordering::SeqCst);
                }
            }
            Message::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Metadata propagator task ended");
}

/// Returns true if an `update_metadata` call was issued and succeeded.
async fn recompute(binding: &mut Binding) -> bool {
    let Some(value) = binding.value.as_ref() else {
        return false;
    };

    let downstream_metadata = match binding.downstream.metadata().await {
        Ok(metadata) => metadata,
        Err(e) => {
            warn!(downstream = %binding.downstream.name(), error = %e, "Cannot read downstream metadata");
            return false;
        }
    };

    let mut partial = Metadata::new();
    for rule in &binding.rules {
        let input = RuleInput {
            value,
            scale: rule.scale_by().and_then(|s| binding.scales.get(s)),
            downstream: &downstream_metadata,
        };
        if let Some(derived) = rule.derive(&input) {
            if binding.written.get(&rule.key) != Some(&derived) {
                partial.insert(rule.key, derived);
            }
        }
    }

    if partial.is_empty() {
        return false;
    }

    match binding.downstream.update_metadata(partial.clone()).await {
        Ok(()) => {
            debug!(
                upstream = %binding.upstream,
                attribute = %binding.attribute,
                downstream = %binding.downstream.name(),
                keys = partial.len(),
                "Propagated metadata"
            );
            binding
                .written
                .extend(partial.iter().map(|(k, v)| (*k, v.clone())));
            true
        }
        Err(e) => {
            warn!(downstream = %binding.downstream.name(), error = %e, "Metadata propagation failed");
            false
        }
    }
}
