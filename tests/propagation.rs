//! Metadata propagation between components.

mod common;

use async_trait::async_trait;
use common::sim_component_affecting;
use daq_model::attribute::AttributeHandle;
use daq_model::metadata::MetadataBuilder;
use daq_model::propagator::{MetadataPropagator, RuleSet};
use daq_model::registry::ComponentRegistry;
use daq_model::{
    ActionFuture, Attribute, Component, DaqResult, LocalComponent, Metadata, MetadataKey,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;

/// Wraps a component and records every metadata update it receives.
struct MetadataSpy {
    inner: LocalComponent,
    updates: Mutex<Vec<Metadata>>,
}

impl MetadataSpy {
    fn new(inner: LocalComponent) -> Arc<Self> {
        Arc::new(Self {
            inner,
            updates: Mutex::new(Vec::new()),
        })
    }

    fn updates(&self) -> Vec<Metadata> {
        self.updates.lock().clone()
    }
}

#[async_trait]
impl Component for MetadataSpy {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn role(&self) -> &str {
        self.inner.role()
    }

    fn attribute_names(&self) -> Vec<String> {
        self.inner.attribute_names()
    }

    fn attribute(&self, name: &str) -> DaqResult<Arc<dyn AttributeHandle>> {
        self.inner.attribute(name)
    }

    fn action_names(&self) -> Vec<String> {
        self.inner.action_names()
    }

    async fn execute(&self, action: &str, args: Value) -> DaqResult<ActionFuture<Value>> {
        self.inner.execute(action, args).await
    }

    async fn metadata(&self) -> DaqResult<Metadata> {
        self.inner.metadata().await
    }

    async fn update_metadata(&self, partial: Metadata) -> DaqResult<()> {
        self.updates.lock().push(partial.clone());
        self.inner.update_metadata(partial).await
    }

    fn affects(&self) -> Vec<String> {
        self.inner.affects()
    }

    fn dependencies(&self) -> Vec<String> {
        self.inner.dependencies()
    }

    async fn terminate(&self) -> DaqResult<()> {
        self.inner.terminate().await
    }

    fn is_terminated(&self) -> bool {
        self.inner.is_terminated()
    }
}

fn plain_camera() -> LocalComponent {
    let gain = Attribute::new("gain", 1.0);
    LocalComponent::builder("Camera", "camera")
        .attribute(&gain)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_magnification_change_updates_camera_once() {
    let lens = sim_component_affecting("sim_lens", "Lens", "magnification = 10.0", &["Camera"]);
    let magnification = lens.typed::<f64>("magnification").unwrap();
    let camera = MetadataSpy::new(plain_camera());

    let registry = ComponentRegistry::new();
    registry.register(Arc::new(lens)).unwrap();
    registry.register(camera.clone()).unwrap();

    let propagator = MetadataPropagator::start(&registry, RuleSet::standard()).await.unwrap();
    propagator.flush().await.unwrap();
    assert_eq!(camera.updates().len(), 1, "initial value is propagated once");

    magnification.set(20.0).unwrap();
    propagator.flush().await.unwrap();

    let updates = camera.updates();
    assert_eq!(updates.len(), 2);
    let last = &updates[1];
    assert_eq!(last.len(), 1);
    assert_eq!(last.get(MetadataKey::PixelSizeScale), Some(&json!(20.0)));

    let metadata = camera.metadata().await.unwrap();
    assert_eq!(metadata.get_f64(MetadataKey::PixelSizeScale), Some(20.0));
    propagator.stop().await;
}

#[tokio::test]
async fn test_repeated_value_is_not_propagated_again() {
    let lens = sim_component_affecting("sim_lens", "Lens", "", &["Camera"]);
    let magnification = lens.typed::<f64>("magnification").unwrap();
    let camera = MetadataSpy::new(plain_camera());

    let registry = ComponentRegistry::new();
    registry.register(Arc::new(lens)).unwrap();
    registry.register(camera.clone()).unwrap();
    let propagator = MetadataPropagator::start(&registry, RuleSet::standard()).await.unwrap();

    magnification.set(40.0).unwrap();
    propagator.flush().await.unwrap();
    let after_first = camera.updates().len();
    let count = propagator.update_count();

    // same value again
    magnification.set(40.0).unwrap();
    propagator.flush().await.unwrap();
    assert_eq!(camera.updates().len(), after_first);
    assert_eq!(propagator.update_count(), count);
    propagator.stop().await;
}

#[tokio::test]
async fn test_pixel_size_follows_binning_and_magnification() {
    let lens = sim_component_affecting("sim_lens", "Lens", "magnification = 10.0", &["Sensor"]);
    let sensor = sim_component_affecting("sim_sensor", "Sensor", "pixel_size = 6.5e-6", &[]);
    let binning = sensor.typed::<u32>("binning").unwrap();
    let sensor: Arc<dyn Component> = Arc::new(sensor);

    let registry = ComponentRegistry::new();
    registry.register(Arc::new(lens)).unwrap();
    registry.register(Arc::clone(&sensor)).unwrap();
    let propagator = MetadataPropagator::start(&registry, RuleSet::standard()).await.unwrap();
    propagator.flush().await.unwrap();

    let pixel = sensor.metadata().await.unwrap().get_f64(MetadataKey::PixelSize).unwrap();
    assert!((pixel - 6.5e-7).abs() < 1e-15);

    binning.set(2).unwrap();
    propagator.flush().await.unwrap();
    let pixel = sensor.metadata().await.unwrap().get_f64(MetadataKey::PixelSize).unwrap();
    assert!((pixel - 1.3e-6).abs() < 1e-15);
    assert_eq!(propagator.links().len(), 1);
    propagator.stop().await;
}

#[tokio::test]
async fn test_stopped_propagator_ignores_changes() {
    let lens = sim_component_affecting("sim_lens", "Lens", "", &["Camera"]);
    let magnification = lens.typed::<f64>("magnification").unwrap();
    let camera = MetadataSpy::new(plain_camera());

    let registry = ComponentRegistry::new();
    registry.register(Arc::new(lens)).unwrap();
    registry.register(camera.clone()).unwrap();
    let propagator = MetadataPropagator::start(&registry, RuleSet::standard()).await.unwrap();
    propagator.flush().await.unwrap();
    propagator.stop().await;

    let before = camera.updates().len();
    magnification.set(63.0).unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(camera.updates().len(), before);
    assert_eq!(magnification.listener_count(), 0);
}

#[tokio::test]
async fn test_pixel_size_follows_sensor_pixel_size() {
    let lens = sim_component_affecting("sim_lens", "Lens", "magnification = 10.0", &["Sensor"]);
    let sensor = Arc::new(sim_component_affecting(
        "sim_sensor",
        "Sensor",
        "pixel_size = 6.5e-6",
        &[],
    ));

    let registry = ComponentRegistry::new();
    registry.register(Arc::new(lens)).unwrap();
    registry.register(sensor.clone()).unwrap();
    let propagator = MetadataPropagator::start(&registry, RuleSet::standard()).await.unwrap();
    propagator.flush().await.unwrap();
    let pixel = sensor.metadata_snapshot().get_f64(MetadataKey::PixelSize).unwrap();
    assert!((pixel - 6.5e-7).abs() < 1e-15);

    // a different camera head behind the same sensor component
    let update = MetadataBuilder::new()
        .entry(MetadataKey::SensorPixelSize, 1.3e-5)
        .build();
    sensor.update_metadata(update).await.unwrap();
    assert!(
        common::wait_until(
            || {
                sensor
                    .metadata_snapshot()
                    .get_f64(MetadataKey::PixelSize)
                    .is_some_and(|p| (p - 1.3e-6).abs() < 1e-15)
            },
            std::time::Duration::from_secs(5)
        )
        .await
    );
    propagator.stop().await;
}
