//! The shipped daemon configuration builds a working backend.

mod common;

use common::{fast_remote, within};
use daq_model::config::DaqModelConfig;
use daq_model::executor::ExecutorPool;
use daq_model::propagator::{MetadataPropagator, RuleSet};
use daq_model::registry::ComponentRegistry;
use daq_model::remote::{ComponentServer, RemoteBackend};
use daq_model::sim::{assemble, DriverRegistry};
use daq_model::{Component, MetadataKey};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn shipped_config() -> DaqModelConfig {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/daq-model.toml");
    DaqModelConfig::load_from(path).unwrap()
}

#[tokio::test]
async fn test_shipped_config_assembles() {
    let config = shipped_config();
    let pool = ExecutorPool::new();
    let registry = Arc::new(ComponentRegistry::new());
    assemble(&config, &DriverRegistry::new(), &pool, &registry).unwrap();
    assert_eq!(
        registry.names(),
        vec!["stage", "sensor", "objective", "led", "emission_filter", "ccd"]
    );
    assert_eq!(pool.owners("camera-link-0"), vec!["sensor".to_string()]);

    let propagator = MetadataPropagator::start(&registry, RuleSet::standard()).await.unwrap();
    propagator.flush().await.unwrap();
    let ccd = registry.get("ccd").unwrap();
    let metadata = ccd.metadata().await.unwrap();
    assert_eq!(metadata.get_f64(MetadataKey::PixelSizeScale), Some(20.0));
    assert_eq!(metadata.get_f64(MetadataKey::Position), Some(0.0));

    // the full stack: a client moves the stage through the server
    let server = ComponentServer::bind(Arc::clone(&registry), "127.0.0.1:0").await.unwrap();
    let remote = RemoteBackend::connect(&server.local_addr().to_string(), fast_remote())
        .await
        .unwrap();
    let stage: Arc<dyn Component> = remote.get("stage").unwrap();
    let moved = stage.execute("move_rel", json!(0.0001)).await.unwrap();
    assert_eq!(
        within(Duration::from_secs(5), moved.result(None)).await.unwrap(),
        json!(0.0001)
    );
    propagator.flush().await.unwrap();
    let position = ccd.metadata().await.unwrap().get_f64(MetadataKey::Position).unwrap();
    assert!((position - 0.0001).abs() < 1e-12);

    server.shutdown().await;
    propagator.stop().await;
    registry.shutdown().await.unwrap();
    pool.shutdown_all(Duration::from_secs(1)).await.unwrap();
}

#[test]
fn test_unknown_driver_is_rejected_at_load() {
    let err = DaqModelConfig::from_toml_str(
        r#"
        [[components]]
        name = "x"
        driver = "sim_laser_cannon"
        "#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("sim_laser_cannon"));
}
