//! Shared helpers for integration tests.
#![allow(dead_code)]

use daq_model::attribute::{AttributeEvent, EventListener};
use daq_model::config::{BackoffPolicy, RemoteConfig};
use daq_model::executor::ResourceWorker;
use daq_model::registry::ComponentRegistry;
use daq_model::remote::ComponentServer;
use daq_model::sim::{DriverContext, DriverRegistry};
use daq_model::{Component, LocalComponent};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Build one simulated component on its own worker.
pub fn sim_component(driver: &str, name: &str, params: &str) -> LocalComponent {
    sim_component_affecting(driver, name, params, &[])
}

/// Like [`sim_component`] with an affects list.
pub fn sim_component_affecting(
    driver: &str,
    name: &str,
    params: &str,
    affects: &[&str],
) -> LocalComponent {
    let params: toml::Table = toml::from_str(params).unwrap();
    let affects: Vec<String> = affects.iter().map(|s| s.to_string()).collect();
    let ctx = DriverContext {
        name,
        role: None,
        worker: ResourceWorker::spawn(name),
        affects: &affects,
        params: &params,
        terminate_timeout: Duration::from_secs(1),
    };
    DriverRegistry::new().create(driver, &ctx).unwrap()
}

/// Remote settings with short timeouts and fast reconnection.
pub fn fast_remote() -> RemoteConfig {
    RemoteConfig {
        call_timeout_ms: 2_000,
        connect_timeout_ms: 500,
        backoff: BackoffPolicy {
            initial_delay_ms: 20,
            max_delay_ms: 200,
            multiplier: 2.0,
            max_attempts: 0,
        },
        ..RemoteConfig::default()
    }
}

/// In-process backend on an ephemeral port.
pub struct TestBackend {
    pub registry: Arc<ComponentRegistry>,
    pub server: ComponentServer,
    pub address: String,
}

impl TestBackend {
    pub async fn start(components: Vec<Arc<dyn Component>>) -> Self {
        let registry = Arc::new(ComponentRegistry::new());
        for component in components {
            registry.register(component).unwrap();
        }
        let server = ComponentServer::bind(Arc::clone(&registry), "127.0.0.1:0")
            .await
            .unwrap();
        let address = server.local_addr().to_string();
        Self {
            registry,
            server,
            address,
        }
    }

    /// Stop serving; components stay alive.
    pub async fn stop(&self) {
        self.server.shutdown().await;
    }

    /// Serve the same registry again on the same address.
    pub async fn restart(&mut self) {
        self.server.shutdown().await;
        self.server = ComponentServer::bind(Arc::clone(&self.registry), &self.address)
            .await
            .unwrap();
    }
}

/// Poll `predicate` until it holds or `timeout` elapses.
pub async fn wait_until<F>(mut predicate: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Await `future` or fail the test after `timeout`.
pub async fn within<T>(timeout: Duration, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(timeout, future)
        .await
        .expect("timed out")
}

/// Listener that records every event it sees.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<AttributeEvent>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listener(&self) -> EventListener {
        let events = Arc::clone(&self.events);
        Arc::new(move |event: &AttributeEvent| events.lock().push(event.clone()))
    }

    pub fn events(&self) -> Vec<AttributeEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn values(&self) -> Vec<serde_json::Value> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                AttributeEvent::Changed(v) => Some(v.clone()),
                AttributeEvent::ConnectionLost => None,
            })
            .collect()
    }

    pub fn lost_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, AttributeEvent::ConnectionLost))
            .count()
    }
}
