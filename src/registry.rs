//! Explicit component directory.
//!
//! The backend keeps one [`ComponentRegistry`] per process, created at startup and
//! injected (as `Arc<ComponentRegistry>`) into everything that needs to look components
//! up: the metadata propagator, the backend server, the daemon. There is no global
//! instance.

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::component::Component;
use crate::error::{DaqError, DaqResult};

/// Registered components, in registration order.
#[derive(Default)]
pub struct ComponentRegistry {
    components: RwLock<Vec<Arc<dyn Component>>>,
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("components", &self.names())
            .finish()
    }
}

impl ComponentRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a component.
    ///
    /// # Errors
    /// [`DaqError::Configuration`] if the name is already taken.
    pub fn register(&self, component: Arc<dyn Component>) -> DaqResult<()> {
        let mut components = self.components.write();
        if components.iter().any(|c| c.name() == component.name()) {
            return Err(DaqError::Configuration(format!(
                "component '{}' is already registered",
                component.name()
            )));
        }
        debug!(component = %component.name(), role = %component.role(), "Registered component");
        components.push(component);
        Ok(())
    }

    /// Look up by name.
    ///
    /// # Errors
    /// [`DaqError::UnknownComponent`] if no component has that name.
    pub fn get(&self, name: &str) -> DaqResult<Arc<dyn Component>> {
        self.components
            .read()
            .iter()
            .find(|c| c.name() == name)
            .cloned()
            .ok_or_else(|| DaqError::UnknownComponent(name.to_string()))
    }

    /// Every component with the given role.
    pub fn find_by_role(&self, role: &str) -> Vec<Arc<dyn Component>> {
        self.components
            .read()
            .iter()
            .filter(|c| c.role() == role)
            .cloned()
            .collect()
    }

    /// Every component, in registration order.
    pub fn list(&self) -> Vec<Arc<dyn Component>> {
        self.components.read().clone()
    }

    /// Names, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.components
            .read()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.components.read().len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.components.read().is_empty()
    }

    /// Remove a component without terminating it.
    pub fn unregister(&self, name: &str) -> DaqResult<Arc<dyn Component>> {
        let mut components = self.components.write();
        let idx = components
            .iter()
            .position(|c| c.name() == name)
            .ok_or_else(|| DaqError::UnknownComponent(name.to_string()))?;
        debug!(component = name, "Unregistered component");
        Ok(components.remove(idx))
    }

    /// Terminate every component (last registered first) and clear the registry.
    ///
    /// Every component is terminated even if some fail.
    ///
    /// # Errors
    /// [`DaqError::ShutdownFailed`] listing every failure.
    pub async fn shutdown(&self) -> DaqResult<()> {
        let components: Vec<_> = std::mem::take(&mut *self.components.write());
        info!(count = components.len(), "Shutting down components");

        let mut errors = Vec::new();
        for component in components.iter().rev() {
            if let Err(e) = component.terminate().await {
                warn!(component = %component.name(), error = %e, "Terminate failed");
                errors.push(e);
            }
        }

        if errors.is_empty() {
            info!("All components terminated");
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::LocalComponent;

    fn local(name: &str, role: &str) -> Arc<dyn Component> {
        Arc::new(LocalComponent::builder(name, role).build().unwrap())
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ComponentRegistry::new();
        registry.register(local("stage", "stage")).unwrap();
        registry.register(local("camera", "ccd")).unwrap();
        registry.register(local("camera2", "ccd")).unwrap();

        assert_eq!(registry.get("camera").unwrap().role(), "ccd");
        assert_eq!(registry.find_by_role("ccd").len(), 2);
        assert_eq!(registry.names(), vec!["stage", "camera", "camera2"]);

        let err = registry.register(local("stage", "stage")).unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
        assert!(matches!(
            registry.get("laser"),
            Err(DaqError::UnknownComponent(_))
        ));
    }

    #[test]
    fn test_unregister() {
        let registry = ComponentRegistry::new();
        registry.register(local("stage", "stage")).unwrap();
        let stage = registry.unregister("stage").unwrap();
        assert!(!stage.is_terminated());
        assert!(registry.is_empty());
        assert!(registry.unregister("stage").is_err());
    }

    #[tokio::test]
    async fn test_shutdown_terminates_everything() {
        let registry = ComponentRegistry::new();
        let stage = local("stage", "stage");
        let camera = local("camera", "ccd");
        registry.register(Arc::clone(&stage)).unwrap();
        registry.register(Arc::clone(&camera)).unwrap();

        registry.shutdown().await.unwrap();

        assert!(stage.is_terminated());
        assert!(camera.is_terminated());
        assert!(registry.is_empty());
    }
}
