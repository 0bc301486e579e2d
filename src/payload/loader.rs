//! Payload registry and load-time validation.
//!
//! The registry maps a job definition's entry point to a factory that
//! builds a fresh payload per launch, and tracks which named artifacts
//! (shared library crates payloads declare as dependencies) this node
//! carries. Load failures are detected here, before a worker slot is
//! spent on the instance.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::model::JobDefinition;

use super::PayloadShape;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("no payload registered for entry point '{0}'")]
    MissingEntryPoint(String),
    #[error("entry point '{entry_point}' requires missing artifact '{artifact}'")]
    MissingDependency {
        entry_point: String,
        artifact: String,
    },
    #[error("entry point '{0}' exposes no supported calling convention")]
    UnsupportedShape(String),
}

/// Builds one fresh payload value per execution.
pub trait PayloadFactory: Send + Sync {
    fn instantiate(&self) -> PayloadShape;
}

impl<F> PayloadFactory for F
where
    F: Fn() -> PayloadShape + Send + Sync,
{
    fn instantiate(&self) -> PayloadShape {
        self()
    }
}

#[derive(Default)]
struct Catalog {
    payloads: HashMap<String, Arc<dyn PayloadFactory>>,
    artifacts: HashSet<String>,
}

/// Node-local catalog of deployed payloads and artifacts.
#[derive(Clone, Default)]
pub struct PayloadRegistry {
    catalog: Arc<RwLock<Catalog>>,
}

impl PayloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deploy a payload under an entry-point name. Re-registering an entry
    /// point replaces the previous factory, which is how payload upgrades
    /// land on a live node.
    pub fn register_payload(
        &self,
        entry_point: impl Into<String>,
        factory: impl PayloadFactory + 'static,
    ) {
        let mut catalog = self.catalog.write().expect("payload registry poisoned");
        catalog
            .payloads
            .insert(entry_point.into(), Arc::new(factory));
    }

    /// Declare an artifact as present on this node.
    pub fn register_artifact(&self, name: impl Into<String>) {
        let mut catalog = self.catalog.write().expect("payload registry poisoned");
        catalog.artifacts.insert(name.into());
    }

    /// Resolve a definition to a freshly instantiated payload, verifying
    /// the entry point exists, its declared artifact dependencies are all
    /// present, and the instance exposes a launchable convention.
    pub fn load(&self, definition: &JobDefinition) -> Result<PayloadShape, LoadError> {
        let catalog = self.catalog.read().expect("payload registry poisoned");
        let factory = catalog
            .payloads
            .get(&definition.entry_point)
            .cloned()
            .ok_or_else(|| LoadError::MissingEntryPoint(definition.entry_point.clone()))?;
        for artifact in &definition.dependencies {
            if !catalog.artifacts.contains(artifact) {
                return Err(LoadError::MissingDependency {
                    entry_point: definition.entry_point.clone(),
                    artifact: artifact.clone(),
                });
            }
        }
        drop(catalog);

        let shape = factory.instantiate();
        if !shape.is_supported() {
            return Err(LoadError::UnsupportedShape(definition.entry_point.clone()));
        }
        Ok(shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{PayloadError, RunnableJob};
    use uuid::Uuid;

    struct Noop;

    impl RunnableJob for Noop {
        fn run(&mut self) -> Result<(), PayloadError> {
            Ok(())
        }
    }

    fn definition(entry_point: &str, dependencies: Vec<String>) -> JobDefinition {
        JobDefinition {
            id: Uuid::new_v4(),
            name: entry_point.to_string(),
            entry_point: entry_point.to_string(),
            queue_id: Uuid::new_v4(),
            highlander: false,
            parameters: vec![],
            dependencies,
        }
    }

    #[test]
    fn missing_entry_point_is_a_load_fault() {
        let registry = PayloadRegistry::new();
        let err = registry.load(&definition("ghost", vec![])).unwrap_err();
        assert!(matches!(err, LoadError::MissingEntryPoint(_)));
    }

    #[test]
    fn missing_artifact_is_a_load_fault() {
        let registry = PayloadRegistry::new();
        registry.register_payload("etl", || PayloadShape::runnable(Noop));
        registry.register_artifact("lib-core");
        let err = registry
            .load(&definition(
                "etl",
                vec!["lib-core".into(), "lib-extra".into()],
            ))
            .unwrap_err();
        assert!(matches!(
            err,
            LoadError::MissingDependency { ref artifact, .. } if artifact == "lib-extra"
        ));
    }

    #[test]
    fn unsupported_shape_is_rejected_at_load() {
        let registry = PayloadRegistry::new();
        registry.register_payload("hollow", PayloadShape::default);
        let err = registry.load(&definition("hollow", vec![])).unwrap_err();
        assert!(matches!(err, LoadError::UnsupportedShape(_)));
    }

    #[test]
    fn each_load_instantiates_a_fresh_payload() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let built = Arc::new(AtomicUsize::new(0));
        let registry = PayloadRegistry::new();
        let counter = built.clone();
        registry.register_payload("fresh", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            PayloadShape::runnable(Noop)
        });
        let def = definition("fresh", vec![]);
        registry.load(&def).unwrap();
        registry.load(&def).unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }
}
