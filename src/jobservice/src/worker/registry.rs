//! Name → handler factory registry.

use parking_lot::RwLock;
use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{JobServiceError, Result};
use crate::job::{Handler, HandlerFactory, MAX_PRIORITY};

/// A registered job type with the limits its handler declared.
pub struct JobSpec {
    pub name: String,
    pub factory: HandlerFactory,
    pub type_id: TypeId,
    pub type_name: &'static str,
    /// Failures tolerated before the dead set, counting the first run.
    pub max_fails: i64,
    pub max_concurrency: u32,
    pub priority: u32,
}

impl std::fmt::Debug for JobSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSpec")
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .field("max_fails", &self.max_fails)
            .field("max_concurrency", &self.max_concurrency)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Keeps names and handler types in a 1:1 mapping. Closed once a pool starts.
#[derive(Default)]
pub struct Registry {
    specs: RwLock<HashMap<String, Arc<JobSpec>>>,
    closed: AtomicBool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register handler type `H` under `name`.
    ///
    /// Registering the same type under the same name again is a no-op.
    pub fn register<H, F>(&self, name: &str, factory: F) -> Result<()>
    where
        H: Handler + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        if self.is_closed() {
            return Err(JobServiceError::registration(format!(
                "Registration of {} after the worker pool started",
                name
            )));
        }
        if name.trim().is_empty() {
            return Err(JobServiceError::registration("Job name must not be empty"));
        }

        let type_id = TypeId::of::<H>();
        let sample = factory();
        let mut specs = self.specs.write();

        if let Some(existing) = specs.get(name) {
            if existing.type_id == type_id {
                return Ok(());
            }
            return Err(JobServiceError::registration(format!(
                "Job {} is already registered with type {}",
                name, existing.type_name
            )));
        }
        if let Some(other) = specs.values().find(|s| s.type_id == type_id) {
            return Err(JobServiceError::registration(format!(
                "Type {} is already registered as {}",
                type_name::<H>(),
                other.name
            )));
        }

        let spec = JobSpec {
            name: name.to_string(),
            factory: Arc::new(move || Box::new(factory()) as Box<dyn Handler>),
            type_id,
            type_name: type_name::<H>(),
            max_fails: i64::from(sample.max_fails()) + 1,
            max_concurrency: sample.max_concurrency(),
            priority: sample.priority().clamp(1, MAX_PRIORITY),
        };
        tracing::info!(
            job_name = name,
            handler = spec.type_name,
            max_fails = spec.max_fails,
            max_concurrency = spec.max_concurrency,
            priority = spec.priority,
            "Job registered"
        );
        specs.insert(name.to_string(), Arc::new(spec));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<JobSpec>> {
        self.specs.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.specs.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn specs(&self) -> Vec<Arc<JobSpec>> {
        self.specs.read().values().cloned().collect()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Parameters;
    use crate::job::ExecutionContext;
    use async_trait::async_trait;

    struct Quick;
    struct Slow;

    #[async_trait]
    impl Handler for Quick {
        fn max_fails(&self) -> u32 {
            3
        }
        fn should_retry(&self) -> bool {
            true
        }
        fn validate(&self, _: &Parameters) -> Result<()> {
            Ok(())
        }
        async fn run(&self, _: &ExecutionContext, _: &Parameters) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Handler for Slow {
        fn max_fails(&self) -> u32 {
            0
        }
        fn max_concurrency(&self) -> u32 {
            1
        }
        fn priority(&self) -> u32 {
            u32::MAX
        }
        fn should_retry(&self) -> bool {
            false
        }
        fn validate(&self, _: &Parameters) -> Result<()> {
            Ok(())
        }
        async fn run(&self, _: &ExecutionContext, _: &Parameters) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_records_limits() {
        let registry = Registry::new();
        registry.register("QUICK", || Quick).unwrap();
        registry.register("SLOW", || Slow).unwrap();

        let quick = registry.get("QUICK").unwrap();
        assert_eq!(quick.max_fails, 4);
        assert_eq!(quick.max_concurrency, 0);

        let slow = registry.get("SLOW").unwrap();
        assert_eq!(slow.max_fails, 1);
        assert_eq!(slow.priority, MAX_PRIORITY);
        assert_eq!(registry.names(), vec!["QUICK", "SLOW"]);
    }

    #[test]
    fn test_name_and_type_are_one_to_one() {
        let registry = Registry::new();
        registry.register("QUICK", || Quick).unwrap();
        // same pair again is fine
        registry.register("QUICK", || Quick).unwrap();

        let err = registry.register("QUICK", || Slow).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::RegistrationFailed);
        let err = registry.register("QUICK_AGAIN", || Quick).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::RegistrationFailed);
    }

    #[test]
    fn test_closed_registry_rejects() {
        let registry = Registry::new();
        registry.close();
        assert!(registry.register("QUICK", || Quick).is_err());
        assert!(!registry.contains("QUICK"));
    }
}
