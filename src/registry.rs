//! Lazy loading of expensive resources (detection and segmentation models).
//!
//! Each registered resource moves through `NotLoaded → Loading → Loaded | Failed`.
//! Transitions only happen inside [`ResourceRegistry::get`] and the unload calls, under
//! that resource's own lock, so at most one `load()` runs per name at any time.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::IsolationConfig;
use crate::errors::{IsolationError, Result};
use crate::semaphore::Semaphore;
use crate::traits::{ManagedResource, ResourceInstance};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceState {
    NotLoaded,
    Loading,
    Loaded,
    Failed,
}

/// Snapshot of one resource's bookkeeping.
#[derive(Debug, Clone)]
pub struct ResourceInfo {
    pub name: String,
    pub state: ResourceState,
    pub instance: Option<ResourceInstance>,
    pub error: Option<String>,
    pub load_time: Option<Duration>,
    pub last_accessed: Option<Instant>,
    pub access_count: u64,
}

impl ResourceInfo {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: ResourceState::NotLoaded,
            instance: None,
            error: None,
            load_time: None,
            last_accessed: None,
            access_count: 0,
        }
    }
}

struct ResourceSlot {
    resource: Arc<dyn ManagedResource>,
    info: Mutex<ResourceInfo>,
    settled: Condvar,
}

pub struct ResourceRegistry {
    slots: RwLock<HashMap<String, Arc<ResourceSlot>>>,
    load_slots: Semaphore,
    default_timeout: Duration,
}

impl ResourceRegistry {
    pub fn new(max_concurrent_loads: usize, default_timeout: Duration) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            load_slots: Semaphore::new(max_concurrent_loads),
            default_timeout,
        }
    }

    pub fn from_config(config: &IsolationConfig) -> Self {
        Self::new(config.max_concurrent_loads, config.resource_timeout())
    }

    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Registering a name twice is rejected; the first registration wins.
    pub fn register(&self, resource: Arc<dyn ManagedResource>) -> Result<()> {
        let name = resource.name().to_string();
        let mut slots = self.slots.write();
        if slots.contains_key(&name) {
            return Err(IsolationError::Validation {
                field: format!("resource '{}'", name),
                reason: "is already registered".to_string(),
            });
        }

        debug!(resource = %name, expensive = resource.is_expensive(), "registered resource");
        slots.insert(
            name.clone(),
            Arc::new(ResourceSlot {
                info: Mutex::new(ResourceInfo::new(&name)),
                resource,
                settled: Condvar::new(),
            }),
        );
        Ok(())
    }

    pub fn resource_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.slots.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn info(&self, name: &str) -> Option<ResourceInfo> {
        let slot = self.slots.read().get(name).cloned()?;
        let info = slot.info.lock().clone();
        Some(info)
    }

    pub fn loaded_count(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|slot| slot.info.lock().state == ResourceState::Loaded)
            .count()
    }

    /// Returns the loaded instance, loading it first if needed.
    ///
    /// Blocks while another caller's load of the same resource is in flight, or while
    /// all expensive-load slots are taken; both waits are bounded by `timeout`.
    pub fn get(&self, name: &str, timeout: Duration) -> Result<ResourceInstance> {
        let slot = self.slot(name)?;
        let started = Instant::now();
        let deadline = started + timeout;
        let mut waited_on_other = false;

        let mut info = slot.info.lock();
        loop {
            match info.state {
                ResourceState::Loaded => match info.instance.clone() {
                    Some(instance) => {
                        info.last_accessed = Some(Instant::now());
                        info.access_count += 1;
                        return Ok(instance);
                    }
                    None => info.state = ResourceState::NotLoaded,
                },
                ResourceState::Loading => {
                    waited_on_other = true;
                    let timed_out = slot.settled.wait_until(&mut info, deadline).timed_out();
                    if timed_out && info.state == ResourceState::Loading {
                        return Err(IsolationError::ResourceTimeout {
                            name: name.to_string(),
                            waited: started.elapsed(),
                        });
                    }
                }
                // the load we were waiting on failed: report it instead of retrying
                ResourceState::Failed if waited_on_other => {
                    return Err(IsolationError::ResourceLoad {
                        name: name.to_string(),
                        message: info.error.clone().unwrap_or_default(),
                    });
                }
                ResourceState::NotLoaded | ResourceState::Failed => break,
            }
        }

        info.state = ResourceState::Loading;
        info.error = None;
        drop(info);

        self.load_slot(&slot, started, deadline)
    }

    /// `get` with a downcast to the resource's concrete instance type.
    pub fn get_as<T: Any + Send + Sync>(&self, name: &str, timeout: Duration) -> Result<Arc<T>> {
        self.get(name, timeout)?
            .downcast::<T>()
            .map_err(|_| IsolationError::Validation {
                field: format!("resource '{}'", name),
                reason: format!("is not a {}", std::any::type_name::<T>()),
            })
    }

    /// No-op unless the resource is currently loaded. Returns whether it was unloaded.
    pub fn unload(&self, name: &str) -> Result<bool> {
        let slot = self.slot(name)?;
        let mut info = slot.info.lock();
        Self::unload_locked(&slot, &mut info)
    }

    /// Unloads every loaded resource idle for longer than `max_idle`.
    pub fn unload_unused(&self, max_idle: Duration) -> Vec<String> {
        let mut unloaded = Vec::new();

        for slot in self.snapshot() {
            let mut info = slot.info.lock();
            let idle = info
                .last_accessed
                .is_some_and(|accessed| accessed.elapsed() > max_idle);
            if info.state != ResourceState::Loaded || !idle {
                continue;
            }

            match Self::unload_locked(&slot, &mut info) {
                Ok(true) => unloaded.push(info.name.clone()),
                Ok(false) => {}
                Err(e) => warn!(resource = %info.name, error = %e, "idle unload failed"),
            }
        }

        if !unloaded.is_empty() {
            info!(resources = ?unloaded, "unloaded idle resources");
        }
        unloaded
    }

    /// Unloads everything. Call once when the owning application shuts down.
    pub fn shutdown(&self) {
        for slot in self.snapshot() {
            let mut info = slot.info.lock();
            if let Err(e) = Self::unload_locked(&slot, &mut info) {
                warn!(resource = %info.name, error = %e, "unload during shutdown failed");
            }
        }
    }

    fn load_slot(
        &self,
        slot: &ResourceSlot,
        started: Instant,
        deadline: Instant,
    ) -> Result<ResourceInstance> {
        let name = slot.resource.name().to_string();

        let _permit = if slot.resource.is_expensive() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.load_slots.acquire_timeout(remaining) {
                Some(permit) => Some(permit),
                None => {
                    let mut info = slot.info.lock();
                    info.state = ResourceState::NotLoaded;
                    slot.settled.notify_all();
                    return Err(IsolationError::ResourceTimeout {
                        name,
                        waited: started.elapsed(),
                    });
                }
            }
        } else {
            None
        };

        debug!(resource = %name, "loading resource");
        let load_started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| slot.resource.load()))
            .unwrap_or_else(|_| {
                Err(IsolationError::ResourceLoad {
                    name: name.clone(),
                    message: "load panicked".to_string(),
                })
            });
        let load_time = load_started.elapsed();

        let mut info = slot.info.lock();
        let result = match outcome {
            Ok(instance) => {
                info.state = ResourceState::Loaded;
                info.instance = Some(Arc::clone(&instance));
                info.load_time = Some(load_time);
                info.last_accessed = Some(Instant::now());
                info.access_count += 1;
                info!(resource = %name, ?load_time, "resource loaded");
                Ok(instance)
            }
            Err(e) => {
                let message = e.to_string();
                warn!(resource = %name, error = %message, "resource load failed");
                info.state = ResourceState::Failed;
                info.instance = None;
                info.error = Some(message.clone());
                Err(IsolationError::ResourceLoad { name, message })
            }
        };
        slot.settled.notify_all();
        result
    }

    fn unload_locked(slot: &ResourceSlot, info: &mut ResourceInfo) -> Result<bool> {
        if info.state != ResourceState::Loaded {
            return Ok(false);
        }

        info.state = ResourceState::NotLoaded;
        if let Some(instance) = info.instance.take() {
            slot.resource.unload(instance)?;
        }
        debug!(resource = %info.name, "resource unloaded");
        Ok(true)
    }

    fn slot(&self, name: &str) -> Result<Arc<ResourceSlot>> {
        self.slots
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| IsolationError::UnknownResource {
                name: name.to_string(),
            })
    }

    fn snapshot(&self) -> Vec<Arc<ResourceSlot>> {
        self.slots.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::CountingResource;
    use std::thread;

    fn registry() -> ResourceRegistry {
        ResourceRegistry::new(2, Duration::from_secs(5))
    }

    #[test]
    fn test_get_loads_once() -> Result<()> {
        let registry = registry();
        let resource = Arc::new(CountingResource::new("detector"));
        registry.register(resource.clone())?;

        let first = registry.get("detector", Duration::from_secs(1))?;
        let second = registry.get("detector", Duration::from_secs(1))?;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(resource.load_count(), 1);

        let info = registry.info("detector").unwrap();
        assert_eq!(info.state, ResourceState::Loaded);
        assert_eq!(info.access_count, 2);
        assert!(info.load_time.is_some());
        Ok(())
    }

    #[test]
    fn test_duplicate_and_unknown_names() -> Result<()> {
        let registry = registry();
        registry.register(Arc::new(CountingResource::new("a")))?;
        assert!(registry.register(Arc::new(CountingResource::new("a"))).is_err());
        assert!(matches!(
            registry.get("b", Duration::from_millis(10)),
            Err(IsolationError::UnknownResource { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_failed_load_is_retried_on_next_get() -> Result<()> {
        let registry = registry();
        let resource = Arc::new(CountingResource::new("remover").failing_times(1));
        registry.register(resource.clone())?;

        let err = registry.get("remover", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, IsolationError::ResourceLoad { .. }));
        let info = registry.info("remover").unwrap();
        assert_eq!(info.state, ResourceState::Failed);
        assert!(info.error.is_some());

        registry.get("remover", Duration::from_secs(1))?;
        assert_eq!(resource.load_count(), 2);
        assert_eq!(registry.info("remover").unwrap().state, ResourceState::Loaded);
        Ok(())
    }

    #[test]
    fn test_concurrent_get_shares_single_load() -> Result<()> {
        let registry = Arc::new(registry());
        let resource =
            Arc::new(CountingResource::new("slow").with_delay(Duration::from_millis(150)));
        registry.register(resource.clone())?;

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.get("slow", Duration::from_secs(5)))
            })
            .collect();

        let instances = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Result<Vec<_>>>()?;

        assert_eq!(resource.load_count(), 1);
        assert!(instances.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        Ok(())
    }

    #[test]
    fn test_waiter_times_out_while_other_load_in_flight() -> Result<()> {
        let registry = Arc::new(registry());
        registry.register(Arc::new(
            CountingResource::new("slow").with_delay(Duration::from_millis(400)),
        ))?;

        let loader = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.get("slow", Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(50));

        let err = registry.get("slow", Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, IsolationError::ResourceTimeout { .. }));

        assert!(loader.join().unwrap().is_ok());
        Ok(())
    }

    #[test]
    fn test_waiter_sees_in_flight_failure() -> Result<()> {
        let registry = Arc::new(registry());
        registry.register(Arc::new(
            CountingResource::new("broken")
                .with_delay(Duration::from_millis(150))
                .failing_times(1),
        ))?;

        let loader = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.get("broken", Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(30));

        let err = registry.get("broken", Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, IsolationError::ResourceLoad { .. }));
        assert!(loader.join().unwrap().is_err());
        Ok(())
    }

    #[test]
    fn test_unload_only_acts_on_loaded() -> Result<()> {
        let registry = registry();
        let resource = Arc::new(CountingResource::new("model"));
        registry.register(resource.clone())?;

        assert!(!registry.unload("model")?);
        registry.get("model", Duration::from_secs(1))?;
        assert!(registry.unload("model")?);
        assert_eq!(resource.unload_count(), 1);
        assert_eq!(registry.info("model").unwrap().state, ResourceState::NotLoaded);

        registry.get("model", Duration::from_secs(1))?;
        assert_eq!(resource.load_count(), 2);
        Ok(())
    }

    #[test]
    fn test_unload_unused_respects_idle_threshold() -> Result<()> {
        let registry = registry();
        registry.register(Arc::new(CountingResource::new("idle")))?;
        registry.register(Arc::new(CountingResource::new("never")))?;
        registry.get("idle", Duration::from_secs(1))?;

        assert!(registry.unload_unused(Duration::from_secs(60)).is_empty());

        thread::sleep(Duration::from_millis(30));
        let unloaded = registry.unload_unused(Duration::from_millis(10));
        assert_eq!(unloaded, vec!["idle".to_string()]);
        assert_eq!(registry.loaded_count(), 0);
        Ok(())
    }

    #[test]
    fn test_idle_sweep_skips_in_flight_load() -> Result<()> {
        let registry = Arc::new(registry());
        let resource =
            Arc::new(CountingResource::new("warming").with_delay(Duration::from_millis(200)));
        registry.register(resource.clone())?;

        let loader = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.get("warming", Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(registry.info("warming").unwrap().state, ResourceState::Loading);

        let sweeper = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.unload_unused(Duration::ZERO))
        };
        assert!(sweeper.join().unwrap().is_empty());

        let instance = loader.join().unwrap()?;
        assert_eq!(*instance.downcast::<usize>().unwrap(), 1);
        let info = registry.info("warming").unwrap();
        assert_eq!(info.state, ResourceState::Loaded);
        assert!(info.instance.is_some());
        assert_eq!(resource.unload_count(), 0);

        // once settled, the same sweep unloads it
        thread::sleep(Duration::from_millis(5));
        assert_eq!(registry.unload_unused(Duration::ZERO), vec!["warming".to_string()]);
        assert_eq!(registry.info("warming").unwrap().state, ResourceState::NotLoaded);
        assert_eq!(resource.unload_count(), 1);
        Ok(())
    }

    #[test]
    fn test_get_as_downcasts_instance() -> Result<()> {
        let registry = registry();
        registry.register(Arc::new(CountingResource::new("typed")))?;

        let generation = registry.get_as::<usize>("typed", Duration::from_secs(1))?;
        assert_eq!(*generation, 1);
        assert!(registry
            .get_as::<String>("typed", Duration::from_secs(1))
            .is_err());
        Ok(())
    }

    #[test]
    fn test_shutdown_unloads_everything() -> Result<()> {
        let registry = registry();
        let a = Arc::new(CountingResource::new("a"));
        let b = Arc::new(CountingResource::new("b").cheap());
        registry.register(a.clone())?;
        registry.register(b.clone())?;
        registry.get("a", Duration::from_secs(1))?;
        registry.get("b", Duration::from_secs(1))?;

        registry.shutdown();
        assert_eq!(registry.loaded_count(), 0);
        assert_eq!(a.unload_count() + b.unload_count(), 2);
        Ok(())
    }
}
