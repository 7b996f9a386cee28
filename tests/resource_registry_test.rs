use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use portrait_isolation::mocks::{write_portrait, CountingResource};
use portrait_isolation::model::{OnnxModelResource, DETECTION_IO, DETECTION_MODEL};
use portrait_isolation::{
    IsolationConfig, IsolationEngine, IsolationError, ResourceRegistry, ResourceState,
};

fn load_all_in_parallel(registry: &Arc<ResourceRegistry>, names: &[&str]) -> Duration {
    let started = Instant::now();
    let handles: Vec<_> = names
        .iter()
        .map(|name| {
            let registry = Arc::clone(registry);
            let name = name.to_string();
            thread::spawn(move || registry.get(&name, Duration::from_secs(5)))
        })
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap().is_ok());
    }
    started.elapsed()
}

#[test]
fn test_expensive_loads_are_throttled() -> portrait_isolation::Result<()> {
    let registry = Arc::new(ResourceRegistry::new(2, Duration::from_secs(5)));
    let names = ["m1", "m2", "m3", "m4"];
    for name in names {
        registry.register(Arc::new(
            CountingResource::new(name).with_delay(Duration::from_millis(200)),
        ))?;
    }

    // four loads through two slots take at least two rounds
    let elapsed = load_all_in_parallel(&registry, &names);
    assert!(elapsed >= Duration::from_millis(380), "{:?}", elapsed);
    assert_eq!(registry.loaded_count(), 4);
    Ok(())
}

#[test]
fn test_cheap_loads_bypass_the_limit() -> portrait_isolation::Result<()> {
    let registry = Arc::new(ResourceRegistry::new(1, Duration::from_secs(5)));
    let names = ["c1", "c2", "c3"];
    for name in names {
        registry.register(Arc::new(
            CountingResource::new(name)
                .with_delay(Duration::from_millis(200))
                .cheap(),
        ))?;
    }

    let elapsed = load_all_in_parallel(&registry, &names);
    assert!(elapsed < Duration::from_millis(550), "{:?}", elapsed);
    Ok(())
}

#[test]
fn test_waiting_for_a_load_slot_times_out() -> portrait_isolation::Result<()> {
    let registry = Arc::new(ResourceRegistry::new(1, Duration::from_secs(5)));
    registry.register(Arc::new(
        CountingResource::new("hog").with_delay(Duration::from_millis(400)),
    ))?;
    registry.register(Arc::new(CountingResource::new("queued")))?;

    let hog = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || registry.get("hog", Duration::from_secs(5)))
    };
    thread::sleep(Duration::from_millis(50));

    let err = registry
        .get("queued", Duration::from_millis(50))
        .unwrap_err();
    assert!(matches!(err, IsolationError::ResourceTimeout { .. }));
    assert_eq!(
        registry.info("queued").map(|i| i.state),
        Some(ResourceState::NotLoaded)
    );

    assert!(hog.join().unwrap().is_ok());
    registry.get("queued", Duration::from_secs(1))?;
    Ok(())
}

#[test]
fn test_missing_model_file_fails_the_resource() {
    let registry = ResourceRegistry::new(2, Duration::from_secs(1));
    registry
        .register(Arc::new(OnnxModelResource::new(
            DETECTION_MODEL,
            "/nonexistent/detector.onnx".into(),
            0,
            DETECTION_IO,
        )))
        .unwrap();

    let err = registry
        .get(DETECTION_MODEL, Duration::from_secs(1))
        .unwrap_err();
    assert!(matches!(err, IsolationError::ResourceLoad { .. }));

    let info = registry.info(DETECTION_MODEL).unwrap();
    assert_eq!(info.state, ResourceState::Failed);
    assert!(info.error.unwrap_or_default().contains("does not exist"));
}

#[test]
fn test_unavailable_detection_model_degrades_to_heuristic() -> anyhow::Result<()> {
    let temp_dir = TempDir::new()?;
    let input = write_portrait(temp_dir.path(), "p.png", 120, 160)?;
    let config = IsolationConfig {
        detection_model_path: Some(temp_dir.path().join("missing.onnx")),
        output_dir: Some(temp_dir.path().join("out")),
        ..IsolationConfig::default()
    };

    let engine = IsolationEngine::from_config(config)?;
    let result = engine.isolate_person(&input)?;
    assert!(result.success, "{:?}", result.error_message);
    assert_eq!(
        engine.registry().info(DETECTION_MODEL).map(|i| i.state),
        Some(ResourceState::Failed)
    );
    Ok(())
}
