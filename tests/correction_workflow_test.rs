use std::sync::Arc;

use tempfile::TempDir;

use portrait_isolation::correction::AUDIT_ACTION;
use portrait_isolation::mocks::{
    write_portrait, MockPersonDetector, RecordingAuditSink, RecordingRegenerationService,
};
use portrait_isolation::{
    BoundingBox, CorrectionConfig, CorrectionRequest, CorrectionWorkflow, CropRect,
    IsolationConfig, IsolationEngine, ProcessingMethod,
};

fn workflow(temp_dir: &TempDir) -> (CorrectionWorkflow, Arc<RecordingAuditSink>) {
    let audit = Arc::new(RecordingAuditSink::default());
    let config = CorrectionConfig {
        output_dir: Some(temp_dir.path().join("corrections")),
        ..CorrectionConfig::default()
    };
    (CorrectionWorkflow::new(config, audit.clone()), audit)
}

#[test]
fn test_low_confidence_result_handed_to_user() -> anyhow::Result<()> {
    let temp_dir = TempDir::new()?;
    let original = write_portrait(temp_dir.path(), "gen.png", 120, 160)?;

    let engine = IsolationEngine::builder(IsolationConfig {
        output_dir: Some(temp_dir.path().join("isolated")),
        ..IsolationConfig::default()
    })
    .primary_detector(Arc::new(MockPersonDetector::single(
        BoundingBox::new(30, 24, 60, 112),
        0.45,
    )))
    .build();
    let isolation = engine.isolate_person(&original)?;
    assert!(isolation.success);

    let (workflow, audit) = workflow(&temp_dir);
    let request = CorrectionRequest {
        processed_image_path: isolation.isolated_image_path.clone(),
        processing_confidence: isolation.confidence_score,
        ..CorrectionRequest::new("participant-1", &original, "accept")
    };
    let result = workflow.process_user_correction(&request);

    assert!(result.success);
    assert_eq!(result.processing_method, ProcessingMethod::AcceptProcessed);
    assert_eq!(Some(result.final_image_path), isolation.isolated_image_path);

    let records = audit.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].user_id, "participant-1");
    assert_eq!(records[0].action, AUDIT_ACTION);
    assert_eq!(records[0].details["processing_method"], "accept_processed");
    assert_eq!(records[0].details["success"], true);
    Ok(())
}

#[test]
fn test_every_branch_returns_a_result() -> anyhow::Result<()> {
    let temp_dir = TempDir::new()?;
    let original = write_portrait(temp_dir.path(), "p.png", 40, 30)?;
    let (workflow, audit) = workflow(&temp_dir);

    let cases = [
        ("accept", ProcessingMethod::AcceptFallback, true),
        ("adjust", ProcessingMethod::AdjustFailed, false),
        ("original", ProcessingMethod::UseOriginal, true),
        ("regenerate", ProcessingMethod::Regenerate, true),
        ("approve", ProcessingMethod::Fallback, false),
    ];
    for (decision, method, success) in cases {
        let result =
            workflow.process_user_correction(&CorrectionRequest::new("u", &original, decision));
        assert_eq!(result.processing_method, method, "decision {}", decision);
        assert_eq!(result.success, success, "decision {}", decision);
        assert!(result.user_feedback_recorded);
    }
    assert_eq!(audit.records().len(), cases.len());
    Ok(())
}

#[test]
fn test_crops_stay_inside_image_for_wild_requests() -> anyhow::Result<()> {
    let temp_dir = TempDir::new()?;
    let original = write_portrait(temp_dir.path(), "frame.png", 64, 48)?;
    let (workflow, _) = workflow(&temp_dir);

    for crop in [
        CropRect::new(-100, -100, 1000, 1000),
        CropRect::new(60, 40, 2, 2),
        CropRect::new(64, 48, 64, 48),
    ] {
        let request = CorrectionRequest {
            crop_coordinates: Some(crop),
            ..CorrectionRequest::new("u", &original, "adjust")
        };
        let result = workflow.process_user_correction(&request);
        assert_eq!(result.processing_method, ProcessingMethod::ManualCrop, "{:?}", crop);

        let (width, height) = image::image_dimensions(&result.final_image_path)?;
        assert!(width >= 1 && width <= 64);
        assert!(height >= 1 && height <= 48);
    }
    Ok(())
}

#[test]
fn test_batch_of_ten_is_aggregated_and_cleared() -> anyhow::Result<()> {
    let temp_dir = TempDir::new()?;
    let original = write_portrait(temp_dir.path(), "p.png", 32, 32)?;
    let (workflow, _) = workflow(&temp_dir);

    for i in 0..10 {
        let request = CorrectionRequest {
            rejection_reason: Some(if i % 2 == 0 {
                "Poor quality".to_string()
            } else {
                "Multiple people in frame".to_string()
            }),
            processing_confidence: if i < 4 { 0.2 } else { 0.9 },
            ..CorrectionRequest::new("u", &original, "regenerate")
        };
        workflow.process_user_correction(&request);
    }

    assert_eq!(workflow.pending_records(), 0);
    let insights = workflow.get_learning_insights();
    assert_eq!(insights.pending_records, 0);

    let patterns = insights.patterns.expect("aggregated batch");
    assert_eq!(patterns.batch_size, 10);
    assert_eq!(patterns.decisions["regenerate"], 10);
    assert_eq!(patterns.rejection_reasons["poor quality"], 5);
    assert_eq!(patterns.rejection_reasons["multiple people in frame"], 5);
    assert_eq!(patterns.low_confidence_decisions["regenerate"], 4);
    assert!(insights
        .recommendations
        .contains(&"raise default quality thresholds".to_string()));
    assert!(insights
        .recommendations
        .contains(&"improve person-detection sensitivity".to_string()));

    // the next record starts a new batch without touching the summary
    workflow.process_user_correction(&CorrectionRequest::new("u", &original, "original"));
    let insights = workflow.get_learning_insights();
    assert_eq!(insights.pending_records, 1);
    assert_eq!(insights.patterns.map(|p| p.batch_size), Some(10));
    Ok(())
}

#[test]
fn test_regeneration_failure_is_reported_in_result() -> anyhow::Result<()> {
    let temp_dir = TempDir::new()?;
    let original = write_portrait(temp_dir.path(), "p.png", 32, 32)?;
    let (workflow, _) = workflow(&temp_dir);
    let service = Arc::new(RecordingRegenerationService::failing());
    let workflow = workflow.with_regeneration_service(service.clone());

    let request = CorrectionRequest {
        rejection_reason: Some("background is too busy".to_string()),
        ..CorrectionRequest::new("u", &original, "regenerate")
    };
    let result = workflow.process_user_correction(&request);

    assert!(!result.success);
    assert!(!result.regeneration_triggered);
    assert_eq!(result.final_image_path, original);
    let parameters = result.regeneration_parameters.expect("parameters");
    assert!(parameters.background_simplification);
    assert_eq!(service.calls().len(), 1);
    Ok(())
}
