pub mod config;
pub mod correction;
pub mod detection;
pub mod engine;
pub mod errors;
pub mod mask;
pub mod model;
pub mod quality;
pub mod registry;
pub mod remote;
pub mod removal;
pub mod resilience;
pub mod semaphore;
pub mod traits;

mod imageops_ai;

pub mod mocks;

pub use config::{CorrectionConfig, IsolationConfig, RgbColor};
pub use correction::{
    CorrectionRequest, CorrectionResult, CorrectionWorkflow, CropRect, LearningInsights,
    ProcessingMethod, RegenerationParameters, TracingAuditSink,
};
pub use detection::{BoundingBox, EdgeDensityDetector, PersonDetection};
pub use engine::{IsolationEngine, IsolationResult};
pub use errors::{ErrorKind, IsolationError, Result};
pub use mask::Mask;
pub use quality::{QualityAnalysis, QualityAnalyzer, QualityIssue};
pub use registry::{ResourceInfo, ResourceRegistry, ResourceState};
pub use remote::{HttpIsolationBackend, RemoteIsolation, RemoteIsolationRequest};
pub use removal::RemovalMethod;
pub use resilience::{
    with_resilience, BreakerConfig, CircuitState, ResiliencePolicy, RetryConfig,
};
pub use traits::*;
