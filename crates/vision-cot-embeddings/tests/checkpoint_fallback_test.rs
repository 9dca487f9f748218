//! Stage artifact loading and fallback.
//!
//! # Key Verifications
//! - A nonexistent Stage 1 path does not prevent construction and logs a
//!   warning
//! - Missing and malformed artifacts are reported and leave weights alone
//! - Saved artifacts load back into a fresh pipeline

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use candle_core::Tensor;
use tempfile::TempDir;
use vision_cot_embeddings::checkpoint::load_stage;
use vision_cot_embeddings::config::StageId;
use vision_cot_embeddings::{ArtifactStatus, ParamGroup, VisionCotPipeline};
use vision_cot_test_utils::{apples_sample, toy_adapter_config, toy_config};

fn projection(pipeline: &VisionCotPipeline) -> HashMap<String, Vec<f32>> {
    pipeline
        .model()
        .registry()
        .snapshot(ParamGroup::ProjectionHead)
        .unwrap()
        .into_iter()
        .map(|(k, t): (String, Tensor)| (k, t.flatten_all().unwrap().to_vec1::<f32>().unwrap()))
        .collect()
}

/// Log sink shared between a test subscriber and the assertion.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl CapturedLogs {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

// =============================================================================
// FALLBACK
// =============================================================================

/// Test: the fallback for a missing artifact is logged as a warning.
#[test]
fn test_missing_artifact_emits_warning() {
    let mut config = toy_config();
    config.checkpoints.stage1_path = Some(PathBuf::from("/nonexistent/stage1.safetensors"));

    let logs = CapturedLogs::default();
    let sink = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || sink.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    let pipeline = tracing::subscriber::with_default(subscriber, || VisionCotPipeline::new(config).unwrap());

    assert!(matches!(pipeline.artifacts().stage1, ArtifactStatus::Missing { .. }));
    let text = logs.text();
    assert!(text.contains("WARN"), "logs: {}", text);
    assert!(text.contains("Stage artifact not found"), "logs: {}", text);
    assert!(text.contains("/nonexistent/stage1.safetensors"), "logs: {}", text);
}

/// Test: nonexistent Stage 1 artifact is reported, not raised.
#[test]
fn test_missing_stage1_does_not_raise() {
    let mut config = toy_config();
    config.checkpoints.stage1_path = Some(PathBuf::from("/nonexistent/stage1.safetensors"));

    let pipeline = VisionCotPipeline::new(config).unwrap();
    assert!(matches!(
        pipeline.artifacts().stage1,
        ArtifactStatus::Missing { .. }
    ));
    assert_eq!(pipeline.artifacts().stage2, ArtifactStatus::NotConfigured);
}

/// Test: a failed load keeps the projection head at its initialisation.
#[test]
fn test_missing_artifact_keeps_projection() {
    let pipeline = VisionCotPipeline::new(toy_config()).unwrap();
    let before = projection(&pipeline);

    let status = load_stage(
        pipeline.model().registry(),
        None,
        StageId::Bootstrap,
        &PathBuf::from("/nonexistent/stage1.safetensors"),
        pipeline.device(),
    );
    assert!(matches!(status, ArtifactStatus::Missing { .. }));
    assert_eq!(projection(&pipeline), before);
}

/// Test: a corrupt artifact is reported as malformed and the pipeline works.
#[test]
fn test_corrupt_stage2_is_malformed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("stage2.safetensors");
    std::fs::write(&path, b"\x00\x01garbage").unwrap();

    let mut config = toy_adapter_config();
    config.checkpoints.stage2_path = Some(path);
    let pipeline = VisionCotPipeline::new(config).unwrap();

    assert!(matches!(
        pipeline.artifacts().stage2,
        ArtifactStatus::Malformed { .. }
    ));
    let out = pipeline.generate("1 + 1?", 2, 2, 0.0, 1.0).unwrap();
    assert_eq!(out.soft_token_count, 2);
}

// =============================================================================
// ROUND TRIP
// =============================================================================

/// Test: a trained projection head survives save and reload.
#[test]
fn test_saved_artifacts_reload() {
    let dir = TempDir::new().unwrap();
    let mut trained = VisionCotPipeline::new(toy_config()).unwrap();
    let s = apples_sample();
    trained.train_step(&s.question, &s.reasoning, &s.answer).unwrap();
    let (stage1, stage2) = trained.save_artifacts(dir.path()).unwrap();
    assert!(stage1.exists() && stage2.exists());

    let mut config = toy_config();
    config.checkpoints.stage1_path = Some(stage1);
    config.checkpoints.stage2_path = Some(stage2);
    let restored = VisionCotPipeline::new(config).unwrap();

    assert!(restored.artifacts().stage1.is_loaded());
    assert!(restored.artifacts().stage2.is_loaded());
    assert_eq!(projection(&restored), projection(&trained));

    let q = &s.question;
    assert_eq!(
        restored.generate(q, 4, 8, 0.0, 1.0).unwrap(),
        trained.generate(q, 4, 8, 0.0, 1.0).unwrap()
    );
}
