//! End-to-end pipeline tests on a toy byte-level model.
//!
//! # Key Verifications
//! - Stage 1 trains the vision loss only; Stage 2 adds the answer loss
//! - `generate` emits exactly `max_soft_tokens` soft tokens and a non-empty
//!   answer
//! - Greedy decoding is deterministic
//! - Compression stats agree with the teacher's output length

use std::sync::atomic::AtomicBool;

use vision_cot_embeddings::render::Renderer;
use vision_cot_embeddings::teacher::TeacherEncoder;
use vision_cot_embeddings::{GlyphStripRenderer, Trainer, VisionCotPipeline};
use vision_cot_test_utils::{apples_sample, random_addition_samples, toy_adapter_config, toy_config, TOY_HIDDEN};

// =============================================================================
// TRAINING
// =============================================================================

/// Test: Stage 1 reports only the vision loss, and it is finite.
#[test]
fn test_stage1_train_step_vision_only() {
    let mut pipeline = VisionCotPipeline::new(toy_config()).unwrap();
    let s = apples_sample();
    let out = pipeline.train_step(&s.question, &s.reasoning, &s.answer).unwrap();

    assert!(out.loss.is_finite());
    assert!(out.vision_loss.unwrap().is_finite());
    assert!(out.answer_loss.is_none());
    assert_eq!(pipeline.steps_taken(), 1);
}

/// Test: the full scenario, Stage 2 adapter training then generation.
#[test]
fn test_stage2_train_then_generate() {
    let mut pipeline = VisionCotPipeline::new(toy_adapter_config()).unwrap();
    let s = apples_sample();
    assert!(s.reasoning.starts_with("Step 1:"));
    assert!(s.reasoning.contains("Therefore, the answer is $18."));

    let out = pipeline.train_step(&s.question, &s.reasoning, &s.answer).unwrap();
    assert!(out.loss.is_finite());
    assert!(out.vision_loss.is_some());
    assert!(out.answer_loss.is_some());

    let generated = pipeline.generate(&s.question, 8, 16, 0.0, 1.0).unwrap();
    assert_eq!(generated.soft_token_count, 8);
    assert!(!generated.answer_text.is_empty());
    assert!(generated.answer_token_count >= 1 && generated.answer_token_count <= 16);
}

/// Test: a trainer epoch over generated samples trains every sample.
#[test]
fn test_trainer_epoch() {
    let mut config = toy_config();
    config.training.batch_size = 2;
    let trainer = Trainer::from_config(&config.training);
    let mut pipeline = VisionCotPipeline::new(config).unwrap();

    let cancel = AtomicBool::new(false);
    let report = trainer
        .run(&mut pipeline, random_addition_samples(4, 11), &cancel)
        .unwrap();

    assert_eq!(report.samples_trained(), 4);
    assert_eq!(report.samples_skipped(), 0);
    assert_eq!(report.epochs[0].batches, 2);
    assert!(report.epochs[0].mean_vision_loss.unwrap().is_finite());
    assert_eq!(pipeline.steps_taken(), 2);
}

/// Test: a reasoning trace the teacher cannot encode is skipped, not fatal.
#[test]
fn test_oversized_sample_skipped_in_batch() {
    use vision_cot_embeddings::training::TrainStep;

    let mut config = toy_config();
    config.teacher.max_patches = 128;
    let mut pipeline = VisionCotPipeline::new(config).unwrap();

    let mut samples = random_addition_samples(1, 3);
    let mut long = apples_sample();
    long.reasoning = long.reasoning.repeat(4);
    samples.push(long);

    let outcome = pipeline.train_batch(&samples).unwrap();
    assert_eq!(outcome.trained, 1);
    assert_eq!(outcome.skipped, 1);
}

/// Test: a sample longer than the backbone's positions is skipped and the
/// rest of the batch still trains.
#[test]
fn test_overlong_question_skipped_in_batch() {
    use vision_cot_embeddings::training::TrainStep;
    use vision_cot_embeddings::VisionCotError;

    let mut pipeline = VisionCotPipeline::new(toy_adapter_config()).unwrap();
    let mut long = apples_sample();
    long.question = "How many apples? ".repeat(40);

    let err = pipeline
        .train_step(&long.question, &long.reasoning, &long.answer)
        .unwrap_err();
    assert!(matches!(err, VisionCotError::SampleError { .. }));
    assert!(err.is_sample_recoverable());
    assert!(pipeline.evaluate(&long).is_err());

    let mut samples = random_addition_samples(1, 5);
    samples.push(long);
    let outcome = pipeline.train_batch(&samples).unwrap();
    assert_eq!(outcome.trained, 1);
    assert_eq!(outcome.skipped, 1);
    assert!(outcome.losses.unwrap().answer_loss.is_some());
}

// =============================================================================
// INFERENCE
// =============================================================================

/// Test: identical weights, prompt and temperature 0 give identical output.
#[test]
fn test_greedy_generation_is_deterministic() {
    let pipeline = VisionCotPipeline::new(toy_adapter_config()).unwrap();
    let q = apples_sample().question;

    let a = pipeline.generate(&q, 8, 16, 0.0, 1.0).unwrap();
    let b = pipeline.generate(&q, 8, 16, 0.0, 1.0).unwrap();
    assert_eq!(a, b);
}

/// Test: evaluation compares one prediction per teacher target.
#[test]
fn test_evaluate_counts_teacher_tokens() {
    let pipeline = VisionCotPipeline::new(toy_config()).unwrap();
    let s = apples_sample();
    let metrics = pipeline.evaluate(&s).unwrap();
    let stats = pipeline.compression_stats(&s.reasoning).unwrap();

    assert_eq!(metrics.num_tokens, stats.synthesized_tokens);
    assert!(metrics.mean_cosine.abs() <= 1.0 + 1e-5);
    assert!(metrics.mean_mse.is_finite());
}

// =============================================================================
// COMPRESSION ACCOUNTING
// =============================================================================

/// Test: synthesized count equals the teacher's output length for the
/// rendering, and the trace compresses.
#[test]
fn test_compression_stats_match_teacher() {
    let config = toy_config();
    let pipeline = VisionCotPipeline::new(config.clone()).unwrap();
    let renderer = GlyphStripRenderer::new(config.teacher.image_height, config.teacher.patch_width);
    let teacher = TeacherEncoder::new(&config.teacher, TOY_HIDDEN, &candle_core::Device::Cpu).unwrap();

    let reasoning = apples_sample().reasoning;
    let stats = pipeline.compression_stats(&reasoning).unwrap();
    let bitmap = renderer.render(&reasoning).unwrap();

    assert_eq!(stats.synthesized_tokens, teacher.output_len(bitmap.width()));
    assert_eq!(stats.original_tokens, reasoning.len());
    assert!(stats.synthesized_tokens <= stats.original_tokens);
    assert!(stats.ratio >= 1.0);
    assert!(stats.tokens_saved > 0);
}
