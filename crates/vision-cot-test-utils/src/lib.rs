//! Shared fixtures for vision-cot tests.
//!
//! Toy configurations small enough to train a step on CPU in well under a
//! second, and arithmetic reasoning samples in the shape the pipeline
//! expects.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vision_cot_embeddings::config::{BackboneConfig, StageId};
use vision_cot_embeddings::training::data::arithmetic_samples;
use vision_cot_embeddings::{ByteTokenizer, ReasoningSample, VisionCotConfig};

/// Hidden size shared by the toy backbone, projection and teacher output.
pub const TOY_HIDDEN: usize = 32;

/// Stage 1 configuration over a byte-level toy backbone.
pub fn toy_config() -> VisionCotConfig {
    let mut config = VisionCotConfig::default();
    config.model.backbone = BackboneConfig {
        vocab_size: ByteTokenizer::VOCAB_SIZE,
        hidden_size: TOY_HIDDEN,
        num_hidden_layers: 2,
        num_attention_heads: 4,
        intermediate_size: 64,
        max_position_embeddings: 512,
        layer_norm_eps: 1e-5,
        eos_token_id: Some(ByteTokenizer::EOS_TOKEN_ID),
    };
    config.model.embedding_dim = TOY_HIDDEN;
    config.model.lora_rank = 4;
    config.model.lora_alpha = 8.0;
    config.projection.hidden_width = 64;
    config.teacher.hidden_size = 32;
    config.teacher.num_layers = 1;
    config.teacher.num_heads = 4;
    config.teacher.intermediate_size = 64;
    config.training.learning_rate = 1e-3;
    config.training.warmup_steps = 0;
    config.generation.max_soft_tokens = 8;
    config.generation.max_answer_tokens = 16;
    config
}

/// Stage 2 configuration with the low-rank adapter strategy.
pub fn toy_adapter_config() -> VisionCotConfig {
    let mut config = toy_config();
    config.training.stage = StageId::Integration;
    config.training.adapter = true;
    config
}

/// The 4-step "$18" apples trace.
pub fn apples_sample() -> ReasoningSample {
    arithmetic_samples().remove(0)
}

/// `n` random two-step addition traces, reproducible from `seed`.
pub fn random_addition_samples(n: usize, seed: u64) -> Vec<ReasoningSample> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let a: u32 = rng.gen_range(1..50);
            let b: u32 = rng.gen_range(1..50);
            let c: u32 = rng.gen_range(1..50);
            let ab = a + b;
            let total = ab + c;
            ReasoningSample::new(
                format!("What is {} + {} + {}?", a, b, c),
                format!(
                    "Step 1: {} + {} = {}.\nStep 2: {} + {} = {}.\nStep 3: Therefore, the answer is {}.",
                    a, b, ab, ab, c, total, total
                ),
                total.to_string(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toy_configs_validate() {
        toy_config().validate().unwrap();
        toy_adapter_config().validate().unwrap();
    }

    #[test]
    fn test_random_samples_reproducible() {
        assert_eq!(random_addition_samples(3, 9), random_addition_samples(3, 9));
        assert!(random_addition_samples(1, 1)[0].reasoning.contains("Therefore"));
    }
}
