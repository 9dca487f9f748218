//! Teacher weight sources.
//!
//! Without a weights file the teacher is initialised from a fixed seed, so
//! the target space is reproducible across processes.

use std::collections::HashMap;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::TeacherEncoderConfig;

/// Deterministic Xavier-uniform initialiser.
struct SeededInit<'a> {
    rng: StdRng,
    device: &'a Device,
    tensors: HashMap<String, Tensor>,
}

impl<'a> SeededInit<'a> {
    fn new(seed: u64, device: &'a Device) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            device,
            tensors: HashMap::new(),
        }
    }

    fn uniform(&mut self, name: &str, rows: usize, cols: usize, bound: f32) -> candle_core::Result<()> {
        let data: Vec<f32> = (0..rows * cols)
            .map(|_| self.rng.gen_range(-bound..=bound))
            .collect();
        let t = Tensor::from_vec(data, (rows, cols), self.device)?;
        self.tensors.insert(name.to_string(), t);
        Ok(())
    }

    fn constant(&mut self, name: &str, len: usize, value: f32) -> candle_core::Result<()> {
        let t = Tensor::from_vec(vec![value; len], len, self.device)?;
        self.tensors.insert(name.to_string(), t);
        Ok(())
    }

    fn linear(&mut self, prefix: &str, in_dim: usize, out_dim: usize, bias: bool) -> candle_core::Result<()> {
        let bound = (6.0 / (in_dim + out_dim) as f32).sqrt();
        self.uniform(&format!("{prefix}.weight"), out_dim, in_dim, bound)?;
        if bias {
            self.constant(&format!("{prefix}.bias"), out_dim, 0.0)?;
        }
        Ok(())
    }

    fn layer_norm(&mut self, prefix: &str, dim: usize) -> candle_core::Result<()> {
        self.constant(&format!("{prefix}.weight"), dim, 1.0)?;
        self.constant(&format!("{prefix}.bias"), dim, 0.0)
    }
}

/// Build the full teacher tensor map from `config.seed`.
///
/// Names match what [`super::TeacherEncoder`] reads from a safetensors file.
pub(crate) fn seeded_tensors(
    config: &TeacherEncoderConfig,
    output_dim: usize,
    device: &Device,
) -> candle_core::Result<HashMap<String, Tensor>> {
    let h = config.hidden_size;
    let mut init = SeededInit::new(config.seed, device);

    init.linear("patch_embed", config.patch_pixels(), h, true)?;
    init.uniform("position_embedding", config.max_patches, h, 0.02)?;
    for i in 0..config.num_layers {
        let p = format!("layers.{i}");
        init.layer_norm(&format!("{p}.ln1"), h)?;
        for proj in ["q_proj", "k_proj", "v_proj", "o_proj"] {
            init.linear(&format!("{p}.attn.{proj}"), h, h, true)?;
        }
        init.layer_norm(&format!("{p}.ln2"), h)?;
        init.linear(&format!("{p}.fc1"), h, config.intermediate_size, true)?;
        init.linear(&format!("{p}.fc2"), config.intermediate_size, h, true)?;
    }
    init.layer_norm("post_layernorm", h)?;
    init.linear("output_projection", h, output_dim, false)?;

    Ok(init.tensors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_tensors_reproducible() {
        let config = TeacherEncoderConfig::default();
        let a = seeded_tensors(&config, 16, &Device::Cpu).unwrap();
        let b = seeded_tensors(&config, 16, &Device::Cpu).unwrap();
        let wa: Vec<f32> = a["patch_embed.weight"].flatten_all().unwrap().to_vec1().unwrap();
        let wb: Vec<f32> = b["patch_embed.weight"].flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(wa, wb);
        assert_eq!(a["output_projection.weight"].dims(), &[16, config.hidden_size]);
        assert!(!a.contains_key("output_projection.bias"));
    }

    #[test]
    fn test_seed_changes_weights() {
        let mut config = TeacherEncoderConfig::default();
        let a = seeded_tensors(&config, 16, &Device::Cpu).unwrap();
        config.seed += 1;
        let b = seeded_tensors(&config, 16, &Device::Cpu).unwrap();
        let wa: Vec<f32> = a["patch_embed.weight"].flatten_all().unwrap().to_vec1().unwrap();
        let wb: Vec<f32> = b["patch_embed.weight"].flatten_all().unwrap().to_vec1().unwrap();
        assert_ne!(wa, wb);
    }
}
