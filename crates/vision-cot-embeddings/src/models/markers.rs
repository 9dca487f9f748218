//! Compression marker tokens.
//!
//! Three reserved ids follow the base vocabulary: *begin*, *soft-slot* and
//! *end*. Their embeddings are seeded unit directions scaled to a fixed
//! norm, so they are distinguishable from ordinary tokens before any
//! training.

use candle_core::{Device, Tensor};
use candle_nn::{Init, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::error::{VisionCotError, VisionCotResult};

fn map_candle(e: candle_core::Error) -> VisionCotError {
    VisionCotError::TensorError {
        message: format!("Marker table error: {}", e),
    }
}

/// Reserved compression markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marker {
    /// Opens the compressed region.
    Begin = 0,
    /// Placeholder for one synthesized embedding in token-level layouts.
    SoftSlot = 1,
    /// Closes the compressed region; discrete decoding follows.
    End = 2,
}

impl Marker {
    pub const ALL: [Marker; 3] = [Marker::Begin, Marker::SoftSlot, Marker::End];

    /// Row in the marker table.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Token id after a base vocabulary of `base_vocab` ids.
    pub fn token_id(self, base_vocab: usize) -> u32 {
        (base_vocab + self.index()) as u32
    }
}

/// `[3, hidden]` marker embeddings.
pub struct MarkerTable {
    table: Tensor,
}

impl MarkerTable {
    /// Tensor name inside the marker group.
    pub const WEIGHT: &'static str = "weight";

    /// Create the table under `vb` and overwrite it with the seeded
    /// initialisation. `varmap` must be the map backing `vb`.
    pub fn new(
        hidden_size: usize,
        base_vocab: usize,
        target_norm: f32,
        seed: u64,
        vb: VarBuilder,
        varmap: &VarMap,
        device: &Device,
    ) -> VisionCotResult<Self> {
        let table = vb
            .get_with_hints((Marker::ALL.len(), hidden_size), Self::WEIGHT, Init::Const(0.0))
            .map_err(map_candle)?;
        let init = seeded_markers(hidden_size, target_norm, seed, device)?;
        // VarMap clones share storage
        let mut shared = varmap.clone();
        shared.set_one(Self::WEIGHT, &init).map_err(map_candle)?;

        debug!(hidden_size, base_vocab, target_norm, seed, "Initialised marker embeddings");
        Ok(Self { table })
    }

    /// Embedding of one marker, `[1, hidden]`.
    pub fn embedding(&self, marker: Marker) -> VisionCotResult<Tensor> {
        self.table.narrow(0, marker.index(), 1).map_err(map_candle)
    }

    /// Whole table.
    pub fn table(&self) -> &Tensor {
        &self.table
    }
}

/// Seeded unit directions scaled to `target_norm`, `[3, hidden]`.
pub fn seeded_markers(
    hidden_size: usize,
    target_norm: f32,
    seed: u64,
    device: &Device,
) -> VisionCotResult<Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = Vec::with_capacity(Marker::ALL.len() * hidden_size);
    for _ in Marker::ALL {
        let mut row: Vec<f32> = (0..hidden_size).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt().max(f32::EPSILON);
        row.iter_mut().for_each(|v| *v *= target_norm / norm);
        data.extend(row);
    }
    Tensor::from_vec(data, (Marker::ALL.len(), hidden_size), device).map_err(map_candle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::row_norms;
    use candle_core::DType;

    #[test]
    fn test_marker_ids_follow_vocab() {
        assert_eq!(Marker::Begin.token_id(257), 257);
        assert_eq!(Marker::End.token_id(257), 259);
        assert_eq!(Marker::SoftSlot.token_id(257), 258);
    }

    #[test]
    fn test_markers_have_target_norm() {
        let device = Device::Cpu;
        let map = VarMap::new();
        let vb = VarBuilder::from_varmap(&map, DType::F32, &device);
        let table = MarkerTable::new(16, 257, 3.0, 7, vb, &map, &device).unwrap();
        let norms: Vec<f32> = row_norms(table.table()).unwrap().to_vec1().unwrap();
        for n in norms {
            assert!((n - 3.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_markers_distinct_and_reproducible() {
        let a: Vec<Vec<f32>> = seeded_markers(8, 1.0, 1, &Device::Cpu).unwrap().to_vec2().unwrap();
        let b: Vec<Vec<f32>> = seeded_markers(8, 1.0, 1, &Device::Cpu).unwrap().to_vec2().unwrap();
        assert_eq!(a, b);
        assert_ne!(a[0], a[1]);
        assert_ne!(a[1], a[2]);
    }
}
