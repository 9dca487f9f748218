//! Student model: backbone, output head, markers and projection head, each
//! in its own parameter group.

use std::path::{Path, PathBuf};

use candle_core::{Device, Module, Tensor, Var};
use tracing::{info, warn};

use crate::config::{BackboneConfig, ModelConfig, VisionCotConfig};
use crate::error::{VisionCotError, VisionCotResult};
use crate::generator::SoftDecoder;
use crate::gpu::row_norms;
use crate::training::StageDescriptor;

use super::backbone::{AdapterSpec, OutputHead, TransformerBackbone};
use super::cache::KvCache;
use super::groups::{ParamGroup, ParamRegistry};
use super::markers::{Marker, MarkerTable};
use super::projection::ProjectionHead;

fn map_candle(e: candle_core::Error) -> VisionCotError {
    VisionCotError::TensorError {
        message: format!("Model forward failed: {}", e),
    }
}

fn build_error(e: candle_core::Error) -> VisionCotError {
    VisionCotError::ModelLoadError {
        message: format!("Failed to build model: {}", e),
    }
}

/// Pretrained backbone layout inside `model.backbone_dir`.
const BACKBONE_CONFIG_FILE: &str = "config.json";
const BACKBONE_WEIGHTS_FILE: &str = "model.safetensors";

/// The trainable student.
pub struct VisionCotModel {
    backbone: TransformerBackbone,
    output_head: OutputHead,
    markers: MarkerTable,
    projection: ProjectionHead,
    registry: ParamRegistry,
    stage: StageDescriptor,
    eos_token_id: Option<u32>,
    device: Device,
}

impl VisionCotModel {
    /// Build every parameter group and tag trainability from `stage`.
    ///
    /// With `model.backbone_dir` set, the backbone geometry and weights are
    /// loaded from it; a configured-but-missing directory is fatal.
    /// `eos_token_id` overrides the backbone config's EOS when given.
    ///
    /// # Errors
    /// - `VisionCotError::ModelLoadError` if the pretrained backbone cannot
    ///   be read
    /// - `VisionCotError::ConfigError` if the embedding dimensionality does
    ///   not match the backbone hidden size
    pub fn new(
        config: &VisionCotConfig,
        stage: StageDescriptor,
        eos_token_id: Option<u32>,
        device: &Device,
    ) -> VisionCotResult<Self> {
        let (backbone_config, weights) = resolve_backbone(&config.model)?;
        let hidden = backbone_config.hidden_size;
        if config.model.embedding_dim != hidden {
            return Err(VisionCotError::ConfigError {
                message: format!(
                    "model.embedding_dim {} must equal backbone hidden size {}",
                    config.model.embedding_dim, hidden
                ),
            });
        }

        let registry = ParamRegistry::new();

        let adapter = (config.model.lora_rank > 0).then(|| AdapterSpec {
            vb: registry.var_builder(ParamGroup::BackboneAdapter, device),
            rank: config.model.lora_rank,
            alpha: config.model.lora_alpha,
        });
        let backbone = TransformerBackbone::new(
            &backbone_config,
            registry.var_builder(ParamGroup::Backbone, device),
            adapter,
            device,
        )
        .map_err(build_error)?;
        let output_head = OutputHead::new(
            hidden,
            backbone_config.vocab_size,
            registry.var_builder(ParamGroup::OutputHead, device),
        )
        .map_err(build_error)?;

        if let Some(path) = &weights {
            load_pretrained(&registry, path, device)?;
        }

        let marker_norm = match config.model.marker_init_norm {
            Some(norm) => norm,
            None => mean_row_norm(backbone.token_embeddings())?,
        };
        let markers = MarkerTable::new(
            hidden,
            backbone_config.vocab_size,
            marker_norm,
            config.model.marker_seed,
            registry.var_builder(ParamGroup::MarkerEmbeddings, device),
            registry.varmap(ParamGroup::MarkerEmbeddings),
            device,
        )?;

        let projection = ProjectionHead::new(
            hidden,
            config.projection.hidden_width,
            config.model.embedding_dim,
            registry.var_builder(ParamGroup::ProjectionHead, device),
        )
        .map_err(build_error)?;

        let eos_token_id = eos_token_id.or(backbone_config.eos_token_id);

        for group in ParamGroup::ALL {
            info!(
                group = %group,
                params = registry.num_params(group),
                trainable = stage.is_trainable(group),
                "Parameter group"
            );
        }

        Ok(Self {
            backbone,
            output_head,
            markers,
            projection,
            registry,
            stage,
            eos_token_id,
            device: device.clone(),
        })
    }

    /// Parameter storage for every group.
    pub fn registry(&self) -> &ParamRegistry {
        &self.registry
    }

    /// Stage the model was built for.
    pub fn stage(&self) -> &StageDescriptor {
        &self.stage
    }

    /// Variables of every trainable group.
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.registry.trainable_vars(&self.stage)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn hidden_size(&self) -> usize {
        self.backbone.config().hidden_size
    }

    /// Vocabulary the output head predicts over (markers excluded).
    pub fn base_vocab_size(&self) -> usize {
        self.backbone.config().vocab_size
    }

    pub fn max_positions(&self) -> usize {
        self.backbone.config().max_position_embeddings
    }

    /// Embeddings of ids from the shared table: ordinary tokens below the
    /// base vocabulary, markers right after it.
    pub fn embed_ids(&self, ids: &[u32]) -> VisionCotResult<Tensor> {
        let base = self.base_vocab_size();
        if let Some(bad) = ids.iter().find(|&&id| id as usize >= base + Marker::ALL.len()) {
            return Err(VisionCotError::InvalidInput(format!(
                "Token id {} outside vocabulary of {} (+{} markers)",
                bad,
                base,
                Marker::ALL.len()
            )));
        }
        let index = Tensor::new(ids, &self.device).map_err(map_candle)?;
        if ids.iter().all(|&id| (id as usize) < base) {
            return self
                .backbone
                .token_embeddings()
                .index_select(&index, 0)
                .map_err(map_candle);
        }
        Tensor::cat(&[self.backbone.token_embeddings(), self.markers.table()], 0)
            .and_then(|table| table.index_select(&index, 0))
            .map_err(map_candle)
    }

    /// Final hidden states for `embeds` after the cached prefix.
    pub fn forward_hidden(&self, embeds: &Tensor, cache: &mut KvCache) -> VisionCotResult<Tensor> {
        self.backbone.forward_hidden(embeds, cache)
    }

    /// `[n, hidden] -> [n, embedding_dim]`.
    pub fn project(&self, hidden: &Tensor) -> VisionCotResult<Tensor> {
        self.projection.forward(hidden).map_err(map_candle)
    }

    /// `[n, hidden] -> [n, vocab]`.
    pub fn logits(&self, hidden: &Tensor) -> VisionCotResult<Tensor> {
        self.output_head.forward(hidden).map_err(map_candle)
    }
}

impl SoftDecoder for VisionCotModel {
    type Cache = KvCache;

    fn new_cache(&self) -> KvCache {
        self.backbone.new_cache()
    }

    fn embed_tokens(&self, ids: &[u32]) -> VisionCotResult<Tensor> {
        self.embed_ids(ids)
    }

    fn marker_embedding(&self, marker: Marker) -> VisionCotResult<Tensor> {
        self.markers.embedding(marker)
    }

    fn forward_last(&self, embeds: &Tensor, cache: &mut KvCache) -> VisionCotResult<Tensor> {
        let hidden = self.backbone.forward_hidden(embeds, cache)?;
        let n = hidden.dims()[0];
        hidden.narrow(0, n - 1, 1).map_err(map_candle)
    }

    fn project_embedding(&self, hidden: &Tensor) -> VisionCotResult<Tensor> {
        self.project(hidden)
    }

    fn project_vocab(&self, hidden: &Tensor) -> VisionCotResult<Tensor> {
        self.logits(hidden)?.squeeze(0).map_err(map_candle)
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }
}

fn mean_row_norm(table: &Tensor) -> VisionCotResult<f32> {
    let norm = row_norms(table)
        .and_then(|n| n.mean_all())
        .and_then(|m| m.to_scalar::<f32>())
        .map_err(map_candle)?;
    if norm.is_finite() && norm > 0.0 {
        Ok(norm)
    } else {
        warn!(norm, "Degenerate token embedding norm, markers use unit norm");
        Ok(1.0)
    }
}

fn resolve_backbone(model: &ModelConfig) -> VisionCotResult<(BackboneConfig, Option<PathBuf>)> {
    let Some(dir) = &model.backbone_dir else {
        return Ok((model.backbone.clone(), None));
    };

    let config_path = dir.join(BACKBONE_CONFIG_FILE);
    let weights_path = dir.join(BACKBONE_WEIGHTS_FILE);
    for path in [&config_path, &weights_path] {
        if !path.exists() {
            return Err(VisionCotError::ModelLoadError {
                message: format!("Pretrained backbone file not found: {}", path.display()),
            });
        }
    }

    let raw = std::fs::read_to_string(&config_path)?;
    let config: BackboneConfig =
        serde_json::from_str(&raw).map_err(|e| VisionCotError::ModelLoadError {
            message: format!("Invalid backbone config '{}': {}", config_path.display(), e),
        })?;
    config.validate().map_err(|e| VisionCotError::ModelLoadError {
        message: format!("Invalid backbone config '{}': {}", config_path.display(), e),
    })?;

    info!(
        dir = %dir.display(),
        hidden = config.hidden_size,
        layers = config.num_hidden_layers,
        vocab = config.vocab_size,
        "Using pretrained backbone"
    );
    Ok((config, Some(weights_path)))
}

fn load_pretrained(registry: &ParamRegistry, path: &Path, device: &Device) -> VisionCotResult<()> {
    let tensors = candle_core::safetensors::load(path, device).map_err(|e| {
        VisionCotError::ModelLoadError {
            message: format!("Failed to read backbone weights '{}': {}", path.display(), e),
        }
    })?;
    for group in [ParamGroup::Backbone, ParamGroup::OutputHead] {
        let n = registry
            .assign(group, &tensors)
            .map_err(|e| VisionCotError::ModelLoadError {
                message: format!("Backbone weights '{}': {}", path.display(), e),
            })?;
        info!(group = %group, tensors = n, "Loaded pretrained weights");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_config() -> VisionCotConfig {
        let mut config = VisionCotConfig::default();
        config.model.backbone.hidden_size = 16;
        config.model.backbone.intermediate_size = 32;
        config.model.backbone.num_hidden_layers = 1;
        config.model.embedding_dim = 16;
        config.projection.hidden_width = 24;
        config.model.lora_rank = 2;
        config
    }

    fn model(config: &VisionCotConfig) -> VisionCotModel {
        VisionCotModel::new(config, StageDescriptor::bootstrap(true), None, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_every_group_populated() {
        let m = model(&toy_config());
        for g in ParamGroup::ALL {
            assert!(m.registry().num_params(g) > 0, "{} empty", g);
        }
        assert_eq!(m.eos_token_id(), Some(256));
    }

    #[test]
    fn test_stage1_trainable_vars_exclude_backbone() {
        let m = model(&toy_config());
        let expected = m.registry().num_params(ParamGroup::ProjectionHead)
            + m.registry().num_params(ParamGroup::MarkerEmbeddings);
        let got: usize = m.trainable_vars().iter().map(|v| v.elem_count()).sum();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_marker_ids_embed_from_marker_table() {
        let m = model(&toy_config());
        let base = m.base_vocab_size();
        let via_ids: Vec<f32> = m
            .embed_ids(&[Marker::End.token_id(base)])
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let direct: Vec<f32> = m
            .marker_embedding(Marker::End)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(via_ids, direct);
        assert!(m.embed_ids(&[(base + 3) as u32]).is_err());
    }

    #[test]
    fn test_marker_norm_matches_token_norm() {
        let m = model(&toy_config());
        let token = mean_row_norm(m.backbone.token_embeddings()).unwrap();
        let markers: Vec<f32> = row_norms(m.markers.table()).unwrap().to_vec1().unwrap();
        for n in markers {
            assert!((n - token).abs() < 1e-3);
        }
    }

    #[test]
    fn test_missing_pretrained_dir_is_fatal() {
        let mut config = toy_config();
        config.model.backbone_dir = Some("/nonexistent/backbone".into());
        let result = VisionCotModel::new(&config, StageDescriptor::bootstrap(true), None, &Device::Cpu);
        assert!(matches!(result, Err(VisionCotError::ModelLoadError { .. })));
    }

    #[test]
    fn test_decoder_shapes() {
        let m = model(&toy_config());
        let mut cache = m.new_cache();
        let embeds = m.embed_ids(&[1, 2, 3]).unwrap();
        let h = m.forward_last(&embeds, &mut cache).unwrap();
        assert_eq!(h.dims(), &[1, 16]);
        assert_eq!(m.project_embedding(&h).unwrap().dims(), &[1, 16]);
        assert_eq!(m.project_vocab(&h).unwrap().dims(), &[m.base_vocab_size()]);
        assert_eq!(cache.len(), 3);
    }
}
