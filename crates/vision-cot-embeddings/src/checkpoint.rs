//! Stage artifacts.
//!
//! | Artifact | Contents |
//! |----------|----------|
//! | Stage 1 | projection head, marker embeddings |
//! | Stage 2 | backbone, adapters, output head, uncertainty log-variances |
//!
//! Each artifact is one safetensors file. Tensor names are prefixed with
//! their group (`projection.fc1.weight`, `uncertainty.log_var_vision`).
//! Loading never fails: a missing or malformed file leaves the affected
//! groups at their current values and is reported as an [`ArtifactStatus`]
//! with a warning.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::StageId;
use crate::error::{VisionCotError, VisionCotResult};
use crate::models::{assign_varmap, snapshot_varmap, ParamGroup, ParamRegistry};
use crate::training::UncertaintyWeights;

/// Default file name of a stage artifact inside an output directory.
pub fn artifact_file_name(stage: StageId) -> &'static str {
    match stage {
        StageId::Bootstrap => "stage1.safetensors",
        StageId::Integration => "stage2.safetensors",
    }
}

const UNCERTAINTY_LABEL: &str = "uncertainty";

/// Outcome of loading one artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ArtifactStatus {
    /// No path configured; nothing attempted.
    NotConfigured,
    Loaded { path: PathBuf, tensors: usize },
    Missing { path: PathBuf },
    Malformed { path: PathBuf, message: String },
}

impl ArtifactStatus {
    pub fn is_loaded(&self) -> bool {
        matches!(self, ArtifactStatus::Loaded { .. })
    }
}

/// Variable maps persisted in one stage artifact, with their labels.
fn stage_targets<'a>(
    registry: &'a ParamRegistry,
    uncertainty: Option<&'a UncertaintyWeights>,
    stage: StageId,
) -> Vec<(&'static str, &'a VarMap)> {
    let mut targets: Vec<(&'static str, &'a VarMap)> = ParamGroup::ALL
        .into_iter()
        .filter(|g| g.artifact_stage() == stage)
        .map(|g| (g.name(), registry.varmap(g)))
        .collect();
    if stage == StageId::Integration {
        if let Some(u) = uncertainty {
            targets.push((UNCERTAINTY_LABEL, u.varmap()));
        }
    }
    targets
}

/// Prefixed tensors making up one stage artifact.
pub fn stage_tensors(
    registry: &ParamRegistry,
    uncertainty: Option<&UncertaintyWeights>,
    stage: StageId,
) -> VisionCotResult<HashMap<String, Tensor>> {
    let mut out = HashMap::new();
    for (label, varmap) in stage_targets(registry, uncertainty, stage) {
        for (name, tensor) in snapshot_varmap(varmap, label)? {
            out.insert(format!("{}.{}", label, name), tensor);
        }
    }
    Ok(out)
}

/// Write one stage artifact. The file is written next to `path` and
/// renamed into place.
///
/// Returns the number of tensors written.
pub fn save_stage(
    registry: &ParamRegistry,
    uncertainty: Option<&UncertaintyWeights>,
    stage: StageId,
    path: &Path,
) -> VisionCotResult<usize> {
    let tensors = stage_tensors(registry, uncertainty, stage)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let temp_path = path.with_extension("tmp");
    candle_core::safetensors::save(&tensors, &temp_path).map_err(|e| VisionCotError::TensorError {
        message: format!("Failed to write '{}': {}", temp_path.display(), e),
    })?;
    fs::rename(&temp_path, path)?;

    info!(
        stage = stage.number(),
        path = %path.display(),
        tensors = tensors.len(),
        "Saved stage artifact"
    );
    Ok(tensors.len())
}

/// Load one stage artifact, tolerating absence and corruption.
pub fn load_stage(
    registry: &ParamRegistry,
    uncertainty: Option<&UncertaintyWeights>,
    stage: StageId,
    path: &Path,
    device: &Device,
) -> ArtifactStatus {
    if !path.exists() {
        warn!(
            stage = stage.number(),
            path = %path.display(),
            "Stage artifact not found; keeping random initialisation"
        );
        return ArtifactStatus::Missing {
            path: path.to_path_buf(),
        };
    }

    match try_load(registry, uncertainty, stage, path, device) {
        Ok(tensors) => {
            info!(stage = stage.number(), path = %path.display(), tensors, "Loaded stage artifact");
            ArtifactStatus::Loaded {
                path: path.to_path_buf(),
                tensors,
            }
        }
        Err(e) => {
            warn!(
                stage = stage.number(),
                error = %e,
                "Stage artifact unusable; keeping random initialisation"
            );
            ArtifactStatus::Malformed {
                path: path.to_path_buf(),
                message: e.to_string(),
            }
        }
    }
}

/// All-or-nothing load: groups assigned before a failure are restored.
fn try_load(
    registry: &ParamRegistry,
    uncertainty: Option<&UncertaintyWeights>,
    stage: StageId,
    path: &Path,
    device: &Device,
) -> VisionCotResult<usize> {
    let load_error = |message: String| VisionCotError::ArtifactLoadError {
        path: path.to_path_buf(),
        message,
    };

    let tensors = candle_core::safetensors::load(path, device).map_err(|e| load_error(e.to_string()))?;

    let mut restored: Vec<(&str, &VarMap, HashMap<String, Tensor>)> = Vec::new();
    let mut total = 0;
    for (label, varmap) in stage_targets(registry, uncertainty, stage) {
        if varmap.all_vars().is_empty() {
            continue;
        }
        let prefix = format!("{}.", label);
        let group: HashMap<String, Tensor> = tensors
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|n| (n.to_string(), v.clone())))
            .collect();
        if group.is_empty() {
            warn!(group = label, "Artifact has no tensors for group; keeping current values");
            continue;
        }

        let backup = snapshot_varmap(varmap, label)?;
        match assign_varmap(varmap, label, &group) {
            Ok(n) => {
                total += n;
                restored.push((label, varmap, backup));
            }
            Err(e) => {
                for (l, vm, b) in &restored {
                    if let Err(re) = assign_varmap(vm, l, b) {
                        warn!(group = *l, error = %re, "Failed to restore group after bad artifact");
                    }
                }
                return Err(load_error(e.to_string()));
            }
        }
    }

    if total == 0 {
        return Err(load_error("no tensors matched any parameter group".to_string()));
    }
    Ok(total)
}
