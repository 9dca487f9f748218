//! Named parameter groups and their variable storage.
//!
//! Each group owns a separate `VarMap`, so trainability, optimisation and
//! checkpointing all work per group. The teacher encoder is not a group.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use serde::Serialize;

use crate::config::StageId;
use crate::error::{VisionCotError, VisionCotResult};
use crate::training::StageDescriptor;

/// Partition of the student model's parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamGroup {
    /// Hidden state -> embedding projection.
    ProjectionHead,
    /// Begin / soft-slot / end marker rows of the embedding table.
    MarkerEmbeddings,
    /// Token/position embeddings, transformer layers, final norm.
    Backbone,
    /// Low-rank attention adapters.
    BackboneAdapter,
    /// Hidden state -> vocabulary logits.
    OutputHead,
}

impl ParamGroup {
    /// Every group, in declaration order.
    pub const ALL: [ParamGroup; 5] = [
        ParamGroup::ProjectionHead,
        ParamGroup::MarkerEmbeddings,
        ParamGroup::Backbone,
        ParamGroup::BackboneAdapter,
        ParamGroup::OutputHead,
    ];

    /// Stable name used as the tensor prefix in artifacts.
    pub fn name(self) -> &'static str {
        match self {
            ParamGroup::ProjectionHead => "projection",
            ParamGroup::MarkerEmbeddings => "markers",
            ParamGroup::Backbone => "backbone",
            ParamGroup::BackboneAdapter => "adapter",
            ParamGroup::OutputHead => "output_head",
        }
    }

    /// Artifact the group is persisted in.
    pub fn artifact_stage(self) -> StageId {
        match self {
            ParamGroup::ProjectionHead | ParamGroup::MarkerEmbeddings => StageId::Bootstrap,
            ParamGroup::Backbone | ParamGroup::BackboneAdapter | ParamGroup::OutputHead => {
                StageId::Integration
            }
        }
    }
}

impl fmt::Display for ParamGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One `VarMap` per [`ParamGroup`].
#[derive(Clone)]
pub struct ParamRegistry {
    maps: BTreeMap<ParamGroup, VarMap>,
}

impl Default for ParamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ParamRegistry {
    /// Empty storage for every group.
    pub fn new() -> Self {
        Self {
            maps: ParamGroup::ALL.into_iter().map(|g| (g, VarMap::new())).collect(),
        }
    }

    /// Storage for `group`.
    pub fn varmap(&self, group: ParamGroup) -> &VarMap {
        // every group is inserted in `new`
        &self.maps[&group]
    }

    /// Builder creating variables inside `group`.
    pub fn var_builder(&self, group: ParamGroup, device: &Device) -> VarBuilder<'static> {
        VarBuilder::from_varmap(self.varmap(group), DType::F32, device)
    }

    /// Variables of one group.
    pub fn vars(&self, group: ParamGroup) -> Vec<Var> {
        self.varmap(group).all_vars()
    }

    /// Scalar parameter count of one group.
    pub fn num_params(&self, group: ParamGroup) -> usize {
        self.vars(group).iter().map(|v| v.elem_count()).sum()
    }

    /// Variables of every group the stage tags trainable.
    pub fn trainable_vars(&self, stage: &StageDescriptor) -> Vec<Var> {
        ParamGroup::ALL
            .into_iter()
            .filter(|g| stage.is_trainable(*g))
            .flat_map(|g| self.vars(g))
            .collect()
    }

    /// Current values of one group, keyed by variable name.
    pub fn snapshot(&self, group: ParamGroup) -> VisionCotResult<HashMap<String, Tensor>> {
        snapshot_varmap(self.varmap(group), group.name())
    }

    /// Overwrite every variable of `group` from `tensors`.
    ///
    /// See [`assign_varmap`]. Returns the number of variables set.
    pub fn assign(
        &self,
        group: ParamGroup,
        tensors: &HashMap<String, Tensor>,
    ) -> VisionCotResult<usize> {
        assign_varmap(self.varmap(group), group.name(), tensors)
    }
}

/// Current values of `varmap`, keyed by variable name.
pub fn snapshot_varmap(varmap: &VarMap, label: &str) -> VisionCotResult<HashMap<String, Tensor>> {
    let data = varmap.data().lock().map_err(|_| poisoned(label))?;
    data.iter()
        .map(|(name, var)| {
            // `Var::set` writes in place, so the snapshot needs its own storage.
            let value = var.as_tensor().copy().map_err(|e| VisionCotError::TensorError {
                message: format!("{} snapshot of '{}' failed: {}", label, name, e),
            })?;
            Ok((name.clone(), value.detach()))
        })
        .collect()
}

/// Overwrite every variable of `varmap` from `tensors`.
///
/// Names and shapes are checked for the whole map before anything is
/// written, so a failed assignment leaves it untouched. Extra entries in
/// `tensors` are ignored.
pub fn assign_varmap(
    varmap: &VarMap,
    label: &str,
    tensors: &HashMap<String, Tensor>,
) -> VisionCotResult<usize> {
    let data = varmap.data().lock().map_err(|_| poisoned(label))?;

    let mut staged = Vec::with_capacity(data.len());
    for (name, var) in data.iter() {
        let src = tensors.get(name).ok_or_else(|| {
            VisionCotError::InvalidInput(format!("{} tensor '{}' missing", label, name))
        })?;
        if src.dims() != var.dims() {
            return Err(VisionCotError::InvalidInput(format!(
                "{} tensor '{}' has shape {:?}, expected {:?}",
                label,
                name,
                src.dims(),
                var.dims()
            )));
        }
        let src = src
            .to_dtype(var.dtype())
            .and_then(|t| t.to_device(var.device()))
            .map_err(|e| VisionCotError::TensorError {
                message: format!("{} tensor '{}' conversion failed: {}", label, name, e),
            })?;
        staged.push((var, src));
    }

    for (var, src) in &staged {
        var.set(src).map_err(|e| VisionCotError::TensorError {
            message: format!("{} assignment failed: {}", label, e),
        })?;
    }
    Ok(staged.len())
}

fn poisoned(label: &str) -> VisionCotError {
    VisionCotError::TensorError {
        message: format!("{} parameter storage lock poisoned", label),
    }
}
