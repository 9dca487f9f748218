//! Training orchestrator: stage descriptor and parameter-group trainability.
//!
//! A [`StageDescriptor`] is resolved once from configuration and handed to
//! model construction. It is immutable afterwards; nothing re-reads the
//! stage flags per step.
//!
//! | Stage | Projection | Markers | Backbone | Adapter | Output head | Losses |
//! |-------|-----------|---------|----------|---------|-------------|--------|
//! | 1 | trainable | `train_markers` | frozen | frozen | frozen | vision |
//! | 2 full | `!freeze_projection` | frozen | trainable | frozen | trainable | answer (+ vision) |
//! | 2 adapter | `!freeze_projection` | frozen | frozen | trainable | frozen | answer (+ vision) |
//! | 2 head-only | `!freeze_projection` | frozen | frozen | frozen | trainable | answer (+ vision) |

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::config::{StageId, TrainingConfig};
use crate::error::{VisionCotError, VisionCotResult};
use crate::models::ParamGroup;

/// Stage 2 trainable-backbone strategy. Exactly one is active in Stage 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackboneStrategy {
    /// Every backbone weight plus the output head.
    Full,
    /// Low-rank adapters on attention; backbone otherwise frozen.
    LowRankAdapter,
    /// Output head only; backbone frozen.
    HeadOnly,
}

impl fmt::Display for BackboneStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackboneStrategy::Full => "full",
            BackboneStrategy::LowRankAdapter => "adapter",
            BackboneStrategy::HeadOnly => "head_only",
        };
        write!(f, "{}", name)
    }
}

/// Loss terms computed in a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ActiveLosses {
    pub vision: bool,
    pub answer: bool,
}

/// Immutable description of the active training stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageDescriptor {
    stage: StageId,
    strategy: Option<BackboneStrategy>,
    trainable: BTreeMap<ParamGroup, bool>,
    losses: ActiveLosses,
}

impl StageDescriptor {
    /// Resolve stage flags into a descriptor.
    ///
    /// # Errors
    /// - `VisionCotError::ConfigError` if Stage 2 selects zero or several
    ///   backbone strategies, or the adapter strategy with `lora_rank == 0`
    pub fn from_config(config: &TrainingConfig, lora_rank: usize) -> VisionCotResult<Self> {
        match config.stage {
            StageId::Bootstrap => Ok(Self::bootstrap(config.train_markers)),
            StageId::Integration => {
                let selected: Vec<BackboneStrategy> = [
                    (config.full_backbone, BackboneStrategy::Full),
                    (config.adapter, BackboneStrategy::LowRankAdapter),
                    (config.head_only, BackboneStrategy::HeadOnly),
                ]
                .into_iter()
                .filter_map(|(on, s)| on.then_some(s))
                .collect();

                let strategy = match selected.as_slice() {
                    [one] => *one,
                    [] => {
                        return Err(VisionCotError::ConfigError {
                            message: "Stage 2 requires one backbone strategy \
                                      (full_backbone, adapter or head_only); none selected"
                                .to_string(),
                        })
                    }
                    many => {
                        let names: Vec<String> = many.iter().map(|s| s.to_string()).collect();
                        return Err(VisionCotError::ConfigError {
                            message: format!(
                                "Stage 2 backbone strategies are mutually exclusive, got: {}",
                                names.join(", ")
                            ),
                        });
                    }
                };

                if strategy == BackboneStrategy::LowRankAdapter && lora_rank == 0 {
                    return Err(VisionCotError::ConfigError {
                        message: "adapter strategy requires model.lora_rank > 0".to_string(),
                    });
                }

                Ok(Self::integration(
                    strategy,
                    !config.freeze_projection,
                    config.stage2_vision_loss,
                ))
            }
        }
    }

    /// Stage 1 descriptor.
    pub fn bootstrap(train_markers: bool) -> Self {
        let trainable = ParamGroup::ALL
            .into_iter()
            .map(|g| {
                let on = match g {
                    ParamGroup::ProjectionHead => true,
                    ParamGroup::MarkerEmbeddings => train_markers,
                    ParamGroup::Backbone | ParamGroup::BackboneAdapter | ParamGroup::OutputHead => {
                        false
                    }
                };
                (g, on)
            })
            .collect();
        Self {
            stage: StageId::Bootstrap,
            strategy: None,
            trainable,
            losses: ActiveLosses {
                vision: true,
                answer: false,
            },
        }
    }

    /// Stage 2 descriptor for one strategy.
    pub fn integration(strategy: BackboneStrategy, train_projection: bool, vision_loss: bool) -> Self {
        let trainable = ParamGroup::ALL
            .into_iter()
            .map(|g| {
                let on = match g {
                    ParamGroup::ProjectionHead => train_projection,
                    ParamGroup::MarkerEmbeddings => false,
                    ParamGroup::Backbone => strategy == BackboneStrategy::Full,
                    ParamGroup::BackboneAdapter => strategy == BackboneStrategy::LowRankAdapter,
                    ParamGroup::OutputHead => matches!(
                        strategy,
                        BackboneStrategy::Full | BackboneStrategy::HeadOnly
                    ),
                };
                (g, on)
            })
            .collect();
        Self {
            stage: StageId::Integration,
            strategy: Some(strategy),
            trainable,
            losses: ActiveLosses {
                vision: vision_loss,
                answer: true,
            },
        }
    }

    /// Active stage.
    pub fn stage(&self) -> StageId {
        self.stage
    }

    /// Stage 2 strategy, `None` in Stage 1.
    pub fn strategy(&self) -> Option<BackboneStrategy> {
        self.strategy
    }

    /// Whether `group` receives gradient updates.
    pub fn is_trainable(&self, group: ParamGroup) -> bool {
        self.trainable.get(&group).copied().unwrap_or(false)
    }

    /// Full group -> trainable mapping.
    pub fn trainability(&self) -> &BTreeMap<ParamGroup, bool> {
        &self.trainable
    }

    /// Loss terms computed in this stage.
    pub fn losses(&self) -> ActiveLosses {
        self.losses
    }

    /// Groups tagged trainable, in declaration order.
    pub fn trainable_groups(&self) -> Vec<ParamGroup> {
        self.trainable
            .iter()
            .filter_map(|(g, on)| on.then_some(*g))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage2(full: bool, adapter: bool, head_only: bool) -> TrainingConfig {
        TrainingConfig {
            stage: StageId::Integration,
            full_backbone: full,
            adapter,
            head_only,
            ..Default::default()
        }
    }

    #[test]
    fn test_stage1_trains_projection_only() {
        let d = StageDescriptor::from_config(&TrainingConfig::default(), 8).unwrap();
        assert_eq!(
            d.trainable_groups(),
            vec![ParamGroup::ProjectionHead, ParamGroup::MarkerEmbeddings]
        );
        assert!(d.losses().vision);
        assert!(!d.losses().answer);
        assert!(d.strategy().is_none());
    }

    #[test]
    fn test_stage1_frozen_markers() {
        let config = TrainingConfig {
            train_markers: false,
            ..Default::default()
        };
        let d = StageDescriptor::from_config(&config, 8).unwrap();
        assert_eq!(d.trainable_groups(), vec![ParamGroup::ProjectionHead]);
    }

    #[test]
    fn test_stage2_adapter() {
        let d = StageDescriptor::from_config(&stage2(false, true, false), 8).unwrap();
        assert_eq!(d.trainable_groups(), vec![ParamGroup::BackboneAdapter]);
        assert!(d.losses().answer);
    }

    #[test]
    fn test_stage2_full_includes_head() {
        let d = StageDescriptor::from_config(&stage2(true, false, false), 8).unwrap();
        assert!(d.is_trainable(ParamGroup::Backbone));
        assert!(d.is_trainable(ParamGroup::OutputHead));
        assert!(!d.is_trainable(ParamGroup::BackboneAdapter));
    }

    #[test]
    fn test_stage2_unfrozen_projection() {
        let mut config = stage2(false, false, true);
        config.freeze_projection = false;
        let d = StageDescriptor::from_config(&config, 8).unwrap();
        assert_eq!(
            d.trainable_groups(),
            vec![ParamGroup::ProjectionHead, ParamGroup::OutputHead]
        );
    }

    #[test]
    fn test_stage2_none_selected_fails() {
        let err = StageDescriptor::from_config(&stage2(false, false, false), 8).unwrap_err();
        assert!(err.to_string().contains("none selected"));
    }

    #[test]
    fn test_stage2_adapter_needs_rank() {
        assert!(StageDescriptor::from_config(&stage2(false, true, false), 0).is_err());
    }

    #[test]
    fn test_every_group_tagged() {
        for d in [
            StageDescriptor::bootstrap(true),
            StageDescriptor::integration(BackboneStrategy::Full, true, true),
        ] {
            assert_eq!(d.trainability().len(), ParamGroup::ALL.len());
        }
    }
}
