pub mod branch;
pub mod classifier;
pub mod coral;

use crate::config::Architecture;
use crate::error::Error;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::prelude::*;

pub use branch::{flatten_features, BranchConfig, FeatureBranch};
pub use classifier::{ClassifierConfig, ClassifierHead};
pub use coral::{coral_loss, CoralLoss};

/// Hyperparameters for the dual-branch network.
#[derive(Config, Debug)]
pub struct ModelConfig {
    pub num_classes: usize,
    pub architecture: Architecture,
    /// Width of each branch output and of the projected map.
    #[config(default = 256)]
    pub feature_width: usize,
    #[config(default = 3)]
    pub input_channels: usize,
    #[config(default = 64)]
    pub hidden_width: usize,
    #[config(default = 0.3)]
    pub dropout: f64,
}

impl ModelConfig {
    pub fn branch_config(&self) -> BranchConfig {
        BranchConfig::new(self.architecture)
            .with_input_channels(self.input_channels)
            .with_feature_width(self.feature_width)
    }

    pub fn classifier_config(&self) -> ClassifierConfig {
        ClassifierConfig::new(self.feature_width, self.num_classes)
            .with_hidden_width(self.hidden_width)
            .with_dropout(self.dropout)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> MergedNetwork<B> {
        let branch = self.branch_config();
        MergedNetwork {
            source: branch.init(device),
            target: branch.init(device),
            projection: Conv2dConfig::new([2 * self.feature_width, self.feature_width], [1, 1])
                .init(device),
            classifier: self.classifier_config().init(device),
        }
    }
}

/// Logits plus the raw per-branch maps fed to the alignment loss.
#[derive(Debug)]
pub struct MergedOutput<B: Backend> {
    pub logits: Tensor<B, 2>,
    pub source_map: Tensor<B, 4>,
    pub target_map: Tensor<B, 4>,
}

impl<B: Backend> MergedOutput<B> {
    /// Source branch activations as `[batch * h * w, feature_width]` rows.
    pub fn source_features(&self) -> Tensor<B, 2> {
        flatten_features(self.source_map.clone())
    }

    pub fn target_features(&self) -> Tensor<B, 2> {
        flatten_features(self.target_map.clone())
    }
}

/// Source and target branches joined by a 1x1 projection and a shared head.
#[derive(Module, Debug)]
pub struct MergedNetwork<B: Backend> {
    source: FeatureBranch<B>,
    target: FeatureBranch<B>,
    projection: Conv2d<B>,
    classifier: ClassifierHead<B>,
}

impl<B: Backend> MergedNetwork<B> {
    pub fn forward(&self, source: Tensor<B, 4>, target: Tensor<B, 4>) -> MergedOutput<B> {
        let source_map = self.source.forward(source);
        let target_map = self.target.forward(target);

        let merged = Tensor::cat(vec![source_map.clone(), target_map.clone()], 1);
        let projected = self.projection.forward(merged);

        MergedOutput {
            logits: self.classifier.forward(projected),
            source_map,
            target_map,
        }
    }

    /// Run both branches once and confirm they flatten to `feature_width` columns.
    ///
    /// Run it on an inference module: on an autodiff backend the zero batch
    /// would update every batch-norm running statistic.
    pub fn check_feature_widths(
        &self,
        config: &ModelConfig,
        image_size: usize,
        device: &B::Device,
    ) -> crate::error::Result<()> {
        if config.branch_config().output_size(image_size).is_none() {
            return Err(Error::Configuration(format!(
                "resize {image_size} is too small for the {} branches",
                config.architecture
            )));
        }

        let shape = [2, config.input_channels, image_size, image_size];
        let zeros = Tensor::<B, 4>::zeros(shape, device);
        let source_width = flatten_features(self.source.forward(zeros.clone())).dims()[1];
        let target_width = flatten_features(self.target.forward(zeros)).dims()[1];
        if source_width != config.feature_width || target_width != config.feature_width {
            return Err(Error::ShapeMismatch {
                source_width,
                target_width,
                expected: config.feature_width,
            });
        }
        Ok(())
    }
}
