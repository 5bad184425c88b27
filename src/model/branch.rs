use crate::config::Architecture;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::relu;

/// One downsampling stage of a feature branch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockSpec {
    pub out_channels: usize,
    pub convs: usize,
    pub kernel: usize,
    /// Depthwise-separable convolutions with a pooled 1x1 shortcut.
    pub separable: bool,
}

impl BlockSpec {
    const fn plain(out_channels: usize, convs: usize, kernel: usize) -> Self {
        Self {
            out_channels,
            convs,
            kernel,
            separable: false,
        }
    }

    const fn separable(out_channels: usize) -> Self {
        Self {
            out_channels,
            convs: 2,
            kernel: 3,
            separable: true,
        }
    }
}

/// Stage layout for each backbone family.
pub fn block_specs(architecture: Architecture) -> Vec<BlockSpec> {
    match architecture {
        Architecture::AlexNet => vec![
            BlockSpec::plain(32, 1, 5),
            BlockSpec::plain(64, 1, 3),
            BlockSpec::plain(96, 2, 3),
        ],
        Architecture::Vgg16 => vec![
            BlockSpec::plain(32, 2, 3),
            BlockSpec::plain(64, 2, 3),
            BlockSpec::plain(128, 3, 3),
        ],
        Architecture::Xception => vec![
            BlockSpec::plain(32, 1, 3),
            BlockSpec::separable(64),
            BlockSpec::separable(128),
        ],
    }
}

#[derive(Config, Debug)]
pub struct BranchConfig {
    pub architecture: Architecture,
    #[config(default = 3)]
    pub input_channels: usize,
    #[config(default = 256)]
    pub feature_width: usize,
}

impl BranchConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> FeatureBranch<B> {
        let mut blocks = Vec::new();
        let mut channels = self.input_channels;
        for block in block_specs(self.architecture) {
            blocks.push(ConvBlock::new(channels, block, device));
            channels = block.out_channels;
        }

        FeatureBranch {
            blocks,
            head: Conv2dConfig::new([channels, self.feature_width], [1, 1]).init(device),
            head_norm: BatchNormConfig::new(self.feature_width).init(device),
        }
    }

    /// Spatial side of the branch output for a square input, `None` if the
    /// input is too small to survive every pooling stage.
    pub fn output_size(&self, image_size: usize) -> Option<usize> {
        let mut size = image_size;
        for _ in block_specs(self.architecture) {
            size /= 2;
            if size == 0 {
                return None;
            }
        }
        Some(size)
    }
}

#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    convs: Vec<Conv2d<B>>,
    norms: Vec<BatchNorm<B>>,
    shortcut: Option<Conv2d<B>>,
    pool: MaxPool2d,
}

impl<B: Backend> ConvBlock<B> {
    fn new(in_channels: usize, block: BlockSpec, device: &B::Device) -> Self {
        let mut convs = Vec::new();
        let mut norms = Vec::new();
        let mut channels = in_channels;

        for _ in 0..block.convs {
            if block.separable {
                convs.push(
                    same_conv(channels, channels, block.kernel).with_groups(channels),
                );
                convs.push(Conv2dConfig::new([channels, block.out_channels], [1, 1]));
            } else {
                convs.push(same_conv(channels, block.out_channels, block.kernel));
            }
            norms.push(BatchNormConfig::new(block.out_channels).init(device));
            channels = block.out_channels;
        }

        let shortcut = block.separable.then(|| {
            Conv2dConfig::new([in_channels, block.out_channels], [1, 1]).init(device)
        });

        Self {
            convs: convs.into_iter().map(|c| c.init(device)).collect(),
            norms,
            shortcut,
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = input.clone();
        match &self.shortcut {
            Some(shortcut) => {
                for (pair, norm) in self.convs.chunks(2).zip(&self.norms) {
                    x = relu(x);
                    for conv in pair {
                        x = conv.forward(x);
                    }
                    x = norm.forward(x);
                }
                self.pool.forward(x) + shortcut.forward(self.pool.forward(input))
            }
            None => {
                for (conv, norm) in self.convs.iter().zip(&self.norms) {
                    x = relu(norm.forward(conv.forward(x)));
                }
                self.pool.forward(x)
            }
        }
    }
}

/// Convolutional feature extractor for one domain's stream.
#[derive(Module, Debug)]
pub struct FeatureBranch<B: Backend> {
    blocks: Vec<ConvBlock<B>>,
    head: Conv2d<B>,
    head_norm: BatchNorm<B>,
}

impl<B: Backend> FeatureBranch<B> {
    /// `[batch, C, H, W] -> [batch, feature_width, h, w]`
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = images;
        for block in &self.blocks {
            x = block.forward(x);
        }
        relu(self.head_norm.forward(self.head.forward(x)))
    }
}

/// One row per spatial position: `[batch, D, h, w] -> [batch * h * w, D]`.
pub fn flatten_features<B: Backend>(feature_map: Tensor<B, 4>) -> Tensor<B, 2> {
    let [batch, channels, height, width] = feature_map.dims();
    feature_map
        .permute([0, 2, 3, 1])
        .reshape([batch * height * width, channels])
}

fn same_conv(in_channels: usize, out_channels: usize, kernel: usize) -> Conv2dConfig {
    Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
        .with_padding(PaddingConfig2d::Same)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn every_architecture_ends_at_the_feature_width() {
        let device = Default::default();
        for architecture in [Architecture::AlexNet, Architecture::Vgg16, Architecture::Xception] {
            let config = BranchConfig::new(architecture).with_feature_width(16);
            let branch = config.init::<TestBackend>(&device);
            let images = Tensor::<TestBackend, 4>::zeros([2, 3, 16, 16], &device);
            let map = branch.forward(images);
            assert_eq!(map.dims(), [2, 16, 2, 2], "{architecture}");
            assert_eq!(config.output_size(16), Some(2));
            assert_eq!(flatten_features(map).dims(), [2 * 2 * 2, 16]);
        }
    }

    #[test]
    fn tiny_inputs_do_not_survive_pooling() {
        let config = BranchConfig::new(Architecture::Vgg16);
        assert_eq!(config.output_size(4), None);
        assert_eq!(config.output_size(8), Some(1));
    }

    #[test]
    fn flatten_keeps_every_position_as_a_row() {
        let device = Default::default();
        let map = Tensor::<TestBackend, 4>::from_floats(
            [[[[1.0, 3.0], [5.0, 7.0]], [[0.0, 0.0], [0.0, 2.0]]]],
            &device,
        );
        let flat = flatten_features(map);
        assert_eq!(flat.dims(), [4, 2]);
        let rows = flat.to_data().to_vec::<f32>().unwrap();
        assert_eq!(rows, vec![1.0, 0.0, 3.0, 0.0, 5.0, 0.0, 7.0, 2.0]);
    }

    #[test]
    fn flatten_orders_rows_by_sample_then_position() {
        let device = Default::default();
        let map = Tensor::<TestBackend, 4>::from_floats(
            [[[[1.0, 2.0]], [[10.0, 20.0]]], [[[3.0, 4.0]], [[30.0, 40.0]]]],
            &device,
        );
        let rows = flatten_features(map).to_data().to_vec::<f32>().unwrap();
        assert_eq!(rows, vec![1.0, 10.0, 2.0, 20.0, 3.0, 30.0, 4.0, 40.0]);
    }
}
