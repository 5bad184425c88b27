use burn::nn::{BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;

#[derive(Config, Debug)]
pub struct ClassifierConfig {
    pub input_width: usize,
    pub num_classes: usize,
    #[config(default = 64)]
    pub hidden_width: usize,
    #[config(default = 0.3)]
    pub dropout: f64,
}

/// Pooled head over the projected feature map.
///
/// GAP, BN, ReLU, dropout, dense hidden layer, BN, ReLU, dropout, logits.
#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    input_norm: BatchNorm<B>,
    hidden: Linear<B>,
    hidden_norm: BatchNorm<B>,
    output: Linear<B>,
    dropout: Dropout,
}

impl ClassifierConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ClassifierHead<B> {
        ClassifierHead {
            input_norm: BatchNormConfig::new(self.input_width).init(device),
            hidden: LinearConfig::new(self.input_width, self.hidden_width).init(device),
            hidden_norm: BatchNormConfig::new(self.hidden_width).init(device),
            output: LinearConfig::new(self.hidden_width, self.num_classes).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
        }
    }
}

impl<B: Backend> ClassifierHead<B> {
    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch, channels, _, _] = features.dims();
        let pooled = features.mean_dim(3).mean_dim(2);
        let x = relu(self.input_norm.forward(pooled)).reshape([batch, channels]);
        let x = self.hidden.forward(self.dropout.forward(x));

        let hidden_width = x.dims()[1];
        let x = self
            .hidden_norm
            .forward(x.reshape([batch, hidden_width, 1, 1]));
        let x = relu(x).reshape([batch, hidden_width]);
        self.output.forward(self.dropout.forward(x))
    }
}
