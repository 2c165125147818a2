//! Trainable classification head placed on top of the frozen backbone

use burn::{
    config::Config,
    module::Module,
    nn::{
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, Relu,
    },
    tensor::{backend::Backend, Tensor},
};

#[derive(Config, Debug)]
pub struct ClassificationHeadConfig {
    /// Channels of the backbone feature map
    pub input_features: usize,
    pub num_classes: usize,
    #[config(default = "128")]
    pub hidden_units: usize,
    #[config(default = "0.5")]
    pub dropout: f64,
}

impl ClassificationHeadConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ClassificationHead<B> {
        ClassificationHead {
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc1: LinearConfig::new(self.input_features, self.hidden_units).init(device),
            relu: Relu::new(),
            dropout: DropoutConfig::new(self.dropout).init(),
            fc2: LinearConfig::new(self.hidden_units, self.num_classes).init(device),
        }
    }
}

/// Global average pooling → Dense(hidden, ReLU) → Dropout → Dense(classes)
#[derive(Module, Debug)]
pub struct ClassificationHead<B: Backend> {
    pub global_pool: AdaptiveAvgPool2d,
    pub fc1: Linear<B>,
    pub relu: Relu,
    pub dropout: Dropout,
    pub fc2: Linear<B>,
}

impl<B: Backend> ClassificationHead<B> {
    /// Map a [batch, channels, h, w] feature map to [batch, num_classes] logits
    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.global_pool.forward(features);
        let [batch_size, channels, _, _] = x.dims();
        let x = x.reshape([batch_size, channels]);

        let x = self.relu.forward(self.fc1.forward(x));
        let x = self.dropout.forward(x);
        self.fc2.forward(x)
    }

    pub fn num_classes(&self) -> usize {
        self.fc2.weight.dims()[1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_head_output_shape() {
        let device = Default::default();
        let head = ClassificationHeadConfig::new(64, 3).init::<TestBackend>(&device);

        let features = Tensor::<TestBackend, 4>::ones([5, 64, 2, 3], &device);
        let logits = head.forward(features);

        assert_eq!(logits.dims(), [5, 3]);
        assert_eq!(head.num_classes(), 3);
    }

    #[test]
    fn test_single_sample_batch() {
        let device = Default::default();
        let head = ClassificationHeadConfig::new(16, 4)
            .with_hidden_units(8)
            .init::<TestBackend>(&device);

        let logits = head.forward(Tensor::<TestBackend, 4>::ones([1, 16, 1, 1], &device));
        assert_eq!(logits.dims(), [1, 4]);
    }

    #[test]
    fn test_defaults() {
        let config = ClassificationHeadConfig::new(1280, 5);
        assert_eq!(config.hidden_units, 128);
        assert_eq!(config.dropout, 0.5);
    }
}
