//! MobileNetV2 feature extractor (no classification top)
//!
//! Layout follows the published architecture: a strided 3x3 stem, seventeen
//! inverted residual blocks and a final 1x1 convolution. Every convolution
//! except the linear projection inside a block is followed by BatchNorm and
//! ReLU6. Channel counts are scaled by the width multiplier and rounded to a
//! multiple of 8.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d,
    },
    tensor::{backend::Backend, Tensor},
};

use crate::dataset::ImageSize;
use crate::utils::error::{self, TrainerError};

/// Width multipliers for which the reference ImageNet weights exist
pub const SUPPORTED_WIDTH_MULTIPLIERS: [f64; 6] = [0.35, 0.5, 0.75, 1.0, 1.3, 1.4];

/// Smallest spatial input the five stride-2 stages can reduce
pub const MIN_INPUT_SIZE: u32 = 32;

/// Expansion factor, output channels, repeats, first stride
const INVERTED_RESIDUAL_SETTINGS: [(usize, usize, usize, usize); 7] = [
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

const STEM_CHANNELS: usize = 32;
const LAST_CHANNELS: usize = 1280;

/// Round `value` to the nearest multiple of `divisor`, never dropping more
/// than 10% below the unrounded value.
pub fn make_divisible(value: f64, divisor: usize) -> usize {
    let d = divisor as f64;
    let mut rounded = (((value + d / 2.0) / d).floor() * d).max(d) as usize;
    if (rounded as f64) < 0.9 * value {
        rounded += divisor;
    }
    rounded
}

#[derive(Config, Debug)]
pub struct MobileNetV2Config {
    /// Scales the number of channels in every layer
    #[config(default = "1.0")]
    pub width_multiplier: f64,
}

impl MobileNetV2Config {
    /// Check the multiplier and an input resolution against what the network accepts
    pub fn validate_input(&self, input: ImageSize) -> error::Result<()> {
        if !SUPPORTED_WIDTH_MULTIPLIERS
            .iter()
            .any(|m| (m - self.width_multiplier).abs() < 1e-9)
        {
            return Err(TrainerError::IncompatibleShape(format!(
                "width multiplier {} is not one of {:?}",
                self.width_multiplier, SUPPORTED_WIDTH_MULTIPLIERS
            )));
        }
        if input.height < MIN_INPUT_SIZE || input.width < MIN_INPUT_SIZE {
            return Err(TrainerError::IncompatibleShape(format!(
                "input resolution {} is below the minimum of {}x{}",
                input, MIN_INPUT_SIZE, MIN_INPUT_SIZE
            )));
        }
        Ok(())
    }

    /// Channels of the feature map the backbone produces
    pub fn output_channels(&self) -> usize {
        if self.width_multiplier > 1.0 {
            make_divisible(LAST_CHANNELS as f64 * self.width_multiplier, 8)
        } else {
            LAST_CHANNELS
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> MobileNetV2<B> {
        let alpha = self.width_multiplier;
        let stem_channels = make_divisible(STEM_CHANNELS as f64 * alpha, 8);
        let stem = ConvBnRelu6::new(3, stem_channels, 3, 2, 1, device);

        let mut blocks = Vec::new();
        let mut in_channels = stem_channels;
        for (expansion, channels, repeats, stride) in INVERTED_RESIDUAL_SETTINGS {
            let out_channels = make_divisible(channels as f64 * alpha, 8);
            for i in 0..repeats {
                let stride = if i == 0 { stride } else { 1 };
                blocks.push(InvertedResidual::new(
                    in_channels,
                    out_channels,
                    stride,
                    expansion,
                    device,
                ));
                in_channels = out_channels;
            }
        }

        let head = ConvBnRelu6::new(in_channels, self.output_channels(), 1, 1, 1, device);

        MobileNetV2 {
            stem,
            blocks,
            head,
            out_channels: self.output_channels(),
        }
    }
}

/// Convolution followed by BatchNorm and ReLU6
#[derive(Module, Debug)]
pub struct ConvBnRelu6<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B>,
}

impl<B: Backend> ConvBnRelu6<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        groups: usize,
        device: &B::Device,
    ) -> Self {
        let padding = (kernel_size - 1) / 2;
        let conv = Conv2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_groups(groups)
            .with_bias(false)
            .init(device);

        Self {
            conv,
            bn: BatchNormConfig::new(out_channels).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        self.bn.forward(x).clamp(0.0, 6.0)
    }
}

/// Expand (1x1) → depthwise (3x3) → linear projection (1x1), with an
/// identity shortcut when shape is preserved.
#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    pub expand: Option<ConvBnRelu6<B>>,
    pub depthwise: ConvBnRelu6<B>,
    pub project: Conv2d<B>,
    pub project_bn: BatchNorm<B>,
    use_residual: bool,
}

impl<B: Backend> InvertedResidual<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        expansion: usize,
        device: &B::Device,
    ) -> Self {
        let hidden = in_channels * expansion;
        let expand =
            (expansion != 1).then(|| ConvBnRelu6::new(in_channels, hidden, 1, 1, 1, device));
        let depthwise = ConvBnRelu6::new(hidden, hidden, 3, stride, hidden, device);
        let project = Conv2dConfig::new([hidden, out_channels], [1, 1])
            .with_bias(false)
            .init(device);

        Self {
            expand,
            depthwise,
            project,
            project_bn: BatchNormConfig::new(out_channels).init(device),
            use_residual: stride == 1 && in_channels == out_channels,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = match &self.expand {
            Some(expand) => expand.forward(input.clone()),
            None => input.clone(),
        };
        let x = self.depthwise.forward(x);
        let x = self.project_bn.forward(self.project.forward(x));

        if self.use_residual {
            x + input
        } else {
            x
        }
    }
}

/// MobileNetV2 backbone producing a [batch, channels, h/32, w/32] feature map
#[derive(Module, Debug)]
pub struct MobileNetV2<B: Backend> {
    pub stem: ConvBnRelu6<B>,
    pub blocks: Vec<InvertedResidual<B>>,
    pub head: ConvBnRelu6<B>,
    out_channels: usize,
}

impl<B: Backend> MobileNetV2<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = self.stem.forward(x);
        for block in &self.blocks {
            x = block.forward(x);
        }
        self.head.forward(x)
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }
}
