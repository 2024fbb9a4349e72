use burn::{
    module::Ignored,
    nn::{
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        Initializer, Linear, LinearConfig, PaddingConfig2d,
    },
    prelude::*,
    tensor::{activation, backend::Backend},
};

use crate::hparams::Activation;

impl Activation {
    pub fn forward<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Activation::Relu => activation::relu(x),
            Activation::Elu => elu(x),
            Activation::Tanh => activation::tanh(x),
            Activation::Linear => x,
        }
    }
}

/// `x` for positive inputs, `exp(x) - 1` otherwise.
pub fn elu<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    let negative = x.clone().clamp_max(0.0).exp().sub_scalar(1.0);
    x.clamp_min(0.0) + negative
}

/// Glorot uniform with explicit fans. burn's transposed convolution hands its
/// initializer no fan-out, so `XavierUniform` cannot be used there.
fn glorot(fan_in: usize, fan_out: usize) -> Initializer {
    let bound = (6.0 / (fan_in + fan_out) as f64).sqrt();
    Initializer::Uniform {
        min: -bound,
        max: bound,
    }
}

/// `weight_decay * sum(w^2)`, or `None` when the penalty is disabled.
fn l2_of<B: Backend, const D: usize>(weight: Tensor<B, D>, weight_decay: f32) -> Option<Tensor<B, 1>> {
    (weight_decay > 0.0).then(|| weight.powf_scalar(2.0).sum().mul_scalar(weight_decay))
}

/// Strided convolution with "same" padding.
#[derive(Module, Debug)]
pub struct EncoderBlock<B: Backend> {
    pub conv: Conv2d<B>,
    activation: Ignored<Activation>,
    weight_decay: f32,
}

impl<B: Backend> EncoderBlock<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        activation: Activation,
        weight_decay: f64,
        device: &B::Device,
    ) -> Self {
        let pad = (kernel_size - 1) / 2;
        let receptive = kernel_size * kernel_size;
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(pad, pad))
                .with_initializer(glorot(receptive * in_channels, receptive * out_channels))
                .init(device),
            activation: Ignored(activation),
            weight_decay: weight_decay as f32,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.activation.forward(self.conv.forward(x))
    }

    pub fn l2_penalty(&self) -> Option<Tensor<B, 1>> {
        l2_of(self.conv.weight.val(), self.weight_decay)
    }
}

/// Transposed convolution that multiplies each spatial extent by its stride.
#[derive(Module, Debug)]
pub struct DecoderBlock<B: Backend> {
    pub conv: ConvTranspose2d<B>,
    activation: Ignored<Activation>,
    weight_decay: f32,
}

impl<B: Backend> DecoderBlock<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        activation: Activation,
        weight_decay: f64,
        device: &B::Device,
    ) -> Self {
        let pad = (kernel_size - 1) / 2;
        let receptive = kernel_size * kernel_size;
        Self {
            conv: ConvTranspose2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
                .with_stride([stride, stride])
                .with_padding([pad, pad])
                .with_padding_out([stride - 1, stride - 1])
                .with_initializer(glorot(receptive * in_channels, receptive * out_channels))
                .init(device),
            activation: Ignored(activation),
            weight_decay: weight_decay as f32,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.activation.forward(self.conv.forward(x))
    }

    pub fn l2_penalty(&self) -> Option<Tensor<B, 1>> {
        l2_of(self.conv.weight.val(), self.weight_decay)
    }
}

#[derive(Module, Debug)]
pub struct DenseBlock<B: Backend> {
    pub linear: Linear<B>,
    activation: Ignored<Activation>,
    weight_decay: f32,
}

impl<B: Backend> DenseBlock<B> {
    pub fn new(
        in_features: usize,
        out_features: usize,
        activation: Activation,
        weight_decay: f64,
        device: &B::Device,
    ) -> Self {
        Self {
            linear: LinearConfig::new(in_features, out_features)
                .with_initializer(glorot(in_features, out_features))
                .init(device),
            activation: Ignored(activation),
            weight_decay: weight_decay as f32,
        }
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.activation.forward(self.linear.forward(x))
    }

    pub fn l2_penalty(&self) -> Option<Tensor<B, 1>> {
        l2_of(self.linear.weight.val(), self.weight_decay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_elu_matches_definition() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([-1.0, 0.0, 2.0], &device);
        let y = elu(x).into_data().to_vec::<f32>().unwrap();
        assert_relative_eq!(y[0], (-1.0f32).exp() - 1.0, epsilon = 1e-6);
        assert_relative_eq!(y[1], 0.0, epsilon = 1e-6);
        assert_relative_eq!(y[2], 2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_encoder_block_halves_extent() {
        let device = Default::default();
        let block = EncoderBlock::<TestBackend>::new(3, 8, 5, 2, Activation::Relu, 1e-4, &device);
        let out = block.forward(Tensor::zeros([2, 3, 8, 12], &device));
        assert_eq!(out.dims(), [2, 8, 4, 6]);
    }

    #[test]
    fn test_decoder_block_multiplies_extent() {
        let device = Default::default();
        let block = DecoderBlock::<TestBackend>::new(8, 4, 3, 5, Activation::Tanh, 1e-4, &device);
        let out = block.forward(Tensor::zeros([1, 8, 2, 3], &device));
        assert_eq!(out.dims(), [1, 4, 10, 15]);
    }

    #[test]
    fn test_decoder_weights_within_glorot_bound() {
        let device = Default::default();
        let block = DecoderBlock::<TestBackend>::new(6, 3, 5, 2, Activation::Elu, 0.0, &device);
        let bound = (6.0f32 / (25.0 * 6.0 + 25.0 * 3.0)).sqrt();
        let weights = block.conv.weight.val().into_data().to_vec::<f32>().unwrap();
        assert_eq!(weights.len(), 6 * 3 * 25);
        assert!(weights.iter().all(|w| w.abs() <= bound));
        assert!(weights.iter().any(|w| *w != 0.0));
    }

    #[test]
    fn test_l2_penalty_disabled_at_zero() {
        let device = Default::default();
        let dense = DenseBlock::<TestBackend>::new(4, 2, Activation::Linear, 0.0, &device);
        assert!(dense.l2_penalty().is_none());

        let dense = DenseBlock::<TestBackend>::new(4, 2, Activation::Linear, 0.5, &device);
        let expected: f32 = dense
            .linear
            .weight
            .val()
            .into_data()
            .to_vec::<f32>()
            .unwrap()
            .iter()
            .map(|w| 0.5 * w * w)
            .sum();
        let penalty = dense.l2_penalty().unwrap().into_scalar();
        assert_relative_eq!(penalty, expected, epsilon = 1e-5);
    }
}
