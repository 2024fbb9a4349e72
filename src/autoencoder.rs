use burn::{prelude::*, tensor::backend::Backend};
use serde::{Deserialize, Serialize};

use crate::{
    blocks::{DecoderBlock, DenseBlock, EncoderBlock},
    error::{AeError, Result},
    hparams::{Activation, HyperParams},
};

/// Stride of each encoder layer, by layer index.
pub const STRIDES: [usize; 4] = [2, 2, 5, 5];
const OUTPUT_KERNEL: usize = 5;

/// Everything needed to rebuild an autoencoder: the record shape and the
/// hyperparameters that fixed its topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvAutoencoderConfig {
    /// `[height, width, channels]` of one record.
    pub record_shape: [usize; 3],
    pub hparams: HyperParams,
}

impl ConvAutoencoderConfig {
    pub fn new(record_shape: [usize; 3], hparams: HyperParams) -> Self {
        Self {
            record_shape,
            hparams,
        }
    }

    /// `[channels, height, width]` of the last encoder layer's output.
    ///
    /// Fails when a stride does not divide the extent it is applied to, since
    /// the mirrored decoder could not restore the input shape.
    pub fn encoded_shape(&self) -> Result<[usize; 3]> {
        let [mut height, mut width, channels] = self.record_shape;
        if height == 0 || width == 0 || channels == 0 {
            return Err(AeError::ShapeMismatch(format!(
                "record shape {:?} has an empty dimension",
                self.record_shape
            )));
        }
        let layers = &self.hparams.layers;
        if layers.is_empty() || layers.len() > STRIDES.len() {
            return Err(AeError::invalid(
                "n_layers",
                format!("{} not in [1, {}]", layers.len(), STRIDES.len()),
            ));
        }

        let mut out_channels = channels;
        for (i, layer) in layers.iter().enumerate() {
            let stride = STRIDES[i];
            if layer.kernel_size % 2 == 0 {
                return Err(AeError::invalid(
                    format!("e{i}_kernel_size"),
                    format!("{} must be odd for same padding", layer.kernel_size),
                ));
            }
            if height % stride != 0 || width % stride != 0 {
                return Err(AeError::ShapeMismatch(format!(
                    "layer {i} stride {stride} does not divide extent {height}x{width}"
                )));
            }
            height /= stride;
            width /= stride;
            out_channels = layer.filters;
        }
        Ok([out_channels, height, width])
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<ConvAutoencoder<B>> {
        let [enc_channels, enc_height, enc_width] = self.encoded_shape()?;
        let hp = &self.hparams;
        let channels = self.record_shape[2];

        let mut encoder = Vec::with_capacity(hp.n_layers());
        let mut in_channels = channels;
        for (i, layer) in hp.layers.iter().enumerate() {
            encoder.push(EncoderBlock::new(
                in_channels,
                layer.filters,
                layer.kernel_size,
                STRIDES[i],
                layer.activation,
                layer.l2,
                device,
            ));
            in_channels = layer.filters;
        }

        let n_flat = enc_channels * enc_height * enc_width;
        let latent = DenseBlock::new(n_flat, hp.latent_size, hp.latent_activation, hp.latent_l2, device);
        let expand = DenseBlock::new(hp.latent_size, n_flat, hp.latent_activation, hp.latent_l2, device);

        let mut decoder = Vec::with_capacity(hp.n_layers());
        let mut in_channels = enc_channels;
        for j in (0..hp.n_layers()).rev() {
            let layer = &hp.layers[j];
            decoder.push(DecoderBlock::new(
                in_channels,
                layer.filters,
                layer.kernel_size,
                STRIDES[j],
                layer.activation,
                layer.l2,
                device,
            ));
            in_channels = layer.filters;
        }

        // Regularized like the last mirrored layer, which is layer 0.
        let output = DecoderBlock::new(
            in_channels,
            channels,
            OUTPUT_KERNEL,
            1,
            Activation::Linear,
            hp.layers[0].l2,
            device,
        );

        Ok(ConvAutoencoder {
            encoder,
            latent,
            expand,
            decoder,
            output,
            encoded_channels: enc_channels,
            encoded_height: enc_height,
            encoded_width: enc_width,
        })
    }
}

#[derive(Module, Debug)]
pub struct ConvAutoencoder<B: Backend> {
    encoder: Vec<EncoderBlock<B>>,
    latent: DenseBlock<B>,
    expand: DenseBlock<B>,
    decoder: Vec<DecoderBlock<B>>,
    output: DecoderBlock<B>,
    encoded_channels: usize,
    encoded_height: usize,
    encoded_width: usize,
}

impl<B: Backend> ConvAutoencoder<B> {
    /// `[batch, C, H, W]` -> `[batch, latent]`
    pub fn encode(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = x;
        for block in &self.encoder {
            x = block.forward(x);
        }
        let [batch_size, channels, height, width] = x.dims();
        self.latent.forward(x.reshape([batch_size, channels * height * width]))
    }

    /// `[batch, latent]` -> `[batch, C, H, W]`
    pub fn decode(&self, z: Tensor<B, 2>) -> Tensor<B, 4> {
        let batch_size = z.dims()[0];
        let mut x = self.expand.forward(z).reshape([
            batch_size,
            self.encoded_channels,
            self.encoded_height,
            self.encoded_width,
        ]);
        for block in &self.decoder {
            x = block.forward(x);
        }
        self.output.forward(x)
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.decode(self.encode(x))
    }

    /// Sum of every enabled kernel penalty.
    pub fn l2_penalty(&self) -> Option<Tensor<B, 1>> {
        self.encoder
            .iter()
            .map(EncoderBlock::l2_penalty)
            .chain([self.latent.l2_penalty(), self.expand.l2_penalty()])
            .chain(self.decoder.iter().map(DecoderBlock::l2_penalty))
            .chain([self.output.l2_penalty()])
            .flatten()
            .reduce(|acc, p| acc + p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::SearchLimits,
        hparams::{FixedParams, LayerParams},
    };
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn hparams(n_layers: usize) -> HyperParams {
        HyperParams {
            layers: (0..n_layers)
                .map(|i| LayerParams {
                    filters: 4 + i,
                    kernel_size: if i % 2 == 0 { 3 } else { 5 },
                    activation: [Activation::Relu, Activation::Elu, Activation::Tanh][i],
                    l2: 1e-5,
                })
                .collect(),
            latent_size: 6,
            latent_activation: Activation::Linear,
            latent_l2: 0.0,
            learning_rate: 1e-3,
            batch_size: 2,
        }
    }

    #[test]
    fn test_decoder_restores_input_shape() {
        let device = Default::default();
        for n_layers in 1..=3 {
            let config = ConvAutoencoderConfig::new([20, 20, 2], hparams(n_layers));
            let model = config.init::<TestBackend>(&device).unwrap();

            let x = Tensor::<TestBackend, 4>::random([2, 2, 20, 20], burn::tensor::Distribution::Default, &device);
            let z = model.encode(x.clone());
            assert_eq!(z.dims(), [2, 6]);
            assert_eq!(model.forward(x).dims(), [2, 2, 20, 20], "n_layers = {n_layers}");
        }
    }

    #[test]
    fn test_encoded_shape_follows_stride_schedule() {
        let config = ConvAutoencoderConfig::new([20, 40, 2], hparams(3));
        assert_eq!(config.encoded_shape().unwrap(), [6, 1, 2]);
    }

    #[test]
    fn test_replay_topology_builds() {
        let hp = HyperParams::suggest(&mut FixedParams::best_known(), &SearchLimits::default()).unwrap();
        let config = ConvAutoencoderConfig::new([8, 12, 3], hp);
        assert_eq!(config.encoded_shape().unwrap(), [75, 2, 3]);

        let device = Default::default();
        let model = config.init::<TestBackend>(&device).unwrap();
        let out = model.forward(Tensor::zeros([1, 3, 8, 12], &device));
        assert_eq!(out.dims(), [1, 3, 8, 12]);
    }

    #[test]
    fn test_indivisible_extent_is_rejected() {
        let config = ConvAutoencoderConfig::new([6, 6, 1], hparams(2));
        let err = config.encoded_shape().unwrap_err();
        assert!(matches!(err, AeError::ShapeMismatch(msg) if msg.contains("layer 1")));
    }

    #[test]
    fn test_even_kernel_is_rejected() {
        let mut hp = hparams(1);
        hp.layers[0].kernel_size = 4;
        let config = ConvAutoencoderConfig::new([8, 8, 1], hp);
        assert!(matches!(config.encoded_shape(), Err(AeError::InvalidParameter { .. })));
    }

    #[test]
    fn test_l2_penalty_skips_latent_when_truncated() {
        let device = Default::default();
        let model = ConvAutoencoderConfig::new([4, 4, 1], hparams(1))
            .init::<TestBackend>(&device)
            .unwrap();
        let penalty = model.l2_penalty().unwrap().into_scalar();
        assert!(penalty.is_finite() && penalty > 0.0);

        let mut hp = hparams(1);
        hp.layers[0].l2 = 0.0;
        let model = ConvAutoencoderConfig::new([4, 4, 1], hp)
            .init::<TestBackend>(&device)
            .unwrap();
        assert!(model.l2_penalty().is_none());
    }
}
