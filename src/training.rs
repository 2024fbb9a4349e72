use std::{path::Path, sync::Arc, time::Instant};

use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    module::{AutodiffModule, Module},
    optim::{GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion,
    },
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    autoencoder::{ConvAutoencoder, ConvAutoencoderConfig},
    config::{OptimizerKind, RunConfig},
    data::{AutoencoderBatch, DataSplits, RecordBatcher, RecordDataset, RecordItem, RecordSource},
    error::{AeError, Result},
    hparams::HyperParams,
    loss::{loss_norm_error, mse},
    optim,
};

/// Metrics of one epoch; `loss` includes the L2 penalty, `loss_norm_error` does not.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochLogs {
    pub loss: f64,
    pub mse: f64,
    pub loss_norm_error: f64,
    pub val_loss: f64,
    pub val_mse: f64,
    pub val_loss_norm_error: f64,
}

impl EpochLogs {
    pub fn get(&self, metric: &str) -> Option<f64> {
        match metric {
            "loss" => Some(self.loss),
            "mse" => Some(self.mse),
            "loss_norm_error" => Some(self.loss_norm_error),
            "val_loss" => Some(self.val_loss),
            "val_mse" => Some(self.val_mse),
            "val_loss_norm_error" => Some(self.val_loss_norm_error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct History {
    pub epochs: Vec<EpochLogs>,
}

impl History {
    pub fn last(&self) -> Option<&EpochLogs> {
        self.epochs.last()
    }

    /// One value per epoch for `metric`, empty for unknown names.
    pub fn metric(&self, metric: &str) -> Vec<f64> {
        self.epochs.iter().filter_map(|e| e.get(metric)).collect()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
}

/// Hook invoked after every epoch's validation pass.
pub trait EpochCallback {
    fn on_epoch_end(&mut self, epoch: usize, logs: &EpochLogs) -> CallbackAction;
}

/// Sample-weighted running means of the per-batch metrics.
#[derive(Default)]
struct MetricSums {
    samples: usize,
    loss: f64,
    mse: f64,
    norm: f64,
}

impl MetricSums {
    fn add(&mut self, samples: usize, loss: f64, mse: f64, norm: f64) {
        let w = samples as f64;
        self.samples += samples;
        self.loss += loss * w;
        self.mse += mse * w;
        self.norm += norm * w;
    }

    fn means(&self) -> (f64, f64, f64) {
        let n = self.samples.max(1) as f64;
        (self.loss / n, self.mse / n, self.norm / n)
    }
}

/// Builds and fits an autoencoder on `splits.train`, validating on
/// `splits.valid` after every epoch.
///
/// Returns [`AeError::Pruned`] when a callback stops the run.
pub fn train_autoencoder<B: AutodiffBackend>(
    splits: &DataSplits,
    hparams: &HyperParams,
    run: &RunConfig,
    callbacks: &mut [&mut dyn EpochCallback],
    device: &B::Device,
) -> Result<(ConvAutoencoder<B>, History)> {
    run.validate()?;
    if splits.train.is_empty() || splits.valid.is_empty() {
        return Err(AeError::InvalidSplit(format!(
            "train ({}) and validation ({}) partitions must not be empty",
            splits.train.len(),
            splits.valid.len()
        )));
    }

    let config = ConvAutoencoderConfig::new(splits.record_shape()?, hparams.clone());
    let model = config.init::<B>(device)?;
    info!(
        "🛠️  Autoencoder built: {} layers, latent {}, {} parameters",
        hparams.n_layers(),
        hparams.latent_size,
        model.num_params()
    );

    match run.optimizer {
        OptimizerKind::Adam => fit(model, optim::adam::<B, ConvAutoencoder<B>>(), &config, splits, run, callbacks, device),
        OptimizerKind::Nadam => fit(model, optim::nadam::<B, ConvAutoencoder<B>>(), &config, splits, run, callbacks, device),
        OptimizerKind::Adamax => fit(model, optim::adamax::<B, ConvAutoencoder<B>>(), &config, splits, run, callbacks, device),
    }
}

fn fit<B, O>(
    mut model: ConvAutoencoder<B>,
    mut optim: O,
    config: &ConvAutoencoderConfig,
    splits: &DataSplits,
    run: &RunConfig,
    callbacks: &mut [&mut dyn EpochCallback],
    device: &B::Device,
) -> Result<(ConvAutoencoder<B>, History)>
where
    B: AutodiffBackend,
    O: Optimizer<ConvAutoencoder<B>, B>,
{
    let hp = &config.hparams;
    let batcher = RecordBatcher::new(config.record_shape);

    let mut train_builder = DataLoaderBuilder::<B, RecordItem, AutoencoderBatch<B>>::new(batcher.clone())
        .batch_size(hp.batch_size)
        .shuffle(run.seed)
        .set_device(device.clone());
    let mut valid_builder =
        DataLoaderBuilder::<B::InnerBackend, RecordItem, AutoencoderBatch<B::InnerBackend>>::new(batcher)
            .batch_size(hp.batch_size)
            .set_device(device.clone());
    // Zero workers keeps batching on the training thread.
    if run.num_workers > 0 {
        train_builder = train_builder.num_workers(run.num_workers);
        valid_builder = valid_builder.num_workers(run.num_workers);
    }
    let train_loader: Arc<dyn DataLoader<B, AutoencoderBatch<B>>> =
        train_builder.build(RecordDataset::new(splits.train.clone()));
    let valid_loader: Arc<dyn DataLoader<B::InnerBackend, AutoencoderBatch<B::InnerBackend>>> =
        valid_builder.build(RecordDataset::new(splits.valid.clone()));

    let lr = hp.effective_learning_rate();
    let mut history = History::default();
    info!(
        "🎯 Training for {} epochs (optimizer {}, lr {:.3e}, batch {})",
        run.num_epochs, run.optimizer, lr, hp.batch_size
    );
    let start = Instant::now();

    for epoch in 0..run.num_epochs {
        let mut train = MetricSums::default();
        for batch in train_loader.iter() {
            let x = batch.records;
            let samples = x.dims()[0];

            let pred = model.forward(x.clone());
            let batch_mse = mse(pred.clone().detach(), x.clone().detach());
            let norm = loss_norm_error(pred, x);
            let loss = match model.l2_penalty() {
                Some(penalty) => norm.clone() + penalty,
                None => norm.clone(),
            };

            train.add(
                samples,
                loss.clone().into_scalar().elem::<f64>(),
                batch_mse.into_scalar().elem::<f64>(),
                norm.into_scalar().elem::<f64>(),
            );

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(lr, model, grads);
        }

        let (val_loss, val_mse, val_norm) = evaluate(&model.valid(), valid_loader.clone());
        let (loss, train_mse, norm) = train.means();
        let logs = EpochLogs {
            loss,
            mse: train_mse,
            loss_norm_error: norm,
            val_loss,
            val_mse,
            val_loss_norm_error: val_norm,
        };
        info!(
            "Epoch [{}/{}] loss {:.5} - loss_norm_error {:.5} - val_loss {:.5} - val_loss_norm_error {:.5}",
            epoch + 1,
            run.num_epochs,
            logs.loss,
            logs.loss_norm_error,
            logs.val_loss,
            logs.val_loss_norm_error
        );
        history.epochs.push(logs.clone());

        for callback in callbacks.iter_mut() {
            if callback.on_epoch_end(epoch, &logs) == CallbackAction::Stop {
                return Err(AeError::Pruned { epoch });
            }
        }
    }

    info!("⏱️  Training finished in {:?}", start.elapsed());
    Ok((model, history))
}

/// Mean `(loss, mse, loss_norm_error)` over a loader.
pub fn evaluate<B: Backend>(
    model: &ConvAutoencoder<B>,
    loader: Arc<dyn DataLoader<B, AutoencoderBatch<B>>>,
) -> (f64, f64, f64) {
    let penalty = model
        .l2_penalty()
        .map(|p| p.into_scalar().elem::<f64>())
        .unwrap_or(0.0);
    let mut sums = MetricSums::default();
    for batch in loader.iter() {
        let x = batch.records;
        let samples = x.dims()[0];
        let pred = model.forward(x.clone());
        let norm = loss_norm_error(pred.clone(), x.clone()).into_scalar().elem::<f64>();
        let batch_mse = mse(pred, x).into_scalar().elem::<f64>();
        sums.add(samples, norm + penalty, batch_mse, norm);
    }
    debug!(samples = sums.samples, "validation pass done");
    sums.means()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::SearchLimits,
        data::RecordArray,
        hparams::{Activation, FixedParams, LayerParams},
    };
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray>;

    /// Smooth records so the autoencoder has something learnable.
    fn wave_records(n: usize, [h, w, c]: [usize; 3]) -> RecordArray {
        let mut data = Vec::with_capacity(n * h * w * c);
        for i in 0..n {
            for y in 0..h {
                for x in 0..w {
                    for ch in 0..c {
                        let phase = i as f32 * 0.3 + ch as f32;
                        data.push(((x + y) as f32 * 0.5 + phase).sin() + 1.5);
                    }
                }
            }
        }
        RecordArray::new(vec![n, h, w, c], data).unwrap()
    }

    fn small_hparams() -> HyperParams {
        HyperParams {
            layers: vec![LayerParams {
                filters: 4,
                kernel_size: 3,
                activation: Activation::Elu,
                l2: 1e-5,
            }],
            latent_size: 8,
            latent_activation: Activation::Linear,
            latent_l2: 0.0,
            learning_rate: 1e-2,
            batch_size: 4,
        }
    }

    fn run_config(num_epochs: usize) -> RunConfig {
        RunConfig {
            num_epochs,
            ..RunConfig::default()
        }
    }

    struct StopAfter(usize);

    impl EpochCallback for StopAfter {
        fn on_epoch_end(&mut self, epoch: usize, _logs: &EpochLogs) -> CallbackAction {
            if epoch + 1 >= self.0 {
                CallbackAction::Stop
            } else {
                CallbackAction::Continue
            }
        }
    }

    #[test]
    fn test_training_records_history() {
        let splits = DataSplits::load(&wave_records(20, [4, 4, 2]), 0.6, 0.2).unwrap();
        let (_, history) = train_autoencoder::<TestBackend>(
            &splits,
            &small_hparams(),
            &run_config(3),
            &mut [],
            &Default::default(),
        )
        .unwrap();

        assert_eq!(history.epochs.len(), 3);
        let val = history.metric("val_loss_norm_error");
        assert_eq!(val.len(), 3);
        assert!(val.iter().all(|v| v.is_finite() && *v >= 0.0));
        let last = history.last().unwrap();
        assert!(last.loss >= last.loss_norm_error);
        assert!(history.metric("unknown").is_empty());
    }

    #[test]
    fn test_training_reduces_loss() {
        let splits = DataSplits::load(&wave_records(24, [4, 4, 1]), 0.7, 0.15).unwrap();
        let (_, history) = train_autoencoder::<TestBackend>(
            &splits,
            &small_hparams(),
            &run_config(12),
            &mut [],
            &Default::default(),
        )
        .unwrap();
        let losses = history.metric("loss_norm_error");
        assert!(losses.last().unwrap() < losses.first().unwrap(), "{losses:?}");
    }

    #[test]
    fn test_callback_stop_prunes_run() {
        let splits = DataSplits::load(&wave_records(20, [4, 4, 1]), 0.6, 0.2).unwrap();
        let mut stop = StopAfter(2);
        let err = train_autoencoder::<TestBackend>(
            &splits,
            &small_hparams(),
            &run_config(5),
            &mut [&mut stop],
            &Default::default(),
        )
        .unwrap_err();
        assert!(matches!(err, AeError::Pruned { epoch: 1 }));
    }

    #[test]
    fn test_every_optimizer_trains() {
        let splits = DataSplits::load(&wave_records(12, [4, 4, 1]), 0.5, 0.25).unwrap();
        for optimizer in [OptimizerKind::Adam, OptimizerKind::Nadam, OptimizerKind::Adamax] {
            let run = RunConfig {
                optimizer,
                ..run_config(1)
            };
            let (_, history) = train_autoencoder::<TestBackend>(
                &splits,
                &small_hparams(),
                &run,
                &mut [],
                &Default::default(),
            )
            .unwrap();
            assert!(history.last().unwrap().val_loss.is_finite(), "{optimizer}");
        }
    }

    #[test]
    fn test_replay_configuration_trains_one_epoch() {
        let splits = DataSplits::load(&wave_records(10, [8, 8, 3]), 0.6, 0.2).unwrap();
        let hparams =
            HyperParams::suggest(&mut FixedParams::best_known(), &SearchLimits::default()).unwrap();
        let (_, history) = train_autoencoder::<TestBackend>(
            &splits,
            &hparams,
            &run_config(1),
            &mut [],
            &Default::default(),
        )
        .unwrap();
        assert!(history.last().unwrap().val_loss_norm_error.is_finite());
    }

    #[test]
    fn test_training_with_worker_threads() {
        let splits = DataSplits::load(&wave_records(16, [4, 4, 1]), 0.5, 0.25).unwrap();
        let run = RunConfig {
            num_workers: 2,
            ..run_config(2)
        };
        let (_, history) =
            train_autoencoder::<TestBackend>(&splits, &small_hparams(), &run, &mut [], &Default::default())
                .unwrap();
        assert_eq!(history.epochs.len(), 2);
        assert!(history.last().unwrap().val_loss.is_finite());
    }

    #[test]
    fn test_default_run_config_trains() {
        let run = RunConfig::default();
        assert_eq!(run.num_workers, 0);
        let splits = DataSplits::load(&wave_records(10, [4, 4, 1]), 0.6, 0.2).unwrap();
        let (_, history) = train_autoencoder::<TestBackend>(
            &splits,
            &small_hparams(),
            &RunConfig { num_epochs: 1, ..run },
            &mut [],
            &Default::default(),
        )
        .unwrap();
        assert_eq!(history.epochs.len(), 1);
    }

    #[test]
    fn test_shape_error_surfaces_before_training() {
        let splits = DataSplits::load(&wave_records(10, [6, 6, 1]), 0.6, 0.2).unwrap();
        let mut hp = small_hparams();
        hp.layers.push(hp.layers[0].clone());
        let err = train_autoencoder::<TestBackend>(&splits, &hp, &run_config(1), &mut [], &Default::default())
            .unwrap_err();
        assert!(matches!(err, AeError::ShapeMismatch(_)));
    }
}
