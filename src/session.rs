use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use burn::tensor::backend::AutodiffBackend;
use tracing::{info, warn};

use crate::{
    artifact::{artifact_name, artifact_stem, load_artifact, save_artifact, ArtifactSpec},
    autoencoder::{ConvAutoencoder, ConvAutoencoderConfig},
    config::RunConfig,
    data::{DataSplits, RecordSource, SafeTensorsFile, SliceDescriptor},
    hparams::{FixedParams, HyperParams, Recording},
    report::{plot_history, plot_reconstruction, reconstruct, ReconstructionReport},
    search::{HyperparameterSearch, PruningCallback, StudySummary},
    training::{train_autoencoder, History},
};

/// Drives the search, replay and reconstruction workflows for one run config.
pub struct AutoencoderSession<B: AutodiffBackend> {
    config: RunConfig,
    device: B::Device,
}

impl<B: AutodiffBackend> AutoencoderSession<B> {
    pub fn new(config: RunConfig, device: B::Device) -> Self {
        Self { config, device }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    fn output_dir(&self) -> PathBuf {
        PathBuf::from(&self.config.output_dir)
    }

    pub fn open_dataset(&self) -> Result<SafeTensorsFile> {
        info!(
            "📁 Opening dataset '{}' from '{}'",
            self.config.dataset_name, self.config.data_path
        );
        let source = SafeTensorsFile::open(&self.config.data_path, &self.config.dataset_name)
            .with_context(|| format!("failed to open {}", self.config.data_path))?;
        info!("   - Shape: {:?}", source.shape());
        Ok(source)
    }

    fn load_splits<S: RecordSource + ?Sized>(&self, source: &S) -> Result<DataSplits> {
        let splits = DataSplits::load(source, self.config.train_fraction, self.config.valid_fraction)?;
        info!(
            "   - Split: {} train, {} validation, {} test",
            splits.partition.train.len(),
            splits.partition.valid.len(),
            splits.partition.test.len()
        );
        Ok(splits)
    }

    fn log_config(&self) {
        info!("🚀 Starting run '{}'", self.config.run_version);
        info!("📊 Configuration:");
        info!("   - Backend: {}", std::any::type_name::<B>());
        info!("   - Device: {:?}", self.device);
        info!("   - Epochs: {}", self.config.num_epochs);
        info!("   - Optimizer: {}", self.config.optimizer);
    }

    /// Samples `num_trials` configurations, trains each one and saves every
    /// model that was not pruned. Writes `study.json` into the output directory.
    pub fn search<S: RecordSource + ?Sized>(&self, source: &S, num_trials: usize) -> Result<StudySummary> {
        self.log_config();
        self.config.validate()?;
        let splits = self.load_splits(source)?;
        let run = &self.config;
        let out_dir = self.output_dir();

        let study = HyperparameterSearch::new(run.seed, &run.pruner)?;
        study.optimize(num_trials, |trial| -> crate::error::Result<f64> {
            let hparams = HyperParams::suggest(&mut *trial, &run.limits)?;
            let params = trial.params().clone();
            let number = trial.number();
            info!("🔬 Trial {number}: {params:?}");

            let mut pruning = PruningCallback::new(&mut *trial, &run.monitor);
            let (model, history) =
                train_autoencoder::<B>(&splits, &hparams, run, &mut [&mut pruning], &self.device)?;

            let spec = ArtifactSpec {
                model: ConvAutoencoderConfig::new(splits.record_shape()?, hparams),
                params,
                optimizer: run.optimizer,
                epochs_trained: history.epochs.len(),
            };
            save_artifact(&model, &spec, &out_dir, &artifact_stem(&run.run_version, &number.to_string()))?;

            Ok(history
                .last()
                .and_then(|logs| logs.get(&run.monitor))
                .unwrap_or(f64::NAN))
        })?;

        let summary = study.summary();
        std::fs::create_dir_all(&out_dir)?;
        summary.save(out_dir.join("study.json"))?;
        match &summary.best {
            Some(best) => info!(
                "🏆 Best trial {} with {} = {:?}",
                best.number, run.monitor, best.value
            ),
            None => warn!("no trial completed"),
        }
        info!(
            "✅ Study finished: {} complete, {} pruned, {} failed",
            summary.n_complete, summary.n_pruned, summary.n_failed
        );
        Ok(summary)
    }

    /// Trains once with the replay parameters (the best known configuration
    /// unless the config names others), saves the model and plots sample records.
    pub fn replay<S: RecordSource + ?Sized>(&self, source: &S) -> Result<History> {
        self.log_config();
        self.config.validate()?;
        let splits = self.load_splits(source)?;
        let run = &self.config;
        let out_dir = self.output_dir();

        let mut fixed = match &run.replay_params {
            Some(params) => FixedParams::new(params.clone()),
            None => FixedParams::best_known(),
        };
        let mut recording = Recording::new(&mut fixed);
        let hparams = HyperParams::suggest(&mut recording, &run.limits)
            .context("replay parameters do not fit the search limits")?;
        let params = recording.params;

        let (model, history) = train_autoencoder::<B>(&splits, &hparams, run, &mut [], &self.device)?;

        std::fs::create_dir_all(&out_dir)?;
        history.save(out_dir.join("history.json"))?;
        plot_history(&history, &out_dir)?;

        let record_shape = splits.record_shape()?;
        let spec = ArtifactSpec {
            model: ConvAutoencoderConfig::new(record_shape, hparams.clone()),
            params,
            optimizer: run.optimizer,
            epochs_trained: history.epochs.len(),
        };
        let stem = artifact_stem(&run.run_version, "replay");
        save_artifact(&model, &spec, &out_dir, &stem)?;

        for &index in &run.sample_records {
            if index >= source.len() {
                warn!(index, records = source.len(), "sample record out of range, skipped");
                continue;
            }
            self.plot_record(&model, source, index, run.plot_channel, hparams.latent_size, "replay")?;
        }
        Ok(history)
    }

    /// Reloads a saved model and plots its reconstruction of one dataset record.
    pub fn reconstruct<S: RecordSource + ?Sized>(
        &self,
        artifact: &Path,
        source: &S,
        index: usize,
        channel: usize,
    ) -> Result<ReconstructionReport> {
        let (model, spec) = load_artifact::<B>(artifact, &self.device)
            .with_context(|| format!("failed to load artifact {}", artifact.display()))?;
        let tag = artifact_name(artifact)
            .ok_or_else(|| anyhow!("artifact path {} has no file name", artifact.display()))?;
        self.plot_record(&model, source, index, channel, spec.model.hparams.latent_size, tag)
    }

    fn plot_record<S: RecordSource + ?Sized>(
        &self,
        model: &ConvAutoencoder<B>,
        source: &S,
        index: usize,
        channel: usize,
        latent_size: usize,
        tag: &str,
    ) -> Result<ReconstructionReport> {
        let record = SliceDescriptor {
            rows: index..index + 1,
            trailing: source.shape().get(1..).unwrap_or_default().to_vec(),
        }
        .apply(source)?;
        let record_shape = record.record_shape()?;
        let original = record.into_data();
        let reconstruction = reconstruct(model, &original, record_shape, &self.device)?;

        let report = ReconstructionReport::compare(&original, &reconstruction, record_shape[2]);
        info!(
            index,
            norm_error = report.norm_error,
            "max relative error per channel: {:?}",
            report.max_relative_error
        );
        plot_reconstruction(
            &original,
            &reconstruction,
            record_shape,
            channel,
            latent_size,
            index,
            tag,
            &self.output_dir(),
        )?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::OptimizerKind,
        data::RecordArray,
        hparams::{ParamSet, ParameterValue},
        search::TrialOutcome,
    };
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray>;

    fn records(n: usize, [h, w, c]: [usize; 3]) -> RecordArray {
        let data = (0..n * h * w * c)
            .map(|i| ((i % 17) as f32 * 0.2).cos() + 1.0)
            .collect();
        RecordArray::new(vec![n, h, w, c], data).unwrap()
    }

    fn small_replay_params() -> ParamSet {
        let mut p = ParamSet::new();
        p.insert("n_layers".into(), 1i64.into());
        p.insert("n0_flts".into(), 4i64.into());
        p.insert("e0_kernel_size".into(), 3i64.into());
        p.insert("e0_l2".into(), 1e-5f64.into());
        p.insert("e0_activation".into(), "elu".into());
        p.insert("lt_sz".into(), 6i64.into());
        p.insert("lt_l2".into(), 1e-4f64.into());
        p.insert("lt_activation".into(), "linear".into());
        p.insert("lr".into(), 1e-3f64.into());
        p.insert("batch_sz".into(), ParameterValue::Float(4.0));
        p
    }

    fn config(dir: &Path) -> RunConfig {
        RunConfig {
            num_epochs: 2,
            optimizer: OptimizerKind::Adam,
            output_dir: dir.to_string_lossy().into_owned(),
            replay_params: Some(small_replay_params()),
            sample_records: vec![1, 500],
            plot_channel: 1,
            ..RunConfig::default()
        }
    }

    #[test]
    fn test_replay_writes_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let source = records(20, [4, 4, 2]);
        let session = AutoencoderSession::<TestBackend>::new(config(dir.path()), Default::default());

        let history = session.replay(&source).unwrap();
        assert_eq!(history.epochs.len(), 2);
        assert!(dir.path().join("history.json").exists());
        assert!(dir.path().join("history.png").exists());
        assert!(dir.path().join("model_ae-smp_1-replay.mpk").exists());
        assert!(dir.path().join("model_ae-smp_1-replay.json").exists());
        assert!(dir.path().join("rec_replay_lt6_1_var1.png").exists());

        let report = session
            .reconstruct(&dir.path().join("model_ae-smp_1-replay"), &source, 3, 0)
            .unwrap();
        assert_eq!(report.channel_mse.len(), 2);
        assert!(dir.path().join("rec_model_ae-smp_1-replay_lt6_3_var0.png").exists());
    }

    #[test]
    fn test_search_records_every_trial() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = config(dir.path());
        run.num_epochs = 1;
        // keep sampled topologies small enough for a unit test
        run.limits.layers = [1, 1];
        run.limits.filters = vec![[2, 4]];
        run.limits.latent_size = [2, 4];
        let source = records(16, [4, 4, 1]);
        let session = AutoencoderSession::<TestBackend>::new(run, Default::default());

        let summary = session.search(&source, 3).unwrap();
        assert_eq!(summary.trials.len(), 3);
        assert_eq!(summary.n_complete + summary.n_pruned + summary.n_failed, 3);
        assert!(dir.path().join("study.json").exists());
        for trial in summary.trials.iter().filter(|t| t.outcome == TrialOutcome::Complete) {
            let stem = format!("model_ae-smp_1-{}.mpk", trial.number);
            assert!(dir.path().join(stem).exists());
        }
    }
}
