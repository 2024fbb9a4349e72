use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;
use image::{Rgb, RgbImage};
use plotters::prelude::{BitMapBackend, ChartBuilder, Color, IntoDrawingArea, LineSeries, BLUE, RED, WHITE};
use serde::Serialize;
use tracing::info;

use crate::{
    autoencoder::ConvAutoencoder,
    data::records_to_tensor,
    error::{AeError, Result},
    loss::norm_error,
    training::History,
};

/// Runs one NHWC record through the model and returns the NHWC reconstruction.
pub fn reconstruct<B: Backend>(
    model: &ConvAutoencoder<B>,
    record: &[f32],
    record_shape: [usize; 3],
    device: &B::Device,
) -> Result<Vec<f32>> {
    let expected: usize = record_shape.iter().product();
    if record.len() != expected {
        return Err(AeError::ShapeMismatch(format!(
            "record has {} values, shape {:?} needs {expected}",
            record.len(),
            record_shape
        )));
    }
    let input = records_to_tensor::<B>(record.to_vec(), 1, record_shape, device);
    model
        .forward(input)
        .permute([0, 2, 3, 1])
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| AeError::Tensor(format!("{e:?}")))
}

/// Error statistics of one reconstruction.
#[derive(Debug, Clone, Serialize)]
pub struct ReconstructionReport {
    pub norm_error: f64,
    pub channel_mse: Vec<f64>,
    /// `max |org - rec| / max |org|` per channel.
    pub max_relative_error: Vec<f64>,
}

impl ReconstructionReport {
    pub fn compare(original: &[f32], reconstruction: &[f32], channels: usize) -> Self {
        let mut sq = vec![0.0f64; channels];
        let mut max_err = vec![0.0f64; channels];
        let mut max_abs = vec![0.0f64; channels];
        for (i, (o, r)) in original.iter().zip(reconstruction).enumerate() {
            let c = i % channels;
            let (o, r) = (*o as f64, *r as f64);
            sq[c] += (o - r).powi(2);
            max_err[c] = max_err[c].max((o - r).abs());
            max_abs[c] = max_abs[c].max(o.abs());
        }
        let pixels = (original.len() / channels.max(1)).max(1) as f64;

        Self {
            norm_error: norm_error(reconstruction, original),
            channel_mse: sq.iter().map(|s| s / pixels).collect(),
            max_relative_error: max_err
                .iter()
                .zip(&max_abs)
                .map(|(e, m)| if *m > 0.0 { e / m } else { *e })
                .collect(),
        }
    }
}

/// One channel of an NHWC record, row-major `[h][w]`.
fn channel_plane(values: &[f32], [height, width, channels]: [usize; 3], channel: usize) -> Vec<f32> {
    (0..height * width)
        .map(|p| values[p * channels + channel])
        .collect()
}

fn value_range(planes: &[&[f32]]) -> (f32, f32) {
    planes
        .iter()
        .flat_map(|p| p.iter().copied())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)))
}

/// Blue-to-red ramp over `[0, 1]`.
fn colormap(t: f32) -> Rgb<u8> {
    let t = if t.is_finite() { t.clamp(0.0, 1.0) } else { 0.0 };
    let r = (255.0 * t) as u8;
    let g = (255.0 * (1.0 - (2.0 * t - 1.0).abs())) as u8;
    let b = (255.0 * (1.0 - t)) as u8;
    Rgb([r, g, b])
}

const GAP: u32 = 4;

/// Writes `rec_{tag}_lt{latent}_{index}_var{channel}.png` into `dir` with
/// three panels: original, reconstruction and absolute error.
///
/// The first two panels share a color scale; the error panel has its own.
#[allow(clippy::too_many_arguments)]
pub fn plot_reconstruction(
    original: &[f32],
    reconstruction: &[f32],
    record_shape: [usize; 3],
    channel: usize,
    latent_size: usize,
    index: usize,
    tag: &str,
    dir: &Path,
) -> Result<PathBuf> {
    let [height, width, channels] = record_shape;
    if channel >= channels {
        return Err(AeError::invalid(
            "channel",
            format!("{channel} out of range for {channels} channels"),
        ));
    }
    let expected = height * width * channels;
    if original.len() != expected || reconstruction.len() != expected {
        return Err(AeError::ShapeMismatch(format!(
            "plot expects {expected} values per record, got {} and {}",
            original.len(),
            reconstruction.len()
        )));
    }

    let org = channel_plane(original, record_shape, channel);
    let rec = channel_plane(reconstruction, record_shape, channel);
    let err: Vec<f32> = org.iter().zip(&rec).map(|(o, r)| (o - r).abs()).collect();

    let (lo, hi) = value_range(&[&org, &rec]);
    let (_, err_hi) = value_range(&[&err]);
    let span = if hi > lo { hi - lo } else { 1.0 };
    let err_span = if err_hi > 0.0 { err_hi } else { 1.0 };

    // Small grids are upscaled so the panels stay readable.
    let scale = (256 / height.max(width).max(1)).max(1) as u32;
    let (panel_w, panel_h) = (width as u32 * scale, height as u32 * scale);
    let canvas_w = 3 * panel_w + 2 * GAP;

    let img = RgbImage::from_fn(canvas_w, panel_h, |x, y| {
        let panel = x / (panel_w + GAP);
        let px = x % (panel_w + GAP);
        if px >= panel_w {
            return Rgb([255, 255, 255]);
        }
        let idx = (y / scale) as usize * width + (px / scale) as usize;
        match panel {
            0 => colormap((org[idx] - lo) / span),
            1 => colormap((rec[idx] - lo) / span),
            _ => colormap(err[idx] / err_span),
        }
    });

    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("rec_{tag}_lt{latent_size}_{index}_var{channel}.png"));
    img.save(&path)?;
    info!("🖼️  Reconstruction plot written to {}", path.display());
    Ok(path)
}

fn plot_error(e: impl std::fmt::Display) -> AeError {
    AeError::Plot(e.to_string())
}

const HISTORY_SIZE: (u32, u32) = (640, 400);

/// Writes `history.png` into `dir`: per-epoch `loss` in blue and `val_loss` in
/// red on one linear scale. Non-finite values are left out of the curves.
pub fn plot_history(history: &History, dir: &Path) -> Result<PathBuf> {
    let loss = history.metric("loss");
    let val_loss = history.metric("val_loss");
    let (lo, hi) = loss
        .iter()
        .chain(&val_loss)
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    if lo > hi {
        return Err(AeError::invalid("history", "no finite loss values to plot"));
    }
    let pad = if hi > lo { (hi - lo) * 0.05 } else { lo.abs().max(1.0) * 0.05 };
    let last_epoch = (loss.len().max(2) - 1) as f64;

    std::fs::create_dir_all(dir)?;
    let path = dir.join("history.png");
    {
        let root = BitMapBackend::new(&path, HISTORY_SIZE).into_drawing_area();
        root.fill(&WHITE).map_err(plot_error)?;
        let mut chart = ChartBuilder::on(&root)
            .margin(20)
            .build_cartesian_2d(0f64..last_epoch, (lo - pad)..(hi + pad))
            .map_err(plot_error)?;
        for (values, color) in [(&loss, BLUE), (&val_loss, RED)] {
            let points = values
                .iter()
                .enumerate()
                .filter(|(_, v)| v.is_finite())
                .map(|(epoch, v)| (epoch as f64, *v));
            chart
                .draw_series(LineSeries::new(points, color.stroke_width(2)))
                .map_err(plot_error)?;
        }
        root.present().map_err(plot_error)?;
    }
    info!("📉 Loss curves written to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        autoencoder::ConvAutoencoderConfig,
        hparams::{Activation, HyperParams, LayerParams},
    };
    use approx::assert_relative_eq;
    use burn::backend::NdArray;

    #[test]
    fn test_report_statistics() {
        // two pixels, two channels
        let original = [1.0, 2.0, -1.0, 4.0];
        let reconstruction = [1.0, 1.0, -0.5, 4.0];
        let report = ReconstructionReport::compare(&original, &reconstruction, 2);

        assert_relative_eq!(report.channel_mse[0], 0.125);
        assert_relative_eq!(report.channel_mse[1], 0.5);
        assert_relative_eq!(report.max_relative_error[0], 0.5);
        assert_relative_eq!(report.max_relative_error[1], 0.25);
        assert!(report.norm_error > 0.0);
    }

    #[test]
    fn test_plot_writes_named_png() {
        let dir = tempfile::tempdir().unwrap();
        let shape = [4, 5, 2];
        let original: Vec<f32> = (0..40).map(|v| v as f32 * 0.1).collect();
        let reconstruction: Vec<f32> = original.iter().map(|v| v * 0.9).collect();

        let path =
            plot_reconstruction(&original, &reconstruction, shape, 1, 40, 99, "replay", dir.path()).unwrap();
        assert_eq!(path.file_name().unwrap(), "rec_replay_lt40_99_var1.png");

        let img = image::open(&path).unwrap().to_rgb8();
        let scale = 256 / 5;
        assert_eq!(img.dimensions(), (3 * 5 * scale + 2 * GAP, 4 * scale));
    }

    #[test]
    fn test_plot_rejects_bad_channel() {
        let dir = tempfile::tempdir().unwrap();
        let values = vec![0.0; 8];
        let err = plot_reconstruction(&values, &values, [2, 2, 2], 2, 5, 0, "t", dir.path()).unwrap_err();
        assert!(matches!(err, AeError::InvalidParameter { .. }));
    }

    #[test]
    fn test_history_plot_written() {
        use crate::training::EpochLogs;

        let dir = tempfile::tempdir().unwrap();
        let history = History {
            epochs: (0..5)
                .map(|e| EpochLogs {
                    loss: 1.0 / (e as f64 + 1.0),
                    val_loss: 1.2 / (e as f64 + 1.0),
                    ..EpochLogs::default()
                })
                .collect(),
        };
        let path = plot_history(&history, dir.path()).unwrap();
        assert_eq!(path.file_name().unwrap(), "history.png");
        let img = image::open(&path).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), HISTORY_SIZE);
        assert!(img.pixels().any(|p| p.0 != [255, 255, 255]));

        let err = plot_history(&History::default(), dir.path()).unwrap_err();
        assert!(matches!(err, AeError::InvalidParameter { .. }));
    }

    #[test]
    fn test_reconstruct_keeps_record_layout() {
        let device = Default::default();
        let hparams = HyperParams {
            layers: vec![LayerParams {
                filters: 2,
                kernel_size: 3,
                activation: Activation::Relu,
                l2: 0.0,
            }],
            latent_size: 3,
            latent_activation: Activation::Linear,
            latent_l2: 0.0,
            learning_rate: 1e-3,
            batch_size: 1,
        };
        let model = ConvAutoencoderConfig::new([4, 4, 3], hparams)
            .init::<NdArray>(&device)
            .unwrap();
        let record = vec![0.5f32; 48];
        let out = reconstruct(&model, &record, [4, 4, 3], &device).unwrap();
        assert_eq!(out.len(), 48);

        let err = reconstruct(&model, &record[..10], [4, 4, 3], &device).unwrap_err();
        assert!(matches!(err, AeError::ShapeMismatch(_)));
    }
}
