use burn::tensor::{backend::Backend, Tensor};

const EPSILON: f64 = 1e-7;

/// Squared reconstruction error normalized by the squared magnitude of the target.
///
/// `sum((target - pred)^2) / (sum(target^2) + eps)`, a scalar per batch.
pub fn loss_norm_error<B: Backend, const D: usize>(pred: Tensor<B, D>, target: Tensor<B, D>) -> Tensor<B, 1> {
    let error = target.clone().sub(pred).powf_scalar(2.0).sum();
    let reference = target.powf_scalar(2.0).sum().add_scalar(EPSILON);
    error.div(reference)
}

pub fn mse<B: Backend, const D: usize>(pred: Tensor<B, D>, target: Tensor<B, D>) -> Tensor<B, 1> {
    pred.sub(target).powf_scalar(2.0).mean()
}

/// Host-side `loss_norm_error` over flat slices.
pub fn norm_error(pred: &[f32], target: &[f32]) -> f64 {
    let (error, reference) = pred
        .iter()
        .zip(target)
        .fold((0.0f64, 0.0f64), |(e, r), (p, t)| {
            let (p, t) = (*p as f64, *t as f64);
            (e + (t - p).powi(2), r + t * t)
        });
    error / (reference + EPSILON)
}
